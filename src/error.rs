use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("malformed packet: {0}")]
    PacketMalformed(String),

    #[error("message contains more than one question")]
    TooManyQuestions,

    #[error("no available IP addresses in pool")]
    PoolExhausted,

    #[error("no lease found for client {0}")]
    LeaseNotFound(String),

    #[error("address {0} is already reserved for another client")]
    IpAlreadyReserved(Ipv4Addr),

    #[error("domain unavailable or blocked")]
    NxDomain,

    #[error("upstream reported a format error")]
    DnsFormatError,

    #[error("upstream reported a server failure")]
    DnsServerFailure,

    #[error("timed out waiting for an upstream response")]
    UpstreamTimeout,

    #[error("upstream is unreachable: {0}")]
    UpstreamUnreachable(#[source] std::io::Error),

    #[error("blocklist source is not in hosts-file format")]
    InvalidBlocklist,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("lease file is corrupt: {0}")]
    PersistenceCorrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;
