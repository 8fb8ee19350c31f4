//! Resolution pipeline: blocklist, cache, local domains, then a race
//! across every configured upstream.
//!
//! State is split across two locks so nothing is held during upstream
//! network I/O: a read-mostly lock over blocklist and local domains, and a
//! separate lock over the response cache.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dns::message::{
    CLASS_IN, COMPRESSED_QUESTION_PTR, DnsMessage, DnsQuestion, DnsRecord, DnsType, Rcode,
    wire_name,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// TTL stamped on synthesized blocklist and local-domain answers.
const SYNTHETIC_TTL_SECS: u32 = 300;

const UPSTREAM_PORT: u16 = 53;
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const UPSTREAM_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Wall time spent waiting on any one upstream result.
const UPSTREAM_RACE_TIMEOUT: Duration = Duration::from_secs(5);

const REVERSE_SUFFIX: &str = ".in-addr.arpa";

struct Tables {
    /// Sorted for binary search; duplicates are harmless.
    blocklist: Vec<String>,
    locals: HashMap<String, Ipv4Addr>,
}

struct CacheItem {
    /// Multiple answers survive together, CNAME chains among them.
    records: Vec<DnsRecord>,
    deadline: DateTime<Utc>,
}

pub struct Resolver {
    upstreams: Vec<Ipv4Addr>,
    tables: RwLock<Tables>,
    cache: Mutex<HashMap<String, CacheItem>>,
    metrics: Arc<Metrics>,
}

impl Resolver {
    pub fn new(
        upstreams: Vec<Ipv4Addr>,
        locals: HashMap<String, Ipv4Addr>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            upstreams,
            tables: RwLock::new(Tables {
                blocklist: Vec::new(),
                locals,
            }),
            cache: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Resolves a question to `(answers, authorities)`.
    pub async fn resolve(
        &self,
        domain: &str,
        qtype: DnsType,
    ) -> Result<(Vec<DnsRecord>, Vec<DnsRecord>)> {
        debug!("resolving {} {}", domain, qtype);

        {
            let tables = self.tables.read().await;
            if tables.blocklist.binary_search_by(|entry| entry.as_str().cmp(domain)).is_ok() {
                info!("rejected {} in blocklist", domain);
                self.metrics.dns_blocked.inc();

                let rdata = if qtype == DnsType::A {
                    vec![0u8; 4]
                } else if qtype == DnsType::AAAA {
                    vec![0u8; 16]
                } else {
                    return Ok((Vec::new(), Vec::new()));
                };
                return Ok((vec![synthetic_record(domain, qtype, rdata)], Vec::new()));
            }
        }

        let key = cache_key(domain, qtype);
        {
            let mut cache = self.cache.lock().await;
            if let Some(item) = cache.get(&key) {
                if item.deadline > Utc::now() {
                    self.metrics.dns_cache_hits.inc();
                    self.metrics
                        .dns_queries
                        .with_label_values(&["cache", "success"])
                        .inc();
                    return Ok((item.records.clone(), Vec::new()));
                }
                debug!("removing expired cache item for {}", domain);
                cache.remove(&key);
            }
        }

        {
            let tables = self.tables.read().await;
            if let Some(local_ip) = tables.locals.get(domain) {
                debug!("found {} in local domains", domain);
                if qtype != DnsType::A {
                    return Ok((Vec::new(), Vec::new()));
                }
                self.metrics
                    .dns_queries
                    .with_label_values(&["local-domain", "success"])
                    .inc();
                let record = synthetic_record(domain, qtype, local_ip.octets().to_vec());
                return Ok((vec![record], Vec::new()));
            }
        }

        if qtype == DnsType::PTR
            && let Some(ip) = reverse_octets(domain)
        {
            if ip.is_private() {
                let tables = self.tables.read().await;
                for (host, local_ip) in &tables.locals {
                    if *local_ip == ip {
                        debug!("reverse lookup {} found {} in local domains", ip, host);
                        let mut record = synthetic_record(domain, qtype, wire_name(host));
                        record.parsed_rdata = host.clone();
                        return Ok((vec![record], Vec::new()));
                    }
                }
                // A private address we don't know is a bad name, not a
                // question for the upstreams.
                return Err(Error::NxDomain);
            }
        }

        self.race_upstreams(domain, qtype, &key).await
    }

    async fn race_upstreams(
        &self,
        domain: &str,
        qtype: DnsType,
        cache_key: &str,
    ) -> Result<(Vec<DnsRecord>, Vec<DnsRecord>)> {
        let mut in_flight = JoinSet::new();
        for upstream in self.upstreams.iter().copied() {
            let domain = domain.to_string();
            in_flight.spawn(async move { (upstream, lookup(&domain, qtype, upstream).await) });
        }

        let mut last_error: Option<Error> = None;

        loop {
            let joined = match timeout(UPSTREAM_RACE_TIMEOUT, in_flight.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!("timeout waiting for an upstream response");
                    break;
                }
            };

            let (upstream, outcome) = match joined {
                Ok(result) => result,
                Err(join_error) => {
                    warn!("upstream lookup task failed: {}", join_error);
                    continue;
                }
            };

            match outcome {
                Ok((answers, authorities)) => {
                    if answers.is_empty() && authorities.is_empty() {
                        continue;
                    }
                    in_flight.abort_all();

                    let upstream_label = upstream.to_string();
                    self.metrics
                        .dns_queries
                        .with_label_values(&[upstream_label.as_str(), "success"])
                        .inc();

                    let ttl = answers
                        .first()
                        .or(authorities.first())
                        .map(|record| record.ttl)
                        .unwrap_or(0);
                    let mut cache = self.cache.lock().await;
                    cache.insert(
                        cache_key.to_string(),
                        CacheItem {
                            records: answers.clone(),
                            deadline: Utc::now() + TimeDelta::seconds(ttl as i64),
                        },
                    );
                    debug!("accepted response for {} from {}", domain, upstream);

                    return Ok((answers, authorities));
                }
                Err(Error::NxDomain) => {
                    last_error = Some(Error::NxDomain);
                }
                Err(lookup_error) => {
                    warn!("unable to look up {} at {}: {}", domain, upstream, lookup_error);
                    let upstream_label = upstream.to_string();
                    self.metrics
                        .dns_queries
                        .with_label_values(&[upstream_label.as_str(), "failed"])
                        .inc();
                    last_error = Some(lookup_error);
                }
            }
        }

        match last_error {
            Some(race_error) => Err(race_error),
            None => Err(Error::UpstreamTimeout),
        }
    }

    pub async fn add_local_domain(&self, domain: &str, ip: Ipv4Addr) -> Result<()> {
        if ip == Ipv4Addr::UNSPECIFIED {
            return Err(Error::InvalidConfig(format!(
                "local domain {} maps to the zero address",
                domain
            )));
        }
        let mut tables = self.tables.write().await;
        tables.locals.insert(domain.to_string(), ip);
        Ok(())
    }

    pub async fn delete_local_domain(&self, domain: &str) {
        let mut tables = self.tables.write().await;
        tables.locals.remove(domain);
    }

    pub async fn local_domains(&self) -> HashMap<String, Ipv4Addr> {
        self.tables.read().await.locals.clone()
    }

    pub async fn add_blocklist_entries(&self, entries: Vec<String>) {
        let mut tables = self.tables.write().await;
        tables.blocklist.extend(entries);
        tables.blocklist.sort_unstable();
    }

    pub async fn delete_blocklist_entry(&self, domain: &str) {
        let mut tables = self.tables.write().await;
        if let Ok(index) = tables
            .blocklist
            .binary_search_by(|entry| entry.as_str().cmp(domain))
        {
            tables.blocklist.remove(index);
        }
    }

    pub async fn flush_blocklist(&self) {
        let mut tables = self.tables.write().await;
        tables.blocklist.clear();
    }

    pub async fn blocklist(&self) -> Vec<String> {
        self.tables.read().await.blocklist.clone()
    }

    pub async fn blocklist_len(&self) -> usize {
        self.tables.read().await.blocklist.len()
    }

    /// Drops every cached response, used when configuration changes pull
    /// the rug out from under cached answers.
    pub async fn flush_cache(&self) {
        self.cache.lock().await.clear();
    }
}

/// One upstream exchange: fresh transaction id, RD set, single IN
/// question, 2 s to dial and 2 s to read.
async fn lookup(
    domain: &str,
    qtype: DnsType,
    upstream: Ipv4Addr,
) -> Result<(Vec<DnsRecord>, Vec<DnsRecord>)> {
    debug!("looking up {} at {}", domain, upstream);

    let mut message = DnsMessage::new();
    message.header.id = rand::random();
    message.header.set_rd(true);
    message.questions.push(DnsQuestion {
        name: wire_name(domain),
        parsed_name: domain.to_string(),
        qtype,
        class: CLASS_IN,
    });
    let query = message.encode();

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    timeout(
        UPSTREAM_DIAL_TIMEOUT,
        socket.connect((IpAddr::V4(upstream), UPSTREAM_PORT)),
    )
    .await
    .map_err(|_| Error::UpstreamTimeout)?
    .map_err(Error::UpstreamUnreachable)?;

    socket
        .send(&query)
        .await
        .map_err(Error::UpstreamUnreachable)?;

    let mut buffer = [0u8; 1500];
    let received = timeout(UPSTREAM_READ_TIMEOUT, socket.recv(&mut buffer))
        .await
        .map_err(|_| Error::UpstreamTimeout)?
        .map_err(Error::UpstreamUnreachable)?;

    let response = DnsMessage::parse(&buffer[..received])?;

    match Rcode::try_from(response.header.rcode()) {
        Ok(Rcode::Success) | Err(_) => {}
        Ok(Rcode::FormatError) => return Err(Error::DnsFormatError),
        Ok(Rcode::NameFailure) => return Err(Error::NxDomain),
        Ok(Rcode::ServerFailure) => return Err(Error::DnsServerFailure),
    }

    Ok((response.answers, response.authorities))
}

/// Hex of the domain bytes followed by the big-endian query type.
fn cache_key(domain: &str, qtype: DnsType) -> String {
    let mut key = String::with_capacity(domain.len() * 2 + 4);
    for byte in domain.bytes().chain(qtype.0.to_be_bytes()) {
        key.push_str(&format!("{:02x}", byte));
    }
    key
}

fn synthetic_record(domain: &str, qtype: DnsType, rdata: Vec<u8>) -> DnsRecord {
    DnsRecord {
        name: COMPRESSED_QUESTION_PTR.to_vec(),
        parsed_name: domain.to_string(),
        rtype: qtype,
        class: CLASS_IN,
        ttl: SYNTHETIC_TTL_SECS,
        rdata,
        parsed_rdata: String::new(),
    }
}

/// Turns `4.3.2.1.in-addr.arpa` back into `1.2.3.4`.
fn reverse_octets(domain: &str) -> Option<Ipv4Addr> {
    let stripped = domain
        .strip_suffix('.')
        .unwrap_or(domain)
        .strip_suffix(REVERSE_SUFFIX)?;

    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in stripped.split('.') {
        if count == 4 {
            return None;
        }
        octets[count] = part.parse().ok()?;
        count += 1;
    }
    if count != 4 {
        return None;
    }

    Some(Ipv4Addr::new(octets[3], octets[2], octets[1], octets[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(
        upstreams: Vec<Ipv4Addr>,
        locals: HashMap<String, Ipv4Addr>,
    ) -> Resolver {
        let metrics = Arc::new(Metrics::new().unwrap());
        Resolver::new(upstreams, locals, metrics)
    }

    fn resolver() -> Resolver {
        resolver_with(Vec::new(), HashMap::new())
    }

    async fn prime_cache(resolver: &Resolver, domain: &str, qtype: DnsType, record: DnsRecord) {
        resolver.cache.lock().await.insert(
            cache_key(domain, qtype),
            CacheItem {
                records: vec![record],
                deadline: Utc::now() + TimeDelta::seconds(300),
            },
        );
    }

    fn a_record(domain: &str, ip: [u8; 4]) -> DnsRecord {
        synthetic_record(domain, DnsType::A, ip.to_vec())
    }

    #[tokio::test]
    async fn test_blocked_domain_returns_zero_address() {
        let resolver = resolver();
        resolver
            .add_blocklist_entries(vec!["ads.example.com".to_string()])
            .await;

        let (answers, authorities) =
            resolver.resolve("ads.example.com", DnsType::A).await.unwrap();
        assert!(authorities.is_empty());
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].rdata, [0, 0, 0, 0]);
        assert_eq!(answers[0].ttl, 300);
        assert_eq!(answers[0].parsed_name, "ads.example.com");
        assert_eq!(answers[0].name, COMPRESSED_QUESTION_PTR);
    }

    #[tokio::test]
    async fn test_blocked_domain_aaaa_returns_zero_ipv6() {
        let resolver = resolver();
        resolver
            .add_blocklist_entries(vec!["ads.example.com".to_string()])
            .await;

        let (answers, _) = resolver
            .resolve("ads.example.com", DnsType::AAAA)
            .await
            .unwrap();
        assert_eq!(answers[0].rdata, [0u8; 16]);
    }

    #[tokio::test]
    async fn test_blocked_domain_other_types_have_no_answer() {
        let resolver = resolver();
        resolver
            .add_blocklist_entries(vec!["ads.example.com".to_string()])
            .await;

        let (answers, authorities) = resolver
            .resolve("ads.example.com", DnsType::MX)
            .await
            .unwrap();
        assert!(answers.is_empty());
        assert!(authorities.is_empty());
    }

    #[tokio::test]
    async fn test_blocklist_dominates_cache_and_locals() {
        let mut locals = HashMap::new();
        locals.insert("ads.example.com".to_string(), Ipv4Addr::new(10, 0, 0, 5));
        let resolver = resolver_with(Vec::new(), locals);

        prime_cache(
            &resolver,
            "ads.example.com",
            DnsType::A,
            a_record("ads.example.com", [1, 2, 3, 4]),
        )
        .await;
        resolver
            .add_blocklist_entries(vec!["ads.example.com".to_string()])
            .await;

        let (answers, _) = resolver.resolve("ads.example.com", DnsType::A).await.unwrap();
        assert_eq!(answers[0].rdata, [0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_cache_hit_without_upstreams() {
        // No upstreams configured: a successful resolve proves the cache
        // answered.
        let resolver = resolver();
        prime_cache(
            &resolver,
            "gitlab.com",
            DnsType::A,
            a_record("gitlab.com", [84, 82, 5, 244]),
        )
        .await;

        let (answers, authorities) = resolver.resolve("gitlab.com", DnsType::A).await.unwrap();
        assert!(authorities.is_empty());
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].rdata, [84, 82, 5, 244]);
    }

    #[tokio::test]
    async fn test_expired_cache_item_is_evicted() {
        let resolver = resolver();
        resolver.cache.lock().await.insert(
            cache_key("gitlab.com", DnsType::A),
            CacheItem {
                records: vec![a_record("gitlab.com", [84, 82, 5, 244])],
                deadline: Utc::now() - TimeDelta::seconds(1),
            },
        );

        // With no upstreams the query now fails outright.
        assert!(resolver.resolve("gitlab.com", DnsType::A).await.is_err());
        assert!(resolver.cache.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_is_per_query_type() {
        let resolver = resolver();
        prime_cache(
            &resolver,
            "gitlab.com",
            DnsType::A,
            a_record("gitlab.com", [84, 82, 5, 244]),
        )
        .await;

        assert!(resolver.resolve("gitlab.com", DnsType::AAAA).await.is_err());
    }

    #[tokio::test]
    async fn test_local_domain_answers_a_queries() {
        let mut locals = HashMap::new();
        locals.insert("printer.lan".to_string(), Ipv4Addr::new(192, 168, 1, 50));
        let resolver = resolver_with(Vec::new(), locals);

        let (answers, _) = resolver.resolve("printer.lan", DnsType::A).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].rdata, [192, 168, 1, 50]);
        assert_eq!(answers[0].ttl, 300);

        // Non-A queries for a local name are an empty success.
        let (answers, authorities) =
            resolver.resolve("printer.lan", DnsType::TXT).await.unwrap();
        assert!(answers.is_empty());
        assert!(authorities.is_empty());
    }

    #[tokio::test]
    async fn test_reverse_lookup_finds_local_host() {
        let mut locals = HashMap::new();
        locals.insert("printer.lan".to_string(), Ipv4Addr::new(192, 168, 1, 50));
        let resolver = resolver_with(Vec::new(), locals);

        let (answers, _) = resolver
            .resolve("50.1.168.192.in-addr.arpa", DnsType::PTR)
            .await
            .unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].parsed_rdata, "printer.lan");
        assert_eq!(answers[0].rdata, wire_name("printer.lan"));
    }

    #[tokio::test]
    async fn test_reverse_lookup_of_unknown_private_address_is_nxdomain() {
        let resolver = resolver();
        let result = resolver
            .resolve("99.1.168.192.in-addr.arpa", DnsType::PTR)
            .await;
        assert!(matches!(result, Err(Error::NxDomain)));
    }

    #[tokio::test]
    async fn test_blocklist_management() {
        let resolver = resolver();
        resolver
            .add_blocklist_entries(vec![
                "b.example.com".to_string(),
                "a.example.com".to_string(),
                "a.example.com".to_string(),
            ])
            .await;

        // Sorted on insert, duplicates tolerated.
        assert_eq!(
            resolver.blocklist().await,
            vec!["a.example.com", "a.example.com", "b.example.com"]
        );
        assert!(
            resolver
                .resolve("a.example.com", DnsType::A)
                .await
                .unwrap()
                .0[0]
                .rdata
                == [0, 0, 0, 0]
        );

        resolver.delete_blocklist_entry("b.example.com").await;
        assert_eq!(resolver.blocklist_len().await, 2);

        resolver.flush_blocklist().await;
        assert_eq!(resolver.blocklist_len().await, 0);
    }

    #[tokio::test]
    async fn test_local_domain_management() {
        let resolver = resolver();

        assert!(
            resolver
                .add_local_domain("nas.lan", Ipv4Addr::UNSPECIFIED)
                .await
                .is_err()
        );

        resolver
            .add_local_domain("nas.lan", Ipv4Addr::new(192, 168, 1, 10))
            .await
            .unwrap();
        let (answers, _) = resolver.resolve("nas.lan", DnsType::A).await.unwrap();
        assert_eq!(answers[0].rdata, [192, 168, 1, 10]);

        resolver.delete_local_domain("nas.lan").await;
        assert!(resolver.local_domains().await.is_empty());
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key("ab", DnsType::A), "61620001");
        assert_ne!(cache_key("ab", DnsType::A), cache_key("ab", DnsType::AAAA));
    }

    #[test]
    fn test_reverse_octets() {
        assert_eq!(
            reverse_octets("4.3.2.1.in-addr.arpa"),
            Some(Ipv4Addr::new(1, 2, 3, 4))
        );
        assert_eq!(
            reverse_octets("50.1.168.192.in-addr.arpa."),
            Some(Ipv4Addr::new(192, 168, 1, 50))
        );
        assert_eq!(reverse_octets("3.2.1.in-addr.arpa"), None);
        assert_eq!(reverse_octets("5.4.3.2.1.in-addr.arpa"), None);
        assert_eq!(reverse_octets("gitlab.com"), None);
        assert_eq!(reverse_octets("x.3.2.1.in-addr.arpa"), None);
    }
}
