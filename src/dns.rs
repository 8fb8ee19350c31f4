pub mod blocklist;
pub mod message;
pub mod resolver;
pub mod server;

pub use message::{DnsHeader, DnsMessage, DnsQuestion, DnsRecord, DnsType, Rcode};
pub use resolver::Resolver;
pub use server::DnsServer;
