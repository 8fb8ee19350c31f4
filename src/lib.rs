pub mod config;
pub mod dhcp;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod web;

pub use config::Config;
pub use dhcp::{DhcpPacket, DhcpServer, Lease, LeasePool, LeaseState, MessageType};
pub use dns::{DnsMessage, DnsServer, Resolver};
pub use error::{Error, Result};
pub use metrics::Metrics;
