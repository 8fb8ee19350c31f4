use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::dhcp::Lease;

#[derive(Debug, Serialize)]
pub struct LeaseReport {
    pub active: Vec<Lease>,
    pub reserved: Vec<Lease>,
}

#[derive(Debug, Deserialize)]
pub struct BlocklistUpdate {
    pub domains: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocalDomainEntry {
    pub domain: String,
    pub ip: Ipv4Addr,
}
