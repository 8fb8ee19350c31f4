pub mod lease;
pub mod options;
pub mod packet;
pub mod server;
pub mod store;

pub use lease::{Lease, LeasePool, LeaseState, OFFER_HOLD_SECS};
pub use options::{MessageType, OptionTag, Options};
pub use packet::DhcpPacket;
pub use server::DhcpServer;
pub use store::{FileLeaseStore, LeaseStore};
