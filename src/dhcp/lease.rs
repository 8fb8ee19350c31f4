//! Lease records and the fixed-range allocation pool.
//!
//! The pool owns one lease slot per address of the configured
//! `[start, end]` range, in ascending order, plus an overlay map of
//! reserved (static) bindings keyed by client id. A single mutex
//! serializes every operation; nothing holds the lock across I/O.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Seconds an Offer holds its slot while waiting for the client's Request.
pub const OFFER_HOLD_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LeaseState {
    Available = 0,
    Offered = 1,
    Reserved = 2,
    Active = 3,
}

impl TryFrom<u8> for LeaseState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Available),
            1 => Ok(Self::Offered),
            2 => Ok(Self::Reserved),
            3 => Ok(Self::Active),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "Available"),
            Self::Offered => write!(f, "Offered"),
            Self::Reserved => write!(f, "Reserved"),
            Self::Active => write!(f, "Active"),
        }
    }
}

/// One IPv4 address slot and its current binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Client MAC as lowercased colon-separated hex; empty when Available.
    pub client_id: String,
    pub hostname: Option<String>,
    pub ip: Ipv4Addr,
    pub state: LeaseState,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    fn available(ip: Ipv4Addr) -> Self {
        Self {
            client_id: String::new(),
            hostname: None,
            ip,
            state: LeaseState::Available,
            expires_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Returns the slot to Available, keeping only the address.
    pub fn clear(&mut self) {
        self.client_id.clear();
        self.hostname = None;
        self.state = LeaseState::Available;
        self.expires_at = DateTime::UNIX_EPOCH;
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

#[derive(Debug)]
struct PoolState {
    leases: Vec<Lease>,
    reserved: HashMap<String, Lease>,
}

/// Fixed-range allocation table with a reservation overlay.
#[derive(Debug)]
pub struct LeasePool {
    inner: Mutex<PoolState>,
}

impl LeasePool {
    /// Builds one Available lease per address of the inclusive range.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        let start = u32::from(start);
        let end = u32::from(end);
        let leases = (start..=end)
            .map(|addr| Lease::available(Ipv4Addr::from(addr)))
            .collect();

        Self {
            inner: Mutex::new(PoolState {
                leases,
                reserved: HashMap::new(),
            }),
        }
    }

    /// Looks up the lease bound to a client: the reserved overlay first,
    /// then the pool. An expired pool binding is recycled on sight and
    /// reported as absent.
    pub async fn get_lease(&self, client_id: &str) -> Option<Lease> {
        let mut state = self.inner.lock().await;

        if let Some(reserved) = state.reserved.get(client_id) {
            return Some(reserved.clone());
        }

        for lease in &mut state.leases {
            if lease.client_id.eq_ignore_ascii_case(client_id) {
                if lease.is_expired() {
                    lease.clear();
                    return None;
                }
                return Some(lease.clone());
            }
        }

        None
    }

    /// Selects the first slot usable for `client_id` and stamps it Offered
    /// for [`OFFER_HOLD_SECS`]. Usable means Available, already Offered to
    /// this client, Offered to another client past the hold window, or
    /// Active past expiry.
    pub async fn next_available_lease(&self, client_id: &str) -> Option<Lease> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        let hold = now + TimeDelta::seconds(OFFER_HOLD_SECS);

        for lease in &mut state.leases {
            match lease.state {
                LeaseState::Available => {
                    lease.client_id = client_id.to_string();
                    lease.state = LeaseState::Offered;
                    lease.expires_at = hold;
                    return Some(lease.clone());
                }
                LeaseState::Offered => {
                    if lease.client_id.eq_ignore_ascii_case(client_id) {
                        lease.expires_at = hold;
                        return Some(lease.clone());
                    } else if now > lease.expires_at {
                        lease.client_id = client_id.to_string();
                        lease.expires_at = hold;
                        return Some(lease.clone());
                    }
                }
                LeaseState::Active => {
                    if now > lease.expires_at {
                        lease.client_id = client_id.to_string();
                        lease.state = LeaseState::Offered;
                        lease.expires_at = hold;
                        return Some(lease.clone());
                    }
                }
                LeaseState::Reserved => {}
            }
        }

        None
    }

    /// Promotes the client's Offered slot to Active for `ttl_secs`.
    /// Reserved leases are left untouched.
    pub async fn accept_lease(&self, lease: &Lease, ttl_secs: u32) {
        if lease.state == LeaseState::Reserved {
            return;
        }

        let mut state = self.inner.lock().await;
        for entry in &mut state.leases {
            if entry.client_id == lease.client_id {
                entry.state = LeaseState::Active;
                entry.expires_at = Utc::now() + TimeDelta::seconds(ttl_secs as i64);
                return;
            }
        }
    }

    /// Stamps a fresh expiry on a reserved binding. The entry stays
    /// Reserved; the timestamp records when the client last confirmed it.
    pub async fn touch_reserved(&self, client_id: &str, ttl_secs: u32) {
        let mut state = self.inner.lock().await;
        if let Some(entry) = state.reserved.get_mut(client_id) {
            entry.expires_at = Utc::now() + TimeDelta::seconds(ttl_secs as i64);
        }
    }

    /// Records the client-supplied hostname on whichever binding the client
    /// holds.
    pub async fn set_hostname(&self, client_id: &str, hostname: &str) {
        let mut state = self.inner.lock().await;
        if let Some(entry) = state.reserved.get_mut(client_id) {
            entry.hostname = Some(hostname.to_string());
            return;
        }
        for lease in &mut state.leases {
            if lease.client_id.eq_ignore_ascii_case(client_id) {
                lease.hostname = Some(hostname.to_string());
            }
        }
    }

    /// Installs a static binding. Any dynamic binding the client currently
    /// holds is cleared first; an address already reserved for a different
    /// client is rejected.
    pub async fn reserve_lease(&self, client_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.inner.lock().await;

        for lease in &mut state.leases {
            if lease.client_id.eq_ignore_ascii_case(client_id)
                && lease.state != LeaseState::Available
            {
                lease.clear();
                break;
            }
        }

        for entry in state.reserved.values() {
            if entry.client_id != client_id && entry.ip == ip {
                return Err(Error::IpAlreadyReserved(ip));
            }
        }

        state.reserved.insert(
            client_id.to_string(),
            Lease {
                client_id: client_id.to_string(),
                hostname: None,
                ip,
                state: LeaseState::Reserved,
                expires_at: DateTime::UNIX_EPOCH,
            },
        );
        Ok(())
    }

    /// Retargets the client's binding, reserved overlay first, then the
    /// pool entry in place.
    pub async fn update_lease(&self, client_id: &str, ip: Ipv4Addr) -> Result<()> {
        let mut state = self.inner.lock().await;

        if let Some(entry) = state.reserved.get_mut(client_id) {
            entry.ip = ip;
            return Ok(());
        }

        for lease in &mut state.leases {
            if lease.client_id.eq_ignore_ascii_case(client_id) {
                lease.ip = ip;
                return Ok(());
            }
        }

        Err(Error::LeaseNotFound(client_id.to_string()))
    }

    /// Drops the binding. Returns true when a reserved overlay entry was
    /// removed so the caller can drop the matching configuration entry.
    pub async fn release_lease(&self, lease: &Lease) -> bool {
        let mut state = self.inner.lock().await;

        if state.reserved.remove(&lease.client_id).is_some() {
            return true;
        }

        for entry in &mut state.leases {
            if entry.client_id.eq_ignore_ascii_case(&lease.client_id) {
                entry.clear();
            }
        }
        false
    }

    /// Snapshot of unexpired Active pool entries.
    pub async fn active_leases(&self) -> Vec<Lease> {
        let state = self.inner.lock().await;
        let now = Utc::now();
        state
            .leases
            .iter()
            .filter(|lease| lease.state == LeaseState::Active && lease.expires_at > now)
            .cloned()
            .collect()
    }

    /// Snapshot of the reservation overlay.
    pub async fn reserved_leases(&self) -> Vec<Lease> {
        let state = self.inner.lock().await;
        state.reserved.values().cloned().collect()
    }

    /// Adopts persisted leases into their pool slots. Every restored lease
    /// becomes Active with a fresh `ttl_secs` period; saved expiries are
    /// deliberately discarded so clients that are gone simply age out.
    pub async fn restore(&self, loaded: Vec<Lease>, ttl_secs: u32) -> usize {
        let mut state = self.inner.lock().await;
        let expiry = Utc::now() + TimeDelta::seconds(ttl_secs as i64);
        let mut count = 0;

        for lease in loaded {
            for slot in &mut state.leases {
                if slot.ip == lease.ip {
                    slot.client_id = lease.client_id.clone();
                    slot.hostname = lease.hostname.clone();
                    slot.state = LeaseState::Active;
                    slot.expires_at = expiry;
                    count += 1;
                }
            }
        }

        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.leases.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.leases.is_empty()
    }
}
