//! Lease persistence across restarts.
//!
//! The store interface is deliberately narrow: load everything, persist
//! everything. The file implementation writes a packed binary record per
//! Active lease:
//!
//! ```text
//! u8 count
//! per lease: u8 cid_len, cid, u8 host_len, host, ip[4], u8 state
//! ```
//!
//! Expiry is not serialized; restored leases are given a fresh lease
//! period when they are adopted back into the pool.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::dhcp::lease::{Lease, LeaseState};
use crate::error::{Error, Result};

pub trait LeaseStore: Send + Sync {
    fn load(&self) -> Result<Vec<Lease>>;
    fn persist(&self, leases: &[Lease]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    path: PathBuf,
}

impl FileLeaseStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LeaseStore for FileLeaseStore {
    fn load(&self) -> Result<Vec<Lease>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        decode_leases(&data)
    }

    fn persist(&self, leases: &[Lease]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&self.path, encode_leases(leases))?;
        Ok(())
    }
}

fn encode_leases(leases: &[Lease]) -> Vec<u8> {
    let mut buffer = vec![0u8];
    let mut count: u8 = 0;

    for lease in leases {
        if lease.state != LeaseState::Active {
            continue;
        }
        count += 1;

        let cid = lease.client_id.as_bytes();
        buffer.push(cid.len() as u8);
        buffer.extend_from_slice(cid);

        let host = lease.hostname.as_deref().unwrap_or("").as_bytes();
        buffer.push(host.len() as u8);
        buffer.extend_from_slice(host);

        buffer.extend_from_slice(&lease.ip.octets());
        buffer.push(lease.state as u8);
    }

    buffer[0] = count;
    buffer
}

fn decode_leases(data: &[u8]) -> Result<Vec<Lease>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let count = data[0] as usize;
    let mut offset = 1;
    let mut leases = Vec::with_capacity(count);

    for index in 0..count {
        let truncated = || Error::PersistenceCorrupt(format!("record {} truncated", index));

        let cid_len = *data.get(offset).ok_or_else(truncated)? as usize;
        offset += 1;
        let cid = data.get(offset..offset + cid_len).ok_or_else(truncated)?;
        offset += cid_len;

        let host_len = *data.get(offset).ok_or_else(truncated)? as usize;
        offset += 1;
        let host = data.get(offset..offset + host_len).ok_or_else(truncated)?;
        offset += host_len;

        let ip: [u8; 4] = data
            .get(offset..offset + 4)
            .ok_or_else(truncated)?
            .try_into()
            .map_err(|_| truncated())?;
        offset += 4;

        let state_byte = *data.get(offset).ok_or_else(truncated)?;
        offset += 1;
        let state = LeaseState::try_from(state_byte)
            .map_err(|value| Error::PersistenceCorrupt(format!("unknown lease state {}", value)))?;

        let hostname = if host.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(host).to_string())
        };

        leases.push(Lease {
            client_id: String::from_utf8_lossy(cid).to_string(),
            hostname,
            ip: Ipv4Addr::from(ip),
            state,
            expires_at: chrono::DateTime::UNIX_EPOCH,
        });
    }

    Ok(leases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn active_lease(cid: &str, hostname: Option<&str>, ip: Ipv4Addr) -> Lease {
        Lease {
            client_id: cid.to_string(),
            hostname: hostname.map(str::to_string),
            ip,
            state: LeaseState::Active,
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path().join("leases.bin"));

        let leases = vec![
            active_lease(
                "aa:bb:cc:dd:ee:ff",
                Some("laptop"),
                Ipv4Addr::new(10, 0, 0, 1),
            ),
            active_lease("00:11:22:33:44:55", None, Ipv4Addr::new(10, 0, 0, 2)),
        ];

        store.persist(&leases).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].client_id, "aa:bb:cc:dd:ee:ff");
        assert_eq!(loaded[0].hostname.as_deref(), Some("laptop"));
        assert_eq!(loaded[0].ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(loaded[0].state, LeaseState::Active);
        assert_eq!(loaded[1].client_id, "00:11:22:33:44:55");
        assert!(loaded[1].hostname.is_none());
    }

    #[test]
    fn test_only_active_leases_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path().join("leases.bin"));

        let mut offered = active_lease("aa:bb:cc:dd:ee:01", None, Ipv4Addr::new(10, 0, 0, 1));
        offered.state = LeaseState::Offered;
        let mut reserved = active_lease("aa:bb:cc:dd:ee:02", None, Ipv4Addr::new(10, 0, 0, 2));
        reserved.state = LeaseState::Reserved;
        let active = active_lease("aa:bb:cc:dd:ee:03", None, Ipv4Addr::new(10, 0, 0, 3));

        store.persist(&[offered, reserved, active]).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].client_id, "aa:bb:cc:dd:ee:03");
    }

    #[test]
    fn test_missing_file_is_no_leases() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path().join("does-not-exist.bin"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_empty_file_is_no_leases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.bin");
        std::fs::write(&path, []).unwrap();

        let store = FileLeaseStore::new(&path);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLeaseStore::new(dir.path().join("leases.bin"));

        let lease = active_lease("aa:bb:cc:dd:ee:ff", None, Ipv4Addr::new(10, 0, 0, 1));
        store.persist(&[lease]).unwrap();

        let mut data = std::fs::read(store.path()).unwrap();
        data.truncate(data.len() - 3);
        std::fs::write(store.path(), data).unwrap();

        assert!(matches!(
            store.load(),
            Err(Error::PersistenceCorrupt(_))
        ));
    }

    #[test]
    fn test_layout_is_packed() {
        let lease = active_lease("ab", Some("x"), Ipv4Addr::new(10, 0, 0, 1));
        let encoded = encode_leases(&[lease]);

        assert_eq!(
            encoded,
            vec![
                1, // count
                2, b'a', b'b', // cid
                1, b'x', // hostname
                10, 0, 0, 1, // ip
                LeaseState::Active as u8,
            ]
        );
    }
}
