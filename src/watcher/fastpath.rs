//! Local fast-path table: remote pod address -> remote host IP
//!
//! The kernel-resident table itself is loaded by the datapath; this side only
//! decides the content. [`MemoryFastPath`] keeps it in memory and can mirror it
//! into a JSON file the loader picks up.

use crate::common::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait FastPathTable: Send + Sync {
    fn put(&self, addr: Ipv4Addr, host_ip: Ipv4Addr) -> Result<()>;

    fn delete(&self, addr: Ipv4Addr) -> Result<()>;

    fn batch_put(&self, entries: &[(Ipv4Addr, Ipv4Addr)]) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn entries(&self) -> Result<BTreeMap<Ipv4Addr, Ipv4Addr>>;
}

#[derive(Default)]
pub struct MemoryFastPath {
    entries: Mutex<BTreeMap<Ipv4Addr, Ipv4Addr>>,
    snapshot: Option<PathBuf>,
}

impl MemoryFastPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite `path` after every change.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            snapshot: Some(path.into()),
        }
    }

    fn update<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<Ipv4Addr, Ipv4Addr>),
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::FastPath("table lock poisoned".into()))?;
        edit(&mut entries);
        if let Some(path) = &self.snapshot {
            write_snapshot(path, &entries)?;
        }
        Ok(())
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_snapshot(path: &Path, entries: &BTreeMap<Ipv4Addr, Ipv4Addr>) -> Result<()> {
    let doc: BTreeMap<String, String> = entries
        .iter()
        .map(|(addr, host)| (addr.to_string(), host.to_string()))
        .collect();
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(serde_json::to_string_pretty(&doc)?.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot written by [`MemoryFastPath::with_snapshot`].
pub fn read_snapshot(path: &Path) -> Result<BTreeMap<Ipv4Addr, Ipv4Addr>> {
    let raw = std::fs::read_to_string(path)?;
    let doc: BTreeMap<String, String> = serde_json::from_str(&raw)?;
    doc.iter()
        .map(|(addr, host)| {
            let addr = addr.parse().map_err(|_| Error::invalid_address(addr))?;
            let host = host.parse().map_err(|_| Error::invalid_address(host))?;
            Ok((addr, host))
        })
        .collect()
}

impl FastPathTable for MemoryFastPath {
    fn put(&self, addr: Ipv4Addr, host_ip: Ipv4Addr) -> Result<()> {
        self.update(|entries| {
            entries.insert(addr, host_ip);
        })
    }

    fn delete(&self, addr: Ipv4Addr) -> Result<()> {
        self.update(|entries| {
            entries.remove(&addr);
        })
    }

    fn batch_put(&self, batch: &[(Ipv4Addr, Ipv4Addr)]) -> Result<()> {
        self.update(|entries| entries.extend(batch.iter().copied()))
    }

    fn clear(&self) -> Result<()> {
        self.update(|entries| entries.clear())
    }

    fn entries(&self) -> Result<BTreeMap<Ipv4Addr, Ipv4Addr>> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .map_err(|_| Error::FastPath("table lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_delete_batch() {
        let table = MemoryFastPath::new();
        let host = Ipv4Addr::new(192, 168, 1, 12);
        table.put(Ipv4Addr::new(10, 244, 5, 10), host).unwrap();
        table
            .batch_put(&[(Ipv4Addr::new(10, 244, 5, 11), host), (Ipv4Addr::new(10, 244, 5, 12), host)])
            .unwrap();
        table.delete(Ipv4Addr::new(10, 244, 5, 10)).unwrap();

        let entries = table.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries.contains_key(&Ipv4Addr::new(10, 244, 5, 10)));

        table.clear().unwrap();
        assert!(table.entries().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_mirrors_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fastpath.json");
        let table = MemoryFastPath::with_snapshot(&path);

        let (addr, host) = (Ipv4Addr::new(10, 244, 5, 10), Ipv4Addr::new(192, 168, 1, 12));
        table.put(addr, host).unwrap();
        assert_eq!(read_snapshot(&path).unwrap().get(&addr), Some(&host));

        table.delete(addr).unwrap();
        assert!(read_snapshot(&path).unwrap().is_empty());
    }
}
