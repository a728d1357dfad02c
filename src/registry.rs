//! Persisted identity → instance mapping.
//!
//! The in-memory table is the authority; the JSON mirror on disk exists so
//! a restarted gateway can re-adopt workers that survived it. Every
//! mutation rewrites the mirror wholesale before the mutating call returns.
//! Loaded entries are advisory only — the supervisor re-validates them with
//! a liveness probe before trusting them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lifecycle state of a supervised instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Spawned, waiting for the readiness probe
    Starting,
    /// Accepting traffic
    Running,
    /// Probe failed; kept only transiently before removal
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Error => write!(f, "error"),
        }
    }
}

/// One supervised worker process and its assigned port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub identity: String,
    pub port: u16,
    pub pid: u32,
    pub status: InstanceStatus,
    pub start_time: DateTime<Utc>,
}

/// The identity → instance table plus its on-disk mirror.
///
/// All mutation goes through the supervisor; nothing else holds a handle.
pub struct Registry {
    path: PathBuf,
    inner: Mutex<HashMap<String, InstanceRecord>>,
}

impl Registry {
    /// Open a registry backed by the given mirror file, loading whatever
    /// the previous gateway left behind. A missing or corrupt mirror is an
    /// empty registry, not an error.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let table = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<HashMap<String, InstanceRecord>>(&data) {
                Ok(table) => {
                    if !table.is_empty() {
                        info!(
                            path = %path.display(),
                            count = table.len(),
                            "Loaded instance registry; entries will be re-validated by probe"
                        );
                    }
                    table
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Registry mirror is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read registry mirror, starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            inner: Mutex::new(table),
        }
    }

    pub fn get(&self, identity: &str) -> Option<InstanceRecord> {
        self.inner.lock().get(identity).cloned()
    }

    /// Insert or replace an entry and rewrite the mirror before returning
    pub fn insert(&self, record: InstanceRecord) {
        let mut table = self.inner.lock();
        table.insert(record.identity.clone(), record);
        self.persist(&table);
    }

    /// Update the status of an existing entry; no-op when absent
    pub fn set_status(&self, identity: &str, status: InstanceStatus) {
        let mut table = self.inner.lock();
        if let Some(record) = table.get_mut(identity) {
            record.status = status;
            self.persist(&table);
        }
    }

    /// Remove an entry and rewrite the mirror; returns the removed record
    pub fn remove(&self, identity: &str) -> Option<InstanceRecord> {
        let mut table = self.inner.lock();
        let removed = table.remove(identity);
        if removed.is_some() {
            self.persist(&table);
        }
        removed
    }

    /// Remove an entry only if it still tracks the given pid.
    ///
    /// Exit watchers race with restarts; the pid check keeps a watcher for a
    /// dead worker from deregistering its successor.
    pub fn remove_if_pid(&self, identity: &str, pid: u32) -> bool {
        let mut table = self.inner.lock();
        match table.get(identity) {
            Some(record) if record.pid == pid => {
                table.remove(identity);
                self.persist(&table);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry and rewrite the mirror; returns the drained records
    pub fn drain(&self) -> Vec<InstanceRecord> {
        let mut table = self.inner.lock();
        let drained: Vec<InstanceRecord> = table.drain().map(|(_, v)| v).collect();
        self.persist(&table);
        drained
    }

    /// Snapshot of all entries, for sweeps and shutdown
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.inner.lock().values().cloned().collect()
    }

    /// Whether any entry currently claims the given port
    pub fn port_claimed(&self, port: u16) -> bool {
        self.inner.lock().values().any(|r| r.port == port)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Rewrite the mirror wholesale. Called with the table lock held so the
    /// file always reflects a consistent view; the file is small and the
    /// write is deliberately synchronous — a mutation does not return until
    /// its mirror write has happened.
    fn persist(&self, table: &HashMap<String, InstanceRecord>) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %self.path.display(), error = %e, "Failed to create registry directory");
                    return;
                }
            }
        }
        match serde_json::to_string_pretty(table) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    warn!(path = %self.path.display(), error = %e, "Failed to write registry mirror");
                } else {
                    debug!(path = %self.path.display(), count = table.len(), "Registry mirror updated");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to serialize registry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str, port: u16) -> InstanceRecord {
        InstanceRecord {
            identity: identity.to_string(),
            port,
            pid: 4242,
            status: InstanceStatus::Running,
            start_time: Utc::now(),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("instances.json"));

        assert!(registry.is_empty());
        registry.insert(record("alice", 10001));

        let got = registry.get("alice").unwrap();
        assert_eq!(got.port, 10001);
        assert_eq!(got.status, InstanceStatus::Running);

        assert!(registry.remove("alice").is_some());
        assert!(registry.get("alice").is_none());
        assert!(registry.remove("alice").is_none());
    }

    #[test]
    fn test_mirror_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");

        {
            let registry = Registry::open(&path);
            registry.insert(record("alice", 10001));
            registry.insert(record("bob", 10002));
        }

        let reloaded = Registry::open(&path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("bob").unwrap().port, 10002);
        assert!(reloaded.port_claimed(10001));
        assert!(!reloaded.port_claimed(10003));
    }

    #[test]
    fn test_mirror_reflects_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");

        let registry = Registry::open(&path);
        registry.insert(record("alice", 10001));
        registry.remove("alice");

        let reloaded = Registry::open(&path);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_corrupt_mirror_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(&path, "{not json").unwrap();

        let registry = Registry::open(&path);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_status() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("instances.json"));

        let mut rec = record("alice", 10001);
        rec.status = InstanceStatus::Starting;
        registry.insert(rec);

        registry.set_status("alice", InstanceStatus::Running);
        assert_eq!(registry.get("alice").unwrap().status, InstanceStatus::Running);

        // Absent identity is a no-op
        registry.set_status("bob", InstanceStatus::Error);
        assert!(registry.get("bob").is_none());
    }

    #[test]
    fn test_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");

        let registry = Registry::open(&path);
        registry.insert(record("alice", 10001));
        registry.insert(record("bob", 10002));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());

        let reloaded = Registry::open(&path);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_remove_if_pid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path().join("instances.json"));

        registry.insert(record("alice", 10001));
        assert!(!registry.remove_if_pid("alice", 9999));
        assert!(registry.get("alice").is_some());

        assert!(registry.remove_if_pid("alice", 4242));
        assert!(registry.get("alice").is_none());
    }

    #[test]
    fn test_status_serde_shape() {
        let json = serde_json::to_string(&InstanceStatus::Starting).unwrap();
        assert_eq!(json, "\"starting\"");
        assert_eq!(InstanceStatus::Running.to_string(), "running");
    }
}
