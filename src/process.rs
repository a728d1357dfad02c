//! Instance supervisor: one worker process per identity.
//!
//! `get_or_start` is the single entry point for resolving an identity to a
//! live instance. Starts are deduplicated per identity: concurrent callers
//! observe one in-progress start and all receive its outcome. Workers are
//! spawned detached from the gateway's lifetime so they survive a crash
//! (the registry mirror re-adopts them after a probe); a clean shutdown
//! force-kills every tracked pid.

use crate::config::WorkerConfig;
use crate::error::GatewayError;
use crate::registry::{InstanceRecord, InstanceStatus, Registry};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Interval between readiness probe attempts while a worker boots
const READY_POLL_INTERVAL_MS: u64 = 500;

/// Outcome of one start attempt, fanned out to every caller that joined it
type StartOutcome = Result<InstanceRecord, GatewayError>;

/// Counters for supervisor activity
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Worker processes actually spawned
    pub spawns: AtomicU64,
    /// Explicit stops
    pub stops: AtomicU64,
    /// Instances evicted by the health sweep
    pub evictions: AtomicU64,
}

impl SupervisorStats {
    pub fn record_spawn(&self) {
        self.spawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn get_stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

/// Supervises worker instances.
///
/// # Usage
///
/// `InstanceManager` is designed to be used behind an `Arc` for shared
/// ownership across async tasks; the [`new`](InstanceManager::new)
/// constructor returns `Arc<Self>` directly to enforce this pattern.
/// The registry is owned here and only mutated through supervisor methods.
pub struct InstanceManager {
    registry: Registry,
    worker: WorkerConfig,
    /// In-flight starts keyed by identity; waiters subscribe, the leader
    /// publishes the outcome. Entries live only for one start attempt.
    inflight: DashMap<String, broadcast::Sender<StartOutcome>>,
    stats: SupervisorStats,
}

/// Removes the in-flight entry when a start attempt ends, including when
/// the leading task is cancelled mid-start. Waiters then see the channel
/// close and report the abort instead of hanging.
struct InflightGuard<'a> {
    manager: &'a InstanceManager,
    identity: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.manager.inflight.remove(self.identity);
    }
}

impl InstanceManager {
    pub fn new(registry: Registry, worker: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            worker,
            inflight: DashMap::new(),
            stats: SupervisorStats::default(),
        })
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Current registry entry for an identity, if any
    pub fn get_instance(&self, identity: &str) -> Option<InstanceRecord> {
        self.registry.get(identity)
    }

    /// All tracked instances
    pub fn list_instances(&self) -> Vec<InstanceRecord> {
        self.registry.snapshot()
    }

    /// Resolve an identity to a healthy instance, starting one if needed.
    ///
    /// A running instance that passes a liveness probe is returned as-is,
    /// with no side effects. Otherwise at most one start runs per identity
    /// at a time; concurrent callers join it and share its outcome.
    pub async fn get_or_start(self: &Arc<Self>, identity: &str) -> StartOutcome {
        if let Some(existing) = self.registry.get(identity) {
            if existing.status == InstanceStatus::Running
                && probe_port(existing.port, self.worker.probe_timeout()).await
            {
                debug!(identity, port = existing.port, "Reusing healthy instance");
                return Ok(existing);
            }
            debug!(
                identity,
                port = existing.port,
                status = %existing.status,
                "Existing instance not usable, starting a new one"
            );
        }

        enum Role {
            Leader(broadcast::Sender<StartOutcome>),
            Waiter(broadcast::Receiver<StartOutcome>),
        }

        let role = match self.inflight.entry(identity.to_string()) {
            Entry::Occupied(entry) => Role::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Waiter(mut rx) => {
                debug!(identity, "Joining in-progress start");
                match rx.recv().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::InstanceUnavailable(
                        "start attempt was aborted".to_string(),
                    )),
                }
            }
            Role::Leader(tx) => {
                let outcome = {
                    let _guard = InflightGuard {
                        manager: self.as_ref(),
                        identity,
                    };
                    self.start_instance(identity).await
                    // guard drops here: the entry is unpublished before the
                    // outcome is announced, so no new waiter can subscribe
                    // after the send and miss it
                };
                let _ = tx.send(outcome.clone());
                outcome
            }
        }
    }

    /// Start a fresh worker for an identity. Caller holds the in-flight
    /// leadership for this identity.
    async fn start_instance(self: &Arc<Self>, identity: &str) -> StartOutcome {
        // A previous leader may have finished between our probe and our
        // taking leadership; don't spawn twice.
        if let Some(existing) = self.registry.get(identity) {
            if existing.status == InstanceStatus::Running
                && probe_port(existing.port, self.worker.probe_timeout()).await
            {
                return Ok(existing);
            }
            // Stale entry: releasing it frees its port claim for the allocator
            if let Some(stale) = self.registry.remove(identity) {
                info!(
                    identity,
                    port = stale.port,
                    pid = stale.pid,
                    "Discarded stale instance entry"
                );
            }
        }

        let port = crate::ports::allocate(&self.registry, self.worker.port_min, self.worker.port_max)?;

        let argv = self
            .worker
            .render_command(identity, port)
            .map_err(|e| GatewayError::ProcessError(e.to_string()))?;

        info!(identity, port, command = %argv.join(" "), "Starting worker");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env("USERGATE_USER", identity);
        cmd.env("HOME", self.worker.home_dir(identity));
        cmd.env("PORT", port.to_string());
        for (key, value) in &self.worker.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(identity, command = %argv[0], error = %e, "Failed to spawn worker");
            GatewayError::ProcessError(format!("failed to spawn {}: {}", argv[0], e))
        })?;
        self.stats.record_spawn();

        let pid = child.id().unwrap_or(0);
        info!(identity, pid, port, "Worker process spawned");

        if let Some(stdout) = child.stdout.take() {
            spawn_output_pump(identity.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_pump(identity.to_string(), "stderr", stderr);
        }

        let record = InstanceRecord {
            identity: identity.to_string(),
            port,
            pid,
            status: InstanceStatus::Starting,
            start_time: Utc::now(),
        };
        self.registry.insert(record.clone());

        // Exit watcher: deregisters the instance as soon as the worker
        // exits, whatever the exit code.
        let manager = Arc::clone(self);
        let watched_identity = identity.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(identity = %watched_identity, pid, %status, "Worker exited"),
                Err(e) => warn!(identity = %watched_identity, pid, error = %e, "Failed to wait on worker"),
            }
            if manager.registry.remove_if_pid(&watched_identity, pid) {
                info!(identity = %watched_identity, pid, "Deregistered instance after exit");
            }
        });

        if !self.wait_ready(port, self.worker.startup_timeout()).await {
            error!(identity, pid, port, "Worker did not become ready, discarding");
            self.registry.remove_if_pid(identity, pid);
            if pid > 0 {
                send_signal(pid, Signal::Kill);
            }
            return Err(GatewayError::StartupTimeout(
                identity.to_string(),
                self.worker.startup_timeout_secs,
            ));
        }

        // The exit watcher may have raced a fast-crashing worker whose port
        // was grabbed by someone else; only publish Running if still ours.
        self.registry.set_status(identity, InstanceStatus::Running);
        match self.registry.get(identity) {
            Some(current) if current.pid == pid => {
                info!(identity, pid, port, "Instance is running");
                Ok(current)
            }
            _ => Err(GatewayError::InstanceUnavailable(
                "worker exited during startup".to_string(),
            )),
        }
    }

    /// Poll until the worker accepts TCP connections or the timeout elapses
    async fn wait_ready(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if probe_port(port, Duration::from_secs(1)).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
        }
        false
    }

    /// Stop an identity's instance: deregister immediately, SIGTERM the
    /// worker, and schedule an unconditional SIGKILL after the grace
    /// window. Does not wait for the process to die. A missing entry or a
    /// stale pid is a no-op.
    pub fn stop(&self, identity: &str) {
        let Some(record) = self.registry.remove(identity) else {
            debug!(identity, "No instance to stop");
            return;
        };
        self.stats.record_stop();

        let pid = record.pid;
        info!(identity, pid, port = record.port, "Stopping instance");

        if pid == 0 {
            return;
        }

        send_signal(pid, Signal::Term);

        let grace = self.worker.shutdown_grace_period();
        let identity = identity.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if process_alive(pid) {
                warn!(identity = %identity, pid, "Worker still running after grace period, killing");
                send_signal(pid, Signal::Kill);
            }
        });
    }

    /// Remove every entry whose worker fails a liveness probe. Entries in
    /// `Starting` are skipped so a slow boot is not mistaken for failure.
    /// Eviction is silent recovery: the next `get_or_start` respawns.
    pub async fn sweep_once(&self) {
        for record in self.registry.snapshot() {
            if record.status == InstanceStatus::Starting {
                continue;
            }
            if probe_port(record.port, self.worker.probe_timeout()).await {
                continue;
            }
            if self.registry.remove_if_pid(&record.identity, record.pid) {
                self.stats.record_eviction();
                warn!(
                    identity = %record.identity,
                    port = record.port,
                    pid = record.pid,
                    "Evicted unhealthy instance"
                );
            }
        }
    }

    /// Force-terminate every tracked worker. Called on gateway shutdown so
    /// no orphan keeps holding a reserved port.
    pub fn shutdown_all(&self) {
        let records = self.registry.drain();
        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "Killing all tracked workers");
        for record in records {
            if record.pid > 0 && process_alive(record.pid) {
                info!(identity = %record.identity, pid = record.pid, "Killing worker");
                send_signal(record.pid, Signal::Kill);
            }
        }
    }
}

/// Check whether a port on loopback accepts a TCP connection
pub async fn probe_port(port: u16, timeout: Duration) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

/// Log worker output line by line under its identity
fn spawn_output_pump<R>(identity: String, stream_name: &'static str, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(identity = %identity, stream = stream_name, "{}", line);
        }
    });
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) {
    warn!(pid, "Signal delivery is not supported on this platform");
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn test_manager(worker: WorkerConfig) -> Arc<InstanceManager> {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.into_path().join("instances.json"));
        InstanceManager::new(registry, worker)
    }

    fn running_record(identity: &str, port: u16) -> InstanceRecord {
        InstanceRecord {
            identity: identity.to_string(),
            port,
            pid: std::process::id(),
            status: InstanceStatus::Running,
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_or_start_reuses_healthy_instance() {
        let manager = test_manager(WorkerConfig::default());

        // A listener we own stands in for a healthy worker
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        manager.registry.insert(running_record("alice", port));

        let first = manager.get_or_start("alice").await.unwrap();
        let second = manager.get_or_start("alice").await.unwrap();

        assert_eq!(first.port, port);
        assert_eq!(second.port, port);
        assert_eq!(manager.stats().get_spawns(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_discards_entry() {
        let worker = WorkerConfig {
            // Runs but never listens, so readiness must time out
            command: "sleep 60".to_string(),
            startup_timeout_secs: 1,
            port_min: 24000,
            port_max: 24010,
            ..WorkerConfig::default()
        };
        let manager = test_manager(worker);

        let err = manager.get_or_start("alice").await.unwrap_err();
        assert!(matches!(err, GatewayError::StartupTimeout(_, 1)));
        assert!(manager.get_instance("alice").is_none());
        assert_eq!(manager.stats().get_spawns(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_attempt() {
        let worker = WorkerConfig {
            command: "sleep 60".to_string(),
            startup_timeout_secs: 1,
            port_min: 24020,
            port_max: 24030,
            ..WorkerConfig::default()
        };
        let manager = test_manager(worker);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { m.get_or_start("alice").await }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
        // Five concurrent callers, one spawn
        assert_eq!(manager.stats().get_spawns(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_error() {
        let worker = WorkerConfig {
            command: "/nonexistent/usergate-test-binary".to_string(),
            port_min: 24040,
            port_max: 24050,
            ..WorkerConfig::default()
        };
        let manager = test_manager(worker);

        let err = manager.get_or_start("alice").await.unwrap_err();
        assert!(matches!(err, GatewayError::ProcessError(_)));
        assert!(manager.get_instance("alice").is_none());
    }

    #[tokio::test]
    async fn test_stop_removes_entry_immediately() {
        let manager = test_manager(WorkerConfig::default());
        let mut record = running_record("alice", 24060);
        record.pid = 0; // nothing to signal
        manager.registry.insert(record);

        manager.stop("alice");
        assert!(manager.get_instance("alice").is_none());
        assert_eq!(manager.stats().get_stops(), 1);

        // Stopping again is a no-op
        manager.stop("alice");
        assert_eq!(manager.stats().get_stops(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_dead_ports() {
        let manager = test_manager(WorkerConfig {
            probe_timeout_secs: 1,
            ..WorkerConfig::default()
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();

        // A port nothing listens on
        let dead_port = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap().port()
        };

        manager.registry.insert(running_record("alice", live_port));
        manager.registry.insert(running_record("bob", dead_port));

        manager.sweep_once().await;

        assert!(manager.get_instance("alice").is_some());
        assert!(manager.get_instance("bob").is_none());
        assert_eq!(manager.stats().get_evictions(), 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_starting_instances() {
        let manager = test_manager(WorkerConfig {
            probe_timeout_secs: 1,
            ..WorkerConfig::default()
        });

        let dead_port = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap().port()
        };
        let mut record = running_record("alice", dead_port);
        record.status = InstanceStatus::Starting;
        manager.registry.insert(record);

        manager.sweep_once().await;

        // Slow boots are not evicted
        assert!(manager.get_instance("alice").is_some());
        assert_eq!(manager.stats().get_evictions(), 0);
    }

    #[tokio::test]
    async fn test_probe_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_port(port, Duration::from_secs(1)).await);

        drop(listener);
        let closed = {
            let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap().port()
        };
        assert!(!probe_port(closed, Duration::from_secs(1)).await);
    }
}
