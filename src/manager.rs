//! The server lifecycle manager: starts, tracks, gracefully stops, and
//! force-terminates per-directory static servers.
//!
//! Every operation converges to a boolean outcome. Failures at any step are
//! caught here, logged, and reported as `false`; nothing below this boundary
//! propagates an unhandled fault to callers. The registry entry for an id is
//! created only by a fully successful start and removed unconditionally by
//! stop — a failed shutdown forfeits management of the id rather than
//! leaving an undead entry that would block every future start.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{DirectoryConfig, LifecycleConfig};
use crate::instance::{self, InstanceHandle};
use crate::probe;
use crate::reclaim::{PortReclaimer, SystemReclaimer};
use crate::registry::{ServerInstance, ServerRegistry};
use crate::rules;

/// Orchestrates start/stop/shutdown-all against the registry, the port
/// prober, and the platform reclaimer.
///
/// Designed to be shared behind an `Arc` across async tasks; constructors
/// return `Arc<Self>` to enforce the pattern. Operations on different ids
/// run fully concurrently; a second concurrent start/stop on an id that
/// already has an operation in flight is a no-op returning false.
pub struct LifecycleManager<R: PortReclaimer = SystemReclaimer> {
    registry: Arc<ServerRegistry>,
    reclaimer: R,
    timing: LifecycleConfig,
    /// Ids with a start/stop currently in flight
    in_flight: DashMap<String, ()>,
}

impl LifecycleManager<SystemReclaimer> {
    /// Create a manager using the real OS reclaimer
    pub fn new(registry: Arc<ServerRegistry>, timing: LifecycleConfig) -> Arc<Self> {
        Self::with_reclaimer(registry, timing, SystemReclaimer)
    }
}

impl<R: PortReclaimer + 'static> LifecycleManager<R> {
    /// Create a manager with an injected reclaimer
    pub fn with_reclaimer(
        registry: Arc<ServerRegistry>,
        timing: LifecycleConfig,
        reclaimer: R,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            reclaimer,
            timing,
            in_flight: DashMap::new(),
        })
    }

    /// The registry this manager maintains
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Start a server for `config`. Returns true only when the instance is
    /// bound, serving, and registered. Failure at any step leaves the
    /// registry untouched.
    pub async fn start(&self, config: &DirectoryConfig) -> bool {
        let Some(_op) = self.begin_op(&config.id) else {
            debug!(id = %config.id, "Operation already in flight, ignoring start");
            return false;
        };

        if self.registry.has(&config.id) {
            debug!(id = %config.id, "Server already running, ignoring start");
            return false;
        }

        if let Err(reason) = config.validate() {
            warn!(id = %config.id, %reason, "Rejecting start, invalid config");
            return false;
        }

        match tokio::fs::metadata(&config.path).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                warn!(id = %config.id, path = %config.path, "Rejecting start, root is not a directory");
                return false;
            }
        }

        match probe::is_port_in_use(config.port).await {
            Ok(false) => {}
            Ok(true) => {
                // Something this process does not track holds the port,
                // e.g. a stale server from a previous run
                info!(id = %config.id, port = config.port, "Port in use by an untracked process, reclaiming");
                if !self.reclaim_port(config.port).await {
                    warn!(id = %config.id, port = config.port, "Port could not be reclaimed, aborting start");
                    return false;
                }
            }
            Err(e) => {
                warn!(id = %config.id, error = %e, "Rejecting start, port not probeable");
                return false;
            }
        }

        let chain = match rules::compile(&config.proxy_rules, self.timing.upstream_timeout()) {
            Ok(chain) => Arc::new(chain),
            Err(e) => {
                warn!(id = %config.id, error = %e, "Rejecting start, proxy rules did not compile");
                return false;
            }
        };

        let handle = match instance::bind(config, chain, self.timing.bind_wait()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(id = %config.id, port = config.port, error = %e, "Failed to bind static server");
                return false;
            }
        };

        let registered = self.registry.put(ServerInstance {
            id: config.id.clone(),
            port: config.port,
            handle: handle.clone(),
        });
        if !registered {
            // The in-flight gate makes this unreachable in practice, but a
            // bound listener must never outlive a failed registration
            warn!(id = %config.id, "Registry already had an entry, closing fresh instance");
            handle.close(self.timing.graceful_close()).await;
            return false;
        }

        self.spawn_close_watchdog(config.id.clone(), handle);
        info!(id = %config.id, port = config.port, "Server started");
        true
    }

    /// Stop the server for `id`. Always converges: the graceful phase is
    /// raced against a timeout, escalation force-terminates whatever still
    /// holds the port, and the registry entry is removed regardless of
    /// outcome. Returns true when the port is confirmed free.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(_op) = self.begin_op(id) else {
            debug!(id, "Operation already in flight, ignoring stop");
            return false;
        };

        let Some(handle) = self.registry.get_handle(id) else {
            debug!(id, "No server registered, nothing to stop");
            return false;
        };
        let port = handle.port();

        // Graceful phase. A timeout is an escalation trigger, not a failure.
        if !handle.close(self.timing.graceful_close()).await {
            warn!(id, port, "Graceful close timed out, escalating");
        }

        tokio::time::sleep(self.timing.settle_delay()).await;

        let mut port_free = matches!(probe::is_port_in_use(port).await, Ok(false));
        if !port_free {
            warn!(id, port, "Port still bound after close, force-terminating holder");
            if let Err(e) = self.reclaimer.force_free_port(port).await {
                warn!(id, port, error = %e, "Forced termination attempt failed");
            }
            tokio::time::sleep(self.timing.settle_delay()).await;
            port_free = matches!(probe::is_port_in_use(port).await, Ok(false));
        }

        // Unconditional: a zombie entry would block every future start(id)
        self.registry.remove(id);

        if port_free {
            info!(id, port, "Server stopped");
        } else {
            error!(
                id,
                port,
                "Port still occupied after forced termination; OS resources remain outside this process"
            );
        }
        port_free
    }

    /// Whether this process is managing a server for `id`.
    ///
    /// Registry membership only; the OS port state is deliberately not
    /// consulted. This answers the one question callers need for display.
    pub fn status(&self, id: &str) -> bool {
        self.registry.has(id)
    }

    /// Stop every registered server concurrently and wait for all of them
    /// to settle. Failures are tolerated uniformly; this runs once, at
    /// process-exit time.
    pub async fn shutdown_all(&self) {
        let ids = self.registry.all_ids();
        if ids.is_empty() {
            return;
        }

        info!(count = ids.len(), "Stopping all servers");
        let results = futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;

        let unconfirmed = results.iter().filter(|freed| !**freed).count();
        if unconfirmed > 0 {
            warn!(unconfirmed, "Some ports were not confirmed free during shutdown");
        }
    }

    /// One escalation pass against a raw port with no registry entry:
    /// force-terminate the holder, let the OS settle, re-probe.
    async fn reclaim_port(&self, port: u16) -> bool {
        if let Err(e) = self.reclaimer.force_free_port(port).await {
            warn!(port, error = %e, "Forced termination attempt failed");
        }
        tokio::time::sleep(self.timing.settle_delay()).await;
        matches!(probe::is_port_in_use(port).await, Ok(false))
    }

    /// Watch for the instance closing without a stop having been requested
    /// (listener died) and drop its registry entry so the id can be started
    /// again.
    fn spawn_close_watchdog(&self, id: String, handle: InstanceHandle) {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            handle.closed().await;
            if handle.close_requested() {
                // Intentional shutdown; stop() owns the removal
                return;
            }
            if registry.remove_generation(&id, handle.token()) {
                warn!(id = %id, port = handle.port(), "Server closed unexpectedly, removed from registry");
            }
        });
    }

    fn begin_op(&self, id: &str) -> Option<OpGuard<'_>> {
        match self.in_flight.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(OpGuard {
                    ops: &self.in_flight,
                    id: id.to_string(),
                })
            }
        }
    }
}

/// Releases the per-id in-flight slot when an operation finishes,
/// success or failure alike.
struct OpGuard<'a> {
    ops: &'a DashMap<String, ()>,
    id: String,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.ops.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    /// Records reclaim calls without touching any real process
    #[derive(Default, Clone)]
    struct RecordingReclaimer {
        calls: Arc<Mutex<Vec<u16>>>,
    }

    impl PortReclaimer for RecordingReclaimer {
        async fn force_free_port(&self, port: u16) -> anyhow::Result<()> {
            self.calls.lock().push(port);
            Ok(())
        }
    }

    fn short_timing() -> LifecycleConfig {
        LifecycleConfig {
            graceful_close_secs: 1,
            settle_delay_ms: 50,
            bind_wait_secs: 5,
            upstream_timeout_secs: 5,
        }
    }

    fn test_manager() -> (Arc<LifecycleManager<RecordingReclaimer>>, RecordingReclaimer) {
        let reclaimer = RecordingReclaimer::default();
        let manager = LifecycleManager::with_reclaimer(
            Arc::new(ServerRegistry::new()),
            short_timing(),
            reclaimer.clone(),
        );
        (manager, reclaimer)
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn dir_config(id: &str, path: &str, port: u16) -> DirectoryConfig {
        DirectoryConfig {
            id: id.to_string(),
            name: id.to_string(),
            path: path.to_string(),
            port,
            proxy_rules: Vec::new(),
            is_active: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_stop_never_started_id() {
        let (manager, reclaimer) = test_manager();

        assert!(!manager.stop("ghost").await);
        assert!(manager.registry().is_empty());
        assert!(reclaimer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_port() {
        let (manager, _) = test_manager();
        let dir = tempfile::tempdir().unwrap();

        let config = dir_config("a", dir.path().to_str().unwrap(), 80);
        assert!(!manager.start(&config).await);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_missing_root() {
        let (manager, _) = test_manager();
        let port = free_port().await;

        let config = dir_config("a", "/nonexistent/dist/root", port);
        assert!(!manager.start(&config).await);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_bad_proxy_rule() {
        let (manager, _) = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let port = free_port().await;

        let mut config = dir_config("a", dir.path().to_str().unwrap(), port);
        config.proxy_rules.push(crate::config::ProxyRule {
            path_prefix: "/api".to_string(),
            target_origin: "not a url".to_string(),
            rewrite_origin: true,
            verify_tls: false,
        });

        assert!(!manager.start(&config).await);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_round_trip() {
        let (manager, _) = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let port = free_port().await;
        let config = dir_config("a", dir.path().to_str().unwrap(), port);

        assert!(manager.start(&config).await);
        assert!(manager.status("a"));
        assert!(probe::is_port_in_use(port).await.unwrap());

        assert!(manager.stop("a").await);
        assert!(!manager.status("a"));
        assert!(!probe::is_port_in_use(port).await.unwrap());

        // Repeatable without residual state
        assert!(manager.start(&config).await);
        assert!(manager.status("a"));
        assert!(manager.stop("a").await);
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        let (manager, _) = test_manager();
        let dir = tempfile::tempdir().unwrap();
        let port = free_port().await;
        let config = dir_config("a", dir.path().to_str().unwrap(), port);

        assert!(manager.start(&config).await);
        assert!(!manager.start(&config).await);
        assert_eq!(manager.registry().len(), 1);

        manager.stop("a").await;
    }

    #[tokio::test]
    async fn test_port_conflict_between_ids() {
        let (manager, reclaimer) = test_manager();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let port = free_port().await;

        let first = dir_config("a", dir_a.path().to_str().unwrap(), port);
        let second = dir_config("b", dir_b.path().to_str().unwrap(), port);

        assert!(manager.start(&first).await);
        // The second id wants the same port; the recording reclaimer kills
        // nothing, so the reclamation pass cannot free it
        assert!(!manager.start(&second).await);

        assert!(manager.status("a"));
        assert!(!manager.status("b"));
        assert_eq!(manager.registry().len(), 1);
        assert_eq!(reclaimer.calls.lock().as_slice(), &[port]);

        manager.stop("a").await;
    }

    #[tokio::test]
    async fn test_stop_escalates_when_close_times_out() {
        let (manager, reclaimer) = test_manager();

        // A listener that ignores the shutdown signal entirely
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = InstanceHandle::from_parts(port, shutdown_tx, closed_rx);
        manager.registry().put(ServerInstance {
            id: "stuck".to_string(),
            port,
            handle,
        });

        let started = Instant::now();
        let freed = manager.stop("stuck").await;
        let elapsed = started.elapsed();

        // Graceful timeout elapsed, forced termination was attempted, and
        // the entry is gone even though the port is still occupied
        assert!(!freed);
        assert!(!manager.status("stuck"));
        assert_eq!(reclaimer.calls.lock().as_slice(), &[port]);

        // Bounded worst case: graceful close + two settle delays, with
        // headroom for scheduling
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(5));

        drop(closed_tx);
        drop(listener);
    }

    #[tokio::test]
    async fn test_stop_converges_when_close_times_out_but_port_freed() {
        let (manager, reclaimer) = test_manager();
        let port = free_port().await;

        // Closed is never signaled, but nothing actually holds the port
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = InstanceHandle::from_parts(port, shutdown_tx, closed_rx);
        manager.registry().put(ServerInstance {
            id: "half-dead".to_string(),
            port,
            handle,
        });

        assert!(manager.stop("half-dead").await);
        assert!(!manager.status("half-dead"));
        // Port was already free after the graceful phase; no escalation
        assert!(reclaimer.calls.lock().is_empty());

        drop(closed_tx);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let (manager, _) = test_manager();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

        let mut ports = Vec::new();
        for (i, dir) in dirs.iter().enumerate() {
            let port = free_port().await;
            let config = dir_config(&format!("dist-{}", i), dir.path().to_str().unwrap(), port);
            assert!(manager.start(&config).await);
            ports.push(port);
        }
        assert_eq!(manager.registry().len(), 3);

        manager.shutdown_all().await;

        assert!(manager.registry().is_empty());
        for port in ports {
            assert!(!probe::is_port_in_use(port).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_unexpected_close_removes_entry() {
        let (manager, _) = test_manager();
        let port = free_port().await;

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = InstanceHandle::from_parts(port, shutdown_tx, closed_rx);
        manager.registry().put(ServerInstance {
            id: "crashy".to_string(),
            port,
            handle: handle.clone(),
        });
        manager.spawn_close_watchdog("crashy".to_string(), handle);

        // The accept loop dies without any stop having been requested
        closed_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!manager.status("crashy"));
    }

    #[tokio::test]
    async fn test_in_flight_gate() {
        let (manager, _) = test_manager();

        let guard = manager.begin_op("a").expect("first op acquires the slot");
        assert!(manager.begin_op("a").is_none());
        // Other ids are unaffected
        assert!(manager.begin_op("b").is_some());

        drop(guard);
        assert!(manager.begin_op("a").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_stop_on_same_id_is_gated() {
        let (manager, _) = test_manager();

        // Stuck instance makes the first stop slow
        let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        manager.registry().put(ServerInstance {
            id: "slow".to_string(),
            port,
            handle: InstanceHandle::from_parts(port, shutdown_tx, closed_rx),
        });

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.stop("slow").await })
        };
        // Give the first stop time to take the in-flight slot
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!manager.stop("slow").await);
        let _ = first.await;

        drop(closed_tx);
        drop(listener);
    }
}
