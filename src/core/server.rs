//! The orchestrator: owns the route groups, the certificate authority,
//! the listeners and the background workers, and drives them through the
//! server lifecycle.
//!
//! Assembly is single-threaded and fails fast: groups are folded into a
//! declaration-ordered port map, one listener per port is constructed
//! (which completes every TLS registration), and all routes are bound
//! before anything is spawned. Launch spawns one supervised task per
//! listener and per worker, then starts the authority's fallback
//! responders. A failing or panicking task never cancels its siblings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eyre::{Result, eyre};
use tokio::task::JoinHandle;

use crate::adapters::listener::Listener;
use crate::config::models::ServiceConfig;
use crate::core::authority::CertificateAuthority;
use crate::core::group::{Middleware, RouteGroup};
use crate::ports::auth::AuthStrategy;
use crate::ports::worker::Worker;
use crate::utils::supervise::{combine_errors, spawn_supervised};

/// Lifecycle phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting route groups and workers; nothing spawned yet.
    Assembling,
    /// Spawning listener and worker tasks.
    Launching,
    /// All tasks spawned and being awaited.
    Running,
    /// `close()` in progress.
    Draining,
    /// `close()` finished.
    Closed,
}

/// Route groups and workers accumulated before launch. Consumed by the
/// first `run()`.
struct Assembly {
    root: RouteGroup,
    groups: Vec<RouteGroup>,
    workers: Vec<Arc<dyn Worker>>,
}

/// Handles that outlive launch, shared with `close()`.
#[derive(Default)]
struct Running {
    listeners: Vec<Arc<Listener>>,
    workers: Vec<Arc<dyn Worker>>,
    responders: Vec<JoinHandle<()>>,
    supervised: usize,
}

/// Multi-port HTTP(S) server over one shared certificate authority.
pub struct Server {
    authority: Arc<CertificateAuthority>,
    default_port: u16,
    phase: Mutex<Phase>,
    /// Set once by the first `close()` and never cleared; `run()` checks
    /// it after launch so a close that found nothing to drain still ends
    /// the run.
    closing: AtomicBool,
    assembly: Mutex<Option<Assembly>>,
    running: Mutex<Running>,
}

impl Server {
    /// Build a server from the process configuration: the `server`
    /// section becomes the root group, each `listeners` entry becomes a
    /// declared group, and the `acme` section configures the authority.
    pub fn new(config: ServiceConfig) -> Self {
        let authority = Arc::new(CertificateAuthority::new(config.acme.clone()));
        let root = RouteGroup::with_config(config.server.clone());
        let groups = config
            .listeners
            .iter()
            .map(|listener_config| RouteGroup::with_config(listener_config.clone()))
            .collect();

        Self {
            authority,
            default_port: config.server.port,
            phase: Mutex::new(Phase::Assembling),
            closing: AtomicBool::new(false),
            assembly: Mutex::new(Some(Assembly {
                root,
                groups,
                workers: Vec::new(),
            })),
            running: Mutex::new(Running::default()),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.lock_phase()
    }

    /// The shared certificate authority (constructed here, injected into
    /// every listener).
    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Supervised tasks plus responder tasks currently accounted for.
    pub fn task_count(&self) -> usize {
        let running = self.lock_running();
        running.supervised + running.responders.len()
    }

    /// Declare a route group for a port (0 targets the default port) and
    /// configure it in place.
    pub fn route_group(&self, port: u16, configure: impl FnOnce(&mut RouteGroup)) {
        let mut group = RouteGroup::new(port);
        configure(&mut group);
        self.add_group(group);
    }

    /// Append an externally built group in declaration order.
    pub fn add_group(&self, group: RouteGroup) {
        match self.lock_assembly().as_mut() {
            Some(assembly) => assembly.groups.push(group),
            None => tracing::warn!("route group declared after startup; ignored"),
        }
    }

    /// Register a background worker, launched alongside the listeners.
    pub fn add_worker(&self, worker: impl Worker + 'static) {
        match self.lock_assembly().as_mut() {
            Some(assembly) => assembly.workers.push(Arc::new(worker)),
            None => tracing::warn!("worker registered after startup; ignored"),
        }
    }

    pub fn get<H, T>(&self, path: &str, handler: H)
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.with_root(|root| {
            root.get(path, handler);
        });
    }

    pub fn post<H, T>(&self, path: &str, handler: H)
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.with_root(|root| {
            root.post(path, handler);
        });
    }

    pub fn get_protected<H, T>(&self, path: &str, handler: H)
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.with_root(|root| {
            root.get_protected(path, handler);
        });
    }

    pub fn post_protected<H, T>(&self, path: &str, handler: H)
    where
        H: axum::handler::Handler<T, ()>,
        T: 'static,
    {
        self.with_root(|root| {
            root.post_protected(path, handler);
        });
    }

    /// Append a middleware to the root group's chain.
    pub fn middleware(&self, middleware: Middleware) {
        self.with_root(|root| {
            root.middleware(middleware);
        });
    }

    /// Set the root group's authentication strategy (first one wins).
    pub fn authentication(&self, strategy: impl AuthStrategy + 'static) {
        self.with_root(|root| {
            root.authentication(strategy);
        });
    }

    /// Assemble, launch, and wait for every listener and worker task.
    ///
    /// Returns the first failure in task-submission order, after all
    /// tasks have ended. Sibling tasks are never cancelled when one
    /// fails; a panicking task is converted into that task's error.
    /// Running an already-closed server is a no-op, and a `close()` that
    /// lands while the launch is still in flight drains the freshly
    /// spawned tasks before they are awaited.
    pub async fn run(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (listeners, workers) = self.assemble()?;

        self.set_phase(Phase::Launching);
        let mut tasks: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
        for listener in &listeners {
            let label = format!("listener {}", listener.port());
            let listener = Arc::clone(listener);
            tasks.push((
                label.clone(),
                spawn_supervised(label, async move { Ok(listener.run().await?) }),
            ));
        }
        for worker in &workers {
            let label = format!("worker '{}'", worker.name());
            let worker = Arc::clone(worker);
            tasks.push((
                label.clone(),
                spawn_supervised(label, async move { worker.run().await }),
            ));
        }

        // Every TLS registration happened during assembly, so the
        // authority now knows which of ports 80/443 are unclaimed.
        let responders = self.authority.start();

        {
            let mut running = self.lock_running();
            running.listeners = listeners;
            running.workers = workers;
            running.responders.extend(responders);
            running.supervised = tasks.len();
        }

        // A close may have run to completion while the launch was still
        // in flight, finding nothing to drain. Re-checking the closing
        // flag after the members are stored detects that lost race, and
        // the freshly stored members are drained here instead of serving
        // past the shutdown.
        let raced_close = if self.closing.load(Ordering::SeqCst) {
            true
        } else {
            self.set_phase(Phase::Running);
            // The flag may have been set between the load and the phase
            // change; the second load keeps the drain hand-off exact.
            self.closing.load(Ordering::SeqCst)
        };
        let mut drain_error = None;
        if raced_close {
            tracing::warn!("close requested during launch; draining immediately");
            drain_error = self.drain().await.err();
            self.set_phase(Phase::Closed);
        }

        let mut first_error: Option<eyre::Report> = None;
        for (label, task) in tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(join_error) => Err(eyre!("task '{label}' could not be joined: {join_error}")),
            };
            if let Err(error) = outcome {
                tracing::error!(task = %label, error = %error, "task ended with error");
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }

        match first_error.or(drain_error) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Close every listener and worker, abort the responder tasks, and
    /// aggregate all failures into one error. Idempotent; callable
    /// before, during, or after `run()` from any task.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.set_phase(Phase::Draining);
        let result = self.drain().await;
        self.set_phase(Phase::Closed);
        result
    }

    /// Close everything currently recorded as running. Members are taken
    /// out of the shared state under its lock, so however `close()` and
    /// the raced-close path in `run()` interleave, each member is closed
    /// exactly once.
    async fn drain(&self) -> Result<()> {
        let (listeners, workers, responders) = {
            let mut running = self.lock_running();
            (
                std::mem::take(&mut running.listeners),
                std::mem::take(&mut running.workers),
                std::mem::take(&mut running.responders),
            )
        };

        let mut errors = Vec::new();
        for listener in &listeners {
            tracing::info!(port = listener.port(), "closing listener");
            listener.close();
        }
        for worker in &workers {
            if let Err(error) = worker.close().await {
                tracing::error!(worker = %worker.name(), error = %error, "worker close failed");
                errors.push(error.wrap_err(format!("worker '{}' close failed", worker.name())));
            }
        }
        for responder in responders {
            responder.abort();
        }

        combine_errors("shutdown", errors)
    }

    /// Fold groups into the port map and construct bound listeners.
    ///
    /// The root group merges into the first declared group targeting
    /// port 0 or the root port; otherwise it is appended. Remaining
    /// port-0 sentinels resolve to the default port. Any binding failure
    /// aborts startup with nothing spawned.
    fn assemble(&self) -> Result<(Vec<Arc<Listener>>, Vec<Arc<dyn Worker>>)> {
        let Assembly {
            root,
            mut groups,
            workers,
        } = self
            .lock_assembly()
            .take()
            .ok_or_else(|| eyre!("server already started"))?;

        let root_port = root.port();
        let mut root = Some(root);
        for group in &mut groups {
            if group.port() == 0 || group.port() == root_port {
                if let Some(root) = root.take() {
                    group.merge(root);
                }
                break;
            }
        }
        if let Some(root) = root {
            groups.push(root);
        }

        for group in &mut groups {
            group.resolve_port(self.default_port);
        }

        let mut port_map: Vec<RouteGroup> = Vec::new();
        for group in groups {
            match port_map
                .iter_mut()
                .find(|existing| existing.port() == group.port())
            {
                Some(existing) => existing.merge(group),
                None => port_map.push(group),
            }
        }

        let mut listeners = Vec::new();
        for group in port_map {
            let mut config = group.port_config().cloned().unwrap_or_default();
            config.port = group.port();
            let listener = Arc::new(Listener::new(config, Arc::clone(&self.authority)));
            listener.bind_routes(group)?;
            listeners.push(listener);
        }

        Ok((listeners, workers))
    }

    fn with_root(&self, configure: impl FnOnce(&mut RouteGroup)) {
        match self.lock_assembly().as_mut() {
            Some(assembly) => configure(&mut assembly.root),
            None => tracing::warn!("root route declared after startup; ignored"),
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.lock_phase() = phase;
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_assembly(&self) -> MutexGuard<'_, Option<Assembly>> {
        self.assembly.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{PortConfig, SslConfig};

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn server_with(listeners: Vec<PortConfig>) -> Server {
        Server::new(ServiceConfig {
            listeners,
            ..ServiceConfig::default()
        })
    }

    #[test]
    fn phase_starts_at_assembling() {
        let server = server_with(Vec::new());
        assert_eq!(server.phase(), Phase::Assembling);
    }

    #[tokio::test]
    async fn close_before_run_is_a_clean_noop() {
        let server = server_with(Vec::new());
        assert!(server.close().await.is_ok());
        assert_eq!(server.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = server_with(Vec::new());
        assert!(server.close().await.is_ok());
        assert!(server.close().await.is_ok());
        assert_eq!(server.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn run_after_a_completed_close_spawns_nothing() {
        let server = server_with(Vec::new());
        server.get("/late", ok_handler);

        server.close().await.unwrap();
        assert!(server.run().await.is_ok());
        assert_eq!(server.task_count(), 0);
    }

    #[test]
    fn root_helpers_accumulate_on_the_root_group() {
        let server = server_with(Vec::new());
        server.get("/a", ok_handler);
        server.post("/b", ok_handler);

        let assembly = server.lock_assembly();
        let root = &assembly.as_ref().unwrap().root;
        assert_eq!(root.bindings().len(), 2);
    }

    #[test]
    fn assembly_folds_groups_into_one_listener_per_port() {
        let server = server_with(vec![PortConfig::for_port(8081)]);
        server.route_group(8081, |group| {
            group.get("/a", ok_handler);
        });
        server.route_group(0, |group| {
            group.get("/b", ok_handler);
        });

        let (listeners, _) = server.assemble().unwrap();
        let ports: Vec<u16> = listeners.iter().map(|l| l.port()).collect();
        assert_eq!(ports, vec![8081, 9009]);
    }

    #[test]
    fn the_root_group_merges_into_the_first_sentinel_group() {
        let server = server_with(Vec::new());
        server.get("/root", ok_handler);
        server.route_group(0, |group| {
            group.get("/declared", ok_handler);
        });

        let (listeners, _) = server.assemble().unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].port(), 9009);
    }

    #[test]
    fn a_lone_root_group_still_gets_a_listener() {
        let server = server_with(Vec::new());
        server.get("/only", ok_handler);

        let (listeners, _) = server.assemble().unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].port(), 9009);
    }

    #[test]
    fn assembling_twice_is_an_error() {
        let server = server_with(Vec::new());
        assert!(server.assemble().is_ok());
        let err = server.assemble().unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[test]
    fn tls_registrations_complete_during_assembly() {
        let server = server_with(vec![PortConfig {
            port: 9443,
            ssl: SslConfig {
                enabled: true,
                hosts: vec!["api.example.com".to_string()],
            },
            ..PortConfig::default()
        }]);

        server.assemble().unwrap();
        assert_eq!(
            server.authority().hosts(),
            vec!["api.example.com".to_string()]
        );
        assert_eq!(server.authority().ports(), vec![9443]);
    }

    #[test]
    fn duplicate_routes_abort_assembly() {
        let server = server_with(Vec::new());
        server.get("/dup", ok_handler);
        server.route_group(0, |group| {
            group.get("/dup", ok_handler);
        });

        assert!(server.assemble().is_err());
    }
}
