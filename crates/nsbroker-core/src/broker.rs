//! The broker instance.
//!
//! One [`Broker`] owns the namespace registry, the execution engine and the
//! shutdown signal. Every connection handler gets an `Arc<Broker>`; nothing
//! is process-global, so tests run several brokers side by side.

use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::engine::ExecutionEngine;
use crate::evaluator::{Evaluator, ScriptEvaluator};
use crate::protocol::{AsyncHandle, ExecRequest, ExecResult, Message};
use crate::registry::{ConnectionId, Lookup, Namespace, Registry, RemotePeer};
use crate::{BrokerError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared state behind every connection of one server.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    registry: Registry,
    engine: ExecutionEngine,
    shutdown: watch::Sender<bool>,
    next_connection: AtomicU64,
}

impl Broker {
    /// A broker running code with the built-in [`ScriptEvaluator`].
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Self::with_evaluator(config, Arc::new(ScriptEvaluator))
    }

    pub fn with_evaluator(config: BrokerConfig, evaluator: Arc<dyn Evaluator>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry: Registry::new(),
            engine: ExecutionEngine::new(evaluator),
            shutdown,
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Local namespace for Exec traffic, created if the policy allows.
    pub fn resolve_local(&self, name: &str) -> Result<Arc<Namespace>> {
        self.registry
            .get_or_create(name, self.config.may_create(name))
    }

    /// Run `request` in `namespace` on a blocking thread.
    pub async fn execute(
        self: &Arc<Self>,
        namespace: Arc<Namespace>,
        request: ExecRequest,
        connection: Option<ConnectionId>,
    ) -> ExecResult {
        let broker = Arc::clone(self);
        let name = namespace.name().to_string();
        tokio::task::spawn_blocking(move || {
            broker
                .engine
                .execute(&broker.registry, &namespace, &request, connection)
        })
        .await
        .unwrap_or_else(|e| {
            error!("execution in \"{}\" aborted: {}", name, e);
            ExecResult::unreachable(format!("execution aborted: {}", e))
        })
    }

    /// Start `request` in the background and return its handle at once.
    ///
    /// The handle is registered before the work is spawned. There is no
    /// cancellation.
    pub fn submit_async(
        self: &Arc<Self>,
        namespace: Arc<Namespace>,
        request: ExecRequest,
        connection: Option<ConnectionId>,
    ) -> AsyncHandle {
        let handle = namespace.results().begin();
        let broker = Arc::clone(self);
        let task_handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                broker
                    .engine
                    .execute(&broker.registry, &namespace, &request, connection)
            }))
            .unwrap_or_else(|_| {
                error!("async execution {} panicked", task_handle);
                ExecResult::unreachable("execution aborted: evaluator panicked")
            });
            namespace.results().complete(&task_handle, result);
        });
        handle
    }

    /// Force-create `name` and run `code` in it (the `init` directive).
    pub async fn init_namespace(self: &Arc<Self>, name: &str, code: &str) -> Result<ExecResult> {
        let ns = self.registry.get_or_create(name, true)?;
        let request = ExecRequest::new(name).with_code(code);
        let result = self.execute(ns, request, None).await;
        match &result.code_exception {
            Some(e) => warn!("init of namespace \"{}\" failed:\n{}", name, e),
            None => info!("initialized namespace \"{}\"", name),
        }
        Ok(result)
    }

    /// Run hook code in `namespace`, logging failures.
    async fn run_hooks(self: &Arc<Self>, namespace: &Arc<Namespace>, hooks: Vec<String>, what: &str) {
        for code in hooks {
            let request = ExecRequest::new(namespace.name()).with_code(code);
            let result = self.execute(Arc::clone(namespace), request, None).await;
            if let Some(e) = result.code_exception {
                warn!("{} hook in \"{}\" failed:\n{}", what, namespace.name(), e);
            }
        }
    }

    /// Remove a namespace. Local namespaces run their on-drop hooks first.
    pub async fn drop_namespace(self: &Arc<Self>, name: &str) -> Result<()> {
        match self.registry.lookup(name) {
            Lookup::Local(ns) => {
                let hooks = ns.drop_hooks();
                self.run_hooks(&ns, hooks, "drop").await;
                self.registry.drop_local(name);
                Ok(())
            }
            Lookup::Remote(_) => {
                self.registry.drop_remote(name);
                Ok(())
            }
            Lookup::Absent => Err(BrokerError::namespace(format!(
                "unknown namespace \"{}\"",
                name
            ))),
        }
    }

    /// Clean up after a connection that ended while serving.
    ///
    /// Runs the disconnect hooks due for it in every local namespace.
    pub async fn connection_lost(self: &Arc<Self>, connection: ConnectionId) {
        let used = self.registry.remove_connection(connection);
        debug!("connection {} closed, used {:?}", connection, used);
        for name in self.registry.local_names() {
            if let Lookup::Local(ns) = self.registry.lookup(&name) {
                let hooks = ns.take_disconnect_hooks(connection);
                if !hooks.is_empty() {
                    self.run_hooks(&ns, hooks, "disconnect").await;
                }
            }
        }
    }

    /// Forget every namespace reached through a peer that stopped answering.
    pub fn peer_lost(&self, peer: &RemotePeer) -> Vec<String> {
        let dropped = self.registry.drop_peer(peer.id());
        if !dropped.is_empty() {
            warn!("lost connection to {}, dropped {:?}", peer.label(), dropped);
        }
        dropped
    }

    /// Adopt `name` from the broker at the other end of `conn`.
    ///
    /// Asks the owner for the namespace, then routes all traffic for `name`
    /// through `conn`.
    pub async fn import_namespace(&self, name: &str, mut conn: Connection) -> Result<()> {
        if !matches!(self.registry.lookup(name), Lookup::Absent) {
            return Err(BrokerError::namespace(format!(
                "namespace \"{}\" already exists",
                name
            )));
        }
        conn.send(&Message::RequestNamespace {
            namespace: name.to_string(),
        })
        .await?;
        match conn.recv_resolved().await? {
            Some(Message::NamespaceStatus { ok: true, .. }) => {}
            Some(Message::NamespaceStatus { error, .. }) => {
                return Err(BrokerError::namespace(error.unwrap_or_else(|| {
                    format!("import of \"{}\" refused", name)
                })))
            }
            Some(other) => {
                return Err(BrokerError::protocol(format!(
                    "expected NamespaceStatus, got {}",
                    other.kind()
                )))
            }
            None => {
                return Err(BrokerError::ConnectionLost {
                    peer: conn.peer().to_string(),
                })
            }
        }
        self.registry
            .register_remote(name, Arc::new(RemotePeer::from_connection(conn)))
    }

    /// Force-release the lock of a local namespace.
    ///
    /// Returns the `AdminStatus` pair: `0` unlocked, `1` already unlocked,
    /// `-1` unknown namespace.
    pub fn unlock_namespace(&self, name: &str) -> (i32, String) {
        match self.registry.lookup(name) {
            Lookup::Local(ns) => {
                if ns.lock().force_unlock() {
                    warn!("force-unlocked namespace \"{}\"", name);
                    (0, "unlocked".to_string())
                } else {
                    (1, "already unlocked".to_string())
                }
            }
            Lookup::Remote(_) | Lookup::Absent => {
                (-1, format!("unknown namespace \"{}\"", name))
            }
        }
    }

    pub fn request_shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that flips to `true` once shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Drop remote proxies, then local namespaces (running on-drop hooks).
    pub async fn cleanup(self: &Arc<Self>) {
        for name in self.registry.remote_names() {
            self.registry.drop_remote(&name);
        }
        for name in self.registry.local_names() {
            if let Err(e) = self.drop_namespace(&name).await {
                debug!("cleanup of \"{}\": {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{ReadOutcome, ReadTimeout};
    use crate::value::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_runs_in_namespace() {
        let broker = Broker::new(BrokerConfig::default());
        let ns = broker.resolve_local("n").unwrap();
        let rv = broker
            .execute(ns, ExecRequest::new("n").with_code("x = 2").with_expr("x * 21"), None)
            .await;
        assert_eq!(rv, ExecResult::ok(Value::Int(42)));
    }

    #[tokio::test]
    async fn test_resolve_local_honours_policy() {
        let broker = Broker::new(BrokerConfig::default().allow_new_namespaces(false));
        assert!(broker.resolve_local("n").is_err());
        assert!(broker.registry().local_names().is_empty());

        let broker = Broker::new(BrokerConfig::default().with_local_whitelist(["ok"]));
        assert!(broker.resolve_local("ok").is_ok());
        assert!(broker.resolve_local("other").is_err());
    }

    #[tokio::test]
    async fn test_submit_async_registers_before_running() {
        let broker = Broker::new(BrokerConfig::default());
        let ns = broker.resolve_local("n").unwrap();
        let handle = broker.submit_async(
            ns.clone(),
            ExecRequest::new("n").with_code("sleep(0.2)").with_expr("'done'"),
            None,
        );
        assert!(ns.results().contains(&handle.result_id));
        assert!(ns.results().poll().is_empty());

        let ns2 = ns.clone();
        let id = handle.result_id.clone();
        let outcome = tokio::task::spawn_blocking(move || ns2.results().read(&id, ReadTimeout::Block))
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Ready(ExecResult::ok(Value::from("done"))));
    }

    #[tokio::test]
    async fn test_drop_namespace_runs_hooks() {
        let broker = Broker::new(BrokerConfig::default());
        broker.resolve_local("other").unwrap();
        let ns = broker.resolve_local("n").unwrap();
        broker
            .execute(
                ns.clone(),
                ExecRequest::new("n").with_code("broker.exec_on_drop('dropped = true')"),
                None,
            )
            .await;

        broker.drop_namespace("n").await.unwrap();
        assert_eq!(ns.get("dropped"), Some(Value::Bool(true)));
        assert_eq!(broker.registry().local_names(), vec!["other".to_string()]);
        assert!(broker.drop_namespace("n").await.is_err());
    }

    #[tokio::test]
    async fn test_connection_lost_runs_disconnect_hooks() {
        let broker = Broker::new(BrokerConfig::default());
        let ns = broker.resolve_local("n").unwrap();
        broker
            .execute(
                ns.clone(),
                ExecRequest::new("n").with_code("broker.exec_on_disconnect('bye = 1')"),
                Some(3),
            )
            .await;

        broker.connection_lost(4).await;
        assert!(ns.get("bye").is_none());
        broker.connection_lost(3).await;
        assert_eq!(ns.get("bye"), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn test_unlock_namespace() {
        let broker = Broker::new(BrokerConfig::default());
        let ns = broker.resolve_local("n").unwrap();
        assert_eq!(broker.unlock_namespace("n").0, 1);
        let _guard = ns.lock().acquire();
        assert_eq!(broker.unlock_namespace("n"), (0, "unlocked".to_string()));
        assert_eq!(broker.unlock_namespace("zz").0, -1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_and_cleanup() {
        let broker = Broker::new(BrokerConfig::default());
        let mut signal = broker.shutdown_signal();
        broker.resolve_local("a").unwrap();
        broker.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), signal.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();
        assert!(broker.is_shutting_down());

        broker.cleanup().await;
        assert!(broker.registry().local_names().is_empty());
    }
}
