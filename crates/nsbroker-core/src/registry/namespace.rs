//! Local namespaces: binding table, execution lock, result table, hooks.

use crate::results::ResultStore;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one connection for the lifetime of the process.
pub type ConnectionId = u64;

/// The per-namespace execution lock.
///
/// Unlike a `Mutex<()>`, an administrator can force-release it while a
/// holder is still running (`AdminCommand unlock`). Each acquisition gets a
/// token so a stale guard never releases somebody else's hold.
#[derive(Debug, Default)]
pub struct NamespaceLock {
    holder: Mutex<Option<u64>>,
    released: Condvar,
    next_token: AtomicU64,
}

/// Releases the [`NamespaceLock`] on drop.
#[must_use = "the namespace is unlocked as soon as the guard is dropped"]
pub struct NamespaceLockGuard<'a> {
    lock: &'a NamespaceLock,
    token: u64,
}

impl NamespaceLock {
    /// Block until the lock is free, then take it.
    pub fn acquire(&self) -> NamespaceLockGuard<'_> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.released.wait(&mut holder);
        }
        *holder = Some(token);
        NamespaceLockGuard { lock: self, token }
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Release regardless of holder. Returns `false` if it was not held.
    pub fn force_unlock(&self) -> bool {
        let mut holder = self.holder.lock();
        let was_locked = holder.take().is_some();
        if was_locked {
            self.released.notify_one();
        }
        was_locked
    }
}

impl Drop for NamespaceLockGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.lock.holder.lock();
        if *holder == Some(self.token) {
            *holder = None;
            self.lock.released.notify_one();
        }
    }
}

/// Code to run in a namespace when a connection ends.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectHook {
    /// `None` runs on every disconnect and is never removed.
    pub connection: Option<ConnectionId>,
    pub code: String,
}

/// A locally owned execution environment.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    bindings: Mutex<HashMap<String, Value>>,
    lock: NamespaceLock,
    results: ResultStore,
    on_disconnect: Mutex<Vec<DisconnectHook>>,
    on_drop: Mutex<Vec<String>>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            results: ResultStore::new(name.clone()),
            name,
            bindings: Mutex::new(HashMap::new()),
            lock: NamespaceLock::default(),
            on_disconnect: Mutex::new(Vec::new()),
            on_drop: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> &NamespaceLock {
        &self.lock
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    // Each binding access takes the table mutex on its own, so unlocked
    // executions interleave between accesses but never corrupt the table.

    pub fn get(&self, name: &str) -> Option<Value> {
        self.bindings.lock().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.bindings.lock().insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.bindings.lock().remove(name)
    }

    /// Names currently bound, sorted.
    pub fn binding_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn add_disconnect_hook(&self, hook: DisconnectHook) {
        self.on_disconnect.lock().push(hook);
    }

    /// Hooks to run because `connection` ended.
    ///
    /// Hooks registered by that connection are removed; hooks registered for
    /// any connection stay.
    pub fn take_disconnect_hooks(&self, connection: ConnectionId) -> Vec<String> {
        let mut hooks = self.on_disconnect.lock();
        let due: Vec<String> = hooks
            .iter()
            .filter(|h| h.connection.is_none() || h.connection == Some(connection))
            .map(|h| h.code.clone())
            .collect();
        hooks.retain(|h| h.connection != Some(connection));
        due
    }

    pub fn add_drop_hook(&self, code: impl Into<String>) {
        self.on_drop.lock().push(code.into());
    }

    pub fn drop_hooks(&self) -> Vec<String> {
        self.on_drop.lock().clone()
    }
}
