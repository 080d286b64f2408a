//! Async result store.
//!
//! One store per namespace. [`ResultStore::begin`] inserts the `InProgress`
//! entry before any work is spawned, so the returned handle is valid at once.
//! Reads consume ready entries; polls never do.

use crate::protocol::{AsyncHandle, ExecResult};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

static NEXT_RESULT: AtomicU64 = AtomicU64::new(1);

/// State of one async result.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncState {
    InProgress,
    Ready(ExecResult),
}

/// Outcome of [`ResultStore::read`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Ready(ExecResult),
    Busy,
    NotFound,
}

/// How long a read may wait for an in-progress result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTimeout {
    NonBlocking,
    Block,
    Wait(Duration),
}

impl ReadTimeout {
    /// `0` is non-blocking, negative blocks, positive waits that many seconds.
    pub fn from_secs(secs: f64) -> Self {
        if secs < 0.0 || secs == f64::INFINITY {
            ReadTimeout::Block
        } else if secs == 0.0 || !secs.is_finite() {
            ReadTimeout::NonBlocking
        } else {
            ReadTimeout::Wait(Duration::from_secs_f64(secs))
        }
    }
}

#[derive(Debug)]
pub struct ResultStore {
    namespace: String,
    entries: Mutex<HashMap<String, AsyncState>>,
    ready: Condvar,
}

impl ResultStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        }
    }

    fn next_id() -> String {
        let now = Utc::now();
        format!(
            "{}.{:06}-{}",
            now.timestamp(),
            now.timestamp_subsec_micros(),
            NEXT_RESULT.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Reserve a result slot in the `InProgress` state.
    pub fn begin(&self) -> AsyncHandle {
        let id = Self::next_id();
        self.entries
            .lock()
            .insert(id.clone(), AsyncState::InProgress);
        debug!("async result {} started in \"{}\"", id, self.namespace);
        AsyncHandle::new(self.namespace.clone(), id)
    }

    /// Store the final result and wake any blocked readers.
    pub fn complete(&self, handle: &AsyncHandle, result: ExecResult) {
        self.entries
            .lock()
            .insert(handle.result_id.clone(), AsyncState::Ready(result));
        self.ready.notify_all();
        debug!(
            "async result {} ready in \"{}\"",
            handle.result_id, self.namespace
        );
    }

    /// Handles whose results are ready, sorted by id.
    pub fn poll(&self) -> Vec<AsyncHandle> {
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, state)| matches!(state, AsyncState::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|id| AsyncHandle::new(self.namespace.clone(), id))
            .collect()
    }

    pub fn contains(&self, result_id: &str) -> bool {
        self.entries.lock().contains_key(result_id)
    }

    /// Read and remove a ready result, waiting according to `timeout`.
    pub fn read(&self, result_id: &str, timeout: ReadTimeout) -> ReadOutcome {
        let deadline = match timeout {
            ReadTimeout::Wait(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut entries = self.entries.lock();
        loop {
            match entries.get(result_id) {
                None => return ReadOutcome::NotFound,
                Some(AsyncState::Ready(_)) => {
                    return match entries.remove(result_id) {
                        Some(AsyncState::Ready(result)) => ReadOutcome::Ready(result),
                        _ => ReadOutcome::NotFound,
                    };
                }
                Some(AsyncState::InProgress) => match timeout {
                    ReadTimeout::NonBlocking => return ReadOutcome::Busy,
                    ReadTimeout::Block => self.ready.wait(&mut entries),
                    ReadTimeout::Wait(_) => {
                        let Some(deadline) = deadline else {
                            return ReadOutcome::Busy;
                        };
                        if self.ready.wait_until(&mut entries, deadline).timed_out()
                            && matches!(entries.get(result_id), Some(AsyncState::InProgress))
                        {
                            return ReadOutcome::Busy;
                        }
                    }
                },
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::Arc;

    #[test]
    fn test_begin_is_pollable_but_not_ready() {
        let store = ResultStore::new("n");
        let handle = store.begin();
        assert_eq!(handle.namespace, "n");
        assert!(store.contains(&handle.result_id));
        assert!(store.poll().is_empty());
        assert_eq!(
            store.read(&handle.result_id, ReadTimeout::NonBlocking),
            ReadOutcome::Busy
        );
    }

    #[test]
    fn test_read_consumes_but_poll_does_not() {
        let store = ResultStore::new("n");
        let handle = store.begin();
        store.complete(&handle, ExecResult::ok(Value::Int(3)));

        assert_eq!(store.poll(), vec![handle.clone()]);
        assert_eq!(store.poll(), vec![handle.clone()]);
        assert_eq!(
            store.read(&handle.result_id, ReadTimeout::NonBlocking),
            ReadOutcome::Ready(ExecResult::ok(Value::Int(3)))
        );
        assert_eq!(
            store.read(&handle.result_id, ReadTimeout::NonBlocking),
            ReadOutcome::NotFound
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_ids_are_distinct() {
        let store = ResultStore::new("n");
        let a = store.begin();
        let b = store.begin();
        assert_ne!(a.result_id, b.result_id);
    }

    #[test]
    fn test_blocking_read_wakes_on_complete() {
        let store = Arc::new(ResultStore::new("n"));
        let handle = store.begin();

        let writer = {
            let store = store.clone();
            let handle = handle.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                store.complete(&handle, ExecResult::ok(Value::from("done")));
            })
        };

        let outcome = store.read(&handle.result_id, ReadTimeout::Block);
        writer.join().unwrap();
        assert_eq!(outcome, ReadOutcome::Ready(ExecResult::ok(Value::from("done"))));
    }

    #[test]
    fn test_timed_read_reports_busy() {
        let store = ResultStore::new("n");
        let handle = store.begin();
        let started = Instant::now();
        let outcome = store.read(
            &handle.result_id,
            ReadTimeout::Wait(Duration::from_millis(50)),
        );
        assert_eq!(outcome, ReadOutcome::Busy);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_from_secs() {
        assert_eq!(ReadTimeout::from_secs(0.0), ReadTimeout::NonBlocking);
        assert_eq!(ReadTimeout::from_secs(-1.0), ReadTimeout::Block);
        assert_eq!(
            ReadTimeout::from_secs(1.5),
            ReadTimeout::Wait(Duration::from_millis(1500))
        );
    }
}
