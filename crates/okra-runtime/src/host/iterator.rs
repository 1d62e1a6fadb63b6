//! Per-worker iterator table (§4.4): server-side cursors created by
//! list/subscribe capability verbs, advanced via `host_next`, closed via
//! `host_close_iterator`. Iterator ids are unique per worker and never
//! shared across workers; a periodic sweep closes iterators idle beyond a
//! configurable threshold.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};

use crate::error::{Error, PolicyError, Result};

pub type ValueStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

struct IteratorEntry {
    stream: ValueStream,
    last_accessed: Instant,
}

/// Tombstone left behind by an iterator that drained to `hasMore=false`.
/// Kept around (distinct from "never registered") so a subsequent `close`
/// is a no-op rather than a policy error, and swept on the same idle
/// timeout as live entries so the table doesn't grow unbounded.
struct ExhaustedMarker {
    since: Instant,
}

struct TableInner {
    entries: HashMap<String, IteratorEntry>,
    exhausted: HashMap<String, ExhaustedMarker>,
}

/// Owned by exactly one worker for its lifetime (§3). `next`/`close` never
/// block on other workers: the table is guarded by its own lock, never
/// shared outside the owning [`crate::host::HostApiSet`].
pub struct IteratorTable {
    inner: Mutex<TableInner>,
    next_id: AtomicU64,
}

impl Default for IteratorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IteratorTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                exhausted: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a freshly created stream and returns its iterator id.
    pub fn register(&self, stream: ValueStream) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("iter-{id}");
        self.inner.lock().entries.insert(
            id.clone(),
            IteratorEntry {
                stream,
                last_accessed: Instant::now(),
            },
        );
        id
    }

    /// Advances the iterator `id`. Returns `(value, has_more)`; `value` is
    /// `None` and `has_more` is `false` once the underlying stream is
    /// exhausted, at which point the entry is replaced by a tombstone so a
    /// later `next`/`close` on the same id doesn't look unknown. Ids that
    /// were never registered (or whose tombstone has since been swept)
    /// surface as [`PolicyError::UnknownIterator`].
    pub async fn next(&self, id: &str) -> Result<(Option<Value>, bool)> {
        // Take the entry out so the lock isn't held across the `.await`
        // (§5 locking discipline: locks are leaves, never held during a
        // blocking call).
        let taken = {
            let mut inner = self.inner.lock();
            inner.entries.remove(id)
        };

        let Some(mut entry) = taken else {
            // Already exhausted (and not yet swept): repeatedly asking for
            // more is idempotent, not an error.
            if self.inner.lock().exhausted.contains_key(id) {
                return Ok((None, false));
            }
            return Err(Error::Policy(PolicyError::UnknownIterator(id.to_string())));
        };

        let value = entry.stream.next().await;
        entry.last_accessed = Instant::now();
        let has_more = value.is_some();

        let mut inner = self.inner.lock();
        if has_more {
            inner.entries.insert(id.to_string(), entry);
        } else {
            inner.exhausted.insert(
                id.to_string(),
                ExhaustedMarker {
                    since: Instant::now(),
                },
            );
        }

        Ok((value, has_more))
    }

    /// Releases an iterator. A no-op for an id that was already closed by
    /// exhaustion (`hasMore=false` followed by `close` is a no-op per §8);
    /// an id that was never registered (or already closed) is a
    /// policy/validation error, not a crash.
    pub fn close(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.remove(id).is_some() || inner.exhausted.remove(id).is_some() {
            Ok(())
        } else {
            Err(Error::Policy(PolicyError::UnknownIterator(id.to_string())))
        }
    }

    /// Closes every iterator idle longer than `idle_timeout`, and drops
    /// exhaustion tombstones older than the same threshold. Run on a
    /// periodic sweep task owned by the worker.
    pub fn sweep(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner
            .entries
            .retain(|_, entry| now.duration_since(entry.last_accessed) < idle_timeout);
        inner
            .exhausted
            .retain(|_, marker| now.duration_since(marker.since) < idle_timeout);
    }

    /// Closes every iterator unconditionally. Called when the owning
    /// worker closes (§4.4: "when a worker closes, all its iterators are
    /// cancelled").
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.exhausted.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.entries.is_empty() && inner.exhausted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::iter;

    fn stream_of(values: Vec<Value>) -> ValueStream {
        Box::pin(iter(values))
    }

    #[tokio::test]
    async fn next_drains_then_reports_no_more() {
        let table = IteratorTable::new();
        let id = table.register(stream_of(vec![Value::from(1), Value::from(2)]));

        let (v, more) = table.next(&id).await.unwrap();
        assert_eq!(v, Some(Value::from(1)));
        assert!(more);

        let (v, more) = table.next(&id).await.unwrap();
        assert_eq!(v, Some(Value::from(2)));
        assert!(!more);
    }

    #[tokio::test]
    async fn unknown_iterator_is_a_policy_error_not_a_crash() {
        let table = IteratorTable::new();
        let err = table.next("does-not-exist").await.unwrap_err();
        assert!(matches!(err, Error::Policy(PolicyError::UnknownIterator(_))));
    }

    #[tokio::test]
    async fn exhausted_then_close_is_a_no_op() {
        let table = IteratorTable::new();
        let id = table.register(stream_of(vec![Value::from(1)]));
        let (_, more) = table.next(&id).await.unwrap();
        assert!(!more);
        // Exhaustion leaves a tombstone behind, so closing it afterwards
        // succeeds instead of looking like an unknown id.
        assert!(table.close(&id).is_ok());
    }

    #[tokio::test]
    async fn sweep_closes_idle_iterators() {
        let table = IteratorTable::new();
        let id = table.register(stream_of(vec![Value::from(1), Value::from(2)]));
        table.next(&id).await.unwrap();
        table.sweep(Duration::from_secs(0));
        assert!(table.is_empty());
    }

    #[test]
    fn close_unknown_id_is_an_error() {
        let table = IteratorTable::new();
        assert!(table.close("nope").is_err());
    }
}
