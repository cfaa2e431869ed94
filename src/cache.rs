//! Coalescing operation cache between the follower and the writer loop.
//!
//! The cache holds a FIFO queue of relationship keys plus a map from key to
//! its pending [`Operation`]. Repeated updates to the same relationship
//! collapse into the single pending entry, so the writer only ever observes
//! the latest intent for each key. A key may appear more than once in the
//! queue (after a requeue); only the first dequeue that still finds it in the
//! map yields a value.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::relationship::{Operation, OperationType, Relationship};

/// Single-producer, single-consumer cache of pending relationship updates.
///
/// Producers never block; the consumer blocks in [`Cache::next`] until an
/// operation is available or the cancellation token fires.
pub struct Cache {
    state: Mutex<State>,
    notify: Notify,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    pending: HashMap<String, Operation>,
}

impl Cache {
    /// Creates a cache tied to the lifetime of `cancel`; cancelling it wakes
    /// and releases any blocked consumer.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            cancel,
        }
    }

    /// Records an upsert for `rel`. A pending entry for the same key is
    /// switched to TOUCH in place, keeping its queue position.
    pub fn touch(&self, rel: Relationship) {
        let key = rel.to_string();
        {
            let mut state = self.lock();
            if let Some(pending) = state.pending.get_mut(&key) {
                pending.op = OperationType::Touch;
            } else {
                state.pending.insert(
                    key.clone(),
                    Operation {
                        op: OperationType::Touch,
                        rel,
                    },
                );
                state.queue.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Records a removal for `rel`. A pending entry that has not been
    /// observed yet is cancelled outright; otherwise a DELETE is enqueued.
    pub fn delete(&self, rel: Relationship) {
        let key = rel.to_string();
        {
            let mut state = self.lock();
            if state.pending.remove(&key).is_some() {
                // its queue entry goes stale and is skipped on dequeue
                return;
            }
            state.pending.insert(
                key.clone(),
                Operation {
                    op: OperationType::Delete,
                    rel,
                },
            );
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Re-adds an operation that failed to apply downstream.
    ///
    /// Unlike [`Cache::delete`], a requeued DELETE never cancels out against
    /// a pending TOUCH: the relationship may already exist in the backing
    /// store and still needs the delete applied.
    pub fn requeue(&self, op: OperationType, rel: Relationship) {
        let key = rel.to_string();
        {
            let mut state = self.lock();
            state.pending.insert(key.clone(), Operation { op, rel });
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Returns the next pending operation, waiting for one if the queue is
    /// empty. Returns `None` once the cancellation token has fired.
    pub async fn next(&self) -> Option<Operation> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            {
                let mut state = self.lock();
                while let Some(key) = state.queue.pop_front() {
                    if let Some(op) = state.pending.remove(&key) {
                        return Some(op);
                    }
                    // stale entry: superseded by a delete or an earlier dequeue
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("cache lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn rel(id: &str) -> Relationship {
        Relationship {
            resource_type: "document".to_string(),
            resource_id: id.to_string(),
            relation: "viewer".to_string(),
            subject_type: "user".to_string(),
            subject_id: "10".to_string(),
        }
    }

    fn cache() -> Cache {
        Cache::new(CancellationToken::new())
    }

    async fn assert_blocks(cache: &Cache) {
        let blocked = timeout(Duration::from_millis(50), cache.next()).await;
        assert!(blocked.is_err(), "expected next() to block");
    }

    #[tokio::test]
    async fn test_touch_then_next() {
        let cache = cache();
        cache.touch(rel("1"));

        let op = cache.next().await.unwrap();
        assert_eq!(op.op, OperationType::Touch);
        assert_eq!(op.rel, rel("1"));
        assert_blocks(&cache).await;
    }

    #[tokio::test]
    async fn test_repeated_touches_coalesce() {
        let cache = cache();
        cache.touch(rel("1"));
        cache.touch(rel("1"));
        cache.touch(rel("1"));

        let op = cache.next().await.unwrap();
        assert_eq!(op.op, OperationType::Touch);
        assert_eq!(op.rel, rel("1"));
        assert_blocks(&cache).await;
    }

    #[tokio::test]
    async fn test_distinct_keys_kept_in_order() {
        let cache = cache();
        cache.touch(rel("1"));
        cache.touch(rel("2"));
        cache.touch(rel("1"));

        assert_eq!(cache.next().await.unwrap().rel, rel("1"));
        assert_eq!(cache.next().await.unwrap().rel, rel("2"));
        assert_blocks(&cache).await;
    }

    #[tokio::test]
    async fn test_delete_cancels_pending_touch() {
        let cache = cache();
        cache.touch(rel("1"));
        cache.delete(rel("1"));

        assert_blocks(&cache).await;
    }

    #[tokio::test]
    async fn test_delete_without_pending_enqueues() {
        let cache = cache();
        cache.delete(rel("1"));

        let op = cache.next().await.unwrap();
        assert_eq!(op.op, OperationType::Delete);
        assert_eq!(op.rel, rel("1"));
    }

    #[tokio::test]
    async fn test_touch_flips_pending_delete_in_place() {
        let cache = cache();
        cache.delete(rel("1"));
        cache.touch(rel("1"));

        let op = cache.next().await.unwrap();
        assert_eq!(op.op, OperationType::Touch);
        assert_blocks(&cache).await;
    }

    #[tokio::test]
    async fn test_requeue_after_failure() {
        let cache = cache();
        cache.touch(rel("1"));
        let op = cache.next().await.unwrap();

        cache.requeue(op.op, op.rel);
        let retried = cache.next().await.unwrap();
        assert_eq!(retried.op, OperationType::Touch);
        assert_eq!(retried.rel, rel("1"));
    }

    #[tokio::test]
    async fn test_requeue_overrides_pending_entry() {
        let cache = cache();
        cache.touch(rel("1"));
        cache.requeue(OperationType::Delete, rel("1"));

        // the override wins, and the stale second queue slot is skipped
        let op = cache.next().await.unwrap();
        assert_eq!(op.op, OperationType::Delete);
        assert_blocks(&cache).await;
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_consumer() {
        let token = CancellationToken::new();
        let cache = std::sync::Arc::new(Cache::new(token.clone()));

        let waiter = {
            let cache = std::sync::Arc::clone(&cache);
            tokio::spawn(async move { cache.next().await })
        };
        tokio::task::yield_now().await;
        token.cancel();

        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("consumer did not wake on cancellation")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_cache_returns_none() {
        let token = CancellationToken::new();
        let cache = Cache::new(token.clone());
        cache.touch(rel("1"));
        token.cancel();

        assert!(cache.next().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_wakes_waiting_consumer() {
        let cache = std::sync::Arc::new(cache());

        let waiter = {
            let cache = std::sync::Arc::clone(&cache);
            tokio::spawn(async move { cache.next().await })
        };
        tokio::task::yield_now().await;
        cache.touch(rel("1"));

        let op = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("consumer did not wake on touch")
            .unwrap()
            .unwrap();
        assert_eq!(op.rel, rel("1"));
    }
}
