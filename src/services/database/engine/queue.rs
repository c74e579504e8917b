//! Completion queue shared by query workers and the loop that consumes them.
//!
//! Workers push finished queries; every push also posts a wakeup on a channel
//! so an event loop can `select` on it next to its other inputs. Consumers
//! drain the wakeups in bulk and then [`pop`](AsyncQueue::pop) until empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::query::{AsyncQuery, QueryId};
use crate::services::database::pool::ConnId;

#[derive(Debug)]
struct RunningQuery {
    id: QueryId,
    conn_id: ConnId,
    cancel_requested: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct QueueState {
    running: Vec<RunningQuery>,
    completed: VecDeque<AsyncQuery>,
}

/// Running and completed queries behind one lock, plus a wakeup channel.
#[derive(Debug)]
pub struct AsyncQueue {
    state: Mutex<QueueState>,
    wake_tx: async_channel::Sender<()>,
    wake_rx: async_channel::Receiver<()>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = async_channel::unbounded();
        Self {
            state: Mutex::new(QueueState::default()),
            wake_tx,
            wake_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a query whose worker is about to start.
    pub fn register_running(&self, query: &AsyncQuery) {
        self.lock().running.push(RunningQuery {
            id: query.id,
            conn_id: query.conn_id,
            cancel_requested: query.cancel_flag(),
        });
    }

    /// Track a query unless another one is still running on the same connection.
    pub fn register_exclusive(&self, query: &AsyncQuery) -> bool {
        let mut state = self.lock();
        if state.running.iter().any(|r| r.conn_id == query.conn_id) {
            return false;
        }
        state.running.push(RunningQuery {
            id: query.id,
            conn_id: query.conn_id,
            cancel_requested: query.cancel_flag(),
        });
        true
    }

    /// Move a finished query from the running list to the completion list and
    /// post one wakeup.
    pub fn complete(&self, query: AsyncQuery) {
        {
            let mut state = self.lock();
            state.running.retain(|running| running.id != query.id);
            state.completed.push_back(query);
        }
        // unbounded and we hold a receiver, so this cannot fail
        let _ = self.wake_tx.try_send(());
    }

    /// Take the oldest completed query, if any. Never blocks.
    pub fn pop(&self) -> Option<AsyncQuery> {
        self.lock().completed.pop_front()
    }

    /// Consume every pending wakeup without blocking, returning how many there were.
    pub fn drain_notifications(&self) -> usize {
        let mut drained = 0;
        while self.wake_rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Resolve on the next wakeup, folding any that piled up behind it.
    pub async fn notified(&self) {
        if self.wake_rx.recv().await.is_ok() {
            self.drain_notifications();
        }
    }

    /// Wait up to `timeout` for a completed query.
    pub async fn wait(&self, timeout: Duration) -> Option<AsyncQuery> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(query) = self.pop() {
                return Some(query);
            }
            let woke = smol::future::or(
                async {
                    self.notified().await;
                    true
                },
                async {
                    smol::Timer::at(deadline).await;
                    false
                },
            )
            .await;
            if !woke {
                return self.pop();
            }
        }
    }

    /// Flag every query running on `conn_id` as cancelled. Returns whether any was found.
    pub fn request_cancel(&self, conn_id: ConnId) -> bool {
        let state = self.lock();
        let mut found = false;
        for running in state.running.iter().filter(|r| r.conn_id == conn_id) {
            running.cancel_requested.store(true, Ordering::SeqCst);
            found = true;
        }
        found
    }

    /// Whether a query is still running on `conn_id`
    pub fn is_running_on(&self, conn_id: ConnId) -> bool {
        self.lock().running.iter().any(|r| r.conn_id == conn_id)
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    pub fn completed_count(&self) -> usize {
        self.lock().completed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::engine::query::{QueryInput, QueryOutput, QueryStatus};

    fn query(id: QueryId, conn_id: ConnId) -> AsyncQuery {
        AsyncQuery::new(id, conn_id, QueryInput::Sql { sql: "SELECT 1".into() }, None)
    }

    fn finish(mut q: AsyncQuery) -> AsyncQuery {
        q.start().unwrap();
        q.complete(Ok(QueryOutput::Affected(0))).unwrap();
        q
    }

    #[test]
    fn test_pop_on_empty_queue() {
        let queue = AsyncQueue::new();
        assert!(queue.pop().is_none());
        assert_eq!(queue.drain_notifications(), 0);
    }

    #[test]
    fn test_completion_order_and_wakeups() {
        let queue = AsyncQueue::new();
        let (a, b) = (query(1, 1), query(2, 2));
        queue.register_running(&a);
        queue.register_running(&b);
        assert_eq!(queue.running_count(), 2);

        queue.complete(finish(b));
        queue.complete(finish(a));
        assert_eq!(queue.running_count(), 0);
        assert_eq!(queue.completed_count(), 2);

        assert_eq!(queue.drain_notifications(), 2);
        assert_eq!(queue.drain_notifications(), 0);
        assert_eq!(queue.pop().map(|q| q.id), Some(2));
        assert_eq!(queue.pop().map(|q| q.id), Some(1));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_request_cancel_by_connection() {
        let queue = AsyncQueue::new();
        let a = query(1, 7);
        let b = query(2, 8);
        queue.register_running(&a);
        queue.register_running(&b);

        assert!(queue.request_cancel(7));
        assert!(a.is_cancel_requested());
        assert!(!b.is_cancel_requested());
        assert!(!queue.request_cancel(9));
        assert!(queue.is_running_on(8));
        assert!(!queue.register_exclusive(&query(3, 8)));
        assert!(queue.register_exclusive(&query(4, 9)));
        assert!(queue.is_running_on(9));
        assert!(!queue.register_exclusive(&query(5, 9)));
    }

    #[test]
    fn test_wait_times_out_then_sees_completion() {
        smol::block_on(async {
            let queue = Arc::new(AsyncQueue::new());
            assert!(queue.wait(Duration::from_millis(20)).await.is_none());

            let producer = Arc::clone(&queue);
            smol::spawn(async move {
                smol::Timer::after(Duration::from_millis(10)).await;
                producer.complete(finish(query(5, 1)));
            })
            .detach();

            let done = queue.wait(Duration::from_secs(5)).await.unwrap();
            assert_eq!(done.id, 5);
            assert_eq!(done.status(), QueryStatus::Completed);
        });
    }
}
