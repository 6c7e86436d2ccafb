//! The queue pool: admission control and dispatch of task attempts across
//! named queues with independent concurrency limits.
//!
//! `default` discipline releases tasks in insertion order; `priority`
//! releases the highest numeric priority first, ties broken by insertion.
//! Dispatch is round-robin across queues so a busy queue cannot starve the
//! others.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use weft_db::models::QueueDiscipline;
use weft_db::queries::queues as queue_db;

use crate::error::{EngineError, Result};
use crate::stats::Statistics;

/// A queued task attempt, addressed back into its instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRef {
    pub instance_id: i64,
    pub task_index: usize,
    pub retry_count: u32,
}

#[derive(Debug)]
struct Waiting {
    priority: i64,
    seq: u64,
    attempt: AttemptRef,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiting {}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then older insertion.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Queue {
    id: i64,
    name: String,
    concurrency: u32,
    discipline: QueueDiscipline,
    dynamic: bool,
    waiting: BinaryHeap<Waiting>,
    running: u32,
}

impl Queue {
    fn has_capacity(&self) -> bool {
        self.running < self.concurrency
    }
}

/// Live statistics of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub waiting: usize,
    pub running: u32,
    pub concurrency: u32,
}

#[derive(Default)]
struct PoolState {
    queues: Vec<Queue>,
    by_name: HashMap<String, usize>,
    rr_cursor: usize,
    next_seq: u64,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct QueuePoolConfig {
    /// Concurrency given to lazily created dynamic queues.
    pub default_concurrency: u32,
    /// Whether an unknown queue name creates a dynamic queue instead of
    /// being rejected.
    pub create_dynamic_queues: bool,
}

impl Default for QueuePoolConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            create_dynamic_queues: true,
        }
    }
}

/// The queue pool.
pub struct QueuePool {
    state: Mutex<PoolState>,
    dispatch_waker: Notify,
    config: QueuePoolConfig,
    stats: Arc<Statistics>,
}

impl QueuePool {
    pub fn new(config: QueuePoolConfig, stats: Arc<Statistics>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            dispatch_waker: Notify::new(),
            config,
            stats,
        }
    }

    /// Define (or redefine) a queue.
    pub fn define_queue(
        &self,
        id: i64,
        name: &str,
        concurrency: u32,
        discipline: QueueDiscipline,
        dynamic: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        match state.by_name.get(name) {
            Some(&idx) => {
                let queue = &mut state.queues[idx];
                queue.id = id;
                queue.concurrency = concurrency.max(1);
                queue.discipline = discipline;
                queue.dynamic = dynamic;
            }
            None => {
                let idx = state.queues.len();
                state.queues.push(Queue {
                    id,
                    name: name.to_owned(),
                    concurrency: concurrency.max(1),
                    discipline,
                    dynamic,
                    waiting: BinaryHeap::new(),
                    running: 0,
                });
                state.by_name.insert(name.to_owned(), idx);
            }
        }
        self.dispatch_waker.notify_one();
    }

    /// Load queue definitions from `t_queue`.
    pub async fn reload(&self, pool: &PgPool) -> anyhow::Result<()> {
        tracing::info!("reloading queue definitions");
        let rows = queue_db::list_queues(pool).await?;
        for row in rows {
            self.define_queue(
                row.queue_id,
                &row.queue_name,
                row.queue_concurrency.max(1) as u32,
                row.queue_scheduler,
                row.queue_dynamic,
            );
        }
        Ok(())
    }

    /// Admit an attempt into a queue. O(log n) in the queue's backlog.
    ///
    /// An unknown queue is created lazily when dynamic queue creation is
    /// enabled, otherwise the attempt is rejected with `UNKNOWN_QUEUE`.
    pub fn enqueue(&self, queue_name: &str, attempt: AttemptRef, priority: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let idx = match state.by_name.get(queue_name) {
            Some(&idx) => idx,
            None if self.config.create_dynamic_queues => {
                let idx = state.queues.len();
                state.queues.push(Queue {
                    id: 0,
                    name: queue_name.to_owned(),
                    concurrency: self.config.default_concurrency,
                    discipline: QueueDiscipline::Default,
                    dynamic: true,
                    waiting: BinaryHeap::new(),
                    running: 0,
                });
                state.by_name.insert(queue_name.to_owned(), idx);
                idx
            }
            None => {
                self.stats.tasks_rejected.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(EngineError::unknown_queue(queue_name));
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;

        let queue = &mut state.queues[idx];
        let priority = match queue.discipline {
            QueueDiscipline::Priority => priority,
            // FIFO ignores the hint entirely.
            QueueDiscipline::Default => 0,
        };
        queue.waiting.push(Waiting {
            priority,
            seq,
            attempt,
        });

        self.stats.tasks_accepted.fetch_add(1, AtomicOrdering::Relaxed);
        drop(state);
        self.dispatch_waker.notify_one();
        Ok(())
    }

    /// Non-blocking dispatch: the next attempt some queue may run, or
    /// `None` when every queue is empty or saturated. Round-robin across
    /// queues guarantees that over a round each eligible queue releases at
    /// least one task.
    pub fn try_dequeue(&self) -> Option<(String, AttemptRef)> {
        let mut state = self.state.lock().unwrap();
        let n = state.queues.len();
        if n == 0 {
            return None;
        }

        let start = state.rr_cursor % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let queue = &mut state.queues[idx];
            if queue.has_capacity() && !queue.waiting.is_empty() {
                let entry = queue.waiting.pop().unwrap();
                queue.running += 1;
                let name = queue.name.clone();
                state.rr_cursor = (idx + 1) % n;
                return Some((name, entry.attempt));
            }
        }
        None
    }

    /// Await the next runnable attempt. Resolves to `None` on shutdown.
    pub async fn dequeue_next(&self, shutdown: &CancellationToken) -> Option<(String, AttemptRef)> {
        loop {
            if let Some(found) = self.try_dequeue() {
                return Some(found);
            }
            tokio::select! {
                _ = self.dispatch_waker.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Release a running slot after an attempt finished (or was aborted).
    pub fn on_attempt_finished(&self, queue_name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.by_name.get(queue_name) {
            let queue = &mut state.queues[idx];
            queue.running = queue.running.saturating_sub(1);
        }
        self.stats.tasks_executed.fetch_add(1, AtomicOrdering::Relaxed);
        drop(state);
        self.dispatch_waker.notify_one();
    }

    /// Remove every waiting attempt of an instance (cancellation). Running
    /// attempts are untouched; they report back through the process
    /// manager. Returns the removed attempts.
    pub fn cancel_instance(&self, instance_id: i64) -> Vec<AttemptRef> {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        for queue in &mut state.queues {
            let kept: BinaryHeap<Waiting> = queue
                .waiting
                .drain()
                .filter_map(|w| {
                    if w.attempt.instance_id == instance_id {
                        removed.push(w.attempt);
                        None
                    } else {
                        Some(w)
                    }
                })
                .collect();
            queue.waiting = kept;
        }
        removed
    }

    /// Per-queue statistics.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let state = self.state.lock().unwrap();
        state
            .queues
            .iter()
            .map(|q| QueueStats {
                name: q.name.clone(),
                waiting: q.waiting.len(),
                running: q.running,
                concurrency: q.concurrency,
            })
            .collect()
    }

    /// Wake the dispatcher (shutdown path).
    pub fn wake(&self) {
        self.dispatch_waker.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> QueuePool {
        QueuePool::new(QueuePoolConfig::default(), Arc::new(Statistics::new()))
    }

    fn attempt(instance: i64, task: usize) -> AttemptRef {
        AttemptRef {
            instance_id: instance,
            task_index: task,
            retry_count: 0,
        }
    }

    #[test]
    fn fifo_queue_preserves_insertion_order() {
        let p = pool();
        p.define_queue(1, "q", 1, QueueDiscipline::Default, false);

        // Priorities are ignored on a default queue.
        p.enqueue("q", attempt(1, 0), 5).unwrap();
        p.enqueue("q", attempt(1, 1), 50).unwrap();
        p.enqueue("q", attempt(1, 2), 0).unwrap();

        let (_, a) = p.try_dequeue().unwrap();
        assert_eq!(a.task_index, 0);
        p.on_attempt_finished("q");
        let (_, a) = p.try_dequeue().unwrap();
        assert_eq!(a.task_index, 1);
        p.on_attempt_finished("q");
        let (_, a) = p.try_dequeue().unwrap();
        assert_eq!(a.task_index, 2);
    }

    #[test]
    fn priority_queue_orders_by_priority_then_insertion() {
        let p = pool();
        p.define_queue(1, "q", 1, QueueDiscipline::Priority, false);

        p.enqueue("q", attempt(1, 0), 1).unwrap();
        p.enqueue("q", attempt(1, 1), 9).unwrap();
        p.enqueue("q", attempt(1, 2), 9).unwrap();
        p.enqueue("q", attempt(1, 3), 5).unwrap();

        let order: Vec<usize> = std::iter::from_fn(|| {
            let got = p.try_dequeue().map(|(_, a)| a.task_index);
            if got.is_some() {
                p.on_attempt_finished("q");
            }
            got
        })
        .collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn concurrency_bound_is_enforced() {
        let p = pool();
        p.define_queue(1, "q", 2, QueueDiscipline::Default, false);

        for i in 0..5 {
            p.enqueue("q", attempt(1, i), 0).unwrap();
        }

        assert!(p.try_dequeue().is_some());
        assert!(p.try_dequeue().is_some());
        // Saturated.
        assert!(p.try_dequeue().is_none());
        let stats = p.queue_stats();
        assert_eq!(stats[0].running, 2);
        assert_eq!(stats[0].waiting, 3);

        p.on_attempt_finished("q");
        assert!(p.try_dequeue().is_some());
        assert!(p.try_dequeue().is_none());
    }

    #[test]
    fn unknown_queue_rejected_when_dynamic_disabled() {
        let stats = Arc::new(Statistics::new());
        let p = QueuePool::new(
            QueuePoolConfig {
                default_concurrency: 4,
                create_dynamic_queues: false,
            },
            Arc::clone(&stats),
        );

        let err = p.enqueue("nope", attempt(1, 0), 0).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_QUEUE");
        assert_eq!(stats.snapshot().tasks_rejected, 1);
    }

    #[test]
    fn unknown_queue_created_lazily_when_dynamic_enabled() {
        let p = pool();
        p.enqueue("fresh", attempt(1, 0), 0).unwrap();
        let (name, _) = p.try_dequeue().unwrap();
        assert_eq!(name, "fresh");
    }

    #[test]
    fn round_robin_prevents_starvation() {
        let p = pool();
        p.define_queue(1, "a", 4, QueueDiscipline::Default, false);
        p.define_queue(2, "b", 4, QueueDiscipline::Default, false);

        for i in 0..3 {
            p.enqueue("a", attempt(1, i), 0).unwrap();
            p.enqueue("b", attempt(2, i), 0).unwrap();
        }

        let mut names = Vec::new();
        for _ in 0..4 {
            let (name, _) = p.try_dequeue().unwrap();
            names.push(name);
        }
        // Alternates between the two queues instead of draining one.
        assert_eq!(names, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn cancel_instance_removes_only_its_waiting_attempts() {
        let p = pool();
        p.define_queue(1, "q", 1, QueueDiscipline::Default, false);

        p.enqueue("q", attempt(1, 0), 0).unwrap();
        p.enqueue("q", attempt(2, 0), 0).unwrap();
        p.enqueue("q", attempt(1, 1), 0).unwrap();

        let removed = p.cancel_instance(1);
        assert_eq!(removed.len(), 2);

        let (_, a) = p.try_dequeue().unwrap();
        assert_eq!(a.instance_id, 2);
    }

    #[tokio::test]
    async fn dequeue_next_wakes_on_enqueue() {
        let p = Arc::new(pool());
        p.define_queue(1, "q", 1, QueueDiscipline::Default, false);
        let shutdown = CancellationToken::new();

        let waiter = {
            let p = Arc::clone(&p);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { p.dequeue_next(&shutdown).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        p.enqueue("q", attempt(1, 0), 0).unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("dispatcher should wake")
            .unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn dequeue_next_resolves_none_on_shutdown() {
        let p = pool();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(p.dequeue_next(&shutdown).await.is_none());
    }
}
