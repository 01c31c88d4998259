//! Fair scheduling primitives: ready queue, priority function, worker pool
//!
//! The ready queue holds one entry per *root* activity tree. A root is
//! present exactly while no action of its tree is executing or in flight;
//! re-insertion after an action completes is the sole re-admission path,
//! which is what serializes every tree. Priorities are computed live at
//! selection time from a snapshot of each root (waiting callers, pending
//! actions, idle age), so stale heap entries never occur.

use std::cmp::Ordering as CmpOrdering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use super::error::{SchedResult, SchedulerError};
use super::message::ActivityId;

/// Live scheduling facts about one root activity tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingSnapshot {
    /// Root activity id
    pub id: ActivityId,
    /// Callers currently blocked on the root's completion handle
    pub waiting: usize,
    /// Pending actions on the tree's shared queue
    pub queue_len: usize,
    /// Time since the tree last executed (or was last considered)
    pub idle: Duration,
}

impl SchedulingSnapshot {
    /// A tree someone is synchronously waiting on, with work pending,
    /// outranks every tree without such a caller
    fn urgent(&self) -> bool {
        self.waiting > 0 && self.queue_len > 0
    }

    /// Aging weight: idle time multiplied by backlog
    fn weight(&self) -> u128 {
        self.idle.as_micros().saturating_mul(self.queue_len as u128)
    }
}

/// Total order over root snapshots; `Greater` means scheduled first
pub fn compare_priority(a: &SchedulingSnapshot, b: &SchedulingSnapshot) -> CmpOrdering {
    a.urgent()
        .cmp(&b.urgent())
        .then_with(|| a.weight().cmp(&b.weight()))
        // Deterministic tie-break so equal trees don't flap.
        .then_with(|| b.id.cmp(&a.id))
}

/// Concurrent set of schedulable root activities
///
/// Insert/remove come from workers, the manager, and message arrival paths;
/// `take_best` is called only by the scheduling thread.
#[derive(Default)]
pub struct ReadyQueue {
    roots: Mutex<Vec<ActivityId>>,
    work: Condvar,
}

impl ReadyQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a root for scheduling (idempotent)
    pub fn insert(&self, root: ActivityId) {
        let mut roots = self.roots.lock();
        if !roots.contains(&root) {
            roots.push(root);
        }
        drop(roots);
        self.work.notify_all();
    }

    /// Remove a root; returns whether it was present
    pub fn remove(&self, root: ActivityId) -> bool {
        let mut roots = self.roots.lock();
        let before = roots.len();
        roots.retain(|r| *r != root);
        roots.len() != before
    }

    /// Whether the given root is currently admitted
    pub fn contains(&self, root: ActivityId) -> bool {
        self.roots.lock().contains(&root)
    }

    /// Number of admitted roots
    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    /// Whether no roots are admitted
    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }

    /// Wake the scheduling thread after actions were enqueued elsewhere
    pub fn notify(&self) {
        self.work.notify_all();
    }

    /// Remove and return the highest-priority root that has pending work
    ///
    /// `snapshot` supplies live facts per root and returns `None` for roots
    /// that no longer exist (they are dropped from the queue). Blocks up to
    /// `timeout` when no root has pending actions; the timeout doubles as
    /// the brief fallback sleep guarding against missed wakeups.
    pub fn take_best<F>(&self, snapshot: F, timeout: Duration) -> Option<ActivityId>
    where
        F: Fn(ActivityId) -> Option<SchedulingSnapshot>,
    {
        let deadline = Instant::now() + timeout;
        let mut roots = self.roots.lock();
        loop {
            let mut vanished: Vec<ActivityId> = Vec::new();
            let mut best: Option<SchedulingSnapshot> = None;
            for root in roots.iter() {
                match snapshot(*root) {
                    Some(snap) if snap.queue_len > 0 => {
                        let better = match &best {
                            Some(current) => {
                                compare_priority(&snap, current) == CmpOrdering::Greater
                            }
                            None => true,
                        };
                        if better {
                            best = Some(snap);
                        }
                    }
                    Some(_) => {} // idle tree; stays admitted
                    None => vanished.push(*root),
                }
            }
            for root in vanished {
                roots.retain(|r| *r != root);
            }

            if let Some(snap) = best {
                roots.retain(|r| *r != snap.id);
                return Some(snap.id);
            }
            if self.work.wait_until(&mut roots, deadline).timed_out() {
                return None;
            }
        }
    }
}

/// Unit of work submitted to the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded pool of worker threads executing dequeued actions
///
/// Concurrency is bounded by the thread count; the feeding channel is
/// unbounded so the scheduling thread never blocks on submission.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one)
    pub fn new(workers: usize) -> SchedResult<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("parley-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Submit a job for execution
    pub fn execute(&self, job: Job) -> SchedResult<()> {
        match &self.sender {
            Some(sender) => sender
                .send(job)
                .map_err(|_| SchedulerError::ShuttingDown),
            None => Err(SchedulerError::ShuttingDown),
        }
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting work, finish what is queued, and join the threads
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snap(id: ActivityId, waiting: usize, queue_len: usize, idle_ms: u64) -> SchedulingSnapshot {
        SchedulingSnapshot {
            id,
            waiting,
            queue_len,
            idle: Duration::from_millis(idle_ms),
        }
    }

    #[test]
    fn test_waited_on_tree_outranks_aged_tree() {
        let a = snap(ActivityId::new(), 1, 1, 0);
        let b = snap(ActivityId::new(), 0, 50, 10_000);
        assert_eq!(compare_priority(&a, &b), CmpOrdering::Greater);
    }

    #[test]
    fn test_aging_weight_orders_unwaited_trees() {
        let old = snap(ActivityId::new(), 0, 2, 100);
        let fresh = snap(ActivityId::new(), 0, 2, 1);
        assert_eq!(compare_priority(&old, &fresh), CmpOrdering::Greater);
    }

    #[test]
    fn test_take_best_prefers_urgent_root() {
        let queue = ReadyQueue::new();
        let urgent = ActivityId::new();
        let aged = ActivityId::new();
        queue.insert(aged);
        queue.insert(urgent);

        let mut facts = HashMap::new();
        facts.insert(urgent, (1usize, 1usize, 5u64));
        facts.insert(aged, (0usize, 10usize, 60_000u64));

        let picked = queue.take_best(
            |id| {
                facts
                    .get(&id)
                    .map(|(waiting, len, idle)| snap(id, *waiting, *len, *idle))
            },
            Duration::from_millis(10),
        );
        assert_eq!(picked, Some(urgent));
        // Picked root leaves the queue; the other stays admitted.
        assert!(!queue.contains(urgent));
        assert!(queue.contains(aged));
    }

    #[test]
    fn test_take_best_times_out_on_idle_roots() {
        let queue = ReadyQueue::new();
        let idle = ActivityId::new();
        queue.insert(idle);

        let picked = queue.take_best(
            |id| Some(snap(id, 0, 0, 0)),
            Duration::from_millis(20),
        );
        assert_eq!(picked, None);
        assert!(queue.contains(idle));
    }

    #[test]
    fn test_take_best_drops_vanished_roots() {
        let queue = ReadyQueue::new();
        queue.insert(ActivityId::new());
        let picked = queue.take_best(|_| None, Duration::from_millis(5));
        assert_eq!(picked, None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_worker_pool_runs_jobs() {
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
