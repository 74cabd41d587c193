//! Priority-ordered, bounded FEC worker pool.
//!
//! The pool has no teacher analog — the monitor pattern here (one
//! `parking_lot::Mutex` guarding both queues plus the worker count, one
//! `Condvar` for wakeups) is the pattern `dirvine-saorsa-fec` and the
//! `ioi-*` crates use for their own blocking worker pools, adapted to the
//! two-queue (transient + persistent-cache-over-a-durable-log) shape this
//! spec calls for.
//!
//! The durable backing store is modelled as an in-process `VecDeque` rather
//! than an actual on-disk log; what matters for this subsystem's contract
//! is the admission/eviction behavior of the in-memory cache window over
//! it, which is implemented in full.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const NUM_PRIORITIES: usize = 10;

pub struct FecJob {
    pub priority: u8,
    pub persistent: bool,
    pub added_at: u64,
    pub run: Box<dyn FnOnce() + Send>,
}

impl FecJob {
    pub fn new(priority: u8, persistent: bool, added_at: u64, run: Box<dyn FnOnce() + Send>) -> Self {
        Self { priority: priority.min((NUM_PRIORITIES - 1) as u8), persistent, added_at, run }
    }
}

struct Inner {
    transient: Vec<std::collections::VecDeque<FecJob>>,
    persistent_cache: Vec<std::collections::VecDeque<FecJob>>,
    /// Simulated durable queue, one `VecDeque` per priority. Jobs here have
    /// not yet been admitted to `persistent_cache`.
    durable_backlog: Vec<std::collections::VecDeque<FecJob>>,
    running_workers: usize,
    max_workers: usize,
    max_cache_size: usize,
    shutting_down: bool,
}

impl Inner {
    fn cache_len(&self) -> usize {
        self.persistent_cache.iter().map(|q| q.len()).sum()
    }

    /// Admission per the queue invariant: count items strictly above (more
    /// urgent than) `priority` already in the cache; if that alone meets
    /// the cap, leave the job in the durable backlog for the filler to
    /// retry later. Otherwise insert, then evict tail-first from the
    /// lowest-priority non-empty bucket until back under the cap.
    fn try_admit(&mut self, priority: u8) -> bool {
        let above: usize = self.persistent_cache[..priority as usize].iter().map(|q| q.len()).sum();
        if above >= self.max_cache_size {
            return false;
        }
        true
    }

    fn evict_to_fit(&mut self) {
        while self.cache_len() > self.max_cache_size {
            let Some(lowest) = (0..NUM_PRIORITIES).rev().find(|&p| !self.persistent_cache[p].is_empty()) else {
                break;
            };
            self.persistent_cache[lowest].pop_back();
        }
    }

    fn refill_cache(&mut self) {
        for p in 0..NUM_PRIORITIES {
            while let Some(job) = self.durable_backlog[p].front() {
                if !self.try_admit(job.priority) {
                    break;
                }
                let job = self.durable_backlog[p].pop_front().unwrap();
                self.persistent_cache[p].push_back(job);
                self.evict_to_fit();
            }
        }
    }

    fn pop_ready(&mut self) -> Option<FecJob> {
        for p in 0..NUM_PRIORITIES {
            if let Some(job) = self.transient[p].pop_front() {
                return Some(job);
            }
        }
        for p in 0..NUM_PRIORITIES {
            if let Some(job) = self.persistent_cache[p].pop_front() {
                return Some(job);
            }
        }
        None
    }
}

pub struct FecQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    next_seq: AtomicU64,
}

impl FecQueue {
    pub fn new(max_workers: usize, max_cache_size: usize) -> Arc<Self> {
        let make_vecs = || (0..NUM_PRIORITIES).map(|_| std::collections::VecDeque::new()).collect();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                transient: make_vecs(),
                persistent_cache: make_vecs(),
                durable_backlog: make_vecs(),
                running_workers: 0,
                max_workers: max_workers.max(1),
                max_cache_size,
                shutting_down: false,
            }),
            cond: Condvar::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn next_added_at(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.lock().max_workers
    }

    pub fn running_workers(&self) -> usize {
        self.inner.lock().running_workers
    }

    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache_len()
    }

    pub fn enqueue(self: &Arc<Self>, job: FecJob) {
        let mut inner = self.inner.lock();
        if job.persistent {
            let p = job.priority as usize;
            inner.durable_backlog[p].push_back(job);
            inner.refill_cache();
        } else {
            let p = job.priority as usize;
            inner.transient[p].push_back(job);
        }
        let need_worker = inner.running_workers < inner.max_workers;
        if need_worker {
            inner.running_workers += 1;
        }
        drop(inner);
        self.cond.notify_one();
        if need_worker {
            self.spawn_worker();
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let queue = self.clone();
        std::thread::spawn(move || queue.run_worker());
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            let job = {
                let mut inner = self.inner.lock();
                loop {
                    if inner.shutting_down {
                        inner.running_workers -= 1;
                        return;
                    }
                    if inner.running_workers > inner.max_workers {
                        inner.running_workers -= 1;
                        debug!("FEC worker draining: running {} > max {}", inner.running_workers + 1, inner.max_workers);
                        return;
                    }
                    if let Some(job) = inner.pop_ready() {
                        break job;
                    }
                    let timed_out = self.cond.wait_for(&mut inner, Duration::from_millis(500)).timed_out();
                    if timed_out && inner.running_workers > inner.max_workers {
                        inner.running_workers -= 1;
                        return;
                    }
                }
            };

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job.run));
            if let Err(e) = result {
                warn!("FEC job callback panicked: {:?}", e.downcast_ref::<&str>());
            }
        }
    }

    /// Decrease `max_workers` by one (floor 1) and wake a worker so it can
    /// notice and exit on its next loop iteration.
    pub fn on_low_memory(&self) {
        let mut inner = self.inner.lock();
        if inner.max_workers > 1 {
            inner.max_workers -= 1;
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Clamp `max_workers` to 1 and wake every worker.
    pub fn on_oom(&self) {
        let mut inner = self.inner.lock();
        inner.max_workers = 1;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutting_down = true;
        drop(inner);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn priority_preemption_runs_higher_priority_first() {
        let queue = FecQueue::new(1, 16);
        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

        // Occupy the single worker with a job that blocks on the gate, so
        // J_low and the burst both land in the queue before the worker is
        // free to pop anything — otherwise J_low (enqueued first) would
        // simply be the one already running, and "priority order" couldn't
        // be observed at all with a single worker.
        queue.enqueue(FecJob::new(0, false, queue.next_added_at(), Box::new(move || {
            started.fetch_add(1, Ordering::SeqCst);
            gate_rx.recv_timeout(Duration::from_secs(2)).ok();
        })));
        std::thread::sleep(Duration::from_millis(30));

        {
            let order = order.clone();
            queue.enqueue(FecJob::new(5, false, queue.next_added_at(), Box::new(move || {
                order.lock().push(5);
            })));
        }
        for p in [1u8, 1, 1, 1] {
            let order = order.clone();
            queue.enqueue(FecJob::new(p, false, queue.next_added_at(), Box::new(move || {
                order.lock().push(p);
            })));
        }

        gate_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let final_order = order.lock().clone();
        assert_eq!(final_order.last(), Some(&5u8), "low priority job should finish last: {final_order:?}");
    }

    #[test]
    fn oom_clamps_to_single_worker() {
        let queue = FecQueue::new(3, 16);
        assert_eq!(queue.max_workers(), 3);
        queue.on_oom();
        assert_eq!(queue.max_workers(), 1);
    }

    #[test]
    fn cache_eviction_respects_cap() {
        let queue = FecQueue::new(0, 2);
        {
            let mut inner = queue.inner.lock();
            inner.durable_backlog[5].push_back(FecJob::new(5, true, 0, Box::new(|| {})));
            inner.durable_backlog[5].push_back(FecJob::new(5, true, 1, Box::new(|| {})));
            inner.durable_backlog[5].push_back(FecJob::new(5, true, 2, Box::new(|| {})));
            inner.refill_cache();
            assert!(inner.cache_len() <= 2);
        }
    }
}
