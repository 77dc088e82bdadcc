// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use min_max_heap::MinMaxHeap;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A job with its deadline; ordered so the heap pops the earliest
/// deadline first
struct ScheduledJob {
    at: Instant,

    /// Tie breaker keeping submission order among equal deadlines
    seq: u64,

    job: Job,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

struct SchedulerInner {
    queue: Mutex<MinMaxHeap<ScheduledJob>>,
    cond: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// Timer thread pool driving retry delays
///
/// Jobs run on one of a fixed number of worker threads once their
/// deadline passes. Pending jobs are discarded on drop.
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl RetryScheduler {
    /// Starts `threads` timer threads.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(MinMaxHeap::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let threads = (0..threads.max(1))
            .map(|n| {
                let inner = inner.clone();

                std::thread::Builder::new()
                    .name(format!("raft-client-timer-{n}"))
                    .spawn(move || run_timer(&inner))
                    .expect("should spawn timer thread")
            })
            .collect();

        Self { inner, threads }
    }

    /// Runs `job` after `delay`.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, job: F) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut queue = self.inner.queue.lock().expect("lock is poisoned");
        queue.push(ScheduledJob {
            at: Instant::now() + delay,
            seq,
            job: Box::new(job),
        });
        drop(queue);

        // The new deadline may be earlier than what a sleeper waits for
        self.inner.cond.notify_all();
    }

    /// Runs `job` as soon as a timer thread is free.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.schedule(Duration::ZERO, job);
    }

    /// Discards every job that has not started yet.
    ///
    /// Queued jobs keep their captures alive; the client clears the
    /// queue on close so shutdown does not wait out retry delays.
    pub fn clear_pending(&self) {
        let mut queue = self.inner.queue.lock().expect("lock is poisoned");
        let dropped = queue.len();
        *queue = MinMaxHeap::new();
        drop(queue);

        if dropped > 0 {
            log::debug!("Discarded {dropped} scheduled retries");
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.cond.notify_all();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Retry timer thread panicked");
            }
        }

        let dropped = self.inner.queue.lock().expect("lock is poisoned").len();
        if dropped > 0 {
            log::debug!("Dropping {dropped} scheduled retries on shutdown");
        }
    }
}

fn run_timer(inner: &SchedulerInner) {
    let mut queue = inner.queue.lock().expect("lock is poisoned");

    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();

        match queue.peek_min().map(|job| job.at) {
            Some(at) if at <= now => {
                let job = queue.pop_min().expect("peeked element exists");

                // Run without holding the queue lock
                drop(queue);
                (job.job)();
                queue = inner.queue.lock().expect("lock is poisoned");
            }

            Some(at) => {
                let (guard, _) = inner
                    .cond
                    .wait_timeout(queue, at - now)
                    .expect("lock is poisoned");
                queue = guard;
            }

            None => {
                queue = inner.cond.wait(queue).expect("lock is poisoned");
            }
        }
    }
}
