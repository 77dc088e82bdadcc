// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::time::Duration;

/// Batch-fsync policy of the log worker
///
/// A batch is flushed once it holds `entries` records or once its
/// oldest record is `interval` old, whichever happens first.
#[derive(Copy, Clone, Debug)]
pub struct FlushPolicy {
    /// Entry-count threshold
    pub entries: usize,

    /// Time threshold
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            entries: 128,
            interval: Duration::from_millis(10),
        }
    }
}

/// Log configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Max bytes per segment
    pub(crate) segment_max_size: u64,

    /// Max closed segments retaining full entry arrays
    pub(crate) cache_max_segments: usize,

    /// Worker fsync batching
    pub(crate) flush_policy: FlushPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_max_size: 8 * 1_024 * 1_024,
            cache_max_segments: 6,
            flush_policy: FlushPolicy::default(),
        }
    }
}

impl Config {
    /// Sets the maximum size of log segments.
    ///
    /// An entry larger than this gets a segment of its own.
    ///
    /// Default = 8 MiB
    #[must_use]
    pub fn segment_max_size(mut self, bytes: u64) -> Self {
        self.segment_max_size = bytes;
        self
    }

    /// Sets how many closed segments keep their entries in memory.
    ///
    /// Segments beyond the bound keep only per-record index metadata;
    /// their entries are re-read from disk on demand.
    #[must_use]
    pub fn cache_max_segments(mut self, count: usize) -> Self {
        self.cache_max_segments = count;
        self
    }

    /// Sets the worker's fsync batching policy.
    #[must_use]
    pub fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Delay before a request is retried
    pub(crate) retry_interval: Duration,

    /// Bound on outstanding async requests
    pub(crate) max_outstanding_requests: usize,

    /// Retry timer pool size
    pub(crate) scheduler_threads: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(300),
            max_outstanding_requests: 100,
            scheduler_threads: 3,
        }
    }
}

impl ClientConfig {
    /// Sets the per-retry delay.
    ///
    /// Default = 300 ms
    #[must_use]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Bounds the number of outstanding async requests.
    ///
    /// `send_async` and friends block once the bound is reached, until
    /// an outstanding request completes or its future is dropped.
    #[must_use]
    pub fn max_outstanding_requests(mut self, count: usize) -> Self {
        self.max_outstanding_requests = count;
        self
    }

    /// Sets the size of the retry timer thread pool.
    #[must_use]
    pub fn scheduler_threads(mut self, count: usize) -> Self {
        self.scheduler_threads = count.max(1);
        self
    }
}
