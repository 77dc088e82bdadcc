// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Arc, Condvar, Mutex};

struct SemaphoreInner {
    permits: Mutex<usize>,
    cond: Condvar,
}

/// Counting semaphore bounding outstanding async requests
///
/// Permits are RAII: dropping a [`Permit`] releases it. A permit
/// travels with its pending request inside a shared slot, so reply
/// delivery and dropping the reply future both release it exactly once.
#[derive(Clone)]
pub struct Semaphore(Arc<SemaphoreInner>);

/// One unit of semaphore capacity
pub struct Permit(Arc<SemaphoreInner>);

impl Semaphore {
    /// Creates a semaphore with `capacity` permits.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(SemaphoreInner {
            permits: Mutex::new(capacity),
            cond: Condvar::new(),
        }))
    }

    /// Blocks until a permit is available.
    #[must_use]
    pub fn acquire(&self) -> Permit {
        let mut permits = self.0.permits.lock().expect("lock is poisoned");

        while *permits == 0 {
            permits = self.0.cond.wait(permits).expect("lock is poisoned");
        }

        *permits -= 1;
        drop(permits);

        Permit(self.0.clone())
    }

    /// Takes a permit if one is available right now.
    #[allow(unused)]
    #[must_use]
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut permits = self.0.permits.lock().expect("lock is poisoned");

        if *permits == 0 {
            return None;
        }

        *permits -= 1;
        drop(permits);

        Some(Permit(self.0.clone()))
    }

    /// Currently available permits.
    #[allow(unused)]
    #[must_use]
    pub fn available(&self) -> usize {
        *self.0.permits.lock().expect("lock is poisoned")
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut permits = self.0.permits.lock().expect("lock is poisoned");
        *permits += 1;
        drop(permits);

        self.0.cond.notify_one();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn semaphore_bounds_permits() {
        let semaphore = Semaphore::new(2);

        let a = semaphore.acquire();
        let _b = semaphore.acquire();
        assert_eq!(0, semaphore.available());
        assert!(semaphore.try_acquire().is_none());

        drop(a);
        assert_eq!(1, semaphore.available());
        assert!(semaphore.try_acquire().is_some());
    }

    #[test]
    fn semaphore_blocks_and_wakes() {
        let semaphore = Semaphore::new(1);
        let permit = semaphore.acquire();

        let waiter = {
            let semaphore = semaphore.clone();
            std::thread::spawn(move || {
                let _permit = semaphore.acquire();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.join().unwrap();
    }
}
