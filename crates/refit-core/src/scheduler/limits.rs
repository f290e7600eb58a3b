//! Limit on concurrently running child processes.
//!
//! Worker threads and external processes are bounded separately: a pool of
//! eight workers may still be limited to two frontend subprocesses at a time.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Slots {
    available: Mutex<usize>,
    released: Condvar,
}

/// Counting semaphore for subprocesses. Cheap to clone; clones share slots.
#[derive(Debug, Clone)]
pub struct ProcessLimiter {
    slots: Arc<Slots>,
    capacity: usize,
}

impl ProcessLimiter {
    /// A limiter allowing `capacity` concurrent processes (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ProcessLimiter {
            slots: Arc::new(Slots {
                available: Mutex::new(capacity),
                released: Condvar::new(),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until a slot is free.
    pub fn acquire(&self) -> ProcessPermit {
        let mut available = self.slots.available.lock();
        while *available == 0 {
            self.slots.released.wait(&mut available);
        }
        *available -= 1;
        ProcessPermit {
            slots: Arc::clone(&self.slots),
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<ProcessPermit> {
        let mut available = self.slots.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(ProcessPermit {
            slots: Arc::clone(&self.slots),
        })
    }

    pub fn available(&self) -> usize {
        *self.slots.available.lock()
    }
}

impl Default for ProcessLimiter {
    fn default() -> Self {
        ProcessLimiter::new(4)
    }
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct ProcessPermit {
    slots: Arc<Slots>,
}

impl Drop for ProcessPermit {
    fn drop(&mut self) {
        *self.slots.available.lock() += 1;
        self.slots.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn permits_are_returned_on_drop() {
        let limiter = ProcessLimiter::new(2);
        let a = limiter.acquire();
        let _b = limiter.acquire();
        assert!(limiter.try_acquire().is_none());
        drop(a);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn never_exceeds_capacity() {
        let limiter = ProcessLimiter::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let limiter = limiter.clone();
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                scope.spawn(move || {
                    let _permit = limiter.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.available(), 2);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(ProcessLimiter::new(0).capacity(), 1);
    }
}
