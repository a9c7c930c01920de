//! This module implements some synchronization primitives that are used in
//! this crate.
//!

use std::sync::{Arc, Mutex};

/// A counting semaphore bounding the number of concurrently judged
/// submissions.
///
/// Only non-blocking acquisition is provided: when the pool is full the
/// admission loop requeues the message instead of waiting.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    capacity: usize,
    available: Mutex<usize>,
}

impl Semaphore {
    /// Create a semaphore with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            inner: Arc::new(SemaphoreInner {
                capacity,
                available: Mutex::new(capacity),
            }),
        }
    }

    /// Try to take one permit. Returns `None` when the pool is exhausted.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut available = self.inner.available.lock().unwrap();
        if *available == 0 {
            None
        } else {
            *available -= 1;
            Some(Permit { inner: self.inner.clone() })
        }
    }

    /// Number of permits currently available.
    pub fn available(&self) -> usize {
        *self.inner.available.lock().unwrap()
    }

    /// Total capacity of the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// An owned permit; dropping it returns the slot to the pool.
pub struct Permit {
    inner: Arc<SemaphoreInner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut available = self.inner.available.lock().unwrap();
        *available += 1;
        debug_assert!(*available <= self.inner.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded() {
        let semaphore = Semaphore::new(2);
        let first = semaphore.try_acquire().unwrap();
        let _second = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());
        assert_eq!(0, semaphore.available());

        drop(first);
        assert_eq!(1, semaphore.available());
        assert!(semaphore.try_acquire().is_some());
    }

    #[test]
    fn permit_moves_across_threads() {
        let semaphore = Semaphore::new(1);
        let permit = semaphore.try_acquire().unwrap();

        let handle = std::thread::spawn(move || drop(permit));
        handle.join().unwrap();

        assert_eq!(1, semaphore.available());
    }
}
