//! Slots for memory- or CPU-heavy node functions.
//!
//! Graph scheduling never blocks on another key, but a heavy function body may block
//! its own worker while it waits for a slot here.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore handing out [`ResourceGuard`]s.
pub struct ResourceManager {
    available: Mutex<usize>,
    capacity: usize,
    released: Condvar,
}

impl ResourceManager {
    /// A manager with `capacity` slots. Zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            available: Mutex::new(capacity),
            capacity,
            released: Condvar::new(),
        }
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Block until a slot is free and take it.
    pub fn acquire(&self) -> ResourceGuard<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
        ResourceGuard { manager: self }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<ResourceGuard<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(ResourceGuard { manager: self })
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.released.notify_one();
    }
}

/// A held slot, returned on drop.
pub struct ResourceGuard<'a> {
    manager: &'a ResourceManager,
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.manager.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_guard_returns_slot() {
        let manager = ResourceManager::new(1);
        {
            let _guard = manager.acquire();
            assert_eq!(manager.available(), 0);
            assert!(manager.try_acquire().is_none());
        }
        assert_eq!(manager.available(), 1);
    }

    #[test]
    fn test_bounds_concurrency() {
        let manager = Arc::new(ResourceManager::new(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let active = active.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    let _guard = manager.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.available(), 2);
    }
}
