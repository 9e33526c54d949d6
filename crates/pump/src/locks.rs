//! One lock per physical relay pin. Two channels wired to the same pin
//! serialize here; the second waits until the first has driven the pin off.
//!
//! Locks are semaphore-backed rather than guard-based so that release is an
//! explicit, synchronous call that can also run from a drop guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;

use crate::error::LockError;

struct PinLock {
    permit: Semaphore,
    held: AtomicBool,
}

impl PinLock {
    fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
            held: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
pub struct LockTable {
    pins: Mutex<HashMap<u8, Arc<PinLock>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, pin: u8) -> Arc<PinLock> {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pins.entry(pin).or_insert_with(|| Arc::new(PinLock::new())))
    }

    /// Wait until `pin` is free and take it. No timeout: whoever holds the
    /// pin is mid-cycle and always releases on exit.
    pub async fn acquire(&self, pin: u8) -> Result<(), LockError> {
        let lock = self.lock_for(pin);
        let permit = lock
            .permit
            .acquire()
            .await
            .map_err(|_| LockError::Closed(pin))?;
        permit.forget();
        lock.held.store(true, Ordering::SeqCst);
        tracing::debug!(pin, "pin lock acquired");
        Ok(())
    }

    /// Take `pin` only if it is free right now.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn try_acquire(&self, pin: u8) -> bool {
        let lock = self.lock_for(pin);
        let acquired = match lock.permit.try_acquire() {
            Ok(permit) => {
                permit.forget();
                lock.held.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        };
        acquired
    }

    /// Free `pin`. Releasing a pin that is not held is reported, not fatal.
    pub fn release(&self, pin: u8) -> Result<(), LockError> {
        let lock = self.lock_for(pin);
        if lock.held.swap(false, Ordering::SeqCst) {
            lock.permit.add_permits(1);
            tracing::debug!(pin, "pin lock released");
            Ok(())
        } else {
            Err(LockError::AlreadyFree(pin))
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_held(&self, pin: u8) -> bool {
        self.lock_for(pin).held.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_then_release() {
        let locks = LockTable::new();
        locks.acquire(5).await.unwrap();
        assert!(locks.is_held(5));
        locks.release(5).unwrap();
        assert!(!locks.is_held(5));
    }

    #[test]
    fn release_free_pin_is_already_free() {
        let locks = LockTable::new();
        assert_eq!(locks.release(5), Err(LockError::AlreadyFree(5)));
    }

    #[test]
    fn double_release_reports_second() {
        let locks = LockTable::new();
        assert!(locks.try_acquire(5));
        assert_eq!(locks.release(5), Ok(()));
        assert_eq!(locks.release(5), Err(LockError::AlreadyFree(5)));
        // A stray release must not leave an extra permit behind.
        assert!(locks.try_acquire(5));
        assert!(!locks.try_acquire(5));
    }

    #[test]
    fn pins_are_independent() {
        let locks = LockTable::new();
        assert!(locks.try_acquire(5));
        assert!(locks.try_acquire(6));
        assert!(!locks.try_acquire(5));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_waits_for_release() {
        let locks = Arc::new(LockTable::new());
        locks.acquire(5).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(5).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        locks.release(5).unwrap();
        waiter.await.unwrap().unwrap();
        assert!(locks.is_held(5));
    }
}
