//! IRQL-raising spinlocks.
//!
//! Taking the lock raises the IRQL to the lock's minimum level (DISPATCH unless chosen otherwise)
//! before spinning, so the holder can neither be preempted nor interrupted by anything that might
//! try to take the same lock. Releasing it lowers back to the level it was taken from.
//! The scheduler is never involved; taking a lock the current CPU already holds deadlocks.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool,AtomicU8,Ordering};
use lock_api::{RawMutex,GuardNoSend};
use spin::relax::{RelaxStrategy,Spin};
use crate::config::DEFAULT_SPINLOCK_IRQL;
use crate::multitasking::{irql,Irql};

pub struct RawSpinLock<R:RelaxStrategy=Spin> {
    locked: AtomicBool,
    /// level to return to on unlock (only touched by the holder)
    saved_irql: AtomicU8,
    minimum_irql: Irql,
    _relax: PhantomData<R>,
}
impl<R:RelaxStrategy> RawSpinLock<R> {
    pub const fn at(minimum_irql: Irql) -> Self {
        Self {
            locked: AtomicBool::new(false),
            saved_irql: AtomicU8::new(0),
            minimum_irql,
            _relax: PhantomData,
        }
    }
    pub fn minimum_irql(&self) -> Irql {
        self.minimum_irql
    }
    fn address(&self) -> usize {
        self as *const Self as usize
    }
}
unsafe impl<R:RelaxStrategy> RawMutex for RawSpinLock<R> {
    const INIT: Self = Self::at(DEFAULT_SPINLOCK_IRQL);
    // The guard restores the IRQL of the CPU that took it
    type GuardMarker = GuardNoSend;

    fn lock(&self) {
        let previous = irql::raise_for_spinlock(self.minimum_irql, self.address());
        while self.locked.compare_exchange_weak(false,true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            while self.locked.load(Ordering::Relaxed) { R::relax() }
        }
        self.saved_irql.store(previous.raw(), Ordering::Relaxed);
    }
    fn try_lock(&self) -> bool {
        let previous = irql::raise_for_spinlock(self.minimum_irql, self.address());
        if self.locked.compare_exchange(false,true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            self.saved_irql.store(previous.raw(), Ordering::Relaxed);
            true
        } else {
            irql::lower(previous);
            false
        }
    }
    unsafe fn unlock(&self) {
        let previous = Irql::from_bits_truncate(self.saved_irql.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
        irql::lower(previous);
    }
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinLock,T>;
pub type SpinLockGuard<'a,T> = lock_api::MutexGuard<'a,RawSpinLock,T>;
pub type MappedSpinLockGuard<'a,T> = lock_api::MappedMutexGuard<'a,RawSpinLock,T>;

/// A spinlock that raises to `level` instead of DISPATCH. Locks taken from interrupt handlers need the handler's level (or above).
pub const fn spinlock_at<T>(level: Irql, value: T) -> SpinLock<T> {
    lock_api::Mutex::from_raw(RawSpinLock::at(level), value)
}
