//! WaitLocks
//!
//! WaitLocks are kernel locking primitives based on the waitable header: contenders sleep instead of spinning.

use core::sync::atomic::{AtomicBool,AtomicUsize,Ordering};
use lock_api::{RawMutex,GuardNoSend};
use crate::{SyncError,SyncResult};
use crate::config::MUTEX_SPIN_LIMIT;
use crate::forward::ThreadId;
use crate::multitasking;
use super::waitlist::{self,SignalPolicy,Waitable,WaitableHeader,WaitState};

/// A sleeping mutex with an owner. Only the owner may release it, and it is not re-entrant.
pub struct WaitMutex {
    header: WaitableHeader,
    locked: AtomicBool,
    // ThreadId of the owner, or 0
    owner: AtomicUsize,
}
impl WaitMutex {
    pub const fn new() -> Self {
        Self {
            header: WaitableHeader::new(SignalPolicy::Edge),
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
        }
    }

    fn try_claim(&self, me: ThreadId) -> bool {
        if self.locked.compare_exchange(false,true, Ordering::Acquire, Ordering::Relaxed).is_err() { return false; }
        self.owner.store(me.get(), Ordering::Relaxed);
        true
    }

    /// Acquire the mutex, spinning briefly and then sleeping until it is free.
    #[track_caller]
    pub fn acquire(&self) -> SyncResult<()> {
        let me = waitlist::blocking_thread();
        for _ in 0..MUTEX_SPIN_LIMIT {
            if self.try_claim(me) { return Ok(()); }
            core::hint::spin_loop();
        }
        // Wakes are advisory: whoever is woken still has to win the CAS
        waitlist::wait_until(self, None, |_|self.try_claim(me))
    }
    /// Acquire the mutex if it is free, without blocking.
    pub fn try_acquire(&self) -> SyncResult<()> {
        let me = multitasking::current_thread().ok_or(SyncError::AccessDenied)?;
        if self.try_claim(me) { Ok(()) } else { Err(SyncError::WouldBlock) }
    }
    /// Release the mutex. Fails with `AccessDenied` unless the calling thread owns it.
    pub fn release(&self) -> SyncResult<()> {
        let me = multitasking::current_thread().ok_or(SyncError::AccessDenied)?;
        if self.owner.load(Ordering::Relaxed) != me.get() || !self.is_locked() { return Err(SyncError::AccessDenied); }
        self.owner.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        waitlist::signal_waiting_threads(self, false, false);
        Ok(())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::new(self.owner.load(Ordering::Relaxed))
    }
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
impl Waitable for WaitMutex {
    fn header(&self) -> &WaitableHeader { &self.header }
    /// Waiting on the mutex acquires it.
    fn try_satisfy(&self, _state: &mut WaitState, thread: ThreadId, _woken: bool) -> SyncResult<bool> {
        Ok(self.try_claim(thread))
    }
}
unsafe impl RawMutex for WaitMutex {
    // Ownership is per-thread
    type GuardMarker = GuardNoSend;
    const INIT: Self = Self::new();

    fn lock(&self) {
        if let Err(error) = self.acquire() {
            crate::panic::kernel_fatal(format_args!("WMutex lock failed: {}", error))
        }
    }
    fn try_lock(&self) -> bool {
        self.try_acquire().is_ok()
    }
    unsafe fn unlock(&self) {
        if let Err(error) = self.release() {
            crate::panic::kernel_fatal(format_args!("WMutex unlock failed: {}", error))
        }
    }
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
pub type WMutex<T> = lock_api::Mutex<WaitMutex,T>;
pub type WMutexGuard<'a,T> = lock_api::MutexGuard<'a,WaitMutex,T>;
pub type MappedWMutexGuard<'a,T> = lock_api::MappedMutexGuard<'a,WaitMutex,T>;
