use core::sync::atomic::{AtomicUsize,Ordering};
use crate::{SyncError,SyncResult};
use crate::forward::ThreadId;
use super::waitlist::{self,SignalPolicy,Waitable,WaitableHeader,WaitState};

/// A counting semaphore. `count` never exceeds `limit`.
pub struct Semaphore {
    header: WaitableHeader,
    count: AtomicUsize,
    limit: usize,
}
impl Semaphore {
    pub const fn new(initial: usize) -> Self {
        Self {
            header: WaitableHeader::new(SignalPolicy::Edge),
            count: AtomicUsize::new(initial),
            limit: usize::MAX,
        }
    }
    /// A semaphore whose count may never be released past `limit`.
    pub fn with_limit(initial: usize, limit: usize) -> SyncResult<Self> {
        if initial > limit { return Err(SyncError::InvalidArgument); }
        Ok(Self { limit, ..Self::new(initial) })
    }

    fn try_take(&self) -> bool {
        let mut count = self.count.load(Ordering::Relaxed);
        loop {
            if count == 0 { return false; }
            match self.count.compare_exchange_weak(count, count-1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Take one unit, sleeping until one is available.
    #[track_caller]
    pub fn acquire(&self) -> SyncResult<()> {
        if self.try_take() { return Ok(()); }
        waitlist::wait_until(self, None, |_|self.try_take())
    }
    pub fn try_acquire(&self) -> SyncResult<()> {
        if self.try_take() { Ok(()) } else { Err(SyncError::WouldBlock) }
    }

    /// Return `units` to the semaphore and wake up to that many waiters.
    /// Returns the previous count, or `InvalidArgument` if the count would pass the limit.
    pub fn release(&self, units: usize) -> SyncResult<usize> {
        if units == 0 { return Err(SyncError::InvalidArgument); }
        let mut state = self.header.lock();
        let mut previous = self.count.load(Ordering::Relaxed);
        loop {
            let next = match previous.checked_add(units) {
                Some(next) if next <= self.limit => next,
                _ => return Err(SyncError::InvalidArgument),
            };
            match self.count.compare_exchange_weak(previous, next, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => previous = actual,
            }
        }
        waitlist::signal_locked(&self.header, &mut state, units, false);
        Ok(previous)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
    pub fn limit(&self) -> usize {
        self.limit
    }
}
impl Waitable for Semaphore {
    fn header(&self) -> &WaitableHeader { &self.header }
    /// Waiting on the semaphore takes a unit.
    fn try_satisfy(&self, _state: &mut WaitState, _thread: ThreadId, _woken: bool) -> SyncResult<bool> {
        Ok(self.try_take())
    }
}
