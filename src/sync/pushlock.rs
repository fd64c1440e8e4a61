use lock_api::{RawRwLock,GuardNoSend};
use crate::SyncResult;
use crate::forward::ThreadId;
use super::rwlock::SharedExclusive;
use super::waitlist::{Waitable,WaitableHeader,WaitState};

/// A lightweight reader/writer lock for guarding kernel data structures.
/// Same policy as [RwLock](super::RwLock) but without abort, and usable through `lock_api` as [PushRwLock].
pub struct Pushlock(SharedExclusive);
impl Pushlock {
    pub const fn new() -> Self {
        Self(SharedExclusive::new())
    }

    #[track_caller]
    pub fn acquire_shared(&self) -> SyncResult<()> { self.0.acquire_shared() }
    pub fn try_acquire_shared(&self) -> SyncResult<()> { self.0.try_acquire_shared() }
    pub fn release_shared(&self) -> SyncResult<()> { self.0.release_shared() }

    #[track_caller]
    pub fn acquire_exclusive(&self) -> SyncResult<()> { self.0.acquire_exclusive() }
    pub fn try_acquire_exclusive(&self) -> SyncResult<()> { self.0.try_acquire_exclusive() }
    pub fn release_exclusive(&self) -> SyncResult<()> { self.0.release_exclusive() }

    /// Number of readers currently sleeping until the lock is free of writers
    pub fn waiting_reader_count(&self) -> usize {
        self.0.waiting_reader_count()
    }
    pub fn reader_count(&self) -> usize {
        self.0.reader_count()
    }
    pub fn current_writer(&self) -> Option<ThreadId> {
        self.0.current_writer()
    }
}
impl Waitable for Pushlock {
    fn header(&self) -> &WaitableHeader { self.0.writers_header() }
    /// Waiting on the pushlock takes it exclusively.
    fn try_satisfy(&self, _state: &mut WaitState, thread: ThreadId, _woken: bool) -> SyncResult<bool> {
        Ok(self.0.try_write(thread))
    }
}

// Pushlocks are never aborted, so acquiring can only fail on a kernel bug
unsafe impl RawRwLock for Pushlock {
    // Exclusive ownership is per-thread
    type GuardMarker = GuardNoSend;
    const INIT: Self = Self::new();

    fn lock_shared(&self) {
        if let Err(error) = self.acquire_shared() {
            crate::panic::kernel_fatal(format_args!("PushRwLock lock_shared failed: {}", error))
        }
    }
    fn try_lock_shared(&self) -> bool {
        self.try_acquire_shared().is_ok()
    }
    unsafe fn unlock_shared(&self) {
        if let Err(error) = self.release_shared() {
            crate::panic::kernel_fatal(format_args!("PushRwLock unlock_shared failed: {}", error))
        }
    }

    fn lock_exclusive(&self) {
        if let Err(error) = self.acquire_exclusive() {
            crate::panic::kernel_fatal(format_args!("PushRwLock lock_exclusive failed: {}", error))
        }
    }
    fn try_lock_exclusive(&self) -> bool {
        self.try_acquire_exclusive().is_ok()
    }
    unsafe fn unlock_exclusive(&self) {
        if let Err(error) = self.release_exclusive() {
            crate::panic::kernel_fatal(format_args!("PushRwLock unlock_exclusive failed: {}", error))
        }
    }
}
pub type PushRwLock<T> = lock_api::RwLock<Pushlock,T>;
pub type PushRwLockReadGuard<'a,T> = lock_api::RwLockReadGuard<'a,Pushlock,T>;
pub type PushRwLockWriteGuard<'a,T> = lock_api::RwLockWriteGuard<'a,Pushlock,T>;
