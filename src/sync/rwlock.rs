//! Reader/writer locks.
//!
//! The lock state is a single word: the WRITER bit, or the number of readers. Readers and writers sleep on
//! separate headers. The policy is writer preference: once a writer is waiting, new readers queue behind it,
//! so a thread taking the lock shared while it already holds it shared can deadlock.

use core::sync::atomic::{AtomicBool,AtomicUsize,Ordering};
use crate::{SyncError,SyncResult};
use crate::forward::ThreadId;
use crate::multitasking;
use super::waitlist::{self,SignalPolicy,Waitable,WaitableHeader,WaitState};

const WRITER: usize = 1<<(usize::BITS-1);

/// Shared core of [RwLock] and [Pushlock](super::Pushlock).
pub(super) struct SharedExclusive {
    state: AtomicUsize,
    current_writer: AtomicUsize,
    waiting_writers: AtomicUsize,
    waiting_readers: AtomicUsize,
    aborted: AtomicBool,
    readers: WaitableHeader,
    writers: WaitableHeader,
}
impl SharedExclusive {
    pub(super) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            current_writer: AtomicUsize::new(0),
            waiting_writers: AtomicUsize::new(0),
            waiting_readers: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            readers: WaitableHeader::new(SignalPolicy::Edge),
            writers: WaitableHeader::new(SignalPolicy::Edge),
        }
    }

    fn try_read(&self) -> bool {
        if self.waiting_writers.load(Ordering::Acquire) > 0 { return false; }
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & WRITER != 0 { return false; }
            match self.state.compare_exchange_weak(state, state+1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }
    pub(super) fn try_write(&self, me: ThreadId) -> bool {
        if self.state.compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed).is_err() { return false; }
        self.current_writer.store(me.get(), Ordering::Relaxed);
        true
    }
    fn check_aborted(&self) -> SyncResult<()> {
        if self.aborted.load(Ordering::Acquire) { Err(SyncError::Cancelled) } else { Ok(()) }
    }

    #[track_caller]
    pub(super) fn acquire_shared(&self) -> SyncResult<()> {
        self.check_aborted()?;
        if self.try_read() { return Ok(()); }
        let mut counted = false;
        waitlist::wait_until_try(&self.readers, None, |_| {
            if counted { self.waiting_readers.fetch_sub(1, Ordering::AcqRel); counted = false; }
            if let Err(error) = self.check_aborted() { return Some(Err(error)); }
            if self.try_read() { return Some(Ok(())); }
            self.waiting_readers.fetch_add(1, Ordering::AcqRel); counted = true;
            None
        })?
    }
    pub(super) fn try_acquire_shared(&self) -> SyncResult<()> {
        self.check_aborted()?;
        if self.try_read() { Ok(()) } else { Err(SyncError::WouldBlock) }
    }
    pub(super) fn release_shared(&self) -> SyncResult<()> {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & WRITER != 0 || state == 0 { return Err(SyncError::InvalidArgument); }
            match self.state.compare_exchange_weak(state, state-1, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        // Last reader out lets a writer in
        if state == 1 { waitlist::signal_waiting_threads(&self.writers, false, false); }
        Ok(())
    }

    #[track_caller]
    pub(super) fn acquire_exclusive(&self) -> SyncResult<()> {
        let me = waitlist::blocking_thread();
        self.check_aborted()?;
        if self.try_write(me) { return Ok(()); }
        let mut counted = false;
        waitlist::wait_until_try(&self.writers, None, |_| {
            if counted { self.waiting_writers.fetch_sub(1, Ordering::AcqRel); counted = false; }
            if let Err(error) = self.check_aborted() { return Some(Err(error)); }
            if self.try_write(me) { return Some(Ok(())); }
            self.waiting_writers.fetch_add(1, Ordering::AcqRel); counted = true;
            None
        })?
    }
    pub(super) fn try_acquire_exclusive(&self) -> SyncResult<()> {
        self.check_aborted()?;
        let me = multitasking::current_thread().ok_or(SyncError::AccessDenied)?;
        if self.try_write(me) { Ok(()) } else { Err(SyncError::WouldBlock) }
    }
    pub(super) fn release_exclusive(&self) -> SyncResult<()> {
        let me = multitasking::current_thread().ok_or(SyncError::AccessDenied)?;
        if self.state.load(Ordering::Relaxed) != WRITER || self.current_writer.load(Ordering::Relaxed) != me.get() {
            return Err(SyncError::AccessDenied);
        }
        self.current_writer.store(0, Ordering::Relaxed);
        self.state.store(0, Ordering::Release);
        // One writer, or (if none are waiting) every reader
        if waitlist::signal_waiting_threads(&self.writers, false, false) == 0 {
            waitlist::signal_waiting_threads(&self.readers, true, false);
        }
        Ok(())
    }

    pub(super) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        waitlist::signal_waiting_threads(&self.writers, true, false);
        waitlist::signal_waiting_threads(&self.readers, true, false);
    }
    pub(super) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(super) fn reader_count(&self) -> usize {
        let state = self.state.load(Ordering::Relaxed);
        if state & WRITER != 0 { 0 } else { state }
    }
    pub(super) fn current_writer(&self) -> Option<ThreadId> {
        ThreadId::new(self.current_writer.load(Ordering::Relaxed))
    }
    pub(super) fn waiting_reader_count(&self) -> usize {
        self.waiting_readers.load(Ordering::Relaxed)
    }
    pub(super) fn waiting_writer_count(&self) -> usize {
        self.waiting_writers.load(Ordering::Relaxed)
    }
    pub(super) fn writers_header(&self) -> &WaitableHeader {
        &self.writers
    }
}

/// A sleeping reader/writer lock that can be aborted, failing every current and future acquire with `Cancelled`.
pub struct RwLock(SharedExclusive);
impl RwLock {
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

    /// Wake every waiter with `Cancelled`, and refuse all later acquires.
    pub fn abort(&self) {
        self.0.abort()
    }
    pub fn is_aborted(&self) -> bool {
        self.0.is_aborted()
    }

    pub fn reader_count(&self) -> usize {
        self.0.reader_count()
    }
    pub fn current_writer(&self) -> Option<ThreadId> {
        self.0.current_writer()
    }
    pub fn waiting_writer_count(&self) -> usize {
        self.0.waiting_writer_count()
    }
}
impl Waitable for RwLock {
    /// Writers' header
    fn header(&self) -> &WaitableHeader { self.0.writers_header() }
    /// Waiting on the lock takes it exclusively. Fails with `Cancelled` once it has been aborted.
    fn try_satisfy(&self, _state: &mut WaitState, thread: ThreadId, _woken: bool) -> SyncResult<bool> {
        self.0.check_aborted()?;
        Ok(self.0.try_write(thread))
    }
}
