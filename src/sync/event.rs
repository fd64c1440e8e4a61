use core::sync::atomic::{AtomicU8,Ordering};
use crate::SyncResult;
use super::waitlist::{self,SignalPolicy,Waitable,WaitableHeader};

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
#[repr(u8)]
pub enum EventKind {
    /// Setting wakes every waiter, and the event stays set until reset.
    Notification = 0,
    /// Setting wakes exactly one waiter and the event clears itself.
    /// With nobody waiting it stays set until the next waiter consumes it.
    Synchronization = 1,
}
impl EventKind {
    const fn policy(self) -> SignalPolicy {
        match self {
            Self::Notification => SignalPolicy::Sticky,
            Self::Synchronization => SignalPolicy::AutoReset,
        }
    }
}

pub struct Event {
    header: WaitableHeader,
    kind: AtomicU8,
}
impl Event {
    pub const fn new(kind: EventKind, signaled: bool) -> Self {
        Self {
            header: WaitableHeader::with_state(kind.policy(), signaled),
            kind: AtomicU8::new(kind as u8),
        }
    }
    /// An event that must be [initialize](Self::initialize)d before use.
    pub const fn uninitialized() -> Self {
        Self {
            header: WaitableHeader::uninitialized(),
            kind: AtomicU8::new(EventKind::Notification as u8),
        }
    }
    pub fn initialize(&self, kind: EventKind, signaled: bool) {
        self.kind.store(kind as u8, Ordering::Relaxed);
        self.header.initialize(kind.policy(), signaled);
    }

    pub fn kind(&self) -> EventKind {
        match self.kind.load(Ordering::Relaxed) {
            1 => EventKind::Synchronization,
            _ => EventKind::Notification,
        }
    }
    fn wake_limit(&self) -> usize {
        match self.kind() {
            EventKind::Notification => usize::MAX,
            EventKind::Synchronization => 1,
        }
    }

    /// Signal the event. Returns whether it was already signaled.
    pub fn set(&self, boost: bool) -> SyncResult<bool> {
        self.header.check_initialized()?;
        let mut state = self.header.lock();
        let previous = state.is_signaled();
        waitlist::signal_locked(&self.header, &mut state, self.wake_limit(), boost);
        Ok(previous)
    }
    /// Wake whoever is waiting right now, then leave the event unsignaled.
    pub fn pulse(&self, boost: bool) -> SyncResult<bool> {
        self.header.check_initialized()?;
        let mut state = self.header.lock();
        let previous = state.is_signaled();
        waitlist::signal_locked(&self.header, &mut state, self.wake_limit(), boost);
        state.set_signaled(false);
        Ok(previous)
    }
    /// Unsignal the event. Returns whether it was signaled.
    pub fn reset(&self) -> SyncResult<bool> {
        self.header.check_initialized()?;
        Ok(self.header.clear_signaled_state())
    }
    /// Unsignal the event.
    pub fn clear(&self) -> SyncResult<()> {
        self.reset().map(|_|())
    }
    pub fn get_state(&self) -> bool {
        self.header.is_signaled()
    }

    /// Block until the event is signaled.
    #[track_caller]
    pub fn wait(&self) -> SyncResult<()> {
        waitlist::wait_on(self)
    }
    #[track_caller]
    pub fn wait_timeout(&self, timeout: core::time::Duration) -> SyncResult<()> {
        waitlist::wait_on_timeout(self, Some(timeout))
    }
}
impl Waitable for Event {
    fn header(&self) -> &WaitableHeader { &self.header }
}
