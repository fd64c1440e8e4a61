use core::fmt;
use core::num::NonZeroUsize;
use core::time::Duration;

/// Opaque handle for a thread, handed out by the scheduler.
/// Primitives only ever store it to wake the thread later; they never own the thread.
#[derive(Debug,Clone,Copy,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub struct ThreadId(NonZeroUsize);
impl ThreadId {
    pub const fn new(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
    pub const fn get(self) -> usize {
        self.0.get()
    }
}
impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum BlockOutcome {
    /// `make_ready` was called for this thread (possibly before it blocked)
    Woken,
    TimedOut,
}

/// What the synchronization core needs from the scheduler.
pub trait SchedulerHooks: Sync {
    /// Take the current thread off the run queue and switch away.
    /// `release` must be called exactly once, after the thread is marked as blocked and before another thread runs
    /// (it drops the wait list guard the caller was holding).
    /// A `make_ready` that arrives before the thread actually sleeps must not be lost.
    /// Returns early (without a wake) once `timeout` has elapsed.
    fn block_current(&self, release: &mut dyn FnMut(), timeout: Option<Duration>) -> BlockOutcome;
    /// Put a blocked thread back on the run queue. `boost` asks for a temporary priority increase.
    fn make_ready(&self, thread: ThreadId, boost: bool);
    /// Give up the rest of the current time slice.
    fn yield_now(&self);
    /// Monotonic time since boot.
    fn now(&self) -> Duration;
}
