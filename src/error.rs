use core::fmt;

/// Recoverable failures of the synchronization primitives.
/// Broken kernel invariants are not errors: they go through [kernel_fatal](crate::panic::kernel_fatal).
#[derive(Debug,Clone,Copy,PartialEq,Eq,Hash)]
pub enum SyncError {
    /// A parameter was out of range, or the object was not in a state the call applies to
    InvalidArgument,
    /// The resource is already registered, initialised or queued
    InUse,
    /// The operation would have had to wait (or the futex word no longer matched)
    WouldBlock,
    /// The caller does not own what it tried to release
    AccessDenied,
    TimedOut,
    /// The object was aborted while (or before) the caller waited
    Cancelled,
    /// The object's header was never initialised
    Uninitialized,
}
impl SyncError {
    pub fn name(self) -> &'static str {
        use SyncError::*;
        match self {
            InvalidArgument => "invalid argument",
            InUse => "in use",
            WouldBlock => "would block",
            AccessDenied => "access denied",
            TimedOut => "timed out",
            Cancelled => "cancelled",
            Uninitialized => "uninitialized",
        }
    }
}
impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type SyncResult<T> = Result<T,SyncError>;
