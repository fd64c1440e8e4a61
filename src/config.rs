//! Compile-time configuration.
//! (log filters are configured per-context in logging::contexts)

use crate::multitasking::Irql;

/// Number of slots in the CPU-local registry.
// The host simulator maps every test thread to its own CPU, so it needs far more
pub const MAX_CPUS: usize = if cfg!(test) { 4096 } else { 256 };

/// CAS attempts a mutex makes before putting the caller to sleep
pub const MUTEX_SPIN_LIMIT: usize = 64;

/// Most objects a single wait_any call may wait on
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Level spinlocks (and so every wait list guard) raise to unless told otherwise
pub const DEFAULT_SPINLOCK_IRQL: Irql = Irql::DISPATCH;
