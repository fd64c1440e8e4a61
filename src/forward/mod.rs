//! The 'forward' module contains forward-declarations for the services this crate consumes but does not implement:
//! the interrupt priority register, CPU identification and halting (arch), and blocking/waking threads (scheduler).
//!
//! The kernel installs one implementation of each at boot, before any other function of this crate is used.
//! Host tests install a simulator instead.
//!
//! These functions may always be assumed to be safe.

pub mod arch;
pub mod scheduler;

use crate::logging::klog;
use crate::{SyncError,SyncResult};
pub use arch::{ArchHooks,CpuId};
pub use scheduler::{SchedulerHooks,ThreadId,BlockOutcome};

struct Hooks {
    arch: &'static dyn ArchHooks,
    scheduler: &'static dyn SchedulerHooks,
}
static HOOKS: spin::Once<Hooks> = spin::Once::new();

/// Install the architecture and scheduler hooks. May only succeed once; later calls return `InUse`.
pub fn install(arch: &'static dyn ArchHooks, scheduler: &'static dyn SchedulerHooks) -> SyncResult<()> {
    let mut installed_now = false;
    HOOKS.call_once(|| { installed_now = true; Hooks { arch, scheduler } });
    if !installed_now { return Err(SyncError::InUse); }

    klog!(Info, ROOT, "Forward hooks installed.");
    Ok(())
}
/// Returns true once [install] has succeeded
pub fn is_installed() -> bool {
    HOOKS.is_completed()
}

#[inline]
pub(crate) fn try_arch() -> Option<&'static dyn ArchHooks> {
    HOOKS.get().map(|h|h.arch)
}
#[inline]
#[track_caller]
pub(crate) fn arch() -> &'static dyn ArchHooks {
    match HOOKS.get() {
        Some(hooks) => hooks.arch,
        None => not_installed(),
    }
}
#[inline]
#[track_caller]
pub(crate) fn scheduler() -> &'static dyn SchedulerHooks {
    match HOOKS.get() {
        Some(hooks) => hooks.scheduler,
        None => not_installed(),
    }
}

#[cold]
#[track_caller]
fn not_installed() -> ! {
    crate::panic::kernel_fatal(format_args!("forward hooks used before install (at {})", core::panic::Location::caller()))
}
