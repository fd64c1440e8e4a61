//! Fatal error path.
//!
//! Conditions that mean the kernel's own invariants are broken (IRQL going the wrong way,
//! blocking where the scheduler cannot run) are never returned as errors. They are reported
//! here and the CPU is halted through the architecture hooks.

use core::fmt;
use core::panic::Location;
use core::sync::atomic::{AtomicUsize,Ordering};
use crate::forward;
use crate::logging::klog;
use crate::multitasking::{ExecutionContext,Irql};

// This counts fatal reports across all CPUs
// If it is non-zero when a fatal error occurs, the report is marked as secondary (the system is probably already going down)
static _FATAL_REPORTS: AtomicUsize = AtomicUsize::new(0);

/// Report a fatal error and halt the current CPU.
pub fn kernel_fatal(args: fmt::Arguments<'_>) -> ! {
    let context = ExecutionContext::current();
    let previous = _FATAL_REPORTS.fetch_add(1, Ordering::SeqCst);
    if previous == 0 {
        klog!(Fatal, ROOT, "KERNEL FATAL at {}: {}", context, args);
    } else {
        klog!(Fatal, ROOT, "KERNEL FATAL at {} (secondary, {} before it): {}", context, previous, args);
    }

    match forward::try_arch() {
        Some(arch) => arch.halt(format_args!("{} (at {})", args, context)),
        // Nothing is installed that knows how to stop this CPU
        None => panic!("kernel fatal before hooks were installed: {}", args),
    }
}

/// Number of fatal errors reported since boot.
pub fn fatal_report_count() -> usize {
    _FATAL_REPORTS.load(Ordering::Relaxed)
}

#[cold]
pub(crate) fn irql_violation(operation: &str, requested: Irql, current: Irql, caller: &'static Location<'static>) -> ! {
    #[cfg(feature="dbg_track_irql_source")]
    if let Some(source) = crate::multitasking::cpulocal::try_get_current().and_then(|cpu|cpu.irql_raise_source()) {
        kernel_fatal(format_args!("IRQL_NOT_{}: requested {} while at {} (called from {}, current level raised at {})", operation, requested, current, caller, source))
    }
    kernel_fatal(format_args!("IRQL_NOT_{}: requested {} while at {} (called from {})", operation, requested, current, caller))
}
