//! Interrupt request levels.
//!
//! The IRQL is a per-CPU priority: while a CPU runs at some level, no interrupt at or below that level
//! is delivered to it, and (from DISPATCH upwards) the scheduler will not switch threads.
//! The level may only go up with [raise] and back down with [lower]; anything else is a fatal error.
//!
//! The CPU-local block caches the current level, but the hardware register is the source of truth:
//! every operation first resynchronises the cache with [ArchHooks::current_priority](crate::forward::ArchHooks::current_priority),
//! so an interrupt entry that raised the hardware priority behind our back is picked up.

use core::fmt;
use core::marker::PhantomData;
use core::panic::Location;
use crate::{SyncError,SyncResult};
use crate::forward;
use crate::logging::klog;
use super::cpulocal::{self,CpuLocalBlock};
use super::dpc;

#[derive(Debug,Clone,Copy,PartialEq,Eq,PartialOrd,Ord,Hash)]
#[repr(transparent)]
pub struct Irql(u8);
impl Irql {
    /// Ordinary thread execution. Everything may preempt.
    pub const PASSIVE: Self = Self(0);
    /// Asynchronous procedure calls are masked.
    pub const APC: Self = Self(1);
    /// Thread dispatching is masked. Spinlocks, DPCs and wait list guards live here.
    pub const DISPATCH: Self = Self(2);
    pub const DEVICE_MIN: Self = Self(3);
    pub const DEVICE_MAX: Self = Self(12);
    pub const CLOCK: Self = Self(13);
    pub const IPI: Self = Self(14);
    /// Every maskable interrupt is masked.
    pub const HIGH: Self = Self(15);

    pub const fn new(level: u8) -> SyncResult<Self> {
        if level > Self::HIGH.0 { Err(SyncError::InvalidArgument) }
        else { Ok(Self(level)) }
    }
    /// For values read back from a register or atomic. Only the low four bits are meaningful.
    #[inline(always)]
    pub(crate) const fn from_bits_truncate(raw: u8) -> Self {
        Self(raw & 0x0F)
    }
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.0
    }
    pub const fn is_device(self) -> bool {
        self.0 >= Self::DEVICE_MIN.0 && self.0 <= Self::DEVICE_MAX.0
    }
}
impl fmt::Display for Irql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PASSIVE => write!(f, "PASSIVE_LEVEL"),
            Self::APC => write!(f, "APC_LEVEL"),
            Self::DISPATCH => write!(f, "DISPATCH_LEVEL"),
            Self::CLOCK => write!(f, "CLOCK_LEVEL"),
            Self::IPI => write!(f, "IPI_LEVEL"),
            Self::HIGH => write!(f, "HIGH_LEVEL"),
            Self(level) => write!(f, "DEVICE_LEVEL({})", level),
        }
    }
}

/// What last raised a CPU's IRQL. Recorded with the `dbg_track_irql_source` feature.
#[derive(Debug,Clone,Copy,PartialEq,Eq)]
pub enum RaiseSource {
    Caller(&'static Location<'static>),
    /// Address of the spinlock whose acquisition raised it
    SpinLock(usize),
}
impl fmt::Display for RaiseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller(location) => write!(f, "{}", location),
            Self::SpinLock(address) => write!(f, "spinlock {:#x}", address),
        }
    }
}

/// Bring the cached level in line with what the hardware is enforcing, and return it.
#[inline]
fn synchronize(cpu: &CpuLocalBlock) -> Irql {
    let cached = cpu.cached_irql();
    let hardware = forward::arch().current_priority(cached);
    if hardware != cached {
        klog!(Debug, IRQL, "Cached IRQL {} out of sync with hardware, adopting {}.", cached, hardware);
        cpu.store_irql(hardware);
    }
    hardware
}
#[inline]
fn program(cpu: &CpuLocalBlock, level: Irql) {
    forward::arch().set_priority(level);
    cpu.store_irql(level);
}

/// The current IRQL of this CPU.
pub fn get() -> Irql {
    synchronize(cpulocal::get_current())
}

/// Raise the IRQL to `to`, returning the previous level. Raising to the current level is allowed.
/// Fatal if `to` is below the current level.
#[track_caller]
pub fn raise(to: Irql) -> Irql {
    let cpu = cpulocal::get_current();
    let current = synchronize(cpu);
    if to < current {
        crate::panic::irql_violation("GREATER_OR_EQUAL", to, current, Location::caller());
    }
    if to != current {
        program(cpu, to);
        #[cfg(feature="dbg_track_irql_source")]
        cpu.record_irql_raise_source(RaiseSource::Caller(Location::caller()));
    }
    current
}

/// Raise to `max(current, to)`, returning the previous level. Never fatal.
#[track_caller]
pub fn raise_at_least(to: Irql) -> Irql {
    raise_at_least_from(to, RaiseSource::Caller(Location::caller()))
}
/// [raise_at_least] on behalf of the spinlock at `lock`.
pub(crate) fn raise_for_spinlock(to: Irql, lock: usize) -> Irql {
    raise_at_least_from(to, RaiseSource::SpinLock(lock))
}
#[inline]
fn raise_at_least_from(to: Irql, source: RaiseSource) -> Irql {
    let cpu = cpulocal::get_current();
    let current = synchronize(cpu);
    if to > current {
        program(cpu, to);
        #[cfg(feature="dbg_track_irql_source")]
        cpu.record_irql_raise_source(source);
    }
    #[cfg(not(feature="dbg_track_irql_source"))]
    let _ = source;
    current
}

/// Shorthand for `raise(Irql::DISPATCH)`.
#[track_caller]
pub fn raise_to_dispatch() -> Irql {
    raise(Irql::DISPATCH)
}

/// Lower the IRQL to `to`. Fatal if `to` is above the current level.
///
/// If this crosses below DISPATCH and DPCs are queued on this CPU, they are run (at DISPATCH) before
/// the final level is set.
#[track_caller]
pub fn lower(to: Irql) {
    let cpu = cpulocal::get_current();
    let mut current = synchronize(cpu);
    if to > current {
        crate::panic::irql_violation("LESS_OR_EQUAL", to, current, Location::caller());
    }
    if to < Irql::DISPATCH && cpu.is_dpc_active() {
        crate::panic::kernel_fatal(format_args!("DPC lowered IRQL to {} while its queue was being drained (called from {})", to, Location::caller()));
    }

    loop {
        if to < Irql::DISPATCH && current >= Irql::DISPATCH {
            while cpu.dpc_queue().has_pending() {
                if current != Irql::DISPATCH { program(cpu, Irql::DISPATCH); current = Irql::DISPATCH; }
                dpc::drain(cpu);
            }
        }
        if current != to { program(cpu, to); }

        // An interrupt may have queued a DPC between the final drain and the drop below DISPATCH
        if to < Irql::DISPATCH && cpu.dpc_queue().has_pending() {
            program(cpu, Irql::DISPATCH); current = Irql::DISPATCH;
            continue;
        }
        break;
    }
}

/// Holds the IRQL raised until dropped, then lowers it back to where it was.
#[must_use]
pub struct IrqlGuard {
    previous: Irql,
    // the level belongs to the CPU that raised it
    _not_send: PhantomData<*const ()>,
}
impl IrqlGuard {
    pub fn previous(&self) -> Irql {
        self.previous
    }
}
impl Drop for IrqlGuard {
    fn drop(&mut self) {
        lower(self.previous)
    }
}

/// Raise to `to` (fatal if below the current level) and return a guard restoring the previous level.
#[track_caller]
pub fn raise_guard(to: Irql) -> IrqlGuard {
    IrqlGuard { previous: raise(to), _not_send: PhantomData }
}

/// Run the closure at `to` (or the current level, if that is higher).
pub fn with_irql<R>(to: Irql, closure: impl FnOnce()->R) -> R {
    let previous = raise_at_least(to);
    let result = closure();
    lower(previous);
    result
}
