//! x86_64 implementation of the architecture hooks.
//!
//! The IRQL is mirrored into CR8 (the task priority register), which masks every interrupt vector whose
//! priority class is at or below it. HIGH additionally clears IF, since CR8 cannot mask everything.
//! Interrupt stubs must program CR8 to the vector's level and re-enable interrupts before calling
//! [dispatch](crate::multitasking::interrupts::dispatch), otherwise the level reads back as HIGH.

use alloc::boxed::Box;
use core::fmt;
use x86_64::instructions::{self,interrupts};
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;
use crate::forward::{ArchHooks,CpuId};
use crate::multitasking::Irql;

pub struct X86_64Hooks;
pub static HOOKS: X86_64Hooks = X86_64Hooks;

#[inline(always)]
fn read_cr8() -> u8 {
    let value: u64;
    unsafe { core::arch::asm!("mov {}, cr8", out(reg) value, options(nomem, nostack, preserves_flags)); }
    value as u8
}
#[inline(always)]
fn write_cr8(value: u8) {
    unsafe { core::arch::asm!("mov cr8, {}", in(reg) value as u64, options(nomem, nostack, preserves_flags)); }
}

/// Point GS:0 at a word holding this CPU's id. Must run on the CPU in question, before anything else
/// in this crate is used on it.
pub fn store_cpu_id(id: CpuId) {
    // Leaked: lives as long as the CPU does
    let slot = Box::leak(Box::new(id)) as *mut CpuId as u64;
    #[allow(unused_unsafe)]
    unsafe { GsBase::write(VirtAddr::new(slot)); }
}

impl ArchHooks for X86_64Hooks {
    #[inline(always)]
    fn current_cpu(&self) -> CpuId {
        // GS:0 = cpu id
        let id: usize;
        unsafe {
            core::arch::asm!(
                "mov {x},gs:0",
                x = out(reg) id,
                options(nostack, preserves_flags, readonly),
            );
        }
        id
    }

    fn current_priority(&self, _cached: Irql) -> Irql {
        if !interrupts::are_enabled() { return Irql::HIGH; }
        Irql::from_bits_truncate(read_cr8())
    }

    fn set_priority(&self, level: Irql) {
        if level >= Irql::HIGH {
            interrupts::disable();
            write_cr8(level.raw());
        } else {
            write_cr8(level.raw());
            interrupts::enable();
        }
    }

    fn halt(&self, _report: fmt::Arguments<'_>) -> ! {
        // The report has already been logged by the fatal path
        interrupts::disable();
        loop { instructions::hlt(); }
    }
}
