//! Per-CPU state.
//!
//! Each CPU gets exactly one [CpuLocalBlock], created at bring-up and never freed.
//! Blocks are registered in a fixed table indexed by CPU id, so finding the current CPU's block
//! is a single array access once [ArchHooks::current_cpu](crate::forward::ArchHooks::current_cpu) has answered.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU8,AtomicU32,AtomicUsize,Ordering};
#[cfg(feature="dbg_track_irql_source")]
use core::{panic::Location,sync::atomic::AtomicPtr};
use bitflags::bitflags;
use crate::{SyncError,SyncResult};
use crate::config::MAX_CPUS;
use crate::forward::{self,CpuId,ThreadId};
use crate::logging::klog;
use super::Irql;
#[cfg(feature="dbg_track_irql_source")]
use super::irql::RaiseSource;
use super::dpc::DpcQueue;

bitflags! {
    #[derive(Debug,Clone,Copy,PartialEq,Eq)]
    pub struct CpuFlags: u8 {
        /// The CPU has been brought up
        const ONLINE = 1<<0;
        /// The CPU is currently draining its DPC queue
        const DPC_ACTIVE = 1<<1;
    }
}

#[derive(Debug,Clone,Copy,Default,PartialEq,Eq)]
pub struct CpuStacks {
    /// Top of the stack the CPU started executing on
    pub startup_top: usize,
    /// Top of a scratch stack used while switching away from a dying thread
    pub temp_top: usize,
}

pub struct CpuLocalBlock {
    id: CpuId,
    stacks: CpuStacks,
    /// Opaque pointer-sized slot owned by the architecture layer
    arch_extension: AtomicUsize,
    irql: AtomicU8,
    /// 0 = no thread (early boot or idle)
    current_thread: AtomicUsize,
    flags: AtomicU8,
    interrupt_depth: AtomicU32,
    dpc_queue: DpcQueue,

    // Plain atomics: an interrupt handler may record over a raise that is still being recorded
    #[cfg(feature="dbg_track_irql_source")]
    raise_caller: AtomicPtr<Location<'static>>,
    #[cfg(feature="dbg_track_irql_source")]
    raise_lock: AtomicUsize,
}
impl CpuLocalBlock {
    fn new(id: CpuId, stacks: CpuStacks) -> Self {
        Self {
            id, stacks,
            arch_extension: AtomicUsize::new(0),
            irql: AtomicU8::new(Irql::PASSIVE.raw()),
            current_thread: AtomicUsize::new(0),
            flags: AtomicU8::new(CpuFlags::empty().bits()),
            interrupt_depth: AtomicU32::new(0),
            dpc_queue: DpcQueue::new(),

            #[cfg(feature="dbg_track_irql_source")]
            raise_caller: AtomicPtr::new(core::ptr::null_mut()),
            #[cfg(feature="dbg_track_irql_source")]
            raise_lock: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }
    pub fn stacks(&self) -> CpuStacks {
        self.stacks
    }
    pub fn arch_extension(&self) -> usize {
        self.arch_extension.load(Ordering::Acquire)
    }
    pub fn set_arch_extension(&self, value: usize) {
        self.arch_extension.store(value, Ordering::Release)
    }

    /// The last IRQL stored for this CPU. May lag behind the hardware; use [irql::get](super::irql::get) for the real value.
    #[inline]
    pub fn cached_irql(&self) -> Irql {
        Irql::from_bits_truncate(self.irql.load(Ordering::Relaxed))
    }
    #[inline]
    pub(super) fn store_irql(&self, level: Irql) {
        self.irql.store(level.raw(), Ordering::Relaxed)
    }
    #[cfg(feature="dbg_track_irql_source")]
    pub(super) fn record_irql_raise_source(&self, source: RaiseSource) {
        let (caller, lock) = match source {
            RaiseSource::Caller(location) => (location as *const Location<'static> as *mut Location<'static>, 0),
            RaiseSource::SpinLock(address) => (core::ptr::null_mut(), address),
        };
        self.raise_lock.store(lock, Ordering::Relaxed);
        self.raise_caller.store(caller, Ordering::Relaxed);
    }
    #[cfg(feature="dbg_track_irql_source")]
    pub fn irql_raise_source(&self) -> Option<RaiseSource> {
        let lock = self.raise_lock.load(Ordering::Relaxed);
        if lock != 0 { return Some(RaiseSource::SpinLock(lock)); }
        // SAFETY: only ever stored from a &'static Location, and never written through
        unsafe { self.raise_caller.load(Ordering::Relaxed).as_ref() }.map(RaiseSource::Caller)
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        ThreadId::new(self.current_thread.load(Ordering::Acquire))
    }
    /// Called by the scheduler whenever it switches threads on this CPU.
    pub fn set_current_thread(&self, thread: Option<ThreadId>) {
        self.current_thread.store(thread.map_or(0, ThreadId::get), Ordering::Release)
    }

    pub fn flags(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }
    pub(super) fn insert_flags(&self, flags: CpuFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }
    pub(super) fn remove_flags(&self, flags: CpuFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }
    pub fn is_online(&self) -> bool {
        self.flags().contains(CpuFlags::ONLINE)
    }
    pub fn is_dpc_active(&self) -> bool {
        self.flags().contains(CpuFlags::DPC_ACTIVE)
    }

    pub fn interrupt_depth(&self) -> u32 {
        self.interrupt_depth.load(Ordering::Relaxed)
    }
    pub(super) fn enter_interrupt(&self) -> u32 {
        self.interrupt_depth.fetch_add(1, Ordering::Relaxed) + 1
    }
    pub(super) fn exit_interrupt(&self) {
        self.interrupt_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn dpc_queue(&self) -> &DpcQueue {
        &self.dpc_queue
    }
}

// Blocks are leaked at bring-up, so references to them are 'static
type RegistrySlot = spin::Once<&'static CpuLocalBlock>;
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: RegistrySlot = spin::Once::new();
static REGISTRY: [RegistrySlot; MAX_CPUS] = [EMPTY_SLOT; MAX_CPUS];

/// Create and register the block for CPU `id`, marking it online.
/// Fails with `InvalidArgument` if `id` is out of range, or `InUse` if the CPU was already brought up.
pub fn bring_up(id: CpuId, stacks: CpuStacks) -> SyncResult<&'static CpuLocalBlock> {
    let slot = REGISTRY.get(id).ok_or(SyncError::InvalidArgument)?;
    let mut created = false;
    let block = *slot.call_once(|| {
        created = true;
        Box::leak(Box::new(CpuLocalBlock::new(id, stacks)))
    });
    if !created { return Err(SyncError::InUse); }

    block.insert_flags(CpuFlags::ONLINE);
    klog!(Info, CPU, "CPU {} online (startup stack top {:#x}).", id, stacks.startup_top);
    Ok(block)
}

/// The block of CPU `id`, if it has been brought up.
#[inline]
pub fn get_for(id: CpuId) -> Option<&'static CpuLocalBlock> {
    REGISTRY.get(id)?.get().copied()
}

/// The block of the calling CPU, or None if it (or the hooks) are not set up yet.
#[inline]
pub fn try_get_current() -> Option<&'static CpuLocalBlock> {
    get_for(forward::try_arch()?.current_cpu())
}

/// The block of the calling CPU. Fatal if the CPU was never brought up.
#[inline]
pub fn get_current() -> &'static CpuLocalBlock {
    let id = forward::arch().current_cpu();
    match get_for(id) {
        Some(block) => block,
        None => crate::panic::kernel_fatal(format_args!("CPU {} has no CPU-local block (not brought up?)", id)),
    }
}

/// Every CPU that has been brought up, in id order.
pub fn online_cpus() -> impl Iterator<Item=&'static CpuLocalBlock> {
    REGISTRY.iter().filter_map(|slot|slot.get().copied()).filter(|cpu|cpu.is_online())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;

    static_assertions::assert_impl_all!(CpuLocalBlock: Send, Sync);

    #[test]
    fn bring_up_twice_is_in_use() {
        sim::attach();
        let id = sim::reserve_cpu_id();
        let stacks = CpuStacks { startup_top: 0x8000, temp_top: 0x4000 };
        let block = bring_up(id, stacks).unwrap();
        assert_eq!(block.id(), id);
        assert_eq!(block.stacks(), stacks);
        assert!(block.is_online());
        assert_eq!(block.cached_irql(), Irql::PASSIVE);
        assert_eq!(bring_up(id, CpuStacks::default()).err(), Some(SyncError::InUse));
        assert!(core::ptr::eq(get_for(id).unwrap(), block));
        assert!(online_cpus().any(|cpu|cpu.id() == id));
    }

    #[test]
    fn out_of_range_cpu_is_rejected() {
        sim::attach();
        assert_eq!(bring_up(MAX_CPUS, CpuStacks::default()).err(), Some(SyncError::InvalidArgument));
        assert!(get_for(MAX_CPUS).is_none());
    }

    #[test]
    fn current_block_tracks_the_calling_cpu() {
        sim::attach();
        let here = get_current();
        assert_eq!(here.id(), sim::current_cpu());
        assert_eq!(here.current_thread(), Some(sim::current_thread()));

        let other = std::thread::spawn(|| {
            sim::attach();
            get_current().id()
        }).join().unwrap();
        assert_ne!(other, here.id());
    }

    #[test]
    fn flags_and_extension_slot() {
        sim::attach();
        let cpu = get_current();
        assert!(!cpu.is_dpc_active());
        cpu.set_arch_extension(0xdead);
        assert_eq!(cpu.arch_extension(), 0xdead);
        cpu.set_arch_extension(0);
    }
}
