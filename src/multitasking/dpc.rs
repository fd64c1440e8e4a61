//! Deferred procedure calls.
//!
//! Interrupt handlers queue DPCs to finish their work at DISPATCH, once every interrupt has been serviced.
//! Each CPU drains its own queue in FIFO order when its IRQL drops below DISPATCH (or on request).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool,AtomicUsize,Ordering};
use crate::{SyncError,SyncResult};
use crate::forward::CpuId;
use crate::logging::klog;
use crate::sync::{SpinLock,spinlock_at};
use super::cpulocal::{self,CpuFlags,CpuLocalBlock};
use super::{irql,Irql};

pub type DpcRoutine = fn(&Dpc, usize);

const NO_CPU: usize = usize::MAX;

pub struct Dpc {
    handler: DpcRoutine,
    userdata: usize,
    // CPU whose queue should run it (NO_CPU = whichever CPU queues it)
    target_cpu: AtomicUsize,
    // CPU whose queue currently holds it
    owning_cpu: AtomicUsize,
    queued: AtomicBool,
}
impl Dpc {
    pub fn allocate(handler: DpcRoutine, userdata: usize) -> Arc<Self> {
        Arc::new(Self {
            handler, userdata,
            target_cpu: AtomicUsize::new(NO_CPU),
            owning_cpu: AtomicUsize::new(NO_CPU),
            queued: AtomicBool::new(false),
        })
    }
    /// Rebind the handler and its argument. Only possible while nobody else holds the DPC (so it cannot be queued).
    pub fn initialize(self: &mut Arc<Self>, handler: DpcRoutine, userdata: usize) -> SyncResult<()> {
        let dpc = Arc::get_mut(self).ok_or(SyncError::InUse)?;
        dpc.handler = handler;
        dpc.userdata = userdata;
        Ok(())
    }

    /// Pin the DPC to one CPU's queue, or None to run it wherever it is queued.
    pub fn set_target_cpu(&self, cpu: Option<CpuId>) {
        self.target_cpu.store(cpu.unwrap_or(NO_CPU), Ordering::Relaxed)
    }
    pub fn target_cpu(&self) -> Option<CpuId> {
        match self.target_cpu.load(Ordering::Relaxed) { NO_CPU => None, cpu => Some(cpu) }
    }
    pub fn owning_cpu(&self) -> Option<CpuId> {
        match self.owning_cpu.load(Ordering::Acquire) { NO_CPU => None, cpu => Some(cpu) }
    }
    pub fn userdata(&self) -> usize {
        self.userdata
    }
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

/// A CPU's pending DPCs. The lock sits at HIGH so handlers of any level can queue.
pub struct DpcQueue {
    entries: SpinLock<VecDeque<Arc<Dpc>>>,
    // mirrors entries.len() so lower() can check without locking
    pending: AtomicUsize,
}
impl DpcQueue {
    pub(super) const fn new() -> Self {
        Self { entries: spinlock_at(Irql::HIGH, VecDeque::new()), pending: AtomicUsize::new(0) }
    }
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    fn push(&self, dpc: Arc<Dpc>) {
        let mut entries = self.entries.lock();
        entries.push_back(dpc);
        self.pending.store(entries.len(), Ordering::Release);
    }
    fn pop(&self) -> Option<Arc<Dpc>> {
        let mut entries = self.entries.lock();
        let dpc = entries.pop_front()?;
        // Cleared under the lock, so a concurrent queue() either sees it still queued or appends afresh
        dpc.owning_cpu.store(NO_CPU, Ordering::Release);
        dpc.queued.store(false, Ordering::Release);
        self.pending.store(entries.len(), Ordering::Release);
        Some(dpc)
    }
    fn remove(&self, dpc: &Arc<Dpc>) -> bool {
        let mut entries = self.entries.lock();
        let Some(position) = entries.iter().position(|entry|Arc::ptr_eq(entry, dpc)) else { return false };
        entries.remove(position);
        dpc.owning_cpu.store(NO_CPU, Ordering::Release);
        dpc.queued.store(false, Ordering::Release);
        self.pending.store(entries.len(), Ordering::Release);
        true
    }
}

/// Queue the DPC on its target CPU (or this one). Returns false if it was already queued.
/// Fails with `InvalidArgument` if the target CPU is not online.
pub fn queue(dpc: &Arc<Dpc>) -> SyncResult<bool> {
    let cpu = match dpc.target_cpu() {
        Some(id) => cpulocal::get_for(id).filter(|cpu|cpu.is_online()).ok_or(SyncError::InvalidArgument)?,
        None => cpulocal::get_current(),
    };
    if dpc.queued.swap(true, Ordering::AcqRel) { return Ok(false); }
    dpc.owning_cpu.store(cpu.id(), Ordering::Release);
    cpu.dpc_queue().push(Arc::clone(dpc));
    klog!(Debug, DPC, "Queued DPC {:p} on CPU {}.", Arc::as_ptr(dpc), cpu.id());
    Ok(true)
}

/// Take the DPC off whichever queue holds it. Returns false if it was not queued.
pub fn cancel(dpc: &Arc<Dpc>) -> bool {
    let Some(cpu) = dpc.owning_cpu().and_then(cpulocal::get_for) else { return false };
    cpu.dpc_queue().remove(dpc)
}

/// Release a DPC handle. Fails with `InUse` if it is still queued (the queued entry still runs).
pub fn free(dpc: Arc<Dpc>) -> SyncResult<()> {
    if dpc.is_queued() { return Err(SyncError::InUse); }
    drop(dpc);
    Ok(())
}

/// Run every DPC queued on this CPU, in order. Returns how many ran.
/// Does nothing if called above DISPATCH or from within a DPC.
pub fn dispatch_pending() -> usize {
    let cpu = cpulocal::get_current();
    if cpu.is_dpc_active() { return 0; }
    let current = irql::get();
    if current > Irql::DISPATCH { return 0; }
    let previous = irql::raise(Irql::DISPATCH);
    let ran = drain(cpu);
    irql::lower(previous);
    ran
}

/// Drain `cpu`'s queue. The caller must be on that CPU, at DISPATCH.
pub(super) fn drain(cpu: &CpuLocalBlock) -> usize {
    cpu.insert_flags(CpuFlags::DPC_ACTIVE);
    let mut ran = 0;
    while let Some(dpc) = cpu.dpc_queue().pop() {
        (dpc.handler)(&dpc, dpc.userdata);
        ran += 1;
        if cpu.cached_irql() != Irql::DISPATCH {
            crate::panic::kernel_fatal(format_args!("DPC {:p} returned at {}", Arc::as_ptr(&dpc), cpu.cached_irql()));
        }
    }
    cpu.remove_flags(CpuFlags::DPC_ACTIVE);
    klog!(Debug, DPC, "Drained {} DPC(s) on CPU {}.", ran, cpu.id());
    ran
}
