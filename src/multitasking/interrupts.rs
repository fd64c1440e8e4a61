//! Interrupt vector table and dispatch.
//!
//! The architecture's interrupt stubs call [dispatch] with the vector number. The handler runs at the
//! vector's IRQL; on the way back down, any DPCs it queued run before the interrupted code resumes.

use alloc::collections::BTreeMap;
use crate::{SyncError,SyncResult};
use crate::logging::klog;
use crate::sync::{SpinLock,spinlock_at};
use super::{cpulocal,irql,Irql};

pub type InterruptHandler = fn(vector: u8, context: usize);

#[derive(Clone,Copy)]
struct Registration {
    level: Irql,
    handler: InterruptHandler,
    context: usize,
}

pub struct InterruptTable {
    vectors: SpinLock<BTreeMap<u8,Registration>>,
}
impl InterruptTable {
    pub const fn new() -> Self {
        Self { vectors: spinlock_at(Irql::HIGH, BTreeMap::new()) }
    }

    /// Route `vector` to `handler`, running at `level`. Device interrupts must sit above DISPATCH.
    pub fn register(&self, vector: u8, level: Irql, handler: InterruptHandler, context: usize) -> SyncResult<()> {
        if level <= Irql::DISPATCH { return Err(SyncError::InvalidArgument); }
        let mut vectors = self.vectors.lock();
        if vectors.contains_key(&vector) { return Err(SyncError::InUse); }
        vectors.insert(vector, Registration { level, handler, context });
        drop(vectors);
        klog!(Info, INTERRUPTS, "Vector {:#04x} registered at {}.", vector, level);
        Ok(())
    }
    pub fn unregister(&self, vector: u8) -> SyncResult<()> {
        match self.vectors.lock().remove(&vector) {
            Some(_) => Ok(()),
            None => Err(SyncError::InvalidArgument),
        }
    }
    pub fn level_of(&self, vector: u8) -> Option<Irql> {
        self.vectors.lock().get(&vector).map(|registration|registration.level)
    }

    /// Run the handler for `vector` at its level.
    /// Fails with `InvalidArgument` for an unregistered vector, or `WouldBlock` if this CPU is already at or
    /// above the vector's level (the hardware would have held the interrupt back).
    pub fn dispatch(&self, vector: u8) -> SyncResult<()> {
        let registration = self.vectors.lock().get(&vector).copied();
        let Some(registration) = registration else {
            klog!(Warning, INTERRUPTS, "Spurious interrupt on unregistered vector {:#04x}.", vector);
            return Err(SyncError::InvalidArgument);
        };
        if irql::get() >= registration.level { return Err(SyncError::WouldBlock); }

        let previous = irql::raise(registration.level);
        let cpu = cpulocal::get_current();
        cpu.enter_interrupt();
        (registration.handler)(vector, registration.context);
        cpu.exit_interrupt();
        irql::lower(previous);
        Ok(())
    }
}

/// The kernel's vector table
pub static VECTORS: InterruptTable = InterruptTable::new();

pub fn register(vector: u8, level: Irql, handler: InterruptHandler, context: usize) -> SyncResult<()> {
    VECTORS.register(vector, level, handler, context)
}
pub fn unregister(vector: u8) -> SyncResult<()> {
    VECTORS.unregister(vector)
}
pub fn dispatch(vector: u8) -> SyncResult<()> {
    VECTORS.dispatch(vector)
}

/// True while this CPU is running an interrupt handler
pub fn in_interrupt() -> bool {
    cpulocal::try_get_current().is_some_and(|cpu|cpu.interrupt_depth() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multitasking::dpc::{self,Dpc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool,Ordering};
    use crate::sim;

    static EVENTS: Mutex<std::vec::Vec<(&'static str, usize, Irql)>> = Mutex::new(std::vec::Vec::new());
    static HANDLER_DONE: AtomicBool = AtomicBool::new(false);
    static SERIAL: Mutex<()> = Mutex::new(());

    fn dpc_record(_dpc: &Dpc, userdata: usize) {
        assert!(HANDLER_DONE.load(Ordering::SeqCst));
        assert!(!in_interrupt());
        EVENTS.lock().unwrap().push(("dpc", userdata, irql::get()));
    }
    fn queueing_handler(_vector: u8, context: usize) {
        assert!(in_interrupt());
        EVENTS.lock().unwrap().push(("isr", context, irql::get()));
        dpc::queue(&Dpc::allocate(dpc_record, 1)).unwrap();
        dpc::queue(&Dpc::allocate(dpc_record, 2)).unwrap();
        HANDLER_DONE.store(true, Ordering::SeqCst);
    }
    fn nothing(_vector: u8, _context: usize) {}

    #[test]
    fn registration_rules() {
        sim::attach();
        let table = InterruptTable::new();
        assert_eq!(table.register(0x20, Irql::DISPATCH, nothing, 0), Err(SyncError::InvalidArgument));
        assert_eq!(table.register(0x20, Irql::CLOCK, nothing, 0), Ok(()));
        assert_eq!(table.register(0x20, Irql::IPI, nothing, 0), Err(SyncError::InUse));
        assert_eq!(table.level_of(0x20), Some(Irql::CLOCK));
        assert_eq!(table.unregister(0x20), Ok(()));
        assert_eq!(table.unregister(0x20), Err(SyncError::InvalidArgument));
        assert_eq!(table.dispatch(0x20), Err(SyncError::InvalidArgument));
    }

    #[test]
    fn dpcs_queued_by_a_handler_run_after_it_in_order() {
        let _serial = SERIAL.lock().unwrap_or_else(|e|e.into_inner());
        sim::attach();
        EVENTS.lock().unwrap().clear();
        HANDLER_DONE.store(false, Ordering::SeqCst);
        let table = InterruptTable::new();
        let level = Irql::new(5).unwrap();
        table.register(0x31, level, queueing_handler, 99).unwrap();

        table.dispatch(0x31).unwrap();
        assert_eq!(irql::get(), Irql::PASSIVE);
        assert!(!in_interrupt());
        assert_eq!(*EVENTS.lock().unwrap(), [("isr", 99, level), ("dpc", 1, Irql::DISPATCH), ("dpc", 2, Irql::DISPATCH)]);
    }

    #[test]
    fn masked_vector_is_held_back() {
        sim::attach();
        let table = InterruptTable::new();
        table.register(0x40, Irql::new(4).unwrap(), nothing, 0).unwrap();
        let previous = irql::raise(Irql::CLOCK);
        assert_eq!(table.dispatch(0x40), Err(SyncError::WouldBlock));
        irql::lower(previous);
        assert_eq!(table.dispatch(0x40), Ok(()));
    }
}
