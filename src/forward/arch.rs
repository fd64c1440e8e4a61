use core::fmt;
use crate::multitasking::Irql;

/// Index of a processor, as used to look up its CPU-local block.
pub type CpuId = usize;

/// What the synchronization core needs from the processor.
pub trait ArchHooks: Sync {
    /// The id of the CPU executing this call.
    fn current_cpu(&self) -> CpuId;
    /// Read the interrupt priority the hardware is actually enforcing.
    /// `cached` is the level the CPU-local block believes is current, for architectures that cannot read it back.
    fn current_priority(&self, cached: Irql) -> Irql;
    /// Program the hardware to mask every interrupt at or below `level`.
    fn set_priority(&self, level: Irql);
    /// Stop this CPU for good. `report` describes why.
    fn halt(&self, report: fmt::Arguments<'_>) -> !;
}
