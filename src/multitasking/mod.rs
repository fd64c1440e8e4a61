pub mod irql;
pub use irql::{Irql,IrqlGuard,RaiseSource};

pub mod cpulocal;
pub use cpulocal::{CpuLocalBlock,CpuStacks,CpuFlags};

pub mod dpc;
pub use dpc::Dpc;
pub mod interrupts;

mod econtext;
pub use econtext::ExecutionContext;

pub use crate::forward::{CpuId,ThreadId};

/// The thread running on this CPU, as last reported by the scheduler.
#[inline]
pub fn current_thread() -> Option<ThreadId> {
    cpulocal::get_current().current_thread()
}
