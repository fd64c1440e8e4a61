use core::fmt;
use crate::forward::{self,CpuId,ThreadId};
use super::{cpulocal,Irql};

// A snapshot of the execution context. Mostly useful for annotating log messages and the like.
// Taking it never resynchronises the IRQL or fails: it is used from the fatal path too.
pub struct ExecutionContext {
    pub cpu_id: Option<CpuId>,
    pub thread_id: Option<ThreadId>,
    pub irql: Option<Irql>,
    pub interrupt_depth: u32,
}
impl ExecutionContext {
    #[inline]
    pub fn current() -> Self {
        let cpu_id = forward::try_arch().map(|arch|arch.current_cpu());
        match cpu_id.and_then(cpulocal::get_for) {
            Some(cpu) => Self {
                cpu_id,
                thread_id: cpu.current_thread(),
                irql: Some(cpu.cached_irql()),
                interrupt_depth: cpu.interrupt_depth(),
            },
            None => Self { cpu_id, thread_id: None, irql: None, interrupt_depth: 0 },
        }
    }
}
impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cpu_id {
            Some(id) => write!(f, "CPU{}", id)?,
            None => write!(f, "EARLY")?,
        }

        if let Some(thread) = self.thread_id {
            write!(f, " THREAD {}", thread)?;
        } else {
            write!(f, " SCHED")?;
        }
        if let Some(irql) = self.irql {
            write!(f, " @{}", irql)?;
        }
        if self.interrupt_depth > 0 {
            write!(f, " (interrupt depth {})", self.interrupt_depth)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;
    use std::string::ToString;

    #[test]
    fn snapshot_names_cpu_thread_and_level() {
        sim::attach();
        let context = ExecutionContext::current();
        assert_eq!(context.cpu_id, Some(sim::current_cpu()));
        assert_eq!(context.thread_id, Some(sim::current_thread()));
        let text = context.to_string();
        assert!(text.starts_with(&std::format!("CPU{} THREAD {}", sim::current_cpu(), sim::current_thread())));
        assert!(text.ends_with("@PASSIVE_LEVEL"));
    }
}
