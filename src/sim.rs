//! Host simulation of the forward hooks, for tests.
//!
//! Every host thread that calls [attach] becomes both a kernel thread and a CPU of its own, with a
//! simulated interrupt priority register. Blocking parks the host thread; waking sets a token and
//! unparks it, so a wake that arrives before the park is never lost. When a thread exits at PASSIVE
//! with nothing pending, its CPU id is handed to the next thread that attaches.

use std::cell::{Cell,RefCell};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc,Mutex,MutexGuard,Once,OnceLock,PoisonError};
use std::sync::atomic::{AtomicBool,AtomicU8,AtomicUsize,Ordering};
use std::time::{Duration,Instant};
use std::vec::Vec;
use crate::config::MAX_CPUS;
use crate::forward::{self,ArchHooks,SchedulerHooks,BlockOutcome,CpuId,ThreadId};
use crate::multitasking::{cpulocal,CpuStacks,Irql};

struct SimThread {
    id: ThreadId,
    handle: std::thread::Thread,
    token: AtomicBool,
}

pub struct SimKernel {
    epoch: Instant,
    threads: Mutex<HashMap<usize,Arc<SimThread>>>,
    next_thread: AtomicUsize,
    free_cpus: Mutex<Vec<CpuId>>,
    next_cpu: AtomicUsize,
    priorities: Vec<AtomicU8>,
    boosts: AtomicUsize,
}
impl SimKernel {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            threads: Mutex::new(HashMap::new()),
            next_thread: AtomicUsize::new(1),
            free_cpus: Mutex::new(Vec::new()),
            next_cpu: AtomicUsize::new(0),
            priorities: (0..MAX_CPUS).map(|_|AtomicU8::new(Irql::PASSIVE.raw())).collect(),
            boosts: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_,T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static SIM: OnceLock<SimKernel> = OnceLock::new();
static INSTALL: Once = Once::new();
fn kernel() -> &'static SimKernel {
    SIM.get_or_init(SimKernel::new)
}

struct Attachment {
    cpu: CpuId,
    thread: Arc<SimThread>,
}
impl Drop for Attachment {
    fn drop(&mut self) {
        let sim = kernel();
        lock(&sim.threads).remove(&self.thread.id.get());
        let Some(block) = cpulocal::get_for(self.cpu) else { return };
        block.set_current_thread(None);
        let clean = block.cached_irql() == Irql::PASSIVE
            && sim.priorities[self.cpu].load(Ordering::SeqCst) == Irql::PASSIVE.raw()
            && block.dpc_queue().is_empty()
            && !block.is_dpc_active()
            && block.interrupt_depth() == 0;
        // a CPU left raised (e.g. by a fatal test) is never reused
        if clean { lock(&sim.free_cpus).push(self.cpu); }
    }
}

std::thread_local! {
    static ATTACHMENT: RefCell<Option<Attachment>> = const { RefCell::new(None) };
    static HALTS: Cell<usize> = const { Cell::new(0) };
}

fn attach_current() -> (CpuId, Arc<SimThread>) {
    let sim = kernel();
    let cpu = lock(&sim.free_cpus).pop().unwrap_or_else(|| sim.next_cpu.fetch_add(1, Ordering::SeqCst));
    assert!(cpu < MAX_CPUS, "simulator ran out of CPUs");
    let id = ThreadId::new(sim.next_thread.fetch_add(1, Ordering::SeqCst)).unwrap();
    let thread = Arc::new(SimThread { id, handle: std::thread::current(), token: AtomicBool::new(false) });
    lock(&sim.threads).insert(id.get(), Arc::clone(&thread));
    sim.priorities[cpu].store(Irql::PASSIVE.raw(), Ordering::SeqCst);
    // Recorded before bring-up, which logs (and so asks which CPU this is)
    ATTACHMENT.with(|slot| *slot.borrow_mut() = Some(Attachment { cpu, thread: Arc::clone(&thread) }));

    let block = match cpulocal::get_for(cpu) {
        Some(block) => block,
        None => cpulocal::bring_up(cpu, CpuStacks::default()).unwrap(),
    };
    block.set_current_thread(Some(id));
    (cpu, thread)
}

fn local() -> (CpuId, Arc<SimThread>) {
    let existing = ATTACHMENT.with(|slot| slot.borrow().as_ref().map(|a|(a.cpu, Arc::clone(&a.thread))));
    match existing {
        Some(found) => found,
        None => attach_current(),
    }
}

/// Install the simulator (once per process) and make the calling host thread a CPU and a kernel thread.
pub fn attach() {
    INSTALL.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        let sim = kernel();
        forward::install(sim, sim).unwrap();
    });
    local();
}

pub fn current_cpu() -> CpuId {
    local().0
}
pub fn current_thread() -> ThreadId {
    local().1.id
}
/// A CPU id no simulated thread will ever use.
pub fn reserve_cpu_id() -> CpuId {
    kernel().next_cpu.fetch_add(1, Ordering::SeqCst)
}
/// What the simulated priority register of this CPU holds.
pub fn hardware_priority() -> Irql {
    Irql::from_bits_truncate(kernel().priorities[current_cpu()].load(Ordering::SeqCst))
}
/// Change the priority register behind the cached level's back, as an interrupt entry would.
pub fn set_hardware_priority(level: Irql) {
    kernel().priorities[current_cpu()].store(level.raw(), Ordering::SeqCst)
}
/// How many times this host thread has halted.
pub fn halt_count() -> usize {
    HALTS.with(Cell::get)
}
/// Total wakes that asked for a priority boost.
pub fn boost_count() -> usize {
    kernel().boosts.load(Ordering::SeqCst)
}

/// Poll until `condition` holds. Panics after ten seconds.
pub fn wait_for(mut condition: impl FnMut()->bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(10), "condition never became true");
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl ArchHooks for SimKernel {
    fn current_cpu(&self) -> CpuId {
        local().0
    }
    fn current_priority(&self, _cached: Irql) -> Irql {
        Irql::from_bits_truncate(self.priorities[local().0].load(Ordering::SeqCst))
    }
    fn set_priority(&self, level: Irql) {
        self.priorities[local().0].store(level.raw(), Ordering::SeqCst)
    }
    fn halt(&self, report: fmt::Arguments<'_>) -> ! {
        HALTS.with(|halts| halts.set(halts.get() + 1));
        panic!("kernel halted: {}", report)
    }
}

impl SchedulerHooks for SimKernel {
    fn block_current(&self, release: &mut dyn FnMut(), timeout: Option<Duration>) -> BlockOutcome {
        let (_, thread) = local();
        release();
        let deadline = timeout.map(|timeout|Instant::now() + timeout);
        loop {
            if thread.token.swap(false, Ordering::AcqRel) { return BlockOutcome::Woken; }
            match deadline {
                None => std::thread::park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline { return BlockOutcome::TimedOut; }
                    std::thread::park_timeout(deadline - now);
                },
            }
        }
    }
    fn make_ready(&self, thread: ThreadId, boost: bool) {
        let target = lock(&self.threads).get(&thread.get()).cloned();
        if let Some(target) = target {
            target.token.store(true, Ordering::Release);
            target.handle.unpark();
        }
        if boost { self.boosts.fetch_add(1, Ordering::SeqCst); }
    }
    fn yield_now(&self) {
        std::thread::yield_now()
    }
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
