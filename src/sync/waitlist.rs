//! Waitable objects
//!
//! Every blocking primitive embeds a [WaitableHeader]: a FIFO list of waiting threads plus a signaled flag,
//! both protected by a spinlock guard. Threads sleep until a signaler takes them off the list.
//!
//! How a signal that finds nobody waiting is treated depends on the header's [SignalPolicy].

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::panic::Location;
use core::sync::atomic::{AtomicBool,AtomicU8,AtomicUsize,Ordering};
use core::time::Duration;
use crate::{SyncError,SyncResult};
use crate::config::{MAX_WAIT_OBJECTS,DEFAULT_SPINLOCK_IRQL};
use crate::forward::{self,ThreadId};
use crate::logging::klog;
use crate::multitasking::{self,irql,Irql};
use super::{SpinLock,SpinLockGuard,spinlock_at};

#[derive(Debug,Clone,Copy,PartialEq,Eq)]
#[repr(u8)]
pub enum SignalPolicy {
    /// A signal with nobody waiting is lost.
    Edge = 0,
    /// Signals leave the header signaled until it is cleared; waiters arriving later pass straight through.
    Sticky = 1,
    /// Like Sticky, but the first waiter to pass through clears it again.
    AutoReset = 2,
}
impl SignalPolicy {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Sticky,
            2 => Self::AutoReset,
            _ => Self::Edge,
        }
    }
}

const WAITING: usize = usize::MAX;
const TIMED_OUT: usize = usize::MAX-1;

/// One thread's registration on one or more wait lists.
/// A thread waiting on several objects uses a single block for all of them; whoever claims it first wins.
pub struct WaitBlock {
    thread: ThreadId,
    // WAITING, TIMED_OUT, or the index (within the wait set) of the object that satisfied it
    status: AtomicUsize,
}
impl WaitBlock {
    fn new(thread: ThreadId) -> Arc<Self> {
        Arc::new(Self { thread, status: AtomicUsize::new(WAITING) })
    }
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
    fn try_satisfy(&self, index: usize) -> bool {
        self.status.compare_exchange(WAITING, index, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
    fn try_time_out(&self) -> bool {
        self.status.compare_exchange(WAITING, TIMED_OUT, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
    fn satisfied_by(&self) -> Option<usize> {
        let status = self.status.load(Ordering::Acquire);
        if status < TIMED_OUT { Some(status) } else { None }
    }
}

struct WaitEntry {
    block: Arc<WaitBlock>,
    index: usize,
}

/// The part of a header protected by its guard.
pub struct WaitState {
    waiting: VecDeque<WaitEntry>,
    signaled: bool,
}
impl WaitState {
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }
    pub(crate) fn set_signaled(&mut self, signaled: bool) -> bool {
        core::mem::replace(&mut self.signaled, signaled)
    }
    pub fn waiter_count(&self) -> usize {
        self.waiting.len()
    }
    /// Pass through a signaled state, consuming it if the policy resets on wake.
    pub fn take_signal(&mut self, policy: SignalPolicy) -> bool {
        match policy {
            SignalPolicy::Edge => false,
            SignalPolicy::Sticky => self.signaled,
            SignalPolicy::AutoReset => core::mem::replace(&mut self.signaled, false),
        }
    }
    fn remove(&mut self, block: &Arc<WaitBlock>) {
        self.waiting.retain(|entry|!Arc::ptr_eq(&entry.block, block));
    }
}

pub struct WaitableHeader {
    state: SpinLock<WaitState>,
    policy: AtomicU8,
    initialized: AtomicBool,
}
impl WaitableHeader {
    pub const fn new(policy: SignalPolicy) -> Self {
        Self::with_state(policy, false)
    }
    pub const fn with_state(policy: SignalPolicy, signaled: bool) -> Self {
        Self::build(policy, signaled, true)
    }
    /// A header that refuses waits until [initialize](Self::initialize) is called. For statics set up at runtime.
    pub const fn uninitialized() -> Self {
        Self::build(SignalPolicy::Edge, false, false)
    }
    const fn build(policy: SignalPolicy, signaled: bool, initialized: bool) -> Self {
        Self {
            state: spinlock_at(DEFAULT_SPINLOCK_IRQL, WaitState { waiting: VecDeque::new(), signaled }),
            policy: AtomicU8::new(policy as u8),
            initialized: AtomicBool::new(initialized),
        }
    }
    pub fn initialize(&self, policy: SignalPolicy, signaled: bool) {
        let mut state = self.state.lock();
        self.policy.store(policy as u8, Ordering::Relaxed);
        state.signaled = signaled;
        self.initialized.store(true, Ordering::Release);
    }
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
    pub(crate) fn check_initialized(&self) -> SyncResult<()> {
        if self.is_initialized() { Ok(()) } else { Err(SyncError::Uninitialized) }
    }

    pub fn policy(&self) -> SignalPolicy {
        SignalPolicy::from_raw(self.policy.load(Ordering::Relaxed))
    }
    /// True if the header keeps a signaled state at all
    pub fn use_signaled(&self) -> bool {
        self.policy() != SignalPolicy::Edge
    }

    /// Take the guard. Raises to DISPATCH while held.
    pub fn lock(&self) -> SpinLockGuard<'_,WaitState> {
        self.state.lock()
    }
    pub fn is_signaled(&self) -> bool {
        self.lock().signaled
    }
    pub fn waiter_count(&self) -> usize {
        self.lock().waiting.len()
    }
    /// Reset the signaled state, returning what it was.
    pub fn clear_signaled_state(&self) -> bool {
        self.lock().set_signaled(false)
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }
}

/// Anything that can be waited on.
pub trait Waitable {
    fn header(&self) -> &WaitableHeader;

    /// Called by [wait_any] with the header's guard held: once before queueing `thread` (`woken` false),
    /// and again after a signal on this object woke it (`woken` true). Returns true if the wait is over,
    /// and an error to end the wait with that error.
    ///
    /// By default a wake is enough, and otherwise the signaled state is taken according to the policy.
    /// Objects with an owner or a count override this, so that waiting on them acquires them.
    fn try_satisfy(&self, state: &mut WaitState, thread: ThreadId, woken: bool) -> SyncResult<bool> {
        let _ = thread;
        Ok(woken || state.take_signal(self.header().policy()))
    }
}
impl Waitable for WaitableHeader {
    fn header(&self) -> &WaitableHeader { self }
}

/// The thread about to block. Fatal if blocking is not allowed here.
#[track_caller]
pub(crate) fn blocking_thread() -> ThreadId {
    let level = irql::get();
    if level >= Irql::DISPATCH {
        crate::panic::kernel_fatal(format_args!("blocking wait at {} (called from {})", level, Location::caller()))
    }
    match multitasking::current_thread() {
        Some(thread) => thread,
        None => crate::panic::kernel_fatal(format_args!("blocking wait with no current thread (called from {})", Location::caller())),
    }
}

fn deadline_after(timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|timeout|forward::scheduler().now().saturating_add(timeout))
}

/// Sleep until `block` is claimed by a signaler or the deadline passes.
/// `release` (the guard of the list the block was just queued on, if still held) is dropped once the thread is marked blocked.
/// Returns the index that satisfied the block, or None if it timed out.
fn sleep_on(block: &WaitBlock, deadline: Option<Duration>, mut release: Option<SpinLockGuard<'_,WaitState>>) -> Option<usize> {
    let scheduler = forward::scheduler();
    loop {
        if let Some(index) = block.satisfied_by() {
            drop(release);
            return Some(index);
        }
        let remaining = match deadline {
            None => None,
            Some(deadline) => {
                let now = scheduler.now();
                if now >= deadline {
                    drop(release.take());
                    if block.try_time_out() { return None; }
                    // a signaler claimed it first
                    continue;
                }
                Some(deadline - now)
            },
        };
        let mut release_guard = || drop(release.take());
        scheduler.block_current(&mut release_guard, remaining);
    }
}

/// Lock the header, then call `attempt`. If it returns Some(x), return x. If it returns None, queue the
/// thread and sleep until signaled, then try again.
/// This guarantees that no signal is missed between `attempt` failing and the thread being queued.
#[track_caller]
pub fn wait_until_try<R>(object: &(impl Waitable + ?Sized), timeout: Option<Duration>, mut attempt: impl FnMut(&mut WaitState)->Option<R>) -> SyncResult<R> {
    let header = object.header();
    header.check_initialized()?;
    let thread = blocking_thread();
    let deadline = deadline_after(timeout);
    loop {
        let mut state = header.lock();
        if let Some(value) = attempt(&mut state) { return Ok(value); }

        let block = WaitBlock::new(thread);
        state.waiting.push_back(WaitEntry { block: Arc::clone(&block), index: 0 });
        #[cfg(feature="dbg_wait_errinfo")]
        klog!(Info, WAIT, "Thread {} blocking on {:#x} (position {}).", thread, header.address(), state.waiting.len());
        if sleep_on(&block, deadline, Some(state)).is_none() {
            header.lock().remove(&block);
            klog!(Debug, WAIT, "Thread {} timed out waiting on {:#x}.", thread, header.address());
            return Err(SyncError::TimedOut);
        }
    }
}
/// A version of wait_until_try for predicates that only say yes or no.
#[track_caller]
pub fn wait_until(object: &(impl Waitable + ?Sized), timeout: Option<Duration>, mut predicate: impl FnMut(&mut WaitState)->bool) -> SyncResult<()> {
    wait_until_try(object, timeout, |state|predicate(state).then_some(()))
}

/// Block until the object is signaled (or, for mutexes, semaphores and reader/writer locks, acquired).
#[track_caller]
pub fn wait_on(object: &dyn Waitable) -> SyncResult<()> {
    wait_on_timeout(object, None)
}
#[track_caller]
pub fn wait_on_timeout(object: &dyn Waitable, timeout: Option<Duration>) -> SyncResult<()> {
    wait_any(&[object], timeout).map(|_|())
}

fn deregister(objects: &[&dyn Waitable], indices: &[usize], block: &Arc<WaitBlock>) {
    for &index in indices {
        objects[index].header().lock().remove(block);
    }
}

/// Block until any one of `objects` is satisfied (see [Waitable::try_satisfy]), returning its index.
///
/// Guards are taken one at a time, in ascending header address order, and the thread is queued on every
/// list before it sleeps. On wake it is taken off all the others. If the object that woke it can no longer
/// be satisfied (a lock taken by someone else in the meantime), the thread queues up again.
#[track_caller]
pub fn wait_any(objects: &[&dyn Waitable], timeout: Option<Duration>) -> SyncResult<usize> {
    if objects.is_empty() || objects.len() > MAX_WAIT_OBJECTS { return Err(SyncError::InvalidArgument); }
    for object in objects { object.header().check_initialized()?; }
    let thread = blocking_thread();
    let deadline = deadline_after(timeout);

    let mut order: Vec<usize> = (0..objects.len()).collect();
    order.sort_by_key(|&index|objects[index].header().address());

    loop {
        let block = WaitBlock::new(thread);
        let mut registered = 0;
        let mut finished = None;
        for &index in &order {
            let object = objects[index];
            let mut state = object.header().lock();
            if block.satisfied_by().is_some() { break; }
            match object.try_satisfy(&mut state, thread, false) {
                Ok(false) => {},
                done => { finished = Some(done.map(|_|index)); break; },
            }
            state.waiting.push_back(WaitEntry { block: Arc::clone(&block), index });
            registered += 1;
        }

        #[cfg(feature="dbg_wait_errinfo")]
        klog!(Info, WAIT, "Thread {} waiting on {} object(s), queued on {}.", thread, objects.len(), registered);
        if let Some(result) = finished {
            // An object queued on earlier may have claimed the block meanwhile. Its wake was counted, so pass it on
            let settled = match result {
                Ok(index) => block.try_satisfy(index),
                Err(_) => block.try_time_out(),
            };
            let passed_over = if settled { None } else { block.satisfied_by() };
            deregister(objects, &order[..registered], &block);
            if let Some(other) = passed_over { signal_waiting_threads(objects[other], false, false); }
            return result;
        }

        let satisfied = match block.satisfied_by() {
            Some(index) => Some(index),
            None => sleep_on(&block, deadline, None),
        };
        deregister(objects, &order[..registered], &block);
        let Some(index) = satisfied else { return Err(SyncError::TimedOut) };
        let object = objects[index];
        let done = object.try_satisfy(&mut object.header().lock(), thread, true)?;
        if done { return Ok(index); }
        klog!(Debug, WAIT, "Thread {} lost object {} of its wait set after waking, queueing again.", thread, index);
    }
}

/// Wake up to `limit` waiters of `header`, whose guard the caller holds as `state`.
/// Updates the signaled state according to the header's policy, and returns the number of threads woken.
pub(crate) fn signal_locked(header: &WaitableHeader, state: &mut WaitState, limit: usize, boost: bool) -> usize {
    let scheduler = forward::scheduler();
    let mut woken = 0;
    while woken < limit {
        let Some(entry) = state.waiting.pop_front() else { break };
        // Blocks already satisfied through another object (or timed out) are just dropped
        if entry.block.try_satisfy(entry.index) {
            scheduler.make_ready(entry.block.thread, boost);
            woken += 1;
        }
    }
    match header.policy() {
        SignalPolicy::Edge => {},
        SignalPolicy::Sticky => state.signaled = true,
        SignalPolicy::AutoReset => state.signaled = woken == 0,
    }
    #[cfg(feature="dbg_wait_errinfo")]
    klog!(Info, WAIT, "Signaled {:#x}: woke {} thread(s), {} still waiting.", header.address(), woken, state.waiting.len());
    woken
}

/// Wake one (or all) of the threads waiting on the object. Returns how many were woken.
pub fn signal_waiting_threads(object: &(impl Waitable + ?Sized), all: bool, boost: bool) -> usize {
    let header = object.header();
    let mut state = header.lock();
    signal_locked(header, &mut state, if all { usize::MAX } else { 1 }, boost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim;
    use std::sync::mpsc;
    use std::panic::{catch_unwind,AssertUnwindSafe};

    static_assertions::assert_impl_all!(WaitableHeader: Send, Sync);

    #[test]
    fn uninitialized_header_refuses_waits() {
        sim::attach();
        let header = WaitableHeader::uninitialized();
        assert_eq!(wait_on(&header), Err(SyncError::Uninitialized));
        header.initialize(SignalPolicy::Sticky, true);
        assert_eq!(wait_on(&header), Ok(()));
    }

    #[test]
    fn waiters_wake_in_arrival_order() {
        sim::attach();
        let header = Arc::new(WaitableHeader::new(SignalPolicy::Edge));
        let (sender, receiver) = mpsc::channel();
        let mut handles = std::vec::Vec::new();
        for id in 0..3 {
            let waiter_header = Arc::clone(&header);
            let waiter_sender = sender.clone();
            handles.push(std::thread::spawn(move || {
                sim::attach();
                wait_on(&*waiter_header).unwrap();
                waiter_sender.send(id).unwrap();
            }));
            sim::wait_for(|| header.waiter_count() == id+1);
        }
        for expected in 0..3 {
            assert_eq!(signal_waiting_threads(&*header, false, false), 1);
            assert_eq!(receiver.recv().unwrap(), expected);
        }
        for handle in handles { handle.join().unwrap(); }
    }

    #[test]
    fn edge_signal_without_waiters_is_lost() {
        sim::attach();
        let header = WaitableHeader::new(SignalPolicy::Edge);
        assert_eq!(signal_waiting_threads(&header, false, false), 0);
        assert!(!header.is_signaled());
        assert_eq!(wait_on_timeout(&header, Some(Duration::from_millis(20))), Err(SyncError::TimedOut));
        assert_eq!(header.waiter_count(), 0);
    }

    #[test]
    fn sticky_signal_lets_late_waiters_through() {
        sim::attach();
        let header = WaitableHeader::new(SignalPolicy::Sticky);
        assert_eq!(signal_waiting_threads(&header, true, false), 0);
        assert!(header.is_signaled());
        wait_on(&header).unwrap();
        wait_on(&header).unwrap();
        assert!(header.clear_signaled_state());
        assert_eq!(wait_on_timeout(&header, Some(Duration::ZERO)), Err(SyncError::TimedOut));
    }

    #[test]
    fn auto_reset_signal_is_consumed_once() {
        sim::attach();
        let header = WaitableHeader::new(SignalPolicy::AutoReset);
        signal_waiting_threads(&header, false, false);
        assert!(header.is_signaled());
        wait_on(&header).unwrap();
        assert!(!header.is_signaled());
        assert_eq!(wait_on_timeout(&header, Some(Duration::from_millis(10))), Err(SyncError::TimedOut));
    }

    #[test]
    fn signal_all_reports_woken_count() {
        sim::attach();
        let header = Arc::new(WaitableHeader::new(SignalPolicy::Edge));
        let handles: std::vec::Vec<_> = (0..2).map(|_| {
            let header = Arc::clone(&header);
            std::thread::spawn(move || { sim::attach(); wait_on(&*header) })
        }).collect();
        sim::wait_for(|| header.waiter_count() == 2);
        let boosts = sim::boost_count();
        assert_eq!(signal_waiting_threads(&*header, true, true), 2);
        assert!(sim::boost_count() >= boosts + 2);
        for handle in handles { assert_eq!(handle.join().unwrap(), Ok(())); }
        assert_eq!(header.waiter_count(), 0);
    }

    #[test]
    fn wait_any_reports_the_signaled_object_and_leaves_no_trace() {
        sim::attach();
        let objects = Arc::new([WaitableHeader::new(SignalPolicy::Edge), WaitableHeader::new(SignalPolicy::Edge)]);
        let waiter = {
            let objects = Arc::clone(&objects);
            std::thread::spawn(move || {
                sim::attach();
                wait_any(&[&objects[0], &objects[1]], None)
            })
        };
        sim::wait_for(|| objects[0].waiter_count() == 1 && objects[1].waiter_count() == 1);
        assert_eq!(signal_waiting_threads(&objects[1], false, false), 1);
        assert_eq!(waiter.join().unwrap(), Ok(1));
        assert_eq!(objects[0].waiter_count(), 0);
        // the stale registration is gone, so this signal finds nobody
        assert_eq!(signal_waiting_threads(&objects[0], false, false), 0);
    }

    #[test]
    fn wait_any_takes_an_already_signaled_object() {
        sim::attach();
        let quiet = WaitableHeader::new(SignalPolicy::Edge);
        let ready = WaitableHeader::with_state(SignalPolicy::AutoReset, true);
        assert_eq!(wait_any(&[&quiet, &ready], None), Ok(1));
        assert!(!ready.is_signaled());
        assert_eq!(quiet.waiter_count(), 0);
    }

    #[test]
    fn wait_any_rejects_bad_sets() {
        sim::attach();
        assert_eq!(wait_any(&[], None), Err(SyncError::InvalidArgument));
        let header = WaitableHeader::new(SignalPolicy::Edge);
        let too_many: std::vec::Vec<&dyn Waitable> = (0..MAX_WAIT_OBJECTS+1).map(|_|&header as &dyn Waitable).collect();
        assert_eq!(wait_any(&too_many, None), Err(SyncError::InvalidArgument));
        let uninitialized = WaitableHeader::uninitialized();
        assert_eq!(wait_any(&[&header, &uninitialized], None), Err(SyncError::Uninitialized));
    }

    #[test]
    fn wait_any_times_out() {
        sim::attach();
        let a = WaitableHeader::new(SignalPolicy::Edge);
        let b = WaitableHeader::new(SignalPolicy::Sticky);
        assert_eq!(wait_any(&[&a, &b], Some(Duration::from_millis(20))), Err(SyncError::TimedOut));
        assert_eq!(a.waiter_count() + b.waiter_count(), 0);
    }

    #[test]
    fn wait_any_registration_races_signalers_without_losing_wakes() {
        sim::attach();
        const WAITERS: usize = 4;
        const ROUNDS: usize = 200;
        let edge = Arc::new(WaitableHeader::new(SignalPolicy::Edge));
        let auto = Arc::new(WaitableHeader::new(SignalPolicy::AutoReset));
        let returned = Arc::new(AtomicUsize::new(0));
        let waiters: std::vec::Vec<_> = (0..WAITERS).map(|_| {
            let (edge, auto, returned) = (Arc::clone(&edge), Arc::clone(&auto), Arc::clone(&returned));
            std::thread::spawn(move || {
                sim::attach();
                let mut taken = [0usize; 2];
                for _ in 0..ROUNDS {
                    taken[wait_any(&[&*edge, &*auto], None).unwrap()] += 1;
                    returned.fetch_add(1, Ordering::SeqCst);
                }
                taken
            })
        }).collect();

        // Signals go out while waiters are still registering. A token is a wake the AutoReset header
        // handed to a waiter, or a signal it stored while unsignaled
        let (mut edge_wakes, mut auto_tokens) = (0, 0);
        while returned.load(Ordering::SeqCst) < WAITERS * ROUNDS {
            {
                let mut state = auto.lock();
                let was_signaled = state.is_signaled();
                let woken = signal_locked(&auto, &mut state, 1, false);
                auto_tokens += woken + usize::from(woken == 0 && !was_signaled);
            }
            edge_wakes += signal_waiting_threads(&*edge, false, false);
            std::thread::yield_now();
        }

        let mut taken = [0usize; 2];
        for handle in waiters {
            let counts = handle.join().unwrap();
            taken[0] += counts[0];
            taken[1] += counts[1];
        }
        assert_eq!(taken[0] + taken[1], WAITERS * ROUNDS);
        // every AutoReset token was taken exactly once, or is still stored
        assert_eq!(taken[1] + usize::from(auto.is_signaled()), auto_tokens);
        assert!(taken[0] <= edge_wakes);
        assert_eq!(edge.waiter_count(), 0);
        assert_eq!(auto.waiter_count(), 0);
    }

    #[test]
    fn predicate_is_rechecked_after_each_wake() {
        sim::attach();
        let header = Arc::new(WaitableHeader::new(SignalPolicy::Edge));
        let flag = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (header, flag) = (Arc::clone(&header), Arc::clone(&flag));
            std::thread::spawn(move || {
                sim::attach();
                wait_until(&*header, None, |_|flag.load(Ordering::SeqCst))
            })
        };
        sim::wait_for(|| header.waiter_count() == 1);
        // woken without the condition holding: goes back to sleep
        signal_waiting_threads(&*header, false, false);
        sim::wait_for(|| header.waiter_count() == 1);
        flag.store(true, Ordering::SeqCst);
        signal_waiting_threads(&*header, false, false);
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn blocking_at_dispatch_is_fatal() {
        sim::attach();
        let header = WaitableHeader::new(SignalPolicy::Edge);
        let previous = irql::raise(Irql::DISPATCH);
        let result = catch_unwind(AssertUnwindSafe(|| wait_on(&header)));
        assert!(result.is_err());
        assert_eq!(header.waiter_count(), 0);
        irql::lower(previous);
    }
}
