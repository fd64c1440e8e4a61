//! Futexes: wait queues keyed by (address space, address) of a 32-bit word.
//!
//! Objects are created on first wait and reclaimed as soon as nobody holds a reference and nobody is waiting.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32,AtomicU64,AtomicUsize,Ordering};
use core::time::Duration;
use crate::{SyncError,SyncResult};
use crate::config::DEFAULT_SPINLOCK_IRQL;
use crate::logging::klog;
use super::{SpinLock,spinlock_at};
use super::waitlist::{self,SignalPolicy,Waitable,WaitableHeader};

/// Identity of an address space. Allocated once per address space and never reused.
#[derive(Debug,Clone,Copy,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub struct ContextId(u64);
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
impl ContextId {
    /// The kernel's own address space
    pub const KERNEL: Self = Self(0);

    pub fn allocate() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Ordered by context first, then address.
#[derive(Debug,Clone,Copy,PartialEq,Eq,PartialOrd,Ord,Hash)]
pub struct FutexKey {
    pub context: ContextId,
    pub address: usize,
}

pub struct Futex {
    header: WaitableHeader,
    references: AtomicUsize,
    key: FutexKey,
}
impl Futex {
    fn new(key: FutexKey) -> Self {
        Self { header: WaitableHeader::new(SignalPolicy::Edge), references: AtomicUsize::new(0), key }
    }
    pub fn key(&self) -> FutexKey {
        self.key
    }
    /// Number of operations currently using this object
    pub fn reference_count(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }
    pub fn waiter_count(&self) -> usize {
        self.header.waiter_count()
    }
}
impl Waitable for Futex {
    fn header(&self) -> &WaitableHeader { &self.header }
}

pub struct FutexTable {
    tree: SpinLock<BTreeMap<FutexKey,Arc<Futex>>>,
}
impl FutexTable {
    pub const fn new() -> Self {
        Self { tree: spinlock_at(DEFAULT_SPINLOCK_IRQL, BTreeMap::new()) }
    }

    /// Find or create the object for `key`, taking a reference to it.
    fn reference(&self, key: FutexKey) -> Arc<Futex> {
        let mut tree = self.tree.lock();
        let object = tree.entry(key).or_insert_with(|| {
            klog!(Debug, FUTEX, "Created futex {:?}.", key);
            Arc::new(Futex::new(key))
        });
        object.references.fetch_add(1, Ordering::AcqRel);
        Arc::clone(object)
    }
    /// Take a reference to the object for `key`, only if it exists.
    fn reference_existing(&self, key: FutexKey) -> Option<Arc<Futex>> {
        let tree = self.tree.lock();
        let object = tree.get(&key)?;
        object.references.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(object))
    }
    /// Drop a reference, reclaiming the object if it is no longer used at all.
    fn dereference(&self, object: &Arc<Futex>) {
        let mut tree = self.tree.lock();
        if object.references.fetch_sub(1, Ordering::AcqRel) == 1 && object.waiter_count() == 0 {
            if tree.get(&object.key).is_some_and(|current|Arc::ptr_eq(current, object)) {
                tree.remove(&object.key);
                klog!(Debug, FUTEX, "Reclaimed futex {:?}.", object.key);
            }
        }
    }

    /// The object currently registered for `key`, if any.
    pub fn lookup(&self, key: FutexKey) -> Option<Arc<Futex>> {
        self.tree.lock().get(&key).cloned()
    }
    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sleep until woken, provided `word` still holds `expected`.
    /// Fails with `WouldBlock` if the value has already changed, or `TimedOut` once `timeout` passes.
    #[track_caller]
    pub fn wait(&self, context: ContextId, word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> SyncResult<()> {
        let key = FutexKey { context, address: word as *const AtomicU32 as usize };
        let object = self.reference(key);
        let mut checked = false;
        // The value is compared under the object's guard, so a wake that follows a store cannot slip past
        let result = waitlist::wait_until_try(&*object, timeout, |_| {
            if checked { return Some(Ok(())); }
            checked = true;
            if word.load(Ordering::SeqCst) != expected { Some(Err(SyncError::WouldBlock)) } else { None }
        }).and_then(|result|result);
        self.dereference(&object);
        result
    }

    /// Wake up to `count` threads waiting on the word at `address`, oldest first. Returns how many were woken.
    pub fn wake(&self, context: ContextId, address: usize, count: usize) -> usize {
        let Some(object) = self.reference_existing(FutexKey { context, address }) else { return 0 };
        let woken = {
            let mut state = object.header.lock();
            waitlist::signal_locked(&object.header, &mut state, count, false)
        };
        self.dereference(&object);
        woken
    }
}

/// The kernel-wide futex table
pub static FUTEXES: FutexTable = FutexTable::new();
