
pub mod spinlocks;
pub use spinlocks::*;

pub mod waitlist;
pub use waitlist::{Waitable,WaitableHeader,WaitState,SignalPolicy,wait_on,wait_on_timeout,wait_any,signal_waiting_threads};

mod wlock;
pub use wlock::*;
mod semaphore;
pub use semaphore::Semaphore;
mod event;
pub use event::{Event,EventKind};
mod rwlock;
pub use rwlock::RwLock;
mod pushlock;
pub use pushlock::*;

pub mod futex;
pub use futex::{FUTEXES,FutexTable,FutexKey,ContextId};
