//! Kernel synchronization core: IRQL discipline, spinlocks, waitable objects, DPCs and per-CPU state.
//!
//! Nothing here talks to hardware or the scheduler directly. The kernel installs [forward] hooks at boot
//! (the bare-metal x86_64 implementation lives in [arch]), then brings up each CPU with
//! [multitasking::cpulocal::bring_up] before using anything else on it.
#![no_std]

#[cfg(test)]
extern crate std;
extern crate alloc;

macro_rules! arch_specific_module {
    ($v:vis mod $name:ident) => {
        cfg_if::cfg_if! {
            if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
                $v mod $name {
                    mod x86_64;
                    pub use x86_64::*;
                }
            } else if #[cfg(target_os = "none")] {
                compile_error!(concat!("This architecture is unsupported as it does not have an implementation for the '",stringify!($name),"' module!"));
            }
            // Hosted builds bring their own hooks
        }
    }
}

pub mod logging;
pub mod config;
pub mod error;
pub mod panic;
pub mod forward;
pub mod multitasking;
pub mod sync;
arch_specific_module!(pub mod arch);

#[cfg(test)]
mod sim;

pub use error::{SyncError,SyncResult};
pub use multitasking::Irql;
