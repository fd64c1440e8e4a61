use core::fmt;
use crate::multitasking::ExecutionContext;

#[derive(Debug,Clone,Copy,PartialOrd,Ord,PartialEq,Eq)]
#[repr(u8)]
pub enum LogLevel {
    // Debug: very specific, low-level information.
    Debug = 0,
    // Info: General information, status messages, etc.
    Info = 1,
    // Warning: Abnormal conditions that may require attention
    Warning = 2,
    // Severe: Abnormal conditions that may directly impair the operation of the system
    Severe = 3,
    // Critical: Abnormal conditions that will cause issues - generally require things to shut down soon
    Critical = 4,
    // Fatal: Things can no longer continue in this state. Always followed by a halt
    Fatal = 5,
}
impl LogLevel {
    pub fn name(self) -> &'static str {
        use LogLevel::*;
        match self {
            Debug    => "DBG",
            Info     => "INFO",
            Warning  => "WARN",
            Severe   => "SEVERE",
            Critical => "CRITICAL",
            Fatal    => "FATAL ERROR",
        }
    }

    /// The `log` facade has fewer levels, so everything from Severe upwards is reported as an error.
    fn facade_level(self) -> log::Level {
        use LogLevel::*;
        match self {
            Debug => log::Level::Debug,
            Info => log::Level::Info,
            Warning => log::Level::Warn,
            Severe | Critical | Fatal => log::Level::Error,
        }
    }
}

pub fn _kernel_log(level: LogLevel, component: &str, msg: fmt::Arguments<'_>){
    let context = ExecutionContext::current();
    log::log!(target: "ksync", level.facade_level(), "{}: [{}] {} - {}", context, level.name(), component, msg);
}

macro_rules! klog {
    ($level: ident, $component:ident, $($arg:tt)+) => {
        {
            use crate::logging::LogLevel::*;
            use crate::logging::contexts::*;
            if const { ($level as u8) >= ($component as u8) } { crate::logging::_kernel_log($level, stringify!($component), format_args!($($arg)+)) };
        }
    };
}
pub(in crate) use klog;

// Logging contexts allow filtered log levels to be configured per-context
pub mod contexts {
    use super::LogLevel; use LogLevel::*;
    macro_rules! def_context {
        ($id: ident, $parent: ident, $filter_level: ident) => {
            pub const $id: LogLevel = $filter_level;
        };
        ($id: ident, $parent: ident) => {
            pub const $id: LogLevel = $parent;
        };
    }

    pub const DEFAULT_MIN_LOG_LEVEL: super::LogLevel = Info;
    pub const ROOT: LogLevel = DEFAULT_MIN_LOG_LEVEL;

    // Configure contexts in here! :)
    def_context!(IRQL, ROOT, Info);
      def_context!(SPINLOCK, IRQL, Warning);
    def_context!(WAIT, ROOT);
      def_context!(FUTEX, WAIT);
    def_context!(DPC, ROOT, Info);
    def_context!(CPU, ROOT, Info);
    def_context!(INTERRUPTS, ROOT);
}
