//! This crate defines [the crash snapshot data model](format/index.html) consumed by the
//! crash triage engine, along with the [CPU tags](system_info/index.html) and
//! [crash reasons](crash_reason/index.html) a debugger integration reports.
//!
//! You probably don't want to use this crate directly, the `triage-processor` crate provides
//! the actual functionality of classifying a crash using the structs defined in this crate.

pub mod crash_reason;
pub mod format;
pub mod system_info;

pub use crash_reason::CrashReason;
pub use format::*;
pub use system_info::Cpu;
