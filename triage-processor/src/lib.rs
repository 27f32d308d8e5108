//! A library for deciding how likely a crash is to be exploitable.
//!
//! Hand a [`CrashSnapshot`] from the [triage-common](https://crates.io/crates/triage-common)
//! crate to [`analyze`] and you get back a [`TriageReport`]: a [`Verdict`] together with every
//! [`Signal`] that contributed to it and a human-readable rationale.
//!
//! The processor decodes the instruction at the program counter, works out which access
//! faulted and where, runs a fixed catalog of independent [heuristic rules](rules/index.html)
//! and a handful of backtrace sanity checks, and combines what fired according to a
//! configurable [`VerdictPolicy`]. It doesn't do any I/O; [`analyze_batch`] triages many
//! snapshots in parallel.
//!
//! [`CrashSnapshot`]: triage_common::CrashSnapshot

mod backtrace;
mod context;
mod fault;
mod memory_map;
pub mod op_analysis;
mod processor;
mod report;
pub mod rules;
mod verdict;

pub use backtrace::analyze as analyze_backtrace;
pub use context::*;
pub use fault::*;
pub use memory_map::*;
pub use processor::*;
pub use report::*;
pub use verdict::*;
