use std::collections::BTreeSet;
use std::fmt;

use rayon::prelude::*;
use tracing::{debug, warn};
use triage_common::{Address, Cpu, CrashReason, CrashSnapshot};

use crate::backtrace;
use crate::context::{self, Architecture, CanonicalState, ContextError};
use crate::fault;
use crate::memory_map::MemoryMap;
use crate::op_analysis::{self, DecodedInstruction, OpAnalysisError};
use crate::report::{SignalId, TriageReport};
use crate::rules::{self, RuleInput};
use crate::verdict::{self, VerdictPolicy};

/// Configuration of the processor's heuristics.
///
/// All fields have defaults, so a config file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorOptions {
    /// Addresses below this are treated as null pointer dereferences.
    pub null_page_radius: u64,
    /// How far past a heap pointer a fault may be and still look like an overflow of it.
    pub heap_overflow_offset_ceiling: u64,
    /// The size of the unmapped guard zone assumed below every stack region.
    pub stack_guard_distance: u64,
    /// Signals that are never produced.
    pub disabled_signals: BTreeSet<SignalId>,
    pub policy: VerdictPolicy,
}

impl ProcessorOptions {
    /// The default thresholds: one high-severity signal alone only reaches
    /// `PROBABLY_EXPLOITABLE`.
    pub fn stable_basic() -> Self {
        ProcessorOptions {
            null_page_radius: 4096,
            heap_overflow_offset_ceiling: 1024,
            stack_guard_distance: 64 * 1024,
            disabled_signals: BTreeSet::new(),
            policy: VerdictPolicy::default(),
        }
    }

    /// Thresholds for fuzzing triage, where false negatives cost more than false positives.
    ///
    /// A single high-severity signal is `EXPLOITABLE` and a single medium-severity signal is
    /// `PROBABLY_EXPLOITABLE`. Missing evidence still holds the verdict at `UNKNOWN`.
    pub fn aggressive() -> Self {
        ProcessorOptions {
            policy: VerdictPolicy {
                exploitable_high_count: 1,
                probably_exploitable_medium_count: 1,
                data_quality_forces_unknown: true,
            },
            ..ProcessorOptions::stable_basic()
        }
    }

    pub fn is_enabled(&self, id: SignalId) -> bool {
        !self.disabled_signals.contains(&id)
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions::stable_basic()
    }
}

/// A crash snapshot that violates the data model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("missing required register `{register}`")]
    MissingRegister { register: &'static str },
    #[error("register `{register}` = {value} doesn't fit in {word_size} bytes")]
    RegisterOutOfRange {
        register: String,
        value: Address,
        word_size: u8,
    },
    #[error("memory region {start}-{end} is empty")]
    EmptyRegion { start: Address, end: Address },
    #[error("memory regions aren't sorted, {next} follows {previous}")]
    UnsortedRegions { previous: Address, next: Address },
    #[error("memory regions overlap, {next_start} starts before {previous_end}")]
    OverlappingRegions {
        previous_end: Address,
        next_start: Address,
    },
}

/// Identifies the snapshot an error came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotContext {
    pub architecture: Cpu,
    pub crash_reason: CrashReason,
    pub fault_address: Option<Address>,
}

impl SnapshotContext {
    fn of(snapshot: &CrashSnapshot) -> Self {
        SnapshotContext {
            architecture: snapshot.architecture.clone(),
            crash_reason: snapshot.crash_reason.clone(),
            fault_address: snapshot.fault_address,
        }
    }
}

impl fmt::Display for SnapshotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.crash_reason, self.architecture)?;
        match self.fault_address {
            Some(address) => write!(f, " at {address}"),
            None => write!(f, " with no fault address"),
        }
    }
}

/// An error encountered during crash triage.
///
/// Either is fatal for the snapshot it was raised for, and no verdict is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("malformed snapshot ({context}): {source}")]
    MalformedSnapshot {
        source: SnapshotError,
        context: SnapshotContext,
    },
    #[error("unsupported architecture `{architecture}` ({context})")]
    UnsupportedArchitecture {
        architecture: Cpu,
        context: SnapshotContext,
    },
}

impl ProcessError {
    fn from_context_error(error: ContextError, snapshot: &CrashSnapshot) -> Self {
        match error {
            ContextError::UnsupportedArchitecture(architecture) => {
                ProcessError::UnsupportedArchitecture {
                    architecture,
                    context: SnapshotContext::of(snapshot),
                }
            }
            ContextError::Malformed(source) => ProcessError::MalformedSnapshot {
                source,
                context: SnapshotContext::of(snapshot),
            },
        }
    }
}

/// Decode the instruction at the program counter, unless the fault was fetching it.
///
/// Returns `None` when decoding isn't attempted.
pub(crate) fn decode_at_pc(
    state: &CanonicalState,
    memory: &MemoryMap<'_>,
    reported: Option<u64>,
    bytes: &[u8],
) -> Option<Result<DecodedInstruction, OpAnalysisError>> {
    if fault::is_execute_fault(reported, state, memory) {
        return None;
    }
    const THUMB_BIT: u64 = 1 << 5;
    if state.architecture == Architecture::Arm32 && state.flags.unwrap_or(0) & THUMB_BIT != 0 {
        return Some(Err(OpAnalysisError::ThumbState));
    }
    Some(op_analysis::decode(state.architecture, bytes))
}

/// Triage one crash snapshot.
///
/// # Errors
///
/// [`ProcessError::UnsupportedArchitecture`] if the snapshot is for an architecture the
/// processor has no tables for, and [`ProcessError::MalformedSnapshot`] if its registers or
/// memory regions are unusable. Failing to decode the crashing instruction is not an error, it
/// is reported as a `decode-failed` signal.
pub fn analyze(
    snapshot: &CrashSnapshot,
    options: &ProcessorOptions,
) -> Result<TriageReport, ProcessError> {
    debug!(
        "analyzing {} crash on {}",
        snapshot.crash_reason, snapshot.architecture
    );
    let state = context::normalize(&snapshot.architecture, &snapshot.registers)
        .map_err(|error| ProcessError::from_context_error(error, snapshot))?;
    let memory = MemoryMap::new(&snapshot.memory_regions, options.null_page_radius).map_err(
        |source| ProcessError::MalformedSnapshot {
            source,
            context: SnapshotContext::of(snapshot),
        },
    )?;
    let reported = snapshot.fault_address.map(|address| address.0);

    let (instruction, decode_error) =
        match decode_at_pc(&state, &memory, reported, &snapshot.instruction_bytes) {
            Some(Ok(instruction)) => {
                debug!("decoded crashing instruction `{}`", instruction);
                (Some(instruction), None)
            }
            Some(Err(error)) => {
                warn!(
                    "couldn't decode instruction at {}: {}",
                    Address(state.program_counter),
                    error
                );
                (None, Some(error))
            }
            None => {
                debug!("fault is on instruction fetch, not decoding");
                (None, None)
            }
        };

    let fault = fault::resolve(
        &snapshot.crash_reason,
        reported,
        &state,
        &memory,
        instruction.as_ref(),
    );
    match fault.address {
        Some(address) => debug!("{} fault at {}", fault.access, Address(address)),
        None => debug!("{} fault with no address", fault.access),
    }

    let input = RuleInput {
        snapshot,
        state: &state,
        memory: &memory,
        instruction: instruction.as_ref(),
        decode_error: decode_error.as_ref(),
        fault: &fault,
        options,
    };
    let mut signals = rules::evaluate(&input);
    signals.extend(
        backtrace::analyze(&snapshot.backtrace, &memory)
            .into_iter()
            .filter(|signal| options.is_enabled(signal.id)),
    );

    let assessment = verdict::aggregate(signals, &snapshot.crash_reason, &options.policy);
    debug!(
        "verdict {} from {} signals",
        assessment.verdict,
        assessment.signals.len()
    );

    Ok(TriageReport {
        architecture: state.architecture,
        crash_reason: snapshot.crash_reason.clone(),
        fault_address: snapshot.fault_address,
        adjusted_address: fault.adjusted,
        fault_access: fault.access,
        program_counter: Address(state.program_counter),
        stack_pointer: Address(state.stack_pointer),
        instruction_str: instruction.as_ref().map(|instruction| instruction.to_string()),
        instruction_class: instruction
            .as_ref()
            .map(|instruction| instruction.operation_class),
        instruction_error: decode_error.map(|error| error.to_string()),
        memory_accesses: fault.accesses,
        assessment,
    })
}

/// Triage independent snapshots in parallel.
///
/// Results are in the same order as `snapshots`. A failure only affects its own snapshot.
pub fn analyze_batch(
    snapshots: &[CrashSnapshot],
    options: &ProcessorOptions,
) -> Vec<Result<TriageReport, ProcessError>> {
    debug!("analyzing a batch of {} snapshots", snapshots.len());
    snapshots
        .par_iter()
        .map(|snapshot| analyze(snapshot, options))
        .collect()
}
