//! The result of triaging a crash.

use std::fmt;
use std::io;
use std::io::prelude::*;
use std::str::FromStr;

use serde_json::json;
use triage_common::{Address, CrashReason};

use crate::context::Architecture;
use crate::fault::{AdjustedAddress, FaultAccess};
use crate::op_analysis::{MemoryAccess, OperationClass};

/// How strongly a signal suggests the crash is exploitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Informational => "informational",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

/// Every kind of evidence the engine can produce.
///
/// The severity of each kind is fixed, see [`SignalId::severity`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub enum SignalId {
    /// The faulting instruction couldn't be decoded
    DecodeFailed,
    /// The debugger couldn't produce a usable backtrace
    UnwindFailed,
    /// A return address points outside of executable memory
    ReturnAddressCorrupted,
    /// A frame pointer points outside of the stack
    FramePointerCorrupted,
    /// The same frame appears more than once in a row
    CyclicUnwind,
    /// A write faulted on mapped memory that isn't writable
    WriteToReadOnly,
    /// A write or execute faulted on unmapped memory away from null
    WildPointerDereference,
    /// The fault address is close to zero
    NullPointerStyle,
    /// The program counter is outside of executable memory
    ControlFlowHijackSuspected,
    /// The fault lies just past a heap pointer held in a register
    HeapOverflowPattern,
    /// The stack pointer is outside of every stack region
    StackPointerCorrupted,
    /// Faulted executing a return
    FaultOnReturn,
    /// An indirect branch faulted loading its target
    IndirectBranchFault,
    /// The program counter is inside a stack region
    StackCodeExecution,
    /// Illegal instruction on bytes that don't decode
    BadInstruction,
    /// `ud2`, `int3`, `udf` or `brk`
    DeliberateTrap,
    /// A block move or other string operation faulted
    BlockMoveFault,
    /// The fault address or a pointer register holds an allocator poison pattern
    UseAfterFreeSuspected,
    /// An x86-64 access to a non-canonical address
    NonCanonicalAddress,
    /// Abort raised from inside the allocator
    HeapError,
    /// Abort raised by a stack protector or fortify check
    StackBufferOverflow,
    /// A read faulted on unmapped memory away from null
    ReadAccessViolation,
    /// Arithmetic exception
    FloatingPointException,
    /// The fault is in a stack guard zone
    StackExhaustion,
    /// The process stopped on a signal that isn't a fault
    BenignSignal,
}

impl SignalId {
    pub const ALL: &'static [SignalId] = &[
        SignalId::DecodeFailed,
        SignalId::UnwindFailed,
        SignalId::ReturnAddressCorrupted,
        SignalId::FramePointerCorrupted,
        SignalId::CyclicUnwind,
        SignalId::WriteToReadOnly,
        SignalId::WildPointerDereference,
        SignalId::NullPointerStyle,
        SignalId::ControlFlowHijackSuspected,
        SignalId::HeapOverflowPattern,
        SignalId::StackPointerCorrupted,
        SignalId::FaultOnReturn,
        SignalId::IndirectBranchFault,
        SignalId::StackCodeExecution,
        SignalId::BadInstruction,
        SignalId::DeliberateTrap,
        SignalId::BlockMoveFault,
        SignalId::UseAfterFreeSuspected,
        SignalId::NonCanonicalAddress,
        SignalId::HeapError,
        SignalId::StackBufferOverflow,
        SignalId::ReadAccessViolation,
        SignalId::FloatingPointException,
        SignalId::StackExhaustion,
        SignalId::BenignSignal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SignalId::DecodeFailed => "decode-failed",
            SignalId::UnwindFailed => "unwind-failed",
            SignalId::ReturnAddressCorrupted => "return-address-corrupted",
            SignalId::FramePointerCorrupted => "frame-pointer-corrupted",
            SignalId::CyclicUnwind => "cyclic-unwind",
            SignalId::WriteToReadOnly => "write-to-read-only",
            SignalId::WildPointerDereference => "wild-pointer-dereference",
            SignalId::NullPointerStyle => "null-pointer-style",
            SignalId::ControlFlowHijackSuspected => "control-flow-hijack-suspected",
            SignalId::HeapOverflowPattern => "heap-overflow-pattern",
            SignalId::StackPointerCorrupted => "stack-pointer-corrupted",
            SignalId::FaultOnReturn => "fault-on-return",
            SignalId::IndirectBranchFault => "indirect-branch-fault",
            SignalId::StackCodeExecution => "stack-code-execution",
            SignalId::BadInstruction => "bad-instruction",
            SignalId::DeliberateTrap => "deliberate-trap",
            SignalId::BlockMoveFault => "block-move-fault",
            SignalId::UseAfterFreeSuspected => "use-after-free-suspected",
            SignalId::NonCanonicalAddress => "non-canonical-address",
            SignalId::HeapError => "heap-error",
            SignalId::StackBufferOverflow => "stack-buffer-overflow",
            SignalId::ReadAccessViolation => "read-access-violation",
            SignalId::FloatingPointException => "floating-point-exception",
            SignalId::StackExhaustion => "stack-exhaustion",
            SignalId::BenignSignal => "benign-signal",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SignalId::ReturnAddressCorrupted
            | SignalId::WriteToReadOnly
            | SignalId::WildPointerDereference
            | SignalId::ControlFlowHijackSuspected
            | SignalId::StackPointerCorrupted
            | SignalId::FaultOnReturn
            | SignalId::IndirectBranchFault
            | SignalId::StackCodeExecution
            | SignalId::BadInstruction
            | SignalId::HeapError
            | SignalId::StackBufferOverflow => Severity::High,
            SignalId::FramePointerCorrupted
            | SignalId::HeapOverflowPattern
            | SignalId::BlockMoveFault
            | SignalId::UseAfterFreeSuspected
            | SignalId::NonCanonicalAddress => Severity::Medium,
            SignalId::UnwindFailed
            | SignalId::NullPointerStyle
            | SignalId::DeliberateTrap
            | SignalId::FloatingPointException
            | SignalId::StackExhaustion => Severity::Low,
            SignalId::DecodeFailed
            | SignalId::CyclicUnwind
            | SignalId::ReadAccessViolation
            | SignalId::BenignSignal => Severity::Informational,
        }
    }

    /// Whether this signal means the engine is missing evidence, rather than providing some.
    pub fn degrades_confidence(&self) -> bool {
        matches!(
            self,
            SignalId::DecodeFailed | SignalId::UnwindFailed | SignalId::CyclicUnwind
        )
    }

    /// Whether this signal reports a backtrace the debugger couldn't finish.
    pub fn is_unwind_problem(&self) -> bool {
        matches!(self, SignalId::UnwindFailed | SignalId::CyclicUnwind)
    }

    /// Whether this signal shows stack or control-flow corruption, which breaks unwinding
    /// on its own.
    pub fn breaks_unwinding(&self) -> bool {
        matches!(
            self,
            SignalId::ControlFlowHijackSuspected
                | SignalId::ReturnAddressCorrupted
                | SignalId::StackPointerCorrupted
                | SignalId::StackCodeExecution
        )
    }
}

/// An error encountered while parsing a [`SignalId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown signal `{0}`")]
pub struct UnknownSignalError(String);

impl FromStr for SignalId {
    type Err = UnknownSignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SignalId::ALL
            .iter()
            .copied()
            .find(|id| id.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownSignalError(s.to_owned()))
    }
}

impl TryFrom<String> for SignalId {
    type Error = UnknownSignalError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SignalId> for String {
    fn from(id: SignalId) -> Self {
        id.name().to_owned()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One piece of evidence, with a human-readable explanation of what was observed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Signal {
    pub id: SignalId,
    pub severity: Severity,
    pub explanation: String,
}

impl Signal {
    pub fn new(id: SignalId, explanation: impl Into<String>) -> Self {
        Signal {
            id,
            severity: id.severity(),
            explanation: explanation.into(),
        }
    }

    pub fn is_data_quality(&self) -> bool {
        self.id.degrades_confidence()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.id, self.explanation)
    }
}

/// The final classification, in increasing order of concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    NotExploitable,
    ProbablyNotExploitable,
    Unknown,
    ProbablyExploitable,
    Exploitable,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::NotExploitable => "NOT_EXPLOITABLE",
            Verdict::ProbablyNotExploitable => "PROBABLY_NOT_EXPLOITABLE",
            Verdict::Unknown => "UNKNOWN",
            Verdict::ProbablyExploitable => "PROBABLY_EXPLOITABLE",
            Verdict::Exploitable => "EXPLOITABLE",
        })
    }
}

/// The verdict together with everything that led to it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Assessment {
    pub verdict: Verdict,
    /// Every signal that fired, in evaluation order.
    pub signals: Vec<Signal>,
    /// Whether missing evidence held the verdict at `UNKNOWN`.
    pub confidence_limited: bool,
    pub rationale: String,
}

impl Assessment {
    pub fn has_signal(&self, id: SignalId) -> bool {
        self.signals.iter().any(|signal| signal.id == id)
    }
}

/// Everything the processor determined about one crash snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageReport {
    pub architecture: Architecture,
    pub crash_reason: CrashReason,
    /// The fault address as reported by the debugger.
    pub fault_address: Option<Address>,
    /// Set if the fault address had to be corrected or inferred.
    pub adjusted_address: Option<AdjustedAddress>,
    pub fault_access: FaultAccess,
    pub program_counter: Address,
    pub stack_pointer: Address,
    /// A string representation of the faulting instruction for humans to read.
    pub instruction_str: Option<String>,
    pub instruction_class: Option<OperationClass>,
    /// Why the instruction couldn't be decoded, if it couldn't.
    pub instruction_error: Option<String>,
    pub memory_accesses: Vec<MemoryAccess>,
    pub assessment: Assessment,
}

impl TriageReport {
    pub fn verdict(&self) -> Verdict {
        self.assessment.verdict
    }

    /// Write a human-readable description of the triage result to `f`.
    pub fn print<T: Write>(&self, f: &mut T) -> io::Result<()> {
        self.print_internal(f, false)
    }

    /// Write a brief human-readable description of the triage result to `f`.
    ///
    /// A single line: the verdict, the crash reason and the ids of the signals that fired.
    pub fn print_brief<T: Write>(&self, f: &mut T) -> io::Result<()> {
        self.print_internal(f, true)
    }

    fn print_internal<T: Write>(&self, f: &mut T, brief: bool) -> io::Result<()> {
        if brief {
            let ids: Vec<&str> = self
                .assessment
                .signals
                .iter()
                .map(|signal| signal.id.name())
                .collect();
            writeln!(
                f,
                "{} {} {}",
                self.assessment.verdict,
                self.crash_reason,
                ids.join(",")
            )?;
            return Ok(());
        }

        writeln!(f, "Verdict: {}", self.assessment.verdict)?;

        writeln!(f, "CPU: {}", self.architecture)?;
        writeln!(f, "Crash reason:  {}", self.crash_reason)?;
        match (&self.fault_address, &self.adjusted_address) {
            (Some(address), Some(adjusted)) => {
                writeln!(f, "Crash address: {address} **")?;
                writeln!(f, "    ** {adjusted}")?;
            }
            (None, Some(adjusted)) => {
                writeln!(f, "Crash address: not reported **")?;
                writeln!(f, "    ** {adjusted}")?;
            }
            (Some(address), None) => writeln!(f, "Crash address: {address}")?,
            (None, None) => writeln!(f, "Crash address: not reported")?,
        }
        writeln!(f, "Fault access:  {}", self.fault_access)?;
        writeln!(f, "Program counter: {}", self.program_counter)?;
        writeln!(f, "Stack pointer:   {}", self.stack_pointer)?;

        if let Some(ref instruction) = self.instruction_str {
            writeln!(f, "Crashing instruction: `{instruction}`")?;
        } else if let Some(ref error) = self.instruction_error {
            writeln!(f, "Crashing instruction: unavailable ({error})")?;
        }
        if !self.memory_accesses.is_empty() {
            writeln!(f, "Memory accessed by instruction:")?;
            for (idx, access) in self.memory_accesses.iter().enumerate() {
                writeln!(
                    f,
                    "  {idx}. Address: {} ({})",
                    Address(access.address),
                    access.access_type
                )?;
                if let Some(size) = access.size {
                    writeln!(f, "     Size: {size}")?;
                } else {
                    writeln!(f, "     Size: Unknown")?;
                }
            }
        }
        writeln!(f)?;

        if self.assessment.signals.is_empty() {
            writeln!(f, "No signals")?;
        } else {
            writeln!(f, "Signals:")?;
            for signal in &self.assessment.signals {
                writeln!(f, "  {signal}")?;
            }
        }
        writeln!(f)?;
        writeln!(f, "{}", self.assessment.rationale)?;
        Ok(())
    }

    /// The report as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "verdict": self.assessment.verdict,
            "confidence_limited": self.assessment.confidence_limited,
            "architecture": self.architecture,
            "crash_info": {
                "type": self.crash_reason.to_string(),
                "address": self.fault_address,
                "adjusted_address": self.adjusted_address.as_ref().map(|adjusted| match adjusted {
                    AdjustedAddress::NonCanonical(address) => json!({
                        "kind": "non-canonical",
                        "address": address,
                    }),
                    AdjustedAddress::Inferred(address) => json!({
                        "kind": "inferred",
                        "address": address,
                    }),
                }),
                "access": self.fault_access,
                "instruction": self.instruction_str,
                "instruction_class": self.instruction_class,
                "instruction_error": self.instruction_error,
                "memory_accesses": self.memory_accesses.iter().map(|access| json!({
                    "address": Address(access.address),
                    "size": access.size,
                    "type": access.access_type,
                })).collect::<Vec<_>>(),
            },
            "registers": {
                "pc": self.program_counter,
                "sp": self.stack_pointer,
            },
            "signals": self.assessment.signals,
            "rationale": self.assessment.rationale,
        })
    }

    /// Outputs the report as json, one object per snapshot.
    pub fn print_json<T: Write>(&self, f: &mut T, pretty: bool) -> Result<(), serde_json::Error> {
        if pretty {
            serde_json::to_writer_pretty(f, &self.to_json())
        } else {
            serde_json::to_writer(f, &self.to_json())
        }
    }
}
