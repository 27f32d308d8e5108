//! The heuristic rule catalog.
//!
//! Every rule is a plain function that looks at a [`RuleInput`] and either produces a
//! [`Signal`] or abstains. Rules don't know about each other: each one checks whatever
//! preconditions it needs itself, including staying away from addresses near null (which only
//! [`memory::null_pointer_style`] reasons about).
//!
//! Rules run in catalog order, and signals are reported in that order.

mod abort;
mod control_flow;
mod memory;
mod stack;

use tracing::trace;
use triage_common::CrashSnapshot;

use crate::context::CanonicalState;
use crate::fault::FaultInfo;
use crate::memory_map::MemoryMap;
use crate::op_analysis::{DecodedInstruction, OpAnalysisError};
use crate::report::{Signal, SignalId};
use crate::ProcessorOptions;

/// Everything a rule may look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub snapshot: &'a CrashSnapshot,
    pub state: &'a CanonicalState,
    pub memory: &'a MemoryMap<'a>,
    /// The instruction at the program counter, if it was decoded
    pub instruction: Option<&'a DecodedInstruction>,
    /// Why decoding failed, if it was attempted and failed
    pub decode_error: Option<&'a OpAnalysisError>,
    pub fault: &'a FaultInfo,
    pub options: &'a ProcessorOptions,
}

impl RuleInput<'_> {
    /// The fault address, for crashes that fault on an address at all.
    pub fn fault_address(&self) -> Option<u64> {
        if self.snapshot.crash_reason.is_memory_fault() {
            self.fault.address
        } else {
            None
        }
    }

    /// The fault address, unless it's close enough to zero to be a null pointer.
    pub fn wild_fault_address(&self) -> Option<u64> {
        self.fault_address()
            .filter(|&address| !self.memory.is_near_null(address))
    }

    pub fn is_stack_guard(&self, address: u64) -> bool {
        self.memory
            .is_stack_guard(address, self.options.stack_guard_distance)
    }
}

/// An entry in the rule catalog.
pub struct Rule {
    /// The signal this rule produces
    pub id: SignalId,
    pub evaluate: fn(&RuleInput<'_>) -> Option<Signal>,
}

/// All rules, in evaluation order.
#[rustfmt::skip]
pub static RULES: &[Rule] = &[
    Rule { id: SignalId::DecodeFailed, evaluate: control_flow::decode_failed },
    Rule { id: SignalId::WriteToReadOnly, evaluate: memory::write_to_read_only },
    Rule { id: SignalId::WildPointerDereference, evaluate: memory::wild_pointer_dereference },
    Rule { id: SignalId::NullPointerStyle, evaluate: memory::null_pointer_style },
    Rule { id: SignalId::ControlFlowHijackSuspected, evaluate: control_flow::control_flow_hijack_suspected },
    Rule { id: SignalId::HeapOverflowPattern, evaluate: memory::heap_overflow_pattern },
    Rule { id: SignalId::StackPointerCorrupted, evaluate: stack::stack_pointer_corrupted },
    Rule { id: SignalId::FaultOnReturn, evaluate: control_flow::fault_on_return },
    Rule { id: SignalId::IndirectBranchFault, evaluate: control_flow::indirect_branch_fault },
    Rule { id: SignalId::StackCodeExecution, evaluate: control_flow::stack_code_execution },
    Rule { id: SignalId::BadInstruction, evaluate: control_flow::bad_instruction },
    Rule { id: SignalId::DeliberateTrap, evaluate: control_flow::deliberate_trap },
    Rule { id: SignalId::BlockMoveFault, evaluate: control_flow::block_move_fault },
    Rule { id: SignalId::UseAfterFreeSuspected, evaluate: memory::use_after_free_suspected },
    Rule { id: SignalId::NonCanonicalAddress, evaluate: memory::non_canonical_address },
    Rule { id: SignalId::HeapError, evaluate: abort::heap_error },
    Rule { id: SignalId::StackBufferOverflow, evaluate: abort::stack_buffer_overflow },
    Rule { id: SignalId::ReadAccessViolation, evaluate: memory::read_access_violation },
    Rule { id: SignalId::FloatingPointException, evaluate: abort::floating_point_exception },
    Rule { id: SignalId::StackExhaustion, evaluate: stack::stack_exhaustion },
    Rule { id: SignalId::BenignSignal, evaluate: abort::benign_signal },
];

/// Run every enabled rule over `input`.
pub fn evaluate(input: &RuleInput<'_>) -> Vec<Signal> {
    RULES
        .iter()
        .filter(|rule| input.options.is_enabled(rule.id))
        .filter_map(|rule| {
            let result = (rule.evaluate)(input);
            match result {
                Some(ref signal) => trace!("rule {}: fired: {}", rule.id, signal.explanation),
                None => trace!("rule {}: abstained", rule.id),
            }
            result
        })
        .collect()
}
