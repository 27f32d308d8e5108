//! Rules about the address that faulted.

use triage_common::Address;

use super::RuleInput;
use crate::context::Architecture;
use crate::fault::{self, AdjustedAddress, FaultAccess};
use crate::report::{Signal, SignalId};

/// Byte patterns that allocators, debug heaps and fuzzing harnesses fill freed or
/// uninitialized memory with.
const POISON_BYTES: &[u8] = &[
    0x2b, 0x2d, 0x2f, 0x49, 0x4b, 0x4d, 0x4f, 0x6b, 0x8b, 0x9b, 0x9f, 0xa5, 0xbb, 0xcc, 0xcd,
    0xce, 0xdb, 0xe5,
];

/// The poison byte `value` is filled with, if any.
///
/// The lowest byte is allowed to differ so that a small offset from a poisoned pointer still
/// counts.
fn poison_byte(value: u64, word_size: u8) -> Option<u8> {
    let bits = u32::from(word_size) * 8;
    let top = (value >> (bits - 8)) as u8;
    if !POISON_BYTES.contains(&top) {
        return None;
    }
    (1..u32::from(word_size))
        .all(|byte| (value >> (byte * 8)) as u8 == top)
        .then_some(top)
}

pub fn write_to_read_only(input: &RuleInput<'_>) -> Option<Signal> {
    if input.fault.access != FaultAccess::Write {
        return None;
    }
    let address = input.wild_fault_address()?;
    let region = input.memory.region(address)?;
    if region.permissions.write {
        return None;
    }
    Some(Signal::new(
        SignalId::WriteToReadOnly,
        format!(
            "write to {} in read-only {}",
            Address(address),
            region.describe()
        ),
    ))
}

pub fn wild_pointer_dereference(input: &RuleInput<'_>) -> Option<Signal> {
    if !matches!(input.fault.access, FaultAccess::Write | FaultAccess::Execute) {
        return None;
    }
    if input.memory.is_empty() {
        return None;
    }
    let address = input.wild_fault_address()?;
    if input.memory.region(address).is_some() || input.is_stack_guard(address) {
        return None;
    }
    Some(Signal::new(
        SignalId::WildPointerDereference,
        format!("{} of unmapped address {}", input.fault.access, Address(address)),
    ))
}

pub fn null_pointer_style(input: &RuleInput<'_>) -> Option<Signal> {
    let address = input.fault_address()?;
    if !input.memory.is_near_null(address) {
        return None;
    }
    Some(Signal::new(
        SignalId::NullPointerStyle,
        format!(
            "{} fault at {}, within {:#x} bytes of null",
            input.fault.access,
            Address(address),
            input.memory.null_page_radius()
        ),
    ))
}

pub fn heap_overflow_pattern(input: &RuleInput<'_>) -> Option<Signal> {
    if input.fault.is_execute() || input.memory.is_empty() {
        return None;
    }
    let address = input.wild_fault_address()?;
    let ceiling = input.options.heap_overflow_offset_ceiling;
    input
        .state
        .data_registers()
        .find_map(|(_, name, value)| {
            let region = input.memory.region(value)?;
            if !input.memory.in_heap(value) || region.contains(address) || address <= value {
                return None;
            }
            let offset = address - value;
            (offset <= ceiling).then(|| {
                Signal::new(
                    SignalId::HeapOverflowPattern,
                    format!(
                        "heuristic: fault address {} is {offset:#x} bytes past {name} = {}, \
                         which points into {}",
                        Address(address),
                        Address(value),
                        region.describe()
                    ),
                )
            })
        })
}

pub fn use_after_free_suspected(input: &RuleInput<'_>) -> Option<Signal> {
    if !input.snapshot.crash_reason.is_memory_fault() {
        return None;
    }
    let word_size = input.state.architecture.word_size();
    if let Some(address) = input.fault.address {
        if let Some(byte) = poison_byte(address, word_size) {
            return Some(Signal::new(
                SignalId::UseAfterFreeSuspected,
                format!(
                    "fault address {} is filled with the poison byte {byte:#04x}",
                    Address(address)
                ),
            ));
        }
    }
    let instruction = input.instruction?;
    instruction
        .memory_operands
        .iter()
        .flat_map(|operand| operand.addressing.registers())
        .find_map(|reg| {
            let value = input.state.gpr(reg.0)?;
            let byte = poison_byte(value, word_size)?;
            Some(Signal::new(
                SignalId::UseAfterFreeSuspected,
                format!(
                    "{} = {} is filled with the poison byte {byte:#04x}",
                    input.state.architecture.register_name(reg.0),
                    Address(value)
                ),
            ))
        })
}

pub fn non_canonical_address(input: &RuleInput<'_>) -> Option<Signal> {
    if input.state.architecture != Architecture::X86_64 {
        return None;
    }
    if !input.snapshot.crash_reason.is_memory_fault() {
        return None;
    }
    let address = match input.fault.adjusted {
        Some(AdjustedAddress::NonCanonical(address)) => address.0,
        _ => input
            .fault
            .address
            .filter(|&address| fault::is_non_canonical(address))
            .or_else(|| {
                input
                    .fault
                    .accesses
                    .iter()
                    .map(|access| access.address)
                    .find(|&address| fault::is_non_canonical(address))
            })?,
    };
    Some(Signal::new(
        SignalId::NonCanonicalAddress,
        format!("access to non-canonical address {}", Address(address)),
    ))
}

pub fn read_access_violation(input: &RuleInput<'_>) -> Option<Signal> {
    if input.fault.access != FaultAccess::Read || input.memory.is_empty() {
        return None;
    }
    let address = input.wild_fault_address()?;
    if input.memory.region(address).is_some() || input.is_stack_guard(address) {
        return None;
    }
    Some(Signal::new(
        SignalId::ReadAccessViolation,
        format!("read of unmapped address {}", Address(address)),
    ))
}
