//! Rules about the stack pointer and the stack guard zone.

use triage_common::Address;

use super::RuleInput;
use crate::report::{Signal, SignalId};

pub fn stack_pointer_corrupted(input: &RuleInput<'_>) -> Option<Signal> {
    if !input.memory.has_stack() {
        return None;
    }
    let sp = input.state.stack_pointer;
    // Running off the end of the stack is exhaustion, not corruption.
    if input.memory.in_stack(sp) || input.is_stack_guard(sp) {
        return None;
    }
    let location = match input.memory.region(sp) {
        Some(region) => region.describe(),
        None => String::from("unmapped memory"),
    };
    Some(Signal::new(
        SignalId::StackPointerCorrupted,
        format!("stack pointer {} is in {location}", Address(sp)),
    ))
}

pub fn stack_exhaustion(input: &RuleInput<'_>) -> Option<Signal> {
    if !input.snapshot.crash_reason.is_memory_fault() || !input.memory.has_stack() {
        return None;
    }
    let distance = input.options.stack_guard_distance;
    let (what, address) = [
        ("fault address", input.fault.address),
        ("stack pointer", Some(input.state.stack_pointer)),
    ]
    .into_iter()
    .find_map(|(what, address)| {
        let address = address?;
        input.is_stack_guard(address).then_some((what, address))
    })?;
    let stack = input.memory.stack_guard_for(address, distance)?;
    Some(Signal::new(
        SignalId::StackExhaustion,
        format!(
            "{what} {} is in the guard zone below {}",
            Address(address),
            stack.describe()
        ),
    ))
}
