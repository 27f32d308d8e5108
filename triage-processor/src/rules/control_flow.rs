//! Rules about the instruction at the program counter and where control was going.

use triage_common::{Address, CrashReason};

use super::RuleInput;
use crate::op_analysis::{BranchTarget, OpAnalysisError, OperationClass};
use crate::report::{Signal, SignalId};

fn is_undecodable(error: &OpAnalysisError) -> bool {
    matches!(
        error,
        OpAnalysisError::UnsupportedInstruction(_) | OpAnalysisError::InstructionTruncated
    )
}

pub fn decode_failed(input: &RuleInput<'_>) -> Option<Signal> {
    let error = input.decode_error?;
    // An illegal instruction that doesn't decode is evidence, not missing evidence.
    if input.snapshot.crash_reason == CrashReason::Ill && is_undecodable(error) {
        return None;
    }
    Some(Signal::new(
        SignalId::DecodeFailed,
        format!(
            "couldn't decode the instruction at {}: {error}",
            Address(input.state.program_counter)
        ),
    ))
}

pub fn control_flow_hijack_suspected(input: &RuleInput<'_>) -> Option<Signal> {
    if !input.fault.is_execute() || input.memory.is_empty() {
        return None;
    }
    let pc = input.state.program_counter;
    if input.memory.is_near_null(pc) {
        return None;
    }
    let location = match input.memory.region(pc) {
        Some(region) if region.permissions.execute => return None,
        Some(region) => format!("non-executable {}", region.describe()),
        None => String::from("unmapped memory"),
    };
    Some(Signal::new(
        SignalId::ControlFlowHijackSuspected,
        format!("program counter {} is in {location}", Address(pc)),
    ))
}

pub fn fault_on_return(input: &RuleInput<'_>) -> Option<Signal> {
    let instruction = input.instruction?;
    if instruction.operation_class != OperationClass::Return
        || !input.snapshot.crash_reason.is_memory_fault()
    {
        return None;
    }
    Some(Signal::new(
        SignalId::FaultOnReturn,
        format!("faulted executing `{instruction}`"),
    ))
}

pub fn indirect_branch_fault(input: &RuleInput<'_>) -> Option<Signal> {
    let instruction = input.instruction?;
    if instruction.operation_class != OperationClass::ExecuteIndirect
        || !input.snapshot.crash_reason.is_memory_fault()
    {
        return None;
    }
    match instruction.branch_target? {
        BranchTarget::Memory(addressing) => {
            let access = input.fault.faulting_access?;
            let operand = instruction.memory_operands.get(access.operand)?;
            if operand.addressing != addressing || input.memory.is_near_null(access.address) {
                return None;
            }
            Some(Signal::new(
                SignalId::IndirectBranchFault,
                format!(
                    "`{instruction}` faulted loading its target from {}",
                    Address(access.address)
                ),
            ))
        }
        BranchTarget::Register(reg) => {
            if input.memory.is_empty() {
                return None;
            }
            let target = input.state.gpr(reg.0)?;
            if input.memory.is_near_null(target) || input.memory.is_executable(target) {
                return None;
            }
            Some(Signal::new(
                SignalId::IndirectBranchFault,
                format!(
                    "`{instruction}` faulted branching to non-executable {}",
                    Address(target)
                ),
            ))
        }
        BranchTarget::Relative(_) | BranchTarget::Stack => None,
    }
}

pub fn stack_code_execution(input: &RuleInput<'_>) -> Option<Signal> {
    let pc = input.state.program_counter;
    let region = input.memory.region(pc)?;
    if !input.memory.in_stack(pc) {
        return None;
    }
    Some(Signal::new(
        SignalId::StackCodeExecution,
        format!("executing from {}", region.describe()),
    ))
}

pub fn bad_instruction(input: &RuleInput<'_>) -> Option<Signal> {
    if input.snapshot.crash_reason != CrashReason::Ill {
        return None;
    }
    let error = input.decode_error?;
    if !is_undecodable(error) {
        return None;
    }
    Some(Signal::new(
        SignalId::BadInstruction,
        format!(
            "illegal instruction at {}: {error}",
            Address(input.state.program_counter)
        ),
    ))
}

pub fn deliberate_trap(input: &RuleInput<'_>) -> Option<Signal> {
    if !matches!(
        input.snapshot.crash_reason,
        CrashReason::Ill | CrashReason::Trap
    ) {
        return None;
    }
    let instruction = input.instruction?;
    if !matches!(
        instruction.operation_class,
        OperationClass::Trap | OperationClass::Undefined
    ) {
        return None;
    }
    Some(Signal::new(
        SignalId::DeliberateTrap,
        format!("stopped on `{instruction}`"),
    ))
}

pub fn block_move_fault(input: &RuleInput<'_>) -> Option<Signal> {
    let instruction = input.instruction?;
    if instruction.operation_class != OperationClass::StringOp
        || !input.snapshot.crash_reason.is_memory_fault()
    {
        return None;
    }
    let address = input.wild_fault_address()?;
    Some(Signal::new(
        SignalId::BlockMoveFault,
        format!("block move `{instruction}` faulted at {address:#x}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    #[test]
    fn test_hijack() {
        let crash = snapshot(
            CrashReason::Segv,
            Some(0x4141_4141),
            &[("rip", 0x4141_4141)],
            &[],
        );
        let signal = run_rule(control_flow_hijack_suspected, &crash).unwrap();
        assert!(signal.explanation.contains("unmapped"));
        // nothing was decoded, so nothing failed to decode
        assert_eq!(run_rule(decode_failed, &crash), None);

        // jumping to the heap
        let crash = snapshot(
            CrashReason::Segv,
            Some(0x61_0000),
            &[("rip", 0x61_0000)],
            &[],
        );
        let signal = run_rule(control_flow_hijack_suspected, &crash).unwrap();
        assert!(signal.explanation.contains("non-executable"));

        // calling a null function pointer is someone else's problem
        let crash = snapshot(CrashReason::Segv, Some(0), &[("rip", 0)], &[]);
        assert_eq!(run_rule(control_flow_hijack_suspected, &crash), None);
    }

    #[test]
    fn test_stack_execution() {
        let crash = snapshot(
            CrashReason::Segv,
            Some(0x7ff1_8000),
            &[("rip", 0x7ff1_8000)],
            &[],
        );
        assert!(run_rule(stack_code_execution, &crash).is_some());
        assert!(run_rule(control_flow_hijack_suspected, &crash).is_some());
    }

    #[test]
    fn test_return() {
        let crash = snapshot(CrashReason::Segv, Some(0), &[], &[0xc3]);
        let signal = run_rule(fault_on_return, &crash).unwrap();
        assert!(signal.explanation.contains("ret"));
    }

    #[test]
    fn test_indirect_call_through_memory() {
        // call qword ptr [rax + 0x8]
        let crash = snapshot(
            CrashReason::Segv,
            Some(0x1234_5008),
            &[("rax", 0x1234_5000)],
            &[0xff, 0x50, 0x08],
        );
        assert!(run_rule(indirect_branch_fault, &crash).is_some());

        // a null vtable isn't interesting
        let crash = snapshot(CrashReason::Segv, Some(0x8), &[("rax", 0)], &[0xff, 0x50, 0x08]);
        assert_eq!(run_rule(indirect_branch_fault, &crash), None);
    }

    #[test]
    fn test_indirect_jump_through_register() {
        // jmp rax
        let crash = snapshot(
            CrashReason::Segv,
            Some(0),
            &[("rax", 0x4141_4141_4141_4141)],
            &[0xff, 0xe0],
        );
        assert!(run_rule(indirect_branch_fault, &crash).is_some());

        let crash = snapshot(
            CrashReason::Segv,
            Some(0),
            &[("rax", 0x40_2000)],
            &[0xff, 0xe0],
        );
        assert_eq!(run_rule(indirect_branch_fault, &crash), None);
    }

    #[test]
    fn test_illegal_instructions() {
        // ud2
        let crash = snapshot(CrashReason::Ill, None, &[], &[0x0f, 0x0b]);
        assert!(run_rule(deliberate_trap, &crash).is_some());
        assert_eq!(run_rule(bad_instruction, &crash), None);

        // int3
        let crash = snapshot(CrashReason::Trap, None, &[], &[0xcc]);
        assert!(run_rule(deliberate_trap, &crash).is_some());

        // garbage
        let crash = snapshot(CrashReason::Ill, None, &[], &[0x0f, 0xff]);
        assert!(run_rule(bad_instruction, &crash).is_some());
        assert_eq!(run_rule(decode_failed, &crash), None);

        // the same garbage under a segfault just couldn't be decoded
        let crash = snapshot(CrashReason::Segv, Some(0x1234_5678), &[], &[0x0f, 0xff]);
        assert_eq!(run_rule(bad_instruction, &crash), None);
        assert!(run_rule(decode_failed, &crash).is_some());
    }

    #[test]
    fn test_block_move() {
        // rep movsb
        let crash = snapshot(
            CrashReason::Segv,
            Some(0x1234_5678),
            &[("rsi", 0x61_0000), ("rdi", 0x1234_5678)],
            &[0xf3, 0xa4],
        );
        assert!(run_rule(block_move_fault, &crash).is_some());

        // rep stosb into the null page
        let crash = snapshot(
            CrashReason::Segv,
            Some(0x10),
            &[("rdi", 0x10)],
            &[0xf3, 0xaa],
        );
        assert_eq!(run_rule(block_move_fault, &crash), None);
    }
}
