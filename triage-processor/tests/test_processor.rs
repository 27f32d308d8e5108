use triage_common::{Address, Cpu, CrashReason, CrashSnapshot, Permissions, RegionLabel};
use triage_processor::{
    analyze, analyze_batch, AdjustedAddress, FaultAccess, ProcessError, ProcessorOptions,
    SignalId, SnapshotError, TriageReport, Verdict,
};
use triage_synth::{SynthSnapshot, LAYOUT_64};

fn triage(snapshot: &CrashSnapshot) -> TriageReport {
    analyze(snapshot, &ProcessorOptions::default()).unwrap()
}

fn signal_ids(report: &TriageReport) -> Vec<SignalId> {
    report.assessment.signals.iter().map(|s| s.id).collect()
}

fn null_write() -> CrashSnapshot {
    // mov dword ptr [rax + 0x4], ecx
    SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0x4)
        .register("rax", 0)
        .instruction(&[0x89, 0x48, 0x04])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish()
}

fn hijack() -> CrashSnapshot {
    SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0x41_4141_4141)
        .pc(0x41_4141_4141)
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish()
}

fn wild_write() -> CrashSnapshot {
    // mov qword ptr [rax], rcx
    SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0x1234_5678)
        .register("rax", 0x1234_5678)
        .instruction(&[0x48, 0x89, 0x08])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish()
}

#[test]
fn test_null_pointer_write() {
    let report = triage(&null_write());
    assert_eq!(report.verdict(), Verdict::ProbablyNotExploitable);
    assert_eq!(signal_ids(&report), vec![SignalId::NullPointerStyle]);
    assert_eq!(report.fault_access, FaultAccess::Write);
    let instruction = report.instruction_str.as_deref().unwrap();
    assert!(instruction.starts_with("mov [rax + 0x4]"), "{instruction}");
}

#[test]
fn test_control_flow_hijack() {
    let report = triage(&hijack());
    assert_eq!(report.verdict(), Verdict::Exploitable);
    assert!(report
        .assessment
        .has_signal(SignalId::ControlFlowHijackSuspected));
    assert!(report.assessment.has_signal(SignalId::WildPointerDereference));
    assert_eq!(report.fault_access, FaultAccess::Execute);
    // fetching the instruction faulted, so there was nothing to decode
    assert_eq!(report.instruction_str, None);
    assert!(!report.assessment.has_signal(SignalId::DecodeFailed));
}

#[test]
fn test_control_flow_hijack_without_backtrace() {
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0x41_4141_4141)
        .pc(0x41_4141_4141)
        .with_standard_layout()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(
        signal_ids(&report),
        vec![
            SignalId::WildPointerDereference,
            SignalId::ControlFlowHijackSuspected,
            SignalId::UnwindFailed
        ]
    );
    // a hijacked pc is why the debugger couldn't unwind
    assert!(!report.assessment.confidence_limited);
    assert_eq!(report.verdict(), Verdict::Exploitable);
}

#[test]
fn test_benign_abort_without_backtrace() {
    // syscall
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Abrt)
        .instruction(&[0x0f, 0x05])
        .with_standard_layout()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(report.verdict(), Verdict::Unknown);
    assert!(report.assessment.confidence_limited);
    assert_eq!(
        signal_ids(&report),
        vec![SignalId::BenignSignal, SignalId::UnwindFailed]
    );

    // with a backtrace the same abort is harmless
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Abrt)
        .instruction(&[0x0f, 0x05])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    assert_eq!(triage(&snapshot).verdict(), Verdict::NotExploitable);
}

#[test]
fn test_heap_corruption_abort() {
    let layout = LAYOUT_64;
    let base = layout.stack.1 - 0x1000;
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Abrt)
        .instruction(&[0x0f, 0x05])
        .with_standard_layout()
        .symbolized_frame(layout.libc.0 + 0x100, Some(base), "__pthread_kill_implementation")
        .symbolized_frame(layout.libc.0 + 0x200, Some(base + 0x20), "raise")
        .symbolized_frame(layout.libc.0 + 0x300, Some(base + 0x40), "abort")
        .symbolized_frame(layout.libc.0 + 0x400, Some(base + 0x60), "malloc_printerr")
        .symbolized_frame(layout.libc.0 + 0x500, Some(base + 0x80), "_int_free")
        .symbolized_frame(layout.text.0 + 0x600, Some(base + 0xa0), "main")
        .finish();
    let report = triage(&snapshot);
    assert_eq!(report.verdict(), Verdict::ProbablyExploitable);
    assert_eq!(
        signal_ids(&report),
        vec![SignalId::HeapError, SignalId::BenignSignal]
    );
}

#[test]
fn test_heap_overflow_write() {
    let heap_end = LAYOUT_64.heap.1;
    // mov qword ptr [rax], rcx
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(heap_end + 0x8)
        .register("rax", heap_end + 0x8)
        .register("rbx", heap_end - 0x20)
        .instruction(&[0x48, 0x89, 0x08])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(
        signal_ids(&report),
        vec![
            SignalId::WildPointerDereference,
            SignalId::HeapOverflowPattern
        ]
    );
    assert_eq!(report.verdict(), Verdict::ProbablyExploitable);
}

#[test]
fn test_general_protection_fault() {
    // mov rcx, qword ptr [rax]
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0)
        .register("rax", 0xdbdb_dbdb_dbdb_dbdb)
        .instruction(&[0x48, 0x8b, 0x08])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(
        report.adjusted_address,
        Some(AdjustedAddress::NonCanonical(Address(0xdbdb_dbdb_dbdb_dbdb)))
    );
    assert_eq!(
        signal_ids(&report),
        vec![
            SignalId::UseAfterFreeSuspected,
            SignalId::NonCanonicalAddress,
            SignalId::ReadAccessViolation,
        ]
    );
    assert_eq!(report.verdict(), Verdict::ProbablyExploitable);
}

#[test]
fn test_arm64_null_read() {
    // ldr x0, [x1]
    let snapshot = SynthSnapshot::new(Cpu::Arm64, CrashReason::Segv)
        .fault_address(0)
        .register("x1", 0)
        .instruction(&[0x20, 0x00, 0x40, 0xf9])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(report.fault_access, FaultAccess::Read);
    assert_eq!(signal_ids(&report), vec![SignalId::NullPointerStyle]);
    assert_eq!(report.verdict(), Verdict::ProbablyNotExploitable);
}

#[test]
fn test_thumb_is_not_decoded() {
    let snapshot = SynthSnapshot::new(Cpu::Arm, CrashReason::Segv)
        .fault_address(0x10)
        .register("cpsr", 0x6000_0030)
        .instruction(&[0x00, 0x68])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(
        signal_ids(&report),
        vec![SignalId::DecodeFailed, SignalId::NullPointerStyle]
    );
    assert_eq!(report.verdict(), Verdict::Unknown);
}

#[test]
fn test_stack_smash() {
    let layout = LAYOUT_64;
    let base = layout.stack.1 - 0x1000;
    // ret
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0)
        .instruction(&[0xc3])
        .with_standard_layout()
        .frame(layout.text.0 + 0x1234, Some(base))
        .frame(0x4141_4141_4141_4141, Some(0x4141_4141_4141_4141))
        .finish();
    let report = triage(&snapshot);
    assert_eq!(report.verdict(), Verdict::Exploitable);
    assert!(report.assessment.has_signal(SignalId::FaultOnReturn));
    assert!(report.assessment.has_signal(SignalId::ReturnAddressCorrupted));
    assert!(report.assessment.has_signal(SignalId::FramePointerCorrupted));
}

#[test]
fn test_stack_smash_with_repeated_frames() {
    let layout = LAYOUT_64;
    let base = layout.stack.1 - 0x1000;
    // ret, with the saved registers overwritten by 0xff
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0)
        .instruction(&[0xc3])
        .with_standard_layout()
        .frame(layout.text.0 + 0x1234, Some(base))
        .frame(u64::MAX, Some(u64::MAX))
        .frame(u64::MAX, Some(u64::MAX))
        .finish();
    let report = triage(&snapshot);
    assert!(report.assessment.has_signal(SignalId::FaultOnReturn));
    assert!(report.assessment.has_signal(SignalId::ReturnAddressCorrupted));
    assert!(report.assessment.has_signal(SignalId::CyclicUnwind));
    assert!(!report.assessment.confidence_limited);
    assert_eq!(report.verdict(), Verdict::Exploitable);
}

#[test]
fn test_block_move_into_null_page() {
    // rep stosb
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0x10)
        .register("rdi", 0x10)
        .instruction(&[0xf3, 0xaa])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    for options in [ProcessorOptions::default(), ProcessorOptions::aggressive()] {
        let report = analyze(&snapshot, &options).unwrap();
        assert_eq!(report.fault_access, FaultAccess::Write);
        assert!(!report.assessment.has_signal(SignalId::BlockMoveFault));
        assert!(report.assessment.has_signal(SignalId::NullPointerStyle));
        assert_eq!(report.verdict(), Verdict::ProbablyNotExploitable);
    }
}

#[test]
fn test_avx_store_is_decoded() {
    // vmovdqu ymmword ptr [rdi], ymm0
    let snapshot = SynthSnapshot::new(Cpu::X86_64, CrashReason::Segv)
        .fault_address(0x1234_5678)
        .register("rdi", 0x1234_5678)
        .instruction(&[0xc5, 0xfe, 0x7f, 0x07])
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(report.fault_access, FaultAccess::Write);
    assert!(!report.assessment.has_signal(SignalId::DecodeFailed));
    assert!(report.assessment.has_signal(SignalId::WildPointerDereference));
    assert_eq!(report.verdict(), Verdict::ProbablyExploitable);
}

#[test]
fn test_arm_ignores_wide_vector_registers() {
    // ldr r0, [r1, #4]
    let snapshot = SynthSnapshot::new(Cpu::Arm, CrashReason::Segv)
        .fault_address(0x10)
        .register("r1", 0xc)
        .register("d0", 0x4000_0000_0000_0000)
        .instruction(&0xe591_0004u32.to_le_bytes())
        .with_standard_layout()
        .with_healthy_backtrace()
        .finish();
    let report = triage(&snapshot);
    assert_eq!(report.fault_access, FaultAccess::Read);
    assert!(report.assessment.has_signal(SignalId::NullPointerStyle));
    assert_eq!(report.verdict(), Verdict::ProbablyNotExploitable);
}

#[test]
fn test_disabled_signals() {
    let mut options = ProcessorOptions::default();
    options.disabled_signals.insert(SignalId::NullPointerStyle);
    let report = analyze(&null_write(), &options).unwrap();
    assert!(report.assessment.signals.is_empty());
    assert_eq!(report.verdict(), Verdict::Unknown);
}

#[test]
fn test_aggressive_preset() {
    let snapshot = wild_write();
    assert_eq!(triage(&snapshot).verdict(), Verdict::ProbablyExploitable);
    let report = analyze(&snapshot, &ProcessorOptions::aggressive()).unwrap();
    assert_eq!(report.verdict(), Verdict::Exploitable);
}

#[test]
fn test_unsupported_architecture() {
    let snapshot = SynthSnapshot::new(Cpu::Unknown(String::from("riscv64")), CrashReason::Segv)
        .fault_address(0x10)
        .pc(0x1000)
        .sp(0x2000)
        .finish();
    let error = analyze(&snapshot, &ProcessorOptions::default()).unwrap_err();
    match error {
        ProcessError::UnsupportedArchitecture {
            ref architecture,
            ref context,
        } => {
            assert_eq!(architecture, &Cpu::Unknown(String::from("riscv64")));
            assert_eq!(context.fault_address, Some(Address(0x10)));
        }
        ref other => panic!("unexpected error {other}"),
    }
    assert!(error.to_string().contains("riscv64"));
}

#[test]
fn test_malformed_snapshots() {
    let mut overlapping = wild_write();
    overlapping.memory_regions.push(triage_common::MemoryRegion::new(
        LAYOUT_64.stack.0 + 0x10,
        LAYOUT_64.stack.1 + 0x10,
        Permissions::READ_WRITE,
        RegionLabel::Anonymous,
    ));
    assert!(matches!(
        analyze(&overlapping, &ProcessorOptions::default()),
        Err(ProcessError::MalformedSnapshot {
            source: SnapshotError::OverlappingRegions { .. },
            ..
        })
    ));

    let mut missing_pc = wild_write();
    missing_pc.registers.remove("rip");
    let error = analyze(&missing_pc, &ProcessorOptions::default()).unwrap_err();
    assert!(matches!(
        error,
        ProcessError::MalformedSnapshot {
            source: SnapshotError::MissingRegister { register: "rip" },
            ..
        }
    ));
    assert!(error.to_string().contains("SIGSEGV"));

    let oversized = SynthSnapshot::new(Cpu::X86, CrashReason::Segv)
        .pc(0x1_0000_0000)
        .sp(0x1000)
        .finish();
    assert!(matches!(
        analyze(&oversized, &ProcessorOptions::default()),
        Err(ProcessError::MalformedSnapshot {
            source: SnapshotError::RegisterOutOfRange { .. },
            ..
        })
    ));
}

#[test]
fn test_deterministic() {
    for snapshot in [null_write(), hijack(), wild_write()] {
        let first = triage(&snapshot);
        let second = triage(&snapshot);
        assert_eq!(first, second);
        let mut first_json = Vec::new();
        let mut second_json = Vec::new();
        first.print_json(&mut first_json, false).unwrap();
        second.print_json(&mut second_json, false).unwrap();
        assert_eq!(first_json, second_json);
    }
}

#[test]
fn test_batch_matches_sequential() {
    let mut unsupported = wild_write();
    unsupported.architecture = Cpu::Sparc;
    let snapshots = vec![null_write(), hijack(), unsupported, wild_write()];
    let batch = analyze_batch(&snapshots, &ProcessorOptions::default());
    assert_eq!(batch.len(), snapshots.len());
    for (snapshot, result) in snapshots.iter().zip(batch) {
        assert_eq!(result, analyze(snapshot, &ProcessorOptions::default()));
    }
}

#[test]
fn test_report_output() {
    let report = triage(&hijack());

    let mut human = Vec::new();
    report.print(&mut human).unwrap();
    let human = String::from_utf8(human).unwrap();
    assert!(human.starts_with("Verdict: EXPLOITABLE\n"));
    assert!(human.contains("control-flow-hijack-suspected"));
    assert!(human.contains("Crash address: 0x4141414141"));

    let mut brief = Vec::new();
    report.print_brief(&mut brief).unwrap();
    let brief = String::from_utf8(brief).unwrap();
    assert_eq!(brief.lines().count(), 1);
    assert!(brief.starts_with("EXPLOITABLE SIGSEGV "));

    let mut json = Vec::new();
    report.print_json(&mut json, true).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(json["verdict"], "EXPLOITABLE");
    assert_eq!(json["crash_info"]["access"], "execute");
    assert_eq!(json["signals"][0]["severity"], "high");
}
