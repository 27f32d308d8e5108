// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic Crash Snapshots for Testing
//!
//! Basic usage is to create a [SynthSnapshot][], use its methods to describe the crash, and then
//! `finish()` to get the [`CrashSnapshot`]. Then you can either feed it directly to the
//! triage-processor crate, or use `finish_json()` and write it to disk as the debugger
//! integration would.
//!
//! [`with_standard_layout`](SynthSnapshot::with_standard_layout) maps a typical Linux process
//! (see [`Layout`]) so that tests only have to describe what's unusual about their crash.

use std::collections::BTreeMap;

use triage_common::{
    Address, Cpu, CrashReason, CrashSnapshot, Frame, MemoryRegion, Permissions, RegionLabel,
};

/// Where [`SynthSnapshot::with_standard_layout`] puts things.
///
/// Every range is `(start, end)` with an exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// The main executable's code, `r-x`
    pub text: (u64, u64),
    /// The main executable's read-only data, `r--`
    pub rodata: (u64, u64),
    /// The main executable's writable data, `rw-`
    pub data: (u64, u64),
    pub heap: (u64, u64),
    /// The C library's code, `r-x`
    pub libc: (u64, u64),
    /// The main thread's stack. Nothing is mapped in the 64KiB below it.
    pub stack: (u64, u64),
}

/// The standard layout of a 64-bit process.
pub const LAYOUT_64: Layout = Layout {
    text: (0x5555_5555_4000, 0x5555_5557_8000),
    rodata: (0x5555_5557_8000, 0x5555_5558_0000),
    data: (0x5555_5558_0000, 0x5555_5558_2000),
    heap: (0x5555_5559_0000, 0x5555_555b_1000),
    libc: (0x7fff_f7d8_0000, 0x7fff_f7f1_5000),
    stack: (0x7fff_fffd_e000, 0x7fff_ffff_f000),
};

/// The standard layout of a 32-bit process.
pub const LAYOUT_32: Layout = Layout {
    text: (0x0804_8000, 0x080a_0000),
    rodata: (0x080a_0000, 0x080b_0000),
    data: (0x080b_0000, 0x080b_2000),
    heap: (0x0900_0000, 0x0902_1000),
    libc: (0xf7d0_0000, 0xf7e9_0000),
    stack: (0xfffd_d000, 0xffff_e000),
};

impl Layout {
    /// The layout [`SynthSnapshot::with_standard_layout`] uses for `cpu`.
    pub fn for_cpu(cpu: &Cpu) -> Layout {
        match cpu {
            Cpu::X86 | Cpu::Arm | Cpu::Ppc | Cpu::Sparc | Cpu::Mips => LAYOUT_32,
            _ => LAYOUT_64,
        }
    }
}

/// The register names the debugger would use for the program counter and stack pointer.
fn pc_and_sp(cpu: &Cpu) -> (&'static str, &'static str) {
    match cpu {
        Cpu::X86 => ("eip", "esp"),
        Cpu::X86_64 => ("rip", "rsp"),
        _ => ("pc", "sp"),
    }
}

/// A builder of synthetic crash snapshots.
#[derive(Debug, Clone)]
pub struct SynthSnapshot {
    snapshot: CrashSnapshot,
}

impl SynthSnapshot {
    /// Create a snapshot of a `reason` crash on `cpu`, with no registers, memory or backtrace.
    pub fn new(cpu: Cpu, reason: CrashReason) -> SynthSnapshot {
        SynthSnapshot {
            snapshot: CrashSnapshot {
                architecture: cpu,
                crash_reason: reason,
                fault_address: None,
                registers: BTreeMap::new(),
                instruction_bytes: Vec::new(),
                memory_regions: Vec::new(),
                backtrace: Vec::new(),
            },
        }
    }

    pub fn fault_address(mut self, address: u64) -> SynthSnapshot {
        self.snapshot.fault_address = Some(Address(address));
        self
    }

    /// Set a register, by whatever name the debugger would use for it.
    pub fn register(mut self, name: &str, value: u64) -> SynthSnapshot {
        self.snapshot
            .registers
            .insert(String::from(name), Address(value));
        self
    }

    /// Set the program counter.
    pub fn pc(self, value: u64) -> SynthSnapshot {
        let (pc, _) = pc_and_sp(&self.snapshot.architecture);
        self.register(pc, value)
    }

    /// Set the stack pointer.
    pub fn sp(self, value: u64) -> SynthSnapshot {
        let (_, sp) = pc_and_sp(&self.snapshot.architecture);
        self.register(sp, value)
    }

    /// Set the bytes captured at the program counter.
    pub fn instruction(mut self, bytes: &[u8]) -> SynthSnapshot {
        self.snapshot.instruction_bytes = bytes.to_vec();
        self
    }

    /// Map `start..end`. Regions may be added in any order.
    pub fn region(
        mut self,
        start: u64,
        end: u64,
        permissions: Permissions,
        label: RegionLabel,
    ) -> SynthSnapshot {
        self.snapshot
            .memory_regions
            .push(MemoryRegion::new(start, end, permissions, label));
        self
    }

    /// Map `start..end`, backed by the file `name`.
    pub fn named_region(
        mut self,
        start: u64,
        end: u64,
        permissions: Permissions,
        label: RegionLabel,
        name: &str,
    ) -> SynthSnapshot {
        let mut region = MemoryRegion::new(start, end, permissions, label);
        region.name = Some(String::from(name));
        self.snapshot.memory_regions.push(region);
        self
    }

    /// Append a frame to the backtrace. The first frame added is the crashing frame.
    pub fn frame(mut self, return_address: u64, frame_base: Option<u64>) -> SynthSnapshot {
        self.snapshot
            .backtrace
            .push(Frame::new(return_address, frame_base));
        self
    }

    /// Append a frame the debugger managed to symbolize.
    pub fn symbolized_frame(
        mut self,
        return_address: u64,
        frame_base: Option<u64>,
        function: &str,
    ) -> SynthSnapshot {
        let mut frame = Frame::new(return_address, frame_base);
        frame.function = Some(String::from(function));
        self.snapshot.backtrace.push(frame);
        self
    }

    /// Map the standard [`Layout`] for this snapshot's CPU, and point the program counter and
    /// stack pointer into it unless they've already been set.
    pub fn with_standard_layout(self) -> SynthSnapshot {
        let layout = Layout::for_cpu(&self.snapshot.architecture);
        let (pc, sp) = pc_and_sp(&self.snapshot.architecture);
        let has_pc = self.snapshot.registers.contains_key(pc);
        let has_sp = self.snapshot.registers.contains_key(sp);

        let mut synth = self
            .named_region(
                layout.text.0,
                layout.text.1,
                Permissions::READ_EXECUTE,
                RegionLabel::Module,
                "/usr/bin/target",
            )
            .named_region(
                layout.rodata.0,
                layout.rodata.1,
                Permissions::READ_ONLY,
                RegionLabel::Module,
                "/usr/bin/target",
            )
            .named_region(
                layout.data.0,
                layout.data.1,
                Permissions::READ_WRITE,
                RegionLabel::Module,
                "/usr/bin/target",
            )
            .region(layout.heap.0, layout.heap.1, Permissions::READ_WRITE, RegionLabel::Heap)
            .named_region(
                layout.libc.0,
                layout.libc.1,
                Permissions::READ_EXECUTE,
                RegionLabel::Module,
                "/usr/lib/libc.so.6",
            )
            .region(layout.stack.0, layout.stack.1, Permissions::READ_WRITE, RegionLabel::Stack);
        if !has_pc {
            synth = synth.pc(layout.text.0 + 0x1234);
        }
        if !has_sp {
            synth = synth.sp(layout.stack.1 - 0x1000);
        }
        synth
    }

    /// Append a plausible three-frame backtrace through the standard layout.
    pub fn with_healthy_backtrace(self) -> SynthSnapshot {
        let layout = Layout::for_cpu(&self.snapshot.architecture);
        let base = layout.stack.1 - 0x1000;
        self.symbolized_frame(layout.text.0 + 0x1234, Some(base), "crash")
            .symbolized_frame(layout.text.0 + 0x2345, Some(base + 0x40), "main")
            .symbolized_frame(layout.libc.0 + 0x2_9d90, Some(base + 0x100), "__libc_start_main")
    }

    /// Finish building and return the snapshot, with its regions sorted by start address.
    pub fn finish(mut self) -> CrashSnapshot {
        self.snapshot
            .memory_regions
            .sort_by_key(|region| region.start);
        self.snapshot
    }

    /// Finish building and return the snapshot as the debugger integration would write it.
    pub fn finish_json(self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.finish())
    }
}
