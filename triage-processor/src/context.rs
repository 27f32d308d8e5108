//! CPU contexts.
//!
//! The debugger integration hands us registers by whatever names its host uses. This module
//! maps them onto a [`CanonicalState`]: the program counter, stack pointer, optional frame
//! pointer, and the general-purpose registers indexed by their instruction encoding number, so
//! that the decoder and the heuristics never have to care which architecture they run on.

use std::collections::BTreeMap;
use std::fmt;

use triage_common::{Cpu, RegisterValue};

use crate::SnapshotError;

/// The architectures the engine can reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86,
    X86_64,
    Arm32,
    Arm64,
}

/// Per-architecture register layout.
pub struct RegisterTable {
    /// Size in bytes of a general-purpose register.
    pub word_size: u8,
    /// General-purpose register names, indexed by encoding number.
    pub gprs: &'static [&'static str],
    /// Alternative names a debugger may use, mapped to the canonical name.
    pub aliases: &'static [(&'static str, &'static str)],
    pub program_counter: &'static str,
    pub stack_pointer: &'static str,
    pub frame_pointer: Option<&'static str>,
    pub flags: Option<&'static str>,
}

static X86_REGS: RegisterTable = RegisterTable {
    word_size: 4,
    gprs: &["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"],
    aliases: &[
        ("efl", "eflags"),
        ("pc", "eip"),
        ("sp", "esp"),
        ("fp", "ebp"),
    ],
    program_counter: "eip",
    stack_pointer: "esp",
    frame_pointer: Some("ebp"),
    flags: Some("eflags"),
};

static X86_64_REGS: RegisterTable = RegisterTable {
    word_size: 8,
    gprs: &[
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ],
    aliases: &[
        ("eflags", "rflags"),
        ("efl", "rflags"),
        ("pc", "rip"),
        ("sp", "rsp"),
        ("fp", "rbp"),
    ],
    program_counter: "rip",
    stack_pointer: "rsp",
    frame_pointer: Some("rbp"),
    flags: Some("rflags"),
};

static ARM32_REGS: RegisterTable = RegisterTable {
    word_size: 4,
    gprs: &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp",
        "lr", "pc",
    ],
    aliases: &[
        ("r13", "sp"),
        ("r14", "lr"),
        ("r15", "pc"),
        ("fp", "r11"),
        ("ip", "r12"),
        ("sb", "r9"),
        ("sl", "r10"),
    ],
    program_counter: "pc",
    stack_pointer: "sp",
    frame_pointer: Some("r11"),
    flags: Some("cpsr"),
};

static ARM64_REGS: RegisterTable = RegisterTable {
    word_size: 8,
    gprs: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25",
        "x26", "x27", "x28", "x29", "x30", "sp",
    ],
    aliases: &[("fp", "x29"), ("lr", "x30"), ("x31", "sp"), ("pstate", "cpsr")],
    program_counter: "pc",
    stack_pointer: "sp",
    frame_pointer: Some("x29"),
    flags: Some("cpsr"),
};

impl Architecture {
    /// Map a CPU tag onto a supported architecture.
    pub fn from_cpu(cpu: &Cpu) -> Option<Architecture> {
        match cpu {
            Cpu::X86 => Some(Architecture::X86),
            Cpu::X86_64 => Some(Architecture::X86_64),
            Cpu::Arm => Some(Architecture::Arm32),
            Cpu::Arm64 => Some(Architecture::Arm64),
            Cpu::Ppc | Cpu::Ppc64 | Cpu::Sparc | Cpu::Mips | Cpu::Unknown(_) => None,
        }
    }

    pub fn registers(&self) -> &'static RegisterTable {
        match self {
            Architecture::X86 => &X86_REGS,
            Architecture::X86_64 => &X86_64_REGS,
            Architecture::Arm32 => &ARM32_REGS,
            Architecture::Arm64 => &ARM64_REGS,
        }
    }

    pub fn word_size(&self) -> u8 {
        self.registers().word_size
    }

    /// All-ones for the architecture's word size.
    pub fn word_mask(&self) -> u64 {
        match self.word_size() {
            8 => u64::MAX,
            n => (1u64 << (u32::from(n) * 8)) - 1,
        }
    }

    /// The canonical name of the general-purpose register with encoding number `index`.
    pub fn register_name(&self, index: u8) -> &'static str {
        self.registers()
            .gprs
            .get(usize::from(index))
            .copied()
            .unwrap_or("<invalid>")
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Arm32 => "arm32",
            Architecture::Arm64 => "arm64",
        })
    }
}

/// Errors encountered while building a [`CanonicalState`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The CPU tag doesn't name an architecture we have tables for.
    #[error("unsupported architecture `{0}`")]
    UnsupportedArchitecture(Cpu),
    #[error(transparent)]
    Malformed(#[from] SnapshotError),
}

/// An architecture-independent view of the register file at fault time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalState {
    pub architecture: Architecture,
    pub program_counter: u64,
    pub stack_pointer: u64,
    /// Not every calling convention maintains one.
    pub frame_pointer: Option<u64>,
    pub flags: Option<u64>,
    gprs: BTreeMap<u8, u64>,
}

impl CanonicalState {
    /// The value of the general-purpose register with encoding number `index`, if it was
    /// captured.
    pub fn gpr(&self, index: u8) -> Option<u64> {
        self.gprs.get(&index).copied()
    }

    /// All captured general-purpose registers, in encoding order.
    pub fn gprs(&self) -> impl Iterator<Item = (u8, &'static str, u64)> + '_ {
        let arch = self.architecture;
        self.gprs
            .iter()
            .map(move |(&idx, &val)| (idx, arch.register_name(idx), val))
    }

    /// General-purpose registers that hold data rather than the stack, frame or program
    /// counter.
    pub fn data_registers(&self) -> impl Iterator<Item = (u8, &'static str, u64)> + '_ {
        let table = self.architecture.registers();
        self.gprs().filter(move |&(_, name, _)| {
            name != table.stack_pointer
                && name != table.program_counter
                && Some(name) != table.frame_pointer
                && name != "lr"
                && name != "x30"
        })
    }
}

/// Build the canonical register view for `cpu` out of the registers a debugger reported.
///
/// Register names are matched case-insensitively, through the architecture's alias table.
/// Registers the table doesn't know (vector, segment, debug registers...) are ignored.
///
/// # Errors
///
/// [`ContextError::UnsupportedArchitecture`] if `cpu` isn't supported. A missing program
/// counter or stack pointer, or a value that doesn't fit in a register, is reported as
/// [`ContextError::Malformed`].
pub fn normalize(
    cpu: &Cpu,
    raw_registers: &BTreeMap<String, RegisterValue>,
) -> Result<CanonicalState, ContextError> {
    let architecture = Architecture::from_cpu(cpu)
        .ok_or_else(|| ContextError::UnsupportedArchitecture(cpu.clone()))?;
    let table = architecture.registers();
    let mask = architecture.word_mask();

    let mut program_counter = None;
    let mut stack_pointer = None;
    let mut frame_pointer = None;
    let mut flags = None;
    let mut gprs = BTreeMap::new();

    for (raw_name, value) in raw_registers {
        let lowered = raw_name.to_ascii_lowercase();
        let name = table
            .aliases
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map(|&(_, canonical)| canonical)
            .unwrap_or(lowered.as_str());

        let gpr = table.gprs.iter().position(|&gpr| gpr == name);
        let known = gpr.is_some()
            || name == table.program_counter
            || name == table.stack_pointer
            || Some(name) == table.frame_pointer
            || Some(name) == table.flags;
        if !known {
            tracing::trace!("context: ignoring register {} for {}", raw_name, architecture);
            continue;
        }

        let value = value.0;
        if value & !mask != 0 {
            return Err(SnapshotError::RegisterOutOfRange {
                register: raw_name.clone(),
                value: value.into(),
                word_size: table.word_size,
            }
            .into());
        }

        if let Some(idx) = gpr {
            // Tables are at most 32 entries long.
            gprs.insert(idx as u8, value);
        }
        if name == table.program_counter {
            program_counter = Some(value);
        }
        if name == table.stack_pointer {
            stack_pointer = Some(value);
        }
        if Some(name) == table.frame_pointer {
            frame_pointer = Some(value);
        }
        if Some(name) == table.flags {
            flags = Some(value);
        }
    }

    let program_counter = program_counter.ok_or(SnapshotError::MissingRegister {
        register: table.program_counter,
    })?;
    let stack_pointer = stack_pointer.ok_or(SnapshotError::MissingRegister {
        register: table.stack_pointer,
    })?;

    Ok(CanonicalState {
        architecture,
        program_counter,
        stack_pointer,
        frame_pointer,
        flags,
        gprs,
    })
}
