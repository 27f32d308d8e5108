//! Module for analyzing CPU instructions
//!
//! When triaging a crash, it is often useful to know what the faulting instruction was trying to
//! do: which memory it touched, whether it was transferring control, and how wide its access was.
//!
//! This module provides small table-driven decoders for the subset of each supported
//! architecture's instruction set that matters for that purpose:
//!
//! - x86 and x86-64: legacy prefixes, REX, ModRM/SIB addressing including RIP-relative forms,
//!   data movement, ALU, stack, control flow, string and trap instructions
//! - ARM (A32): single and multiple load/store, branches and exchange, data processing, `udf`
//! - AArch64: all load/store addressing forms, register branches, `udf` and `brk`
//!
//! Anything outside of these subsets is reported as [`OpAnalysisError::UnsupportedInstruction`],
//! which callers are expected to treat as "we don't know" rather than as evidence of anything.

#![deny(missing_docs)]

use std::fmt;

use crate::context::{Architecture, CanonicalState};

mod arm;
mod arm64;
mod x86;

/// Error type for the functions in this module
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpAnalysisError {
    /// The debugger couldn't read any memory at the program counter
    #[error("no instruction bytes were captured at the program counter")]
    NoInstructionBytes,
    /// A byte slice was too short and therefore contained a truncated instruction
    #[error("byte slice contained truncated instruction")]
    InstructionTruncated,
    /// The bytes don't encode an instruction this module understands
    #[error("unsupported or invalid instruction `{0}`")]
    UnsupportedInstruction(String),
    /// The ARM core was executing Thumb code, which isn't decoded
    #[error("thumb instructions are not decoded")]
    ThumbState,
}

impl OpAnalysisError {
    pub(crate) fn unsupported(bytes: &[u8]) -> Self {
        let shown = &bytes[..bytes.len().min(8)];
        OpAnalysisError::UnsupportedInstruction(
            shown
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }
}

/// A general-purpose register, by its encoding number.
///
/// Names are looked up through [`Architecture::register_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u8);

/// A coarse classification of what an instruction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationClass {
    /// Reads memory into a register
    Load,
    /// Writes memory (including read-modify-write of memory)
    Store,
    /// Computes on registers without touching memory (or only to compute an address)
    Arithmetic,
    /// Transfers control to an address held in a register or in memory
    ExecuteIndirect,
    /// Transfers control to an address encoded in the instruction
    ExecuteDirect,
    /// Returns to an address taken from the stack or the link register
    Return,
    /// Pushes onto the stack
    Push,
    /// Pops off the stack
    Pop,
    /// Repeatable block memory operation
    StringOp,
    /// Deliberately raises a trap
    Trap,
    /// Architecturally undefined, used to crash on purpose
    Undefined,
    /// Decoded, but none of the above
    Unknown,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationClass::Load => "load",
            OperationClass::Store => "store",
            OperationClass::Arithmetic => "arithmetic",
            OperationClass::ExecuteIndirect => "execute-indirect",
            OperationClass::ExecuteDirect => "execute-direct",
            OperationClass::Return => "return",
            OperationClass::Push => "push",
            OperationClass::Pop => "pop",
            OperationClass::StringOp => "string-op",
            OperationClass::Trap => "trap",
            OperationClass::Undefined => "undefined",
            OperationClass::Unknown => "unknown",
        })
    }
}

/// The direction of a memory access
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryAccessType {
    /// Memory is only read
    Read,
    /// Memory is only written
    Write,
    /// Memory is read, then written back
    ReadWrite,
}

impl MemoryAccessType {
    /// Whether the access writes memory
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

impl fmt::Display for MemoryAccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::ReadWrite => f.write_str("read-write"),
        }
    }
}

/// How a memory operand forms its address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addressing {
    /// `[base]`
    Indirect(Reg),
    /// `[base + index * scale + displacement]`, each part optional
    ///
    /// The scale is signed so that ARM's subtracted register offsets can be expressed.
    BaseDisplacement {
        /// The base register
        base: Option<Reg>,
        /// The index register
        index: Option<Reg>,
        /// Multiplier applied to the index register
        scale: i64,
        /// Constant added to the address
        displacement: i64,
    },
    /// A fixed address
    Absolute(u64),
    /// Relative to the address of the decoded instruction itself
    ///
    /// Decoders fold in whatever pipeline offset their architecture reads the program counter
    /// with, so this is always relative to the start of the instruction.
    PcRelative(i64),
}

impl Addressing {
    /// Compute the address this operand refers to, given the register state
    ///
    /// Arithmetic wraps at the architecture's word size. Returns `None` if a register the
    /// operand depends on wasn't captured.
    pub fn effective_address(&self, state: &CanonicalState) -> Option<u64> {
        let address = match *self {
            Addressing::Indirect(base) => state.gpr(base.0)?,
            Addressing::BaseDisplacement {
                base,
                index,
                scale,
                displacement,
            } => {
                let base = match base {
                    Some(reg) => state.gpr(reg.0)?,
                    None => 0,
                };
                let index = match index {
                    Some(reg) => state.gpr(reg.0)?.wrapping_mul(scale as u64),
                    None => 0,
                };
                base.wrapping_add(index).wrapping_add(displacement as u64)
            }
            Addressing::Absolute(address) => address,
            Addressing::PcRelative(offset) => state.program_counter.wrapping_add(offset as u64),
        };
        Some(address & state.architecture.word_mask())
    }

    /// The registers this operand reads to form its address
    pub fn registers(&self) -> Vec<Reg> {
        match *self {
            Addressing::Indirect(base) => vec![base],
            Addressing::BaseDisplacement { base, index, .. } => {
                base.into_iter().chain(index).collect()
            }
            Addressing::Absolute(_) | Addressing::PcRelative(_) => Vec::new(),
        }
    }

    fn render(&self, architecture: Architecture) -> String {
        let name = |reg: Reg| architecture.register_name(reg.0);
        let signed = |value: i64| {
            if value < 0 {
                format!(" - {:#x}", value.unsigned_abs())
            } else {
                format!(" + {value:#x}")
            }
        };
        match *self {
            Addressing::Indirect(base) => format!("[{}]", name(base)),
            Addressing::BaseDisplacement {
                base,
                index,
                scale,
                displacement,
            } => {
                let mut out = String::from("[");
                if let Some(base) = base {
                    out.push_str(name(base));
                }
                if let Some(index) = index {
                    if base.is_some() {
                        out.push_str(if scale < 0 { " - " } else { " + " });
                    } else if scale < 0 {
                        out.push('-');
                    }
                    out.push_str(name(index));
                    if scale.unsigned_abs() != 1 {
                        out.push_str(&format!("*{}", scale.unsigned_abs()));
                    }
                }
                if base.is_none() && index.is_none() {
                    out.push_str(&format!("{:#x}", displacement as u64));
                } else if displacement != 0 {
                    out.push_str(&signed(displacement));
                }
                out.push(']');
                out
            }
            Addressing::Absolute(address) => format!("[{address:#x}]"),
            Addressing::PcRelative(offset) => {
                let pc = match architecture {
                    Architecture::X86 => "eip",
                    Architecture::X86_64 => "rip",
                    Architecture::Arm32 | Architecture::Arm64 => "pc",
                };
                format!("[{pc}{}]", signed(offset))
            }
        }
    }
}

/// One memory operand of a decoded instruction, explicit or implied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    /// How the address is formed
    pub addressing: Addressing,
    /// The type of the memory access
    pub access: MemoryAccessType,
    /// The size of the memory access in bytes
    ///
    /// Note that this is optional, as some instructions (e.g. `fxsave`) don't have a simple
    /// size.
    pub size: Option<u8>,
}

/// Where a control-flow instruction takes its destination from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchTarget {
    /// An offset from the start of the instruction
    Relative(i64),
    /// The contents of a register
    Register(Reg),
    /// A pointer loaded from memory
    Memory(Addressing),
    /// The return address on the stack
    Stack,
}

impl BranchTarget {
    /// The destination address, if it can be computed from registers alone
    pub fn resolve(&self, state: &CanonicalState) -> Option<u64> {
        let mask = state.architecture.word_mask();
        match *self {
            BranchTarget::Relative(offset) => {
                Some(state.program_counter.wrapping_add(offset as u64) & mask)
            }
            BranchTarget::Register(reg) => state.gpr(reg.0),
            BranchTarget::Memory(_) | BranchTarget::Stack => None,
        }
    }
}

/// A resolved memory access performed by an instruction
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MemoryAccess {
    /// The lowest address touched
    pub address: u64,
    /// The size of the memory access
    pub size: Option<u8>,
    /// The type of the memory access
    pub access_type: MemoryAccessType,
    /// Which entry of [`DecodedInstruction::memory_operands`] this came from
    pub operand: usize,
}

impl MemoryAccess {
    /// Whether `address` falls within this access
    ///
    /// Accesses of unknown size only cover their first byte.
    pub fn covers(&self, address: u64) -> bool {
        let size = u64::from(self.size.unwrap_or(1).max(1));
        address.wrapping_sub(self.address) < size
    }
}

/// The results of decoding one instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// The architecture the instruction was decoded for
    pub architecture: Architecture,
    /// Assembler mnemonic (condition codes and size suffixes are folded away)
    pub mnemonic: &'static str,
    /// What kind of operation this is
    pub operation_class: OperationClass,
    /// Every memory access the instruction performs, including implicit stack accesses
    pub memory_operands: Vec<MemoryOperand>,
    /// For control-flow instructions, where the new program counter comes from
    pub branch_target: Option<BranchTarget>,
    /// The width of the instruction's primary memory access
    pub access_width: Option<u8>,
    /// Length of the encoding in bytes
    pub length: u8,
}

impl DecodedInstruction {
    pub(crate) fn new(
        architecture: Architecture,
        mnemonic: &'static str,
        operation_class: OperationClass,
        length: u8,
    ) -> Self {
        DecodedInstruction {
            architecture,
            mnemonic,
            operation_class,
            memory_operands: Vec::new(),
            branch_target: None,
            access_width: None,
            length,
        }
    }

    pub(crate) fn with_operand(
        mut self,
        addressing: Addressing,
        access: MemoryAccessType,
        size: Option<u8>,
    ) -> Self {
        if self.access_width.is_none() {
            self.access_width = size;
        }
        self.memory_operands.push(MemoryOperand {
            addressing,
            access,
            size,
        });
        self
    }

    pub(crate) fn with_branch(mut self, target: BranchTarget) -> Self {
        self.branch_target = Some(target);
        self
    }

    /// Determine the addresses touched by this instruction, given the register state
    ///
    /// Operands whose registers weren't captured are left out.
    pub fn memory_accesses(&self, state: &CanonicalState) -> Vec<MemoryAccess> {
        self.memory_operands
            .iter()
            .enumerate()
            .filter_map(|(operand, op)| {
                Some(MemoryAccess {
                    address: op.addressing.effective_address(state)?,
                    size: op.size,
                    access_type: op.access,
                    operand,
                })
            })
            .collect()
    }

    /// Whether the instruction transfers control
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self.operation_class,
            OperationClass::ExecuteDirect | OperationClass::ExecuteIndirect | OperationClass::Return
        )
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic)?;
        let mut first = true;
        let mut separator = |f: &mut fmt::Formatter<'_>| {
            let sep = if first { " " } else { ", " };
            first = false;
            f.write_str(sep)
        };
        match self.branch_target {
            Some(BranchTarget::Register(reg)) => {
                separator(f)?;
                f.write_str(self.architecture.register_name(reg.0))?;
            }
            Some(BranchTarget::Relative(offset)) => {
                separator(f)?;
                if offset < 0 {
                    write!(f, "pc - {:#x}", offset.unsigned_abs())?;
                } else {
                    write!(f, "pc + {offset:#x}")?;
                }
            }
            _ => {}
        }
        for op in &self.memory_operands {
            separator(f)?;
            f.write_str(&op.addressing.render(self.architecture))?;
        }
        if let Some(width) = self.access_width {
            let unit = if width == 1 { "byte" } else { "bytes" };
            write!(f, " ({width} {unit})")?;
        }
        Ok(())
    }
}

/// Decode the instruction at the start of `bytes`
///
/// # Errors
///
/// Will return an error if `bytes` is empty or truncated, or if it doesn't start with an
/// instruction this module understands.
pub fn decode(
    architecture: Architecture,
    bytes: &[u8],
) -> Result<DecodedInstruction, OpAnalysisError> {
    if bytes.is_empty() {
        return Err(OpAnalysisError::NoInstructionBytes);
    }
    match architecture {
        Architecture::X86 => x86::decode(bytes, false),
        Architecture::X86_64 => x86::decode(bytes, true),
        Architecture::Arm32 => arm::decode(bytes),
        Architecture::Arm64 => arm64::decode(bytes),
    }
}

/// Read a little-endian 32-bit instruction word, as used by both ARM decoders.
fn read_word(bytes: &[u8]) -> Result<u32, OpAnalysisError> {
    match bytes.get(..4) {
        Some(&[a, b, c, d]) => Ok(u32::from_le_bytes([a, b, c, d])),
        _ => Err(OpAnalysisError::InstructionTruncated),
    }
}

/// Sign-extend the low `bits` bits of `value`.
fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    (i64::from(value) << shift) >> shift
}
