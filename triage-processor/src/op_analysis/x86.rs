//! Analysis tools for the x86 and x86-64 architectures
//!
//! Decoding is driven by [`OPCODES`]: the first entry matching the opcode map, opcode byte,
//! ModRM extension and CPU mode describes the instruction's operands and memory behavior.

use super::{
    Addressing, BranchTarget, DecodedInstruction, MemoryAccessType, OpAnalysisError,
    OperationClass, Reg,
};
use crate::context::Architecture;

const MAX_INSTRUCTION_LENGTH: usize = 15;

const XSP: Reg = Reg(4);
const XBP: Reg = Reg(5);
const XSI: Reg = Reg(6);
const XDI: Reg = Reg(7);

const ALU: [&str; 8] = ["add", "or", "adc", "sbb", "and", "sub", "xor", "cmp"];
const SHIFTS: [&str; 8] = ["rol", "ror", "rcl", "rcr", "shl", "shr", "sal", "sar"];

const MOVS: [(Reg, MemoryAccessType); 2] =
    [(XSI, MemoryAccessType::Read), (XDI, MemoryAccessType::Write)];
const CMPS: [(Reg, MemoryAccessType); 2] =
    [(XSI, MemoryAccessType::Read), (XDI, MemoryAccessType::Read)];
const STOS: [(Reg, MemoryAccessType); 1] = [(XDI, MemoryAccessType::Write)];
const LODS: [(Reg, MemoryAccessType); 1] = [(XSI, MemoryAccessType::Read)];
const SCAS: [(Reg, MemoryAccessType); 1] = [(XDI, MemoryAccessType::Read)];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Map {
    Primary,
    Escape0F,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Modes {
    Both,
    /// 32-bit protected mode only
    Legacy,
    /// 64-bit mode only
    Long,
}

#[derive(Clone, Copy)]
enum Name {
    Fixed(&'static str),
    /// ALU operation selected by opcode bits 5:3
    AluOpcode,
    /// Selected by the ModRM reg field
    Group(&'static [&'static str; 8]),
}

/// What the instruction does with its ModRM or moffs memory operand.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Read,
    Write,
    ReadWrite,
    /// ALU destination, read-modify-write except for `cmp`
    AluDest,
    /// The address is computed but never dereferenced (`lea`, multi-byte `nop`)
    AddressOnly,
    /// Memory holds the branch destination
    Branch,
}

#[derive(Clone, Copy)]
enum Form {
    Bare,
    /// Register encoded in the low three opcode bits
    OpcodeReg,
    ModRm(Role),
    /// Absolute memory offset follows the opcode
    Moffs(Role),
    Strings(&'static [(Reg, MemoryAccessType)]),
}

#[derive(Clone, Copy)]
enum Imm {
    None,
    Byte,
    Word,
    /// 16 or 32 bits depending on operand size
    Operand,
    /// Like `Operand`, but 64 bits under REX.W
    Full,
    Rel8,
    Rel32,
}

#[derive(Clone, Copy)]
enum Width {
    None,
    Byte,
    Fixed(u8),
    Operand,
    Stack,
    Vector,
}

/// Stack accesses the instruction performs without naming them.
#[derive(Clone, Copy)]
enum Implicit {
    None,
    Push,
    Pop,
    Call,
    Return,
    Leave,
}

struct Opcode {
    map: Map,
    value: u8,
    mask: u8,
    extension: Option<u8>,
    modes: Modes,
    name: Name,
    class: OperationClass,
    form: Form,
    imm: Imm,
    width: Width,
    implicit: Implicit,
}

impl Opcode {
    const fn new(map: Map, value: u8, name: &'static str, class: OperationClass, form: Form) -> Self {
        Opcode {
            map,
            value,
            mask: 0xff,
            extension: None,
            modes: Modes::Both,
            name: Name::Fixed(name),
            class,
            form,
            imm: Imm::None,
            width: Width::Operand,
            implicit: Implicit::None,
        }
    }

    const fn mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    const fn ext(mut self, extension: u8) -> Self {
        self.extension = Some(extension);
        self
    }

    const fn named(mut self, name: Name) -> Self {
        self.name = name;
        self
    }

    const fn imm(mut self, imm: Imm) -> Self {
        self.imm = imm;
        self
    }

    const fn width(mut self, width: Width) -> Self {
        self.width = width;
        self
    }

    const fn implicit(mut self, implicit: Implicit) -> Self {
        self.implicit = implicit;
        self
    }

    const fn legacy(mut self) -> Self {
        self.modes = Modes::Legacy;
        self
    }

    const fn long(mut self) -> Self {
        self.modes = Modes::Long;
        self
    }

    fn matches(&self, map: Map, opcode: u8, modrm: Option<u8>, long_mode: bool) -> bool {
        let mode_ok = match self.modes {
            Modes::Both => true,
            Modes::Legacy => !long_mode,
            Modes::Long => long_mode,
        };
        // A missing ModRM byte matches here and is reported as truncation when it's read.
        let ext_ok = match (self.extension, modrm) {
            (Some(ext), Some(modrm)) => (modrm >> 3) & 7 == ext,
            _ => true,
        };
        self.map == map && opcode & self.mask == self.value && mode_ok && ext_ok
    }
}

const fn p(value: u8, name: &'static str, class: OperationClass, form: Form) -> Opcode {
    Opcode::new(Map::Primary, value, name, class, form)
}

const fn e(value: u8, name: &'static str, class: OperationClass, form: Form) -> Opcode {
    Opcode::new(Map::Escape0F, value, name, class, form)
}

use Form::{Bare, Moffs, OpcodeReg, Strings};
use OperationClass::*;

#[rustfmt::skip]
static OPCODES: &[Opcode] = &[
    // add/or/adc/sbb/and/sub/xor/cmp in all their register and memory forms
    p(0x00, "alu", Arithmetic, Form::ModRm(Role::AluDest)).mask(0xc7).named(Name::AluOpcode).width(Width::Byte),
    p(0x01, "alu", Arithmetic, Form::ModRm(Role::AluDest)).mask(0xc7).named(Name::AluOpcode),
    p(0x02, "alu", Arithmetic, Form::ModRm(Role::Read)).mask(0xc7).named(Name::AluOpcode).width(Width::Byte),
    p(0x03, "alu", Arithmetic, Form::ModRm(Role::Read)).mask(0xc7).named(Name::AluOpcode),
    p(0x04, "alu", Arithmetic, Bare).mask(0xc7).named(Name::AluOpcode).imm(Imm::Byte).width(Width::None),
    p(0x05, "alu", Arithmetic, Bare).mask(0xc7).named(Name::AluOpcode).imm(Imm::Operand).width(Width::None),
    p(0x40, "inc", Arithmetic, OpcodeReg).mask(0xf8).legacy().width(Width::None),
    p(0x48, "dec", Arithmetic, OpcodeReg).mask(0xf8).legacy().width(Width::None),
    p(0x50, "push", Push, OpcodeReg).mask(0xf8).width(Width::Stack).implicit(Implicit::Push),
    p(0x58, "pop", Pop, OpcodeReg).mask(0xf8).width(Width::Stack).implicit(Implicit::Pop),
    p(0x63, "movsxd", Load, Form::ModRm(Role::Read)).long().width(Width::Fixed(4)),
    p(0x68, "push", Push, Bare).imm(Imm::Operand).width(Width::Stack).implicit(Implicit::Push),
    p(0x69, "imul", Arithmetic, Form::ModRm(Role::Read)).imm(Imm::Operand),
    p(0x6a, "push", Push, Bare).imm(Imm::Byte).width(Width::Stack).implicit(Implicit::Push),
    p(0x6b, "imul", Arithmetic, Form::ModRm(Role::Read)).imm(Imm::Byte),
    p(0x70, "jcc", ExecuteDirect, Bare).mask(0xf0).imm(Imm::Rel8).width(Width::None),
    p(0x80, "alu", Arithmetic, Form::ModRm(Role::AluDest)).named(Name::Group(&ALU)).imm(Imm::Byte).width(Width::Byte),
    p(0x81, "alu", Arithmetic, Form::ModRm(Role::AluDest)).named(Name::Group(&ALU)).imm(Imm::Operand),
    p(0x83, "alu", Arithmetic, Form::ModRm(Role::AluDest)).named(Name::Group(&ALU)).imm(Imm::Byte),
    p(0x84, "test", Arithmetic, Form::ModRm(Role::Read)).width(Width::Byte),
    p(0x85, "test", Arithmetic, Form::ModRm(Role::Read)),
    p(0x86, "xchg", Store, Form::ModRm(Role::ReadWrite)).width(Width::Byte),
    p(0x87, "xchg", Store, Form::ModRm(Role::ReadWrite)),
    p(0x88, "mov", Store, Form::ModRm(Role::Write)).width(Width::Byte),
    p(0x89, "mov", Store, Form::ModRm(Role::Write)),
    p(0x8a, "mov", Load, Form::ModRm(Role::Read)).width(Width::Byte),
    p(0x8b, "mov", Load, Form::ModRm(Role::Read)),
    p(0x8d, "lea", Arithmetic, Form::ModRm(Role::AddressOnly)).width(Width::None),
    p(0x8f, "pop", Pop, Form::ModRm(Role::Write)).ext(0).width(Width::Stack).implicit(Implicit::Pop),
    p(0x90, "nop", Unknown, Bare).width(Width::None),
    p(0x90, "xchg", Arithmetic, OpcodeReg).mask(0xf8).width(Width::None),
    p(0x98, "cwde", Arithmetic, Bare).width(Width::None),
    p(0x99, "cdq", Arithmetic, Bare).width(Width::None),
    p(0xa0, "mov", Load, Moffs(Role::Read)).width(Width::Byte),
    p(0xa1, "mov", Load, Moffs(Role::Read)),
    p(0xa2, "mov", Store, Moffs(Role::Write)).width(Width::Byte),
    p(0xa3, "mov", Store, Moffs(Role::Write)),
    p(0xa4, "movs", StringOp, Strings(&MOVS)).width(Width::Byte),
    p(0xa5, "movs", StringOp, Strings(&MOVS)),
    p(0xa6, "cmps", StringOp, Strings(&CMPS)).width(Width::Byte),
    p(0xa7, "cmps", StringOp, Strings(&CMPS)),
    p(0xa8, "test", Arithmetic, Bare).imm(Imm::Byte).width(Width::None),
    p(0xa9, "test", Arithmetic, Bare).imm(Imm::Operand).width(Width::None),
    p(0xaa, "stos", StringOp, Strings(&STOS)).width(Width::Byte),
    p(0xab, "stos", StringOp, Strings(&STOS)),
    p(0xac, "lods", StringOp, Strings(&LODS)).width(Width::Byte),
    p(0xad, "lods", StringOp, Strings(&LODS)),
    p(0xae, "scas", StringOp, Strings(&SCAS)).width(Width::Byte),
    p(0xaf, "scas", StringOp, Strings(&SCAS)),
    p(0xb0, "mov", Arithmetic, OpcodeReg).mask(0xf8).imm(Imm::Byte).width(Width::None),
    p(0xb8, "mov", Arithmetic, OpcodeReg).mask(0xf8).imm(Imm::Full).width(Width::None),
    p(0xc0, "shift", Arithmetic, Form::ModRm(Role::ReadWrite)).named(Name::Group(&SHIFTS)).imm(Imm::Byte).width(Width::Byte),
    p(0xc1, "shift", Arithmetic, Form::ModRm(Role::ReadWrite)).named(Name::Group(&SHIFTS)).imm(Imm::Byte),
    p(0xc2, "ret", Return, Bare).imm(Imm::Word).width(Width::Stack).implicit(Implicit::Return),
    p(0xc3, "ret", Return, Bare).width(Width::Stack).implicit(Implicit::Return),
    p(0xc6, "mov", Store, Form::ModRm(Role::Write)).ext(0).imm(Imm::Byte).width(Width::Byte),
    p(0xc7, "mov", Store, Form::ModRm(Role::Write)).ext(0).imm(Imm::Operand),
    p(0xc9, "leave", Pop, Bare).width(Width::Stack).implicit(Implicit::Leave),
    p(0xca, "retf", Return, Bare).imm(Imm::Word).width(Width::Stack).implicit(Implicit::Return),
    p(0xcb, "retf", Return, Bare).width(Width::Stack).implicit(Implicit::Return),
    p(0xcc, "int3", Trap, Bare).width(Width::None),
    p(0xcd, "int", Trap, Bare).imm(Imm::Byte).width(Width::None),
    p(0xd0, "shift", Arithmetic, Form::ModRm(Role::ReadWrite)).named(Name::Group(&SHIFTS)).width(Width::Byte),
    p(0xd1, "shift", Arithmetic, Form::ModRm(Role::ReadWrite)).named(Name::Group(&SHIFTS)),
    p(0xd2, "shift", Arithmetic, Form::ModRm(Role::ReadWrite)).named(Name::Group(&SHIFTS)).width(Width::Byte),
    p(0xd3, "shift", Arithmetic, Form::ModRm(Role::ReadWrite)).named(Name::Group(&SHIFTS)),
    p(0xe8, "call", ExecuteDirect, Bare).imm(Imm::Rel32).width(Width::Stack).implicit(Implicit::Call),
    p(0xe9, "jmp", ExecuteDirect, Bare).imm(Imm::Rel32).width(Width::None),
    p(0xeb, "jmp", ExecuteDirect, Bare).imm(Imm::Rel8).width(Width::None),
    p(0xf4, "hlt", Unknown, Bare).width(Width::None),
    p(0xf6, "test", Arithmetic, Form::ModRm(Role::Read)).ext(0).imm(Imm::Byte).width(Width::Byte),
    p(0xf6, "test", Arithmetic, Form::ModRm(Role::Read)).ext(1).imm(Imm::Byte).width(Width::Byte),
    p(0xf6, "not", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(2).width(Width::Byte),
    p(0xf6, "neg", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(3).width(Width::Byte),
    p(0xf6, "mul", Arithmetic, Form::ModRm(Role::Read)).ext(4).width(Width::Byte),
    p(0xf6, "imul", Arithmetic, Form::ModRm(Role::Read)).ext(5).width(Width::Byte),
    p(0xf6, "div", Arithmetic, Form::ModRm(Role::Read)).ext(6).width(Width::Byte),
    p(0xf6, "idiv", Arithmetic, Form::ModRm(Role::Read)).ext(7).width(Width::Byte),
    p(0xf7, "test", Arithmetic, Form::ModRm(Role::Read)).ext(0).imm(Imm::Operand),
    p(0xf7, "test", Arithmetic, Form::ModRm(Role::Read)).ext(1).imm(Imm::Operand),
    p(0xf7, "not", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(2),
    p(0xf7, "neg", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(3),
    p(0xf7, "mul", Arithmetic, Form::ModRm(Role::Read)).ext(4),
    p(0xf7, "imul", Arithmetic, Form::ModRm(Role::Read)).ext(5),
    p(0xf7, "div", Arithmetic, Form::ModRm(Role::Read)).ext(6),
    p(0xf7, "idiv", Arithmetic, Form::ModRm(Role::Read)).ext(7),
    p(0xfe, "inc", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(0).width(Width::Byte),
    p(0xfe, "dec", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(1).width(Width::Byte),
    p(0xff, "inc", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(0),
    p(0xff, "dec", Arithmetic, Form::ModRm(Role::ReadWrite)).ext(1),
    p(0xff, "call", ExecuteIndirect, Form::ModRm(Role::Branch)).ext(2).width(Width::Stack).implicit(Implicit::Call),
    p(0xff, "jmp", ExecuteIndirect, Form::ModRm(Role::Branch)).ext(4).width(Width::Stack),
    p(0xff, "push", Push, Form::ModRm(Role::Read)).ext(6).width(Width::Stack).implicit(Implicit::Push),
    e(0x05, "syscall", Unknown, Bare).long().width(Width::None),
    e(0x0b, "ud2", Undefined, Bare).width(Width::None),
    e(0x10, "movups", Load, Form::ModRm(Role::Read)).width(Width::Vector),
    e(0x11, "movups", Store, Form::ModRm(Role::Write)).width(Width::Vector),
    e(0x1f, "nop", Unknown, Form::ModRm(Role::AddressOnly)).width(Width::None),
    e(0x28, "movaps", Load, Form::ModRm(Role::Read)).width(Width::Vector),
    e(0x29, "movaps", Store, Form::ModRm(Role::Write)).width(Width::Vector),
    e(0x40, "cmov", Load, Form::ModRm(Role::Read)).mask(0xf0),
    e(0x6f, "movdq", Load, Form::ModRm(Role::Read)).width(Width::Vector),
    e(0x7f, "movdq", Store, Form::ModRm(Role::Write)).width(Width::Vector),
    e(0x80, "jcc", ExecuteDirect, Bare).mask(0xf0).imm(Imm::Rel32).width(Width::None),
    e(0x90, "setcc", Store, Form::ModRm(Role::Write)).mask(0xf0).width(Width::Byte),
    e(0xa2, "cpuid", Unknown, Bare).width(Width::None),
    e(0xaf, "imul", Arithmetic, Form::ModRm(Role::Read)),
    e(0xb0, "cmpxchg", Store, Form::ModRm(Role::ReadWrite)).width(Width::Byte),
    e(0xb1, "cmpxchg", Store, Form::ModRm(Role::ReadWrite)),
    e(0xb6, "movzx", Load, Form::ModRm(Role::Read)).width(Width::Byte),
    e(0xb7, "movzx", Load, Form::ModRm(Role::Read)).width(Width::Fixed(2)),
    e(0xbe, "movsx", Load, Form::ModRm(Role::Read)).width(Width::Byte),
    e(0xbf, "movsx", Load, Form::ModRm(Role::Read)).width(Width::Fixed(2)),
    e(0xc0, "xadd", Store, Form::ModRm(Role::ReadWrite)).width(Width::Byte),
    e(0xc1, "xadd", Store, Form::ModRm(Role::ReadWrite)),
];

/// Opcodes reachable through a VEX prefix, all in the `0f` map.
#[rustfmt::skip]
static VEX_OPCODES: &[Opcode] = &[
    e(0x10, "vmovups", Load, Form::ModRm(Role::Read)).width(Width::Vector),
    e(0x11, "vmovups", Store, Form::ModRm(Role::Write)).width(Width::Vector),
    e(0x28, "vmovaps", Load, Form::ModRm(Role::Read)).width(Width::Vector),
    e(0x29, "vmovaps", Store, Form::ModRm(Role::Write)).width(Width::Vector),
    e(0x6f, "vmovdq", Load, Form::ModRm(Role::Read)).width(Width::Vector),
    e(0x7f, "vmovdq", Store, Form::ModRm(Role::Write)).width(Width::Vector),
];

#[derive(Default)]
struct Prefixes {
    operand_size: bool,
    address_size: bool,
    rep: bool,
    repne: bool,
}

#[derive(Default, Clone, Copy)]
struct Rex {
    w: bool,
    r: u8,
    x: u8,
    b: u8,
}

impl Rex {
    fn from_byte(byte: u8) -> Self {
        Rex {
            w: byte & 0x8 != 0,
            r: (byte >> 2) & 1,
            x: (byte >> 1) & 1,
            b: byte & 1,
        }
    }
}

/// The parts of a VEX prefix that matter for memory operands.
struct Vex {
    rex: Rex,
    /// VEX.L, 256-bit vectors
    wide: bool,
}

/// Decode a two or three byte VEX prefix, setting the legacy prefixes its `pp` field implies.
fn decode_vex(
    cursor: &mut Cursor<'_>,
    prefixes: &mut Prefixes,
    long_mode: bool,
) -> Result<Vex, OpAnalysisError> {
    // The prefix bytes are stored inverted.
    let (r, x, b, w, last) = if cursor.next()? == 0xc5 {
        let byte = cursor.next()?;
        (!byte >> 7 & 1, 0, 0, false, byte)
    } else {
        let first = cursor.next()?;
        if first & 0x1f != 1 {
            return Err(OpAnalysisError::unsupported(cursor.bytes));
        }
        let second = cursor.next()?;
        (
            !first >> 7 & 1,
            !first >> 6 & 1,
            !first >> 5 & 1,
            second & 0x80 != 0,
            second,
        )
    };
    match last & 3 {
        1 => prefixes.operand_size = true,
        2 => prefixes.rep = true,
        3 => prefixes.repne = true,
        _ => {}
    }
    let rex = if long_mode {
        Rex { w, r, x, b }
    } else {
        Rex::default()
    };
    Ok(Vex {
        rex,
        wide: last & 0x4 != 0,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, OpAnalysisError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(OpAnalysisError::InstructionTruncated)
    }

    fn next(&mut self) -> Result<u8, OpAnalysisError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a little-endian, sign-extended immediate of `size` bytes.
    fn read_signed(&mut self, size: usize) -> Result<i64, OpAnalysisError> {
        let raw = self
            .bytes
            .get(self.pos..self.pos + size)
            .ok_or(OpAnalysisError::InstructionTruncated)?;
        self.pos += size;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(raw);
        let value = i64::from_le_bytes(buf);
        Ok(match size {
            0 => 0,
            1 => i64::from(value as i8),
            2 => i64::from(value as i16),
            4 => i64::from(value as i32),
            _ => value,
        })
    }
}

enum Rm {
    Register(Reg),
    Memory(Addressing),
}

struct ModRm {
    /// The raw reg field, without REX.R
    reg: u8,
    rm: Rm,
}

fn decode_modrm(
    cursor: &mut Cursor<'_>,
    rex: Rex,
    long_mode: bool,
) -> Result<ModRm, OpAnalysisError> {
    let byte = cursor.next()?;
    let mode = byte >> 6;
    let reg = (byte >> 3) & 7;
    let rm = byte & 7;

    if mode == 3 {
        return Ok(ModRm {
            reg,
            rm: Rm::Register(Reg(rm | (rex.b << 3))),
        });
    }

    if rm == 5 && mode == 0 {
        let displacement = cursor.read_signed(4)?;
        let addressing = if long_mode {
            // Fixed up to be relative to the instruction start once its length is known.
            Addressing::PcRelative(displacement)
        } else {
            Addressing::Absolute(u64::from(displacement as u32))
        };
        return Ok(ModRm {
            reg,
            rm: Rm::Memory(addressing),
        });
    }

    let (base, index, scale) = if rm == 4 {
        let sib = cursor.next()?;
        let index = ((sib >> 3) & 7) | (rex.x << 3);
        let base = sib & 7;
        (
            if base == 5 && mode == 0 {
                None
            } else {
                Some(Reg(base | (rex.b << 3)))
            },
            // rsp can't be an index; r12 can.
            if index == 4 { None } else { Some(Reg(index)) },
            1i64 << (sib >> 6),
        )
    } else {
        (Some(Reg(rm | (rex.b << 3))), None, 1)
    };

    let displacement = match mode {
        0 if base.is_none() => cursor.read_signed(4)?,
        0 => 0,
        1 => cursor.read_signed(1)?,
        _ => cursor.read_signed(4)?,
    };

    let addressing = match (base, index, displacement) {
        (Some(base), None, 0) => Addressing::Indirect(base),
        _ => Addressing::BaseDisplacement {
            base,
            index,
            scale,
            displacement,
        },
    };
    Ok(ModRm {
        reg,
        rm: Rm::Memory(addressing),
    })
}

/// Decode a single x86 instruction, in 64-bit mode if `long_mode` is set
pub(super) fn decode(
    bytes: &[u8],
    long_mode: bool,
) -> Result<DecodedInstruction, OpAnalysisError> {
    let architecture = if long_mode {
        Architecture::X86_64
    } else {
        Architecture::X86
    };
    let mut cursor = Cursor { bytes, pos: 0 };

    let mut prefixes = Prefixes::default();
    loop {
        match cursor.peek()? {
            0x66 => prefixes.operand_size = true,
            0x67 => prefixes.address_size = true,
            0xf2 => prefixes.repne = true,
            0xf3 => prefixes.rep = true,
            // lock and segment overrides don't change what we report
            0xf0 | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 => {}
            _ => break,
        }
        cursor.pos += 1;
        if cursor.pos >= MAX_INSTRUCTION_LENGTH {
            return Err(OpAnalysisError::unsupported(bytes));
        }
    }
    if prefixes.address_size && !long_mode {
        // 16-bit addressing
        return Err(OpAnalysisError::unsupported(bytes));
    }

    // Outside of long mode c4 and c5 are `les` and `lds` unless a register form follows.
    let vex = match cursor.peek()? {
        0xc4 | 0xc5
            if long_mode || cursor.bytes.get(cursor.pos + 1).map_or(false, |b| b >> 6 == 3) =>
        {
            if prefixes.operand_size || prefixes.rep || prefixes.repne {
                return Err(OpAnalysisError::unsupported(bytes));
            }
            Some(decode_vex(&mut cursor, &mut prefixes, long_mode)?)
        }
        _ => None,
    };

    let mut rex = Rex::default();
    let mut map = Map::Primary;
    let table = match vex {
        Some(ref vex) => {
            rex = vex.rex;
            map = Map::Escape0F;
            VEX_OPCODES
        }
        None => {
            if long_mode {
                let byte = cursor.peek()?;
                if byte & 0xf0 == 0x40 {
                    rex = Rex::from_byte(byte);
                    cursor.pos += 1;
                }
            }
            OPCODES
        }
    };
    let mut opcode = cursor.next()?;
    if vex.is_none() && opcode == 0x0f {
        map = Map::Escape0F;
        opcode = cursor.next()?;
    }

    let modrm_byte = cursor.bytes.get(cursor.pos).copied();
    let entry = table
        .iter()
        .find(|entry| entry.matches(map, opcode, modrm_byte, long_mode))
        .ok_or_else(|| OpAnalysisError::unsupported(bytes))?;
    let vex_wide = vex.as_ref().map_or(false, |vex| vex.wide);
    // There's no VEX form of the mmx moves.
    if vex.is_some() && matches!(opcode, 0x6f | 0x7f) && !prefixes.operand_size && !prefixes.rep
    {
        return Err(OpAnalysisError::unsupported(bytes));
    }

    let operand_width = if rex.w {
        8
    } else if prefixes.operand_size {
        2
    } else {
        4
    };
    let stack_width = if prefixes.operand_size {
        2
    } else if long_mode {
        8
    } else {
        4
    };
    let word = if long_mode { 8 } else { 4 };
    let width = match entry.width {
        Width::None => None,
        Width::Byte => Some(1),
        Width::Fixed(n) => Some(n),
        Width::Operand => Some(operand_width),
        Width::Stack => Some(stack_width),
        Width::Vector => Some(match opcode {
            0x10 | 0x11 if prefixes.rep => 4,
            0x10 | 0x11 if prefixes.repne => 8,
            _ if vex_wide => 32,
            0x6f | 0x7f if !prefixes.operand_size && !prefixes.rep => 8,
            _ => 16,
        }),
    };

    let mut modrm = None;
    let mut moffs = None;
    match entry.form {
        Form::ModRm(_) => modrm = Some(decode_modrm(&mut cursor, rex, long_mode)?),
        Form::Moffs(_) => {
            moffs = Some(if long_mode && !prefixes.address_size {
                cursor.read_signed(8)? as u64
            } else {
                u64::from(cursor.read_signed(4)? as u32)
            })
        }
        _ => {}
    }

    let imm_size = match entry.imm {
        Imm::None => 0,
        Imm::Byte | Imm::Rel8 => 1,
        Imm::Word => 2,
        Imm::Rel32 => 4,
        Imm::Operand if prefixes.operand_size => 2,
        Imm::Operand => 4,
        Imm::Full => operand_width as usize,
    };
    let imm = cursor.read_signed(imm_size)?;

    if cursor.pos > MAX_INSTRUCTION_LENGTH {
        return Err(OpAnalysisError::unsupported(bytes));
    }
    let length = cursor.pos as u8;

    let mnemonic = match entry.name {
        Name::Fixed(name) => name,
        Name::AluOpcode => ALU[usize::from((opcode >> 3) & 7)],
        Name::Group(names) => names[usize::from(modrm.as_ref().map_or(0, |m| m.reg))],
    };

    let access_for = |role: Role| match role {
        Role::Read | Role::Branch => Some(MemoryAccessType::Read),
        Role::Write => Some(MemoryAccessType::Write),
        Role::ReadWrite => Some(MemoryAccessType::ReadWrite),
        Role::AluDest if mnemonic == "cmp" => Some(MemoryAccessType::Read),
        Role::AluDest => Some(MemoryAccessType::ReadWrite),
        Role::AddressOnly => None,
    };

    let mut insn = DecodedInstruction::new(architecture, mnemonic, entry.class, length);
    let mut explicit_memory = false;

    if let (Form::ModRm(role), Some(modrm)) = (entry.form, modrm) {
        match modrm.rm {
            Rm::Memory(addressing) => {
                let addressing = match addressing {
                    Addressing::PcRelative(disp) => Addressing::PcRelative(disp + i64::from(length)),
                    other => other,
                };
                if let Some(access) = access_for(role) {
                    insn = insn.with_operand(addressing, access, width);
                    explicit_memory = true;
                }
                if role == Role::Branch {
                    insn = insn.with_branch(BranchTarget::Memory(addressing));
                }
            }
            Rm::Register(reg) => {
                if role == Role::Branch {
                    insn = insn.with_branch(BranchTarget::Register(reg));
                }
            }
        }
    }
    if let (Form::Moffs(role), Some(address)) = (entry.form, moffs) {
        if let Some(access) = access_for(role) {
            insn = insn.with_operand(Addressing::Absolute(address), access, width);
            explicit_memory = true;
        }
    }
    if let Form::Strings(operands) = entry.form {
        for &(reg, access) in operands {
            insn = insn.with_operand(Addressing::Indirect(reg), access, width);
        }
    }
    if let Imm::Rel8 | Imm::Rel32 = entry.imm {
        insn = insn.with_branch(BranchTarget::Relative(imm + i64::from(length)));
    }

    let below_stack = |size: u8| Addressing::BaseDisplacement {
        base: Some(XSP),
        index: None,
        scale: 1,
        displacement: -i64::from(size),
    };
    insn = match entry.implicit {
        Implicit::None => insn,
        Implicit::Push => insn.with_operand(
            below_stack(stack_width),
            MemoryAccessType::Write,
            Some(stack_width),
        ),
        Implicit::Pop => insn.with_operand(
            Addressing::Indirect(XSP),
            MemoryAccessType::Read,
            Some(stack_width),
        ),
        Implicit::Call => {
            insn.with_operand(below_stack(word), MemoryAccessType::Write, Some(word))
        }
        Implicit::Return => insn
            .with_operand(Addressing::Indirect(XSP), MemoryAccessType::Read, Some(word))
            .with_branch(BranchTarget::Stack),
        Implicit::Leave => insn.with_operand(
            Addressing::Indirect(XBP),
            MemoryAccessType::Read,
            Some(stack_width),
        ),
    };

    if matches!(insn.operation_class, Load | Store) && !explicit_memory {
        insn.operation_class = Arithmetic;
    }

    Ok(insn)
}
