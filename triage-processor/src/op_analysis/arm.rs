//! Analysis tools for 32-bit ARM code (A32 encoding only)

use super::{
    read_word, sign_extend, Addressing, BranchTarget, DecodedInstruction, MemoryAccessType,
    OpAnalysisError, OperationClass, Reg,
};
use crate::context::Architecture;

const SP: u8 = 13;
const LR: u8 = 14;
const PC: u8 = 15;
/// Reading the PC in A32 state yields the instruction address plus 8.
const PC_BIAS: i64 = 8;

const DATA_PROCESSING: [&str; 16] = [
    "and", "eor", "sub", "rsb", "add", "adc", "sbc", "rsc", "tst", "teq", "cmp", "cmn", "orr",
    "mov", "bic", "mvn",
];

/// An encoding class: instructions with `word & mask == value` are handed to `decode`, which
/// may still reject them so that a later entry gets a chance.
struct Encoding {
    mask: u32,
    value: u32,
    decode: fn(u32) -> Option<DecodedInstruction>,
}

static ENCODINGS: &[Encoding] = &[
    Encoding { mask: 0xfff0_00f0, value: 0xe7f0_00f0, decode: permanently_undefined },
    Encoding { mask: 0xfe00_0000, value: 0xfa00_0000, decode: branch_exchange_immediate },
    Encoding { mask: 0xf000_0000, value: 0xf000_0000, decode: unconditional },
    Encoding { mask: 0x0fff_ffd0, value: 0x012f_ff10, decode: branch_exchange },
    Encoding { mask: 0x0e00_0090, value: 0x0000_0090, decode: extra_load_store },
    Encoding { mask: 0x0c00_0000, value: 0x0400_0000, decode: load_store },
    Encoding { mask: 0x0e00_0000, value: 0x0800_0000, decode: load_store_multiple },
    Encoding { mask: 0x0e00_0000, value: 0x0a00_0000, decode: branch },
    Encoding { mask: 0x0e00_0e00, value: 0x0c00_0a00, decode: vfp_load_store },
    Encoding { mask: 0x0f00_0000, value: 0x0f00_0000, decode: supervisor_call },
    Encoding { mask: 0x0c00_0000, value: 0x0000_0000, decode: data_processing },
];

/// Decode a single A32 instruction
pub(super) fn decode(bytes: &[u8]) -> Result<DecodedInstruction, OpAnalysisError> {
    let word = read_word(bytes)?;
    ENCODINGS
        .iter()
        .filter(|enc| word & enc.mask == enc.value)
        .find_map(|enc| (enc.decode)(word))
        .ok_or_else(|| OpAnalysisError::unsupported(&bytes[..4]))
}

fn insn(mnemonic: &'static str, class: OperationClass) -> DecodedInstruction {
    DecodedInstruction::new(Architecture::Arm32, mnemonic, class, 4)
}

fn bit(word: u32, n: u32) -> bool {
    word & (1 << n) != 0
}

fn bits(word: u32, hi: u32, lo: u32) -> u32 {
    (word >> lo) & ((1 << (hi - lo + 1)) - 1)
}

/// A four-bit register field starting at bit `lo`.
fn reg_at(word: u32, lo: u32) -> u8 {
    bits(word, lo + 3, lo) as u8
}

enum Offset {
    Immediate(i64),
    Register { reg: Reg, scale: i64 },
}

/// The address accessed by a single load/store, from its P/U bits and base register.
fn single_addressing(word: u32, offset: Offset) -> Addressing {
    let rn = reg_at(word, 16);
    let pre_index = bit(word, 24);
    let up = bit(word, 23);

    if !pre_index {
        // Post-indexed: the access uses the unmodified base.
        return if rn == PC {
            Addressing::PcRelative(PC_BIAS)
        } else {
            Addressing::Indirect(Reg(rn))
        };
    }
    match offset {
        Offset::Immediate(imm) => {
            let displacement = if up { imm } else { -imm };
            if rn == PC {
                Addressing::PcRelative(displacement + PC_BIAS)
            } else if displacement == 0 {
                Addressing::Indirect(Reg(rn))
            } else {
                Addressing::BaseDisplacement {
                    base: Some(Reg(rn)),
                    index: None,
                    scale: 1,
                    displacement,
                }
            }
        }
        Offset::Register { reg, scale } => Addressing::BaseDisplacement {
            base: Some(Reg(rn)),
            index: Some(reg),
            scale: if up { scale } else { -scale },
            displacement: if rn == PC { PC_BIAS } else { 0 },
        },
    }
}

fn permanently_undefined(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("udf", OperationClass::Undefined))
}

fn branch_exchange_immediate(word: u32) -> Option<DecodedInstruction> {
    let halfword = bits(word, 24, 24) << 1;
    let offset = sign_extend((bits(word, 23, 0) << 2) | halfword, 26);
    Some(
        insn("blx", OperationClass::ExecuteDirect)
            .with_branch(BranchTarget::Relative(offset + PC_BIAS)),
    )
}

fn unconditional(_word: u32) -> Option<DecodedInstruction> {
    // Barriers, preload hints, cps/setend and friends.
    Some(insn("system", OperationClass::Unknown))
}

fn branch_exchange(word: u32) -> Option<DecodedInstruction> {
    let rm = reg_at(word, 0);
    let link = bit(word, 5);
    let decoded = match (link, rm) {
        (false, LR) => insn("bx", OperationClass::Return),
        (false, _) => insn("bx", OperationClass::ExecuteIndirect),
        (true, _) => insn("blx", OperationClass::ExecuteIndirect),
    };
    Some(decoded.with_branch(BranchTarget::Register(Reg(rm))))
}

fn extra_load_store(word: u32) -> Option<DecodedInstruction> {
    let load = bit(word, 20);
    let (mnemonic, width, reads) = match (bits(word, 6, 5), load) {
        // multiplies and swaps live in the rest of this space
        (0, _) => return None,
        (1, false) => ("strh", 2, false),
        (1, true) => ("ldrh", 2, true),
        (2, false) => ("ldrd", 8, true),
        (2, true) => ("ldrsb", 1, true),
        (3, false) => ("strd", 8, false),
        _ => ("ldrsh", 2, true),
    };
    let offset = if bit(word, 22) {
        Offset::Immediate(i64::from((bits(word, 11, 8) << 4) | bits(word, 3, 0)))
    } else {
        Offset::Register {
            reg: Reg(reg_at(word, 0)),
            scale: 1,
        }
    };
    let addressing = single_addressing(word, offset);
    Some(if reads {
        insn(mnemonic, OperationClass::Load).with_operand(
            addressing,
            MemoryAccessType::Read,
            Some(width),
        )
    } else {
        insn(mnemonic, OperationClass::Store).with_operand(
            addressing,
            MemoryAccessType::Write,
            Some(width),
        )
    })
}

fn load_store(word: u32) -> Option<DecodedInstruction> {
    let register_offset = bit(word, 25);
    if register_offset && bit(word, 4) {
        // media instructions
        return None;
    }
    let pre_index = bit(word, 24);
    let up = bit(word, 23);
    let byte = bit(word, 22);
    let writeback = bit(word, 21);
    let load = bit(word, 20);
    let rn = reg_at(word, 16);
    let rt = reg_at(word, 12);
    let width = if byte { 1 } else { 4 };

    let offset = if register_offset {
        if bits(word, 6, 5) != 0 {
            // Only LSL-scaled register offsets can be expressed as an index.
            return None;
        }
        Offset::Register {
            reg: Reg(reg_at(word, 0)),
            scale: 1 << bits(word, 11, 7),
        }
    } else {
        Offset::Immediate(i64::from(bits(word, 11, 0)))
    };
    let single_word_step = matches!(offset, Offset::Immediate(4)) && !byte;
    let addressing = single_addressing(word, offset);

    let decoded = if rn == SP && single_word_step && !load && pre_index && !up && writeback {
        insn("push", OperationClass::Push).with_operand(
            addressing,
            MemoryAccessType::Write,
            Some(width),
        )
    } else if rn == SP && single_word_step && load && !pre_index && up {
        let class = if rt == PC {
            OperationClass::Return
        } else {
            OperationClass::Pop
        };
        let decoded = insn("pop", class).with_operand(addressing, MemoryAccessType::Read, Some(width));
        if rt == PC {
            decoded.with_branch(BranchTarget::Stack)
        } else {
            decoded
        }
    } else if load && rt == PC {
        insn("ldr", OperationClass::ExecuteIndirect)
            .with_operand(addressing, MemoryAccessType::Read, Some(width))
            .with_branch(BranchTarget::Memory(addressing))
    } else if load {
        insn(if byte { "ldrb" } else { "ldr" }, OperationClass::Load).with_operand(
            addressing,
            MemoryAccessType::Read,
            Some(width),
        )
    } else {
        insn(if byte { "strb" } else { "str" }, OperationClass::Store).with_operand(
            addressing,
            MemoryAccessType::Write,
            Some(width),
        )
    };
    Some(decoded)
}

fn load_store_multiple(word: u32) -> Option<DecodedInstruction> {
    let list = bits(word, 15, 0);
    if list == 0 {
        return None;
    }
    let pre_index = bit(word, 24);
    let up = bit(word, 23);
    let writeback = bit(word, 21);
    let load = bit(word, 20);
    let rn = reg_at(word, 16);
    let count = i64::from(list.count_ones());

    let start = match (pre_index, up) {
        (false, true) => 0,
        (true, true) => 4,
        (false, false) => 4 - 4 * count,
        (true, false) => -4 * count,
    };
    let addressing = if start == 0 {
        Addressing::Indirect(Reg(rn))
    } else {
        Addressing::BaseDisplacement {
            base: Some(Reg(rn)),
            index: None,
            scale: 1,
            displacement: start,
        }
    };
    let size = Some((count * 4) as u8);
    let loads_pc = load && bit(word, 15);

    let (mnemonic, class) = if rn == SP && writeback && !load && pre_index && !up {
        ("push", OperationClass::Push)
    } else if rn == SP && writeback && load && !pre_index && up {
        (
            "pop",
            if loads_pc {
                OperationClass::Return
            } else {
                OperationClass::Pop
            },
        )
    } else if loads_pc {
        ("ldm", OperationClass::Return)
    } else if load {
        ("ldm", OperationClass::Load)
    } else {
        ("stm", OperationClass::Store)
    };

    let access = if load {
        MemoryAccessType::Read
    } else {
        MemoryAccessType::Write
    };
    let decoded = insn(mnemonic, class).with_operand(addressing, access, size);
    Some(match (loads_pc, rn) {
        (false, _) => decoded,
        (true, SP) => decoded.with_branch(BranchTarget::Stack),
        (true, _) => decoded.with_branch(BranchTarget::Memory(addressing)),
    })
}

fn branch(word: u32) -> Option<DecodedInstruction> {
    let offset = sign_extend(bits(word, 23, 0) << 2, 26) + PC_BIAS;
    let mnemonic = if bit(word, 24) { "bl" } else { "b" };
    Some(insn(mnemonic, OperationClass::ExecuteDirect).with_branch(BranchTarget::Relative(offset)))
}

fn vfp_load_store(word: u32) -> Option<DecodedInstruction> {
    let pre_index = bit(word, 24);
    let up = bit(word, 23);
    let writeback = bit(word, 21);
    let load = bit(word, 20);
    let rn = reg_at(word, 16);
    let imm = i64::from(bits(word, 7, 0)) * 4;
    let access = if load {
        MemoryAccessType::Read
    } else {
        MemoryAccessType::Write
    };

    if pre_index && !writeback {
        let width = if bit(word, 8) { 8 } else { 4 };
        let displacement = if up { imm } else { -imm };
        let addressing = if rn == PC {
            Addressing::PcRelative(displacement + PC_BIAS)
        } else {
            Addressing::BaseDisplacement {
                base: Some(Reg(rn)),
                index: None,
                scale: 1,
                displacement,
            }
        };
        let (mnemonic, class) = if load {
            ("vldr", OperationClass::Load)
        } else {
            ("vstr", OperationClass::Store)
        };
        return Some(insn(mnemonic, class).with_operand(addressing, access, Some(width)));
    }

    if !pre_index && !up {
        // core <-> extension register transfers
        return None;
    }
    let addressing = if pre_index {
        Addressing::BaseDisplacement {
            base: Some(Reg(rn)),
            index: None,
            scale: 1,
            displacement: -imm,
        }
    } else {
        Addressing::Indirect(Reg(rn))
    };
    let (mnemonic, class) = match (rn, load) {
        (SP, false) if pre_index && writeback => ("vpush", OperationClass::Push),
        (SP, true) if !pre_index && writeback => ("vpop", OperationClass::Pop),
        (_, false) => ("vstm", OperationClass::Store),
        (_, true) => ("vldm", OperationClass::Load),
    };
    Some(insn(mnemonic, class).with_operand(addressing, access, u8::try_from(imm).ok()))
}

fn supervisor_call(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("svc", OperationClass::Unknown))
}

fn data_processing(word: u32) -> Option<DecodedInstruction> {
    let immediate = bit(word, 25);
    let opcode = bits(word, 24, 21) as usize;
    let sets_flags = bit(word, 20);
    let rd = reg_at(word, 12);
    let rm = reg_at(word, 0);

    if (8..=11).contains(&opcode) && !sets_flags {
        // mrs/msr/clz and other miscellaneous instructions
        return Some(insn("misc", OperationClass::Unknown));
    }
    if !immediate && bits(word, 7, 4) == 0b1001 {
        return Some(insn("mul", OperationClass::Arithmetic));
    }

    let mnemonic = DATA_PROCESSING[opcode];
    let is_test = (8..=11).contains(&opcode);
    let plain_register = !immediate && bits(word, 11, 4) == 0;

    let decoded = if rd == PC && !is_test {
        if mnemonic == "mov" && plain_register && rm == LR {
            insn(mnemonic, OperationClass::Return).with_branch(BranchTarget::Register(Reg(LR)))
        } else if mnemonic == "mov" && plain_register {
            insn(mnemonic, OperationClass::ExecuteIndirect)
                .with_branch(BranchTarget::Register(Reg(rm)))
        } else {
            insn(mnemonic, OperationClass::ExecuteIndirect)
        }
    } else {
        insn(mnemonic, OperationClass::Arithmetic)
    };
    Some(decoded)
}
