//! Analysis tools for AArch64 code

use super::{
    read_word, sign_extend, Addressing, BranchTarget, DecodedInstruction, MemoryAccessType,
    OpAnalysisError, OperationClass, Reg,
};
use crate::context::Architecture;

/// Register 31 is the stack pointer when used as a base, and the zero register otherwise.
const SP_OR_ZR: u8 = 31;
const LR: u8 = 30;

struct Encoding {
    mask: u32,
    value: u32,
    decode: fn(u32) -> Option<DecodedInstruction>,
}

static ENCODINGS: &[Encoding] = &[
    Encoding { mask: 0xffff_0000, value: 0x0000_0000, decode: permanently_undefined },
    Encoding { mask: 0xffe0_001f, value: 0xd420_0000, decode: breakpoint },
    Encoding { mask: 0xffe0_001f, value: 0xd400_0001, decode: supervisor_call },
    Encoding { mask: 0xffff_f01f, value: 0xd503_201f, decode: hint },
    Encoding { mask: 0xffc0_0000, value: 0xd500_0000, decode: system },
    Encoding { mask: 0xff9f_fc1f, value: 0xd61f_0000, decode: branch_register },
    Encoding { mask: 0xffff_fbff, value: 0xd65f_0bff, decode: authenticated_return },
    Encoding { mask: 0x7c00_0000, value: 0x1400_0000, decode: branch_immediate },
    Encoding { mask: 0xff00_0010, value: 0x5400_0000, decode: conditional_branch },
    Encoding { mask: 0x7e00_0000, value: 0x3400_0000, decode: compare_and_branch },
    Encoding { mask: 0x7e00_0000, value: 0x3600_0000, decode: test_and_branch },
    Encoding { mask: 0x3b00_0000, value: 0x1800_0000, decode: load_literal },
    Encoding { mask: 0x3f00_0000, value: 0x0800_0000, decode: load_store_exclusive },
    Encoding { mask: 0x3a00_0000, value: 0x2800_0000, decode: load_store_pair },
    Encoding { mask: 0x3b00_0000, value: 0x3900_0000, decode: load_store_unsigned_offset },
    Encoding { mask: 0x3b20_0000, value: 0x3800_0000, decode: load_store_immediate },
    Encoding { mask: 0x3b20_0c00, value: 0x3820_0800, decode: load_store_register_offset },
    Encoding { mask: 0x1c00_0000, value: 0x1000_0000, decode: data_processing },
    Encoding { mask: 0x0e00_0000, value: 0x0a00_0000, decode: data_processing },
    Encoding { mask: 0x0e00_0000, value: 0x0e00_0000, decode: simd_data_processing },
];

/// Decode a single AArch64 instruction
pub(super) fn decode(bytes: &[u8]) -> Result<DecodedInstruction, OpAnalysisError> {
    let word = read_word(bytes)?;
    ENCODINGS
        .iter()
        .filter(|enc| word & enc.mask == enc.value)
        .find_map(|enc| (enc.decode)(word))
        .ok_or_else(|| OpAnalysisError::unsupported(&bytes[..4]))
}

fn insn(mnemonic: &'static str, class: OperationClass) -> DecodedInstruction {
    DecodedInstruction::new(Architecture::Arm64, mnemonic, class, 4)
}

fn bit(word: u32, n: u32) -> bool {
    word & (1 << n) != 0
}

fn bits(word: u32, hi: u32, lo: u32) -> u32 {
    (word >> lo) & ((1 << (hi - lo + 1)) - 1)
}

fn rn(word: u32) -> Reg {
    Reg(bits(word, 9, 5) as u8)
}

fn base_plus(base: Reg, displacement: i64) -> Addressing {
    if displacement == 0 {
        Addressing::Indirect(base)
    } else {
        Addressing::BaseDisplacement {
            base: Some(base),
            index: None,
            scale: 1,
            displacement,
        }
    }
}

/// What a single-register load/store does, from its size, V and opc fields.
enum Shape {
    Access {
        load: bool,
        width: u8,
    },
    Prefetch,
}

fn single_shape(word: u32) -> Option<Shape> {
    let size = bits(word, 31, 30);
    let vector = bit(word, 26);
    let opc = bits(word, 23, 22);
    if vector {
        let width = match (size, opc & 2 != 0) {
            (0, true) => 16,
            (_, true) => return None,
            (size, false) => 1u8 << size,
        };
        return Some(Shape::Access {
            load: opc & 1 != 0,
            width,
        });
    }
    let width = 1u8 << size;
    match (opc, size) {
        (0, _) => Some(Shape::Access { load: false, width }),
        (1, _) => Some(Shape::Access { load: true, width }),
        (2, 3) => Some(Shape::Prefetch),
        (2, _) => Some(Shape::Access { load: true, width }),
        (_, 0 | 1) => Some(Shape::Access { load: true, width }),
        _ => None,
    }
}

fn single(word: u32, addressing: Addressing, class_override: Option<OperationClass>) -> Option<DecodedInstruction> {
    match single_shape(word)? {
        Shape::Prefetch => Some(insn("prfm", OperationClass::Unknown)),
        Shape::Access { load: true, width } => Some(
            insn("ldr", class_override.unwrap_or(OperationClass::Load)).with_operand(
                addressing,
                MemoryAccessType::Read,
                Some(width),
            ),
        ),
        Shape::Access { load: false, width } => Some(
            insn("str", class_override.unwrap_or(OperationClass::Store)).with_operand(
                addressing,
                MemoryAccessType::Write,
                Some(width),
            ),
        ),
    }
}

fn permanently_undefined(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("udf", OperationClass::Undefined))
}

fn breakpoint(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("brk", OperationClass::Trap))
}

fn supervisor_call(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("svc", OperationClass::Unknown))
}

fn hint(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("hint", OperationClass::Unknown))
}

fn system(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("sys", OperationClass::Unknown))
}

fn branch_register(word: u32) -> Option<DecodedInstruction> {
    let target = rn(word);
    let decoded = match bits(word, 22, 21) {
        0 => insn("br", OperationClass::ExecuteIndirect),
        1 => insn("blr", OperationClass::ExecuteIndirect),
        2 => insn("ret", OperationClass::Return),
        _ => return None,
    };
    Some(decoded.with_branch(BranchTarget::Register(target)))
}

fn authenticated_return(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("reta", OperationClass::Return).with_branch(BranchTarget::Register(Reg(LR))))
}

fn branch_immediate(word: u32) -> Option<DecodedInstruction> {
    let offset = sign_extend(bits(word, 25, 0) << 2, 28);
    let mnemonic = if bit(word, 31) { "bl" } else { "b" };
    Some(insn(mnemonic, OperationClass::ExecuteDirect).with_branch(BranchTarget::Relative(offset)))
}

fn conditional_branch(word: u32) -> Option<DecodedInstruction> {
    let offset = sign_extend(bits(word, 23, 5) << 2, 21);
    Some(insn("b.cond", OperationClass::ExecuteDirect).with_branch(BranchTarget::Relative(offset)))
}

fn compare_and_branch(word: u32) -> Option<DecodedInstruction> {
    let offset = sign_extend(bits(word, 23, 5) << 2, 21);
    let mnemonic = if bit(word, 24) { "cbnz" } else { "cbz" };
    Some(insn(mnemonic, OperationClass::ExecuteDirect).with_branch(BranchTarget::Relative(offset)))
}

fn test_and_branch(word: u32) -> Option<DecodedInstruction> {
    let offset = sign_extend(bits(word, 18, 5) << 2, 16);
    let mnemonic = if bit(word, 24) { "tbnz" } else { "tbz" };
    Some(insn(mnemonic, OperationClass::ExecuteDirect).with_branch(BranchTarget::Relative(offset)))
}

fn load_literal(word: u32) -> Option<DecodedInstruction> {
    let offset = sign_extend(bits(word, 23, 5) << 2, 21);
    let width = match (bits(word, 31, 30), bit(word, 26)) {
        (0, _) => 4,
        (1, _) => 8,
        (2, false) => 4,
        (2, true) => 16,
        (_, false) => return Some(insn("prfm", OperationClass::Unknown)),
        (_, true) => return None,
    };
    Some(insn("ldr", OperationClass::Load).with_operand(
        Addressing::PcRelative(offset),
        MemoryAccessType::Read,
        Some(width),
    ))
}

fn load_store_exclusive(word: u32) -> Option<DecodedInstruction> {
    let width = 1u8 << bits(word, 31, 30);
    let load = bit(word, 22);
    let pair = bit(word, 21);
    let size = if pair { width * 2 } else { width };
    let addressing = Addressing::Indirect(rn(word));
    Some(if load {
        insn("ldxr", OperationClass::Load).with_operand(
            addressing,
            MemoryAccessType::Read,
            Some(size),
        )
    } else {
        insn("stxr", OperationClass::Store).with_operand(
            addressing,
            MemoryAccessType::Write,
            Some(size),
        )
    })
}

fn load_store_pair(word: u32) -> Option<DecodedInstruction> {
    let opc = bits(word, 31, 30);
    let vector = bit(word, 26);
    let load = bit(word, 22);
    let width: u8 = match (opc, vector) {
        (3, _) => return None,
        (opc, true) => 4 << opc,
        (2, false) => 8,
        (_, false) => 4,
    };
    let displacement = sign_extend(bits(word, 21, 15), 7) * i64::from(width);
    let base = rn(word);
    let mode = bits(word, 24, 23);
    let post_index = mode == 1;
    let pre_index = mode == 3;
    let addressing = if post_index {
        Addressing::Indirect(base)
    } else {
        base_plus(base, displacement)
    };

    let (mnemonic, class, access) = if load {
        let class = if base.0 == SP_OR_ZR && post_index && displacement > 0 {
            OperationClass::Pop
        } else {
            OperationClass::Load
        };
        ("ldp", class, MemoryAccessType::Read)
    } else {
        let class = if base.0 == SP_OR_ZR && pre_index && displacement < 0 {
            OperationClass::Push
        } else {
            OperationClass::Store
        };
        ("stp", class, MemoryAccessType::Write)
    };
    Some(insn(mnemonic, class).with_operand(addressing, access, Some(width * 2)))
}

fn load_store_unsigned_offset(word: u32) -> Option<DecodedInstruction> {
    let scale = match single_shape(word)? {
        Shape::Access { width, .. } => i64::from(width),
        Shape::Prefetch => 8,
    };
    let displacement = i64::from(bits(word, 21, 10)) * scale;
    single(word, base_plus(rn(word), displacement), None)
}

fn load_store_immediate(word: u32) -> Option<DecodedInstruction> {
    let displacement = sign_extend(bits(word, 20, 12), 9);
    let base = rn(word);
    // 00 unscaled, 01 post-indexed, 10 unprivileged, 11 pre-indexed
    let mode = bits(word, 11, 10);
    let addressing = if mode == 1 {
        Addressing::Indirect(base)
    } else {
        base_plus(base, displacement)
    };
    let load = matches!(single_shape(word)?, Shape::Access { load: true, .. });
    let class = match (base.0 == SP_OR_ZR, mode, load) {
        (true, 3, false) if displacement < 0 => Some(OperationClass::Push),
        (true, 1, true) if displacement > 0 => Some(OperationClass::Pop),
        _ => None,
    };
    single(word, addressing, class)
}

fn load_store_register_offset(word: u32) -> Option<DecodedInstruction> {
    let width = match single_shape(word)? {
        Shape::Access { width, .. } => i64::from(width),
        Shape::Prefetch => 8,
    };
    let rm = bits(word, 20, 16) as u8;
    let shifted = bit(word, 12);
    // uxtw/sxtw extension of a 32-bit index isn't modelled; the full register is used.
    let index = if rm == SP_OR_ZR { None } else { Some(Reg(rm)) };
    let addressing = Addressing::BaseDisplacement {
        base: Some(rn(word)),
        index,
        scale: if shifted { width } else { 1 },
        displacement: 0,
    };
    single(word, addressing, None)
}

fn data_processing(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("alu", OperationClass::Arithmetic))
}

fn simd_data_processing(_word: u32) -> Option<DecodedInstruction> {
    Some(insn("simd", OperationClass::Arithmetic))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{access_test, AccessTestData};
    use super::super::{decode, OpAnalysisError};
    use super::*;

    fn arm64(data: &AccessTestData) {
        access_test(Architecture::Arm64, data)
    }

    fn decoded(word: u32) -> DecodedInstruction {
        decode(Architecture::Arm64, &word.to_le_bytes()).unwrap()
    }

    #[test]
    fn test_unsigned_offset() {
        // ldr x0, [x1, #8]
        let mut data = AccessTestData {
            bytes: &0xf940_0420u32.to_le_bytes(),
            regs: &[("x1", 0x10_0000), ("sp", 0x7000)],
            expected_size: 8,
            expected_addresses: &[0x10_0008],
        };
        arm64(&data);

        // str w2, [sp, #4]
        let bytes = 0xb900_07e2u32.to_le_bytes();
        data.bytes = &bytes;
        data.expected_size = 4;
        data.expected_addresses = &[0x7004];
        arm64(&data);
    }

    #[test]
    fn test_unscaled_and_indexed() {
        // ldur w0, [x1, #-4]
        let mut data = AccessTestData {
            bytes: &0xb85f_c020u32.to_le_bytes(),
            regs: &[("x1", 0x2000), ("x2", 0x3)],
            expected_size: 4,
            expected_addresses: &[0x1ffc],
        };
        arm64(&data);

        // ldr x0, [x1], #8
        let bytes = 0xf840_8420u32.to_le_bytes();
        data.bytes = &bytes;
        data.expected_size = 8;
        data.expected_addresses = &[0x2000];
        arm64(&data);

        // ldr x0, [x1, x2, lsl #3]
        let bytes = 0xf862_7820u32.to_le_bytes();
        data.bytes = &bytes;
        data.expected_addresses = &[0x2018];
        arm64(&data);
    }

    #[test]
    fn test_pairs() {
        // stp x29, x30, [sp, #-16]!
        let mut data = AccessTestData {
            bytes: &0xa9bf_7bfdu32.to_le_bytes(),
            regs: &[("sp", 0x8000)],
            expected_size: 16,
            expected_addresses: &[0x7ff0],
        };
        arm64(&data);
        assert_eq!(decoded(0xa9bf_7bfd).operation_class, OperationClass::Push);

        // ldp x29, x30, [sp], #16
        let bytes = 0xa8c1_7bfdu32.to_le_bytes();
        data.bytes = &bytes;
        data.expected_addresses = &[0x8000];
        arm64(&data);
        assert_eq!(decoded(0xa8c1_7bfd).operation_class, OperationClass::Pop);
    }

    #[test]
    fn test_literal_and_exclusive() {
        // ldr x0, #0x10
        let mut data = AccessTestData {
            bytes: &0x5800_0080u32.to_le_bytes(),
            regs: &[("pc", 0x40_0000), ("x1", 0x5000)],
            expected_size: 8,
            expected_addresses: &[0x40_0010],
        };
        arm64(&data);

        // ldxr x0, [x1]
        let bytes = 0xc85f_7c20u32.to_le_bytes();
        data.bytes = &bytes;
        data.expected_addresses = &[0x5000];
        arm64(&data);
    }

    #[test]
    fn test_classes() {
        let ret = decoded(0xd65f_03c0);
        assert_eq!(ret.operation_class, OperationClass::Return);
        assert_eq!(ret.branch_target, Some(BranchTarget::Register(Reg(30))));
        assert_eq!(decoded(0xd61f_0200).operation_class, OperationClass::ExecuteIndirect);
        assert_eq!(decoded(0xd63f_0100).mnemonic, "blr");
        assert_eq!(decoded(0x0000_0000).operation_class, OperationClass::Undefined);
        assert_eq!(decoded(0xd420_0000).operation_class, OperationClass::Trap);
        assert_eq!(decoded(0xd503_201f).operation_class, OperationClass::Unknown);
        assert_eq!(decoded(0x9100_0420).operation_class, OperationClass::Arithmetic);
        assert_eq!(
            decoded(0x9400_0010).branch_target,
            Some(BranchTarget::Relative(0x40))
        );
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            decode(Architecture::Arm64, &[0x20, 0x04, 0x40]),
            Err(OpAnalysisError::InstructionTruncated)
        );
    }
}
