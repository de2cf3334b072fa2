use crate::compressed;
use crate::instruction::{Instruction, ROUNDING_MODE_DYNAMIC};
use crate::opcodes::*;

/// Errors returned by the decoder
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The encoding is not a valid RV64GC instruction
    #[error("illegal instruction {bits:#010x}")]
    IllegalInstruction { bits: u32 },
}

/// Result returned by the decoder
pub type Result<T> = std::result::Result<T, Error>;

/// Length in bytes of the instruction that begins with the given 16-bit parcel.
pub fn instruction_length(parcel: u16) -> usize {
    if parcel & 0b11 == 0b11 {
        4
    } else {
        2
    }
}

/// Decode a single instruction. Compressed instructions are identified by the low bits of
/// `bits` and only the low 16 bits are examined for them.
pub fn decode(bits: u32) -> Result<Instruction> {
    if bits & 0b11 != 0b11 {
        return compressed::decode(bits as u16);
    }

    // Encodings of 48 bits or longer
    if bits & 0b11100 == 0b11100 {
        return Err(Error::IllegalInstruction { bits });
    }

    decode_standard(bits).ok_or(Error::IllegalInstruction { bits })
}

fn rd(bits: u32) -> u8 {
    ((bits >> 7) & 0x1f) as u8
}

fn rs1(bits: u32) -> u8 {
    ((bits >> 15) & 0x1f) as u8
}

fn rs2(bits: u32) -> u8 {
    ((bits >> 20) & 0x1f) as u8
}

fn rs3(bits: u32) -> u8 {
    (bits >> 27) as u8
}

fn funct3(bits: u32) -> u32 {
    (bits >> 12) & 0x7
}

fn funct7(bits: u32) -> u32 {
    bits >> 25
}

fn imm_i(bits: u32) -> i64 {
    i64::from((bits as i32) >> 20)
}

fn imm_s(bits: u32) -> i64 {
    i64::from(((bits as i32) >> 25) << 5) | i64::from((bits >> 7) & 0x1f)
}

fn imm_b(bits: u32) -> i64 {
    let sign = i64::from((bits as i32) >> 31);
    (sign << 12)
        | i64::from((bits >> 7) & 0x1) << 11
        | i64::from((bits >> 25) & 0x3f) << 5
        | i64::from((bits >> 8) & 0xf) << 1
}

fn imm_u(bits: u32) -> i64 {
    i64::from((bits & 0xfffff000) as i32)
}

fn imm_j(bits: u32) -> i64 {
    let sign = i64::from((bits as i32) >> 31);
    (sign << 20)
        | i64::from((bits >> 12) & 0xff) << 12
        | i64::from((bits >> 20) & 0x1) << 11
        | i64::from((bits >> 21) & 0x3ff) << 1
}

fn r_type(opcode: OpCode, bits: u32) -> Instruction {
    Instruction::new(opcode, 4)
        .with_rd(rd(bits))
        .with_rs1(rs1(bits))
        .with_rs2(rs2(bits))
}

fn i_type(opcode: OpCode, bits: u32) -> Instruction {
    Instruction::new(opcode, 4)
        .with_rd(rd(bits))
        .with_rs1(rs1(bits))
        .with_imm(imm_i(bits))
}

fn s_type(opcode: OpCode, bits: u32) -> Instruction {
    Instruction::new(opcode, 4)
        .with_rs1(rs1(bits))
        .with_rs2(rs2(bits))
        .with_imm(imm_s(bits))
}

fn valid_rounding_mode(rm: u32) -> bool {
    // 0b101 and 0b110 are reserved
    rm <= 4 || rm == u32::from(ROUNDING_MODE_DYNAMIC)
}

fn decode_standard(bits: u32) -> Option<Instruction> {
    let instruction = match bits & 0x7f {
        0x37 => Instruction::new(OpCode::Lui, 4)
            .with_rd(rd(bits))
            .with_imm(imm_u(bits)),
        0x17 => Instruction::new(OpCode::Auipc, 4)
            .with_rd(rd(bits))
            .with_imm(imm_u(bits)),
        0x6f => Instruction::new(OpCode::Jal, 4)
            .with_rd(rd(bits))
            .with_imm(imm_j(bits)),
        0x67 if funct3(bits) == 0 => i_type(OpCode::Jalr, bits),
        0x63 => {
            let op = match funct3(bits) {
                0 => BranchOp::Eq,
                1 => BranchOp::Ne,
                4 => BranchOp::Lt,
                5 => BranchOp::Ge,
                6 => BranchOp::Ltu,
                7 => BranchOp::Geu,
                _ => return None,
            };
            Instruction::new(OpCode::Branch(op), 4)
                .with_rs1(rs1(bits))
                .with_rs2(rs2(bits))
                .with_imm(imm_b(bits))
        }
        0x03 => {
            let op = match funct3(bits) {
                0 => LoadOp::Byte,
                1 => LoadOp::Half,
                2 => LoadOp::Word,
                3 => LoadOp::Double,
                4 => LoadOp::ByteUnsigned,
                5 => LoadOp::HalfUnsigned,
                6 => LoadOp::WordUnsigned,
                _ => return None,
            };
            i_type(OpCode::Load(op), bits)
        }
        0x23 => {
            let op = match funct3(bits) {
                0 => StoreOp::Byte,
                1 => StoreOp::Half,
                2 => StoreOp::Word,
                3 => StoreOp::Double,
                _ => return None,
            };
            s_type(OpCode::Store(op), bits)
        }
        0x13 => decode_op_imm(bits)?,
        0x1b => decode_op_imm_word(bits)?,
        0x33 => decode_op(bits)?,
        0x3b => decode_op_word(bits)?,
        0x0f => match funct3(bits) {
            0 => Instruction::new(OpCode::Fence, 4),
            1 => Instruction::new(OpCode::FenceI, 4),
            _ => return None,
        },
        0x73 => decode_system(bits)?,
        0x2f => decode_atomic(bits)?,
        0x07 => match funct3(bits) {
            2 => i_type(OpCode::FloatLoad(Precision::Single), bits),
            3 => i_type(OpCode::FloatLoad(Precision::Double), bits),
            _ => return None,
        },
        0x27 => match funct3(bits) {
            2 => s_type(OpCode::FloatStore(Precision::Single), bits),
            3 => s_type(OpCode::FloatStore(Precision::Double), bits),
            _ => return None,
        },
        0x43 | 0x47 | 0x4b | 0x4f => {
            let op = match bits & 0x7f {
                0x43 => FloatOp::MulAdd,
                0x47 => FloatOp::MulSub,
                0x4b => FloatOp::NegMulSub,
                _ => FloatOp::NegMulAdd,
            };
            let precision = match (bits >> 25) & 0x3 {
                0 => Precision::Single,
                1 => Precision::Double,
                _ => return None,
            };
            if !valid_rounding_mode(funct3(bits)) {
                return None;
            }
            r_type(OpCode::Float(op, precision), bits)
                .with_rs3(rs3(bits))
                .with_rm(funct3(bits) as u8)
        }
        0x53 => decode_op_fp(bits)?,
        _ => return None,
    };

    Some(instruction)
}

fn decode_op_imm(bits: u32) -> Option<Instruction> {
    let shamt = i64::from((bits >> 20) & 0x3f);
    let funct6 = bits >> 26;
    let instruction = match funct3(bits) {
        0 => i_type(OpCode::IntImm(IntOp::Add), bits),
        2 => i_type(OpCode::IntImm(IntOp::SetLessThan), bits),
        3 => i_type(OpCode::IntImm(IntOp::SetLessThanUnsigned), bits),
        4 => i_type(OpCode::IntImm(IntOp::Xor), bits),
        6 => i_type(OpCode::IntImm(IntOp::Or), bits),
        7 => i_type(OpCode::IntImm(IntOp::And), bits),
        1 if funct6 == 0 => i_type(OpCode::IntImm(IntOp::ShiftLeft), bits).with_imm(shamt),
        5 if funct6 == 0 => {
            i_type(OpCode::IntImm(IntOp::ShiftRightLogical), bits).with_imm(shamt)
        }
        5 if funct6 == 0x10 => {
            i_type(OpCode::IntImm(IntOp::ShiftRightArithmetic), bits).with_imm(shamt)
        }
        _ => return None,
    };

    Some(instruction)
}

fn decode_op_imm_word(bits: u32) -> Option<Instruction> {
    let shamt = i64::from((bits >> 20) & 0x1f);
    let instruction = match (funct3(bits), funct7(bits)) {
        (0, _) => i_type(OpCode::IntImmWord(IntOp::Add), bits),
        (1, 0) => i_type(OpCode::IntImmWord(IntOp::ShiftLeft), bits).with_imm(shamt),
        (5, 0) => i_type(OpCode::IntImmWord(IntOp::ShiftRightLogical), bits).with_imm(shamt),
        (5, 0x20) => {
            i_type(OpCode::IntImmWord(IntOp::ShiftRightArithmetic), bits).with_imm(shamt)
        }
        _ => return None,
    };

    Some(instruction)
}

fn decode_op(bits: u32) -> Option<Instruction> {
    let opcode = match (funct7(bits), funct3(bits)) {
        (0x00, 0) => OpCode::Int(IntOp::Add),
        (0x20, 0) => OpCode::Int(IntOp::Sub),
        (0x00, 1) => OpCode::Int(IntOp::ShiftLeft),
        (0x00, 2) => OpCode::Int(IntOp::SetLessThan),
        (0x00, 3) => OpCode::Int(IntOp::SetLessThanUnsigned),
        (0x00, 4) => OpCode::Int(IntOp::Xor),
        (0x00, 5) => OpCode::Int(IntOp::ShiftRightLogical),
        (0x20, 5) => OpCode::Int(IntOp::ShiftRightArithmetic),
        (0x00, 6) => OpCode::Int(IntOp::Or),
        (0x00, 7) => OpCode::Int(IntOp::And),
        (0x01, 0) => OpCode::Mul(MulOp::Mul),
        (0x01, 1) => OpCode::Mul(MulOp::MulHigh),
        (0x01, 2) => OpCode::Mul(MulOp::MulHighSignedUnsigned),
        (0x01, 3) => OpCode::Mul(MulOp::MulHighUnsigned),
        (0x01, 4) => OpCode::Mul(MulOp::Div),
        (0x01, 5) => OpCode::Mul(MulOp::DivUnsigned),
        (0x01, 6) => OpCode::Mul(MulOp::Rem),
        (0x01, 7) => OpCode::Mul(MulOp::RemUnsigned),
        _ => return None,
    };

    Some(r_type(opcode, bits))
}

fn decode_op_word(bits: u32) -> Option<Instruction> {
    let opcode = match (funct7(bits), funct3(bits)) {
        (0x00, 0) => OpCode::IntWord(IntOp::Add),
        (0x20, 0) => OpCode::IntWord(IntOp::Sub),
        (0x00, 1) => OpCode::IntWord(IntOp::ShiftLeft),
        (0x00, 5) => OpCode::IntWord(IntOp::ShiftRightLogical),
        (0x20, 5) => OpCode::IntWord(IntOp::ShiftRightArithmetic),
        (0x01, 0) => OpCode::MulWord(MulOp::Mul),
        (0x01, 4) => OpCode::MulWord(MulOp::Div),
        (0x01, 5) => OpCode::MulWord(MulOp::DivUnsigned),
        (0x01, 6) => OpCode::MulWord(MulOp::Rem),
        (0x01, 7) => OpCode::MulWord(MulOp::RemUnsigned),
        _ => return None,
    };

    Some(r_type(opcode, bits))
}

fn decode_system(bits: u32) -> Option<Instruction> {
    let csr = i64::from(bits >> 20);
    let op = match funct3(bits) {
        0 => {
            return match bits {
                0x0000_0073 => Some(Instruction::new(OpCode::Ecall, 4)),
                0x0010_0073 => Some(Instruction::new(OpCode::Ebreak, 4)),
                _ => None,
            };
        }
        1 => CsrOp::ReadWrite,
        2 => CsrOp::ReadSet,
        3 => CsrOp::ReadClear,
        5 => CsrOp::ReadWriteImm,
        6 => CsrOp::ReadSetImm,
        7 => CsrOp::ReadClearImm,
        _ => return None,
    };

    Some(
        Instruction::new(OpCode::Csr(op), 4)
            .with_rd(rd(bits))
            .with_rs1(rs1(bits))
            .with_imm(csr),
    )
}

fn decode_atomic(bits: u32) -> Option<Instruction> {
    let width = match funct3(bits) {
        2 => Width::Word,
        3 => Width::Double,
        _ => return None,
    };

    let opcode = match bits >> 27 {
        0x02 if rs2(bits) == 0 => OpCode::LoadReserved(width),
        0x03 => OpCode::StoreConditional(width),
        0x01 => OpCode::Amo(AmoOp::Swap, width),
        0x00 => OpCode::Amo(AmoOp::Add, width),
        0x04 => OpCode::Amo(AmoOp::Xor, width),
        0x0c => OpCode::Amo(AmoOp::And, width),
        0x08 => OpCode::Amo(AmoOp::Or, width),
        0x10 => OpCode::Amo(AmoOp::Min, width),
        0x14 => OpCode::Amo(AmoOp::Max, width),
        0x18 => OpCode::Amo(AmoOp::MinUnsigned, width),
        0x1c => OpCode::Amo(AmoOp::MaxUnsigned, width),
        _ => return None,
    };

    Some(r_type(opcode, bits))
}

fn int_format(selector: u8) -> Option<IntFormat> {
    match selector {
        0 => Some(IntFormat::Word),
        1 => Some(IntFormat::WordUnsigned),
        2 => Some(IntFormat::Long),
        3 => Some(IntFormat::LongUnsigned),
        _ => None,
    }
}

fn decode_op_fp(bits: u32) -> Option<Instruction> {
    let funct7 = funct7(bits);
    let rm = funct3(bits);
    let precision = match funct7 & 0x3 {
        0 => Precision::Single,
        1 => Precision::Double,
        _ => return None,
    };

    // Operations that use the funct3 field as a rounding mode
    let rounded = |op: FloatOp| -> Option<Instruction> {
        if valid_rounding_mode(rm) {
            Some(r_type(OpCode::Float(op, precision), bits).with_rm(rm as u8))
        } else {
            None
        }
    };

    let plain = |op: FloatOp| Some(r_type(OpCode::Float(op, precision), bits));

    match funct7 >> 2 {
        0x00 => rounded(FloatOp::Add),
        0x01 => rounded(FloatOp::Sub),
        0x02 => rounded(FloatOp::Mul),
        0x03 => rounded(FloatOp::Div),
        0x0b if rs2(bits) == 0 => rounded(FloatOp::Sqrt),
        0x04 => match rm {
            0 => plain(FloatOp::SignInject),
            1 => plain(FloatOp::SignInjectNeg),
            2 => plain(FloatOp::SignInjectXor),
            _ => None,
        },
        0x05 => match rm {
            0 => plain(FloatOp::Min),
            1 => plain(FloatOp::Max),
            _ => None,
        },
        // fcvt.s.d has rs2 = 1, fcvt.d.s has rs2 = 0
        0x08 => match (precision, rs2(bits)) {
            (Precision::Single, 1) | (Precision::Double, 0) => rounded(FloatOp::Convert),
            _ => None,
        },
        0x14 => match rm {
            0 => plain(FloatOp::Le),
            1 => plain(FloatOp::Lt),
            2 => plain(FloatOp::Eq),
            _ => None,
        },
        0x18 => rounded(FloatOp::ToInt(int_format(rs2(bits))?)),
        0x1a => rounded(FloatOp::FromInt(int_format(rs2(bits))?)),
        0x1c if rs2(bits) == 0 => match rm {
            0 => plain(FloatOp::MoveToInt),
            1 => plain(FloatOp::Class),
            _ => None,
        },
        0x1e if rs2(bits) == 0 && rm == 0 => plain(FloatOp::MoveFromInt),
        _ => None,
    }
}
