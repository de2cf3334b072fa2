//! Expansion of the RV64C compressed instructions into their 32-bit equivalents. Each expanded
//! instruction keeps a length of 2 so control flow advances correctly.

use crate::abi::{RA, SP, ZERO};
use crate::decode::{Error, Result};
use crate::instruction::Instruction;
use crate::opcodes::*;

fn bit(bits: u16, n: u32) -> u32 {
    u32::from((bits >> n) & 1)
}

fn field(bits: u16, hi: u32, lo: u32) -> u32 {
    (u32::from(bits) >> lo) & ((1 << (hi - lo + 1)) - 1)
}

fn sign_extend(value: u32, width: u32) -> i64 {
    let shift = 64 - width;
    (i64::from(value) << shift) >> shift
}

/// Full register number of the 3-bit register field beginning at `lo`.
fn compact_register(bits: u16, lo: u32) -> u8 {
    (field(bits, lo + 2, lo) + 8) as u8
}

fn full_register(bits: u16, lo: u32) -> u8 {
    field(bits, lo + 4, lo) as u8
}

fn c(opcode: OpCode) -> Instruction {
    Instruction::new(opcode, 2)
}

/// 6-bit immediate split across bit 12 and bits 6:2.
fn imm6(bits: u16) -> u32 {
    bit(bits, 12) << 5 | field(bits, 6, 2)
}

/// Decode a compressed instruction.
pub fn decode(bits: u16) -> Result<Instruction> {
    let illegal = Error::IllegalInstruction {
        bits: u32::from(bits),
    };

    let instruction = match bits & 0b11 {
        0b00 => decode_quadrant0(bits),
        0b01 => decode_quadrant1(bits),
        0b10 => decode_quadrant2(bits),
        _ => None,
    };

    instruction.ok_or(illegal)
}

fn decode_quadrant0(bits: u16) -> Option<Instruction> {
    let rd = compact_register(bits, 2);
    let rs1 = compact_register(bits, 7);

    // uimm[5:3] at 12:10 and uimm[7:6] at 6:5
    let offset_double = field(bits, 12, 10) << 3 | field(bits, 6, 5) << 6;
    // uimm[5:3] at 12:10, uimm[2] at 6 and uimm[6] at 5
    let offset_word = field(bits, 12, 10) << 3 | bit(bits, 6) << 2 | bit(bits, 5) << 6;

    let instruction = match field(bits, 15, 13) {
        0b000 => {
            // c.addi4spn: nzuimm[5:4|9:6|2|3] in bits 12:5
            let imm = field(bits, 12, 11) << 4
                | field(bits, 10, 7) << 6
                | bit(bits, 6) << 2
                | bit(bits, 5) << 3;
            if imm == 0 {
                return None;
            }
            c(OpCode::IntImm(IntOp::Add))
                .with_rd(rd)
                .with_rs1(SP)
                .with_imm(i64::from(imm))
        }
        0b001 => c(OpCode::FloatLoad(Precision::Double))
            .with_rd(rd)
            .with_rs1(rs1)
            .with_imm(i64::from(offset_double)),
        0b010 => c(OpCode::Load(LoadOp::Word))
            .with_rd(rd)
            .with_rs1(rs1)
            .with_imm(i64::from(offset_word)),
        0b011 => c(OpCode::Load(LoadOp::Double))
            .with_rd(rd)
            .with_rs1(rs1)
            .with_imm(i64::from(offset_double)),
        0b101 => c(OpCode::FloatStore(Precision::Double))
            .with_rs1(rs1)
            .with_rs2(rd)
            .with_imm(i64::from(offset_double)),
        0b110 => c(OpCode::Store(StoreOp::Word))
            .with_rs1(rs1)
            .with_rs2(rd)
            .with_imm(i64::from(offset_word)),
        0b111 => c(OpCode::Store(StoreOp::Double))
            .with_rs1(rs1)
            .with_rs2(rd)
            .with_imm(i64::from(offset_double)),
        _ => return None,
    };

    Some(instruction)
}

fn decode_quadrant1(bits: u16) -> Option<Instruction> {
    let rd = full_register(bits, 7);
    let imm = sign_extend(imm6(bits), 6);

    let instruction = match field(bits, 15, 13) {
        0b000 => c(OpCode::IntImm(IntOp::Add))
            .with_rd(rd)
            .with_rs1(rd)
            .with_imm(imm),
        0b001 => {
            if rd == ZERO {
                return None;
            }
            c(OpCode::IntImmWord(IntOp::Add))
                .with_rd(rd)
                .with_rs1(rd)
                .with_imm(imm)
        }
        0b010 => c(OpCode::IntImm(IntOp::Add))
            .with_rd(rd)
            .with_rs1(ZERO)
            .with_imm(imm),
        0b011 if rd == SP => {
            // c.addi16sp: nzimm[9] at 12 and nzimm[4|6|8:7|5] at 6:2
            let value = bit(bits, 12) << 9
                | bit(bits, 6) << 4
                | bit(bits, 5) << 6
                | field(bits, 4, 3) << 7
                | bit(bits, 2) << 5;
            if value == 0 {
                return None;
            }
            c(OpCode::IntImm(IntOp::Add))
                .with_rd(SP)
                .with_rs1(SP)
                .with_imm(sign_extend(value, 10))
        }
        0b011 => {
            let value = imm6(bits) << 12;
            if value == 0 {
                return None;
            }
            c(OpCode::Lui).with_rd(rd).with_imm(sign_extend(value, 18))
        }
        0b100 => {
            let rd = compact_register(bits, 7);
            let rs2 = compact_register(bits, 2);
            let shamt = i64::from(imm6(bits));
            match field(bits, 11, 10) {
                0b00 => c(OpCode::IntImm(IntOp::ShiftRightLogical))
                    .with_rd(rd)
                    .with_rs1(rd)
                    .with_imm(shamt),
                0b01 => c(OpCode::IntImm(IntOp::ShiftRightArithmetic))
                    .with_rd(rd)
                    .with_rs1(rd)
                    .with_imm(shamt),
                0b10 => c(OpCode::IntImm(IntOp::And))
                    .with_rd(rd)
                    .with_rs1(rd)
                    .with_imm(imm),
                _ => {
                    let opcode = match (bit(bits, 12), field(bits, 6, 5)) {
                        (0, 0b00) => OpCode::Int(IntOp::Sub),
                        (0, 0b01) => OpCode::Int(IntOp::Xor),
                        (0, 0b10) => OpCode::Int(IntOp::Or),
                        (0, 0b11) => OpCode::Int(IntOp::And),
                        (1, 0b00) => OpCode::IntWord(IntOp::Sub),
                        (1, 0b01) => OpCode::IntWord(IntOp::Add),
                        _ => return None,
                    };
                    c(opcode).with_rd(rd).with_rs1(rd).with_rs2(rs2)
                }
            }
        }
        0b101 => {
            // c.j: imm[11|4|9:8|10|6|7|3:1|5] in bits 12:2
            let value = bit(bits, 12) << 11
                | bit(bits, 11) << 4
                | field(bits, 10, 9) << 8
                | bit(bits, 8) << 10
                | bit(bits, 7) << 6
                | bit(bits, 6) << 7
                | field(bits, 5, 3) << 1
                | bit(bits, 2) << 5;
            c(OpCode::Jal)
                .with_rd(ZERO)
                .with_imm(sign_extend(value, 12))
        }
        funct3 => {
            // c.beqz and c.bnez: offset[8|4:3] in 12:10 and offset[7:6|2:1|5] in 6:2
            let value = bit(bits, 12) << 8
                | field(bits, 11, 10) << 3
                | field(bits, 6, 5) << 6
                | field(bits, 4, 3) << 1
                | bit(bits, 2) << 5;
            let op = if funct3 == 0b110 {
                BranchOp::Eq
            } else {
                BranchOp::Ne
            };
            c(OpCode::Branch(op))
                .with_rs1(compact_register(bits, 7))
                .with_rs2(ZERO)
                .with_imm(sign_extend(value, 9))
        }
    };

    Some(instruction)
}

fn decode_quadrant2(bits: u16) -> Option<Instruction> {
    let rd = full_register(bits, 7);
    let rs2 = full_register(bits, 2);

    // uimm[5] at 12, uimm[4:3] at 6:5, uimm[8:6] at 4:2
    let load_double = bit(bits, 12) << 5 | field(bits, 6, 5) << 3 | field(bits, 4, 2) << 6;
    // uimm[5:3] at 12:10, uimm[8:6] at 9:7
    let store_double = field(bits, 12, 10) << 3 | field(bits, 9, 7) << 6;

    let instruction = match field(bits, 15, 13) {
        0b000 => c(OpCode::IntImm(IntOp::ShiftLeft))
            .with_rd(rd)
            .with_rs1(rd)
            .with_imm(i64::from(imm6(bits))),
        0b001 => c(OpCode::FloatLoad(Precision::Double))
            .with_rd(rd)
            .with_rs1(SP)
            .with_imm(i64::from(load_double)),
        0b010 => {
            if rd == ZERO {
                return None;
            }
            // uimm[5] at 12, uimm[4:2] at 6:4, uimm[7:6] at 3:2
            let offset = bit(bits, 12) << 5 | field(bits, 6, 4) << 2 | field(bits, 3, 2) << 6;
            c(OpCode::Load(LoadOp::Word))
                .with_rd(rd)
                .with_rs1(SP)
                .with_imm(i64::from(offset))
        }
        0b011 => {
            if rd == ZERO {
                return None;
            }
            c(OpCode::Load(LoadOp::Double))
                .with_rd(rd)
                .with_rs1(SP)
                .with_imm(i64::from(load_double))
        }
        0b100 => match (bit(bits, 12), rd, rs2) {
            (0, ZERO, ZERO) => return None,
            (0, rs1, ZERO) => c(OpCode::Jalr).with_rd(ZERO).with_rs1(rs1),
            (0, rd, rs2) => c(OpCode::Int(IntOp::Add))
                .with_rd(rd)
                .with_rs1(ZERO)
                .with_rs2(rs2),
            (_, ZERO, ZERO) => c(OpCode::Ebreak),
            (_, rs1, ZERO) => c(OpCode::Jalr).with_rd(RA).with_rs1(rs1),
            (_, rd, rs2) => c(OpCode::Int(IntOp::Add))
                .with_rd(rd)
                .with_rs1(rd)
                .with_rs2(rs2),
        },
        0b101 => c(OpCode::FloatStore(Precision::Double))
            .with_rs1(SP)
            .with_rs2(rs2)
            .with_imm(i64::from(store_double)),
        0b110 => {
            // uimm[5:2] at 12:9, uimm[7:6] at 8:7
            let offset = field(bits, 12, 9) << 2 | field(bits, 8, 7) << 6;
            c(OpCode::Store(StoreOp::Word))
                .with_rs1(SP)
                .with_rs2(rs2)
                .with_imm(i64::from(offset))
        }
        _ => c(OpCode::Store(StoreOp::Double))
            .with_rs1(SP)
            .with_rs2(rs2)
            .with_imm(i64::from(store_double)),
    };

    Some(instruction)
}
