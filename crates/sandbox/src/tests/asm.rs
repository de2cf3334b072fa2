//! Hand encoding of the few instructions used by the unit tests.

use crate::emulator::Hart;
use crate::mem::{self, Memory, Permissions, RegionKind, PAGE_SIZE};
use crate::processor::{DispatchMode, Processor, EXIT_ADDRESS};
use crate::registers::Registers;
use rvisa::abi;

pub const CODE: u64 = 0x1_0000;
pub const DATA: u64 = 0x2_0000;
pub const STACK_TOP: u64 = 0x4_0000;

fn r_type(opcode: u32, funct3: u32, funct7: u32, rd: u8, rs1: u8, rs2: u8) -> u32 {
    funct7 << 25
        | u32::from(rs2) << 20
        | u32::from(rs1) << 15
        | funct3 << 12
        | u32::from(rd) << 7
        | opcode
}

fn i_type(opcode: u32, funct3: u32, rd: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32) & 0xfff) << 20 | u32::from(rs1) << 15 | funct3 << 12 | u32::from(rd) << 7 | opcode
}

fn s_type(funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7f) << 25
        | u32::from(rs2) << 20
        | u32::from(rs1) << 15
        | funct3 << 12
        | (imm & 0x1f) << 7
        | 0x23
}

fn b_type(funct3: u32, rs1: u8, rs2: u8, offset: i32) -> u32 {
    let imm = offset as u32;
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3f) << 25
        | u32::from(rs2) << 20
        | u32::from(rs1) << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | 0x63
}

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x13, 0, rd, rs1, imm)
}

pub fn li(rd: u8, imm: i32) -> u32 {
    addi(rd, abi::ZERO, imm)
}

pub fn lui(rd: u8, imm: u32) -> u32 {
    imm & 0xffff_f000 | u32::from(rd) << 7 | 0x37
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x33, 0, 0, rd, rs1, rs2)
}

pub fn mul(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x33, 0, 1, rd, rs1, rs2)
}

pub fn div(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x33, 4, 1, rd, rs1, rs2)
}

pub fn ld(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x03, 3, rd, rs1, imm)
}

pub fn lw(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x03, 2, rd, rs1, imm)
}

pub fn sd(rs2: u8, rs1: u8, imm: i32) -> u32 {
    s_type(3, rs1, rs2, imm)
}

pub fn sw(rs2: u8, rs1: u8, imm: i32) -> u32 {
    s_type(2, rs1, rs2, imm)
}

pub fn bne(rs1: u8, rs2: u8, offset: i32) -> u32 {
    b_type(1, rs1, rs2, offset)
}

pub fn jalr(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x67, 0, rd, rs1, imm)
}

pub fn ret() -> u32 {
    jalr(abi::ZERO, abi::RA, 0)
}

pub fn lr_w(rd: u8, rs1: u8) -> u32 {
    r_type(0x2f, 2, 0b00010 << 2, rd, rs1, 0)
}

pub fn sc_w(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x2f, 2, 0b00011 << 2, rd, rs1, rs2)
}

pub fn amoadd_w(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0x2f, 2, 0, rd, rs1, rs2)
}

pub const ECALL: u32 = 0x0000_0073;
pub const EBREAK: u32 = 0x0010_0073;

pub fn bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// Memory holding `words` in an executable page at [CODE], a writable page at [DATA] and a stack
/// page below [STACK_TOP].
pub fn memory(words: &[u32]) -> mem::Result<Memory> {
    let mut memory = Memory::new(1 << 20);
    memory.map_fixed(CODE, PAGE_SIZE, Permissions::READ_EXECUTE, RegionKind::Segment)?;
    memory.map_fixed(DATA, PAGE_SIZE, Permissions::READ_WRITE, RegionKind::Segment)?;
    memory.map_fixed(STACK_TOP - PAGE_SIZE, PAGE_SIZE, Permissions::READ_WRITE, RegionKind::Stack)?;
    memory.host_write(CODE, &bytes(words))?;
    Ok(memory)
}

/// A processor about to call the code at [CODE], returning to [EXIT_ADDRESS].
pub fn processor(mode: DispatchMode) -> Processor<Memory> {
    let mut regs = Registers::default();
    regs.set_call(CODE, EXIT_ADDRESS, &[]);
    regs.set(abi::SP, STACK_TOP);
    Processor::new(Hart::new(regs), mode)
}
