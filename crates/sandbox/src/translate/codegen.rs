//! Generation of C source for translated blocks.

use std::fmt::Write;

use rvisa::{BranchOp, Instruction, IntOp, LoadOp, MulOp, OpCode, StoreOp};

/// Status returned by a translated block when it completed normally.
pub const STATUS_CONTINUE: i32 = 0;

/// Status returned when a memory access faulted.
pub const STATUS_FAULT: i32 = 1;

/// Status returned after a store modified executable memory.
pub const STATUS_CODE_MODIFIED: i32 = 2;

const PRELUDE: &str = r#"#include <stdint.h>

struct rv_api {
    void *opaque;
    int (*load)(void *opaque, uint64_t address, uint32_t size, uint64_t *value);
    int (*store)(void *opaque, uint64_t address, uint32_t size, uint64_t value);
    uint64_t retired;
    uint64_t fault_pc;
};

static inline uint64_t rv_sext32(uint32_t value) {
    return (uint64_t)(int64_t)(int32_t)value;
}

static inline uint64_t rv_div(uint64_t a, uint64_t b) {
    if (b == 0) return UINT64_MAX;
    if ((int64_t)a == INT64_MIN && (int64_t)b == -1) return a;
    return (uint64_t)((int64_t)a / (int64_t)b);
}

static inline uint64_t rv_divu(uint64_t a, uint64_t b) {
    return b == 0 ? UINT64_MAX : a / b;
}

static inline uint64_t rv_rem(uint64_t a, uint64_t b) {
    if (b == 0) return a;
    if ((int64_t)a == INT64_MIN && (int64_t)b == -1) return 0;
    return (uint64_t)((int64_t)a % (int64_t)b);
}

static inline uint64_t rv_remu(uint64_t a, uint64_t b) {
    return b == 0 ? a : a % b;
}

static inline uint64_t rv_divw(uint64_t a, uint64_t b) {
    int32_t x = (int32_t)a, y = (int32_t)b;
    if (y == 0) return UINT64_MAX;
    if (x == INT32_MIN && y == -1) return rv_sext32((uint32_t)x);
    return rv_sext32((uint32_t)(x / y));
}

static inline uint64_t rv_divuw(uint64_t a, uint64_t b) {
    uint32_t x = (uint32_t)a, y = (uint32_t)b;
    return y == 0 ? UINT64_MAX : rv_sext32(x / y);
}

static inline uint64_t rv_remw(uint64_t a, uint64_t b) {
    int32_t x = (int32_t)a, y = (int32_t)b;
    if (y == 0) return rv_sext32((uint32_t)x);
    if (x == INT32_MIN && y == -1) return 0;
    return rv_sext32((uint32_t)(x % y));
}

static inline uint64_t rv_remuw(uint64_t a, uint64_t b) {
    uint32_t x = (uint32_t)a, y = (uint32_t)b;
    return rv_sext32(y == 0 ? x : x % y);
}
"#;

/// Whether the translator can express the instruction in generated code.
pub fn is_translatable(opcode: OpCode) -> bool {
    matches!(
        opcode,
        OpCode::Lui
            | OpCode::Auipc
            | OpCode::Jal
            | OpCode::Jalr
            | OpCode::Branch(_)
            | OpCode::Load(_)
            | OpCode::Store(_)
            | OpCode::IntImm(_)
            | OpCode::IntImmWord(_)
            | OpCode::Int(_)
            | OpCode::IntWord(_)
            | OpCode::Mul(_)
            | OpCode::MulWord(_)
            | OpCode::Fence
    )
}

/// A straight-line sequence of translatable instructions starting at `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockSource {
    pub start: u64,
    pub instructions: Vec<Instruction>,
}

impl BlockSource {
    /// Address following the last instruction.
    pub fn end(&self) -> u64 {
        self.start
            + self
                .instructions
                .iter()
                .map(|instruction| u64::from(instruction.len))
                .sum::<u64>()
    }
}

/// Exported name of the function translating the block at `address`.
pub fn symbol_name(address: u64) -> String {
    format!("rv_block_{address:x}")
}

fn literal(value: u64) -> String {
    format!("0x{value:x}ULL")
}

fn reg(register: u8) -> String {
    format!("x[{register}]")
}

/// Generate the translation unit for `blocks`.
pub fn generate(blocks: &[BlockSource]) -> String {
    let mut source = String::from(PRELUDE);
    for block in blocks {
        generate_block(&mut source, block);
    }
    source
}

fn generate_block(source: &mut String, block: &BlockSource) {
    let _ = writeln!(
        source,
        "\nint {name}(uint64_t *x, uint64_t *pc, struct rv_api *api) {{",
        name = symbol_name(block.start)
    );
    source.push_str("    uint64_t v, t;\n    int s;\n    (void)v; (void)t; (void)s;\n");

    let mut address = block.start;
    let mut terminated = false;
    for instruction in &block.instructions {
        let _ = writeln!(source, "    /* {address:#x}: {instruction} */");
        terminated = generate_instruction(source, address, instruction);
        address += u64::from(instruction.len);
    }

    if !terminated {
        let _ = writeln!(source, "    *pc = {};", literal(address));
        let _ = writeln!(source, "    return {STATUS_CONTINUE};");
    }
    source.push_str("}\n");
}

/// Write an assignment to `rd` unless it is the zero register.
fn assign(source: &mut String, rd: u8, value: &str) {
    if rd != 0 {
        let _ = writeln!(source, "    {} = {value};", reg(rd));
    }
}

fn retire(source: &mut String) {
    source.push_str("    api->retired++;\n");
}

/// Emit the code of one instruction. Returns whether the instruction ends the block.
fn generate_instruction(source: &mut String, pc: u64, instruction: &Instruction) -> bool {
    let next = pc.wrapping_add(u64::from(instruction.len));
    let imm = literal(instruction.imm as u64);
    let rs1 = reg(instruction.rs1);
    let rs2 = reg(instruction.rs2);
    let rd = instruction.rd;

    match instruction.opcode {
        OpCode::Lui => assign(source, rd, &imm),
        OpCode::Auipc => assign(
            source,
            rd,
            &literal(pc.wrapping_add(instruction.imm as u64)),
        ),
        OpCode::Jal => {
            assign(source, rd, &literal(next));
            retire(source);
            let target = pc.wrapping_add(instruction.imm as u64);
            let _ = writeln!(source, "    *pc = {};", literal(target));
            let _ = writeln!(source, "    return {STATUS_CONTINUE};");
            return true;
        }
        OpCode::Jalr => {
            let _ = writeln!(source, "    t = ({rs1} + {imm}) & ~1ULL;");
            assign(source, rd, &literal(next));
            retire(source);
            let _ = writeln!(source, "    *pc = t;");
            let _ = writeln!(source, "    return {STATUS_CONTINUE};");
            return true;
        }
        OpCode::Branch(op) => {
            let condition = match op {
                BranchOp::Eq => format!("{rs1} == {rs2}"),
                BranchOp::Ne => format!("{rs1} != {rs2}"),
                BranchOp::Lt => format!("(int64_t){rs1} < (int64_t){rs2}"),
                BranchOp::Ge => format!("(int64_t){rs1} >= (int64_t){rs2}"),
                BranchOp::Ltu => format!("{rs1} < {rs2}"),
                BranchOp::Geu => format!("{rs1} >= {rs2}"),
            };
            let target = pc.wrapping_add(instruction.imm as u64);
            retire(source);
            let _ = writeln!(
                source,
                "    *pc = ({condition}) ? {} : {};",
                literal(target),
                literal(next)
            );
            let _ = writeln!(source, "    return {STATUS_CONTINUE};");
            return true;
        }
        OpCode::Load(op) => {
            let (size, extend) = match op {
                LoadOp::Byte => (1, "(uint64_t)(int64_t)(int8_t)v"),
                LoadOp::Half => (2, "(uint64_t)(int64_t)(int16_t)v"),
                LoadOp::Word => (4, "rv_sext32((uint32_t)v)"),
                LoadOp::Double => (8, "v"),
                LoadOp::ByteUnsigned => (1, "(uint8_t)v"),
                LoadOp::HalfUnsigned => (2, "(uint16_t)v"),
                LoadOp::WordUnsigned => (4, "(uint32_t)v"),
            };
            let _ = writeln!(
                source,
                "    s = api->load(api->opaque, {rs1} + {imm}, {size}, &v);"
            );
            fault_check(source, pc, "s");
            assign(source, rd, extend);
        }
        OpCode::Store(op) => {
            let size = match op {
                StoreOp::Byte => 1,
                StoreOp::Half => 2,
                StoreOp::Word => 4,
                StoreOp::Double => 8,
            };
            let _ = writeln!(
                source,
                "    s = api->store(api->opaque, {rs1} + {imm}, {size}, {rs2});"
            );
            fault_check(source, pc, &format!("s == {STATUS_FAULT}"));
            retire(source);
            let _ = writeln!(
                source,
                "    if (s == {STATUS_CODE_MODIFIED}) {{ *pc = {}; return {STATUS_CODE_MODIFIED}; }}",
                literal(next)
            );
            return false;
        }
        OpCode::IntImm(op) => assign(source, rd, &int_expression(op, &rs1, &imm)),
        OpCode::Int(op) => assign(source, rd, &int_expression(op, &rs1, &rs2)),
        OpCode::IntImmWord(op) => assign(source, rd, &int_word_expression(op, &rs1, &imm)),
        OpCode::IntWord(op) => assign(source, rd, &int_word_expression(op, &rs1, &rs2)),
        OpCode::Mul(op) => assign(source, rd, &mul_expression(op, &rs1, &rs2)),
        OpCode::MulWord(op) => assign(source, rd, &mul_word_expression(op, &rs1, &rs2)),
        _ => {}
    }

    retire(source);
    false
}

fn fault_check(source: &mut String, pc: u64, condition: &str) {
    let _ = writeln!(
        source,
        "    if ({condition}) {{ api->fault_pc = {pc}; *pc = {pc}; return {STATUS_FAULT}; }}",
        pc = literal(pc)
    );
}

fn int_expression(op: IntOp, lhs: &str, rhs: &str) -> String {
    match op {
        IntOp::Add => format!("{lhs} + {rhs}"),
        IntOp::Sub => format!("{lhs} - {rhs}"),
        IntOp::ShiftLeft => format!("{lhs} << ({rhs} & 63)"),
        IntOp::SetLessThan => format!("(uint64_t)((int64_t){lhs} < (int64_t){rhs})"),
        IntOp::SetLessThanUnsigned => format!("(uint64_t)({lhs} < {rhs})"),
        IntOp::Xor => format!("{lhs} ^ {rhs}"),
        IntOp::ShiftRightLogical => format!("{lhs} >> ({rhs} & 63)"),
        IntOp::ShiftRightArithmetic => format!("(uint64_t)((int64_t){lhs} >> ({rhs} & 63))"),
        IntOp::Or => format!("{lhs} | {rhs}"),
        IntOp::And => format!("{lhs} & {rhs}"),
    }
}

fn int_word_expression(op: IntOp, lhs: &str, rhs: &str) -> String {
    match op {
        IntOp::Sub => format!("rv_sext32((uint32_t){lhs} - (uint32_t){rhs})"),
        IntOp::ShiftLeft => format!("rv_sext32((uint32_t){lhs} << ({rhs} & 31))"),
        IntOp::ShiftRightLogical => format!("rv_sext32((uint32_t){lhs} >> ({rhs} & 31))"),
        IntOp::ShiftRightArithmetic => {
            format!("(uint64_t)(int64_t)((int32_t)(uint32_t){lhs} >> ({rhs} & 31))")
        }
        _ => format!("rv_sext32((uint32_t){lhs} + (uint32_t){rhs})"),
    }
}

fn mul_expression(op: MulOp, lhs: &str, rhs: &str) -> String {
    match op {
        MulOp::Mul => format!("{lhs} * {rhs}"),
        MulOp::MulHigh => {
            format!("(uint64_t)(((__int128)(int64_t){lhs} * (__int128)(int64_t){rhs}) >> 64)")
        }
        MulOp::MulHighSignedUnsigned => {
            format!("(uint64_t)(((__int128)(int64_t){lhs} * (__int128){rhs}) >> 64)")
        }
        MulOp::MulHighUnsigned => {
            format!("(uint64_t)(((unsigned __int128){lhs} * (unsigned __int128){rhs}) >> 64)")
        }
        MulOp::Div => format!("rv_div({lhs}, {rhs})"),
        MulOp::DivUnsigned => format!("rv_divu({lhs}, {rhs})"),
        MulOp::Rem => format!("rv_rem({lhs}, {rhs})"),
        MulOp::RemUnsigned => format!("rv_remu({lhs}, {rhs})"),
    }
}

fn mul_word_expression(op: MulOp, lhs: &str, rhs: &str) -> String {
    match op {
        MulOp::Div => format!("rv_divw({lhs}, {rhs})"),
        MulOp::DivUnsigned => format!("rv_divuw({lhs}, {rhs})"),
        MulOp::Rem => format!("rv_remw({lhs}, {rhs})"),
        MulOp::RemUnsigned => format!("rv_remuw({lhs}, {rhs})"),
        _ => format!("rv_sext32((uint32_t){lhs} * (uint32_t){rhs})"),
    }
}
