use rvisa::*;

use crate::mem::{self, GuestMemory};
use crate::registers::Registers;

mod float;

/// Signal numbers of guest faults.
pub mod signal {
    pub const SIGILL: u32 = 4;
    pub const SIGTRAP: u32 = 5;
    pub const SIGBUS: u32 = 7;
    pub const SIGSEGV: u32 = 11;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Error occurred while accessing a memory location.
    #[error(transparent)]
    MemoryAccess(#[from] mem::Error),

    /// The instruction bits do not encode a supported instruction.
    #[error(transparent)]
    IllegalInstruction(#[from] rvisa::Error),

    /// The control and status register does not exist or is read-only.
    #[error("illegal access to csr {csr:#x}")]
    IllegalCsr { csr: u16 },

    /// The dynamic rounding mode held by `frm` is reserved.
    #[error("reserved rounding mode {rm}")]
    InvalidRoundingMode { rm: u8 },
}

impl Error {
    /// The signal delivered to the guest for this fault.
    pub fn signal(&self) -> u32 {
        match self {
            Error::MemoryAccess(mem::Error::Misaligned { .. }) => signal::SIGBUS,
            Error::MemoryAccess(_) => signal::SIGSEGV,
            _ => signal::SIGILL,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// CSR numbers of the supported control and status registers.
pub mod csr {
    pub const FFLAGS: u16 = 0x001;
    pub const FRM: u16 = 0x002;
    pub const FCSR: u16 = 0x003;
    pub const CYCLE: u16 = 0xc00;
    pub const TIME: u16 = 0xc01;
    pub const INSTRET: u16 = 0xc02;
}

/// The load reservation held by a hart after `lr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub address: u64,
    pub size: usize,

    /// The value observed by the load. A store conditional succeeds only if memory still holds
    /// this value.
    pub value: u64,
}

/// The execution state of one hardware thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hart {
    pub regs: Registers,

    /// Retired instructions. Read by the `cycle`, `time` and `instret` counters.
    pub instret: u64,

    pub reservation: Option<Reservation>,
}

impl Hart {
    pub fn new(regs: Registers) -> Self {
        Self {
            regs,
            ..Default::default()
        }
    }
}

/// Describes which instruction should be executed next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ControlFlow {
    /// The instruction following the current instruction.
    #[default]
    NextInstruction,

    /// Execution should continue at the provided address.
    Jump(u64),

    /// The instruction requested a system call. The program counter still refers to the `ecall`.
    Syscall,

    /// The instruction is a breakpoint. The program counter still refers to the `ebreak`.
    Breakpoint,
}

/// Executes one decoded instruction. Handlers are resolved once per decoded instruction with
/// [handler] so that threaded dispatch does not match on the opcode again.
pub type Handler<M> = fn(&mut Hart, &mut M, &Instruction) -> Result<ControlFlow>;

/// The handler executing instructions of this opcode.
pub fn handler<M: GuestMemory>(opcode: OpCode) -> Handler<M> {
    match opcode {
        OpCode::Lui => lui,
        OpCode::Auipc => auipc,
        OpCode::Jal => jal,
        OpCode::Jalr => jalr,
        OpCode::Branch(_) => branch,
        OpCode::Load(LoadOp::Double) => load_double,
        OpCode::Load(_) => load,
        OpCode::Store(StoreOp::Double) => store_double,
        OpCode::Store(_) => store,
        OpCode::IntImm(IntOp::Add) => add_immediate,
        OpCode::IntImm(_) => int_immediate,
        OpCode::IntImmWord(_) => int_immediate_word,
        OpCode::Int(IntOp::Add) => add,
        OpCode::Int(_) => int,
        OpCode::IntWord(_) => int_word,
        OpCode::Mul(_) => mul,
        OpCode::MulWord(_) => mul_word,
        OpCode::LoadReserved(_) => load_reserved,
        OpCode::StoreConditional(_) => store_conditional,
        OpCode::Amo(..) => amo,
        OpCode::Csr(_) => csr,
        OpCode::FloatLoad(_) => float_load,
        OpCode::FloatStore(_) => float_store,
        OpCode::Float(..) => float,
        OpCode::Fence | OpCode::FenceI => fence,
        OpCode::Ecall => ecall,
        OpCode::Ebreak => ebreak,
    }
}

/// Handler of entries which failed to decode. The raw bits are held in the immediate.
pub fn illegal<M: GuestMemory>(
    _hart: &mut Hart,
    _memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    Err(rvisa::Error::IllegalInstruction {
        bits: instruction.imm as u32,
    }
    .into())
}

/// Execute an instruction by matching on its opcode.
pub fn execute<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    match instruction.opcode {
        OpCode::Lui => lui(hart, memory, instruction),
        OpCode::Auipc => auipc(hart, memory, instruction),
        OpCode::Jal => jal(hart, memory, instruction),
        OpCode::Jalr => jalr(hart, memory, instruction),
        OpCode::Branch(_) => branch(hart, memory, instruction),
        OpCode::Load(_) => load(hart, memory, instruction),
        OpCode::Store(_) => store(hart, memory, instruction),
        OpCode::IntImm(_) => int_immediate(hart, memory, instruction),
        OpCode::IntImmWord(_) => int_immediate_word(hart, memory, instruction),
        OpCode::Int(_) => int(hart, memory, instruction),
        OpCode::IntWord(_) => int_word(hart, memory, instruction),
        OpCode::Mul(_) => mul(hart, memory, instruction),
        OpCode::MulWord(_) => mul_word(hart, memory, instruction),
        OpCode::LoadReserved(_) => load_reserved(hart, memory, instruction),
        OpCode::StoreConditional(_) => store_conditional(hart, memory, instruction),
        OpCode::Amo(..) => amo(hart, memory, instruction),
        OpCode::Csr(_) => csr(hart, memory, instruction),
        OpCode::FloatLoad(_) => float_load(hart, memory, instruction),
        OpCode::FloatStore(_) => float_store(hart, memory, instruction),
        OpCode::Float(..) => float(hart, memory, instruction),
        OpCode::Fence | OpCode::FenceI => Ok(ControlFlow::NextInstruction),
        OpCode::Ecall => Ok(ControlFlow::Syscall),
        OpCode::Ebreak => Ok(ControlFlow::Breakpoint),
    }
}

fn effective_address(hart: &Hart, instruction: &Instruction) -> u64 {
    hart.regs
        .get(instruction.rs1)
        .wrapping_add(instruction.imm as u64)
}

fn sign_extend_word(value: u64) -> u64 {
    value as i32 as i64 as u64
}

fn lui<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    hart.regs.set(instruction.rd, instruction.imm as u64);
    Ok(ControlFlow::NextInstruction)
}

fn auipc<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let value = hart.regs.pc.wrapping_add(instruction.imm as u64);
    hart.regs.set(instruction.rd, value);
    Ok(ControlFlow::NextInstruction)
}

fn jal<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let pc = hart.regs.pc;
    hart.regs
        .set(instruction.rd, pc.wrapping_add(u64::from(instruction.len)));
    Ok(ControlFlow::Jump(pc.wrapping_add(instruction.imm as u64)))
}

fn jalr<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let target = effective_address(hart, instruction) & !1;
    let pc = hart.regs.pc;
    hart.regs
        .set(instruction.rd, pc.wrapping_add(u64::from(instruction.len)));
    Ok(ControlFlow::Jump(target))
}

fn branch<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let lhs = hart.regs.get(instruction.rs1);
    let rhs = hart.regs.get(instruction.rs2);
    let taken = match instruction.opcode {
        OpCode::Branch(BranchOp::Eq) => lhs == rhs,
        OpCode::Branch(BranchOp::Ne) => lhs != rhs,
        OpCode::Branch(BranchOp::Lt) => (lhs as i64) < (rhs as i64),
        OpCode::Branch(BranchOp::Ge) => (lhs as i64) >= (rhs as i64),
        OpCode::Branch(BranchOp::Ltu) => lhs < rhs,
        _ => lhs >= rhs,
    };

    if taken {
        Ok(ControlFlow::Jump(
            hart.regs.pc.wrapping_add(instruction.imm as u64),
        ))
    } else {
        Ok(ControlFlow::NextInstruction)
    }
}

fn load<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = effective_address(hart, instruction);
    let value = match instruction.opcode {
        OpCode::Load(LoadOp::Byte) => memory.load::<1>(address)?[0] as i8 as i64 as u64,
        OpCode::Load(LoadOp::ByteUnsigned) => u64::from(memory.load::<1>(address)?[0]),
        OpCode::Load(LoadOp::Half) => i16::from_le_bytes(memory.load(address)?) as i64 as u64,
        OpCode::Load(LoadOp::HalfUnsigned) => u64::from(u16::from_le_bytes(memory.load(address)?)),
        OpCode::Load(LoadOp::Word) => i32::from_le_bytes(memory.load(address)?) as i64 as u64,
        OpCode::Load(LoadOp::WordUnsigned) => u64::from(u32::from_le_bytes(memory.load(address)?)),
        _ => u64::from_le_bytes(memory.load(address)?),
    };

    hart.regs.set(instruction.rd, value);
    Ok(ControlFlow::NextInstruction)
}

fn load_double<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = effective_address(hart, instruction);
    let value = u64::from_le_bytes(memory.load(address)?);
    hart.regs.set(instruction.rd, value);
    Ok(ControlFlow::NextInstruction)
}

fn store<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = effective_address(hart, instruction);
    let bytes = hart.regs.get(instruction.rs2).to_le_bytes();
    let size = match instruction.opcode {
        OpCode::Store(StoreOp::Byte) => 1,
        OpCode::Store(StoreOp::Half) => 2,
        OpCode::Store(StoreOp::Word) => 4,
        _ => 8,
    };

    memory.write(address, &bytes[..size])?;
    Ok(ControlFlow::NextInstruction)
}

fn store_double<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = effective_address(hart, instruction);
    memory.write(address, &hart.regs.get(instruction.rs2).to_le_bytes())?;
    Ok(ControlFlow::NextInstruction)
}

/// Integer operation with 6-bit shift amounts.
pub(crate) fn int_op(op: IntOp, lhs: u64, rhs: u64) -> u64 {
    match op {
        IntOp::Add => lhs.wrapping_add(rhs),
        IntOp::Sub => lhs.wrapping_sub(rhs),
        IntOp::ShiftLeft => lhs << (rhs & 63),
        IntOp::SetLessThan => u64::from((lhs as i64) < (rhs as i64)),
        IntOp::SetLessThanUnsigned => u64::from(lhs < rhs),
        IntOp::Xor => lhs ^ rhs,
        IntOp::ShiftRightLogical => lhs >> (rhs & 63),
        IntOp::ShiftRightArithmetic => ((lhs as i64) >> (rhs & 63)) as u64,
        IntOp::Or => lhs | rhs,
        IntOp::And => lhs & rhs,
    }
}

/// 32-bit integer operation with 5-bit shift amounts. The result is sign-extended.
pub(crate) fn int_op_word(op: IntOp, lhs: u64, rhs: u64) -> u64 {
    let lhs = lhs as u32;
    let rhs = rhs as u32;
    let result = match op {
        IntOp::Sub => lhs.wrapping_sub(rhs),
        IntOp::ShiftLeft => lhs << (rhs & 31),
        IntOp::ShiftRightLogical => lhs >> (rhs & 31),
        IntOp::ShiftRightArithmetic => ((lhs as i32) >> (rhs & 31)) as u32,
        _ => lhs.wrapping_add(rhs),
    };
    sign_extend_word(u64::from(result))
}

pub(crate) fn mul_op(op: MulOp, lhs: u64, rhs: u64) -> u64 {
    match op {
        MulOp::Mul => lhs.wrapping_mul(rhs),
        MulOp::MulHigh => ((i128::from(lhs as i64) * i128::from(rhs as i64)) >> 64) as u64,
        MulOp::MulHighSignedUnsigned => {
            ((i128::from(lhs as i64) * i128::from(rhs)) >> 64) as u64
        }
        MulOp::MulHighUnsigned => ((u128::from(lhs) * u128::from(rhs)) >> 64) as u64,
        MulOp::Div => match (lhs as i64, rhs as i64) {
            (_, 0) => u64::MAX,
            (i64::MIN, -1) => lhs,
            (lhs, rhs) => (lhs / rhs) as u64,
        },
        MulOp::DivUnsigned => lhs.checked_div(rhs).unwrap_or(u64::MAX),
        MulOp::Rem => match (lhs as i64, rhs as i64) {
            (lhs, 0) => lhs as u64,
            (i64::MIN, -1) => 0,
            (lhs, rhs) => (lhs % rhs) as u64,
        },
        MulOp::RemUnsigned => lhs.checked_rem(rhs).unwrap_or(lhs),
    }
}

pub(crate) fn mul_op_word(op: MulOp, lhs: u64, rhs: u64) -> u64 {
    let (signed_lhs, signed_rhs) = (lhs as i32, rhs as i32);
    let (unsigned_lhs, unsigned_rhs) = (lhs as u32, rhs as u32);
    let result = match op {
        MulOp::Div => match (signed_lhs, signed_rhs) {
            (_, 0) => u32::MAX,
            (i32::MIN, -1) => signed_lhs as u32,
            (lhs, rhs) => (lhs / rhs) as u32,
        },
        MulOp::DivUnsigned => unsigned_lhs.checked_div(unsigned_rhs).unwrap_or(u32::MAX),
        MulOp::Rem => match (signed_lhs, signed_rhs) {
            (lhs, 0) => lhs as u32,
            (i32::MIN, -1) => 0,
            (lhs, rhs) => (lhs % rhs) as u32,
        },
        MulOp::RemUnsigned => unsigned_lhs.checked_rem(unsigned_rhs).unwrap_or(unsigned_lhs),
        // Only mulw exists among the multiplications
        _ => unsigned_lhs.wrapping_mul(unsigned_rhs),
    };
    sign_extend_word(u64::from(result))
}

fn add_immediate<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let value = hart
        .regs
        .get(instruction.rs1)
        .wrapping_add(instruction.imm as u64);
    hart.regs.set(instruction.rd, value);
    Ok(ControlFlow::NextInstruction)
}

fn add<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let value = hart
        .regs
        .get(instruction.rs1)
        .wrapping_add(hart.regs.get(instruction.rs2));
    hart.regs.set(instruction.rd, value);
    Ok(ControlFlow::NextInstruction)
}

macro_rules! register_op {
    ($name:ident, $opcode:ident, $op:ident, immediate) => {
        fn $name<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
            if let OpCode::$opcode(op) = instruction.opcode {
                let lhs = hart.regs.get(instruction.rs1);
                hart.regs
                    .set(instruction.rd, $op(op, lhs, instruction.imm as u64));
            }
            Ok(ControlFlow::NextInstruction)
        }
    };
    ($name:ident, $opcode:ident, $op:ident) => {
        fn $name<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
            if let OpCode::$opcode(op) = instruction.opcode {
                let lhs = hart.regs.get(instruction.rs1);
                let rhs = hart.regs.get(instruction.rs2);
                hart.regs.set(instruction.rd, $op(op, lhs, rhs));
            }
            Ok(ControlFlow::NextInstruction)
        }
    };
}

register_op!(int_immediate, IntImm, int_op, immediate);
register_op!(int_immediate_word, IntImmWord, int_op_word, immediate);
register_op!(int, Int, int_op);
register_op!(int_word, IntWord, int_op_word);
register_op!(mul, Mul, mul_op);
register_op!(mul_word, MulWord, mul_op_word);

fn atomic_size(instruction: &Instruction) -> usize {
    match instruction.opcode {
        OpCode::LoadReserved(width)
        | OpCode::StoreConditional(width)
        | OpCode::Amo(_, width) => width.size(),
        _ => 8,
    }
}

fn extend_atomic(value: u64, size: usize) -> u64 {
    if size == 4 {
        sign_extend_word(value)
    } else {
        value
    }
}

fn load_reserved<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = hart.regs.get(instruction.rs1);
    let size = atomic_size(instruction);
    if address % size as u64 != 0 {
        return Err(mem::Error::Misaligned { address, size }.into());
    }

    let mut bytes = [0u8; 8];
    memory.read(address, &mut bytes[..size])?;
    let value = u64::from_le_bytes(bytes);
    hart.reservation = Some(Reservation {
        address,
        size,
        value,
    });
    hart.regs.set(instruction.rd, extend_atomic(value, size));
    Ok(ControlFlow::NextInstruction)
}

fn store_conditional<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = hart.regs.get(instruction.rs1);
    let size = atomic_size(instruction);
    if address % size as u64 != 0 {
        return Err(mem::Error::Misaligned { address, size }.into());
    }

    let new = hart.regs.get(instruction.rs2);
    let mut stored = false;
    if let Some(reservation) = hart.reservation.take() {
        if reservation.address == address && reservation.size == size {
            memory.atomic_update(address, size, &mut |old| {
                stored = old == reservation.value;
                if stored {
                    new
                } else {
                    old
                }
            })?;
        }
    }

    hart.regs.set(instruction.rd, u64::from(!stored));
    Ok(ControlFlow::NextInstruction)
}

fn amo<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let OpCode::Amo(op, _) = instruction.opcode else {
        return Ok(ControlFlow::NextInstruction);
    };

    let address = hart.regs.get(instruction.rs1);
    let size = atomic_size(instruction);
    let operand = extend_atomic(hart.regs.get(instruction.rs2), size);
    let old = memory.atomic_update(address, size, &mut |old| {
        let old = extend_atomic(old, size);
        match op {
            AmoOp::Swap => operand,
            AmoOp::Add => old.wrapping_add(operand),
            AmoOp::Xor => old ^ operand,
            AmoOp::And => old & operand,
            AmoOp::Or => old | operand,
            AmoOp::Min => (old as i64).min(operand as i64) as u64,
            AmoOp::Max => (old as i64).max(operand as i64) as u64,
            // Both operands are sign-extended words so unsigned order is preserved
            AmoOp::MinUnsigned => old.min(operand),
            AmoOp::MaxUnsigned => old.max(operand),
        }
    })?;

    hart.regs.set(instruction.rd, extend_atomic(old, size));
    Ok(ControlFlow::NextInstruction)
}

fn csr<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    let OpCode::Csr(op) = instruction.opcode else {
        return Ok(ControlFlow::NextInstruction);
    };

    let number = instruction.csr();
    let old = match number {
        csr::FFLAGS => u64::from(hart.regs.fflags()),
        csr::FRM => u64::from(hart.regs.frm()),
        csr::FCSR => u64::from(hart.regs.fcsr),
        csr::CYCLE | csr::TIME | csr::INSTRET => hart.instret,
        csr => return Err(Error::IllegalCsr { csr }),
    };

    let source = match op {
        CsrOp::ReadWriteImm | CsrOp::ReadSetImm | CsrOp::ReadClearImm => u64::from(instruction.rs1),
        _ => hart.regs.get(instruction.rs1),
    };

    let new = match op {
        CsrOp::ReadWrite | CsrOp::ReadWriteImm => Some(source),
        // Set and clear with x0 or a zero immediate do not write
        _ if instruction.rs1 == 0 => None,
        CsrOp::ReadSet | CsrOp::ReadSetImm => Some(old | source),
        _ => Some(old & !source),
    };

    if let Some(new) = new {
        let new = new as u32;
        match number {
            csr::FFLAGS => hart.regs.set_fcsr((hart.regs.fcsr & !0x1f) | (new & 0x1f)),
            csr::FRM => hart.regs.set_fcsr((hart.regs.fcsr & 0x1f) | ((new & 0x7) << 5)),
            csr::FCSR => hart.regs.set_fcsr(new),
            csr => return Err(Error::IllegalCsr { csr }),
        }
    }

    hart.regs.set(instruction.rd, old);
    Ok(ControlFlow::NextInstruction)
}

fn float_load<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = effective_address(hart, instruction);
    match instruction.opcode {
        OpCode::FloatLoad(Precision::Single) => {
            let bits = u32::from_le_bytes(memory.load(address)?);
            hart.regs.set_f32(instruction.rd, f32::from_bits(bits));
        }
        _ => {
            let bits = u64::from_le_bytes(memory.load(address)?);
            hart.regs.f[usize::from(instruction.rd & 31)] = bits;
        }
    }

    Ok(ControlFlow::NextInstruction)
}

fn float_store<M: GuestMemory>(
    hart: &mut Hart,
    memory: &mut M,
    instruction: &Instruction,
) -> Result<ControlFlow> {
    let address = effective_address(hart, instruction);
    let bits = hart.regs.f[usize::from(instruction.rs2 & 31)].to_le_bytes();
    let size = match instruction.opcode {
        OpCode::FloatStore(Precision::Single) => 4,
        _ => 8,
    };

    memory.write(address, &bits[..size])?;
    Ok(ControlFlow::NextInstruction)
}

fn float<M>(hart: &mut Hart, _: &mut M, instruction: &Instruction) -> Result<ControlFlow> {
    if let OpCode::Float(op, precision) = instruction.opcode {
        float::execute(hart, instruction, op, precision)?;
    }
    Ok(ControlFlow::NextInstruction)
}

fn fence<M>(_: &mut Hart, _: &mut M, _: &Instruction) -> Result<ControlFlow> {
    Ok(ControlFlow::NextInstruction)
}

fn ecall<M>(_: &mut Hart, _: &mut M, _: &Instruction) -> Result<ControlFlow> {
    Ok(ControlFlow::Syscall)
}

fn ebreak<M>(_: &mut Hart, _: &mut M, _: &Instruction) -> Result<ControlFlow> {
    Ok(ControlFlow::Breakpoint)
}
