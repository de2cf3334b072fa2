use crate::abi::{float_register_name, register_name};
use crate::opcodes::*;

/// Dynamic rounding mode encoding. The rounding mode is taken from the `frm` register.
pub const ROUNDING_MODE_DYNAMIC: u8 = 0b111;

/// A decoded instruction. All formats share this layout so that a decoded block is a flat array
/// of values. Fields which are not used by an opcode are zero.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Instruction {
    pub opcode: OpCode,

    /// Destination register.
    pub rd: u8,

    /// First source register. For immediate CSR forms this is the 5-bit unsigned immediate.
    pub rs1: u8,

    /// Second source register.
    pub rs2: u8,

    /// Third source register of fused multiply-add instructions.
    pub rs3: u8,

    /// Rounding mode of floating-point instructions.
    pub rm: u8,

    /// Sign-extended immediate. Holds the shift amount for shifts, the full shifted value for
    /// `lui` and `auipc`, and the register number for CSR instructions.
    pub imm: i64,

    /// Encoded length in bytes, either 2 (compressed) or 4.
    pub len: u8,
}

impl Instruction {
    pub fn new(opcode: OpCode, len: u8) -> Self {
        Self {
            opcode,
            rd: 0,
            rs1: 0,
            rs2: 0,
            rs3: 0,
            rm: 0,
            imm: 0,
            len,
        }
    }

    pub fn with_rd(mut self, rd: u8) -> Self {
        self.rd = rd;
        self
    }

    pub fn with_rs1(mut self, rs1: u8) -> Self {
        self.rs1 = rs1;
        self
    }

    pub fn with_rs2(mut self, rs2: u8) -> Self {
        self.rs2 = rs2;
        self
    }

    pub fn with_rs3(mut self, rs3: u8) -> Self {
        self.rs3 = rs3;
        self
    }

    pub fn with_rm(mut self, rm: u8) -> Self {
        self.rm = rm;
        self
    }

    pub fn with_imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    /// The CSR number of a CSR instruction.
    pub fn csr(&self) -> u16 {
        (self.imm & 0xfff) as u16
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mnemonic = self.opcode.mnemonic();
        let x = register_name;
        let fr = float_register_name;
        match self.opcode {
            OpCode::Lui | OpCode::Auipc => write!(
                f,
                "{mnemonic} {rd}, {imm:#x}",
                rd = x(self.rd),
                imm = (self.imm >> 12) & 0xfffff
            ),
            OpCode::Jal => write!(f, "{mnemonic} {rd}, {imm}", rd = x(self.rd), imm = self.imm),
            OpCode::Jalr | OpCode::Load(_) => write!(
                f,
                "{mnemonic} {rd}, {imm}({rs1})",
                rd = x(self.rd),
                imm = self.imm,
                rs1 = x(self.rs1)
            ),
            OpCode::Branch(_) => write!(
                f,
                "{mnemonic} {rs1}, {rs2}, {imm}",
                rs1 = x(self.rs1),
                rs2 = x(self.rs2),
                imm = self.imm
            ),
            OpCode::Store(_) => write!(
                f,
                "{mnemonic} {rs2}, {imm}({rs1})",
                rs2 = x(self.rs2),
                imm = self.imm,
                rs1 = x(self.rs1)
            ),
            OpCode::FloatLoad(_) => write!(
                f,
                "{mnemonic} {rd}, {imm}({rs1})",
                rd = fr(self.rd),
                imm = self.imm,
                rs1 = x(self.rs1)
            ),
            OpCode::FloatStore(_) => write!(
                f,
                "{mnemonic} {rs2}, {imm}({rs1})",
                rs2 = fr(self.rs2),
                imm = self.imm,
                rs1 = x(self.rs1)
            ),
            OpCode::IntImm(_) | OpCode::IntImmWord(_) => write!(
                f,
                "{mnemonic} {rd}, {rs1}, {imm}",
                rd = x(self.rd),
                rs1 = x(self.rs1),
                imm = self.imm
            ),
            OpCode::Int(_) | OpCode::IntWord(_) | OpCode::Mul(_) | OpCode::MulWord(_) => write!(
                f,
                "{mnemonic} {rd}, {rs1}, {rs2}",
                rd = x(self.rd),
                rs1 = x(self.rs1),
                rs2 = x(self.rs2)
            ),
            OpCode::LoadReserved(_) => write!(
                f,
                "{mnemonic} {rd}, ({rs1})",
                rd = x(self.rd),
                rs1 = x(self.rs1)
            ),
            OpCode::StoreConditional(_) | OpCode::Amo(..) => write!(
                f,
                "{mnemonic} {rd}, {rs2}, ({rs1})",
                rd = x(self.rd),
                rs2 = x(self.rs2),
                rs1 = x(self.rs1)
            ),
            OpCode::Csr(op) => match op {
                CsrOp::ReadWrite | CsrOp::ReadSet | CsrOp::ReadClear => write!(
                    f,
                    "{mnemonic} {rd}, {csr:#x}, {rs1}",
                    rd = x(self.rd),
                    csr = self.csr(),
                    rs1 = x(self.rs1)
                ),
                _ => write!(
                    f,
                    "{mnemonic} {rd}, {csr:#x}, {imm}",
                    rd = x(self.rd),
                    csr = self.csr(),
                    imm = self.rs1
                ),
            },
            OpCode::Float(op, _) => match op {
                FloatOp::MulAdd | FloatOp::MulSub | FloatOp::NegMulSub | FloatOp::NegMulAdd => {
                    write!(
                        f,
                        "{mnemonic} {rd}, {rs1}, {rs2}, {rs3}",
                        rd = fr(self.rd),
                        rs1 = fr(self.rs1),
                        rs2 = fr(self.rs2),
                        rs3 = fr(self.rs3)
                    )
                }
                FloatOp::Sqrt | FloatOp::Convert => write!(
                    f,
                    "{mnemonic} {rd}, {rs1}",
                    rd = fr(self.rd),
                    rs1 = fr(self.rs1)
                ),
                FloatOp::ToInt(_) | FloatOp::MoveToInt | FloatOp::Class => write!(
                    f,
                    "{mnemonic} {rd}, {rs1}",
                    rd = x(self.rd),
                    rs1 = fr(self.rs1)
                ),
                FloatOp::FromInt(_) | FloatOp::MoveFromInt => write!(
                    f,
                    "{mnemonic} {rd}, {rs1}",
                    rd = fr(self.rd),
                    rs1 = x(self.rs1)
                ),
                FloatOp::Eq | FloatOp::Lt | FloatOp::Le => write!(
                    f,
                    "{mnemonic} {rd}, {rs1}, {rs2}",
                    rd = x(self.rd),
                    rs1 = fr(self.rs1),
                    rs2 = fr(self.rs2)
                ),
                _ => write!(
                    f,
                    "{mnemonic} {rd}, {rs1}, {rs2}",
                    rd = fr(self.rd),
                    rs1 = fr(self.rs1),
                    rs2 = fr(self.rs2)
                ),
            },
            OpCode::Fence | OpCode::FenceI | OpCode::Ecall | OpCode::Ebreak => {
                write!(f, "{mnemonic}")
            }
        }
    }
}
