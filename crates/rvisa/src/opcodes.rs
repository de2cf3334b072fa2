//! The opcode of a decoded instruction determines its semantics. Related instructions share a
//! variant of [OpCode] and are distinguished by an inner operation such as [IntOp] or
//! [FloatOp], which keeps the top-level enumeration small enough to dispatch with a single match.

/// A representation of opcodes for RV64GC instructions. Compressed instructions decode to the
/// opcode of their 32-bit expansion.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum OpCode {
    /// Load the upper immediate: `rd = imm`.
    Lui,

    /// Add the upper immediate to the address of this instruction: `rd = pc + imm`.
    Auipc,

    /// Jump relative to this instruction and link: `rd = pc + len; pc += imm`.
    Jal,

    /// Jump to `(rs1 + imm) & !1` and link.
    Jalr,

    /// Conditionally jump relative to this instruction.
    Branch(BranchOp),

    /// Load from `rs1 + imm` into `rd`.
    Load(LoadOp),

    /// Store `rs2` to `rs1 + imm`.
    Store(StoreOp),

    /// Integer operation on `rs1` and a sign-extended immediate.
    IntImm(IntOp),

    /// 32-bit integer operation on `rs1` and an immediate. The result is sign-extended.
    IntImmWord(IntOp),

    /// Integer operation on `rs1` and `rs2`.
    Int(IntOp),

    /// 32-bit integer operation on `rs1` and `rs2`. The result is sign-extended.
    IntWord(IntOp),

    /// Multiplication and division from the M extension.
    Mul(MulOp),

    /// 32-bit multiplication and division from the M extension.
    MulWord(MulOp),

    /// Load and reserve `rs1`.
    LoadReserved(Width),

    /// Conditionally store `rs2` to `rs1` if the reservation is still held.
    StoreConditional(Width),

    /// Atomic read-modify-write of the memory at `rs1` with `rs2`.
    Amo(AmoOp, Width),

    /// Control and status register access. The register number is held in the immediate.
    Csr(CsrOp),

    /// Load a floating-point value from `rs1 + imm`.
    FloatLoad(Precision),

    /// Store a floating-point value to `rs1 + imm`.
    FloatStore(Precision),

    /// Floating-point operation from the F or D extension.
    Float(FloatOp, Precision),

    /// Memory ordering fence. Execution is sequentially consistent so this is a no-op.
    Fence,

    /// Instruction fence. Ends a basic block so subsequent instructions are fetched anew.
    FenceI,

    /// Environment call, the system call instruction.
    Ecall,

    /// Environment breakpoint.
    Ebreak,
}

/// Comparisons performed by conditional branches.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum BranchOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

/// Integer loads. The unsigned variants zero-extend the loaded value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum LoadOp {
    Byte,
    Half,
    Word,
    Double,
    ByteUnsigned,
    HalfUnsigned,
    WordUnsigned,
}

/// Integer stores.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StoreOp {
    Byte,
    Half,
    Word,
    Double,
}

/// Operations of the base integer instruction set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum IntOp {
    Add,
    Sub,
    ShiftLeft,
    SetLessThan,
    SetLessThanUnsigned,
    Xor,
    ShiftRightLogical,
    ShiftRightArithmetic,
    Or,
    And,
}

/// Operations of the M extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum MulOp {
    Mul,
    MulHigh,
    MulHighSignedUnsigned,
    MulHighUnsigned,
    Div,
    DivUnsigned,
    Rem,
    RemUnsigned,
}

/// Atomic memory operations of the A extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    MinUnsigned,
    MaxUnsigned,
}

/// Control and status register operations. The immediate forms use `rs1` as a 5-bit unsigned
/// immediate.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
    ReadWriteImm,
    ReadSetImm,
    ReadClearImm,
}

/// Operand width of atomic instructions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Width {
    Word,
    Double,
}

impl Width {
    /// Number of bytes accessed.
    pub fn size(self) -> usize {
        match self {
            Width::Word => 4,
            Width::Double => 8,
        }
    }
}

/// Precision of floating-point instructions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Precision {
    Single,
    Double,
}

/// Integer formats used by conversions between integer and floating-point registers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum IntFormat {
    Word,
    WordUnsigned,
    Long,
    LongUnsigned,
}

/// Operations of the F and D extensions. The [Precision] paired with the operation is the
/// precision of the result, or of the inputs for comparisons and moves to integer registers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FloatOp {
    /// `rs1 * rs2 + rs3`
    MulAdd,
    /// `rs1 * rs2 - rs3`
    MulSub,
    /// `-(rs1 * rs2) + rs3`
    NegMulSub,
    /// `-(rs1 * rs2) - rs3`
    NegMulAdd,
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
    SignInject,
    SignInjectNeg,
    SignInjectXor,
    Min,
    Max,
    /// Convert from the other precision.
    Convert,
    /// Convert to an integer register.
    ToInt(IntFormat),
    /// Convert from an integer register.
    FromInt(IntFormat),
    /// Move the raw bits to an integer register.
    MoveToInt,
    /// Move the raw bits from an integer register.
    MoveFromInt,
    Eq,
    Lt,
    Le,
    Class,
}

impl OpCode {
    /// Instructions after which straight-line execution cannot continue.
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self,
            OpCode::Jal
                | OpCode::Jalr
                | OpCode::Branch(_)
                | OpCode::Ecall
                | OpCode::Ebreak
                | OpCode::FenceI
        )
    }

    /// Instructions that may write guest memory.
    pub fn writes_memory(&self) -> bool {
        matches!(
            self,
            OpCode::Store(_)
                | OpCode::FloatStore(_)
                | OpCode::StoreConditional(_)
                | OpCode::Amo(..)
        )
    }

    /// Instructions whose destination is a floating-point register.
    pub fn writes_float_register(&self) -> bool {
        match self {
            OpCode::FloatLoad(_) => true,
            OpCode::Float(op, _) => !matches!(
                op,
                FloatOp::ToInt(_)
                    | FloatOp::MoveToInt
                    | FloatOp::Eq
                    | FloatOp::Lt
                    | FloatOp::Le
                    | FloatOp::Class
            ),
            _ => false,
        }
    }

    /// The assembly mnemonic of this opcode.
    pub fn mnemonic(&self) -> String {
        let suffix = |precision: &Precision| match precision {
            Precision::Single => "s",
            Precision::Double => "d",
        };
        let width = |width: &Width| match width {
            Width::Word => "w",
            Width::Double => "d",
        };
        let int_format = |format: &IntFormat| match format {
            IntFormat::Word => "w",
            IntFormat::WordUnsigned => "wu",
            IntFormat::Long => "l",
            IntFormat::LongUnsigned => "lu",
        };

        match self {
            OpCode::Lui => "lui".to_string(),
            OpCode::Auipc => "auipc".to_string(),
            OpCode::Jal => "jal".to_string(),
            OpCode::Jalr => "jalr".to_string(),
            OpCode::Branch(op) => match op {
                BranchOp::Eq => "beq",
                BranchOp::Ne => "bne",
                BranchOp::Lt => "blt",
                BranchOp::Ge => "bge",
                BranchOp::Ltu => "bltu",
                BranchOp::Geu => "bgeu",
            }
            .to_string(),
            OpCode::Load(op) => match op {
                LoadOp::Byte => "lb",
                LoadOp::Half => "lh",
                LoadOp::Word => "lw",
                LoadOp::Double => "ld",
                LoadOp::ByteUnsigned => "lbu",
                LoadOp::HalfUnsigned => "lhu",
                LoadOp::WordUnsigned => "lwu",
            }
            .to_string(),
            OpCode::Store(op) => match op {
                StoreOp::Byte => "sb",
                StoreOp::Half => "sh",
                StoreOp::Word => "sw",
                StoreOp::Double => "sd",
            }
            .to_string(),
            OpCode::IntImm(IntOp::SetLessThanUnsigned) => "sltiu".to_string(),
            OpCode::IntImm(op) => format!("{}i", int_mnemonic(op)),
            OpCode::IntImmWord(op) => format!("{}iw", int_mnemonic(op)),
            OpCode::Int(op) => int_mnemonic(op).to_string(),
            OpCode::IntWord(op) => format!("{}w", int_mnemonic(op)),
            OpCode::Mul(op) => mul_mnemonic(op).to_string(),
            OpCode::MulWord(op) => format!("{}w", mul_mnemonic(op)),
            OpCode::LoadReserved(w) => format!("lr.{}", width(w)),
            OpCode::StoreConditional(w) => format!("sc.{}", width(w)),
            OpCode::Amo(op, w) => {
                let op = match op {
                    AmoOp::Swap => "swap",
                    AmoOp::Add => "add",
                    AmoOp::Xor => "xor",
                    AmoOp::And => "and",
                    AmoOp::Or => "or",
                    AmoOp::Min => "min",
                    AmoOp::Max => "max",
                    AmoOp::MinUnsigned => "minu",
                    AmoOp::MaxUnsigned => "maxu",
                };
                format!("amo{op}.{}", width(w))
            }
            OpCode::Csr(op) => match op {
                CsrOp::ReadWrite => "csrrw",
                CsrOp::ReadSet => "csrrs",
                CsrOp::ReadClear => "csrrc",
                CsrOp::ReadWriteImm => "csrrwi",
                CsrOp::ReadSetImm => "csrrsi",
                CsrOp::ReadClearImm => "csrrci",
            }
            .to_string(),
            OpCode::FloatLoad(p) => match p {
                Precision::Single => "flw",
                Precision::Double => "fld",
            }
            .to_string(),
            OpCode::FloatStore(p) => match p {
                Precision::Single => "fsw",
                Precision::Double => "fsd",
            }
            .to_string(),
            OpCode::Float(op, p) => {
                let s = suffix(p);
                let other = match p {
                    Precision::Single => "d",
                    Precision::Double => "s",
                };
                match op {
                    FloatOp::MulAdd => format!("fmadd.{s}"),
                    FloatOp::MulSub => format!("fmsub.{s}"),
                    FloatOp::NegMulSub => format!("fnmsub.{s}"),
                    FloatOp::NegMulAdd => format!("fnmadd.{s}"),
                    FloatOp::Add => format!("fadd.{s}"),
                    FloatOp::Sub => format!("fsub.{s}"),
                    FloatOp::Mul => format!("fmul.{s}"),
                    FloatOp::Div => format!("fdiv.{s}"),
                    FloatOp::Sqrt => format!("fsqrt.{s}"),
                    FloatOp::SignInject => format!("fsgnj.{s}"),
                    FloatOp::SignInjectNeg => format!("fsgnjn.{s}"),
                    FloatOp::SignInjectXor => format!("fsgnjx.{s}"),
                    FloatOp::Min => format!("fmin.{s}"),
                    FloatOp::Max => format!("fmax.{s}"),
                    FloatOp::Convert => format!("fcvt.{s}.{other}"),
                    FloatOp::ToInt(f) => format!("fcvt.{}.{s}", int_format(f)),
                    FloatOp::FromInt(f) => format!("fcvt.{s}.{}", int_format(f)),
                    FloatOp::MoveToInt => match p {
                        Precision::Single => "fmv.x.w".to_string(),
                        Precision::Double => "fmv.x.d".to_string(),
                    },
                    FloatOp::MoveFromInt => match p {
                        Precision::Single => "fmv.w.x".to_string(),
                        Precision::Double => "fmv.d.x".to_string(),
                    },
                    FloatOp::Eq => format!("feq.{s}"),
                    FloatOp::Lt => format!("flt.{s}"),
                    FloatOp::Le => format!("fle.{s}"),
                    FloatOp::Class => format!("fclass.{s}"),
                }
            }
            OpCode::Fence => "fence".to_string(),
            OpCode::FenceI => "fence.i".to_string(),
            OpCode::Ecall => "ecall".to_string(),
            OpCode::Ebreak => "ebreak".to_string(),
        }
    }
}

fn int_mnemonic(op: &IntOp) -> &'static str {
    match op {
        IntOp::Add => "add",
        IntOp::Sub => "sub",
        IntOp::ShiftLeft => "sll",
        IntOp::SetLessThan => "slt",
        IntOp::SetLessThanUnsigned => "sltu",
        IntOp::Xor => "xor",
        IntOp::ShiftRightLogical => "srl",
        IntOp::ShiftRightArithmetic => "sra",
        IntOp::Or => "or",
        IntOp::And => "and",
    }
}

fn mul_mnemonic(op: &MulOp) -> &'static str {
    match op {
        MulOp::Mul => "mul",
        MulOp::MulHigh => "mulh",
        MulOp::MulHighSignedUnsigned => "mulhsu",
        MulOp::MulHighUnsigned => "mulhu",
        MulOp::Div => "div",
        MulOp::DivUnsigned => "divu",
        MulOp::Rem => "rem",
        MulOp::RemUnsigned => "remu",
    }
}
