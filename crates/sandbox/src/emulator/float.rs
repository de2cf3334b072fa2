//! Floating-point instructions of the F and D extensions.
//!
//! Arithmetic is performed by the host in round-to-nearest-even. Exception flags are derived from
//! the operands and an error-free transformation of the result. Conversions to and from integers
//! honor the instruction's rounding mode.

use std::ops::{Add, Div, Mul, Neg, Sub};

use rvisa::{FloatOp, Instruction, IntFormat, Precision, ROUNDING_MODE_DYNAMIC};

use super::{Error, Hart, Result};
use crate::registers::{flags, Registers, CANONICAL_NAN_F32, CANONICAL_NAN_F64};

/// Rounding modes of the `rm` field and `frm` register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RoundingMode {
    NearestEven,
    TowardZero,
    Down,
    Up,
    NearestMaxMagnitude,
}

impl RoundingMode {
    fn resolve(regs: &Registers, rm: u8) -> Result<Self> {
        let rm = if rm == ROUNDING_MODE_DYNAMIC {
            regs.frm() as u8
        } else {
            rm
        };

        match rm {
            0 => Ok(Self::NearestEven),
            1 => Ok(Self::TowardZero),
            2 => Ok(Self::Down),
            3 => Ok(Self::Up),
            4 => Ok(Self::NearestMaxMagnitude),
            rm => Err(Error::InvalidRoundingMode { rm }),
        }
    }

    fn round(self, value: f64) -> f64 {
        match self {
            Self::NearestEven => value.round_ties_even(),
            Self::TowardZero => value.trunc(),
            Self::Down => value.floor(),
            Self::Up => value.ceil(),
            Self::NearestMaxMagnitude => value.round(),
        }
    }
}

trait Float:
    Copy
    + PartialEq
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    const ZERO: Self;
    const BITS: u32;
    const SIGN_BIT: u64;
    const CANONICAL_NAN: u64;
    const QUIET_BIT: u64;

    fn load(regs: &Registers, register: u8) -> Self;
    fn store(regs: &mut Registers, register: u8, value: Self);
    fn bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
    fn mul_add(self, a: Self, b: Self) -> Self;
    fn sqrt(self) -> Self;
    fn is_nan(self) -> bool;
    fn is_infinite(self) -> bool;
    fn is_finite(self) -> bool;
    fn is_subnormal(self) -> bool;
    fn from_i64(value: i64) -> Self;
    fn from_u64(value: u64) -> Self;
    fn widen(self) -> f64;

    fn is_signaling(self) -> bool {
        self.is_nan() && self.bits() & Self::QUIET_BIT == 0
    }

    fn is_sign_negative(self) -> bool {
        self.bits() & Self::SIGN_BIT != 0
    }

    fn canonical_nan() -> Self {
        Self::from_bits(Self::CANONICAL_NAN)
    }

    /// Tiny results lie strictly between the smallest normal numbers.
    fn is_tiny(self) -> bool {
        self.is_subnormal() || self == Self::ZERO
    }

    /// The adjacent value toward zero. `self` must be finite and nonzero.
    fn step_toward_zero(self) -> Self {
        Self::from_bits(self.bits() - 1)
    }

    /// The adjacent value away from zero. `self` must be finite.
    fn step_away_from_zero(self) -> Self {
        Self::from_bits(self.bits() + 1)
    }
}

impl Float for f32 {
    const ZERO: Self = 0.0;
    const BITS: u32 = 32;
    const SIGN_BIT: u64 = 0x8000_0000;
    const CANONICAL_NAN: u64 = CANONICAL_NAN_F32 as u64;
    const QUIET_BIT: u64 = 0x0040_0000;

    fn load(regs: &Registers, register: u8) -> Self {
        regs.get_f32(register)
    }

    fn store(regs: &mut Registers, register: u8, value: Self) {
        regs.set_f32(register, value)
    }

    fn bits(self) -> u64 {
        u64::from(self.to_bits())
    }

    fn from_bits(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        f32::mul_add(self, a, b)
    }

    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }

    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }

    fn is_infinite(self) -> bool {
        f32::is_infinite(self)
    }

    fn is_finite(self) -> bool {
        f32::is_finite(self)
    }

    fn is_subnormal(self) -> bool {
        f32::is_subnormal(self)
    }

    fn from_i64(value: i64) -> Self {
        value as f32
    }

    fn from_u64(value: u64) -> Self {
        value as f32
    }

    fn widen(self) -> f64 {
        f64::from(self)
    }
}

impl Float for f64 {
    const ZERO: Self = 0.0;
    const BITS: u32 = 64;
    const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
    const CANONICAL_NAN: u64 = CANONICAL_NAN_F64;
    const QUIET_BIT: u64 = 0x0008_0000_0000_0000;

    fn load(regs: &Registers, register: u8) -> Self {
        regs.get_f64(register)
    }

    fn store(regs: &mut Registers, register: u8, value: Self) {
        regs.set_f64(register, value)
    }

    fn bits(self) -> u64 {
        self.to_bits()
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        f64::mul_add(self, a, b)
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }

    fn is_infinite(self) -> bool {
        f64::is_infinite(self)
    }

    fn is_finite(self) -> bool {
        f64::is_finite(self)
    }

    fn is_subnormal(self) -> bool {
        f64::is_subnormal(self)
    }

    fn from_i64(value: i64) -> Self {
        value as f64
    }

    fn from_u64(value: u64) -> Self {
        value as f64
    }

    fn widen(self) -> f64 {
        self
    }
}

/// Replace any NaN with the canonical NaN.
fn canonicalize<F: Float>(value: F) -> F {
    if value.is_nan() {
        F::canonical_nan()
    } else {
        value
    }
}

/// Flags raised by an arithmetic result given the rounding error of the operation.
fn result_flags<F: Float>(result: F, inputs_finite: bool, inexact: bool) -> u32 {
    let mut raised = 0;
    if result.is_infinite() && inputs_finite {
        raised |= flags::OVERFLOW | flags::INEXACT;
    } else if inexact {
        raised |= flags::INEXACT;
        if result.is_tiny() {
            raised |= flags::UNDERFLOW;
        }
    }
    raised
}

fn signaling_flags<F: Float>(operands: &[F]) -> u32 {
    if operands.iter().any(|v| v.is_signaling()) {
        flags::INVALID
    } else {
        0
    }
}

/// Compute a two-operand arithmetic operation and its exception flags.
fn arithmetic<F: Float>(op: FloatOp, a: F, b: F) -> (F, u32) {
    let nan_input = a.is_nan() || b.is_nan();
    let finite = a.is_finite() && b.is_finite();
    let (result, inexact, mut raised) = match op {
        FloatOp::Add | FloatOp::Sub => {
            let b = if op == FloatOp::Sub { -b } else { b };
            let sum = a + b;
            // Error of the rounded sum
            let b_virtual = sum - a;
            let error = (a - (sum - b_virtual)) + (b - b_virtual);
            (sum, sum.is_finite() && error != F::ZERO, 0)
        }
        FloatOp::Mul => {
            let product = a * b;
            let error = a.mul_add(b, -product);
            (product, product.is_finite() && error != F::ZERO, 0)
        }
        FloatOp::Div => {
            let quotient = a / b;
            let remainder = (-quotient).mul_add(b, a);
            let divide_by_zero = b == F::ZERO && a.is_finite() && a != F::ZERO;
            let raised = if divide_by_zero {
                flags::DIVIDE_BY_ZERO
            } else {
                0
            };
            (
                quotient,
                quotient.is_finite() && quotient != F::ZERO && remainder != F::ZERO,
                raised,
            )
        }
        _ => (F::canonical_nan(), false, 0),
    };

    raised |= signaling_flags(&[a, b]);
    if result.is_nan() && !nan_input {
        raised |= flags::INVALID;
    }

    if raised & flags::DIVIDE_BY_ZERO == 0 {
        raised |= result_flags(result, finite, inexact);
    }

    (canonicalize(result), raised)
}

fn fused<F: Float>(op: FloatOp, a: F, b: F, c: F) -> (F, u32) {
    let mut raised = signaling_flags(&[a, b, c]);
    let zero_times_infinity = (a.is_infinite() && b == F::ZERO) || (b.is_infinite() && a == F::ZERO);
    if zero_times_infinity {
        raised |= flags::INVALID;
    }

    let result = match op {
        FloatOp::MulAdd => a.mul_add(b, c),
        FloatOp::MulSub => a.mul_add(b, -c),
        FloatOp::NegMulSub => (-a).mul_add(b, c),
        _ => (-a).mul_add(b, -c),
    };

    if result.is_nan() && !(a.is_nan() || b.is_nan() || c.is_nan()) {
        raised |= flags::INVALID;
    }

    if result.is_infinite() && a.is_finite() && b.is_finite() && c.is_finite() {
        raised |= flags::OVERFLOW | flags::INEXACT;
    }

    (canonicalize(result), raised)
}

fn min_max<F: Float>(op: FloatOp, a: F, b: F) -> (F, u32) {
    let raised = signaling_flags(&[a, b]);
    let result = match (a.is_nan(), b.is_nan()) {
        (true, true) => F::canonical_nan(),
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            // -0.0 is less than +0.0
            let a_less = a < b || (a == b && a.is_sign_negative() && !b.is_sign_negative());
            match (op, a_less) {
                (FloatOp::Min, true) | (FloatOp::Max, false) => a,
                _ => b,
            }
        }
    };

    (result, raised)
}

fn sign_inject<F: Float>(op: FloatOp, a: F, b: F) -> F {
    let sign = match op {
        FloatOp::SignInject => b.bits() & F::SIGN_BIT,
        FloatOp::SignInjectNeg => !b.bits() & F::SIGN_BIT,
        _ => (a.bits() ^ b.bits()) & F::SIGN_BIT,
    };
    F::from_bits((a.bits() & !F::SIGN_BIT) | sign)
}

fn compare<F: Float>(op: FloatOp, a: F, b: F) -> (u64, u32) {
    let raised = match op {
        FloatOp::Eq => signaling_flags(&[a, b]),
        _ if a.is_nan() || b.is_nan() => flags::INVALID,
        _ => 0,
    };

    let result = match op {
        FloatOp::Eq => a == b,
        FloatOp::Lt => a < b,
        _ => a <= b,
    };

    (u64::from(result), raised)
}

fn classify<F: Float>(value: F) -> u64 {
    let negative = value.is_sign_negative();
    let bit = if value.is_nan() {
        if value.is_signaling() {
            8
        } else {
            9
        }
    } else if value.is_infinite() {
        if negative {
            0
        } else {
            7
        }
    } else if value == F::ZERO {
        if negative {
            3
        } else {
            4
        }
    } else if value.is_subnormal() {
        if negative {
            2
        } else {
            5
        }
    } else if negative {
        1
    } else {
        6
    };

    1 << bit
}

/// Convert to an integer format, saturating out-of-range values.
fn to_int(value: f64, format: IntFormat, mode: RoundingMode) -> (u64, u32) {
    let (min, max, min_result, max_result): (f64, f64, u64, u64) = match format {
        IntFormat::Word => (
            i32::MIN as f64,
            i32::MAX as f64,
            i32::MIN as i64 as u64,
            i32::MAX as u64,
        ),
        IntFormat::WordUnsigned => (0.0, u32::MAX as f64, 0, u32::MAX as i32 as i64 as u64),
        IntFormat::Long => (
            i64::MIN as f64,
            9.223372036854775807e18,
            i64::MIN as u64,
            i64::MAX as u64,
        ),
        IntFormat::LongUnsigned => (0.0, 1.8446744073709551615e19, 0, u64::MAX),
    };

    if value.is_nan() {
        return (max_result, flags::INVALID);
    }

    let rounded = mode.round(value);
    let in_range = match format {
        // The upper bounds of the 64-bit formats are not representable, compare exclusively
        IntFormat::Long | IntFormat::LongUnsigned => rounded >= min && rounded < max,
        _ => rounded >= min && rounded <= max,
    };

    if !in_range {
        let result = if rounded < min { min_result } else { max_result };
        return (result, flags::INVALID);
    }

    let raised = if rounded != value { flags::INEXACT } else { 0 };
    let result = match format {
        IntFormat::Word => rounded as i32 as i64 as u64,
        IntFormat::WordUnsigned => rounded as u32 as i32 as i64 as u64,
        IntFormat::Long => rounded as i64 as u64,
        IntFormat::LongUnsigned => rounded as u64,
    };

    (result, raised)
}

/// Convert an integer to a float, correcting the host's nearest-even result for the rounding
/// mode.
fn from_int<F: Float>(value: u64, format: IntFormat, mode: RoundingMode) -> (F, u32) {
    let exact: i128 = match format {
        IntFormat::Word => i128::from(value as i32),
        IntFormat::WordUnsigned => i128::from(value as u32),
        IntFormat::Long => i128::from(value as i64),
        IntFormat::LongUnsigned => i128::from(value),
    };

    let mut result = match format {
        IntFormat::LongUnsigned => F::from_u64(value),
        _ => F::from_i64(exact as i64),
    };

    let rounded = result.widen() as i128;
    if rounded == exact {
        return (result, 0);
    }

    let too_large = rounded > exact;
    let negative = exact < 0;
    result = match mode {
        RoundingMode::TowardZero if too_large != negative => result.step_toward_zero(),
        RoundingMode::Down if too_large => {
            if negative {
                result.step_away_from_zero()
            } else {
                result.step_toward_zero()
            }
        }
        RoundingMode::Up if !too_large => {
            if negative {
                result.step_toward_zero()
            } else {
                result.step_away_from_zero()
            }
        }
        _ => result,
    };

    (result, flags::INEXACT)
}

fn execute_precision<F: Float, Other: Float>(
    hart: &mut Hart,
    instruction: &Instruction,
    op: FloatOp,
    narrow: fn(Other) -> F,
) -> Result<()> {
    let regs = &mut hart.regs;
    let a = F::load(regs, instruction.rs1);
    let b = F::load(regs, instruction.rs2);
    let rd = instruction.rd;

    let raised = match op {
        FloatOp::Add | FloatOp::Sub | FloatOp::Mul | FloatOp::Div => {
            let (result, raised) = arithmetic(op, a, b);
            F::store(regs, rd, result);
            raised
        }
        FloatOp::MulAdd | FloatOp::MulSub | FloatOp::NegMulSub | FloatOp::NegMulAdd => {
            let c = F::load(regs, instruction.rs3);
            let (result, raised) = fused(op, a, b, c);
            F::store(regs, rd, result);
            raised
        }
        FloatOp::Sqrt => {
            let result = a.sqrt();
            let mut raised = signaling_flags(&[a]);
            if result.is_nan() && !a.is_nan() {
                raised |= flags::INVALID;
            } else if result.is_finite() && result.mul_add(result, -a) != F::ZERO {
                raised |= flags::INEXACT;
            }
            F::store(regs, rd, canonicalize(result));
            raised
        }
        FloatOp::SignInject | FloatOp::SignInjectNeg | FloatOp::SignInjectXor => {
            F::store(regs, rd, sign_inject(op, a, b));
            0
        }
        FloatOp::Min | FloatOp::Max => {
            let (result, raised) = min_max(op, a, b);
            F::store(regs, rd, result);
            raised
        }
        FloatOp::Convert => {
            let source = Other::load(regs, instruction.rs1);
            let result = narrow(source);
            let mut raised = signaling_flags(&[source]);
            if !source.is_nan() {
                let exact = result.widen() == source.widen();
                raised |= result_flags(result, source.is_finite(), !exact);
            }
            F::store(regs, rd, canonicalize(result));
            raised
        }
        FloatOp::ToInt(format) => {
            let mode = RoundingMode::resolve(regs, instruction.rm)?;
            let (result, raised) = to_int(a.widen(), format, mode);
            regs.set(rd, result);
            raised
        }
        FloatOp::FromInt(format) => {
            let mode = RoundingMode::resolve(regs, instruction.rm)?;
            let (result, raised) = from_int::<F>(regs.get(instruction.rs1), format, mode);
            F::store(regs, rd, result);
            raised
        }
        FloatOp::MoveToInt => {
            let raw = regs.f[usize::from(instruction.rs1 & 31)];
            let value = if F::BITS == 32 {
                raw as u32 as i32 as i64 as u64
            } else {
                raw
            };
            regs.set(rd, value);
            0
        }
        FloatOp::MoveFromInt => {
            F::store(regs, rd, F::from_bits(regs.get(instruction.rs1)));
            0
        }
        FloatOp::Eq | FloatOp::Lt | FloatOp::Le => {
            let (result, raised) = compare(op, a, b);
            regs.set(rd, result);
            raised
        }
        FloatOp::Class => {
            regs.set(rd, classify(a));
            0
        }
    };

    regs.accrue(raised);
    Ok(())
}

pub(super) fn execute(
    hart: &mut Hart,
    instruction: &Instruction,
    op: FloatOp,
    precision: Precision,
) -> Result<()> {
    match precision {
        Precision::Single => {
            execute_precision::<f32, f64>(hart, instruction, op, |value: f64| value as f32)
        }
        Precision::Double => execute_precision::<f64, f32>(hart, instruction, op, f64::from),
    }
}
