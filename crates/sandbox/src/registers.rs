use rvisa::abi::{float_register_name, register_name};

/// Upper half of a NaN-boxed single-precision value.
const NAN_BOX: u64 = 0xffff_ffff_0000_0000;

/// The canonical quiet NaN of single precision.
pub const CANONICAL_NAN_F32: u32 = 0x7fc0_0000;

/// The canonical quiet NaN of double precision.
pub const CANONICAL_NAN_F64: u64 = 0x7ff8_0000_0000_0000;

/// Accrued exception flags of `fflags`.
pub mod flags {
    pub const INEXACT: u32 = 0x01;
    pub const UNDERFLOW: u32 = 0x02;
    pub const OVERFLOW: u32 = 0x04;
    pub const DIVIDE_BY_ZERO: u32 = 0x08;
    pub const INVALID: u32 = 0x10;
}

/// The architectural register file of one hart.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    /// Integer registers. `x[0]` is always zero.
    pub x: [u64; 32],

    /// Raw bits of the floating-point registers. Single-precision values are NaN-boxed.
    pub f: [u64; 32],

    pub pc: u64,

    /// Rounding mode in bits 7:5 and accrued exception flags in bits 4:0.
    pub fcsr: u32,
}

impl Registers {
    pub fn get(&self, register: u8) -> u64 {
        self.x[usize::from(register & 31)]
    }

    /// Write an integer register. Writes to `x0` are discarded.
    pub fn set(&mut self, register: u8, value: u64) {
        if register != 0 {
            self.x[usize::from(register & 31)] = value;
        }
    }

    pub fn get_f64(&self, register: u8) -> f64 {
        f64::from_bits(self.f[usize::from(register & 31)])
    }

    pub fn set_f64(&mut self, register: u8, value: f64) {
        self.f[usize::from(register & 31)] = value.to_bits();
    }

    /// Read a single-precision value. A value which is not properly NaN-boxed reads as the
    /// canonical NaN.
    pub fn get_f32(&self, register: u8) -> f32 {
        let bits = self.f[usize::from(register & 31)];
        if bits & NAN_BOX == NAN_BOX {
            f32::from_bits(bits as u32)
        } else {
            f32::from_bits(CANONICAL_NAN_F32)
        }
    }

    pub fn set_f32(&mut self, register: u8, value: f32) {
        self.f[usize::from(register & 31)] = NAN_BOX | u64::from(value.to_bits());
    }

    pub fn fflags(&self) -> u32 {
        self.fcsr & 0x1f
    }

    pub fn frm(&self) -> u32 {
        (self.fcsr >> 5) & 0x7
    }

    pub fn set_fcsr(&mut self, value: u32) {
        self.fcsr = value & 0xff;
    }

    pub fn accrue(&mut self, exceptions: u32) {
        self.fcsr |= exceptions & 0x1f;
    }

    /// Set the registers used to pass integer arguments and the return address of a call.
    pub fn set_call(&mut self, address: u64, return_address: u64, args: &[u64]) {
        for (register, &arg) in (rvisa::abi::A0..).zip(args) {
            self.set(register, arg);
        }
        self.set(rvisa::abi::RA, return_address);
        self.pc = address;
    }
}

impl std::fmt::Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "pc   {pc:#018x}", pc = self.pc)?;
        for row in 0..8u8 {
            for column in 0..4u8 {
                let register = row * 4 + column;
                write!(
                    f,
                    "{name:>4} {value:#018x}  ",
                    name = register_name(register),
                    value = self.get(register)
                )?;
            }
            writeln!(f)?;
        }

        for register in (0..32u8).filter(|&r| self.f[usize::from(r)] != 0) {
            writeln!(
                f,
                "{name:>4} {value:#018x}",
                name = float_register_name(register),
                value = self.f[usize::from(register)]
            )?;
        }

        write!(f, "fcsr {fcsr:#04x}", fcsr = self.fcsr)
    }
}
