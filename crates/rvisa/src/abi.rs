//! Register numbering of the standard RISC-V calling convention.

pub const ZERO: u8 = 0;
pub const RA: u8 = 1;
pub const SP: u8 = 2;
pub const GP: u8 = 3;
pub const TP: u8 = 4;
pub const T0: u8 = 5;
pub const T1: u8 = 6;
pub const T2: u8 = 7;
pub const S0: u8 = 8;
pub const S1: u8 = 9;
pub const A0: u8 = 10;
pub const A1: u8 = 11;
pub const A2: u8 = 12;
pub const A3: u8 = 13;
pub const A4: u8 = 14;
pub const A5: u8 = 15;
pub const A6: u8 = 16;
pub const A7: u8 = 17;

/// First floating-point argument register, `fa0`.
pub const FA0: u8 = 10;

/// Number of argument registers in each register file.
pub const ARGUMENT_REGISTERS: usize = 8;

const INTEGER_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

const FLOAT_NAMES: [&str; 32] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

/// ABI name of an integer register, e.g. `a0`.
pub fn register_name(register: u8) -> &'static str {
    INTEGER_NAMES[usize::from(register & 31)]
}

/// ABI name of a floating-point register, e.g. `fa0`.
pub fn float_register_name(register: u8) -> &'static str {
    FLOAT_NAMES[usize::from(register & 31)]
}

/// Integer register number for an ABI name or an `xN` name.
pub fn register_from_name(name: impl AsRef<str>) -> Option<u8> {
    let name = name.as_ref();
    if name == "fp" {
        return Some(S0);
    }

    if let Some(index) = INTEGER_NAMES.iter().position(|&n| n == name) {
        return u8::try_from(index).ok();
    }

    name.strip_prefix('x')
        .and_then(|n| n.parse::<u8>().ok())
        .filter(|&n| n < 32)
}
