//! Decoding of the RISC-V RV64GC instruction set.
//!
//! Raw instruction bits are decoded into an [Instruction], a flat value holding an [OpCode] and
//! the operands of every instruction format. Compressed (16-bit) instructions are expanded into
//! the [Instruction] of their 32-bit equivalent with a length of 2, so consumers only ever handle
//! one representation.
//!
//! Illegal or unsupported encodings are reported as [Error::IllegalInstruction]. It is up to the
//! consumer to decide when that error becomes a trap.

pub mod abi;
mod compressed;
mod decode;
mod instruction;
mod opcodes;

pub use decode::*;
pub use instruction::*;
pub use opcodes::*;
