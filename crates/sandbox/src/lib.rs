//! A sandboxed RISC-V (RV64GC) virtual machine for running untrusted guest programs inside a host
//! application.
//!
//! ### Machine
//!
//! [machine::Machine] is the embedding interface. It loads a statically linked ELF executable,
//! runs it or calls its functions, and exposes guest memory to the host. Every guest memory access
//! is checked against the region table of [mem::Memory], so a guest can never reach host memory.
//!
//! ### Execution
//!
//! The [processor::Processor] interprets instructions decoded by `rvisa`, either one at a time or
//! as cached blocks with pre-resolved handlers. Hot or whole-program blocks may be compiled to
//! native code by the [translate] module, which falls back to interpretation whenever compilation
//! is unavailable.
//!
//! ### System calls
//!
//! `ecall` traps into the emulated Linux [kernel], which implements a minimal libc interface,
//! socket pairs, signals, cooperative threads and a native heap without touching host resources.
//! Hosts may override any system call with their own handler.

/// Decoded block cache.
pub mod cache;

/// Execution of individual instructions on a hart.
pub mod emulator;

/// Emulated Linux system calls.
pub mod kernel;

/// ELF loading and process startup.
pub mod loader;

/// The embedding interface.
pub mod machine;

/// Guest address space.
pub mod mem;

/// Execution of one guest function on several host threads.
pub mod multiprocess;

/// The dispatch loop.
pub mod processor;

/// Program counter sampling.
pub mod profiling;

pub mod registers;

/// Machine state serialization.
pub mod snapshot;

/// Translation of guest blocks to native code.
pub mod translate;

pub use machine::{Machine, MachineOptions, Outcome, Statistics, SyscallHandler, SyscallResult};

#[cfg(test)]
mod tests;
