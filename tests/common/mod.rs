pub mod asm;
pub mod elf;

use riscv_sandbox::kernel::Syscall;
use riscv_sandbox::{Machine, MachineOptions};
use rvisa::abi::*;

use asm::Assembler;
use elf::{Image, TEXT};

/// Host system call number the `store` function reports through.
pub const SYS_REPORT: u64 = 500;

pub const CLONE_VM: i64 = 0x100;
pub const CLONE_THREAD: i64 = 0x10000;

pub const FUTEX_WAIT: i64 = 0;
pub const FUTEX_WAKE: i64 = 1;

pub fn initialize_logger() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn syscall(number: Syscall) -> u64 {
    number as u64
}

/// The guest library most tests run. Every routine follows the standard calling convention and
/// is exported by name.
pub fn library(mut image: Image) -> Vec<u8> {
    let greeting = image.object("greeting", b"hello\n") as i64;
    let counter = image.object("counter", &[0; 8]) as i64;
    let digits = image.object("digits", b"0123456789") as i64;

    let mut code = Assembler::new(TEXT);

    // Writes the greeting and exits
    code.function("_start")
        .li(A0, 1)
        .li(A1, greeting)
        .li(A2, 6)
        .syscall(syscall(Syscall::Write))
        .li(A0, 0)
        .syscall(syscall(Syscall::Exit));

    code.function("add").add(A0, A0, A1).ret();

    // Sum of the `a1` 64-bit values at `a0`
    code.function("sum")
        .li(A2, 0)
        .label("sum_loop")
        .beq(A1, ZERO, "sum_done")
        .ld(A3, A0, 0)
        .add(A2, A2, A3)
        .addi(A0, A0, 8)
        .addi(A1, A1, -1)
        .j("sum_loop")
        .label("sum_done")
        .mv(A0, A2)
        .ret();

    // An arithmetic mix over 1..=a0
    code.function("checksum")
        .li(A1, 0)
        .li(A2, 1)
        .label("checksum_loop")
        .bltu(A0, A2, "checksum_done")
        .mul(A3, A2, A2)
        .xor(A1, A1, A3)
        .slli(A4, A1, 3)
        .add(A1, A1, A4)
        .remu(A5, A1, A2)
        .add(A1, A1, A5)
        .addi(A2, A2, 1)
        .j("checksum_loop")
        .label("checksum_done")
        .mv(A0, A1)
        .ret();

    // Stores a1 at a0 and reports a0 to the host
    code.function("store")
        .sd(A1, A0, 0)
        .syscall(SYS_REPORT)
        .ret();

    code.function("counter_next")
        .li(A1, counter)
        .ld(A0, A1, 0)
        .addi(A0, A0, 1)
        .sd(A0, A1, 0)
        .ret();

    code.function("spin").label("spin_loop").j("spin_loop");

    code.function("poke").sd(A1, A0, 0).ret();
    code.function("peek").ld(A0, A0, 0).ret();
    code.function("divide").divu(A0, A0, A1).ret();
    code.function("illegal").word(0).ret();
    code.function("trap").ebreak().ret();

    // rt_sigaction(a0, a1, NULL)
    code.function("install_handler")
        .li(A2, 0)
        .syscall(syscall(Syscall::RtSigaction))
        .ret();

    // tkill(main thread, a0)
    code.function("raise")
        .mv(A1, A0)
        .li(A0, 1)
        .syscall(syscall(Syscall::Tkill))
        .ret();

    code.function("on_signal")
        .li(A1, counter)
        .ld(A2, A1, 0)
        .add(A2, A2, A0)
        .sd(A2, A1, 0)
        .ret();

    code.function("exit_with").syscall(syscall(Syscall::Exit));

    // Starts a thread on the stack at a1 which publishes 99 at a0 + 4, then sets the flag at a0
    // and wakes the caller. The caller sleeps on the flag and returns the published value.
    code.function("handoff")
        .mv(S0, A0)
        .li(A0, CLONE_VM | CLONE_THREAD)
        .li(A2, 0)
        .li(A3, 0)
        .li(A4, 0)
        .syscall(syscall(Syscall::Clone))
        .beq(A0, ZERO, "handoff_child")
        .label("handoff_wait")
        .lw(T0, S0, 0)
        .bne(T0, ZERO, "handoff_done")
        .mv(A0, S0)
        .li(A1, FUTEX_WAIT)
        .li(A2, 0)
        .li(A3, 0)
        .syscall(syscall(Syscall::Futex))
        .j("handoff_wait")
        .label("handoff_done")
        .lw(A0, S0, 4)
        .ret()
        .label("handoff_child")
        .li(T1, 99)
        .sw(T1, S0, 4)
        .li(T1, 1)
        .sw(T1, S0, 0)
        .mv(A0, S0)
        .li(A1, FUTEX_WAKE)
        .li(A2, 1)
        .syscall(syscall(Syscall::Futex))
        .li(A0, 0)
        .syscall(syscall(Syscall::Exit));

    code.function("wait_forever")
        .li(A1, FUTEX_WAIT)
        .li(A2, 0)
        .li(A3, 0)
        .syscall(syscall(Syscall::Futex))
        .ret();

    code.function("malloc")
        .syscall(syscall(Syscall::Malloc))
        .ret();

    // Allocates a0 bytes twice with a free in between and returns the distance of the two
    code.function("heap_reuse")
        .mv(S1, A0)
        .syscall(syscall(Syscall::Malloc))
        .mv(S0, A0)
        .syscall(syscall(Syscall::Free))
        .mv(A0, S1)
        .syscall(syscall(Syscall::Malloc))
        .sub(A0, A0, S0)
        .ret();

    // Worker a0 fills bytes [a0 * a3, (a0 + 1) * a3) of the buffer at a2 with a0 + 1
    code.function("fill")
        .mul(T0, A0, A3)
        .add(T0, T0, A2)
        .add(T1, T0, A3)
        .addi(T2, A0, 1)
        .label("fill_loop")
        .beq(T0, T1, "fill_done")
        .sb(T2, T0, 0)
        .addi(T0, T0, 1)
        .j("fill_loop")
        .label("fill_done")
        .ret();

    // Writes the decimal digit a0 to standard output
    code.function("say_index")
        .mv(T0, A0)
        .li(A1, digits)
        .add(A1, A1, A0)
        .li(A0, 1)
        .li(A2, 1)
        .syscall(syscall(Syscall::Write))
        .mv(A0, T0)
        .ret();

    // Worker a0 stores a3 at a2, then faults on a store to address zero
    code.function("store_then_fault")
        .sd(A3, A2, 0)
        .sd(A3, ZERO, 0)
        .ret();

    // Waits on the futex at a2 for the value 0 with the timeout at a3
    code.function("timed_wait")
        .mv(A0, A2)
        .li(A1, FUTEX_WAIT)
        .li(A2, 0)
        .syscall(syscall(Syscall::Futex))
        .ret();

    code.function("target").li(A0, 1).ret();

    // Calls target, overwrites its first instruction with a0 and calls it again.
    // Returns 10 * first + second.
    code.function("patch")
        .addi(SP, SP, -16)
        .sd(RA, SP, 8)
        .sd(S0, SP, 0)
        .mv(S1, A0)
        .call("target")
        .mv(S0, A0)
        .la(T0, "target")
        .sw(S1, T0, 0)
        .fence_i()
        .call("target")
        .li(T1, 10)
        .mul(S0, S0, T1)
        .add(A0, A0, S0)
        .ld(RA, SP, 8)
        .ld(S0, SP, 0)
        .addi(SP, SP, 16)
        .ret();

    image.build(&code, "_start")
}

/// `addi a0, zero, value`, the replacement instruction for `patch`.
pub fn li_a0(value: i32) -> u32 {
    asm::addi(A0, ZERO, value)
}

/// The guest library with a read-only text segment.
pub fn program() -> Vec<u8> {
    library(Image::new())
}

pub fn machine(options: MachineOptions) -> Machine {
    initialize_logger();
    Machine::from_elf(&program(), options).expect("library loads")
}

/// A `struct sigaction` for `handler`.
pub fn sigaction(handler: u64, flags: u64, mask: u64) -> Vec<u8> {
    [handler, flags, mask, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

pub fn u64_at(machine: &Machine, address: u64) -> u64 {
    let bytes = machine.read_memory(address, 8).expect("readable");
    u64::from_le_bytes(bytes.try_into().expect("8 bytes"))
}
