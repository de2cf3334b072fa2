use std::sync::{Arc, Mutex};

use rvisa::abi;

use crate::emulator::Hart;
use crate::kernel::*;
use crate::loader::Symbols;
use crate::mem::{self, GuestMemory, Memory, Permissions, PAGE_SIZE};
use crate::processor::SIGRETURN_ADDRESS;
use crate::tests::Result;

const SIGUSR1: u64 = 10;

/// Kernel state with a few writable pages at `data`, driven one system call at a time.
pub struct Guest {
    pub memory: Memory,
    pub hart: Hart,
    pub symbols: Symbols,
    pub kernel: Kernel,
    pub data: u64,
}

impl Guest {
    pub const DATA_LEN: u64 = 16 * PAGE_SIZE;

    pub fn new() -> mem::Result<Self> {
        let mut memory = Memory::new(1 << 24);
        let data = memory.map(0, Self::DATA_LEN, Permissions::READ_WRITE)?;
        let mut hart = Hart::default();
        hart.regs.set(abi::SP, data + Self::DATA_LEN);
        Ok(Self {
            memory,
            hart,
            symbols: Symbols::default(),
            kernel: Kernel::new(7, b"input".to_vec(), None),
            data,
        })
    }

    pub fn call(&mut self, number: u64, args: &[u64]) -> Action {
        let mut frame = SyscallFrame {
            number,
            ..Default::default()
        };
        frame.args[..args.len()].copy_from_slice(args);

        let mut context = Context {
            memory: &mut self.memory,
            hart: &mut self.hart,
            symbols: &self.symbols,
        };
        self.kernel.handle(&mut context, &frame)
    }

    pub fn syscall(&mut self, syscall: Syscall, args: &[u64]) -> Action {
        self.call(syscall as u64, args)
    }

    pub fn read(&self, address: u64, len: usize) -> mem::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.memory.read(address, &mut buf)?;
        Ok(buf)
    }

    pub fn read_u64(&self, address: u64) -> mem::Result<u64> {
        Ok(u64::from_le_bytes(self.memory.load(address)?))
    }
}

fn errno(errno: Errno) -> Action {
    Action::Return(errno.result())
}

#[test]
fn standard_streams() -> Result<()> {
    let mut guest = Guest::new()?;
    let data = guest.data;
    guest.memory.write(data, b"hello")?;

    assert_eq!(guest.syscall(Syscall::Write, &[1, data, 5]), Action::Return(5));
    assert_eq!(guest.syscall(Syscall::Write, &[2, data, 2]), Action::Return(2));
    assert_eq!(guest.kernel.output(), b"hellohe");
    assert_eq!(guest.kernel.take_output(), b"hellohe");
    assert!(guest.kernel.output().is_empty());

    assert_eq!(guest.syscall(Syscall::Read, &[0, data, 3]), Action::Return(3));
    assert_eq!(guest.read(data, 5)?, b"inplo");
    assert_eq!(guest.syscall(Syscall::Read, &[0, data, 100]), Action::Return(2));
    assert_eq!(guest.syscall(Syscall::Read, &[0, data, 100]), Action::Return(0));

    assert_eq!(guest.syscall(Syscall::Write, &[0, data, 1]), errno(Errno::Ebadf));
    assert_eq!(guest.syscall(Syscall::Write, &[7, data, 1]), errno(Errno::Ebadf));
    Ok(())
}

#[test]
fn printer_receives_output() -> Result<()> {
    let mut guest = Guest::new()?;
    let printed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&printed);
    let printer: Printer = Arc::new(move |fd: u32, bytes: &[u8]| {
        sink.lock().expect("poisoned").push((fd, bytes.to_vec()));
    });
    guest.kernel.set_printer(Some(printer));

    let data = guest.data;
    guest.memory.write(data, b"out")?;
    guest.syscall(Syscall::Write, &[2, data, 3]);

    assert!(guest.kernel.output().is_empty());
    assert_eq!(*printed.lock().expect("poisoned"), vec![(2, b"out".to_vec())]);
    Ok(())
}

#[test]
fn bad_pointers_return_efault() -> Result<()> {
    let mut guest = Guest::new()?;
    assert_eq!(guest.syscall(Syscall::Write, &[1, 0x10, 4]), errno(Errno::Efault));
    assert_eq!(guest.syscall(Syscall::Read, &[0, 0x10, 4]), errno(Errno::Efault));
    assert_eq!(
        guest.syscall(Syscall::ClockGettime, &[0, 0x10]),
        errno(Errno::Efault)
    );
    Ok(())
}

#[test]
fn unknown_syscalls() -> Result<()> {
    let mut guest = Guest::new()?;
    assert_eq!(guest.call(4242, &[]), errno(Errno::Enosys));
    assert_eq!(guest.call(489, &[]), errno(Errno::Enosys));

    // No native heap configured
    assert_eq!(guest.syscall(Syscall::Malloc, &[16]), errno(Errno::Enosys));
    assert_eq!(guest.syscall(Syscall::Openat, &[0, 0, 0]), errno(Errno::Enoent));
    Ok(())
}

#[test]
fn identity() -> Result<()> {
    let mut guest = Guest::new()?;
    assert_eq!(guest.syscall(Syscall::Getpid, &[]), Action::Return(PID));
    assert_eq!(guest.syscall(Syscall::Gettid, &[]), Action::Return(PID));
    assert_eq!(guest.syscall(Syscall::Getuid, &[]), Action::Return(0));

    let data = guest.data;
    assert_eq!(guest.syscall(Syscall::Uname, &[data]), Action::Return(0));
    assert_eq!(guest.read(data, 5)?, b"Linux");
    assert_eq!(guest.read(data + 4 * 65, 8)?, b"riscv64\0");
    Ok(())
}

#[test]
fn clocks_follow_retired_instructions() -> Result<()> {
    let mut guest = Guest::new()?;
    let data = guest.data;
    guest.hart.instret = 1_500;

    assert_eq!(guest.syscall(Syscall::ClockGettime, &[1, data]), Action::Return(0));
    assert_eq!(guest.read_u64(data)?, 0);
    assert_eq!(guest.read_u64(data + 8)?, 1_500 * NANOS_PER_INSTRUCTION);

    assert_eq!(guest.syscall(Syscall::ClockGettime, &[0, data]), Action::Return(0));
    assert_eq!(guest.read_u64(data)?, EPOCH_SECONDS);

    // Sleeping advances the clock without running
    guest.memory.write(data, &2u64.to_le_bytes())?;
    guest.memory.write(data + 8, &0u64.to_le_bytes())?;
    assert_eq!(guest.syscall(Syscall::Nanosleep, &[data, 0]), Action::Return(0));
    guest.syscall(Syscall::ClockGettime, &[1, data]);
    assert_eq!(guest.read_u64(data)?, 2);
    Ok(())
}

#[test]
fn random_bytes_depend_only_on_the_seed() -> Result<()> {
    let mut first = Guest::new()?;
    let mut second = Guest::new()?;
    let (a, b) = (first.data, second.data);

    assert_eq!(first.syscall(Syscall::Getrandom, &[a, 32, 0]), Action::Return(32));
    assert_eq!(second.syscall(Syscall::Getrandom, &[b, 32, 0]), Action::Return(32));
    assert_eq!(first.read(a, 32)?, second.read(b, 32)?);
    assert_ne!(first.read(a, 32)?, vec![0u8; 32]);
    Ok(())
}

#[test]
fn anonymous_mappings() -> Result<()> {
    let mut guest = Guest::new()?;
    const PROT_READ_WRITE: u64 = 3;
    const MAP_PRIVATE_ANONYMOUS: u64 = 0x22;

    let Action::Return(address) = guest.syscall(
        Syscall::Mmap,
        &[0, 3 * PAGE_SIZE, PROT_READ_WRITE, MAP_PRIVATE_ANONYMOUS, u64::MAX, 0],
    ) else {
        panic!("mmap did not return");
    };
    assert_eq!(address, guest.data + Guest::DATA_LEN);
    guest.memory.write(address, &[1; 16])?;

    // File mappings are refused
    assert_eq!(
        guest.syscall(Syscall::Mmap, &[0, PAGE_SIZE, PROT_READ_WRITE, 0x2, 3, 0]),
        errno(Errno::Enodev)
    );

    assert_eq!(
        guest.syscall(Syscall::Mprotect, &[address, PAGE_SIZE, 1]),
        Action::Return(0)
    );
    assert!(guest.memory.write(address, &[2]).is_err());

    assert_eq!(
        guest.syscall(Syscall::Munmap, &[address + PAGE_SIZE, PAGE_SIZE]),
        Action::Return(0)
    );
    assert!(guest.memory.region(address + PAGE_SIZE).is_none());
    assert!(guest.memory.region(address + 2 * PAGE_SIZE).is_some());
    Ok(())
}

#[test]
fn program_break() -> Result<()> {
    let mut guest = Guest::new()?;
    let start = guest.data;
    guest.kernel.brk = Brk::new(start, 4 * PAGE_SIZE);

    assert_eq!(guest.syscall(Syscall::Brk, &[0]), Action::Return(start));
    assert_eq!(
        guest.syscall(Syscall::Brk, &[start + 5000]),
        Action::Return(start + 5000)
    );
    assert_eq!(guest.kernel.brk().current, start + 5000);

    // Beyond the reserved range the break stays put
    assert_eq!(
        guest.syscall(Syscall::Brk, &[start + 5 * PAGE_SIZE]),
        Action::Return(start + 5000)
    );

    // Shrinking discards the released pages
    guest.memory.write(start + PAGE_SIZE + 8, &[9])?;
    guest.syscall(Syscall::Brk, &[start + 16]);
    guest.syscall(Syscall::Brk, &[start + 2 * PAGE_SIZE]);
    assert_eq!(guest.read(start + PAGE_SIZE + 8, 1)?, [0]);
    Ok(())
}

#[test]
fn socket_pairs() -> Result<()> {
    let mut guest = Guest::new()?;
    let data = guest.data;
    const AF_UNIX: u64 = 1;
    const SOCK_STREAM: u64 = 1;

    assert_eq!(
        guest.syscall(Syscall::Socketpair, &[AF_UNIX, SOCK_STREAM, 0, data]),
        Action::Return(0)
    );
    let fds = guest.read(data, 8)?;
    let first = u64::from(u32::from_le_bytes([fds[0], fds[1], fds[2], fds[3]]));
    let second = u64::from(u32::from_le_bytes([fds[4], fds[5], fds[6], fds[7]]));
    assert_eq!((first, second), (3, 4));

    let buf = data + 64;
    assert_eq!(
        guest.syscall(Syscall::Recvfrom, &[second, buf, 16, 0, 0, 0]),
        errno(Errno::Eagain)
    );

    guest.memory.write(buf, b"ping")?;
    assert_eq!(
        guest.syscall(Syscall::Sendto, &[first, buf, 4, 0, 0, 0]),
        Action::Return(4)
    );
    // Reading through the generic read path
    assert_eq!(
        guest.syscall(Syscall::Read, &[second, buf + 16, 16]),
        Action::Return(4)
    );
    assert_eq!(guest.read(buf + 16, 4)?, b"ping");

    assert_eq!(guest.syscall(Syscall::Close, &[first]), Action::Return(0));
    assert_eq!(
        guest.syscall(Syscall::Recvfrom, &[second, buf, 16, 0, 0, 0]),
        Action::Return(0)
    );
    assert_eq!(
        guest.syscall(Syscall::Sendto, &[second, buf, 4, 0, 0, 0]),
        errno(Errno::Epipe)
    );
    assert_eq!(guest.syscall(Syscall::Close, &[first]), errno(Errno::Ebadf));

    // No network sockets
    assert_eq!(
        guest.syscall(Syscall::Socket, &[2, SOCK_STREAM, 0]),
        errno(Errno::Eacces)
    );
    assert_eq!(
        guest.syscall(Syscall::Socketpair, &[2, SOCK_STREAM, 0, data]),
        errno(Errno::Eafnosupport)
    );
    Ok(())
}

/// Register `handler` for `signal` with a `struct sigaction` written at the start of the data
/// pages.
fn sigaction(guest: &mut Guest, signal: u64, handler: u64, flags: u64) -> Result<()> {
    let act = guest.data;
    guest.memory.write(act, &handler.to_le_bytes())?;
    guest.memory.write(act + 8, &flags.to_le_bytes())?;
    guest.memory.write(act + 16, &0u64.to_le_bytes())?;
    assert_eq!(
        guest.syscall(Syscall::RtSigaction, &[signal, act, 0, 8]),
        Action::Return(0)
    );
    Ok(())
}

#[test]
fn signal_handlers_run_and_return() -> Result<()> {
    let mut guest = Guest::new()?;
    sigaction(&mut guest, SIGUSR1, 0x5000, 0)?;
    guest.hart.regs.pc = 0x1234;
    guest.hart.regs.set(abi::S0, 77);
    let sp = guest.hart.regs.get(abi::SP);

    assert_eq!(guest.syscall(Syscall::Tkill, &[PID, SIGUSR1]), Action::Resume);
    let regs = &guest.hart.regs;
    assert_eq!(regs.pc, 0x5000);
    assert_eq!(regs.get(abi::A0), SIGUSR1);
    assert_eq!(regs.get(abi::RA), SIGRETURN_ADDRESS);
    assert!(regs.get(abi::SP) < sp);
    assert!(guest.kernel.signals().is_blocked(SIGUSR1 as u32));

    guest.hart.regs.set(abi::S0, 1);
    assert_eq!(guest.syscall(Syscall::RtSigreturn, &[]), Action::Resume);
    let regs = &guest.hart.regs;
    assert_eq!(regs.pc, 0x1234);
    assert_eq!(regs.get(abi::S0), 77);
    assert_eq!(regs.get(abi::A0), 0, "tkill returns zero to the interrupted code");
    assert!(!guest.kernel.signals().is_blocked(SIGUSR1 as u32));

    // Nothing left to return from
    assert_eq!(guest.syscall(Syscall::RtSigreturn, &[]), errno(Errno::Einval));
    Ok(())
}

#[test]
fn blocked_signals_stay_pending() -> Result<()> {
    let mut guest = Guest::new()?;
    sigaction(&mut guest, SIGUSR1, 0x5000, 0)?;
    guest.hart.regs.pc = 0x1234;

    let set = guest.data + 64;
    guest.memory.write(set, &(1u64 << (SIGUSR1 - 1)).to_le_bytes())?;
    const SIG_BLOCK: u64 = 0;
    const SIG_UNBLOCK: u64 = 1;
    assert_eq!(
        guest.syscall(Syscall::RtSigprocmask, &[SIG_BLOCK, set, 0, 8]),
        Action::Resume
    );

    assert_eq!(guest.syscall(Syscall::Tkill, &[PID, SIGUSR1]), Action::Return(0));
    assert_eq!(guest.hart.regs.pc, 0x1234);

    assert_eq!(
        guest.syscall(Syscall::RtSigprocmask, &[SIG_UNBLOCK, set, 0, 8]),
        Action::Resume
    );
    assert_eq!(guest.hart.regs.pc, 0x5000);
    Ok(())
}

#[test]
fn default_dispositions() -> Result<()> {
    let mut guest = Guest::new()?;
    assert_eq!(
        guest.syscall(Syscall::Tkill, &[PID, SIGUSR1]),
        Action::Kill(SIGUSR1 as u32)
    );

    // Ignored signals resume with the result already in place
    sigaction(&mut guest, SIGUSR1, signals::SIG_IGN, 0)?;
    guest.hart.regs.set(abi::A0, 99);
    assert_eq!(guest.syscall(Syscall::Tkill, &[PID, SIGUSR1]), Action::Resume);
    assert_eq!(guest.hart.regs.get(abi::A0), 0);

    assert_eq!(guest.syscall(Syscall::Tkill, &[99, SIGUSR1]), errno(Errno::Esrch));

    let act = guest.data;
    assert_eq!(
        guest.syscall(Syscall::RtSigaction, &[u64::from(signals::SIGKILL), act, 0, 8]),
        errno(Errno::Einval)
    );
    Ok(())
}

#[test]
fn threads_switch_round_robin() -> Result<()> {
    let mut guest = Guest::new()?;
    const CLONE_THREAD: u64 = 0x100 | 0x10000;
    let stack = guest.data + PAGE_SIZE;
    guest.hart.regs.pc = 0x1000;

    assert_eq!(guest.syscall(Syscall::Clone, &[0, stack]), errno(Errno::Einval));
    assert_eq!(
        guest.syscall(Syscall::Clone, &[CLONE_THREAD, stack]),
        Action::Return(PID + 1)
    );
    assert_eq!(guest.kernel.threads().runnable(), 2);

    // The caller yields and the child starts with a zero result on its own stack
    assert_eq!(guest.syscall(Syscall::SchedYield, &[]), Action::Reschedule);
    let tid = guest.kernel.threads_mut().switch(&mut guest.hart.regs);
    assert_eq!(tid, Ok(PID + 1));
    assert_eq!(guest.hart.regs.get(abi::A0), 0);
    assert_eq!(guest.hart.regs.get(abi::SP), stack);
    assert_eq!(guest.hart.regs.pc, 0x1000);

    // The child waits on a futex, the parent runs and wakes it
    let futex = guest.data;
    guest.memory.write(futex, &0u32.to_le_bytes())?;
    assert_eq!(
        guest.syscall(Syscall::Futex, &[futex, 0, 1]),
        errno(Errno::Eagain)
    );
    assert_eq!(
        guest.syscall(Syscall::Futex, &[futex, 0, 0]),
        Action::Reschedule
    );
    assert_eq!(guest.kernel.threads().runnable(), 1);
    assert_eq!(guest.kernel.threads_mut().switch(&mut guest.hart.regs), Ok(PID));

    assert_eq!(
        guest.syscall(Syscall::Futex, &[futex, 1, 1]),
        Action::Return(1)
    );
    assert!(guest
        .kernel
        .threads()
        .iter()
        .all(|thread| thread.state == ThreadState::Runnable));

    // A child exit removes the thread, the main thread exit ends the process
    assert_eq!(
        guest.kernel.threads_mut().switch(&mut guest.hart.regs),
        Ok(PID + 1)
    );
    assert_eq!(guest.syscall(Syscall::Exit, &[3]), Action::Reschedule);
    assert_eq!(guest.kernel.threads().len(), 1);
    assert_eq!(guest.kernel.threads_mut().switch(&mut guest.hart.regs), Ok(PID));
    assert_eq!(guest.syscall(Syscall::Exit, &[4]), Action::Exit(4));
    Ok(())
}

#[test]
fn waiting_alone_is_a_deadlock_unless_timed() -> Result<()> {
    let mut guest = Guest::new()?;
    let futex = guest.data;
    let timeout = guest.data + 16;
    guest.memory.write(timeout, &1u64.to_le_bytes())?;

    assert_eq!(
        guest.syscall(Syscall::Futex, &[futex, 0, 0, timeout]),
        errno(Errno::Etimedout)
    );

    assert_eq!(guest.syscall(Syscall::Futex, &[futex, 0, 0, 0]), Action::Reschedule);
    assert!(guest.kernel.threads_mut().switch(&mut guest.hart.regs).is_err());
    Ok(())
}

#[test]
fn clone_with_bad_tid_pointers_creates_no_thread() -> Result<()> {
    let mut guest = Guest::new()?;
    const CLONE_THREAD: u64 = 0x100 | 0x10000;
    const PARENT_SETTID: u64 = 0x100000;
    const CHILD_SETTID: u64 = 0x1000000;
    let stack = guest.data + PAGE_SIZE;

    assert_eq!(
        guest.syscall(Syscall::Clone, &[CLONE_THREAD | PARENT_SETTID, stack, 0]),
        errno(Errno::Efault)
    );
    assert_eq!(
        guest.syscall(Syscall::Clone, &[CLONE_THREAD | CHILD_SETTID, stack, 0, 0, 0x10]),
        errno(Errno::Efault)
    );
    assert_eq!(guest.kernel.threads().len(), 1);
    assert_eq!(guest.kernel.threads().runnable(), 1);

    // The id of the discarded thread is handed out again
    let parent_tid = guest.data + 64;
    assert_eq!(
        guest.syscall(Syscall::Clone, &[CLONE_THREAD | PARENT_SETTID, stack, parent_tid]),
        Action::Return(PID + 1)
    );
    assert_eq!(guest.read(parent_tid, 4)?, (PID as u32 + 1).to_le_bytes());
    assert_eq!(guest.kernel.threads().len(), 2);
    Ok(())
}
