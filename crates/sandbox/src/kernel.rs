//! Emulation of the Linux system call interface for guest programs.
//!
//! The kernel never touches host resources. Files are limited to the standard streams and
//! in-sandbox socket pairs, time is derived from the retired instruction count and randomness
//! comes from a seeded generator, so that a run is reproducible from its inputs.

use std::sync::Arc;

use rvisa::abi;

use crate::emulator::Hart;
use crate::loader::Symbols;
use crate::mem::{self, GuestMemory, Memory};
use crate::registers::Registers;

pub mod heap;
pub mod linux;
pub mod net;
pub mod signals;
pub mod threads;

pub use heap::Heap;
pub use linux::Brk;
pub use net::Files;
pub use signals::{SignalAction, Signals};
pub use threads::{Thread, ThreadState, Threads};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A guest pointer passed to the system call is not accessible.
    #[error(transparent)]
    Memory(#[from] mem::Error),

    #[error("system call failed with {0:?}")]
    Errno(Errno),
}

pub type Result<T> = std::result::Result<T, Error>;

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errno {
    Eperm = 1,
    Enoent = 2,
    Esrch = 3,
    Ebadf = 9,
    Eagain = 11,
    Enomem = 12,
    Eacces = 13,
    Efault = 14,
    Eexist = 17,
    Enodev = 19,
    Einval = 22,
    Enotty = 25,
    Espipe = 29,
    Epipe = 32,
    Erange = 34,
    Enosys = 38,
    Enotsock = 88,
    Eafnosupport = 97,
    Enotconn = 107,
    Etimedout = 110,
}

impl Errno {
    /// The value returned to the guest in `a0`.
    pub fn result(self) -> u64 {
        (-(self as i64)) as u64
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Errno(errno)
    }
}

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/unistd.h
#[repr(u64)]
pub enum Syscall {
    Getcwd = 17,
    Ioctl = 29,
    Openat = 56,
    Close = 57,
    Lseek = 62,
    Read = 63,
    Write = 64,
    Readv = 65,
    Writev = 66,
    Ppoll = 73,
    Newfstatat = 79,
    Fstat = 80,
    Exit = 93,
    ExitGroup = 94,
    SetTidAddress = 96,
    Futex = 98,
    SetRobustList = 99,
    Nanosleep = 101,
    ClockGettime = 113,
    SchedGetaffinity = 123,
    SchedYield = 124,
    Tkill = 130,
    Tgkill = 131,
    Sigaltstack = 132,
    RtSigaction = 134,
    RtSigprocmask = 135,
    RtSigreturn = 139,
    Uname = 160,
    Gettimeofday = 169,
    Getpid = 172,
    Getppid = 173,
    Getuid = 174,
    Geteuid = 175,
    Getgid = 176,
    Getegid = 177,
    Gettid = 178,
    Socket = 198,
    Socketpair = 199,
    Bind = 200,
    Listen = 201,
    Accept = 202,
    Connect = 203,
    Getsockname = 204,
    Getpeername = 205,
    Sendto = 206,
    Recvfrom = 207,
    Setsockopt = 208,
    Getsockopt = 209,
    Shutdown = 210,
    Sendmsg = 211,
    Recvmsg = 212,
    Brk = 214,
    Munmap = 215,
    Mremap = 216,
    Clone = 220,
    Mmap = 222,
    Mprotect = 226,
    Madvise = 233,
    Accept4 = 242,
    Prlimit64 = 261,
    Getrandom = 278,

    Malloc = 480,
    Calloc = 481,
    Realloc = 482,
    Free = 483,
    Meminfo = 484,
    Memcpy = 485,
    Memset = 486,
    Memmove = 487,
    Memcmp = 488,
    Strlen = 490,
    Strcmp = 491,
    Backtrace = 499,
}

/// Process id reported to the guest. The main thread has the same id.
pub const PID: u64 = 1;

/// Nanoseconds of guest time per retired instruction.
pub const NANOS_PER_INSTRUCTION: u64 = 1;

/// Realtime clock value at the start of a run, in seconds since the epoch.
pub const EPOCH_SECONDS: u64 = 1_700_000_000;

/// A system call request taken from the registers at an `ecall`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallFrame {
    /// Taken from `a7`
    pub number: u64,

    /// Taken from `a0` through `a5`
    pub args: [u64; 6],
}

impl SyscallFrame {
    pub fn from_registers(regs: &Registers) -> Self {
        let mut args = [0u64; 6];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = regs.get(abi::A0 + i as u8);
        }

        Self {
            number: regs.get(abi::A7),
            args,
        }
    }

    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }
}

/// How execution continues after a system call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Write the value to `a0` and continue with the next instruction.
    Return(u64),

    /// The registers were already updated by the call.
    Resume,

    /// The process exited with the status.
    Exit(i32),

    /// The process was terminated by the signal.
    Kill(u32),

    /// The current thread blocked, yielded or exited. Another thread must be scheduled.
    Reschedule,

    /// The call faulted like the instruction it replaces.
    Fault(mem::Error),
}

/// Receives guest output written to a file descriptor.
pub type Printer = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// Deterministic generator backing `getrandom` and the auxiliary vector random bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rng {
    pub(crate) state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    // SplitMix64
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// The state a system call operates on besides the kernel itself.
pub struct Context<'a> {
    pub memory: &'a mut Memory,
    pub hart: &'a mut Hart,
    pub symbols: &'a Symbols,
}

impl Context<'_> {
    pub fn read_u64(&self, address: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.memory.load(address)?))
    }

    pub fn read_u32(&self, address: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.memory.load(address)?))
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> Result<()> {
        Ok(self.memory.write(address, &value.to_le_bytes())?)
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<()> {
        Ok(self.memory.write(address, &value.to_le_bytes())?)
    }

    pub fn read_bytes(&self, address: u64, len: u64) -> Result<Vec<u8>> {
        // Guard the host allocation against guest-controlled lengths
        if len > self.memory.limit() {
            return Err(Errno::Efault.into());
        }

        let mut buf = vec![0u8; len as usize];
        self.memory.read(address, &mut buf)?;
        Ok(buf)
    }

    pub fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.memory.write(address, data)?)
    }
}

/// Emulated operating system state of one machine.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) brk: Brk,
    pub(crate) heap: Option<Heap>,
    pub(crate) signals: Signals,
    pub(crate) files: Files,
    pub(crate) threads: Threads,
    pub(crate) rng: Rng,

    /// Nanoseconds added to the guest clock by sleeps and timeouts.
    pub(crate) clock_offset: u64,

    pub(crate) stdin: Vec<u8>,
    pub(crate) stdin_position: usize,

    /// Output of the standard streams when no printer is installed.
    pub(crate) output: Vec<u8>,

    pub(crate) stack_size: u64,

    printer: Option<Printer>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("brk", &self.brk)
            .field("heap", &self.heap)
            .field("signals", &self.signals)
            .field("files", &self.files)
            .field("threads", &self.threads)
            .field("clock_offset", &self.clock_offset)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub fn new(seed: u64, stdin: Vec<u8>, printer: Option<Printer>) -> Self {
        Self {
            brk: Brk::default(),
            heap: None,
            signals: Signals::default(),
            files: Files::new(),
            threads: Threads::new(Registers::default()),
            rng: Rng::new(seed),
            clock_offset: 0,
            stdin,
            stdin_position: 0,
            output: Vec::new(),
            stack_size: 0,
            printer,
        }
    }

    pub fn brk(&self) -> &Brk {
        &self.brk
    }

    pub fn heap(&self) -> Option<&Heap> {
        self.heap.as_ref()
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn threads_mut(&mut self) -> &mut Threads {
        &mut self.threads
    }

    pub fn rng_mut(&mut self) -> &mut Rng {
        &mut self.rng
    }

    /// Guest output collected while no printer is installed.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn set_printer(&mut self, printer: Option<Printer>) {
        self.printer = printer;
    }

    pub(crate) fn set_stack_size(&mut self, stack_size: u64) {
        self.stack_size = stack_size;
    }

    pub(crate) fn print(&mut self, fd: u32, bytes: &[u8]) {
        match &self.printer {
            Some(printer) => printer(fd, bytes),
            None => self.output.extend_from_slice(bytes),
        }
    }

    /// Handle the system call described by `frame`.
    pub fn handle(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Action {
        tracing::trace!(number = frame.number, args = ?frame.args, "syscall");
        match self.dispatch(context, frame) {
            Ok(action) => action,
            Err(Error::Errno(errno)) => Action::Return(errno.result()),
            Err(Error::Memory(err)) => {
                tracing::trace!(number = frame.number, %err, "syscall argument fault");
                Action::Return(Errno::Efault.result())
            }
        }
    }

    fn dispatch(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        match frame.number {
            n if n == Syscall::Getcwd as u64 => self.getcwd(context, frame),
            n if n == Syscall::Ioctl as u64 => Ok(Action::Return(Errno::Enotty.result())),
            n if n == Syscall::Openat as u64 => Ok(Action::Return(Errno::Enoent.result())),
            n if n == Syscall::Close as u64 => self.close(frame),
            n if n == Syscall::Lseek as u64 => self.lseek(frame),
            n if n == Syscall::Read as u64 => self.read(context, frame),
            n if n == Syscall::Write as u64 => self.write(context, frame),
            n if n == Syscall::Readv as u64 => self.readv(context, frame),
            n if n == Syscall::Writev as u64 => self.writev(context, frame),
            n if n == Syscall::Ppoll as u64 => self.ppoll(context, frame),
            n if n == Syscall::Newfstatat as u64 => self.newfstatat(context, frame),
            n if n == Syscall::Fstat as u64 => self.fstat(context, frame.arg(0), frame.arg(1)),
            n if n == Syscall::Exit as u64 => self.exit_thread(context, frame),
            n if n == Syscall::ExitGroup as u64 => Ok(Action::Exit(frame.arg(0) as i32)),
            n if n == Syscall::SetTidAddress as u64 => self.set_tid_address(frame),
            n if n == Syscall::Futex as u64 => self.futex(context, frame),
            n if n == Syscall::SetRobustList as u64 => Ok(Action::Return(0)),
            n if n == Syscall::Nanosleep as u64 => self.nanosleep(context, frame),
            n if n == Syscall::ClockGettime as u64 => self.clock_gettime(context, frame),
            n if n == Syscall::SchedGetaffinity as u64 => self.sched_getaffinity(context, frame),
            n if n == Syscall::SchedYield as u64 => self.sched_yield(context),
            n if n == Syscall::Tkill as u64 => self.kill(context, frame.arg(0), frame.arg(1)),
            n if n == Syscall::Tgkill as u64 => self.kill(context, frame.arg(1), frame.arg(2)),
            n if n == Syscall::Sigaltstack as u64 => self.sigaltstack(context, frame),
            n if n == Syscall::RtSigaction as u64 => self.rt_sigaction(context, frame),
            n if n == Syscall::RtSigprocmask as u64 => self.rt_sigprocmask(context, frame),
            n if n == Syscall::RtSigreturn as u64 => self.rt_sigreturn(context),
            n if n == Syscall::Uname as u64 => self.uname(context, frame),
            n if n == Syscall::Gettimeofday as u64 => self.gettimeofday(context, frame),
            n if n == Syscall::Getpid as u64 => Ok(Action::Return(PID)),
            n if n == Syscall::Getppid as u64 => Ok(Action::Return(0)),
            n if n == Syscall::Getuid as u64
                || n == Syscall::Geteuid as u64
                || n == Syscall::Getgid as u64
                || n == Syscall::Getegid as u64 =>
            {
                Ok(Action::Return(0))
            }
            n if n == Syscall::Gettid as u64 => Ok(Action::Return(self.threads.current())),
            n if n == Syscall::Socketpair as u64 => self.socketpair(context, frame),
            n if n == Syscall::Sendto as u64 => self.send(context, frame),
            n if n == Syscall::Recvfrom as u64 => self.recv(context, frame),
            n if n == Syscall::Shutdown as u64 => self.shutdown(frame),
            n if n == Syscall::Socket as u64
                || (Syscall::Bind as u64..=Syscall::Getpeername as u64).contains(&n)
                || (Syscall::Setsockopt as u64..=Syscall::Getsockopt as u64).contains(&n)
                || n == Syscall::Sendmsg as u64
                || n == Syscall::Recvmsg as u64
                || n == Syscall::Accept4 as u64 =>
            {
                Ok(Action::Return(Errno::Eacces.result()))
            }
            n if n == Syscall::Brk as u64 => self.set_brk(context, frame),
            n if n == Syscall::Munmap as u64 => self.munmap(context, frame),
            n if n == Syscall::Mremap as u64 => self.mremap(context, frame),
            n if n == Syscall::Clone as u64 => self.clone_thread(context, frame),
            n if n == Syscall::Mmap as u64 => self.mmap(context, frame),
            n if n == Syscall::Mprotect as u64 => self.mprotect(context, frame),
            n if n == Syscall::Madvise as u64 => self.madvise(context, frame),
            n if n == Syscall::Prlimit64 as u64 => self.prlimit64(context, frame),
            n if n == Syscall::Getrandom as u64 => self.getrandom(context, frame),
            n if (Syscall::Malloc as u64..=Syscall::Strcmp as u64).contains(&n)
                || n == Syscall::Backtrace as u64 =>
            {
                self.native(context, frame)
            }
            number => {
                tracing::debug!(number, pc = context.hart.regs.pc, "unhandled syscall");
                Ok(Action::Return(Errno::Enosys.result()))
            }
        }
    }
}
