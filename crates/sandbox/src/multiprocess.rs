//! Execution of one guest function on several host threads sharing a [Memory].
//!
//! Every worker owns a hart, a decode cache and a stack region. The region table is frozen for
//! the duration of the call, so workers may only use the system calls that leave mappings
//! untouched. Futex waits block the host thread on a condition variable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rvisa::abi;

use crate::emulator::Hart;
use crate::kernel::{Errno, Syscall, SyscallFrame};
use crate::mem::{self, GuestMemory, Memory, Permissions, SharedMemory, SharedView};
use crate::processor::{self, DispatchMode, Processor, Run, Stop, EXIT_ADDRESS};
use crate::translate::Translations;

/// Instructions executed between checks of the caller's cancellation flag.
const SLICE: u64 = 1 << 16;

/// Thread ids handed to workers start after the ids of guest threads.
const WORKER_TID_BASE: u64 = 1000;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid multiprocess arguments: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Memory(#[from] mem::Error),

    #[error("worker {worker} failed: {source}")]
    Worker {
        worker: usize,
        source: processor::Error,
    },

    #[error("worker {worker} reached a breakpoint at {pc:#x}")]
    Breakpoint { worker: usize, pc: u64 },

    #[error("worker {worker} exceeded its step limit")]
    StepLimit { worker: usize },

    #[error("worker {worker} waited on {address:#x} for longer than {timeout:?}")]
    Deadlock {
        worker: usize,
        address: u64,
        timeout: Duration,
    },

    #[error("worker {worker} panicked")]
    Panicked { worker: usize },

    #[error("multiprocess call cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct MultiprocessOptions {
    pub workers: usize,

    /// Stack size of each worker.
    pub stack_size: u64,

    /// Maximum instructions retired by each worker.
    pub step_limit: u64,

    /// Longest time a worker may block in a futex wait without a timeout of its own.
    pub futex_timeout: Duration,
}

impl Default for MultiprocessOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            stack_size: 256 * 1024,
            step_limit: 1 << 32,
            futex_timeout: Duration::from_secs(10),
        }
    }
}

impl MultiprocessOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_stack_size(mut self, stack_size: u64) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_step_limit(mut self, step_limit: u64) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn with_futex_timeout(mut self, futex_timeout: Duration) -> Self {
        self.futex_timeout = futex_timeout;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The function returned the value in `a0`.
    Returned(u64),

    /// The worker called `exit` with the status.
    Exited(i32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerResult {
    pub index: usize,
    pub exit: WorkerExit,
    pub instructions: u64,

    /// Writes to the standard streams as `(fd, bytes)` in the order they were made.
    pub output: Vec<(u32, Vec<u8>)>,
}

/// The function each worker calls and the state it starts from.
pub struct Job<'a> {
    pub function: u64,
    pub args: &'a [u64],

    /// Registers other than the call arguments, the stack pointer and the return address are
    /// copied from this hart.
    pub template: &'a Hart,

    pub mode: DispatchMode,
    pub translations: Option<&'a Translations>,
    pub cancel: Option<&'a AtomicBool>,
}

/// Futex waits of all workers. Every waiter holds a ticket. A wake moves the oldest `count`
/// tickets of the address to the woken set and notifies all waiters, and only the owners of woken
/// tickets return.
#[derive(Default)]
pub(crate) struct FutexTable {
    queues: Mutex<BTreeMap<u64, FutexQueue>>,
    wakeups: Condvar,
}

#[derive(Default)]
struct FutexQueue {
    next_ticket: u64,
    waiting: BTreeSet<u64>,
    woken: BTreeSet<u64>,
}

pub(crate) enum Wait {
    Woken,
    ValueChanged,
    TimedOut,
}

impl FutexTable {
    fn poisoned<T>(_: T) -> mem::Error {
        mem::Error::InternalError("futex table poisoned by a panicking worker".to_string())
    }

    pub(crate) fn wait(
        &self,
        view: &SharedView<'_, '_>,
        address: u64,
        expected: u32,
        timeout: Duration,
    ) -> mem::Result<Wait> {
        let mut queues = self.queues.lock().map_err(Self::poisoned)?;

        // The value is checked under the table lock so a wake cannot slip in before the wait
        let value = u32::from_le_bytes(view.load(address)?);
        if value != expected {
            return Ok(Wait::ValueChanged);
        }

        let queue = queues.entry(address).or_default();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        queue.waiting.insert(ticket);

        let deadline = Instant::now().checked_add(timeout);
        let result = loop {
            if queues
                .get_mut(&address)
                .is_some_and(|queue| queue.woken.remove(&ticket))
            {
                break Wait::Woken;
            }

            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                break Wait::TimedOut;
            }

            let (guard, _) = self
                .wakeups
                .wait_timeout(queues, remaining)
                .map_err(Self::poisoned)?;
            queues = guard;
        };

        if let Some(queue) = queues.get_mut(&address) {
            queue.waiting.remove(&ticket);
            if queue.waiting.is_empty() && queue.woken.is_empty() {
                queues.remove(&address);
            }
        }
        Ok(result)
    }

    /// Wake at most `count` waiters of `address`. Returns the number woken.
    pub(crate) fn wake(&self, address: u64, count: u64) -> mem::Result<u64> {
        let mut queues = self.queues.lock().map_err(Self::poisoned)?;
        let Some(queue) = queues.get_mut(&address) else {
            return Ok(0);
        };

        let mut woken = 0;
        while woken < count {
            let Some(ticket) = queue.waiting.pop_first() else {
                break;
            };
            queue.woken.insert(ticket);
            woken += 1;
        }

        if woken > 0 {
            self.wakeups.notify_all();
        }
        Ok(woken)
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self, address: u64) -> mem::Result<usize> {
        let queues = self.queues.lock().map_err(Self::poisoned)?;
        Ok(queues.get(&address).map_or(0, |queue| queue.waiting.len()))
    }
}

struct Worker<'j, 's, 'a> {
    index: usize,
    job: &'j Job<'j>,
    options: &'j MultiprocessOptions,
    futexes: &'j FutexTable,
    abort: &'j AtomicBool,
    view: SharedView<'s, 'a>,
    output: Vec<(u32, Vec<u8>)>,
}

impl Worker<'_, '_, '_> {
    fn cancelled(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
            || self
                .job
                .cancel
                .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    }

    fn run(mut self, stack_top: u64) -> Result<WorkerResult> {
        let job = self.job;
        let mut hart = Hart::new(job.template.regs.clone());
        let mut args = vec![self.index as u64, self.options.workers as u64];
        args.extend_from_slice(job.args);
        hart.regs.set_call(job.function, EXIT_ADDRESS, &args);
        hart.regs.set(abi::SP, stack_top & !15);

        let mut translations = job.translations.cloned().unwrap_or_default();
        let mut processor = Processor::new(hart, job.mode);

        loop {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }

            let retired = processor.hart().instret;
            if retired >= self.options.step_limit {
                return Err(Error::StepLimit { worker: self.index });
            }

            let limit = (self.options.step_limit - retired).min(SLICE);
            let mut run = Run::new(limit).with_cancel(self.abort);
            if job.translations.is_some() {
                run = run.with_translations(&mut translations);
            }

            let stop = processor
                .run(&mut self.view, &mut run)
                .map_err(|source| Error::Worker {
                    worker: self.index,
                    source,
                })?;

            let hart = processor.hart_mut();
            let exit = match stop {
                Stop::Returned => Some(WorkerExit::Returned(hart.regs.get(abi::A0))),
                Stop::StepLimit | Stop::Cancelled => None,
                Stop::Breakpoint => {
                    return Err(Error::Breakpoint {
                        worker: self.index,
                        pc: hart.regs.pc,
                    })
                }
                Stop::SignalReturn => {
                    return Err(Error::Worker {
                        worker: self.index,
                        source: processor::Error::InternalError(
                            "signal return outside a signal handler".to_string(),
                        ),
                    })
                }
                Stop::Syscall => {
                    let frame = SyscallFrame::from_registers(&hart.regs);
                    match self.syscall(&frame)? {
                        Some(value) => {
                            hart.regs.set(abi::A0, value);
                            None
                        }
                        None => Some(WorkerExit::Exited(frame.arg(0) as i32)),
                    }
                }
            };

            if let Some(exit) = exit {
                return Ok(WorkerResult {
                    index: self.index,
                    exit,
                    instructions: processor.hart().instret,
                    output: self.output,
                });
            }
        }
    }

    /// Handle a system call of the worker. Returns `None` when the worker exits.
    fn syscall(&mut self, frame: &SyscallFrame) -> Result<Option<u64>> {
        let value = match frame.number {
            n if n == Syscall::Exit as u64 || n == Syscall::ExitGroup as u64 => return Ok(None),
            n if n == Syscall::Gettid as u64 => WORKER_TID_BASE + self.index as u64,
            n if n == Syscall::SchedYield as u64 => {
                std::thread::yield_now();
                0
            }
            n if n == Syscall::Write as u64 => self.write(frame),
            n if n == Syscall::Futex as u64 => self.futex(frame)?,
            n if n == Syscall::Brk as u64
                || n == Syscall::Mmap as u64
                || n == Syscall::Munmap as u64
                || n == Syscall::Mremap as u64
                || n == Syscall::Mprotect as u64
                || n == Syscall::Madvise as u64 =>
            {
                tracing::debug!(worker = self.index, number = n, "mapping change refused");
                Errno::Eperm.result()
            }
            number => {
                tracing::debug!(worker = self.index, number, "unhandled worker syscall");
                Errno::Enosys.result()
            }
        };

        Ok(Some(value))
    }

    fn write(&mut self, frame: &SyscallFrame) -> u64 {
        let (fd, buf, len) = (frame.arg(0), frame.arg(1), frame.arg(2));
        if fd != 1 && fd != 2 {
            return Errno::Ebadf.result();
        }

        if len > (1 << 20) {
            return Errno::Einval.result();
        }

        let mut data = vec![0u8; len as usize];
        if self.view.read(buf, &mut data).is_err() {
            return Errno::Efault.result();
        }

        self.output.push((fd as u32, data));
        len
    }

    fn futex(&mut self, frame: &SyscallFrame) -> Result<u64> {
        const CMD_MASK: u64 = 0x7f;
        const WAIT: u64 = 0;
        const WAKE: u64 = 1;
        const WAIT_BITSET: u64 = 9;
        const WAKE_BITSET: u64 = 10;

        let (address, op, value, timeout) =
            (frame.arg(0), frame.arg(1), frame.arg(2) as u32, frame.arg(3));

        match op & CMD_MASK {
            WAIT | WAIT_BITSET => {
                let guest_timeout = if timeout != 0 {
                    let mut timespec = [0u8; 16];
                    if self.view.read(timeout, &mut timespec).is_err() {
                        return Ok(Errno::Efault.result());
                    }
                    let seconds = u64::from_le_bytes(timespec[..8].try_into().unwrap_or_default());
                    let nanos = u64::from_le_bytes(timespec[8..].try_into().unwrap_or_default());
                    if nanos >= NANOS_PER_SECOND {
                        return Ok(Errno::Einval.result());
                    }
                    Some(Duration::new(seconds, nanos as u32))
                } else {
                    None
                };

                let limit = guest_timeout
                    .unwrap_or(self.options.futex_timeout)
                    .min(self.options.futex_timeout);
                match self.futexes.wait(&self.view, address, value, limit) {
                    Ok(Wait::Woken) => Ok(0),
                    Ok(Wait::ValueChanged) => Ok(Errno::Eagain.result()),
                    Ok(Wait::TimedOut) if guest_timeout.is_some() => Ok(Errno::Etimedout.result()),
                    Ok(Wait::TimedOut) => Err(Error::Deadlock {
                        worker: self.index,
                        address,
                        timeout: limit,
                    }),
                    Err(mem::Error::InternalError(message)) => {
                        Err(Error::Memory(mem::Error::InternalError(message)))
                    }
                    Err(_) => Ok(Errno::Efault.result()),
                }
            }
            WAKE | WAKE_BITSET => Ok(self.futexes.wake(address, u64::from(value))?),
            _ => Ok(Errno::Enosys.result()),
        }
    }
}

/// Call `job.function` on `options.workers` host threads. Worker `i` receives `i` in `a0`, the
/// worker count in `a1` and `job.args` in the following argument registers.
///
/// Pages written by the workers are committed to `memory` only if every worker succeeds.
pub fn run(memory: &mut Memory, job: &Job<'_>, options: &MultiprocessOptions) -> Result<Vec<WorkerResult>> {
    if options.workers == 0 {
        return Err(Error::InvalidArgument("at least one worker is required".to_string()));
    }

    if job.args.len() > 6 {
        return Err(Error::InvalidArgument(format!(
            "{count} arguments do not fit in the argument registers",
            count = job.args.len()
        )));
    }

    let mut stacks = Vec::with_capacity(options.workers);
    for _ in 0..options.workers {
        match memory.map(0, options.stack_size, Permissions::READ_WRITE) {
            Ok(bottom) => stacks.push(bottom),
            Err(err) => {
                release_stacks(memory, &stacks, options.stack_size);
                return Err(err.into());
            }
        }
    }

    tracing::debug!(workers = options.workers, function = job.function, "starting workers");
    let results = run_workers(memory, job, options, &stacks);
    release_stacks(memory, &stacks, options.stack_size);
    results
}

fn run_workers(
    memory: &mut Memory,
    job: &Job<'_>,
    options: &MultiprocessOptions,
    stacks: &[u64],
) -> Result<Vec<WorkerResult>> {
    let shared = SharedMemory::new(memory);
    let futexes = FutexTable::default();
    let abort = AtomicBool::new(false);

    let outcomes: Vec<Result<WorkerResult>> = std::thread::scope(|scope| {
        let handles: Vec<_> = stacks
            .iter()
            .enumerate()
            .map(|(index, &bottom)| {
                let worker = Worker {
                    index,
                    job,
                    options,
                    futexes: &futexes,
                    abort: &abort,
                    view: shared.view(),
                    output: Vec::new(),
                };
                let abort = &abort;
                scope.spawn(move || {
                    let result = worker.run(bottom + options.stack_size);
                    if result.is_err() {
                        abort.store(true, Ordering::Relaxed);
                    }
                    result
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| handle.join().unwrap_or(Err(Error::Panicked { worker })))
            .collect()
    });

    let pages = shared.finish()?;

    // Report the root cause rather than the cancellation it caused in other workers
    let mut results = Vec::with_capacity(outcomes.len());
    let mut cancelled = None;
    for outcome in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(Error::Cancelled) => cancelled = Some(Error::Cancelled),
            Err(err) => return Err(err),
        }
    }
    if let Some(err) = cancelled {
        return Err(err);
    }

    memory.commit_pages(pages);
    tracing::debug!(workers = results.len(), "workers finished");
    Ok(results)
}

fn release_stacks(memory: &mut Memory, stacks: &[u64], size: u64) {
    for &bottom in stacks {
        if let Err(err) = memory.unmap(bottom, size) {
            tracing::warn!(bottom, %err, "failed to release worker stack");
        }
    }
}
