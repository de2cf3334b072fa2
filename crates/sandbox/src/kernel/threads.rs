//! Cooperative guest threads scheduled round-robin within one machine.

use std::collections::BTreeMap;

use rvisa::abi;

use crate::kernel::signals::SignalFrame;
use crate::kernel::{Action, Context, Errno, Kernel, Result, SyscallFrame, PID};
use crate::mem::GuestMemory;
use crate::registers::Registers;

// https://github.com/torvalds/linux/blob/master/include/uapi/linux/sched.h
#[repr(u64)]
#[derive(Clone, Copy)]
enum CloneFlags {
    Vm = 0x100,
    Thread = 0x10000,
    Settls = 0x80000,
    ParentSettid = 0x100000,
    ChildCleartid = 0x200000,
    ChildSettid = 0x1000000,
}

// https://github.com/torvalds/linux/blob/master/include/uapi/linux/futex.h
#[repr(u64)]
enum FutexOp {
    Wait = 0,
    Wake = 1,
    WaitBitset = 9,
    WakeBitset = 10,
}

const FUTEX_CMD_MASK: u64 = 0x7f;
pub const FUTEX_BITSET_MATCH_ANY: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Runnable,

    /// Blocked in a futex wait on `address`. Timed waits end when no thread is runnable.
    Waiting { address: u64, bitset: u32, timed: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thread {
    pub tid: u64,

    /// Saved registers. Stale while the thread is running.
    pub regs: Registers,

    pub state: ThreadState,

    /// Cleared and woken when the thread exits.
    pub clear_child_tid: u64,

    pub pending_signals: Vec<u32>,
    pub signal_frames: Vec<SignalFrame>,
}

impl Thread {
    fn new(tid: u64, regs: Registers) -> Self {
        Self {
            tid,
            regs,
            state: ThreadState::Runnable,
            clear_child_tid: 0,
            pending_signals: Vec::new(),
            signal_frames: Vec::new(),
        }
    }
}

/// Returned when no thread can make progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadlock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Threads {
    pub(crate) current: u64,
    pub(crate) threads: BTreeMap<u64, Thread>,
    pub(crate) next_tid: u64,
}

impl Threads {
    pub fn new(regs: Registers) -> Self {
        Self {
            current: PID,
            threads: BTreeMap::from([(PID, Thread::new(PID, regs))]),
            next_tid: PID + 1,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn contains(&self, tid: u64) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn get(&self, tid: u64) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: u64) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn current_thread_mut(&mut self) -> Option<&mut Thread> {
        self.threads.get_mut(&self.current)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn runnable(&self) -> usize {
        self.threads
            .values()
            .filter(|thread| thread.state == ThreadState::Runnable)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    fn spawn(&mut self, regs: Registers) -> u64 {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.threads.insert(tid, Thread::new(tid, regs));
        tid
    }

    /// Remove a thread that never ran, releasing its id.
    fn discard(&mut self, tid: u64) {
        self.threads.remove(&tid);
        if tid + 1 == self.next_tid {
            self.next_tid = tid;
        }
    }

    /// Wake at most `count` threads waiting on `address` with an intersecting bitset.
    pub fn wake(&mut self, address: u64, bitset: u32, count: u64) -> u64 {
        let mut woken = 0;
        for thread in self.threads.values_mut() {
            if woken >= count {
                break;
            }

            if let ThreadState::Waiting {
                address: waiting,
                bitset: mask,
                ..
            } = thread.state
            {
                if waiting == address && mask & bitset != 0 {
                    thread.state = ThreadState::Runnable;
                    thread.regs.set(abi::A0, 0);
                    woken += 1;
                }
            }
        }
        woken
    }

    /// Save `regs` into the running thread, if it still exists, and load the registers of the
    /// next runnable thread in round-robin order. When every thread waits, the first timed
    /// waiter times out. Returns the tid of the thread now running.
    pub fn switch(&mut self, regs: &mut Registers) -> std::result::Result<u64, Deadlock> {
        if let Some(thread) = self.threads.get_mut(&self.current) {
            thread.regs = regs.clone();
        }

        let current = self.current;
        let order = self
            .threads
            .range(current + 1..)
            .chain(self.threads.range(..=current))
            .map(|(&tid, _)| tid);

        let mut next = None;
        let mut timed = None;
        for tid in order {
            match self.threads[&tid].state {
                ThreadState::Runnable => {
                    next = Some(tid);
                    break;
                }
                ThreadState::Waiting { timed: true, .. } if timed.is_none() => timed = Some(tid),
                ThreadState::Waiting { .. } => {}
            }
        }

        let tid = match (next, timed) {
            (Some(tid), _) => tid,
            (None, Some(tid)) => {
                let thread = self.threads.get_mut(&tid).ok_or(Deadlock)?;
                thread.state = ThreadState::Runnable;
                thread.regs.set(abi::A0, Errno::Etimedout.result());
                tid
            }
            (None, None) => return Err(Deadlock),
        };

        let thread = self.threads.get(&tid).ok_or(Deadlock)?;
        *regs = thread.regs.clone();
        if tid != current {
            tracing::trace!(from = current, to = tid, "switched thread");
        }
        self.current = tid;
        Ok(tid)
    }
}

impl Kernel {
    pub(crate) fn clone_thread(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (flags, stack, parent_tid, tls, child_tid) = (
            frame.arg(0),
            frame.arg(1),
            frame.arg(2),
            frame.arg(3),
            frame.arg(4),
        );

        let required = CloneFlags::Vm as u64 | CloneFlags::Thread as u64;
        if flags & required != required {
            tracing::debug!(flags, "clone without a shared address space refused");
            return Err(Errno::Einval.into());
        }

        let mut regs = context.hart.regs.clone();
        regs.set(abi::A0, 0);
        if stack != 0 {
            regs.set(abi::SP, stack);
        }
        if flags & CloneFlags::Settls as u64 != 0 {
            regs.set(abi::TP, tls);
        }

        let tid = self.threads.spawn(regs);
        let published = [
            (CloneFlags::ParentSettid, parent_tid),
            (CloneFlags::ChildSettid, child_tid),
        ]
        .into_iter()
        .filter(|(flag, _)| flags & *flag as u64 != 0)
        .try_for_each(|(_, address)| context.write_u32(address, tid as u32));
        if let Err(err) = published {
            self.threads.discard(tid);
            return Err(err);
        }

        if flags & CloneFlags::ChildCleartid as u64 != 0 {
            if let Some(thread) = self.threads.get_mut(tid) {
                thread.clear_child_tid = child_tid;
            }
        }

        tracing::debug!(tid, stack, "created thread");
        Ok(Action::Return(tid))
    }

    pub(crate) fn set_tid_address(&mut self, frame: &SyscallFrame) -> Result<Action> {
        if let Some(thread) = self.threads.current_thread_mut() {
            thread.clear_child_tid = frame.arg(0);
        }
        Ok(Action::Return(self.threads.current()))
    }

    /// `exit` ends the calling thread. The main thread ends the process.
    pub(crate) fn exit_thread(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let status = frame.arg(0) as i32;
        let tid = self.threads.current();
        if tid == PID || self.threads.len() == 1 {
            return Ok(Action::Exit(status));
        }

        let Some(thread) = self.threads.threads.remove(&tid) else {
            return Ok(Action::Exit(status));
        };

        if thread.clear_child_tid != 0 {
            // The thread is gone either way, a bad address only skips the wake up
            if context.write_u32(thread.clear_child_tid, 0).is_ok() {
                self.threads
                    .wake(thread.clear_child_tid, FUTEX_BITSET_MATCH_ANY, 1);
            }
        }

        tracing::debug!(tid, status, "thread exited");
        Ok(Action::Reschedule)
    }

    pub(crate) fn sched_yield(&mut self, context: &mut Context<'_>) -> Result<Action> {
        if self.threads.runnable() <= 1 {
            return Ok(Action::Return(0));
        }

        context.hart.regs.set(abi::A0, 0);
        Ok(Action::Reschedule)
    }

    pub(crate) fn futex(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (address, op, value, timeout, bitset) = (
            frame.arg(0),
            frame.arg(1),
            frame.arg(2) as u32,
            frame.arg(3),
            frame.arg(5) as u32,
        );

        match op & FUTEX_CMD_MASK {
            n if n == FutexOp::Wait as u64 || n == FutexOp::WaitBitset as u64 => {
                let bitset = if n == FutexOp::Wait as u64 {
                    FUTEX_BITSET_MATCH_ANY
                } else {
                    bitset
                };
                if bitset == 0 {
                    return Err(Errno::Einval.into());
                }

                let current = u32::from_le_bytes(context.memory.load(address)?);
                if current != value {
                    return Err(Errno::Eagain.into());
                }

                let timed = timeout != 0;
                if self.threads.runnable() <= 1 && timed {
                    // Nobody can wake this thread before the timeout expires
                    let seconds = context.read_u64(timeout)?;
                    let nanos = context.read_u64(timeout + 8)?;
                    let duration = seconds.saturating_mul(1_000_000_000).saturating_add(nanos);
                    self.clock_offset = self.clock_offset.saturating_add(duration);
                    return Err(Errno::Etimedout.into());
                }

                if let Some(thread) = self.threads.current_thread_mut() {
                    thread.state = ThreadState::Waiting {
                        address,
                        bitset,
                        timed,
                    };
                }
                context.hart.regs.set(abi::A0, 0);
                Ok(Action::Reschedule)
            }
            n if n == FutexOp::Wake as u64 || n == FutexOp::WakeBitset as u64 => {
                let bitset = if n == FutexOp::Wake as u64 {
                    FUTEX_BITSET_MATCH_ANY
                } else {
                    bitset
                };
                if bitset == 0 {
                    return Err(Errno::Einval.into());
                }

                let woken = self.threads.wake(address, bitset, u64::from(value));
                Ok(Action::Return(woken))
            }
            _ => Err(Errno::Enosys.into()),
        }
    }
}
