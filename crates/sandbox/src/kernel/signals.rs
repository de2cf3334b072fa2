use std::collections::BTreeMap;

use rvisa::abi;

use crate::kernel::{Action, Context, Errno, Kernel, Result, SyscallFrame};
use crate::processor::SIGRETURN_ADDRESS;
use crate::registers::Registers;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SIGKILL: u32 = 9;
pub const SIGSTOP: u32 = 19;
const SIGCHLD: u32 = 17;
const SIGURG: u32 = 23;
const SIGWINCH: u32 = 28;

/// Highest signal number.
pub const NSIG: u32 = 64;

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/signal-defs.h
#[repr(u64)]
enum ActionFlags {
    OnStack = 0x0800_0000,
    NoDefer = 0x4000_0000,
    ResetHand = 0x8000_0000,
}

#[repr(u64)]
enum MaskHow {
    Block = 0,
    Unblock = 1,
    SetMask = 2,
}

const SS_DISABLE: u32 = 2;
const MINSIGSTKSZ: u64 = 2048;

/// Bytes below the interrupted stack pointer left untouched by a handler frame.
const RED_ZONE: u64 = 128;

/// A registered `sigaction`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalAction {
    pub handler: u64,
    pub flags: u64,
    pub mask: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AltStack {
    pub sp: u64,
    pub size: u64,
}

/// The context interrupted by a signal handler, restored by `rt_sigreturn`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalFrame {
    pub regs: Registers,
    pub mask: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signals {
    pub(crate) actions: BTreeMap<u32, SignalAction>,
    pub(crate) mask: u64,
    pub(crate) altstack: AltStack,
}

/// What happens when a signal is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Handler(SignalAction),
    Ignore,
    Terminate,
}

fn bit(signal: u32) -> u64 {
    1 << (signal - 1)
}

impl Signals {
    pub fn action(&self, signal: u32) -> SignalAction {
        self.actions.get(&signal).copied().unwrap_or_default()
    }

    pub fn disposition(&self, signal: u32) -> Disposition {
        let action = self.action(signal);
        match action.handler {
            SIG_IGN => Disposition::Ignore,
            SIG_DFL if matches!(signal, SIGCHLD | SIGURG | SIGWINCH) => Disposition::Ignore,
            SIG_DFL => Disposition::Terminate,
            _ => Disposition::Handler(action),
        }
    }

    /// Whether the guest registered a handler function for `signal`.
    pub fn has_handler(&self, signal: u32) -> bool {
        matches!(self.disposition(signal), Disposition::Handler(_))
    }

    pub fn is_blocked(&self, signal: u32) -> bool {
        self.mask & bit(signal) != 0
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }
}

impl Kernel {
    /// Deliver `signal` to the running thread whose registers are `regs`.
    pub fn deliver(&mut self, regs: &mut Registers, signal: u32) -> Action {
        match self.signals.disposition(signal) {
            Disposition::Ignore => Action::Resume,
            Disposition::Terminate => Action::Kill(signal),
            Disposition::Handler(action) => {
                self.enter_handler(regs, signal, action);
                Action::Resume
            }
        }
    }

    fn enter_handler(&mut self, regs: &mut Registers, signal: u32, action: SignalAction) {
        let frame = SignalFrame {
            regs: regs.clone(),
            mask: self.signals.mask,
        };
        if let Some(thread) = self.threads.current_thread_mut() {
            thread.signal_frames.push(frame);
        }

        let altstack = self.signals.altstack;
        let sp = regs.get(abi::SP);
        let on_altstack = sp > altstack.sp && sp <= altstack.sp + altstack.size;
        let sp = if action.flags & ActionFlags::OnStack as u64 != 0
            && altstack.size != 0
            && !on_altstack
        {
            altstack.sp + altstack.size
        } else {
            sp.wrapping_sub(RED_ZONE)
        };

        regs.set(abi::SP, sp & !15);
        regs.set(abi::RA, SIGRETURN_ADDRESS);
        regs.set(abi::A0, u64::from(signal));
        regs.set(abi::A1, 0);
        regs.set(abi::A2, 0);
        regs.pc = action.handler;

        self.signals.mask |= action.mask;
        if action.flags & ActionFlags::NoDefer as u64 == 0 {
            self.signals.mask |= bit(signal);
        }

        if action.flags & ActionFlags::ResetHand as u64 != 0 {
            self.signals.actions.remove(&signal);
        }

        tracing::debug!(signal, handler = action.handler, "delivering signal");
    }

    /// Restore the context interrupted by the most recent signal of the running thread.
    pub fn sigreturn(&mut self, regs: &mut Registers) -> Option<()> {
        let frame = self.threads.current_thread_mut()?.signal_frames.pop()?;
        *regs = frame.regs;
        self.signals.mask = frame.mask;
        Some(())
    }

    /// Deliver the pending signals of the running thread which are no longer blocked.
    pub fn deliver_pending(&mut self, regs: &mut Registers) -> Action {
        loop {
            let signals = &self.signals;
            let Some(thread) = self.threads.current_thread_mut() else {
                return Action::Resume;
            };
            let Some(index) = thread
                .pending_signals
                .iter()
                .position(|&signal| !signals.is_blocked(signal))
            else {
                return Action::Resume;
            };

            let signal = thread.pending_signals.remove(index);
            match self.deliver(regs, signal) {
                Action::Resume => continue,
                action => return action,
            }
        }
    }

    pub(crate) fn kill(&mut self, context: &mut Context<'_>, tid: u64, signal: u64) -> Result<Action> {
        if signal > u64::from(NSIG) {
            return Err(Errno::Einval.into());
        }

        let signal = signal as u32;
        if !self.threads.contains(tid) {
            return Err(Errno::Esrch.into());
        }

        if signal == 0 {
            return Ok(Action::Return(0));
        }

        let current = tid == self.threads.current();
        if !current || self.signals.is_blocked(signal) {
            if let Some(thread) = self.threads.get_mut(tid) {
                thread.pending_signals.push(signal);
            }
            return Ok(Action::Return(0));
        }

        // The handler returns to the instruction following the call with its result in place
        context.hart.regs.set(abi::A0, 0);
        Ok(self.deliver(&mut context.hart.regs, signal))
    }

    pub(crate) fn rt_sigaction(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (signal, act, oldact) = (frame.arg(0), frame.arg(1), frame.arg(2));
        if signal == 0 || signal > u64::from(NSIG) {
            return Err(Errno::Einval.into());
        }

        let signal = signal as u32;
        if act != 0 && matches!(signal, SIGKILL | SIGSTOP) {
            return Err(Errno::Einval.into());
        }

        let new = if act != 0 {
            Some(SignalAction {
                handler: context.read_u64(act)?,
                flags: context.read_u64(act + 8)?,
                mask: context.read_u64(act + 16)?,
            })
        } else {
            None
        };

        if oldact != 0 {
            let old = self.signals.action(signal);
            context.write_u64(oldact, old.handler)?;
            context.write_u64(oldact + 8, old.flags)?;
            context.write_u64(oldact + 16, old.mask)?;
        }

        if let Some(action) = new {
            tracing::debug!(signal, handler = action.handler, "registered signal action");
            self.signals.actions.insert(signal, action);
        }

        Ok(Action::Return(0))
    }

    pub(crate) fn rt_sigprocmask(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (how, set, oldset) = (frame.arg(0), frame.arg(1), frame.arg(2));
        let set = if set != 0 {
            Some(context.read_u64(set)?)
        } else {
            None
        };

        if oldset != 0 {
            context.write_u64(oldset, self.signals.mask)?;
        }

        if let Some(set) = set {
            let mask = match how {
                n if n == MaskHow::Block as u64 => self.signals.mask | set,
                n if n == MaskHow::Unblock as u64 => self.signals.mask & !set,
                n if n == MaskHow::SetMask as u64 => set,
                _ => return Err(Errno::Einval.into()),
            };
            self.signals.mask = mask & !(bit(SIGKILL) | bit(SIGSTOP));
        }

        context.hart.regs.set(abi::A0, 0);
        Ok(self.deliver_pending(&mut context.hart.regs))
    }

    pub(crate) fn sigaltstack(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let (ss, old) = (frame.arg(0), frame.arg(1));
        let new = if ss != 0 {
            Some((
                context.read_u64(ss)?,
                context.read_u32(ss + 8)?,
                context.read_u64(ss + 16)?,
            ))
        } else {
            None
        };

        if old != 0 {
            let altstack = self.signals.altstack;
            let flags = if altstack.size == 0 { SS_DISABLE } else { 0 };
            context.write_u64(old, altstack.sp)?;
            context.write_u64(old + 8, u64::from(flags))?;
            context.write_u64(old + 16, altstack.size)?;
        }

        if let Some((sp, flags, size)) = new {
            if flags & SS_DISABLE != 0 {
                self.signals.altstack = AltStack::default();
            } else if size < MINSIGSTKSZ {
                return Err(Errno::Enomem.into());
            } else {
                self.signals.altstack = AltStack { sp, size };
            }
        }

        Ok(Action::Return(0))
    }

    pub(crate) fn rt_sigreturn(&mut self, context: &mut Context<'_>) -> Result<Action> {
        self.sigreturn(&mut context.hart.regs)
            .ok_or(Errno::Einval)?;
        Ok(Action::Resume)
    }
}
