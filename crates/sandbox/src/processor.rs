use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use rvisa::Instruction;

use crate::cache::{self, DecodeCache};
use crate::emulator::{self, ControlFlow, Hart};
use crate::mem::GuestMemory;
use crate::profiling::Profiler;
use crate::translate::{BlockExit, Translations};

/// Return address of host calls. Reaching it ends the call.
pub const EXIT_ADDRESS: u64 = 0x40_0000_1000;

/// Return address of signal handlers. Reaching it restores the interrupted context.
pub const SIGRETURN_ADDRESS: u64 = 0x40_0000_2000;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The guest faulted while executing the instruction at `pc`
    #[error("fault at {pc:#x}: {source}")]
    Fault { pc: u64, source: emulator::Error },

    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How decoded instructions are dispatched by the interpreter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Execute cached blocks of instructions with pre-resolved handlers.
    #[default]
    Threaded,

    /// Fetch, decode and match every instruction individually.
    Precise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProcessorState {
    /// Execution may begin or resume.
    #[default]
    Ready,

    Running,

    /// Stopped at a system call or breakpoint which must be resolved before resuming.
    Trapped,

    /// The guest has returned to the host or exited.
    Halted,

    /// An unrecoverable fault occurred.
    Faulted,
}

/// The reason the processor stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// An `ecall` retired. The program counter refers to the following instruction.
    Syscall,

    /// An `ebreak` retired. The program counter refers to the following instruction.
    Breakpoint,

    /// The program counter reached [EXIT_ADDRESS].
    Returned,

    /// The program counter reached [SIGRETURN_ADDRESS].
    SignalReturn,

    /// The instruction budget of the run is exhausted.
    StepLimit,

    /// The cancellation flag was raised.
    Cancelled,
}

/// Limits and optional services of one run.
pub struct Run<'a> {
    /// Maximum number of instructions to retire.
    pub limit: u64,

    pub cancel: Option<&'a AtomicBool>,

    pub translations: Option<&'a mut Translations>,

    pub profiler: Option<&'a mut Profiler>,
}

impl<'a> Run<'a> {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            cancel: None,
            translations: None,
            profiler: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_translations(mut self, translations: &'a mut Translations) -> Self {
        self.translations = Some(translations);
        self
    }

    pub fn with_profiler(mut self, profiler: Option<&'a mut Profiler>) -> Self {
        self.profiler = profiler;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    }
}

/// Executes guest instructions of one hart against a memory.
pub struct Processor<M> {
    hart: Hart,
    state: ProcessorState,
    cache: DecodeCache<M>,
    mode: DispatchMode,
    block_counts: Option<BTreeMap<u64, u64>>,
}

impl<M: GuestMemory> Processor<M> {
    pub fn new(hart: Hart, mode: DispatchMode) -> Self {
        Self {
            hart,
            state: ProcessorState::Ready,
            cache: DecodeCache::new(),
            mode,
            block_counts: None,
        }
    }

    pub fn hart(&self) -> &Hart {
        &self.hart
    }

    pub fn hart_mut(&mut self) -> &mut Hart {
        &mut self.hart
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessorState) {
        self.state = state;
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DispatchMode) {
        self.mode = mode;
    }

    pub fn cache(&self) -> &DecodeCache<M> {
        &self.cache
    }

    /// Count how often each block is entered by threaded dispatch.
    pub fn count_blocks(&mut self, enabled: bool) {
        self.block_counts = enabled.then(BTreeMap::new);
    }

    /// Start addresses of blocks entered at least `threshold` times.
    pub fn hot_blocks(&self, threshold: u64) -> Vec<u64> {
        self.block_counts
            .iter()
            .flatten()
            .filter(|(_, &count)| count >= threshold)
            .map(|(&address, _)| address)
            .collect()
    }

    /// Discard decoded blocks and block counts.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        if let Some(counts) = &mut self.block_counts {
            counts.clear();
        }
    }

    fn invalidate(&mut self, ranges: &[Range<u64>], translations: Option<&mut Translations>) {
        for range in ranges {
            let removed = self.cache.invalidate(range);
            tracing::trace!(start = range.start, end = range.end, removed, "invalidated code");
        }

        if let Some(translations) = translations {
            for range in ranges {
                translations.invalidate(range);
            }
        }
    }

    /// Execute until the guest stops. Faults leave the program counter at the faulting
    /// instruction.
    pub fn run(&mut self, memory: &mut M, run: &mut Run<'_>) -> Result<Stop> {
        let writes = memory.take_code_writes();
        self.invalidate(&writes, run.translations.as_deref_mut());

        self.state = ProcessorState::Running;
        let result = self.execute(memory, run);
        self.state = match &result {
            Ok(Stop::Returned) => ProcessorState::Halted,
            Ok(Stop::StepLimit | Stop::Cancelled) => ProcessorState::Ready,
            Ok(_) => ProcessorState::Trapped,
            Err(_) => ProcessorState::Faulted,
        };

        result
    }

    fn execute(&mut self, memory: &mut M, run: &mut Run<'_>) -> Result<Stop> {
        let limit = self.hart.instret.saturating_add(run.limit);
        loop {
            let pc = self.hart.regs.pc;
            if pc == EXIT_ADDRESS {
                return Ok(Stop::Returned);
            }

            if pc == SIGRETURN_ADDRESS {
                return Ok(Stop::SignalReturn);
            }

            if self.hart.instret >= limit {
                return Ok(Stop::StepLimit);
            }

            if run.cancelled() {
                return Ok(Stop::Cancelled);
            }

            if self.run_translated(memory, run, limit)? {
                continue;
            }

            let stop = match self.mode {
                DispatchMode::Threaded => self.run_block(memory, run, limit)?,
                DispatchMode::Precise => self.run_instruction(memory, run)?,
            };

            if let Some(stop) = stop {
                return Ok(stop);
            }
        }
    }

    /// Execute the translated block at the program counter if one exists and the budget covers
    /// all of its instructions. Returns whether a block was executed.
    fn run_translated(&mut self, memory: &mut M, run: &mut Run<'_>, limit: u64) -> Result<bool> {
        let Some(translations) = run.translations.as_deref_mut() else {
            return Ok(false);
        };

        let pc = self.hart.regs.pc;
        let Some(block) = translations.get(pc) else {
            return Ok(false);
        };

        if limit - self.hart.instret < block.instructions() {
            return Ok(false);
        }

        tracing::trace!(pc, "dispatching translated block");
        let before = self.hart.instret;
        let (exit, retired) = block.execute(&mut self.hart.regs, memory);
        self.hart.instret += retired;
        if let Some(profiler) = run.profiler.as_deref_mut() {
            profiler.sample_range(before, self.hart.instret, pc);
        }

        match exit {
            BlockExit::Continue => Ok(true),
            BlockExit::CodeModified => {
                let writes = memory.take_code_writes();
                self.invalidate(&writes, Some(translations));
                Ok(true)
            }
            BlockExit::Fault { pc, error } => Err(Error::Fault {
                pc,
                source: error.into(),
            }),
        }
    }

    fn run_block(&mut self, memory: &mut M, run: &mut Run<'_>, limit: u64) -> Result<Option<Stop>> {
        let start = self.hart.regs.pc;
        let block = self
            .cache
            .block(memory, start)
            .map_err(|err| Error::Fault {
                pc: start,
                source: err.into(),
            })?;

        if let Some(counts) = &mut self.block_counts {
            *counts.entry(start).or_default() += 1;
        }

        for entry in &block.entries {
            if self.hart.instret >= limit {
                return Ok(Some(Stop::StepLimit));
            }

            if run.cancelled() {
                return Ok(Some(Stop::Cancelled));
            }

            let pc = self.hart.regs.pc;
            if let Some(profiler) = run.profiler.as_deref_mut() {
                profiler.sample(self.hart.instret, pc);
            }

            let flow = (entry.handler)(&mut self.hart, memory, &entry.instruction)
                .map_err(|source| Error::Fault { pc, source })?;

            if let Some(stop) = self.retire(pc, &entry.instruction, flow) {
                return Ok(Some(stop));
            }

            if entry.instruction.opcode.writes_memory() && memory.code_modified() {
                let writes = memory.take_code_writes();
                self.invalidate(&writes, run.translations.as_deref_mut());
                break;
            }
        }

        Ok(None)
    }

    fn run_instruction(&mut self, memory: &mut M, run: &mut Run<'_>) -> Result<Option<Stop>> {
        let pc = self.hart.regs.pc;
        if let Some(profiler) = run.profiler.as_deref_mut() {
            profiler.sample(self.hart.instret, pc);
        }

        let fault = |source: emulator::Error| Error::Fault { pc, source };
        let (_, decoded) = cache::fetch(memory, pc).map_err(|err| fault(err.into()))?;
        let instruction = decoded.map_err(|err| fault(err.into()))?;
        let flow = emulator::execute(&mut self.hart, memory, &instruction).map_err(fault)?;

        if let Some(stop) = self.retire(pc, &instruction, flow) {
            return Ok(Some(stop));
        }

        if instruction.opcode.writes_memory() && memory.code_modified() {
            let writes = memory.take_code_writes();
            self.invalidate(&writes, run.translations.as_deref_mut());
        }

        Ok(None)
    }

    /// Count the instruction as retired and advance the program counter.
    fn retire(&mut self, pc: u64, instruction: &Instruction, flow: ControlFlow) -> Option<Stop> {
        self.hart.instret += 1;
        let next = pc.wrapping_add(u64::from(instruction.len));
        match flow {
            ControlFlow::NextInstruction => {
                self.hart.regs.pc = next;
                None
            }
            ControlFlow::Jump(target) => {
                self.hart.regs.pc = target;
                None
            }
            ControlFlow::Syscall => {
                self.hart.regs.pc = next;
                Some(Stop::Syscall)
            }
            ControlFlow::Breakpoint => {
                self.hart.regs.pc = next;
                Some(Stop::Breakpoint)
            }
        }
    }
}
