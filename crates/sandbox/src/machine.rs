//! The embedding interface of the sandbox.
//!
//! A [Machine] owns the guest address space, the processor and the emulated kernel of one guest
//! program. The host loads an executable, runs it or calls its functions, and exchanges data
//! through guest memory. Control returns to the host only when the guest returns, exits, is
//! killed, exhausts its step budget, is cancelled or faults.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rvisa::abi;

use crate::emulator::{self, signal, Hart};
use crate::kernel::{Action, Brk, Context, Heap, Kernel, Printer, SyscallFrame, Threads};
use crate::loader::{self, Program, Symbols};
use crate::mem::{self, Memory, Permissions, RegionKind};
use crate::multiprocess::{self, Job, MultiprocessOptions, WorkerResult};
use crate::processor::{self, DispatchMode, Processor, ProcessorState, Run, Stop, EXIT_ADDRESS};
use crate::profiling::{Hotspot, Profiler};
use crate::registers::Registers;
use crate::snapshot::{self, Parts};
use crate::translate::{self, BlockSource, Selection, TranslationMode, TranslationOptions, Translations};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] loader::Error),

    #[error(transparent)]
    Memory(#[from] mem::Error),

    #[error(transparent)]
    Snapshot(#[from] snapshot::Error),

    #[error(transparent)]
    Translate(#[from] translate::Error),

    #[error(transparent)]
    Multiprocess(#[from] multiprocess::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no program is loaded")]
    NotLoaded,

    #[error("symbol {0} not found")]
    UnknownSymbol(String),

    #[error("nested calls exceed the maximum depth of {max}")]
    CallDepthExceeded { max: usize },

    /// Every guest thread is blocked without a timeout.
    #[error("all guest threads are blocked")]
    Deadlock,

    #[error("guest fault at {pc:#x}: {source}")]
    Fault { pc: u64, source: emulator::Error },

    #[error("call exceeded the step limit of {limit} instructions")]
    StepLimit { limit: u64 },

    #[error("guest was killed by signal {signal}")]
    Killed { signal: u32 },

    #[error("call was paused by a system call handler")]
    Paused,

    #[error("execution was cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<processor::Error> for Error {
    fn from(err: processor::Error) -> Self {
        match err {
            processor::Error::Fault { pc, source } => Error::Fault { pc, source },
            processor::Error::InternalError(message) => Error::InternalError(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why [Machine::run] or [Machine::resume] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The program counter reached the host return address.
    Returned,

    Exited(i32),

    /// The guest was terminated by the default action of a signal.
    Killed(u32),

    /// The step budget ran out. Execution may be resumed.
    StepLimit,

    /// A system call handler paused execution. Execution may be resumed.
    Paused,

    /// The cancellation token was raised. Execution may be resumed.
    Cancelled,
}

/// What a host system call handler asks the machine to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallResult {
    /// Write the value to `a0` and continue.
    Return(u64),

    /// Continue with the registers as the handler left them.
    Resume,

    /// Stop with [Outcome::Paused]. Resuming continues after the `ecall`.
    Pause,

    Exit(i32),
}

pub type SyscallHandler = Arc<dyn Fn(&mut Machine, &SyscallFrame) -> Result<SyscallResult> + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Host calls into the guest.
    pub calls: u64,

    /// Calls that ended with a guest fault.
    pub exceptions: u64,

    /// Calls that exhausted their step budget.
    pub timeouts: u64,

    pub instructions: u64,
}

#[derive(Clone)]
pub struct MachineOptions {
    /// Maximum bytes of committed guest memory.
    pub memory_max: u64,

    pub stack_size: u64,

    /// Size of the `brk` area.
    pub brk_size: u64,

    /// Size of the native heap arena. Zero disables the native heap system calls.
    pub heap_size: u64,

    /// Instructions retired by [Machine::run] and [Machine::call] before they stop.
    pub step_limit: u64,

    pub dispatch: DispatchMode,

    pub args: Vec<String>,
    pub env: Vec<String>,
    pub stdin: Vec<u8>,

    /// Receives writes to standard output and standard error. Without a printer they are kept
    /// and returned by [Machine::output].
    pub printer: Option<Printer>,

    /// Seed of `getrandom` and of the auxiliary vector random bytes.
    pub seed: u64,

    /// Instructions a guest thread runs before another runnable thread is scheduled.
    pub thread_quantum: u64,

    /// Sample the program counter every this many instructions.
    pub profiling_interval: Option<u64>,

    /// Maximum nesting of [Machine::preempt].
    pub max_call_depth: usize,

    pub translation: TranslationOptions,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            memory_max: 256 << 20,
            stack_size: 1 << 20,
            brk_size: 16 << 20,
            heap_size: 16 << 20,
            step_limit: 1 << 32,
            dispatch: DispatchMode::default(),
            args: vec!["program".to_string()],
            env: ["LC_CTYPE=C", "LC_ALL=C", "TZ=UTC"]
                .into_iter()
                .map(String::from)
                .collect(),
            stdin: Vec::new(),
            printer: None,
            seed: 0,
            thread_quantum: 10_000,
            profiling_interval: None,
            max_call_depth: 4,
            translation: TranslationOptions::default(),
        }
    }
}

impl std::fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineOptions")
            .field("memory_max", &self.memory_max)
            .field("stack_size", &self.stack_size)
            .field("brk_size", &self.brk_size)
            .field("heap_size", &self.heap_size)
            .field("step_limit", &self.step_limit)
            .field("dispatch", &self.dispatch)
            .field("args", &self.args)
            .field("seed", &self.seed)
            .field("translation", &self.translation)
            .finish_non_exhaustive()
    }
}

impl MachineOptions {
    pub fn with_memory_max(mut self, memory_max: u64) -> Self {
        self.memory_max = memory_max;
        self
    }

    pub fn with_stack_size(mut self, stack_size: u64) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_brk_size(mut self, brk_size: u64) -> Self {
        self.brk_size = brk_size;
        self
    }

    pub fn with_heap_size(mut self, heap_size: u64) -> Self {
        self.heap_size = heap_size;
        self
    }

    pub fn with_step_limit(mut self, step_limit: u64) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_printer(mut self, printer: impl Fn(u32, &[u8]) + Send + Sync + 'static) -> Self {
        self.printer = Some(Arc::new(printer));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_thread_quantum(mut self, thread_quantum: u64) -> Self {
        self.thread_quantum = thread_quantum;
        self
    }

    pub fn with_profiling(mut self, interval: u64) -> Self {
        self.profiling_interval = Some(interval);
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn with_translation(mut self, translation: TranslationOptions) -> Self {
        self.translation = translation;
        self
    }
}

pub struct Machine {
    options: MachineOptions,
    memory: Memory,
    processor: Processor<Memory>,
    kernel: Kernel,
    program: Option<Program>,

    /// The executable, kept for [Machine::reset].
    image: Option<Arc<[u8]>>,

    initial_sp: u64,
    translations: Translations,

    /// Blocks that failed to translate and are not retried.
    untranslatable: BTreeSet<u64>,

    profiler: Option<Profiler>,
    handlers: BTreeMap<u64, SyscallHandler>,
    cancel: Arc<AtomicBool>,
    statistics: Statistics,
    step_limit: u64,

    /// Nesting of calls made through [Machine::preempt].
    depth: usize,
}

impl Machine {
    /// Create an empty machine.
    pub fn new(options: MachineOptions) -> Self {
        let profiler = options.profiling_interval.map(Profiler::new);
        let mut processor = Processor::new(Hart::default(), options.dispatch);
        processor.count_blocks(matches!(options.translation.mode, TranslationMode::Hot { .. }));

        Self {
            memory: Memory::new(options.memory_max),
            processor,
            kernel: Kernel::new(options.seed, options.stdin.clone(), options.printer.clone()),
            program: None,
            image: None,
            initial_sp: 0,
            translations: Translations::new(),
            untranslatable: BTreeSet::new(),
            profiler,
            handlers: BTreeMap::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            statistics: Statistics::default(),
            step_limit: options.step_limit,
            depth: 0,
            options,
        }
    }

    /// Create an empty machine limited to `memory_size` bytes of committed memory.
    pub fn create(memory_size: u64, options: MachineOptions) -> Self {
        Self::new(options.with_memory_max(memory_size))
    }

    pub fn from_elf(bytes: &[u8], options: MachineOptions) -> Result<Self> {
        let mut machine = Self::new(options);
        machine.load(bytes)?;
        Ok(machine)
    }

    /// Load an executable into a fresh address space and prepare the process startup stack.
    /// Returns the entry point. On failure the machine is left empty.
    pub fn load(&mut self, bytes: &[u8]) -> Result<u64> {
        self.program = None;
        self.image = None;
        self.memory = Memory::new(self.options.memory_max);
        self.translations.clear();
        self.untranslatable.clear();

        let result = self.load_program(bytes);
        if result.is_err() {
            self.memory = Memory::new(self.options.memory_max);
        }
        result
    }

    fn load_program(&mut self, bytes: &[u8]) -> Result<u64> {
        let options = &self.options;
        let mut memory = Memory::new(options.memory_max);
        let program = loader::load(&mut memory, bytes)?;
        loader::map_stack(&mut memory, options.stack_size)?;

        let mut kernel = Kernel::new(options.seed, options.stdin.clone(), options.printer.clone());
        kernel.set_stack_size(options.stack_size);

        let brk_start = loader::brk_start(&program)?;
        if options.brk_size > 0 {
            memory.map_fixed(brk_start, options.brk_size, Permissions::READ_WRITE, RegionKind::Brk)?;
        }
        kernel.brk = Brk::new(brk_start, options.brk_size);

        if options.heap_size > 0 {
            let arena = memory.layout().mmap.clone();
            let base = memory.map_in_arena(0, options.heap_size, Permissions::READ_WRITE, RegionKind::Heap, arena)?;
            let size = memory.region(base).map_or(options.heap_size, |region| region.len());
            kernel.heap = Some(Heap::new(base, size));
        }

        let mut random = [0u8; 16];
        kernel.rng_mut().fill(&mut random);
        let sp = loader::setup_stack(&mut memory, &program, &options.args, &options.env, random)?;

        let mut regs = Registers::default();
        regs.pc = program.entry;
        regs.set(abi::SP, sp);
        kernel.threads = Threads::new(regs.clone());

        let mut processor = Processor::new(Hart::new(regs), options.dispatch);
        processor.count_blocks(matches!(options.translation.mode, TranslationMode::Hot { .. }));

        tracing::debug!(
            entry = program.entry,
            sp,
            symbols = program.symbols.len(),
            "loaded program"
        );

        let entry = program.entry;
        self.memory = memory;
        self.kernel = kernel;
        self.processor = processor;
        self.program = Some(program);
        self.image = Some(Arc::from(bytes));
        self.initial_sp = sp;

        if self.options.translation.mode == TranslationMode::AheadOfTime {
            if let Err(err) = self.translate(Selection::WholeProgram) {
                tracing::warn!(%err, "ahead of time translation failed, interpreting");
            }
        }

        Ok(entry)
    }

    fn ensure_loaded(&self) -> Result<()> {
        match self.program {
            Some(_) => Ok(()),
            None => Err(Error::NotLoaded),
        }
    }

    /// Run from the current program counter with the configured step limit.
    pub fn run(&mut self) -> Result<Outcome> {
        self.resume(self.step_limit)
    }

    /// Continue execution for at most `max_instructions` instructions.
    pub fn resume(&mut self, max_instructions: u64) -> Result<Outcome> {
        self.ensure_loaded()?;
        if self.processor.state() == ProcessorState::Halted {
            return Err(Error::InvalidArgument(
                "the program has ended, call a function or reset".to_string(),
            ));
        }

        self.processor.set_state(ProcessorState::Ready);
        self.drive(max_instructions)
    }

    /// Call the guest function at `address` with up to eight integer arguments and return `a0`.
    pub fn call(&mut self, address: u64, args: &[u64]) -> Result<u64> {
        self.ensure_loaded()?;
        if self.depth > 0 {
            return Err(Error::InvalidArgument(
                "calls from system call handlers must use preempt".to_string(),
            ));
        }

        let sp = self.initial_sp & !15;
        self.invoke(address, args, sp)
    }

    pub fn call_by_name(&mut self, symbol: &str, args: &[u64]) -> Result<u64> {
        let address = self
            .address_of(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?;
        self.call(address, args)
    }

    /// Call a guest function from within a system call handler. The interrupted registers are
    /// restored afterwards, whatever the outcome of the call.
    pub fn preempt(&mut self, address: u64, args: &[u64]) -> Result<u64> {
        self.ensure_loaded()?;
        if self.depth >= self.options.max_call_depth {
            return Err(Error::CallDepthExceeded {
                max: self.options.max_call_depth,
            });
        }

        let saved = self.processor.hart().clone();
        let saved_state = self.processor.state();

        // Keep clear of the red zone of the interrupted function
        let sp = saved.regs.get(abi::SP).wrapping_sub(128) & !15;

        self.depth += 1;
        let result = self.invoke(address, args, sp);
        self.depth -= 1;

        let hart = self.processor.hart_mut();
        hart.regs = saved.regs;
        hart.reservation = None;
        self.processor.set_state(saved_state);
        result
    }

    fn invoke(&mut self, address: u64, args: &[u64], sp: u64) -> Result<u64> {
        if args.len() > 8 {
            return Err(Error::InvalidArgument(format!(
                "{count} arguments do not fit in the argument registers",
                count = args.len()
            )));
        }

        self.statistics.calls += 1;
        let regs = &mut self.processor.hart_mut().regs;
        regs.set(abi::SP, sp);
        regs.set_call(address, EXIT_ADDRESS, args);
        self.processor.set_state(ProcessorState::Ready);

        let outcome = self.drive(self.step_limit);
        let a0 = self.processor.hart().regs.get(abi::A0);
        match outcome {
            Ok(Outcome::Returned | Outcome::Exited(_)) => Ok(a0),
            Ok(Outcome::Killed(signal)) => Err(Error::Killed { signal }),
            Ok(Outcome::StepLimit) => {
                self.statistics.timeouts += 1;
                Err(Error::StepLimit {
                    limit: self.step_limit,
                })
            }
            Ok(Outcome::Paused) => Err(Error::Paused),
            Ok(Outcome::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                if matches!(err, Error::Fault { .. }) {
                    self.statistics.exceptions += 1;
                }
                Err(err)
            }
        }
    }

    /// The dispatch loop: run the processor and resolve every stop it reports.
    fn drive(&mut self, max_instructions: u64) -> Result<Outcome> {
        self.translate_hot();

        let deadline = self
            .processor
            .hart()
            .instret
            .saturating_add(max_instructions);
        loop {
            let instret = self.processor.hart().instret;
            if instret >= deadline {
                return Ok(Outcome::StepLimit);
            }

            let remaining = deadline - instret;
            let sliced = self.kernel.threads().runnable() > 1;
            let limit = if sliced {
                remaining.min(self.options.thread_quantum.max(1))
            } else {
                remaining
            };

            let result = {
                let mut run = Run::new(limit)
                    .with_cancel(&self.cancel)
                    .with_profiler(self.profiler.as_mut());
                if !self.translations.is_empty() {
                    run = run.with_translations(&mut self.translations);
                }
                self.processor.run(&mut self.memory, &mut run)
            };

            let stop = match result {
                Ok(stop) => stop,
                Err(processor::Error::Fault { pc, source }) => match self.fault(pc, source)? {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                },
                Err(err) => return Err(err.into()),
            };

            let outcome = match stop {
                Stop::Returned => Some(Outcome::Returned),
                Stop::StepLimit if self.processor.hart().instret >= deadline => Some(Outcome::StepLimit),
                Stop::StepLimit => self.switch_thread()?,
                Stop::Cancelled => {
                    self.cancel.store(false, Ordering::Relaxed);
                    Some(Outcome::Cancelled)
                }
                Stop::Syscall => self.syscall()?,
                Stop::Breakpoint => self.raise(signal::SIGTRAP),
                Stop::SignalReturn => {
                    let regs = &mut self.processor.hart_mut().regs;
                    if self.kernel.sigreturn(regs).is_none() {
                        self.processor.set_state(ProcessorState::Faulted);
                        return Err(Error::InternalError(
                            "signal return without an active signal handler".to_string(),
                        ));
                    }
                    let regs = &mut self.processor.hart_mut().regs;
                    let action = self.kernel.deliver_pending(regs);
                    self.apply(action)?
                }
            };

            if let Some(outcome) = outcome {
                if matches!(outcome, Outcome::Exited(_) | Outcome::Killed(_)) {
                    self.processor.set_state(ProcessorState::Halted);
                }
                return Ok(outcome);
            }
        }
    }

    fn syscall(&mut self) -> Result<Option<Outcome>> {
        let frame = SyscallFrame::from_registers(&self.processor.hart().regs);
        if let Some(handler) = self.handlers.get(&frame.number).cloned() {
            return match handler(self, &frame)? {
                SyscallResult::Return(value) => {
                    self.processor.hart_mut().regs.set(abi::A0, value);
                    Ok(None)
                }
                SyscallResult::Resume => Ok(None),
                SyscallResult::Pause => Ok(Some(Outcome::Paused)),
                SyscallResult::Exit(status) => Ok(Some(Outcome::Exited(status))),
            };
        }

        let empty = Symbols::default();
        let action = {
            let mut context = Context {
                memory: &mut self.memory,
                hart: self.processor.hart_mut(),
                symbols: self.program.as_ref().map_or(&empty, |program| &program.symbols),
            };
            self.kernel.handle(&mut context, &frame)
        };

        self.apply(action)
    }

    fn apply(&mut self, action: Action) -> Result<Option<Outcome>> {
        match action {
            Action::Return(value) => {
                self.processor.hart_mut().regs.set(abi::A0, value);
                Ok(None)
            }
            Action::Resume => Ok(None),
            Action::Exit(status) => Ok(Some(Outcome::Exited(status))),
            Action::Kill(signal) => Ok(Some(Outcome::Killed(signal))),
            Action::Reschedule => self.switch_thread(),
            Action::Fault(err) => {
                // The native call faults like the instruction it replaces, at the ecall
                let pc = self.processor.hart().regs.pc.wrapping_sub(4);
                self.fault(pc, emulator::Error::MemoryAccess(err))
            }
        }
    }

    /// Deliver the signal of a guest fault to a registered handler, or stop with the fault.
    fn fault(&mut self, pc: u64, source: emulator::Error) -> Result<Option<Outcome>> {
        let signal = source.signal();
        let signals = self.kernel.signals();
        if !signals.has_handler(signal) || signals.is_blocked(signal) {
            tracing::debug!(pc, %source, "guest fault");
            self.processor.set_state(ProcessorState::Faulted);
            return Err(Error::Fault { pc, source });
        }

        self.processor.set_state(ProcessorState::Ready);
        let regs = &mut self.processor.hart_mut().regs;
        regs.pc = pc;
        let action = self.kernel.deliver(regs, signal);
        self.apply(action)
    }

    /// Deliver a signal raised by the guest itself, such as `SIGTRAP` from `ebreak`.
    fn raise(&mut self, signal: u32) -> Option<Outcome> {
        let regs = &mut self.processor.hart_mut().regs;
        match self.kernel.deliver(regs, signal) {
            Action::Kill(signal) => Some(Outcome::Killed(signal)),
            _ => None,
        }
    }

    fn switch_thread(&mut self) -> Result<Option<Outcome>> {
        let hart = self.processor.hart_mut();
        hart.reservation = None;
        if self.kernel.threads_mut().switch(&mut hart.regs).is_err() {
            self.processor.set_state(ProcessorState::Faulted);
            return Err(Error::Deadlock);
        }

        let regs = &mut self.processor.hart_mut().regs;
        let action = self.kernel.deliver_pending(regs);
        self.apply(action)
    }

    fn selection_sources(&self, selection: &Selection) -> Vec<BlockSource> {
        match selection {
            Selection::WholeProgram => translate::sources(&self.memory, translate::sweep(&self.memory)),
            Selection::Hot { threshold } => {
                translate::sources(&self.memory, self.processor.hot_blocks(*threshold))
            }
            Selection::Addresses(addresses) => translate::sources(&self.memory, addresses.iter().copied()),
        }
    }

    /// Compile the selected blocks and dispatch to them from now on. Returns the number of
    /// translated blocks.
    pub fn translate(&mut self, selection: Selection) -> Result<usize> {
        self.ensure_loaded()?;
        let sources = self.selection_sources(&selection);
        let module = translate::translate(&sources, &self.options.translation)?;
        let count = module.blocks().len();
        self.translations.install(module);
        Ok(count)
    }

    /// The C source the translator would compile for the selection.
    pub fn emit_translation(&self, selection: Selection) -> Result<String> {
        self.ensure_loaded()?;
        Ok(translate::emit(&self.selection_sources(&selection))?)
    }

    /// Translate blocks that became hot since the last run.
    fn translate_hot(&mut self) {
        let TranslationMode::Hot { threshold } = self.options.translation.mode else {
            return;
        };

        let starts: Vec<u64> = self
            .processor
            .hot_blocks(threshold)
            .into_iter()
            .filter(|start| !self.translations.contains(*start) && !self.untranslatable.contains(start))
            .collect();
        if starts.is_empty() {
            return;
        }

        let sources = translate::sources(&self.memory, starts.iter().copied());
        let translated: BTreeSet<u64> = sources.iter().map(|source| source.start).collect();
        self.untranslatable
            .extend(starts.iter().filter(|start| !translated.contains(*start)));
        if sources.is_empty() {
            return;
        }

        match translate::translate(&sources, &self.options.translation) {
            Ok(module) => self.translations.install(module),
            Err(err) => {
                tracing::warn!(%err, blocks = sources.len(), "hot translation failed, interpreting");
                self.untranslatable.extend(translated);
            }
        }
    }

    /// Run the guest function at `function` on `workers` host threads sharing this machine's
    /// memory. Worker `i` receives `i` and the worker count followed by `args`.
    pub fn multiprocess(&mut self, workers: usize, function: u64, args: &[u64]) -> Result<Vec<WorkerResult>> {
        let options = MultiprocessOptions::default()
            .with_workers(workers)
            .with_stack_size(self.options.stack_size)
            .with_step_limit(self.step_limit);
        self.multiprocess_with(function, args, &options)
    }

    pub fn multiprocess_with(
        &mut self,
        function: u64,
        args: &[u64],
        options: &MultiprocessOptions,
    ) -> Result<Vec<WorkerResult>> {
        self.ensure_loaded()?;

        let template = self.processor.hart().clone();
        let job = Job {
            function,
            args,
            template: &template,
            mode: self.processor.mode(),
            translations: (!self.translations.is_empty()).then_some(&self.translations),
            cancel: Some(self.cancel.as_ref()),
        };
        let results = multiprocess::run(&mut self.memory, &job, options)?;

        for result in &results {
            for (fd, bytes) in &result.output {
                self.kernel.print(*fd, bytes);
            }
        }
        Ok(results)
    }

    /// Read mapped guest memory regardless of its permissions.
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if len as u64 > self.memory.limit() {
            return Err(Error::InvalidArgument(format!(
                "reading {len} bytes exceeds the memory limit"
            )));
        }

        let mut buf = vec![0u8; len];
        self.memory.host_read(address, &mut buf)?;
        Ok(buf)
    }

    /// Write mapped guest memory regardless of its permissions.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.memory.host_write(address, data)?)
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    pub fn read_string(&self, address: u64, max_len: usize) -> Result<String> {
        let bytes = self.memory.read_c_string(address, max_len)?;
        String::from_utf8(bytes)
            .map_err(|err| Error::InvalidArgument(format!("string at {address:#x} is not utf-8: {err}")))
    }

    /// Copy host data into a new guest mapping and return its address.
    pub fn share(&mut self, data: &[u8], writable: bool) -> Result<u64> {
        Ok(self.memory.share(data, writable)?)
    }

    /// Copy a shared array back to the host and unmap it.
    pub fn unshare(&mut self, address: u64) -> Result<Vec<u8>> {
        Ok(self.memory.unshare(address)?)
    }

    pub fn map(&mut self, hint: u64, len: u64, permissions: Permissions) -> Result<u64> {
        Ok(self.memory.map(hint, len, permissions)?)
    }

    pub fn unmap(&mut self, address: u64, len: u64) -> Result<()> {
        Ok(self.memory.unmap(address, len)?)
    }

    pub fn protect(&mut self, address: u64, len: u64, permissions: Permissions) -> Result<()> {
        Ok(self.memory.protect(address, len, permissions)?)
    }

    /// Serialize the machine state. Caches and translated code are not included.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        let parts = Parts {
            hart: self.processor.hart(),
            memory: &self.memory,
            kernel: &self.kernel,
            program: self.program.as_ref(),
            initial_sp: self.initial_sp,
            image: self.image.as_deref(),
            samples: self.profiler.as_ref().map(Profiler::samples),
        };
        Ok(snapshot::encode(&parts))
    }

    /// Create a machine from a snapshot.
    pub fn restore(bytes: &[u8], options: MachineOptions) -> Result<Self> {
        let restored = snapshot::decode(bytes, options.printer.clone())?;

        let mut machine = Self::new(options);
        machine.memory = restored.memory;
        machine.kernel = restored.kernel;
        machine.program = restored.program;
        machine.image = restored.image.map(Arc::from);
        machine.initial_sp = restored.initial_sp;
        machine.processor = Processor::new(restored.hart, machine.options.dispatch);
        machine.processor.count_blocks(matches!(
            machine.options.translation.mode,
            TranslationMode::Hot { .. }
        ));
        if let (Some(profiler), Some(samples)) = (&mut machine.profiler, restored.samples) {
            profiler.set_samples(samples);
        }

        tracing::debug!(bytes = bytes.len(), "restored snapshot");
        if machine.program.is_some() && machine.options.translation.mode == TranslationMode::AheadOfTime {
            if let Err(err) = machine.translate(Selection::WholeProgram) {
                tracing::warn!(%err, "ahead of time translation failed, interpreting");
            }
        }
        Ok(machine)
    }

    /// Copy the machine. The copy shares translated code but nothing else, and has its own
    /// cancellation token.
    pub fn fork(&self) -> Self {
        let mut processor = Processor::new(self.processor.hart().clone(), self.processor.mode());
        processor.set_state(self.processor.state());
        processor.count_blocks(matches!(self.options.translation.mode, TranslationMode::Hot { .. }));

        Self {
            options: self.options.clone(),
            memory: self.memory.clone(),
            processor,
            kernel: self.kernel.clone(),
            program: self.program.clone(),
            image: self.image.clone(),
            initial_sp: self.initial_sp,
            translations: self.translations.clone(),
            untranslatable: self.untranslatable.clone(),
            profiler: self.profiler.clone(),
            handlers: self.handlers.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            statistics: Statistics::default(),
            step_limit: self.step_limit,
            depth: 0,
        }
    }

    /// Reload the retained executable for a fresh run. Handlers stay installed.
    pub fn reset(&mut self) -> Result<u64> {
        let image = self.image.clone().ok_or(Error::NotLoaded)?;
        self.statistics = Statistics::default();
        if let Some(profiler) = &mut self.profiler {
            profiler.clear();
        }
        self.load(&image)
    }

    pub fn set_step_limit(&mut self, step_limit: u64) {
        self.step_limit = step_limit;
    }

    pub fn step_limit(&self) -> u64 {
        self.step_limit
    }

    /// Raising the token stops execution at the next instruction boundary with
    /// [Outcome::Cancelled]. The machine lowers it again once observed.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Handle system call `number` on the host, overriding the emulated kernel.
    pub fn install_syscall_handler(
        &mut self,
        number: u64,
        handler: impl Fn(&mut Machine, &SyscallFrame) -> Result<SyscallResult> + Send + Sync + 'static,
    ) {
        self.handlers.insert(number, Arc::new(handler));
    }

    pub fn remove_syscall_handler(&mut self, number: u64) -> Option<SyscallHandler> {
        self.handlers.remove(&number)
    }

    pub fn address_of(&self, symbol: &str) -> Option<u64> {
        self.program
            .as_ref()?
            .symbols
            .get(symbol)
            .map(|symbol| symbol.address)
    }

    pub fn symbols(&self) -> Option<&Symbols> {
        self.program.as_ref().map(|program| &program.symbols)
    }

    /// The `count` most frequently sampled addresses. Empty unless profiling is enabled.
    pub fn hotspots(&self, count: usize) -> Vec<Hotspot> {
        let empty = Symbols::default();
        let symbols = self.symbols().unwrap_or(&empty);
        self.profiler
            .as_ref()
            .map(|profiler| profiler.hotspots(count, symbols))
            .unwrap_or_default()
    }

    pub fn clear_hotspots(&mut self) {
        if let Some(profiler) = &mut self.profiler {
            profiler.clear();
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            instructions: self.processor.hart().instret,
            ..self.statistics
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.processor.state()
    }

    pub fn registers(&self) -> &Registers {
        &self.processor.hart().regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.processor.hart_mut().regs
    }

    pub fn set_dispatch_mode(&mut self, mode: DispatchMode) {
        self.processor.set_mode(mode);
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn translations(&self) -> &Translations {
        &self.translations
    }

    /// Guest output collected while no printer is installed.
    pub fn output(&self) -> &[u8] {
        self.kernel.output()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.kernel.take_output()
    }
}
