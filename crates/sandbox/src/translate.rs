//! Binary translation of decoded blocks to native code through the system C compiler.
//!
//! Translated blocks access guest memory only through callbacks into [GuestMemory], so the checks
//! and faults are the same as those of the interpreter.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use rvisa::OpCode;

use crate::cache::{self, MAX_BLOCK_BYTES, MAX_BLOCK_INSTRUCTIONS};
use crate::mem::{self, GuestMemory, Memory};

pub mod codegen;
mod compiler;
mod module;

pub use codegen::BlockSource;
pub use module::{Module, TranslatedBlock};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Translated code assumes a little endian host.
    #[error("translation requires a little endian host")]
    UnsupportedHost,

    #[error("no translatable blocks")]
    NothingToTranslate,

    #[error("failed to run compiler {compiler:?}: {source}")]
    CompilerUnavailable {
        compiler: PathBuf,
        source: std::io::Error,
    },

    #[error("compilation failed: {0}")]
    CompilationFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Library(#[from] libloading::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a translated block stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockExit {
    /// The program counter holds the next instruction to execute.
    Continue,

    /// A store modified executable memory. Pending code writes must be drained before the next
    /// fetch.
    CodeModified,

    /// The memory access of the instruction at `pc` faulted.
    Fault { pc: u64, error: mem::Error },
}

/// When translation happens automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TranslationMode {
    #[default]
    Disabled,

    /// Translate the whole program when it is loaded.
    AheadOfTime,

    /// Translate blocks entered at least `threshold` times, between runs.
    Hot { threshold: u64 },
}

/// Which blocks to translate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Every block found by a linear sweep of executable regions and every direct branch target.
    WholeProgram,

    /// Blocks whose entry count reached `threshold`.
    Hot { threshold: u64 },

    Addresses(Vec<u64>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationOptions {
    pub mode: TranslationMode,

    /// Compiler executable. Defaults to `$CC`, then `cc`.
    pub compiler: Option<PathBuf>,

    pub flags: Vec<String>,

    /// Directory of compiled objects reused across runs.
    pub cache_dir: Option<PathBuf>,
}

impl Default for TranslationOptions {
    fn default() -> Self {
        Self {
            mode: TranslationMode::Disabled,
            compiler: None,
            flags: vec!["-O2".to_string()],
            cache_dir: None,
        }
    }
}

impl TranslationOptions {
    pub fn with_mode(mut self, mode: TranslationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = Some(compiler.into());
        self
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    pub fn compiler(&self) -> PathBuf {
        self.compiler
            .clone()
            .or_else(|| std::env::var_os("CC").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("cc"))
    }
}

/// Installed translated blocks keyed by start address.
#[derive(Clone, Debug, Default)]
pub struct Translations {
    blocks: BTreeMap<u64, TranslatedBlock>,
    modules: Vec<Arc<Module>>,
}

impl Translations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u64) -> Option<TranslatedBlock> {
        self.blocks.get(&address).copied()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.blocks.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Install the blocks of `module`, replacing existing blocks with the same start.
    pub fn install(&mut self, module: Module) {
        let module = Arc::new(module);
        for block in module.blocks() {
            self.blocks.insert(block.start(), *block);
        }
        tracing::info!(blocks = module.blocks().len(), "installed translation module");
        self.modules.push(module);
    }

    /// Remove every block whose bytes overlap `range`. Returns the number of removed blocks.
    pub fn invalidate(&mut self, range: &Range<u64>) -> usize {
        let first = range.start.saturating_sub(MAX_BLOCK_BYTES);
        let stale: Vec<u64> = self
            .blocks
            .range(first..range.end)
            .filter(|(_, block)| block.end() > range.start)
            .map(|(&start, _)| start)
            .collect();

        for start in &stale {
            self.blocks.remove(start);
        }

        if !stale.is_empty() {
            tracing::debug!(
                start = range.start,
                end = range.end,
                removed = stale.len(),
                "invalidated translations"
            );
        }
        stale.len()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.modules.clear();
    }
}

/// The translatable prefix of the block at `start`. Branches and jumps end the block and are
/// included. Any other untranslatable instruction ends the block and is left to the interpreter.
pub fn block_source<M: GuestMemory>(memory: &M, start: u64) -> Option<BlockSource> {
    let mut instructions = Vec::new();
    let mut address = start;
    while instructions.len() < MAX_BLOCK_INSTRUCTIONS && address - start < MAX_BLOCK_BYTES {
        let Ok((len, Ok(instruction))) = cache::fetch(memory, address) else {
            break;
        };

        if !codegen::is_translatable(instruction.opcode) {
            break;
        }

        instructions.push(instruction);
        address += u64::from(len);
        if instruction.opcode.is_block_terminator() {
            break;
        }
    }

    (!instructions.is_empty()).then_some(BlockSource {
        start,
        instructions,
    })
}

/// Block starts found by sweeping the executable regions of `memory`, together with the targets
/// of direct branches and jumps inside them.
pub fn sweep(memory: &Memory) -> BTreeSet<u64> {
    let executable: Vec<Range<u64>> = memory
        .regions()
        .filter(|region| region.permissions.execute)
        .map(|region| region.range())
        .collect();
    let is_executable = |address: u64| executable.iter().any(|range| range.contains(&address));

    let mut starts = BTreeSet::new();
    for range in &executable {
        let mut address = range.start;
        let mut block_start = true;
        while address < range.end {
            let (len, decoded) = match cache::fetch(memory, address) {
                Ok(fetched) => fetched,
                Err(_) => break,
            };

            let Ok(instruction) = decoded else {
                address += u64::from(len);
                block_start = true;
                continue;
            };

            if block_start {
                starts.insert(address);
            }

            if matches!(instruction.opcode, OpCode::Jal | OpCode::Branch(_)) {
                let target = address.wrapping_add(instruction.imm as u64);
                if is_executable(target) {
                    starts.insert(target);
                }
            }

            block_start = instruction.opcode.is_block_terminator();
            address += u64::from(len);
        }
    }

    starts
}

/// Translatable blocks at `starts`.
pub fn sources<M: GuestMemory>(memory: &M, starts: impl IntoIterator<Item = u64>) -> Vec<BlockSource> {
    starts
        .into_iter()
        .filter_map(|start| block_source(memory, start))
        .collect()
}

/// Generate the C source translating `sources` without compiling it.
pub fn emit(sources: &[BlockSource]) -> Result<String> {
    if sources.is_empty() {
        return Err(Error::NothingToTranslate);
    }
    Ok(codegen::generate(sources))
}

/// Compile and load `sources`.
pub fn translate(sources: &[BlockSource], options: &TranslationOptions) -> Result<Module> {
    if !cfg!(target_endian = "little") {
        return Err(Error::UnsupportedHost);
    }

    let source = emit(sources)?;
    let object = compiler::compile(&source, options)?;
    let module = Module::load(&object.path, sources)?;
    tracing::debug!(
        blocks = sources.len(),
        path = %object.path.display(),
        "compiled translation module"
    );
    Ok(module)
}
