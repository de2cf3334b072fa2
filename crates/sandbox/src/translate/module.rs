//! Loaded translation modules and the calling convention of translated blocks.

use std::ffi::c_void;
use std::path::Path;

use libloading::Library;

use super::codegen::{self, BlockSource, STATUS_CODE_MODIFIED, STATUS_CONTINUE};
use super::{BlockExit, Result};
use crate::mem::{self, GuestMemory};
use crate::registers::Registers;

/// Memory callbacks and exit information shared with translated code. Must match `struct rv_api`
/// of the generated prelude.
#[repr(C)]
struct Api {
    opaque: *mut c_void,
    load: extern "C" fn(*mut c_void, u64, u32, *mut u64) -> i32,
    store: extern "C" fn(*mut c_void, u64, u32, u64) -> i32,
    retired: u64,
    fault_pc: u64,
}

type BlockFn = unsafe extern "C" fn(*mut u64, *mut u64, *mut Api) -> i32;

struct Context<'m, M> {
    memory: &'m mut M,
    fault: Option<mem::Error>,
}

extern "C" fn load_callback<M: GuestMemory>(
    opaque: *mut c_void,
    address: u64,
    size: u32,
    value: *mut u64,
) -> i32 {
    // SAFETY: opaque is the context created by TranslatedBlock::execute for the current call
    let context = unsafe { &mut *(opaque as *mut Context<'_, M>) };
    let mut bytes = [0u8; 8];
    let len = (size as usize).min(bytes.len());
    match context.memory.read(address, &mut bytes[..len]) {
        Ok(()) => {
            // SAFETY: value points to a local of the generated block
            unsafe { *value = u64::from_le_bytes(bytes) };
            STATUS_CONTINUE
        }
        Err(err) => {
            context.fault = Some(err);
            codegen::STATUS_FAULT
        }
    }
}

extern "C" fn store_callback<M: GuestMemory>(
    opaque: *mut c_void,
    address: u64,
    size: u32,
    value: u64,
) -> i32 {
    // SAFETY: opaque is the context created by TranslatedBlock::execute for the current call
    let context = unsafe { &mut *(opaque as *mut Context<'_, M>) };
    let bytes = value.to_le_bytes();
    let len = (size as usize).min(bytes.len());
    match context.memory.write(address, &bytes[..len]) {
        Ok(()) if context.memory.code_modified() => STATUS_CODE_MODIFIED,
        Ok(()) => STATUS_CONTINUE,
        Err(err) => {
            context.fault = Some(err);
            codegen::STATUS_FAULT
        }
    }
}

/// A natively compiled block. Only valid while the [Module] it was resolved from is loaded.
#[derive(Clone, Copy)]
pub struct TranslatedBlock {
    start: u64,
    end: u64,
    instructions: u64,
    function: BlockFn,
}

impl std::fmt::Debug for TranslatedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatedBlock")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("instructions", &self.instructions)
            .finish_non_exhaustive()
    }
}

impl TranslatedBlock {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Upper bound of the instructions retired by one execution.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Run the block from `regs.pc`. Returns how the block exited and the number of retired
    /// instructions. On a fault the program counter refers to the faulting instruction.
    pub fn execute<M: GuestMemory>(&self, regs: &mut Registers, memory: &mut M) -> (BlockExit, u64) {
        let mut context = Context {
            memory,
            fault: None,
        };
        let mut api = Api {
            opaque: &mut context as *mut Context<'_, M> as *mut c_void,
            load: load_callback::<M>,
            store: store_callback::<M>,
            retired: 0,
            fault_pc: 0,
        };

        let mut pc = regs.pc;
        // SAFETY: the function was compiled from generated source with the BlockFn signature and
        // its library stays loaded while the owning module is installed
        let status = unsafe { (self.function)(regs.x.as_mut_ptr(), &mut pc, &mut api) };
        regs.x[0] = 0;
        regs.pc = pc;

        let exit = match status {
            STATUS_CONTINUE => BlockExit::Continue,
            STATUS_CODE_MODIFIED => BlockExit::CodeModified,
            _ => BlockExit::Fault {
                pc: api.fault_pc,
                error: context.fault.take().unwrap_or_else(|| {
                    mem::Error::InternalError(format!("translated block returned {status}"))
                }),
            },
        };
        (exit, api.retired)
    }
}

/// A loaded shared object together with the blocks it exports.
pub struct Module {
    blocks: Vec<TranslatedBlock>,
    _library: Library,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn open(path: &Path) -> Result<Library> {
    use libloading::os::unix;

    // SAFETY: generated objects have no initializers
    let library = unsafe { unix::Library::open(Some(path), unix::RTLD_NOW)? };
    Ok(library.into())
}

#[cfg(not(unix))]
fn open(path: &Path) -> Result<Library> {
    // SAFETY: generated objects have no initializers
    Ok(unsafe { Library::new(path)? })
}

impl Module {
    /// Load the shared object at `path` and resolve the functions of `sources`.
    pub(super) fn load(path: &Path, sources: &[BlockSource]) -> Result<Self> {
        let library = open(path)?;
        let blocks = sources
            .iter()
            .map(|source| {
                let name = codegen::symbol_name(source.start);
                // SAFETY: every exported block function has the BlockFn signature
                let function = unsafe { *library.get::<BlockFn>(name.as_bytes())? };
                Ok(TranslatedBlock {
                    start: source.start,
                    end: source.end(),
                    instructions: source.instructions.len() as u64,
                    function,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            blocks,
            _library: library,
        })
    }

    pub fn blocks(&self) -> &[TranslatedBlock] {
        &self.blocks
    }
}
