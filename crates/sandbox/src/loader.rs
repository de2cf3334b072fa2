//! Loading of RISC-V ELF executables and Linux process startup.

use std::collections::BTreeMap;

use elf::abi::{EM_RISCV, ET_EXEC, PT_LOAD, STT_FUNC, STT_OBJECT};
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::mem::{self, page_align_up, GuestMemory, Memory, Permissions, RegionKind};

/// Highest address of the initial stack. The page below the stack region is left unmapped.
pub const STACK_TOP: u64 = 0x40_0000_0000;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse elf: {0}")]
    Parse(#[from] elf::ParseError),

    /// The file is a valid ELF file but cannot run in the sandbox
    #[error("unsupported elf: {0}")]
    Unsupported(String),

    #[error("segment at {address:#x} overlaps another segment")]
    OverlappingSegments { address: u64 },

    #[error(transparent)]
    Memory(#[from] mem::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub kind: SymbolKind,
}

/// Symbols of the loaded program, indexed by name and by address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Symbols {
    by_name: BTreeMap<String, Symbol>,
    by_address: BTreeMap<u64, Symbol>,
}

impl Symbols {
    pub fn insert(&mut self, symbol: Symbol) {
        if symbol.kind == SymbolKind::Function {
            self.by_address.insert(symbol.address, symbol.clone());
        }
        self.by_name.insert(symbol.name.clone(), symbol);
    }

    pub fn get(&self, name: impl AsRef<str>) -> Option<&Symbol> {
        self.by_name.get(name.as_ref())
    }

    /// The function whose body contains `address`.
    pub fn containing(&self, address: u64) -> Option<&Symbol> {
        self.by_address
            .range(..=address)
            .next_back()
            .map(|(_, symbol)| symbol)
            .filter(|symbol| address < symbol.address + symbol.size.max(1))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// A loaded executable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub entry: u64,

    /// Guest address of the program headers, or 0 if no segment contains them.
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,

    /// End of the highest loaded segment.
    pub image_end: u64,

    pub symbols: Symbols,
}

/// Validate `bytes` as a RISC-V executable and map its loadable segments into `memory`.
pub fn load(memory: &mut Memory, bytes: &[u8]) -> Result<Program> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(bytes)?;
    let header = &file.ehdr;

    if header.class != Class::ELF64 {
        return Err(Error::Unsupported("only 64-bit elf files are supported".to_string()));
    }

    if header.endianness != AnyEndian::Little {
        return Err(Error::Unsupported("only little endian elf files are supported".to_string()));
    }

    if header.e_machine != EM_RISCV {
        return Err(Error::Unsupported(format!(
            "machine {machine} is not RISC-V",
            machine = header.e_machine
        )));
    }

    if header.e_type != ET_EXEC {
        return Err(Error::Unsupported(format!(
            "elf type {kind} is not a static executable",
            kind = header.e_type
        )));
    }

    let segments = file
        .segments()
        .ok_or_else(|| Error::Unsupported("elf has no program headers".to_string()))?;

    let mut program = Program {
        entry: header.e_entry,
        phent: u64::from(header.e_phentsize),
        phnum: u64::from(header.e_phnum),
        ..Default::default()
    };

    let mut loaded: Vec<(u64, u64)> = Vec::new();
    for segment in segments.iter().filter(|segment| segment.p_type == PT_LOAD) {
        if segment.p_memsz == 0 {
            continue;
        }

        let start = segment.p_vaddr;
        let end = start
            .checked_add(segment.p_memsz)
            .ok_or_else(|| Error::Unsupported(format!("segment at {start:#x} overflows")))?;

        if segment.p_filesz > segment.p_memsz {
            return Err(Error::Unsupported(format!(
                "segment at {start:#x} has more file bytes than memory bytes"
            )));
        }

        if loaded.iter().any(|&(s, e)| start < e && s < end) {
            return Err(Error::OverlappingSegments { address: start });
        }

        let permissions = Permissions::from_elf_flags(segment.p_flags);
        memory.map_fixed(start, end - start, permissions, RegionKind::Segment)?;

        // Bytes beyond the file contents are never written and read as zero
        let data = file.segment_data(&segment)?;
        memory.host_write(start, data)?;

        let phoff = header.e_phoff;
        if phoff >= segment.p_offset && phoff < segment.p_offset + segment.p_filesz {
            program.phdr = start + (phoff - segment.p_offset);
        }

        tracing::debug!(start, end, %permissions, "loaded segment");
        loaded.push((start, end));
        program.image_end = program.image_end.max(end);
    }

    if loaded.is_empty() {
        return Err(Error::Unsupported("elf has no loadable segments".to_string()));
    }

    if let Some((symbols, strings)) = file.symbol_table()? {
        for symbol in symbols.iter() {
            let kind = match symbol.st_symtype() {
                STT_FUNC => SymbolKind::Function,
                STT_OBJECT => SymbolKind::Object,
                _ => continue,
            };

            let name = strings.get(symbol.st_name as usize)?;
            if name.is_empty() || symbol.st_value == 0 {
                continue;
            }

            program.symbols.insert(Symbol {
                name: name.to_string(),
                address: symbol.st_value,
                size: symbol.st_size,
                kind,
            });
        }
    }

    // Code written during loading must not count as modified code
    memory.take_code_writes();
    tracing::debug!(
        entry = program.entry,
        symbols = program.symbols.len(),
        "loaded program"
    );
    Ok(program)
}

/// Auxiliary vector keys.
mod auxv {
    pub const AT_NULL: u64 = 0;
    pub const AT_PHDR: u64 = 3;
    pub const AT_PHENT: u64 = 4;
    pub const AT_PHNUM: u64 = 5;
    pub const AT_PAGESZ: u64 = 6;
    pub const AT_ENTRY: u64 = 9;
    pub const AT_UID: u64 = 11;
    pub const AT_EUID: u64 = 12;
    pub const AT_GID: u64 = 13;
    pub const AT_EGID: u64 = 14;
    pub const AT_CLKTCK: u64 = 17;
    pub const AT_SECURE: u64 = 23;
    pub const AT_RANDOM: u64 = 25;
}

/// Map a stack of `size` bytes below [STACK_TOP].
pub fn map_stack(memory: &mut Memory, size: u64) -> Result<u64> {
    let size = page_align_up(size.max(mem::PAGE_SIZE))
        .ok_or_else(|| Error::Unsupported(format!("stack size {size:#x} overflows")))?;
    let bottom = STACK_TOP
        .checked_sub(size)
        .filter(|&bottom| bottom >= mem::PAGE_SIZE)
        .ok_or_else(|| Error::Unsupported(format!("stack size {size:#x} is too large")))?;

    memory.map_fixed(bottom, size, Permissions::READ_WRITE, RegionKind::Stack)?;
    Ok(bottom)
}

/// Write the Linux process startup block and return the initial stack pointer.
///
/// ```text
/// sp -> argc
///       argv[0..argc], NULL
///       envp[0..envc], NULL
///       auxv pairs, AT_NULL
///       ... strings and random bytes
/// ```
pub fn setup_stack(
    memory: &mut Memory,
    program: &Program,
    args: &[String],
    env: &[String],
    random: [u8; 16],
) -> Result<u64> {
    let mut cursor = STACK_TOP;
    let mut push_bytes = |memory: &mut Memory, bytes: &[u8]| -> Result<u64> {
        cursor -= bytes.len() as u64;
        memory.write(cursor, bytes)?;
        Ok(cursor)
    };

    let mut push_string = |memory: &mut Memory, value: &String| -> Result<u64> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        push_bytes(memory, &bytes)
    };

    let arg_pointers = args
        .iter()
        .map(|arg| push_string(memory, arg))
        .collect::<Result<Vec<_>>>()?;
    let env_pointers = env
        .iter()
        .map(|var| push_string(memory, var))
        .collect::<Result<Vec<_>>>()?;
    let random_pointer = push_bytes(memory, &random)?;

    let auxv = [
        (auxv::AT_PHDR, program.phdr),
        (auxv::AT_PHENT, program.phent),
        (auxv::AT_PHNUM, program.phnum),
        (auxv::AT_PAGESZ, mem::PAGE_SIZE),
        (auxv::AT_ENTRY, program.entry),
        (auxv::AT_UID, 0),
        (auxv::AT_EUID, 0),
        (auxv::AT_GID, 0),
        (auxv::AT_EGID, 0),
        (auxv::AT_CLKTCK, 100),
        (auxv::AT_SECURE, 0),
        (auxv::AT_RANDOM, random_pointer),
        (auxv::AT_NULL, 0),
    ];

    let mut table = Vec::new();
    table.push(args.len() as u64);
    table.extend(&arg_pointers);
    table.push(0);
    table.extend(&env_pointers);
    table.push(0);
    for (key, value) in auxv {
        table.push(key);
        table.push(value);
    }

    let strings_bottom = random_pointer;
    let sp = (strings_bottom - table.len() as u64 * 8) & !15;
    let bytes: Vec<u8> = table.iter().flat_map(|word| word.to_le_bytes()).collect();
    memory.write(sp, &bytes)?;

    tracing::debug!(sp, argc = args.len(), envc = env.len(), "initialized stack");
    Ok(sp)
}

/// Start of the `brk` area for a program.
pub fn brk_start(program: &Program) -> Result<u64> {
    page_align_up(program.image_end)
        .ok_or_else(|| Error::Unsupported("program image ends at the top of memory".to_string()))
}
