//! A minimal writer of static RISC-V ELF64 executables with a symbol table.

use super::asm::{Assembler, Function};

/// Load address of the text segment.
pub const TEXT: u64 = 0x1_0000;

/// Load address of the data segment.
pub const DATA: u64 = 0x8_0000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHN_ABS: u16 = 0xfff1;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const STB_GLOBAL: u8 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct Object {
    name: String,
    address: u64,
    size: u64,
}

pub struct Image {
    data: Vec<u8>,
    objects: Vec<Object>,
    writable_text: bool,
    machine: u16,
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

fn align(bytes: &mut Vec<u8>, alignment: usize) {
    while bytes.len() % alignment != 0 {
        bytes.push(0);
    }
}

impl Image {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            objects: Vec::new(),
            writable_text: false,
            machine: EM_RISCV,
        }
    }

    /// Place `bytes` in the data segment and return their address.
    pub fn object(&mut self, name: &str, bytes: &[u8]) -> u64 {
        align(&mut self.data, 8);
        let address = DATA + self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        self.objects.push(Object {
            name: name.to_string(),
            address,
            size: bytes.len() as u64,
        });
        address
    }

    /// Map the text segment writable so the guest can modify its own code.
    pub fn with_writable_text(mut self) -> Self {
        self.writable_text = true;
        self
    }

    pub fn with_machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Write the executable with `code` at [TEXT], starting at the label `entry`.
    pub fn build(&self, code: &Assembler, entry: &str) -> Vec<u8> {
        let (text, functions) = code.finish();
        let entry = code.address_of(entry);
        let segments = if self.data.is_empty() { 1 } else { 2 };

        let mut file = vec![0u8; EHDR_SIZE + segments * PHDR_SIZE];
        align(&mut file, 16);
        let text_offset = file.len();
        file.extend_from_slice(&text);
        align(&mut file, 8);
        let data_offset = file.len();
        file.extend_from_slice(&self.data);

        let (symtab, strtab) = self.symbols(&functions);
        align(&mut file, 8);
        let symtab_offset = file.len();
        file.extend_from_slice(&symtab);
        let strtab_offset = file.len();
        file.extend_from_slice(&strtab);
        align(&mut file, 8);
        let shoff = file.len();

        // Null section, then the symbol table linked to its string table
        file.extend_from_slice(&[0u8; SHDR_SIZE]);
        file.extend(section_header(SHT_SYMTAB, symtab_offset, symtab.len(), 2, 1, SYM_SIZE));
        file.extend(section_header(SHT_STRTAB, strtab_offset, strtab.len(), 0, 0, 0));

        let mut header = Vec::with_capacity(EHDR_SIZE);
        header.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        header.extend_from_slice(&[0u8; 8]);
        header.extend_from_slice(&ET_EXEC.to_le_bytes());
        header.extend_from_slice(&self.machine.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&entry.to_le_bytes());
        header.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        header.extend_from_slice(&(shoff as u64).to_le_bytes());
        header.extend_from_slice(&5u32.to_le_bytes());
        header.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        header.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        header.extend_from_slice(&(segments as u16).to_le_bytes());
        header.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        header.extend_from_slice(&3u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        file[..EHDR_SIZE].copy_from_slice(&header);

        let text_flags = if self.writable_text {
            PF_R | PF_W | PF_X
        } else {
            PF_R | PF_X
        };
        let mut phdrs = program_header(text_flags, text_offset, TEXT, text.len());
        if !self.data.is_empty() {
            phdrs.extend(program_header(PF_R | PF_W, data_offset, DATA, self.data.len()));
        }
        file[EHDR_SIZE..EHDR_SIZE + phdrs.len()].copy_from_slice(&phdrs);
        file
    }

    fn symbols(&self, functions: &[Function]) -> (Vec<u8>, Vec<u8>) {
        let mut symtab = vec![0u8; SYM_SIZE];
        let mut strtab = vec![0u8];

        let entries = functions
            .iter()
            .map(|f| (f.name.as_str(), f.address, f.size, STT_FUNC))
            .chain(
                self.objects
                    .iter()
                    .map(|o| (o.name.as_str(), o.address, o.size, STT_OBJECT)),
            );

        for (name, address, size, kind) in entries {
            let name_offset = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);

            symtab.extend_from_slice(&name_offset.to_le_bytes());
            symtab.push(STB_GLOBAL << 4 | kind);
            symtab.push(0);
            symtab.extend_from_slice(&SHN_ABS.to_le_bytes());
            symtab.extend_from_slice(&address.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
        }

        (symtab, strtab)
    }
}

fn program_header(flags: u32, offset: usize, address: u64, size: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(PHDR_SIZE);
    header.extend_from_slice(&PT_LOAD.to_le_bytes());
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend_from_slice(&(offset as u64).to_le_bytes());
    header.extend_from_slice(&address.to_le_bytes());
    header.extend_from_slice(&address.to_le_bytes());
    header.extend_from_slice(&(size as u64).to_le_bytes());
    header.extend_from_slice(&(size as u64).to_le_bytes());
    header.extend_from_slice(&0x1000u64.to_le_bytes());
    header
}

fn section_header(kind: u32, offset: usize, size: usize, link: u32, info: u32, entsize: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(SHDR_SIZE);
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&kind.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes());
    header.extend_from_slice(&(offset as u64).to_le_bytes());
    header.extend_from_slice(&(size as u64).to_le_bytes());
    header.extend_from_slice(&link.to_le_bytes());
    header.extend_from_slice(&info.to_le_bytes());
    header.extend_from_slice(&8u64.to_le_bytes());
    header.extend_from_slice(&(entsize as u64).to_le_bytes());
    header
}
