//! A small RV64IMA assembler with labels, enough to write guest functions for the tests.

use std::collections::BTreeMap;

use rvisa::abi::ZERO;

#[derive(Clone, Copy)]
enum Fixup {
    Branch,
    Jump,

    /// `lui` followed by `addiw` loading the absolute address of the label.
    Address,
}

/// A function symbol and its extent.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

pub struct Assembler {
    base: u64,
    words: Vec<u32>,
    labels: BTreeMap<String, u64>,
    functions: Vec<(String, u64)>,
    fixups: Vec<(usize, String, Fixup)>,
}

fn r_type(opcode: u32, funct3: u32, funct7: u32, rd: u8, rs1: u8, rs2: u8) -> u32 {
    funct7 << 25
        | u32::from(rs2) << 20
        | u32::from(rs1) << 15
        | funct3 << 12
        | u32::from(rd) << 7
        | opcode
}

fn i_type(opcode: u32, funct3: u32, rd: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32) & 0xfff) << 20 | u32::from(rs1) << 15 | funct3 << 12 | u32::from(rd) << 7 | opcode
}

fn s_type(funct3: u32, rs1: u8, rs2: u8, imm: i32) -> u32 {
    let imm = imm as u32;
    (imm >> 5 & 0x7f) << 25
        | u32::from(rs2) << 20
        | u32::from(rs1) << 15
        | funct3 << 12
        | (imm & 0x1f) << 7
        | 0x23
}

fn b_type(funct3: u32, rs1: u8, rs2: u8, offset: i64) -> u32 {
    let imm = offset as u32;
    (imm >> 12 & 1) << 31
        | (imm >> 5 & 0x3f) << 25
        | u32::from(rs2) << 20
        | u32::from(rs1) << 15
        | funct3 << 12
        | (imm >> 1 & 0xf) << 8
        | (imm >> 11 & 1) << 7
        | 0x63
}

fn j_type(rd: u8, offset: i64) -> u32 {
    let imm = offset as u32;
    (imm >> 20 & 1) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 1) << 20
        | (imm >> 12 & 0xff) << 12
        | u32::from(rd) << 7
        | 0x6f
}

/// Split a 32-bit value into the `lui` and `addiw` immediates.
fn split(value: i64) -> (u32, i32) {
    let low = ((value & 0xfff) ^ 0x800) - 0x800;
    let high = (value - low) as u32;
    (high, low as i32)
}

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(0x13, 0, rd, rs1, imm)
}

impl Assembler {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            words: Vec::new(),
            labels: BTreeMap::new(),
            functions: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Address of the next instruction.
    pub fn here(&self) -> u64 {
        self.base + 4 * self.words.len() as u64
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        let address = self.here();
        if self.labels.insert(name.to_string(), address).is_some() {
            panic!("duplicate label {name}");
        }
        self
    }

    /// A label exported as a function symbol.
    pub fn function(&mut self, name: &str) -> &mut Self {
        self.functions.push((name.to_string(), self.here()));
        self.label(name)
    }

    pub fn word(&mut self, word: u32) -> &mut Self {
        self.words.push(word);
        self
    }

    fn fixup(&mut self, label: &str, fixup: Fixup) {
        self.fixups.push((self.words.len(), label.to_string(), fixup));
    }

    pub fn lui(&mut self, rd: u8, imm: u32) -> &mut Self {
        self.word(imm & 0xffff_f000 | u32::from(rd) << 7 | 0x37)
    }

    pub fn addi(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(addi(rd, rs1, imm))
    }

    pub fn addiw(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(i_type(0x1b, 0, rd, rs1, imm))
    }

    pub fn slli(&mut self, rd: u8, rs1: u8, shamt: u32) -> &mut Self {
        self.word(i_type(0x13, 1, rd, rs1, (shamt & 0x3f) as i32))
    }

    pub fn mv(&mut self, rd: u8, rs: u8) -> &mut Self {
        self.addi(rd, rs, 0)
    }

    /// Load a signed 32-bit constant.
    pub fn li(&mut self, rd: u8, value: i64) -> &mut Self {
        assert!(i32::try_from(value).is_ok(), "{value:#x} needs more than 32 bits");
        if (-2048..2048).contains(&value) {
            return self.addi(rd, ZERO, value as i32);
        }

        let (high, low) = split(value);
        self.lui(rd, high);
        if low != 0 {
            self.addiw(rd, rd, low);
        }
        self
    }

    /// Load the address of a label.
    pub fn la(&mut self, rd: u8, label: &str) -> &mut Self {
        self.fixup(label, Fixup::Address);
        self.lui(rd, 0).addiw(rd, rd, 0)
    }

    pub fn add(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x33, 0, 0, rd, rs1, rs2))
    }

    pub fn sub(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x33, 0, 0x20, rd, rs1, rs2))
    }

    pub fn mul(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x33, 0, 1, rd, rs1, rs2))
    }

    pub fn divu(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x33, 5, 1, rd, rs1, rs2))
    }

    pub fn remu(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x33, 7, 1, rd, rs1, rs2))
    }

    pub fn xor(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x33, 4, 0, rd, rs1, rs2))
    }

    pub fn lbu(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(i_type(0x03, 4, rd, rs1, imm))
    }

    pub fn lw(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(i_type(0x03, 2, rd, rs1, imm))
    }

    pub fn ld(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(i_type(0x03, 3, rd, rs1, imm))
    }

    pub fn sb(&mut self, rs2: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(s_type(0, rs1, rs2, imm))
    }

    pub fn sw(&mut self, rs2: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(s_type(2, rs1, rs2, imm))
    }

    pub fn sd(&mut self, rs2: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(s_type(3, rs1, rs2, imm))
    }

    fn branch(&mut self, funct3: u32, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.fixup(label, Fixup::Branch);
        self.word(b_type(funct3, rs1, rs2, 0))
    }

    pub fn beq(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch(0, rs1, rs2, label)
    }

    pub fn bne(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch(1, rs1, rs2, label)
    }

    pub fn bltu(&mut self, rs1: u8, rs2: u8, label: &str) -> &mut Self {
        self.branch(6, rs1, rs2, label)
    }

    pub fn jal(&mut self, rd: u8, label: &str) -> &mut Self {
        self.fixup(label, Fixup::Jump);
        self.word(j_type(rd, 0))
    }

    pub fn j(&mut self, label: &str) -> &mut Self {
        self.jal(ZERO, label)
    }

    pub fn call(&mut self, label: &str) -> &mut Self {
        self.jal(rvisa::abi::RA, label)
    }

    pub fn jalr(&mut self, rd: u8, rs1: u8, imm: i32) -> &mut Self {
        self.word(i_type(0x67, 0, rd, rs1, imm))
    }

    pub fn ret(&mut self) -> &mut Self {
        self.jalr(ZERO, rvisa::abi::RA, 0)
    }

    pub fn ecall(&mut self) -> &mut Self {
        self.word(0x0000_0073)
    }

    pub fn ebreak(&mut self) -> &mut Self {
        self.word(0x0010_0073)
    }

    pub fn fence_i(&mut self) -> &mut Self {
        self.word(0x0000_100f)
    }

    /// `a7 = number; ecall`
    pub fn syscall(&mut self, number: u64) -> &mut Self {
        self.li(rvisa::abi::A7, number as i64).ecall()
    }

    pub fn amoadd_w(&mut self, rd: u8, rs1: u8, rs2: u8) -> &mut Self {
        self.word(r_type(0x2f, 2, 0, rd, rs1, rs2))
    }

    pub fn address_of(&self, label: &str) -> u64 {
        match self.labels.get(label) {
            Some(&address) => address,
            None => panic!("unknown label {label}"),
        }
    }

    /// Resolve label references and return the machine code with its function symbols.
    pub fn finish(&self) -> (Vec<u8>, Vec<Function>) {
        let mut words = self.words.clone();
        for (index, label, fixup) in &self.fixups {
            let target = self.address_of(label);
            let pc = self.base + 4 * *index as u64;
            let offset = target.wrapping_sub(pc) as i64;
            match fixup {
                Fixup::Branch => words[*index] |= b_type(0, 0, 0, offset) & 0xfe00_0f80,
                Fixup::Jump => words[*index] |= j_type(0, offset) & 0xffff_f000,
                Fixup::Address => {
                    let (high, low) = split(target as i64);
                    words[*index] |= high & 0xffff_f000;
                    words[*index + 1] |= ((low as u32) & 0xfff) << 20;
                }
            }
        }

        let end = self.here();
        let mut starts: Vec<(String, u64)> = self.functions.clone();
        starts.sort_by_key(|(_, address)| *address);
        let functions = starts
            .iter()
            .enumerate()
            .map(|(i, (name, address))| {
                let next = starts.get(i + 1).map_or(end, |(_, next)| *next);
                Function {
                    name: name.clone(),
                    address: *address,
                    size: next - address,
                }
            })
            .collect();

        let code = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        (code, functions)
    }
}
