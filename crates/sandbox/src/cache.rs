//! Decoded basic blocks keyed by their start address.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use rvisa::{Instruction, OpCode};

use crate::emulator::{self, Handler};
use crate::mem::{self, GuestMemory};

/// Maximum number of instructions in a block.
pub const MAX_BLOCK_INSTRUCTIONS: usize = 128;

/// Upper bound of the byte length of a block.
pub const MAX_BLOCK_BYTES: u64 = 4 * MAX_BLOCK_INSTRUCTIONS as u64;

/// A decoded instruction paired with the handler executing it.
pub struct Entry<M> {
    pub handler: Handler<M>,
    pub instruction: Instruction,
}

impl<M> Clone for Entry<M> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler,
            instruction: self.instruction,
        }
    }
}

/// A straight-line run of decoded instructions. The last entry is a block terminator, an illegal
/// instruction, or the last instruction before a fetch boundary or the size limit.
pub struct Block<M> {
    pub start: u64,
    pub end: u64,
    pub entries: Vec<Entry<M>>,
}

impl<M> Block<M> {
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Addresses of the instructions in this block.
    pub fn addresses(&self) -> impl Iterator<Item = (u64, &Instruction)> + '_ {
        self.entries.iter().scan(self.start, |address, entry| {
            let current = *address;
            *address += u64::from(entry.instruction.len);
            Some((current, &entry.instruction))
        })
    }
}

/// Fetch and decode the instruction at `address`. Illegal encodings are returned as the decoding
/// error together with the instruction length so that the trap is raised only on execution.
pub fn fetch<M: GuestMemory>(
    memory: &M,
    address: u64,
) -> mem::Result<(u8, std::result::Result<Instruction, rvisa::Error>)> {
    let mut parcel = [0u8; 2];
    memory.fetch(address, &mut parcel)?;
    let low = u16::from_le_bytes(parcel);
    if rvisa::instruction_length(low) == 2 {
        return Ok((2, rvisa::decode(u32::from(low))));
    }

    let mut high = [0u8; 2];
    memory.fetch(address + 2, &mut high)?;
    let bits = u32::from(low) | u32::from(u16::from_le_bytes(high)) << 16;
    Ok((4, rvisa::decode(bits)))
}

/// Cache of decoded blocks. Entries are invalidated precisely when the bytes they were decoded
/// from change.
pub struct DecodeCache<M> {
    blocks: BTreeMap<u64, Arc<Block<M>>>,
}

impl<M> Default for DecodeCache<M> {
    fn default() -> Self {
        Self {
            blocks: Default::default(),
        }
    }
}

impl<M: GuestMemory> DecodeCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn get(&self, address: u64) -> Option<&Arc<Block<M>>> {
        self.blocks.get(&address)
    }

    /// The block starting at `address`, decoding it if necessary. Fails only if the first
    /// instruction cannot be fetched.
    pub fn block(&mut self, memory: &M, address: u64) -> mem::Result<Arc<Block<M>>> {
        if let Some(block) = self.blocks.get(&address) {
            return Ok(Arc::clone(block));
        }

        let block = Arc::new(Self::decode_block(memory, address)?);
        self.blocks.insert(address, Arc::clone(&block));
        Ok(block)
    }

    fn decode_block(memory: &M, start: u64) -> mem::Result<Block<M>> {
        let mut entries = Vec::new();
        let mut address = start;
        while entries.len() < MAX_BLOCK_INSTRUCTIONS {
            let (len, decoded) = match fetch(memory, address) {
                Ok(fetched) => fetched,
                Err(err) if entries.is_empty() => return Err(err),
                Err(_) => break,
            };

            address += u64::from(len);
            match decoded {
                Ok(instruction) => {
                    entries.push(Entry {
                        handler: emulator::handler::<M>(instruction.opcode),
                        instruction,
                    });
                    if instruction.opcode.is_block_terminator() {
                        break;
                    }
                }
                Err(rvisa::Error::IllegalInstruction { bits }) => {
                    let instruction = Instruction::new(OpCode::Ebreak, len).with_imm(i64::from(bits));
                    entries.push(Entry {
                        handler: emulator::illegal::<M>,
                        instruction,
                    });
                    break;
                }
            }
        }

        Ok(Block {
            start,
            end: address,
            entries,
        })
    }

    /// Remove every block whose bytes overlap `range`. Returns the number of removed blocks.
    pub fn invalidate(&mut self, range: &Range<u64>) -> usize {
        let first = range.start.saturating_sub(MAX_BLOCK_BYTES);
        let stale: Vec<u64> = self
            .blocks
            .range(first..range.end)
            .filter(|(_, block)| block.end > range.start)
            .map(|(&start, _)| start)
            .collect();

        for start in &stale {
            self.blocks.remove(start);
        }

        stale.len()
    }
}
