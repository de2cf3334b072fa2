//! The native heap and the accelerated memory and string functions.
//!
//! Guest programs linked against the sandbox runtime route `malloc` and friends to system calls.
//! Allocations live in a dedicated arena region while the bookkeeping stays on the host, out of
//! reach of guest writes.

use std::collections::BTreeMap;

use rvisa::abi;

use crate::kernel::{Action, Context, Errno, Kernel, Result, Syscall, SyscallFrame};
use crate::mem::{self, GuestMemory};

/// Alignment and minimum size of allocations.
pub const ALIGNMENT: u64 = 16;

/// Longest string examined by `strlen` and `strcmp`.
const MAX_STRING: usize = 1 << 20;

fn align(size: u64) -> Option<u64> {
    size.max(1).checked_next_multiple_of(ALIGNMENT)
}

/// First-fit allocator over `[base, base + size)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Heap {
    pub(crate) base: u64,
    pub(crate) size: u64,

    /// Allocated chunks keyed by address, with their aligned lengths.
    pub(crate) chunks: BTreeMap<u64, u64>,
}

/// Usage counters reported by `meminfo`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapInfo {
    pub free: u64,
    pub used: u64,
    pub chunks: u64,
}

impl Heap {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            chunks: Default::default(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Allocate `size` bytes. Returns `None` if the arena is exhausted.
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let len = align(size)?;
        let end = self.base + self.size;
        let mut candidate = self.base;
        for (&start, &chunk) in &self.chunks {
            if start >= candidate && start - candidate >= len {
                break;
            }
            candidate = start + chunk;
        }

        if candidate.checked_add(len)? > end {
            return None;
        }

        self.chunks.insert(candidate, len);
        Some(candidate)
    }

    /// Release the allocation at `address`. Returns `false` for addresses not returned by
    /// [Heap::allocate].
    pub fn free(&mut self, address: u64) -> bool {
        self.chunks.remove(&address).is_some()
    }

    pub fn len_of(&self, address: u64) -> Option<u64> {
        self.chunks.get(&address).copied()
    }

    /// Grow or shrink the allocation in place if the following space allows it.
    fn resize_in_place(&mut self, address: u64, size: u64) -> bool {
        let Some(len) = align(size) else {
            return false;
        };

        let limit = self
            .chunks
            .range(address + 1..)
            .next()
            .map(|(&start, _)| start)
            .unwrap_or(self.base + self.size);

        if address.checked_add(len).is_some_and(|end| end <= limit) {
            self.chunks.insert(address, len);
            true
        } else {
            false
        }
    }

    pub fn info(&self) -> HeapInfo {
        let used: u64 = self.chunks.values().sum();
        HeapInfo {
            free: self.size - used,
            used,
            chunks: self.chunks.len() as u64,
        }
    }
}

impl Kernel {
    pub(crate) fn native(&mut self, context: &mut Context<'_>, frame: &SyscallFrame) -> Result<Action> {
        let result = match frame.number {
            n if n == Syscall::Malloc as u64 => self.malloc(frame.arg(0)),
            n if n == Syscall::Calloc as u64 => self.calloc(context, frame.arg(0), frame.arg(1)),
            n if n == Syscall::Realloc as u64 => self.realloc(context, frame.arg(0), frame.arg(1)),
            n if n == Syscall::Free as u64 => self.free(frame.arg(0)),
            n if n == Syscall::Meminfo as u64 => self.meminfo(context, frame.arg(0)),
            n if n == Syscall::Memcpy as u64 || n == Syscall::Memmove as u64 => {
                memmove(context, frame.arg(0), frame.arg(1), frame.arg(2))
            }
            n if n == Syscall::Memset as u64 => {
                memset(context, frame.arg(0), frame.arg(1) as u8, frame.arg(2))
            }
            n if n == Syscall::Memcmp as u64 => memcmp(context, frame.arg(0), frame.arg(1), frame.arg(2)),
            n if n == Syscall::Strlen as u64 => strlen(context, frame.arg(0)),
            n if n == Syscall::Strcmp as u64 => strcmp(context, frame.arg(0), frame.arg(1), frame.arg(2)),
            n if n == Syscall::Backtrace as u64 => {
                self.backtrace(context);
                Ok(0)
            }
            _ => return Err(Errno::Enosys.into()),
        };

        match result {
            Ok(value) => Ok(Action::Return(value)),
            Err(NativeError::Errno(errno)) => Err(errno.into()),
            Err(NativeError::Fault(err)) => Ok(Action::Fault(err)),
        }
    }

    fn heap_mut(&mut self) -> std::result::Result<&mut Heap, NativeError> {
        self.heap.as_mut().ok_or(NativeError::Errno(Errno::Enosys))
    }

    fn malloc(&mut self, size: u64) -> NativeResult {
        Ok(self.heap_mut()?.allocate(size).unwrap_or(0))
    }

    fn calloc(&mut self, context: &mut Context<'_>, count: u64, size: u64) -> NativeResult {
        let Some(total) = count.checked_mul(size) else {
            return Ok(0);
        };

        let Some(address) = self.heap_mut()?.allocate(total) else {
            return Ok(0);
        };

        memset(context, address, 0, total)?;
        Ok(address)
    }

    fn realloc(&mut self, context: &mut Context<'_>, address: u64, size: u64) -> NativeResult {
        if address == 0 {
            return self.malloc(size);
        }

        let heap = self.heap_mut()?;
        let Some(old_len) = heap.len_of(address) else {
            return Err(NativeError::Fault(mem::Error::InvalidArguments(format!(
                "realloc of unallocated address {address:#x}"
            ))));
        };

        if size == 0 {
            heap.free(address);
            return Ok(0);
        }

        if heap.resize_in_place(address, size) {
            return Ok(address);
        }

        let Some(new) = heap.allocate(size) else {
            return Ok(0);
        };

        memmove(context, new, address, old_len.min(size))?;
        self.heap_mut()?.free(address);
        Ok(new)
    }

    fn free(&mut self, address: u64) -> NativeResult {
        if address == 0 {
            return Ok(0);
        }

        if self.heap_mut()?.free(address) {
            Ok(0)
        } else {
            Err(NativeError::Fault(mem::Error::InvalidArguments(format!(
                "free of unallocated address {address:#x}"
            ))))
        }
    }

    /// Write `{free, used, chunks}` as three 64-bit values.
    fn meminfo(&mut self, context: &mut Context<'_>, address: u64) -> NativeResult {
        let info = self.heap_mut()?.info();
        let mut bytes = [0u8; 24];
        bytes[..8].copy_from_slice(&info.free.to_le_bytes());
        bytes[8..16].copy_from_slice(&info.used.to_le_bytes());
        bytes[16..].copy_from_slice(&info.chunks.to_le_bytes());
        context
            .write_bytes(address, &bytes)
            .map_err(|_| NativeError::Errno(Errno::Efault))?;
        Ok(0)
    }

    /// Print the program counter and return address, symbolized, to standard error.
    fn backtrace(&mut self, context: &Context<'_>) {
        let regs = &context.hart.regs;
        let frames = [regs.pc, regs.get(abi::RA)];
        let mut text = String::new();
        for (i, address) in frames.into_iter().enumerate() {
            let line = match context.symbols.containing(address) {
                Some(symbol) => format!(
                    "[{i}] {address:#x} {name}+{offset:#x}\n",
                    name = symbol.name,
                    offset = address - symbol.address
                ),
                None => format!("[{i}] {address:#x} ??\n"),
            };
            text.push_str(&line);
        }
        self.print(2, text.as_bytes());
    }
}

/// Native functions fault like the code they replace, except for `meminfo`.
enum NativeError {
    Errno(Errno),
    Fault(mem::Error),
}

impl From<mem::Error> for NativeError {
    fn from(err: mem::Error) -> Self {
        NativeError::Fault(err)
    }
}

type NativeResult = std::result::Result<u64, NativeError>;

fn checked_len(context: &Context<'_>, len: u64) -> std::result::Result<usize, NativeError> {
    if len > context.memory.limit() {
        return Err(NativeError::Fault(mem::Error::OutOfMemory {
            limit: context.memory.limit(),
        }));
    }
    Ok(len as usize)
}

fn memmove(context: &mut Context<'_>, dest: u64, src: u64, len: u64) -> NativeResult {
    let mut buf = vec![0u8; checked_len(context, len)?];
    context.memory.read(src, &mut buf)?;
    context.memory.write(dest, &buf)?;
    Ok(dest)
}

fn memset(context: &mut Context<'_>, dest: u64, value: u8, len: u64) -> NativeResult {
    let buf = vec![value; checked_len(context, len)?];
    context.memory.write(dest, &buf)?;
    Ok(dest)
}

fn memcmp(context: &mut Context<'_>, lhs: u64, rhs: u64, len: u64) -> NativeResult {
    let len = checked_len(context, len)?;
    let mut a = vec![0u8; len];
    let mut b = vec![0u8; len];
    context.memory.read(lhs, &mut a)?;
    context.memory.read(rhs, &mut b)?;
    let difference = a
        .iter()
        .zip(&b)
        .find(|(x, y)| x != y)
        .map(|(&x, &y)| i64::from(x) - i64::from(y))
        .unwrap_or(0);
    Ok(difference as u64)
}

fn strlen(context: &mut Context<'_>, address: u64) -> NativeResult {
    let string = context.memory.read_c_string(address, MAX_STRING)?;
    Ok(string.len() as u64)
}

/// Compare at most `max_len` bytes of two strings.
fn strcmp(context: &mut Context<'_>, lhs: u64, rhs: u64, max_len: u64) -> NativeResult {
    let limit = (max_len as usize).min(MAX_STRING);
    let mut offset = 0u64;
    while (offset as usize) < limit {
        let a = context.memory.load::<1>(lhs + offset)?[0];
        let b = context.memory.load::<1>(rhs + offset)?[0];
        if a != b || a == 0 {
            return Ok((i64::from(a) - i64::from(b)) as u64);
        }
        offset += 1;
    }
    Ok(0)
}
