//! Binary serialization of machine state.
//!
//! ```text
//! magic    b"RVSBSNAP"
//! version  u32
//! sections (tag: u32, len: u64, payload)*
//! ```
//!
//! All integers are little endian. Readers skip sections with unknown tags. Decode caches and
//! translated code are not captured and are rebuilt after a restore.

use std::collections::{BTreeMap, VecDeque};


use crate::emulator::{Hart, Reservation};
use crate::kernel::heap::Heap;
use crate::kernel::net::{Descriptor, Files, SocketPair};
use crate::kernel::signals::{AltStack, SignalAction, SignalFrame, Signals};
use crate::kernel::threads::{Thread, ThreadState, Threads};
use crate::kernel::{Brk, Kernel, Printer, Rng};
use crate::loader::{Program, Symbol, SymbolKind, Symbols};
use crate::mem::{self, Layout, Memory, Permissions, Region, RegionKind, PAGE_SIZE};
use crate::registers::Registers;

pub const MAGIC: &[u8; 8] = b"RVSBSNAP";
pub const VERSION: u32 = 1;

mod tag {
    pub const HART: u32 = 1;
    pub const MEMORY: u32 = 2;
    pub const PAGES: u32 = 3;
    pub const PROGRAM: u32 = 4;
    pub const KERNEL: u32 = 5;
    pub const IMAGE: u32 = 6;
    pub const PROFILE: u32 = 7;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not a snapshot")]
    BadMagic,

    #[error("unsupported snapshot version {0}, expected {VERSION}")]
    UnsupportedVersion(u32),

    #[error("snapshot truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("snapshot section {0} is missing")]
    MissingSection(u32),

    #[error(transparent)]
    Memory(#[from] mem::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Borrowed state of a machine to serialize.
pub(crate) struct Parts<'a> {
    pub hart: &'a Hart,
    pub memory: &'a Memory,
    pub kernel: &'a Kernel,
    pub program: Option<&'a Program>,
    pub initial_sp: u64,
    pub image: Option<&'a [u8]>,
    pub samples: Option<&'a BTreeMap<u64, u64>>,
}

/// State reconstructed from a snapshot.
pub(crate) struct Restored {
    pub hart: Hart,
    pub memory: Memory,
    pub kernel: Kernel,
    pub program: Option<Program>,
    pub initial_sp: u64,
    pub image: Option<Vec<u8>>,
    pub samples: Option<BTreeMap<u64, u64>>,
}

#[derive(Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.u8(u8::from(value));
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn len(&mut self, len: usize) {
        self.u64(len as u64);
    }

    fn bytes(&mut self, data: &[u8]) {
        self.len(data.len());
        self.bytes.extend_from_slice(data);
    }

    fn section(&mut self, tag: u32, write: impl FnOnce(&mut Writer)) {
        let mut payload = Writer::default();
        write(&mut payload);
        self.u32(tag);
        self.bytes(&payload.bytes);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(Error::Truncated {
                offset: self.offset,
            })?;
        let data = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(data)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(Error::Corrupt(format!("invalid boolean {value}"))),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// A length prefix. Lengths beyond the remaining input are rejected before any allocation.
    fn len(&mut self) -> Result<usize> {
        let len = self.u64()?;
        let remaining = (self.bytes.len() - self.offset) as u64;
        if len > remaining {
            return Err(Error::Truncated {
                offset: self.offset,
            });
        }
        Ok(len as usize)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.len()?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?.to_vec())
            .map_err(|err| Error::Corrupt(format!("invalid string: {err}")))
    }
}

fn write_registers(w: &mut Writer, regs: &Registers) {
    for value in regs.x.iter().chain(regs.f.iter()) {
        w.u64(*value);
    }
    w.u64(regs.pc);
    w.u32(regs.fcsr);
}

fn read_registers(r: &mut Reader<'_>) -> Result<Registers> {
    let mut regs = Registers::default();
    for value in regs.x.iter_mut().chain(regs.f.iter_mut()) {
        *value = r.u64()?;
    }
    regs.x[0] = 0;
    regs.pc = r.u64()?;
    regs.fcsr = r.u32()?;
    Ok(regs)
}

fn write_hart(w: &mut Writer, hart: &Hart) {
    write_registers(w, &hart.regs);
    w.u64(hart.instret);
    match hart.reservation {
        Some(reservation) => {
            w.bool(true);
            w.u64(reservation.address);
            w.u64(reservation.size as u64);
            w.u64(reservation.value);
        }
        None => w.bool(false),
    }
}

fn read_hart(r: &mut Reader<'_>) -> Result<Hart> {
    let regs = read_registers(r)?;
    let instret = r.u64()?;
    let reservation = if r.bool()? {
        let address = r.u64()?;
        let size = r.u64()?;
        if size != 4 && size != 8 {
            return Err(Error::Corrupt(format!("reservation of {size} bytes")));
        }
        Some(Reservation {
            address,
            size: size as usize,
            value: r.u64()?,
        })
    } else {
        None
    };

    Ok(Hart {
        regs,
        instret,
        reservation,
    })
}

fn write_memory(w: &mut Writer, memory: &Memory) {
    w.u64(memory.limit());
    let layout = memory.layout();
    for range in [&layout.mmap, &layout.shared] {
        w.u64(range.start);
        w.u64(range.end);
    }

    let regions: Vec<&Region> = memory.regions().collect();
    w.len(regions.len());
    for region in regions {
        w.u64(region.start);
        w.u64(region.end);
        w.u8(region.permissions.bits());
        w.u8(region.kind.tag());
    }

    w.len(memory.shared.len());
    for (&address, &len) in &memory.shared {
        w.u64(address);
        w.u64(len);
    }
}

fn read_memory(r: &mut Reader<'_>) -> Result<Memory> {
    let limit = r.u64()?;
    let layout = Layout {
        mmap: r.u64()?..r.u64()?,
        shared: r.u64()?..r.u64()?,
    };

    let mut memory = Memory::with_layout(limit, layout);
    for _ in 0..r.len()? {
        let start = r.u64()?;
        let end = r.u64()?;
        let permissions = Permissions::from_bits(r.u8()?);
        let tag = r.u8()?;
        let kind = RegionKind::from_tag(tag)
            .ok_or_else(|| Error::Corrupt(format!("unknown region kind {tag}")))?;
        if end <= start {
            return Err(Error::Corrupt(format!("empty region at {start:#x}")));
        }
        memory.map_fixed(start, end - start, permissions, kind)?;
    }

    for _ in 0..r.len()? {
        let address = r.u64()?;
        let len = r.u64()?;
        memory.shared.insert(address, len);
    }

    Ok(memory)
}

fn write_pages(w: &mut Writer, memory: &Memory) {
    let pages: Vec<(u64, &[u8])> = memory.pages().collect();
    w.len(pages.len());
    for (address, contents) in pages {
        w.u64(address);
        w.bytes.extend_from_slice(contents);
    }
}

fn read_pages(r: &mut Reader<'_>, memory: &mut Memory) -> Result<()> {
    for _ in 0..r.len()? {
        let address = r.u64()?;
        let contents = r.take(PAGE_SIZE as usize)?;
        memory.insert_page(address, contents)?;
    }
    Ok(())
}

fn write_program(w: &mut Writer, program: Option<&Program>, initial_sp: u64) {
    let Some(program) = program else {
        w.bool(false);
        return;
    };

    w.bool(true);
    w.u64(program.entry);
    w.u64(program.phdr);
    w.u64(program.phent);
    w.u64(program.phnum);
    w.u64(program.image_end);
    w.u64(initial_sp);

    let symbols: Vec<&Symbol> = program.symbols.iter().collect();
    w.len(symbols.len());
    for symbol in symbols {
        w.bytes(symbol.name.as_bytes());
        w.u64(symbol.address);
        w.u64(symbol.size);
        w.u8(match symbol.kind {
            SymbolKind::Function => 0,
            SymbolKind::Object => 1,
        });
    }
}

fn read_program(r: &mut Reader<'_>) -> Result<Option<(Program, u64)>> {
    if !r.bool()? {
        return Ok(None);
    }

    let mut program = Program {
        entry: r.u64()?,
        phdr: r.u64()?,
        phent: r.u64()?,
        phnum: r.u64()?,
        image_end: r.u64()?,
        symbols: Symbols::default(),
    };
    let initial_sp = r.u64()?;

    for _ in 0..r.len()? {
        let name = r.string()?;
        let address = r.u64()?;
        let size = r.u64()?;
        let kind = match r.u8()? {
            0 => SymbolKind::Function,
            1 => SymbolKind::Object,
            kind => return Err(Error::Corrupt(format!("unknown symbol kind {kind}"))),
        };
        program.symbols.insert(Symbol {
            name,
            address,
            size,
            kind,
        });
    }

    Ok(Some((program, initial_sp)))
}

fn write_heap(w: &mut Writer, heap: Option<&Heap>) {
    let Some(heap) = heap else {
        w.bool(false);
        return;
    };

    w.bool(true);
    w.u64(heap.base);
    w.u64(heap.size);
    w.len(heap.chunks.len());
    for (&address, &len) in &heap.chunks {
        w.u64(address);
        w.u64(len);
    }
}

fn read_heap(r: &mut Reader<'_>) -> Result<Option<Heap>> {
    if !r.bool()? {
        return Ok(None);
    }

    let mut heap = Heap::new(r.u64()?, r.u64()?);
    for _ in 0..r.len()? {
        let address = r.u64()?;
        let len = r.u64()?;
        heap.chunks.insert(address, len);
    }
    Ok(Some(heap))
}

fn write_signals(w: &mut Writer, signals: &Signals) {
    w.u64(signals.mask);
    w.u64(signals.altstack.sp);
    w.u64(signals.altstack.size);
    w.len(signals.actions.len());
    for (&signal, action) in &signals.actions {
        w.u32(signal);
        w.u64(action.handler);
        w.u64(action.flags);
        w.u64(action.mask);
    }
}

fn read_signals(r: &mut Reader<'_>) -> Result<Signals> {
    let mut signals = Signals {
        mask: r.u64()?,
        altstack: AltStack {
            sp: r.u64()?,
            size: r.u64()?,
        },
        ..Default::default()
    };

    for _ in 0..r.len()? {
        let signal = r.u32()?;
        let action = SignalAction {
            handler: r.u64()?,
            flags: r.u64()?,
            mask: r.u64()?,
        };
        signals.actions.insert(signal, action);
    }
    Ok(signals)
}

fn write_files(w: &mut Writer, files: &Files) {
    w.u64(files.next_pair);
    w.len(files.table.len());
    for (&fd, descriptor) in &files.table {
        w.u32(fd as u32);
        match *descriptor {
            Descriptor::Stdin => w.u8(0),
            Descriptor::Stdout => w.u8(1),
            Descriptor::Stderr => w.u8(2),
            Descriptor::Socket { pair, side } => {
                w.u8(3);
                w.u64(pair);
                w.u8(side as u8);
            }
        }
    }

    w.len(files.pairs.len());
    for (&id, pair) in &files.pairs {
        w.u64(id);
        for side in 0..2 {
            let (front, back) = pair.buffers[side].as_slices();
            w.len(front.len() + back.len());
            w.bytes.extend_from_slice(front);
            w.bytes.extend_from_slice(back);
            w.bool(pair.open[side]);
            w.bool(pair.can_read[side]);
            w.bool(pair.can_write[side]);
        }
    }
}

fn read_files(r: &mut Reader<'_>) -> Result<Files> {
    let mut files = Files {
        table: BTreeMap::new(),
        pairs: BTreeMap::new(),
        next_pair: r.u64()?,
    };

    for _ in 0..r.len()? {
        let fd = r.u32()? as i32;
        let descriptor = match r.u8()? {
            0 => Descriptor::Stdin,
            1 => Descriptor::Stdout,
            2 => Descriptor::Stderr,
            3 => {
                let pair = r.u64()?;
                let side = usize::from(r.u8()?);
                if side > 1 {
                    return Err(Error::Corrupt(format!("socket side {side}")));
                }
                Descriptor::Socket { pair, side }
            }
            kind => return Err(Error::Corrupt(format!("unknown descriptor kind {kind}"))),
        };
        files.table.insert(fd, descriptor);
    }

    for _ in 0..r.len()? {
        let id = r.u64()?;
        let mut pair = SocketPair::default();
        for side in 0..2 {
            pair.buffers[side] = VecDeque::from(r.bytes()?.to_vec());
            pair.open[side] = r.bool()?;
            pair.can_read[side] = r.bool()?;
            pair.can_write[side] = r.bool()?;
        }
        files.pairs.insert(id, pair);
    }

    Ok(files)
}

fn write_threads(w: &mut Writer, threads: &Threads) {
    w.u64(threads.current);
    w.u64(threads.next_tid);
    w.len(threads.threads.len());
    for thread in threads.threads.values() {
        w.u64(thread.tid);
        write_registers(w, &thread.regs);
        match thread.state {
            ThreadState::Runnable => w.u8(0),
            ThreadState::Waiting {
                address,
                bitset,
                timed,
            } => {
                w.u8(1);
                w.u64(address);
                w.u32(bitset);
                w.bool(timed);
            }
        }
        w.u64(thread.clear_child_tid);
        w.len(thread.pending_signals.len());
        for &signal in &thread.pending_signals {
            w.u32(signal);
        }
        w.len(thread.signal_frames.len());
        for frame in &thread.signal_frames {
            write_registers(w, &frame.regs);
            w.u64(frame.mask);
        }
    }
}

fn read_threads(r: &mut Reader<'_>) -> Result<Threads> {
    let current = r.u64()?;
    let next_tid = r.u64()?;
    let mut threads = BTreeMap::new();
    for _ in 0..r.len()? {
        let tid = r.u64()?;
        let regs = read_registers(r)?;
        let state = match r.u8()? {
            0 => ThreadState::Runnable,
            1 => ThreadState::Waiting {
                address: r.u64()?,
                bitset: r.u32()?,
                timed: r.bool()?,
            },
            state => return Err(Error::Corrupt(format!("unknown thread state {state}"))),
        };
        let clear_child_tid = r.u64()?;
        let pending_signals = (0..r.len()?)
            .map(|_| r.u32())
            .collect::<Result<Vec<_>>>()?;
        let signal_frames = (0..r.len()?)
            .map(|_| -> Result<SignalFrame> {
                Ok(SignalFrame {
                    regs: read_registers(r)?,
                    mask: r.u64()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        threads.insert(
            tid,
            Thread {
                tid,
                regs,
                state,
                clear_child_tid,
                pending_signals,
                signal_frames,
            },
        );
    }

    if !threads.contains_key(&current) {
        return Err(Error::Corrupt(format!("current thread {current} does not exist")));
    }

    Ok(Threads {
        current,
        threads,
        next_tid,
    })
}

fn write_kernel(w: &mut Writer, kernel: &Kernel) {
    w.u64(kernel.brk.start);
    w.u64(kernel.brk.current);
    w.u64(kernel.brk.end);
    write_heap(w, kernel.heap.as_ref());
    write_signals(w, &kernel.signals);
    write_files(w, &kernel.files);
    write_threads(w, &kernel.threads);
    w.u64(kernel.rng.state);
    w.u64(kernel.clock_offset);
    w.bytes(&kernel.stdin);
    w.len(kernel.stdin_position);
    w.u64(kernel.stack_size);
}

fn read_kernel(r: &mut Reader<'_>, printer: Option<Printer>) -> Result<Kernel> {
    let brk = Brk {
        start: r.u64()?,
        current: r.u64()?,
        end: r.u64()?,
    };
    let heap = read_heap(r)?;
    let signals = read_signals(r)?;
    let files = read_files(r)?;
    let threads = read_threads(r)?;
    let rng = Rng { state: r.u64()? };
    let clock_offset = r.u64()?;
    let stdin = r.bytes()?.to_vec();
    let stdin_position = r.u64()? as usize;
    if stdin_position > stdin.len() {
        return Err(Error::Corrupt(format!(
            "stdin position {stdin_position} beyond {len} bytes",
            len = stdin.len()
        )));
    }
    let stack_size = r.u64()?;

    let mut kernel = Kernel::new(0, stdin, printer);
    kernel.brk = brk;
    kernel.heap = heap;
    kernel.signals = signals;
    kernel.files = files;
    kernel.threads = threads;
    kernel.rng = rng;
    kernel.clock_offset = clock_offset;
    kernel.stdin_position = stdin_position;
    kernel.stack_size = stack_size;
    Ok(kernel)
}

pub(crate) fn encode(parts: &Parts<'_>) -> Vec<u8> {
    let mut w = Writer::default();
    w.bytes.extend_from_slice(MAGIC);
    w.u32(VERSION);

    w.section(tag::HART, |w| write_hart(w, parts.hart));
    w.section(tag::MEMORY, |w| write_memory(w, parts.memory));
    w.section(tag::PAGES, |w| write_pages(w, parts.memory));
    w.section(tag::PROGRAM, |w| write_program(w, parts.program, parts.initial_sp));
    w.section(tag::KERNEL, |w| write_kernel(w, parts.kernel));
    if let Some(image) = parts.image {
        w.section(tag::IMAGE, |w| w.bytes.extend_from_slice(image));
    }
    if let Some(samples) = parts.samples {
        w.section(tag::PROFILE, |w| {
            w.len(samples.len());
            for (&address, &count) in samples {
                w.u64(address);
                w.u64(count);
            }
        });
    }

    tracing::debug!(bytes = w.bytes.len(), "captured snapshot");
    w.bytes
}

fn finished(r: Reader<'_>, tag: u32) -> Result<()> {
    if r.is_empty() {
        Ok(())
    } else {
        Err(Error::Corrupt(format!("trailing bytes in section {tag}")))
    }
}

pub(crate) fn decode(bytes: &[u8], printer: Option<Printer>) -> Result<Restored> {
    let mut r = Reader::new(bytes);
    if r.take(MAGIC.len()).map_err(|_| Error::BadMagic)? != MAGIC {
        return Err(Error::BadMagic);
    }

    let version = r.u32()?;
    if version != VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let mut sections = BTreeMap::new();
    while !r.is_empty() {
        let tag = r.u32()?;
        let payload = r.bytes()?;
        if sections.insert(tag, payload).is_some() {
            return Err(Error::Corrupt(format!("duplicate section {tag}")));
        }
    }

    let section = |tag: u32| sections.get(&tag).copied().ok_or(Error::MissingSection(tag));
    let mut s = Reader::new(section(tag::HART)?);
    let hart = read_hart(&mut s)?;
    finished(s, tag::HART)?;

    let mut s = Reader::new(section(tag::MEMORY)?);
    let mut memory = read_memory(&mut s)?;
    finished(s, tag::MEMORY)?;

    let mut s = Reader::new(section(tag::PAGES)?);
    read_pages(&mut s, &mut memory)?;
    finished(s, tag::PAGES)?;

    let mut s = Reader::new(section(tag::PROGRAM)?);
    let program = read_program(&mut s)?;
    finished(s, tag::PROGRAM)?;

    let mut s = Reader::new(section(tag::KERNEL)?);
    let kernel = read_kernel(&mut s, printer)?;
    finished(s, tag::KERNEL)?;

    let image = sections.get(&tag::IMAGE).map(|image| image.to_vec());
    let samples = match sections.get(&tag::PROFILE) {
        Some(payload) => {
            let mut s = Reader::new(payload);
            let mut samples = BTreeMap::new();
            for _ in 0..s.len()? {
                samples.insert(s.u64()?, s.u64()?);
            }
            finished(s, tag::PROFILE)?;
            Some(samples)
        }
        None => None,
    };

    let unknown: Vec<u32> = sections
        .keys()
        .copied()
        .filter(|&tag| !(tag::HART..=tag::PROFILE).contains(&tag))
        .collect();
    if !unknown.is_empty() {
        tracing::debug!(?unknown, "skipped unknown snapshot sections");
    }

    let (program, initial_sp) = match program {
        Some((program, initial_sp)) => (Some(program), initial_sp),
        None => (None, 0),
    };

    Ok(Restored {
        hart,
        memory,
        kernel,
        program,
        initial_sp,
        image,
        samples,
    })
}
