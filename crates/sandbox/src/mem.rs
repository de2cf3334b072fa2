use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Range;

mod shared;

pub use shared::{SharedMemory, SharedView};

/// Size of a guest page in bytes
pub const PAGE_SIZE: u64 = 4096;

const PAGE_SHIFT: u32 = 12;

/// Memory result type
pub type Result<T> = std::result::Result<T, Error>;

/// Possible memory errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// There is no region mapped at a particular address
    #[error("address {address:#x} is not mapped")]
    Unmapped { address: u64 },

    /// The region at the address does not permit the access
    #[error("{access} access at {address:#x} violates region permissions {permissions}")]
    Protection {
        address: u64,
        access: Access,
        permissions: Permissions,
    },

    /// Atomic accesses must be naturally aligned
    #[error("misaligned {size}-byte atomic access at {address:#x}")]
    Misaligned { address: u64, size: usize },

    /// Committing another page would exceed the memory limit
    #[error("memory limit of {limit} bytes exceeded")]
    OutOfMemory { limit: u64 },

    /// The arguments provided for a given request are invalid
    #[error("arguments provided are not valid: {0}")]
    InvalidArguments(String),

    /// An internal error that cannot be handled
    #[error("an internal error occurred: {0}")]
    InternalError(String),
}

impl Error {
    /// The guest address that caused the fault, if any.
    pub fn address(&self) -> Option<u64> {
        match self {
            Error::Unmapped { address }
            | Error::Protection { address, .. }
            | Error::Misaligned { address, .. } => Some(*address),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
            Access::Execute => write!(f, "execute"),
        }
    }
}

/// Access permissions of a region
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const NONE: Self = Self::new(false, false, false);
    pub const READ: Self = Self::new(true, false, false);
    pub const READ_WRITE: Self = Self::new(true, true, false);
    pub const READ_EXECUTE: Self = Self::new(true, false, true);
    pub const ALL: Self = Self::new(true, true, true);

    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }

    /// Permissions from the `PROT_*` bits used by `mmap` and `mprotect`.
    pub fn from_prot(prot: u64) -> Self {
        Self::new(prot & 1 != 0, prot & 2 != 0, prot & 4 != 0)
    }

    /// Permissions from the `PF_*` bits of an ELF program header.
    pub fn from_elf_flags(flags: u32) -> Self {
        Self::new(flags & 4 != 0, flags & 2 != 0, flags & 1 != 0)
    }

    pub fn allows(&self, access: Access) -> bool {
        match access {
            Access::Read => self.read,
            Access::Write => self.write,
            Access::Execute => self.execute,
        }
    }

    pub(crate) fn bits(&self) -> u8 {
        u8::from(self.read) | u8::from(self.write) << 1 | u8::from(self.execute) << 2
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        Self::new(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0)
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = |set, c| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.execute, 'x')
        )
    }
}

/// The purpose of a region. Only some kinds may be unmapped by the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// A loaded ELF segment
    Segment,
    Stack,
    /// The area managed by the `brk` system call
    Brk,
    /// An anonymous mapping created by the guest or the host
    Mmap,
    /// The arena of the native heap system calls
    Heap,
    /// Host data shared with the guest
    Shared,
}

impl RegionKind {
    pub fn name(&self) -> &'static str {
        match self {
            RegionKind::Segment => "segment",
            RegionKind::Stack => "stack",
            RegionKind::Brk => "brk",
            RegionKind::Mmap => "mmap",
            RegionKind::Heap => "heap",
            RegionKind::Shared => "shared",
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            RegionKind::Segment => 0,
            RegionKind::Stack => 1,
            RegionKind::Brk => 2,
            RegionKind::Mmap => 3,
            RegionKind::Heap => 4,
            RegionKind::Shared => 5,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(RegionKind::Segment),
            1 => Some(RegionKind::Stack),
            2 => Some(RegionKind::Brk),
            3 => Some(RegionKind::Mmap),
            4 => Some(RegionKind::Heap),
            5 => Some(RegionKind::Shared),
            _ => None,
        }
    }

    fn unmappable(&self) -> bool {
        matches!(self, RegionKind::Mmap | RegionKind::Shared | RegionKind::Heap)
    }
}

/// A contiguous span of guest address space with uniform permissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub permissions: Permissions,
    pub kind: RegionKind,
}

impl Region {
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, address: u64) -> bool {
        self.range().contains(&address)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{start:#x}-{end:#x} {permissions} {kind}",
            start = self.start,
            end = self.end,
            permissions = self.permissions,
            kind = self.kind.name()
        )
    }
}

/// Address ranges searched when the guest or host maps memory without a fixed address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Arena of anonymous mappings
    pub mmap: Range<u64>,

    /// Arena of host arrays shared with the guest
    pub shared: Range<u64>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            mmap: 0x20_0000_0000..0x30_0000_0000,
            shared: 0x30_0000_0000..0x38_0000_0000,
        }
    }
}

/// A single committed page of guest memory
#[derive(Clone)]
pub(crate) struct Page(Box<[u8; PAGE_SIZE as usize]>);

impl Page {
    fn zeroed() -> Self {
        Self(Box::new([0; PAGE_SIZE as usize]))
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}

/// Round up to the next page boundary, or `None` on overflow.
pub fn page_align_up(value: u64) -> Option<u64> {
    value.checked_next_multiple_of(PAGE_SIZE)
}

pub fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

fn find_region(regions: &BTreeMap<u64, Region>, address: u64) -> Option<&Region> {
    regions
        .range(..=address)
        .next_back()
        .map(|(_, region)| region)
        .filter(|region| region.contains(address))
}

/// Verify that `[address, address + len)` is mapped and, if `access` is provided, that every
/// region permits it. Returns whether any of the regions is executable.
fn check_access(
    regions: &BTreeMap<u64, Region>,
    address: u64,
    len: usize,
    access: Option<Access>,
) -> Result<bool> {
    let end = address
        .checked_add(len as u64)
        .ok_or(Error::Unmapped { address })?;

    let mut executable = false;
    let mut cursor = address;
    while cursor < end {
        let region = find_region(regions, cursor).ok_or(Error::Unmapped { address: cursor })?;

        if let Some(access) = access {
            if !region.permissions.allows(access) {
                return Err(Error::Protection {
                    address: cursor,
                    access,
                    permissions: region.permissions,
                });
            }
        }

        executable |= region.permissions.execute;
        cursor = region.end.min(end);
    }

    Ok(executable)
}

/// Split an access into `(page number, page offset, buffer offset, length)` pieces.
fn chunks(address: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize, usize)> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset >= len {
            return None;
        }
        let current = address + offset as u64;
        let page_offset = (current % PAGE_SIZE) as usize;
        let chunk = (PAGE_SIZE as usize - page_offset).min(len - offset);
        let item = (current >> PAGE_SHIFT, page_offset, offset, chunk);
        offset += chunk;
        Some(item)
    })
}

/// Memory interface used by instruction execution. Implemented by [Memory] for a single running
/// hart and by [SharedView] for workers sharing one [Memory].
pub trait GuestMemory {
    /// Read guest memory into `buf`. Requires read permission.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` to guest memory. Requires write permission.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Read instruction bytes. Requires execute permission.
    fn fetch(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Whether a write has modified executable memory since the last invalidation.
    fn code_modified(&self) -> bool;

    /// Take the byte ranges of executable memory modified since the last call.
    fn take_code_writes(&mut self) -> Vec<Range<u64>>;

    /// Atomically replace the naturally aligned value at `address` with `update(old)`, returning
    /// the old value. `size` is either 4 or 8.
    fn atomic_update(
        &mut self,
        address: u64,
        size: usize,
        update: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64> {
        if address % size as u64 != 0 {
            return Err(Error::Misaligned { address, size });
        }

        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes[..size])?;
        let old = u64::from_le_bytes(bytes);
        let new = update(old);
        self.write(address, &new.to_le_bytes()[..size])?;
        Ok(old)
    }

    fn load<const N: usize>(&self, address: u64) -> Result<[u8; N]>
    where
        Self: Sized,
    {
        let mut bytes = [0u8; N];
        self.read(address, &mut bytes)?;
        Ok(bytes)
    }
}

/// The linear address space of a guest. Regions describe which addresses are valid and pages
/// hold the committed contents. Untouched pages of a region read as zero.
#[derive(Debug, Clone)]
pub struct Memory {
    pages: BTreeMap<u64, Page>,
    regions: BTreeMap<u64, Region>,
    layout: Layout,
    limit: u64,
    code_writes: Vec<Range<u64>>,

    /// Byte length of each shared array keyed by its address.
    pub(crate) shared: BTreeMap<u64, u64>,
}

impl Memory {
    /// Create an empty address space which may commit at most `limit` bytes.
    pub fn new(limit: u64) -> Self {
        Self::with_layout(limit, Layout::default())
    }

    pub fn with_layout(limit: u64, layout: Layout) -> Self {
        Self {
            pages: Default::default(),
            regions: Default::default(),
            layout,
            limit,
            code_writes: Default::default(),
            shared: Default::default(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Number of bytes committed to pages.
    pub fn committed(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// The region containing `address`.
    pub fn region(&self, address: u64) -> Option<&Region> {
        find_region(&self.regions, address)
    }

    fn overlaps(&self, range: &Range<u64>) -> bool {
        // Regions do not overlap, so only the last region starting before the end can intersect
        self.regions
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, region)| region.end > range.start)
    }

    /// Map a region at a fixed address. The range must not overlap an existing region.
    pub fn map_fixed(
        &mut self,
        start: u64,
        len: u64,
        permissions: Permissions,
        kind: RegionKind,
    ) -> Result<()> {
        let end = start.checked_add(len).ok_or_else(|| {
            Error::InvalidArguments(format!("region {start:#x} + {len:#x} overflows"))
        })?;

        if len == 0 {
            return Err(Error::InvalidArguments(format!(
                "cannot map empty region at {start:#x}"
            )));
        }

        if self.overlaps(&(start..end)) {
            return Err(Error::InvalidArguments(format!(
                "region {start:#x}-{end:#x} overlaps an existing region"
            )));
        }

        let region = Region {
            start,
            end,
            permissions,
            kind,
        };
        tracing::trace!(%region, "mapped region");
        if permissions.execute {
            self.code_writes.push(start..end);
        }
        self.regions.insert(start, region);
        Ok(())
    }

    /// Map an anonymous region. A page-aligned `hint` inside the mmap arena is used if the range
    /// is free. Otherwise the lowest free address of the arena is chosen, which keeps address
    /// selection deterministic for a given sequence of mappings.
    pub fn map(&mut self, hint: u64, len: u64, permissions: Permissions) -> Result<u64> {
        let arena = self.layout.mmap.clone();
        self.map_in_arena(hint, len, permissions, RegionKind::Mmap, arena)
    }

    pub(crate) fn map_in_arena(
        &mut self,
        hint: u64,
        len: u64,
        permissions: Permissions,
        kind: RegionKind,
        arena: Range<u64>,
    ) -> Result<u64> {
        if len == 0 {
            return Err(Error::InvalidArguments("cannot map zero bytes".to_string()));
        }

        let len = page_align_up(len).ok_or(Error::OutOfMemory { limit: self.limit })?;
        if len > self.limit {
            return Err(Error::OutOfMemory { limit: self.limit });
        }

        let hint_usable = hint != 0
            && hint % PAGE_SIZE == 0
            && hint >= arena.start
            && hint
                .checked_add(len)
                .is_some_and(|end| end <= arena.end && !self.overlaps(&(hint..end)));

        let start = if hint_usable {
            hint
        } else {
            self.find_free(len, &arena)?
        };

        self.map_fixed(start, len, permissions, kind)?;
        Ok(start)
    }

    fn find_free(&self, len: u64, arena: &Range<u64>) -> Result<u64> {
        let mut candidate = arena.start;
        for region in self.regions.values() {
            if region.end <= candidate {
                continue;
            }

            if region.start >= candidate.saturating_add(len) {
                break;
            }

            candidate = page_align_up(region.end).ok_or(Error::OutOfMemory { limit: self.limit })?;
        }

        match candidate.checked_add(len) {
            Some(end) if end <= arena.end => Ok(candidate),
            _ => Err(Error::OutOfMemory { limit: self.limit }),
        }
    }

    /// Remove `range` from all regions, splitting regions that straddle its boundaries. The
    /// removed parts are returned.
    fn carve(&mut self, range: Range<u64>) -> Vec<Region> {
        let overlapping: Vec<u64> = self
            .regions
            .range(..range.end)
            .rev()
            .take_while(|(_, region)| region.end > range.start)
            .map(|(&start, _)| start)
            .collect();

        let mut removed = Vec::with_capacity(overlapping.len());
        for start in overlapping {
            let Some(region) = self.regions.remove(&start) else {
                continue;
            };

            if region.start < range.start {
                let head = Region {
                    end: range.start,
                    ..region.clone()
                };
                self.regions.insert(head.start, head);
            }

            if region.end > range.end {
                let tail = Region {
                    start: range.end,
                    ..region.clone()
                };
                self.regions.insert(tail.start, tail);
            }

            removed.push(Region {
                start: region.start.max(range.start),
                end: region.end.min(range.end),
                ..region
            });
        }

        removed.sort_by_key(|region| region.start);
        removed
    }

    fn page_range(address: u64, len: u64) -> Result<Range<u64>> {
        if address % PAGE_SIZE != 0 {
            return Err(Error::InvalidArguments(format!(
                "address {address:#x} is not page aligned"
            )));
        }

        let end = address
            .checked_add(len)
            .and_then(page_align_up)
            .ok_or_else(|| Error::InvalidArguments(format!("{address:#x} + {len:#x} overflows")))?;
        Ok(address..end)
    }

    /// Unmap the pages of `[address, address + len)`. Only anonymous, heap and shared regions may
    /// be unmapped. Unmapping addresses without a region is not an error.
    pub fn unmap(&mut self, address: u64, len: u64) -> Result<()> {
        let range = Self::page_range(address, len)?;

        let protected = self
            .regions
            .range(..range.end)
            .rev()
            .take_while(|(_, region)| region.end > range.start)
            .find(|(_, region)| !region.kind.unmappable());
        if let Some((_, region)) = protected {
            return Err(Error::InvalidArguments(format!(
                "cannot unmap {kind} region {region}",
                kind = region.kind.name()
            )));
        }

        for region in self.carve(range.clone()) {
            if region.permissions.execute {
                self.code_writes.push(region.range());
            }
        }

        let pages: Vec<u64> = self
            .pages
            .range(range.start >> PAGE_SHIFT..range.end >> PAGE_SHIFT)
            .map(|(&page, _)| page)
            .collect();
        for page in pages {
            self.pages.remove(&page);
        }

        Ok(())
    }

    /// Map a copy of `data` into the shared arena and return its address.
    pub fn share(&mut self, data: &[u8], writable: bool) -> Result<u64> {
        let permissions = if writable {
            Permissions::READ_WRITE
        } else {
            Permissions::READ
        };
        let arena = self.layout.shared.clone();
        let len = (data.len() as u64).max(1);
        let address = self.map_in_arena(0, len, permissions, RegionKind::Shared, arena)?;
        if let Err(err) = self.host_write(address, data) {
            self.unmap(address, len)?;
            return Err(err);
        }

        self.shared.insert(address, data.len() as u64);
        Ok(address)
    }

    /// Copy a shared array back to the host and unmap it.
    pub fn unshare(&mut self, address: u64) -> Result<Vec<u8>> {
        let len = *self.shared.get(&address).ok_or_else(|| {
            Error::InvalidArguments(format!("no shared array at {address:#x}"))
        })?;

        let mut data = vec![0u8; len as usize];
        self.host_read(address, &mut data)?;
        self.unmap(address, len.max(1))?;
        self.shared.remove(&address);
        Ok(data)
    }

    /// Change the permissions of the mapped parts of `[address, address + len)`.
    pub fn protect(&mut self, address: u64, len: u64, permissions: Permissions) -> Result<()> {
        let range = Self::page_range(address, len)?;
        let mut cursor = range.start;
        for region in self.regions.values() {
            if region.end <= cursor {
                continue;
            }
            if region.start > cursor || cursor >= range.end {
                break;
            }
            cursor = region.end;
        }

        if cursor < range.end {
            return Err(Error::Unmapped { address: cursor });
        }

        for region in self.carve(range) {
            if region.permissions.execute || permissions.execute {
                self.code_writes.push(region.range());
            }

            self.regions.insert(
                region.start,
                Region {
                    permissions,
                    ..region
                },
            );
        }

        Ok(())
    }

    /// Discard the contents of the pages in `[address, address + len)`. Subsequent reads return
    /// zero.
    pub fn discard(&mut self, address: u64, len: u64) -> Result<()> {
        let range = Self::page_range(address, len)?;
        let pages: Vec<u64> = self
            .pages
            .range(range.start >> PAGE_SHIFT..range.end >> PAGE_SHIFT)
            .map(|(&page, _)| page)
            .collect();
        for page in pages {
            self.pages.remove(&page);
        }

        if self.region(address).is_some_and(|r| r.permissions.execute) {
            self.code_writes.push(range);
        }

        Ok(())
    }

    fn check(&self, address: u64, len: usize, access: Option<Access>) -> Result<bool> {
        check_access(&self.regions, address, len, access)
    }

    fn copy_out(&self, address: u64, buf: &mut [u8]) {
        for (page, page_offset, offset, chunk) in chunks(address, buf.len()) {
            let dest = &mut buf[offset..offset + chunk];
            match self.pages.get(&page) {
                Some(page) => dest.copy_from_slice(&page.0[page_offset..page_offset + chunk]),
                None => dest.fill(0),
            }
        }
    }

    fn copy_in(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let missing = chunks(address, data.len())
            .filter(|(page, ..)| !self.pages.contains_key(page))
            .count() as u64;
        if self.committed() + missing * PAGE_SIZE > self.limit {
            return Err(Error::OutOfMemory { limit: self.limit });
        }

        for (page, page_offset, offset, chunk) in chunks(address, data.len()) {
            let page = match self.pages.entry(page) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(Page::zeroed()),
            };
            page.0[page_offset..page_offset + chunk].copy_from_slice(&data[offset..offset + chunk]);
        }

        Ok(())
    }

    /// Read mapped memory on behalf of the host. Region permissions are not enforced but every
    /// byte must be mapped.
    pub fn host_read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.check(address, buf.len(), None)?;
        self.copy_out(address, buf);
        Ok(())
    }

    /// Write mapped memory on behalf of the host. Region permissions are not enforced but every
    /// byte must be mapped.
    pub fn host_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let executable = self.check(address, data.len(), None)?;
        self.copy_in(address, data)?;
        if executable && !data.is_empty() {
            self.code_writes.push(address..address + data.len() as u64);
        }
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    pub fn read_c_string(&self, address: u64, max_len: usize) -> Result<Vec<u8>> {
        let mut result = Vec::new();
        let mut cursor = address;
        while result.len() < max_len {
            let page_end = page_align_down(cursor) + PAGE_SIZE;
            let chunk = ((page_end - cursor) as usize).min(max_len - result.len());
            let mut buf = vec![0u8; chunk];
            GuestMemory::read(self, cursor, &mut buf)?;
            if let Some(nul) = buf.iter().position(|&b| b == 0) {
                result.extend_from_slice(&buf[..nul]);
                return Ok(result);
            }
            result.extend_from_slice(&buf);
            cursor += chunk as u64;
        }

        Err(Error::InvalidArguments(format!(
            "string at {address:#x} exceeds {max_len} bytes"
        )))
    }

    /// Committed pages as `(address, contents)` in address order.
    pub fn pages(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.pages
            .iter()
            .map(|(&page, contents)| (page << PAGE_SHIFT, contents.bytes()))
    }

    pub(crate) fn commit_pages(&mut self, pages: BTreeMap<u64, Page>) {
        self.pages.extend(pages);
    }

    /// Commit a page of contents at the page-aligned `address`.
    pub fn insert_page(&mut self, address: u64, contents: &[u8]) -> Result<()> {
        if address % PAGE_SIZE != 0 || contents.len() != PAGE_SIZE as usize {
            return Err(Error::InvalidArguments(format!(
                "page at {address:#x} with {len} bytes is not a full aligned page",
                len = contents.len()
            )));
        }

        if !self.pages.contains_key(&(address >> PAGE_SHIFT)) && self.committed() >= self.limit {
            return Err(Error::OutOfMemory { limit: self.limit });
        }

        let mut page = Page::zeroed();
        page.0.copy_from_slice(contents);
        self.pages.insert(address >> PAGE_SHIFT, page);
        Ok(())
    }
}

impl GuestMemory for Memory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.check(address, buf.len(), Some(Access::Read))?;
        self.copy_out(address, buf);
        Ok(())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let executable = self.check(address, data.len(), Some(Access::Write))?;
        self.copy_in(address, data)?;
        if executable && !data.is_empty() {
            self.code_writes.push(address..address + data.len() as u64);
        }
        Ok(())
    }

    fn fetch(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.check(address, buf.len(), Some(Access::Execute))?;
        self.copy_out(address, buf);
        Ok(())
    }

    fn code_modified(&self) -> bool {
        !self.code_writes.is_empty()
    }

    fn take_code_writes(&mut self) -> Vec<Range<u64>> {
        std::mem::take(&mut self.code_writes)
    }
}
