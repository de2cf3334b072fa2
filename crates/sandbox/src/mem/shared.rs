//! Concurrent access to one [Memory] from several host threads.
//!
//! The region table is frozen while a [SharedMemory] exists. Pages of regions without write
//! permission are shared by reference and read without locking. Every other page is guarded by
//! its own mutex, the page token, which serializes writes and atomic updates to that page.
//!
//! The underlying [Memory] is never modified. The first write to a committed page stages a copy
//! of it, and [SharedMemory::finish] hands the staged and newly created pages back to the caller,
//! which commits them only if the run succeeded.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use super::*;

pub struct SharedMemory<'a> {
    regions: &'a BTreeMap<u64, Region>,
    readonly: BTreeMap<u64, &'a Page>,
    writable: BTreeMap<u64, PageToken<'a>>,
    fresh: Mutex<BTreeMap<u64, Page>>,
    committed: u64,
    limit: u64,
}

/// A committed writable page and the copy staged by the first write to it.
struct PageToken<'a> {
    original: &'a Page,
    staged: Mutex<Option<Page>>,
}

/// A page borrowed for the duration of one access.
enum PageRef<'g, 'a> {
    Readonly(&'a Page),
    Locked(MutexGuard<'g, Option<Page>>, &'a Page),
    Fresh(MutexGuard<'g, BTreeMap<u64, Page>>, u64),
    Untouched,
}

fn poisoned<T>(_: T) -> Error {
    Error::InternalError("page token poisoned by a panicking worker".to_string())
}

impl<'a> SharedMemory<'a> {
    /// Split the pages of `memory` for concurrent access.
    pub(crate) fn new(memory: &'a Memory) -> Self {
        let committed = memory.pages.len() as u64 * PAGE_SIZE;
        let mut readonly = BTreeMap::new();
        let mut writable = BTreeMap::new();
        for (&number, page) in &memory.pages {
            let start = number << PAGE_SHIFT;
            let page_writable = memory
                .regions
                .range(..start + PAGE_SIZE)
                .rev()
                .take_while(|(_, region)| region.end > start)
                .any(|(_, region)| region.permissions.write);
            if page_writable {
                writable.insert(
                    number,
                    PageToken {
                        original: page,
                        staged: Mutex::new(None),
                    },
                );
            } else {
                readonly.insert(number, page);
            }
        }

        Self {
            regions: &memory.regions,
            readonly,
            writable,
            fresh: Default::default(),
            committed,
            limit: memory.limit,
        }
    }

    /// Pages written by workers, keyed by page number. Committing them with
    /// [Memory::commit_pages] publishes every write made through the views.
    pub(crate) fn finish(self) -> Result<BTreeMap<u64, Page>> {
        let mut pages = self.fresh.into_inner().map_err(poisoned)?;
        for (number, token) in self.writable {
            if let Some(page) = token.staged.into_inner().map_err(poisoned)? {
                pages.insert(number, page);
            }
        }
        Ok(pages)
    }

    pub fn view(&self) -> SharedView<'_, 'a> {
        SharedView { shared: self }
    }

    fn page<'g>(&'g self, number: u64) -> Result<PageRef<'g, 'a>> {
        if let Some(&page) = self.readonly.get(&number) {
            return Ok(PageRef::Readonly(page));
        }

        if let Some(token) = self.writable.get(&number) {
            let staged = token.staged.lock().map_err(poisoned)?;
            return Ok(PageRef::Locked(staged, token.original));
        }

        let fresh = self.fresh.lock().map_err(poisoned)?;
        if fresh.contains_key(&number) {
            Ok(PageRef::Fresh(fresh, number))
        } else {
            Ok(PageRef::Untouched)
        }
    }

    fn with_page_mut<T>(&self, number: u64, f: impl FnOnce(&mut Page) -> T) -> Result<T> {
        if let Some(token) = self.writable.get(&number) {
            let mut staged = token.staged.lock().map_err(poisoned)?;
            let page = staged.get_or_insert_with(|| token.original.clone());
            return Ok(f(page));
        }

        if self.readonly.contains_key(&number) {
            return Err(Error::InternalError(format!(
                "page {address:#x} is shared read-only",
                address = number << PAGE_SHIFT
            )));
        }

        let mut fresh = self.fresh.lock().map_err(poisoned)?;
        let committed = self.committed + fresh.len() as u64 * PAGE_SIZE;
        let page = match fresh.entry(number) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if committed + PAGE_SIZE > self.limit {
                    return Err(Error::OutOfMemory { limit: self.limit });
                }
                entry.insert(Page::zeroed())
            }
        };
        Ok(f(page))
    }

    fn check_write(&self, address: u64, len: usize) -> Result<()> {
        if check_access(self.regions, address, len, Some(Access::Write))? {
            // Executable pages are immutable while workers run so decoded blocks stay valid
            let permissions = find_region(self.regions, address)
                .map(|region| region.permissions)
                .unwrap_or_default();
            return Err(Error::Protection {
                address,
                access: Access::Write,
                permissions,
            });
        }

        Ok(())
    }

    fn copy_out(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        for (number, page_offset, offset, chunk) in chunks(address, buf.len()) {
            let dest = &mut buf[offset..offset + chunk];
            let source = page_offset..page_offset + chunk;
            match self.page(number)? {
                PageRef::Readonly(page) => dest.copy_from_slice(&page.0[source]),
                PageRef::Locked(staged, original) => {
                    let page = staged.as_ref().unwrap_or(original);
                    dest.copy_from_slice(&page.0[source])
                }
                PageRef::Fresh(fresh, number) => match fresh.get(&number) {
                    Some(page) => dest.copy_from_slice(&page.0[source]),
                    None => dest.fill(0),
                },
                PageRef::Untouched => dest.fill(0),
            }
        }

        Ok(())
    }
}

/// The memory of one worker. All views of a [SharedMemory] observe the same contents.
pub struct SharedView<'s, 'a> {
    shared: &'s SharedMemory<'a>,
}

impl GuestMemory for SharedView<'_, '_> {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        check_access(self.shared.regions, address, buf.len(), Some(Access::Read))?;
        self.shared.copy_out(address, buf)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.shared.check_write(address, data.len())?;
        for (number, page_offset, offset, chunk) in chunks(address, data.len()) {
            self.shared.with_page_mut(number, |page| {
                page.0[page_offset..page_offset + chunk]
                    .copy_from_slice(&data[offset..offset + chunk])
            })?;
        }

        Ok(())
    }

    fn fetch(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        check_access(self.shared.regions, address, buf.len(), Some(Access::Execute))?;
        self.shared.copy_out(address, buf)
    }

    fn code_modified(&self) -> bool {
        false
    }

    fn take_code_writes(&mut self) -> Vec<Range<u64>> {
        Vec::new()
    }

    fn atomic_update(
        &mut self,
        address: u64,
        size: usize,
        update: &mut dyn FnMut(u64) -> u64,
    ) -> Result<u64> {
        if address % size as u64 != 0 {
            return Err(Error::Misaligned { address, size });
        }

        self.shared.check_write(address, size)?;
        check_access(self.shared.regions, address, size, Some(Access::Read))?;

        let page_offset = (address % PAGE_SIZE) as usize;
        self.shared.with_page_mut(address >> PAGE_SHIFT, |page| {
            let bytes = &mut page.0[page_offset..page_offset + size];
            let mut old = [0u8; 8];
            old[..size].copy_from_slice(bytes);
            let old = u64::from_le_bytes(old);
            bytes.copy_from_slice(&update(old).to_le_bytes()[..size]);
            old
        })
    }
}
