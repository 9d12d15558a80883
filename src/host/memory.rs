//! Sparse paged memory for the simulated debuggee.
//!
//! [`PagedMemory`] maps fixed-size [`Page`]s on demand. Reads and writes that touch
//! an unmapped page fail instead of returning zeroes, which is exactly the failure
//! mode a real debugger reports for unmapped addresses.
//!
//! # Thread Safety
//!
//! Both types use `RwLock` for interior mutability, all operations take `&self`.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::{instruction::Location, Error, Result};

/// Size of a memory page in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// A single page of memory.
#[derive(Debug)]
pub struct Page {
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Page {
    /// Creates a zero-filled page.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if the page lock is poisoned, or
    /// [`Error::InvalidState`] if the range leaves the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len())?;
        let data = self
            .data
            .read()
            .map_err(|_| Error::LockPoisoned("page data"))?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if the page lock is poisoned, or
    /// [`Error::InvalidState`] if the range leaves the page.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = checked_end(offset, data.len())?;
        let mut page = self
            .data
            .write()
            .map_err(|_| Error::LockPoisoned("page data"))?;
        page[offset..end].copy_from_slice(data);
        Ok(())
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

fn checked_end(offset: usize, len: usize) -> Result<usize> {
    let end = offset.saturating_add(len);
    if end > PAGE_SIZE {
        return Err(Error::InvalidState(format!(
            "page access at offset {offset} with size {len} exceeds page size {PAGE_SIZE}"
        )));
    }
    Ok(end)
}

/// Sparse address space built from [`Page`]s.
#[derive(Debug, Default)]
pub struct PagedMemory {
    pages: RwLock<FxHashMap<u64, Arc<Page>>>,
}

impl PagedMemory {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps zero-filled pages covering `[address, address + len)`.
    ///
    /// Pages that are already mapped keep their contents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockPoisoned`] if the page table lock is poisoned.
    pub fn map(&self, address: u64, len: usize) -> Result<()> {
        let mut pages = self
            .pages
            .write()
            .map_err(|_| Error::LockPoisoned("page table"))?;
        for base in page_bases(address, len) {
            pages
                .entry(base)
                .or_insert_with(|| Arc::new(Page::zeroed()));
        }
        Ok(())
    }

    /// Returns true if every byte of `[address, address + len)` is mapped.
    #[must_use]
    pub fn is_mapped(&self, address: u64, len: usize) -> bool {
        self.pages.read().is_ok_and(|pages| {
            page_bases(address, len).all(|base| pages.contains_key(&base))
        })
    }

    /// Reads `len` bytes at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InaccessibleState`] if any byte of the range is unmapped.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.walk(address, len, |page, offset, start, chunk| {
            page.read(offset, &mut buf[start..start + chunk])
        })?;
        Ok(buf)
    }

    /// Writes `data` at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InaccessibleState`] if any byte of the range is unmapped.
    /// Nothing is written in that case.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.walk(address, data.len(), |page, offset, start, chunk| {
            page.write(offset, &data[start..start + chunk])
        })
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.read().map_or(0, |pages| pages.len())
    }

    fn walk<F>(&self, address: u64, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&Page, usize, usize, usize) -> Result<()>,
    {
        let pages = self
            .pages
            .read()
            .map_err(|_| Error::LockPoisoned("page table"))?;

        // Resolve every page first so a partially unmapped range has no effect.
        let mut resolved = Vec::new();
        let mut cursor = address;
        let mut done = 0usize;
        while done < len {
            let base = cursor & !(PAGE_SIZE as u64 - 1);
            let offset = (cursor - base) as usize;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            let Some(page) = pages.get(&base) else {
                return Err(Error::InaccessibleState {
                    location: Location::Memory {
                        address,
                        size: u8::try_from(len).unwrap_or(u8::MAX),
                    },
                    reason: format!("address {cursor:#x} is not mapped"),
                });
            };
            resolved.push((Arc::clone(page), offset, done, chunk));
            done += chunk;
            cursor = cursor.wrapping_add(chunk as u64);
        }
        drop(pages);

        for (page, offset, start, chunk) in resolved {
            f(&page, offset, start, chunk)?;
        }
        Ok(())
    }
}

fn page_bases(address: u64, len: usize) -> impl Iterator<Item = u64> {
    let first = address & !(PAGE_SIZE as u64 - 1);
    let last = address.saturating_add(len.max(1) as u64 - 1) & !(PAGE_SIZE as u64 - 1);
    (first..=last).step_by(PAGE_SIZE)
}
