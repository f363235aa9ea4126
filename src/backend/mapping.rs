use std::fs::File;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{Mutex, RwLock};

use super::crypto::{fake_offset, real_offset, AesCryptor};
use crate::api::*;

/// Sections follow a fixed doubling schedule so that the partition of the
/// data space is the same in every session: a node placed to avoid a section
/// boundary in one process will avoid it in all of them.
pub(crate) const SECTION_MIN: usize = 64 * 1024;
pub(crate) const SECTION_MAX: usize = 16 * 1024 * 1024;

/// Length of the section at a given index in the schedule.
fn section_len(index: usize) -> usize {
    SECTION_MIN.checked_shl(index as u32).unwrap_or(SECTION_MAX).min(SECTION_MAX)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PageState {
    /// Not materialized; the plaintext must be decrypted from the file.
    Absent,
    /// Plaintext matches the file.
    Clean,
    /// Plaintext modified by the open transaction; flushed on commit.
    Dirty,
}

enum SectionMem {
    /// Plain files: a raw mapping of the section's byte range.
    Map(MmapRaw),
    /// Encrypted files: a stable heap buffer of decrypted pages.
    Buf { ptr: *mut u8, len: usize },
}

struct Section {
    start: usize,
    len: usize,
    mem: SectionMem,
}

impl Section {
    fn ptr(&self) -> *mut u8 {
        match &self.mem {
            SectionMem::Map(m) => m.as_mut_ptr(),
            SectionMem::Buf { ptr, .. } => *ptr,
        }
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        if let SectionMem::Buf { ptr, len } = self.mem {
            // reconstitute the leaked buffer so it frees
            unsafe {
                drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr, len) as *mut [u8]))
            };
        }
    }
}

struct CryptState {
    cryptor: AesCryptor,
    pages: Vec<PageState>,
}

/// The translation target for refs: a logical, contiguous data space backed
/// either by mmap sections of the file or, when encryption is on, by heap
/// sections holding decrypted pages (spec'd alternative to fault-driven
/// decryption: all access funnels through `slice`/`slice_mut`).
///
/// Section memory is never moved or unmapped while the `Mapping` lives, so
/// slices handed out stay valid for the borrow of `self` even across `grow`.
pub(crate) struct Mapping {
    file: File,
    sections: RwLock<Vec<Section>>,
    crypt: Option<Mutex<CryptState>>,
}

// Raw section pointers are shared across reader threads; all mutation goes
// through the single writer or under the crypt lock.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map an existing (possibly empty) file. The data space is padded up to
    /// the next section boundary; fresh files therefore start life at
    /// `SECTION_MIN` bytes of logical space.
    pub fn open(file: File, key: Option<&EncryptionKey>) -> Result<Mapping> {
        let crypt = key.map(|k| {
            Mutex::new(CryptState { cryptor: AesCryptor::new(k), pages: Vec::new() })
        });
        let mut mapping = Mapping { file, sections: RwLock::new(Vec::new()), crypt };

        let physical = mapping.file.metadata()?.len() as usize;
        let logical = if mapping.crypt.is_some() {
            if physical == 0 { 0 } else { fake_offset(physical) }
        } else {
            physical
        };
        mapping.grow(logical.max(SECTION_MIN))?;
        Ok(mapping)
    }

    pub fn file(&self) -> &File { &self.file }

    pub fn is_encrypted(&self) -> bool { self.crypt.is_some() }

    /// Total logical bytes currently mapped.
    pub fn data_len(&self) -> usize {
        self.sections.read().last().map(|s| s.start + s.len).unwrap_or(0)
    }

    /// Extend the data space (and the file) to cover at least `min_len`.
    pub fn grow(&self, min_len: usize) -> Result<()> {
        let end = self.grow_sections(min_len)?;
        // lock order is always crypt before sections, so the page-state
        // resize happens after the section lock is gone
        if let Some(crypt) = &self.crypt {
            crypt.lock().pages.resize(end / PAGE_SIZE, PageState::Absent);
        }
        Ok(())
    }

    fn grow_sections(&self, min_len: usize) -> Result<usize> {
        let mut sections = self.sections.write();
        let mut end = sections.last().map(|s| s.start + s.len).unwrap_or(0);
        while end < min_len {
            let len = section_len(sections.len());
            let new_end = end + len;
            log::trace!("mapping section {} at {:#x}+{:#x}", sections.len(), end, len);

            let physical_len =
                if self.crypt.is_some() { real_offset(new_end) } else { new_end };
            if self.file.metadata()?.len() < physical_len as u64 {
                self.file.set_len(physical_len as u64)?;
            }

            let mem = if self.crypt.is_some() {
                let buf = vec![0u8; len].into_boxed_slice();
                SectionMem::Buf { ptr: Box::into_raw(buf) as *mut u8, len }
            } else {
                let map = MmapOptions::new()
                    .offset(end as u64)
                    .len(len)
                    .map_raw(&self.file)?;
                SectionMem::Map(map)
            };
            sections.push(Section { start: end, len, mem });
            end = new_end;
        }
        Ok(end)
    }

    /// Pick up growth performed by another process on the same file.
    pub fn sync_size(&self) -> Result<()> {
        let physical = self.file.metadata()?.len() as usize;
        let logical =
            if self.crypt.is_some() { fake_offset(physical) } else { physical };
        if logical > self.data_len() {
            self.grow(logical)?;
        }
        Ok(())
    }

    fn section_at(&self, pos: usize, len: usize) -> Result<*mut u8> {
        let sections = self.sections.read();
        let idx = sections.partition_point(|s| s.start + s.len <= pos);
        let sec = sections
            .get(idx)
            .ok_or(Error::InvalidArgument("offset beyond mapped space"))?;
        if pos + len > sec.start + sec.len {
            // the allocator never places a node across a section boundary
            return Err(Error::CorruptedFile("range crosses a mapping section"));
        }
        Ok(unsafe { sec.ptr().add(pos - sec.start) })
    }

    /// Decrypt any absent pages covering `[pos, pos + len)`, optionally
    /// marking them dirty for the flush pass.
    fn materialize(&self, pos: usize, len: usize, for_write: bool) -> Result<()> {
        let crypt = match &self.crypt {
            Some(c) => c,
            None => return Ok(()),
        };
        let mut state = crypt.lock();
        let first = pos / PAGE_SIZE;
        let last = (pos + len - 1) / PAGE_SIZE;
        for page in first..=last {
            if page >= state.pages.len() {
                return Err(Error::InvalidArgument("offset beyond mapped space"));
            }
            if state.pages[page] == PageState::Absent {
                let page_pos = page * PAGE_SIZE;
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(self.section_at(page_pos, PAGE_SIZE)?, PAGE_SIZE)
                };
                state.cryptor.read_page(&self.file, page_pos, dst)?;
                state.pages[page] = PageState::Clean;
            }
            if for_write {
                state.pages[page] = PageState::Dirty;
            }
        }
        Ok(())
    }

    /// Read access to a range of the data space.
    pub fn slice(&self, pos: usize, len: usize) -> Result<&[u8]> {
        if len == 0 {
            return Ok(&[]);
        }
        self.materialize(pos, len, false)?;
        let ptr = self.section_at(pos, len)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Write access to a range of the data space. Only the transaction writer
    /// calls this, and only for nodes unreachable from any committed version,
    /// so handing out `&mut` from `&self` cannot alias a reader's view.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, pos: usize, len: usize) -> Result<&mut [u8]> {
        if len == 0 {
            return Ok(&mut []);
        }
        self.materialize(pos, len, true)?;
        let ptr = self.section_at(pos, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    pub fn write(&self, pos: usize, bytes: &[u8]) -> Result<()> {
        self.slice_mut(pos, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Push every dirty page (encrypted) or the whole mapping (plain) to the
    /// OS; the caller follows up with an fsync.
    pub fn flush(&self) -> Result<()> {
        match &self.crypt {
            Some(crypt) => {
                let mut state = crypt.lock();
                for page in 0..state.pages.len() {
                    if state.pages[page] != PageState::Dirty {
                        continue;
                    }
                    let page_pos = page * PAGE_SIZE;
                    let src = unsafe {
                        std::slice::from_raw_parts(self.section_at(page_pos, PAGE_SIZE)?, PAGE_SIZE)
                    };
                    state.cryptor.write_page(&self.file, page_pos, src)?;
                    state.pages[page] = PageState::Clean;
                }
            }
            None => {
                for sec in self.sections.read().iter() {
                    if let SectionMem::Map(m) = &sec.mem {
                        m.flush().map_err(Error::Io)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Forget uncommitted plaintext after an abort: dirty pages revert to
    /// absent and re-read the committed bytes on next access.
    pub fn discard_dirty(&self) {
        if let Some(crypt) = &self.crypt {
            let mut state = crypt.lock();
            for page in state.pages.iter_mut() {
                if *page == PageState::Dirty {
                    *page = PageState::Absent;
                }
            }
        }
    }

    /// Drop clean plaintext and cached IV tables so subsequent access re-reads
    /// the file. Used when another process committed. Dirty pages (an open
    /// local transaction) are left alone.
    pub fn invalidate_clean(&self) {
        if let Some(crypt) = &self.crypt {
            let mut state = crypt.lock();
            for page in state.pages.iter_mut() {
                if *page == PageState::Clean {
                    *page = PageState::Absent;
                }
            }
            state.cryptor.invalidate_iv_cache();
        }
    }

    /// Read the file header straight from disk, bypassing any cached
    /// plaintext, to detect commits made by other processes.
    pub fn read_header_fresh(&self) -> Result<[u8; FILE_HEADER_SIZE]> {
        let mut header = [0u8; FILE_HEADER_SIZE];
        match &self.crypt {
            Some(crypt) => {
                let mut state = crypt.lock();
                state.cryptor.invalidate_iv_cache();
                let mut page = [0u8; PAGE_SIZE];
                state.cryptor.read_page(&self.file, 0, &mut page)?;
                header.copy_from_slice(&page[..FILE_HEADER_SIZE]);
            }
            None => {
                header.copy_from_slice(self.slice(0, FILE_HEADER_SIZE)?);
            }
        }
        Ok(header)
    }

    /// Durably apply a header mutation. The caller sequences these writes
    /// (slot first, fsync, then the selector flip) to get commit atomicity;
    /// each call here persists exactly one state of the header page.
    pub fn write_header(&self, at: usize, bytes: &[u8]) -> Result<()> {
        debug_assert!(at + bytes.len() <= FILE_HEADER_SIZE);
        match &self.crypt {
            Some(crypt) => {
                // read-modify-write of the whole first page through the cache
                self.materialize(0, PAGE_SIZE, false)?;
                let page = self.section_at(0, PAGE_SIZE)?;
                unsafe {
                    std::slice::from_raw_parts_mut(page.add(at), bytes.len())
                        .copy_from_slice(bytes)
                };
                let src = unsafe { std::slice::from_raw_parts(page, PAGE_SIZE) };
                let mut state = crypt.lock();
                state.cryptor.write_page(&self.file, 0, src)?;
                if state.pages[0] == PageState::Absent {
                    state.pages[0] = PageState::Clean;
                }
            }
            None => {
                self.write(at, bytes)?;
                let sections = self.sections.read();
                if let Some(Section { mem: SectionMem::Map(m), .. }) = sections.first() {
                    m.flush_range(0, PAGE_SIZE.min(m.len())).map_err(Error::Io)?;
                }
            }
        }
        self.file.sync_data()?;
        Ok(())
    }
}
