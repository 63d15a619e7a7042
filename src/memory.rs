//! Memory Mapper + Cache (spec.md §4.6).
//!
//! Accessors are registered by memory-space mask; overlap is rejected
//! when two accessors' masks intersect. Lookup prefers the most
//! recently used accessor, then the most-specific matching mask.
//! Resolved reads are cached per trace-ID in fixed-size LRU pages,
//! grounded on this spec's cache-policy description and, for the
//! callback-accessor shape, on the closure-based memory callback in
//! `other_examples/...riscv-etrace__src-lib.rs`'s `Instruction::extract`
//! usage.

use crate::memspace::MemorySpace;

/// Capability set a memory accessor must provide (spec.md §3 "Memory
/// Accessor").
pub trait MemoryAccessor: std::fmt::Debug {
    fn read_bytes(&mut self, address: u64, buf: &mut [u8]) -> usize;
    fn address_in_range(&self, address: u64) -> bool;
    fn overlap_range(&self, start: u64, end: u64) -> bool;
    fn validate_range(&self) -> bool;
    fn base(&self) -> u64;
    fn len(&self) -> u64;
}

/// A held byte slice at a base address.
#[derive(Debug, Clone)]
pub struct BufferAccessor {
    pub base: u64,
    pub data: Vec<u8>,
}

impl MemoryAccessor for BufferAccessor {
    fn read_bytes(&mut self, address: u64, buf: &mut [u8]) -> usize {
        if address < self.base || address >= self.base + self.data.len() as u64 {
            return 0;
        }
        let offset = (address - self.base) as usize;
        let avail = self.data.len() - offset;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }

    fn address_in_range(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.data.len() as u64
    }

    fn overlap_range(&self, start: u64, end: u64) -> bool {
        start < self.base + self.data.len() as u64 && end > self.base
    }

    fn validate_range(&self) -> bool {
        !self.data.is_empty()
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Delegates reads to an external function; used to bridge a debugger's
/// own memory-read RPC into the mapper without copying the whole image.
pub struct CallbackAccessor {
    pub base: u64,
    pub length: u64,
    pub callback: Box<dyn FnMut(u64, &mut [u8]) -> usize>,
}

impl std::fmt::Debug for CallbackAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackAccessor")
            .field("base", &self.base)
            .field("length", &self.length)
            .finish()
    }
}

impl MemoryAccessor for CallbackAccessor {
    fn read_bytes(&mut self, address: u64, buf: &mut [u8]) -> usize {
        if !self.address_in_range(address) {
            return 0;
        }
        (self.callback)(address, buf)
    }

    fn address_in_range(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.length
    }

    fn overlap_range(&self, start: u64, end: u64) -> bool {
        start < self.base + self.length && end > self.base
    }

    fn validate_range(&self) -> bool {
        self.length > 0
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> u64 {
        self.length
    }
}

/// Offset + length into a file, read lazily via `pread`-style access.
pub struct FileAccessor {
    pub base: u64,
    pub file_offset: u64,
    pub length: u64,
    pub file: std::fs::File,
}

impl std::fmt::Debug for FileAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAccessor")
            .field("base", &self.base)
            .field("length", &self.length)
            .finish()
    }
}

impl MemoryAccessor for FileAccessor {
    fn read_bytes(&mut self, address: u64, buf: &mut [u8]) -> usize {
        use std::io::{Read, Seek, SeekFrom};
        if !self.address_in_range(address) {
            return 0;
        }
        let offset = self.file_offset + (address - self.base);
        if self.file.seek(SeekFrom::Start(offset)).is_err() {
            return 0;
        }
        let avail = (self.length - (address - self.base)) as usize;
        let n = buf.len().min(avail);
        self.file.read(&mut buf[..n]).unwrap_or(0)
    }

    fn address_in_range(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.length
    }

    fn overlap_range(&self, start: u64, end: u64) -> bool {
        start < self.base + self.length && end > self.base
    }

    fn validate_range(&self) -> bool {
        self.length > 0
    }

    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> u64 {
        self.length
    }
}

/// Opaque handle to a registered accessor. Cache pages store this
/// rather than a borrow or an `Rc`, so a removed accessor's cache pages
/// are invalidated by ID comparison rather than a dangling reference —
/// the cheap "lookup by ID on every cache hit" option from spec.md §9's
/// design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessorId(u32);

struct Registered {
    id: AccessorId,
    space: MemorySpace,
    accessor: Box<dyn MemoryAccessor>,
}

const PAGE_SIZE: u64 = 256;
const PAGE_COUNT: usize = 64;

struct CachePage {
    trace_id: u8,
    base: u64,
    space: MemorySpace,
    owner: AccessorId,
    data: Vec<u8>,
    valid_len: usize,
    last_used: u64,
}

#[derive(Default)]
struct Cache {
    pages: Vec<CachePage>,
    tick: u64,
}

impl Cache {
    fn find(&mut self, trace_id: u8, addr: u64, space: MemorySpace) -> Option<usize> {
        let page_base = (addr / PAGE_SIZE) * PAGE_SIZE;
        self.pages.iter().position(|p| {
            p.trace_id == trace_id && p.base == page_base && p.space.intersects(space)
        })
    }

    fn touch(&mut self, idx: usize) {
        self.tick += 1;
        self.pages[idx].last_used = self.tick;
    }

    fn insert(
        &mut self,
        trace_id: u8,
        base: u64,
        space: MemorySpace,
        owner: AccessorId,
        data: Vec<u8>,
        valid_len: usize,
    ) -> usize {
        self.tick += 1;
        let page = CachePage {
            trace_id,
            base,
            space,
            owner,
            data,
            valid_len,
            last_used: self.tick,
        };
        if self.pages.len() < PAGE_COUNT {
            self.pages.push(page);
            self.pages.len() - 1
        } else {
            let evict = self
                .pages
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_used)
                .map(|(i, _)| i)
                .unwrap();
            self.pages[evict] = page;
            evict
        }
    }

    fn invalidate_all(&mut self) {
        self.pages.clear();
    }

    fn invalidate_trace_id(&mut self, trace_id: u8) {
        self.pages.retain(|p| p.trace_id != trace_id);
    }

    fn invalidate_owner(&mut self, owner: AccessorId) {
        self.pages.retain(|p| p.owner != owner);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    /// No registered accessor covers the request; `bytes_read == 0`.
    Unmapped,
}

/// Resolves `(address, trace-ID, memory-space, length)` reads against
/// registered accessors, with per-trace-ID LRU caching.
#[derive(Default)]
pub struct Mapper {
    accessors: Vec<Registered>,
    next_id: u32,
    mru: Option<AccessorId>,
    cache: Cache,
    caching_enabled: bool,
}

impl Mapper {
    pub fn new() -> Self {
        Mapper {
            caching_enabled: true,
            ..Default::default()
        }
    }

    pub fn add_accessor(
        &mut self,
        accessor: Box<dyn MemoryAccessor>,
        space: MemorySpace,
    ) -> Result<AccessorId, crate::error::TraceError> {
        if !accessor.validate_range() {
            return Err(crate::error::TraceError::InvalidAccessorRange);
        }
        for existing in &self.accessors {
            if existing.space.intersects(space)
                && existing
                    .accessor
                    .overlap_range(accessor.base(), accessor.base() + accessor.len())
            {
                return Err(crate::error::TraceError::OverlappingAccessor);
            }
        }
        let id = AccessorId(self.next_id);
        self.next_id += 1;
        self.accessors.push(Registered {
            id,
            space,
            accessor,
        });
        Ok(id)
    }

    pub fn remove_accessor(&mut self, id: AccessorId) {
        self.accessors.retain(|r| r.id != id);
        if self.mru == Some(id) {
            self.mru = None;
        }
        self.cache.invalidate_owner(id);
    }

    pub fn remove_all(&mut self) {
        self.accessors.clear();
        self.mru = None;
        self.cache.invalidate_all();
    }

    pub fn enable_caching(&mut self, enabled: bool) {
        self.caching_enabled = enabled;
        if !enabled {
            self.cache.invalidate_all();
        }
    }

    pub fn invalidate_cache(&mut self, trace_id: u8) {
        self.cache.invalidate_trace_id(trace_id);
    }

    fn pick_accessor(&self, address: u64, space: MemorySpace) -> Option<AccessorId> {
        if let Some(mru) = self.mru {
            if let Some(r) = self.accessors.iter().find(|r| r.id == mru) {
                if r.space.intersects(space) && r.accessor.address_in_range(address) {
                    return Some(mru);
                }
            }
        }
        self.accessors
            .iter()
            .filter(|r| r.space.intersects(space) && r.accessor.address_in_range(address))
            .min_by_key(|r| r.space.specificity())
            .map(|r| r.id)
    }

    /// Resolves a read, consulting (and populating) the cache when
    /// enabled. `buf.len()` bytes are requested; fewer may be returned
    /// only when the accessor itself runs out of range.
    pub fn read_target_memory(
        &mut self,
        address: u64,
        trace_id: u8,
        space: MemorySpace,
        buf: &mut [u8],
    ) -> (usize, ReadStatus) {
        if self.caching_enabled {
            if let Some(idx) = self.cache.find(trace_id, address, space) {
                let page = &self.cache.pages[idx];
                let page_offset = (address - page.base) as usize;
                if page_offset < page.valid_len {
                    let n = buf.len().min(page.valid_len - page_offset);
                    buf[..n].copy_from_slice(&page.data[page_offset..page_offset + n]);
                    self.cache.touch(idx);
                    self.mru = Some(self.cache.pages[idx].owner);
                    return (n, ReadStatus::Ok);
                }
            }
        }

        let id = match self.pick_accessor(address, space) {
            Some(id) => id,
            None => return (0, ReadStatus::Unmapped),
        };
        self.mru = Some(id);
        let reg = self.accessors.iter_mut().find(|r| r.id == id).unwrap();

        if self.caching_enabled {
            let page_base = (address / PAGE_SIZE) * PAGE_SIZE;
            let mut page_data = vec![0u8; PAGE_SIZE as usize];
            let valid_len = reg.accessor.read_bytes(page_base, &mut page_data);
            self.cache
                .insert(trace_id, page_base, reg.space, id, page_data, valid_len);
            let page_offset = (address - page_base) as usize;
            if page_offset >= valid_len {
                return (0, ReadStatus::Ok);
            }
            let idx = self.cache.find(trace_id, address, space).unwrap();
            let page = &self.cache.pages[idx];
            let n = buf.len().min(page.valid_len - page_offset);
            buf[..n].copy_from_slice(&page.data[page_offset..page_offset + n]);
            (n, ReadStatus::Ok)
        } else {
            let n = reg.accessor.read_bytes(address, buf);
            (n, ReadStatus::Ok)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_acc(base: u64, data: Vec<u8>) -> Box<dyn MemoryAccessor> {
        Box::new(BufferAccessor { base, data })
    }

    #[test]
    fn reads_in_range_return_requested_bytes() {
        let mut m = Mapper::new();
        m.add_accessor(buf_acc(0x1000, vec![0xAA; 64]), MemorySpace::ANY)
            .unwrap();
        let mut out = [0u8; 4];
        let (n, status) = m.read_target_memory(0x1000, 0, MemorySpace::ANY, &mut out);
        assert_eq!(n, 4);
        assert_eq!(status, ReadStatus::Ok);
        assert_eq!(out, [0xAA; 4]);
    }

    #[test]
    fn out_of_range_reads_are_unmapped_with_zero_bytes() {
        let mut m = Mapper::new();
        m.add_accessor(buf_acc(0x1000, vec![0xAA; 64]), MemorySpace::ANY)
            .unwrap();
        let mut out = [0u8; 4];
        let (n, status) = m.read_target_memory(0x5000, 0, MemorySpace::ANY, &mut out);
        assert_eq!(n, 0);
        assert_eq!(status, ReadStatus::Unmapped);
    }

    #[test]
    fn overlapping_accessors_in_intersecting_spaces_are_rejected() {
        let mut m = Mapper::new();
        m.add_accessor(buf_acc(0x1000, vec![0; 64]), MemorySpace::NON_SECURE)
            .unwrap();
        let err = m
            .add_accessor(buf_acc(0x1020, vec![0; 64]), MemorySpace::NON_SECURE)
            .unwrap_err();
        assert_eq!(err, crate::error::TraceError::OverlappingAccessor);
    }

    #[test]
    fn overlapping_accessors_in_disjoint_spaces_are_allowed() {
        let mut m = Mapper::new();
        m.add_accessor(buf_acc(0x1000, vec![1; 64]), MemorySpace::NON_SECURE)
            .unwrap();
        m.add_accessor(buf_acc(0x1000, vec![2; 64]), MemorySpace::SECURE)
            .unwrap();

        let mut out = [0u8; 1];
        m.read_target_memory(0x1000, 0, MemorySpace::NON_SECURE, &mut out);
        assert_eq!(out, [1]);
        m.read_target_memory(0x1000, 0, MemorySpace::SECURE, &mut out);
        assert_eq!(out, [2]);
    }

    #[test]
    fn cache_enable_disable_is_observationally_equivalent() {
        let mut with_cache = Mapper::new();
        with_cache
            .add_accessor(buf_acc(0x2000, (0u8..=255).collect()), MemorySpace::ANY)
            .unwrap();

        let mut without_cache = Mapper::new();
        without_cache.enable_caching(false);
        without_cache
            .add_accessor(buf_acc(0x2000, (0u8..=255).collect()), MemorySpace::ANY)
            .unwrap();

        for addr in [0x2000u64, 0x2010, 0x20ff, 0x20fe] {
            let mut a = [0u8; 2];
            let mut b = [0u8; 2];
            with_cache.read_target_memory(addr, 0, MemorySpace::ANY, &mut a);
            without_cache.read_target_memory(addr, 0, MemorySpace::ANY, &mut b);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn removing_an_accessor_invalidates_its_cache_pages() {
        let mut m = Mapper::new();
        let id = m
            .add_accessor(buf_acc(0x1000, vec![7; 64]), MemorySpace::ANY)
            .unwrap();
        let mut out = [0u8; 1];
        m.read_target_memory(0x1000, 0, MemorySpace::ANY, &mut out);
        m.remove_accessor(id);
        let (n, status) = m.read_target_memory(0x1000, 0, MemorySpace::ANY, &mut out);
        assert_eq!(n, 0);
        assert_eq!(status, ReadStatus::Unmapped);
    }

    #[test]
    fn register_remove_register_is_equivalent_to_original_state() {
        let mut m = Mapper::new();
        let acc = buf_acc(0x1000, vec![9; 64]);
        let id = m.add_accessor(acc, MemorySpace::ANY).unwrap();
        m.remove_accessor(id);
        m.add_accessor(buf_acc(0x1000, vec![9; 64]), MemorySpace::ANY)
            .unwrap();

        let mut out = [0u8; 1];
        let (n, status) = m.read_target_memory(0x1000, 0, MemorySpace::ANY, &mut out);
        assert_eq!((n, status), (1, ReadStatus::Ok));
        assert_eq!(out, [9]);
    }
}
