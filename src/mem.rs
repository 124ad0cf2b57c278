//! Handle based memory arena
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Block format: header | data | canary
// Heap format: used and dirty blocks | free space
//
// Handles map to relocatable blocks, so a raw view must never be held
// across a scheduler suspension point. `with` scopes the borrow.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

/// Arena size in bytes
pub const HEAP_SIZE: usize = 8192;

/// Handle table size
pub const MAX_HANDLES: usize = 64;

/// Dirty space threshold that wakes the compactor
pub const DEFRAG_THRESHOLD: usize = 512;

const HEADER_SIZE: usize = 4;
const CANARY_SIZE: usize = 1;
const CANARY_VALUE: u8 = 0x47;

const SIZE_DIRTY_MASK: u16 = 0x8000;

/// Opaque, swizzled memory handle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle(u16);

impl Handle {
    fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    fn from_index(index: usize) -> Self {
        Handle(index as u16 + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemError {
    /// Allocation failed, arena or handle table exhausted
    OutOfMemory,
    /// Handle unallocated or already freed
    BadHandle,
    /// Canary mismatch, arena state is unrecoverable
    Corrupt,
}

/// Arena runtime counters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemStats {
    pub free_space: usize,
    pub used_space: usize,
    pub dirty_space: usize,
    pub data_space: usize,
    pub handles_used: usize,
    pub peak_usage: usize,
    pub defrags: u32,
}

pub struct Arena {
    heap: [u8; HEAP_SIZE],
    /// Block offset + 1 per handle, 0 when unallocated
    handles: [u16; MAX_HANDLES],
    free_ptr: usize,
    stats: MemStats,
}

impl Arena {
    pub fn new() -> Self {
        let mut s = Self {
            heap: [0u8; HEAP_SIZE],
            handles: [0u16; MAX_HANDLES],
            free_ptr: 0,
            stats: MemStats::default(),
        };
        s.stats.free_space = HEAP_SIZE;
        s
    }

    fn header(&self, offset: usize) -> (u16, usize, bool) {
        let raw = LittleEndian::read_u16(&self.heap[offset..]);
        let index = LittleEndian::read_u16(&self.heap[offset + 2..]) as usize;
        (raw & !SIZE_DIRTY_MASK, index, raw & SIZE_DIRTY_MASK != 0)
    }

    fn block_size(&self, offset: usize) -> usize {
        let (size, _, _) = self.header(offset);
        HEADER_SIZE + size as usize + CANARY_SIZE
    }

    fn offset_of(&self, handle: Handle) -> Result<usize, MemError> {
        let index = handle.index();
        if index >= MAX_HANDLES || self.handles[index] == 0 {
            return Err(MemError::BadHandle);
        }

        let offset = (self.handles[index] - 1) as usize;
        let (size, hdr_index, dirty) = self.header(offset);

        if dirty || hdr_index != index {
            return Err(MemError::BadHandle);
        }
        if self.heap[offset + HEADER_SIZE + size as usize] != CANARY_VALUE {
            return Err(MemError::Corrupt);
        }

        Ok(offset)
    }

    /// Allocate `size` bytes, returning a relocatable handle
    pub fn alloc(&mut self, size: usize) -> Result<Handle, MemError> {
        let need = HEADER_SIZE + size + CANARY_SIZE;

        if size > u16::MAX as usize - HEADER_SIZE - CANARY_SIZE || need > HEAP_SIZE {
            return Err(MemError::OutOfMemory);
        }

        // reclaim dirty space if the tail cannot satisfy the request
        if self.stats.free_space < need && self.stats.free_space + self.stats.dirty_space >= need {
            self.compact()?;
        }

        if self.stats.free_space < need {
            warn!("arena full: {} requested, {} free", size, self.stats.free_space);
            return Err(MemError::OutOfMemory);
        }

        let index = match (0..MAX_HANDLES).find(|i| self.handles[*i] == 0) {
            Some(i) => i,
            None => {
                warn!("handle table full");
                return Err(MemError::OutOfMemory);
            }
        };

        let offset = self.free_ptr;
        LittleEndian::write_u16(&mut self.heap[offset..], size as u16);
        LittleEndian::write_u16(&mut self.heap[offset + 2..], index as u16);
        self.heap[offset + HEADER_SIZE + size] = CANARY_VALUE;
        // zero fresh data
        self.heap[offset + HEADER_SIZE..offset + HEADER_SIZE + size].fill(0);

        self.handles[index] = offset as u16 + 1;
        self.free_ptr += need;

        self.stats.handles_used += 1;
        self.stats.data_space += size;
        self.stats.free_space -= need;
        self.stats.used_space += need;
        if self.stats.used_space > self.stats.peak_usage {
            self.stats.peak_usage = self.stats.used_space;
        }

        Ok(Handle::from_index(index))
    }

    /// Release a handle. The block is marked dirty and reclaimed by the
    /// next compaction pass.
    pub fn free(&mut self, handle: Handle) -> Result<(), MemError> {
        let offset = self.offset_of(handle)?;
        let (size, _, _) = self.header(offset);
        let bs = HEADER_SIZE + size as usize + CANARY_SIZE;

        // set dirty bit
        let raw = LittleEndian::read_u16(&self.heap[offset..]);
        LittleEndian::write_u16(&mut self.heap[offset..], raw | SIZE_DIRTY_MASK);

        self.handles[handle.index()] = 0;

        self.stats.handles_used -= 1;
        self.stats.data_space -= size as usize;
        self.stats.dirty_space += bs;
        self.stats.used_space -= bs;

        Ok(())
    }

    pub fn size_of(&self, handle: Handle) -> Result<usize, MemError> {
        let offset = self.offset_of(handle)?;
        let (size, _, _) = self.header(offset);
        Ok(size as usize)
    }

    /// Immutable view of a block. Valid only until the next suspension
    /// point, the compactor may move the block.
    pub fn bytes(&self, handle: Handle) -> Result<&[u8], MemError> {
        let offset = self.offset_of(handle)?;
        let (size, _, _) = self.header(offset);
        Ok(&self.heap[offset + HEADER_SIZE..offset + HEADER_SIZE + size as usize])
    }

    /// Mutable view of a block, same lifetime caveat as `bytes`
    pub fn bytes_mut(&mut self, handle: Handle) -> Result<&mut [u8], MemError> {
        let offset = self.offset_of(handle)?;
        let (size, _, _) = self.header(offset);
        Ok(&mut self.heap[offset + HEADER_SIZE..offset + HEADER_SIZE + size as usize])
    }

    /// Scoped mutable view, cannot outlive the call
    pub fn with<R>(
        &mut self,
        handle: Handle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemError> {
        let bytes = self.bytes_mut(handle)?;
        Ok(f(bytes))
    }

    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    pub fn needs_compaction(&self) -> bool {
        self.stats.dirty_space >= DEFRAG_THRESHOLD
    }

    /// Slide live blocks down over dirty space and patch the handle
    /// table. All outstanding raw views are invalidated.
    pub fn compact(&mut self) -> Result<(), MemError> {
        // find the first dirty block
        let mut dirty = 0usize;
        while dirty < self.free_ptr {
            let (_, _, d) = self.header(dirty);
            if d {
                break;
            }
            dirty += self.block_size(dirty);
        }

        let mut clean = dirty;

        while clean < self.free_ptr {
            // skip dirty blocks to the next live one
            loop {
                let (_, _, d) = self.header(clean);
                if !d {
                    break;
                }
                clean += self.block_size(clean);
                if clean >= self.free_ptr {
                    break;
                }
            }
            if clean >= self.free_ptr {
                break;
            }

            let bs = self.block_size(clean);
            let next = clean + bs;

            let (_, index, _) = self.header(clean);
            self.handles[index] = dirty as u16 + 1;

            self.heap.copy_within(clean..clean + bs, dirty);
            dirty += bs;
            clean = next;
        }

        self.free_ptr = dirty;
        self.stats.free_space += self.stats.dirty_space;
        self.stats.dirty_space = 0;
        self.stats.defrags += 1;

        debug!(
            "arena compacted: {} free, {} handles",
            self.stats.free_space, self.stats.handles_used
        );

        self.check_canaries()
    }

    /// Verify the canary of every live block
    pub fn check_canaries(&self) -> Result<(), MemError> {
        for i in 0..MAX_HANDLES {
            if self.handles[i] == 0 {
                continue;
            }
            let offset = (self.handles[i] - 1) as usize;
            let (size, _, _) = self.header(offset);
            if self.heap[offset + HEADER_SIZE + size as usize] != CANARY_VALUE {
                return Err(MemError::Corrupt);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let mut mem = Arena::new();

        let h = mem.alloc(32).unwrap();
        assert_eq!(mem.size_of(h).unwrap(), 32);

        mem.with(h, |b| {
            for (i, v) in b.iter_mut().enumerate() {
                *v = i as u8;
            }
        })
        .unwrap();

        assert_eq!(mem.bytes(h).unwrap()[5], 5);

        mem.free(h).unwrap();
        assert_eq!(mem.size_of(h), Err(MemError::BadHandle));
        assert_eq!(mem.free(h), Err(MemError::BadHandle));
    }

    #[test]
    fn out_of_memory() {
        let mut mem = Arena::new();
        assert_eq!(mem.alloc(HEAP_SIZE), Err(MemError::OutOfMemory));

        let mut held = std::vec::Vec::new();
        loop {
            match mem.alloc(1024) {
                Ok(h) => held.push(h),
                Err(e) => {
                    assert_eq!(e, MemError::OutOfMemory);
                    break;
                }
            }
        }
        assert!(held.len() >= 7);
    }

    #[test]
    fn compaction_preserves_contents() {
        let mut mem = Arena::new();

        let a = mem.alloc(100).unwrap();
        let b = mem.alloc(100).unwrap();
        let c = mem.alloc(100).unwrap();

        mem.with(b, |buf| buf.fill(0xbb)).unwrap();
        mem.with(c, |buf| buf.fill(0xcc)).unwrap();

        // free the first block, forcing b and c to slide down
        mem.free(a).unwrap();
        mem.compact().unwrap();

        assert_eq!(mem.stats().dirty_space, 0);
        assert!(mem.bytes(b).unwrap().iter().all(|v| *v == 0xbb));
        assert!(mem.bytes(c).unwrap().iter().all(|v| *v == 0xcc));

        // freed space is reusable again
        let d = mem.alloc(100).unwrap();
        assert_eq!(mem.size_of(d).unwrap(), 100);
    }

    #[test]
    fn compaction_reclaims_interleaved() {
        let mut mem = Arena::new();
        let free_at_start = mem.stats().free_space;

        for _ in 0..10 {
            let keep = mem.alloc(64).unwrap();
            let drop = mem.alloc(64).unwrap();
            mem.free(drop).unwrap();
            mem.free(keep).unwrap();
        }

        mem.compact().unwrap();
        assert_eq!(mem.stats().free_space, free_at_start);
        assert_eq!(mem.stats().handles_used, 0);
    }

    #[test]
    fn canary_smash_detected() {
        let mut mem = Arena::new();
        let h = mem.alloc(8).unwrap();

        // overrun the block by one byte
        let offset = (mem.handles[h.index()] - 1) as usize;
        mem.heap[offset + HEADER_SIZE + 8] = 0;

        assert_eq!(mem.bytes(h).err(), Some(MemError::Corrupt));
        assert_eq!(mem.check_canaries(), Err(MemError::Corrupt));
    }

    #[test]
    fn stale_handle_after_realloc() {
        let mut mem = Arena::new();
        let a = mem.alloc(16).unwrap();
        mem.free(a).unwrap();

        // slot is reused, stale handle maps to the same index and is
        // accepted, matching the swizzled-table contract: callers must
        // not hold freed handles
        let b = mem.alloc(16).unwrap();
        assert_eq!(a, b);
    }
}
