//! Named, non-overlapping ranges of the linear address space.
//!
//! Every static region (text, heap, page tables) and every runtime mapping
//! gets an entry here. The map is the source of truth for `unmap` (it
//! remembers mapping extents) and for diagnostics.

extern crate alloc;

use alloc::collections::BTreeMap;
use core::fmt;

use keel_lib::IrqMutex;

use crate::error::MemError;

/// Probe reporting how much of a range is logically in use (e.g. the heap
/// has a fixed range but dynamic usage).
pub type InUseFn = fn() -> usize;

/// A fixed, occupied memory range `[start, end]` (inclusive end, matching
/// the "last addressable byte" convention).
#[derive(Clone)]
pub struct FixedMemoryRange {
    start: u64,
    end: u64,
    name: &'static str,
    in_use: Option<InUseFn>,
}

impl FixedMemoryRange {
    pub fn new(start: u64, end: u64, name: &'static str) -> Result<Self, MemError> {
        if start > end {
            return Err(MemError::EmptyRange);
        }
        Ok(Self {
            start,
            end,
            name,
            in_use: None,
        })
    }

    pub fn with_in_use(
        start: u64,
        end: u64,
        name: &'static str,
        in_use: InUseFn,
    ) -> Result<Self, MemError> {
        let mut range = Self::new(start, end, name)?;
        range.in_use = Some(in_use);
        Ok(range)
    }

    #[inline]
    pub fn addr_start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn addr_end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn in_range(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    #[inline]
    pub fn overlaps(&self, other: &FixedMemoryRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn set_in_use_probe(&mut self, probe: InUseFn) {
        self.in_use = Some(probe);
    }

    /// Bytes actually in use: the probe's answer, or the full span when no
    /// probe was registered.
    pub fn bytes_in_use(&self) -> usize {
        match self.in_use {
            Some(f) => f(),
            None => self.size() as usize,
        }
    }

    /// Resize in place to `new_size` bytes. The caller (the map) has
    /// already checked that the new extent is legal.
    fn resize(&mut self, new_size: u64) {
        self.end = self.start + new_size - 1;
    }
}

impl fmt::Display for FixedMemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:x}-0x{:x} ({} bytes) {}",
            self.start,
            self.end,
            self.size(),
            self.name
        )
    }
}

/// Ordered set of non-overlapping ranges keyed by start address. Key 0 is
/// reserved as the "no range" answer, which works out because the zero page
/// is never mapped.
pub struct MemoryMap {
    map: BTreeMap<u64, FixedMemoryRange>,
}

impl MemoryMap {
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a range. Fails with [`MemError::Overlap`] if it intersects an
    /// existing range.
    pub fn assign_range(&mut self, range: FixedMemoryRange) -> Result<u64, MemError> {
        if range.start == 0 {
            return Err(MemError::BadAddress);
        }
        // Only the nearest neighbors can overlap in an ordered map.
        if let Some((_, prev)) = self.map.range(..=range.start).next_back() {
            if prev.overlaps(&range) {
                return Err(MemError::Overlap);
            }
        }
        if let Some((_, next)) = self.map.range(range.start..).next() {
            if next.overlaps(&range) {
                return Err(MemError::Overlap);
            }
        }
        let key = range.start;
        self.map.insert(key, range);
        Ok(key)
    }

    /// Key of the range enclosing `addr`, or 0 when none does.
    pub fn in_range(&self, addr: u64) -> u64 {
        match self.map.range(..=addr).next_back() {
            Some((key, range)) if range.in_range(addr) => *key,
            _ => 0,
        }
    }

    pub fn at(&self, key: u64) -> Result<&FixedMemoryRange, MemError> {
        if key == 0 {
            return Err(MemError::BadAddress);
        }
        self.map.get(&key).ok_or(MemError::NotFound)
    }

    pub fn at_mut(&mut self, key: u64) -> Result<&mut FixedMemoryRange, MemError> {
        if key == 0 {
            return Err(MemError::BadAddress);
        }
        self.map.get_mut(&key).ok_or(MemError::NotFound)
    }

    /// Resize the range at `key` to `new_size` bytes.
    ///
    /// Growing is blocked by a succeeding range; shrinking is blocked at
    /// `bytes_in_use()`.
    pub fn resize(&mut self, key: u64, new_size: u64) -> Result<u64, MemError> {
        if new_size == 0 {
            return Err(MemError::EmptyRange);
        }
        let (cur_size, start, in_use) = {
            let range = self.at(key)?;
            (range.size(), range.start, range.bytes_in_use() as u64)
        };

        if new_size > cur_size {
            let new_end = start + new_size - 1;
            if let Some((_, next)) = self.map.range(key + 1..).next() {
                if next.addr_start() <= new_end {
                    return Err(MemError::BadResize);
                }
            }
        } else if new_size < in_use {
            return Err(MemError::BadResize);
        }

        self.at_mut(key)?.resize(new_size);
        Ok(new_size)
    }

    pub fn erase(&mut self, key: u64) -> Option<FixedMemoryRange> {
        self.map.remove(&key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &FixedMemoryRange)> {
        self.map.iter()
    }
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide linear memory map.
static MEMMAP: IrqMutex<MemoryMap> = IrqMutex::new(MemoryMap::new());

/// Run `f` with the global memory map locked.
pub fn with_memmap<R>(f: impl FnOnce(&mut MemoryMap) -> R) -> R {
    f(&mut MEMMAP.lock())
}

/// Log every registered range.
pub fn dump() {
    let map = MEMMAP.lock();
    for (_, range) in map.iter() {
        keel_lib::klog_info!("  {}", range);
    }
}
