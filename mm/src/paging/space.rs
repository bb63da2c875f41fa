//! A 4-level page-table hierarchy and the operations on it.
//!
//! Keel runs everything in one address space; page-table frames are reached
//! through the physical-memory window ([`crate::hhdm`]). Intermediate
//! tables are allocated from the frame pool and freed when a whole
//! hierarchy is torn down (which, in practice, never happens after boot).

use keel_abi::addr::{PhysAddr, VirtAddr};

use super::defs::{
    Access, PAGE_SIZE_4KB, PAGE_TABLE_ENTRIES, PageFlags, PageTable, PageTableEntry,
    PageTableLevel,
};
use super::mapping::Mapping;
use super::supported_page_sizes;
use crate::error::MemError;
use crate::frame::{alloc_page_frame_zeroed, free_page_frame};
use crate::tlb;

/// Result of resolving one linear address to its leaf entry.
#[derive(Clone, Copy, Debug)]
pub struct WalkResult {
    pub phys: PhysAddr,
    pub page_size: u64,
    pub flags: PageFlags,
}

pub struct AddressSpace {
    pml4_phys: PhysAddr,
}

#[inline]
fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    unsafe { &mut *crate::hhdm::phys_to_virt(phys).as_mut_ptr::<PageTable>() }
}

fn alloc_table() -> Result<PhysAddr, MemError> {
    let phys = alloc_page_frame_zeroed();
    if phys.is_null() {
        return Err(MemError::OutOfMemory);
    }
    Ok(phys)
}

/// Split a 1 GiB leaf into a table of 2 MiB leaves.
fn split_pdpt_huge(entry: &mut PageTableEntry) -> Result<PhysAddr, MemError> {
    let huge_phys = entry.address();
    let huge_flags = entry.flags();
    let pd_phys = alloc_table()?;
    let pd = table_mut(pd_phys);
    for i in 0..PAGE_TABLE_ENTRIES {
        let phys = huge_phys.offset(i as u64 * PageTableLevel::Two.entry_size());
        pd.entry_mut(i).set(phys, huge_flags | PageFlags::HUGE);
    }
    entry.set(pd_phys, PageFlags::PRESENT | PageFlags::WRITABLE);
    Ok(pd_phys)
}

/// Split a 2 MiB leaf into a table of 4 KiB leaves.
fn split_pd_huge(entry: &mut PageTableEntry) -> Result<PhysAddr, MemError> {
    let huge_phys = entry.address();
    let mut huge_flags = entry.flags();
    huge_flags.remove(PageFlags::HUGE);
    let pt_phys = alloc_table()?;
    let pt = table_mut(pt_phys);
    for i in 0..PAGE_TABLE_ENTRIES {
        let phys = huge_phys.offset(i as u64 * PAGE_SIZE_4KB);
        pt.entry_mut(i).set(phys, huge_flags);
    }
    entry.set(pt_phys, PageFlags::PRESENT | PageFlags::WRITABLE);
    Ok(pt_phys)
}

impl AddressSpace {
    /// Allocate an empty hierarchy (a zeroed PML4).
    pub fn new() -> Result<Self, MemError> {
        Ok(Self {
            pml4_phys: alloc_table()?,
        })
    }

    /// Wrap an existing PML4 (e.g. the one CR3 points at).
    ///
    /// # Safety
    ///
    /// `pml4_phys` must reference a valid, identity-reachable PML4 frame.
    pub unsafe fn from_pml4(pml4_phys: PhysAddr) -> Self {
        Self { pml4_phys }
    }

    #[inline]
    pub fn pml4_phys(&self) -> PhysAddr {
        self.pml4_phys
    }

    // -------------------------------------------------------------------
    // map
    // -------------------------------------------------------------------

    /// Install a mapping, choosing page sizes greedily.
    ///
    /// `m.size` is rounded up to a multiple of the smallest allowed page
    /// size; the returned mapping reports the real extent and the union of
    /// page sizes used. Present leaf entries are overwritten — policy-level
    /// double-map protection lives in the memory map, and the boot identity
    /// map is deliberately overridable.
    pub fn map_r(&mut self, m: Mapping) -> Result<Mapping, MemError> {
        if m.lin == 0 || m.phys == 0 {
            return Err(MemError::BadAddress);
        }
        if m.size == 0 {
            return Err(MemError::EmptyRange);
        }
        let allowed = m.page_sizes & supported_page_sizes();
        if allowed == 0 {
            return Err(MemError::UnsupportedPageSize);
        }
        let min_ps = 1u64 << allowed.trailing_zeros();
        if m.lin % min_ps != 0 || m.phys % min_ps != 0 {
            return Err(MemError::Misaligned);
        }

        let size = (m.size + min_ps - 1) & !(min_ps - 1);
        let mut used_sizes = 0u64;
        let mut off = 0u64;
        while off < size {
            let lin = m.lin + off;
            let phys = m.phys + off;
            let remaining = size - off;
            let psize = Self::pick_page_size(allowed, lin, phys, remaining);
            self.install_leaf(VirtAddr::new(lin), PhysAddr::new(phys), m.flags, psize)?;
            used_sizes |= psize;
            off += psize;
        }

        Ok(Mapping {
            lin: m.lin,
            phys: m.phys,
            flags: m.flags,
            size,
            page_sizes: used_sizes,
        })
    }

    /// Largest allowed page size usable at this position.
    fn pick_page_size(allowed: u64, lin: u64, phys: u64, remaining: u64) -> u64 {
        let mut mask = allowed;
        while mask != 0 {
            let psize = 1u64 << (63 - mask.leading_zeros());
            if lin % psize == 0 && phys % psize == 0 && remaining >= psize {
                return psize;
            }
            mask &= !psize;
        }
        // min_ps alignment was checked up front, so the smallest allowed
        // size always fits.
        unreachable!("no usable page size")
    }

    fn install_leaf(
        &mut self,
        lin: VirtAddr,
        phys: PhysAddr,
        access: Access,
        psize: u64,
    ) -> Result<(), MemError> {
        let mut flags = access.to_page_flags();
        if psize != PAGE_SIZE_4KB {
            flags |= PageFlags::HUGE;
        }

        let pml4 = table_mut(self.pml4_phys);
        let pml4_entry = pml4.entry_mut(PageTableLevel::Four.index_of(lin));
        let pdpt_phys = Self::ensure_table(pml4_entry, PageTableLevel::Three)?;
        let pdpt = table_mut(pdpt_phys);
        let pdpt_entry = pdpt.entry_mut(PageTableLevel::Three.index_of(lin));

        if psize == PageTableLevel::Three.entry_size() {
            pdpt_entry.set(phys, flags);
            tlb::flush_page(lin);
            return Ok(());
        }

        let pd_phys = Self::ensure_table(pdpt_entry, PageTableLevel::Two)?;
        let pd = table_mut(pd_phys);
        let pd_entry = pd.entry_mut(PageTableLevel::Two.index_of(lin));

        if psize == PageTableLevel::Two.entry_size() {
            pd_entry.set(phys, flags);
            tlb::flush_page(lin);
            return Ok(());
        }

        let pt_phys = Self::ensure_table(pd_entry, PageTableLevel::One)?;
        let pt = table_mut(pt_phys);
        pt.entry_mut(PageTableLevel::One.index_of(lin)).set(phys, flags);
        tlb::flush_page(lin);
        Ok(())
    }

    /// Resolve `entry` to a next-level table, creating it or splitting a
    /// huge leaf as needed. `child_level` is the level the table holds.
    fn ensure_table(
        entry: &mut PageTableEntry,
        child_level: PageTableLevel,
    ) -> Result<PhysAddr, MemError> {
        if !entry.is_present() {
            let phys = alloc_table()?;
            entry.set(phys, PageFlags::PRESENT | PageFlags::WRITABLE);
            return Ok(phys);
        }
        if entry.is_huge() {
            return match child_level {
                PageTableLevel::Two => split_pdpt_huge(entry),
                PageTableLevel::One => split_pd_huge(entry),
                _ => Err(MemError::UnsupportedPageSize),
            };
        }
        Ok(entry.address())
    }

    // -------------------------------------------------------------------
    // walk / query
    // -------------------------------------------------------------------

    /// Resolve a linear address to its leaf mapping, if present.
    pub fn walk(&self, lin: VirtAddr) -> Option<WalkResult> {
        let pml4 = table_mut(self.pml4_phys);
        let pml4_entry = pml4.entry(PageTableLevel::Four.index_of(lin));
        if !pml4_entry.points_to_table() {
            return None;
        }

        let pdpt = table_mut(pml4_entry.address());
        let pdpt_entry = pdpt.entry(PageTableLevel::Three.index_of(lin));
        if !pdpt_entry.is_present() {
            return None;
        }
        if pdpt_entry.is_huge() {
            return Some(WalkResult {
                phys: PhysAddr::new(
                    pdpt_entry.address().as_u64()
                        + (lin.as_u64() & (PageTableLevel::Three.entry_size() - 1)),
                ),
                page_size: PageTableLevel::Three.entry_size(),
                flags: pdpt_entry.flags(),
            });
        }

        let pd = table_mut(pdpt_entry.address());
        let pd_entry = pd.entry(PageTableLevel::Two.index_of(lin));
        if !pd_entry.is_present() {
            return None;
        }
        if pd_entry.is_huge() {
            return Some(WalkResult {
                phys: PhysAddr::new(
                    pd_entry.address().as_u64()
                        + (lin.as_u64() & (PageTableLevel::Two.entry_size() - 1)),
                ),
                page_size: PageTableLevel::Two.entry_size(),
                flags: pd_entry.flags(),
            });
        }

        let pt = table_mut(pd_entry.address());
        let pt_entry = pt.entry(PageTableLevel::One.index_of(lin));
        if !pt_entry.is_present() {
            return None;
        }
        Some(WalkResult {
            phys: PhysAddr::new(pt_entry.address().as_u64() + lin.page_offset()),
            page_size: PAGE_SIZE_4KB,
            flags: pt_entry.flags(),
        })
    }

    /// Access flags for the page enclosing `lin`.
    pub fn flags(&self, lin: VirtAddr) -> Access {
        match self.walk(lin) {
            Some(result) => Access::from_page_flags(result.flags),
            None => Access::NONE,
        }
    }

    /// Actual page size enclosing `lin`, or 0 when unmapped.
    pub fn active_page_size(&self, lin: VirtAddr) -> u64 {
        self.walk(lin).map(|r| r.page_size).unwrap_or(0)
    }

    pub fn virt_to_phys(&self, lin: VirtAddr) -> Option<PhysAddr> {
        self.walk(lin).map(|r| r.phys)
    }

    // -------------------------------------------------------------------
    // unmap
    // -------------------------------------------------------------------

    /// Clear every leaf entry in `[lin, lin + size)`. Returns the cleared
    /// extent as a mapping (flags `NONE`).
    pub fn unmap_r(&mut self, lin: VirtAddr, size: u64) -> Result<Mapping, MemError> {
        if lin.is_null() {
            return Err(MemError::BadAddress);
        }
        if size == 0 {
            return Err(MemError::EmptyRange);
        }

        let mut first_phys = 0u64;
        let mut page_sizes = 0u64;
        let mut pos = lin.as_u64();
        let end = lin.as_u64() + size;
        while pos < end {
            let vaddr = VirtAddr::new(pos);
            match self.walk(vaddr) {
                Some(result) => {
                    if first_phys == 0 {
                        first_phys = result.phys.align_down(result.page_size).as_u64();
                    }
                    page_sizes |= result.page_size;
                    self.clear_leaf(vaddr);
                    pos += result.page_size;
                }
                None => pos += PAGE_SIZE_4KB,
            }
        }

        Ok(Mapping {
            lin: lin.as_u64(),
            phys: first_phys,
            flags: Access::NONE,
            size,
            page_sizes,
        })
    }

    fn clear_leaf(&mut self, lin: VirtAddr) {
        let pml4 = table_mut(self.pml4_phys);
        let pml4_entry = pml4.entry_mut(PageTableLevel::Four.index_of(lin));
        if !pml4_entry.points_to_table() {
            return;
        }
        let pdpt = table_mut(pml4_entry.address());
        let pdpt_entry = pdpt.entry_mut(PageTableLevel::Three.index_of(lin));
        if !pdpt_entry.is_present() {
            return;
        }
        if pdpt_entry.is_huge() {
            pdpt_entry.clear();
            tlb::flush_page(lin);
            return;
        }
        let pd = table_mut(pdpt_entry.address());
        let pd_entry = pd.entry_mut(PageTableLevel::Two.index_of(lin));
        if !pd_entry.is_present() {
            return;
        }
        if pd_entry.is_huge() {
            pd_entry.clear();
            tlb::flush_page(lin);
            return;
        }
        let pt_phys = pd_entry.address();
        let pt = table_mut(pt_phys);
        let pt_entry = pt.entry_mut(PageTableLevel::One.index_of(lin));
        if pt_entry.is_present() {
            pt_entry.clear();
            tlb::flush_page(lin);
        }
        if pt.is_empty() {
            pd_entry.clear();
            free_page_frame(pt_phys);
        }
    }

    // -------------------------------------------------------------------
    // protect
    // -------------------------------------------------------------------

    /// Apply `access` to every page in `[lin, lin + len)`, splitting huge
    /// pages that straddle the range boundary.
    pub fn protect_r(&mut self, lin: VirtAddr, len: u64, access: Access) -> Result<Mapping, MemError> {
        if lin.is_null() {
            return Err(MemError::BadAddress);
        }
        if len == 0 {
            return Err(MemError::EmptyRange);
        }

        let start = lin.align_down(PAGE_SIZE_4KB).as_u64();
        let end = (lin.as_u64() + len + PAGE_SIZE_4KB - 1) & !(PAGE_SIZE_4KB - 1);

        let mut page_sizes = 0u64;
        let mut pos = start;
        while pos < end {
            let vaddr = VirtAddr::new(pos);
            let Some(result) = self.walk(vaddr) else {
                pos += PAGE_SIZE_4KB;
                continue;
            };

            let page_base = pos & !(result.page_size - 1);
            let covers_whole = page_base >= start && page_base + result.page_size <= end;

            if result.page_size == PAGE_SIZE_4KB || covers_whole {
                self.set_leaf_access(vaddr, access);
                page_sizes |= result.page_size;
                pos = page_base + result.page_size;
            } else {
                // Huge page straddles the range: break it up and retry.
                self.split_at(vaddr)?;
            }
        }

        Ok(Mapping {
            lin: start,
            phys: 0,
            flags: access,
            size: end - start,
            page_sizes,
        })
    }

    /// Apply `access` to the single page enclosing `lin` (whatever its
    /// size), returning the new flags.
    pub fn protect_page_r(&mut self, lin: VirtAddr, access: Access) -> Result<Access, MemError> {
        if self.walk(lin).is_none() {
            return Err(MemError::NotFound);
        }
        self.set_leaf_access(lin, access);
        Ok(self.flags(lin))
    }

    /// Split the huge page enclosing `lin` one level down.
    fn split_at(&mut self, lin: VirtAddr) -> Result<(), MemError> {
        let pml4 = table_mut(self.pml4_phys);
        let pml4_entry = pml4.entry_mut(PageTableLevel::Four.index_of(lin));
        if !pml4_entry.points_to_table() {
            return Err(MemError::NotFound);
        }
        let pdpt = table_mut(pml4_entry.address());
        let pdpt_entry = pdpt.entry_mut(PageTableLevel::Three.index_of(lin));
        if !pdpt_entry.is_present() {
            return Err(MemError::NotFound);
        }
        if pdpt_entry.is_huge() {
            split_pdpt_huge(pdpt_entry)?;
            tlb::flush_page(lin);
            return Ok(());
        }
        let pd = table_mut(pdpt_entry.address());
        let pd_entry = pd.entry_mut(PageTableLevel::Two.index_of(lin));
        if pd_entry.is_present() && pd_entry.is_huge() {
            split_pd_huge(pd_entry)?;
            tlb::flush_page(lin);
            return Ok(());
        }
        Err(MemError::NotFound)
    }

    /// Rewrite the leaf entry's flag bits in place, keeping its frame.
    fn set_leaf_access(&mut self, lin: VirtAddr, access: Access) {
        let pml4 = table_mut(self.pml4_phys);
        let pml4_entry = pml4.entry_mut(PageTableLevel::Four.index_of(lin));
        if !pml4_entry.points_to_table() {
            return;
        }
        let pdpt = table_mut(pml4_entry.address());
        let pdpt_entry = pdpt.entry_mut(PageTableLevel::Three.index_of(lin));
        if !pdpt_entry.is_present() {
            return;
        }
        if pdpt_entry.is_huge() {
            pdpt_entry.set_flags(access.to_page_flags() | PageFlags::HUGE);
            tlb::flush_page(lin);
            return;
        }
        let pd = table_mut(pdpt_entry.address());
        let pd_entry = pd.entry_mut(PageTableLevel::Two.index_of(lin));
        if !pd_entry.is_present() {
            return;
        }
        if pd_entry.is_huge() {
            pd_entry.set_flags(access.to_page_flags() | PageFlags::HUGE);
            tlb::flush_page(lin);
            return;
        }
        let pt = table_mut(pd_entry.address());
        let pt_entry = pt.entry_mut(PageTableLevel::One.index_of(lin));
        if pt_entry.is_present() {
            pt_entry.set_flags(access.to_page_flags());
            tlb::flush_page(lin);
        }
    }
}
