//! Public paging API over the kernel's single address space.
//!
//! Every mapping operation is also registered with the memory map (§
//! [`crate::memmap`]): `map` claims a named range, `unmap` releases it.
//! The raw table operations live in [`space::AddressSpace`].

pub mod defs;
pub mod mapping;
pub mod space;

use core::sync::atomic::{AtomicU64, Ordering};

use keel_abi::addr::{PhysAddr, VirtAddr};
use keel_lib::{IrqMutex, align_up_u64, klog_debug, klog_info};

use crate::error::MemError;
use crate::memmap::{self, FixedMemoryRange};
use defs::{Access, PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_SIZE_4KB};
use mapping::Mapping;
use space::AddressSpace;

// ---------------------------------------------------------------------------
// Supported page sizes
// ---------------------------------------------------------------------------

static SUPPORTED_PAGE_SIZES: AtomicU64 = AtomicU64::new(0);

fn detect_page_sizes() -> u64 {
    let mut sizes = PAGE_SIZE_4KB | PAGE_SIZE_2MB;
    // CPUID leaf 0x80000001, EDX bit 26: 1 GiB pages.
    let cpuid = core::arch::x86_64::__cpuid(0x8000_0001);
    if cpuid.edx & (1 << 26) != 0 {
        sizes |= PAGE_SIZE_1GB;
    }
    sizes
}

/// Bitmask with one bit set per supported page size.
pub fn supported_page_sizes() -> u64 {
    let cached = SUPPORTED_PAGE_SIZES.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let detected = detect_page_sizes();
    SUPPORTED_PAGE_SIZES.store(detected, Ordering::Relaxed);
    detected
}

pub fn supported_page_size(size: u64) -> bool {
    supported_page_sizes() & size == size && size.is_power_of_two()
}

pub fn min_psize() -> u64 {
    PAGE_SIZE_4KB
}

pub fn max_psize() -> u64 {
    let sizes = supported_page_sizes();
    1u64 << (63 - sizes.leading_zeros())
}

// ---------------------------------------------------------------------------
// The kernel address space
// ---------------------------------------------------------------------------

static KERNEL_SPACE: IrqMutex<Option<AddressSpace>> = IrqMutex::new(None);

fn with_kernel_space<R>(
    f: impl FnOnce(&mut AddressSpace) -> Result<R, MemError>,
) -> Result<R, MemError> {
    let mut guard = KERNEL_SPACE.lock();
    if guard.is_none() {
        *guard = Some(AddressSpace::new()?);
    }
    f(guard.as_mut().unwrap())
}

/// Build the boot layout:
///
/// - a dedicated 4 KiB leaf table for the first 2 MiB with page 0 absent;
/// - identity map up to 512 GiB writable/no-execute using 1 GiB pages when
///   the CPU supports them, else 2 MiB pages over the first 16 GiB.
///
/// The ELF text range is re-protected read+execute afterwards via
/// [`protect_text`].
pub fn init_identity_map() -> Result<(), MemError> {
    const GIB: u64 = 1 << 30;

    with_kernel_space(|space| {
        // First 2 MiB through 4 KiB leaves, skipping page 0.
        space.map_r(Mapping::with_psizes(
            PAGE_SIZE_4KB,
            PAGE_SIZE_4KB,
            Access::READ | Access::WRITE,
            PAGE_SIZE_2MB - PAGE_SIZE_4KB,
            PAGE_SIZE_4KB,
        ))?;

        let span = if supported_page_size(PAGE_SIZE_1GB) {
            512 * GIB
        } else {
            16 * GIB
        };
        space.map_r(Mapping::with_psizes(
            PAGE_SIZE_2MB,
            PAGE_SIZE_2MB,
            Access::READ | Access::WRITE,
            span - PAGE_SIZE_2MB,
            PAGE_SIZE_2MB | (supported_page_sizes() & PAGE_SIZE_1GB),
        ))?;

        klog_info!(
            "paging: identity map built ({} GiB, 1 GiB pages: {})",
            span / GIB,
            supported_page_size(PAGE_SIZE_1GB)
        );
        Ok(())
    })
}

/// Re-protect the kernel text/rodata range as read+execute and register it
/// in the memory map.
pub fn protect_text(text_start: VirtAddr, text_end: VirtAddr) -> Result<(), MemError> {
    let len = text_end.as_u64() - text_start.as_u64();
    with_kernel_space(|space| {
        space.protect_r(text_start, len, Access::READ | Access::EXECUTE)?;
        Ok(())
    })?;
    memmap::with_memmap(|map| {
        let range =
            FixedMemoryRange::new(text_start.as_u64(), text_end.as_u64() - 1, "kernel text")?;
        map.assign_range(range)?;
        Ok(())
    })
}

/// Point CR3 at the kernel space.
///
/// # Safety
///
/// The identity map must cover the currently executing code and stack.
pub unsafe fn activate() {
    let guard = KERNEL_SPACE.lock();
    if let Some(space) = guard.as_ref() {
        keel_lib::cpu::write_cr3(space.pml4_phys());
    }
}

// ---------------------------------------------------------------------------
// Public mapping operations
// ---------------------------------------------------------------------------

/// Install `m` and register the range in the memory map under `name`.
///
/// Returns the actual mapping: `size` rounded up to the smallest allowed
/// page size, `page_sizes` describing what was really used.
pub fn map(m: Mapping, name: &'static str) -> Result<Mapping, MemError> {
    if m.lin == 0 || m.phys == 0 {
        return Err(MemError::BadAddress);
    }
    let allowed = m.page_sizes & supported_page_sizes();
    if allowed == 0 {
        return Err(MemError::UnsupportedPageSize);
    }
    let min_ps = 1u64 << allowed.trailing_zeros();
    if m.lin % min_ps != 0 || m.phys % min_ps != 0 {
        return Err(MemError::Misaligned);
    }
    let rounded = align_up_u64(m.size, min_ps);

    // Claim the linear range first so overlaps fail before touching tables.
    let key = memmap::with_memmap(|map| {
        map.assign_range(FixedMemoryRange::new(m.lin, m.lin + rounded - 1, name)?)
    })?;

    match with_kernel_space(|space| space.map_r(m)) {
        Ok(result) => {
            klog_debug!(
                "mem: map {} 0x{:x} -> 0x{:x} ({} bytes, psizes 0x{:x})",
                name,
                result.lin,
                result.phys,
                result.size,
                result.page_sizes
            );
            Ok(result)
        }
        Err(e) => {
            memmap::with_memmap(|map| map.erase(key));
            Err(e)
        }
    }
}

/// Remove the mapping that starts at `lin`, clearing its PTEs and erasing
/// its memory-map range. The linear address must be the start of a range
/// previously returned by [`map`].
pub fn unmap(lin: VirtAddr) -> Result<Mapping, MemError> {
    let key = memmap::with_memmap(|map| map.in_range(lin.as_u64()));
    if key == 0 || key != lin.as_u64() {
        return Err(MemError::NotFound);
    }
    let size = memmap::with_memmap(|map| map.at(key).map(|r| r.size()))?;
    let result = with_kernel_space(|space| space.unmap_r(lin, size))?;
    memmap::with_memmap(|map| map.erase(key));
    klog_debug!("mem: unmap 0x{:x} ({} bytes)", lin.as_u64(), size);
    Ok(result)
}

/// Set access flags for `[lin, lin + len)`, splitting huge pages as needed.
pub fn protect(lin: VirtAddr, len: u64, access: Access) -> Result<Mapping, MemError> {
    with_kernel_space(|space| space.protect_r(lin, len, access))
}

/// Set access flags for the single page enclosing `lin`.
pub fn protect_page(lin: VirtAddr, access: Access) -> Result<Access, MemError> {
    with_kernel_space(|space| space.protect_page_r(lin, access))
}

/// Access flags of the page enclosing `lin` (`NONE` when unmapped).
pub fn flags(lin: VirtAddr) -> Access {
    let guard = KERNEL_SPACE.lock();
    match guard.as_ref() {
        Some(space) => space.flags(lin),
        None => Access::NONE,
    }
}

/// Actual page size enclosing `lin`, or 0 when unmapped.
pub fn active_page_size(lin: VirtAddr) -> u64 {
    let guard = KERNEL_SPACE.lock();
    match guard.as_ref() {
        Some(space) => space.active_page_size(lin),
        None => 0,
    }
}

/// Physical address `lin` resolves to, if mapped.
pub fn virt_to_phys(lin: VirtAddr) -> Option<PhysAddr> {
    let guard = KERNEL_SPACE.lock();
    guard.as_ref().and_then(|space| space.virt_to_phys(lin))
}
