//! Small CPU primitives: interrupt-flag save/restore, halt, control and
//! model-specific register access.
//!
//! Everything here funnels through the `x86_64` crate so that the unsafe
//! instruction encodings live in exactly one dependency.

use keel_abi::addr::{PhysAddr, VirtAddr};
use x86_64::instructions::interrupts;
use x86_64::registers::control::Cr3;
use x86_64::registers::model_specific::FsBase;

/// Disable interrupts, returning the previous IF state for
/// [`restore_flags`].
#[inline]
pub fn save_flags_cli() -> u64 {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled as u64
}

/// Restore the interrupt flag saved by [`save_flags_cli`].
#[inline]
pub fn restore_flags(saved: u64) {
    if saved != 0 {
        interrupts::enable();
    }
}

/// Halt this CPU forever. Used by panic paths.
#[inline]
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Physical address of the active PML4 (CR3 with flag bits masked off).
#[inline]
pub fn read_cr3() -> PhysAddr {
    let (frame, _flags) = Cr3::read_raw();
    PhysAddr::new(frame.start_address().as_u64())
}

/// Point CR3 at a new PML4.
///
/// # Safety
///
/// `pml4_phys` must reference a valid, fully-populated page table hierarchy
/// that maps the currently executing code.
#[inline]
pub unsafe fn write_cr3(pml4_phys: PhysAddr) {
    use x86_64::structures::paging::PhysFrame;
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(pml4_phys.as_u64()));
    Cr3::write_raw(frame, 0);
}

/// Write the FS segment base, the anchor of a fiber's thread-local block.
#[inline]
pub fn set_fs_base(addr: VirtAddr) {
    FsBase::write(x86_64::VirtAddr::new(addr.as_u64()));
}

/// Read the FS segment base.
#[inline]
pub fn fs_base() -> VirtAddr {
    VirtAddr::new(FsBase::read().as_u64())
}

/// Invalidate the TLB entry covering `addr` on this CPU.
#[inline]
pub fn invlpg(addr: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(addr.as_u64()));
}

/// Flush the entire TLB (CR3 reload).
#[inline]
pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}
