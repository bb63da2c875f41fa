//! Paging regression tests.
//!
//! The mapping-algebra and flag-conversion tests are pure. The table tests
//! build a fresh hierarchy from the frame pool and are skipped when the
//! pool has not been initialised (e.g. very early in boot).

use keel_abi::addr::VirtAddr;
use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::error::MemError;
use crate::frame::frame_pool_ready;
use crate::paging;
use crate::paging::defs::{Access, PAGE_SIZE_2MB, PAGE_SIZE_4KB, PageFlags};
use crate::paging::mapping::Mapping;
use crate::paging::space::AddressSpace;

// Linear addresses far away from anything the kernel itself uses.
const T_LIN: u64 = 0x20_0000_0000;
const T_PHYS: u64 = 0x30_0000_0000;

pub fn test_mapping_add_contiguous() -> TestResult {
    let a = Mapping::with_psizes(0x1000, 0x8000, Access::READ | Access::WRITE, 0x1000, PAGE_SIZE_4KB);
    let b = Mapping::with_psizes(0x2000, 0x9000, Access::READ, 0x1000, PAGE_SIZE_2MB);

    let sum = a + b;
    assert_test!(sum.is_some(), "contiguous mappings compose");
    assert_eq_test!(sum.lin, 0x1000, "lin is the lower of the two");
    assert_eq_test!(sum.phys, 0x8000, "phys is the lower of the two");
    assert_eq_test!(sum.size, 0x2000, "sizes add");
    assert_eq_test!(sum.flags, Access::READ, "flags intersect");
    assert_eq_test!(sum.page_sizes, PAGE_SIZE_4KB | PAGE_SIZE_2MB, "page sizes union");

    // Order must not matter.
    assert_eq_test!(b + a, sum, "addition commutes for adjacent ranges");
    pass!()
}

pub fn test_mapping_add_rejects_gaps() -> TestResult {
    let a = Mapping::with_psizes(0x1000, 0x8000, Access::READ, 0x1000, PAGE_SIZE_4KB);
    // Linear-contiguous but physically disjoint.
    let b = Mapping::with_psizes(0x2000, 0xF000, Access::READ, 0x1000, PAGE_SIZE_4KB);
    assert_test!(!(a + b).is_some(), "physical gap breaks composition");

    // Physically contiguous but a linear gap.
    let c = Mapping::with_psizes(0x4000, 0x9000, Access::READ, 0x1000, PAGE_SIZE_4KB);
    assert_test!(!(a + c).is_some(), "linear gap breaks composition");
    pass!()
}

pub fn test_mapping_add_identity() -> TestResult {
    let a = Mapping::with_psizes(0x1000, 0x8000, Access::READ, 0x1000, PAGE_SIZE_4KB);
    let empty = Mapping::empty();
    assert_eq_test!(a + empty, a, "empty is right identity");
    assert_eq_test!(empty + a, a, "empty is left identity");
    pass!()
}

pub fn test_mapping_psize_bounds() -> TestResult {
    let m = Mapping::with_psizes(0x1000, 0x8000, Access::READ, 0x1000, PAGE_SIZE_4KB | PAGE_SIZE_2MB);
    assert_eq_test!(m.min_psize(), PAGE_SIZE_4KB, "min page size");
    assert_eq_test!(m.max_psize(), PAGE_SIZE_2MB, "max page size");
    pass!()
}

pub fn test_access_page_flag_conversion() -> TestResult {
    let rw = (Access::READ | Access::WRITE).to_page_flags();
    assert_test!(rw.contains(PageFlags::PRESENT), "read implies present");
    assert_test!(rw.contains(PageFlags::WRITABLE), "write maps to writable");
    assert_test!(rw.contains(PageFlags::NO_EXECUTE), "no execute unless asked");

    let rx = (Access::READ | Access::EXECUTE).to_page_flags();
    assert_test!(!rx.contains(PageFlags::NO_EXECUTE), "execute clears NX");
    assert_test!(!rx.contains(PageFlags::WRITABLE), "no write bit");

    assert_eq_test!(Access::NONE.to_page_flags(), PageFlags::empty(), "none is not present");
    assert_eq_test!(
        Access::from_page_flags(rw),
        Access::READ | Access::WRITE,
        "round trip"
    );
    assert_eq_test!(
        Access::from_page_flags(PageFlags::NO_EXECUTE),
        Access::NONE,
        "not-present reads as none"
    );
    pass!()
}

pub fn test_map_translates_and_reports_page_sizes() -> TestResult {
    if !frame_pool_ready() {
        return keel_lib::testing::TestResult::Skipped;
    }
    let mut space = match AddressSpace::new() {
        Ok(s) => s,
        Err(e) => return fail!("address space: {:?}", e),
    };

    // 2 MiB + 4 KiB with both sizes allowed: greedy descent places one
    // huge page then one small page.
    let request = Mapping::with_psizes(
        T_LIN,
        T_PHYS,
        Access::READ | Access::WRITE,
        PAGE_SIZE_2MB + PAGE_SIZE_4KB,
        PAGE_SIZE_4KB | PAGE_SIZE_2MB,
    );
    let result = match space.map_r(request) {
        Ok(m) => m,
        Err(e) => return fail!("map_r: {:?}", e),
    };

    assert_eq_test!(result.size, PAGE_SIZE_2MB + PAGE_SIZE_4KB, "size preserved");
    assert_eq_test!(
        result.page_sizes,
        PAGE_SIZE_4KB | PAGE_SIZE_2MB,
        "both page sizes used"
    );

    let phys = space.virt_to_phys(VirtAddr::new(T_LIN));
    assert_eq_test!(phys.map(|p| p.as_u64()), Some(T_PHYS), "head translates");
    let tail = space.virt_to_phys(VirtAddr::new(T_LIN + PAGE_SIZE_2MB + 0x123));
    assert_eq_test!(
        tail.map(|p| p.as_u64()),
        Some(T_PHYS + PAGE_SIZE_2MB + 0x123),
        "tail translates with page offset"
    );

    assert_eq_test!(
        space.active_page_size(VirtAddr::new(T_LIN)),
        PAGE_SIZE_2MB,
        "head sits in a huge page"
    );
    assert_eq_test!(
        space.active_page_size(VirtAddr::new(T_LIN + PAGE_SIZE_2MB)),
        PAGE_SIZE_4KB,
        "tail sits in a small page"
    );
    pass!()
}

pub fn test_map_rejects_bad_addresses() -> TestResult {
    if !frame_pool_ready() {
        return keel_lib::testing::TestResult::Skipped;
    }
    let mut space = AddressSpace::new().unwrap();

    let zero_lin = Mapping::with_psizes(0, T_PHYS, Access::READ, 0x1000, PAGE_SIZE_4KB);
    assert_eq_test!(space.map_r(zero_lin), Err(MemError::BadAddress), "lin 0 rejected");

    let zero_phys = Mapping::with_psizes(T_LIN, 0, Access::READ, 0x1000, PAGE_SIZE_4KB);
    assert_eq_test!(space.map_r(zero_phys), Err(MemError::BadAddress), "phys 0 rejected");

    let crooked = Mapping::with_psizes(T_LIN + 0x10, T_PHYS, Access::READ, 0x1000, PAGE_SIZE_4KB);
    assert_eq_test!(space.map_r(crooked), Err(MemError::Misaligned), "misaligned lin rejected");

    let no_sizes = Mapping::with_psizes(T_LIN, T_PHYS, Access::READ, 0x1000, 0x800);
    assert_eq_test!(
        space.map_r(no_sizes),
        Err(MemError::UnsupportedPageSize),
        "unsupported page size rejected"
    );
    pass!()
}

pub fn test_unmap_clears_translation() -> TestResult {
    if !frame_pool_ready() {
        return keel_lib::testing::TestResult::Skipped;
    }
    let mut space = AddressSpace::new().unwrap();
    let lin = VirtAddr::new(T_LIN + 0x4000_0000);

    let request = Mapping::with_psizes(
        lin.as_u64(),
        T_PHYS,
        Access::READ | Access::WRITE,
        4 * PAGE_SIZE_4KB,
        PAGE_SIZE_4KB,
    );
    space.map_r(request).unwrap();
    assert_test!(space.virt_to_phys(lin).is_some(), "mapped before unmap");

    space.unmap_r(lin, 4 * PAGE_SIZE_4KB).unwrap();
    assert_test!(space.virt_to_phys(lin).is_none(), "translation gone");
    assert_eq_test!(space.flags(lin), Access::NONE, "flags report none");
    pass!()
}

pub fn test_protect_page_sets_exact_flags() -> TestResult {
    if !frame_pool_ready() {
        return keel_lib::testing::TestResult::Skipped;
    }
    let mut space = AddressSpace::new().unwrap();
    let lin = VirtAddr::new(T_LIN + 0x8000_0000);

    let request = Mapping::with_psizes(
        lin.as_u64(),
        T_PHYS,
        Access::READ | Access::WRITE,
        PAGE_SIZE_4KB,
        PAGE_SIZE_4KB,
    );
    space.map_r(request).unwrap();
    assert_eq_test!(space.flags(lin), Access::READ | Access::WRITE, "initial flags");

    let got = space.protect_page_r(lin, Access::READ).unwrap();
    assert_eq_test!(got, Access::READ, "protect returns the new flags");
    assert_eq_test!(space.flags(lin), Access::READ, "flags read back exactly");
    pass!()
}

pub fn test_protect_splits_straddled_huge_page() -> TestResult {
    if !frame_pool_ready() {
        return keel_lib::testing::TestResult::Skipped;
    }
    let mut space = AddressSpace::new().unwrap();
    let lin = VirtAddr::new(T_LIN + 0xC000_0000);

    let request = Mapping::with_psizes(
        lin.as_u64(),
        T_PHYS,
        Access::READ | Access::WRITE,
        PAGE_SIZE_2MB,
        PAGE_SIZE_2MB,
    );
    space.map_r(request).unwrap();
    assert_eq_test!(space.active_page_size(lin), PAGE_SIZE_2MB, "starts huge");

    // Protect only the first 16 KiB: the huge page must split.
    space
        .protect_r(lin, 4 * PAGE_SIZE_4KB, Access::READ)
        .unwrap();
    assert_eq_test!(space.active_page_size(lin), PAGE_SIZE_4KB, "split to 4 KiB");
    assert_eq_test!(space.flags(lin), Access::READ, "protected head");

    // Pages beyond the protected prefix keep their flags and translation.
    let beyond = VirtAddr::new(lin.as_u64() + 4 * PAGE_SIZE_4KB);
    assert_eq_test!(space.flags(beyond), Access::READ | Access::WRITE, "tail untouched");
    assert_eq_test!(
        space.virt_to_phys(beyond).map(|p| p.as_u64()),
        Some(T_PHYS + 4 * PAGE_SIZE_4KB),
        "tail still translates to the split frame"
    );
    pass!()
}

pub fn test_global_map_rejects_overlapping_ranges() -> TestResult {
    if !frame_pool_ready() {
        return keel_lib::testing::TestResult::Skipped;
    }
    let lin = 0x28_0000_0000u64;
    let request = Mapping::with_psizes(
        lin,
        T_PHYS,
        Access::READ | Access::WRITE,
        2 * PAGE_SIZE_4KB,
        PAGE_SIZE_4KB,
    );

    let first = match paging::map(request, "overlap-test") {
        Ok(m) => m,
        Err(e) => return fail!("first map: {:?}", e),
    };
    assert_eq_test!(first.size, 2 * PAGE_SIZE_4KB, "first map succeeds");

    match paging::map(request, "overlap-test-2") {
        Err(MemError::Overlap) => {}
        other => return fail!("second map: expected Overlap, got {:?}", other),
    }

    // Unmap releases the range for reuse.
    paging::unmap(VirtAddr::new(lin)).unwrap();
    assert_test!(
        paging::map(request, "overlap-test-3").is_ok(),
        "range reusable after unmap"
    );
    paging::unmap(VirtAddr::new(lin)).unwrap();
    pass!()
}

define_test_suite!(
    paging,
    [
        test_mapping_add_contiguous,
        test_mapping_add_rejects_gaps,
        test_mapping_add_identity,
        test_mapping_psize_bounds,
        test_access_page_flag_conversion,
        test_map_translates_and_reports_page_sizes,
        test_map_rejects_bad_addresses,
        test_unmap_clears_translation,
        test_protect_page_sets_exact_flags,
        test_protect_splits_straddled_huge_page,
        test_global_map_rejects_overlapping_ranges,
    ]
);
