//! The linear-to-physical mapping descriptor exchanged with the paging API.

use core::ops::{Add, AddAssign};

use super::defs::Access;

/// A linear→physical range installation request or result.
///
/// On input to `map`, `page_sizes` restricts which page sizes may be used
/// (a bitmask of 4 KiB / 2 MiB / 1 GiB). On output it has one bit set for
/// each page size that was actually used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub lin: u64,
    pub phys: u64,
    pub flags: Access,
    pub size: u64,
    pub page_sizes: u64,
}

impl Mapping {
    pub const fn empty() -> Self {
        Self {
            lin: 0,
            phys: 0,
            flags: Access::NONE,
            size: 0,
            page_sizes: 0,
        }
    }

    /// Construct with explicit page-size restrictions.
    pub const fn with_psizes(lin: u64, phys: u64, flags: Access, size: u64, psizes: u64) -> Self {
        Self {
            lin,
            phys,
            flags,
            size,
            page_sizes: psizes,
        }
    }

    /// Construct with no page-size restriction (any supported size).
    pub fn new(lin: u64, phys: u64, flags: Access, size: u64) -> Self {
        Self::with_psizes(lin, phys, flags, size, super::supported_page_sizes())
    }

    /// A mapping is meaningful when it has a size and at least one page size.
    #[inline]
    pub const fn is_some(&self) -> bool {
        self.size != 0 && self.page_sizes != 0
    }

    /// Smallest page size present in the mask.
    #[inline]
    pub const fn min_psize(&self) -> u64 {
        if self.page_sizes == 0 {
            0
        } else {
            1u64 << self.page_sizes.trailing_zeros()
        }
    }

    /// Largest page size present in the mask.
    #[inline]
    pub const fn max_psize(&self) -> u64 {
        if self.page_sizes == 0 {
            0
        } else {
            1u64 << (63 - self.page_sizes.leading_zeros())
        }
    }
}

impl Add for Mapping {
    type Output = Mapping;

    /// Compose two mappings. The result is empty unless the operands are
    /// contiguous in both linear and physical space; flags intersect and
    /// page sizes union.
    fn add(self, rhs: Mapping) -> Mapping {
        if !rhs.is_some() {
            return self;
        }
        if !self.is_some() {
            return rhs;
        }

        let back_to_back = self.lin + self.size == rhs.lin && self.phys + self.size == rhs.phys;
        let front_to_front = rhs.lin + rhs.size == self.lin && rhs.phys + rhs.size == self.phys;
        if !back_to_back && !front_to_front {
            return Mapping::empty();
        }

        Mapping {
            lin: self.lin.min(rhs.lin),
            phys: self.phys.min(rhs.phys),
            flags: self.flags & rhs.flags,
            size: self.size + rhs.size,
            page_sizes: self.page_sizes | rhs.page_sizes,
        }
    }
}

impl AddAssign for Mapping {
    fn add_assign(&mut self, rhs: Mapping) {
        *self = *self + rhs;
    }
}
