//
// Copyright 2024 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Page State Change entries, and the batches of entries that are built from
//! a contiguous range of guest-physical memory.

use x86_64::PhysAddr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{instructions::PageSize, msr::PageAssignment};

/// Mask for bits [51:12] of an entry, the guest frame number shifted into
/// place.
const GFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Mask for bits [11:0] of an entry, the current page offset.
const CURRENT_PAGE_MASK: u64 = 0xFFF;

const OPERATION_SHIFT: u64 = 52;
const OPERATION_MASK: u64 = 0xF;
const PAGE_SIZE_SHIFT: u64 = 56;

/// A single Page State Change entry.
///
/// The layout is fixed by the GHCB protocol and is consumed by the hypervisor
/// as-is:
///
/// - [63:57]: reserved, must be zero
/// - [56]: page size (0 = 4KiB, 1 = 2MiB)
/// - [55:52]: page operation
/// - [51:12]: guest frame number
/// - [11:0]: current page, in 4KiB increments
///
/// See Table 9 in <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct PageStateChangeEntry(u64);

impl PageStateChangeEntry {
    /// Creates an entry for the page starting at `address`.
    ///
    /// The low 12 bits of the address are ignored; the current page always
    /// starts at zero.
    pub fn new(address: PhysAddr, page_size: PageSize, assignment: PageAssignment) -> Self {
        Self(
            ((page_size as u64) << PAGE_SIZE_SHIFT)
                | ((assignment as u64) << OPERATION_SHIFT)
                | (address.as_u64() & GFN_MASK),
        )
    }

    /// The start address of the page the entry refers to.
    pub fn address(&self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 & GFN_MASK)
    }

    /// The guest frame number of the page the entry refers to.
    pub fn gfn(&self) -> u64 {
        (self.0 & GFN_MASK) >> 12
    }

    pub fn page_size(&self) -> PageSize {
        if (self.0 >> PAGE_SIZE_SHIFT) & 1 == 0 {
            PageSize::Page4KiB
        } else {
            PageSize::Page2MiB
        }
    }

    /// The requested assignment, or `None` if the operation field does not
    /// contain a valid operation.
    pub fn assignment(&self) -> Option<PageAssignment> {
        PageAssignment::from_repr(((self.0 >> OPERATION_SHIFT) & OPERATION_MASK) as u8)
    }

    pub fn current_page(&self) -> u16 {
        (self.0 & CURRENT_PAGE_MASK) as u16
    }
}

impl From<PageStateChangeEntry> for u64 {
    fn from(entry: PageStateChangeEntry) -> Self {
        entry.0
    }
}

impl From<u64> for PageStateChangeEntry {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Exclusive upper bound of the 52-bit guest-physical address space.
pub const GUEST_PHYSICAL_ADDRESS_LIMIT: u64 = 1 << 52;

/// A batch of Page State Change entries, stored in a caller-provided buffer.
///
/// All entries in a batch request the same assignment, but they may mix page
/// sizes. Entries in `[0, len)` are valid; anything beyond `len` is stale.
/// Progress through a batch is only tracked by the hypervisor, in the header of
/// the GHCB shared buffer.
pub struct PageStateChangeBatch<'a> {
    entries: &'a mut [PageStateChangeEntry],
    len: usize,
}

impl<'a> PageStateChangeBatch<'a> {
    /// Creates an empty batch that can hold up to `entries.len()` entries.
    pub fn new(entries: &'a mut [PageStateChangeEntry]) -> Self {
        Self { entries, len: 0 }
    }

    /// The maximum number of entries the batch can hold.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the last valid entry, or `None` if the batch is empty.
    pub fn end_entry(&self) -> Option<usize> {
        self.len.checked_sub(1)
    }

    /// The valid entries of the batch.
    pub fn entries(&self) -> &[PageStateChangeEntry] {
        &self.entries[..self.len]
    }

    /// Clears the batch, zeroing all of the backing storage.
    pub fn reset(&mut self) {
        self.entries.fill(PageStateChangeEntry::default());
        self.len = 0;
    }

    /// Fills the batch with entries covering guest-physical memory from `start`
    /// towards the exclusive bound `end`.
    ///
    /// When `use_large_entry` is set, every 2MiB-aligned address that has at
    /// least 2MiB left before `end` gets a single 2MiB entry; everything else
    /// is covered with 4KiB entries. Filling stops once the batch is full or
    /// `end` is reached.
    ///
    /// Returns the address immediately after the last entry placed, which is
    /// `start` itself if nothing was placed. Anything between the returned
    /// address and `end` needs another batch. Addresses are plain integers, as
    /// `end` may be [`GUEST_PHYSICAL_ADDRESS_LIMIT`] itself.
    pub fn fill(
        &mut self,
        start: u64,
        end: u64,
        assignment: PageAssignment,
        use_large_entry: bool,
    ) -> u64 {
        self.reset();

        let mut address = start;
        while address < end && self.len < self.capacity() {
            let large = PageSize::Page2MiB.bytes();
            let page_size =
                if use_large_entry && address % large == 0 && end - address >= large {
                    PageSize::Page2MiB
                } else {
                    PageSize::Page4KiB
                };

            self.entries[self.len] =
                PageStateChangeEntry::new(PhysAddr::new_truncate(address), page_size, assignment);
            self.len += 1;
            address += page_size.bytes();
        }

        address
    }
}
