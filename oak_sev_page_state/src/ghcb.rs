//
// Copyright 2022 The Project Oak Authors
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

//! This module contains an implementation of the guest-hypervisor
//! communications block (GHCB) page, and of the Page State Change exchange
//! that uses it.

use core::{
    mem::{offset_of, size_of},
    num::NonZeroUsize,
    ptr::read_volatile,
    sync::atomic::{fence, Ordering},
};

use bitflags::bitflags;
use snafu::ensure;
use x86_64::{
    structures::paging::{page::NotGiantPageSize, PageSize as _, PhysFrame, Size2MiB},
    PhysAddr, VirtAddr,
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    batch::PageStateChangeEntry,
    instructions::PageSize,
    msr::{
        request_termination, set_ghcb_address_and_exit, GhcbGpa, PageAssignment,
        TerminationReason, TerminationRequest,
    },
    page_state::{
        CursorTamperedSnafu, ExitLimitExceededSnafu, NoEntriesSnafu, PageStateChangeError,
        PageStateChangeFailedSnafu, PageStateExchange, TerminateGuest, TooManyEntriesSnafu,
        VmgExitFailedSnafu,
    },
    Translator,
};

/// The size of the GHCB page.
pub const GHCB_PAGE_SIZE: usize = 4096;

/// The version of the GHCB protocol and page layout that we expect to use.
pub const GHCB_PROTOCOL_VERSION: u16 = 2;

/// The maximum number of entries in a single Page State Change request.
pub const MAX_PAGE_STATE_CHANGE_ENTRIES: usize = 253;

/// The value of the sw_exit_code field when doing a Page State Change request.
///
/// See table 6 in <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.
const SW_EXIT_CODE_PAGE_STATE_CHANGE: u64 = 0x8000_0010;

/// The bitmap representing the minimum fields that must always be valid.
const BASE_VALID_BITMAP: ValidBitmap =
    ValidBitmap::SW_EXIT_CODE.union(ValidBitmap::SW_EXIT_INFO_1).union(ValidBitmap::SW_EXIT_INFO_2);

/// The mask for extracting the hypervisor's return value from the
/// sw_exit_info_1 field.
const SW_EXIT_INFO_1_RETURN_MASK: u64 = 0xffff_ffff;

/// Size of the shared buffer space in the GHCB structure.
const SHARED_BUFFER_SIZE: usize = 2032;

/// The guest-host communications block.
///
/// See: Table 3 in <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>
#[repr(C, align(4096))]
#[derive(Debug, FromBytes)]
pub struct Ghcb {
    /// Reserved. Must be 0.
    _reserved_0: [u8; 203],
    /// The current privilege level of the executing code.
    pub cpl: u8,
    /// Reserved. Must be 0.
    _reserved_1: [u8; 116],
    /// The value of the IA32_XSS model-specific register.
    pub xss: u64,
    /// Reserved. Must be 0.
    _reserved_2: [u8; 24],
    /// The value of the DR7 debug register.
    pub dr7: u64,
    /// Reserved. Must be 0.
    _reserved_3: [u8; 144],
    /// The value of the RAX register.
    pub rax: u64,
    /// Reserved. Must be 0.
    _reserved_4: [u8; 264],
    /// The value of the RCX register.
    pub rcx: u64,
    /// The value of the RDX register.
    pub rdx: u64,
    /// The value of the RBX register.
    pub rbx: u64,
    /// Reserved. Must be 0.
    _reserved_5: [u8; 112],
    /// Guest-controlled exit code.
    pub sw_exit_code: u64,
    /// Guest-controlled exit information 1.
    pub sw_exit_info_1: u64,
    /// Guest-controlled exit information 2.
    pub sw_exit_info_2: u64,
    /// Guest-controlled additional information.
    pub sw_scratch: u64,
    /// Reserved. Must be 0.
    _reserved_6: [u8; 56],
    /// Value of the XCR0 extended control register.
    pub xcr0: u64,
    /// Bitmap indicating which quadwords of the save state area are valid in
    /// the range from offset 0x000 through to offset 0x3ef.
    pub valid_bitmap: ValidBitmap,
    /// The guest-physical address of the page that contains the x87-related
    /// saved state.
    pub x87_state_gpa: u64,
    /// Reserved. Must be 0.
    _reserved_7: [u8; 1016],
    /// Area that can be used as a shared buffer for communicating additional
    /// information. Page State Change requests are placed here.
    pub shared_buffer: [u8; SHARED_BUFFER_SIZE],
    /// Reserved. Must be 0.
    _reserved_8: [u8; 10],
    /// The version of the GHCB protocol and page layout in use.
    pub protocol_version: u16,
    /// The usage of the GHCB page. A value of 0 indicates the usage is in line
    /// with the definition as specified in this struct.
    pub ghcb_usage: u32,
}

impl Default for Ghcb {
    fn default() -> Self {
        Self::new()
    }
}

impl AsMut<Ghcb> for Ghcb {
    #[inline]
    fn as_mut(&mut self) -> &mut Ghcb {
        self
    }
}

impl AsRef<Ghcb> for Ghcb {
    #[inline]
    fn as_ref(&self) -> &Ghcb {
        self
    }
}

static_assertions::assert_eq_size!(Ghcb, [u8; GHCB_PAGE_SIZE]);
static_assertions::const_assert_eq!(offset_of!(Ghcb, shared_buffer), 0x800);
static_assertions::const_assert_eq!(offset_of!(Ghcb, protocol_version), 0xffa);

/// Flags indicating which fields in a specific GHCB instance are valid.
#[derive(Debug, Default, FromBytes)]
#[repr(transparent)]
pub struct ValidBitmap(u128);

bitflags! {
    impl ValidBitmap: u128 {
        const SW_EXIT_CODE = (1 << 114);
        const SW_EXIT_INFO_1 = (1 << 115);
        const SW_EXIT_INFO_2 = (1 << 116);
        const SW_SCRATCH = (1 << 117);
    }
}

impl Ghcb {
    pub const fn new() -> Self {
        Ghcb {
            _reserved_0: [0; 203],
            cpl: 0,
            _reserved_1: [0; 116],
            xss: 0,
            _reserved_2: [0; 24],
            dr7: 0,
            _reserved_3: [0; 144],
            rax: 0,
            _reserved_4: [0; 264],
            rcx: 0,
            rdx: 0,
            rbx: 0,
            _reserved_5: [0; 112],
            sw_exit_code: 0,
            sw_exit_info_1: 0,
            sw_exit_info_2: 0,
            sw_scratch: 0,
            _reserved_6: [0; 56],
            xcr0: 0,
            valid_bitmap: ValidBitmap::empty(),
            x87_state_gpa: 0,
            _reserved_7: [0; 1016],
            shared_buffer: [0; SHARED_BUFFER_SIZE],
            _reserved_8: [0; 10],
            protocol_version: 0,
            ghcb_usage: 0,
        }
    }

    /// Zeroes the entire GHCB.
    pub fn reset(&mut self) {
        self._reserved_0.fill(0);
        self.cpl = 0;
        self._reserved_1.fill(0);
        self.xss = 0;
        self._reserved_2.fill(0);
        self.dr7 = 0;
        self._reserved_3.fill(0);
        self.rax = 0;
        self._reserved_4.fill(0);
        self.rcx = 0;
        self.rdx = 0;
        self.rbx = 0;
        self._reserved_5.fill(0);
        self.sw_exit_code = 0;
        self.sw_exit_info_1 = 0;
        self.sw_exit_info_2 = 0;
        self.sw_scratch = 0;
        self._reserved_6.fill(0);
        self.xcr0 = 0;
        self.valid_bitmap = ValidBitmap::empty();
        self.x87_state_gpa = 0;
        self._reserved_7.fill(0);
        self.shared_buffer.fill(0);
        self._reserved_8.fill(0);
        self.protocol_version = 0;
        self.ghcb_usage = 0;
    }

    /// Reads the Page State Change header the hypervisor may have updated.
    pub(crate) fn page_state_change_header(&self) -> PageStateChangeHeader {
        // Safety: the shared buffer starts at a 2KiB offset into a page-aligned
        // struct, so it is suitably aligned for the header, and any bit pattern
        // is a valid header.
        unsafe { read_volatile(self.shared_buffer.as_ptr() as *const PageStateChangeHeader) }
    }

    /// Overwrites the Page State Change header in the shared buffer.
    pub(crate) fn set_page_state_change_header(&mut self, header: PageStateChangeHeader) {
        self.shared_buffer[..size_of::<PageStateChangeHeader>()]
            .copy_from_slice(header.as_bytes());
    }

    /// Copies `entries` into the shared buffer, right after the header.
    fn set_page_state_change_entries(&mut self, entries: &[PageStateChangeEntry]) {
        let bytes = entries.as_bytes();
        let start = size_of::<PageStateChangeHeader>();
        self.shared_buffer[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads the exit information fields written by the hypervisor.
    fn exit_info(&self) -> (u64, u64) {
        // Safety: both references point to initialized fields of this struct.
        unsafe { (read_volatile(&self.sw_exit_info_1), read_volatile(&self.sw_exit_info_2)) }
    }
}

/// The header of the Page State Change structure, followed in the shared
/// buffer by up to [`MAX_PAGE_STATE_CHANGE_ENTRIES`] entries.
///
/// See section 4.1.6 in <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.
///
/// `cur_entry` and `end_entry` are inclusive indices into the entry array. The
/// hypervisor advances `cur_entry` as it processes entries.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub(crate) struct PageStateChangeHeader {
    pub cur_entry: u16,
    pub end_entry: u16,
    pub _reserved: u32,
}

static_assertions::const_assert_eq!(
    size_of::<PageStateChangeHeader>()
        + MAX_PAGE_STATE_CHANGE_ENTRIES * size_of::<PageStateChangeEntry>(),
    SHARED_BUFFER_SIZE
);
static_assertions::const_assert_eq!(
    offset_of!(Ghcb, shared_buffer) % core::mem::align_of::<PageStateChangeHeader>(),
    0
);

/// The privileged exit that hands the GHCB to the hypervisor.
pub trait VmgExit {
    /// Publishes the guest-physical address of the GHCB and exits to the
    /// hypervisor. Returns once the hypervisor resumes the guest.
    fn vmg_exit(&self, gpa: GhcbGpa, ghcb: &mut Ghcb);

    /// Runs `f` with interrupts disabled on the current processor.
    fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        f()
    }

    /// Asks the hypervisor to terminate the guest. Never returns.
    fn request_termination(&self, reason: TerminationReason) -> !;
}

impl<T: VmgExit> VmgExit for &T {
    fn vmg_exit(&self, gpa: GhcbGpa, ghcb: &mut Ghcb) {
        (**self).vmg_exit(gpa, ghcb)
    }

    fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        (**self).without_interrupts(f)
    }

    fn request_termination(&self, reason: TerminationReason) -> ! {
        (**self).request_termination(reason)
    }
}

/// Exits through the GHCB MSR protocol using the VMGEXIT instruction.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsrProtocolExit;

impl VmgExit for MsrProtocolExit {
    fn vmg_exit(&self, gpa: GhcbGpa, _ghcb: &mut Ghcb) {
        set_ghcb_address_and_exit(gpa);
    }

    fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }

    fn request_termination(&self, reason: TerminationReason) -> ! {
        request_termination(TerminationRequest { reason })
    }
}

/// Implementation of the GHCB protocol using the wrapped GHCB data structure.
pub struct GhcbProtocol<'a, G: AsMut<Ghcb> + ?Sized, E: VmgExit = MsrProtocolExit> {
    ghcb: &'a mut G,
    gpa: GhcbGpa,
    exit: E,
    exit_limit: Option<NonZeroUsize>,
}

impl<'a, G, E> GhcbProtocol<'a, G, E>
where
    G: AsMut<Ghcb> + AsRef<Ghcb> + ?Sized,
    E: VmgExit,
{
    pub fn new<VP: Translator>(
        ghcb: &'a mut G,
        translate: VP,
        exit: E,
    ) -> Result<Self, &'static str> {
        let virtual_address = VirtAddr::from_ptr(ghcb.as_ref() as *const Ghcb);
        let gpa = translate(virtual_address)
            .ok_or("couldn't translate the GHCB virtual address to a physical address")?;
        Ok(Self { ghcb, gpa: GhcbGpa::new(gpa)?, exit, exit_limit: None })
    }

    /// Consumes the GHCB protocol, yielding back the underlying GHCB block.
    pub fn into_inner(self) -> &'a mut G {
        self.ghcb
    }

    /// Resets all of the inner GHCB information to its original state.
    pub fn reset(&mut self) {
        self.ghcb.as_mut().reset();
    }

    /// Gets the guest-physical address for the guest-hypervisor communication
    /// block.
    pub fn get_gpa(&self) -> PhysAddr {
        PhysAddr::new(self.gpa.as_u64())
    }

    /// Limits how many exits a single Page State Change request may take
    /// before it is considered failed. `None` waits for the hypervisor
    /// indefinitely.
    pub fn set_exit_limit(&mut self, limit: Option<NonZeroUsize>) {
        self.exit_limit = limit;
    }

    /// Performs a Page State Change operation on the given physical frame.
    ///
    /// Only the RMP is updated; the caller is responsible for PVALIDATE.
    ///
    /// See section 4.1.6 in <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.
    pub fn page_state_change<S: NotGiantPageSize>(
        &mut self,
        frame: PhysFrame<S>,
        assignment: PageAssignment,
    ) -> Result<(), PageStateChangeError> {
        let page_size =
            if S::SIZE == Size2MiB::SIZE { PageSize::Page2MiB } else { PageSize::Page4KiB };
        let entry = PageStateChangeEntry::new(frame.start_address(), page_size, assignment);
        self.page_state_change_entries(&[entry])
    }

    /// Asks the hypervisor to process all of `entries`, exiting as many times
    /// as it takes for the hypervisor to move past the last entry.
    pub fn page_state_change_entries(
        &mut self,
        entries: &[PageStateChangeEntry],
    ) -> Result<(), PageStateChangeError> {
        let gpa = self.gpa;
        let exit_limit = self.exit_limit;
        let exit = &self.exit;
        let ghcb = self.ghcb.as_mut();
        let exits =
            exit.without_interrupts(|| exchange_entries(ghcb, gpa, exit, exit_limit, entries))?;
        log::trace!("page state change of {} entries took {} exits", entries.len(), exits);
        Ok(())
    }
}

impl<G, E> PageStateExchange for GhcbProtocol<'_, G, E>
where
    G: AsMut<Ghcb> + AsRef<Ghcb> + ?Sized,
    E: VmgExit,
{
    fn exchange(&mut self, entries: &[PageStateChangeEntry]) -> Result<(), PageStateChangeError> {
        self.page_state_change_entries(entries)
    }
}

impl<G, E> TerminateGuest for GhcbProtocol<'_, G, E>
where
    G: AsMut<Ghcb> + ?Sized,
    E: VmgExit,
{
    fn terminate(&self, reason: TerminationReason) -> ! {
        self.exit.request_termination(reason)
    }
}

/// Writes the request into the shared buffer and exits until the hypervisor
/// has moved `cur_entry` past `end_entry`. Returns the number of exits taken.
fn exchange_entries<E: VmgExit>(
    ghcb: &mut Ghcb,
    gpa: GhcbGpa,
    exit: &E,
    exit_limit: Option<NonZeroUsize>,
    entries: &[PageStateChangeEntry],
) -> Result<usize, PageStateChangeError> {
    let count = entries.len();
    ensure!(count > 0, NoEntriesSnafu);
    ensure!(count <= MAX_PAGE_STATE_CHANGE_ENTRIES, TooManyEntriesSnafu { count });
    let end_entry = (count - 1) as u16;

    ghcb.reset();
    ghcb.set_page_state_change_header(PageStateChangeHeader {
        cur_entry: 0,
        end_entry,
        _reserved: 0,
    });
    ghcb.set_page_state_change_entries(entries);

    let scratch = gpa.as_u64() + offset_of!(Ghcb, shared_buffer) as u64;
    let mut last_cur_entry = 0;
    let mut exits = 0;
    loop {
        let header = ghcb.page_state_change_header();
        ensure!(
            header.end_entry == end_entry && header.cur_entry >= last_cur_entry,
            CursorTamperedSnafu { cur_entry: header.cur_entry, end_entry: header.end_entry }
        );
        if header.cur_entry > header.end_entry {
            return Ok(exits);
        }
        last_cur_entry = header.cur_entry;

        if let Some(limit) = exit_limit {
            ensure!(exits < limit.get(), ExitLimitExceededSnafu { limit: limit.get() });
        }

        ghcb.sw_exit_code = SW_EXIT_CODE_PAGE_STATE_CHANGE;
        ghcb.sw_exit_info_1 = 0;
        ghcb.sw_exit_info_2 = 0;
        ghcb.sw_scratch = scratch;
        ghcb.valid_bitmap = BASE_VALID_BITMAP | ValidBitmap::SW_SCRATCH;
        ghcb.protocol_version = GHCB_PROTOCOL_VERSION;

        // Make sure all writes to the GHCB land before the hypervisor reads it.
        fence(Ordering::SeqCst);
        exit.vmg_exit(gpa, ghcb);
        fence(Ordering::SeqCst);
        exits += 1;

        let (exit_info_1, exit_info_2) = ghcb.exit_info();
        ensure!(
            exit_info_1 & SW_EXIT_INFO_1_RETURN_MASK == 0,
            VmgExitFailedSnafu { code: exit_info_1 }
        );
        ensure!(exit_info_2 == 0, PageStateChangeFailedSnafu { code: exit_info_2 });
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use x86_64::structures::paging::Size4KiB;

    use super::*;
    use crate::testing::FakeHypervisor;

    const GHCB_GPA: u64 = 0x8_0000;

    fn translate(_: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(GHCB_GPA))
    }

    fn shared_entries(count: u64) -> Vec<PageStateChangeEntry> {
        (0..count)
            .map(|n| {
                PageStateChangeEntry::new(
                    PhysAddr::new(0x10_0000 + n * 0x1000),
                    PageSize::Page4KiB,
                    PageAssignment::Shared,
                )
            })
            .collect()
    }

    #[googletest::test]
    fn test_page_state_change_layout() {
        assert_that!(size_of::<PageStateChangeHeader>(), eq(8));
        assert_that!(offset_of!(Ghcb, sw_scratch), eq(0x3a8));
        assert_that!(offset_of!(Ghcb, valid_bitmap), eq(0x3f0));
    }

    #[googletest::test]
    fn test_new_rejects_untranslatable_ghcb() {
        let mut ghcb = Ghcb::new();
        let result = GhcbProtocol::new(
            &mut ghcb,
            |_: VirtAddr| -> Option<PhysAddr> { None },
            FakeHypervisor::new(),
        );
        assert!(result.is_err());
    }

    #[googletest::test]
    fn test_new_rejects_unaligned_ghcb() {
        let mut ghcb = Ghcb::new();
        let result = GhcbProtocol::new(
            &mut ghcb,
            |_: VirtAddr| Some(PhysAddr::new(GHCB_GPA + 8)),
            FakeHypervisor::new(),
        );
        assert!(result.is_err());
    }

    #[googletest::test]
    fn test_exchange_writes_request() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new();
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();
        let entries = shared_entries(3);

        assert_eq!(protocol.page_state_change_entries(&entries), Ok(()));

        assert_that!(hypervisor.exits(), eq(1));
        assert_that!(hypervisor.last_gpa(), some(eq(GHCB_GPA)));
        assert_eq!(hypervisor.requested_entries(), entries);
        let ghcb = protocol.into_inner();
        assert_that!(ghcb.sw_exit_code, eq(SW_EXIT_CODE_PAGE_STATE_CHANGE));
        assert_that!(ghcb.sw_scratch, eq(GHCB_GPA + 0x800));
        assert_that!(ghcb.protocol_version, eq(GHCB_PROTOCOL_VERSION));
        assert!(ghcb.valid_bitmap.contains(BASE_VALID_BITMAP | ValidBitmap::SW_SCRATCH));
    }

    #[googletest::test]
    fn test_exchange_exits_until_all_entries_are_processed() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(1);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(protocol.page_state_change_entries(&shared_entries(5)), Ok(()));

        assert_that!(hypervisor.exits(), eq(5));
        assert_that!(hypervisor.processed_entries(), eq(5));
    }

    #[googletest::test]
    fn test_exchange_accepts_full_request() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(100);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();
        let entries = shared_entries(MAX_PAGE_STATE_CHANGE_ENTRIES as u64);

        assert_eq!(protocol.page_state_change_entries(&entries), Ok(()));

        assert_that!(hypervisor.exits(), eq(3));
        assert_eq!(hypervisor.requested_entries(), entries);
    }

    #[googletest::test]
    fn test_exchange_rejects_oversized_request() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new();
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();
        let entries = shared_entries(MAX_PAGE_STATE_CHANGE_ENTRIES as u64 + 1);

        assert_eq!(
            protocol.page_state_change_entries(&entries),
            Err(PageStateChangeError::TooManyEntries { count: 254 })
        );
        assert_that!(hypervisor.exits(), eq(0));
    }

    #[googletest::test]
    fn test_exchange_rejects_empty_request() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new();
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(
            protocol.page_state_change_entries(&[]),
            Err(PageStateChangeError::NoEntries)
        );
        assert_that!(hypervisor.exits(), eq(0));
    }

    #[googletest::test]
    fn test_exchange_fails_on_exit_status() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_exit_info_1(0x1_0000_0002);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(
            protocol.page_state_change_entries(&shared_entries(2)),
            Err(PageStateChangeError::VmgExitFailed { code: 0x1_0000_0002 })
        );
        assert_that!(hypervisor.exits(), eq(1));
    }

    #[googletest::test]
    fn test_exchange_ignores_upper_exit_info_1_bits() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_exit_info_1(0xdead_0000_0000);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(protocol.page_state_change_entries(&shared_entries(2)), Ok(()));
    }

    #[googletest::test]
    fn test_exchange_fails_on_page_state_change_error_code() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_exit_info_2(0x1_0000_0000);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(
            protocol.page_state_change_entries(&shared_entries(2)),
            Err(PageStateChangeError::PageStateChangeFailed { code: 0x1_0000_0000 })
        );
    }

    #[googletest::test]
    fn test_exchange_detects_moved_end_entry() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(0).with_end_entry(0);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(
            protocol.page_state_change_entries(&shared_entries(4)),
            Err(PageStateChangeError::CursorTampered { cur_entry: 0, end_entry: 0 })
        );
        assert_that!(hypervisor.exits(), eq(1));
    }

    #[googletest::test]
    fn test_exchange_detects_rewound_cursor() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(2).with_rewind_after(2);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(
            protocol.page_state_change_entries(&shared_entries(8)),
            Err(PageStateChangeError::CursorTampered { cur_entry: 0, end_entry: 7 })
        );
    }

    #[googletest::test]
    fn test_exchange_is_unbounded_by_default() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(1);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(protocol.page_state_change_entries(&shared_entries(200)), Ok(()));
        assert_that!(hypervisor.exits(), eq(200));
    }

    #[googletest::test]
    fn test_exchange_honors_exit_limit() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(0);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();
        protocol.set_exit_limit(NonZeroUsize::new(3));

        assert_eq!(
            protocol.page_state_change_entries(&shared_entries(1)),
            Err(PageStateChangeError::ExitLimitExceeded { limit: 3 })
        );
        assert_that!(hypervisor.exits(), eq(3));
    }

    #[googletest::test]
    fn test_exchange_runs_with_interrupts_disabled() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new().with_entries_per_exit(1);
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();

        assert_eq!(protocol.page_state_change_entries(&shared_entries(3)), Ok(()));

        assert_that!(hypervisor.exits_with_interrupts_enabled(), eq(0));
        assert!(!hypervisor.interrupts_disabled());
    }

    #[googletest::test]
    fn test_single_frame_page_state_change() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new();
        let mut protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();
        let frame = PhysFrame::<Size2MiB>::containing_address(PhysAddr::new(0x40_0000));

        assert_eq!(protocol.page_state_change(frame, PageAssignment::Private), Ok(()));

        let requested = hypervisor.requested_entries();
        assert_that!(requested.len(), eq(1));
        assert_that!(requested[0].address(), eq(PhysAddr::new(0x40_0000)));
        assert_that!(requested[0].page_size(), eq(PageSize::Page2MiB));
        assert_that!(requested[0].assignment(), some(eq(PageAssignment::Private)));

        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x7000));
        assert_eq!(protocol.page_state_change(frame, PageAssignment::Shared), Ok(()));
        let requested = hypervisor.requested_entries();
        assert_that!(requested[0].page_size(), eq(PageSize::Page4KiB));
    }

    #[test]
    #[should_panic(expected = "guest terminated")]
    fn test_terminate_requests_termination() {
        let mut ghcb = Ghcb::new();
        let hypervisor = FakeHypervisor::new();
        let protocol = GhcbProtocol::new(&mut ghcb, translate, &hypervisor).unwrap();
        protocol.terminate(TerminationReason::General);
    }

    #[googletest::test]
    fn test_reset_zeroes_ghcb() {
        let mut ghcb = Ghcb::new();
        ghcb.rdx = 7;
        ghcb.rcx = 8;
        ghcb.shared_buffer[100] = 1;
        ghcb.protocol_version = 2;
        ghcb.reset();
        assert_that!(ghcb.rdx, eq(0));
        assert_that!(ghcb.rcx, eq(0));
        assert_that!(ghcb.shared_buffer[100], eq(0));
        assert_that!(ghcb.protocol_version, eq(0));
    }
}
