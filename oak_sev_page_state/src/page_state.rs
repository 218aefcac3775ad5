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

//! Moves ranges of guest-physical memory between the private and shared
//! states.
//!
//! A range is split into batches of entries. Each batch is handed to the
//! hypervisor to update the RMP, and each page in it is validated or
//! invalidated with PVALIDATE. Pages that become shared are invalidated before
//! the hypervisor sees them, and pages that become private are validated only
//! after the hypervisor has assigned them to the guest.
//!
//! Any failure leaves the security state of the range unknown, so the only
//! safe way to handle it is to terminate the guest.

#[cfg(test)]
use mockall::automock;
use snafu::prelude::*;
use x86_64::{
    structures::paging::{PageSize as _, PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::{
    batch::{PageStateChangeBatch, PageStateChangeEntry, GUEST_PHYSICAL_ADDRESS_LIMIT},
    ghcb::{Ghcb, GhcbProtocol, VmgExit, MAX_PAGE_STATE_CHANGE_ENTRIES},
    instructions::{InstructionError, PageSize, Pvalidate, PvalidateInstruction, Validation},
    msr::{PageAssignment, TerminationReason},
    validate::pvalidate_entries,
};

/// Errors that leave the guest in a state it cannot safely continue from.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PageStateChangeError {
    /// PVALIDATE of {address:?} ({page_size:?}, {validation:?}) failed: {error:?}
    Pvalidate {
        address: PhysAddr,
        page_size: PageSize,
        validation: Validation,
        error: InstructionError,
    },
    /// Entry {entry:#x} does not contain a valid page operation
    InvalidEntry { entry: u64 },
    /// Page State Change request has no entries
    NoEntries,
    /// Page State Change request has {count} entries, more than a single
    /// request can hold
    TooManyEntries { count: usize },
    /// VMGEXIT returned error code {code:#x}
    VmgExitFailed { code: u64 },
    /// Hypervisor rejected the Page State Change request with code {code:#x}
    PageStateChangeFailed { code: u64 },
    /// Hypervisor moved the request cursor to {cur_entry} with end entry
    /// {end_entry}
    CursorTampered { cur_entry: u16, end_entry: u16 },
    /// Page State Change request did not complete within {limit} exits
    ExitLimitExceeded { limit: usize },
    /// {page_count} pages starting at {start:?} do not fit in guest-physical
    /// memory
    InvalidRange { start: PhysAddr, page_count: u64 },
    /// Page State Change entry buffer is empty
    EmptyBuffer,
}

/// Hands batches of entries to the hypervisor so that it updates the RMP.
#[cfg_attr(test, automock)]
pub trait PageStateExchange {
    /// Returns once the hypervisor has processed every entry.
    fn exchange(&mut self, entries: &[PageStateChangeEntry]) -> Result<(), PageStateChangeError>;
}

impl<T: PageStateExchange + ?Sized> PageStateExchange for &mut T {
    fn exchange(&mut self, entries: &[PageStateChangeEntry]) -> Result<(), PageStateChangeError> {
        (**self).exchange(entries)
    }
}

/// Stops the guest when it cannot safely continue.
pub trait TerminateGuest {
    fn terminate(&self, reason: TerminationReason) -> !;
}

impl<T: TerminateGuest + ?Sized> TerminateGuest for &mut T {
    fn terminate(&self, reason: TerminationReason) -> ! {
        (**self).terminate(reason)
    }
}

/// Changes the state of ranges of memory using an exchange with the
/// hypervisor and a validator for the local half of the change.
pub struct PageStateChanger<X, V> {
    exchange: X,
    validator: V,
}

impl<X: PageStateExchange, V: Pvalidate> PageStateChanger<X, V> {
    pub fn new(exchange: X, validator: V) -> Self {
        Self { exchange, validator }
    }

    pub fn into_inner(self) -> (X, V) {
        (self.exchange, self.validator)
    }

    /// Changes `page_count` 4KiB pages starting at `start` to `assignment`.
    ///
    /// `buffer` is scratch space for the entries of one batch; its length
    /// bounds the size of a batch. With `use_large_entry`, 2MiB-aligned parts
    /// of the range are described with 2MiB entries.
    ///
    /// An error means the range may be partially changed, and the guest must
    /// not continue.
    pub fn try_change_page_state(
        &mut self,
        start: PhysFrame<Size4KiB>,
        page_count: u64,
        assignment: PageAssignment,
        use_large_entry: bool,
        buffer: &mut [PageStateChangeEntry],
    ) -> Result<(), PageStateChangeError> {
        let start = start.start_address();
        ensure!(!buffer.is_empty(), EmptyBufferSnafu);
        let end = page_count
            .checked_mul(Size4KiB::SIZE)
            .and_then(|size| start.as_u64().checked_add(size))
            .filter(|end| *end <= GUEST_PHYSICAL_ADDRESS_LIMIT)
            .context(InvalidRangeSnafu { start, page_count })?;

        log::debug!(
            "changing {} pages at {:#x} to {:?} (large entries: {})",
            page_count,
            start,
            assignment,
            use_large_entry
        );

        let mut batch = PageStateChangeBatch::new(buffer);
        let mut address = start.as_u64();
        while address < end {
            address = batch.fill(address, end, assignment, use_large_entry);
            self.change_batch(batch.entries(), assignment)?;
        }
        Ok(())
    }

    fn change_batch(
        &mut self,
        entries: &[PageStateChangeEntry],
        assignment: PageAssignment,
    ) -> Result<(), PageStateChangeError> {
        // The guest must stop using pages before the hypervisor can see them, and
        // can only validate pages the hypervisor has assigned to it.
        if assignment == PageAssignment::Shared {
            pvalidate_entries(&mut self.validator, entries)?;
        }
        for chunk in entries.chunks(MAX_PAGE_STATE_CHANGE_ENTRIES) {
            self.exchange.exchange(chunk)?;
        }
        if assignment == PageAssignment::Private {
            pvalidate_entries(&mut self.validator, entries)?;
        }
        Ok(())
    }
}

impl<X: PageStateExchange + TerminateGuest, V: Pvalidate> PageStateChanger<X, V> {
    /// Like [`PageStateChanger::try_change_page_state`], but terminates the
    /// guest instead of returning an error.
    pub fn change_page_state(
        &mut self,
        start: PhysFrame<Size4KiB>,
        page_count: u64,
        assignment: PageAssignment,
        use_large_entry: bool,
        buffer: &mut [PageStateChangeEntry],
    ) {
        if let Err(err) =
            self.try_change_page_state(start, page_count, assignment, use_large_entry, buffer)
        {
            log::error!("page state change failed: {}", err);
            self.exchange.terminate(TerminationReason::General);
        }
    }
}

/// Changes the state of a range of memory using the GHCB and the PVALIDATE
/// instruction, terminating the guest on failure.
pub fn change_page_state<G, E>(
    ghcb: &mut GhcbProtocol<'_, G, E>,
    start: PhysFrame<Size4KiB>,
    page_count: u64,
    assignment: PageAssignment,
    use_large_entry: bool,
    buffer: &mut [PageStateChangeEntry],
) where
    G: AsMut<Ghcb> + AsRef<Ghcb> + ?Sized,
    E: VmgExit,
{
    PageStateChanger::new(ghcb, PvalidateInstruction).change_page_state(
        start,
        page_count,
        assignment,
        use_large_entry,
        buffer,
    );
}
