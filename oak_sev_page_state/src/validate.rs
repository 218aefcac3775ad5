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

//! Updates the validated bit in the RMP for the pages in a batch.

use x86_64::PhysAddr;

use crate::{
    batch::PageStateChangeEntry,
    instructions::{InstructionError, PageSize, Pvalidate, Validation},
    msr::PageAssignment,
    page_state::{InvalidEntrySnafu, PageStateChangeError},
};

/// Number of 4KiB pages covered by a 2MiB entry.
const PAGES_PER_LARGE_ENTRY: u64 = 512;

/// Validates (for private assignments) or invalidates (for shared
/// assignments) every page referenced by `entries`, in order.
///
/// If PVALIDATE reports a size mismatch for a 2MiB entry, the RMP backs that
/// range with 4KiB pages, so the range is retried as 512 individual 4KiB
/// pages. Any other failure stops processing and is returned; the validated
/// state of the remaining pages is then unknown.
pub fn pvalidate_entries<V: Pvalidate + ?Sized>(
    validator: &mut V,
    entries: &[PageStateChangeEntry],
) -> Result<(), PageStateChangeError> {
    for entry in entries {
        let validation = match entry.assignment() {
            Some(PageAssignment::Private) => Validation::Validated,
            Some(PageAssignment::Shared) => Validation::Unvalidated,
            None => return InvalidEntrySnafu { entry: u64::from(*entry) }.fail(),
        };
        pvalidate_entry(validator, entry.address(), entry.page_size(), validation)?;
    }
    Ok(())
}

fn pvalidate_entry<V: Pvalidate + ?Sized>(
    validator: &mut V,
    address: PhysAddr,
    page_size: PageSize,
    validation: Validation,
) -> Result<(), PageStateChangeError> {
    match validator.pvalidate(address, page_size, validation) {
        Ok(()) => Ok(()),
        Err(InstructionError::FailSizeMismatch) if page_size == PageSize::Page2MiB => {
            log::debug!("RMP page size mismatch at {:#x}, falling back to 4KiB pages", address);
            (0..PAGES_PER_LARGE_ENTRY)
                .map(|n| address + n * PageSize::Page4KiB.bytes())
                .try_for_each(|page| {
                    validator.pvalidate(page, PageSize::Page4KiB, validation).map_err(|error| {
                        PageStateChangeError::Pvalidate {
                            address: page,
                            page_size: PageSize::Page4KiB,
                            validation,
                            error,
                        }
                    })
                })
        }
        Err(error) => {
            Err(PageStateChangeError::Pvalidate { address, page_size, validation, error })
        }
    }
}
