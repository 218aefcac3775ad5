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

//! A fake hypervisor that processes Page State Change requests written to a
//! GHCB, for exercising the exchange without a VMGEXIT.

use std::cell::{Cell, RefCell};

use crate::{
    batch::PageStateChangeEntry,
    ghcb::{Ghcb, PageStateChangeHeader, VmgExit},
    msr::{GhcbGpa, TerminationReason},
};

const HEADER_SIZE: usize = core::mem::size_of::<PageStateChangeHeader>();
const ENTRY_SIZE: usize = core::mem::size_of::<PageStateChangeEntry>();

pub struct FakeHypervisor {
    entries_per_exit: u16,
    exit_info_1: u64,
    exit_info_2: u64,
    end_entry: Option<u16>,
    rewind_after: Option<usize>,

    exits: Cell<usize>,
    exits_with_interrupts_enabled: Cell<usize>,
    processed_entries: Cell<usize>,
    interrupts_disabled: Cell<bool>,
    last_gpa: Cell<Option<u64>>,
    requested_entries: RefCell<Vec<PageStateChangeEntry>>,
    pages: RefCell<Vec<PageStateChangeEntry>>,
}

impl FakeHypervisor {
    /// A hypervisor that processes every entry on the first exit.
    pub fn new() -> Self {
        Self {
            entries_per_exit: u16::MAX,
            exit_info_1: 0,
            exit_info_2: 0,
            end_entry: None,
            rewind_after: None,
            exits: Cell::new(0),
            exits_with_interrupts_enabled: Cell::new(0),
            processed_entries: Cell::new(0),
            interrupts_disabled: Cell::new(false),
            last_gpa: Cell::new(None),
            requested_entries: RefCell::new(Vec::new()),
            pages: RefCell::new(Vec::new()),
        }
    }

    pub fn with_entries_per_exit(mut self, entries_per_exit: u16) -> Self {
        self.entries_per_exit = entries_per_exit;
        self
    }

    pub fn with_exit_info_1(mut self, exit_info_1: u64) -> Self {
        self.exit_info_1 = exit_info_1;
        self
    }

    pub fn with_exit_info_2(mut self, exit_info_2: u64) -> Self {
        self.exit_info_2 = exit_info_2;
        self
    }

    /// Overwrites `end_entry` in the header on every exit.
    pub fn with_end_entry(mut self, end_entry: u16) -> Self {
        self.end_entry = Some(end_entry);
        self
    }

    /// Moves `cur_entry` back to 0 on the given exit (1-based).
    pub fn with_rewind_after(mut self, exit: usize) -> Self {
        self.rewind_after = Some(exit);
        self
    }

    pub fn exits(&self) -> usize {
        self.exits.get()
    }

    pub fn exits_with_interrupts_enabled(&self) -> usize {
        self.exits_with_interrupts_enabled.get()
    }

    pub fn processed_entries(&self) -> usize {
        self.processed_entries.get()
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.interrupts_disabled.get()
    }

    pub fn last_gpa(&self) -> Option<u64> {
        self.last_gpa.get()
    }

    /// The entries of the most recent request, as found in the shared buffer.
    pub fn requested_entries(&self) -> Vec<PageStateChangeEntry> {
        self.requested_entries.borrow().clone()
    }

    /// Every entry processed so far, in processing order.
    pub fn processed(&self) -> Vec<PageStateChangeEntry> {
        self.pages.borrow().clone()
    }
}

impl VmgExit for FakeHypervisor {
    fn vmg_exit(&self, gpa: GhcbGpa, ghcb: &mut Ghcb) {
        let exit = self.exits.get() + 1;
        self.exits.set(exit);
        self.last_gpa.set(Some(gpa.as_u64()));
        if !self.interrupts_disabled.get() {
            self.exits_with_interrupts_enabled.set(self.exits_with_interrupts_enabled.get() + 1);
        }

        let header = ghcb.page_state_change_header();
        let requested: Vec<PageStateChangeEntry> = (0..=header.end_entry as usize)
            .map(|index| {
                let offset = HEADER_SIZE + index * ENTRY_SIZE;
                let bytes = &ghcb.shared_buffer[offset..offset + ENTRY_SIZE];
                PageStateChangeEntry::from(u64::from_ne_bytes(bytes.try_into().unwrap()))
            })
            .collect();

        let cur_entry = if self.rewind_after == Some(exit) {
            0
        } else {
            let next = header
                .cur_entry
                .saturating_add(self.entries_per_exit)
                .min(header.end_entry + 1);
            let done = &requested[header.cur_entry as usize..next as usize];
            self.processed_entries.set(self.processed_entries.get() + done.len());
            self.pages.borrow_mut().extend_from_slice(done);
            next
        };
        *self.requested_entries.borrow_mut() = requested;

        ghcb.set_page_state_change_header(PageStateChangeHeader {
            cur_entry,
            end_entry: self.end_entry.unwrap_or(header.end_entry),
            _reserved: 0,
        });
        ghcb.sw_exit_info_1 = self.exit_info_1;
        ghcb.sw_exit_info_2 = self.exit_info_2;
    }

    fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let previous = self.interrupts_disabled.replace(true);
        let result = f();
        self.interrupts_disabled.set(previous);
        result
    }

    fn request_termination(&self, reason: TerminationReason) -> ! {
        panic!("guest terminated: {:?}", reason)
    }
}
