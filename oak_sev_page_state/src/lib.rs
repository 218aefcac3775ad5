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

//! Page state changes for AMD SEV-SNP guests.
//!
//! Memory in an SEV-SNP guest is either private to the guest or shared with
//! the hypervisor. Changing the state of a page needs two things to happen: the
//! hypervisor must update the page's entry in the reverse map table (RMP), and
//! the guest must set or clear the validated bit of the page with PVALIDATE.
//! This crate does both for ranges of memory, in the order that keeps the guest
//! from ever using a page it does not own.
//!
//! See <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.

#![cfg_attr(not(test), no_std)]

use x86_64::{PhysAddr, VirtAddr};

pub mod batch;
pub mod ghcb;
pub mod instructions;
pub mod msr;
pub mod page_state;
#[cfg(test)]
mod testing;
pub mod validate;

pub use crate::{
    batch::{PageStateChangeBatch, PageStateChangeEntry, GUEST_PHYSICAL_ADDRESS_LIMIT},
    ghcb::{Ghcb, GhcbProtocol, MsrProtocolExit, VmgExit, MAX_PAGE_STATE_CHANGE_ENTRIES},
    instructions::{PageSize, Pvalidate, PvalidateInstruction, Validation},
    msr::PageAssignment,
    page_state::{
        change_page_state, PageStateChangeError, PageStateChanger, PageStateExchange,
        TerminateGuest,
    },
};

/// Translates a virtual address to a guest-physical address.
pub trait Translator: Fn(VirtAddr) -> Option<PhysAddr> {}

impl<X: Fn(VirtAddr) -> Option<PhysAddr>> Translator for X {}
