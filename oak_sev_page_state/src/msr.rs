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

//! The subset of the AMD SEV-SNP GHCB MSR protocol needed for page state
//! changes.
//!
//! The protocol is implemented by writing to, and reading from, model-specific
//! register (MSR) 0xC001_0130. The guest makes a request by writing an
//! appropriate value to the MSR and calling VMGEXIT. After the hypervisor
//! processes the request and resumes the guest, the guest can read the response
//! from the same MSR.
//!
//! The 12 least significant bits represent information about the operation
//! being performed. The remaining 52 bits represent the data for the operation.
//!
//! Besides carrying the GHCB address for full GHCB exits, the MSR protocol is
//! the channel of last resort: it needs no shared memory, so it is used to ask
//! the hypervisor to terminate the guest.
//!
//! See section 2.3.1 in <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf> for more detail.

use strum::FromRepr;
use x86_64::{registers::model_specific::Msr, PhysAddr};

use crate::instructions::vmgexit;

/// The identifier for the MSR used in the MSR protocol.
const PROTOCOL_MSR_IDENTIFIER: u32 = 0xC001_0130;

/// Mask to extract the GHCB info from a u64 value.
const GHCB_INFO_MASK: u64 = 0xFFF;

/// Contains the guest-physical address of the GHCB page. The address must have
/// been registered with the hypervisor before using it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GhcbGpa {
    gpa: u64,
}

impl GhcbGpa {
    pub fn new(gpa: PhysAddr) -> Result<Self, &'static str> {
        let gpa = gpa.as_u64();
        if gpa & GHCB_INFO_MASK != 0 {
            return Err("GHCB must be 4KiB-aligned");
        }
        Ok(Self { gpa })
    }

    pub fn as_u64(&self) -> u64 {
        self.gpa
    }
}

impl From<GhcbGpa> for u64 {
    fn from(ghcb_gpa: GhcbGpa) -> Self {
        ghcb_gpa.gpa
    }
}

/// Sets the address of the GHCB page before exiting to the hypervisor.
pub fn set_ghcb_address_and_exit(ghcb_gpa: GhcbGpa) {
    write_protocol_msr_and_exit(ghcb_gpa.into());
}

/// Whether a memory page is private to the guest, or shared with the
/// hypervisor.
///
/// The discriminants are the operation codes used by both the MSR protocol and
/// the Page State Change entries in the GHCB.
#[derive(Debug, FromRepr, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageAssignment {
    Private = 1,
    Shared = 2,
}

/// Request to change a single 4KiB page from shared to private or private to
/// shared.
#[derive(Debug)]
pub struct SnpPageStateChangeRequest {
    page_gpa: u64,
    assignment: PageAssignment,
}

impl SnpPageStateChangeRequest {
    pub fn new(page_gpa: PhysAddr, assignment: PageAssignment) -> Result<Self, &'static str> {
        let page_gpa = page_gpa.as_u64();
        if page_gpa & GHCB_INFO_MASK != 0 {
            return Err("page must be 4KiB-aligned");
        }
        Ok(Self { page_gpa, assignment })
    }
}

impl From<SnpPageStateChangeRequest> for u64 {
    fn from(request: SnpPageStateChangeRequest) -> Self {
        let info = 0x014;
        let assignment = (request.assignment as u64) << 52;
        info | request.page_gpa | assignment
    }
}

/// The response containing the result of the SNP Page State Change operation.
pub struct SnpPageStateChangeResponse {
    /// The error code from the page state change operation.
    ///
    /// A value of 0 indicates success. Any non-zero value means that the state
    /// was not changed.
    error_code: u32,
}

impl TryFrom<u64> for SnpPageStateChangeResponse {
    type Error = &'static str;
    fn try_from(msr_value: u64) -> Result<Self, &'static str> {
        const SNP_PAGE_STATE_CHANGE_RESPONSE_INFO: u64 = 0x015;
        const RESERVED_MASK: u64 = 0xFFFFF000;
        if msr_value & GHCB_INFO_MASK != SNP_PAGE_STATE_CHANGE_RESPONSE_INFO
            || msr_value & RESERVED_MASK != 0
        {
            return Err("value is not a valid SNP Page State Change response");
        }
        let error_code = (msr_value >> 32) as u32;
        Ok(Self { error_code })
    }
}

/// Requests a change of state for a single page through the MSR protocol.
///
/// This only updates the RMP; validation is left to the caller. It is useful
/// if the GHCB has not yet been established, for example if a page must be
/// shared with the hypervisor to establish the GHCB.
pub fn change_snp_page_state(request: SnpPageStateChangeRequest) -> Result<(), &'static str> {
    write_protocol_msr_and_exit(request.into());
    let response: SnpPageStateChangeResponse = read_protocol_msr().try_into()?;
    if response.error_code != 0 {
        return Err("page state change failed");
    }
    Ok(())
}

/// The reason for requesting termination from the hypervisor.
///
/// All reasons belong to the default (GHCB) reason code set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminationReason {
    /// Non-specific termination request.
    General = 0,
}

/// Request for the hypervisor to terminate the guest.
pub struct TerminationRequest {
    pub reason: TerminationReason,
}

impl From<TerminationRequest> for u64 {
    fn from(request: TerminationRequest) -> Self {
        let info = 0x100;
        // We use the default reason set (0x0), so don't set any value for bits 12-15.
        let reason = (request.reason as u64) << 16;
        info | reason
    }
}

/// Requests termination from the hypervisor.
pub fn request_termination(request: TerminationRequest) -> ! {
    write_protocol_msr_and_exit(request.into());
    // Go into a HALT loop, in case the hypervisor did not honor the termination
    // request.
    loop {
        x86_64::instructions::hlt();
    }
}

/// Writes a value to the protocol MSR and calls VMGEXIT to hand control to the
/// hypervisor.
fn write_protocol_msr_and_exit(msr_value: u64) {
    // Safety: This operation is safe because this specific MSR is used only for
    // communicating with the hypervisor, and does not have any other
    // side-effects within the guest.
    unsafe {
        Msr::new(PROTOCOL_MSR_IDENTIFIER).write(msr_value);
    }
    vmgexit();
}

/// Reads the value of the protocol model-specific register.
///
/// This typically used to get the result of an operation when the hypervisor
/// resumes the guest following a call to VMGEXIT.
fn read_protocol_msr() -> u64 {
    // Safety: This operation is safe because this specific MSR is used only for
    // communicating with the hypervisor, and does not have any other
    // side-effects within the guest.
    unsafe { Msr::new(PROTOCOL_MSR_IDENTIFIER).read() }
}
