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

//! Rust instruction wrappers for managing page validation and interacting
//! with the hypervisor.

use core::arch::asm;

#[cfg(test)]
use mockall::automock;
use strum::FromRepr;
use x86_64::PhysAddr;

/// Whether a page is in the validated state or not.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum Validation {
    /// The page is not validated.
    Unvalidated = 0,
    /// The page is validated.
    Validated = 1,
}

/// The size of a memory page, as understood by PVALIDATE and the RMP.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum PageSize {
    /// The page is a 4KiB page.
    Page4KiB = 0,
    /// The page is a 2MiB page.
    Page2MiB = 1,
}

impl PageSize {
    /// The number of bytes covered by a page of this size.
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Page4KiB => 0x1000,
            PageSize::Page2MiB => 0x20_0000,
        }
    }
}

/// The potential errors when calling the PVALIDATE instruction.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u32)]
pub enum InstructionError {
    /// The input parameters were invalid.
    FailInput = 1,
    /// Insufficient permissions.
    FailPermission = 2,
    /// The page size does not match the page size entry in the RMP.
    FailSizeMismatch = 6,
    /// The instruction returned a value that is not documented.
    UnknownResult = 254,
    /// The page validation status was not updated. This value is software
    /// defined and will not be returned by the hardware instruction.
    ValidationStatusNotUpdated = 255,
}

/// Marks a page as validated or unvalidated in the RMP.
///
/// See the PVALIDATE instruction in <https://www.amd.com/system/files/TechDocs/24594.pdf> for more details.
#[inline]
pub fn pvalidate(
    page_guest_physical_address: usize,
    page_size: PageSize,
    validated: Validation,
) -> Result<(), InstructionError> {
    let page_size = page_size as u32;
    let validated = validated as u32;
    let result: u32;
    let carry: u8;
    // Safety: this call does not modify the guest memory contents, so does not
    // violate memory safety.
    unsafe {
        asm!(
            "pvalidate",
            "setc dl",
            in("rax") page_guest_physical_address,
            in("ecx") page_size,
            in("edx") validated,
            lateout("eax") result,
            lateout("dl") carry,
            options(nomem, nostack)
        );
    }
    match (result, carry) {
        (0, 0) => Ok(()),
        // If the carry flag is set, the validated state was not changed.
        (0, _) => Err(InstructionError::ValidationStatusNotUpdated),
        (code, _) => {
            Err(InstructionError::from_repr(code).unwrap_or(InstructionError::UnknownResult))
        }
    }
}

/// Access to the instruction that asserts or revokes the validated bit of a
/// page in the RMP.
///
/// Memory is assumed to be identity-mapped, so the physical address of a page
/// is also the address PVALIDATE expects.
#[cfg_attr(test, automock)]
pub trait Pvalidate {
    fn pvalidate(
        &mut self,
        address: PhysAddr,
        page_size: PageSize,
        validation: Validation,
    ) -> Result<(), InstructionError>;
}

/// Issues the real PVALIDATE instruction.
#[derive(Clone, Copy, Debug, Default)]
pub struct PvalidateInstruction;

impl Pvalidate for PvalidateInstruction {
    fn pvalidate(
        &mut self,
        address: PhysAddr,
        page_size: PageSize,
        validation: Validation,
    ) -> Result<(), InstructionError> {
        pvalidate(address.as_u64() as usize, page_size, validation)
    }
}

/// Unconditionally exits from the guest to the hypervisor.
///
/// See the VMGEXIT instruction in <https://www.amd.com/system/files/TechDocs/24594.pdf> for more details.
pub fn vmgexit() {
    // Safety: this call does not modify the guest memory contents, so does not
    // violate memory safety.
    unsafe {
        // The REP instruction modifier changes the VMMCALL instruction to be equivalent
        // to the VMGEXIT call. This is used as the assembler does not recognise
        // the VMGEXIT mnemonic.
        asm!("rep vmmcall", options(nomem, nostack, preserves_flags));
    }
}
