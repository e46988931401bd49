// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use derive_status_code::StatusCode;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

/// Failures of the flash programming primitive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, StatusCode)]
#[repr(u32)]
pub enum FlashError {
    /// Destination is not aligned to the program granule.
    Misaligned = 1,
    /// Address range falls outside the flash the controller drives.
    OutOfBounds,
    /// The controller refused to unlock.
    Locked,
    ProgramFailed,
    EraseFailed,
    /// Read-back after programming differed from what was written.
    VerifyMismatch,
}

/// Caller errors. These are never retried.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, StatusCode)]
#[repr(u32)]
pub enum ParamError {
    BadImageSize = 1,
    BadImageName,
    Misaligned,
    OutOfBounds,
    /// The handle does not belong to the transfer in progress.
    StaleHandle,
    /// Refused to erase the region the processor executes from.
    RunningImage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, StatusCode)]
#[repr(u32)]
pub enum SignatureError {
    DigestFailed = 1,
    KeyNotFound,
    BadSignature,
    /// Signature bytes are neither raw `r || s` nor DER.
    Malformed,
}

/// Failures of the persistent record store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, StatusCode)]
#[repr(u32)]
pub enum StoreError {
    NotMounted = 1,
    Io,
    /// The stored record failed its integrity checks.
    Corrupt,
}

/// Failures of the boot selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, StatusCode)]
#[repr(u32)]
pub enum BootError {
    /// Programming the boot option bytes failed.
    OptionBytes = 1,
}

/// Error returned by every update controller entry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OtaError {
    Parameter(ParamError),
    Flash(FlashError),
    Signature(SignatureError),
    Persistence(StoreError),
    BootSelect(BootError),
    /// The requested transition is illegal from the current state.
    BadImageState,
    /// The platform reset returned control to the caller.
    ResetFailed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, StatusCode)]
#[repr(u32)]
enum MainCode {
    Parameter = 1,
    Flash,
    Signature,
    Persistence,
    BootSelect,
    BadImageState,
    ResetFailed,
}

const SUB_BITS: u32 = 24;
const SUB_MASK: u32 = (1 << SUB_BITS) - 1;

impl OtaError {
    /// Packs the error into a single status word: the category in the top
    /// byte and the detail in the low 24 bits. Zero is never produced, so it
    /// stays free to mean success on the orchestrator side.
    pub fn code(self) -> u32 {
        let (main, sub): (MainCode, u32) = match self {
            OtaError::Parameter(e) => (MainCode::Parameter, e.into()),
            OtaError::Flash(e) => (MainCode::Flash, e.into()),
            OtaError::Signature(e) => (MainCode::Signature, e.into()),
            OtaError::Persistence(e) => (MainCode::Persistence, e.into()),
            OtaError::BootSelect(e) => (MainCode::BootSelect, e.into()),
            OtaError::BadImageState => (MainCode::BadImageState, 0),
            OtaError::ResetFailed => (MainCode::ResetFailed, 0),
        };
        (u32::from(main) << SUB_BITS) | (sub & SUB_MASK)
    }

    /// Reverses [`OtaError::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        let main = MainCode::from_u32(code >> SUB_BITS)?;
        let sub = code & SUB_MASK;
        Some(match main {
            MainCode::Parameter => OtaError::Parameter(sub.try_into().ok()?),
            MainCode::Flash => OtaError::Flash(sub.try_into().ok()?),
            MainCode::Signature => OtaError::Signature(sub.try_into().ok()?),
            MainCode::Persistence => {
                OtaError::Persistence(sub.try_into().ok()?)
            }
            MainCode::BootSelect => OtaError::BootSelect(sub.try_into().ok()?),
            MainCode::BadImageState if sub == 0 => OtaError::BadImageState,
            MainCode::ResetFailed if sub == 0 => OtaError::ResetFailed,
            MainCode::BadImageState | MainCode::ResetFailed => return None,
        })
    }
}

impl From<FlashError> for OtaError {
    /// Alignment and range failures are the caller's fault and are reported
    /// as parameter errors; everything else is a media failure.
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::Misaligned => OtaError::Parameter(ParamError::Misaligned),
            FlashError::OutOfBounds => {
                OtaError::Parameter(ParamError::OutOfBounds)
            }
            _ => OtaError::Flash(e),
        }
    }
}

impl From<ParamError> for OtaError {
    fn from(e: ParamError) -> Self {
        OtaError::Parameter(e)
    }
}

impl From<SignatureError> for OtaError {
    fn from(e: SignatureError) -> Self {
        OtaError::Signature(e)
    }
}

impl From<StoreError> for OtaError {
    fn from(e: StoreError) -> Self {
        OtaError::Persistence(e)
    }
}

impl From<BootError> for OtaError {
    fn from(e: BootError) -> Self {
        OtaError::BootSelect(e)
    }
}

impl From<OtaError> for u32 {
    fn from(e: OtaError) -> Self {
        e.code()
    }
}
