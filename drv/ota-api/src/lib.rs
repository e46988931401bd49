// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary for the firmware update drivers.
//!
//! The flash primitive, the bootloader swap engine and the update controller
//! all speak in terms of the types here: the two image regions, the board's
//! flash layout, the controller's lifecycle state and the error codes that
//! get handed back to the update orchestrator.

#![cfg_attr(not(test), no_std)]

mod error;
mod ident;
mod layout;

pub use error::*;
pub use ident::*;
pub use layout::*;

use num_derive::FromPrimitive;

/// Path of the persisted controller record in the device filesystem.
pub const IMAGE_STATE_PATH: &str = "/ota/image_state";

/// Value of a 32-bit word of erased NOR flash.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Value of a byte of erased NOR flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Lifecycle state of the update controller.
///
/// The ordering is meaningful: variants are declared in the order an update
/// moves through them, and the discriminants are what gets persisted.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive,
)]
#[repr(u32)]
pub enum PalState {
    NotInitialized = 0,
    Ready,
    FileOpen,
    PendingActivation,
    PendingSelfTest,
    NewImageBooted,
    NewImageWdtReset,
    SelfTestFailed,
    Accepted,
    Rejected,
    Invalid,
}

impl PalState {
    pub const ALL: [PalState; 11] = [
        PalState::NotInitialized,
        PalState::Ready,
        PalState::FileOpen,
        PalState::PendingActivation,
        PalState::PendingSelfTest,
        PalState::NewImageBooted,
        PalState::NewImageWdtReset,
        PalState::SelfTestFailed,
        PalState::Accepted,
        PalState::Rejected,
        PalState::Invalid,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            PalState::NotInitialized => "NotInitialized",
            PalState::Ready => "Ready",
            PalState::FileOpen => "FileOpen",
            PalState::PendingActivation => "PendingActivation",
            PalState::PendingSelfTest => "PendingSelfTest",
            PalState::NewImageBooted => "NewImageBooted",
            PalState::NewImageWdtReset => "NewImageWdtReset",
            PalState::SelfTestFailed => "SelfTestFailed",
            PalState::Accepted => "Accepted",
            PalState::Rejected => "Rejected",
            PalState::Invalid => "Invalid",
        }
    }

    /// Projection reported to the orchestrator.
    pub const fn platform_image_state(self) -> PlatformImageState {
        match self {
            PalState::Ready
            | PalState::FileOpen
            | PalState::Rejected
            | PalState::NewImageWdtReset
            | PalState::SelfTestFailed => PlatformImageState::Invalid,
            PalState::PendingActivation
            | PalState::PendingSelfTest
            | PalState::NewImageBooted => PlatformImageState::PendingCommit,
            PalState::Accepted => PlatformImageState::Valid,
            PalState::NotInitialized | PalState::Invalid => {
                PlatformImageState::Unknown
            }
        }
    }
}

/// What the orchestrator is told about the image it is running.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum PlatformImageState {
    Unknown = 0,
    Invalid,
    PendingCommit,
    Valid,
}

/// What the orchestrator may ask the image state to become.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum ImageState {
    Testing = 1,
    Accepted,
    Rejected,
    Aborted,
}

impl ImageState {
    pub const ALL: [ImageState; 4] = [
        ImageState::Testing,
        ImageState::Accepted,
        ImageState::Rejected,
        ImageState::Aborted,
    ];
}

/// One of the two image regions. The discriminants match the hardware bank
/// numbers and are what gets persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum RegionId {
    Bank1 = 1,
    Bank2 = 2,
}

impl RegionId {
    /// On copy-swap hardware, where images execute from.
    pub const EXECUTION: RegionId = RegionId::Bank1;
    /// On copy-swap hardware, where incoming images are staged.
    pub const STAGING: RegionId = RegionId::Bank2;

    pub const fn other(self) -> Self {
        match self {
            RegionId::Bank1 => RegionId::Bank2,
            RegionId::Bank2 => RegionId::Bank1,
        }
    }

    pub const fn index(self) -> usize {
        match self {
            RegionId::Bank1 => 0,
            RegionId::Bank2 => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn states_are_ordered_by_lifecycle() {
        for pair in PalState::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
        for (i, s) in PalState::ALL.iter().enumerate() {
            assert_eq!(PalState::from_u32(i as u32), Some(*s));
        }
        assert_eq!(PalState::from_u32(11), None);
    }

    #[test]
    fn state_names_match_variants() {
        for s in PalState::ALL {
            assert_eq!(s.name(), format!("{s:?}"));
        }
    }

    #[test]
    fn platform_projection() {
        use PlatformImageState::*;
        let expected = [
            (PalState::NotInitialized, Unknown),
            (PalState::Ready, Invalid),
            (PalState::FileOpen, Invalid),
            (PalState::PendingActivation, PendingCommit),
            (PalState::PendingSelfTest, PendingCommit),
            (PalState::NewImageBooted, PendingCommit),
            (PalState::NewImageWdtReset, Invalid),
            (PalState::SelfTestFailed, Invalid),
            (PalState::Accepted, Valid),
            (PalState::Rejected, Invalid),
            (PalState::Invalid, Unknown),
        ];
        for (state, platform) in expected {
            assert_eq!(state.platform_image_state(), platform, "{state:?}");
        }
    }

    #[test]
    fn region_other_is_an_involution() {
        for r in [RegionId::Bank1, RegionId::Bank2] {
            assert_ne!(r.other(), r);
            assert_eq!(r.other().other(), r);
        }
        assert_eq!(RegionId::from_u32(2), Some(RegionId::Bank2));
        assert_eq!(RegionId::from_u32(0), None);
    }
}
