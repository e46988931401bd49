// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot selection: which region the processor runs from now, and which one
//! it will run from after the next reset.
//!
//! There are two kinds of hardware. Dual-bank parts flip an option byte to
//! choose the boot bank and never move image bytes ([`DualBankSelector`]).
//! Single-bank parts run a bootloader that swaps any staged image into the
//! execution region on every reset ([`CopySwapSelector`]). The controller is
//! written against [`BootSelector`] and does not know which one it has.

use drv_ota_api::{BootError, RegionId};
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    BootBank(RegionId),
    SelectBank(RegionId),
    SelectFailed(BootError),
    LaunchOptionBytes,
    SystemReset,
}

ringbuf!(Trace, 8, Trace::None);

pub trait BootSelector {
    /// Region the running image was booted from.
    fn active_region(&self) -> RegionId;

    /// Region incoming images are written to.
    fn staging_region(&self) -> RegionId {
        self.active_region().other()
    }

    /// Whether the image that was staged in `target` is the one running.
    fn is_running(&self, target: RegionId) -> bool {
        self.active_region() == target
    }

    /// Arranges for the next reset to boot `region`.
    fn set_pending_region(&mut self, region: RegionId)
        -> Result<(), BootError>;

    /// Once the image staged in `target` has been accepted, the region
    /// holding the image it replaced, if that must be erased.
    fn superseded_region(&self, _target: RegionId) -> Option<RegionId> {
        None
    }

    /// True when every reset with a staged image present exchanges the
    /// images. On such hardware a reset is itself the revert, and a staged
    /// image that must not run has to be erased before resetting.
    fn reset_swaps_images(&self) -> bool {
        false
    }

    /// Resets the device, applying any pending selection. Does not return on
    /// hardware; if it does, the reset did not happen.
    fn reset(&mut self);
}

/// A plain system reset.
pub trait SystemReset {
    fn system_reset(&mut self);
}

/// Option byte access for a dual-bank flash controller.
pub trait BankControl: SystemReset {
    /// Whether `SWAP_BANK` is set in the option bytes currently in effect.
    fn swap_bank(&self) -> bool;

    /// Whether `SWAP_BANK` is set in the programmed option bytes, which the
    /// next option byte launch or power on loads. Can differ from
    /// [`BankControl::swap_bank`] until then.
    fn programmed_swap_bank(&self) -> bool;

    /// Programs `SWAP_BANK`. Takes effect at the next option byte launch.
    fn program_swap_bank(&mut self, swap: bool) -> Result<(), BootError>;

    /// Reloads the option bytes. On hardware this resets the device.
    fn launch_option_bytes(&mut self);
}

/// Boot selection by `SWAP_BANK` option byte.
///
/// The pending bank is read from the programmed option bytes on every use.
/// A reset between programming and launching can leave a selection behind
/// that this boot did not make.
pub struct DualBankSelector<K> {
    ctrl: K,
    /// Bank in effect at power on. Read once: programming the option bytes
    /// changes what the register reports before the reset that applies it.
    boot_bank: RegionId,
}

fn bank(swap: bool) -> RegionId {
    if swap {
        RegionId::Bank2
    } else {
        RegionId::Bank1
    }
}

impl<K: BankControl> DualBankSelector<K> {
    pub fn new(ctrl: K) -> Self {
        let boot_bank = bank(ctrl.swap_bank());
        ringbuf_entry!(Trace::BootBank(boot_bank));
        Self { ctrl, boot_bank }
    }

    /// Bank the next option byte launch or power on selects.
    pub fn pending_region(&self) -> RegionId {
        bank(self.ctrl.programmed_swap_bank())
    }

    pub fn get_ref(&self) -> &K {
        &self.ctrl
    }

    pub fn into_inner(self) -> K {
        self.ctrl
    }
}

impl<K: BankControl> BootSelector for DualBankSelector<K> {
    fn active_region(&self) -> RegionId {
        self.boot_bank
    }

    fn set_pending_region(
        &mut self,
        region: RegionId,
    ) -> Result<(), BootError> {
        if region == self.pending_region() {
            return Ok(());
        }
        ringbuf_entry!(Trace::SelectBank(region));
        if let Err(e) = self.ctrl.program_swap_bank(region == RegionId::Bank2)
        {
            ringbuf_entry!(Trace::SelectFailed(e));
            return Err(e);
        }
        Ok(())
    }

    fn reset(&mut self) {
        if self.pending_region() != self.boot_bank {
            ringbuf_entry!(Trace::LaunchOptionBytes);
            self.ctrl.launch_option_bytes();
        }
        ringbuf_entry!(Trace::SystemReset);
        self.ctrl.system_reset();
    }
}

/// Boot selection on parts whose bootloader copy-swaps staged images.
///
/// The image always runs from [`RegionId::EXECUTION`] and is staged in
/// [`RegionId::STAGING`]. There is nothing to program: whether the next
/// reset swaps is decided by whether the staging region holds an image.
pub struct CopySwapSelector<R> {
    reset: R,
}

impl<R: SystemReset> CopySwapSelector<R> {
    pub fn new(reset: R) -> Self {
        Self { reset }
    }

    pub fn get_ref(&self) -> &R {
        &self.reset
    }

    pub fn into_inner(self) -> R {
        self.reset
    }
}

impl<R: SystemReset> BootSelector for CopySwapSelector<R> {
    fn active_region(&self) -> RegionId {
        RegionId::EXECUTION
    }

    fn staging_region(&self) -> RegionId {
        RegionId::STAGING
    }

    /// The bootloader swaps whenever something is staged, so an image that
    /// was activated is running.
    fn is_running(&self, _target: RegionId) -> bool {
        true
    }

    fn set_pending_region(
        &mut self,
        _region: RegionId,
    ) -> Result<(), BootError> {
        Ok(())
    }

    /// After the swap the previous image sits in the staging region.
    fn superseded_region(&self, target: RegionId) -> Option<RegionId> {
        Some(target)
    }

    fn reset_swaps_images(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        ringbuf_entry!(Trace::SystemReset);
        self.reset.system_reset();
    }
}
