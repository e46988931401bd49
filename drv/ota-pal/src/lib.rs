// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Update controller: receives a new firmware image into the inactive
//! region, checks its signature, hands it to the boot selection hardware,
//! and afterwards either commits to it or reverts.
//!
//! The controller is a state machine over [`PalState`]. The states that
//! have to survive a reset (`PendingSelfTest`, `NewImageBooted`,
//! `SelfTestFailed` and `NewImageWdtReset`) are written to a small record
//! before the reset that needs them; everything else lives in RAM. After
//! every boot the application calls [`UpdateController::early_init`], which
//! reads the record back and finishes whatever the previous boot started.
//!
//! A normal update goes
//!
//! ```text
//! Ready -open-> FileOpen -close-> PendingActivation -activate-> (reset)
//!     -> PendingSelfTest -early_init-> NewImageBooted -accept-> Accepted
//! ```
//!
//! and the ways back out are a failed signature check, the orchestrator
//! rejecting or aborting, and the watchdog firing while the new image is
//! on trial. In each case the staged image is erased before the record that
//! points at it is removed, so losing power part way leaves a record that
//! still says what needs cleaning up.
//!
//! Nothing here knows whether the part switches banks or copy-swaps; that
//! is behind [`BootSelector`].

#![cfg_attr(not(test), no_std)]

mod record;
mod selector;
mod verify;

#[cfg(any(test, feature = "sim"))]
pub mod sim;


pub use record::{PersistedRecord, RecordStore, RECORD_LEN};
pub use selector::{
    BankControl, BootSelector, CopySwapSelector, DualBankSelector,
    SystemReset,
};
pub use verify::{
    ImageDigest, KeyringError, P256Keyring, Sha256Digest, SignatureVerifier,
    DIGEST_LEN,
};

use core::convert::Infallible;
use drv_ota_api::{
    parse_image_identifier, AppVersion, BootError, ImageState, Layout,
    OtaError, PalState, ParamError, PlatformImageState, RegionId,
    SignatureError, Span, StoreError, ERASED_WORD,
};
use drv_ota_flash::{Flash, FlashController};
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Loaded {
        state: PalState,
        target: Option<RegionId>,
    },
    CorruptRecord,
    StoreFailed(StoreError),
    State {
        from: PalState,
        to: PalState,
    },
    EarlyInit {
        state: PalState,
        active: RegionId,
    },
    StaleStagedImage(u32),
    Open {
        size: u32,
        target: RegionId,
    },
    BadImageSize(u32),
    BadImageName,
    WriteOutOfBounds {
        offset: u32,
        len: u32,
    },
    WriteMisaligned(u32),
    WriteFailed(OtaError),
    VerifyFailed(SignatureError),
    CleanupFailed(OtaError),
    SetImageState {
        current: PalState,
        desired: ImageState,
        action: Action,
    },
    Erase(RegionId),
    RefusedRunningImage(RegionId),
    SelectFailed(BootError),
    Reset {
        pending: RegionId,
    },
}

ringbuf!(Trace, 64, Trace::None);

/// What the controller knows about the update in progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateContext {
    pub state: PalState,
    /// Region the current image was, or is being, staged in.
    pub target_region: Option<RegionId>,
    /// Region the next reset is meant to boot.
    pub pending_region: Option<RegionId>,
    /// CPU address of the first byte of the incoming image.
    pub base_address: u32,
    pub image_size: u32,
    /// Version carried in the identifier passed to `open`, if any.
    pub version: Option<AppVersion>,
}

impl UpdateContext {
    const UNINIT: Self = Self {
        state: PalState::NotInitialized,
        target_region: None,
        pending_region: None,
        base_address: 0,
        image_size: 0,
        version: None,
    };
}

/// Proof of an open transfer, returned by [`UpdateController::open`].
///
/// There is exactly one per `open`, and it goes stale as soon as another
/// transfer is opened or this one is aborted.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle {
    generation: u32,
}

/// What a request to change the image state does from a given state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Action {
    /// Already there.
    Nothing,
    /// Not a legal transition.
    Refuse,
    /// Keep the running image and forget the update.
    Commit,
    /// Record the failure and reset back into the previous image.
    FailSelfTest,
    /// Erase the staged image, forget the update and move to the state.
    Discard(PalState),
}

fn transition(current: PalState, desired: ImageState) -> Action {
    use PalState::*;
    match desired {
        ImageState::Accepted => match current {
            NewImageBooted => Action::Commit,
            Accepted => Action::Nothing,
            NotInitialized | Ready | FileOpen | PendingActivation
            | PendingSelfTest | NewImageWdtReset | SelfTestFailed
            | Rejected | Invalid => Action::Refuse,
        },
        ImageState::Rejected => match current {
            PendingSelfTest | NewImageBooted => Action::FailSelfTest,
            FileOpen | PendingActivation | SelfTestFailed => {
                Action::Discard(Rejected)
            }
            NewImageWdtReset | Rejected => Action::Nothing,
            NotInitialized | Ready | Accepted | Invalid => Action::Refuse,
        },
        ImageState::Testing => match current {
            NewImageBooted => Action::Nothing,
            NotInitialized | Ready | FileOpen | PendingActivation
            | PendingSelfTest | NewImageWdtReset | SelfTestFailed
            | Accepted | Rejected | Invalid => Action::Refuse,
        },
        ImageState::Aborted => match current {
            Ready | Accepted | Rejected | SelfTestFailed => Action::Nothing,
            FileOpen | PendingActivation | PendingSelfTest
            | NewImageWdtReset => Action::Discard(Ready),
            NotInitialized | NewImageBooted | Invalid => Action::Refuse,
        },
    }
}

/// The update controller.
///
/// - `C`: flash controller for the part
/// - `B`: boot selection hardware
/// - `S`: store holding the [`PersistedRecord`]
/// - `V`: signature verifier
/// - `H`: image digest
pub struct UpdateController<C, B, S, V, H> {
    flash: Flash<C>,
    selector: B,
    store: S,
    verifier: V,
    hasher: H,
    layout: Layout,
    ctx: UpdateContext,
    generation: u32,
}

impl<C, B, S, V, H> UpdateController<C, B, S, V, H>
where
    C: FlashController,
    B: BootSelector,
    S: RecordStore,
    V: SignatureVerifier,
    H: ImageDigest,
{
    /// Builds a controller. Nothing is read until the first call that
    /// needs the persisted state.
    ///
    /// Panics if `layout` was written for a part with a different program
    /// granule than `C`.
    pub fn new(
        flash: Flash<C>,
        selector: B,
        store: S,
        verifier: V,
        hasher: H,
        layout: Layout,
    ) -> Self {
        assert_eq!(layout.program_size as usize, C::PROGRAM_SIZE);
        Self {
            flash,
            selector,
            store,
            verifier,
            hasher,
            layout,
            ctx: UpdateContext::UNINIT,
            generation: 0,
        }
    }

    pub fn into_parts(self) -> (Flash<C>, B, S, V, H) {
        (self.flash, self.selector, self.store, self.verifier, self.hasher)
    }

    pub fn context(&self) -> &UpdateContext {
        &self.ctx
    }

    pub fn state(&self) -> PalState {
        self.ctx.state
    }

    pub fn flash(&self) -> &Flash<C> {
        &self.flash
    }

    pub fn selector(&self) -> &B {
        &self.selector
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Version of the image being received, if its identifier carried one.
    pub fn incoming_version(&self) -> Option<AppVersion> {
        self.ctx.version
    }

    /// Finishes whatever the previous boot left in progress. Call once per
    /// boot, before the update orchestrator starts.
    ///
    /// May not return: if the new image crashed before it was accepted and
    /// the hardware needs another reset to get back to the old one, this
    /// performs it.
    pub fn early_init(&mut self) -> Result<(), OtaError> {
        self.ensure_initialized()?;
        let target = self.target();
        ringbuf_entry!(Trace::EarlyInit {
            state: self.ctx.state,
            active: self.selector.active_region(),
        });

        match self.ctx.state {
            PalState::PendingSelfTest => {
                if self.selector.is_running(target) {
                    self.enter(PalState::NewImageBooted);
                    self.persist()
                } else {
                    // The switch never happened.
                    self.discard(target, PalState::Rejected)
                }
            }
            PalState::NewImageBooted => {
                // Reset while on trial without being accepted.
                self.enter(PalState::NewImageWdtReset);
                self.ctx.pending_region = Some(target.other());
                self.persist()?;
                if self.selector.reset_swaps_images() {
                    // That reset already put the previous image back.
                    self.discard(target, PalState::Rejected)
                } else {
                    Err(self.select_and_reset(target.other()))
                }
            }
            PalState::NewImageWdtReset | PalState::SelfTestFailed => {
                self.discard(target, PalState::Rejected)
            }
            PalState::Ready if self.selector.reset_swaps_images() => {
                let staging = self.selector.staging_region();
                let sentinel = self
                    .layout
                    .sentinel_address(self.window(staging));
                let word = self.flash.read_word(sentinel)?;
                if word != ERASED_WORD {
                    // No update is in progress, so all this can do is get
                    // swapped back in by the next reset.
                    ringbuf_entry!(Trace::StaleStagedImage(word));
                    self.erase_region(staging)?;
                }
                Ok(())
            }
            PalState::NotInitialized
            | PalState::Ready
            | PalState::FileOpen
            | PalState::PendingActivation
            | PalState::Accepted
            | PalState::Rejected
            | PalState::Invalid => Ok(()),
        }
    }

    /// Starts receiving an image of `size` bytes named `identifier`.
    ///
    /// Erases the staging region and removes any stale record. Allowed from
    /// `Ready`, and from `Accepted` or `Rejected` once the previous update
    /// has been dealt with.
    pub fn open(
        &mut self,
        size: u32,
        identifier: &str,
    ) -> Result<Handle, OtaError> {
        self.ensure_initialized()?;
        if !self.layout.accepts_size(size) {
            ringbuf_entry!(Trace::BadImageSize(size));
            return Err(ParamError::BadImageSize.into());
        }
        let version = parse_image_identifier(identifier, self.layout.image_name)
            .map_err(|e| {
                ringbuf_entry!(Trace::BadImageName);
                OtaError::from(e)
            })?;

        match self.ctx.state {
            PalState::Ready | PalState::Accepted | PalState::Rejected => (),
            PalState::NotInitialized
            | PalState::FileOpen
            | PalState::PendingActivation
            | PalState::PendingSelfTest
            | PalState::NewImageBooted
            | PalState::NewImageWdtReset
            | PalState::SelfTestFailed
            | PalState::Invalid => return Err(OtaError::BadImageState),
        }
        if self.ctx.state != PalState::Ready {
            self.enter(PalState::Ready);
        }

        let target = self.selector.staging_region();
        ringbuf_entry!(Trace::Open { size, target });
        self.erase_region(target)?;
        self.forget()?;

        let active = self.selector.active_region();
        self.ctx = UpdateContext {
            state: PalState::Ready,
            target_region: Some(target),
            pending_region: Some(active),
            base_address: self.window(target).base,
            image_size: size,
            version,
        };
        self.enter(PalState::FileOpen);
        self.generation = self.generation.wrapping_add(1);
        Ok(Handle {
            generation: self.generation,
        })
    }

    /// Writes `bytes` at `offset` into the image. Returns the number of
    /// bytes written.
    ///
    /// A media failure rejects the transfer; the staged region is erased and
    /// the controller ends up `Rejected`.
    pub fn write_block(
        &mut self,
        handle: &Handle,
        offset: u32,
        bytes: &[u8],
    ) -> Result<usize, OtaError> {
        self.check_open(handle)?;
        let image = Span::new(self.ctx.base_address, self.ctx.image_size);
        let dest = u32::try_from(bytes.len())
            .ok()
            .and_then(|len| image.sub(offset, len));
        let Some(dest) = dest else {
            ringbuf_entry!(Trace::WriteOutOfBounds {
                offset,
                len: bytes.len() as u32,
            });
            return Err(ParamError::OutOfBounds.into());
        };
        if offset % self.layout.program_size != 0 {
            ringbuf_entry!(Trace::WriteMisaligned(offset));
            return Err(ParamError::Misaligned.into());
        }

        match self.flash.program(dest.base, bytes) {
            Ok(()) => Ok(bytes.len()),
            Err(e) => {
                let err = OtaError::from(e);
                ringbuf_entry!(Trace::WriteFailed(err));
                if let OtaError::Flash(_) = err {
                    self.reject_transfer();
                }
                Err(err)
            }
        }
    }

    /// Finishes receiving: digests the staged image and checks `signature`
    /// over it with the key stored under `key_label`.
    ///
    /// On success the image is ready to activate. On failure it has been
    /// erased and the controller is `Rejected`.
    pub fn close(
        &mut self,
        handle: &Handle,
        signature: &[u8],
        key_label: &str,
    ) -> Result<(), OtaError> {
        self.check_open(handle)?;

        let image = Span::new(self.ctx.base_address, self.ctx.image_size);
        let hasher = &mut self.hasher;
        let checked = match self.flash.read_with(image, |b| hasher.digest(b)) {
            Ok(Ok(digest)) => {
                self.verifier.verify(key_label, &digest, signature)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SignatureError::DigestFailed),
        };

        match checked {
            Ok(()) => {
                self.enter(PalState::PendingActivation);
                Ok(())
            }
            Err(e) => {
                ringbuf_entry!(Trace::VerifyFailed(e));
                self.reject_transfer();
                Err(e.into())
            }
        }
    }

    /// As [`UpdateController::close`], checking against the board's signer.
    pub fn close_with_default_key(
        &mut self,
        handle: &Handle,
        signature: &[u8],
    ) -> Result<(), OtaError> {
        let label = self.layout.signer_key_label;
        self.close(handle, signature, label)
    }

    /// Abandons the transfer. The handle is consumed.
    pub fn abort(&mut self, handle: Handle) -> Result<(), OtaError> {
        self.check_handle(&handle)?;
        self.generation = self.generation.wrapping_add(1);
        self.set_platform_image_state(ImageState::Aborted)
    }

    /// Arranges for the verified image to boot, and resets into it.
    ///
    /// Only returns on failure. If the reset itself returns the controller
    /// stays `PendingSelfTest`, with the record written, and the error is
    /// [`OtaError::ResetFailed`].
    pub fn activate(
        &mut self,
        handle: &Handle,
    ) -> Result<Infallible, OtaError> {
        self.check_handle(handle)?;
        if self.ctx.state != PalState::PendingActivation {
            return Err(OtaError::BadImageState);
        }
        let target = self.target();
        let active = self.selector.active_region();

        self.enter(PalState::PendingSelfTest);
        self.ctx.pending_region = Some(target);
        if let Err(e) = self.persist() {
            self.enter(PalState::PendingActivation);
            self.ctx.pending_region = Some(active);
            return Err(e);
        }

        let err = self.select_and_reset(target);
        if let OtaError::BootSelect(_) = err {
            // Nothing was switched, so the image can still be activated or
            // aborted.
            if let Err(e) = self.forget() {
                ringbuf_entry!(Trace::CleanupFailed(e));
            }
            self.enter(PalState::PendingActivation);
            self.ctx.pending_region = Some(active);
        }
        Err(err)
    }

    /// Requests a change of image state on behalf of the orchestrator.
    ///
    /// Rejecting an image that is on trial resets back into the previous
    /// one, so that call does not return on success.
    pub fn set_platform_image_state(
        &mut self,
        desired: ImageState,
    ) -> Result<(), OtaError> {
        self.ensure_initialized()?;
        let current = self.ctx.state;
        let action = transition(current, desired);
        ringbuf_entry!(Trace::SetImageState {
            current,
            desired,
            action,
        });

        let target = self.target();
        match action {
            Action::Nothing => Ok(()),
            Action::Refuse => Err(OtaError::BadImageState),
            Action::Commit => {
                if let Some(old) = self.selector.superseded_region(target) {
                    self.erase_region(old)?;
                }
                self.forget()?;
                self.ctx.pending_region = Some(target);
                self.enter(PalState::Accepted);
                Ok(())
            }
            Action::FailSelfTest => {
                self.fail_self_test(target).map(|never| match never {})
            }
            Action::Discard(next) => self.discard(target, next),
        }
    }

    /// What the orchestrator should think of the running image.
    pub fn get_platform_image_state(&mut self) -> PlatformImageState {
        match self.ensure_initialized() {
            Ok(()) => self.ctx.state.platform_image_state(),
            Err(_) => PlatformImageState::Unknown,
        }
    }

    /// Resets the device, leaving the boot selection where the update state
    /// says it should be.
    ///
    /// An image on trial is marked failed first, so the next boot goes back
    /// to the previous image. An image that has been staged but not
    /// activated is discarded on hardware where a reset would swap it in.
    pub fn reset_device(&mut self) -> Result<Infallible, OtaError> {
        self.ensure_initialized()?;
        let target = self.target();
        let active = self.selector.active_region();

        let pending = match self.ctx.state {
            PalState::NewImageBooted => {
                self.set_persisted(PalState::SelfTestFailed)?;
                target.other()
            }
            PalState::PendingSelfTest => {
                self.persist()?;
                target
            }
            PalState::SelfTestFailed | PalState::NewImageWdtReset => {
                target.other()
            }
            PalState::FileOpen | PalState::PendingActivation => {
                if self.selector.reset_swaps_images() {
                    self.discard(target, PalState::Ready)?;
                }
                active
            }
            PalState::NotInitialized
            | PalState::Ready
            | PalState::Accepted
            | PalState::Rejected
            | PalState::Invalid => active,
        };
        self.ctx.pending_region = Some(pending);
        Err(self.select_and_reset(pending))
    }

    fn ensure_initialized(&mut self) -> Result<(), OtaError> {
        if self.ctx.state != PalState::NotInitialized {
            return Ok(());
        }
        let record = match PersistedRecord::load(&mut self.store) {
            Ok(r) => r,
            Err(StoreError::Corrupt) => {
                ringbuf_entry!(Trace::CorruptRecord);
                None
            }
            Err(e) => {
                ringbuf_entry!(Trace::StoreFailed(e));
                return Err(e.into());
            }
        };

        let (state, target) = match record {
            Some(r) => (r.state, r.target),
            None => (PalState::Ready, None),
        };
        ringbuf_entry!(Trace::Loaded { state, target });
        self.ctx = UpdateContext {
            state,
            target_region: target,
            pending_region: Some(self.selector.active_region()),
            ..UpdateContext::UNINIT
        };
        Ok(())
    }

    fn check_handle(&self, handle: &Handle) -> Result<(), OtaError> {
        if handle.generation == self.generation {
            Ok(())
        } else {
            Err(ParamError::StaleHandle.into())
        }
    }

    fn check_open(&self, handle: &Handle) -> Result<(), OtaError> {
        self.check_handle(handle)?;
        if self.ctx.state == PalState::FileOpen {
            Ok(())
        } else {
            Err(OtaError::BadImageState)
        }
    }

    fn enter(&mut self, to: PalState) {
        ringbuf_entry!(Trace::State {
            from: self.ctx.state,
            to,
        });
        self.ctx.state = to;
    }

    fn target(&self) -> RegionId {
        self.ctx
            .target_region
            .unwrap_or_else(|| self.selector.staging_region())
    }

    fn window(&self, region: RegionId) -> Span {
        self.layout.window(region, self.selector.active_region())
    }

    fn persist(&mut self) -> Result<(), OtaError> {
        let record = PersistedRecord {
            state: self.ctx.state,
            target: self.ctx.target_region,
        };
        record.save(&mut self.store).map_err(|e| {
            ringbuf_entry!(Trace::StoreFailed(e));
            OtaError::from(e)
        })
    }

    /// Moves to `to` and records it, staying put if the record cannot be
    /// written.
    fn set_persisted(&mut self, to: PalState) -> Result<(), OtaError> {
        let from = self.ctx.state;
        self.enter(to);
        if let Err(e) = self.persist() {
            self.ctx.state = from;
            return Err(e);
        }
        Ok(())
    }

    fn forget(&mut self) -> Result<(), OtaError> {
        PersistedRecord::delete(&mut self.store).map_err(|e| {
            ringbuf_entry!(Trace::StoreFailed(e));
            OtaError::from(e)
        })
    }

    /// Erases `region`, refusing if any of it is executing.
    fn erase_region(&mut self, region: RegionId) -> Result<(), OtaError> {
        let active = self.selector.active_region();
        let running = self.layout.window(active, active);
        let span = self.window(region);
        if region == active || span.overlaps(&running) {
            ringbuf_entry!(Trace::RefusedRunningImage(region));
            return Err(ParamError::RunningImage.into());
        }
        ringbuf_entry!(Trace::Erase(region));
        Ok(self.flash.erase(span)?)
    }

    /// Erases the image staged in `target`, then forgets the update and
    /// moves to `next`. Any failure leaves the state as it was.
    fn discard(
        &mut self,
        target: RegionId,
        next: PalState,
    ) -> Result<(), OtaError> {
        let active = self.selector.active_region();
        self.erase_region(target)?;
        self.forget()?;
        self.selector
            .set_pending_region(active)
            .map_err(OtaError::from)?;
        self.ctx.pending_region = Some(active);
        self.enter(next);
        Ok(())
    }

    /// Internal rejection of a transfer that failed before activation.
    fn reject_transfer(&mut self) {
        if let Err(e) = self.set_platform_image_state(ImageState::Rejected) {
            ringbuf_entry!(Trace::CleanupFailed(e));
        }
    }

    fn fail_self_test(
        &mut self,
        target: RegionId,
    ) -> Result<Infallible, OtaError> {
        if self.ctx.state == PalState::PendingSelfTest
            && self.selector.reset_swaps_images()
        {
            // Not swapped in yet; it must not be on the next reset either.
            self.erase_region(target)?;
        }
        self.set_persisted(PalState::SelfTestFailed)?;
        self.ctx.pending_region = Some(target.other());
        Err(self.select_and_reset(target.other()))
    }

    /// Points the boot selection at `pending` and resets. Returns only if
    /// that fails.
    fn select_and_reset(&mut self, pending: RegionId) -> OtaError {
        ringbuf_entry!(Trace::Reset { pending });
        let selector = &mut self.selector;
        critical_section::with(|_| {
            if let Err(e) = selector.set_pending_region(pending) {
                ringbuf_entry!(Trace::SelectFailed(e));
                return OtaError::from(e);
            }
            selector.reset();
            OtaError::ResetFailed
        })
    }
}
