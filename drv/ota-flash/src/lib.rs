// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash programming primitive shared by the bootloader and the update
//! controller.
//!
//! The hardware specific part is the [`FlashController`] trait: unlock and
//! lock the controller, program one program granule, erase one sector, and
//! expose the memory-mapped contents. [`Flash`] builds the update operations
//! on top of that:
//!
//! - [`Flash::program`] writes an arbitrary byte string at a granule-aligned
//!   address. The tail is padded with `0xFF` to a whole granule, and every
//!   granule is read back and compared before the next one is written.
//! - [`Flash::erase`] erases a sector-aligned span, sector by sector.
//! - [`Flash::read_with`] lends out the raw contents of a span, so digests
//!   can be computed in place.
//!
//! # Exclusive access
//!
//! Each program or erase call takes the controller's lock for the whole
//! call (and only that call), and inside it brackets the operation with
//! [`FlashController::prepare`]/[`FlashController::unlock`] on the way in
//! and [`FlashController::lock`]/[`FlashController::restore`] on the way
//! out. The bracketing is done by a guard, so the controller is relocked on
//! every exit path, including errors.

#![cfg_attr(not(test), no_std)]

use drv_ota_api::{FlashError, Span, ERASED_BYTE};
use ringbuf::*;
use spin::{Mutex, MutexGuard};

#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Largest program granule any supported part uses (STM32H7 flash word).
pub const MAX_PROGRAM_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    ProgramStart { addr: u32, len: u32 },
    ProgramEnd,
    Misaligned(u32),
    OutOfBounds { addr: u32, len: u32 },
    UnlockFailed(FlashError),
    ProgramFailed { addr: u32, err: FlashError },
    VerifyMismatch(u32),
    EraseStart { base: u32, size: u32 },
    EraseFailed { addr: u32, err: FlashError },
    EraseEnd,
}

ringbuf!(Trace, 32, Trace::None);

/// Hardware access for one flash controller.
///
/// Implementations do no validation beyond what the hardware reports; the
/// alignment, bounds and verify logic lives in [`Flash`].
pub trait FlashController {
    /// Program granule in bytes. Must be nonzero and at most
    /// [`MAX_PROGRAM_SIZE`].
    const PROGRAM_SIZE: usize;

    /// Erase granule in bytes.
    const SECTOR_SIZE: u32;

    /// Address range this controller can program.
    fn bounds(&self) -> Span;

    /// Called before unlocking. Parts that cannot program with the
    /// instruction cache enabled, or that need extra wait states while
    /// programming, switch those here.
    fn prepare(&mut self) {}

    /// Undoes [`FlashController::prepare`].
    fn restore(&mut self) {}

    fn unlock(&mut self) -> Result<(), FlashError>;

    fn lock(&mut self);

    /// Programs one granule. `addr` is granule aligned and `data` is exactly
    /// [`FlashController::PROGRAM_SIZE`] bytes.
    fn program_granule(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), FlashError>;

    /// Erases the sector starting at `addr`.
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;

    /// The current contents of `len` bytes at `addr`, read through the
    /// memory map rather than copied.
    fn view(&self, addr: u32, len: usize) -> Result<&[u8], FlashError>;
}

/// Serialized access to one flash controller.
pub struct Flash<C> {
    controller: Mutex<C>,
}

/// An unlocked controller. Relocks on drop.
struct Session<'a, C: FlashController> {
    ctrl: MutexGuard<'a, C>,
}

impl<C: FlashController> Drop for Session<'_, C> {
    fn drop(&mut self) {
        FlashController::lock(&mut *self.ctrl);
        self.ctrl.restore();
    }
}

impl<C: FlashController> Flash<C> {
    const GRANULE_OK: () = assert!(
        C::PROGRAM_SIZE > 0 && C::PROGRAM_SIZE <= MAX_PROGRAM_SIZE
    );

    pub const fn new(controller: C) -> Self {
        Self {
            controller: Mutex::new(controller),
        }
    }

    pub fn into_inner(self) -> C {
        self.controller.into_inner()
    }

    /// Runs `f` with exclusive access to the controller.
    pub fn with_controller<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.controller.lock())
    }

    pub fn bounds(&self) -> Span {
        self.controller.lock().bounds()
    }

    fn session(&self) -> Result<Session<'_, C>, FlashError> {
        let mut ctrl = self.controller.lock();
        ctrl.prepare();
        if let Err(e) = ctrl.unlock() {
            ringbuf_entry!(Trace::UnlockFailed(e));
            ctrl.restore();
            return Err(e);
        }
        Ok(Session { ctrl })
    }

    /// Writes `src` starting at `dest`.
    ///
    /// `dest` must be aligned to the program granule. If `src` is not a
    /// whole number of granules the last one is padded with `0xFF`, so the
    /// span touched is `src.len()` rounded up to the granule. Any failure,
    /// including a read-back mismatch, stops the write at that granule.
    pub fn program(&self, dest: u32, src: &[u8]) -> Result<(), FlashError> {
        let () = Self::GRANULE_OK;
        let granule = C::PROGRAM_SIZE;

        if dest as usize % granule != 0 {
            ringbuf_entry!(Trace::Misaligned(dest));
            return Err(FlashError::Misaligned);
        }
        if src.is_empty() {
            return Ok(());
        }
        let padded = src.len().div_ceil(granule) * granule;
        if !self.bounds().contains(dest, padded) {
            ringbuf_entry!(Trace::OutOfBounds {
                addr: dest,
                len: padded as u32,
            });
            return Err(FlashError::OutOfBounds);
        }

        ringbuf_entry!(Trace::ProgramStart {
            addr: dest,
            len: src.len() as u32,
        });
        let mut session = self.session()?;

        let mut addr = dest;
        for chunk in src.chunks(granule) {
            let mut buf = [ERASED_BYTE; MAX_PROGRAM_SIZE];
            let buf = &mut buf[..granule];
            buf[..chunk.len()].copy_from_slice(chunk);

            if let Err(err) = session.ctrl.program_granule(addr, buf) {
                ringbuf_entry!(Trace::ProgramFailed { addr, err });
                return Err(err);
            }
            if session.ctrl.view(addr, granule)? != buf {
                ringbuf_entry!(Trace::VerifyMismatch(addr));
                return Err(FlashError::VerifyMismatch);
            }
            addr += granule as u32;
        }

        ringbuf_entry!(Trace::ProgramEnd);
        Ok(())
    }

    /// Erases every sector of `span`, which must be sector aligned.
    ///
    /// This has no notion of which code is executing; callers must not
    /// hand it the span they are running from.
    pub fn erase(&self, span: Span) -> Result<(), FlashError> {
        if span.base % C::SECTOR_SIZE != 0 || span.size % C::SECTOR_SIZE != 0
        {
            ringbuf_entry!(Trace::Misaligned(span.base));
            return Err(FlashError::Misaligned);
        }
        if !self.bounds().contains(span.base, span.size as usize) {
            ringbuf_entry!(Trace::OutOfBounds {
                addr: span.base,
                len: span.size,
            });
            return Err(FlashError::OutOfBounds);
        }

        ringbuf_entry!(Trace::EraseStart {
            base: span.base,
            size: span.size,
        });
        let mut session = self.session()?;
        for i in 0..span.size / C::SECTOR_SIZE {
            let addr = span.base + i * C::SECTOR_SIZE;
            if let Err(err) = session.ctrl.erase_sector(addr) {
                ringbuf_entry!(Trace::EraseFailed { addr, err });
                return Err(err);
            }
        }
        ringbuf_entry!(Trace::EraseEnd);
        Ok(())
    }

    /// Calls `f` with the raw contents of `span`. The controller stays
    /// locked for the duration, so no program or erase can interleave.
    pub fn read_with<R>(
        &self,
        span: Span,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, FlashError> {
        let ctrl = self.controller.lock();
        let bytes = ctrl.view(span.base, span.size as usize)?;
        Ok(f(bytes))
    }

    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let ctrl = self.controller.lock();
        buf.copy_from_slice(ctrl.view(addr, buf.len())?);
        Ok(())
    }

    /// Reads the little-endian word at `addr`.
    pub fn read_word(&self, addr: u32) -> Result<u32, FlashError> {
        let mut word = [0; 4];
        self.read(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Whether every byte of `span` reads as erased.
    pub fn is_erased(&self, span: Span) -> Result<bool, FlashError> {
        self.read_with(span, |bytes| bytes.iter().all(|&b| b == ERASED_BYTE))
    }
}
