// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory NOR flash model.
//!
//! Programming can only clear bits, erase sets a whole sector back to
//! `0xFF`, and programming is refused unless the controller has been both
//! prepared and unlocked. [`Faults`] injects the failures the update path has
//! to survive.

use crate::FlashController;
use drv_ota_api::{FlashError, Span, ERASED_BYTE};

/// Failures to inject. Addresses are matched against the start of the
/// granule or sector being operated on.
#[derive(Copy, Clone, Debug, Default)]
pub struct Faults {
    pub fail_program_at: Option<u32>,
    pub fail_erase_at: Option<u32>,
    /// Program succeeds but the read-back differs.
    pub corrupt_at: Option<u32>,
    pub refuse_unlock: bool,
    /// Number of further program/erase operations that succeed before every
    /// later one fails, as if power had been lost.
    pub power_loss_after: Option<usize>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub programs: usize,
    pub erases: usize,
    pub unlocks: usize,
}

/// `N` bytes of flash mapped at `base`, erased in `SECTOR`-byte sectors and
/// programmed in 16-byte granules.
pub struct SimFlash<const N: usize, const SECTOR: usize> {
    base: u32,
    mem: [u8; N],
    unlocked: bool,
    prepared: bool,
    faults: Faults,
    stats: SimStats,
}

impl<const N: usize, const SECTOR: usize> SimFlash<N, SECTOR> {
    pub const fn new(base: u32) -> Self {
        Self {
            base,
            mem: [ERASED_BYTE; N],
            unlocked: false,
            prepared: false,
            faults: Faults {
                fail_program_at: None,
                fail_erase_at: None,
                corrupt_at: None,
                refuse_unlock: false,
                power_loss_after: None,
            },
            stats: SimStats {
                programs: 0,
                erases: 0,
                unlocks: 0,
            },
        }
    }

    pub fn faults(&mut self) -> &mut Faults {
        &mut self.faults
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Writes bytes directly, bypassing the controller, as a debugger would.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let start = (addr - self.base) as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn bytes(&self, span: Span) -> &[u8] {
        let start = (span.base - self.base) as usize;
        &self.mem[start..start + span.size as usize]
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize, FlashError> {
        if self.bounds().contains(addr, len) {
            Ok((addr - self.base) as usize)
        } else {
            Err(FlashError::OutOfBounds)
        }
    }

    /// Consumes one operation of the power budget.
    fn power(&mut self) -> bool {
        match &mut self.faults.power_loss_after {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

impl<const N: usize, const SECTOR: usize> FlashController
    for SimFlash<N, SECTOR>
{
    const PROGRAM_SIZE: usize = 16;
    const SECTOR_SIZE: u32 = SECTOR as u32;

    fn bounds(&self) -> Span {
        Span::new(self.base, N as u32)
    }

    fn prepare(&mut self) {
        self.prepared = true;
    }

    fn restore(&mut self) {
        self.prepared = false;
    }

    fn unlock(&mut self) -> Result<(), FlashError> {
        if self.faults.refuse_unlock {
            return Err(FlashError::Locked);
        }
        self.unlocked = true;
        self.stats.unlocks += 1;
        Ok(())
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn program_granule(
        &mut self,
        addr: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        if !self.unlocked {
            return Err(FlashError::Locked);
        }
        if !self.prepared
            || data.len() != Self::PROGRAM_SIZE
            || self.faults.fail_program_at == Some(addr)
            || !self.power()
        {
            return Err(FlashError::ProgramFailed);
        }
        let start = self.offset(addr, data.len())?;
        for (cell, &b) in self.mem[start..start + data.len()].iter_mut().zip(data)
        {
            *cell &= b;
        }
        if self.faults.corrupt_at == Some(addr) {
            self.mem[start] = data[0] ^ 0xff;
        }
        self.stats.programs += 1;
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if !self.unlocked {
            return Err(FlashError::Locked);
        }
        if !self.prepared
            || self.faults.fail_erase_at == Some(addr)
            || !self.power()
        {
            return Err(FlashError::EraseFailed);
        }
        let start = self.offset(addr, SECTOR)?;
        self.mem[start..start + SECTOR].fill(ERASED_BYTE);
        self.stats.erases += 1;
        Ok(())
    }

    fn view(&self, addr: u32, len: usize) -> Result<&[u8], FlashError> {
        let start = self.offset(addr, len)?;
        Ok(&self.mem[start..start + len])
    }
}
