// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-ins for the record store and the boot selection hardware.

use crate::record::RecordStore;
use crate::selector::{BankControl, SystemReset};
use drv_ota_api::{BootError, StoreError};
use heapless::{String, Vec};

const MAX_FILES: usize = 4;
const MAX_PATH: usize = 32;
const MAX_FILE: usize = 64;

type File = (String<MAX_PATH>, Vec<u8, MAX_FILE>);

/// A handful of small files held in RAM.
pub struct MemStore {
    files: Vec<File, MAX_FILES>,
    /// When false, every operation fails with [`StoreError::NotMounted`].
    pub mounted: bool,
    /// When true, writes fail with [`StoreError::Io`].
    pub fail_writes: bool,
    pub writes: usize,
}

impl Default for MemStore {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            mounted: true,
            fail_writes: false,
            writes: 0,
        }
    }
}

impl MemStore {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(p, _)| p.as_str() == path)
            .map(|(_, data)| data.as_slice())
    }

    fn check(&self, writing: bool) -> Result<(), StoreError> {
        if !self.mounted {
            Err(StoreError::NotMounted)
        } else if writing && self.fail_writes {
            Err(StoreError::Io)
        } else {
            Ok(())
        }
    }
}

impl RecordStore for MemStore {
    fn read(
        &mut self,
        path: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError> {
        self.check(false)?;
        Ok(self.file(path).map(|data| {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            data.len()
        }))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        self.check(true)?;
        let data = Vec::from_slice(data).map_err(|_| StoreError::Io)?;
        self.writes += 1;
        if let Some(file) = self.files.iter_mut().find(|(p, _)| p.as_str() == path)
        {
            file.1 = data;
            return Ok(());
        }
        let mut name = String::new();
        name.push_str(path).map_err(|_| StoreError::Io)?;
        self.files.push((name, data)).map_err(|_| StoreError::Io)
    }

    fn remove(&mut self, path: &str) -> Result<(), StoreError> {
        self.check(false)?;
        self.files.retain(|(p, _)| p.as_str() != path);
        Ok(())
    }
}

/// Option bytes of a dual-bank part.
#[derive(Debug, Default)]
pub struct SimBankControl {
    /// `SWAP_BANK` as loaded at the last option byte launch.
    effective: bool,
    /// `SWAP_BANK` as last programmed.
    programmed: bool,
    launched: bool,
    reset_requested: bool,
    option_writes: usize,
    pub fail_program: bool,
}

impl SimBankControl {
    pub fn new(swap: bool) -> Self {
        Self {
            effective: swap,
            programmed: swap,
            ..Self::default()
        }
    }

    pub fn launched(&self) -> bool {
        self.launched
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    pub fn option_writes(&self) -> usize {
        self.option_writes
    }

    /// The part after the reset it was asked for. A system reset only
    /// reloads the option bytes if they were launched.
    pub fn after_reset(self) -> Self {
        let swap = if self.launched {
            self.programmed
        } else {
            self.effective
        };
        Self {
            effective: swap,
            programmed: self.programmed,
            fail_program: self.fail_program,
            ..Self::default()
        }
    }

    /// The part after power is cut and restored, which loads whatever was
    /// last programmed.
    pub fn power_cycle(self) -> Self {
        Self {
            effective: self.programmed,
            programmed: self.programmed,
            fail_program: self.fail_program,
            ..Self::default()
        }
    }
}

impl SystemReset for SimBankControl {
    fn system_reset(&mut self) {
        self.reset_requested = true;
    }
}

impl BankControl for SimBankControl {
    fn swap_bank(&self) -> bool {
        self.effective
    }

    fn programmed_swap_bank(&self) -> bool {
        self.programmed
    }

    fn program_swap_bank(&mut self, swap: bool) -> Result<(), BootError> {
        if self.fail_program {
            return Err(BootError::OptionBytes);
        }
        self.programmed = swap;
        self.option_writes += 1;
        Ok(())
    }

    fn launch_option_bytes(&mut self) {
        self.launched = true;
    }
}

/// Counts resets instead of performing them.
#[derive(Debug, Default)]
pub struct SimReset {
    pub resets: usize,
}

impl SystemReset for SimReset {
    fn system_reset(&mut self) {
        self.resets += 1;
    }
}
