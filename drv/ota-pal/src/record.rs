// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller state that survives a reset.

use crc::{Crc, CRC_32_ISO_HDLC};
use drv_ota_api::{PalState, RegionId, StoreError, IMAGE_STATE_PATH};
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A small file store, such as a littlefs partition.
///
/// Every failure, including the store not being mounted, comes back as an
/// error; implementations must not panic.
pub trait RecordStore {
    /// Reads the file at `path` into `buf` and returns the file's length,
    /// or `None` if there is no such file.
    fn read(
        &mut self,
        path: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StoreError>;

    /// Creates or truncates the file at `path` and writes `data` to it.
    fn write(&mut self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Deletes the file at `path`. Deleting a missing file succeeds.
    fn remove(&mut self, path: &str) -> Result<(), StoreError>;
}

pub const RECORD_LEN: usize = 16;

/// "OTA1", little endian.
const MAGIC: u32 = 0x3141_544f;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawRecord {
    magic: U32,
    state: U32,
    /// Bank number, or zero for none.
    target: U32,
    /// CRC-32 of the preceding fields.
    crc: U32,
}

const_assert_eq!(core::mem::size_of::<RawRecord>(), RECORD_LEN);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PersistedRecord {
    pub state: PalState,
    pub target: Option<RegionId>,
}

impl PersistedRecord {
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut raw = RawRecord {
            magic: U32::new(MAGIC),
            state: U32::new(self.state as u32),
            target: U32::new(self.target.map_or(0, |r| r as u32)),
            crc: U32::new(0),
        };
        raw.crc = U32::new(CRC32.checksum(&raw.as_bytes()[..RECORD_LEN - 4]));

        let mut out = [0; RECORD_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Parses a stored record. Anything that is not exactly a record this
    /// code wrote is [`StoreError::Corrupt`].
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw =
            RawRecord::read_from_bytes(bytes).map_err(|_| StoreError::Corrupt)?;
        if raw.magic.get() != MAGIC
            || raw.crc.get() != CRC32.checksum(&bytes[..RECORD_LEN - 4])
        {
            return Err(StoreError::Corrupt);
        }
        let state = match PalState::from_u32(raw.state.get()) {
            None | Some(PalState::NotInitialized) => {
                return Err(StoreError::Corrupt)
            }
            Some(s) => s,
        };
        let target = match raw.target.get() {
            0 => None,
            n => Some(RegionId::from_u32(n).ok_or(StoreError::Corrupt)?),
        };
        Ok(Self { state, target })
    }

    /// Reads the record, if there is one.
    pub fn load<S: RecordStore>(store: &mut S) -> Result<Option<Self>, StoreError> {
        let mut buf = [0; RECORD_LEN];
        match store.read(IMAGE_STATE_PATH, &mut buf)? {
            None => Ok(None),
            Some(RECORD_LEN) => Self::decode(&buf).map(Some),
            Some(_) => Err(StoreError::Corrupt),
        }
    }

    pub fn save<S: RecordStore>(&self, store: &mut S) -> Result<(), StoreError> {
        store.write(IMAGE_STATE_PATH, &self.encode())
    }

    pub fn delete<S: RecordStore>(store: &mut S) -> Result<(), StoreError> {
        store.remove(IMAGE_STATE_PATH)
    }
}
