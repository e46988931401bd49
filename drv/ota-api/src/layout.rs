// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::RegionId;

/// A contiguous range of flash, in CPU addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub base: u32,
    pub size: u32,
}

impl Span {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// One past the last address. Computed in `u64` so a span that ends at
    /// the top of the address space does not overflow.
    pub const fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn contains(&self, addr: u32, len: usize) -> bool {
        addr >= self.base && addr as u64 + len as u64 <= self.end()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        (self.base as u64) < other.end() && (other.base as u64) < self.end()
    }

    /// The `len` bytes starting `offset` bytes into this span, if they fit.
    pub fn sub(&self, offset: u32, len: u32) -> Option<Span> {
        let base = self.base.checked_add(offset)?;
        let span = Span::new(base, len);
        (span.end() <= self.end()).then_some(span)
    }
}

/// How the two regions appear in the CPU address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mapping {
    /// Each region always sits at its own address.
    Fixed,
    /// The bank the device booted from is mapped at the first window and the
    /// other bank at the second, whichever physical bank that is (STM32
    /// dual-bank parts with `SWAP_BANK`).
    BootBankFirst,
}

/// Flash geometry and image policy for one board.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Address windows of the two regions, indexed by [`RegionId::index`].
    pub regions: [Span; 2],
    pub mapping: Mapping,
    /// Erase granule.
    pub sector_size: u32,
    /// Program granule; every write is a whole number of these.
    pub program_size: u32,
    pub min_image_size: u32,
    pub max_image_size: u32,
    /// File name an incoming image must carry.
    pub image_name: &'static str,
    /// Key label the image signature is checked against by default.
    pub signer_key_label: &'static str,
    /// Value the first word of a bootable image must hold.
    pub initial_sp: u32,
    /// Offset into the staging region of the "image present" word.
    pub sentinel_offset: u32,
}

const FLASH_BASE: u32 = 0x0800_0000;
const BANK_SIZE: u32 = 0x0010_0000;
const SECTOR_SIZE: u32 = 0x2000;
const QUAD_WORD: u32 = 16;
const BOOT_SECTORS: u32 = 8;
const OTA_SECTORS: u32 = 96;

impl Layout {
    /// STM32H573, switching banks with the `SWAP_BANK` option byte.
    pub const STM32H573_DUAL_BANK: Layout = Layout {
        regions: [
            Span::new(FLASH_BASE, BANK_SIZE),
            Span::new(FLASH_BASE + BANK_SIZE, BANK_SIZE),
        ],
        mapping: Mapping::BootBankFirst,
        sector_size: SECTOR_SIZE,
        program_size: QUAD_WORD,
        min_image_size: QUAD_WORD,
        max_image_size: OTA_SECTORS * SECTOR_SIZE,
        image_name: "stm32h573i_dk_iot_reference.bin",
        signer_key_label: "sig-sha256-ecdsa",
        initial_sp: 0x200A_0000,
        sentinel_offset: 0,
    };

    /// STM32H573 with a resident bootloader in the first eight sectors that
    /// copy-swaps the application with the staging area in bank 2.
    pub const STM32H573_COPY_SWAP: Layout = Layout {
        regions: [
            Span::new(
                FLASH_BASE + BOOT_SECTORS * SECTOR_SIZE,
                OTA_SECTORS * SECTOR_SIZE,
            ),
            Span::new(FLASH_BASE + BANK_SIZE, OTA_SECTORS * SECTOR_SIZE),
        ],
        mapping: Mapping::Fixed,
        ..Layout::STM32H573_DUAL_BANK
    };
}

cfg_if::cfg_if! {
    if #[cfg(feature = "copy-swap")] {
        impl Layout {
            pub const BOARD: Layout = Layout::STM32H573_COPY_SWAP;
        }
    } else {
        impl Layout {
            pub const BOARD: Layout = Layout::STM32H573_DUAL_BANK;
        }
    }
}

impl Layout {
    /// Where `region` appears in the address space while the device runs
    /// from `active`.
    pub const fn window(&self, region: RegionId, active: RegionId) -> Span {
        match self.mapping {
            Mapping::Fixed => self.regions[region.index()],
            Mapping::BootBankFirst => {
                if region.index() == active.index() {
                    self.regions[0]
                } else {
                    self.regions[1]
                }
            }
        }
    }

    /// Address of the "image present" word in the staging region.
    pub const fn sentinel_address(&self, staging: Span) -> u32 {
        staging.base + self.sentinel_offset
    }

    /// Base addresses of every sector in `span`.
    pub fn sectors(&self, span: Span) -> impl Iterator<Item = u32> {
        let step = self.sector_size.max(1);
        (0..span.size / step).map(move |i| span.base + i * step)
    }

    pub fn is_sector_aligned(&self, span: Span) -> bool {
        self.sector_size != 0
            && span.base % self.sector_size == 0
            && span.size % self.sector_size == 0
    }

    /// Whether `size` is an acceptable image length.
    pub fn accepts_size(&self, size: u32) -> bool {
        (self.min_image_size..=self.max_image_size).contains(&size)
    }
}
