// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bootloader image swap for parts without a hardware bank switch.
//!
//! On these boards the application always executes from the
//! [`RegionId::EXECUTION`] region, and the update controller writes incoming
//! images into [`RegionId::STAGING`]. Before starting the application, the
//! bootloader checks the first word of the staging region. Anything other
//! than erased flash means an image is waiting, and the two regions are
//! exchanged one sector at a time through two RAM buffers. The image that
//! was running ends up in the staging region, which is what lets the update
//! controller revert a rejected image by simply resetting.
//!
//! # Power loss
//!
//! The exchange is not restartable. Each sector of the execution region is
//! erased before it is reprogrammed, so a failure or power loss between
//! those two steps leaves a sector whose only copy was in RAM. There is no
//! completion marker and no journal; [`swap_images`] reports the sector it
//! stopped at and the device is left partially swapped. Parts with a native
//! bank switch never copy image bytes and are not exposed to this.

#![cfg_attr(not(test), no_std)]

use drv_ota_api::{FlashError, Layout, RegionId, Span, ERASED_WORD};
use drv_ota_flash::{Flash, FlashController};
use ringbuf::*;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    NoStagedImage,
    SwapStart { sectors: u32 },
    Sector(u32),
    SwapFailed { sector: u32, err: FlashError },
    SwapDone,
    BadStackPointer(u32),
    Boot { entry: u32 },
}

ringbuf!(Trace, 16, Trace::None);

/// Outcome of one boot's pass over the regions. There is at most one
/// transition per boot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapState {
    NotSwapped,
    Swapped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwapError {
    /// A RAM buffer is smaller than one sector.
    BufferTooSmall,
    /// The regions differ in size or are not sector aligned.
    BadLayout,
    /// A flash operation failed at sector `sector`. Sectors before it have
    /// been exchanged; that one may have no intact copy.
    Flash { sector: u32, err: FlashError },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootError {
    /// The first word of the execution region is not the expected initial
    /// stack pointer, so there is no image to start.
    BadStackPointer(u32),
    Flash(FlashError),
    Swap(SwapError),
}

impl From<FlashError> for BootError {
    fn from(e: FlashError) -> Self {
        BootError::Flash(e)
    }
}

impl From<SwapError> for BootError {
    fn from(e: SwapError) -> Self {
        BootError::Swap(e)
    }
}

/// Where and how to start the application.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootVector {
    pub vector_table: u32,
    pub stack_pointer: u32,
    pub entry: u32,
}

fn regions(layout: &Layout) -> (Span, Span) {
    (
        layout.window(RegionId::EXECUTION, RegionId::EXECUTION),
        layout.window(RegionId::STAGING, RegionId::EXECUTION),
    )
}

/// Whether the staging region holds an image waiting to be swapped in.
pub fn staged_image_present<C: FlashController>(
    flash: &Flash<C>,
    layout: &Layout,
) -> Result<bool, FlashError> {
    let (_, staging) = regions(layout);
    let word = flash.read_word(layout.sentinel_address(staging))?;
    Ok(word != ERASED_WORD)
}

/// Exchanges the execution and staging regions if an image is staged.
///
/// `staged_buf` and `active_buf` must each hold at least one sector. See
/// the crate documentation for what a failure part way through means.
pub fn swap_images<C: FlashController>(
    flash: &Flash<C>,
    layout: &Layout,
    staged_buf: &mut [u8],
    active_buf: &mut [u8],
) -> Result<SwapState, SwapError> {
    let (active, staging) = regions(layout);
    if active.size != staging.size
        || !layout.is_sector_aligned(active)
        || !layout.is_sector_aligned(staging)
    {
        return Err(SwapError::BadLayout);
    }
    let sector_size = layout.sector_size;
    let len = sector_size as usize;
    let (Some(staged_buf), Some(active_buf)) =
        (staged_buf.get_mut(..len), active_buf.get_mut(..len))
    else {
        return Err(SwapError::BufferTooSmall);
    };

    let present = staged_image_present(flash, layout)
        .map_err(|err| SwapError::Flash { sector: 0, err })?;
    if !present {
        ringbuf_entry!(Trace::NoStagedImage);
        return Ok(SwapState::NotSwapped);
    }

    ringbuf_entry!(Trace::SwapStart {
        sectors: active.size / sector_size
    });
    let pairs = layout.sectors(active).zip(layout.sectors(staging));
    for (sector, (a, s)) in (0u32..).zip(pairs) {
        ringbuf_entry!(Trace::Sector(sector));
        let fail = move |err| {
            ringbuf_entry!(Trace::SwapFailed { sector, err });
            SwapError::Flash { sector, err }
        };

        flash.read(s, staged_buf).map_err(fail)?;
        flash.read(a, active_buf).map_err(fail)?;
        flash.erase(Span::new(a, sector_size)).map_err(fail)?;
        flash.program(a, staged_buf).map_err(fail)?;
        flash.erase(Span::new(s, sector_size)).map_err(fail)?;
        flash.program(s, active_buf).map_err(fail)?;
    }

    ringbuf_entry!(Trace::SwapDone);
    Ok(SwapState::Swapped)
}

/// Reads and checks the vector table at the base of the execution region.
pub fn boot_vector<C: FlashController>(
    flash: &Flash<C>,
    layout: &Layout,
) -> Result<BootVector, BootError> {
    let (active, _) = regions(layout);
    let stack_pointer = flash.read_word(active.base)?;
    if stack_pointer != layout.initial_sp {
        ringbuf_entry!(Trace::BadStackPointer(stack_pointer));
        return Err(BootError::BadStackPointer(stack_pointer));
    }
    let entry = flash.read_word(active.base + 4)?;
    Ok(BootVector {
        vector_table: active.base,
        stack_pointer,
        entry,
    })
}

/// The whole bootloader pass: swap a staged image in if there is one, then
/// find the application's entry point.
pub fn prepare_boot<C: FlashController>(
    flash: &Flash<C>,
    layout: &Layout,
    staged_buf: &mut [u8],
    active_buf: &mut [u8],
) -> Result<(SwapState, BootVector), BootError> {
    let state = swap_images(flash, layout, staged_buf, active_buf)?;
    let vector = boot_vector(flash, layout)?;
    ringbuf_entry!(Trace::Boot {
        entry: vector.entry
    });
    Ok((state, vector))
}

/// Points VTOR at the image and jumps to it with its own stack.
///
/// # Safety
///
/// `vector` must describe a valid image, and nothing set up by the
/// bootloader (interrupts, DMA) may still be live.
#[cfg(target_arch = "arm")]
pub unsafe fn branch_to_image(vector: BootVector) -> ! {
    let scb = &*cortex_m::peripheral::SCB::PTR;
    scb.vtor.write(vector.vector_table);
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    core::arch::asm!("
            msr MSP, {stack}
            bx {entry}",
        stack = in(reg) vector.stack_pointer,
        entry = in(reg) vector.entry,
        options(noreturn),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_ota_api::Mapping;
    use drv_ota_flash::sim::SimFlash;

    const BASE: u32 = 0x0800_0000;
    const SECTOR: usize = 512;
    const SP: u32 = 0x200A_0000;

    type Sim = SimFlash<0x3000, SECTOR>;

    fn layout() -> Layout {
        Layout {
            regions: [
                Span::new(BASE + 0x1000, 0x800),
                Span::new(BASE + 0x2000, 0x800),
            ],
            mapping: Mapping::Fixed,
            sector_size: SECTOR as u32,
            program_size: 16,
            min_image_size: 16,
            max_image_size: 0x800,
            image_name: "fw.bin",
            signer_key_label: "signer",
            initial_sp: SP,
            sentinel_offset: 0,
        }
    }

    /// A 2 KiB image with a valid vector table whose body is `fill`.
    fn image(entry: u32, fill: u8) -> Vec<u8> {
        let mut img = vec![fill; 0x800];
        img[..4].copy_from_slice(&SP.to_le_bytes());
        img[4..8].copy_from_slice(&entry.to_le_bytes());
        img
    }

    fn flash_with(active: &[u8], staged: Option<&[u8]>) -> Flash<Sim> {
        let mut sim = Sim::new(BASE);
        sim.load(BASE + 0x1000, active);
        if let Some(staged) = staged {
            sim.load(BASE + 0x2000, staged);
        }
        Flash::new(sim)
    }

    fn contents(flash: &Flash<Sim>, span: Span) -> Vec<u8> {
        flash.with_controller(|c| c.bytes(span).to_vec())
    }

    #[test]
    fn nothing_staged_boots_active_image() {
        let old = image(0x0800_1101, 0xaa);
        let flash = flash_with(&old, None);
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR]);

        let (state, vector) =
            prepare_boot(&flash, &layout(), &mut a, &mut b).unwrap();
        assert_eq!(state, SwapState::NotSwapped);
        assert_eq!(
            vector,
            BootVector {
                vector_table: BASE + 0x1000,
                stack_pointer: SP,
                entry: 0x0800_1101,
            }
        );
        flash.with_controller(|c| {
            assert_eq!(c.stats().erases, 0);
            assert_eq!(c.stats().programs, 0);
        });
    }

    #[test]
    fn staged_image_is_exchanged() {
        let old = image(0x0800_1101, 0xaa);
        let new = image(0x0800_1201, 0x55);
        let flash = flash_with(&old, Some(&new));
        let l = layout();
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR]);

        assert!(staged_image_present(&flash, &l).unwrap());
        let (state, vector) = prepare_boot(&flash, &l, &mut a, &mut b).unwrap();
        assert_eq!(state, SwapState::Swapped);
        assert_eq!(vector.entry, 0x0800_1201);
        assert_eq!(contents(&flash, l.regions[0]), new);
        assert_eq!(contents(&flash, l.regions[1]), old);
        flash.with_controller(|c| assert_eq!(c.stats().erases, 8));
    }

    #[test]
    fn swapping_twice_restores_original_placement() {
        let old = image(0x0800_1101, 0xaa);
        let new = image(0x0800_1201, 0x55);
        let flash = flash_with(&old, Some(&new));
        let l = layout();
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR]);

        swap_images(&flash, &l, &mut a, &mut b).unwrap();
        swap_images(&flash, &l, &mut a, &mut b).unwrap();
        assert_eq!(contents(&flash, l.regions[0]), old);
        assert_eq!(contents(&flash, l.regions[1]), new);
    }

    #[test]
    fn power_loss_mid_swap_reports_sector() {
        let old = image(0x0800_1101, 0xaa);
        let new = image(0x0800_1201, 0x55);
        let flash = flash_with(&old, Some(&new));
        let l = layout();
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR]);

        // Sector 0 costs two erases and 2 x 32 granule programs. After
        // that only the erase of active sector 1 gets through.
        flash.with_controller(|c| c.faults().power_loss_after = Some(67));
        let err = swap_images(&flash, &l, &mut a, &mut b).unwrap_err();
        assert_eq!(
            err,
            SwapError::Flash {
                sector: 1,
                err: FlashError::ProgramFailed
            }
        );

        let active = contents(&flash, l.regions[0]);
        assert_eq!(&active[..SECTOR], &new[..SECTOR]);
        // Sector 1 of the old image only ever existed in RAM from here on.
        assert!(active[SECTOR..2 * SECTOR].iter().all(|&b| b == 0xff));
        let staging = contents(&flash, l.regions[1]);
        assert_eq!(&staging[..SECTOR], &old[..SECTOR]);
        assert_eq!(&staging[SECTOR..2 * SECTOR], &new[SECTOR..2 * SECTOR]);
    }

    #[test]
    fn undersized_buffers_are_refused() {
        let flash = flash_with(&image(0, 0), None);
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR - 1]);
        assert_eq!(
            swap_images(&flash, &layout(), &mut a, &mut b),
            Err(SwapError::BufferTooSmall)
        );
    }

    #[test]
    fn mismatched_regions_are_refused() {
        let flash = flash_with(&image(0, 0), None);
        let mut l = layout();
        l.regions[1].size = 0x600;
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR]);
        assert_eq!(
            swap_images(&flash, &l, &mut a, &mut b),
            Err(SwapError::BadLayout)
        );
    }

    #[test]
    fn bad_stack_pointer_aborts_boot() {
        let mut garbage = image(0x0800_1101, 0xaa);
        garbage[..4].copy_from_slice(&0x2000_0000u32.to_le_bytes());
        let flash = flash_with(&garbage, None);
        let (mut a, mut b) = ([0; SECTOR], [0; SECTOR]);
        assert_eq!(
            prepare_boot(&flash, &layout(), &mut a, &mut b),
            Err(BootError::BadStackPointer(0x2000_0000))
        );

        let blank = flash_with(&[0xff; 0x800], None);
        assert_eq!(
            boot_vector(&blank, &layout()),
            Err(BootError::BadStackPointer(0xffff_ffff))
        );
    }
}
