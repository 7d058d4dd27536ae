#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod internal;
pub mod platform;
mod raw;

extern crate alloc;

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{Layout, RECORD_SIZE, StateRecord};
use alloc::vec;
use alloc::vec::Vec;

/// Caller-supplied description of the managed region. Validated at engine construction and
/// persisted (checksummed) at the tail of the region; any drift between the stored record and
/// this value on a later boot forces a full re-initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WlConfig {
    /// Absolute physical offset where the managed region starts. Sector aligned.
    pub start_addr: u32,
    /// Total size of the managed region in bytes, redundant records included. Sector aligned.
    pub full_mem_size: u32,
    /// Granularity of the rotating spare slot, i.e. the wear-leveling unit. Must be a multiple
    /// of `sector_size`.
    pub page_size: u32,
    /// Granularity of one physical erase operation.
    pub sector_size: u32,
    /// Minimum write size the medium accepts; also the stride of the usage bitmap entries.
    /// At most 32, the size of one record slot.
    pub wr_size: u32,
    /// Size of the copy buffer used when relocating a page. Must evenly divide `page_size`.
    pub temp_buff_size: u32,
    /// Caller-assigned schema tag. Bumping it intentionally discards all stored data.
    pub version: u32,
}

impl WlConfig {
    fn validate<T: Platform>(&self) -> Result<(), Error> {
        if self.sector_size == 0 || !(self.sector_size as usize).is_multiple_of(T::ERASE_SIZE) {
            return Err(Error::InvalidSectorSize);
        }
        if self.page_size == 0 || !self.page_size.is_multiple_of(self.sector_size) {
            return Err(Error::InvalidPageSize);
        }
        if !self.start_addr.is_multiple_of(self.sector_size)
            || !self.full_mem_size.is_multiple_of(self.sector_size)
        {
            return Err(Error::RegionMisaligned);
        }
        if self.temp_buff_size == 0
            || !self.page_size.is_multiple_of(self.temp_buff_size)
            || !(self.temp_buff_size as usize).is_multiple_of(T::WRITE_SIZE)
        {
            return Err(Error::InvalidScratchSize);
        }
        if self.wr_size == 0
            || self.wr_size as usize > RECORD_SIZE
            || !(self.wr_size as usize).is_multiple_of(T::WRITE_SIZE)
            || !RECORD_SIZE.is_multiple_of(T::WRITE_SIZE)
        {
            return Err(Error::InvalidWriteGranularity);
        }
        Ok(())
    }
}

/// Which path startup recovery took. Purely diagnostic; every variant leaves the engine in a
/// consistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recovery {
    /// Both state copies were valid and agreed.
    Clean,
    /// Both copies were valid but diverged; copy 2 was re-derived from copy 1.
    SyncedCopy2,
    /// Copy 2 failed its checksum and was rebuilt from copy 1.
    RepairedCopy2,
    /// Copy 1 failed its checksum and was rebuilt from copy 2. Copy 1 is written first during a
    /// persist, so this is treated as a crash mid-wraparound.
    RepairedCopy1,
    /// Blank or incompatible medium (both copies invalid, or the stored configuration did not
    /// match); the managed region was re-initialized.
    Initialized,
}

/// Snapshot of the engine's live counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlStatus {
    /// Index of the slot currently held empty as the rotating spare.
    pub position: u32,
    /// Completed passes of the spare around all slots, wrapping at `slots - 1`.
    pub rotation_count: u32,
    /// Total number of rotation slots (data pages plus the spare).
    pub slots: u32,
    /// Logical capacity in bytes.
    pub capacity: u32,
    /// Which recovery path the last construction took.
    pub recovery: Recovery,
}

/// The wear-leveling engine. Owns the flash HAL, the validated configuration and the live state;
/// all operations are synchronous, blocking and take `&mut self`, so a single instance is never
/// re-entered. Serialize externally if several tasks share one engine.
#[derive(Debug)]
pub struct WlFlash<T: Platform> {
    hal: T,
    cfg: WlConfig,
    layout: Layout,
    state: StateRecord,
    scratch: Vec<u8>,
    recovery: Recovery,
    faulted: bool,
}

impl<T: Platform> WlFlash<T> {
    /// Validates the configuration, derives the on-flash layout and recovers (or initializes)
    /// the persistent state.
    ///
    /// A blank medium, a corrupt pair of state copies or a `version` bump silently
    /// re-initializes the region; a single corrupt copy is repaired from its twin. Only medium
    /// faults surface as errors.
    pub fn new(cfg: WlConfig, mut hal: T) -> Result<WlFlash<T>, Error> {
        cfg.validate::<T>()?;
        let layout = Layout::derive(&cfg)?;
        let scratch = vec![0u8; cfg.temp_buff_size as usize];

        let (state, recovery) = internal::recover(&mut hal, &cfg, &layout)?;

        Ok(Self {
            hal,
            cfg,
            layout,
            state,
            scratch,
            recovery,
            faulted: false,
        })
    }

    /// Logical capacity in bytes. Stable across restarts for a given configuration and always
    /// smaller than `full_mem_size`.
    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn status(&self) -> WlStatus {
        WlStatus {
            position: self.state.pos,
            rotation_count: self.state.move_count,
            slots: self.layout.max_pos,
            capacity: self.layout.capacity,
            recovery: self.recovery,
        }
    }

    /// Erases the sectors covering `[offset, offset + len)`. Each covered sector first advances
    /// the wear-leveling rotation by one slot, then erases the translated physical block, so
    /// this is the system's dominant cost.
    pub fn erase(&mut self, offset: u32, len: u32) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }
        match self.erase_inner(offset, len) {
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            other => other,
        }
    }

    /// Writes `bytes` at the logical `offset`. Does not erase first: writes only clear bits, as
    /// on the raw medium, so the caller must have erased the target range beforehand. `offset`
    /// has to respect the medium's write alignment.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }
        match self.write_inner(offset, bytes) {
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            other => other,
        }
    }

    /// Reads `buf.len()` bytes from the logical `offset`.
    pub fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        match self.read_inner(offset, buf) {
            Err(Error::FlashError) => {
                self.faulted = true;
                Err(Error::FlashError)
            }
            other => other,
        }
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<(), Error> {
        match (offset as u64).checked_add(len as u64) {
            Some(end) if end <= self.layout.capacity as u64 => Ok(()),
            _ => Err(Error::OutOfBounds),
        }
    }

    fn erase_inner(&mut self, offset: u32, len: u32) -> Result<(), Error> {
        self.check_bounds(offset, len as usize)?;
        if len == 0 {
            return Ok(());
        }

        let sector = self.cfg.sector_size;
        let erase_count = len.div_ceil(sector);
        let start_sector = offset / sector;

        for i in 0..erase_count {
            internal::rotate_once(
                &mut self.hal,
                &self.cfg,
                &self.layout,
                &mut self.state,
                &mut self.scratch,
            )?;
            let physical = self.translate((start_sector + i) * sector);
            let from = self.cfg.start_addr + physical;
            self.hal
                .erase(from, from + sector)
                .map_err(|_| Error::FlashError)?;
        }
        Ok(())
    }

    fn write_inner(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.check_bounds(offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }

        let page = self.cfg.page_size as usize;
        // Translation is re-evaluated per page chunk; within one call the state is stable, but
        // the per-chunk translate keeps the last partial chunk on the simple path.
        let count = (bytes.len() - 1) / page;
        for i in 0..count {
            let physical = self.translate(offset + (i * page) as u32);
            raw::write_aligned(
                &mut self.hal,
                self.cfg.start_addr + physical,
                &bytes[i * page..(i + 1) * page],
            )
            .map_err(|_| Error::FlashError)?;
        }
        let physical = self.translate(offset + (count * page) as u32);
        raw::write_aligned(
            &mut self.hal,
            self.cfg.start_addr + physical,
            &bytes[count * page..],
        )
        .map_err(|_| Error::FlashError)
    }

    fn read_inner(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.check_bounds(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }

        let page = self.cfg.page_size as usize;
        let count = (buf.len() - 1) / page;
        for i in 0..count {
            let physical = self.translate(offset + (i * page) as u32);
            self.hal
                .read(self.cfg.start_addr + physical, &mut buf[i * page..(i + 1) * page])
                .map_err(|_| Error::FlashError)?;
        }
        let physical = self.translate(offset + (count * page) as u32);
        self.hal
            .read(self.cfg.start_addr + physical, &mut buf[count * page..])
            .map_err(|_| Error::FlashError)
    }

    fn translate(&self, addr: u32) -> u32 {
        internal::calc_physical(
            self.layout.capacity,
            self.cfg.page_size,
            self.state.pos,
            self.state.move_count,
            addr,
        )
    }
}
