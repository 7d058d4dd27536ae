use crate::WlConfig;
use crate::error::Error;
use crate::platform::{AlignedOps, FnCrc32, Platform, align_ceil};
use alloc::vec;
use core::fmt::{Debug, Formatter};
use core::mem::{size_of, transmute};
#[cfg(feature = "defmt")]
use defmt::trace;

/// Both on-flash records occupy exactly 32 bytes, keeping the bitmap that follows a state record
/// aligned for any write granularity up to 32.
pub(crate) const RECORD_SIZE: usize = 32;
/// The checksum covers every record byte except the trailing crc field itself.
const CRC_COVERAGE: usize = RECORD_SIZE - size_of::<u32>();

/// A bitmap entry whose first byte still reads 0xFF marks a slot that has not yet served as the
/// hole during the current rotation epoch.
pub(crate) const FREE_MARK: u8 = 0xFF;
pub(crate) const USED_MARK: u8 = 0x00;

/// Live engine state, duplicated at two fixed offsets near the top of the managed region and
/// rewritten on every hole wraparound. `cycle_size` echoes the configured page size.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct StateRecord {
    pub(crate) pos: u32,
    pub(crate) max_pos: u32,
    pub(crate) move_count: u32,
    pub(crate) cycle_size: u32,
    pub(crate) version: u32,
    pub(crate) _unused: [u8; 8],
    pub(crate) crc: u32,
}

pub(crate) union StateRecordRaw {
    pub(crate) record: StateRecord,
    pub(crate) raw: [u8; size_of::<StateRecord>()],
}

const _: () = assert!(
    size_of::<StateRecord>() == RECORD_SIZE,
    "state record must stay exactly one record slot"
);

impl StateRecord {
    pub(crate) fn fresh(cfg: &WlConfig, max_pos: u32) -> Self {
        Self {
            pos: 0,
            max_pos,
            move_count: 0,
            cycle_size: cfg.page_size,
            version: cfg.version,
            _unused: [0xFF; 8],
            crc: 0,
        }
    }

    pub(crate) fn calculate_crc32(&self, crc32: FnCrc32) -> u32 {
        let buf: [u8; RECORD_SIZE] = unsafe { transmute(*self) };
        crc32(u32::MAX, &buf[..CRC_COVERAGE])
    }

    pub(crate) fn seal(&mut self, crc32: FnCrc32) {
        self.crc = self.calculate_crc32(crc32);
    }

    pub(crate) fn is_valid(&self, crc32: FnCrc32) -> bool {
        let stored = self.crc;
        self.calculate_crc32(crc32) == stored
    }
}

impl Debug for StateRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let pos = self.pos;
        let max_pos = self.max_pos;
        let move_count = self.move_count;
        let version = self.version;
        let crc = self.crc;
        f.write_fmt(format_args!(
            "StateRecord {{ pos: {pos:>4}/{max_pos}, move_count: {move_count:>4}, version: {version}, crc: 0x{crc:0>8x} }}"
        ))
    }
}

/// Configuration as persisted at the tail of the managed region. Written once at first
/// initialization and compared against the caller-supplied configuration on every boot.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub(crate) struct ConfigRecord {
    pub(crate) start_addr: u32,
    pub(crate) full_mem_size: u32,
    pub(crate) page_size: u32,
    pub(crate) sector_size: u32,
    pub(crate) wr_size: u32,
    pub(crate) temp_buff_size: u32,
    pub(crate) version: u32,
    pub(crate) crc: u32,
}

pub(crate) union ConfigRecordRaw {
    pub(crate) record: ConfigRecord,
    pub(crate) raw: [u8; size_of::<ConfigRecord>()],
}

const _: () = assert!(
    size_of::<ConfigRecord>() == RECORD_SIZE,
    "config record must stay exactly one record slot"
);

impl ConfigRecord {
    pub(crate) fn calculate_crc32(&self, crc32: FnCrc32) -> u32 {
        let buf: [u8; RECORD_SIZE] = unsafe { transmute(*self) };
        crc32(u32::MAX, &buf[..CRC_COVERAGE])
    }

    pub(crate) fn seal(&mut self, crc32: FnCrc32) {
        self.crc = self.calculate_crc32(crc32);
    }

    pub(crate) fn is_valid(&self, crc32: FnCrc32) -> bool {
        let stored = self.crc;
        self.calculate_crc32(crc32) == stored
    }

    pub(crate) fn raw_bytes(&self) -> [u8; RECORD_SIZE] {
        unsafe { transmute(*self) }
    }
}

impl From<&WlConfig> for ConfigRecord {
    fn from(cfg: &WlConfig) -> Self {
        Self {
            start_addr: cfg.start_addr,
            full_mem_size: cfg.full_mem_size,
            page_size: cfg.page_size,
            sector_size: cfg.sector_size,
            wr_size: cfg.wr_size,
            temp_buff_size: cfg.temp_buff_size,
            version: cfg.version,
            crc: 0,
        }
    }
}

/// Where everything lives, derived once from the configuration and never persisted. The tail of
/// the managed region holds state copy 1, state copy 2 and the config record, each rounded up to
/// whole sectors. What remains, minus the one page reserved as the rotating spare, is the logical
/// capacity exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    pub(crate) state_size: u32,
    pub(crate) cfg_size: u32,
    pub(crate) addr_state1: u32,
    pub(crate) addr_state2: u32,
    pub(crate) addr_cfg: u32,
    pub(crate) capacity: u32,
    pub(crate) max_pos: u32,
    pub(crate) bitmap_entries: u32,
}

impl Layout {
    pub(crate) fn derive(cfg: &WlConfig) -> Result<Self, Error> {
        // Sized from page_size, not sector_size, so indexing by slot stays consistent when the
        // two differ. One extra entry covers the spare slot.
        let bitmap_entries = cfg.full_mem_size / cfg.page_size + 1;

        let state_size = align_ceil(
            RECORD_SIZE + (bitmap_entries * cfg.wr_size) as usize,
            cfg.sector_size as usize,
        ) as u32;
        let cfg_size = align_ceil(RECORD_SIZE, cfg.sector_size as usize) as u32;

        let overhead = 2 * state_size + cfg_size;
        if cfg.full_mem_size <= overhead {
            return Err(Error::RegionTooSmall);
        }

        // One slot stays empty as the rotating spare, so usable pages need at least the spare
        // plus one data page.
        let pages = (cfg.full_mem_size - overhead) / cfg.page_size;
        if pages < 2 {
            return Err(Error::RegionTooSmall);
        }
        let capacity = (pages - 1) * cfg.page_size;

        let addr_cfg = cfg.start_addr + cfg.full_mem_size - cfg_size;
        let addr_state2 = addr_cfg - state_size;
        let addr_state1 = addr_state2 - state_size;

        Ok(Self {
            state_size,
            cfg_size,
            addr_state1,
            addr_state2,
            addr_cfg,
            capacity,
            max_pos: pages,
            bitmap_entries,
        })
    }

    pub(crate) fn slot_addr(&self, cfg: &WlConfig, slot: u32) -> u32 {
        cfg.start_addr + slot * cfg.page_size
    }

    /// Byte address of a slot's usage mark inside the bitmap trailing the given state copy.
    pub(crate) fn bitmap_entry_addr(&self, cfg: &WlConfig, copy_addr: u32, slot: u32) -> u32 {
        copy_addr + RECORD_SIZE as u32 + slot * cfg.wr_size
    }
}

pub(crate) fn read_state<T: Platform>(hal: &mut T, addr: u32) -> Result<StateRecord, Error> {
    let mut raw = [0u8; RECORD_SIZE];
    hal.read(addr, &mut raw).map_err(|_| Error::FlashError)?;
    Ok(unsafe { StateRecordRaw { raw }.record })
}

pub(crate) fn write_state<T: Platform>(
    hal: &mut T,
    addr: u32,
    record: &StateRecord,
) -> Result<(), Error> {
    let raw = StateRecordRaw { record: *record };
    hal.write(addr, unsafe { &raw.raw })
        .map_err(|_| Error::FlashError)
}

pub(crate) fn read_config<T: Platform>(hal: &mut T, addr: u32) -> Result<ConfigRecord, Error> {
    let mut raw = [0u8; RECORD_SIZE];
    hal.read(addr, &mut raw).map_err(|_| Error::FlashError)?;
    Ok(unsafe { ConfigRecordRaw { raw }.record })
}

pub(crate) fn write_config<T: Platform>(
    hal: &mut T,
    addr: u32,
    record: &ConfigRecord,
) -> Result<(), Error> {
    let raw = ConfigRecordRaw { record: *record };
    hal.write(addr, unsafe { &raw.raw })
        .map_err(|_| Error::FlashError)
}

#[inline(always)]
pub(crate) fn write_aligned<T: Platform>(
    hal: &mut T,
    offset: u32,
    bytes: &[u8],
) -> Result<(), T::Error> {
    #[cfg(feature = "defmt")]
    trace!("write_aligned @{:#08x}: [{}]", offset, bytes.len());

    if bytes.len().is_multiple_of(T::WRITE_SIZE) {
        hal.write(offset, bytes)
    } else {
        let pivot = T::align_write_floor(bytes.len());
        let header = &bytes[..pivot];
        let trailer = &bytes[pivot..];
        if !header.is_empty() {
            hal.write(offset, header)?;
        }

        // no need to write the trailer if remaining data is all ones - this is the default state
        // of the flash
        if trailer.iter().any(|&e| e != 0xFF) {
            let mut buf = vec![0xFFu8; T::WRITE_SIZE];
            buf[..trailer.len()].copy_from_slice(trailer);
            hal.write(offset + (pivot as u32), &buf)?
        }

        Ok(())
    }
}
