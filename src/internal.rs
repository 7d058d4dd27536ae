use crate::Recovery;
use crate::WlConfig;
use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    ConfigRecord, FREE_MARK, Layout, RECORD_SIZE, StateRecord, USED_MARK, read_config, read_state,
    write_aligned, write_config, write_state,
};
#[cfg(feature = "defmt")]
use defmt::trace;

/// Maps a logical offset to the current physical offset. Pure in `pos` and `move_count`: the
/// logical space is rotated forward by `move_count` pages and bumped past the slot currently held
/// empty as the spare. Injective over `[0, capacity)` and never yields the hole itself.
///
/// Caller must supply `addr < capacity`.
pub(crate) fn calc_physical(capacity: u32, page_size: u32, pos: u32, move_count: u32, addr: u32) -> u32 {
    let rotated = (capacity as u64 - move_count as u64 * page_size as u64 + addr as u64)
        % capacity as u64;
    let mut result = rotated as u32;
    if result >= pos * page_size {
        result += page_size;
    }
    result
}

/// Erases a physical range sector by sector. The range is trusted to be sector aligned.
pub(crate) fn erase_raw<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    start: u32,
    len: u32,
) -> Result<(), Error> {
    for i in 0..len / cfg.sector_size {
        let from = start + i * cfg.sector_size;
        hal.erase(from, from + cfg.sector_size)
            .map_err(|_| Error::FlashError)?;
    }
    Ok(())
}

/// Marks `slot` as used in the bitmap trailing one state copy. The mark is a full
/// `wr_size`-sized block of zeroes so the write respects the medium's minimum write size;
/// bitmap bytes only ever transition from 0xFF to 0x00, once per rotation epoch, so no erase is
/// needed. `wr_size <= RECORD_SIZE` is validated at construction, so one record slot on the
/// stack covers an entry.
fn mark_used<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
    copy_addr: u32,
    slot: u32,
) -> Result<(), Error> {
    let mark = [USED_MARK; RECORD_SIZE];
    hal.write(
        layout.bitmap_entry_addr(cfg, copy_addr, slot),
        &mark[..cfg.wr_size as usize],
    )
    .map_err(|_| Error::FlashError)
}

/// Erases both state copy ranges and rewrites the (sealed) record into each. Erasing a copy also
/// resets its bitmap to all-free, which is exactly what a new rotation epoch needs.
pub(crate) fn persist_state<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
    state: &StateRecord,
) -> Result<(), Error> {
    erase_raw(hal, cfg, layout.addr_state1, layout.state_size)?;
    write_state(hal, layout.addr_state1, state)?;
    erase_raw(hal, cfg, layout.addr_state2, layout.state_size)?;
    write_state(hal, layout.addr_state2, state)?;
    Ok(())
}

/// Advances the hole by exactly one slot, relocating the page that would otherwise block the
/// advance. Invoked once per erased sector, before the sector's address is translated.
///
/// Cost per call: one page erase, `page_size / temp_buff_size` read+write pairs and two bitmap
/// marks. On wraparound additionally two state-range erases and two record writes.
pub(crate) fn rotate_once<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
    state: &mut StateRecord,
    scratch: &mut [u8],
) -> Result<(), Error> {
    let pos = state.pos;
    let next = if pos + 1 >= layout.max_pos { 0 } else { pos + 1 };

    #[cfg(feature = "defmt")]
    trace!("rotate: {} -> {}", pos, next);

    let hole_addr = layout.slot_addr(cfg, pos);
    let data_addr = layout.slot_addr(cfg, next);

    // The hole is empty by invariant, but erasing keeps the medium in the erased state the
    // relocation write below expects after an unclean shutdown.
    erase_raw(hal, cfg, hole_addr, cfg.page_size)?;

    let chunk = cfg.temp_buff_size;
    for i in 0..cfg.page_size / chunk {
        let offset = i * chunk;
        hal.read(data_addr + offset, &mut scratch[..chunk as usize])
            .map_err(|_| Error::FlashError)?;
        hal.write(hole_addr + offset, &scratch[..chunk as usize])
            .map_err(|_| Error::FlashError)?;
    }

    mark_used(hal, cfg, layout, layout.addr_state1, pos)?;
    mark_used(hal, cfg, layout, layout.addr_state2, pos)?;

    state.pos = next;
    if next == 0 {
        let mut move_count = state.move_count + 1;
        if move_count >= layout.max_pos - 1 {
            move_count = 0;
        }
        state.move_count = move_count;
        state.seal(T::crc32);

        #[cfg(feature = "debug-logs")]
        println!("  rotate: wraparound, persisting {:?}", state);

        persist_state(hal, cfg, layout, state)?;
    }
    Ok(())
}

/// Scans the bitmap of state copy 1 for the first slot still marked free; that slot is the live
/// hole. A fully marked bitmap means the crash happened right before the wraparound persist, so
/// the hole is the last slot; the stale marks are flushed by the next rotation rather than paying
/// for a repair on every boot.
pub(crate) fn recover_pos<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
    state: &mut StateRecord,
) -> Result<(), Error> {
    let mut entry = [0u8; RECORD_SIZE];
    let entry = &mut entry[..cfg.wr_size as usize];
    for slot in 0..layout.max_pos {
        hal.read(
            layout.bitmap_entry_addr(cfg, layout.addr_state1, slot),
            entry,
        )
        .map_err(|_| Error::FlashError)?;
        if entry[0] == FREE_MARK {
            state.pos = slot;
            return Ok(());
        }
    }
    state.pos = layout.max_pos - 1;
    Ok(())
}

/// First-time (or forced) initialization: hole at slot 0, no completed passes, both state copies
/// and the configuration record rewritten from scratch.
pub(crate) fn init_sections<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
) -> Result<StateRecord, Error> {
    let mut state = StateRecord::fresh(cfg, layout.max_pos);
    state.seal(T::crc32);

    #[cfg(feature = "debug-logs")]
    println!("  init_sections: {:?}", state);

    persist_state(hal, cfg, layout, &state)?;

    let mut record = ConfigRecord::from(cfg);
    record.seal(T::crc32);
    erase_raw(hal, cfg, layout.addr_cfg, layout.cfg_size)?;
    write_config(hal, layout.addr_cfg, &record)?;

    Ok(state)
}

/// Rebuilds the state copy at `dst_addr` from the canonical record and the bitmap stored at
/// `src_addr`: erase, rewrite the header, then propagate every bitmap entry that is not free.
fn repair_copy<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
    canonical: &StateRecord,
    src_addr: u32,
    dst_addr: u32,
) -> Result<(), Error> {
    erase_raw(hal, cfg, dst_addr, layout.state_size)?;
    write_state(hal, dst_addr, canonical)?;

    let mut entry = [0u8; RECORD_SIZE];
    let entry = &mut entry[..cfg.wr_size as usize];
    for slot in 0..layout.bitmap_entries {
        hal.read(layout.bitmap_entry_addr(cfg, src_addr, slot), entry)
            .map_err(|_| Error::FlashError)?;
        if entry.iter().any(|&b| b != FREE_MARK) {
            write_aligned(hal, layout.bitmap_entry_addr(cfg, dst_addr, slot), entry)
                .map_err(|_| Error::FlashError)?;
        }
    }
    Ok(())
}

/// Brings the persisted state to a consistent value at startup, tolerating an unclean shutdown
/// at any point of a rotation or persist. Returns the recovered state and which path was taken.
pub(crate) fn recover<T: Platform>(
    hal: &mut T,
    cfg: &WlConfig,
    layout: &Layout,
) -> Result<(StateRecord, Recovery), Error> {
    // The stored configuration is re-validated on every boot. A corrupt record or any field
    // drift against the caller's configuration (the schema version included) discards all
    // recovered state.
    let stored_cfg = read_config(hal, layout.addr_cfg)?;
    let mut reference = ConfigRecord::from(cfg);
    reference.seal(T::crc32);
    if !stored_cfg.is_valid(T::crc32) || stored_cfg.raw_bytes() != reference.raw_bytes() {
        let mut state = init_sections(hal, cfg, layout)?;
        recover_pos(hal, cfg, layout, &mut state)?;
        return Ok((state, Recovery::Initialized));
    }

    let state1 = read_state(hal, layout.addr_state1)?;
    let state2 = read_state(hal, layout.addr_state2)?;
    let valid1 = state1.is_valid(T::crc32);
    let valid2 = state2.is_valid(T::crc32);

    let (mut state, mut outcome) = match (valid1, valid2) {
        (true, true) => {
            let crc1 = state1.crc;
            let crc2 = state2.crc;
            if crc1 != crc2 {
                // A torn write mid-persist left copy 2 stale. Copy 1 is authoritative.
                repair_copy(hal, cfg, layout, &state1, layout.addr_state1, layout.addr_state2)?;
                (state1, Recovery::SyncedCopy2)
            } else {
                (state1, Recovery::Clean)
            }
        }
        (false, false) => {
            // Typically a blank device; both copies read as all ones.
            (init_sections(hal, cfg, layout)?, Recovery::Initialized)
        }
        (true, false) => {
            repair_copy(hal, cfg, layout, &state1, layout.addr_state1, layout.addr_state2)?;
            (state1, Recovery::RepairedCopy2)
        }
        (false, true) => {
            repair_copy(hal, cfg, layout, &state2, layout.addr_state2, layout.addr_state1)?;
            let mut state = read_state(hal, layout.addr_state1)?;
            // Copy 1 is the side written first during a persist, so its loss means the crash hit
            // mid-wraparound: place the hole on the last slot until the bitmap says otherwise.
            state.pos = layout.max_pos - 1;
            (state, Recovery::RepairedCopy1)
        }
    };

    let version = state.version;
    if version != cfg.version {
        state = init_sections(hal, cfg, layout)?;
        outcome = Recovery::Initialized;
    }

    recover_pos(hal, cfg, layout, &mut state)?;

    #[cfg(feature = "debug-logs")]
    println!("  recover: {} {:?}", outcome, state);

    #[cfg(feature = "defmt")]
    {
        let pos = state.pos;
        let move_count = state.move_count;
        trace!("recover: pos {} move_count {}", pos, move_count);
    }

    Ok((state, outcome))
}

#[cfg(test)]
mod tests {
    use super::calc_physical;

    const PAGE: u32 = 4096;

    #[test]
    fn translation_is_injective_and_skips_the_hole() {
        let capacity = 20 * PAGE;
        for pos in [0, 1, 7, 20] {
            for move_count in [0, 1, 19] {
                let hole = pos * PAGE;
                let mut seen = std::collections::HashSet::new();
                for page in 0..capacity / PAGE {
                    let physical = calc_physical(capacity, PAGE, pos, move_count, page * PAGE);
                    assert!(physical.is_multiple_of(PAGE));
                    assert!(physical < capacity + PAGE);
                    assert_ne!(physical, hole, "pos {pos} mc {move_count} page {page}");
                    assert!(seen.insert(physical), "pos {pos} mc {move_count} page {page}");
                }
            }
        }
    }

    #[test]
    fn translation_preserves_offsets_within_a_page() {
        let capacity = 20 * PAGE;
        let base = calc_physical(capacity, PAGE, 3, 5, 8 * PAGE);
        assert_eq!(calc_physical(capacity, PAGE, 3, 5, 8 * PAGE + 17), base + 17);
    }

    #[test]
    fn translation_rotates_with_move_count() {
        let capacity = 4 * PAGE;
        // one completed pass shifts every logical page back by one slot
        assert_eq!(calc_physical(capacity, PAGE, 0, 1, 0), 3 * PAGE + PAGE);
        assert_eq!(calc_physical(capacity, PAGE, 0, 1, PAGE), PAGE);
    }
}
