//! Per-slot index save layout.
//!
//! A save slot is a sub-region of the top-level layout holding one atomic
//! checkpoint: a header block, the index page map, one volume-index region
//! per zone, the open chapter, and trailing scratch space. Slots rotate
//! round-robin: the oldest is invalidated on disk, re-carved for the running
//! zone count, written, and only then committed by rewriting its header.

use crate::codec::Buffer;
use crate::error::{LayoutError, Result};
use crate::io::BufferedReader;
use crate::nonce::secondary_nonce;
use crate::region::{
    LayoutRegion, RegionHeader, RegionIterator, RegionKind, RegionTable, RegionType,
    SOLE_INSTANCE,
};
use crate::superblock::SuperBlockData;
use std::time::{SystemTime, UNIX_EPOCH};

/// Cap on the opaque index state carried in a save slot header.
pub const INDEX_STATE_BUFFER_SIZE: usize = 512;

/// Encoded size of the index save data record.
pub const INDEX_SAVE_DATA_SIZE: usize = 24;

/// Upper bound on simultaneously persisted zones.
pub const MAX_ZONES: usize = 16;

pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Whether a slot holds a committed save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSaveType {
    Save,
    NoSave,
}

/// The stamp written into a slot header: generation timestamp, binding
/// nonce, and record version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSaveData {
    pub timestamp_ms: u64,
    pub nonce: u64,
    pub version: u32,
}

impl IndexSaveData {
    pub fn encode(&self, buffer: &mut Buffer) {
        buffer.put_u64_le(self.timestamp_ms);
        buffer.put_u64_le(self.nonce);
        buffer.put_u32_le(self.version);
        buffer.put_zeros(4);
    }

    pub fn decode(buffer: &mut Buffer) -> Result<IndexSaveData> {
        let timestamp_ms = buffer.get_u64_le()?;
        let nonce = buffer.get_u64_le()?;
        let version = buffer.get_u32_le()?;
        buffer.skip(4)?;
        buffer.expect_consumed("index save data")?;
        Ok(IndexSaveData {
            timestamp_ms,
            nonce,
            version,
        })
    }
}

/// The nonce binding a save to its volume: the save data (nonce field forced
/// to zero) plus the slot's start block, hashed off the sub-index nonce.
pub fn generate_save_nonce(
    volume_nonce: u64,
    save_data: IndexSaveData,
    start_block: u64,
) -> u64 {
    let mut buffer = Buffer::with_capacity(INDEX_SAVE_DATA_SIZE + 8);
    buffer.put_u64_le(save_data.timestamp_ms);
    buffer.put_u64_le(0);
    buffer.put_u32_le(save_data.version);
    buffer.put_zeros(4);
    buffer.put_u64_le(start_block);
    secondary_nonce(volume_nonce, buffer.contents())
}

/// In-memory picture of one save slot.
#[derive(Debug, Clone)]
pub struct IndexSaveLayout {
    /// The whole slot within the sub-index.
    pub index_save: LayoutRegion,
    pub header: LayoutRegion,
    pub num_zones: u32,
    pub index_page_map: LayoutRegion,
    pub free_space: LayoutRegion,
    pub volume_index_zones: Vec<LayoutRegion>,
    pub open_chapter: Option<LayoutRegion>,
    pub save_type: IndexSaveType,
    pub save_data: IndexSaveData,
    /// Opaque index state held while a save is in flight or after a load.
    pub state_buffer: Option<Buffer>,
    pub read: bool,
    pub written: bool,
}

impl IndexSaveLayout {
    /// Carve a fresh, unsaved slot: header, index page map, and scratch
    /// covering the remainder. `next_block` advances past the slot.
    pub fn fresh(
        next_block: &mut u64,
        save_blocks: u64,
        page_map_blocks: u64,
        instance: u16,
    ) -> IndexSaveLayout {
        let mut slot_end = *next_block;
        let index_save =
            LayoutRegion::carve(&mut slot_end, save_blocks, RegionKind::Save, instance);
        let header = LayoutRegion::carve(next_block, 1, RegionKind::Header, SOLE_INSTANCE);
        let index_page_map = LayoutRegion::carve(
            next_block,
            page_map_blocks,
            RegionKind::IndexPageMap,
            SOLE_INSTANCE,
        );
        let remaining = slot_end - *next_block;
        let free_space =
            LayoutRegion::carve(next_block, remaining, RegionKind::Scratch, SOLE_INSTANCE);

        IndexSaveLayout {
            index_save,
            header,
            num_zones: 0,
            index_page_map,
            free_space,
            volume_index_zones: Vec::new(),
            open_chapter: None,
            save_type: IndexSaveType::NoSave,
            save_data: IndexSaveData::default(),
            state_buffer: None,
            read: false,
            written: false,
        }
    }

    /// Re-carve the slot interior for `num_zones` zones. The open chapter is
    /// only present for a real save; zone count and open-chapter presence
    /// are save-time parameters.
    pub fn populate(
        &mut self,
        super_block: &SuperBlockData,
        num_zones: u32,
        save_type: IndexSaveType,
    ) {
        let mut next = self.index_save.start_block;
        self.header = LayoutRegion::carve(&mut next, 1, RegionKind::Header, SOLE_INSTANCE);
        self.index_page_map = LayoutRegion::carve(
            &mut next,
            super_block.page_map_blocks,
            RegionKind::IndexPageMap,
            SOLE_INSTANCE,
        );

        let blocks_avail = self.index_save.num_blocks
            - (next - self.index_save.start_block)
            - super_block.open_chapter_blocks;

        self.volume_index_zones.clear();
        if num_zones > 0 {
            let zone_blocks = blocks_avail / u64::from(num_zones);
            for zone in 0..num_zones {
                self.volume_index_zones.push(LayoutRegion::carve(
                    &mut next,
                    zone_blocks,
                    RegionKind::VolumeIndex,
                    zone as u16,
                ));
            }
        }
        self.num_zones = num_zones;

        self.open_chapter = if save_type == IndexSaveType::Save {
            Some(LayoutRegion::carve(
                &mut next,
                super_block.open_chapter_blocks,
                RegionKind::OpenChapter,
                SOLE_INSTANCE,
            ))
        } else {
            None
        };

        let remaining = self.index_save.num_blocks - (next - self.index_save.start_block);
        self.free_space =
            LayoutRegion::carve(&mut next, remaining, RegionKind::Scratch, SOLE_INSTANCE);
    }

    /// Rebuild the slot's sub-regions from its on-disk region table.
    ///
    /// An empty table, or one holding nothing but scratch, is a fresh or
    /// unreadable slot: it is repopulated with zero zones so a later save
    /// can instantiate it.
    pub fn reconstruct(
        &mut self,
        save_data: IndexSaveData,
        table: &RegionTable,
        super_block: &SuperBlockData,
    ) -> Result<()> {
        self.num_zones = 0;
        self.save_data = save_data;
        self.read = false;
        self.written = false;
        self.save_type = if table.header.region_type == RegionType::Save {
            IndexSaveType::Save
        } else {
            IndexSaveType::NoSave
        };

        if table.regions.is_empty()
            || (table.regions.len() == 1 && table.regions[0].kind == RegionKind::Scratch)
        {
            self.populate(super_block, 0, IndexSaveType::NoSave);
            return Ok(());
        }

        let mut iter = RegionIterator::new(&table.regions, self.index_save.start_block);

        let header = iter.expect(true, 1, RegionKind::Header, SOLE_INSTANCE);
        let index_page_map = iter.expect(true, 0, RegionKind::IndexPageMap, SOLE_INSTANCE);

        let mut num_zones = 0u32;
        let mut probe = iter.clone();
        while probe
            .expect(false, 0, RegionKind::VolumeIndex, num_zones as u16)
            .is_some()
        {
            num_zones += 1;
        }

        self.volume_index_zones.clear();
        for zone in 0..num_zones {
            if let Some(region) = iter.expect(true, 0, RegionKind::VolumeIndex, zone as u16) {
                self.volume_index_zones.push(region);
            }
        }
        self.num_zones = num_zones;

        self.open_chapter = if self.save_type == IndexSaveType::Save {
            iter.expect(true, 0, RegionKind::OpenChapter, SOLE_INSTANCE)
        } else {
            None
        };

        match iter.expect(false, 0, RegionKind::Scratch, SOLE_INSTANCE) {
            Some(region) => self.free_space = region,
            None => {
                // A missing scratch region is synthesized from the residual.
                let slot_end = self.index_save.start_block + self.index_save.num_blocks;
                self.free_space = LayoutRegion {
                    start_block: iter.next_block(),
                    num_blocks: slot_end - iter.next_block(),
                    checksum: 0,
                    kind: RegionKind::Scratch,
                    instance: SOLE_INSTANCE,
                };
                iter.set_next_block(slot_end);
            }
        }

        if let Some(region) = header {
            self.header = region;
        }
        if let Some(region) = index_page_map {
            self.index_page_map = region;
        }

        let leftover = iter.regions_left();
        let next_block = iter.next_block();
        iter.finish()?;
        if leftover != 0 {
            return Err(LayoutError::UnexpectedResult(format!(
                "expected {leftover} additional regions"
            )));
        }
        if next_block != self.index_save.start_block + self.index_save.num_blocks {
            return Err(LayoutError::UnexpectedResult(
                "index save layout table incomplete".into(),
            ));
        }
        Ok(())
    }

    /// Re-carve the slot for a new save and stamp it with a fresh
    /// generation timestamp and nonce.
    pub fn instantiate(
        &mut self,
        super_block: &SuperBlockData,
        volume_nonce: u64,
        num_zones: u32,
    ) {
        self.populate(super_block, num_zones, IndexSaveType::Save);
        self.state_buffer = Some(Buffer::with_capacity(INDEX_STATE_BUFFER_SIZE));
        self.read = false;
        self.written = false;
        self.save_type = IndexSaveType::Save;
        self.save_data = IndexSaveData {
            timestamp_ms: current_time_ms(),
            nonce: 0,
            version: 1,
        };
        self.save_data.nonce =
            generate_save_nonce(volume_nonce, self.save_data, self.index_save.start_block);
    }

    /// Abandon an in-flight save: zero the in-memory stamp and drop the
    /// state buffer. The on-disk slot was already invalidated before any
    /// write began, so the disk is not touched.
    pub fn cancel(&mut self) {
        self.save_data = IndexSaveData::default();
        self.read = false;
        self.written = false;
        self.save_type = IndexSaveType::NoSave;
        self.num_zones = 0;
        self.volume_index_zones.clear();
        self.state_buffer = None;
    }

    /// Check that this slot holds a complete, correctly stamped save and
    /// return its timestamp.
    pub fn validate(&self, volume_nonce: u64) -> Result<u64> {
        if self.save_type != IndexSaveType::Save
            || self.num_zones == 0
            || self.save_data.timestamp_ms == 0
        {
            return Err(LayoutError::BadState(
                "save slot holds no complete save".into(),
            ));
        }
        let expected =
            generate_save_nonce(volume_nonce, self.save_data, self.index_save.start_block);
        if self.save_data.nonce != expected {
            return Err(LayoutError::BadState("save slot nonce mismatch".into()));
        }
        Ok(self.save_data.timestamp_ms)
    }

    /// Build the region table for this slot's header block.
    pub fn make_region_table(&self) -> RegionTable {
        let mut regions = Vec::with_capacity(4 + self.volume_index_zones.len());
        regions.push(self.header);
        regions.push(self.index_page_map);
        regions.extend(self.volume_index_zones.iter().copied());
        if let Some(open_chapter) = self.open_chapter {
            regions.push(open_chapter);
        }
        if self.free_space.num_blocks > 0 {
            regions.push(self.free_space);
        }

        let payload = INDEX_SAVE_DATA_SIZE
            + self
                .state_buffer
                .as_ref()
                .map(|buffer| buffer.len())
                .unwrap_or(0);

        RegionTable {
            header: RegionHeader {
                region_blocks: self.index_save.num_blocks,
                region_type: match self.save_type {
                    IndexSaveType::Save => RegionType::Save,
                    IndexSaveType::NoSave => RegionType::Unsaved,
                },
                version: 1,
                num_regions: regions.len() as u16,
                payload: payload as u16,
            },
            regions,
        }
    }
}

/// Decode the save data and optional state buffer that follow a slot's
/// region table.
pub fn read_index_save_data(
    reader: &mut BufferedReader,
    saved_size: usize,
) -> Result<(IndexSaveData, Option<Buffer>)> {
    if saved_size == 0 {
        return Ok((IndexSaveData::default(), None));
    }
    if saved_size < INDEX_SAVE_DATA_SIZE {
        return Err(LayoutError::CorruptData(format!(
            "unexpected index save data size {saved_size}"
        )));
    }

    let mut buffer = Buffer::for_decoding(reader.read_vec(INDEX_SAVE_DATA_SIZE)?);
    let save_data = IndexSaveData::decode(&mut buffer)?;

    if save_data.version > 1 {
        return Err(LayoutError::UnsupportedVersion(format!(
            "unknown index save version number {}",
            save_data.version
        )));
    }

    let state_size = saved_size - INDEX_SAVE_DATA_SIZE;
    if state_size > INDEX_STATE_BUFFER_SIZE {
        return Err(LayoutError::CorruptData(format!(
            "unexpected index state buffer size {state_size}"
        )));
    }

    let state_buffer = if save_data.version != 0 {
        Some(Buffer::for_decoding(reader.read_vec(state_size)?))
    } else {
        None
    };
    Ok((save_data, state_buffer))
}

/// Pick the slot to overwrite next: smallest valid timestamp, with invalid
/// slots counting as timestamp 0. Ties go to the first slot in array order.
pub fn select_oldest(saves: &[IndexSaveLayout], volume_nonce: u64) -> Result<usize> {
    let mut oldest = None;
    let mut oldest_time = 0;
    for (slot, save) in saves.iter().enumerate() {
        let save_time = save.validate(volume_nonce).unwrap_or(0);
        if oldest.is_none() || save_time < oldest_time {
            oldest = Some(slot);
            oldest_time = save_time;
        }
    }
    oldest.ok_or_else(|| LayoutError::UnexpectedResult("no oldest or free save slot".into()))
}

/// Pick the newest valid save, or report that the index was not saved
/// cleanly.
pub fn select_latest(saves: &[IndexSaveLayout], volume_nonce: u64) -> Result<usize> {
    let mut latest = None;
    let mut latest_time = 0;
    for (slot, save) in saves.iter().enumerate() {
        let save_time = match save.validate(volume_nonce) {
            Ok(time) => time,
            Err(_) => continue,
        };
        if save_time > latest_time {
            latest = Some(slot);
            latest_time = save_time;
        }
    }
    match latest {
        Some(slot) => Ok(slot),
        None => {
            tracing::error!("no valid index save found");
            Err(LayoutError::IndexNotSavedCleanly)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BLOCK_SIZE;

    fn small_super() -> SuperBlockData {
        let mut super_block = SuperBlockData::generate(BLOCK_SIZE as u32, 2, 1, 1);
        super_block.open_chapter_blocks = 1;
        super_block.page_map_blocks = 1;
        super_block
    }

    fn slot_at(start: u64, save_blocks: u64) -> IndexSaveLayout {
        let mut next = start;
        let slot = IndexSaveLayout::fresh(&mut next, save_blocks, 1, 0);
        assert_eq!(next, start + save_blocks);
        slot
    }

    #[test]
    fn fresh_slot_is_header_map_scratch() {
        let slot = slot_at(10, 8);
        assert_eq!(slot.index_save.start_block, 10);
        assert_eq!(slot.header.start_block, 10);
        assert_eq!(slot.header.num_blocks, 1);
        assert_eq!(slot.index_page_map.start_block, 11);
        assert_eq!(slot.free_space.start_block, 12);
        assert_eq!(slot.free_space.num_blocks, 6);
        assert_eq!(slot.save_type, IndexSaveType::NoSave);
    }

    #[test]
    fn populate_carves_zones_and_open_chapter() {
        let super_block = small_super();
        let mut slot = slot_at(0, 9);
        slot.populate(&super_block, 3, IndexSaveType::Save);

        // header(1) + page map(1) + 3 zones of (9-2-1)/3 = 2 + open chapter(1) + scratch
        assert_eq!(slot.volume_index_zones.len(), 3);
        for (zone, region) in slot.volume_index_zones.iter().enumerate() {
            assert_eq!(region.num_blocks, 2);
            assert_eq!(region.instance, zone as u16);
        }
        let open_chapter = slot.open_chapter.unwrap();
        assert_eq!(open_chapter.start_block, 8);
        assert_eq!(slot.free_space.num_blocks, 0);
    }

    #[test]
    fn instantiate_stamps_a_valid_save() {
        let super_block = small_super();
        let volume_nonce = 0x1234_5678_9ABC_DEF0;
        let mut slot = slot_at(3, 9);

        assert!(slot.validate(volume_nonce).is_err());
        slot.instantiate(&super_block, volume_nonce, 1);
        let timestamp = slot.validate(volume_nonce).unwrap();
        assert_ne!(timestamp, 0);
    }

    #[test]
    fn cancel_reverts_to_bad_state() {
        let super_block = small_super();
        let mut slot = slot_at(3, 9);
        slot.instantiate(&super_block, 7, 1);
        slot.cancel();
        assert!(matches!(slot.validate(7), Err(LayoutError::BadState(_))));
        assert!(slot.state_buffer.is_none());
    }

    #[test]
    fn nonce_binds_slot_position() {
        let super_block = small_super();
        let mut slot = slot_at(3, 9);
        slot.instantiate(&super_block, 7, 1);
        // Pretend the same stamp appeared in a different slot.
        slot.index_save.start_block += 9;
        assert!(matches!(slot.validate(7), Err(LayoutError::BadState(_))));
    }

    #[test]
    fn reconstruct_round_trips_a_save() {
        let super_block = small_super();
        let mut slot = slot_at(5, 9);
        slot.instantiate(&super_block, 99, 2);
        let table = slot.make_region_table();

        let mut rebuilt = slot_at(5, 9);
        rebuilt
            .reconstruct(slot.save_data, &table, &super_block)
            .unwrap();
        assert_eq!(rebuilt.num_zones, 2);
        assert_eq!(rebuilt.save_type, IndexSaveType::Save);
        assert_eq!(rebuilt.volume_index_zones, slot.volume_index_zones);
        assert_eq!(rebuilt.open_chapter, slot.open_chapter);
        assert!(rebuilt.validate(99).is_ok());
    }

    #[test]
    fn reconstruct_scratch_only_is_fresh() {
        let super_block = small_super();
        let slot = slot_at(5, 9);
        let mut table = slot.make_region_table();
        table.regions = vec![LayoutRegion {
            start_block: 5,
            num_blocks: 9,
            checksum: 0,
            kind: RegionKind::Scratch,
            instance: SOLE_INSTANCE,
        }];

        let mut rebuilt = slot_at(5, 9);
        rebuilt
            .reconstruct(IndexSaveData::default(), &table, &super_block)
            .unwrap();
        assert_eq!(rebuilt.num_zones, 0);
        assert!(rebuilt.validate(99).is_err());
    }

    #[test]
    fn reconstruct_rejects_misplaced_region() {
        let super_block = small_super();
        let mut slot = slot_at(5, 9);
        slot.instantiate(&super_block, 99, 1);
        let mut table = slot.make_region_table();
        table.regions[1].start_block += 1;

        let mut rebuilt = slot_at(5, 9);
        assert!(matches!(
            rebuilt.reconstruct(slot.save_data, &table, &super_block),
            Err(LayoutError::UnexpectedResult(_))
        ));
    }

    #[test]
    fn reconstruct_synthesizes_missing_scratch() {
        let super_block = small_super();
        let mut slot = slot_at(5, 9);
        slot.instantiate(&super_block, 1, 1);
        let mut table = slot.make_region_table();
        // Drop the trailing scratch descriptor; populate left zone blocks
        // rounded down, so scratch may be non-empty.
        if table.regions.last().map(|r| r.kind) == Some(RegionKind::Scratch) {
            table.regions.pop();
            table.header.num_regions -= 1;
        }

        let mut rebuilt = slot_at(5, 9);
        rebuilt
            .reconstruct(slot.save_data, &table, &super_block)
            .unwrap();
        assert_eq!(rebuilt.free_space.kind, RegionKind::Scratch);
        assert_eq!(
            rebuilt.free_space.start_block + rebuilt.free_space.num_blocks,
            5 + 9
        );
    }

    #[test]
    fn oldest_prefers_invalid_then_array_order() {
        let super_block = small_super();
        let volume_nonce = 4242;
        let mut first = slot_at(0, 9);
        let mut second = slot_at(9, 9);

        // Both invalid: first in array order wins.
        assert_eq!(
            select_oldest(&[first.clone(), second.clone()], volume_nonce).unwrap(),
            0
        );

        // A valid slot loses to an invalid one.
        first.instantiate(&super_block, volume_nonce, 1);
        assert_eq!(
            select_oldest(&[first.clone(), second.clone()], volume_nonce).unwrap(),
            1
        );

        // Both valid: the smaller timestamp wins.
        second.instantiate(&super_block, volume_nonce, 1);
        second.save_data.timestamp_ms = first.save_data.timestamp_ms + 10;
        second.save_data.nonce =
            generate_save_nonce(volume_nonce, second.save_data, second.index_save.start_block);
        assert_eq!(select_oldest(&[first, second], volume_nonce).unwrap(), 0);
    }

    #[test]
    fn latest_requires_a_valid_save() {
        let super_block = small_super();
        let volume_nonce = 4242;
        let mut first = slot_at(0, 9);
        let second = slot_at(9, 9);

        assert!(matches!(
            select_latest(&[first.clone(), second.clone()], volume_nonce),
            Err(LayoutError::IndexNotSavedCleanly)
        ));

        first.instantiate(&super_block, volume_nonce, 1);
        assert_eq!(select_latest(&[first, second], volume_nonce).unwrap(), 0);
    }

    #[test]
    fn save_data_encoding_is_24_bytes() {
        let save_data = IndexSaveData {
            timestamp_ms: 1,
            nonce: 2,
            version: 1,
        };
        let mut buffer = Buffer::new();
        save_data.encode(&mut buffer);
        assert_eq!(buffer.len(), INDEX_SAVE_DATA_SIZE);

        let mut decoder = Buffer::for_decoding(buffer.into_vec());
        assert_eq!(IndexSaveData::decode(&mut decoder).unwrap(), save_data);
    }
}
