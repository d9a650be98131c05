//! Top-level on-disk layout engine.
//!
//! The layout carves a backing store into a fixed, versioned arrangement of
//! regions and persists a self-describing superblock so the arrangement can
//! be reconstructed on later opens:
//!
//! ```text
//! +-+-+--------+--------+--------+-- --+-+
//! | | |      S U B - I N D E X        | |
//! |H|C+--------+--------+--------+-- --+S|
//! |D|f| Volume | Save   | Save   |     |e|
//! |R|g| Region | Slot 0 | Slot 1 | ... |a|
//! | | |        |        |        |     |l|
//! +-+-+--------+--------+--------+-- --+-+
//! ```
//!
//! There are at least two save slots so the previous state survives an
//! incomplete save; they are used round-robin. Each save slot is itself a
//! compound region carrying its own region table (see [`crate::save`]).

use crate::codec::Buffer;
use crate::config::IndexConfig;
use crate::error::{LayoutError, Result};
use crate::index::Index;
use crate::io::{BufferedReader, BufferedWriter, FileAccess, IoFactory, BLOCK_SIZE};
use crate::nonce::secondary_nonce;
use crate::open_chapter::OpenChapter;
use crate::page_map::IndexPageMap;
use crate::region::{
    LayoutRegion, RegionHeader, RegionIterator, RegionKind, RegionTable, RegionType,
    SOLE_INSTANCE,
};
use crate::save::{
    read_index_save_data, select_latest, select_oldest, IndexSaveData, IndexSaveLayout,
    IndexSaveType, INDEX_STATE_BUFFER_SIZE,
};
use crate::superblock::SuperBlockData;
use crate::volume_index::VolumeIndex;

/// Save slots created per sub-index.
const NUM_SAVES: u16 = 2;

/// Version tag at the head of every index state buffer.
const INDEX_STATE_SIGNATURE: i32 = -1;
const INDEX_STATE_VERSION_ID: i32 = 301;

/// The block counts a layout is carved from; all derived from the
/// configuration, deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveLayoutSizes {
    pub num_saves: u16,
    pub volume_blocks: u64,
    pub volume_index_blocks: u64,
    pub page_map_blocks: u64,
    pub open_chapter_blocks: u64,
    pub save_blocks: u64,
    pub sub_index_blocks: u64,
    pub total_blocks: u64,
    pub total_size: u64,
}

pub fn compute_sizes(config: &IndexConfig) -> Result<SaveLayoutSizes> {
    let geometry = &config.geometry;
    if geometry.bytes_per_page % BLOCK_SIZE != 0 {
        return Err(LayoutError::IncorrectAlignment);
    }

    let volume_blocks = geometry.bytes_per_volume / BLOCK_SIZE;
    let volume_index_blocks = VolumeIndex::save_blocks(config, BLOCK_SIZE);
    let page_map_blocks = IndexPageMap::saved_size(geometry).div_ceil(BLOCK_SIZE);
    let open_chapter_blocks = OpenChapter::saved_size(geometry).div_ceil(BLOCK_SIZE);
    let save_blocks = 1 + volume_index_blocks + page_map_blocks + open_chapter_blocks;
    let sub_index_blocks = volume_blocks + u64::from(NUM_SAVES) * save_blocks;
    // Header, config, and seal blocks surround the sub-index.
    let total_blocks = 3 + sub_index_blocks;

    Ok(SaveLayoutSizes {
        num_saves: NUM_SAVES,
        volume_blocks,
        volume_index_blocks,
        page_map_blocks,
        open_chapter_blocks,
        save_blocks,
        sub_index_blocks,
        total_blocks,
        total_size: total_blocks * BLOCK_SIZE,
    })
}

/// The single sub-index held within the layout.
#[derive(Debug, Clone)]
struct SubIndexLayout {
    sub_index: LayoutRegion,
    /// Nonce chained off the superblock nonce; binds saves to this volume.
    nonce: u64,
    volume: LayoutRegion,
    saves: Vec<IndexSaveLayout>,
}

fn define_sub_index_nonce(super_nonce: u64, start_block: u64, index_id: u16) -> u64 {
    let mut buffer = Buffer::with_capacity(10);
    buffer.put_u64_le(start_block);
    buffer.put_u16_le(index_id);
    let nonce = secondary_nonce(super_nonce, buffer.contents());
    if nonce == 0 {
        // Never hand out a zero sub-index nonce; rehash off the negated base.
        return secondary_nonce(super_nonce.wrapping_neg(), buffer.contents());
    }
    nonce
}

/// A save slot known only by its outer region, before its own table has
/// been read.
fn unread_slot(index_save: LayoutRegion) -> IndexSaveLayout {
    let placeholder = LayoutRegion {
        start_block: index_save.start_block,
        num_blocks: 0,
        checksum: 0,
        kind: RegionKind::Scratch,
        instance: SOLE_INSTANCE,
    };
    IndexSaveLayout {
        index_save,
        header: LayoutRegion {
            kind: RegionKind::Header,
            ..placeholder
        },
        num_zones: 0,
        index_page_map: LayoutRegion {
            kind: RegionKind::IndexPageMap,
            ..placeholder
        },
        free_space: placeholder,
        volume_index_zones: Vec::new(),
        open_chapter: None,
        save_type: IndexSaveType::NoSave,
        save_data: IndexSaveData::default(),
        state_buffer: None,
        read: false,
        written: false,
    }
}

/// An open index layout: the superblock, the region map, and the save-slot
/// ring. Dropping the layout releases the backing-store handle.
pub struct IndexLayout {
    factory: IoFactory,
    factory_size: u64,
    /// Byte offset of the layout within the store.
    offset: u64,
    super_block: SuperBlockData,
    header: LayoutRegion,
    config_region: LayoutRegion,
    index: SubIndexLayout,
    seal: LayoutRegion,
    total_blocks: u64,
}

impl IndexLayout {
    /// Total bytes a layout for `config` occupies.
    pub fn compute_size(config: &IndexConfig) -> Result<u64> {
        Ok(compute_sizes(config)?.total_size)
    }

    /// Format a backing store with a brand-new layout.
    pub fn create(config: &IndexConfig) -> Result<IndexLayout> {
        let sizes = compute_sizes(config)?;
        let (factory, factory_size) =
            Self::open_layout_factory(config, FileAccess::CreateReadWrite, &sizes)?;

        let super_block = SuperBlockData::generate(
            BLOCK_SIZE as u32,
            sizes.num_saves,
            sizes.open_chapter_blocks,
            sizes.page_map_blocks,
        );

        let mut next_block = config.offset / BLOCK_SIZE;
        let header =
            LayoutRegion::carve(&mut next_block, 1, RegionKind::Header, SOLE_INSTANCE);
        let config_region =
            LayoutRegion::carve(&mut next_block, 1, RegionKind::Config, SOLE_INSTANCE);

        let mut sub_index_end = next_block;
        let sub_index = LayoutRegion::carve(
            &mut sub_index_end,
            sizes.sub_index_blocks,
            RegionKind::Index,
            0,
        );
        let volume = LayoutRegion::carve(
            &mut next_block,
            sizes.volume_blocks,
            RegionKind::Volume,
            SOLE_INSTANCE,
        );
        let mut saves = Vec::with_capacity(usize::from(sizes.num_saves));
        for instance in 0..sizes.num_saves {
            saves.push(IndexSaveLayout::fresh(
                &mut next_block,
                sizes.save_blocks,
                sizes.page_map_blocks,
                instance,
            ));
        }
        if sub_index_end != next_block {
            return Err(LayoutError::UnexpectedResult(
                "sub index layout regions don't agree".into(),
            ));
        }
        let nonce = define_sub_index_nonce(super_block.nonce, sub_index.start_block, 0);
        let seal = LayoutRegion::carve(&mut next_block, 1, RegionKind::Seal, SOLE_INSTANCE);
        if next_block * BLOCK_SIZE > config.offset + sizes.total_size {
            return Err(LayoutError::UnexpectedResult(
                "layout does not fit as expected".into(),
            ));
        }

        let mut layout = IndexLayout {
            factory,
            factory_size,
            offset: config.offset,
            super_block,
            header,
            config_region,
            index: SubIndexLayout {
                sub_index,
                nonce,
                volume,
                saves,
            },
            seal,
            total_blocks: sizes.total_blocks,
        };

        // Write the save-slot skeletons, then the top-level header, then the
        // configuration payload.
        for slot in 0..layout.index.saves.len() {
            layout
                .write_index_save_layout(slot)
                .map_err(|e| e.context(&format!("unable to format save {slot} layout")))?;
        }
        layout.save_single_file_layout(0)?;
        layout.write_config(config, 0)?;
        Ok(layout)
    }

    /// Reconstruct a layout from a previously formatted backing store and
    /// verify it against the requested configuration.
    pub fn open(config: &IndexConfig) -> Result<IndexLayout> {
        let sizes = compute_sizes(config)?;
        let (factory, factory_size) =
            Self::open_layout_factory(config, FileAccess::ReadWrite, &sizes)?;

        let mut reader = factory
            .buffered_reader(config.offset, BLOCK_SIZE)
            .map_err(|e| e.context("unable to read superblock"))?;
        let table = RegionTable::load(&mut reader)?;
        if table.header.region_type != RegionType::Super {
            return Err(LayoutError::CorruptData(
                "not a superblock region table".into(),
            ));
        }

        let mut payload = Buffer::for_decoding(
            reader
                .read_vec(usize::from(table.header.payload))
                .map_err(|e| e.context("cannot read superblock data"))?,
        );
        let super_block = SuperBlockData::decode(&mut payload)
            .map_err(|e| e.context("unknown superblock format"))?;
        super_block.validate(BLOCK_SIZE as u32)?;

        let adjustment = super_block.volume_offset - super_block.start_offset;
        let first_block = (config.offset / BLOCK_SIZE)
            .checked_sub(adjustment)
            .ok_or_else(|| {
                LayoutError::CorruptData(
                    "layout offset smaller than conversion adjustment".into(),
                )
            })?;

        let mut layout =
            Self::reconstitute(factory, factory_size, config, super_block, &table, first_block)?;
        layout.load_sub_index_regions()?;
        layout.verify_config(config)?;
        Ok(layout)
    }

    fn open_layout_factory(
        config: &IndexConfig,
        access: FileAccess,
        sizes: &SaveLayoutSizes,
    ) -> Result<(IoFactory, u64)> {
        let factory = IoFactory::open(&config.name, access)?;
        let writable_size = factory.writable_size()?;
        if writable_size < config.size + config.offset {
            return Err(LayoutError::NoSpace {
                available: writable_size,
                required: config.size + config.offset,
            });
        }
        let factory_size = if config.size > 0 {
            config.size
        } else {
            writable_size
        };
        if factory_size < sizes.total_size {
            return Err(LayoutError::NoSpace {
                available: factory_size,
                required: sizes.total_size,
            });
        }
        Ok((factory, factory_size))
    }

    /// Rebuild the region map from the decoded top-level table, enforcing
    /// kind, instance, position, and span along the way.
    fn reconstitute(
        factory: IoFactory,
        factory_size: u64,
        config: &IndexConfig,
        super_block: SuperBlockData,
        table: &RegionTable,
        first_block: u64,
    ) -> Result<IndexLayout> {
        let total_blocks = table.header.region_blocks;
        let mut iter = RegionIterator::new(&table.regions, first_block);

        let header = iter.expect(true, 1, RegionKind::Header, SOLE_INSTANCE);
        let config_region = iter.expect(true, 1, RegionKind::Config, SOLE_INSTANCE);

        // The sub-index spans the volume and the saves; walk it twice, once
        // as a whole and once by member.
        let sub_index_start = iter.next_block();
        let sub_index = iter.expect(true, 0, RegionKind::Index, 0);
        let mut sub_index_end = iter.next_block();
        iter.set_next_block(sub_index_start);

        let volume = iter.expect(true, 0, RegionKind::Volume, SOLE_INSTANCE);
        // A converted volume was shrunk in place; the saves sit past the
        // original volume extent.
        iter.set_next_block(iter.next_block() + super_block.volume_offset);
        sub_index_end += super_block.volume_offset;

        let mut saves = Vec::with_capacity(usize::from(super_block.max_saves));
        for instance in 0..super_block.max_saves {
            if let Some(region) = iter.expect(true, 0, RegionKind::Save, instance) {
                saves.push(unread_slot(region));
            }
        }
        if !iter.has_error() && iter.next_block() != sub_index_end {
            iter.record_error("sub index region does not span all saves".into());
        }

        let seal = iter.expect(true, 1, RegionKind::Seal, SOLE_INSTANCE);

        let next_block = iter.next_block();
        iter.finish()?;
        if next_block - super_block.volume_offset != first_block + total_blocks {
            return Err(LayoutError::UnexpectedResult(
                "layout table does not span total blocks".into(),
            ));
        }

        // finish() returned Ok, so every required expect succeeded.
        let (header, config_region, sub_index, volume, seal) = match
            (header, config_region, sub_index, volume, seal)
        {
            (Some(h), Some(c), Some(si), Some(v), Some(s)) => (h, c, si, v, s),
            _ => {
                return Err(LayoutError::UnexpectedResult(
                    "region table is missing required regions".into(),
                ))
            }
        };

        let nonce = define_sub_index_nonce(super_block.nonce, sub_index.start_block, 0);
        Ok(IndexLayout {
            factory,
            factory_size,
            offset: config.offset,
            super_block,
            header,
            config_region,
            index: SubIndexLayout {
                sub_index,
                nonce,
                volume,
                saves,
            },
            seal,
            total_blocks,
        })
    }

    /// Read every save slot's own region table and rebuild its sub-layout.
    fn load_sub_index_regions(&mut self) -> Result<()> {
        let super_block = self.super_block.clone();
        let start_offset = super_block.start_offset;
        for slot in 0..self.index.saves.len() {
            let region = self.index.saves[slot].index_save;
            let mut reader = self
                .open_region_reader(&region, -(start_offset as i64))
                .map_err(|e| e.context(&format!("cannot get reader for save {slot}")))?;

            let table = RegionTable::load(&mut reader)
                .map_err(|e| e.context(&format!("cannot read save {slot} header")))?;
            if table.header.region_blocks != region.num_blocks {
                return Err(LayoutError::CorruptData(format!(
                    "unexpected save {slot} region block count {}",
                    table.header.region_blocks
                )));
            }
            if table.header.region_type != RegionType::Save
                && table.header.region_type != RegionType::Unsaved
            {
                return Err(LayoutError::CorruptData(format!(
                    "unexpected save {slot} header type {:?}",
                    table.header.region_type
                )));
            }

            let (save_data, state_buffer) =
                read_index_save_data(&mut reader, usize::from(table.header.payload))
                    .map_err(|e| e.context(&format!("unknown save {slot} data format")))?;

            let save = &mut self.index.saves[slot];
            save.state_buffer = state_buffer;
            save.reconstruct(save_data, &table, &super_block)
                .map_err(|e| e.context(&format!("cannot reconstruct save {slot}")))?;
            save.read = true;
        }
        Ok(())
    }

    fn verify_config(&self, config: &IndexConfig) -> Result<()> {
        let offset = self.super_block.volume_offset - self.super_block.start_offset;
        let mut reader = self
            .open_region_reader(&self.config_region, offset as i64)
            .map_err(|e| e.context("failed to open config reader"))?;
        config
            .validate(&mut reader)
            .map_err(|e| e.context("failed to read config region"))
    }

    pub fn volume_nonce(&self) -> u64 {
        self.index.nonce
    }

    /// Byte offset of the layout within the backing store.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Usable size of the backing store, as sized at open.
    pub fn storage_size(&self) -> u64 {
        self.factory_size
    }

    pub fn max_saves(&self) -> u16 {
        self.super_block.max_saves
    }

    pub fn superblock(&self) -> &SuperBlockData {
        &self.super_block
    }

    /// Read-only view of the save-slot ring.
    pub fn save_slots(&self) -> &[IndexSaveLayout] {
        &self.index.saves
    }

    /// Check one slot against the volume nonce; returns its timestamp.
    pub fn validate_save(&self, slot: usize) -> Result<u64> {
        self.index.saves[slot].validate(self.index.nonce)
    }

    /// The newest valid save slot, or `IndexNotSavedCleanly`.
    pub fn latest_save(&self) -> Result<usize> {
        select_latest(&self.index.saves, self.index.nonce)
    }

    /// The slot the next save will overwrite.
    pub fn oldest_save(&self) -> Result<usize> {
        select_oldest(&self.index.saves, self.index.nonce)
    }

    fn open_region_reader(
        &self,
        region: &LayoutRegion,
        offset_blocks: i64,
    ) -> Result<BufferedReader> {
        let start_block = region.start_block as i64 + offset_blocks;
        if start_block < 0 {
            return Err(LayoutError::CorruptData(format!(
                "region start {} precedes the store",
                start_block
            )));
        }
        self.factory.buffered_reader(
            start_block as u64 * BLOCK_SIZE,
            region.num_blocks * BLOCK_SIZE,
        )
    }

    fn open_region_writer(
        &self,
        region: &LayoutRegion,
        offset_blocks: i64,
    ) -> Result<BufferedWriter> {
        let start_block = region.start_block as i64 + offset_blocks;
        if start_block < 0 {
            return Err(LayoutError::CorruptData(format!(
                "region start {} precedes the store",
                start_block
            )));
        }
        self.factory.buffered_writer(
            start_block as u64 * BLOCK_SIZE,
            region.num_blocks * BLOCK_SIZE,
        )
    }

    /// Rewrite one slot's header block: its region table, save data, and
    /// any index state, then flush. This is the commit point of a save.
    fn write_index_save_layout(&mut self, slot: usize) -> Result<()> {
        let save = &self.index.saves[slot];
        let header_region = save.header;
        let table = save.make_region_table();
        let save_data = save.save_data;
        let state = save
            .state_buffer
            .as_ref()
            .map(|buffer| buffer.contents().to_vec());

        let mut writer =
            self.open_region_writer(&header_region, -(self.super_block.start_offset as i64))?;
        let mut buffer = table.encode();
        save_data.encode(&mut buffer);
        if let Some(state) = state {
            buffer.put_bytes(&state);
        }
        writer.write_all(buffer.contents())?;
        writer.flush()?;

        self.index.saves[slot].written = true;
        Ok(())
    }

    fn make_region_table(&self) -> RegionTable {
        let mut regions = Vec::with_capacity(5 + self.index.saves.len());
        regions.push(self.header);
        regions.push(self.config_region);
        regions.push(self.index.sub_index);
        regions.push(self.index.volume);
        for save in &self.index.saves {
            regions.push(save.index_save);
        }
        regions.push(self.seal);

        RegionTable {
            header: RegionHeader {
                region_blocks: self.total_blocks,
                region_type: RegionType::Super,
                version: 1,
                num_regions: regions.len() as u16,
                payload: self.super_block.encoded_size() as u16,
            },
            regions,
        }
    }

    /// Write the top-level header region: region table plus superblock data.
    fn save_single_file_layout(&mut self, offset_blocks: i64) -> Result<()> {
        let table = self.make_region_table();
        let mut writer = self.open_region_writer(&self.header, offset_blocks)?;
        let mut buffer = table.encode();
        self.super_block.encode(&mut buffer);
        writer.write_all(buffer.contents())?;
        writer.flush()
    }

    fn write_config(&mut self, config: &IndexConfig, offset_blocks: i64) -> Result<()> {
        let mut writer = self
            .open_region_writer(&self.config_region, offset_blocks)
            .map_err(|e| e.context("failed to open config region"))?;
        config
            .write_to(&mut writer, self.super_block.version)
            .map_err(|e| e.context("failed to write config region"))?;
        writer
            .flush()
            .map_err(|e| e.context("cannot flush config writer"))
    }

    /// Invalidate a slot on disk: rewrite its header as UNSAVED with only a
    /// header, a page map, and scratch. A crash after this leaves the slot
    /// cleanly unusable rather than half-written.
    fn invalidate_old_save(&mut self, slot: usize) -> Result<()> {
        let save = &mut self.index.saves[slot];
        let mut start_block = save.index_save.start_block;
        let save_blocks = save.index_save.num_blocks;
        let instance = save.index_save.instance;
        *save = IndexSaveLayout::fresh(
            &mut start_block,
            save_blocks,
            self.super_block.page_map_blocks,
            instance,
        );
        self.write_index_save_layout(slot)
    }

    /// First phase of the save protocol: pick the oldest slot, invalidate
    /// it on disk, and re-carve it for `num_zones` zones with a fresh
    /// timestamp and nonce.
    pub fn setup_save_slot(&mut self, num_zones: u32) -> Result<usize> {
        let slot = select_oldest(&self.index.saves, self.index.nonce)?;
        self.invalidate_old_save(slot)?;
        let super_block = self.super_block.clone();
        let nonce = self.index.nonce;
        self.index.saves[slot].instantiate(&super_block, nonce, num_zones);
        Ok(slot)
    }

    /// Abandon an in-flight save. The on-disk slot is already UNSAVED.
    pub fn cancel_save(&mut self, slot: usize) {
        self.index.saves[slot].cancel();
    }

    /// Final phase of the save protocol: rewrite the slot header as SAVE.
    /// The data writes must all have flushed before this.
    pub fn commit_save(&mut self, slot: usize) -> Result<()> {
        self.write_index_save_layout(slot)
    }

    fn write_index_state_data(&mut self, slot: usize, index: &Index) {
        let mut buffer = Buffer::with_capacity(INDEX_STATE_BUFFER_SIZE);
        buffer.put_i32_le(INDEX_STATE_SIGNATURE);
        buffer.put_i32_le(INDEX_STATE_VERSION_ID);
        buffer.put_u64_le(index.newest_virtual_chapter);
        buffer.put_u64_le(index.oldest_virtual_chapter);
        buffer.put_u64_le(index.last_save);
        buffer.put_zeros(8);
        self.index.saves[slot].state_buffer = Some(buffer);
    }

    fn read_index_state_data(&self, slot: usize) -> Result<(u64, u64, u64)> {
        let buffer = self.index.saves[slot]
            .state_buffer
            .as_ref()
            .ok_or_else(|| LayoutError::BadState("save slot has no index state".into()))?;
        let mut decoder = buffer.clone();
        decoder.rewind();

        let signature = decoder.get_i32_le()?;
        let version_id = decoder.get_i32_le()?;
        if signature != INDEX_STATE_SIGNATURE || version_id != INDEX_STATE_VERSION_ID {
            return Err(LayoutError::UnsupportedVersion(format!(
                "index state version {signature},{version_id} is unsupported"
            )));
        }
        let newest = decoder.get_u64_le()?;
        let oldest = decoder.get_u64_le()?;
        let last_save = decoder.get_u64_le()?;
        decoder.skip(8)?;
        Ok((newest, oldest, last_save))
    }

    /// Checkpoint the index into the oldest save slot.
    ///
    /// Writes appear in sub-region order; the slot header is rewritten last,
    /// behind the data flushes. On any failure the slot is cancelled and the
    /// on-disk artifact stays an explicit UNSAVED slot.
    pub fn save_state(&mut self, index: &Index) -> Result<()> {
        let slot = self.setup_save_slot(index.zone_count)?;
        if let Err(error) = self.write_save_data(slot, index) {
            self.cancel_save(slot);
            return Err(error);
        }
        self.commit_save(slot)
    }

    fn write_save_data(&mut self, slot: usize, index: &Index) -> Result<()> {
        self.write_index_state_data(slot, index);
        let start_offset = self.super_block.start_offset as i64;

        let open_chapter_region = self.index.saves[slot].open_chapter.ok_or_else(|| {
            LayoutError::UnexpectedResult("save slot has no open chapter region".into())
        })?;
        let mut writer = self.open_region_writer(&open_chapter_region, -start_offset)?;
        index.open_chapter.save_to(&mut writer)?;

        let zone_regions = self.index.saves[slot].volume_index_zones.clone();
        let mut writers = zone_regions
            .iter()
            .map(|region| self.open_region_writer(region, -start_offset))
            .collect::<Result<Vec<_>>>()?;
        index.volume_index.save_to(&mut writers)?;

        let page_map_region = self.index.saves[slot].index_page_map;
        let mut writer = self.open_region_writer(&page_map_region, -start_offset)?;
        index.page_map.write_to(&mut writer)
    }

    /// Restore the index from the latest valid save slot.
    pub fn load_state(&mut self, index: &mut Index) -> Result<()> {
        let slot = select_latest(&self.index.saves, self.index.nonce)?;
        let (newest, oldest, last_save) = self.read_index_state_data(slot)?;
        let start_offset = self.super_block.start_offset as i64;

        let open_chapter_region = self.index.saves[slot].open_chapter.ok_or_else(|| {
            LayoutError::UnexpectedResult("save slot has no open chapter region".into())
        })?;
        let mut reader = self.open_region_reader(&open_chapter_region, -start_offset)?;
        index.open_chapter.load_from(&mut reader)?;

        let zone_regions = self.index.saves[slot].volume_index_zones.clone();
        let mut readers = zone_regions
            .iter()
            .map(|region| self.open_region_reader(region, -start_offset))
            .collect::<Result<Vec<_>>>()?;
        index.volume_index.load_from(&mut readers)?;

        let page_map_region = self.index.saves[slot].index_page_map;
        let mut reader = self.open_region_reader(&page_map_region, -start_offset)?;
        index.page_map.read_from(&mut reader)?;

        index.newest_virtual_chapter = newest;
        index.oldest_virtual_chapter = oldest;
        index.last_save = last_save;
        index.zone_count = self.index.saves[slot].num_zones;
        Ok(())
    }

    /// Invalidate every save slot. The first failure is reported after all
    /// slots have been attempted.
    pub fn discard_state(&mut self) -> Result<()> {
        let mut saved_result = Ok(());
        for slot in 0..self.index.saves.len() {
            let result = self.invalidate_old_save(slot);
            if result.is_err() && saved_result.is_ok() {
                saved_result = result;
            }
        }
        saved_result.map_err(|e| e.context("cannot destroy all index saves"))
    }

    /// Overwrite the open-chapter region of the latest save with one zeroed
    /// block, discarding the chapter on the next load.
    pub fn discard_open_chapter(&mut self) -> Result<()> {
        let slot = select_latest(&self.index.saves, self.index.nonce)?;
        let open_chapter_region = self.index.saves[slot].open_chapter.ok_or_else(|| {
            LayoutError::UnexpectedResult("save slot has no open chapter region".into())
        })?;
        let mut writer = self.open_region_writer(
            &open_chapter_region,
            -(self.super_block.start_offset as i64),
        )?;
        writer.write_zeros(BLOCK_SIZE)?;
        writer.flush()
    }

    /// Convert the layout to version 7, shifting the payload forward by
    /// `offset` bytes to make room for `lvm_offset` bytes of volume-manager
    /// metadata ahead of it.
    ///
    /// The converted superblock and configuration are written at their
    /// post-shift positions; the in-memory layout keeps describing the
    /// pre-conversion store, which the caller is about to abandon.
    pub fn update_layout(
        &mut self,
        config: &IndexConfig,
        lvm_offset: u64,
        offset: u64,
    ) -> Result<()> {
        let offset_blocks = offset / BLOCK_SIZE;
        let lvm_blocks = lvm_offset / BLOCK_SIZE;

        let saved_super = self.super_block.clone();
        let saved_index = self.index.clone();
        let saved_total = self.total_blocks;

        self.super_block.start_offset = lvm_blocks;
        self.super_block.volume_offset = offset_blocks;
        self.super_block.version = 7;
        self.index.sub_index.num_blocks -= offset_blocks;
        self.index.volume.num_blocks -= offset_blocks;
        self.total_blocks -= offset_blocks;

        let result = self
            .save_single_file_layout(offset_blocks as i64)
            .and_then(|()| self.write_config(config, offset_blocks as i64));

        self.index = saved_index;
        self.super_block = saved_super;
        self.total_blocks = saved_total;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use tempfile::NamedTempFile;

    fn test_config(path: &std::path::Path) -> IndexConfig {
        IndexConfig::new(path, Geometry::small())
    }

    #[test]
    fn compute_sizes_is_deterministic() {
        let config = IndexConfig::new("unused", Geometry::small());
        let first = compute_sizes(&config).unwrap();
        let second = compute_sizes(&config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.num_saves, 2);
        assert_eq!(
            first.total_blocks,
            3 + first.volume_blocks + 2 * first.save_blocks
        );
        assert_eq!(
            first.save_blocks,
            1 + first.volume_index_blocks + first.page_map_blocks + first.open_chapter_blocks
        );
    }

    #[test]
    fn misaligned_page_size_is_rejected() {
        let mut config = IndexConfig::new("unused", Geometry::small());
        config.geometry = Geometry::new(4096 + 512, 1, 2, 4, 0, 10);
        assert!(matches!(
            compute_sizes(&config),
            Err(LayoutError::IncorrectAlignment)
        ));
    }

    #[test]
    fn undersized_store_is_no_space() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(BLOCK_SIZE * 2).unwrap();
        let config = test_config(temp.path());
        assert!(matches!(
            IndexLayout::create(&config),
            Err(LayoutError::NoSpace { .. })
        ));
    }

    #[test]
    fn created_region_table_round_trips() {
        let temp = NamedTempFile::new().unwrap();
        let config = test_config(temp.path());
        temp.as_file()
            .set_len(IndexLayout::compute_size(&config).unwrap())
            .unwrap();

        let layout = IndexLayout::create(&config).unwrap();
        let table = layout.make_region_table();

        let reopened = IndexLayout::open(&config).unwrap();
        assert_eq!(reopened.make_region_table().regions, table.regions);
        assert_eq!(reopened.superblock(), layout.superblock());
        assert_eq!(reopened.volume_nonce(), layout.volume_nonce());
    }

    #[test]
    fn regions_are_contiguous_and_ascending() {
        let temp = NamedTempFile::new().unwrap();
        let config = test_config(temp.path());
        temp.as_file()
            .set_len(IndexLayout::compute_size(&config).unwrap())
            .unwrap();

        let layout = IndexLayout::create(&config).unwrap();
        let table = layout.make_region_table();

        // Header first, then config; the sub-index spans volume and saves;
        // the seal closes the layout.
        assert_eq!(table.regions[0].kind, RegionKind::Header);
        assert_eq!(table.regions[0].start_block, 0);
        let mut next = table.regions[1].start_block + table.regions[1].num_blocks;
        assert_eq!(table.regions[2].kind, RegionKind::Index);
        for region in &table.regions[3..] {
            assert_eq!(region.start_block, next);
            next = region.start_block + region.num_blocks;
        }
        assert_eq!(next, layout.total_blocks);
    }
}
