//! Volume index checkpoint collaborator.
//!
//! The volume index is sharded into zones; each zone checkpoints through its
//! own writer into its own VOLUME_INDEX sub-region, and is restored through
//! a matching reader. The layout engine sizes the save regions for the
//! worst case so any zone count up to the maximum fits.

use crate::codec::Buffer;
use crate::config::IndexConfig;
use crate::error::{LayoutError, Result};
use crate::io::{BufferedReader, BufferedWriter};
use crate::save::MAX_ZONES;

pub const VOLUME_INDEX_ZONE_MAGIC: &[u8; 8] = b"ALBVIS01";

const ZONE_HEADER_SIZE: u64 = 8 + 8 + 8 + 4;
const ENTRY_SIZE: u64 = 16;

/// One record-name mapping held by a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeIndexEntry {
    pub key: u64,
    pub virtual_chapter: u64,
}

/// One shard of the volume index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeIndexZone {
    pub virtual_chapter_low: u64,
    pub virtual_chapter_high: u64,
    entries: Vec<VolumeIndexEntry>,
}

impl VolumeIndexZone {
    pub fn entries(&self) -> &[VolumeIndexEntry] {
        &self.entries
    }

    fn save_to(&self, writer: &mut BufferedWriter) -> Result<()> {
        let mut buffer = Buffer::with_capacity(
            ZONE_HEADER_SIZE as usize + self.entries.len() * ENTRY_SIZE as usize,
        );
        buffer.put_bytes(VOLUME_INDEX_ZONE_MAGIC);
        buffer.put_u64_le(self.virtual_chapter_low);
        buffer.put_u64_le(self.virtual_chapter_high);
        buffer.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buffer.put_u64_le(entry.key);
            buffer.put_u64_le(entry.virtual_chapter);
        }
        writer
            .write_all(buffer.contents())
            .map_err(|e| e.context("cannot write volume index zone"))?;
        writer
            .flush()
            .map_err(|e| e.context("cannot flush volume index zone"))
    }

    fn load_from(reader: &mut BufferedReader) -> Result<VolumeIndexZone> {
        reader
            .verify(VOLUME_INDEX_ZONE_MAGIC)
            .map_err(|e| e.context("bad volume index zone magic"))?;

        let mut header = Buffer::for_decoding(reader.read_vec(8 + 8 + 4)?);
        let virtual_chapter_low = header.get_u64_le()?;
        let virtual_chapter_high = header.get_u64_le()?;
        let count = header.get_u32_le()?;

        let mut buffer =
            Buffer::for_decoding(reader.read_vec(count as usize * ENTRY_SIZE as usize)?);
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(VolumeIndexEntry {
                key: buffer.get_u64_le()?,
                virtual_chapter: buffer.get_u64_le()?,
            });
        }
        buffer.expect_consumed("volume index zone entries")?;

        Ok(VolumeIndexZone {
            virtual_chapter_low,
            virtual_chapter_high,
            entries,
        })
    }
}

/// The sharded volume index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeIndex {
    zones: Vec<VolumeIndexZone>,
}

impl VolumeIndex {
    pub fn new(zone_count: u32) -> Result<VolumeIndex> {
        if zone_count == 0 || zone_count as usize > MAX_ZONES {
            return Err(LayoutError::InvalidArgument(format!(
                "zone count {zone_count} out of range 1..={MAX_ZONES}"
            )));
        }
        Ok(VolumeIndex {
            zones: vec![VolumeIndexZone::default(); zone_count as usize],
        })
    }

    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    pub fn zones(&self) -> &[VolumeIndexZone] {
        &self.zones
    }

    /// Record a name-to-chapter mapping in the zone its key shards to.
    pub fn add_entry(&mut self, key: u64, virtual_chapter: u64) {
        let zone_idx = (key % self.zones.len() as u64) as usize;
        let zone = &mut self.zones[zone_idx];
        zone.entries.push(VolumeIndexEntry {
            key,
            virtual_chapter,
        });
        zone.virtual_chapter_high = zone.virtual_chapter_high.max(virtual_chapter);
    }

    /// Worst-case blocks a volume index save needs, regardless of the zone
    /// count used at run time.
    pub fn save_blocks(config: &IndexConfig, block_size: u64) -> u64 {
        let bytes = MAX_ZONES as u64 * ZONE_HEADER_SIZE
            + config.geometry.records_per_volume * ENTRY_SIZE;
        bytes.div_ceil(block_size) + 1
    }

    /// Checkpoint every zone, one writer per zone, in zone order.
    pub fn save_to(&self, writers: &mut [BufferedWriter]) -> Result<()> {
        if writers.len() != self.zones.len() {
            return Err(LayoutError::InvalidArgument(format!(
                "{} writers supplied for {} zones",
                writers.len(),
                self.zones.len()
            )));
        }
        for (zone, writer) in self.zones.iter().zip(writers.iter_mut()) {
            zone.save_to(writer)?;
        }
        Ok(())
    }

    /// Restore from a checkpoint; the reader count dictates the zone count.
    pub fn load_from(&mut self, readers: &mut [BufferedReader]) -> Result<()> {
        let mut zones = Vec::with_capacity(readers.len());
        for reader in readers.iter_mut() {
            zones.push(VolumeIndexZone::load_from(reader)?);
        }
        if zones.is_empty() {
            return Err(LayoutError::InvalidArgument(
                "no readers supplied for volume index load".into(),
            ));
        }
        self.zones = zones;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::io::{FileAccess, IoFactory, BLOCK_SIZE};
    use tempfile::NamedTempFile;

    #[test]
    fn entries_shard_by_key() {
        let mut vindex = VolumeIndex::new(4).unwrap();
        for key in 0..16u64 {
            vindex.add_entry(key, 100 + key);
        }
        for (zone_number, zone) in vindex.zones().iter().enumerate() {
            assert_eq!(zone.entries().len(), 4);
            for entry in zone.entries() {
                assert_eq!(entry.key % 4, zone_number as u64);
            }
        }
    }

    #[test]
    fn zone_count_bounds() {
        assert!(VolumeIndex::new(0).is_err());
        assert!(VolumeIndex::new(MAX_ZONES as u32).is_ok());
        assert!(VolumeIndex::new(MAX_ZONES as u32 + 1).is_err());
    }

    #[test]
    fn save_blocks_is_deterministic() {
        let config = IndexConfig::new("unused", Geometry::small());
        let first = VolumeIndex::save_blocks(&config, BLOCK_SIZE);
        let second = VolumeIndex::save_blocks(&config, BLOCK_SIZE);
        assert_eq!(first, second);
        assert!(first >= 2);
    }

    #[test]
    fn save_load_round_trip_per_zone() {
        let mut vindex = VolumeIndex::new(2).unwrap();
        for key in 0..10u64 {
            vindex.add_entry(key, 1000 + key);
        }

        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(BLOCK_SIZE * 4).unwrap();
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();

        let mut writers = vec![
            factory.buffered_writer(0, BLOCK_SIZE * 2).unwrap(),
            factory.buffered_writer(BLOCK_SIZE * 2, BLOCK_SIZE * 2).unwrap(),
        ];
        vindex.save_to(&mut writers).unwrap();

        let mut readers = vec![
            factory.buffered_reader(0, BLOCK_SIZE * 2).unwrap(),
            factory.buffered_reader(BLOCK_SIZE * 2, BLOCK_SIZE * 2).unwrap(),
        ];
        let mut restored = VolumeIndex::new(2).unwrap();
        restored.load_from(&mut readers).unwrap();
        assert_eq!(restored, vindex);
    }

    #[test]
    fn writer_count_must_match_zones() {
        let vindex = VolumeIndex::new(2).unwrap();
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(BLOCK_SIZE).unwrap();
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        let mut writers = vec![factory.buffered_writer(0, BLOCK_SIZE).unwrap()];
        assert!(matches!(
            vindex.save_to(&mut writers),
            Err(LayoutError::InvalidArgument(_))
        ));
    }
}
