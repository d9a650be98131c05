//! Index configuration and its on-disk record.
//!
//! The CONFIG region stores the configuration the layout was created with so
//! that later opens can refuse a store whose shape no longer matches the
//! caller's request.

use crate::codec::Buffer;
use crate::error::{LayoutError, Result};
use crate::geometry::Geometry;
use crate::io::{BufferedReader, BufferedWriter};
use std::path::PathBuf;

const CONFIG_MAGIC: &[u8] = b"ALBIREO CONFIG 1 12345";
const CONFIG_VERSION_6_02: &[u8; 5] = b"06.02";
const CONFIG_VERSION_8_02: &[u8; 5] = b"08.02";

/// Everything needed to create or reopen an index layout.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Path of the backing store.
    pub name: PathBuf,
    /// Byte offset of the layout within the store.
    pub offset: u64,
    /// Requested layout size in bytes; 0 means the whole store.
    pub size: u64,
    pub cache_chapters: u32,
    pub volume_index_mean_delta: u32,
    pub sparse_sample_rate: u32,
    /// Caller-supplied binding nonce; 0 when unused.
    pub nonce: u64,
    /// Chapters remapped by a conversion; both 0 until then.
    pub remapped_virtual: u64,
    pub remapped_physical: u64,
    pub geometry: Geometry,
}

impl IndexConfig {
    pub fn new<P: Into<PathBuf>>(name: P, geometry: Geometry) -> IndexConfig {
        IndexConfig {
            name: name.into(),
            offset: 0,
            size: 0,
            cache_chapters: 7,
            volume_index_mean_delta: 4096,
            sparse_sample_rate: 0,
            nonce: 0,
            remapped_virtual: 0,
            remapped_physical: 0,
            geometry,
        }
    }

    fn encode_record(&self, buffer: &mut Buffer, with_remapping: bool) {
        buffer.put_u32_le(self.geometry.record_pages_per_chapter);
        buffer.put_u32_le(self.geometry.chapters_per_volume);
        buffer.put_u32_le(self.geometry.sparse_chapters_per_volume);
        buffer.put_u32_le(self.cache_chapters);
        buffer.put_u32_le(0); // checkpoint frequency, retained for format compatibility
        buffer.put_u32_le(self.volume_index_mean_delta);
        buffer.put_u32_le(self.geometry.bytes_per_page as u32);
        buffer.put_u32_le(self.sparse_sample_rate);
        buffer.put_u64_le(self.nonce);
        if with_remapping {
            buffer.put_u64_le(self.remapped_virtual);
            buffer.put_u64_le(self.remapped_physical);
        }
    }

    /// Write the configuration record. Converted layouts (superblock
    /// version >= 7) use the 08.02 record, which carries the remapping pair.
    pub fn write_to(&self, writer: &mut BufferedWriter, super_version: u32) -> Result<()> {
        let with_remapping = super_version >= 7;
        let mut buffer = Buffer::new();
        buffer.put_bytes(CONFIG_MAGIC);
        buffer.put_bytes(if with_remapping {
            CONFIG_VERSION_8_02
        } else {
            CONFIG_VERSION_6_02
        });
        self.encode_record(&mut buffer, with_remapping);
        writer.write_all(buffer.contents())
    }

    /// Read the stored configuration record and require it to match this
    /// configuration.
    pub fn validate(&self, reader: &mut BufferedReader) -> Result<()> {
        reader
            .verify(CONFIG_MAGIC)
            .map_err(|e| e.context("config magic"))?;

        let version = reader.read_vec(CONFIG_VERSION_6_02.len())?;
        let with_remapping = if version == CONFIG_VERSION_6_02 {
            false
        } else if version == CONFIG_VERSION_8_02 {
            true
        } else {
            return Err(LayoutError::UnsupportedVersion(format!(
                "unknown config version {}",
                String::from_utf8_lossy(&version)
            )));
        };

        let record_size = if with_remapping { 56 } else { 40 };
        let mut buffer = Buffer::for_decoding(reader.read_vec(record_size)?);

        let record_pages_per_chapter = buffer.get_u32_le()?;
        let chapters_per_volume = buffer.get_u32_le()?;
        let sparse_chapters_per_volume = buffer.get_u32_le()?;
        let cache_chapters = buffer.get_u32_le()?;
        buffer.skip(4)?; // checkpoint frequency
        let volume_index_mean_delta = buffer.get_u32_le()?;
        let bytes_per_page = buffer.get_u32_le()?;
        let sparse_sample_rate = buffer.get_u32_le()?;
        let nonce = buffer.get_u64_le()?;
        if with_remapping {
            buffer.get_u64_le()?; // remapped virtual
            buffer.get_u64_le()?; // remapped physical
        }
        buffer.expect_consumed("config record")?;

        let matches = record_pages_per_chapter == self.geometry.record_pages_per_chapter
            && chapters_per_volume == self.geometry.chapters_per_volume
            && sparse_chapters_per_volume == self.geometry.sparse_chapters_per_volume
            && cache_chapters == self.cache_chapters
            && volume_index_mean_delta == self.volume_index_mean_delta
            && u64::from(bytes_per_page) == self.geometry.bytes_per_page
            && sparse_sample_rate == self.sparse_sample_rate
            && nonce == self.nonce;
        if !matches {
            return Err(LayoutError::CorruptData(
                "saved configuration does not match the requested configuration".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileAccess, IoFactory, BLOCK_SIZE};
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, IoFactory) {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(BLOCK_SIZE * 2).unwrap();
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        (temp, factory)
    }

    #[test]
    fn record_round_trips() {
        let (_temp, factory) = store();
        let config = IndexConfig::new("unused", Geometry::small());

        let mut writer = factory.buffered_writer(0, BLOCK_SIZE).unwrap();
        config.write_to(&mut writer, 3).unwrap();
        writer.flush().unwrap();

        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        config.validate(&mut reader).unwrap();
    }

    #[test]
    fn converted_record_round_trips() {
        let (_temp, factory) = store();
        let mut config = IndexConfig::new("unused", Geometry::small());
        config.remapped_virtual = 17;
        config.remapped_physical = 3;

        let mut writer = factory.buffered_writer(0, BLOCK_SIZE).unwrap();
        config.write_to(&mut writer, 7).unwrap();
        writer.flush().unwrap();

        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        config.validate(&mut reader).unwrap();
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        let (_temp, factory) = store();
        let config = IndexConfig::new("unused", Geometry::small());

        let mut writer = factory.buffered_writer(0, BLOCK_SIZE).unwrap();
        config.write_to(&mut writer, 3).unwrap();
        writer.flush().unwrap();

        let other = IndexConfig::new("unused", Geometry::new(4096, 1, 2, 8, 0, 10));
        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        assert!(matches!(
            other.validate(&mut reader),
            Err(LayoutError::CorruptData(_))
        ));
    }

    #[test]
    fn garbage_magic_is_rejected() {
        let (_temp, factory) = store();
        let mut writer = factory.buffered_writer(0, BLOCK_SIZE).unwrap();
        writer.write_all(b"not a config region at all....").unwrap();
        writer.flush().unwrap();

        let config = IndexConfig::new("unused", Geometry::small());
        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        assert!(matches!(
            config.validate(&mut reader),
            Err(LayoutError::CorruptData(_))
        ));
    }
}
