//! Superblock data: the payload of the top-level header region.

use crate::codec::Buffer;
use crate::error::{LayoutError, Result};
use crate::nonce::{create_unique_nonce_data, primary_nonce, NONCE_INFO_SIZE};

/// The 32-byte magic label, no terminator.
pub const SINGLE_FILE_MAGIC: &[u8; 32] = b"*ALBIREO*SINGLE*FILE*LAYOUT*001*";

/// Version 3 is the normal layout. Versions 4 through 6 were incremental
/// development versions and are rejected. Version 7 marks a layout converted
/// to make room for volume-manager metadata.
pub const SUPER_VERSION_CURRENT: u32 = 3;
pub const SUPER_VERSION_MINIMUM: u32 = 3;
pub const SUPER_VERSION_MAXIMUM: u32 = 7;

const ENCODED_SIZE: usize = 104;
const ENCODED_SIZE_CONVERTED: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlockData {
    pub magic_label: [u8; 32],
    pub nonce_info: [u8; NONCE_INFO_SIZE],
    pub nonce: u64,
    pub version: u32,
    pub block_size: u32,
    /// Always 1; the format historically supported more.
    pub num_indexes: u16,
    pub max_saves: u16,
    pub open_chapter_blocks: u64,
    pub page_map_blocks: u64,
    /// Blocks the volume has been shifted forward by a conversion.
    pub volume_offset: u64,
    /// Blocks of volume-manager metadata ahead of the layout.
    pub start_offset: u64,
}

impl SuperBlockData {
    /// Build the superblock for a brand-new layout, with fresh seed bytes
    /// and the primary nonce derived from them.
    pub fn generate(
        block_size: u32,
        max_saves: u16,
        open_chapter_blocks: u64,
        page_map_blocks: u64,
    ) -> SuperBlockData {
        let nonce_info = create_unique_nonce_data();
        SuperBlockData {
            magic_label: *SINGLE_FILE_MAGIC,
            nonce_info,
            nonce: primary_nonce(&nonce_info),
            version: SUPER_VERSION_CURRENT,
            block_size,
            num_indexes: 1,
            max_saves,
            open_chapter_blocks,
            page_map_blocks,
            volume_offset: 0,
            start_offset: 0,
        }
    }

    pub fn is_converted(&self) -> bool {
        self.version == 7
    }

    /// Size of the encoded payload; converted superblocks carry two extra
    /// offset fields.
    pub fn encoded_size(&self) -> usize {
        if self.is_converted() {
            ENCODED_SIZE_CONVERTED
        } else {
            ENCODED_SIZE
        }
    }

    pub fn encode(&self, buffer: &mut Buffer) {
        buffer.put_bytes(&self.magic_label);
        buffer.put_bytes(&self.nonce_info);
        buffer.put_u64_le(self.nonce);
        buffer.put_u32_le(self.version);
        buffer.put_u32_le(self.block_size);
        buffer.put_u16_le(self.num_indexes);
        buffer.put_u16_le(self.max_saves);
        buffer.put_zeros(4); // pad to a 64-bit boundary
        buffer.put_u64_le(self.open_chapter_blocks);
        buffer.put_u64_le(self.page_map_blocks);
        if self.is_converted() {
            buffer.put_u64_le(self.volume_offset);
            buffer.put_u64_le(self.start_offset);
        }
    }

    pub fn decode(buffer: &mut Buffer) -> Result<SuperBlockData> {
        let magic_label = buffer.get_array::<32>()?;
        let nonce_info = buffer.get_array::<NONCE_INFO_SIZE>()?;
        let nonce = buffer.get_u64_le()?;
        let version = buffer.get_u32_le()?;
        let block_size = buffer.get_u32_le()?;
        let num_indexes = buffer.get_u16_le()?;
        let max_saves = buffer.get_u16_le()?;
        buffer.skip(4)?;
        let open_chapter_blocks = buffer.get_u64_le()?;
        let page_map_blocks = buffer.get_u64_le()?;
        let (volume_offset, start_offset) = if version == 7 {
            (buffer.get_u64_le()?, buffer.get_u64_le()?)
        } else {
            (0, 0)
        };
        buffer.expect_consumed("superblock data")?;

        Ok(SuperBlockData {
            magic_label,
            nonce_info,
            nonce,
            version,
            block_size,
            num_indexes,
            max_saves,
            open_chapter_blocks,
            page_map_blocks,
            volume_offset,
            start_offset,
        })
    }

    /// Apply the superblock invariants: magic label, version range, offset
    /// consistency, single sub-index, and the nonce chained from the seed.
    pub fn validate(&self, expected_block_size: u32) -> Result<()> {
        if self.magic_label != *SINGLE_FILE_MAGIC {
            return Err(LayoutError::CorruptData(
                "unknown superblock magic label".into(),
            ));
        }
        if self.version < SUPER_VERSION_MINIMUM
            || (4..=6).contains(&self.version)
            || self.version > SUPER_VERSION_MAXIMUM
        {
            return Err(LayoutError::UnsupportedVersion(format!(
                "unknown superblock version number {}",
                self.version
            )));
        }
        if self.volume_offset < self.start_offset {
            return Err(LayoutError::CorruptData(format!(
                "inconsistent offsets (start {}, volume {})",
                self.start_offset, self.volume_offset
            )));
        }
        if self.num_indexes != 1 {
            return Err(LayoutError::CorruptData(format!(
                "invalid subindex count {}",
                self.num_indexes
            )));
        }
        if primary_nonce(&self.nonce_info) != self.nonce {
            return Err(LayoutError::CorruptData(
                "inconsistent superblock nonce".into(),
            ));
        }
        if self.block_size != expected_block_size {
            return Err(LayoutError::CorruptData(format!(
                "superblock saved block_size {} differs from supplied block_size {}",
                self.block_size, expected_block_size
            )));
        }
        Ok(())
    }
}
