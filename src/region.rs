//! Region descriptors, region tables, and the table iterator.
//!
//! The backing store is carved into contiguous block runs, each described by
//! a kind, an instance number, a start block, and a length. A region table
//! (header plus descriptor list) is persisted at the start of every compound
//! region: the top level and each save slot.

use crate::codec::Buffer;
use crate::error::{LayoutError, Result};
use crate::io::BufferedReader;

/// "AlbRgn01" as a little-endian u64.
pub const REGION_MAGIC: u64 = 0x416c6252676e3031;

/// Instance number used when a kind has exactly one region.
pub const SOLE_INSTANCE: u16 = 65535;

/// Encoded size of a region header.
pub const REGION_HEADER_SIZE: usize = 24;

/// Encoded size of one region descriptor.
pub const REGION_DESCRIPTOR_SIZE: usize = 24;

/// What a region holds. The wire encoding is a u16 with historical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Uninitialized or scrapped space.
    Scratch,
    /// The self-describing header block of a compound region.
    Header,
    Config,
    Index,
    Seal,
    Volume,
    Save,
    IndexPageMap,
    VolumeIndex,
    OpenChapter,
}

impl RegionKind {
    pub fn to_wire(self) -> u16 {
        match self {
            RegionKind::Scratch => 0,
            RegionKind::Header => 1,
            RegionKind::Config => 100,
            RegionKind::Index => 101,
            RegionKind::Seal => 102,
            RegionKind::Volume => 201,
            RegionKind::Save => 202,
            RegionKind::IndexPageMap => 301,
            RegionKind::VolumeIndex => 302,
            RegionKind::OpenChapter => 303,
        }
    }

    pub fn from_wire(value: u16) -> Result<RegionKind> {
        match value {
            0 => Ok(RegionKind::Scratch),
            1 => Ok(RegionKind::Header),
            100 => Ok(RegionKind::Config),
            101 => Ok(RegionKind::Index),
            102 => Ok(RegionKind::Seal),
            201 => Ok(RegionKind::Volume),
            202 => Ok(RegionKind::Save),
            301 => Ok(RegionKind::IndexPageMap),
            302 => Ok(RegionKind::VolumeIndex),
            303 => Ok(RegionKind::OpenChapter),
            other => Err(LayoutError::CorruptData(format!(
                "unknown region kind {other}"
            ))),
        }
    }
}

/// Role of a compound region's header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Free,
    Super,
    Save,
    Unsaved,
}

impl RegionType {
    pub fn to_wire(self) -> u16 {
        match self {
            RegionType::Free => 0,
            RegionType::Super => 1,
            RegionType::Save => 2,
            RegionType::Unsaved => 4,
        }
    }

    pub fn from_wire(value: u16) -> Result<RegionType> {
        match value {
            0 => Ok(RegionType::Free),
            1 => Ok(RegionType::Super),
            2 => Ok(RegionType::Save),
            4 => Ok(RegionType::Unsaved),
            other => Err(LayoutError::CorruptData(format!(
                "unknown region header type {other}"
            ))),
        }
    }
}

/// One contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRegion {
    pub start_block: u64,
    pub num_blocks: u64,
    /// Only meaningful for save regions; carried for format compatibility.
    pub checksum: u32,
    pub kind: RegionKind,
    pub instance: u16,
}

impl LayoutRegion {
    /// Carve the next region off a running block cursor.
    pub fn carve(
        next_block: &mut u64,
        num_blocks: u64,
        kind: RegionKind,
        instance: u16,
    ) -> LayoutRegion {
        let region = LayoutRegion {
            start_block: *next_block,
            num_blocks,
            checksum: 0,
            kind,
            instance,
        };
        *next_block += num_blocks;
        region
    }

    pub fn encode(&self, buffer: &mut Buffer) {
        buffer.put_u64_le(self.start_block);
        buffer.put_u64_le(self.num_blocks);
        buffer.put_u32_le(self.checksum);
        buffer.put_u16_le(self.kind.to_wire());
        buffer.put_u16_le(self.instance);
    }

    pub fn decode(buffer: &mut Buffer) -> Result<LayoutRegion> {
        let start_block = buffer.get_u64_le()?;
        let num_blocks = buffer.get_u64_le()?;
        let checksum = buffer.get_u32_le()?;
        let kind = RegionKind::from_wire(buffer.get_u16_le()?)?;
        let instance = buffer.get_u16_le()?;
        Ok(LayoutRegion {
            start_block,
            num_blocks,
            checksum,
            kind,
            instance,
        })
    }
}

/// Header of a persisted region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    /// Size of the whole compound region in blocks.
    pub region_blocks: u64,
    pub region_type: RegionType,
    pub version: u16,
    pub num_regions: u16,
    /// Bytes of kind-specific data that follow the descriptor list.
    pub payload: u16,
}

impl RegionHeader {
    pub fn encode(&self, buffer: &mut Buffer) {
        buffer.put_u64_le(REGION_MAGIC);
        buffer.put_u64_le(self.region_blocks);
        buffer.put_u16_le(self.region_type.to_wire());
        buffer.put_u16_le(self.version);
        buffer.put_u16_le(self.num_regions);
        buffer.put_u16_le(self.payload);
    }
}

/// A decoded region table: header plus descriptors, with the payload bytes
/// left in the reader for the caller to interpret.
#[derive(Debug, Clone)]
pub struct RegionTable {
    pub header: RegionHeader,
    pub regions: Vec<LayoutRegion>,
}

impl RegionTable {
    /// Read and decode a region table from the start of a compound region.
    ///
    /// A wrong magic means the store was never formatted (`NoIndex`); an
    /// unknown table version is `UnsupportedVersion`.
    pub fn load(reader: &mut BufferedReader) -> Result<RegionTable> {
        let mut buffer = Buffer::for_decoding(
            reader
                .read_vec(REGION_HEADER_SIZE)
                .map_err(|e| e.context("region table header"))?,
        );

        let magic = buffer.get_u64_le()?;
        if magic != REGION_MAGIC {
            return Err(LayoutError::NoIndex);
        }
        let region_blocks = buffer.get_u64_le()?;
        let type_wire = buffer.get_u16_le()?;
        let version = buffer.get_u16_le()?;
        let num_regions = buffer.get_u16_le()?;
        let payload = buffer.get_u16_le()?;
        buffer.expect_consumed("region header")?;

        if version != 1 {
            return Err(LayoutError::UnsupportedVersion(format!(
                "unknown region table version {version}"
            )));
        }
        let region_type = RegionType::from_wire(type_wire)?;

        let mut table_bytes = Buffer::for_decoding(
            reader
                .read_vec(usize::from(num_regions) * REGION_DESCRIPTOR_SIZE)
                .map_err(|e| e.context("region table descriptors"))?,
        );
        let mut regions = Vec::with_capacity(usize::from(num_regions));
        for _ in 0..num_regions {
            regions.push(LayoutRegion::decode(&mut table_bytes)?);
        }
        table_bytes.expect_consumed("region table")?;

        Ok(RegionTable {
            header: RegionHeader {
                region_blocks,
                region_type,
                version,
                num_regions,
                payload,
            },
            regions,
        })
    }

    /// Encode the header and every descriptor, ready to be followed by the
    /// payload bytes.
    pub fn encode(&self) -> Buffer {
        let mut buffer = Buffer::with_capacity(
            REGION_HEADER_SIZE + self.regions.len() * REGION_DESCRIPTOR_SIZE,
        );
        self.header.encode(&mut buffer);
        for region in &self.regions {
            region.encode(&mut buffer);
        }
        buffer
    }
}

/// One-shot walker over a decoded region table.
///
/// Each `expect` enforces kind, instance, exactly-at-expected-offset, and
/// optionally an exact block count. The first failure is recorded and later
/// asserts are refused, so the first diagnostic is the one reported.
#[derive(Clone)]
pub struct RegionIterator<'a> {
    regions: &'a [LayoutRegion],
    next_region: usize,
    next_block: u64,
    first_error: Option<String>,
}

impl<'a> RegionIterator<'a> {
    pub fn new(regions: &'a [LayoutRegion], first_block: u64) -> RegionIterator<'a> {
        RegionIterator {
            regions,
            next_region: 0,
            next_block: first_block,
            first_error: None,
        }
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    pub fn set_next_block(&mut self, block: u64) {
        self.next_block = block;
    }

    pub fn regions_left(&self) -> usize {
        self.regions.len() - self.next_region
    }

    pub fn record_error(&mut self, message: String) {
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }

    /// Consume the next region if it matches. With `required`, a missing or
    /// wrong-kind region is an error; without, it merely returns `None`.
    /// Offset, instance, and size mismatches are always errors.
    pub fn expect(
        &mut self,
        required: bool,
        num_blocks: u64,
        kind: RegionKind,
        instance: u16,
    ) -> Option<LayoutRegion> {
        if self.first_error.is_some() {
            return None;
        }
        let region = match self.regions.get(self.next_region) {
            Some(region) => *region,
            None => {
                if required {
                    self.record_error("ran out of layout regions in region table".into());
                }
                return None;
            }
        };
        if region.start_block != self.next_block {
            self.record_error(format!(
                "layout region not at expected offset: {} instead of {}",
                region.start_block, self.next_block
            ));
            return None;
        }
        if region.kind != kind {
            if required {
                self.record_error(format!(
                    "layout region has incorrect kind {:?}, expected {:?}",
                    region.kind, kind
                ));
            }
            return None;
        }
        if region.instance != instance {
            self.record_error(format!(
                "layout region has incorrect instance {} for kind {:?}",
                region.instance, kind
            ));
            return None;
        }
        if num_blocks > 0 && region.num_blocks != num_blocks {
            self.record_error(format!(
                "layout region size is incorrect: {} blocks instead of {}",
                region.num_blocks, num_blocks
            ));
            return None;
        }

        self.next_block += region.num_blocks;
        self.next_region += 1;
        Some(region)
    }

    /// The first recorded failure, if any.
    pub fn finish(self) -> Result<()> {
        match self.first_error {
            Some(message) => Err(LayoutError::UnexpectedResult(message)),
            None => Ok(()),
        }
    }

    pub fn has_error(&self) -> bool {
        self.first_error.is_some()
    }
}
