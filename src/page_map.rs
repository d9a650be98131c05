//! Index page map: which delta lists landed on which index page.
//!
//! The map is conceptually a two-dimensional array indexed by chapter number
//! and index page number within the chapter; each entry holds the number of
//! the last delta list on that page. The last page of each chapter is not
//! recorded, as it is implied by the geometry.

use crate::codec::Buffer;
use crate::error::{LayoutError, Result};
use crate::geometry::Geometry;
use crate::io::{BufferedReader, BufferedWriter};

pub const INDEX_PAGE_MAP_MAGIC: &[u8; 8] = b"ALBIPM02";

/// Map a record name to the delta list it hashes to within a chapter.
pub fn hash_to_chapter_delta_list(name: &[u8; 16], geometry: &Geometry) -> u32 {
    let bits = u64::from_le_bytes(name[0..8].try_into().unwrap());
    (bits % u64::from(geometry.delta_lists_per_chapter)) as u32
}

/// Inclusive delta-list bounds of one index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPageBounds {
    pub lowest_list: u32,
    pub highest_list: u32,
}

#[derive(Debug, Clone)]
pub struct IndexPageMap {
    geometry: Geometry,
    last_update: u64,
    entries: Vec<u16>,
}

fn num_entries(geometry: &Geometry) -> usize {
    geometry.chapters_per_volume as usize * (geometry.index_pages_per_chapter as usize - 1)
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Result<IndexPageMap> {
        if geometry.delta_lists_per_chapter - 1 > u32::from(u16::MAX) {
            return Err(LayoutError::BadState(format!(
                "delta lists per chapter ({}) is too large",
                geometry.delta_lists_per_chapter
            )));
        }
        Ok(IndexPageMap {
            geometry: geometry.clone(),
            last_update: 0,
            entries: vec![0; num_entries(geometry)],
        })
    }

    /// The virtual chapter at which the map was last written.
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    /// Record that `delta_list` is the highest list on `page` of `chapter`.
    ///
    /// The last index page of a chapter is implied by the geometry and is
    /// accepted without writing anything.
    pub fn update(
        &mut self,
        virtual_chapter: u64,
        chapter: u32,
        page: u32,
        delta_list: u32,
    ) -> Result<()> {
        if (virtual_chapter < self.last_update || virtual_chapter > self.last_update + 1)
            && self.last_update != 0
        {
            // When replaying the volume the last update starts back at 0.
            tracing::warn!(
                "unexpected index page map update, jumping from {} to {}",
                self.last_update,
                virtual_chapter
            );
        }
        self.last_update = virtual_chapter;

        let geometry = &self.geometry;
        if chapter >= geometry.chapters_per_volume {
            return Err(LayoutError::InvalidArgument(format!(
                "chapter number {} exceeds maximum {}",
                chapter,
                geometry.chapters_per_volume - 1
            )));
        }
        if page >= geometry.index_pages_per_chapter {
            return Err(LayoutError::InvalidArgument(format!(
                "index page number {} exceeds maximum {}",
                page,
                geometry.index_pages_per_chapter - 1
            )));
        }
        if delta_list >= geometry.delta_lists_per_chapter {
            return Err(LayoutError::InvalidArgument(format!(
                "delta list number {} exceeds maximum {}",
                delta_list,
                geometry.delta_lists_per_chapter - 1
            )));
        }

        if page == geometry.index_pages_per_chapter - 1 {
            return Ok(());
        }

        let slot =
            chapter as usize * (geometry.index_pages_per_chapter as usize - 1) + page as usize;
        self.entries[slot] = delta_list as u16;
        Ok(())
    }

    /// Find the index page of `chapter` holding the delta list `name`
    /// hashes to.
    pub fn find_page(&self, name: &[u8; 16], chapter: u32) -> Result<u32> {
        let geometry = &self.geometry;
        if chapter >= geometry.chapters_per_volume {
            return Err(LayoutError::InvalidArgument(format!(
                "chapter number {} exceeds maximum {}",
                chapter,
                geometry.chapters_per_volume - 1
            )));
        }

        let delta_list = hash_to_chapter_delta_list(name, geometry);
        let pages = geometry.index_pages_per_chapter as usize;
        let slot = chapter as usize * (pages - 1);

        let mut page = 0;
        while page < pages - 1 {
            if delta_list <= u32::from(self.entries[slot + page]) {
                break;
            }
            page += 1;
        }

        if page >= pages {
            return Err(LayoutError::UnexpectedResult(
                "index page number too large".into(),
            ));
        }
        Ok(page as u32)
    }

    /// Inclusive bounds of the delta lists on `page` of `chapter`.
    pub fn bounds(&self, chapter: u32, page: u32) -> Result<IndexPageBounds> {
        let geometry = &self.geometry;
        if chapter >= geometry.chapters_per_volume {
            return Err(LayoutError::InvalidArgument(format!(
                "chapter number {chapter} is not valid"
            )));
        }
        if page >= geometry.index_pages_per_chapter {
            return Err(LayoutError::InvalidArgument(format!(
                "index page number {page} is not valid"
            )));
        }

        let slot = chapter as usize * (geometry.index_pages_per_chapter as usize - 1);
        let lowest_list = if page == 0 {
            0
        } else {
            u32::from(self.entries[slot + page as usize - 1]) + 1
        };
        let highest_list = if page == geometry.index_pages_per_chapter - 1 {
            geometry.delta_lists_per_chapter - 1
        } else {
            u32::from(self.entries[slot + page as usize])
        };
        Ok(IndexPageBounds {
            lowest_list,
            highest_list,
        })
    }

    /// Bytes of the serialized map: magic, last update, entries.
    pub fn saved_size(geometry: &Geometry) -> u64 {
        (INDEX_PAGE_MAP_MAGIC.len() + 8 + 2 * num_entries(geometry)) as u64
    }

    pub fn write_to(&self, writer: &mut BufferedWriter) -> Result<()> {
        let mut buffer = Buffer::with_capacity(Self::saved_size(&self.geometry) as usize);
        buffer.put_bytes(INDEX_PAGE_MAP_MAGIC);
        buffer.put_u64_le(self.last_update);
        for &entry in &self.entries {
            buffer.put_u16_le(entry);
        }
        writer
            .write_all(buffer.contents())
            .map_err(|e| e.context("cannot write index page map data"))?;
        writer
            .flush()
            .map_err(|e| e.context("cannot flush index page map data"))
    }

    pub fn read_from(&mut self, reader: &mut BufferedReader) -> Result<()> {
        reader
            .verify(INDEX_PAGE_MAP_MAGIC)
            .map_err(|e| e.context("bad index page map saved magic"))?;

        let mut buffer = Buffer::for_decoding(
            reader
                .read_vec(8 + 2 * num_entries(&self.geometry))
                .map_err(|e| e.context("cannot read index page map data"))?,
        );
        self.last_update = buffer.get_u64_le()?;
        for entry in self.entries.iter_mut() {
            *entry = buffer.get_u16_le()?;
        }
        buffer.expect_consumed("index page map")?;
        tracing::debug!("read index page map, last update {}", self.last_update);
        Ok(())
    }
}
