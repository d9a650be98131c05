//! Open chapter checkpoint: the chapter being actively filled, persisted
//! separately inside each save.

use crate::codec::Buffer;
use crate::error::{LayoutError, Result};
use crate::geometry::{Geometry, BYTES_PER_RECORD};
use crate::io::{BufferedReader, BufferedWriter};

pub const OPEN_CHAPTER_MAGIC: &[u8; 5] = b"ALBOC";
pub const OPEN_CHAPTER_VERSION: &[u8; 5] = b"02.00";

const HEADER_SIZE: u64 = 5 + 5 + 4;

/// One record of the open chapter: a name and its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenChapterRecord {
    pub name: [u8; 16],
    pub metadata: [u8; 16],
}

/// In-memory open chapter contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChapter {
    capacity: u32,
    records: Vec<OpenChapterRecord>,
}

impl OpenChapter {
    pub fn new(geometry: &Geometry) -> OpenChapter {
        OpenChapter {
            capacity: geometry.records_per_chapter,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[OpenChapterRecord] {
        &self.records
    }

    pub fn add(&mut self, record: OpenChapterRecord) -> Result<()> {
        if self.records.len() as u32 >= self.capacity {
            return Err(LayoutError::BadState("open chapter is full".into()));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Worst-case bytes of a saved open chapter for this geometry.
    pub fn saved_size(geometry: &Geometry) -> u64 {
        HEADER_SIZE + u64::from(geometry.records_per_chapter) * BYTES_PER_RECORD
    }

    pub fn save_to(&self, writer: &mut BufferedWriter) -> Result<()> {
        let mut buffer =
            Buffer::with_capacity(HEADER_SIZE as usize + self.records.len() * 32);
        buffer.put_bytes(OPEN_CHAPTER_MAGIC);
        buffer.put_bytes(OPEN_CHAPTER_VERSION);
        buffer.put_u32_le(self.records.len() as u32);
        for record in &self.records {
            buffer.put_bytes(&record.name);
            buffer.put_bytes(&record.metadata);
        }
        writer
            .write_all(buffer.contents())
            .map_err(|e| e.context("cannot write open chapter"))?;
        writer
            .flush()
            .map_err(|e| e.context("cannot flush open chapter"))
    }

    pub fn load_from(&mut self, reader: &mut BufferedReader) -> Result<()> {
        reader
            .verify(OPEN_CHAPTER_MAGIC)
            .map_err(|e| e.context("bad open chapter magic"))?;

        let version = reader.read_vec(OPEN_CHAPTER_VERSION.len())?;
        if version != OPEN_CHAPTER_VERSION {
            return Err(LayoutError::UnsupportedVersion(format!(
                "unknown open chapter version {}",
                String::from_utf8_lossy(&version)
            )));
        }

        let mut header = Buffer::for_decoding(reader.read_vec(4)?);
        let count = header.get_u32_le()?;
        if count > self.capacity {
            return Err(LayoutError::CorruptData(format!(
                "open chapter record count {} exceeds capacity {}",
                count, self.capacity
            )));
        }

        let mut buffer = Buffer::for_decoding(reader.read_vec(count as usize * 32)?);
        self.records.clear();
        for _ in 0..count {
            let name = buffer.get_array::<16>()?;
            let metadata = buffer.get_array::<16>()?;
            self.records.push(OpenChapterRecord { name, metadata });
        }
        buffer.expect_consumed("open chapter records")?;
        Ok(())
    }
}
