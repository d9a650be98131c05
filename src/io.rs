//! Block I/O façade over a named backing store.
//!
//! The factory hands out buffered readers and writers scoped to a
//! `(byte offset, byte length)` window. Each reader or writer tracks its own
//! position and is used exclusively for the duration of one region
//! operation; positional reads and writes keep simultaneously open handles
//! from disturbing one another. A writer's `flush` is the durability
//! boundary the save protocol depends on.

use crate::error::{LayoutError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Fixed block size of the backing store. Every region begins and ends on
/// a block boundary.
pub const BLOCK_SIZE: u64 = 4096;

/// How to open the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    /// Create the file if missing; never truncate an existing one.
    CreateReadWrite,
    /// The file must already exist.
    ReadWrite,
}

/// Handle to a named backing store.
pub struct IoFactory {
    file: File,
    path: PathBuf,
}

impl IoFactory {
    pub fn open<P: AsRef<Path>>(path: P, access: FileAccess) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(access == FileAccess::CreateReadWrite)
            .open(&path)?;

        Ok(IoFactory {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Usable size of the backing store, rounded down to a block multiple.
    pub fn writable_size(&self) -> Result<u64> {
        let size = self.file.metadata()?.len();
        Ok(size & !(BLOCK_SIZE - 1))
    }

    /// Open a buffered reader over `[offset, offset + length)`.
    pub fn buffered_reader(&self, offset: u64, length: u64) -> Result<BufferedReader> {
        Ok(BufferedReader {
            file: self.file.try_clone()?,
            position: offset,
            remaining: length,
        })
    }

    /// Open a buffered writer over `[offset, offset + length)`.
    pub fn buffered_writer(&self, offset: u64, length: u64) -> Result<BufferedWriter> {
        Ok(BufferedWriter {
            file: self.file.try_clone()?,
            position: offset,
            limit: length,
            buffer: Vec::new(),
        })
    }
}

/// Sequential reader bounded to a region window.
pub struct BufferedReader {
    file: File,
    position: u64,
    remaining: u64,
}

impl BufferedReader {
    /// Fill `out` exactly. A short read, or a read past the end of the
    /// window, is `CorruptData`.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if (out.len() as u64) > self.remaining {
            return Err(LayoutError::CorruptData(format!(
                "read of {} bytes exceeds region ({} left)",
                out.len(),
                self.remaining
            )));
        }
        self.file.read_exact_at(out, self.position).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                LayoutError::CorruptData("short read from backing store".into())
            } else {
                LayoutError::Io(e)
            }
        })?;
        self.position += out.len() as u64;
        self.remaining -= out.len() as u64;
        Ok(())
    }

    pub fn read_vec(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; length];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    /// Read `expected.len()` bytes and require them to match.
    pub fn verify(&mut self, expected: &[u8]) -> Result<()> {
        let mut actual = vec![0u8; expected.len()];
        self.read_exact(&mut actual)?;
        if actual != expected {
            return Err(LayoutError::CorruptData(
                "verification of saved data failed".into(),
            ));
        }
        Ok(())
    }
}

/// Buffering writer bounded to a region window.
///
/// Writes accumulate in memory until `flush`, which pushes them to the
/// backing store and syncs. Nothing reaches the store without a flush.
pub struct BufferedWriter {
    file: File,
    position: u64,
    limit: u64,
    buffer: Vec<u8>,
}

impl BufferedWriter {
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        if (self.buffer.len() + bytes.len()) as u64 > self.limit {
            return Err(LayoutError::InvalidArgument(format!(
                "write of {} bytes extends beyond region of {} bytes",
                self.buffer.len() + bytes.len(),
                self.limit
            )));
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Queue `count` zero bytes.
    pub fn write_zeros(&mut self, count: u64) -> Result<()> {
        if (self.buffer.len() as u64 + count) > self.limit {
            return Err(LayoutError::InvalidArgument(format!(
                "zero fill of {count} bytes extends beyond region"
            )));
        }
        self.buffer.resize(self.buffer.len() + count as usize, 0);
        Ok(())
    }

    /// Push buffered bytes to the store and sync. This is the barrier the
    /// save protocol orders its header rewrite behind.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all_at(&self.buffer, self.position)?;
            self.position += self.buffer.len() as u64;
            self.limit -= self.buffer.len() as u64;
            self.buffer.clear();
        }
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sized_store(blocks: u64) -> NamedTempFile {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(blocks * BLOCK_SIZE).unwrap();
        temp
    }

    #[test]
    fn writable_size_rounds_down() {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(BLOCK_SIZE * 3 + 100).unwrap();
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        assert_eq!(factory.writable_size().unwrap(), BLOCK_SIZE * 3);
    }

    #[test]
    fn write_then_read_round_trip() {
        let temp = sized_store(4);
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();

        let mut writer = factory.buffered_writer(BLOCK_SIZE, BLOCK_SIZE).unwrap();
        writer.write_all(b"layout engine").unwrap();
        writer.flush().unwrap();

        let mut reader = factory.buffered_reader(BLOCK_SIZE, BLOCK_SIZE).unwrap();
        let data = reader.read_vec(13).unwrap();
        assert_eq!(&data, b"layout engine");
    }

    #[test]
    fn unflushed_writes_stay_in_memory() {
        let temp = sized_store(2);
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();

        let mut writer = factory.buffered_writer(0, BLOCK_SIZE).unwrap();
        writer.write_all(b"pending").unwrap();

        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        let data = reader.read_vec(7).unwrap();
        assert_eq!(data, vec![0u8; 7]);
    }

    #[test]
    fn simultaneous_readers_do_not_interfere() {
        let temp = sized_store(4);
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        for i in 0..4u8 {
            let mut writer = factory
                .buffered_writer(u64::from(i) * BLOCK_SIZE, BLOCK_SIZE)
                .unwrap();
            writer.write_all(&[i; 16]).unwrap();
            writer.flush().unwrap();
        }

        let mut readers: Vec<_> = (0..4u64)
            .map(|i| factory.buffered_reader(i * BLOCK_SIZE, BLOCK_SIZE).unwrap())
            .collect();
        for (i, reader) in readers.iter_mut().enumerate() {
            assert_eq!(reader.read_vec(16).unwrap(), vec![i as u8; 16]);
        }
    }

    #[test]
    fn read_past_window_is_corrupt_data() {
        let temp = sized_store(2);
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        let mut reader = factory.buffered_reader(0, 8).unwrap();
        assert!(matches!(
            reader.read_vec(16),
            Err(LayoutError::CorruptData(_))
        ));
    }

    #[test]
    fn write_past_window_is_rejected() {
        let temp = sized_store(2);
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        let mut writer = factory.buffered_writer(0, 8).unwrap();
        assert!(matches!(
            writer.write_all(&[0u8; 16]),
            Err(LayoutError::InvalidArgument(_))
        ));
    }

    #[test]
    fn verify_detects_mismatch() {
        let temp = sized_store(2);
        let factory = IoFactory::open(temp.path(), FileAccess::ReadWrite).unwrap();
        let mut writer = factory.buffered_writer(0, BLOCK_SIZE).unwrap();
        writer.write_all(b"ALBIPM02").unwrap();
        writer.flush().unwrap();

        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        assert!(reader.verify(b"ALBIPM02").is_ok());

        let mut reader = factory.buffered_reader(0, BLOCK_SIZE).unwrap();
        assert!(matches!(
            reader.verify(b"ALBIPM99"),
            Err(LayoutError::CorruptData(_))
        ));
    }

    #[test]
    fn missing_store_without_create_fails() {
        let result = IoFactory::open("/nonexistent/backing-store", FileAccess::ReadWrite);
        assert!(matches!(result, Err(LayoutError::Io(_))));
    }
}
