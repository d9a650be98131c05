//! Cursor-backed binary buffer for the on-disk format.
//!
//! All multi-byte integers are little-endian. Every decode checks its bounds
//! explicitly and fails with `CorruptData` rather than reading past the
//! declared end of a structure.

use crate::error::{LayoutError, Result};

/// A byte buffer with an append end and a consume cursor.
///
/// Encoding appends to the underlying vector; decoding advances the cursor.
/// The two modes are not mixed on the same instance in practice, but nothing
/// prevents it.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer {
            data: Vec::new(),
            pos: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Wrap existing bytes for decoding.
    pub fn for_decoding(data: Vec<u8>) -> Self {
        Buffer { data, pos: 0 }
    }

    /// Bytes appended so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left to consume.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Reset the consume cursor to the start of the buffer.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    pub fn put_u16_le(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32_le(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32_le(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64_le(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `count` zero bytes (structure padding).
    pub fn put_zeros(&mut self, count: usize) {
        self.data.resize(self.data.len() + count, 0);
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        if self.remaining() < count {
            return Err(LayoutError::CorruptData(format!(
                "buffer underflow: {} bytes needed, {} remain",
                count,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn get_u16_le(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32_le(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_i32_le(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_u64_le(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(array))
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    /// Skip `count` bytes of padding.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count)?;
        Ok(())
    }

    /// Check that the consumed length equals the expected structure size.
    pub fn expect_consumed(&self, what: &str) -> Result<()> {
        if self.remaining() != 0 {
            return Err(LayoutError::CorruptData(format!(
                "{}: {} bytes decoded of {} expected",
                what,
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_integers() {
        let mut buffer = Buffer::new();
        buffer.put_u16_le(0xBEEF);
        buffer.put_u32_le(0xDEADBEEF);
        buffer.put_u64_le(0x0123_4567_89AB_CDEF);
        buffer.put_i32_le(-1);

        let mut decoder = Buffer::for_decoding(buffer.into_vec());
        assert_eq!(decoder.get_u16_le().unwrap(), 0xBEEF);
        assert_eq!(decoder.get_u32_le().unwrap(), 0xDEADBEEF);
        assert_eq!(decoder.get_u64_le().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(decoder.get_i32_le().unwrap(), -1);
        assert!(decoder.expect_consumed("test").is_ok());
    }

    #[test]
    fn little_endian_on_the_wire() {
        let mut buffer = Buffer::new();
        buffer.put_u32_le(0x01020304);
        assert_eq!(buffer.contents(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn underflow_is_corrupt_data() {
        let mut decoder = Buffer::for_decoding(vec![0u8; 3]);
        assert!(matches!(
            decoder.get_u32_le(),
            Err(LayoutError::CorruptData(_))
        ));
    }

    #[test]
    fn expect_consumed_flags_leftovers() {
        let mut decoder = Buffer::for_decoding(vec![0u8; 8]);
        decoder.get_u32_le().unwrap();
        assert!(matches!(
            decoder.expect_consumed("half-read"),
            Err(LayoutError::CorruptData(_))
        ));
    }

    #[test]
    fn zeros_and_skip() {
        let mut buffer = Buffer::new();
        buffer.put_u16_le(7);
        buffer.put_zeros(6);
        let mut decoder = Buffer::for_decoding(buffer.into_vec());
        assert_eq!(decoder.get_u16_le().unwrap(), 7);
        decoder.skip(6).unwrap();
        assert_eq!(decoder.remaining(), 0);
    }
}
