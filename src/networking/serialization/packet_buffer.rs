//! Bounds-checked cursor for parsing LLUDP packet data

use crate::networking::{NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Read cursor over a packet body. Every read fails with `MalformedMessage`
/// instead of running past the end of the buffer.
pub struct PacketBuffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Takes the next `len` bytes
    pub fn take(&mut self, len: usize) -> NetworkResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(NetworkError::malformed(format!(
                "Not enough data at offset {}: need {}, have {}",
                self.position,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16_le(&mut self) -> NetworkResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn get_u16_be(&mut self) -> NetworkResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn get_u32_le(&mut self) -> NetworkResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Sequence numbers and fixed message numbers are big-endian
    pub fn get_u32_be(&mut self) -> NetworkResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn get_f32_le(&mut self) -> NetworkResult<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn get_f64_le(&mut self) -> NetworkResult<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Peek at a byte `offset` past the cursor without advancing
    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        self.data.get(self.position + offset).copied()
    }
}
