//! LLUDP zerocoding
//!
//! Zerocoding compresses runs of zero bytes in message bodies:
//! - a 0x00 byte is always followed by a count byte (1-255)
//! - the pair expands to `count` zero bytes
//! - runs longer than 255 are split into several pairs

use crate::networking::{NetworkError, NetworkResult};

/// Encode data using the zerocoding algorithm
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0 {
            let mut zero_count: u8 = 0;
            while i < data.len() && data[i] == 0 && zero_count < u8::MAX {
                zero_count += 1;
                i += 1;
            }
            result.push(0x00);
            result.push(zero_count);
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    result
}

/// Decode zerocoded data back to original format
pub fn decode(data: &[u8]) -> NetworkResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0x00 {
            let count = *data.get(i + 1).ok_or_else(|| {
                NetworkError::malformed("Truncated zerocode sequence")
            })?;
            if count == 0 {
                return Err(NetworkError::malformed(format!(
                    "Zero-length zerocode run at offset {}",
                    i
                )));
            }
            result.resize(result.len() + count as usize, 0x00);
            i += 2;
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    Ok(result)
}
