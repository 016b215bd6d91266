//! LLUDP message serialization and deserialization
//!
//! The template codec turns structured message data into message bodies (number
//! header + blocks) and back, driven entirely by the template catalogue.
//! Packet framing (flags, sequence numbers, acks) lives in [`framing`].

use crate::networking::packets::{Frequency, MessageBlocks, MessageTemplate, Quantity, Record, WireMessage};
use crate::networking::{NetworkError, NetworkResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

pub mod framing;
pub mod packet_buffer;
pub mod primitive;
pub mod template_parser;
pub mod template_registry;
pub mod zerocode;

pub use framing::{InboundPacket, PacketFlags, PacketHeader};
pub use packet_buffer::PacketBuffer;
pub use template_registry::MessageCatalogue;

/// Serializes and deserializes message bodies against a template catalogue
#[derive(Debug, Clone)]
pub struct TemplateCodec {
    catalogue: Arc<MessageCatalogue>,
}

impl TemplateCodec {
    pub fn new(catalogue: Arc<MessageCatalogue>) -> Self {
        Self { catalogue }
    }

    pub fn catalogue(&self) -> &MessageCatalogue {
        &self.catalogue
    }

    pub fn template(&self, name: &str) -> NetworkResult<&Arc<MessageTemplate>> {
        self.catalogue.get(name).ok_or_else(|| NetworkError::UnknownMessageType {
            name: name.to_string(),
        })
    }

    /// Serialize `data` as the message called `name`
    pub fn serialize(&self, name: &str, data: &MessageBlocks) -> NetworkResult<Bytes> {
        let template = self.template(name)?;
        encode_message(template, data)
    }

    /// Parse a (zero-decoded) message body
    pub fn deserialize(&self, data: &[u8]) -> NetworkResult<WireMessage> {
        let mut buffer = PacketBuffer::new(data);
        let (frequency, number) = read_message_number(&mut buffer)?;

        let template = self
            .catalogue
            .get_by_number(frequency, number)
            .ok_or(NetworkError::UnknownMessageNumber { frequency, number })?;

        let mut blocks = MessageBlocks::new();
        for block in &template.blocks {
            let count = match block.quantity {
                Quantity::Single => 1,
                Quantity::Multiple(n) => n,
                Quantity::Variable => buffer.get_u8()? as usize,
            };

            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                let mut record = Record::with_capacity(block.variables.len());
                for variable in &block.variables {
                    let value = primitive::decode(variable.kind, &mut buffer).map_err(|e| match e {
                        NetworkError::MalformedMessage { reason } => NetworkError::malformed(format!(
                            "{}.{}.{}: {}",
                            template.name, block.name, variable.name, reason
                        )),
                        other => other,
                    })?;
                    record.insert(variable.name.clone(), value);
                }
                records.push(record);
            }
            blocks.insert(block.name.clone(), records);
        }

        if buffer.remaining() > 0 {
            debug!(
                "Message '{}' has {} trailing bytes after its last block",
                template.name,
                buffer.remaining()
            );
        }

        Ok(WireMessage {
            name: template.name.clone(),
            frequency,
            number,
            trusted: template.trusted,
            zero_coded: template.zero_coded,
            blocks,
            size: buffer.position(),
        })
    }
}

/// Serialize `data` against an already resolved template
pub fn encode_message(template: &MessageTemplate, data: &MessageBlocks) -> NetworkResult<Bytes> {
    let mut out = BytesMut::with_capacity(64);
    write_message_number(&mut out, template.frequency, template.number);

    for block in &template.blocks {
        let records = data.get(&block.name).map(Vec::as_slice).unwrap_or(&[]);

        match block.quantity {
            Quantity::Single | Quantity::Multiple(_) => {
                let expected = match block.quantity {
                    Quantity::Multiple(n) => n,
                    _ => 1,
                };
                if records.len() != expected {
                    return Err(NetworkError::QuantityMismatch {
                        block: block.name.clone(),
                        expected,
                        actual: records.len(),
                    });
                }
            }
            Quantity::Variable => {
                let count = u8::try_from(records.len()).map_err(|_| {
                    NetworkError::invalid(
                        &block.name,
                        format!("{} instances exceed the Variable block limit of 255", records.len()),
                    )
                })?;
                out.put_u8(count);
            }
        }

        for record in records {
            for variable in &block.variables {
                let value = record.get(&variable.name).ok_or_else(|| {
                    NetworkError::invalid(
                        &format!("{}.{}", block.name, variable.name),
                        "missing from message data",
                    )
                })?;
                primitive::encode(variable.kind, &variable.name, value, &mut out)?;
            }
        }
    }

    Ok(out.freeze())
}

fn write_message_number(out: &mut BytesMut, frequency: Frequency, number: u32) {
    match frequency {
        Frequency::High => out.put_u8(number as u8),
        Frequency::Medium => {
            out.put_u8(0xFF);
            out.put_u8(number as u8);
        }
        Frequency::Low => {
            out.put_u16(0xFFFF);
            out.put_u16(number as u16);
        }
        Frequency::Fixed => out.put_u32(number),
    }
}

/// Determine frequency and number from the first body bytes
fn read_message_number(buffer: &mut PacketBuffer<'_>) -> NetworkResult<(Frequency, u32)> {
    let first = buffer
        .peek_u8(0)
        .ok_or_else(|| NetworkError::malformed("Empty message body"))?;
    if first < 0xFF {
        buffer.get_u8()?;
        return Ok((Frequency::High, first as u32));
    }

    let second = buffer
        .peek_u8(1)
        .ok_or_else(|| NetworkError::malformed("Truncated medium frequency number"))?;
    if second < 0xFF {
        buffer.take(2)?;
        return Ok((Frequency::Medium, second as u32));
    }

    let full = buffer.get_u32_be()?;
    let low = full & 0xFFFF;
    if low < 65530 {
        Ok((Frequency::Low, low))
    } else {
        Ok((Frequency::Fixed, full))
    }
}
