//! Per-type binary readers and writers for template variables

use crate::networking::packets::{Value, VariableType};
use crate::networking::serialization::PacketBuffer;
use crate::networking::{NetworkError, NetworkResult};
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Appends the wire form of `value` as a `kind` variable named `name`
pub fn encode(kind: VariableType, name: &str, value: &Value, out: &mut BytesMut) -> NetworkResult<()> {
    match (kind, value) {
        (VariableType::Null, _) => {}

        (VariableType::Fixed(size), Value::Text(s)) => put_fixed(out, s.as_bytes(), size),
        (VariableType::Fixed(size), Value::Bytes(b)) => put_fixed(out, b, size),

        (VariableType::Variable1, Value::Text(_) | Value::Bytes(_)) => {
            let payload = variable_payload(value);
            let len = u8::try_from(payload.len()).map_err(|_| {
                NetworkError::invalid(name, format!("{} bytes exceed Variable 1 limit of 255", payload.len()))
            })?;
            out.put_u8(len);
            out.put_slice(&payload);
        }
        (VariableType::Variable2, Value::Text(_) | Value::Bytes(_)) => {
            let payload = variable_payload(value);
            let len = u16::try_from(payload.len()).map_err(|_| {
                NetworkError::invalid(name, format!("{} bytes exceed Variable 2 limit of 65535", payload.len()))
            })?;
            // Little-endian on the wire, whatever the template docs say
            out.put_u16_le(len);
            out.put_slice(&payload);
        }

        (VariableType::U8, Value::U8(v)) => out.put_u8(*v),
        (VariableType::S8, Value::S8(v)) => out.put_i8(*v),
        (VariableType::U16, Value::U16(v)) => out.put_u16_le(*v),
        (VariableType::S16, Value::S16(v)) => out.put_i16_le(*v),
        (VariableType::U32, Value::U32(v)) => out.put_u32_le(*v),
        (VariableType::S32, Value::S32(v)) => out.put_i32_le(*v),
        (VariableType::U64, Value::U64([first, second])) => {
            out.put_u32_le(*first);
            out.put_u32_le(*second);
        }
        (VariableType::S64, Value::S64([first, second])) => {
            out.put_i32_le(*first);
            out.put_i32_le(*second);
        }
        (VariableType::F32, Value::F32(v)) => out.put_f32_le(*v),
        (VariableType::F64, Value::F64(v)) => out.put_f64_le(*v),

        (VariableType::LLVector3, Value::Vector3(v)) | (VariableType::LLQuaternion, Value::Quaternion(v)) => {
            v.iter().for_each(|c| out.put_f32_le(*c));
        }
        (VariableType::LLVector4, Value::Vector4(v)) => v.iter().for_each(|c| out.put_f32_le(*c)),
        (VariableType::LLVector3d, Value::Vector3d(v)) => v.iter().for_each(|c| out.put_f64_le(*c)),

        (VariableType::LLUUID, Value::Uuid(id)) => out.put_slice(id.as_bytes()),
        (VariableType::LLUUID, Value::Text(s)) => {
            let id = Uuid::parse_str(s).map_err(|e| NetworkError::invalid(name, e.to_string()))?;
            out.put_slice(id.as_bytes());
        }

        (VariableType::BOOL, Value::Bool(b)) => out.put_u8(u8::from(*b)),

        (VariableType::IPADDR, Value::IpAddr(addr)) => out.put_slice(&addr.octets()),
        (VariableType::IPADDR, Value::Text(s)) => {
            let addr: Ipv4Addr = s.parse().map_err(|e: std::net::AddrParseError| NetworkError::invalid(name, e.to_string()))?;
            out.put_slice(&addr.octets());
        }
        (VariableType::IPPORT, Value::IpPort(port) | Value::U16(port)) => out.put_u16_le(*port),

        (kind, value) => {
            return Err(NetworkError::invalid(
                name,
                format!("cannot encode {:?} as {:?}", value, kind),
            ));
        }
    }
    Ok(())
}

/// Reads one `kind` variable at the buffer's cursor
pub fn decode(kind: VariableType, buffer: &mut PacketBuffer<'_>) -> NetworkResult<Value> {
    let value = match kind {
        VariableType::Null => Value::Null,
        VariableType::Fixed(size) => Value::Bytes(buffer.take(size)?.to_vec()),
        VariableType::Variable1 => {
            let len = buffer.get_u8()? as usize;
            Value::Bytes(buffer.take(len)?.to_vec())
        }
        VariableType::Variable2 => {
            let len = buffer.get_u16_le()? as usize;
            Value::Bytes(buffer.take(len)?.to_vec())
        }
        VariableType::U8 => Value::U8(buffer.get_u8()?),
        VariableType::S8 => Value::S8(buffer.get_u8()? as i8),
        VariableType::U16 => Value::U16(buffer.get_u16_le()?),
        VariableType::S16 => Value::S16(buffer.get_u16_le()? as i16),
        VariableType::U32 => Value::U32(buffer.get_u32_le()?),
        VariableType::S32 => Value::S32(buffer.get_u32_le()? as i32),
        // Words come back high word first; encode writes them in the order given.
        VariableType::U64 => {
            let low = buffer.get_u32_le()?;
            let high = buffer.get_u32_le()?;
            Value::U64([high, low])
        }
        VariableType::S64 => {
            let low = buffer.get_u32_le()? as i32;
            let high = buffer.get_u32_le()? as i32;
            Value::S64([high, low])
        }
        VariableType::F32 => Value::F32(buffer.get_f32_le()?),
        VariableType::F64 => Value::F64(buffer.get_f64_le()?),
        VariableType::LLVector3 => Value::Vector3(read_f32s(buffer)?),
        VariableType::LLQuaternion => Value::Quaternion(read_f32s(buffer)?),
        VariableType::LLVector4 => Value::Vector4(read_f32s(buffer)?),
        VariableType::LLVector3d => {
            Value::Vector3d([buffer.get_f64_le()?, buffer.get_f64_le()?, buffer.get_f64_le()?])
        }
        VariableType::LLUUID => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(buffer.take(16)?);
            Value::Uuid(Uuid::from_bytes(raw))
        }
        VariableType::BOOL => Value::Bool(buffer.get_u8()? != 0),
        VariableType::IPADDR => {
            let octets = buffer.take(4)?;
            Value::IpAddr(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
        }
        VariableType::IPPORT => Value::IpPort(buffer.get_u16_le()?),
    };
    Ok(value)
}

fn read_f32s<const N: usize>(buffer: &mut PacketBuffer<'_>) -> NetworkResult<[f32; N]> {
    let mut out = [0f32; N];
    for component in out.iter_mut() {
        *component = buffer.get_f32_le()?;
    }
    Ok(out)
}

fn put_fixed(out: &mut BytesMut, data: &[u8], size: usize) {
    let len = data.len().min(size);
    out.put_slice(&data[..len]);
    out.put_bytes(0, size - len);
}

/// Strings are NUL-terminated on the wire; byte arrays are sent as-is
fn variable_payload(value: &Value) -> Vec<u8> {
    match value {
        Value::Text(s) => {
            let mut bytes = Vec::with_capacity(s.len() + 1);
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
            bytes
        }
        Value::Bytes(b) => b.clone(),
        _ => Vec::new(),
    }
}
