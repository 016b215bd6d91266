//! LLUDP wire data types
//!
//! `VariableType` is the closed set of primitive kinds a template variable can
//! declare; `Value` is the in-memory form of one decoded (or to-be-encoded) variable.

use crate::networking::{NetworkError, NetworkResult};
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// Primitive wire type of a template variable
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableType {
    Null,
    /// Raw bytes of exactly this many octets
    Fixed(usize),
    /// 1-byte length prefix
    Variable1,
    /// 2-byte little-endian length prefix
    Variable2,
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
    LLVector3,
    LLVector3d,
    LLVector4,
    LLQuaternion,
    LLUUID,
    BOOL,
    IPADDR,
    IPPORT,
}

impl VariableType {
    /// Wire size for fixed-width types, `None` for length-prefixed ones
    pub fn fixed_size(&self) -> Option<usize> {
        let size = match self {
            VariableType::Null => 0,
            VariableType::Fixed(n) => *n,
            VariableType::Variable1 | VariableType::Variable2 => return None,
            VariableType::U8 | VariableType::S8 | VariableType::BOOL => 1,
            VariableType::U16 | VariableType::S16 | VariableType::IPPORT => 2,
            VariableType::U32 | VariableType::S32 | VariableType::F32 | VariableType::IPADDR => 4,
            VariableType::U64 | VariableType::S64 | VariableType::F64 => 8,
            VariableType::LLVector3 | VariableType::LLQuaternion => 12,
            VariableType::LLVector4 | VariableType::LLUUID => 16,
            VariableType::LLVector3d => 24,
        };
        Some(size)
    }
}

impl FromStr for VariableType {
    type Err = String;

    /// Parses the type column of a template variable, e.g. `U32`, `Variable 1` or `Fixed 32`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let size = |parts: &[&str]| -> Result<usize, String> {
            parts
                .get(1)
                .ok_or_else(|| format!("Missing size for type '{}'", s))?
                .parse::<usize>()
                .map_err(|e| format!("Invalid size in '{}': {}", s, e))
        };

        match parts.first().copied() {
            Some("Null") => Ok(VariableType::Null),
            Some("Fixed") => Ok(VariableType::Fixed(size(&parts)?)),
            Some("Variable") => match size(&parts)? {
                1 => Ok(VariableType::Variable1),
                2 => Ok(VariableType::Variable2),
                n => Err(format!("Unsupported Variable width {}", n)),
            },
            Some("U8") => Ok(VariableType::U8),
            Some("U16") => Ok(VariableType::U16),
            Some("U32") => Ok(VariableType::U32),
            Some("U64") => Ok(VariableType::U64),
            Some("S8") => Ok(VariableType::S8),
            Some("S16") => Ok(VariableType::S16),
            Some("S32") => Ok(VariableType::S32),
            Some("S64") => Ok(VariableType::S64),
            Some("F32") => Ok(VariableType::F32),
            Some("F64") => Ok(VariableType::F64),
            Some("LLVector3") => Ok(VariableType::LLVector3),
            Some("LLVector3d") => Ok(VariableType::LLVector3d),
            Some("LLVector4") => Ok(VariableType::LLVector4),
            Some("LLQuaternion") => Ok(VariableType::LLQuaternion),
            Some("LLUUID") => Ok(VariableType::LLUUID),
            Some("BOOL") => Ok(VariableType::BOOL),
            Some("IPADDR") => Ok(VariableType::IPADDR),
            Some("IPPORT") => Ok(VariableType::IPPORT),
            _ => Err(format!("Unknown variable type: {}", s)),
        }
    }
}

/// A single variable value, as read from or written to the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    U8(u8),
    U16(u16),
    U32(u32),
    /// Two 32-bit words, in the order the codec produces them
    U64([u32; 2]),
    S8(i8),
    S16(i16),
    S32(i32),
    S64([i32; 2]),
    F32(f32),
    F64(f64),
    Vector3([f32; 3]),
    Vector3d([f64; 3]),
    Vector4([f32; 4]),
    /// x, y, z only; see [`quaternion_w`]
    Quaternion([f32; 3]),
    Uuid(Uuid),
    Bool(bool),
    IpAddr(Ipv4Addr),
    IpPort(u16),
}

macro_rules! value_accessor {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $name(&self) -> NetworkResult<$ty> {
            match self {
                Value::$variant(v) => Ok(*v),
                other => Err(NetworkError::malformed(format!(
                    concat!("Expected ", $label, ", got {:?}"),
                    other
                ))),
            }
        }
    };
}

impl Value {
    value_accessor!(as_u8, U8, u8, "U8");
    value_accessor!(as_u16, U16, u16, "U16");
    value_accessor!(as_u32, U32, u32, "U32");
    value_accessor!(as_s32, S32, i32, "S32");
    value_accessor!(as_f32, F32, f32, "F32");
    value_accessor!(as_f64, F64, f64, "F64");
    value_accessor!(as_vector3, Vector3, [f32; 3], "LLVector3");
    value_accessor!(as_quaternion, Quaternion, [f32; 3], "LLQuaternion");
    value_accessor!(as_uuid, Uuid, Uuid, "LLUUID");
    value_accessor!(as_bool, Bool, bool, "BOOL");
    value_accessor!(as_ip_addr, IpAddr, Ipv4Addr, "IPADDR");
    value_accessor!(as_ip_port, IpPort, u16, "IPPORT");

    pub fn as_bytes(&self) -> NetworkResult<&[u8]> {
        match self {
            Value::Bytes(v) => Ok(v),
            Value::Text(s) => Ok(s.as_bytes()),
            other => Err(NetworkError::malformed(format!(
                "Expected Variable/Fixed bytes, got {:?}",
                other
            ))),
        }
    }

    /// Decodes a string field, dropping the trailing NUL the wire format carries
    pub fn as_text(&self) -> NetworkResult<String> {
        match self {
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(bytes) => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            other => Err(NetworkError::malformed(format!(
                "Expected string bytes, got {:?}",
                other
            ))),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Uuid> for Value {
    fn from(id: Uuid) -> Self {
        Value::Uuid(id)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Rebuilds the w component of a unit quaternion sent as x, y, z
pub fn quaternion_w(xyz: [f32; 3]) -> f32 {
    let [x, y, z] = xyz;
    let t = 1.0 - (x * x + y * y + z * z);
    if t > 0.0 {
        t.sqrt()
    } else {
        0.0
    }
}
