//! Message templates and parsed message representations
//!
//! Templates describe the shape of every message (frequency class, number, blocks
//! and variables). They are loaded once and shared read-only by the serializer and
//! the deserializer. `WireMessage` is what subscribers receive for each inbound packet.

use crate::networking::{NetworkError, NetworkResult};
use std::collections::HashMap;

pub mod types;

pub use types::*;

/// Message frequency determines the message number encoding size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    /// 1 byte: the number itself
    High,
    /// 2 bytes: 0xFF + number
    Medium,
    /// 4 bytes: 0xFFFF + 16-bit number (big-endian)
    Low,
    /// 4 bytes: full 32-bit number (big-endian)
    Fixed,
}

/// How many instances of a block a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Single,
    Multiple(usize),
    /// Count is sent as a leading byte
    Variable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableTemplate {
    pub name: String,
    pub kind: VariableType,
}

impl VariableTemplate {
    pub fn new(name: impl Into<String>, kind: VariableType) -> Self {
        Self { name: name.into(), kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    pub name: String,
    pub quantity: Quantity,
    pub variables: Vec<VariableTemplate>,
}

impl BlockTemplate {
    pub fn new(name: impl Into<String>, quantity: Quantity) -> Self {
        Self {
            name: name.into(),
            quantity,
            variables: Vec::new(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, kind: VariableType) -> Self {
        self.variables.push(VariableTemplate::new(name, kind));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageTemplate {
    pub name: String,
    pub frequency: Frequency,
    pub number: u32,
    pub trusted: bool,
    pub zero_coded: bool,
    pub blocks: Vec<BlockTemplate>,
}

impl MessageTemplate {
    pub fn new(name: impl Into<String>, frequency: Frequency, number: u32) -> Self {
        Self {
            name: name.into(),
            frequency,
            number,
            trusted: false,
            zero_coded: false,
            blocks: Vec::new(),
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn zero_coded(mut self, zero_coded: bool) -> Self {
        self.zero_coded = zero_coded;
        self
    }

    pub fn block(mut self, block: BlockTemplate) -> Self {
        self.blocks.push(block);
        self
    }
}

/// One block instance: variable name -> value
pub type Record = HashMap<String, Value>;

/// Block name -> ordered block instances
pub type MessageBlocks = HashMap<String, Vec<Record>>;

/// Convenience builder for outbound message data
#[derive(Debug, Default, Clone)]
pub struct MessageBuilder {
    blocks: MessageBlocks,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one instance of `block`
    pub fn block<I, K>(mut self, block: &str, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let record: Record = variables.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.blocks.entry(block.to_string()).or_default().push(record);
        self
    }

    /// Declares `block` with zero instances (for Variable blocks)
    pub fn empty_block(mut self, block: &str) -> Self {
        self.blocks.entry(block.to_string()).or_default();
        self
    }

    pub fn build(self) -> MessageBlocks {
        self.blocks
    }
}

/// A parsed inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub name: String,
    pub frequency: Frequency,
    pub number: u32,
    pub trusted: bool,
    pub zero_coded: bool,
    pub blocks: MessageBlocks,
    /// Bytes consumed from the body, header included
    pub size: usize,
}

impl WireMessage {
    /// All instances of a block (empty if the message has none)
    pub fn block(&self, name: &str) -> &[Record] {
        self.blocks.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn single(&self, name: &str) -> NetworkResult<&Record> {
        let blocks = self.block(name);
        match blocks {
            [record] => Ok(record),
            _ => Err(NetworkError::malformed(format!(
                "Expected single block '{}' in '{}', found {}",
                name,
                self.name,
                blocks.len()
            ))),
        }
    }

    /// Value of `variable` in the first instance of `block`
    pub fn value(&self, block: &str, variable: &str) -> NetworkResult<&Value> {
        self.block(block)
            .first()
            .and_then(|record| record.get(variable))
            .ok_or_else(|| {
                NetworkError::malformed(format!(
                    "Variable '{}.{}' not found in '{}'",
                    block, variable, self.name
                ))
            })
    }
}
