//! Message template catalogue for name- and number-keyed lookups

use crate::networking::packets::{BlockTemplate, Frequency, MessageTemplate, Quantity, VariableType};
use crate::networking::serialization::template_parser;
use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Immutable catalogue of message templates, shared by both directions
#[derive(Debug, Clone, Default)]
pub struct MessageCatalogue {
    by_name: HashMap<String, Arc<MessageTemplate>>,
    by_number: HashMap<(Frequency, u32), Arc<MessageTemplate>>,
}

impl MessageCatalogue {
    pub fn new(templates: impl IntoIterator<Item = MessageTemplate>) -> Self {
        let mut catalogue = Self::default();
        for template in templates {
            let template = Arc::new(template);
            catalogue
                .by_number
                .insert((template.frequency, template.number), Arc::clone(&template));
            catalogue.by_name.insert(template.name.clone(), template);
        }
        catalogue
    }

    /// The templates the circuit itself sends and answers
    pub fn protocol_defaults() -> Self {
        Self::new(protocol_templates())
    }

    /// Loads a `message_template.msg` file. The circuit's own templates are
    /// added when the file does not define them.
    pub fn from_template_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read message template {}", path.display()))?;
        let mut templates = template_parser::parse(&content)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Failed to parse message template {}", path.display()))?;

        for template in protocol_templates() {
            if !templates.iter().any(|t| t.name == template.name) {
                templates.push(template);
            }
        }
        Ok(Self::new(templates))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MessageTemplate>> {
        self.by_name.get(name)
    }

    pub fn get_by_number(&self, frequency: Frequency, number: u32) -> Option<&Arc<MessageTemplate>> {
        self.by_number.get(&(frequency, number))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// `PacketAck`, `StartPingCheck` and `CompletePingCheck`
pub fn protocol_templates() -> Vec<MessageTemplate> {
    vec![
        MessageTemplate::new("StartPingCheck", Frequency::High, 1).block(
            BlockTemplate::new("PingID", Quantity::Single)
                .variable("PingID", VariableType::U8)
                .variable("OldestUnacked", VariableType::U32),
        ),
        MessageTemplate::new("CompletePingCheck", Frequency::High, 2)
            .block(BlockTemplate::new("PingID", Quantity::Single).variable("PingID", VariableType::U8)),
        MessageTemplate::new("PacketAck", Frequency::Fixed, 0xFFFF_FFFB)
            .block(BlockTemplate::new("Packets", Quantity::Variable).variable("ID", VariableType::U32)),
    ]
}
