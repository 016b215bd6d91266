#![allow(dead_code)]

use lludp_tunnel::networking::serialization::framing::{build_packet, parse_packet};
use lludp_tunnel::networking::serialization::template_registry::protocol_templates;
use lludp_tunnel::networking::serialization::{InboundPacket, PacketFlags, PacketHeader};
use lludp_tunnel::networking::{
    BlockTemplate, Frame, Frequency, MessageBlocks, MessageBuilder, MessageCatalogue,
    MessageTemplate, Quantity, TemplateCodec, Value, VariableType, WireMessage,
};
use std::net::SocketAddrV4;
use std::sync::Arc;
use uuid::Uuid;

pub const SESSION: &str = "5d2c7f0e-session";

pub fn simulator() -> SocketAddrV4 {
    "127.0.0.1:13000".parse().unwrap()
}

/// Protocol templates plus two application messages
pub fn catalogue() -> Arc<MessageCatalogue> {
    let chat = MessageTemplate::new("ChatFromSimulator", Frequency::Low, 139)
        .trusted(true)
        .block(
            BlockTemplate::new("ChatData", Quantity::Single)
                .variable("FromName", VariableType::Variable1)
                .variable("Message", VariableType::Variable2),
        );
    let agent = MessageTemplate::new("AgentUpdate", Frequency::High, 4)
        .zero_coded(true)
        .block(
            BlockTemplate::new("AgentData", Quantity::Single)
                .variable("AgentID", VariableType::LLUUID)
                .variable("Flags", VariableType::U8),
        );
    Arc::new(MessageCatalogue::new(
        [chat, agent].into_iter().chain(protocol_templates()),
    ))
}

pub fn codec() -> TemplateCodec {
    TemplateCodec::new(catalogue())
}

pub fn agent_update(flags: u8) -> MessageBlocks {
    MessageBuilder::new()
        .block(
            "AgentData",
            [("AgentID", Value::Uuid(Uuid::nil())), ("Flags", Value::U8(flags))],
        )
        .build()
}

pub fn chat(message: &str) -> MessageBlocks {
    MessageBuilder::new()
        .block(
            "ChatData",
            [("FromName", Value::from("Governor Linden")), ("Message", Value::from(message))],
        )
        .build()
}

pub fn packet_ack(ids: &[u32]) -> MessageBlocks {
    ids.iter()
        .fold(MessageBuilder::new().empty_block("Packets"), |builder, id| {
            builder.block("Packets", [("ID", Value::U32(*id))])
        })
        .build()
}

/// A packet as the simulator would send it
pub fn inbound(name: &str, data: &MessageBlocks, sequence: u32, reliable: bool, acks: &[u32]) -> Frame {
    let body = codec().serialize(name, data).unwrap();
    let flags = if reliable {
        PacketFlags::RELIABLE
    } else {
        PacketFlags::empty()
    };
    let header = PacketHeader {
        target: simulator(),
        flags,
        sequence,
    };
    Frame::Binary(build_packet(&header, &body, acks))
}

/// Parse an outbound binary frame back into its packet and message
pub fn decode_outbound(frame: &Frame) -> Option<(InboundPacket, WireMessage)> {
    match frame {
        Frame::Binary(data) => {
            let packet = parse_packet(data).unwrap();
            let message = codec().deserialize(&packet.body).unwrap();
            Some((packet, message))
        }
        Frame::Text(_) => None,
    }
}
