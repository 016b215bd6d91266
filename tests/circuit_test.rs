mod common;

use common::*;
use lludp_tunnel::config::CircuitSettings;
use lludp_tunnel::networking::serialization::{InboundPacket, PacketFlags};
use lludp_tunnel::networking::{
    close_code, Circuit, CircuitAction, CircuitState, Frame, MessageBuilder, NetworkError, Value,
    WireMessage,
};
use std::time::{Duration, Instant};

fn new_circuit(settings: CircuitSettings) -> Circuit {
    Circuit::new(codec(), SESSION, simulator(), settings)
}

fn open_circuit(settings: CircuitSettings, now: Instant) -> Circuit {
    let mut circuit = new_circuit(settings);
    circuit.on_transport_open();
    circuit.on_transport_message(Frame::Text("ok".into()), now);
    drain(&mut circuit);
    circuit
}

fn drain(circuit: &mut Circuit) -> Vec<CircuitAction> {
    std::iter::from_fn(|| circuit.poll_action()).collect()
}

fn transmitted(circuit: &mut Circuit) -> Vec<(InboundPacket, WireMessage)> {
    drain(circuit)
        .iter()
        .filter_map(|action| match action {
            CircuitAction::Transmit(frame) => decode_outbound(frame),
            _ => None,
        })
        .collect()
}

fn explicit_acks(sent: &[(InboundPacket, WireMessage)]) -> Vec<u32> {
    sent.iter()
        .filter(|(_, message)| message.name == "PacketAck")
        .flat_map(|(_, message)| message.block("Packets").to_vec())
        .filter_map(|record| record.get("ID").and_then(|v| v.as_u32().ok()))
        .collect()
}

#[test]
fn test_handshake_flushes_buffered_sends_in_order() {
    let now = Instant::now();
    let mut circuit = new_circuit(CircuitSettings::default());

    circuit.on_transport_open();
    assert_eq!(
        drain(&mut circuit),
        vec![CircuitAction::Transmit(Frame::Text(SESSION.to_string()))]
    );

    circuit.send("AgentUpdate", &agent_update(1), false, now).unwrap();
    circuit.send("AgentUpdate", &agent_update(2), false, now).unwrap();
    assert!(circuit.poll_action().is_none());
    assert_eq!(circuit.state(), CircuitState::Connecting);

    circuit.on_transport_message(Frame::Text("ok".into()), now);
    assert_eq!(circuit.state(), CircuitState::Open);

    let sent = transmitted(&mut circuit);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0.header.sequence, 1);
    assert_eq!(sent[1].0.header.sequence, 2);
    assert!(sent[0].0.header.flags.contains(PacketFlags::ZEROCODED));
    assert_eq!(sent[0].1.value("AgentData", "Flags").unwrap(), &Value::U8(1));
    assert_eq!(sent[1].1.value("AgentData", "Flags").unwrap(), &Value::U8(2));
}

#[test]
fn test_handshake_failure_closes_terminally() {
    let mut circuit = new_circuit(CircuitSettings::default());
    circuit.on_transport_open();
    drain(&mut circuit);

    circuit.on_transport_message(Frame::Text("denied".into()), Instant::now());

    assert_eq!(circuit.state(), CircuitState::Closed);
    let notice = circuit.close_notice().unwrap();
    assert_eq!(notice.code, close_code::POLICY_VIOLATION);
    assert!(matches!(notice.error, Some(NetworkError::HandshakeFailed { .. })));
    assert!(matches!(
        drain(&mut circuit).as_slice(),
        [CircuitAction::CloseTransport { code: close_code::POLICY_VIOLATION, .. }]
    ));
}

#[test]
fn test_unknown_message_sends_nothing() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);

    let err = circuit
        .send("Foo", &MessageBuilder::new().build(), false, now)
        .unwrap_err();
    assert_eq!(err, NetworkError::UnknownMessageType { name: "Foo".into() });
    assert!(circuit.poll_action().is_none());
    assert_eq!(circuit.sequence_number(), 0);
}

#[test]
fn test_reliable_send_attempted_four_times_then_times_out() {
    let start = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), start);

    let mut ack = circuit
        .send("AgentUpdate", &agent_update(7), true, start)
        .unwrap()
        .unwrap();
    let mut attempts = transmitted(&mut circuit).len();
    assert_eq!(attempts, 1);

    for tick in 1..=20u32 {
        let now = start + Duration::from_millis(100) * tick;
        circuit.on_tick(now);
        // Keep the circuit alive without acking anything
        for (packet, message) in transmitted(&mut circuit) {
            if message.name == "AgentUpdate" {
                assert_eq!(packet.header.sequence, ack.sequence());
                assert!(packet.header.flags.contains(PacketFlags::RESENT));
                assert!(tick % 5 == 0, "resent early at tick {}", tick);
                attempts += 1;
            }
        }
    }

    assert_eq!(attempts, 4);
    assert_eq!(
        ack.try_result(),
        Some(Err(NetworkError::Timeout { sequence: ack.sequence() }))
    );
    assert_eq!(circuit.stats().pending_reliable, 0);
    assert_eq!(circuit.stats().resends, 3);
}

#[test]
fn test_acks_resolve_reliable_sends() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);

    let mut first = circuit.send("AgentUpdate", &agent_update(1), true, now).unwrap().unwrap();
    let mut second = circuit.send("AgentUpdate", &agent_update(2), true, now).unwrap().unwrap();
    drain(&mut circuit);
    assert_eq!(circuit.stats().pending_reliable, 2);

    // Explicit PacketAck for the first
    circuit.on_transport_message(inbound("PacketAck", &packet_ack(&[first.sequence()]), 1, false, &[]), now);
    assert_eq!(first.try_result(), Some(Ok(())));
    assert!(second.try_result().is_none());

    // Trailing ack on an ordinary packet for the second
    circuit.on_transport_message(inbound("ChatFromSimulator", &chat("hi"), 2, false, &[second.sequence()]), now);
    assert_eq!(second.try_result(), Some(Ok(())));
    assert_eq!(circuit.stats().pending_reliable, 0);
}

#[test]
fn test_inbound_ack_sent_twice_then_forgotten() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);

    circuit.on_transport_message(inbound("ChatFromSimulator", &chat("hello"), 77, true, &[]), now);

    circuit.on_tick(now + Duration::from_millis(100));
    let first = transmitted(&mut circuit);
    assert_eq!(explicit_acks(&first), vec![77]);
    let heartbeat = first
        .iter()
        .find(|(_, message)| message.name == "StartPingCheck")
        .unwrap();
    assert_eq!(heartbeat.1.value("PingID", "OldestUnacked").unwrap(), &Value::U32(77));
    assert_eq!(heartbeat.0.acks, vec![77]);

    circuit.on_tick(now + Duration::from_millis(200));
    circuit.on_tick(now + Duration::from_millis(300));
    let later = transmitted(&mut circuit);
    assert!(explicit_acks(&later).is_empty());
    assert!(later.iter().all(|(packet, _)| packet.acks.is_empty()));
    assert_eq!(circuit.stats().pending_inbound_acks, 0);
}

#[test]
fn test_outbound_packet_ack_carries_no_trailing_acks() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);

    for seq in 10..13 {
        circuit.on_transport_message(inbound("ChatFromSimulator", &chat("x"), seq, true, &[]), now);
    }
    circuit.on_tick(now + Duration::from_millis(100));

    let sent = transmitted(&mut circuit);
    let (ack_packet, _) = sent.iter().find(|(_, m)| m.name == "PacketAck").unwrap();
    assert!(ack_packet.acks.is_empty());
    assert!(!ack_packet.header.flags.contains(PacketFlags::ACK));
    assert_eq!(explicit_acks(&sent), vec![10, 11, 12]);
}

#[test]
fn test_duplicate_reliable_packet_dispatched_once() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);
    let mut chat_rx = circuit.subscribe("ChatFromSimulator");

    let frame = inbound("ChatFromSimulator", &chat("only once"), 5, true, &[]);
    circuit.on_transport_message(frame.clone(), now);
    circuit.on_transport_message(frame, now);

    let message = chat_rx.try_recv().unwrap();
    assert_eq!(message.value("ChatData", "Message").unwrap().as_text().unwrap(), "only once");
    assert!(chat_rx.try_recv().is_err());
    assert_eq!(circuit.sender_sequence_number(), 5);

    // Still acknowledged
    circuit.on_tick(now + Duration::from_millis(100));
    assert_eq!(explicit_acks(&transmitted(&mut circuit)), vec![5]);
}

#[test]
fn test_malformed_packet_dropped_circuit_continues() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);
    let mut chat_rx = circuit.subscribe("ChatFromSimulator");

    circuit.on_transport_message(Frame::Binary(vec![0u8; 7].into()), now);
    circuit.on_transport_message(inbound("ChatFromSimulator", &chat("after"), 9, false, &[]), now);

    assert_eq!(circuit.state(), CircuitState::Open);
    assert!(chat_rx.try_recv().is_ok());
}

#[test]
fn test_ping_echo_and_round_trip() {
    let start = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), start);

    let ping = MessageBuilder::new()
        .block("PingID", [("PingID", Value::U8(9)), ("OldestUnacked", Value::U32(0))])
        .build();
    circuit.on_transport_message(inbound("StartPingCheck", &ping, 3, false, &[]), start);
    let sent = transmitted(&mut circuit);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.name, "CompletePingCheck");
    assert_eq!(sent[0].1.value("PingID", "PingID").unwrap(), &Value::U8(9));

    circuit.on_tick(start + Duration::from_millis(100));
    let heartbeat = transmitted(&mut circuit)
        .into_iter()
        .find(|(_, m)| m.name == "StartPingCheck")
        .unwrap();
    let id = heartbeat.1.value("PingID", "PingID").unwrap().as_u8().unwrap();
    assert_eq!(id, 0);

    let pong = MessageBuilder::new().block("PingID", [("PingID", Value::U8(id))]).build();
    circuit.on_transport_message(
        inbound("CompletePingCheck", &pong, 4, false, &[]),
        start + Duration::from_millis(130),
    );

    let stats = circuit.stats();
    assert_eq!(stats.last_rtt, Some(Duration::from_millis(30)));
    assert_eq!(stats.pings_sent, 1);
}

#[test]
fn test_heartbeat_id_rolls_over() {
    let start = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), start);

    let mut ids = Vec::new();
    for tick in 1..=258u32 {
        let now = start + Duration::from_millis(100) * tick;
        // Keep the liveness counter low
        circuit.on_transport_message(Frame::Text("noise".into()), now);
        circuit.on_tick(now);
        for (_, message) in transmitted(&mut circuit) {
            if message.name == "StartPingCheck" {
                ids.push(message.value("PingID", "PingID").unwrap().as_u8().unwrap());
            }
        }
    }

    assert_eq!(ids.len(), 258);
    assert_eq!(&ids[..2], &[0, 1]);
    assert_eq!(&ids[255..], &[255, 0, 1]);
}

#[test]
fn test_reconnect_backoff_doubles() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);

    for (attempt, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400)] {
        circuit.on_transport_closed(close_code::ABNORMAL, "connection reset");
        assert_eq!(circuit.state(), CircuitState::Reconnecting);
        assert_eq!(circuit.reconnect_count(), attempt);
        assert_eq!(
            drain(&mut circuit),
            vec![CircuitAction::Reconnect {
                delay: Duration::from_millis(expected_ms)
            }]
        );
        // New transport opens but the handshake never completes
        circuit.on_transport_open();
        drain(&mut circuit);
    }

    // The count lives for the whole session
    circuit.on_transport_message(Frame::Text("ok".into()), now);
    assert_eq!(circuit.reconnect_count(), 3);
}

#[test]
fn test_accepting_then_dropping_peer_hits_reconnect_limit() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);

    for (attempt, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400)] {
        circuit.on_transport_closed(close_code::ABNORMAL, "connection reset");
        assert_eq!(circuit.reconnect_count(), attempt);
        assert_eq!(
            drain(&mut circuit),
            vec![CircuitAction::Reconnect {
                delay: Duration::from_millis(expected_ms)
            }]
        );
        circuit.on_transport_open();
        circuit.on_transport_message(Frame::Text("ok".into()), now);
        assert_eq!(circuit.state(), CircuitState::Open);
        drain(&mut circuit);
    }

    for _ in 3..10 {
        circuit.on_transport_closed(close_code::ABNORMAL, "connection reset");
        circuit.on_transport_open();
        circuit.on_transport_message(Frame::Text("ok".into()), now);
        drain(&mut circuit);
    }
    assert_eq!(circuit.reconnect_count(), 10);

    circuit.on_transport_closed(close_code::ABNORMAL, "connection reset");
    assert_eq!(circuit.state(), CircuitState::Closed);
    assert_eq!(
        circuit.close_notice().unwrap().error,
        Some(NetworkError::MaxReconnectsExceeded { attempts: 10 })
    );
}

#[test]
fn test_state_survives_reconnect() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);
    let mut ack = circuit.send("AgentUpdate", &agent_update(1), true, now).unwrap().unwrap();
    drain(&mut circuit);

    circuit.on_transport_closed(close_code::ABNORMAL, "lost");
    // Issued while reconnecting: held until the next handshake
    circuit.send("AgentUpdate", &agent_update(2), false, now).unwrap();
    drain(&mut circuit);

    circuit.on_transport_open();
    circuit.on_transport_message(Frame::Text("ok".into()), now);
    let sent = transmitted(&mut circuit);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.header.sequence, 2);

    assert!(ack.try_result().is_none());
    assert_eq!(circuit.stats().pending_reliable, 1);
    circuit.on_transport_message(inbound("PacketAck", &packet_ack(&[1]), 1, false, &[]), now);
    assert_eq!(ack.try_result(), Some(Ok(())));
}

#[test]
fn test_reconnect_limit_is_terminal() {
    let settings = CircuitSettings {
        max_reconnects: 2,
        ..CircuitSettings::default()
    };
    let mut circuit = open_circuit(settings, Instant::now());

    circuit.on_transport_closed(close_code::ABNORMAL, "reset");
    circuit.on_transport_closed(close_code::ABNORMAL, "reset");
    drain(&mut circuit);
    circuit.on_transport_closed(close_code::ABNORMAL, "reset");

    assert_eq!(circuit.state(), CircuitState::Closed);
    assert_eq!(
        circuit.close_notice().unwrap().error,
        Some(NetworkError::MaxReconnectsExceeded { attempts: 2 })
    );
    assert!(!drain(&mut circuit)
        .iter()
        .any(|action| matches!(action, CircuitAction::Reconnect { .. })));
}

#[test]
fn test_close_without_status_reconnects() {
    let mut circuit = open_circuit(CircuitSettings::default(), Instant::now());

    circuit.on_transport_closed(close_code::NO_STATUS, "closed without status");

    assert_eq!(circuit.state(), CircuitState::Reconnecting);
    assert_eq!(
        drain(&mut circuit),
        vec![CircuitAction::Reconnect {
            delay: Duration::from_millis(100)
        }]
    );
}

#[test]
fn test_policy_violation_does_not_reconnect() {
    let mut circuit = open_circuit(CircuitSettings::default(), Instant::now());

    circuit.on_transport_closed(close_code::POLICY_VIOLATION, "invalid session");

    assert_eq!(circuit.state(), CircuitState::Closed);
    let notice = circuit.close_notice().unwrap();
    assert_eq!(notice.code, close_code::POLICY_VIOLATION);
    assert_eq!(
        notice.error,
        Some(NetworkError::Disconnected { reason: "invalid session".into() })
    );
}

#[test]
fn test_liveness_timeout() {
    let settings = CircuitSettings {
        liveness_timeout_ticks: 5,
        ..CircuitSettings::default()
    };
    let start = Instant::now();
    let mut circuit = open_circuit(settings, start);
    let at = |tick: u32| start + Duration::from_millis(100) * tick;

    for tick in 1..=5 {
        circuit.on_tick(at(tick));
    }
    // Any inbound frame resets the counter
    circuit.on_transport_message(inbound("ChatFromSimulator", &chat("still here"), 1, false, &[]), at(5));
    for tick in 6..=10 {
        circuit.on_tick(at(tick));
    }
    assert_eq!(circuit.state(), CircuitState::Open);

    circuit.on_tick(at(11));
    assert_eq!(circuit.state(), CircuitState::Closed);
    let notice = circuit.close_notice().unwrap();
    assert_eq!(notice.code, close_code::LIVENESS_TIMEOUT);
    assert_eq!(notice.reason, "timeout");
    assert_eq!(
        notice.error,
        Some(NetworkError::Disconnected { reason: "timeout".into() })
    );
}

#[test]
fn test_explicit_close_detaches_everything() {
    let now = Instant::now();
    let mut circuit = open_circuit(CircuitSettings::default(), now);
    let mut chat_rx = circuit.subscribe("ChatFromSimulator");
    let mut ack = circuit.send("AgentUpdate", &agent_update(1), true, now).unwrap().unwrap();
    drain(&mut circuit);

    circuit.close();

    assert_eq!(
        drain(&mut circuit),
        vec![CircuitAction::CloseTransport {
            code: close_code::NORMAL,
            reason: "closed".into()
        }]
    );
    assert!(circuit.close_notice().unwrap().error.is_none());
    assert_eq!(ack.try_result(), Some(Err(NetworkError::CircuitClosed)));
    assert!(chat_rx.try_recv().is_err());

    // The transport's own close event is ignored afterwards
    circuit.on_transport_closed(close_code::NORMAL, "closed");
    circuit.on_tick(now + Duration::from_secs(1));
    assert!(drain(&mut circuit).is_empty());
    assert_eq!(
        circuit.send("AgentUpdate", &agent_update(2), false, now).unwrap_err(),
        NetworkError::CircuitClosed
    );
}
