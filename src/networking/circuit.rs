//! Circuit protocol engine
//!
//! A `Circuit` owns all per-session protocol state: sequence numbers, reliable
//! packets waiting for acknowledgement, inbound acks still to be sent, keepalive
//! and reconnect bookkeeping. It performs no I/O itself. The driver feeds it
//! transport events and timer ticks (with the current `Instant`) and drains the
//! resulting `CircuitAction`s.

use crate::config::CircuitSettings;
use crate::networking::packets::{MessageBlocks, MessageBuilder, MessageTemplate, Value, WireMessage};
use crate::networking::serialization::framing::{self, PacketFlags, PacketHeader, HEADER_SIZE, MAX_PIGGYBACK_ACKS};
use crate::networking::serialization::{encode_message, zerocode, TemplateCodec};
use crate::networking::transport::{close_code, Frame};
use crate::networking::{NetworkError, NetworkResult};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddrV4;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const PACKET_ACK: &str = "PacketAck";
const START_PING_CHECK: &str = "StartPingCheck";
const COMPLETE_PING_CHECK: &str = "CompletePingCheck";

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Transport open (or opening), handshake not yet confirmed
    Connecting,
    /// Handshake confirmed, packets flow
    Open,
    /// Transport lost, reconnect scheduled
    Reconnecting,
    /// Terminal
    Closed,
}

/// Why the circuit ended
#[derive(Debug, Clone, PartialEq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: String,
    /// `None` for an explicit close
    pub error: Option<NetworkError>,
}

/// I/O the driver must perform on the circuit's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitAction {
    Transmit(Frame),
    CloseTransport { code: u16, reason: String },
    /// Build a new transport after `delay`
    Reconnect { delay: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub last_rtt: Option<Duration>,
    pub pings_sent: u64,
    pub resends: u64,
    pub pending_reliable: usize,
    pub pending_inbound_acks: usize,
    pub reconnect_count: u32,
}

/// Completion of a reliable send
///
/// Resolves `Ok(())` once the peer acknowledges the packet, `Err(Timeout)` when
/// every attempt went unanswered, and `Err(CircuitClosed)` if the circuit ended
/// while the packet was still pending.
#[derive(Debug)]
pub struct Acknowledgement {
    sequence: u32,
    rx: oneshot::Receiver<NetworkResult<()>>,
}

impl Acknowledgement {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Non-blocking check; `None` while still pending
    pub fn try_result(&mut self) -> Option<NetworkResult<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(NetworkError::CircuitClosed)),
        }
    }
}

impl Future for Acknowledgement {
    type Output = NetworkResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(NetworkError::CircuitClosed)))
    }
}

/// Reliable packet waiting for acknowledgment
#[derive(Debug)]
struct OutboundPacket {
    sequence: u32,
    body: Bytes,
    acks: Vec<u32>,
    zero_encoded: bool,
    resend_count: u8,
    sent_at: Instant,
    completion: oneshot::Sender<NetworkResult<()>>,
}

/// One tunneled LLUDP circuit
pub struct Circuit {
    codec: TemplateCodec,
    settings: CircuitSettings,
    session_id: String,
    target: SocketAddrV4,
    state: CircuitState,
    /// Session id sent, waiting for the peer's acceptance
    awaiting_handshake: bool,

    /// Last sequence number issued
    sequence_number: u32,
    /// Last sequence number seen from the peer
    sender_sequence_number: u32,
    pending_outbound: Vec<OutboundPacket>,
    /// Inbound reliable sequence -> times explicitly acked
    pending_inbound_acks: HashMap<u32, u8>,
    /// Piggyback candidates, oldest first
    ack_fifo: VecDeque<u32>,
    /// Recently received reliable sequence numbers
    received: VecDeque<u32>,
    /// Packets issued before the handshake completed, in call order
    handshake_buffer: VecDeque<Bytes>,

    reconnect_count: u32,
    liveness: u32,
    ping_id: u8,
    outstanding_pings: HashMap<u8, Instant>,
    last_rtt: Option<Duration>,
    pings_sent: u64,
    resends: u64,

    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Arc<WireMessage>>>>,
    actions: VecDeque<CircuitAction>,
    close_notice: Option<CloseNotice>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("sequence_number", &self.sequence_number)
            .field("pending_outbound", &self.pending_outbound.len())
            .field("reconnect_count", &self.reconnect_count)
            .finish()
    }
}

impl Circuit {
    pub fn new(
        codec: TemplateCodec,
        session_id: impl Into<String>,
        target: SocketAddrV4,
        settings: CircuitSettings,
    ) -> Self {
        Self {
            codec,
            settings,
            session_id: session_id.into(),
            target,
            state: CircuitState::Connecting,
            awaiting_handshake: false,
            sequence_number: 0,
            sender_sequence_number: 0,
            pending_outbound: Vec::new(),
            pending_inbound_acks: HashMap::new(),
            ack_fifo: VecDeque::new(),
            received: VecDeque::new(),
            handshake_buffer: VecDeque::new(),
            reconnect_count: 0,
            liveness: 0,
            ping_id: 0,
            outstanding_pings: HashMap::new(),
            last_rtt: None,
            pings_sent: 0,
            resends: 0,
            subscribers: HashMap::new(),
            actions: VecDeque::new(),
            close_notice: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn sender_sequence_number(&self) -> u32 {
        self.sender_sequence_number
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count
    }

    pub fn close_notice(&self) -> Option<&CloseNotice> {
        self.close_notice.as_ref()
    }

    pub fn settings(&self) -> &CircuitSettings {
        &self.settings
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            state: self.state,
            last_rtt: self.last_rtt,
            pings_sent: self.pings_sent,
            resends: self.resends,
            pending_reliable: self.pending_outbound.len(),
            pending_inbound_acks: self.pending_inbound_acks.len(),
            reconnect_count: self.reconnect_count,
        }
    }

    /// Next queued action for the driver
    pub fn poll_action(&mut self) -> Option<CircuitAction> {
        self.actions.pop_front()
    }

    /// Receive every inbound message called `name`
    pub fn subscribe(&mut self, name: &str) -> mpsc::UnboundedReceiver<Arc<WireMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.state != CircuitState::Closed {
            self.subscribers.entry(name.to_string()).or_default().push(tx);
        }
        rx
    }

    /// Serialize and send a message. Reliable sends return an [`Acknowledgement`].
    ///
    /// Sends issued before the handshake completes are queued and flushed in call order.
    pub fn send(
        &mut self,
        name: &str,
        data: &MessageBlocks,
        reliable: bool,
        now: Instant,
    ) -> NetworkResult<Option<Acknowledgement>> {
        if self.state == CircuitState::Closed {
            return Err(NetworkError::CircuitClosed);
        }
        let template = Arc::clone(self.codec.template(name)?);
        let body = encode_message(&template, data)?;
        Ok(self.send_body(&template, body, reliable, now))
    }

    fn send_body(
        &mut self,
        template: &MessageTemplate,
        body: Bytes,
        reliable: bool,
        now: Instant,
    ) -> Option<Acknowledgement> {
        let sequence = self.next_sequence();
        let (body, zero_encoded) = if template.zero_coded {
            (Bytes::from(zerocode::encode(&body)), true)
        } else {
            (body, false)
        };

        let acks = if template.name == PACKET_ACK {
            Vec::new()
        } else {
            self.take_piggyback_acks(HEADER_SIZE + body.len())
        };

        let mut flags = PacketFlags::empty();
        flags.set(PacketFlags::RELIABLE, reliable);
        flags.set(PacketFlags::ZEROCODED, zero_encoded);
        let header = PacketHeader {
            target: self.target,
            flags,
            sequence,
        };
        let packet = framing::build_packet(&header, &body, &acks);
        debug!(
            "Sending {} seq={} reliable={} ({} bytes, {} acks)",
            template.name,
            sequence,
            reliable,
            packet.len(),
            acks.len()
        );

        let acknowledgement = reliable.then(|| {
            let (tx, rx) = oneshot::channel();
            self.pending_outbound.push(OutboundPacket {
                sequence,
                body,
                acks,
                zero_encoded,
                resend_count: 0,
                sent_at: now,
                completion: tx,
            });
            Acknowledgement { sequence, rx }
        });

        self.transmit(packet);
        acknowledgement
    }

    fn next_sequence(&mut self) -> u32 {
        loop {
            self.sequence_number = self.sequence_number.wrapping_add(1);
            let sequence = self.sequence_number;
            if !self.pending_outbound.iter().any(|p| p.sequence == sequence) {
                return sequence;
            }
        }
    }

    /// Drain as many queued inbound acks as fit after `used` bytes
    fn take_piggyback_acks(&mut self, used: usize) -> Vec<u32> {
        let room = self.settings.max_packet_size.saturating_sub(used + 1) / 4;
        let count = self.ack_fifo.len().min(MAX_PIGGYBACK_ACKS).min(room);
        self.ack_fifo.drain(..count).collect()
    }

    fn transmit(&mut self, packet: Bytes) {
        if self.state == CircuitState::Open {
            self.actions.push_back(CircuitAction::Transmit(Frame::Binary(packet)));
        } else {
            self.handshake_buffer.push_back(packet);
        }
    }

    /// The transport (re)opened: present the session id and wait for acceptance
    pub fn on_transport_open(&mut self) {
        if self.state == CircuitState::Closed {
            return;
        }
        info!("Circuit {} transport open, sending session id", self.target);
        self.state = CircuitState::Connecting;
        self.awaiting_handshake = true;
        self.actions
            .push_back(CircuitAction::Transmit(Frame::Text(self.session_id.clone())));
    }

    pub fn on_transport_message(&mut self, frame: Frame, now: Instant) {
        if self.state == CircuitState::Closed {
            return;
        }
        self.liveness = 0;

        if self.awaiting_handshake {
            match frame {
                Frame::Text(text) if text == self.settings.handshake_ack => self.complete_handshake(),
                other => {
                    warn!("Circuit {} handshake rejected: {:?}", self.target, other);
                    self.terminate(
                        close_code::POLICY_VIOLATION,
                        "handshake failed",
                        NetworkError::HandshakeFailed {
                            reason: "unexpected first frame".to_string(),
                        },
                    );
                }
            }
            return;
        }

        match frame {
            Frame::Binary(data) => self.receive_packet(&data, now),
            Frame::Text(text) => debug!("Ignoring text frame after handshake: {}", text),
        }
    }

    fn complete_handshake(&mut self) {
        info!(
            "Circuit {} open, flushing {} queued packets",
            self.target,
            self.handshake_buffer.len()
        );
        self.awaiting_handshake = false;
        self.state = CircuitState::Open;
        while let Some(packet) = self.handshake_buffer.pop_front() {
            self.actions.push_back(CircuitAction::Transmit(Frame::Binary(packet)));
        }
    }

    fn receive_packet(&mut self, data: &[u8], now: Instant) {
        let packet = match framing::parse_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed packet ({} bytes): {}", data.len(), e);
                return;
            }
        };

        let sequence = packet.header.sequence;
        self.sender_sequence_number = sequence;

        for ack in &packet.acks {
            self.resolve_ack(*ack);
        }

        let mut duplicate = false;
        if packet.header.flags.contains(PacketFlags::RELIABLE) {
            self.queue_inbound_ack(sequence);
            duplicate = !self.remember_received(sequence);
        }

        let message = match self.codec.deserialize(&packet.body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping packet seq={}: {}", sequence, e);
                return;
            }
        };

        if duplicate {
            debug!("Ignoring duplicate {} seq={}", message.name, sequence);
            return;
        }
        debug!("Received {} seq={}", message.name, sequence);

        match message.name.as_str() {
            PACKET_ACK => {
                for record in message.block("Packets") {
                    if let Some(Value::U32(id)) = record.get("ID") {
                        self.resolve_ack(*id);
                    }
                }
            }
            START_PING_CHECK => {
                if let Ok(id) = message.value("PingID", "PingID").and_then(Value::as_u8) {
                    let reply = MessageBuilder::new()
                        .block("PingID", [("PingID", Value::U8(id))])
                        .build();
                    self.send_internal(COMPLETE_PING_CHECK, &reply, now);
                }
            }
            COMPLETE_PING_CHECK => {
                if let Ok(id) = message.value("PingID", "PingID").and_then(Value::as_u8) {
                    if let Some(sent_at) = self.outstanding_pings.remove(&id) {
                        self.last_rtt = Some(now.saturating_duration_since(sent_at));
                    }
                }
            }
            _ => {}
        }

        self.dispatch(message);
    }

    fn dispatch(&mut self, message: WireMessage) {
        if let Some(subscribers) = self.subscribers.get_mut(&message.name) {
            let message = Arc::new(message);
            subscribers.retain(|tx| tx.send(Arc::clone(&message)).is_ok());
        }
    }

    fn queue_inbound_ack(&mut self, sequence: u32) {
        self.pending_inbound_acks.insert(sequence, 0);
        if !self.ack_fifo.contains(&sequence) {
            self.ack_fifo.push_back(sequence);
        }
    }

    /// Returns false if `sequence` was already seen recently
    fn remember_received(&mut self, sequence: u32) -> bool {
        if self.received.contains(&sequence) {
            return false;
        }
        self.received.push_back(sequence);
        while self.received.len() > self.settings.duplicate_window {
            self.received.pop_front();
        }
        true
    }

    fn resolve_ack(&mut self, sequence: u32) {
        if let Some(index) = self.pending_outbound.iter().position(|p| p.sequence == sequence) {
            let packet = self.pending_outbound.remove(index);
            debug!("Reliable packet {} acknowledged", sequence);
            let _ = packet.completion.send(Ok(()));
        }
    }

    fn send_internal(&mut self, name: &str, data: &MessageBlocks, now: Instant) {
        if let Err(e) = self.send(name, data, false, now) {
            warn!("Failed to send {}: {}", name, e);
        }
    }

    /// Periodic tick: liveness, resends, explicit acks, heartbeat
    pub fn on_tick(&mut self, now: Instant) {
        if self.state == CircuitState::Closed {
            return;
        }

        self.liveness += 1;
        if self.liveness > self.settings.liveness_timeout_ticks {
            warn!("Circuit {} silent for {} ticks", self.target, self.liveness);
            self.terminate(
                close_code::LIVENESS_TIMEOUT,
                "timeout",
                NetworkError::Disconnected {
                    reason: "timeout".to_string(),
                },
            );
            return;
        }

        if self.state != CircuitState::Open {
            return;
        }

        self.resend_expired(now);
        self.send_explicit_acks(now);
        self.send_heartbeat(now);
    }

    fn resend_expired(&mut self, now: Instant) {
        let resend_after = self.settings.resend_after();
        let max_attempts = self.settings.max_send_attempts;
        let mut index = 0;

        while index < self.pending_outbound.len() {
            let packet = &mut self.pending_outbound[index];
            if now.saturating_duration_since(packet.sent_at) < resend_after {
                index += 1;
                continue;
            }

            if packet.resend_count + 1 >= max_attempts {
                let packet = self.pending_outbound.remove(index);
                warn!(
                    "Reliable packet {} failed after {} attempts",
                    packet.sequence,
                    packet.resend_count + 1
                );
                let _ = packet.completion.send(Err(NetworkError::Timeout {
                    sequence: packet.sequence,
                }));
                continue;
            }

            packet.resend_count += 1;
            packet.sent_at = now;

            let mut flags = PacketFlags::RELIABLE | PacketFlags::RESENT;
            flags.set(PacketFlags::ZEROCODED, packet.zero_encoded);
            let header = PacketHeader {
                target: self.target,
                flags,
                sequence: packet.sequence,
            };
            let data = framing::build_packet(&header, &packet.body, &packet.acks);
            info!(
                "Retransmitting packet {} (attempt {}/{})",
                packet.sequence,
                packet.resend_count + 1,
                max_attempts
            );
            self.resends += 1;
            self.actions.push_back(CircuitAction::Transmit(Frame::Binary(data)));
            index += 1;
        }
    }

    /// Acks at count 0 go out in a PacketAck; acks already sent once are forgotten
    fn send_explicit_acks(&mut self, now: Instant) {
        let finished: Vec<u32> = self
            .pending_inbound_acks
            .iter()
            .filter(|(_, count)| **count >= 1)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &finished {
            self.pending_inbound_acks.remove(seq);
        }
        if !finished.is_empty() {
            self.ack_fifo.retain(|seq| !finished.contains(seq));
        }

        let mut due: Vec<u32> = self
            .pending_inbound_acks
            .iter_mut()
            .filter(|(_, count)| **count == 0)
            .map(|(seq, count)| {
                *count = 1;
                *seq
            })
            .collect();
        due.sort_unstable();

        for chunk in due.chunks(MAX_PIGGYBACK_ACKS) {
            let data = chunk
                .iter()
                .fold(MessageBuilder::new(), |builder, seq| {
                    builder.block("Packets", [("ID", Value::U32(*seq))])
                })
                .build();
            self.send_internal(PACKET_ACK, &data, now);
        }
    }

    fn send_heartbeat(&mut self, now: Instant) {
        let ping_id = self.ping_id;
        self.ping_id = self.ping_id.wrapping_add(1);
        let oldest = self.ack_fifo.front().copied().unwrap_or(0);
        let data = MessageBuilder::new()
            .block(
                "PingID",
                [("PingID", Value::U8(ping_id)), ("OldestUnacked", Value::U32(oldest))],
            )
            .build();
        self.outstanding_pings.insert(ping_id, now);
        self.pings_sent += 1;
        self.send_internal(START_PING_CHECK, &data, now);
    }

    /// The transport closed underneath us
    pub fn on_transport_closed(&mut self, code: u16, reason: &str) {
        if self.state == CircuitState::Closed {
            return;
        }
        self.awaiting_handshake = false;

        if code == close_code::POLICY_VIOLATION {
            warn!("Circuit {} rejected by peer: {}", self.target, reason);
            self.terminate(
                code,
                reason,
                NetworkError::Disconnected {
                    reason: reason.to_string(),
                },
            );
            return;
        }

        if self.reconnect_count >= self.settings.max_reconnects {
            warn!(
                "Circuit {} giving up after {} reconnects",
                self.target, self.reconnect_count
            );
            self.terminate(
                code,
                reason,
                NetworkError::MaxReconnectsExceeded {
                    attempts: self.reconnect_count,
                },
            );
            return;
        }

        let delay = self.settings.reconnect_delay(self.reconnect_count);
        self.reconnect_count += 1;
        self.state = CircuitState::Reconnecting;
        info!(
            "Circuit {} transport closed ({} {}), reconnect {} in {:?}",
            self.target, code, reason, self.reconnect_count, delay
        );
        self.actions.push_back(CircuitAction::Reconnect { delay });
    }

    /// Explicit close: no reconnect, subscribers detached, pending sends abandoned
    pub fn close(&mut self) {
        if self.state == CircuitState::Closed {
            return;
        }
        info!("Closing circuit {}", self.target);
        self.shutdown(CloseNotice {
            code: close_code::NORMAL,
            reason: "closed".to_string(),
            error: None,
        });
    }

    fn terminate(&mut self, code: u16, reason: &str, error: NetworkError) {
        self.shutdown(CloseNotice {
            code,
            reason: reason.to_string(),
            error: Some(error),
        });
    }

    fn shutdown(&mut self, notice: CloseNotice) {
        self.state = CircuitState::Closed;
        self.awaiting_handshake = false;
        self.subscribers.clear();
        self.pending_outbound.clear();
        self.handshake_buffer.clear();
        self.actions.push_back(CircuitAction::CloseTransport {
            code: notice.code,
            reason: notice.reason.clone(),
        });
        self.close_notice = Some(notice);
    }
}
