//! Async driver for a [`Circuit`]
//!
//! The circuit runs inside one tokio task that owns it exclusively. `Client` is
//! the handle applications hold: every call becomes a command on the task's
//! channel, answered over a oneshot reply.

use crate::config::ClientSettings;
use crate::networking::circuit::{Acknowledgement, Circuit, CircuitAction, CircuitState, CircuitStats, CloseNotice};
use crate::networking::packets::{MessageBlocks, WireMessage};
use crate::networking::serialization::{MessageCatalogue, TemplateCodec};
use crate::networking::transport::{close_code, Transport, TransportEvent, TransportSink, WebSocketTransport};
use crate::networking::{NetworkError, NetworkResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

enum Command {
    Send {
        name: String,
        data: MessageBlocks,
        reliable: bool,
        reply: oneshot::Sender<NetworkResult<Option<Acknowledgement>>>,
    },
    Subscribe {
        name: String,
        reply: oneshot::Sender<mpsc::UnboundedReceiver<Arc<WireMessage>>>,
    },
    Stats {
        reply: oneshot::Sender<CircuitStats>,
    },
    Close,
}

/// Handle to a running circuit. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<Option<CloseNotice>>,
}

impl Client {
    /// Start a circuit over `transport`. Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(transport: T, catalogue: Arc<MessageCatalogue>, settings: ClientSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        let circuit = Circuit::new(
            TemplateCodec::new(catalogue),
            settings.session_id,
            settings.simulator,
            settings.circuit,
        );
        let driver = Driver {
            circuit,
            transport: Box::new(transport),
            sink: None,
            events: None,
            reconnect_at: None,
            commands: commands_rx,
            closed: closed_tx,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            closed: closed_rx,
        }
    }

    /// Open a circuit through the WebSocket tunnel at `settings.url`
    pub fn connect(catalogue: Arc<MessageCatalogue>, settings: ClientSettings) -> Self {
        let transport = WebSocketTransport::new(settings.url.clone());
        Self::spawn(transport, catalogue, settings)
    }

    /// Fire-and-forget send
    pub async fn send(&self, name: &str, data: MessageBlocks) -> NetworkResult<()> {
        self.submit(name, data, false).await.map(|_| ())
    }

    /// Reliable send. Awaiting the returned [`Acknowledgement`] waits for the peer's ack.
    pub async fn send_reliable(&self, name: &str, data: MessageBlocks) -> NetworkResult<Acknowledgement> {
        self.submit(name, data, true)
            .await?
            .ok_or(NetworkError::CircuitClosed)
    }

    async fn submit(&self, name: &str, data: MessageBlocks, reliable: bool) -> NetworkResult<Option<Acknowledgement>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            name: name.to_string(),
            data,
            reliable,
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::CircuitClosed)?
    }

    pub async fn subscribe(&self, name: &str) -> NetworkResult<mpsc::UnboundedReceiver<Arc<WireMessage>>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Subscribe {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| NetworkError::CircuitClosed)
    }

    pub async fn stats(&self) -> NetworkResult<CircuitStats> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stats { reply })?;
        rx.await.map_err(|_| NetworkError::CircuitClosed)
    }

    /// Close the circuit with a normal closure. No reconnect follows.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Wait for the circuit to end and report why
    pub async fn closed(&self) -> CloseNotice {
        let mut closed = self.closed.clone();
        let notice = match closed.wait_for(Option::is_some).await {
            Ok(notice) => notice.clone(),
            Err(_) => None,
        };
        notice.unwrap_or_else(|| CloseNotice {
            code: close_code::ABNORMAL,
            reason: "circuit task ended".to_string(),
            error: Some(NetworkError::CircuitClosed),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some() || self.commands.is_closed()
    }

    fn command(&self, command: Command) -> NetworkResult<()> {
        self.commands.send(command).map_err(|_| NetworkError::CircuitClosed)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("closed", &self.is_closed()).finish()
    }
}

enum Step {
    Command(Option<Command>),
    Event(Option<TransportEvent>),
    Tick,
    Reconnect,
}

/// Task that owns the circuit and its current connection
struct Driver {
    circuit: Circuit,
    transport: Box<dyn Transport>,
    sink: Option<Box<dyn TransportSink>>,
    /// Events of the current connection only; replaced on reconnect
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    reconnect_at: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    closed: watch::Sender<Option<CloseNotice>>,
}

impl Driver {
    async fn run(mut self) {
        let mut ticker = time::interval_at(
            Instant::now() + self.circuit.settings().tick_interval(),
            self.circuit.settings().tick_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.connect().await;

        loop {
            self.perform_actions().await;
            if self.circuit.state() == CircuitState::Closed {
                break;
            }

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = next_event(&mut self.events) => Step::Event(event),
                _ = ticker.tick() => Step::Tick,
                _ = reconnect_due(self.reconnect_at) => Step::Reconnect,
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command),
                // Every handle dropped
                Step::Command(None) => self.circuit.close(),
                Step::Event(Some(TransportEvent::Message(frame))) => {
                    self.circuit.on_transport_message(frame, now())
                }
                Step::Event(Some(TransportEvent::Closed { code, reason })) => {
                    self.drop_connection();
                    self.circuit.on_transport_closed(code, &reason);
                }
                Step::Event(None) => {
                    self.drop_connection();
                    self.circuit.on_transport_closed(close_code::ABNORMAL, "event channel closed");
                }
                Step::Tick => self.circuit.on_tick(now()),
                Step::Reconnect => {
                    self.reconnect_at = None;
                    self.connect().await;
                }
            }
        }

        let notice = self.circuit.close_notice().cloned();
        if let Some(notice) = &notice {
            info!("Circuit closed: {} {}", notice.code, notice.reason);
        }
        let _ = self.closed.send(notice);
    }

    async fn connect(&mut self) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.transport.connect(events_tx).await {
            Ok(sink) => {
                self.sink = Some(sink);
                self.events = Some(events_rx);
                self.circuit.on_transport_open();
            }
            Err(e) => {
                warn!("Transport connect failed: {}", e);
                self.circuit.on_transport_closed(close_code::ABNORMAL, &e.to_string());
            }
        }
    }

    fn drop_connection(&mut self) {
        self.sink = None;
        self.events = None;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                name,
                data,
                reliable,
                reply,
            } => {
                let result = self.circuit.send(&name, &data, reliable, now());
                if let Err(e) = &result {
                    debug!("Send of {} rejected: {}", name, e);
                }
                let _ = reply.send(result);
            }
            Command::Subscribe { name, reply } => {
                let _ = reply.send(self.circuit.subscribe(&name));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.circuit.stats());
            }
            Command::Close => self.circuit.close(),
        }
    }

    async fn perform_actions(&mut self) {
        while let Some(action) = self.circuit.poll_action() {
            match action {
                CircuitAction::Transmit(frame) => match self.sink.as_mut() {
                    Some(sink) => {
                        if let Err(e) = sink.send(frame).await {
                            warn!("Transmit failed: {}", e);
                        }
                    }
                    None => debug!("No open connection, frame dropped"),
                },
                CircuitAction::CloseTransport { code, reason } => {
                    if let Some(mut sink) = self.sink.take() {
                        if let Err(e) = sink.close(code, &reason).await {
                            debug!("Transport close failed: {}", e);
                        }
                    }
                    self.events = None;
                }
                CircuitAction::Reconnect { delay } => {
                    self.drop_connection();
                    self.reconnect_at = Some(Instant::now() + delay);
                }
            }
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
