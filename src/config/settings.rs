use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "circuit.toml";

// =============================================================================
// Circuit Configuration
// =============================================================================

/// Timing and limits of the circuit protocol engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    /// Period of the keepalive/ack/resend tick
    pub tick_interval_ms: u64,
    /// Age after which an unacknowledged reliable packet is resent
    pub resend_after_ms: u64,
    /// Total send attempts (initial + resends) before a reliable send times out
    pub max_send_attempts: u8,
    /// Ticks without any inbound frame before the circuit is declared dead
    pub liveness_timeout_ticks: u32,
    pub max_reconnects: u32,
    /// First reconnect delay; doubles with every attempt
    pub reconnect_base_delay_ms: u64,
    /// Upper bound used when deciding how many acks fit on a packet
    pub max_packet_size: usize,
    /// Text frame the peer sends to accept the session
    pub handshake_ack: String,
    /// How many inbound reliable sequence numbers are remembered for duplicate suppression
    pub duplicate_window: usize,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            resend_after_ms: 500,
            max_send_attempts: 4,
            liveness_timeout_ticks: 1050,
            max_reconnects: 10,
            reconnect_base_delay_ms: 100,
            max_packet_size: 1200,
            handshake_ack: "ok".to_string(),
            duplicate_window: 256,
        }
    }
}

impl CircuitSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn resend_after(&self) -> Duration {
        Duration::from_millis(self.resend_after_ms)
    }

    /// Backoff before reconnect attempt number `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }
}

/// Everything needed to open a tunneled circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// WebSocket endpoint of the tunnel
    pub url: String,
    /// Sent as the first text frame of every connection
    pub session_id: String,
    /// Simulator the tunnel forwards packets to
    pub simulator: SocketAddrV4,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub log_level: String,
    pub circuit: CircuitSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/circuit".to_string(),
            session_id: String::new(),
            simulator: SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 13000),
            log_level: "info".to_string(),
            circuit: CircuitSettings::default(),
        }
    }
}

pub fn default_settings_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "lludp", "lludp-tunnel")
        .map(|proj| proj.config_dir().join(CONFIG_FILE))
}

pub fn load_settings(path: impl AsRef<Path>) -> anyhow::Result<ClientSettings> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    toml::from_str(&data).with_context(|| format!("Invalid settings in {}", path.display()))
}

pub fn save_settings(path: impl AsRef<Path>, settings: &ClientSettings) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
    fs::write(path, toml).with_context(|| format!("Failed to write settings to {}", path.display()))?;
    Ok(())
}
