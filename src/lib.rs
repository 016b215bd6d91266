// lludp-tunnel: LLUDP circuits over a WebSocket tunnel

pub mod config;
pub mod networking;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{CircuitSettings, ClientSettings};
pub use networking::{
    Acknowledgement, Client, MessageBuilder, MessageCatalogue, NetworkError, NetworkResult, Value,
    WireMessage,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
