pub mod settings;

// Re-export commonly used types
pub use settings::{
    default_settings_path, load_settings, save_settings, CircuitSettings, ClientSettings,
};
