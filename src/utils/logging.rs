use std::fs;
use std::path::Path;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    filter::ParseError,
    EnvFilter,
};

/// Initialize console logging, plus a plain-text copy in `log_file` if given.
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once is
/// harmless; only the first subscriber is installed.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| -> Result<EnvFilter, ParseError> {
        Ok(EnvFilter::try_new(level)?.add_directive("lludp_tunnel=debug".parse()?))
    })?;

    let file_layer = match log_file {
        Some(path) => {
            // Session-based: start every run with a fresh file
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_ansi(true),
        )
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Logging initialized with level: {}", level);
        if let Some(path) = log_file {
            tracing::info!("File logging enabled: {}", path.display());
        }
    }
    Ok(())
}
