//! Process-wide logging setup.
//!
//! The library itself only emits `log` records and `tracing` spans; the
//! embedding binary calls [`init_logging`] once at startup.

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::broadcast::{BroadcastLayer, LogBroadcaster};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to bridge `log` records into tracing: {0}")]
    LogBridge(#[from] log::SetLoggerError),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub struct LoggingOptions {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable text on stdout.
    pub json: bool,
    /// Also stream every event to this broadcaster.
    pub broadcaster: Option<Arc<LogBroadcaster>>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: false,
            broadcaster: None,
        }
    }
}

/// Installs the global subscriber and the `log` bridge. Fails if either is
/// already installed.
pub fn init_logging(options: LoggingOptions) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    let (text_layer, json_layer) = if options.json {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };

    let broadcast_layer = options.broadcaster.map(BroadcastLayer::new);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(broadcast_layer);

    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(subscriber)?;

    log::debug!("Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    #[serial]
    fn test_log_records_reach_broadcaster() {
        let broadcaster = Arc::new(LogBroadcaster::new(1024));
        let mut rx = broadcaster.subscribe();

        init_logging(LoggingOptions {
            default_filter: "info".to_string(),
            json: false,
            broadcaster: Some(Arc::clone(&broadcaster)),
        })
        .unwrap();

        log::warn!("stale job found");
        {
            let span = tracing::info_span!("job", key = "doc-1/document_processing", job_id = "j1");
            let _guard = span.enter();
            tracing::warn!("Phase failed");
        }

        let mut bridged = false;
        let mut in_span = false;
        loop {
            match rx.try_recv() {
                Ok(event) if event.message == "stale job found" => {
                    assert_eq!(event.level, "WARN");
                    assert_eq!(event.target, module_path!());
                    bridged = true;
                }
                Ok(event) if event.message == "Phase failed" => {
                    assert_eq!(event.level, "WARN");
                    assert_eq!(event.target, module_path!());
                    in_span = true;
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!(bridged);
        assert!(in_span);

        // A second install is refused.
        assert!(init_logging(LoggingOptions::default()).is_err());
    }
}
