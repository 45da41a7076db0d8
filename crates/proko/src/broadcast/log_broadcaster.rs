//! Log broadcasting for real-time log streaming.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: &str, target: &str, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEvent>,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn send(&self, event: LogEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    pub fn log(&self, level: &str, target: &str, message: &str) {
        self.send(LogEvent::new(level, target, message));
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// A `tracing-subscriber` layer that publishes every event to a
/// [`LogBroadcaster`].
///
/// Level, target and message come from the event itself, so span context
/// never leaks into them. Records bridged from `log` report their original
/// target.
pub struct BroadcastLayer {
    broadcaster: Arc<LogBroadcaster>,
}

impl BroadcastLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let normalized = event.normalized_metadata();
        let metadata = normalized.as_ref().unwrap_or_else(|| event.metadata());

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.broadcaster.log(
            &metadata.level().to_string(),
            metadata.target(),
            &visitor.finish(),
        );
    }
}

/// Collects the `message` field plus the remaining fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields = self.fields.join(" ");
        if self.message.is_empty() {
            fields
        } else {
            format!("{} {}", self.message, fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            name if name.starts_with("log.") => {}
            name => self.fields.push(format!("{}={}", name, value)),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            name if name.starts_with("log.") => {}
            name => self.fields.push(format!("{}={:?}", name, value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_log_event_creation() {
        let event = LogEvent::new("INFO", "test", "Hello world");
        assert_eq!(event.level, "INFO");
        assert_eq!(event.target, "test");
        assert_eq!(event.message, "Hello world");
    }

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = LogBroadcaster::new(10);
        let mut receiver = broadcaster.subscribe();

        broadcaster.log("INFO", "test", "Hello");

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.level, "INFO");
        assert_eq!(event.message, "Hello");
    }

    fn capture(f: impl FnOnce()) -> Vec<LogEvent> {
        let broadcaster = Arc::new(LogBroadcaster::new(16));
        let mut receiver = broadcaster.subscribe();
        let subscriber =
            tracing_subscriber::registry().with(BroadcastLayer::new(Arc::clone(&broadcaster)));
        tracing::subscriber::with_default(subscriber, f);

        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_layer_reports_event_target_inside_spans() {
        let events = capture(|| {
            let job = tracing::info_span!("job", key = "doc-1/document_processing", job_id = "j1");
            let _job = job.enter();
            let phase = tracing::info_span!("phase", name = "parse", index = 0);
            let _phase = phase.enter();
            tracing::warn!("Phase failed");
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, "WARN");
        assert_eq!(events[0].target, module_path!());
        assert_eq!(events[0].message, "Phase failed");
        assert!(!events[0].message.contains('\u{1b}'));
    }

    #[test]
    fn test_layer_appends_event_fields() {
        let events = capture(|| {
            tracing::info!(target: "proko::recovery", removed = 3, "Discarded output");
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, "INFO");
        assert_eq!(events[0].target, "proko::recovery");
        assert_eq!(events[0].message, "Discarded output removed=3");
    }
}
