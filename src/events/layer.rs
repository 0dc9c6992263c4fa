//! `tracing` layer that republishes log events on the [`EventBus`]

use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::{EventBus, LogLevel, LogRecord, RouterEvent};

/// Forwards `tracing` events at or above `min_level` as [`LogRecord`]s
#[derive(Debug, Clone)]
pub struct EventLayer {
    bus: EventBus,
    min_level: LogLevel,
}

impl EventLayer {
    #[must_use]
    pub const fn new(bus: EventBus, min_level: LogLevel) -> Self {
        Self { bus, min_level }
    }
}

impl<S: Subscriber> Layer<S> for EventLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from_tracing(*event.metadata().level());
        if level < self.min_level || self.bus.subscriber_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.bus
            .publish(RouterEvent::Log(LogRecord::now(level, visitor.finish())));
    }
}

/// Collects `message` first, then `key=value` for the remaining fields
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value:?}", field.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_layer_forwards_warnings() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let subscriber =
            tracing_subscriber::registry().with(EventLayer::new(bus.clone(), LogLevel::Info));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("dropped below threshold");
            tracing::warn!(interface = "wlan0", "falling back");
        });

        match rx.try_recv().unwrap() {
            RouterEvent::Log(record) => {
                assert_eq!(record.level, LogLevel::Warning);
                assert_eq!(record.message, "falling back interface=\"wlan0\"");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
