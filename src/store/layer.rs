use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::{LogLevel, StatusStore};

const CRATE_TARGET: &str = "rates_pubsub";

/// Records INFO, WARN and ERROR events emitted by this crate as the store's
/// last log entry.
pub struct StoreLayer {
    store: StatusStore,
    target: String,
}

impl StoreLayer {
    pub fn new(store: StatusStore) -> Self {
        StoreLayer {
            store,
            target: CRATE_TARGET.to_string(),
        }
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for StoreLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(self.target.as_str()) {
            return;
        }

        let level = match *metadata.level() {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            _ => return,
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.store.log(level, visitor.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn mirrors_crate_events_into_store() {
        let store = StatusStore::new();
        let subscriber = tracing_subscriber::registry().with(store.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("ignored");
            tracing::error!("Connection failed to the message router");
        });

        let entry = store.last_log().unwrap();
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "Connection failed to the message router");
    }

    #[test]
    fn ignores_foreign_targets() {
        let store = StatusStore::new();
        let subscriber = tracing_subscriber::registry().with(store.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "rumqttc::state", "outgoing ping");
        });

        assert!(store.last_log().is_none());
    }
}
