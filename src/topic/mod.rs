//! # Topic Filters
//!
//! Subscription filters use two wildcard tokens: `*` for exactly one topic
//! level and a final `>` for one or more trailing levels. Levels are
//! separated by `/`.
//!
//! ```text
//! topic/
//! ├── mod.rs      - MQTT filter translation
//! └── matcher.rs  - compat (regex) and strict (segment) matching
//! ```

pub mod matcher;

pub use matcher::{compat_matches, strict_matches_filter, MatchMode, TopicMatcher};

/// Translates a filter into MQTT syntax.
///
/// `*` levels become `+`, a final `>` becomes `#`. A level with a trailing
/// prefix wildcard (`ab*`) has no MQTT equivalent and widens to `+`; the
/// client-side matcher narrows deliveries back down.
pub fn to_mqtt_filter(filter: &str) -> String {
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    levels
        .iter()
        .enumerate()
        .map(|(idx, level)| match *level {
            ">" if idx == last => "#",
            level if level.ends_with('*') => "+",
            level => level,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Filter used for a queue's topic subscription on an MQTT broker.
pub fn shared_subscription(queue: &str, filter: &str) -> String {
    format!("$share/{}/{}", queue, to_mqtt_filter(filter))
}
