//! Client-side topic filter matching.
//!
//! Two grammars are supported:
//!
//! - **Compat**: the regex rewrite deployed clients have always used. `*`
//!   becomes `.*`, a trailing `>` becomes `.*`, and the result must match at
//!   index 0 of the topic. When the last wildcard of the filter is `*`, the
//!   number of `/` segments of filter and topic must also agree. This is an
//!   approximation of the broker grammar: a filter without wildcards matches
//!   any topic it is a prefix of.
//! - **Strict**: segment-by-segment matching with the broker's semantics.
//!   `*` is exactly one segment, `ab*` is one segment starting with `ab`, and
//!   a final `>` is one or more trailing segments.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Selects which filter grammar a [`TopicMatcher`] applies.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Compat,
    Strict,
}

/// A single level of a strict topic filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Prefix(String),
    Single,
    MultiLevel,
}

/// A compiled topic filter.
#[derive(Clone, Debug)]
pub enum TopicMatcher {
    Compat {
        regex: Option<Regex>,
        check_segments: bool,
        segments: usize,
    },
    Strict {
        segments: Vec<Segment>,
    },
}

impl TopicMatcher {
    pub fn new(filter: &str, mode: MatchMode) -> Self {
        match mode {
            MatchMode::Compat => Self::compat(filter),
            MatchMode::Strict => Self::strict(filter),
        }
    }

    pub fn compat(filter: &str) -> Self {
        let regex = match Regex::new(&compat_pattern(filter)) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Unable to compile topic filter {}: {}", filter, e);
                None
            }
        };

        TopicMatcher::Compat {
            regex,
            check_segments: !filter.ends_with('>') && filter.contains('*'),
            segments: filter.split('/').count(),
        }
    }

    pub fn strict(filter: &str) -> Self {
        let levels: Vec<&str> = filter.split('/').collect();
        let last = levels.len() - 1;
        let segments = levels
            .iter()
            .enumerate()
            .map(|(idx, level)| match *level {
                ">" if idx == last => Segment::MultiLevel,
                "*" => Segment::Single,
                level => match level.strip_suffix('*') {
                    Some(prefix) if !prefix.contains('*') => Segment::Prefix(prefix.to_string()),
                    _ => Segment::Literal(level.to_string()),
                },
            })
            .collect();

        TopicMatcher::Strict { segments }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatcher::Compat {
                regex,
                check_segments,
                segments,
            } => {
                let Some(regex) = regex else {
                    return false;
                };
                if !regex.is_match(topic) {
                    return false;
                }
                !*check_segments || topic.split('/').count() == *segments
            }
            TopicMatcher::Strict { segments } => strict_matches(segments, topic),
        }
    }
}

/// Matches `topic` against `filter` with the compat grammar.
pub fn compat_matches(filter: &str, topic: &str) -> bool {
    TopicMatcher::compat(filter).matches(topic)
}

/// Matches `topic` against `filter` with the strict grammar.
pub fn strict_matches_filter(filter: &str, topic: &str) -> bool {
    TopicMatcher::strict(filter).matches(topic)
}

fn compat_pattern(filter: &str) -> String {
    let (body, trailing) = match filter.strip_suffix('>') {
        Some(body) => (body, true),
        None => (filter, false),
    };

    let mut pattern = String::from("^");
    for (idx, literal) in body.split('*').enumerate() {
        if idx > 0 {
            pattern.push_str(".*");
        }
        pattern.push_str(&regex::escape(literal));
    }
    if trailing {
        pattern.push_str(".*");
    }
    pattern
}

fn strict_matches(segments: &[Segment], topic: &str) -> bool {
    let levels: Vec<&str> = topic.split('/').collect();

    for (idx, segment) in segments.iter().enumerate() {
        match segment {
            // needs at least one trailing level
            Segment::MultiLevel => return levels.len() > idx,
            _ if idx >= levels.len() => return false,
            Segment::Single => {}
            Segment::Prefix(prefix) => {
                if !levels[idx].starts_with(prefix.as_str()) {
                    return false;
                }
            }
            Segment::Literal(literal) => {
                if levels[idx] != literal.as_str() {
                    return false;
                }
            }
        }
    }

    levels.len() == segments.len()
}
