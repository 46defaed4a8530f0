//! Route-key to queue resolution shared by every transport.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::{ExchangeType, MessageQueueDeclaration};

/// How topic bindings are compared against route keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TopicMatchMode {
    /// Binding split into its own segments: `*` matches one segment, `#` the rest.
    #[default]
    Segmented,
    /// Compatibility with deployments that relied on the historical matcher,
    /// which split the route key for both sides: a binding matches when it
    /// contains a `#` segment or has as many segments as the key.
    LegacyKeySplit,
}

/// Resolve the queues that receive a message published with `route_key`.
///
/// * Direct: unbound queues and queues with a case-insensitively equal binding
///   are candidates; one candidate is picked uniformly at random (load
///   balancing, not multicast). No candidate drops the message.
/// * Fanout: every queue.
/// * Topic: every queue with a binding that [`topic_match`]es, deduplicated.
pub fn bind_message_to_queues(
    route_key: &str,
    exchange_type: ExchangeType,
    queues: &[MessageQueueDeclaration],
    mode: TopicMatchMode,
) -> Vec<String> {
    match exchange_type {
        ExchangeType::Direct => {
            let mut candidates: Vec<&MessageQueueDeclaration> = queues
                .iter()
                .filter(|q| q.bindings.is_empty() || q.bindings.iter().any(|b| b.eq_ignore_ascii_case(route_key)))
                .collect();
            match candidates.len() {
                0 => Vec::new(),
                1 => vec![candidates[0].name.clone()],
                _ => {
                    candidates.shuffle(&mut rand::thread_rng());
                    vec![candidates[0].name.clone()]
                }
            }
        }
        ExchangeType::Fanout => {
            let mut seen = HashSet::new();
            queues
                .iter()
                .filter(|q| seen.insert(q.name.as_str()))
                .map(|q| q.name.clone())
                .collect()
        }
        ExchangeType::Topic => {
            let mut seen = HashSet::new();
            queues
                .iter()
                .filter(|q| q.bindings.iter().any(|b| topic_match(route_key, b, mode)))
                .filter(|q| seen.insert(q.name.as_str()))
                .map(|q| q.name.clone())
                .collect()
        }
    }
}

/// Topic pattern match. Segments are dot-delimited and compared case-insensitively.
pub fn topic_match(route_key: &str, binding: &str, mode: TopicMatchMode) -> bool {
    let key_parts: Vec<&str> = route_key.split('.').collect();
    match mode {
        TopicMatchMode::Segmented => {
            let binding_parts: Vec<&str> = binding.split('.').collect();
            for (i, part) in binding_parts.iter().enumerate() {
                if *part == "#" {
                    return true;
                }
                let Some(key_part) = key_parts.get(i) else {
                    return false;
                };
                if *part != "*" && !part.eq_ignore_ascii_case(key_part) {
                    return false;
                }
            }
            key_parts.len() == binding_parts.len()
        }
        TopicMatchMode::LegacyKeySplit => {
            let binding_parts: Vec<&str> = binding.split('.').collect();
            binding_parts.contains(&"#") || binding_parts.len() == key_parts.len()
        }
    }
}
