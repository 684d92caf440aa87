use std::{
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// A bare control string such as `START-SEND-EVENTS:ACK`.
    Literal,
    CorrelationId,
    SearchSubscriptionId,
}

/// Key an inbound message is dispatched on.
///
/// Equality and hashing only look at `(kind, value)`; the sequential flag is
/// a delivery hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationKey {
    kind: KeyKind,
    value: String,
    must_be_sequential: bool,
}

impl ClassificationKey {
    pub fn new(kind: KeyKind, value: impl Into<String>, must_be_sequential: bool) -> Self {
        Self {
            kind,
            value: value.into(),
            must_be_sequential,
        }
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Self::new(KeyKind::Literal, value, false)
    }

    pub fn correlation_id(value: impl Into<String>) -> Self {
        Self::new(KeyKind::CorrelationId, value, false)
    }

    /// Search results must reach their handler in the order they arrived.
    pub fn search_subscription(value: impl Into<String>) -> Self {
        Self::new(KeyKind::SearchSubscriptionId, value, true)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn must_be_sequential(&self) -> bool {
        self.must_be_sequential
    }
}

impl PartialEq for ClassificationKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

impl Eq for ClassificationKey {}

impl Hash for ClassificationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for ClassificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            KeyKind::Literal => "literal",
            KeyKind::CorrelationId => "correlation-id",
            KeyKind::SearchSubscriptionId => "search-subscription",
        };
        write!(f, "{kind}:{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ignores_sequential_flag_for_equality() {
        let a = ClassificationKey::new(KeyKind::CorrelationId, "c-1", false);
        let b = ClassificationKey::new(KeyKind::CorrelationId, "c-1", true);
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn distinguishes_kinds_with_equal_values() {
        assert_ne!(
            ClassificationKey::literal("x"),
            ClassificationKey::correlation_id("x")
        );
    }

    #[test]
    fn only_search_subscriptions_default_to_sequential() {
        assert!(ClassificationKey::search_subscription("s-1").must_be_sequential());
        assert!(!ClassificationKey::correlation_id("c-1").must_be_sequential());
        assert!(!ClassificationKey::literal("START-SEND-EVENTS:ACK").must_be_sequential());
    }
}
