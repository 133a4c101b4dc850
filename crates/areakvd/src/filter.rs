//! Subscriber and dump predicates
//!
//! Key patterns are compiled once per filter into a [`RegexSet`], each
//! pattern anchored at the start of the key.

use crate::config::ValidationError;
use crate::store::UpdateKind;
use areakv_core::{FilterOperator, KeyFilter, NodeId, Value};
use regex::{Regex, RegexSet};
use std::collections::BTreeSet;

/// A validated, compiled [`KeyFilter`]
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    keys: Option<RegexSet>,
    originators: BTreeSet<NodeId>,
    combinator: FilterOperator,
    ignore_ttl: bool,
    redact_value: bool,
}

impl CompiledFilter {
    pub fn compile(filter: &KeyFilter) -> Result<Self, ValidationError> {
        let mut anchored = Vec::with_capacity(filter.key_patterns.len());
        for pattern in &filter.key_patterns {
            let source = format!("^(?:{})", pattern);
            Regex::new(&source).map_err(|e| ValidationError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            anchored.push(source);
        }

        let keys = if anchored.is_empty() {
            None
        } else {
            Some(RegexSet::new(&anchored).map_err(|e| ValidationError::InvalidPattern {
                pattern: filter.key_patterns.join("|"),
                reason: e.to_string(),
            })?)
        };

        Ok(Self {
            keys,
            originators: filter.originator_ids.clone(),
            combinator: filter.combinator,
            ignore_ttl: filter.ignore_ttl,
            redact_value: filter.redact_value,
        })
    }

    /// Filter matching everything, values included
    pub fn match_all() -> Self {
        Self {
            keys: None,
            originators: BTreeSet::new(),
            combinator: FilterOperator::Or,
            ignore_ttl: false,
            redact_value: false,
        }
    }

    pub fn redact_value(&self) -> bool {
        self.redact_value
    }

    /// Key/originator predicate.
    ///
    /// With `And`, an empty criterion matches everything. With `Or`, an empty
    /// criterion contributes nothing, unless both are empty.
    pub fn matches(&self, key: &str, originator_id: &NodeId) -> bool {
        let key_hit = self.keys.as_ref().map(|set| set.is_match(key));
        let originator_hit =
            (!self.originators.is_empty()).then(|| self.originators.contains(originator_id));

        match self.combinator {
            FilterOperator::And => key_hit.unwrap_or(true) && originator_hit.unwrap_or(true),
            FilterOperator::Or => match (key_hit, originator_hit) {
                (None, None) => true,
                (k, o) => k.unwrap_or(false) || o.unwrap_or(false),
            },
        }
    }

    /// Snapshot form of a stored value, if it passes
    pub fn snapshot_value(&self, key: &str, value: &Value) -> Option<Value> {
        if !self.matches(key, value.originator_id()) {
            return None;
        }
        Some(self.shape(value))
    }

    /// Delta form of an accepted change, if it should be delivered
    pub fn delta_value(&self, key: &str, value: &Value, kind: UpdateKind) -> Option<Value> {
        if !self.matches(key, value.originator_id()) {
            return None;
        }
        match kind {
            UpdateKind::TtlRefresh if !self.ignore_ttl => None,
            UpdateKind::TtlRefresh => Some(value.without_value()),
            UpdateKind::Full => Some(self.shape(value)),
        }
    }

    fn shape(&self, value: &Value) -> Value {
        if self.redact_value {
            value.without_value()
        } else {
            value.clone()
        }
    }
}
