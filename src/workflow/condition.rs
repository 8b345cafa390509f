//! Conditional Visibility Predicates
//!
//! A parameter's `show_when` clause decides whether the parameter is visible
//! (and therefore validated and potentially required) given the inputs
//! collected so far. The predicate language is a small closed set:
//!
//! - a bare literal means equality
//! - `{equals: v}` / `{not_equals: v}` / `{contains: v}` select an operator
//! - a bare array means membership (the field's value must be one of them)
//!
//! A field that is absent from the inputs never satisfies a condition, so
//! parameters gated on unanswered questions stay hidden.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A single condition over one input field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field value equals the given value.
    Equals(Value),
    /// Field value differs from the given value.
    NotEquals(Value),
    /// String field contains the given substring, or array field contains
    /// the given element.
    Contains(Value),
    /// Field value is one of the given values.
    In(Vec<Value>),
}

impl Condition {
    /// Evaluates this condition against a field value. `None` means the
    /// field has not been collected yet and the condition is not met.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = match value {
            Some(v) => v,
            None => return false,
        };

        match self {
            Self::Equals(expected) => value == expected,
            Self::NotEquals(expected) => value != expected,
            Self::Contains(needle) => match value {
                Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
                Value::Array(items) => items.contains(needle),
                _ => false,
            },
            Self::In(members) => members.contains(value),
        }
    }

    /// Parses the wire form described in the module docs.
    fn from_value(raw: &Value) -> Self {
        match raw {
            Value::Array(members) => Self::In(members.clone()),
            Value::Object(map) => {
                if let Some(v) = map.get("equals") {
                    Self::Equals(v.clone())
                } else if let Some(v) = map.get("not_equals") {
                    Self::NotEquals(v.clone())
                } else if let Some(v) = map.get("contains") {
                    Self::Contains(v.clone())
                } else {
                    // An object with no recognized operator is treated as a
                    // literal equality check against the whole object.
                    Self::Equals(raw.clone())
                }
            }
            literal => Self::Equals(literal.clone()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Equals(v) => v.clone(),
            Self::NotEquals(v) => {
                let mut map = Map::new();
                map.insert("not_equals".to_string(), v.clone());
                Value::Object(map)
            }
            Self::Contains(v) => {
                let mut map = Map::new();
                map.insert("contains".to_string(), v.clone());
                Value::Object(map)
            }
            Self::In(members) => Value::Array(members.clone()),
        }
    }
}

/// Conjunction of conditions keyed by input field name. All conditions must
/// hold for the owner to be visible.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShowWhen {
    conditions: BTreeMap<String, Condition>,
}

impl ShowWhen {
    /// Creates an empty predicate (always visible).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a condition for a field, replacing any existing one.
    pub fn when(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(field.into(), condition);
        self
    }

    /// Shorthand for the common equality case.
    pub fn when_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.when(field, Condition::Equals(value.into()))
    }

    /// Evaluates the whole predicate against collected inputs.
    pub fn evaluate(&self, inputs: &Map<String, Value>) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition.matches(inputs.get(field)))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl Serialize for ShowWhen {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let map: Map<String, Value> = self
            .conditions
            .iter()
            .map(|(k, c)| (k.clone(), c.to_value()))
            .collect();
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ShowWhen {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw: Map<String, Value> = Map::deserialize(deserializer)?;
        let conditions = raw
            .iter()
            .map(|(k, v)| (k.clone(), Condition::from_value(v)))
            .collect();
        Ok(Self { conditions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_equals_condition() {
        let predicate = ShowWhen::new().when_equals("user_type", "admin");

        assert!(predicate.evaluate(&inputs(json!({"user_type": "admin"}))));
        assert!(!predicate.evaluate(&inputs(json!({"user_type": "user"}))));
    }

    #[test]
    fn test_absent_field_is_not_met() {
        let predicate = ShowWhen::new().when_equals("user_type", "admin");
        assert!(!predicate.evaluate(&inputs(json!({}))));
    }

    #[test]
    fn test_not_equals_condition() {
        let predicate = ShowWhen::new().when("env", Condition::NotEquals(json!("prod")));

        assert!(predicate.evaluate(&inputs(json!({"env": "staging"}))));
        assert!(!predicate.evaluate(&inputs(json!({"env": "prod"}))));
        // Absent field: condition not met even for not_equals.
        assert!(!predicate.evaluate(&inputs(json!({}))));
    }

    #[test]
    fn test_contains_on_string_and_array() {
        let predicate = ShowWhen::new().when("tags", Condition::Contains(json!("beta")));

        assert!(predicate.evaluate(&inputs(json!({"tags": ["beta", "internal"]}))));
        assert!(predicate.evaluate(&inputs(json!({"tags": "beta-channel"}))));
        assert!(!predicate.evaluate(&inputs(json!({"tags": ["stable"]}))));
    }

    #[test]
    fn test_membership_condition() {
        let predicate = ShowWhen::new().when("tier", Condition::In(vec![json!("pro"), json!("team")]));

        assert!(predicate.evaluate(&inputs(json!({"tier": "pro"}))));
        assert!(!predicate.evaluate(&inputs(json!({"tier": "free"}))));
    }

    #[test]
    fn test_conjunction() {
        let predicate = ShowWhen::new()
            .when_equals("user_type", "admin")
            .when_equals("enabled", true);

        assert!(predicate.evaluate(&inputs(json!({"user_type": "admin", "enabled": true}))));
        assert!(!predicate.evaluate(&inputs(json!({"user_type": "admin", "enabled": false}))));
        assert!(!predicate.evaluate(&inputs(json!({"user_type": "admin"}))));
    }

    #[test]
    fn test_wire_form_roundtrip() {
        let raw = json!({
            "user_type": "admin",
            "env": {"not_equals": "prod"},
            "tags": {"contains": "beta"},
            "tier": ["pro", "team"]
        });

        let predicate: ShowWhen = serde_json::from_value(raw.clone()).unwrap();
        assert!(predicate.evaluate(&inputs(json!({
            "user_type": "admin",
            "env": "staging",
            "tags": ["beta"],
            "tier": "team"
        }))));

        let back = serde_json::to_value(&predicate).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_empty_predicate_is_always_true() {
        let predicate = ShowWhen::new();
        assert!(predicate.is_empty());
        assert!(predicate.evaluate(&inputs(json!({}))));
    }
}
