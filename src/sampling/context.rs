//! Context-aware sampling multipliers.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::event::{value_text, Attributes};

/// Multiplier applied to high-value contexts.
pub const HIGH_VALUE_MULTIPLIER: f64 = 2.0;
/// Multiplier applied to low-value contexts.
pub const LOW_VALUE_MULTIPLIER: f64 = 0.5;
/// Attribute whose value is looked up directly as a context key.
pub const COMPONENT_ATTRIBUTE: &str = "component";

/// Maps context keys to sampling multipliers.
///
/// A context key is either a bare component name (matched against the
/// `component` attribute) or a `key:value` pair matched against any attribute.
/// The table is read on every decision and written only by configuration
/// operations.
pub struct ContextSampler {
    rates: RwLock<HashMap<String, f64>>,
}

impl ContextSampler {
    pub fn new(
        high_value: &[String],
        low_value: &[String],
        explicit: &HashMap<String, f64>,
    ) -> Self {
        let mut rates = HashMap::new();
        for context in high_value {
            rates.insert(context.clone(), HIGH_VALUE_MULTIPLIER);
        }
        for context in low_value {
            rates.insert(context.clone(), LOW_VALUE_MULTIPLIER);
        }
        for (context, rate) in explicit {
            rates.insert(context.clone(), *rate);
        }

        Self {
            rates: RwLock::new(rates),
        }
    }

    /// Multiplier for the first matching context, or 1.0.
    ///
    /// The `component` attribute is checked first, then every attribute as
    /// `key:value` in key order.
    pub fn rate_for(&self, attributes: &Attributes) -> f64 {
        let rates = self.rates.read();
        if rates.is_empty() {
            return 1.0;
        }

        if let Some(component) = attributes.get(COMPONENT_ATTRIBUTE) {
            if let Some(rate) = rates.get(&value_text(component)) {
                return *rate;
            }
        }

        attributes
            .iter()
            .find_map(|(key, value)| rates.get(&context_key(key, &value_text(value))))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn set_rate(&self, context: impl Into<String>, rate: f64) {
        self.rates.write().insert(context.into(), rate);
    }

    pub fn remove_rate(&self, context: &str) -> Option<f64> {
        self.rates.write().remove(context)
    }

    pub fn len(&self) -> usize {
        self.rates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.read().is_empty()
    }
}

/// Build the `key:value` context key for an attribute.
pub fn context_key(key: &str, value: &str) -> String {
    format!("{}:{}", key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_rate_without_match() {
        let sampler = ContextSampler::new(&[], &[], &HashMap::new());
        assert_eq!(sampler.rate_for(&attrs(&[("component", json!("api"))])), 1.0);
    }

    #[test]
    fn test_component_lookup() {
        let sampler = ContextSampler::new(&strings(&["payments"]), &strings(&["health"]), &HashMap::new());

        assert_eq!(sampler.rate_for(&attrs(&[("component", json!("payments"))])), 2.0);
        assert_eq!(sampler.rate_for(&attrs(&[("component", json!("health"))])), 0.5);
        assert_eq!(sampler.rate_for(&attrs(&[("component", json!("other"))])), 1.0);
    }

    #[test]
    fn test_key_value_lookup() {
        let sampler = ContextSampler::new(&[], &strings(&["route:/healthz"]), &HashMap::new());

        let matched = attrs(&[("method", json!("GET")), ("route", json!("/healthz"))]);
        assert_eq!(sampler.rate_for(&matched), 0.5);

        let unmatched = attrs(&[("route", json!("/orders"))]);
        assert_eq!(sampler.rate_for(&unmatched), 1.0);
    }

    #[test]
    fn test_non_string_values_match_by_text() {
        let mut explicit = HashMap::new();
        explicit.insert("status:500".to_string(), 3.0);
        let sampler = ContextSampler::new(&[], &[], &explicit);

        assert_eq!(sampler.rate_for(&attrs(&[("status", json!(500))])), 3.0);
    }

    #[test]
    fn test_explicit_rate_overrides_lists() {
        let mut explicit = HashMap::new();
        explicit.insert("payments".to_string(), 4.0);
        let sampler = ContextSampler::new(&strings(&["payments"]), &[], &explicit);

        assert_eq!(sampler.rate_for(&attrs(&[("component", json!("payments"))])), 4.0);
    }

    #[test]
    fn test_runtime_updates() {
        let sampler = ContextSampler::new(&[], &[], &HashMap::new());
        let event = attrs(&[("component", json!("billing"))]);

        sampler.set_rate("billing", 0.25);
        assert_eq!(sampler.rate_for(&event), 0.25);
        assert_eq!(sampler.len(), 1);

        assert_eq!(sampler.remove_rate("billing"), Some(0.25));
        assert_eq!(sampler.rate_for(&event), 1.0);
        assert!(sampler.is_empty());
    }

    #[test]
    fn test_context_key_format() {
        assert_eq!(context_key("route", "/healthz"), "route:/healthz");
    }
}
