//! Merge conventions for combining base records with annotation overlays
//!
//! A convention is looked up by name and record type, so a resource record
//! and a component record may merge differently under the same convention.

use crate::error::{BagError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Which kind of descriptive record is being merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Resource,
    Component,
}

/// A strategy for combining a base record with an overlay
pub trait Merger: Send + Sync {
    fn merge(&self, base: &Value, overlay: &Value) -> Value;
}

/// Overlay wins: objects merge key by key, arrays and scalars are replaced whole
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayMerger;

impl Merger for OverlayMerger {
    fn merge(&self, base: &Value, overlay: &Value) -> Value {
        let mut out = base.clone();
        overlay_into(&mut out, overlay);
        out
    }
}

/// Base wins: the overlay only fills keys the base lacks
#[derive(Debug, Clone, Copy, Default)]
pub struct PreserveBaseMerger;

impl Merger for PreserveBaseMerger {
    fn merge(&self, base: &Value, overlay: &Value) -> Value {
        let mut out = base.clone();
        fill_missing(&mut out, overlay);
        out
    }
}

/// Deep-merge `overlay` into `target`; non-object values replace wholesale
pub fn overlay_into(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                let nested = value.is_object() && dst.get(key).map_or(false, Value::is_object);
                if !nested {
                    dst.insert(key.clone(), value.clone());
                } else if let Some(existing) = dst.get_mut(key) {
                    overlay_into(existing, value);
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

fn fill_missing(target: &mut Value, overlay: &Value) {
    if let (Value::Object(dst), Value::Object(src)) = (target, overlay) {
        for (key, value) in src {
            match dst.get_mut(key) {
                Some(existing) => fill_missing(existing, value),
                None => {
                    dst.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Named mergers keyed by (convention, record type)
#[derive(Clone, Default)]
pub struct MergerRegistry {
    mergers: HashMap<(String, RecordType), Arc<dyn Merger>>,
}

impl MergerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `dev` (overlay wins) and `initdef`
    /// (base wins) conventions
    pub fn with_defaults() -> Self {
        let mut registry = MergerRegistry::new();
        for rtype in [RecordType::Resource, RecordType::Component] {
            registry.register("dev", rtype, Arc::new(OverlayMerger));
            registry.register("initdef", rtype, Arc::new(PreserveBaseMerger));
        }
        registry
    }

    pub fn register(&mut self, convention: &str, rtype: RecordType, merger: Arc<dyn Merger>) {
        self.mergers.insert((convention.to_string(), rtype), merger);
    }

    /// True if the convention has a merger for every record type
    pub fn supports(&self, convention: &str) -> bool {
        [RecordType::Resource, RecordType::Component]
            .iter()
            .all(|t| self.mergers.contains_key(&(convention.to_string(), *t)))
    }

    pub fn merge(
        &self,
        convention: &str,
        rtype: RecordType,
        base: &Value,
        overlay: &Value,
    ) -> Result<Value> {
        let merger = self
            .mergers
            .get(&(convention.to_string(), rtype))
            .ok_or_else(|| {
                BagError::Configuration(format!(
                    "no '{}' merge convention registered for {:?} records",
                    convention, rtype
                ))
            })?;
        Ok(merger.merge(base, overlay))
    }
}

impl std::fmt::Debug for MergerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .mergers
            .keys()
            .map(|(name, rtype)| format!("{}:{:?}", name, rtype))
            .collect();
        keys.sort();
        f.debug_struct("MergerRegistry").field("conventions", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_overlay_replaces_arrays_wholesale() {
        let base = json!({"keyword": ["a", "b", "c"], "contact": {"name": "x", "email": "e"}});
        let overlay = json!({"keyword": ["z"], "contact": {"name": "y"}});
        let merged = OverlayMerger.merge(&base, &overlay);
        assert_eq!(merged["keyword"], json!(["z"]));
        assert_eq!(merged["contact"], json!({"name": "y", "email": "e"}));
    }

    #[test]
    fn test_preserve_base_only_fills_gaps() {
        let base = json!({"title": "T", "contact": {"name": "x"}});
        let overlay = json!({"title": "other", "description": ["d"], "contact": {"email": "e"}});
        let merged = PreserveBaseMerger.merge(&base, &overlay);
        assert_eq!(merged["title"], "T");
        assert_eq!(merged["description"], json!(["d"]));
        assert_eq!(merged["contact"], json!({"name": "x", "email": "e"}));
    }

    #[test]
    fn test_registry_lookup_by_convention_and_type() {
        let registry = MergerRegistry::with_defaults();
        assert!(registry.supports("dev"));
        assert!(registry.supports("initdef"));
        assert!(!registry.supports("midas"));

        let merged = registry
            .merge("dev", RecordType::Component, &json!({"a": 1}), &json!({"a": 2}))
            .unwrap();
        assert_eq!(merged["a"], 2);

        let err = registry
            .merge("midas", RecordType::Resource, &json!({}), &json!({}))
            .unwrap_err();
        assert!(matches!(err, BagError::Configuration(_)));
    }

    #[test]
    fn test_custom_merger_registration() {
        struct KeepBase;
        impl Merger for KeepBase {
            fn merge(&self, base: &Value, _overlay: &Value) -> Value {
                base.clone()
            }
        }

        let mut registry = MergerRegistry::new();
        registry.register("frozen", RecordType::Resource, Arc::new(KeepBase));
        assert!(!registry.supports("frozen"));
        registry.register("frozen", RecordType::Component, Arc::new(KeepBase));
        assert!(registry.supports("frozen"));
    }
}
