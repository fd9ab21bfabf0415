//! Settings sanitizer
//!
//! A pure, structure-preserving transform over decoded JSON. Arrays map
//! element-wise and objects are rebuilt key by key; anything that sanitizes to
//! nothing (including an input `null`) is dropped from its container.
//!
//! The towns-and-cities overlay node is either dropped or normalized into a
//! visible and enabled shape, depending on the active policy. The two are
//! never applied to the same page.

use crate::context::PageOrigin;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const OVERLAY_ID: &str = "overlay_3187";
pub const OVERLAY_ID_FRAGMENT: &str = "towns_and_cities";
pub const OVERLAY_NAME_FRAGMENT: &str = "towns and cities";
pub const OVERLAY_DATA_PATH: &str = "/overlays/towns_and_cities/";

/// Container-level flags that hide the layers they hold.
const HIDE_LAYER_KEYS: [&str; 2] = ["hideLayers", "hide_layers"];

/// Policy chosen by deployment configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyVariant {
    /// Strip the overlay node entirely.
    Drop,
    /// Keep the overlay node and force it visible (requires the feature flag).
    #[default]
    Normalize,
}

impl std::str::FromStr for PolicyVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(PolicyVariant::Drop),
            "normalize" => Ok(PolicyVariant::Normalize),
            other => Err(format!("unknown sanitize policy: {}", other)),
        }
    }
}

/// Policy actually applied for one page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePolicy {
    Drop,
    Normalize,
    /// Normalize is configured but the feature flag is off; the overlay node
    /// is treated as ordinary data.
    Passthrough,
}

impl ActivePolicy {
    pub fn resolve(variant: PolicyVariant, show_town_names: bool) -> Self {
        match (variant, show_town_names) {
            (PolicyVariant::Drop, _) => ActivePolicy::Drop,
            (PolicyVariant::Normalize, true) => ActivePolicy::Normalize,
            (PolicyVariant::Normalize, false) => ActivePolicy::Passthrough,
        }
    }
}

/// Does this object describe the towns-and-cities overlay?
pub fn is_overlay_node(node: &Map<String, Value>) -> bool {
    let lower = |key: &str| {
        node.get(key)
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    };

    let id = lower("id");
    if id == OVERLAY_ID || id.contains(OVERLAY_ID_FRAGMENT) {
        return true;
    }

    if lower("name").contains(OVERLAY_NAME_FRAGMENT) {
        return true;
    }

    node.get("endpoints")
        .and_then(Value::as_array)
        .map(|endpoints| endpoints.iter().any(endpoint_points_at_overlay))
        .unwrap_or(false)
}

fn endpoint_points_at_overlay(endpoint: &Value) -> bool {
    endpoint
        .get("url")
        .and_then(Value::as_str)
        .map(|url| url.to_ascii_lowercase().contains(OVERLAY_DATA_PATH))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    policy: ActivePolicy,
    overlay_endpoint: String,
}

impl Sanitizer {
    pub fn new(policy: ActivePolicy, origin: &PageOrigin) -> Self {
        Self {
            policy,
            overlay_endpoint: origin.join(&format!("/apikey/v1/mapping{}", OVERLAY_DATA_PATH)),
        }
    }

    pub fn policy(&self) -> ActivePolicy {
        self.policy
    }

    /// Endpoint injected into normalized overlay nodes that lack one.
    pub fn overlay_endpoint(&self) -> &str {
        &self.overlay_endpoint
    }

    /// Sanitize a decoded tree. `None` means the node was removed.
    pub fn sanitize(&self, node: &Value) -> Option<Value> {
        match node {
            Value::Null => None,
            Value::Array(items) => Some(Value::Array(
                items.iter().filter_map(|item| self.sanitize(item)).collect(),
            )),
            Value::Object(map) => self.sanitize_object(map),
            scalar => Some(scalar.clone()),
        }
    }

    /// Sanitize and collapse a removed root to `null`, for decoder hooks that
    /// must always return a value.
    pub fn sanitize_or_null(&self, node: &Value) -> Value {
        self.sanitize(node).unwrap_or(Value::Null)
    }

    fn sanitize_object(&self, map: &Map<String, Value>) -> Option<Value> {
        let overlay = self.policy != ActivePolicy::Passthrough && is_overlay_node(map);
        if overlay && self.policy == ActivePolicy::Drop {
            return None;
        }

        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            if let Some(sanitized) = self.sanitize(value) {
                out.insert(key.clone(), sanitized);
            }
        }

        if self.policy == ActivePolicy::Normalize {
            if overlay {
                self.normalize_overlay(&mut out);
            }
            if out.values().any(holds_overlay) {
                for key in HIDE_LAYER_KEYS {
                    if out.contains_key(key) {
                        out.insert(key.to_string(), Value::Bool(false));
                    }
                }
            }
        }

        Some(Value::Object(out))
    }

    fn normalize_overlay(&self, node: &mut Map<String, Value>) {
        node.insert("visible".to_string(), Value::Bool(true));
        node.insert("enabled".to_string(), Value::Bool(true));

        let endpoints = node
            .entry("endpoints")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !endpoints.is_array() {
            *endpoints = Value::Array(Vec::new());
        }
        if let Value::Array(list) = endpoints {
            if !list.iter().any(endpoint_points_at_overlay) {
                list.push(json!({ "url": self.overlay_endpoint }));
            }
        }
    }
}

/// A direct child value that is (or directly lists) an overlay node.
fn holds_overlay(value: &Value) -> bool {
    match value {
        Value::Object(map) => is_overlay_node(map),
        Value::Array(items) => items
            .iter()
            .any(|item| item.as_object().map(is_overlay_node).unwrap_or(false)),
        _ => false,
    }
}
