//! Overlay restoration
//!
//! When the town-label flag is on, every map instance built by the page's
//! mapping library must end up carrying one label-only feature layer. The
//! library constructs its maps itself, before or after we start, so the
//! engine hooks the library's module loader and falls back to polling.
//!
//! The traits here describe the slice of the mapping library the engine needs.

mod engine;
mod patch;
mod poll;

pub use engine::{OverlayEngine, SweepReport};
pub use patch::{ForcedOverlayMap, PatchedLoader, PatchedMapConstructor, PatchedViewConstructor};
pub use poll::{start_polling, PollHandle, PollReport};

use crate::context::PageOrigin;
use crate::error::HostError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub const FEATURE_LAYER_MODULE: &str = "esri/layers/FeatureLayer";
pub const MAP_MODULES: [&str; 2] = ["esri/Map", "esri/WebMap"];
pub const VIEW_MODULES: [&str; 2] = ["esri/views/MapView", "esri/views/SceneView"];

pub const FORCED_LAYER_ID: &str = "bom-forced-town-labels";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LabelStyle {
    pub color: &'static str,
    pub halo_color: &'static str,
    pub halo_size: f32,
    pub font_size: f32,
    pub font_weight: &'static str,
}

/// The label layer the engine injects. Constant, never derived from remote data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayLayerSpec {
    pub id: &'static str,
    pub title: &'static str,
    pub endpoint_path: &'static str,
    pub label_field: &'static str,
    pub style: LabelStyle,
    /// Hide labels when zoomed further out than this scale.
    pub min_scale: f64,
}

pub const TOWN_LABELS: OverlayLayerSpec = OverlayLayerSpec {
    id: FORCED_LAYER_ID,
    title: "Towns and cities",
    endpoint_path: "/apikey/v1/mapping/overlays/towns_and_cities/FeatureServer/0",
    label_field: "name",
    style: LabelStyle {
        color: "#1a1a1a",
        halo_color: "#ffffff",
        halo_size: 1.5,
        font_size: 11.0,
        font_weight: "bold",
    },
    min_scale: 12_000_000.0,
};

/// Constructor arguments for the forced layer, resolved against the page origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerProperties {
    pub id: String,
    pub title: String,
    pub url: String,
    pub label_field: String,
    pub style: LabelStyle,
    pub min_scale: f64,
    pub labels_visible: bool,
    pub popup_enabled: bool,
}

impl LayerProperties {
    pub fn resolve(spec: &OverlayLayerSpec, origin: &PageOrigin) -> Self {
        Self {
            id: spec.id.to_string(),
            title: spec.title.to_string(),
            url: origin.join(spec.endpoint_path),
            label_field: spec.label_field.to_string(),
            style: spec.style,
            min_scale: spec.min_scale,
            labels_visible: true,
            popup_enabled: false,
        }
    }
}

pub trait Layer: Send + Sync {
    fn id(&self) -> String;
}

/// Anything with an `add` method and a layer collection.
pub trait MapLike: Send + Sync {
    fn add(&self, layer: Arc<dyn Layer>) -> Result<(), HostError>;

    fn add_many(&self, layers: Vec<Arc<dyn Layer>>) -> Result<(), HostError>;

    fn layer_ids(&self) -> Vec<String>;

    /// Insert without any re-check hooks a wrapper installs around `add`.
    fn add_unobserved(&self, layer: Arc<dyn Layer>) -> Result<(), HostError> {
        self.add(layer)
    }

    fn has_layer(&self, id: &str) -> bool {
        self.layer_ids().iter().any(|existing| existing == id)
    }
}

/// The feature-layer constructor.
pub trait LayerFactory: Send + Sync {
    fn create(&self, properties: &LayerProperties) -> Result<Arc<dyn Layer>, HostError>;
}

/// `esri/Map` or `esri/WebMap`.
pub trait MapConstructor: Send + Sync {
    fn construct(&self, options: &Value) -> Result<Arc<dyn MapLike>, HostError>;

    fn is_patched(&self) -> bool {
        false
    }
}

pub trait MapView: Send + Sync {
    fn map(&self) -> Option<Arc<dyn MapLike>>;
}

#[derive(Clone, Default)]
pub struct ViewProperties {
    pub map: Option<Arc<dyn MapLike>>,
    pub options: Value,
}

/// `esri/views/MapView` or `esri/views/SceneView`.
pub trait ViewConstructor: Send + Sync {
    fn construct(&self, properties: ViewProperties) -> Result<Arc<dyn MapView>, HostError>;

    fn is_patched(&self) -> bool {
        false
    }
}

/// A resolved module, positionally matching the requested name.
#[derive(Clone)]
pub enum Module {
    FeatureLayer(Arc<dyn LayerFactory>),
    Map(Arc<dyn MapConstructor>),
    View(Arc<dyn ViewConstructor>),
    Other,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Module::FeatureLayer(_) => "FeatureLayer",
            Module::Map(_) => "Map",
            Module::View(_) => "View",
            Module::Other => "Other",
        };
        f.write_str(name)
    }
}

/// The mapping library's asynchronous module loader.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, names: &[String]) -> Result<Vec<Module>, HostError>;

    fn is_patched(&self) -> bool {
        false
    }
}
