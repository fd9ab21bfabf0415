//! Wrappers around the mapping library's loader and constructors.
//!
//! Each wrapper delegates to the original and then gives the engine a chance
//! to attach the forced layer. If the engine is gone the wrappers behave
//! exactly like the originals.

use super::engine::OverlayEngine;
use super::{Layer, MapConstructor, MapLike, MapView, Module, ModuleLoader, ViewConstructor, ViewProperties};
use crate::error::HostError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};

pub struct PatchedLoader {
    inner: Arc<dyn ModuleLoader>,
    engine: Weak<OverlayEngine>,
}

impl PatchedLoader {
    pub fn new(inner: Arc<dyn ModuleLoader>, engine: Weak<OverlayEngine>) -> Self {
        Self { inner, engine }
    }
}

#[async_trait]
impl ModuleLoader for PatchedLoader {
    async fn load(&self, names: &[String]) -> Result<Vec<Module>, HostError> {
        let modules = self.inner.load(names).await?;
        Ok(match self.engine.upgrade() {
            Some(engine) => engine.intercept_modules(names, modules),
            None => modules,
        })
    }

    fn is_patched(&self) -> bool {
        true
    }
}

/// A map whose `add`/`addMany` re-check the forced layer after delegating.
pub struct ForcedOverlayMap {
    inner: Arc<dyn MapLike>,
    engine: Weak<OverlayEngine>,
}

impl ForcedOverlayMap {
    pub fn new(inner: Arc<dyn MapLike>, engine: Weak<OverlayEngine>) -> Self {
        Self { inner, engine }
    }

    pub fn inner(&self) -> &Arc<dyn MapLike> {
        &self.inner
    }

    fn recheck(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.try_attach(self.inner.as_ref());
        }
    }
}

impl MapLike for ForcedOverlayMap {
    fn add(&self, layer: Arc<dyn Layer>) -> Result<(), HostError> {
        self.inner.add(layer)?;
        self.recheck();
        Ok(())
    }

    fn add_many(&self, layers: Vec<Arc<dyn Layer>>) -> Result<(), HostError> {
        self.inner.add_many(layers)?;
        self.recheck();
        Ok(())
    }

    fn layer_ids(&self) -> Vec<String> {
        self.inner.layer_ids()
    }

    fn add_unobserved(&self, layer: Arc<dyn Layer>) -> Result<(), HostError> {
        self.inner.add_unobserved(layer)
    }

    fn has_layer(&self, id: &str) -> bool {
        self.inner.has_layer(id)
    }
}

pub struct PatchedMapConstructor {
    inner: Arc<dyn MapConstructor>,
    engine: Weak<OverlayEngine>,
}

impl PatchedMapConstructor {
    pub fn new(inner: Arc<dyn MapConstructor>, engine: Weak<OverlayEngine>) -> Self {
        Self { inner, engine }
    }
}

impl MapConstructor for PatchedMapConstructor {
    fn construct(&self, options: &Value) -> Result<Arc<dyn MapLike>, HostError> {
        let map = self.inner.construct(options)?;
        let Some(engine) = self.engine.upgrade() else {
            return Ok(map);
        };
        engine.register_map(&map);
        engine.try_attach(map.as_ref());
        Ok(Arc::new(ForcedOverlayMap::new(map, Arc::downgrade(&engine))))
    }

    fn is_patched(&self) -> bool {
        true
    }
}

/// Captures every constructed view and attaches to its map straight away.
pub struct PatchedViewConstructor {
    inner: Arc<dyn ViewConstructor>,
    engine: Weak<OverlayEngine>,
}

impl PatchedViewConstructor {
    pub fn new(inner: Arc<dyn ViewConstructor>, engine: Weak<OverlayEngine>) -> Self {
        Self { inner, engine }
    }
}

impl ViewConstructor for PatchedViewConstructor {
    fn construct(&self, properties: ViewProperties) -> Result<Arc<dyn MapView>, HostError> {
        let view = self.inner.construct(properties)?;
        if let Some(engine) = self.engine.upgrade() {
            engine.capture_view(Arc::clone(&view));
        }
        Ok(view)
    }

    fn is_patched(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::FORCED_LAYER_ID;
    use super::*;
    use crate::context::{PageOrigin, RuntimeContext};
    use crate::sanitizer::PolicyVariant;
    use serde_json::json;

    fn engine() -> Arc<OverlayEngine> {
        let origin = PageOrigin::parse("https://mirror.example").unwrap();
        OverlayEngine::activate(&RuntimeContext::new(origin, PolicyVariant::Normalize, true))
            .unwrap()
    }

    #[test]
    fn test_repeated_add_keeps_single_forced_layer() {
        let engine = engine();
        engine.record_factory(Arc::new(FakeFactory::default()));
        let constructor = engine.wrap_map_constructor(Arc::new(FakeMapConstructor::default()));
        let map = constructor.construct(&json!({ "basemap": "topo" })).unwrap();

        for i in 0..5 {
            map.add(Arc::new(FakeLayer(format!("radar-{}", i)))).unwrap();
        }
        let batch: Vec<Arc<dyn Layer>> =
            vec![Arc::new(FakeLayer("a".into())), Arc::new(FakeLayer("b".into()))];
        map.add_many(batch).unwrap();

        let ids = map.layer_ids();
        assert_eq!(ids.iter().filter(|id| *id == FORCED_LAYER_ID).count(), 1);
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn test_view_is_captured_and_its_map_gets_the_layer() {
        let engine = engine();
        engine.record_factory(Arc::new(FakeFactory::default()));
        let views = engine.wrap_view_constructor(Arc::new(FakeViewConstructor));

        let map: Arc<dyn MapLike> = Arc::new(FakeMap::default());
        let view = views
            .construct(ViewProperties {
                map: Some(Arc::clone(&map)),
                options: json!({ "zoom": 6 }),
            })
            .unwrap();

        assert!(map.has_layer(FORCED_LAYER_ID));
        let captured = engine.captured_view().unwrap();
        assert!(Arc::ptr_eq(&captured, &view));
    }

    #[test]
    fn test_attach_through_wrapper_inserts_into_inner_map() {
        let engine = engine();
        let inner = Arc::new(FakeMap::default());
        let wrapped = ForcedOverlayMap::new(inner.clone(), Arc::downgrade(&engine));

        engine.record_factory(Arc::new(FakeFactory::default()));
        assert!(engine.try_attach(&wrapped));
        assert!(!engine.try_attach(&wrapped));
        assert_eq!(inner.count(FORCED_LAYER_ID), 1);
    }

    #[test]
    fn test_wrappers_degrade_when_engine_dropped() {
        let engine = engine();
        let constructor = engine.wrap_map_constructor(Arc::new(FakeMapConstructor::default()));
        drop(engine);

        let map = constructor.construct(&json!({})).unwrap();
        map.add(Arc::new(FakeLayer("radar".into()))).unwrap();
        assert_eq!(map.layer_ids(), vec!["radar".to_string()]);
    }
}
