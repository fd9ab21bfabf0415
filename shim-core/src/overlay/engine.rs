use super::patch::{PatchedLoader, PatchedMapConstructor, PatchedViewConstructor};
use super::{
    LayerFactory, LayerProperties, MapConstructor, MapLike, MapView, Module, ViewConstructor,
    FEATURE_LAYER_MODULE, MAP_MODULES, TOWN_LABELS, VIEW_MODULES,
};
use crate::context::RuntimeContext;
use crate::error::HostError;
use crate::host::{GlobalScope, GlobalValue};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

/// Result of one pass over every known map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub maps_seen: usize,
    pub attached: usize,
}

/// State of the overlay restoration for one page load.
pub struct OverlayEngine {
    properties: LayerProperties,
    factory: RwLock<Option<Arc<dyn LayerFactory>>>,
    loader_patched: AtomicBool,
    view: RwLock<Option<Arc<dyn MapView>>>,
    maps: Mutex<Vec<Weak<dyn MapLike>>>,
    wrapped_maps: DashMap<usize, Arc<dyn MapConstructor>>,
    wrapped_views: DashMap<usize, Arc<dyn ViewConstructor>>,
    /// Held across the presence check and the insert.
    attach_lock: Mutex<()>,
    attachments: AtomicU64,
    failures: AtomicU64,
}

fn address<T: ?Sized>(value: &Arc<T>) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

impl OverlayEngine {
    /// `None` unless the town-label flag resolved true for this page.
    pub fn activate(ctx: &RuntimeContext) -> Option<Arc<Self>> {
        if !ctx.show_town_names() {
            debug!("Town labels disabled, overlay restoration inactive");
            return None;
        }
        info!("Overlay restoration active for {}", ctx.origin());
        Some(Arc::new(Self {
            properties: LayerProperties::resolve(&TOWN_LABELS, ctx.origin()),
            factory: RwLock::new(None),
            loader_patched: AtomicBool::new(false),
            view: RwLock::new(None),
            maps: Mutex::new(Vec::new()),
            wrapped_maps: DashMap::new(),
            wrapped_views: DashMap::new(),
            attach_lock: Mutex::new(()),
            attachments: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }))
    }

    pub fn layer_properties(&self) -> &LayerProperties {
        &self.properties
    }

    pub fn loader_patched(&self) -> bool {
        self.loader_patched.load(Ordering::SeqCst)
    }

    pub fn attachments(&self) -> u64 {
        self.attachments.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn has_factory(&self) -> bool {
        self.factory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Record the feature-layer constructor and attach to every map seen so far.
    pub fn record_factory(&self, factory: Arc<dyn LayerFactory>) {
        *self.factory.write().unwrap_or_else(PoisonError::into_inner) = Some(factory);
        debug!("Recorded feature layer constructor");
        self.reconcile();
    }

    pub fn captured_view(&self) -> Option<Arc<dyn MapView>> {
        self.view.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn capture_view(&self, view: Arc<dyn MapView>) {
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&view));
        if let Some(map) = view.map() {
            self.register_map(&map);
            self.try_attach(map.as_ref());
        }
    }

    pub fn register_map(&self, map: &Arc<dyn MapLike>) {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.retain(|known| known.strong_count() > 0);
        if !maps
            .iter()
            .any(|known| known.upgrade().map(|m| address(&m)) == Some(address(map)))
        {
            maps.push(Arc::downgrade(map));
        }
    }

    fn registered_maps(&self) -> Vec<Arc<dyn MapLike>> {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.retain(|known| known.strong_count() > 0);
        maps.iter().filter_map(Weak::upgrade).collect()
    }

    /// Add the forced layer unless a layer with its id is already present.
    ///
    /// Returns whether a layer was added.
    pub fn ensure_overlay(&self, map: &dyn MapLike) -> Result<bool, HostError> {
        let _guard = self.attach_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if map.has_layer(&self.properties.id) {
            return Ok(false);
        }
        let factory = self
            .factory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| HostError::Missing(FEATURE_LAYER_MODULE.to_string()))?;

        let layer = factory.create(&self.properties)?;
        map.add_unobserved(layer)?;
        self.attachments.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// `ensure_overlay` with failures logged and swallowed.
    pub fn try_attach(&self, map: &dyn MapLike) -> bool {
        match self.ensure_overlay(map) {
            Ok(added) => {
                if added {
                    info!("Attached {} to map", self.properties.id);
                }
                added
            }
            Err(HostError::Missing(what)) => {
                debug!("Overlay not attachable yet: {} missing", what);
                false
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to attach {}: {}", self.properties.id, e);
                false
            }
        }
    }

    fn reconcile(&self) {
        let mut maps = self.registered_maps();
        if let Some(map) = self.captured_view().and_then(|view| view.map()) {
            maps.push(map);
        }
        for map in maps {
            self.try_attach(map.as_ref());
        }
    }

    /// Wrap a map constructor, at most once per constructor.
    pub fn wrap_map_constructor(
        self: &Arc<Self>,
        constructor: Arc<dyn MapConstructor>,
    ) -> Arc<dyn MapConstructor> {
        if constructor.is_patched() {
            return constructor;
        }
        let key = address(&constructor);
        let wrapped = self.wrapped_maps.entry(key).or_insert_with(|| {
            debug!("Patching map constructor");
            Arc::new(PatchedMapConstructor::new(
                Arc::clone(&constructor),
                Arc::downgrade(self),
            ))
        });
        Arc::clone(wrapped.value())
    }

    /// Wrap a view constructor, at most once per constructor.
    pub fn wrap_view_constructor(
        self: &Arc<Self>,
        constructor: Arc<dyn ViewConstructor>,
    ) -> Arc<dyn ViewConstructor> {
        if constructor.is_patched() {
            return constructor;
        }
        let key = address(&constructor);
        let wrapped = self.wrapped_views.entry(key).or_insert_with(|| {
            debug!("Patching view constructor");
            Arc::new(PatchedViewConstructor::new(
                Arc::clone(&constructor),
                Arc::downgrade(self),
            ))
        });
        Arc::clone(wrapped.value())
    }

    /// Inspect a loader resolution and hand back patched modules.
    pub fn intercept_modules(self: &Arc<Self>, names: &[String], modules: Vec<Module>) -> Vec<Module> {
        modules
            .into_iter()
            .enumerate()
            .map(|(index, module)| {
                let name = names.get(index).map(String::as_str).unwrap_or_default();
                match module {
                    Module::FeatureLayer(factory) if name == FEATURE_LAYER_MODULE => {
                        self.record_factory(Arc::clone(&factory));
                        Module::FeatureLayer(factory)
                    }
                    Module::Map(constructor) if MAP_MODULES.contains(&name) => {
                        Module::Map(self.wrap_map_constructor(constructor))
                    }
                    Module::View(constructor) if VIEW_MODULES.contains(&name) => {
                        Module::View(self.wrap_view_constructor(constructor))
                    }
                    other => other,
                }
            })
            .collect()
    }

    /// Wrap the page's module loader. Returns whether the loader is now patched.
    pub fn patch_loader(self: &Arc<Self>, globals: &dyn GlobalScope) -> bool {
        if self.loader_patched() {
            return true;
        }
        let Some(loader) = globals.module_loader() else {
            debug!("Module loader not present yet");
            return false;
        };
        if loader.is_patched() {
            self.loader_patched.store(true, Ordering::SeqCst);
            return true;
        }

        let patched = PatchedLoader::new(loader, Arc::downgrade(self));
        if globals.replace_module_loader(Arc::new(patched)) {
            self.loader_patched.store(true, Ordering::SeqCst);
            info!("Module loader patched");
            true
        } else {
            debug!("Host refused to replace module loader");
            false
        }
    }

    /// Attach to registered maps, the captured view's map and map-like globals.
    pub fn sweep(&self, globals: &dyn GlobalScope) -> SweepReport {
        let mut candidates = self.registered_maps();
        if let Some(map) = self.captured_view().and_then(|view| view.map()) {
            candidates.push(map);
        }
        for (name, value) in globals.bindings() {
            if let GlobalValue::Map(map) = value {
                debug!("Found map-like global {}", name);
                candidates.push(map);
            }
        }

        let mut seen = Vec::with_capacity(candidates.len());
        let mut report = SweepReport::default();
        for map in candidates {
            let key = address(&map);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            report.maps_seen += 1;
            if self.try_attach(map.as_ref()) {
                report.attached += 1;
            }
        }
        report
    }

    /// One polling attempt: re-patch the loader if needed, then sweep.
    pub fn tick(self: &Arc<Self>, globals: &dyn GlobalScope) -> SweepReport {
        self.patch_loader(globals);
        self.sweep(globals)
    }
}
