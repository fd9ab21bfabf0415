use async_trait::async_trait;
use serde_json::{json, Value};
use shim_core::host::{GlobalScope, GlobalValue};
use shim_core::overlay::{
    start_polling, Layer, LayerFactory, LayerProperties, MapConstructor, MapLike, MapView, Module,
    ModuleLoader, ViewConstructor, ViewProperties, FORCED_LAYER_ID,
};
use shim_core::{HostError, OverlayConfig, OverlayEngine, PageOrigin, PolicyVariant, RuntimeContext};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct NamedLayer(String);

impl Layer for NamedLayer {
    fn id(&self) -> String {
        self.0.clone()
    }
}

#[derive(Default)]
struct RecordingMap {
    layers: Mutex<Vec<String>>,
}

impl RecordingMap {
    fn count(&self, id: &str) -> usize {
        self.layers.lock().unwrap().iter().filter(|l| *l == id).count()
    }
}

impl MapLike for RecordingMap {
    fn add(&self, layer: Arc<dyn Layer>) -> Result<(), HostError> {
        self.layers.lock().unwrap().push(layer.id());
        Ok(())
    }

    fn add_many(&self, layers: Vec<Arc<dyn Layer>>) -> Result<(), HostError> {
        let mut current = self.layers.lock().unwrap();
        current.extend(layers.iter().map(|l| l.id()));
        Ok(())
    }

    fn layer_ids(&self) -> Vec<String> {
        self.layers.lock().unwrap().clone()
    }
}

struct Factory;

impl LayerFactory for Factory {
    fn create(&self, properties: &LayerProperties) -> Result<Arc<dyn Layer>, HostError> {
        Ok(Arc::new(NamedLayer(properties.id.clone())))
    }
}

#[derive(Default)]
struct MapClass {
    built: Mutex<Vec<Arc<RecordingMap>>>,
}

impl MapConstructor for MapClass {
    fn construct(&self, _options: &Value) -> Result<Arc<dyn MapLike>, HostError> {
        let map = Arc::new(RecordingMap::default());
        self.built.lock().unwrap().push(Arc::clone(&map));
        Ok(map)
    }
}

struct View(Option<Arc<dyn MapLike>>);

impl MapView for View {
    fn map(&self) -> Option<Arc<dyn MapLike>> {
        self.0.clone()
    }
}

struct ViewClass;

impl ViewConstructor for ViewClass {
    fn construct(&self, properties: ViewProperties) -> Result<Arc<dyn MapView>, HostError> {
        Ok(Arc::new(View(properties.map)))
    }
}

struct Loader {
    map_class: Arc<MapClass>,
}

#[async_trait]
impl ModuleLoader for Loader {
    async fn load(&self, names: &[String]) -> Result<Vec<Module>, HostError> {
        Ok(names
            .iter()
            .map(|name| match name.as_str() {
                "esri/layers/FeatureLayer" => Module::FeatureLayer(Arc::new(Factory)),
                "esri/Map" => Module::Map(self.map_class.clone()),
                "esri/views/MapView" => Module::View(Arc::new(ViewClass)),
                _ => Module::Other,
            })
            .collect())
    }
}

/// A page whose mapping library shows up after the shim starts.
#[derive(Default)]
struct Page {
    loader: Mutex<Option<Arc<dyn ModuleLoader>>>,
    globals: Mutex<Vec<(String, GlobalValue)>>,
}

impl GlobalScope for Page {
    fn get(&self, name: &str) -> Option<GlobalValue> {
        self.globals
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    fn set_text(&self, name: &str, value: String) {
        self.globals
            .lock()
            .unwrap()
            .push((name.to_string(), GlobalValue::Text(value)));
    }

    fn bindings(&self) -> Vec<(String, GlobalValue)> {
        self.globals.lock().unwrap().clone()
    }

    fn module_loader(&self) -> Option<Arc<dyn ModuleLoader>> {
        self.loader.lock().unwrap().clone()
    }

    fn replace_module_loader(&self, loader: Arc<dyn ModuleLoader>) -> bool {
        *self.loader.lock().unwrap() = Some(loader);
        true
    }
}

fn engine(show_town_names: bool) -> Option<Arc<OverlayEngine>> {
    let origin = PageOrigin::parse("http://127.0.0.1:8083").unwrap();
    OverlayEngine::activate(&RuntimeContext::new(
        origin,
        PolicyVariant::Normalize,
        show_town_names,
    ))
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_engine_requires_flag() {
    assert!(engine(false).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_loader_is_patched_and_map_keeps_one_overlay() {
    let engine = engine(true).unwrap();
    let page = Arc::new(Page::default());
    let config = OverlayConfig {
        poll_interval_ms: 1000,
        max_attempts: 5,
    };
    let handle = start_polling(Arc::clone(&engine), page.clone(), &config);

    // Library arrives between poll attempts.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let map_class = Arc::new(MapClass::default());
    *page.loader.lock().unwrap() = Some(Arc::new(Loader {
        map_class: Arc::clone(&map_class),
    }));
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(engine.loader_patched());

    let loader = page.module_loader().unwrap();
    assert!(loader.is_patched());
    let modules = loader
        .load(&names(&["esri/layers/FeatureLayer", "esri/Map", "esri/views/MapView"]))
        .await
        .unwrap();

    let Module::Map(map_ctor) = &modules[1] else {
        panic!("expected map constructor, got {:?}", modules[1]);
    };
    assert!(map_ctor.is_patched());
    let map = map_ctor.construct(&json!({ "basemap": "topo" })).unwrap();
    assert!(map.has_layer(FORCED_LAYER_ID));

    for id in ["radar", "warnings", "rainfall"] {
        map.add(Arc::new(NamedLayer(id.to_string()))).unwrap();
    }
    map.add_many(vec![
        Arc::new(NamedLayer("a".to_string())) as Arc<dyn Layer>,
        Arc::new(NamedLayer("b".to_string())),
    ])
    .unwrap();

    let built = map_class.built.lock().unwrap()[0].clone();
    assert_eq!(built.count(FORCED_LAYER_ID), 1);
    assert_eq!(built.layer_ids().len(), 6);

    let Module::View(view_ctor) = &modules[2] else {
        panic!("expected view constructor, got {:?}", modules[2]);
    };
    view_ctor
        .construct(ViewProperties {
            map: Some(Arc::clone(&map)),
            options: json!({ "container": "map" }),
        })
        .unwrap();
    assert!(engine.captured_view().is_some());

    let report = handle.finished().await.unwrap();
    assert_eq!(report.attempts, 5);
    assert!(report.loader_patched);
    assert_eq!(built.count(FORCED_LAYER_ID), 1);
    assert_eq!(engine.attachments(), 1);
}

#[tokio::test]
async fn test_map_global_without_factory_waits_for_feature_layer() {
    let engine = engine(true).unwrap();
    let page = Page::default();
    let map = Arc::new(RecordingMap::default());
    let shared: Arc<dyn MapLike> = map.clone();
    page.globals
        .lock()
        .unwrap()
        .push(("view".to_string(), GlobalValue::Map(shared)));

    let report = engine.tick(&page);
    assert_eq!(report.maps_seen, 1);
    assert_eq!(report.attached, 0);
    assert_eq!(engine.failures(), 0);

    engine.intercept_modules(
        &names(&["esri/layers/FeatureLayer"]),
        vec![Module::FeatureLayer(Arc::new(Factory))],
    );
    assert!(engine.has_factory());
    assert_eq!(engine.tick(&page).attached, 1);
    assert_eq!(engine.tick(&page).attached, 0);
    assert_eq!(map.count(FORCED_LAYER_ID), 1);
}

/// Map whose `add` takes long enough for concurrent callers to interleave.
#[derive(Default)]
struct SlowMap {
    inner: RecordingMap,
}

impl MapLike for SlowMap {
    fn add(&self, layer: Arc<dyn Layer>) -> Result<(), HostError> {
        std::thread::sleep(Duration::from_millis(50));
        self.inner.add(layer)
    }

    fn add_many(&self, layers: Vec<Arc<dyn Layer>>) -> Result<(), HostError> {
        self.inner.add_many(layers)
    }

    fn layer_ids(&self) -> Vec<String> {
        self.inner.layer_ids()
    }
}

#[test]
fn test_concurrent_attach_adds_one_layer() {
    let engine = engine(true).unwrap();
    engine.record_factory(Arc::new(Factory));
    let map = Arc::new(SlowMap::default());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let map = Arc::clone(&map);
            std::thread::spawn(move || engine.try_attach(map.as_ref()))
        })
        .collect();
    let added = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .filter(|added| *added)
        .count();

    assert_eq!(added, 1);
    assert_eq!(map.inner.count(FORCED_LAYER_ID), 1);
    assert_eq!(engine.attachments(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poller_racing_page_adds_keeps_one_layer() {
    let engine = engine(true).unwrap();
    let map_class = Arc::new(MapClass::default());
    let wrapped = engine.wrap_map_constructor(map_class.clone());
    // No factory yet, so construction leaves the map bare.
    let map = wrapped.construct(&json!({})).unwrap();
    assert!(!map.has_layer(FORCED_LAYER_ID));

    // The wrapped map is also reachable as a global, so the sweep attaches
    // through the wrapper while the page keeps adding through it.
    let page = Arc::new(Page::default());
    page.globals
        .lock()
        .unwrap()
        .push(("map".to_string(), GlobalValue::Map(Arc::clone(&map))));
    let handle = start_polling(
        Arc::clone(&engine),
        page.clone(),
        &OverlayConfig {
            poll_interval_ms: 5,
            max_attempts: 20,
        },
    );

    let adder = {
        let map = Arc::clone(&map);
        tokio::task::spawn_blocking(move || {
            for i in 0..20 {
                map.add(Arc::new(NamedLayer(format!("frame-{}", i)))).unwrap();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };
    engine.record_factory(Arc::new(Factory));
    adder.await.unwrap();
    let report = handle.finished().await.unwrap();

    assert_eq!(report.attempts, 20);
    let built = map_class.built.lock().unwrap()[0].clone();
    assert_eq!(built.count(FORCED_LAYER_ID), 1);
    assert_eq!(built.layer_ids().len(), 21);
    assert_eq!(engine.attachments(), 1);
}
