use async_trait::async_trait;
use serde_json::json;
use shim_core::host::{Element, FetchRequest, FetchResponse, GlobalScope, GlobalValue, Network};
use shim_core::interceptor::{InjectionPath, DEFAULT_SWEEP_DELAY};
use shim_core::overlay::ModuleLoader;
use shim_core::{InterceptionLayer, NetworkError, PageOrigin, PolicyVariant, RuntimeContext};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingNetwork {
    requests: Mutex<Vec<FetchRequest>>,
}

#[async_trait]
impl Network for RecordingNetwork {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        Ok(FetchResponse::json(url, &json!({ "ok": true })))
    }
}

struct FailingNetwork;

#[async_trait]
impl Network for FailingNetwork {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
        Err(NetworkError::Transport {
            url: request.url,
            reason: "connection refused".to_string(),
        })
    }
}

#[derive(Default)]
struct Globals {
    values: Mutex<HashMap<String, String>>,
}

impl GlobalScope for Globals {
    fn get(&self, name: &str) -> Option<GlobalValue> {
        self.values
            .lock()
            .unwrap()
            .get(name)
            .map(|v| GlobalValue::Text(v.clone()))
    }

    fn set_text(&self, name: &str, value: String) {
        self.values.lock().unwrap().insert(name.to_string(), value);
    }

    fn bindings(&self) -> Vec<(String, GlobalValue)> {
        Vec::new()
    }

    fn module_loader(&self) -> Option<Arc<dyn ModuleLoader>> {
        None
    }

    fn replace_module_loader(&self, _loader: Arc<dyn ModuleLoader>) -> bool {
        false
    }
}

fn layer(variant: PolicyVariant, flag: bool) -> Arc<InterceptionLayer> {
    let origin = PageOrigin::parse("http://127.0.0.1:8083").unwrap();
    Arc::new(InterceptionLayer::new(Arc::new(RuntimeContext::new(
        origin, variant, flag,
    ))))
}

#[tokio::test]
async fn test_vendor_fetch_reaches_mirror() {
    let layer = layer(PolicyVariant::Normalize, false);
    let network = RecordingNetwork::default();

    let response = layer
        .fetch(&network, FetchRequest::get("https://api.bom.gov.au/v1/foo?x=1"))
        .await
        .unwrap();
    assert!(response.is_ok());

    let requests = network.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "http://127.0.0.1:8083/v1/foo?x=1");
}

#[tokio::test]
async fn test_station_search_never_reaches_network() {
    let layer = layer(PolicyVariant::Drop, false);
    let network = RecordingNetwork::default();

    let response = layer
        .fetch(
            &network,
            FetchRequest::get(
                "https://api.test2.bom.gov.au/apikey/v1/locations/places/search?filter=nearby_type:bom_stn,limit:5",
            ),
        )
        .await
        .unwrap();

    assert!(network.requests.lock().unwrap().is_empty());
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(
        body,
        json!({ "blocked": true, "place": null, "places": [], "candidates": [], "results": [] })
    );
    assert_eq!(layer.metrics().blocked_interactions.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_network_errors_reach_caller_unchanged() {
    let layer = layer(PolicyVariant::Drop, false);
    let error = layer
        .fetch(&FailingNetwork, FetchRequest::get("https://api.bom.gov.au/v1/warnings"))
        .await
        .unwrap_err();
    assert_eq!(
        error,
        NetworkError::Transport {
            url: "http://127.0.0.1:8083/v1/warnings".to_string(),
            reason: "connection refused".to_string(),
        }
    );
}

#[test]
fn test_tag_manager_blocked_on_every_injection_path() {
    let layer = layer(PolicyVariant::Drop, false);
    let tracker = "https://www.googletagmanager.com/gtag/js?id=G-1";
    let placeholder = "http://127.0.0.1:8083/blocked-external/script";

    let mut by_property = Element::script();
    layer.set_src_property(&mut by_property, tracker);
    assert_eq!(by_property.attribute("src"), Some(placeholder));

    let mut by_attribute = Element::script();
    layer.set_attribute(&mut by_attribute, "SRC", tracker);
    assert_eq!(by_attribute.attribute("src"), Some(placeholder));

    // Source written natively before insertion.
    let mut by_insertion = Element::script();
    by_insertion.set_attribute_raw("src", tracker);
    layer.append_child(&mut by_insertion);
    assert_eq!(by_insertion.attribute("src"), Some(placeholder));

    assert_eq!(layer.metrics().blocked_scripts.load(Ordering::Relaxed), 3);
    assert_eq!(
        layer.script_src(InjectionPath::Property, "/scripts/app.js"),
        "/scripts/app.js"
    );
}

#[tokio::test(start_paused = true)]
async fn test_delayed_globals_sweep() {
    let layer = layer(PolicyVariant::Drop, false);
    let globals = Arc::new(Globals::default());
    globals.set_text("BOM_API", "https://api.bom.gov.au/apikey/v1".to_string());
    globals.set_text("apiHost", "https://example.org".to_string());
    globals.set_text("unrelated", "https://api.bom.gov.au".to_string());

    let sweep = layer.schedule_globals_sweep(globals.clone(), DEFAULT_SWEEP_DELAY);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        globals.values.lock().unwrap()["BOM_API"],
        "https://api.bom.gov.au/apikey/v1"
    );

    assert_eq!(sweep.await.unwrap(), 1);
    let values = globals.values.lock().unwrap();
    assert_eq!(values["BOM_API"], "http://127.0.0.1:8083/apikey/v1");
    assert_eq!(values["apiHost"], "https://example.org");
    assert_eq!(values["unrelated"], "https://api.bom.gov.au");
}

#[test]
fn test_settings_bootstrap_follows_flag() {
    let raw = r#"{
        "map": { "hideLayers": true, "overlays": [{ "id": "overlay_3187", "visible": false }] },
        "gtag": { "tagId": "G-1", "otherIds": [], "events": [] }
    }"#;

    let restored = layer(PolicyVariant::Normalize, true).bootstrap_settings(Some(raw));
    assert_eq!(restored["map"]["hideLayers"], false);
    assert_eq!(restored["map"]["overlays"][0]["visible"], true);
    assert_eq!(restored["gtag"]["tagId"], "");

    let untouched = layer(PolicyVariant::Normalize, false).bootstrap_settings(Some(raw));
    assert_eq!(untouched["map"]["hideLayers"], true);
    assert_eq!(untouched["map"]["overlays"][0]["visible"], false);

    let dropped = layer(PolicyVariant::Drop, true).bootstrap_settings(Some(raw));
    assert_eq!(dropped["map"]["overlays"], json!([]));
}
