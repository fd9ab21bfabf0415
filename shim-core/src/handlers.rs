use crate::admin::Metrics;
use crate::blocked::BlockedEndpoint;
use crate::context::RuntimeContext;
use crate::flags::FlagSources;
use crate::host::{FetchRequest, FetchResponse};
use crate::interceptor::{FetchOutcome, InterceptionLayer};
use crate::policy::ScriptVerdict;
use crate::settings;
use crate::tile_cache::TileCache;
use hudsucker::{
    hyper::{
        body,
        header::{self, HeaderValue},
        Body, Request, Response, StatusCode, Uri,
    },
    HttpContext, HttpHandler, RequestOrResponse,
};
use std::sync::{atomic::Ordering, Arc};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Hop-by-hop headers that never cross the proxy.
const HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Document,
    Json,
}

/// A response body that needs rewriting once it arrives.
#[derive(Clone)]
struct PendingRewrite {
    id: Uuid,
    ctx: Arc<RuntimeContext>,
}

/// Applies the interception chain to traffic passing through the proxy.
///
/// hudsucker clones the handler for every request, so the pending rewrite
/// recorded in `handle_request` belongs to the matching `handle_response`.
#[derive(Clone)]
pub struct InterceptHandler {
    base: Arc<RuntimeContext>,
    metrics: Arc<Metrics>,
    tile_cache: Option<Arc<TileCache>>,
    pending: Option<PendingRewrite>,
}

impl InterceptHandler {
    pub fn new(base: Arc<RuntimeContext>, metrics: Arc<Metrics>) -> Self {
        Self {
            base,
            metrics,
            tile_cache: None,
            pending: None,
        }
    }

    pub fn with_tile_cache(mut self, cache: Arc<TileCache>) -> Self {
        self.tile_cache = Some(cache);
        self
    }

    /// Context for the page load this request belongs to.
    fn page_context(&self, req: &Request<Body>, url: &str) -> Arc<RuntimeContext> {
        let mut sources = FlagSources::new().with_page_url(url);
        if let Some(cookies) = header_str(req, header::COOKIE) {
            sources = sources.with_cookies(cookies);
        }
        if let Some(referrer) = header_str(req, header::REFERER) {
            sources = sources.with_referrer(referrer);
        }
        Arc::new(self.base.for_page(sources.resolve().value))
    }

    pub async fn on_request(&mut self, mut req: Request<Body>) -> RequestOrResponse {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        self.pending = None;

        let url = req.uri().to_string();
        let ctx = self.page_context(&req, &url);

        if let Some(response) = self.answer_locally(&ctx, &url) {
            return RequestOrResponse::Response(into_hyper(response));
        }

        let layer =
            InterceptionLayer::new(Arc::clone(&ctx)).with_metrics(Arc::clone(&self.metrics));
        let target = match layer.plan_fetch(FetchRequest::new(req.method().as_str(), url.as_str()))
        {
            FetchOutcome::Respond(response) => {
                info!("Blocked interaction request {}", url);
                return RequestOrResponse::Response(into_hyper(response));
            }
            FetchOutcome::Forward(forward) => forward.url,
        };

        if target != url {
            if let Err(e) = retarget(&mut req, &target) {
                warn!("Could not retarget {} to {}: {}", url, target, e);
            }
        }

        if let Some(cache) = &self.tile_cache {
            let request = to_fetch_request(&req, &target);
            if cache.is_cacheable(&request) {
                let response = match cache.handle(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("Tile fetch failed: {}", e);
                        FetchResponse::new(502, target.clone()).with_body(e.to_string())
                    }
                };
                return RequestOrResponse::Response(into_hyper(response));
            }
        }

        if is_rewritable_target(&ctx, &target) {
            // Bodies are rewritten as text, so ask upstream not to compress them.
            req.headers_mut()
                .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
            let id = Uuid::new_v4();
            debug!("Request [{}] {} {} pending rewrite", id, req.method(), target);
            self.pending = Some(PendingRewrite { id, ctx });
        }

        RequestOrResponse::Request(req)
    }

    /// Synthetic endpoints and blocked tracker scripts.
    fn answer_locally(&self, ctx: &RuntimeContext, url: &str) -> Option<FetchResponse> {
        let parsed = Url::parse(url).ok()?;
        if ctx.origin().is_same_origin(&parsed) {
            if let Some(endpoint) = BlockedEndpoint::from_url(&parsed) {
                debug!("Serving {:?} placeholder", endpoint);
                return Some(endpoint.to_response(url));
            }
        }

        if ctx.rules().scripts.classify_script_src(url) == ScriptVerdict::Block {
            info!("Blocked third-party request {}", url);
            self.metrics.blocked_scripts.fetch_add(1, Ordering::Relaxed);
            return Some(BlockedEndpoint::Script.to_response(url));
        }
        None
    }

    pub async fn on_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(pending) = self.pending.take() else {
            return res;
        };

        let kind = match body_kind(&res) {
            Some(kind) => kind,
            None => return res,
        };
        if is_encoded(&res) {
            debug!("Skipping rewrite of encoded {:?} body", kind);
            return res;
        }

        let (mut parts, body) = res.into_parts();
        let bytes = match body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read response body: {}", e);
                parts.status = StatusCode::BAD_GATEWAY;
                parts.headers.remove(header::CONTENT_LENGTH);
                return Response::from_parts(parts, Body::empty());
            }
        };

        let rewritten = rewrite_body(&pending.ctx, kind, &bytes);
        if rewritten.is_some() {
            debug!("Response [{}] {:?} body rewritten", pending.id, kind);
            self.metrics.sanitized_payloads.fetch_add(1, Ordering::Relaxed);
        }
        let out = rewritten.map(body::Bytes::from).unwrap_or(bytes);

        parts.headers.remove(header::CONTENT_LENGTH);
        if let Ok(len) = HeaderValue::from_str(&out.len().to_string()) {
            parts.headers.insert(header::CONTENT_LENGTH, len);
        }
        Response::from_parts(parts, Body::from(out))
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.on_request(req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.on_response(res).await
    }
}

fn header_str(req: &Request<Body>, name: header::HeaderName) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Point the request at another absolute URL, fixing up `Host`.
fn retarget(req: &mut Request<Body>, target: &str) -> Result<(), String> {
    let uri: Uri = target.parse().map_err(|e| format!("{}", e))?;
    if let Some(authority) = uri.authority() {
        let host = HeaderValue::from_str(authority.as_str()).map_err(|e| e.to_string())?;
        req.headers_mut().insert(header::HOST, host);
    }
    *req.uri_mut() = uri;
    Ok(())
}

fn to_fetch_request(req: &Request<Body>, url: &str) -> FetchRequest {
    req.headers()
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "host" && !HOP_HEADERS.contains(&name)
        })
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .fold(FetchRequest::new(req.method().as_str(), url), |request, (name, value)| {
            request.with_header(name, value)
        })
}

/// Only mirror responses carry settings or payloads worth sanitizing.
fn is_rewritable_target(ctx: &RuntimeContext, target: &str) -> bool {
    Url::parse(target)
        .map(|url| ctx.origin().is_same_origin(&url))
        .unwrap_or(false)
}

fn body_kind(res: &Response<Body>) -> Option<BodyKind> {
    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)?
        .to_str()
        .ok()?
        .to_ascii_lowercase();
    if content_type.starts_with("text/html") {
        Some(BodyKind::Document)
    } else if content_type.starts_with("application/json") || content_type.contains("+json") {
        Some(BodyKind::Json)
    } else {
        None
    }
}

fn is_encoded(res: &Response<Body>) -> bool {
    res.headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false)
}

/// `None` leaves the body untouched.
fn rewrite_body(ctx: &RuntimeContext, kind: BodyKind, bytes: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(bytes).ok()?;
    match kind {
        BodyKind::Document => {
            settings::rewrite_document(text, ctx.sanitizer(), ctx.origin()).map(String::into_bytes)
        }
        BodyKind::Json => {
            let value: serde_json::Value = serde_json::from_str(text).ok()?;
            let sanitized = ctx.sanitizer().sanitize_or_null(&value);
            serde_json::to_vec(&sanitized).ok()
        }
    }
}

fn into_hyper(response: FetchResponse) -> Response<Body> {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        warn!("Could not build local response: {}", e);
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::BAD_GATEWAY;
        fallback
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PageOrigin;
    use crate::sanitizer::PolicyVariant;

    fn handler() -> InterceptHandler {
        let origin = PageOrigin::parse("http://127.0.0.1:8083").unwrap();
        let ctx = RuntimeContext::new(origin, PolicyVariant::Normalize, false);
        InterceptHandler::new(Arc::new(ctx), Arc::new(Metrics::default()))
    }

    fn request(url: &str) -> Request<Body> {
        Request::get(url).body(Body::empty()).unwrap()
    }

    async fn read(res: Response<Body>) -> String {
        let bytes = body::to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_vendor_request_is_retargeted() {
        let mut handler = handler();
        match handler
            .on_request(request("https://api.bom.gov.au/v1/forecasts/daily?aac=VIC_PT042"))
            .await
        {
            RequestOrResponse::Request(req) => {
                assert_eq!(
                    req.uri().to_string(),
                    "http://127.0.0.1:8083/v1/forecasts/daily?aac=VIC_PT042"
                );
                assert_eq!(req.headers()[header::HOST], "127.0.0.1:8083");
                assert_eq!(req.headers()[header::ACCEPT_ENCODING], "identity");
            }
            RequestOrResponse::Response(_) => panic!("expected forwarded request"),
        }
        assert_eq!(handler.metrics.rewritten_requests.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_tracker_answered_with_empty_script() {
        let mut handler = handler();
        match handler
            .on_request(request("https://www.googletagmanager.com/gtm.js?id=GTM-X"))
            .await
        {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), StatusCode::OK);
                assert!(res.headers()[header::CONTENT_TYPE]
                    .to_str()
                    .unwrap()
                    .starts_with("application/javascript"));
                assert_eq!(read(res).await, "");
            }
            RequestOrResponse::Request(_) => panic!("tracker request must not leave the proxy"),
        }
    }

    #[tokio::test]
    async fn test_station_search_answered_locally() {
        let mut handler = handler();
        let url = "https://api.bom.gov.au/apikey/v1/locations/places/search?filter=nearby_type:bom_stn&lat=-37";
        match handler.on_request(request(url)).await {
            RequestOrResponse::Response(res) => {
                let value: serde_json::Value = serde_json::from_str(&read(res).await).unwrap();
                assert_eq!(value["blocked"], true);
                assert_eq!(value["places"], serde_json::json!([]));
            }
            RequestOrResponse::Request(_) => panic!("blocked shape reached the network"),
        }
    }

    #[tokio::test]
    async fn test_synthetic_apm_endpoint() {
        let mut handler = handler();
        match handler
            .on_request(request("http://127.0.0.1:8083/blocked-external/apm"))
            .await
        {
            RequestOrResponse::Response(res) => assert_eq!(res.status(), StatusCode::NO_CONTENT),
            RequestOrResponse::Request(_) => panic!("expected local response"),
        }
    }

    #[tokio::test]
    async fn test_json_response_sanitized_with_page_flag() {
        let mut handler = handler();
        let req = Request::get("http://127.0.0.1:8083/apikey/v1/mapping/config")
            .header(header::COOKIE, "bom_show_town_names=1")
            .body(Body::empty())
            .unwrap();
        assert!(matches!(
            handler.on_request(req).await,
            RequestOrResponse::Request(_)
        ));

        let res = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"hide_layers":true,"layers":[{"id":"overlay_3187","visible":false},null]}"#,
            ))
            .unwrap();
        let out = handler.on_response(res).await;
        let value: serde_json::Value = serde_json::from_str(&read(out).await).unwrap();
        assert_eq!(value["hide_layers"], false);
        assert_eq!(value["layers"].as_array().unwrap().len(), 1);
        assert_eq!(value["layers"][0]["visible"], true);
    }

    #[tokio::test]
    async fn test_encoded_and_foreign_responses_untouched() {
        let mut handler = handler();
        handler
            .on_request(request("http://127.0.0.1:8083/v1/settings.json"))
            .await;
        let res = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from("\u{1f}binary"))
            .unwrap();
        assert_eq!(read(handler.on_response(res).await).await, "\u{1f}binary");

        handler.on_request(request("https://example.org/data.json")).await;
        let res = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"id":"overlay_3187","x":null}"#))
            .unwrap();
        assert_eq!(
            read(handler.on_response(res).await).await,
            r#"{"id":"overlay_3187","x":null}"#
        );
    }
}
