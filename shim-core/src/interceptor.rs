//! Request interception layer
//!
//! Every request-issuing or subresource-injecting seam funnels into one
//! `OutboundCall`, which runs through a fixed chain of interceptors:
//!
//! 1. `ApiRewrite` - vendor API host → page origin
//! 2. `InteractionGuard` - answer or redirect blocked interaction endpoints
//! 3. `ScriptGuard` - point tracker scripts at the inert placeholder
//!
//! An interceptor either lets the (possibly modified) call continue or
//! answers it outright, which ends the chain.

use crate::admin::Metrics;
use crate::context::RuntimeContext;
use crate::error::NetworkError;
use crate::host::{Element, FetchRequest, FetchResponse, GlobalScope, GlobalValue, Network};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Global bindings that third-party code is known to cache a base URL in.
pub const KNOWN_URL_GLOBALS: [&str; 8] = [
    "BOM_API", "API_BASE", "apiBase", "apiUrl", "baseUrl", "endpoint", "apiHost", "api_host",
];

pub const DEFAULT_SWEEP_DELAY: Duration = Duration::from_millis(50);

/// How a script element's source was about to be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPath {
    /// `script.src = ...`
    Property,
    /// `script.setAttribute("src", ...)`
    Attribute,
    /// `parent.appendChild(script)`
    Insertion,
}

/// The primitive a call came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seam {
    Fetch,
    LegacyOpen,
    UrlConstruct,
    ScriptSource(InjectionPath),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    pub seam: Seam,
    pub method: String,
    pub url: String,
}

impl OutboundCall {
    pub fn new(seam: Seam, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            seam,
            method: method.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Respond(FetchResponse),
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept(&self, ctx: &RuntimeContext, call: &mut OutboundCall, metrics: &Metrics)
        -> Verdict;
}

/// Rewrites vendor API URLs on every request-issuing seam.
pub struct ApiRewrite;

impl Interceptor for ApiRewrite {
    fn name(&self) -> &'static str {
        "api-rewrite"
    }

    fn intercept(
        &self,
        ctx: &RuntimeContext,
        call: &mut OutboundCall,
        metrics: &Metrics,
    ) -> Verdict {
        if matches!(call.seam, Seam::ScriptSource(_)) {
            return Verdict::Continue;
        }

        let rewritten = ctx.rules().rewrite.rewrite(&call.url).into_owned();
        if rewritten != call.url {
            debug!("Rewrote {:?} {} -> {}", call.seam, call.url, rewritten);
            metrics.rewritten_requests.fetch_add(1, Ordering::Relaxed);
            call.url = rewritten;
        }
        Verdict::Continue
    }
}

/// Answers blocked interaction endpoints without a network call.
pub struct InteractionGuard;

impl Interceptor for InteractionGuard {
    fn name(&self) -> &'static str {
        "interaction-guard"
    }

    fn intercept(
        &self,
        ctx: &RuntimeContext,
        call: &mut OutboundCall,
        metrics: &Metrics,
    ) -> Verdict {
        let blocker = &ctx.rules().interactions;
        let kind = match call.seam {
            Seam::Fetch | Seam::LegacyOpen => match blocker.classify(&call.url) {
                Some(kind) => kind,
                None => return Verdict::Continue,
            },
            _ => return Verdict::Continue,
        };

        metrics.blocked_interactions.fetch_add(1, Ordering::Relaxed);
        match call.seam {
            Seam::Fetch => {
                debug!("Answered {} locally as {}", call.url, kind);
                Verdict::Respond(
                    FetchResponse::json(call.url.clone(), &kind.canned_payload())
                        .with_header("x-bom-shim-blocked", kind.as_str()),
                )
            }
            _ => {
                let redirect = blocker.legacy_redirect(kind);
                debug!("Redirected legacy request {} -> {}", call.url, redirect);
                call.url = redirect;
                Verdict::Continue
            }
        }
    }
}

/// Applies the script block policy on every injection path.
pub struct ScriptGuard;

impl Interceptor for ScriptGuard {
    fn name(&self) -> &'static str {
        "script-guard"
    }

    fn intercept(
        &self,
        ctx: &RuntimeContext,
        call: &mut OutboundCall,
        metrics: &Metrics,
    ) -> Verdict {
        if let Seam::ScriptSource(path) = call.seam {
            let scripts = &ctx.rules().scripts;
            let effective = scripts.effective_src(&call.url).into_owned();
            if effective != call.url {
                info!("Blocked third-party script {} via {:?}", call.url, path);
                metrics.blocked_scripts.fetch_add(1, Ordering::Relaxed);
                call.url = effective;
            }
        }
        Verdict::Continue
    }
}

/// Ordered interceptors, evaluated front to back.
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn standard() -> Self {
        Self {
            interceptors: vec![
                Box::new(ApiRewrite),
                Box::new(InteractionGuard),
                Box::new(ScriptGuard),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn run(&self, ctx: &RuntimeContext, call: &mut OutboundCall, metrics: &Metrics) -> Verdict {
        for interceptor in &self.interceptors {
            if let Verdict::Respond(response) = interceptor.intercept(ctx, call, metrics) {
                return Verdict::Respond(response);
            }
        }
        Verdict::Continue
    }
}

/// What should happen to a fetch-style call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Forward(FetchRequest),
    Respond(FetchResponse),
}

/// The installed hooks for one page load.
pub struct InterceptionLayer {
    ctx: Arc<RuntimeContext>,
    chain: InterceptorChain,
    metrics: Arc<Metrics>,
}

impl InterceptionLayer {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self {
            ctx,
            chain: InterceptorChain::standard(),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    fn run(&self, seam: Seam, method: &str, url: &str) -> (OutboundCall, Verdict) {
        let mut call = OutboundCall::new(seam, method, url);
        let verdict = self.chain.run(&self.ctx, &mut call, &self.metrics);
        (call, verdict)
    }

    /// Decide a fetch-style call without issuing it.
    pub fn plan_fetch(&self, request: FetchRequest) -> FetchOutcome {
        let (call, verdict) = self.run(Seam::Fetch, &request.method, &request.url);
        match verdict {
            Verdict::Respond(response) => FetchOutcome::Respond(response),
            Verdict::Continue if call.url == request.url => FetchOutcome::Forward(request),
            Verdict::Continue => FetchOutcome::Forward(request.with_url(call.url)),
        }
    }

    /// The patched fetch primitive. Network errors reach the caller unchanged.
    pub async fn fetch(
        &self,
        network: &dyn Network,
        request: FetchRequest,
    ) -> Result<FetchResponse, NetworkError> {
        match self.plan_fetch(request) {
            FetchOutcome::Respond(response) => Ok(response),
            FetchOutcome::Forward(request) => network.fetch(request).await,
        }
    }

    /// The legacy request object's `open(method, url)`; returns the URL to open.
    pub fn open(&self, method: &str, url: &str) -> String {
        self.run(Seam::LegacyOpen, method, url).0.url
    }

    /// Absolute URL construction.
    pub fn construct_url(&self, url: &str) -> String {
        self.run(Seam::UrlConstruct, "GET", url).0.url
    }

    /// The source a script element will actually load for `url`.
    pub fn script_src(&self, path: InjectionPath, url: &str) -> String {
        self.run(Seam::ScriptSource(path), "GET", url).0.url
    }

    /// `script.src = value`
    pub fn set_src_property(&self, element: &mut Element, value: &str) {
        if element.is_script() {
            let src = self.script_src(InjectionPath::Property, value);
            element.set_attribute_raw("src", src);
        } else {
            element.set_attribute_raw("src", value);
        }
    }

    /// `element.setAttribute(name, value)`; only a script's `src` is guarded.
    pub fn set_attribute(&self, element: &mut Element, name: &str, value: &str) {
        if element.is_script() && name.eq_ignore_ascii_case("src") {
            let src = self.script_src(InjectionPath::Attribute, value);
            element.set_attribute_raw(name, src);
        } else {
            element.set_attribute_raw(name, value);
        }
    }

    /// `parent.appendChild(element)`; re-checks a script's source before insertion.
    pub fn append_child(&self, element: &mut Element) {
        if !element.is_script() {
            return;
        }
        if let Some(current) = element.attribute("src").map(str::to_string) {
            let src = self.script_src(InjectionPath::Insertion, &current);
            if src != current {
                element.set_attribute_raw("src", src);
            }
        }
    }

    /// The patched JSON decoder: parse, then sanitize.
    pub fn decode_json(&self, text: &str) -> Result<Value, serde_json::Error> {
        let parsed: Value = serde_json::from_str(text)?;
        self.metrics.sanitized_payloads.fetch_add(1, Ordering::Relaxed);
        Ok(self.ctx.sanitizer().sanitize_or_null(&parsed))
    }

    /// Decode the embedded settings payload at load time.
    pub fn bootstrap_settings(&self, raw: Option<&str>) -> Value {
        self.metrics.sanitized_payloads.fetch_add(1, Ordering::Relaxed);
        crate::settings::bootstrap(raw, self.ctx.sanitizer(), self.ctx.origin())
    }

    /// Rewrite well-known global base URL strings. Returns how many changed.
    pub fn sweep_globals(&self, scope: &dyn GlobalScope) -> usize {
        let mut changed = 0;
        for key in KNOWN_URL_GLOBALS {
            if let Some(GlobalValue::Text(current)) = scope.get(key) {
                let rewritten = self.construct_url(&current);
                if rewritten != current {
                    scope.set_text(key, rewritten);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            info!("Rewrote {} cached API base URL globals", changed);
        }
        changed
    }

    /// Run `sweep_globals` once after `delay`, for base URLs cached before the
    /// hooks were installed.
    pub fn schedule_globals_sweep(
        self: &Arc<Self>,
        scope: Arc<dyn GlobalScope>,
        delay: Duration,
    ) -> JoinHandle<usize> {
        let layer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            layer.sweep_globals(scope.as_ref())
        })
    }
}
