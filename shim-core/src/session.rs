//! Per-page-load wiring
//!
//! A `PageSession` is what an embedding host creates once the page starts
//! loading: the interception layer with its chain installed, the settings
//! bootstrap, the delayed globals sweep and, when town labels are on, the
//! overlay engine with its polling fallback.

use crate::admin::Metrics;
use crate::config::ShimConfig;
use crate::context::RuntimeContext;
use crate::flags::{FlagSources, Resolution};
use crate::host::GlobalScope;
use crate::interceptor::InterceptionLayer;
use crate::overlay::{start_polling, OverlayEngine, PollHandle};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct PageSession {
    flag: Resolution,
    layer: Arc<InterceptionLayer>,
    settings: Value,
    overlay: Option<Arc<OverlayEngine>>,
    poll: Option<PollHandle>,
    sweep: JoinHandle<usize>,
}

impl PageSession {
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: &ShimConfig,
        sources: &FlagSources,
        raw_settings: Option<&str>,
        globals: Arc<dyn GlobalScope>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let flag = sources.resolve();
        let ctx = Arc::new(RuntimeContext::new(
            config.origin()?,
            config.sanitize_policy,
            flag.value,
        ));
        info!(
            "Page session for {} (town labels {}, {:?})",
            ctx.origin(),
            flag.value,
            ctx.policy()
        );

        let layer = Arc::new(InterceptionLayer::new(Arc::clone(&ctx)).with_metrics(metrics));
        let settings = layer.bootstrap_settings(raw_settings);
        let sweep = layer.schedule_globals_sweep(Arc::clone(&globals), config.globals_sweep_delay());

        let overlay = OverlayEngine::activate(&ctx);
        let poll = overlay.as_ref().map(|engine| {
            // Loader may already be present.
            engine.patch_loader(globals.as_ref());
            start_polling(Arc::clone(engine), Arc::clone(&globals), &config.overlay)
        });

        Ok(Self {
            flag,
            layer,
            settings,
            overlay,
            poll,
            sweep,
        })
    }

    pub fn flag(&self) -> &Resolution {
        &self.flag
    }

    pub fn layer(&self) -> &Arc<InterceptionLayer> {
        &self.layer
    }

    /// Sanitized settings with telemetry neutralized.
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    pub fn overlay(&self) -> Option<&Arc<OverlayEngine>> {
        self.overlay.as_ref()
    }

    pub fn poll(&self) -> Option<&PollHandle> {
        self.poll.as_ref()
    }

    pub fn sweep_finished(&self) -> bool {
        self.sweep.is_finished()
    }

    /// Stop background work for a page that is going away.
    pub fn close(&self) {
        self.sweep.abort();
        if let Some(poll) = &self.poll {
            poll.abort();
        }
    }
}

impl Drop for PageSession {
    fn drop(&mut self) {
        self.close();
    }
}
