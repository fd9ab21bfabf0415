//! Inert endpoints under `/blocked-external/`
//!
//! Blocked scripts, monitoring beacons and legacy interaction requests are
//! pointed at these paths on the page origin. The proxy handler answers them
//! without going upstream; `router()` serves the same bodies for mirrors that
//! mount it.

use crate::host::FetchResponse;
use crate::policy::{BlockedKind, BLOCKED_APM_PATH, BLOCKED_INTERACTION_PATH, BLOCKED_SCRIPT_PATH};
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedEndpoint {
    Script,
    Apm,
    /// `None` when the `kind` parameter is missing or unknown.
    Interaction(Option<BlockedKind>),
}

impl BlockedEndpoint {
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.path() {
            BLOCKED_SCRIPT_PATH => Some(BlockedEndpoint::Script),
            BLOCKED_APM_PATH => Some(BlockedEndpoint::Apm),
            BLOCKED_INTERACTION_PATH => {
                let kind = url
                    .query_pairs()
                    .find(|(key, _)| key == "kind")
                    .and_then(|(_, value)| value.parse().ok());
                Some(BlockedEndpoint::Interaction(kind))
            }
            _ => None,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            BlockedEndpoint::Apm => 204,
            _ => 200,
        }
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            BlockedEndpoint::Script => Some("application/javascript; charset=utf-8"),
            BlockedEndpoint::Apm => None,
            BlockedEndpoint::Interaction(_) => Some("application/json"),
        }
    }

    pub fn body(&self) -> String {
        match self {
            BlockedEndpoint::Script | BlockedEndpoint::Apm => String::new(),
            BlockedEndpoint::Interaction(Some(kind)) => kind.canned_payload().to_string(),
            BlockedEndpoint::Interaction(None) => json!({ "blocked": true }).to_string(),
        }
    }

    pub fn to_response(&self, url: impl Into<String>) -> FetchResponse {
        let mut response = FetchResponse::new(self.status(), url)
            .with_header("cache-control", "no-store")
            .with_body(self.body());
        if let Some(content_type) = self.content_type() {
            response.set_header("content-type", content_type);
        }
        response
    }
}

impl IntoResponse for BlockedEndpoint {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::OK);
        let body = self.body();
        match self.content_type() {
            Some(content_type) => (
                status,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CACHE_CONTROL, "no-store"),
                ],
                body,
            )
                .into_response(),
            None => (status, [(header::CACHE_CONTROL, "no-store")]).into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InteractionQuery {
    kind: Option<String>,
}

async fn script_handler() -> BlockedEndpoint {
    BlockedEndpoint::Script
}

async fn apm_handler() -> BlockedEndpoint {
    BlockedEndpoint::Apm
}

async fn interaction_handler(Query(query): Query<InteractionQuery>) -> BlockedEndpoint {
    BlockedEndpoint::Interaction(query.kind.and_then(|kind| kind.parse().ok()))
}

pub fn router() -> Router {
    Router::new()
        .route(BLOCKED_SCRIPT_PATH, get(script_handler))
        .route(BLOCKED_APM_PATH, get(apm_handler).post(apm_handler))
        .route(BLOCKED_INTERACTION_PATH, get(interaction_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Option<BlockedEndpoint> {
        BlockedEndpoint::from_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_from_url() {
        assert_eq!(
            endpoint("https://mirror.example/blocked-external/script"),
            Some(BlockedEndpoint::Script)
        );
        assert_eq!(
            endpoint("https://mirror.example/blocked-external/interaction.json?kind=recent_observations"),
            Some(BlockedEndpoint::Interaction(Some(BlockedKind::RecentObservations)))
        );
        assert_eq!(
            endpoint("https://mirror.example/blocked-external/interaction.json?kind=bogus"),
            Some(BlockedEndpoint::Interaction(None))
        );
        assert_eq!(endpoint("https://mirror.example/blocked-external/other"), None);
    }

    #[test]
    fn test_apm_response_is_empty_no_content() {
        let response = BlockedEndpoint::Apm.to_response("https://mirror.example/blocked-external/apm");
        assert_eq!(response.status, 204);
        assert!(response.body.is_empty());
        assert_eq!(response.header("content-type"), None);
    }

    #[test]
    fn test_interaction_body_is_canned_payload() {
        let body = BlockedEndpoint::Interaction(Some(BlockedKind::PlacesSearchStation)).body();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, BlockedKind::PlacesSearchStation.canned_payload());
    }
}
