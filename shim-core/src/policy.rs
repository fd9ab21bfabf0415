//! Block policy
//!
//! Two classifiers live here: third-party script sources (trackers and
//! CAPTCHA loaders) and interaction endpoints that are answered locally with a
//! canned payload instead of reaching the network.

use crate::context::PageOrigin;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref THIRD_PARTY_SCRIPT: Regex = Regex::new(
        r"(?i)googletagmanager\.com|google-analytics\.com|google\.com/recaptcha|gstatic\.com/recaptcha"
    )
    .expect("third-party script pattern is valid");
}

/// Origin-relative placeholder served instead of a blocked script.
pub const BLOCKED_SCRIPT_PATH: &str = "/blocked-external/script";
/// Origin-relative sink for real-user-monitoring beacons.
pub const BLOCKED_APM_PATH: &str = "/blocked-external/apm";
/// Origin-relative static JSON endpoint for blocked legacy requests.
pub const BLOCKED_INTERACTION_PATH: &str = "/blocked-external/interaction.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptVerdict {
    Allow,
    Block,
}

/// Classifies script sources about to be assigned to a script element.
#[derive(Debug, Clone)]
pub struct BlockPolicy {
    placeholder: String,
}

impl BlockPolicy {
    pub fn new(origin: &PageOrigin) -> Self {
        Self {
            placeholder: origin.join(BLOCKED_SCRIPT_PATH),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn classify_script_src(&self, url: &str) -> ScriptVerdict {
        if THIRD_PARTY_SCRIPT.is_match(url) {
            ScriptVerdict::Block
        } else {
            ScriptVerdict::Allow
        }
    }

    /// The source the element should actually load.
    ///
    /// Blocked sources are pointed at an inert placeholder rather than dropped,
    /// so code waiting on the element's load event still sees one.
    pub fn effective_src<'a>(&self, url: &'a str) -> Cow<'a, str> {
        match self.classify_script_src(url) {
            ScriptVerdict::Allow => Cow::Borrowed(url),
            ScriptVerdict::Block => Cow::Owned(self.placeholder.clone()),
        }
    }
}

/// Canonical kinds of locally answered interaction requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedKind {
    PlacesSearchStation,
    RecentObservations,
}

impl BlockedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedKind::PlacesSearchStation => "places_search_station",
            BlockedKind::RecentObservations => "recent_observations",
        }
    }

    /// Schema-shaped empty result for this kind.
    pub fn canned_payload(&self) -> Value {
        match self {
            BlockedKind::PlacesSearchStation => json!({
                "blocked": true,
                "place": null,
                "places": [],
                "candidates": [],
                "results": [],
            }),
            BlockedKind::RecentObservations => json!({
                "blocked": true,
                "data": [],
                "observations": [],
                "metadata": {},
            }),
        }
    }
}

impl fmt::Display for BlockedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "places_search_station" => Ok(BlockedKind::PlacesSearchStation),
            "recent_observations" => Ok(BlockedKind::RecentObservations),
            other => Err(format!("unknown interaction kind: {}", other)),
        }
    }
}

/// Query parameter whose decoded value must start with `prefix`.
#[derive(Debug, Clone)]
pub struct QueryPredicate {
    pub param: &'static str,
    pub prefix: &'static str,
}

#[derive(Debug, Clone)]
pub struct InteractionRule {
    pub kind: BlockedKind,
    pub path_contains: &'static str,
    pub query: Option<QueryPredicate>,
}

impl InteractionRule {
    fn matches(&self, url: &url::Url) -> bool {
        if !url.path().to_ascii_lowercase().contains(self.path_contains) {
            return false;
        }

        match &self.query {
            None => true,
            Some(predicate) => url.query_pairs().any(|(key, value)| {
                key == predicate.param && value.to_ascii_lowercase().starts_with(predicate.prefix)
            }),
        }
    }
}

/// Recognises request shapes that never leave the page.
#[derive(Debug, Clone)]
pub struct InteractionBlocker {
    origin: PageOrigin,
    rules: Vec<InteractionRule>,
}

impl InteractionBlocker {
    pub fn new(origin: &PageOrigin) -> Self {
        Self {
            origin: origin.clone(),
            rules: vec![
                InteractionRule {
                    kind: BlockedKind::PlacesSearchStation,
                    path_contains: "/locations/places/search",
                    query: Some(QueryPredicate {
                        param: "filter",
                        prefix: "nearby_type:bom_stn",
                    }),
                },
                InteractionRule {
                    kind: BlockedKind::RecentObservations,
                    path_contains: "/observations/recent",
                    query: None,
                },
            ],
        }
    }

    /// Classify a request URL; relative URLs resolve against the page origin.
    /// Unparseable input is never blocked.
    pub fn classify(&self, url: &str) -> Option<BlockedKind> {
        let parsed = self.origin.resolve(url)?;
        self.rules
            .iter()
            .find(|rule| rule.matches(&parsed))
            .map(|rule| rule.kind)
    }

    /// Same-origin static endpoint that legacy request objects are pointed at,
    /// since they cannot be answered with an in-memory body.
    pub fn legacy_redirect(&self, kind: BlockedKind) -> String {
        format!(
            "{}?kind={}",
            self.origin.join(BLOCKED_INTERACTION_PATH),
            kind.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> PageOrigin {
        PageOrigin::parse("https://mirror.example").unwrap()
    }

    #[test]
    fn test_script_classification() {
        let policy = BlockPolicy::new(&origin());

        for blocked in [
            "https://www.googletagmanager.com/gtm.js?id=GTM-XXXX",
            "https://www.google-analytics.com/analytics.js",
            "https://www.google.com/recaptcha/api.js",
            "https://www.GSTATIC.com/recaptcha/releases/abc/recaptcha__en.js",
        ] {
            assert_eq!(policy.classify_script_src(blocked), ScriptVerdict::Block, "{blocked}");
            assert_eq!(
                policy.effective_src(blocked),
                "https://mirror.example/blocked-external/script"
            );
        }

        for allowed in [
            "https://mirror.example/themes/custom/bom/js/app.js",
            "https://js.arcgis.com/4.28/init.js",
            "https://www.google.com/maps/api/js",
        ] {
            assert_eq!(policy.classify_script_src(allowed), ScriptVerdict::Allow, "{allowed}");
            assert!(matches!(policy.effective_src(allowed), Cow::Borrowed(_)));
        }
    }

    #[test]
    fn test_places_search_requires_station_filter() {
        let blocker = InteractionBlocker::new(&origin());

        assert_eq!(
            blocker.classify(
                "https://mirror.example/apikey/v1/locations/places/search?filter=nearby_type:bom_stn:xyz"
            ),
            Some(BlockedKind::PlacesSearchStation)
        );
        assert_eq!(
            blocker.classify(
                "/apikey/v1/locations/places/search?filter=nearby_type%3Abom_stn%3A123&limit=1"
            ),
            Some(BlockedKind::PlacesSearchStation)
        );
        assert_eq!(
            blocker.classify("/apikey/v1/locations/places/search?filter=name:ashburton"),
            None
        );
        assert_eq!(blocker.classify("/apikey/v1/locations/places/search"), None);
    }

    #[test]
    fn test_recent_observations_any_query() {
        let blocker = InteractionBlocker::new(&origin());
        assert_eq!(
            blocker.classify("https://api.bom.gov.au/apikey/v1/observations/recent/94868?units=metric"),
            Some(BlockedKind::RecentObservations)
        );
        assert_eq!(blocker.classify("/apikey/v1/observations/latest/94868"), None);
    }

    #[test]
    fn test_legacy_redirect_and_kind_round_trip() {
        let blocker = InteractionBlocker::new(&origin());
        assert_eq!(
            blocker.legacy_redirect(BlockedKind::RecentObservations),
            "https://mirror.example/blocked-external/interaction.json?kind=recent_observations"
        );
        assert_eq!(
            "places_search_station".parse::<BlockedKind>(),
            Ok(BlockedKind::PlacesSearchStation)
        );
        assert!("nope".parse::<BlockedKind>().is_err());
    }

    #[test]
    fn test_places_payload_shape() {
        let payload = BlockedKind::PlacesSearchStation.canned_payload();
        assert_eq!(payload["blocked"], true);
        assert!(payload["place"].is_null());
        for key in ["places", "candidates", "results"] {
            assert_eq!(payload[key], serde_json::json!([]));
        }
    }
}
