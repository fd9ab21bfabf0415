//! Feature flag resolution
//!
//! Decides once per page load whether the town-label overlay is restored.
//! Sources are consulted in a fixed order and the first one that yields a
//! value wins:
//!
//! 1. the `bom_show_town_names` cookie
//! 2. query parameters of the current page URL
//! 3. query parameters of the referring URL
//! 4. persistent storage, then session storage
//! 5. `false`

use std::collections::HashMap;
use tracing::debug;
use url::Url;

pub const COOKIE_NAME: &str = "bom_show_town_names";

/// Query parameter aliases, checked in this order.
pub const QUERY_PARAMS: [&str; 6] = [
    "showTownNames",
    "townNames",
    "townnames",
    "townLabels",
    "townlabels",
    "towns",
];

/// Client storage keys, checked in this order.
pub const STORAGE_KEYS: [&str; 2] = ["bomKeepTownLabels", "showTownNames"];

/// Parse a flag value. Empty input is absent, not false.
pub fn parse_flag(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let lowered = value.to_ascii_lowercase();
    Some(!matches!(lowered.as_str(), "0" | "false" | "off" | "no"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSource {
    Cookie,
    PageQuery,
    ReferrerQuery,
    LocalStorage,
    SessionStorage,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub value: bool,
    pub source: FlagSource,
}

/// Snapshot of the environment signals available at page load.
#[derive(Debug, Clone, Default)]
pub struct FlagSources {
    cookie_header: Option<String>,
    page_url: Option<String>,
    referrer: Option<String>,
    local_storage: HashMap<String, String>,
    session_storage: HashMap<String, String>,
}

impl FlagSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw `Cookie` header or `document.cookie` string.
    pub fn with_cookies(mut self, header: impl Into<String>) -> Self {
        self.cookie_header = Some(header.into());
        self
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn with_referrer(mut self, url: impl Into<String>) -> Self {
        self.referrer = Some(url.into());
        self
    }

    pub fn with_local_storage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.local_storage.insert(key.into(), value.into());
        self
    }

    pub fn with_session_storage(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.session_storage.insert(key.into(), value.into());
        self
    }

    pub fn resolve(&self) -> Resolution {
        let sources: [(FlagSource, Option<bool>); 5] = [
            (FlagSource::Cookie, self.from_cookie()),
            (FlagSource::PageQuery, self.page_url.as_deref().and_then(from_query)),
            (FlagSource::ReferrerQuery, self.referrer.as_deref().and_then(from_query)),
            (FlagSource::LocalStorage, from_storage(&self.local_storage)),
            (FlagSource::SessionStorage, from_storage(&self.session_storage)),
        ];

        let resolution = sources
            .into_iter()
            .find_map(|(source, value)| value.map(|value| Resolution { value, source }))
            .unwrap_or(Resolution {
                value: false,
                source: FlagSource::Default,
            });

        debug!(
            "Town label flag resolved to {} from {:?}",
            resolution.value, resolution.source
        );
        resolution
    }

    fn from_cookie(&self) -> Option<bool> {
        let header = self.cookie_header.as_deref()?;
        header
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| name.trim() == COOKIE_NAME)
            .and_then(|(_, value)| parse_flag(value.trim().trim_matches('"')))
    }
}

fn from_query(url: &str) -> Option<bool> {
    let url = Url::parse(url).ok()?;
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    QUERY_PARAMS.iter().find_map(|param| {
        pairs
            .iter()
            .find(|(key, _)| key == param)
            .and_then(|(_, value)| parse_flag(value))
    })
}

fn from_storage(storage: &HashMap<String, String>) -> Option<bool> {
    STORAGE_KEYS
        .iter()
        .find_map(|key| storage.get(*key).and_then(|value| parse_flag(value)))
}
