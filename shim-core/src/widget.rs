//! Embed widget configuration
//!
//! The dashboard card renders an iframe pointing at the mirror's `/map`
//! endpoint. Only the URL shape, the size hint and the stub configuration
//! matter to the rest of the system.

use crate::error::ShimError;
use crate::Result;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_LOCATION: &str = "ashburton";
pub const DEFAULT_STATE: &str = "vic";
pub const DEFAULT_BOM_PATH: &str = "australia/victoria/central/o2594692629-ashburton";
pub const DEFAULT_HEIGHT: &str = "400px";

/// Card configuration as written by the user; everything but `proxy_url` is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetInput {
    pub proxy_url: Option<String>,
    pub location: Option<String>,
    pub state: Option<String>,
    pub bom_path: Option<String>,
    pub height: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetConfig {
    pub proxy_url: String,
    pub location: String,
    pub state: String,
    pub bom_path: String,
    pub height: String,
    pub title: String,
}

fn or_default(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl WidgetConfig {
    pub fn from_input(input: WidgetInput) -> Result<Self> {
        let proxy_url = input
            .proxy_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ShimError::Configuration("proxy_url is required".to_string()))?;

        Ok(Self {
            proxy_url,
            location: or_default(input.location, DEFAULT_LOCATION),
            state: or_default(input.state, DEFAULT_STATE),
            bom_path: or_default(input.bom_path, DEFAULT_BOM_PATH),
            height: or_default(input.height, DEFAULT_HEIGHT),
            title: input.title.unwrap_or_default(),
        })
    }

    /// Configuration offered when the card is first added.
    pub fn stub() -> Self {
        Self {
            proxy_url: "http://192.168.1.100:8083".to_string(),
            location: DEFAULT_LOCATION.to_string(),
            state: DEFAULT_STATE.to_string(),
            bom_path: DEFAULT_BOM_PATH.to_string(),
            height: DEFAULT_HEIGHT.to_string(),
            title: "Weather Radar".to_string(),
        }
    }

    /// `<proxy>/map?location=..&state=..&path=..`
    pub fn map_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.proxy_url)?.join("/map")?;
        url.query_pairs_mut()
            .append_pair("location", &self.location)
            .append_pair("state", &self.state)
            .append_pair("path", &self.bom_path);
        Ok(url)
    }

    /// Layout rows: one per 50px of height, rounded up.
    pub fn size_hint(&self) -> u32 {
        let digits: String = self
            .height
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        match digits.parse::<u32>() {
            Ok(px) if px > 0 => px.div_ceil(50),
            _ => 8,
        }
    }
}
