//! Embedded settings payload
//!
//! The vendor page ships its configuration as a JSON script element
//! (`data-drupal-selector="drupal-settings-json"`). At load time it is decoded,
//! sanitized and stripped of telemetry identifiers before the client bundle
//! reads it.

use crate::context::PageOrigin;
use crate::policy::BLOCKED_APM_PATH;
use crate::sanitizer::Sanitizer;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::ops::Range;
use tracing::{debug, warn};

pub const SETTINGS_SELECTOR: &str = "drupal-settings-json";

lazy_static! {
    static ref SCRIPT_ELEMENT: Regex =
        Regex::new(r"(?is)<script\b(?P<attrs>[^>]*)>(?P<body>.*?)</script\s*>")
            .expect("script element pattern is valid");
    static ref SELECTOR_ATTR: Regex =
        Regex::new(r#"(?i)\bdata-drupal-selector\s*=\s*["']?drupal-settings-json["']?"#)
            .expect("selector attribute pattern is valid");
    static ref JSON_TYPE_ATTR: Regex =
        Regex::new(r#"(?i)\btype\s*=\s*["']?application/json["']?"#)
            .expect("type attribute pattern is valid");
}

/// Location of the settings payload inside a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsPayload<'a> {
    pub text: &'a str,
    pub body_range: Range<usize>,
}

/// Find the settings script element in an HTML document.
pub fn extract_settings_payload(html: &str) -> Option<SettingsPayload<'_>> {
    SCRIPT_ELEMENT.captures_iter(html).find_map(|caps| {
        let attrs = caps.name("attrs")?.as_str();
        if !SELECTOR_ATTR.is_match(attrs) || !JSON_TYPE_ATTR.is_match(attrs) {
            return None;
        }
        let body = caps.name("body")?;
        Some(SettingsPayload {
            text: body.as_str(),
            body_range: body.range(),
        })
    })
}

/// Decode, sanitize and neutralize the settings payload.
///
/// A missing, empty or malformed payload yields an empty object.
pub fn bootstrap(raw: Option<&str>, sanitizer: &Sanitizer, origin: &PageOrigin) -> Value {
    let decoded = match raw.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Settings payload is not valid JSON, using empty settings: {}", e);
                Value::Object(Map::new())
            }
        },
        None => Value::Object(Map::new()),
    };

    let mut settings = match sanitizer.sanitize(&decoded) {
        Some(value @ Value::Object(_)) => value,
        _ => Value::Object(Map::new()),
    };
    neutralize_telemetry(&mut settings, origin);
    settings
}

/// Clear tag manager identifiers and zero out real-user-monitoring sampling.
pub fn neutralize_telemetry(settings: &mut Value, origin: &PageOrigin) {
    let Some(root) = settings.as_object_mut() else {
        return;
    };

    if let Some(Value::Object(gtm)) = root.get_mut("gtm") {
        gtm.insert("tagId".to_string(), Value::Null);
        gtm.insert("tagIds".to_string(), Value::Array(Vec::new()));
        let inner = gtm
            .entry("settings")
            .or_insert_with(|| Value::Object(Map::new()));
        if !inner.is_object() {
            *inner = Value::Object(Map::new());
        }
        if let Value::Object(inner) = inner {
            inner.insert("include_classes".to_string(), Value::Bool(false));
        }
    }

    if let Some(Value::Object(gtag)) = root.get_mut("gtag") {
        gtag.insert("tagId".to_string(), Value::String(String::new()));
        gtag.insert("otherIds".to_string(), Value::Array(Vec::new()));
        gtag.insert("events".to_string(), Value::Array(Vec::new()));
    }

    if let Some(Value::Object(rum)) = root.get_mut("bomRum") {
        rum.insert(
            "apmUrl".to_string(),
            Value::String(origin.join(BLOCKED_APM_PATH)),
        );
        rum.insert("transactionSampleRate".to_string(), Value::from(0));
        rum.insert("eventsLimit".to_string(), Value::from(0));
    }
}

/// Rewrite the settings payload of an HTML document in place.
///
/// Returns `None` when the document has no settings element.
pub fn rewrite_document(html: &str, sanitizer: &Sanitizer, origin: &PageOrigin) -> Option<String> {
    let payload = extract_settings_payload(html)?;
    let settings = bootstrap(Some(payload.text), sanitizer, origin);

    // `</` must not appear inside a script element.
    let encoded = settings.to_string().replace("</", "<\\/");
    debug!(
        "Rewrote settings payload ({} -> {} bytes)",
        payload.text.len(),
        encoded.len()
    );

    let mut out = String::with_capacity(html.len() + encoded.len());
    out.push_str(&html[..payload.body_range.start]);
    out.push_str(&encoded);
    out.push_str(&html[payload.body_range.end..]);
    Some(out)
}
