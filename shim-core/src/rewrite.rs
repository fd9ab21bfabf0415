//! Vendor API host rewriting
//!
//! Maps `https://api.bom.gov.au/...` (and the `api.test2` staging host) onto
//! the page's own origin, keeping path and query intact.

use crate::context::PageOrigin;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::borrow::Cow;

lazy_static! {
    /// Vendor scheme + host, an optional explicit port, and the character that
    /// ends the authority. The tail group keeps `api.bom.gov.au.example.net`
    /// from matching.
    static ref VENDOR_API_HOST: Regex =
        Regex::new(r"(?i)https://api(?:\.test2)?\.bom\.gov\.au(?::\d+)?(?P<tail>[/?#]|$)")
            .expect("vendor host pattern is valid");
}

/// Hostnames served by the vendor API, for host-only checks.
pub const VENDOR_API_HOSTS: [&str; 2] = ["api.bom.gov.au", "api.test2.bom.gov.au"];

#[derive(Debug, Clone)]
pub struct RewriteRule {
    replacement: PageOrigin,
}

impl RewriteRule {
    pub fn new(replacement: PageOrigin) -> Self {
        Self { replacement }
    }

    pub fn replacement(&self) -> &PageOrigin {
        &self.replacement
    }

    pub fn matches(&self, url: &str) -> bool {
        VENDOR_API_HOST.is_match(url)
    }

    /// Rewrite every vendor API origin in `url`. Input without one is borrowed
    /// back unchanged.
    pub fn rewrite<'a>(&self, url: &'a str) -> Cow<'a, str> {
        let origin = self.replacement.as_str();
        VENDOR_API_HOST.replace_all(url, |caps: &Captures| format!("{}{}", origin, &caps["tail"]))
    }
}

pub fn is_vendor_host(host: &str) -> bool {
    VENDOR_API_HOSTS
        .iter()
        .any(|vendor| vendor.eq_ignore_ascii_case(host))
}
