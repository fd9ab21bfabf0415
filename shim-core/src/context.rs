//! Runtime context shared by every interceptor.
//!
//! One `RuntimeContext` exists per page load. It owns the page origin, the
//! resolved feature flag and the active sanitizer policy; rule tables are
//! built once per origin and shared behind an `Arc`.

use crate::error::ShimError;
use crate::policy::{BlockPolicy, InteractionBlocker};
use crate::rewrite::RewriteRule;
use crate::sanitizer::{ActivePolicy, PolicyVariant, Sanitizer};
use crate::Result;
use std::sync::Arc;
use url::Url;

/// Scheme, host and port of the page, serialized the way browsers do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageOrigin {
    serialized: String,
    base: Url,
}

impl PageOrigin {
    /// Parse an origin from any absolute URL; path, query and fragment are ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(ShimError::Configuration(format!(
                "{} has an opaque origin",
                input
            )));
        }
        let serialized = origin.ascii_serialization();
        let base = Url::parse(&serialized)?;
        Ok(Self { serialized, base })
    }

    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Absolute URL for an origin-relative path such as `/blocked-external/script`.
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.serialized, path)
    }

    /// Resolve a possibly-relative URL against the page origin.
    pub fn resolve(&self, url: &str) -> Option<Url> {
        self.base.join(url).ok()
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin().ascii_serialization() == self.serialized
    }
}

impl std::fmt::Display for PageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// Read-only rule tables for one origin.
#[derive(Debug)]
pub struct RuleSet {
    pub rewrite: RewriteRule,
    pub scripts: BlockPolicy,
    pub interactions: InteractionBlocker,
}

impl RuleSet {
    pub fn for_origin(origin: &PageOrigin) -> Self {
        Self {
            rewrite: RewriteRule::new(origin.clone()),
            scripts: BlockPolicy::new(origin),
            interactions: InteractionBlocker::new(origin),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeContext {
    origin: PageOrigin,
    rules: Arc<RuleSet>,
    variant: PolicyVariant,
    show_town_names: bool,
    sanitizer: Sanitizer,
}

impl RuntimeContext {
    pub fn new(origin: PageOrigin, variant: PolicyVariant, show_town_names: bool) -> Self {
        let rules = Arc::new(RuleSet::for_origin(&origin));
        Self::with_rules(origin, rules, variant, show_town_names)
    }

    fn with_rules(
        origin: PageOrigin,
        rules: Arc<RuleSet>,
        variant: PolicyVariant,
        show_town_names: bool,
    ) -> Self {
        let policy = ActivePolicy::resolve(variant, show_town_names);
        let sanitizer = Sanitizer::new(policy, &origin);
        Self {
            origin,
            rules,
            variant,
            show_town_names,
            sanitizer,
        }
    }

    /// Context for another page load on the same origin; rule tables are shared.
    pub fn for_page(&self, show_town_names: bool) -> Self {
        Self::with_rules(
            self.origin.clone(),
            Arc::clone(&self.rules),
            self.variant,
            show_town_names,
        )
    }

    pub fn origin(&self) -> &PageOrigin {
        &self.origin
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn show_town_names(&self) -> bool {
        self.show_town_names
    }

    pub fn policy(&self) -> ActivePolicy {
        self.sanitizer.policy()
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }
}
