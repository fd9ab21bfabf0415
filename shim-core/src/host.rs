//! Host seams
//!
//! The interception layer never talks to a browser or socket directly. Hosts
//! hand it requests, elements and global bindings through the types and
//! traits in this module.

use crate::error::NetworkError;
use crate::overlay::{MapLike, ModuleLoader};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A request as issued by page code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Same request (method, headers, body) aimed at another URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: u16, url: impl Into<String>) -> Self {
        Self {
            status,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// A successful JSON response synthesized without touching the network.
    pub fn json(url: impl Into<String>, value: &serde_json::Value) -> Self {
        Self::new(200, url)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Status in the 2xx range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace a header, case-insensitively.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// The fetch primitive underneath the interception layer.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError>;
}

/// `Network` backed by a reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestNetwork {
    client: reqwest::Client,
}

impl ReqwestNetwork {
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for ReqwestNetwork {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout {
                    url: request.url.clone(),
                }
            } else {
                NetworkError::Transport {
                    url: request.url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| NetworkError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        Ok(FetchResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

/// A DOM element as seen by the subresource guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    tag_name: String,
    attributes: BTreeMap<String, String>,
}

impl Element {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into().to_ascii_uppercase(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn script() -> Self {
        Self::new("SCRIPT")
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn is_script(&self) -> bool {
        self.tag_name == "SCRIPT"
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Unguarded attribute write, the native behaviour.
    pub fn set_attribute_raw(&mut self, name: &str, value: impl Into<String>) {
        self.attributes
            .insert(name.to_ascii_lowercase(), value.into());
    }
}

/// A value bound in the page's global scope.
#[derive(Clone)]
pub enum GlobalValue {
    Text(String),
    Map(Arc<dyn MapLike>),
    Other,
}

impl std::fmt::Debug for GlobalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlobalValue::Text(text) => f.debug_tuple("Text").field(text).finish(),
            GlobalValue::Map(_) => f.write_str("Map(..)"),
            GlobalValue::Other => f.write_str("Other"),
        }
    }
}

/// Top-level bindings of the page, plus the mapping library's module loader.
pub trait GlobalScope: Send + Sync {
    fn get(&self, name: &str) -> Option<GlobalValue>;

    fn set_text(&self, name: &str, value: String);

    fn bindings(&self) -> Vec<(String, GlobalValue)>;

    /// The mapping library's asynchronous module loader, once it has loaded.
    fn module_loader(&self) -> Option<Arc<dyn ModuleLoader>>;

    /// Swap the module loader. Returns `false` when the host cannot.
    fn replace_module_loader(&self, loader: Arc<dyn ModuleLoader>) -> bool;
}
