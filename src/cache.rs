//! Offline shell for the console's web front end
//!
//! Mirrors what a service worker does for the app: precache the static
//! assets into a versioned cache generation, drop older generations on
//! activation, and route fetches. Navigations go network-first so a reachable
//! server always wins; everything else is stale-while-revalidate.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{PillTickError, Result};

/// Cache generation names are this prefix plus the app version
pub const CACHE_PREFIX: &str = "pilltick-";

/// Static assets stored on install; the HTML shell is deliberately absent
pub const CORE_ASSETS: [&str; 4] = [
    "./styles.css",
    "./script.js",
    "./manifest.json",
    "./version.js",
];

const SHELL_DOCUMENT: &str = "./index.html";

/// How the request was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation
    Navigate,
    /// Same-origin subresource
    #[default]
    SameOrigin,
    /// Cross-origin subresource
    Cors,
}

/// What the response will be used as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// An HTML document
    Document,
    /// Script
    Script,
    /// Stylesheet
    Style,
    /// Web app manifest
    Manifest,
    /// Anything else
    #[default]
    Other,
}

/// Whether the network layer may answer from its own HTTP cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Normal HTTP caching
    Default,
    /// Always go to the server
    NoStore,
}

/// An intercepted fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Absolute URL
    pub url: String,
    /// Request mode
    pub mode: RequestMode,
    /// Request destination
    pub destination: Destination,
}

impl Request {
    /// Plain subresource request
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: RequestMode::default(),
            destination: Destination::default(),
        }
    }

    /// Page navigation
    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: RequestMode::Navigate,
            destination: Destination::Document,
        }
    }

    /// Whether this request loads the HTML shell
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
            || self.destination == Destination::Document
            || self.url.ends_with('/')
            || self.url.ends_with("/index.html")
    }
}

/// A response body with its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Body bytes
    pub body: Bytes,
}

impl Response {
    /// 200 response with the given body
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Network access for the shell
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch from the network
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::Fetch`] when the network is unreachable.
    async fn fetch(&self, request: &Request, policy: CachePolicy) -> Result<Response>;
}

/// Named cache generations, each mapping URL to response
#[derive(Debug, Default)]
pub struct CacheStorage {
    generations: RwLock<BTreeMap<String, HashMap<String, Response>>>,
}

impl CacheStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all generations, sorted
    pub async fn keys(&self) -> Vec<String> {
        self.generations.read().await.keys().cloned().collect()
    }

    /// Store a response in one generation, creating it if needed
    pub async fn put(&self, cache: &str, url: &str, response: Response) {
        self.generations
            .write()
            .await
            .entry(cache.to_string())
            .or_default()
            .insert(url.to_string(), response);
    }

    /// Look up a URL in one generation
    pub async fn lookup(&self, cache: &str, url: &str) -> Option<Response> {
        self.generations
            .read()
            .await
            .get(cache)
            .and_then(|entries| entries.get(url))
            .cloned()
    }

    /// Look up a URL in every generation, in name order
    pub async fn lookup_any(&self, url: &str) -> Option<Response> {
        self.generations
            .read()
            .await
            .values()
            .find_map(|entries| entries.get(url))
            .cloned()
    }

    /// Drop one generation; returns whether it existed
    pub async fn delete(&self, cache: &str) -> bool {
        self.generations.write().await.remove(cache).is_some()
    }
}

/// Message posted from the page to the shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMessage {
    /// Activate a waiting shell right away
    SkipWaiting,
    /// Anything the shell does not understand
    Unknown,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl ShellMessage {
    /// Decode a posted JSON message; malformed input is [`ShellMessage::Unknown`]
    #[must_use]
    pub fn from_json(data: &str) -> Self {
        match serde_json::from_str::<RawMessage>(data) {
            Ok(RawMessage { kind: Some(kind) }) if kind == "SKIP_WAITING" => Self::SkipWaiting,
            _ => Self::Unknown,
        }
    }
}

/// Version passed as `?v=` on the shell's script URL
#[must_use]
pub fn version_from_script_url(url: &str) -> Option<String> {
    let url = url.split('#').next().unwrap_or(url);
    let (_, query) = url.split_once('?')?;

    query
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(key, _)| *key == "v")
        .map(|(_, value)| percent_decode(value))
        .filter(|value| !value.is_empty())
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Lifecycle of the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// Created, nothing cached yet
    Parsed,
    /// Core assets cached; waiting to take over
    Installed,
    /// Serving fetches from its generation
    Activated,
}

/// Cache-backed fetch router for one app version
pub struct OfflineShell {
    scope: String,
    version: String,
    cache_name: String,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<CacheStorage>,
    state: StdMutex<ShellState>,
    skip_waiting: AtomicBool,
    revalidations: StdMutex<Vec<JoinHandle<Option<Response>>>>,
}

impl OfflineShell {
    /// Create a shell serving `scope` (the app's base URL)
    ///
    /// `version` names the cache generation; `None` falls back to the
    /// built-in default.
    pub fn new(
        scope: impl Into<String>,
        version: Option<&str>,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<CacheStorage>,
    ) -> Self {
        let mut scope = scope.into();
        if !scope.ends_with('/') {
            scope.push('/');
        }
        let version = version
            .filter(|v| !v.is_empty())
            .unwrap_or(crate::DEFAULT_APP_VERSION)
            .to_string();

        Self {
            scope,
            cache_name: format!("{CACHE_PREFIX}{version}"),
            version,
            fetcher,
            caches,
            state: StdMutex::new(ShellState::Parsed),
            skip_waiting: AtomicBool::new(false),
            revalidations: StdMutex::new(Vec::new()),
        }
    }

    /// Create a shell whose version comes from its script URL
    pub fn from_script_url(
        script_url: &str,
        scope: impl Into<String>,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<CacheStorage>,
    ) -> Self {
        let version = version_from_script_url(script_url);
        Self::new(scope, version.as_deref(), fetcher, caches)
    }

    /// App version
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Name of this version's cache generation
    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShellState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ShellState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Whether the shell asked to be activated without waiting
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Absolute URL of a path relative to the scope
    #[must_use]
    pub fn resolve(&self, path: &str) -> String {
        if path.contains("://") {
            return path.to_string();
        }
        let relative = path.trim_start_matches("./").trim_start_matches('/');
        format!("{}{relative}", self.scope)
    }

    /// Precache the core assets
    ///
    /// All or nothing: if any asset fails, nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or [`PillTickError::Fetch`] for a non-2xx asset.
    pub async fn install(&self) -> Result<()> {
        self.skip_waiting.store(true, Ordering::SeqCst);

        let mut fetched = Vec::with_capacity(CORE_ASSETS.len());
        for asset in CORE_ASSETS {
            let request = Request::get(self.resolve(asset));
            let response = self.fetcher.fetch(&request, CachePolicy::Default).await?;
            if !response.is_ok() {
                return Err(PillTickError::Fetch(format!(
                    "{} returned {}",
                    request.url, response.status
                )));
            }
            fetched.push((request.url, response));
        }

        for (url, response) in fetched {
            self.caches.put(&self.cache_name, &url, response).await;
        }
        self.set_state(ShellState::Installed);
        info!("Offline shell {} installed", self.cache_name);
        Ok(())
    }

    /// React to a page message
    pub fn handle_message(&self, message: &ShellMessage) {
        match message {
            ShellMessage::SkipWaiting => self.skip_waiting.store(true, Ordering::SeqCst),
            ShellMessage::Unknown => debug!("Ignoring unknown shell message"),
        }
    }

    /// Take over and delete every other cache generation
    ///
    /// Returns the number of generations purged.
    pub async fn activate(&self) -> usize {
        let mut purged = 0;
        for key in self.caches.keys().await {
            if key != self.cache_name && self.caches.delete(&key).await {
                debug!("Purged cache generation {key}");
                purged += 1;
            }
        }
        self.set_state(ShellState::Activated);
        info!("Offline shell {} active", self.cache_name);
        purged
    }

    /// Answer an intercepted request
    ///
    /// # Errors
    ///
    /// Returns [`PillTickError::Offline`] when the network fails and nothing
    /// suitable is cached.
    pub async fn fetch(&self, request: &Request) -> Result<Response> {
        if request.is_navigation() {
            self.network_first(request).await
        } else {
            self.stale_while_revalidate(request).await
        }
    }

    async fn network_first(&self, request: &Request) -> Result<Response> {
        match self.fetcher.fetch(request, CachePolicy::NoStore).await {
            Ok(fresh) => {
                if fresh.is_ok() {
                    self.caches
                        .put(&self.cache_name, &request.url, fresh.clone())
                        .await;
                }
                Ok(fresh)
            }
            Err(e) => {
                debug!("Navigation to {} failed, trying cache: {e}", request.url);
                if let Some(cached) = self.caches.lookup_any(&request.url).await {
                    return Ok(cached);
                }
                self.caches
                    .lookup_any(&self.resolve(SHELL_DOCUMENT))
                    .await
                    .ok_or_else(|| PillTickError::Offline {
                        url: request.url.clone(),
                    })
            }
        }
    }

    async fn stale_while_revalidate(&self, request: &Request) -> Result<Response> {
        let cached = self.caches.lookup(&self.cache_name, &request.url).await;
        let refresh = self.spawn_refresh(request.clone());

        if let Some(cached) = cached {
            let mut pending = self
                .revalidations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.retain(|refresh| !refresh.is_finished());
            pending.push(refresh);
            return Ok(cached);
        }

        refresh
            .await
            .map_err(|e| PillTickError::Fetch(e.to_string()))?
            .ok_or_else(|| PillTickError::Offline {
                url: request.url.clone(),
            })
    }

    fn spawn_refresh(&self, request: Request) -> JoinHandle<Option<Response>> {
        let fetcher = Arc::clone(&self.fetcher);
        let caches = Arc::clone(&self.caches);
        let cache_name = self.cache_name.clone();

        tokio::spawn(async move {
            match fetcher.fetch(&request, CachePolicy::Default).await {
                Ok(response) => {
                    if response.is_ok() {
                        caches.put(&cache_name, &request.url, response.clone()).await;
                    }
                    Some(response)
                }
                Err(e) => {
                    debug!("Background refresh of {} failed: {e}", request.url);
                    None
                }
            }
        })
    }

    #[cfg(test)]
    fn pending_refreshes(&self) -> usize {
        self.revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait for background refreshes started so far
    pub async fn settle(&self) {
        let pending: Vec<_> = self
            .revalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for refresh in pending {
            if let Err(e) = refresh.await {
                warn!("Background refresh task failed: {e}");
            }
        }
    }
}
