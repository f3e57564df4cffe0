use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;

use crate::cache::ResolutionCache;
use crate::config::Config;
use crate::resolver::{RadikoResolver, StreamResolver};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub http_client: Client,
    pub cache: Arc<ResolutionCache>,
}

impl AppState {
    pub fn initialize(config: Config) -> anyhow::Result<Self> {
        let resolver = Arc::new(RadikoResolver::new(config.resolver.clone())?);
        Self::with_resolver(config, resolver)
    }

    /// Build state around a caller-supplied resolver. Production wiring goes
    /// through `initialize`; embedders and tests inject their own seam here.
    pub fn with_resolver(
        config: Config,
        resolver: Arc<dyn StreamResolver>,
    ) -> anyhow::Result<Self> {
        let http_client = build_upstream_client(&config)?;
        let cache = Arc::new(ResolutionCache::new(
            resolver,
            Duration::from_secs(config.resolver.ttl_seconds),
        ));
        Ok(Self {
            config,
            http_client,
            cache,
        })
    }
}

// The upstream CDN expects requests that look like the radiko web player,
// so the shared client carries its browser-shaped headers.
fn build_upstream_client(config: &Config) -> anyhow::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert("Referer", HeaderValue::from_static("https://radiko.jp/"));
    headers.insert("Origin", HeaderValue::from_static("https://radiko.jp"));
    headers.insert(
        "Accept",
        HeaderValue::from_static("application/vnd.apple.mpegurl,*/*"),
    );
    headers.insert(
        "Accept-Language",
        HeaderValue::from_static("ja,en-US;q=0.9,en;q=0.8"),
    );
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Pragma", HeaderValue::from_static("no-cache"));

    Client::builder()
        .user_agent(config.resolver.user_agent.clone())
        .default_headers(headers)
        .build()
        .context("failed to build upstream http client")
}
