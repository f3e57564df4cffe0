use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::config::ResolverConfig;
use crate::logging::logger;

// Shared authorization key of the pc_html5 web player. The auth1 response
// selects a window into it; auth2 expects that window base64-encoded.
const RADIKO_AUTH_KEY: &[u8] = b"bcd151073c03b352e1ef2fd66c32209da9ca0afa";

/// A station resolved to a direct, time-limited playlist URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    pub station_id: String,
    pub playlist_url: Url,
}

/// Live-stream discovery seam. `Ok(None)` means the station exists but has
/// no playable variant right now; transport problems propagate as errors.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve_live(&self, station_id: &str) -> anyhow::Result<Option<ResolvedStream>>;
}

pub struct RadikoResolver {
    config: ResolverConfig,
    client: Client,
}

struct AuthSession {
    #[allow(dead_code)]
    token: String,
    area: String,
}

impl RadikoResolver {
    pub fn new(config: ResolverConfig) -> anyhow::Result<Self> {
        // The client-level timeout bounds each negotiation call end to end,
        // body read included.
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build resolver http client")?;
        Ok(Self { config, client })
    }

    async fn authorize(&self) -> anyhow::Result<AuthSession> {
        let auth1 = self
            .client
            .get(format!("{}/v2/api/auth1", self.config.api_base))
            .header("X-Radiko-App", "pc_html5")
            .header("X-Radiko-App-Version", "0.0.1")
            .header("X-Radiko-User", "dummy_user")
            .header("X-Radiko-Device", "pc")
            .send()
            .await
            .context("auth1 request failed")?;
        anyhow::ensure!(
            auth1.status().is_success(),
            "auth1 returned {}",
            auth1.status()
        );

        let token = header_value(&auth1, "x-radiko-authtoken")?;
        let length: usize = header_value(&auth1, "x-radiko-keylength")?
            .parse()
            .context("invalid key length")?;
        let offset: usize = header_value(&auth1, "x-radiko-keyoffset")?
            .parse()
            .context("invalid key offset")?;
        let partial_key = derive_partial_key(RADIKO_AUTH_KEY, offset, length)?;

        let auth2 = self
            .client
            .get(format!("{}/v2/api/auth2", self.config.api_base))
            .header("X-Radiko-AuthToken", &token)
            .header("X-Radiko-Partialkey", &partial_key)
            .header("X-Radiko-User", "dummy_user")
            .header("X-Radiko-Device", "pc")
            .send()
            .await
            .context("auth2 request failed")?;
        anyhow::ensure!(
            auth2.status().is_success(),
            "auth2 returned {}",
            auth2.status()
        );

        let body = auth2.text().await.context("auth2 body unreadable")?;
        let area = body
            .split(',')
            .next()
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        anyhow::ensure!(!area.is_empty(), "auth2 returned no area id");

        Ok(AuthSession { token, area })
    }

    async fn fetch_playlist_create_url(&self, station_id: &str) -> anyhow::Result<Option<String>> {
        let url = format!(
            "{}/v3/station/stream/pc_html5/{}.xml",
            self.config.api_base, station_id
        );
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("stream list request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        anyhow::ensure!(
            response.status().is_success(),
            "stream list returned {}",
            response.status()
        );
        let xml = response.text().await.context("stream list unreadable")?;
        select_playlist_create_url(&xml)
    }
}

#[async_trait]
impl StreamResolver for RadikoResolver {
    async fn resolve_live(&self, station_id: &str) -> anyhow::Result<Option<ResolvedStream>> {
        let session = self.authorize().await?;
        logger().debug(
            "resolver.authorized",
            json!({ "station": station_id, "area": session.area }),
        );

        let Some(create_url) = self.fetch_playlist_create_url(station_id).await? else {
            return Ok(None);
        };
        let playlist_url = build_playlist_url(&create_url, station_id)?;
        Ok(Some(ResolvedStream {
            station_id: station_id.to_string(),
            playlist_url,
        }))
    }
}

fn header_value(response: &Response, name: &str) -> anyhow::Result<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("auth response missing {name} header"))
}

fn derive_partial_key(key: &[u8], offset: usize, length: usize) -> anyhow::Result<String> {
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= key.len())
        .with_context(|| format!("partial key window {offset}+{length} out of range"))?;
    Ok(STANDARD.encode(&key[offset..end]))
}

#[derive(Debug, Deserialize)]
struct StreamUrlList {
    #[serde(rename = "url", default)]
    urls: Vec<StreamUrl>,
}

#[derive(Debug, Deserialize)]
struct StreamUrl {
    #[serde(rename = "@areafree")]
    areafree: Option<String>,
    playlist_create_url: String,
}

/// Pick the in-area variant when the station lists one, otherwise take the
/// first entry. An empty list means no playable variant.
fn select_playlist_create_url(xml: &str) -> anyhow::Result<Option<String>> {
    let list: StreamUrlList = quick_xml::de::from_str(xml).context("invalid stream list xml")?;
    let in_area = list
        .urls
        .iter()
        .find(|entry| entry.areafree.as_deref() == Some("0"));
    Ok(in_area
        .or_else(|| list.urls.first())
        .map(|entry| entry.playlist_create_url.clone()))
}

fn build_playlist_url(create_url: &str, station_id: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(create_url).context("invalid playlist_create_url")?;
    url.query_pairs_mut()
        .append_pair("station_id", station_id)
        .append_pair("l", "15")
        .append_pair("lsid", Uuid::new_v4().simple().to_string().as_str())
        .append_pair("type", "b");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::{build_playlist_url, derive_partial_key, select_playlist_create_url};

    #[test]
    fn partial_key_encodes_requested_window() {
        let key = derive_partial_key(b"abcdefgh", 2, 4).unwrap();
        // base64("cdef")
        assert_eq!(key, "Y2RlZg==");
    }

    #[test]
    fn partial_key_rejects_out_of_range_window() {
        assert!(derive_partial_key(b"abc", 2, 4).is_err());
    }

    #[test]
    fn stream_list_prefers_in_area_variant() {
        let xml = r#"<urls>
            <url areafree="1" timefree="0">
                <playlist_create_url>https://cdn.example/areafree.m3u8</playlist_create_url>
            </url>
            <url areafree="0" timefree="0">
                <playlist_create_url>https://cdn.example/live.m3u8</playlist_create_url>
            </url>
        </urls>"#;
        let selected = select_playlist_create_url(xml).unwrap();
        assert_eq!(selected.as_deref(), Some("https://cdn.example/live.m3u8"));
    }

    #[test]
    fn stream_list_falls_back_to_first_entry() {
        let xml = r#"<urls>
            <url areafree="1">
                <playlist_create_url>https://cdn.example/only.m3u8</playlist_create_url>
            </url>
        </urls>"#;
        let selected = select_playlist_create_url(xml).unwrap();
        assert_eq!(selected.as_deref(), Some("https://cdn.example/only.m3u8"));
    }

    #[test]
    fn empty_stream_list_yields_none() {
        assert_eq!(select_playlist_create_url("<urls></urls>").unwrap(), None);
    }

    #[test]
    fn playlist_url_carries_station_and_session() {
        let url = build_playlist_url("https://cdn.example/so/playlist.m3u8", "FMT").unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs[0], ("station_id".into(), "FMT".into()));
        assert_eq!(pairs[1], ("l".into(), "15".into()));
        assert_eq!(pairs[2].0, "lsid");
        assert_eq!(pairs[2].1.len(), 32);
        assert_eq!(pairs[3], ("type".into(), "b".into()));
    }
}
