use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::{ObjectStore, Uri};

const API_BASE: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// Object I/O timeout; matches the reference client's per-request budget.
const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Thin client for the remote object store's JSON API, backing `gs://`.
///
/// Credentials come from `GCS_ACCESS_TOKEN` when set, otherwise from the
/// instance metadata server, cached until shortly before expiry.
pub struct GcsStore {
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectEntry {
    name: String,
}

impl GcsStore {
    pub fn new() -> GcsStore {
        GcsStore {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("http client"),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        if let Ok(token) = std::env::var("GCS_ACCESS_TOKEN") {
            return Ok(token);
        }
        {
            let cached = self.token.lock().unwrap();
            if let Some(tok) = cached.as_ref() {
                if tok.expires_at > Instant::now() {
                    return Ok(tok.value.clone());
                }
            }
        }
        let resp: TokenResponse = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("fetch access token from metadata server")?
            .error_for_status()?
            .json()
            .await?;
        let mut cached = self.token.lock().unwrap();
        *cached = Some(CachedToken {
            value: resp.access_token.clone(),
            // renew a minute early
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in.saturating_sub(60)),
        });
        Ok(resp.access_token)
    }

    async fn authed(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        let resp = req.bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("object store request failed: {status}: {body}"));
        }
        Ok(resp)
    }
}

impl Default for GcsStore {
    fn default() -> Self {
        Self::new()
    }
}

// Object names appear as single path segments in the JSON API, so every
// byte outside the unreserved set must be escaped, including '/'.
fn encode_object(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn read(&self, uri: &Uri) -> Result<Vec<u8>> {
        let (bucket, object) = uri.split_bucket()?;
        let url = format!("{API_BASE}/b/{bucket}/o/{}?alt=media", encode_object(object));
        let resp = self.authed(self.http.get(url)).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        let (bucket, object) = uri.split_bucket()?;
        let url = format!("{UPLOAD_BASE}/b/{bucket}/o");
        self.authed(
            self.http
                .post(url)
                .query(&[("uploadType", "media"), ("name", object)])
                .body(data.to_vec()),
        )
        .await?;
        Ok(())
    }

    async fn list(&self, prefix: &Uri) -> Result<Vec<String>> {
        let (bucket, object_prefix) = prefix.split_bucket()?;
        let url = format!("{API_BASE}/b/{bucket}/o");
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.http.get(url.as_str()).query(&[("prefix", object_prefix)]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let page: ListResponse = self.authed(req).await?.json().await?;
            names.extend(page.items.into_iter().map(|o| format!("{bucket}/{}", o.name)));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(names)
    }

    async fn copy(&self, src: &Uri, dst: &Uri) -> Result<()> {
        let (src_bucket, src_object) = src.split_bucket()?;
        let (dst_bucket, dst_object) = dst.split_bucket()?;
        let url = format!(
            "{API_BASE}/b/{src_bucket}/o/{}/copyTo/b/{dst_bucket}/o/{}",
            encode_object(src_object),
            encode_object(dst_object),
        );
        self.authed(self.http.post(url)).await?;
        Ok(())
    }
}
