use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};

use crate::auth::TokenManager;

use super::types::BoxApiError;

const API_BASE: &str = "https://api.box.com/2.0";
const UPLOAD_BASE: &str = "https://upload.box.com/api/2.0";

/// Rate-limited requests are resent at most this many times.
const RATE_LIMIT_RETRIES: u32 = 5;
const DEFAULT_RETRY_AFTER_SECS: u64 = 2;

/// Thin Box REST client: base URLs, bearer auth and 429 handling.
/// Endpoint wrappers live next to it in `files`, `folders` and `events`.
pub struct BoxClient {
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
    api_base: String,
    upload_base: String,
}

impl BoxClient {
    pub fn new(tokens: Arc<TokenManager>) -> Result<Self> {
        Self::with_bases(tokens, API_BASE, UPLOAD_BASE)
    }

    /// Client that sends API and upload requests to one local server.
    #[cfg(test)]
    pub fn with_base_url(tokens: Arc<TokenManager>, base: &str) -> Result<Self> {
        Self::with_bases(tokens, base, base)
    }

    fn with_bases(tokens: Arc<TokenManager>, api_base: &str, upload_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            tokens,
            api_base: api_base.to_string(),
            upload_base: upload_base.to_string(),
        })
    }

    pub fn api_request(&self, method: Method, path: &str) -> BoxRequest<'_> {
        self.request(method, &self.api_base, path)
    }

    /// Requests that carry file content go to upload.box.com.
    pub fn upload_request(&self, method: Method, path: &str) -> BoxRequest<'_> {
        self.request(method, &self.upload_base, path)
    }

    fn request(&self, method: Method, base: &str, path: &str) -> BoxRequest<'_> {
        BoxRequest {
            client: self,
            builder: self.http.request(method, format!("{base}{path}")),
        }
    }
}

pub struct BoxRequest<'a> {
    client: &'a BoxClient,
    builder: RequestBuilder,
}

impl BoxRequest<'_> {
    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.builder = self.builder.query(params);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.builder = self.builder.header(key, value);
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.builder = self.builder.json(body);
        self
    }

    pub fn body(mut self, body: reqwest::Body) -> Self {
        self.builder = self.builder.body(body);
        self
    }

    pub fn multipart(mut self, form: reqwest::multipart::Form) -> Self {
        self.builder = self.builder.multipart(form);
        self
    }

    /// Send with a fresh bearer token.
    ///
    /// 2xx and 409 are returned as-is; the caller decides what a conflict
    /// means for its endpoint. Any other status becomes a `BoxApiError`.
    pub async fn send(self) -> Result<Response> {
        let client = self.client;
        let mut pending = self.builder;
        let mut rate_limited = 0;

        loop {
            // `None` for streamed bodies, which cannot be resent.
            let spare = pending.try_clone();
            let token = client.tokens.get_access_token().await?;
            let resp = pending
                .bearer_auth(&token)
                .send()
                .await
                .context("HTTP request failed")?;

            let status = resp.status();
            if status.is_success() || status == StatusCode::CONFLICT {
                return Ok(resp);
            }
            if status != StatusCode::TOO_MANY_REQUESTS {
                return Err(api_error(status, resp).await.into());
            }

            rate_limited += 1;
            if rate_limited > RATE_LIMIT_RETRIES {
                anyhow::bail!("Rate limited, gave up after {RATE_LIMIT_RETRIES} retries");
            }
            let wait = retry_after(&resp) + jitter();
            tracing::warn!(attempt = rate_limited, "rate limited, waiting {wait:?}");
            tokio::time::sleep(wait).await;

            pending = spare.context("Rate limited, cannot resend a streamed body")?;
        }
    }
}

async fn api_error(status: StatusCode, resp: Response) -> BoxApiError {
    let body = resp.text().await.unwrap_or_default();
    let mut err = serde_json::from_str::<BoxApiError>(&body)
        .unwrap_or_else(|_| BoxApiError::from_status(status.as_u16(), body));
    err.status.get_or_insert(status.as_u16());
    err
}

fn retry_after(resp: &Response) -> Duration {
    let secs = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(secs)
}

fn jitter() -> Duration {
    Duration::from_millis(rand::random_range(0..1000))
}
