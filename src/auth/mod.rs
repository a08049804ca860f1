mod token_store;

use token_store::{TokenData, TokenFile};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::config::AuthConfig;

const TOKEN_URL: &str = "https://api.box.com/oauth2/token";
const REFRESH_MARGIN_SECS: i64 = 60;

/// Supplies bearer tokens to the Box client.
///
/// Either a fixed developer token, or a refreshable OAuth token pair kept in
/// a token file that is rewritten on every refresh.
pub struct TokenManager {
    source: TokenSource,
}

enum TokenSource {
    Static(String),
    Refreshing(RefreshingTokens),
}

struct RefreshingTokens {
    client_id: String,
    client_secret: String,
    file: TokenFile,
    tokens: Mutex<TokenData>,
    http_client: reqwest::Client,
}

impl TokenManager {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        if let Some(token) = &config.developer_token {
            tracing::warn!("using developer token; it expires after one hour");
            return Ok(Self {
                source: TokenSource::Static(token.clone()),
            });
        }

        let file = TokenFile::locate(config.token_path.as_deref())?;
        let tokens = file.read().with_context(|| {
            format!(
                "No usable Box tokens. Write {{access_token, refresh_token, expires_at}} to {}",
                file.path().display()
            )
        })?;
        tracing::info!(path = %file.path().display(), "loaded existing tokens");

        Ok(Self {
            source: TokenSource::Refreshing(RefreshingTokens {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                file,
                tokens: Mutex::new(tokens),
                http_client: reqwest::Client::new(),
            }),
        })
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String> {
        match &self.source {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Refreshing(r) => r.get_access_token().await,
        }
    }
}

impl RefreshingTokens {
    async fn get_access_token(&self) -> Result<String> {
        let mut tokens = self.tokens.lock().await;

        if tokens.expires_within(chrono::Duration::seconds(REFRESH_MARGIN_SECS)) {
            tracing::debug!("access token expiring, refreshing");
            let refreshed = self.refresh(&tokens.refresh_token).await?;
            self.file.write(&refreshed)?;
            *tokens = refreshed;
            tracing::debug!("token refreshed");
        }

        Ok(tokens.access_token.clone())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenData> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: u64,
        }

        let resp = self
            .http_client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("Failed to contact Box token endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Token refresh failed ({status}): {body}");
        }

        let tr: TokenResponse = resp
            .json()
            .await
            .context("Failed to parse token response")?;

        Ok(TokenData {
            access_token: tr.access_token,
            refresh_token: tr.refresh_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(tr.expires_in as i64),
        })
    }
}
