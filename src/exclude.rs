use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

use crate::config::UploadConfig;

/// Decides which local entries are never uploaded.
///
/// Patterns match case-insensitively from the start of the entry name.
/// The remote pattern list is fetched on every check so edits take
/// effect immediately; when it cannot be fetched, only the static
/// patterns apply.
pub struct ExclusionFilter {
    patterns: Vec<Regex>,
    remote_url: Option<String>,
    http: reqwest::Client,
}

impl ExclusionFilter {
    pub fn new(config: &UploadConfig, http: reqwest::Client) -> Result<Self> {
        let patterns = config
            .exclude_pattern
            .iter()
            .map(|p| compile(p).with_context(|| format!("Invalid exclude pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            remote_url: config.exclude_url.clone(),
            http,
        })
    }

    pub async fn should_exclude(&self, name: &str) -> bool {
        if self.patterns.iter().any(|re| re.is_match(name)) {
            return true;
        }

        let Some(url) = self.remote_url.as_deref() else {
            return false;
        };

        let remote = match self.fetch_remote(url).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url, error = %format!("{e:#}"), "remote exclude list unavailable, using static patterns only");
                return false;
            }
        };

        for (label, pattern) in &remote {
            match compile(pattern) {
                Ok(re) if re.is_match(name) => {
                    tracing::debug!(name, rule = %label, "matched remote exclude rule");
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(rule = %label, pattern = %pattern, error = %e, "skipping invalid remote exclude pattern");
                }
            }
        }

        false
    }

    async fn fetch_remote(&self, url: &str) -> Result<HashMap<String, String>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to fetch exclude list")?
            .error_for_status()
            .context("Exclude list request failed")?;

        resp.json()
            .await
            .context("Failed to parse exclude list")
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{pattern})"))
        .case_insensitive(true)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str], url: Option<String>) -> ExclusionFilter {
        let cfg = UploadConfig {
            upload_to: "/incoming".into(),
            exclude_pattern: patterns.iter().map(|p| p.to_string()).collect(),
            exclude_url: url,
        };
        ExclusionFilter::new(&cfg, reqwest::Client::new()).unwrap()
    }

    #[tokio::test]
    async fn static_patterns_are_case_insensitive() {
        let f = filter(&[r".*\.part$", r"thumbs\.db"], None);
        assert!(f.should_exclude("movie.mkv.PART").await);
        assert!(f.should_exclude("Thumbs.db").await);
        assert!(!f.should_exclude("movie.mkv").await);
    }

    #[tokio::test]
    async fn patterns_are_anchored_at_start() {
        let f = filter(&["tmp"], None);
        assert!(f.should_exclude("tmpfile").await);
        assert!(!f.should_exclude("a-tmpfile").await);
    }

    #[test]
    fn invalid_static_pattern_is_rejected() {
        let cfg = UploadConfig {
            upload_to: "/incoming".into(),
            exclude_pattern: vec!["(unclosed".into()],
            exclude_url: None,
        };
        assert!(ExclusionFilter::new(&cfg, reqwest::Client::new()).is_err());
    }

    #[tokio::test]
    async fn remote_patterns_are_fetched() {
        use axum::{Json, Router, routing::get};

        let app = Router::new().route(
            "/exclude.json",
            get(|| async {
                Json(HashMap::from([
                    ("samples".to_string(), r".*\.sample$".to_string()),
                    ("broken".to_string(), "(".to_string()),
                ]))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let f = filter(&[], Some(format!("http://{addr}/exclude.json")));
        assert!(f.should_exclude("clip.SAMPLE").await);
        assert!(!f.should_exclude("clip.mkv").await);
    }

    #[tokio::test]
    async fn unreachable_remote_degrades_to_static() {
        // Port 9 (discard) on loopback is not served in test environments.
        let f = filter(&[r".*\.part$"], Some("http://127.0.0.1:9/exclude.json".into()));
        assert!(f.should_exclude("x.part").await);
        assert!(!f.should_exclude("x.mkv").await);
    }
}
