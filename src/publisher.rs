//! The publish capability the pipeline drives.
//!
//! The core never inspects how a publish happens; it consumes the
//! classified result. `HttpPublisher` is the API-call implementation:
//! it POSTs the post body to a configured endpoint, authenticates with
//! the identity's credential, and maps HTTP status codes onto the
//! failure taxonomy.

use crate::config::Config;
use crate::db::{IdentityForPublish, PostForPublish};
use crate::model::FailureKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::fmt;
use tracing::warn;

/// Classified result of one publish attempt. Failure is data here, not an
/// error that unwinds: the retry policy decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Posted {
        reference: Option<String>,
    },
    Rejected {
        kind: FailureKind,
        message: String,
    },
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, identity: &IdentityForPublish, post: &PostForPublish) -> PublishResult;
}

#[derive(Clone)]
pub struct HttpPublisher {
    http: Client,
    endpoint: Url,
}

impl fmt::Debug for HttpPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPublisher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"\\]+/status/\d+"#).expect("valid reference regex"));

impl HttpPublisher {
    pub fn new(endpoint: Url) -> Self {
        let http = Client::builder()
            .user_agent("tg-postbot/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self { http, endpoint }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let endpoint = Url::parse(&cfg.publisher.endpoint)
            .context("publisher.endpoint is not a valid URL")?;
        Ok(Self::new(endpoint))
    }

    pub fn build_request(
        &self,
        identity: &IdentityForPublish,
        post: &PostForPublish,
    ) -> Result<reqwest::Request> {
        let body = json!({
            "text": post.body,
            "media": post.media_refs,
        });
        self.http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", identity.credential))
            .json(&body)
            .build()
            .context("failed to build publish request")
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, identity: &IdentityForPublish, post: &PostForPublish) -> PublishResult {
        let request = match self.build_request(identity, post) {
            Ok(request) => request,
            Err(err) => {
                return PublishResult::Rejected {
                    kind: FailureKind::Unknown,
                    message: err.to_string(),
                }
            }
        };

        let res = match self.http.execute(request).await {
            Ok(res) => res,
            Err(err) => {
                return PublishResult::Rejected {
                    kind: FailureKind::Transient,
                    message: format!("transport error: {err}"),
                }
            }
        };

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if status.is_success() {
            PublishResult::Posted {
                reference: extract_reference(&body),
            }
        } else {
            let kind = classify_status(status, &body);
            warn!(%status, %kind, identity = identity.id, "publish endpoint rejected post");
            PublishResult::Rejected {
                kind,
                message: format!("publish endpoint returned {}: {}", status, truncate(&body, 200)),
            }
        }
    }
}

/// Map an HTTP rejection onto the failure taxonomy. Credential problems and
/// verification challenges must not be retried; rate limits and server
/// errors are worth another attempt.
pub fn classify_status(status: StatusCode, body: &str) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::AuthFailure,
        StatusCode::PRECONDITION_REQUIRED => FailureKind::ChallengeRequired,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => FailureKind::ContentRejected,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FailureKind::Transient,
        s if s.is_server_error() => FailureKind::Transient,
        _ if body.contains("challenge") => FailureKind::ChallengeRequired,
        _ => FailureKind::Unknown,
    }
}

/// Pull the published-post URL out of the endpoint response, if present.
/// Prefers an explicit `url`/`permalink` field, falling back to the first
/// status link found anywhere in the body.
pub fn extract_reference(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["url", "permalink"] {
            if let Some(url) = value.get(key).and_then(|v| v.as_str()) {
                if !url.is_empty() {
                    return Some(url.to_string());
                }
            }
        }
    }
    REFERENCE_RE.find(body).map(|m| m.as_str().to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
