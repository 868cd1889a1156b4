//! Platform integration point.
//!
//! [`PlatformConnector`] establishes a per-tenant [`PlatformSession`]; the
//! session fetches channel history pages. Sessions never touch global state:
//! each one is owned by the session manager's registry and handed to
//! collector tasks explicitly.
//!
//! [`HttpPlatformConnector`] talks to the protocol gateway over HTTP:
//!
//! | call | request |
//! |---|---|
//! | connect | `POST /v1/sessions` `{tenant_id, credential}` → `{session_token}` |
//! | history | `GET /v1/channels/{id}/history?after=&limit=` → `{events, has_more}` |
//! | disconnect | `DELETE /v1/sessions/{token}` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chanpulse_core::{ChannelId, PlatformError, TenantId, WireEvent};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::Credential;

/// Flood-wait applied when the gateway throttles without saying for how long.
pub const DEFAULT_FLOOD_WAIT: Duration = Duration::from_secs(30);

/// One page of channel history, ascending by event id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub events: Vec<WireEvent>,
    /// Whether the platform holds events past this page.
    #[serde(default)]
    pub has_more: bool,
}

#[async_trait]
pub trait PlatformSession: Send + Sync {
    /// Fetch up to `limit` events with id greater than `after`.
    async fn fetch_history(
        &self,
        channel: ChannelId,
        after: i64,
        limit: u32,
    ) -> Result<HistoryPage, PlatformError>;

    /// Tear the session down. Best effort.
    async fn disconnect(&self);
}

#[async_trait]
pub trait PlatformConnector: Send + Sync {
    async fn connect(
        &self,
        tenant: &TenantId,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformSession>, PlatformError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP gateway client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpPlatformConnector {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpPlatformConnector {
    /// # Errors
    ///
    /// Returns [`PlatformError::Protocol`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, PlatformError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PlatformError::Protocol(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        })
    }
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    tenant_id: &'a str,
    credential: &'a str,
}

#[derive(Deserialize)]
struct ConnectResponse {
    session_token: String,
}

#[async_trait]
impl PlatformConnector for HttpPlatformConnector {
    async fn connect(
        &self,
        tenant: &TenantId,
        credential: &Credential,
    ) -> Result<Arc<dyn PlatformSession>, PlatformError> {
        let response = self
            .client
            .post(format!("{}/v1/sessions", self.base_url))
            .json(&ConnectRequest {
                tenant_id: tenant.as_str(),
                credential: credential.expose(),
            })
            .send()
            .await
            .map_err(|e| map_transport(&e, self.request_timeout))?;
        let response = check_status(response).await?;
        let body: ConnectResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Protocol(format!("connect response: {e}")))?;

        Ok(Arc::new(HttpPlatformSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: body.session_token,
            request_timeout: self.request_timeout,
        }))
    }
}

struct HttpPlatformSession {
    client: reqwest::Client,
    base_url: String,
    token: String,
    request_timeout: Duration,
}

#[async_trait]
impl PlatformSession for HttpPlatformSession {
    async fn fetch_history(
        &self,
        channel: ChannelId,
        after: i64,
        limit: u32,
    ) -> Result<HistoryPage, PlatformError> {
        let response = self
            .client
            .get(format!("{}/v1/channels/{channel}/history", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("after", after.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(|e| map_transport(&e, self.request_timeout))?;
        let response = check_status(response).await?;
        response
            .json::<HistoryPage>()
            .await
            .map_err(|e| PlatformError::Protocol(format!("history response: {e}")))
    }

    async fn disconnect(&self) {
        let result = self
            .client
            .delete(format!("{}/v1/sessions/{}", self.base_url, self.token))
            .bearer_auth(&self.token)
            .send()
            .await;
        if let Err(e) = result {
            debug!(error = %e, "session teardown request failed");
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(classify_response(status.as_u16(), retry_after, &body))
}

/// Map a non-success gateway response onto the platform error taxonomy.
#[must_use]
pub fn classify_response(status: u16, retry_after: Option<Duration>, body: &str) -> PlatformError {
    if let Some(wait) = parse_flood_wait(body) {
        return PlatformError::FloodWait { retry_after: wait };
    }
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
    };
    match status {
        420 | 429 => PlatformError::FloodWait {
            retry_after: retry_after.unwrap_or(DEFAULT_FLOOD_WAIT),
        },
        401 | 403 => PlatformError::Auth(message),
        408 | 500..=599 => PlatformError::Network(message),
        _ => PlatformError::Protocol(message),
    }
}

/// Extract `N` from a `FLOOD_WAIT_N` error string.
fn parse_flood_wait(body: &str) -> Option<Duration> {
    let idx = body.find("FLOOD_WAIT_")?;
    let digits: String = body[idx + "FLOOD_WAIT_".len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

fn map_transport(err: &reqwest::Error, timeout: Duration) -> PlatformError {
    if err.is_timeout() {
        PlatformError::Timeout(timeout)
    } else if err.is_decode() {
        PlatformError::Protocol(err.to_string())
    } else {
        PlatformError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_wait_body_wins_over_status() {
        let err = classify_response(400, None, r#"{"error":"FLOOD_WAIT_37"}"#);
        assert_eq!(
            err,
            PlatformError::FloodWait {
                retry_after: Duration::from_secs(37)
            }
        );
    }

    #[test]
    fn throttle_statuses_use_retry_after_or_default() {
        assert_eq!(
            classify_response(429, Some(Duration::from_secs(4)), ""),
            PlatformError::FloodWait {
                retry_after: Duration::from_secs(4)
            }
        );
        assert_eq!(
            classify_response(420, None, ""),
            PlatformError::FloodWait {
                retry_after: DEFAULT_FLOOD_WAIT
            }
        );
    }

    #[test]
    fn statuses_classify() {
        assert!(matches!(classify_response(401, None, ""), PlatformError::Auth(_)));
        assert!(matches!(classify_response(503, None, ""), PlatformError::Network(_)));
        assert!(matches!(classify_response(408, None, ""), PlatformError::Network(_)));
        assert!(matches!(classify_response(404, None, "x"), PlatformError::Protocol(_)));
    }

    #[test]
    fn flood_wait_parser_ignores_garbage() {
        assert_eq!(parse_flood_wait("FLOOD_WAIT_"), None);
        assert_eq!(parse_flood_wait("nothing here"), None);
        assert_eq!(
            parse_flood_wait("A wait of FLOOD_WAIT_5 seconds"),
            Some(Duration::from_secs(5))
        );
    }
}
