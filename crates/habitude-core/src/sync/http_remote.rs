//! HTTP adapter for the remote API.
//!
//! - `POST {base}/v1/actions` applies one action. The action id travels as
//!   the `Idempotency-Key` header.
//! - `GET {base}/v1/{collection}/{id}` fetches the server copy of an entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::error::{ConfigError, Result};
use crate::session::SessionContext;
use crate::storage::RemoteSettings;
use crate::sync::remote::{RemoteApi, RemoteRequest, RemoteResponse, ServerEntity};
use crate::sync::types::{EntityType, RemoteError};

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    error: Option<String>,
    server_updated_at: Option<DateTime<Utc>>,
}

/// [`RemoteApi`] over HTTPS with bearer authentication.
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRemoteApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("habitude/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "remote".into(),
                message: e.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    /// Build from the `[remote]` config section.
    pub fn from_settings(settings: &RemoteSettings) -> Result<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "remote.base_url".into(),
                message: "not configured".into(),
            })?;
        Self::new(base_url, Duration::from_secs(settings.request_timeout_secs))
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Permanent {
                status: 0,
                message: format!("invalid endpoint {path}: {e}"),
            })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder, ctx: &SessionContext) -> reqwest::RequestBuilder {
        let builder = builder.header("X-Device-Id", &ctx.device_id);
        match &ctx.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn execute(
        &self,
        ctx: &SessionContext,
        request: &RemoteRequest,
    ) -> std::result::Result<RemoteResponse, RemoteError> {
        let url = self.endpoint("v1/actions")?;
        let builder = self
            .client
            .post(url)
            .header("Idempotency-Key", &request.action_id)
            .json(request);
        let response = self
            .authorize(builder, ctx)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(RemoteResponse::default());
        }
        response
            .json::<RemoteResponse>()
            .await
            .map_err(|e| RemoteError::Permanent {
                status: status.as_u16(),
                message: format!("malformed response: {e}"),
            })
    }

    async fn fetch(
        &self,
        ctx: &SessionContext,
        entity_type: EntityType,
        entity_id: &str,
    ) -> std::result::Result<Option<ServerEntity>, RemoteError> {
        let mut url = self.endpoint(&format!("v1/{}/", entity_type.collection()))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Permanent {
                status: 0,
                message: "base url cannot carry a path".into(),
            })?
            .pop_if_empty()
            .push(entity_id);

        let response = self
            .authorize(self.client.get(url), ctx)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }
        response
            .json::<ServerEntity>()
            .await
            .map(Some)
            .map_err(|e| RemoteError::Permanent {
                status: status.as_u16(),
                message: format!("malformed entity: {e}"),
            })
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

fn classify(status: StatusCode, body: &str) -> RemoteError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parse_api_error(status, body, &parsed);
    match RemoteError::from_status(status.as_u16(), message) {
        RemoteError::Conflict { message, .. } => RemoteError::Conflict {
            message,
            server_updated_at: parsed.server_updated_at,
        },
        other => other,
    }
}

fn parse_api_error(status: StatusCode, body: &str, parsed: &ApiErrorBody) -> String {
    if let Some(message) = parsed.message.as_ref().or(parsed.error.as_ref()) {
        return format!("{} ({})", message.trim(), status.as_u16());
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "remote.base_url".into(),
        message,
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("must not be empty".into()).into());
    }
    // Url::join drops the last segment unless the base ends with '/'.
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> SessionContext {
        SessionContext::new("user-1", "device-1")
            .unwrap()
            .with_access_token("token-1")
    }

    fn request() -> RemoteRequest {
        RemoteRequest {
            action_id: "action-1".into(),
            operation: "COMPLETE_TASK".into(),
            entity_type: EntityType::Task,
            entity_id: "t1".into(),
            fields: json!({"completed_at": "2026-02-01T10:00:00Z"}),
            client_updated_at: Utc::now(),
        }
    }

    fn api(server: &mockito::Server) -> HttpRemoteApi {
        HttpRemoteApi::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn base_url_is_normalized() {
        let url = normalize_base_url("https://api.example.com/app").unwrap();
        assert_eq!(url.join("v1/actions").unwrap().as_str(), "https://api.example.com/app/v1/actions");
        assert!(normalize_base_url("ftp://example.com").is_err());
        assert!(normalize_base_url("  ").is_err());
    }

    #[tokio::test]
    async fn execute_sends_idempotency_key_and_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/actions")
            .match_header("idempotency-key", "action-1")
            .match_header("authorization", "Bearer token-1")
            .match_header("x-device-id", "device-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "entity": {
                        "id": "t1",
                        "entity_type": "TASK",
                        "fields": {"title": "Write report", "completed": true},
                        "server_updated_at": "2026-02-01T10:00:01Z"
                    },
                    "rewards": {"xp": 25, "streak": 3, "milestone": false}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let response = api(&server).execute(&ctx(), &request()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(response.entity.unwrap().id, "t1");
        assert_eq!(response.rewards.unwrap().xp, 25);
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let cases = [
            (401, "auth"),
            (409, "conflict"),
            (422, "permanent"),
            (503, "transient"),
            (429, "transient"),
        ];
        for (status, expected) in cases {
            let mut server = mockito::Server::new_async().await;
            let _mock = server
                .mock("POST", "/v1/actions")
                .with_status(status)
                .with_body(r#"{"message":"nope","server_updated_at":"2026-02-01T10:00:00Z"}"#)
                .create_async()
                .await;

            let err = api(&server).execute(&ctx(), &request()).await.unwrap_err();
            assert_eq!(err.kind().as_str(), expected, "status {status}");
            if let RemoteError::Conflict { server_updated_at, .. } = err {
                assert!(server_updated_at.is_some());
            }
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let api = HttpRemoteApi::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = api.execute(&ctx(), &request()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
    }

    #[tokio::test]
    async fn fetch_returns_none_when_gone() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/tasks/t1")
            .with_status(404)
            .create_async()
            .await;

        let fetched = api(&server).fetch(&ctx(), EntityType::Task, "t1").await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn fetch_parses_entity() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/habits/h1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "id": "h1",
                    "entity_type": "HABIT",
                    "fields": {"name": "Stretch", "streak": 4},
                    "server_updated_at": "2026-02-01T10:00:01Z"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let fetched = api(&server)
            .fetch(&ctx(), EntityType::Habit, "h1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.fields["streak"], 4);
    }
}
