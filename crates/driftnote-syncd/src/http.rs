//! HTTP client for the sync service's entity endpoints.
//!
//! Pushes go to `PUT /api/{kind}/{id}` (DELETE for removals), pulls to the
//! matching GET, reconciliation to `GET /api/entities?since=`. When an API
//! key is configured, requests carry a short-lived bearer token fetched
//! from the token endpoint and cached until it expires.

use async_trait::async_trait;
use driftnote_sync::device::DeviceId;
use driftnote_sync::entity::{EntityKind, Operation};
use driftnote_sync::remote::{
    CachedToken, PushAck, PushRequest, RemoteApi, RemoteEntity, RemoteError, Result,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// What the token endpoint answers.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    token: String,
    ttl_ms: u64,
}

/// Body of a 409 push response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    server_version: u64,
    /// The server's current entity; absent when it was deleted there.
    #[serde(default)]
    current: Option<RemoteEntity>,
}

/// [`RemoteApi`] implementation against the hosted sync service.
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    device_id: DeviceId,
    api_key: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl HttpRemoteApi {
    pub fn new(
        base_url: impl Into<String>,
        device_id: DeviceId,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            device_id,
            api_key,
            token: Mutex::new(None),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn entity_url(&self, kind: EntityKind, id: &str) -> String {
        format!("{}/api/{}/{}", self.base_url, kind, id)
    }

    /// A valid bearer token, fetching a fresh one when the cached token is
    /// missing or expired. `None` when running unauthenticated.
    async fn bearer(&self) -> Result<Option<String>> {
        let Some(api_key) = &self.api_key else {
            return Ok(None);
        };

        let mut cached = self.token.lock().await;
        let now_ms = crate::unix_now_ms();
        if let Some(token) = cached.as_ref() {
            if token.is_valid(now_ms) {
                return Ok(Some(token.value.clone()));
            }
        }

        debug!("fetching fresh access token");
        let response = self
            .client
            .post(format!("{}/api/auth/token", self.base_url))
            .header("x-api-key", api_key)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(RemoteError::Auth(format!("token endpoint answered {status}")));
        }
        if !status.is_success() {
            return Err(RemoteError::Transport(format!(
                "token endpoint answered {status}"
            )));
        }
        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let token = CachedToken::new(grant.token, now_ms, grant.ttl_ms);
        let value = token.value.clone();
        *cached = Some(token);
        Ok(Some(value))
    }

    async fn authorize(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        Ok(match self.bearer().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    /// Drop the cached token so the next request re-authenticates. The
    /// server may revoke tokens before their TTL runs out.
    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }

    async fn forget_token_on_auth_error<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(RemoteError::Auth(_))) {
            self.forget_token().await;
        }
        result
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn push(&self, request: &PushRequest) -> Result<PushAck> {
        let url = self.entity_url(request.kind, &request.id);
        let builder = match request.operation {
            Operation::Upsert => self.client.put(&url),
            Operation::Delete => self.client.delete(&url),
        };
        let builder = self.authorize(builder.json(request)).await?;
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let result = parse_push_response(request.kind, &request.id, status, &body);
        self.forget_token_on_auth_error(result).await
    }

    async fn pull(&self, kind: EntityKind, id: &str) -> Result<Option<RemoteEntity>> {
        let builder = self.authorize(self.client.get(self.entity_url(kind, id))).await?;
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let result = parse_pull_response(status, &body);
        self.forget_token_on_auth_error(result).await
    }

    async fn pull_all(&self, since: Option<u64>) -> Result<Vec<RemoteEntity>> {
        let mut url = format!("{}/api/entities", self.base_url);
        if let Some(since) = since {
            url.push_str(&format!("?since={since}"));
        }
        let builder = self.authorize(self.client.get(url)).await?;
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let result = parse_pull_all_response(status, &body);
        self.forget_token_on_auth_error(result).await
    }
}

/// Map a push response to an acknowledgment or the matching error.
fn parse_push_response(kind: EntityKind, id: &str, status: u16, body: &str) -> Result<PushAck> {
    match status {
        200 | 201 => serde_json::from_str(body)
            .map_err(|e| RemoteError::Transport(format!("undecodable ack body: {e}"))),
        409 => {
            let conflict: ConflictBody = serde_json::from_str(body)
                .map_err(|e| RemoteError::Transport(format!("undecodable conflict body: {e}")))?;
            Err(RemoteError::Conflict {
                kind,
                id: id.to_string(),
                server_version: conflict.server_version,
                current: conflict.current.map(Box::new),
            })
        }
        401 | 403 => Err(RemoteError::Auth(format!("push rejected with {status}"))),
        _ => Err(RemoteError::Transport(format!("push answered {status}"))),
    }
}

fn parse_pull_response(status: u16, body: &str) -> Result<Option<RemoteEntity>> {
    match status {
        200 => serde_json::from_str(body)
            .map(Some)
            .map_err(|e| RemoteError::Transport(format!("undecodable entity body: {e}"))),
        404 => Ok(None),
        401 | 403 => Err(RemoteError::Auth(format!("pull rejected with {status}"))),
        _ => Err(RemoteError::Transport(format!("pull answered {status}"))),
    }
}

fn parse_pull_all_response(status: u16, body: &str) -> Result<Vec<RemoteEntity>> {
    match status {
        200 => serde_json::from_str(body)
            .map_err(|e| RemoteError::Transport(format!("undecodable entity list: {e}"))),
        401 | 403 => Err(RemoteError::Auth(format!("pull rejected with {status}"))),
        _ => Err(RemoteError::Transport(format!("pull answered {status}"))),
    }
}
