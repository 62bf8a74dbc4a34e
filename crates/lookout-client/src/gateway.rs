use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;

use lookout_core::agent::{AgentRecord, RosterResponse};

use crate::config::ClientConfig;
use crate::error::GatewayError;

/// Raw byte stream of a session's server-push channel.
pub type ByteStream = BoxStream<'static, Result<bytes::Bytes, GatewayError>>;

/// The gateway surface the connection manager depends on. `HttpGateway` is
/// the production implementation; tests substitute scripted ones.
pub trait Gateway: Clone + Send + Sync + 'static {
    /// Allocate a session token for an agent (`POST /manage/connect`).
    fn connect_agent(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;

    /// Open the streaming channel addressed by a token
    /// (`GET /manage/forwarder/{id}`).
    fn open_stream(
        &self,
        forwarder_id: &str,
    ) -> impl Future<Output = Result<ByteStream, GatewayError>> + Send;

    /// Release a token (`DELETE /manage/forwarder/{id}`). An already-released
    /// token reports `NotFound`.
    fn release_forwarder(
        &self,
        forwarder_id: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Fetch the agent roster snapshot (`GET /manage/data`).
    fn fetch_roster(&self) -> impl Future<Output = Result<Vec<AgentRecord>, GatewayError>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    forwarder_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AuthStatusResponse {
    authenticated: bool,
}

/// Error payload shape used by the gateway (`message` or `detail` key).
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// HTTP gateway client. Credentials ride the cookie jar, so every call
/// carries the session cookie the way the panel's fetch layer always sent
/// `credentials: include`.
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpGateway {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lookout-client/", env!("CARGO_PKG_VERSION")))
            .cookie_store(true)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, GatewayError> {
        Self::new(&config.gateway_url, config.request_timeout())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Extract the error taxonomy from a non-success response, pulling the
    /// message out of the gateway's `message`/`detail` JSON keys when present.
    async fn error_for(resp: reqwest::Response) -> GatewayError {
        let status = resp.status();
        let fallback = status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.message.or(body.detail).unwrap_or(fallback),
            Err(_) => fallback,
        };
        GatewayError::from_status(status.as_u16(), message)
    }

    async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(Self::error_for(resp).await)
        }
    }

    /// Sign in with the panel password (`POST /auth/login`). Returns whether
    /// the gateway accepted the credentials; the session cookie lands in the
    /// jar as a side effect.
    pub async fn login(&self, password: &str) -> Result<bool, GatewayError> {
        let resp = self
            .client
            .post(self.endpoint("/auth/login"))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({ "password": password }))
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        let body: AuthStatusResponse = resp.json().await?;
        Ok(body.authenticated)
    }

    /// Discard the session (`POST /auth/logout`).
    pub async fn logout(&self) -> Result<(), GatewayError> {
        let resp = self
            .client
            .post(self.endpoint("/auth/logout"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    /// Probe whether the current session cookie is still accepted
    /// (`GET /auth/check`).
    pub async fn check_auth(&self) -> Result<bool, GatewayError> {
        let resp = self
            .client
            .get(self.endpoint("/auth/check"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        match Self::expect_success(resp).await {
            Ok(resp) => {
                let body: AuthStatusResponse = resp.json().await?;
                Ok(body.authenticated)
            },
            Err(e) if e.is_unauthenticated() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove an agent record from the roster (`DELETE /manage/data`).
    /// Collaborator surface, not part of the session core.
    pub async fn delete_agent(&self, name: &str) -> Result<String, GatewayError> {
        let resp = self
            .client
            .delete(self.endpoint("/manage/data"))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        let body: MessageResponse = resp.json().await?;
        Ok(body.message)
    }
}

impl Gateway for HttpGateway {
    async fn connect_agent(&self, name: &str) -> Result<String, GatewayError> {
        let resp = self
            .client
            .post(self.endpoint("/manage/connect"))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        let body: ConnectResponse = resp.json().await?;
        Ok(body.forwarder_id)
    }

    async fn open_stream(&self, forwarder_id: &str) -> Result<ByteStream, GatewayError> {
        // No timeout here: the channel is long-lived by design.
        let resp = self
            .client
            .get(self.endpoint(&format!("/manage/forwarder/{forwarder_id}")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from))
            .boxed())
    }

    async fn release_forwarder(&self, forwarder_id: &str) -> Result<(), GatewayError> {
        let resp = self
            .client
            .delete(self.endpoint(&format!("/manage/forwarder/{forwarder_id}")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::expect_success(resp).await?;
        Ok(())
    }

    async fn fetch_roster(&self) -> Result<Vec<AgentRecord>, GatewayError> {
        let resp = self
            .client
            .get(self.endpoint("/manage/data"))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let resp = Self::expect_success(resp).await?;
        let body: RosterResponse = resp.json().await?;
        Ok(body.data)
    }
}
