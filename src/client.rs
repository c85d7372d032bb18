// Typed client for the Bridge SSO API (/api/v1/aws/sso)

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::config::ClientConfig;
use crate::error::{ErrorBody, ErrorCode};
use crate::models::{
    CompleteDeviceAuthRequest, ContextMapping, CreateSessionRequest, DeviceAuthSession,
    DeviceAuthStatus, KubeContext, RoleCredentials, SsoSession, StartDeviceAuthRequest,
    UpsertContextMappingRequest,
};

/// Errors seen by API consumers
#[derive(Error, Debug)]
pub enum ClientError {
    /// Network or transport failure
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response with a structured body
    #[error("{message} ({status})")]
    Api {
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },

    /// Unexpected response shape or unusable URL
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Structured discriminator of an API error
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Api { code, .. } => *code,
            _ => None,
        }
    }

    /// The backend asks for a fresh SSO login. Only the structured
    /// discriminator is consulted.
    pub fn is_login_required(&self) -> bool {
        self.code() == Some(ErrorCode::SsoLoginRequired)
    }

    /// Human readable message for display
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Operations of the Bridge SSO API.
///
/// The flows in [`crate::flows`] are written against this trait so they can be
/// driven by [`BridgeClient`] or by an in-process fake.
#[async_trait]
pub trait SsoApi: Send + Sync {
    async fn start_device_auth(&self, req: &StartDeviceAuthRequest)
        -> ClientResult<DeviceAuthSession>;
    async fn complete_device_auth(&self, req: &CompleteDeviceAuthRequest)
        -> ClientResult<SsoSession>;
    async fn device_status(&self, start_url: &str) -> ClientResult<DeviceAuthStatus>;

    async fn list_sessions(&self) -> ClientResult<Vec<SsoSession>>;
    async fn get_session(&self, name: &str) -> ClientResult<SsoSession>;
    async fn create_session(&self, req: &CreateSessionRequest) -> ClientResult<SsoSession>;
    async fn delete_session(&self, name: &str) -> ClientResult<()>;
    async fn sync_session(&self, name: &str) -> ClientResult<SsoSession>;

    async fn list_contexts(&self) -> ClientResult<Vec<KubeContext>>;
    async fn list_mappings(&self) -> ClientResult<Vec<ContextMapping>>;
    async fn upsert_mapping(&self, req: &UpsertContextMappingRequest)
        -> ClientResult<ContextMapping>;
    async fn delete_mapping(&self, context_name: &str) -> ClientResult<()>;
    async fn mapping_credentials(&self, context_name: &str) -> ClientResult<RoleCredentials>;
}

/// HTTP implementation of [`SsoApi`]
pub struct BridgeClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl BridgeClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.api_url)
            .with_context(|| format!("Invalid Bridge API URL: {}", config.api_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Bridge API URL cannot be used as a base: {}", config.api_url);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    /// Build `<base>/api/v1/aws/sso/<segments...>` with each segment percent-encoded
    fn url(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Decode(format!("bad base URL {}", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v1", "aws", "sso"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ClientResult<T> {
        let response = self.request(builder).send().await?;
        let response = check_status(response).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ClientResult<()> {
        let response = self.request(builder).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Turn a non-2xx response into [`ClientError::Api`], reading the
/// `{"message", "error"}` body when present
async fn check_status(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let err = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => ClientError::Api {
            status: status.as_u16(),
            code: body.error,
            message: body.message,
        },
        Err(_) => ClientError::Api {
            status: status.as_u16(),
            code: None,
            message: if text.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            } else {
                text
            },
        },
    };

    if status == StatusCode::UNAUTHORIZED && err.is_login_required() {
        tracing::debug!("Bridge API requests SSO login: {}", err);
    } else {
        tracing::debug!("Bridge API error: {}", err);
    }
    Err(err)
}

#[async_trait]
impl SsoApi for BridgeClient {
    async fn start_device_auth(
        &self,
        req: &StartDeviceAuthRequest,
    ) -> ClientResult<DeviceAuthSession> {
        let url = self.url(&["device", "start"])?;
        self.send_json(self.client.post(url).json(req)).await
    }

    async fn complete_device_auth(
        &self,
        req: &CompleteDeviceAuthRequest,
    ) -> ClientResult<SsoSession> {
        let url = self.url(&["device", "complete"])?;
        self.send_json(self.client.post(url).json(req)).await
    }

    async fn device_status(&self, start_url: &str) -> ClientResult<DeviceAuthStatus> {
        let url = self.url(&["device", "status"])?;
        self.send_json(self.client.get(url).query(&[("startUrl", start_url)]))
            .await
    }

    async fn list_sessions(&self) -> ClientResult<Vec<SsoSession>> {
        let url = self.url(&["bridge", "sessions"])?;
        self.send_json(self.client.get(url)).await
    }

    async fn get_session(&self, name: &str) -> ClientResult<SsoSession> {
        let url = self.url(&["bridge", "sessions", name])?;
        self.send_json(self.client.get(url)).await
    }

    async fn create_session(&self, req: &CreateSessionRequest) -> ClientResult<SsoSession> {
        let url = self.url(&["bridge", "sessions"])?;
        self.send_json(self.client.post(url).json(req)).await
    }

    async fn delete_session(&self, name: &str) -> ClientResult<()> {
        let url = self.url(&["bridge", "sessions", name])?;
        self.send_empty(self.client.delete(url)).await
    }

    async fn sync_session(&self, name: &str) -> ClientResult<SsoSession> {
        let url = self.url(&["bridge", "sessions", name, "sync"])?;
        self.send_json(self.client.post(url)).await
    }

    async fn list_contexts(&self) -> ClientResult<Vec<KubeContext>> {
        let url = self.url(&["bridge", "contexts"])?;
        self.send_json(self.client.get(url)).await
    }

    async fn list_mappings(&self) -> ClientResult<Vec<ContextMapping>> {
        let url = self.url(&["bridge", "context-mappings"])?;
        self.send_json(self.client.get(url)).await
    }

    async fn upsert_mapping(
        &self,
        req: &UpsertContextMappingRequest,
    ) -> ClientResult<ContextMapping> {
        let url = self.url(&["bridge", "context-mapping"])?;
        self.send_json(self.client.post(url).json(req)).await
    }

    async fn delete_mapping(&self, context_name: &str) -> ClientResult<()> {
        let url = self.url(&["bridge", "context-mapping", context_name])?;
        self.send_empty(self.client.delete(url)).await
    }

    async fn mapping_credentials(&self, context_name: &str) -> ClientResult<RoleCredentials> {
        let url = self.url(&["bridge", "context-mapping", context_name, "credentials"])?;
        self.send_json(self.client.get(url)).await
    }
}
