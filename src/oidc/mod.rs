// AWS SSO integration
// Device authorization, token grants and portal account listing

mod client;

pub use client::{ClientRegistration, SsoOidcClient, TokenGrant};

use thiserror::Error;

/// Default scope that lets the issued token list accounts and roles
pub const DEFAULT_SCOPES: &[&str] = &["sso:account:access"];

/// Errors returned by the AWS SSO OIDC and portal endpoints
#[derive(Error, Debug)]
pub enum OidcError {
    /// The user has not finished the browser step yet (`authorization_pending`, `slow_down`)
    #[error("Authorization pending: {0}")]
    AuthorizationPending(String),

    /// Device code or token is past its validity window
    #[error("Token expired: {0}")]
    ExpiredToken(String),

    /// The user rejected the authorization request
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Access token or refresh token rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Any other non-2xx response
    #[error("AWS API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Network-level failure
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not have the expected shape
    #[error("Invalid response: {0}")]
    Decode(String),
}

/// Endpoint templates; `{region}` is substituted per call
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub oidc: String,
    pub portal: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            oidc: "https://oidc.{region}.amazonaws.com".to_string(),
            portal: "https://portal.sso.{region}.amazonaws.com".to_string(),
        }
    }
}

impl Endpoints {
    pub fn oidc_url(&self, region: &str, path: &str) -> String {
        format!(
            "{}{}",
            self.oidc.replace("{region}", region).trim_end_matches('/'),
            path
        )
    }

    pub fn portal_url(&self, region: &str, path: &str) -> String {
        format!(
            "{}{}",
            self.portal.replace("{region}", region).trim_end_matches('/'),
            path
        )
    }
}

/// Classify an AWS error response.
///
/// OIDC answers with `{"error", "error_description"}`; the portal and some OIDC
/// paths answer with `{"__type"|"code", "message"}`. Both shapes are accepted.
pub(crate) fn classify_error(status: u16, body: &str) -> OidcError {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();

    let code = parsed
        .as_ref()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("__type"))
                .or_else(|| v.get("code"))
        })
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let description = parsed
        .as_ref()
        .and_then(|v| {
            v.get("error_description")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("Message"))
        })
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    // "AuthorizationPendingException", "authorization_pending" → "authorizationpending"
    let normalized = code
        .rsplit('#')
        .next()
        .unwrap_or_default()
        .to_lowercase()
        .replace('_', "")
        .trim_end_matches("exception")
        .to_string();

    match normalized.as_str() {
        "authorizationpending" | "slowdown" => OidcError::AuthorizationPending(description),
        "expiredtoken" => OidcError::ExpiredToken(description),
        "accessdenied" => OidcError::AccessDenied(description),
        "invalidgrant" | "unauthorized" | "invalidclient" => OidcError::Unauthorized(description),
        _ if status == 401 => OidcError::Unauthorized(description),
        _ => OidcError::Api {
            status,
            message: body.to_string(),
        },
    }
}
