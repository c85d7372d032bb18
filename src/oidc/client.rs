use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::{classify_error, Endpoints, OidcError};
use crate::http_client::AwsHttpClient;
use crate::models::aws::{
    CreateTokenRequest, CreateTokenResponse, GetRoleCredentialsResponse, ListAccountRolesResponse,
    ListAccountsResponse, RegisterClientRequest, RegisterClientResponse,
    StartDeviceAuthorizationRequest, StartDeviceAuthorizationResponse, DEVICE_CODE_GRANT,
    REFRESH_TOKEN_GRANT,
};
use crate::models::{Account, DeviceAuthSession, RoleCredentials};

/// Re-register when the client secret expires within this window
const REGISTRATION_EXPIRY_MARGIN_SECS: i64 = 300;

/// Page size for portal listings
const PORTAL_PAGE_SIZE: &str = "100";

/// Header carrying the SSO access token on portal calls
const PORTAL_TOKEN_HEADER: &str = "x-amz-sso_bearer_token";

/// A registered public OIDC client
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ClientRegistration {
    fn is_usable(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(exp) => exp > Utc::now() + Duration::seconds(REGISTRATION_EXPIRY_MARGIN_SECS),
        }
    }
}

/// Token issued by a device-code or refresh grant
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Client for the AWS SSO OIDC service and the SSO portal API
pub struct SsoOidcClient {
    http: AwsHttpClient,
    endpoints: Endpoints,
    client_name: String,
    scopes: Vec<String>,

    /// Registered clients keyed by region
    registrations: DashMap<String, ClientRegistration>,
}

impl SsoOidcClient {
    pub fn new(
        http: AwsHttpClient,
        endpoints: Endpoints,
        client_name: String,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            http,
            endpoints,
            client_name,
            scopes,
            registrations: DashMap::new(),
        }
    }

    /// Get a registered client for the region, registering a new one when the
    /// cached registration is missing or close to expiry
    pub async fn registration(&self, region: &str) -> Result<ClientRegistration, OidcError> {
        if let Some(existing) = self.registrations.get(region) {
            if existing.is_usable() {
                return Ok(existing.clone());
            }
            tracing::info!("OIDC client registration for {} is expiring, re-registering", region);
        }

        let request = RegisterClientRequest {
            client_name: self.client_name.clone(),
            client_type: "public".to_string(),
            scopes: self.scopes.clone(),
        };

        let builder = self
            .http
            .client()
            .post(self.endpoints.oidc_url(region, "/client/register"))
            .json(&request);
        let data: RegisterClientResponse = self.send_json(builder, true).await?;

        let registration = ClientRegistration {
            client_id: data.client_id,
            client_secret: data.client_secret,
            expires_at: data
                .client_secret_expires_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        };

        tracing::info!(
            "Registered OIDC client in {} (client_id: {}...)",
            region,
            prefix(&registration.client_id)
        );
        self.registrations
            .insert(region.to_string(), registration.clone());
        Ok(registration)
    }

    /// Begin a device authorization for a start URL
    pub async fn start_device_authorization(
        &self,
        region: &str,
        start_url: &str,
    ) -> Result<DeviceAuthSession, OidcError> {
        let registration = self.registration(region).await?;

        let request = StartDeviceAuthorizationRequest {
            client_id: registration.client_id.clone(),
            client_secret: registration.client_secret.clone(),
            start_url: start_url.to_string(),
        };

        let builder = self
            .http
            .client()
            .post(self.endpoints.oidc_url(region, "/device_authorization"))
            .json(&request);
        let data: StartDeviceAuthorizationResponse = self.send_json(builder, true).await?;

        tracing::info!(
            "Device authorization started for {} (user code: {})",
            start_url,
            data.user_code
        );

        let verification_uri_complete = data
            .verification_uri_complete
            .unwrap_or_else(|| format!("{}?user_code={}", data.verification_uri, data.user_code));

        Ok(DeviceAuthSession {
            user_code: data.user_code,
            verification_uri: data.verification_uri,
            verification_uri_complete,
            expires_in: data.expires_in.unwrap_or(600),
            interval: data.interval.unwrap_or(5),
            device_code: data.device_code,
            client_id: registration.client_id,
            client_secret: registration.client_secret,
        })
    }

    /// Exchange a device code for a token. Issued exactly once per call.
    pub async fn create_token(
        &self,
        region: &str,
        client_id: &str,
        client_secret: &str,
        device_code: &str,
    ) -> Result<TokenGrant, OidcError> {
        let request = CreateTokenRequest {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            grant_type: DEVICE_CODE_GRANT.to_string(),
            device_code: Some(device_code.to_string()),
            refresh_token: None,
        };

        let builder = self
            .http
            .client()
            .post(self.endpoints.oidc_url(region, "/token"))
            .json(&request);
        let data: CreateTokenResponse = self.send_json(builder, false).await?;

        let grant = token_grant(data)?;
        tracing::info!(
            "Device code exchanged for token, expires: {}",
            grant.expires_at.to_rfc3339()
        );
        Ok(grant)
    }

    /// Refresh an access token with a refresh-token grant
    pub async fn refresh_token(
        &self,
        region: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, OidcError> {
        tracing::info!("Refreshing SSO token via AWS SSO OIDC ({})...", region);

        let request = CreateTokenRequest {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            grant_type: REFRESH_TOKEN_GRANT.to_string(),
            device_code: None,
            refresh_token: Some(refresh_token.to_string()),
        };

        let builder = self
            .http
            .client()
            .post(self.endpoints.oidc_url(region, "/token"))
            .json(&request);

        let data: CreateTokenResponse = match self.send_json(builder, false).await {
            Ok(data) => data,
            // An expired refresh token means the user has to log in again
            Err(OidcError::ExpiredToken(msg)) => return Err(OidcError::Unauthorized(msg)),
            Err(e) => return Err(e),
        };

        let grant = token_grant(data)?;
        tracing::info!(
            "Token refreshed via AWS SSO OIDC, expires: {}",
            grant.expires_at.to_rfc3339()
        );
        Ok(grant)
    }

    /// List every account the token can access, each with its roles
    pub async fn list_accounts_with_roles(
        &self,
        region: &str,
        access_token: &str,
    ) -> Result<Vec<Account>, OidcError> {
        let mut accounts = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut query = vec![("max_result", PORTAL_PAGE_SIZE.to_string())];
            if let Some(ref token) = next_token {
                query.push(("next_token", token.clone()));
            }

            let builder = self
                .http
                .client()
                .get(self.endpoints.portal_url(region, "/assignment/accounts"))
                .query(&query)
                .header(PORTAL_TOKEN_HEADER, access_token);
            let page: ListAccountsResponse = self.send_json(builder, true).await?;

            for account in page.account_list {
                let roles = self
                    .list_account_roles(region, access_token, &account.account_id)
                    .await?;
                accounts.push(Account {
                    account_name: account
                        .account_name
                        .unwrap_or_else(|| account.account_id.clone()),
                    account_id: account.account_id,
                    email: account.email_address,
                    roles,
                });
            }

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        accounts.sort_by(|a, b| {
            a.account_name
                .to_lowercase()
                .cmp(&b.account_name.to_lowercase())
        });
        tracing::debug!("Listed {} accounts in {}", accounts.len(), region);
        Ok(accounts)
    }

    async fn list_account_roles(
        &self,
        region: &str,
        access_token: &str,
        account_id: &str,
    ) -> Result<Vec<String>, OidcError> {
        let mut roles = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("account_id", account_id.to_string()),
                ("max_result", PORTAL_PAGE_SIZE.to_string()),
            ];
            if let Some(ref token) = next_token {
                query.push(("next_token", token.clone()));
            }

            let builder = self
                .http
                .client()
                .get(self.endpoints.portal_url(region, "/assignment/roles"))
                .query(&query)
                .header(PORTAL_TOKEN_HEADER, access_token);
            let page: ListAccountRolesResponse = self.send_json(builder, true).await?;

            roles.extend(page.role_list.into_iter().map(|r| r.role_name));

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        roles.sort();
        Ok(roles)
    }

    /// Fetch short-lived credentials for an account role
    pub async fn get_role_credentials(
        &self,
        region: &str,
        access_token: &str,
        account_id: &str,
        role_name: &str,
    ) -> Result<RoleCredentials, OidcError> {
        let builder = self
            .http
            .client()
            .get(self.endpoints.portal_url(region, "/federation/credentials"))
            .query(&[("account_id", account_id), ("role_name", role_name)])
            .header(PORTAL_TOKEN_HEADER, access_token);
        let data: GetRoleCredentialsResponse = self.send_json(builder, true).await?;

        let creds = data.role_credentials;
        let expiration = Utc
            .timestamp_millis_opt(creds.expiration)
            .single()
            .ok_or_else(|| OidcError::Decode(format!("invalid expiration {}", creds.expiration)))?;

        Ok(RoleCredentials {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.session_token,
            expiration,
        })
    }

    /// Send a request and decode a JSON success body, classifying error bodies
    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        retry: bool,
    ) -> Result<T, OidcError> {
        let request = builder.build()?;
        let path = request.url().path().to_string();

        let response = if retry {
            self.http.execute_with_retry(request).await?
        } else {
            self.http.execute_once(request).await?
        };

        let response = check_status(response, &path).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| OidcError::Decode(format!("{}: {}", path, e)))
    }
}

async fn check_status(response: Response, path: &str) -> Result<Response, OidcError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = classify_error(status.as_u16(), &body);
    match &err {
        OidcError::AuthorizationPending(_) => {
            tracing::debug!("{} answered authorization pending", path)
        }
        _ => tracing::warn!(
            "AWS request to {} failed: status={}, error={}",
            path,
            status,
            err
        ),
    }
    Err(err)
}

fn token_grant(data: CreateTokenResponse) -> Result<TokenGrant, OidcError> {
    if data.access_token.is_empty() {
        return Err(OidcError::Decode(
            "token response does not contain accessToken".to_string(),
        ));
    }

    // Expire a minute early so callers never present a token on its last second.
    // Short-lived tokens keep at least half their lifetime.
    let expires_in = data.expires_in.unwrap_or(3600) as i64;
    let margin = 60.min(expires_in / 2);
    let expires_at = Utc::now() + Duration::seconds(expires_in - margin);

    Ok(TokenGrant {
        access_token: data.access_token,
        refresh_token: data.refresh_token,
        expires_at,
    })
}

fn prefix(s: &str) -> &str {
    &s[..8.min(s.len())]
}
