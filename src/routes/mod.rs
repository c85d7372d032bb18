use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::{self as axum_middleware},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::error::ApiError;
use crate::kubeconfig;
use crate::middleware;
use crate::models::{
    CompleteDeviceAuthRequest, ContextMapping, CreateSessionRequest, DeviceAuthSession,
    DeviceAuthStatus, DeviceStatusQuery, KubeContext, RoleCredentials, SsoSession,
    StartDeviceAuthRequest, UpsertContextMappingRequest,
};
use crate::oidc::{OidcError, SsoOidcClient};
use crate::store::{SsoStore, StoredSession, StoredToken};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every SSO endpoint
pub const API_PREFIX: &str = "/api/v1/aws/sso";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SsoStore>,
    pub oidc: Arc<SsoOidcClient>,
    pub config: Arc<Config>,
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// SSO device flow, session and context-mapping routes.
/// Authenticated when an API key is configured.
pub fn sso_routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/device/start", post(start_device_handler))
        .route("/device/complete", post(complete_device_handler))
        .route("/device/status", get(device_status_handler))
        .route(
            "/bridge/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route(
            "/bridge/sessions/:name",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/bridge/sessions/:name/sync", post(sync_session_handler))
        .route("/bridge/contexts", get(list_contexts_handler))
        .route("/bridge/context-mappings", get(list_mappings_handler))
        .route("/bridge/context-mapping", post(upsert_mapping_handler))
        .route(
            "/bridge/context-mapping/:context_name",
            get(get_mapping_handler).delete(delete_mapping_handler),
        )
        .route(
            "/bridge/context-mapping/:context_name/credentials",
            get(mapping_credentials_handler),
        );

    Router::new()
        .nest(API_PREFIX, api)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
///
/// Returns basic status and version information.
/// This endpoint does not require authentication (for load balancers).
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Bridge SSO is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::ValidationError(format!("{} is required", field)));
    }
    Ok(())
}

// ==================================================================================================
// Device authorization
// ==================================================================================================

/// POST /device/start - Begin a device authorization
///
/// The returned device code and client credentials are not kept server-side;
/// the caller sends them back on completion.
async fn start_device_handler(
    State(state): State<AppState>,
    Json(request): Json<StartDeviceAuthRequest>,
) -> Result<Json<DeviceAuthSession>, ApiError> {
    require("startUrl", &request.start_url)?;
    require("region", &request.region)?;

    tracing::info!(
        "Request to /device/start: startUrl={}, region={}",
        request.start_url,
        request.region
    );

    let device = state
        .oidc
        .start_device_authorization(&request.region, &request.start_url)
        .await?;

    Ok(Json(device))
}

/// POST /device/complete - Exchange the device code for a token
///
/// Exactly one token request per call. A pending browser step answers
/// `SSO_LOGIN_REQUIRED` so the caller can retry with the same device code.
async fn complete_device_handler(
    State(state): State<AppState>,
    Json(request): Json<CompleteDeviceAuthRequest>,
) -> Result<Json<SsoSession>, ApiError> {
    require("sessionName", &request.session_name)?;
    require("startUrl", &request.start_url)?;
    require("region", &request.region)?;
    require("deviceCode", &request.device_code)?;
    require("clientId", &request.client_id)?;

    tracing::info!(
        "Request to /device/complete: session={}, region={}",
        request.session_name,
        request.region
    );

    let grant = state
        .oidc
        .create_token(
            &request.region,
            &request.client_id,
            &request.client_secret,
            &request.device_code,
        )
        .await
        .map_err(|e| match e {
            OidcError::AuthorizationPending(_) => ApiError::SsoLoginRequired(
                "Complete the login in your browser, then try again".to_string(),
            ),
            other => other.into(),
        })?;

    let token = StoredToken {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        client_id: Some(request.client_id.clone()),
        client_secret: Some(request.client_secret.clone()),
        expires_at: grant.expires_at,
    };

    let stored = state.store.save_login(
        &request.session_name,
        &request.start_url,
        &request.region,
        &token,
    )?;
    tracing::info!("SSO session '{}' logged in", stored.name);

    // Initial sync is best-effort; the login itself already succeeded
    let session = match sync_accounts(&state, &stored).await {
        Ok(synced) => synced,
        Err(e) => {
            tracing::warn!("Initial sync of '{}' failed: {}", stored.name, e);
            stored
        }
    };

    Ok(Json(session.to_api(Utc::now())))
}

/// GET /device/status?startUrl= - Login status from the store, without calling AWS
async fn device_status_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceStatusQuery>,
) -> Result<Json<DeviceAuthStatus>, ApiError> {
    let now = Utc::now();
    let sessions = state.store.find_sessions_by_start_url(&query.start_url)?;

    let best = sessions
        .iter()
        .find(|s| s.is_logged_in(now))
        .or_else(|| sessions.first());

    Ok(Json(DeviceAuthStatus {
        start_url: query.start_url,
        is_logged_in: best.is_some_and(|s| s.is_logged_in(now)),
        session_name: best.map(|s| s.name.clone()),
        token_expiry: best.and_then(|s| s.token.as_ref().map(|t| t.expires_at)),
    }))
}

// ==================================================================================================
// Sessions
// ==================================================================================================

async fn list_sessions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<SsoSession>>, ApiError> {
    let now = Utc::now();
    let sessions = state.store.list_sessions()?;
    Ok(Json(sessions.iter().map(|s| s.to_api(now)).collect()))
}

/// POST /bridge/sessions - Register a session before its first login
async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SsoSession>), ApiError> {
    require("name", &request.name)?;
    require("startUrl", &request.start_url)?;
    require("region", &request.region)?;

    let created = state
        .store
        .create_session(&request.name, &request.start_url, &request.region)?;
    tracing::info!("Created SSO session '{}'", created.name);

    Ok((StatusCode::CREATED, Json(created.to_api(Utc::now()))))
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SsoSession>, ApiError> {
    let session = state.store.get_session(&name)?;
    Ok(Json(session.to_api(Utc::now())))
}

/// DELETE /bridge/sessions/:name - Context mappings referencing the session stay
async fn delete_session_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_session(&name)?;
    tracing::info!("Deleted SSO session '{}'", name);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /bridge/sessions/:name/sync - Refresh the account and role tree
async fn sync_session_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SsoSession>, ApiError> {
    tracing::info!("Request to sync SSO session '{}'", name);

    let stored = state.store.get_session(&name)?;
    let synced = sync_accounts(&state, &stored).await?;

    Ok(Json(synced.to_api(Utc::now())))
}

/// Return a token good for portal calls, refreshing it when it expires within
/// the configured threshold
async fn usable_token(state: &AppState, session: &StoredSession) -> Result<StoredToken, ApiError> {
    let now = Utc::now();
    let token = session.token.clone().ok_or_else(|| {
        ApiError::SsoLoginRequired(format!("SSO session '{}' is not logged in", session.name))
    })?;

    let threshold = Duration::seconds(state.config.token_refresh_threshold as i64);
    if token.expires_at > now + threshold {
        return Ok(token);
    }

    let credentials = match (&token.refresh_token, &token.client_id, &token.client_secret) {
        (Some(refresh), Some(id), Some(secret)) => Some((refresh.clone(), id.clone(), secret.clone())),
        _ => None,
    };
    let Some((refresh, client_id, client_secret)) = credentials else {
        if token.expires_at > now {
            return Ok(token);
        }
        return Err(ApiError::SsoLoginRequired(format!(
            "SSO token of '{}' has expired",
            session.name
        )));
    };

    tracing::debug!(
        "SSO token of '{}' expires at {}, refreshing",
        session.name,
        token.expires_at.to_rfc3339()
    );

    match state
        .oidc
        .refresh_token(&session.region, &client_id, &client_secret, &refresh)
        .await
    {
        Ok(grant) => {
            let refreshed = StoredToken {
                access_token: grant.access_token,
                refresh_token: grant.refresh_token.or(Some(refresh)),
                client_id: Some(client_id),
                client_secret: Some(client_secret),
                expires_at: grant.expires_at,
            };
            state.store.update_token(&session.name, &refreshed)?;
            Ok(refreshed)
        }
        Err(e) if token.expires_at > now => {
            tracing::warn!(
                "Token refresh for '{}' failed, using current token: {}",
                session.name,
                e
            );
            Ok(token)
        }
        Err(OidcError::Unauthorized(_)) => Err(ApiError::SsoLoginRequired(format!(
            "SSO token of '{}' has expired and could not be refreshed",
            session.name
        ))),
        Err(e) => Err(e.into()),
    }
}

/// List accounts and roles from the portal and store them on the session
async fn sync_accounts(state: &AppState, session: &StoredSession) -> Result<StoredSession, ApiError> {
    let token = usable_token(state, session).await?;

    let accounts = state
        .oidc
        .list_accounts_with_roles(&session.region, &token.access_token)
        .await?;

    let synced = state
        .store
        .update_accounts(&session.name, &accounts, Utc::now())?;
    tracing::info!(
        "Synced SSO session '{}': {} accounts",
        synced.name,
        synced.accounts.len()
    );
    Ok(synced)
}

// ==================================================================================================
// Contexts and mappings
// ==================================================================================================

/// GET /bridge/contexts - Contexts from the configured kubeconfig
async fn list_contexts_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<KubeContext>>, ApiError> {
    let contexts = kubeconfig::load_contexts(&state.config.kubeconfig)?;
    Ok(Json(contexts))
}

async fn list_mappings_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContextMapping>>, ApiError> {
    Ok(Json(state.store.list_mappings()?))
}

async fn get_mapping_handler(
    State(state): State<AppState>,
    Path(context_name): Path<String>,
) -> Result<Json<ContextMapping>, ApiError> {
    Ok(Json(state.store.get_mapping(&context_name)?))
}

/// POST /bridge/context-mapping - Create or overwrite the mapping of a context
async fn upsert_mapping_handler(
    State(state): State<AppState>,
    Json(mut request): Json<UpsertContextMappingRequest>,
) -> Result<Json<ContextMapping>, ApiError> {
    require("contextName", &request.context_name)?;
    require("sessionName", &request.session_name)?;
    require("accountId", &request.account_id)?;
    require("roleName", &request.role_name)?;

    let session = state.store.get_session(&request.session_name)?;
    if request.account_name.is_none() {
        request.account_name = session
            .accounts
            .iter()
            .find(|a| a.account_id == request.account_id)
            .map(|a| a.account_name.clone());
    }

    let (mapping, previous) = state.store.upsert_mapping(&request, Utc::now())?;

    match previous {
        Some(prev)
            if !prev.targets(&mapping.session_name, &mapping.account_id, &mapping.role_name) =>
        {
            tracing::warn!(
                "Context '{}' remapped from {}/{} ({}) to {}/{} ({})",
                mapping.context_name,
                prev.account_id,
                prev.role_name,
                prev.session_name,
                mapping.account_id,
                mapping.role_name,
                mapping.session_name
            );
        }
        _ => {
            tracing::info!(
                "Context '{}' mapped to {}/{}",
                mapping.context_name,
                mapping.account_id,
                mapping.role_name
            );
        }
    }

    Ok(Json(mapping))
}

async fn delete_mapping_handler(
    State(state): State<AppState>,
    Path(context_name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_mapping(&context_name)?;
    tracing::info!("Deleted mapping for context '{}'", context_name);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /bridge/context-mapping/:context_name/credentials - Role credentials for
/// the mapped account and role
async fn mapping_credentials_handler(
    State(state): State<AppState>,
    Path(context_name): Path<String>,
) -> Result<Json<RoleCredentials>, ApiError> {
    let mapping = state.store.get_mapping(&context_name)?;
    let session = state.store.get_session(&mapping.session_name)?;
    let token = usable_token(&state, &session).await?;

    let credentials = state
        .oidc
        .get_role_credentials(
            &session.region,
            &token.access_token,
            &mapping.account_id,
            &mapping.role_name,
        )
        .await?;

    tracing::info!(
        "Issued credentials for context '{}' ({}/{}), expires {}",
        context_name,
        mapping.account_id,
        mapping.role_name,
        credentials.expiration.to_rfc3339()
    );
    Ok(Json(credentials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::AwsHttpClient;
    use crate::models::Account;
    use crate::oidc::Endpoints;
    use std::path::PathBuf;

    fn create_test_state() -> AppState {
        // Nothing in these tests reaches AWS
        let endpoints = Endpoints {
            oidc: "http://127.0.0.1:9/oidc/{region}".to_string(),
            portal: "http://127.0.0.1:9/portal/{region}".to_string(),
        };
        let http = AwsHttpClient::new(1, 1, 0).unwrap();
        let oidc = SsoOidcClient::new(
            http,
            endpoints.clone(),
            "bridge-test".to_string(),
            vec!["sso:account:access".to_string()],
        );

        let config = Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
            api_key: None,
            db_file: PathBuf::from(":memory:"),
            kubeconfig: PathBuf::from("/nonexistent/kubeconfig"),
            client_name: "bridge-test".to_string(),
            scopes: vec!["sso:account:access".to_string()],
            endpoints,
            token_refresh_threshold: 300,
            http_connect_timeout: 1,
            http_request_timeout: 1,
            http_max_retries: 0,
            log_level: "info".to_string(),
        };

        AppState {
            store: Arc::new(SsoStore::open_in_memory().unwrap()),
            oidc: Arc::new(oidc),
            config: Arc::new(config),
        }
    }

    fn token(expires_at: chrono::DateTime<Utc>) -> StoredToken {
        StoredToken {
            access_token: "access".to_string(),
            refresh_token: None,
            client_id: None,
            client_secret: None,
            expires_at,
        }
    }

    fn mapping_request(session: &str) -> UpsertContextMappingRequest {
        UpsertContextMappingRequest {
            context_name: "prod".to_string(),
            cluster_name: "prod-cluster".to_string(),
            session_name: session.to_string(),
            account_id: "111111111111".to_string(),
            account_name: None,
            role_name: "Admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_root_handler() {
        let value = root_handler().await.0;

        assert_eq!(value["status"], "ok");
        assert_eq!(value["message"], "Bridge SSO is running");
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let value = health_handler().await.0;

        assert_eq!(value["status"], "healthy");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_create_session_requires_fields() {
        let state = create_test_state();
        let result = create_session_handler(
            State(state),
            Json(CreateSessionRequest {
                name: " ".to_string(),
                start_url: "https://corp.awsapps.com/start".to_string(),
                region: "us-east-1".to_string(),
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_create_and_list_sessions() {
        let state = create_test_state();
        let (status, created) = create_session_handler(
            State(state.clone()),
            Json(CreateSessionRequest {
                name: "corp".to_string(),
                start_url: "https://corp.awsapps.com/start".to_string(),
                region: "us-east-1".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert!(!created.0.is_logged_in);

        let sessions = list_sessions_handler(State(state)).await.unwrap().0;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "corp");
    }

    #[tokio::test]
    async fn test_sync_without_token_requires_login() {
        let state = create_test_state();
        state
            .store
            .create_session("corp", "https://corp.awsapps.com/start", "us-east-1")
            .unwrap();

        let err = sync_session_handler(State(state), Path("corp".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SsoLoginRequired(_)));
    }

    #[tokio::test]
    async fn test_sync_with_expired_token_requires_login() {
        let state = create_test_state();
        state
            .store
            .save_login(
                "corp",
                "https://corp.awsapps.com/start",
                "us-east-1",
                &token(Utc::now() - Duration::minutes(5)),
            )
            .unwrap();

        let err = sync_session_handler(State(state), Path("corp".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SsoLoginRequired(_)));
    }

    #[tokio::test]
    async fn test_sync_unknown_session() {
        let state = create_test_state();
        let err = sync_session_handler(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_device_status_from_store() {
        let state = create_test_state();
        let expiry = Utc::now() + Duration::hours(1);
        state
            .store
            .save_login("corp", "https://corp.awsapps.com/start", "us-east-1", &token(expiry))
            .unwrap();

        let status = device_status_handler(
            State(state.clone()),
            Query(DeviceStatusQuery {
                start_url: "https://corp.awsapps.com/start".to_string(),
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(status.is_logged_in);
        assert_eq!(status.session_name.as_deref(), Some("corp"));

        let status = device_status_handler(
            State(state),
            Query(DeviceStatusQuery {
                start_url: "https://other.awsapps.com/start".to_string(),
            }),
        )
        .await
        .unwrap()
        .0;
        assert!(!status.is_logged_in);
        assert!(status.session_name.is_none());
    }

    #[tokio::test]
    async fn test_upsert_mapping_requires_session() {
        let state = create_test_state();
        let err = upsert_mapping_handler(State(state), Json(mapping_request("ghost")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upsert_mapping_fills_account_name() {
        let state = create_test_state();
        state
            .store
            .create_session("corp", "https://corp.awsapps.com/start", "us-east-1")
            .unwrap();
        state
            .store
            .update_accounts(
                "corp",
                &[Account {
                    account_id: "111111111111".to_string(),
                    account_name: "Production".to_string(),
                    email: None,
                    roles: vec!["Admin".to_string()],
                }],
                Utc::now(),
            )
            .unwrap();

        let mapping = upsert_mapping_handler(State(state), Json(mapping_request("corp")))
            .await
            .unwrap()
            .0;
        assert_eq!(mapping.account_name.as_deref(), Some("Production"));
    }

    #[tokio::test]
    async fn test_contexts_with_missing_kubeconfig() {
        let state = create_test_state();
        let contexts = list_contexts_handler(State(state)).await.unwrap().0;
        assert!(contexts.is_empty());
    }
}
