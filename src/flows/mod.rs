// Client-side SSO flows
// Explicit state machines for device authorization, sync with re-auth,
// and role-to-context mapping

pub mod device;
pub mod mapping;
pub mod sync;

pub use device::{CompletionOutcome, DeviceAuthFlow, DeviceAuthState, SessionForm};
pub use mapping::{ContextCandidate, ContextPicker, MappingStatus, MappingTarget};
pub use sync::{ReauthTarget, SyncCoordinator, SyncOutcome};

use thiserror::Error;

use crate::client::ClientError;

#[derive(Error, Debug)]
pub enum FlowError {
    /// Operation not allowed in the current state; the state is unchanged
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    /// Local input validation failed; nothing was sent
    #[error("{0}")]
    Validation(String),

    #[error("A sync is already in progress for '{0}'")]
    SyncInProgress(String),

    #[error("No re-authentication is pending for '{0}'")]
    NoPendingReauth(String),

    #[error(transparent)]
    Api(#[from] ClientError),
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process [`SsoApi`] used by the flow tests

    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::client::{ClientError, ClientResult, SsoApi};
    use crate::error::ErrorCode;
    use crate::models::*;

    #[derive(Default)]
    pub struct FakeApi {
        pub start_calls: Mutex<Vec<StartDeviceAuthRequest>>,
        pub complete_calls: Mutex<Vec<CompleteDeviceAuthRequest>>,
        pub sync_calls: Mutex<Vec<String>>,
        pub upserts: Mutex<Vec<UpsertContextMappingRequest>>,

        /// Scripted results, consumed front to back
        pub start_results: Mutex<VecDeque<ClientResult<DeviceAuthSession>>>,
        pub complete_results: Mutex<VecDeque<ClientResult<SsoSession>>>,
        pub sync_results: Mutex<VecDeque<ClientResult<SsoSession>>>,

        /// Completion requests never answer while set
        pub hang_complete: AtomicBool,

        pub contexts: Vec<KubeContext>,
        pub mappings: Vec<ContextMapping>,
    }

    pub fn login_required() -> ClientError {
        ClientError::Api {
            status: 401,
            code: Some(ErrorCode::SsoLoginRequired),
            message: "Complete the login in your browser first".to_string(),
        }
    }

    pub fn server_error() -> ClientError {
        ClientError::Api {
            status: 500,
            code: Some(ErrorCode::InternalError),
            message: "Internal server error".to_string(),
        }
    }

    pub fn device(n: u32) -> DeviceAuthSession {
        DeviceAuthSession {
            user_code: format!("ABCD-{:04}", n),
            verification_uri: "https://device.sso.us-east-1.amazonaws.com/".to_string(),
            verification_uri_complete: format!(
                "https://device.sso.us-east-1.amazonaws.com/?user_code=ABCD-{:04}",
                n
            ),
            expires_in: 600,
            interval: 5,
            device_code: format!("device-code-{}", n),
            client_id: format!("client-id-{}", n),
            client_secret: format!("client-secret-{}", n),
        }
    }

    pub fn session(name: &str) -> SsoSession {
        SsoSession {
            name: name.to_string(),
            start_url: "https://x.awsapps.com/start".to_string(),
            region: "us-east-1".to_string(),
            is_logged_in: true,
            token_expiry: Some(Utc::now()),
            last_synced: None,
            accounts: vec![],
        }
    }

    fn next<T>(queue: &Mutex<VecDeque<ClientResult<T>>>, what: &str) -> ClientResult<T> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected {} call", what))
    }

    #[async_trait]
    impl SsoApi for FakeApi {
        async fn start_device_auth(
            &self,
            req: &StartDeviceAuthRequest,
        ) -> ClientResult<DeviceAuthSession> {
            self.start_calls.lock().unwrap().push(req.clone());
            next(&self.start_results, "start")
        }

        async fn complete_device_auth(
            &self,
            req: &CompleteDeviceAuthRequest,
        ) -> ClientResult<SsoSession> {
            self.complete_calls.lock().unwrap().push(req.clone());
            if self.hang_complete.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            next(&self.complete_results, "complete")
        }

        async fn device_status(&self, start_url: &str) -> ClientResult<DeviceAuthStatus> {
            Ok(DeviceAuthStatus {
                start_url: start_url.to_string(),
                is_logged_in: false,
                session_name: None,
                token_expiry: None,
            })
        }

        async fn list_sessions(&self) -> ClientResult<Vec<SsoSession>> {
            Ok(vec![])
        }

        async fn get_session(&self, name: &str) -> ClientResult<SsoSession> {
            Ok(session(name))
        }

        async fn create_session(&self, req: &CreateSessionRequest) -> ClientResult<SsoSession> {
            Ok(session(&req.name))
        }

        async fn delete_session(&self, _name: &str) -> ClientResult<()> {
            Ok(())
        }

        async fn sync_session(&self, name: &str) -> ClientResult<SsoSession> {
            self.sync_calls.lock().unwrap().push(name.to_string());
            next(&self.sync_results, "sync")
        }

        async fn list_contexts(&self) -> ClientResult<Vec<KubeContext>> {
            Ok(self.contexts.clone())
        }

        async fn list_mappings(&self) -> ClientResult<Vec<ContextMapping>> {
            Ok(self.mappings.clone())
        }

        async fn upsert_mapping(
            &self,
            req: &UpsertContextMappingRequest,
        ) -> ClientResult<ContextMapping> {
            self.upserts.lock().unwrap().push(req.clone());
            Ok(ContextMapping {
                context_name: req.context_name.clone(),
                cluster_name: req.cluster_name.clone(),
                session_name: req.session_name.clone(),
                account_id: req.account_id.clone(),
                account_name: req.account_name.clone(),
                role_name: req.role_name.clone(),
                updated_at: Utc::now(),
            })
        }

        async fn delete_mapping(&self, _context_name: &str) -> ClientResult<()> {
            Ok(())
        }

        async fn mapping_credentials(&self, _context_name: &str) -> ClientResult<RoleCredentials> {
            Err(server_error())
        }
    }
}
