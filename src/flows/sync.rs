use std::collections::HashMap;
use std::sync::Arc;

use super::FlowError;
use crate::client::{ClientError, SsoApi};
use crate::models::SsoSession;

/// What the re-authentication dialog needs to re-enter at the code step
#[derive(Debug, Clone, PartialEq)]
pub struct ReauthTarget {
    pub name: String,
    pub start_url: String,
    pub region: String,
}

impl From<&SsoSession> for ReauthTarget {
    fn from(session: &SsoSession) -> Self {
        Self {
            name: session.name.clone(),
            start_url: session.start_url.clone(),
            region: session.region.clone(),
        }
    }
}

/// Per-session sync progress. A session absent from the map is idle.
#[derive(Debug, Clone, PartialEq)]
enum SyncPhase {
    InFlight,
    /// Sync hit SSO_LOGIN_REQUIRED; one retry is owed after re-authentication
    AwaitingReauth(ReauthTarget),
    Retrying,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Synced(SsoSession),
    /// Open the re-authentication flow for this target, then call
    /// [`SyncCoordinator::reauth_completed`] or [`SyncCoordinator::reauth_dismissed`]
    ReauthRequired(ReauthTarget),
    Failed(ClientError),
}

/// Runs session syncs and the implicit re-authentication detour.
///
/// The syncing indicator of a session stays on from the first sync call until
/// the pending retry resolves or the re-authentication is dismissed.
pub struct SyncCoordinator {
    api: Arc<dyn SsoApi>,
    phases: HashMap<String, SyncPhase>,
}

impl SyncCoordinator {
    pub fn new(api: Arc<dyn SsoApi>) -> Self {
        Self {
            api,
            phases: HashMap::new(),
        }
    }

    /// Whether the syncing indicator is on for a session
    pub fn is_syncing(&self, name: &str) -> bool {
        self.phases.contains_key(name)
    }

    /// Re-authentication target of a session whose sync awaits re-auth
    pub fn pending_reauth(&self, name: &str) -> Option<&ReauthTarget> {
        match self.phases.get(name) {
            Some(SyncPhase::AwaitingReauth(target)) => Some(target),
            _ => None,
        }
    }

    pub async fn sync(&mut self, session: &SsoSession) -> Result<SyncOutcome, FlowError> {
        if self.phases.contains_key(&session.name) {
            return Err(FlowError::SyncInProgress(session.name.clone()));
        }

        self.phases.insert(session.name.clone(), SyncPhase::InFlight);
        tracing::debug!("Syncing SSO session '{}'", session.name);

        match self.api.sync_session(&session.name).await {
            Ok(synced) => {
                self.phases.remove(&session.name);
                tracing::info!(
                    "SSO session '{}' synced ({} accounts)",
                    synced.name,
                    synced.accounts.len()
                );
                Ok(SyncOutcome::Synced(synced))
            }
            Err(e) if e.is_login_required() => {
                let target = ReauthTarget::from(session);
                tracing::info!(
                    "SSO session '{}' needs re-authentication before sync",
                    session.name
                );
                self.phases.insert(
                    session.name.clone(),
                    SyncPhase::AwaitingReauth(target.clone()),
                );
                Ok(SyncOutcome::ReauthRequired(target))
            }
            Err(e) => {
                self.phases.remove(&session.name);
                tracing::warn!("Failed to sync SSO session '{}': {}", session.name, e);
                Ok(SyncOutcome::Failed(e))
            }
        }
    }

    /// Re-authentication succeeded: re-issue the pending sync exactly once
    pub async fn reauth_completed(&mut self, name: &str) -> Result<SyncOutcome, FlowError> {
        match self.phases.get(name) {
            Some(SyncPhase::AwaitingReauth(_)) => {}
            _ => return Err(FlowError::NoPendingReauth(name.to_string())),
        }

        self.phases.insert(name.to_string(), SyncPhase::Retrying);
        let result = self.api.sync_session(name).await;
        self.phases.remove(name);

        match result {
            Ok(synced) => {
                tracing::info!("SSO session '{}' synced after re-authentication", name);
                Ok(SyncOutcome::Synced(synced))
            }
            Err(e) => {
                tracing::warn!(
                    "Sync of '{}' failed after re-authentication: {}",
                    name,
                    e
                );
                Ok(SyncOutcome::Failed(e))
            }
        }
    }

    /// Re-authentication dialog closed without completing; clears the indicator
    pub fn reauth_dismissed(&mut self, name: &str) -> bool {
        if matches!(self.phases.get(name), Some(SyncPhase::AwaitingReauth(_))) {
            self.phases.remove(name);
            tracing::debug!("Re-authentication for '{}' dismissed", name);
            true
        } else {
            false
        }
    }
}
