use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use super::sync::ReauthTarget;
use super::FlowError;
use crate::client::{ClientError, SsoApi};
use crate::models::{
    CompleteDeviceAuthRequest, DeviceAuthSession, SsoSession, StartDeviceAuthRequest,
};

static REGION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]{2}(-gov|-iso[a-z]*)?-[a-z]+-\d+$").unwrap());

/// Input collected before a device authorization starts
#[derive(Debug, Clone, PartialEq)]
pub struct SessionForm {
    pub session_name: String,
    pub start_url: String,
    pub region: String,
}

impl SessionForm {
    pub fn new(
        session_name: impl Into<String>,
        start_url: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            session_name: session_name.into().trim().to_string(),
            start_url: start_url.into().trim().to_string(),
            region: region.into().trim().to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.session_name.is_empty() {
            return Err("Session name is required".to_string());
        }
        if self.session_name.contains('/') {
            return Err("Session name cannot contain '/'".to_string());
        }

        match reqwest::Url::parse(&self.start_url) {
            Ok(url) if url.scheme() == "https" && url.host_str().is_some() => {}
            _ => return Err(format!("Start URL must be an https URL: {}", self.start_url)),
        }

        if !REGION_PATTERN.is_match(&self.region) {
            return Err(format!("Not an AWS region: {}", self.region));
        }

        Ok(())
    }
}

/// States of one device-authorization attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAuthState {
    /// Collecting session name, start URL and region
    Form { error: Option<String> },

    /// Showing the user code; waiting for the user to finish in the browser
    Code {
        form: SessionForm,
        device: DeviceAuthSession,
        error: Option<String>,
    },

    /// The single completion request is in flight
    Polling {
        form: SessionForm,
        device: DeviceAuthSession,
    },

    /// Session stored server-side; the flow is finished
    Succeeded { session: SsoSession },
}

impl DeviceAuthState {
    fn name(&self) -> &'static str {
        match self {
            DeviceAuthState::Form { .. } => "collecting the session form",
            DeviceAuthState::Code { .. } => "waiting for browser login",
            DeviceAuthState::Polling { .. } => "completing the login",
            DeviceAuthState::Succeeded { .. } => "finished",
        }
    }
}

/// Result of a completion attempt
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Login finished and the session was stored
    Completed(SsoSession),
    /// The browser step is not finished; back at the code step
    LoginPending(String),
    /// The request failed for another reason; back at the code step
    Failed(ClientError),
}

type SuccessHook = Box<dyn FnMut(&SsoSession) + Send>;

/// Device-authorization flow for adding a session or re-authenticating one.
///
/// One instance covers one dialog lifetime: the device code and client
/// credentials obtained at the form → code transition are reused verbatim for
/// every completion attempt and are dropped with the flow.
pub struct DeviceAuthFlow {
    api: Arc<dyn SsoApi>,
    reauth: bool,
    state: DeviceAuthState,
    on_success: Option<SuccessHook>,
}

impl DeviceAuthFlow {
    /// Start the "add session" flow at the form step
    pub fn new(api: Arc<dyn SsoApi>) -> Self {
        Self {
            api,
            reauth: false,
            state: DeviceAuthState::Form { error: None },
            on_success: None,
        }
    }

    /// Start a re-authentication for an existing session.
    /// Enters directly at the code step; a failed start yields no flow.
    pub async fn reauth(api: Arc<dyn SsoApi>, target: &ReauthTarget) -> Result<Self, FlowError> {
        let form = SessionForm {
            session_name: target.name.clone(),
            start_url: target.start_url.clone(),
            region: target.region.clone(),
        };

        tracing::info!("Re-authenticating SSO session '{}'", target.name);
        let device = api
            .start_device_auth(&StartDeviceAuthRequest {
                start_url: form.start_url.clone(),
                region: form.region.clone(),
            })
            .await?;

        Ok(Self {
            api,
            reauth: true,
            state: DeviceAuthState::Code {
                form,
                device,
                error: None,
            },
            on_success: None,
        })
    }

    /// Hook run once when the login completes (e.g. refetch the session list)
    pub fn on_success(mut self, hook: impl FnMut(&SsoSession) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> &DeviceAuthState {
        &self.state
    }

    pub fn is_reauth(&self) -> bool {
        self.reauth
    }

    /// Device data of the current attempt, if one was started
    pub fn device(&self) -> Option<&DeviceAuthSession> {
        match &self.state {
            DeviceAuthState::Code { device, .. } | DeviceAuthState::Polling { device, .. } => {
                Some(device)
            }
            _ => None,
        }
    }

    /// Error shown on the current step
    pub fn error(&self) -> Option<&str> {
        match &self.state {
            DeviceAuthState::Form { error } | DeviceAuthState::Code { error, .. } => {
                error.as_deref()
            }
            _ => None,
        }
    }

    /// Submit the form and start device authorization (form → code).
    /// On failure the flow stays on the form with the error recorded.
    pub async fn submit(&mut self, form: SessionForm) -> Result<DeviceAuthSession, FlowError> {
        if !matches!(self.state, DeviceAuthState::Form { .. }) {
            return Err(self.invalid("submit the form"));
        }

        if let Err(msg) = form.validate() {
            self.state = DeviceAuthState::Form {
                error: Some(msg.clone()),
            };
            return Err(FlowError::Validation(msg));
        }

        let request = StartDeviceAuthRequest {
            start_url: form.start_url.clone(),
            region: form.region.clone(),
        };

        match self.api.start_device_auth(&request).await {
            Ok(device) => {
                tracing::debug!(
                    "Device authorization started for '{}' (user code {})",
                    form.session_name,
                    device.user_code
                );
                self.state = DeviceAuthState::Code {
                    form,
                    device: device.clone(),
                    error: None,
                };
                Ok(device)
            }
            Err(e) => {
                tracing::warn!("Failed to start device authorization: {}", e);
                self.state = DeviceAuthState::Form {
                    error: Some(e.user_message()),
                };
                Err(FlowError::Api(e))
            }
        }
    }

    /// The user declares the browser login done (code → polling → …).
    /// Issues exactly one completion request with the retained device data.
    pub async fn complete(&mut self) -> Result<CompletionOutcome, FlowError> {
        let (form, device) = match &self.state {
            DeviceAuthState::Code { form, device, .. } => (form.clone(), device.clone()),
            _ => return Err(self.invalid("complete the login")),
        };

        let request = CompleteDeviceAuthRequest {
            session_name: form.session_name.clone(),
            start_url: form.start_url.clone(),
            region: form.region.clone(),
            device_code: device.device_code.clone(),
            client_id: device.client_id.clone(),
            client_secret: device.client_secret.clone(),
        };

        let result = {
            let _polling = PollingGuard::enter(&mut self.state, &form, &device);
            self.api.complete_device_auth(&request).await
        };

        match result {
            Ok(session) => {
                tracing::info!("SSO session '{}' authenticated", session.name);
                if let Some(hook) = self.on_success.as_mut() {
                    hook(&session);
                }
                self.state = DeviceAuthState::Succeeded {
                    session: session.clone(),
                };
                Ok(CompletionOutcome::Completed(session))
            }
            Err(e) if e.is_login_required() => {
                let message = e.user_message();
                tracing::debug!("Browser login not finished yet: {}", message);
                self.state = DeviceAuthState::Code {
                    form,
                    device,
                    error: Some(message.clone()),
                };
                Ok(CompletionOutcome::LoginPending(message))
            }
            Err(e) => {
                tracing::warn!("Device authorization completion failed: {}", e);
                self.state = DeviceAuthState::Code {
                    form,
                    device,
                    error: Some(e.user_message()),
                };
                Ok(CompletionOutcome::Failed(e))
            }
        }
    }

    /// Close the dialog. The device data is discarded; a new dialog needs a new flow.
    pub fn close(self) -> Option<SsoSession> {
        match self.state {
            DeviceAuthState::Succeeded { session } => Some(session),
            _ => None,
        }
    }

    fn invalid(&self, action: &'static str) -> FlowError {
        FlowError::InvalidTransition {
            action,
            state: self.state.name(),
        }
    }
}

/// Holds the flow in `Polling` for the duration of the completion request.
/// Dropping it puts the flow back at the code step, so a cancelled request
/// leaves the attempt usable with the same device data.
struct PollingGuard<'a> {
    state: &'a mut DeviceAuthState,
}

impl<'a> PollingGuard<'a> {
    fn enter(
        state: &'a mut DeviceAuthState,
        form: &SessionForm,
        device: &DeviceAuthSession,
    ) -> Self {
        *state = DeviceAuthState::Polling {
            form: form.clone(),
            device: device.clone(),
        };
        Self { state }
    }
}

impl Drop for PollingGuard<'_> {
    fn drop(&mut self) {
        let restored = match &*self.state {
            DeviceAuthState::Polling { form, device } => DeviceAuthState::Code {
                form: form.clone(),
                device: device.clone(),
                error: None,
            },
            _ => return,
        };
        *self.state = restored;
    }
}
