// Data models for the Bridge API and the AWS wire formats

pub mod aws;
pub mod sso;

pub use sso::{
    Account, CompleteDeviceAuthRequest, ContextMapping, CreateSessionRequest, DeviceAuthSession,
    DeviceAuthStatus, DeviceStatusQuery, KubeContext, RoleCredentials, SsoSession,
    StartDeviceAuthRequest, UpsertContextMappingRequest,
};
