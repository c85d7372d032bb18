// Bridge SSO - Library root

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod flows;
pub mod http_client;
pub mod kubeconfig;
pub mod middleware;
pub mod models;
pub mod oidc;
pub mod routes;
pub mod store;
