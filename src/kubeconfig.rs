// Kubernetes context feed read from a kubeconfig file

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::models::KubeContext;

#[derive(Debug, Deserialize)]
struct KubeConfigFile {
    #[serde(default)]
    contexts: Vec<NamedContext>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextSpec,
}

#[derive(Debug, Deserialize)]
struct ContextSpec {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

/// Load all contexts from a kubeconfig file, sorted by name.
/// A missing file yields an empty feed.
pub fn load_contexts(path: &Path) -> Result<Vec<KubeContext>> {
    if !path.exists() {
        tracing::warn!("Kubeconfig not found at {}, context feed is empty", path.display());
        return Ok(vec![]);
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read kubeconfig: {}", path.display()))?;
    parse_contexts(&raw).with_context(|| format!("Failed to parse kubeconfig: {}", path.display()))
}

pub fn parse_contexts(yaml: &str) -> Result<Vec<KubeContext>> {
    let file: KubeConfigFile = serde_yaml::from_str(yaml)?;

    let mut contexts: Vec<KubeContext> = file
        .contexts
        .into_iter()
        .map(|c| KubeContext {
            name: c.name,
            cluster: c.context.cluster,
            user: c.context.user,
            namespace: c.context.namespace,
        })
        .collect();

    contexts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(contexts)
}
