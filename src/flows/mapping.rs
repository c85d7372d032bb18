use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use std::collections::HashMap;
use std::sync::Arc;

use super::FlowError;
use crate::client::SsoApi;
use crate::models::{ContextMapping, KubeContext, UpsertContextMappingRequest};

/// The account role a context is about to be mapped to
#[derive(Debug, Clone, PartialEq)]
pub struct MappingTarget {
    pub session_name: String,
    pub account_id: String,
    pub account_name: Option<String>,
    pub role_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappingStatus {
    Unmapped,
    /// Already bound to exactly this session/account/role
    MappedToTarget,
    /// Bound to something else; confirming will overwrite it
    MappedElsewhere(ContextMapping),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextCandidate {
    pub context: KubeContext,
    pub status: MappingStatus,
    pub score: i64,
}

/// Searchable list of known contexts cross-referenced with existing mappings
pub struct ContextPicker {
    api: Arc<dyn SsoApi>,
    target: MappingTarget,
    contexts: Vec<KubeContext>,
    mappings: HashMap<String, ContextMapping>,
    matcher: SkimMatcherV2,
}

impl ContextPicker {
    pub fn new(
        api: Arc<dyn SsoApi>,
        target: MappingTarget,
        contexts: Vec<KubeContext>,
        mappings: Vec<ContextMapping>,
    ) -> Self {
        Self {
            api,
            target,
            contexts,
            mappings: mappings
                .into_iter()
                .map(|m| (m.context_name.clone(), m))
                .collect(),
            matcher: SkimMatcherV2::default().ignore_case(),
        }
    }

    /// Fetch the context feed and the current mappings
    pub async fn load(api: Arc<dyn SsoApi>, target: MappingTarget) -> Result<Self, FlowError> {
        let contexts = api.list_contexts().await?;
        let mappings = api.list_mappings().await?;
        Ok(Self::new(api, target, contexts, mappings))
    }

    pub fn target(&self) -> &MappingTarget {
        &self.target
    }

    fn status_of(&self, context_name: &str) -> MappingStatus {
        match self.mappings.get(context_name) {
            None => MappingStatus::Unmapped,
            Some(m)
                if m.targets(
                    &self.target.session_name,
                    &self.target.account_id,
                    &self.target.role_name,
                ) =>
            {
                MappingStatus::MappedToTarget
            }
            Some(m) => MappingStatus::MappedElsewhere(m.clone()),
        }
    }

    /// Contexts matching the query on name or cluster, best match first.
    /// An empty query returns every context in name order.
    pub fn search(&self, query: &str) -> Vec<ContextCandidate> {
        let query = query.trim();

        let mut candidates: Vec<ContextCandidate> = self
            .contexts
            .iter()
            .filter_map(|context| {
                let score = if query.is_empty() {
                    0
                } else {
                    let by_name = self.matcher.fuzzy_match(&context.name, query);
                    let by_cluster = self.matcher.fuzzy_match(&context.cluster, query);
                    by_name.max(by_cluster)?
                };
                Some(ContextCandidate {
                    context: context.clone(),
                    status: self.status_of(&context.name),
                    score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.context.name.cmp(&b.context.name))
        });
        candidates
    }

    /// Map the context to the target with a single upsert. Local state is not
    /// touched; callers refetch mappings afterwards.
    pub async fn confirm(&self, context_name: &str) -> Result<ContextMapping, FlowError> {
        let context = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .ok_or_else(|| FlowError::Validation(format!("Unknown context: {}", context_name)))?;

        if let MappingStatus::MappedElsewhere(previous) = self.status_of(context_name) {
            tracing::warn!(
                "Context '{}' is mapped to {}/{}; overwriting",
                context_name,
                previous.account_id,
                previous.role_name
            );
        }

        let request = UpsertContextMappingRequest {
            context_name: context.name.clone(),
            cluster_name: context.cluster.clone(),
            session_name: self.target.session_name.clone(),
            account_id: self.target.account_id.clone(),
            account_name: self.target.account_name.clone(),
            role_name: self.target.role_name.clone(),
        };

        let mapping = self.api.upsert_mapping(&request).await?;
        tracing::info!(
            "Mapped context '{}' to {}/{}",
            mapping.context_name,
            mapping.account_id,
            mapping.role_name
        );
        Ok(mapping)
    }
}
