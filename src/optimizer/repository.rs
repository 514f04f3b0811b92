//! Repository lookups expressed as batched requests.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use super::{BatchFn, BatchRequest, OptimizationManager};
use crate::context::Context;
use crate::error::Result;

/// Batches per-repository lookups for one organisation on one service.
///
/// Request ids are `"{org}/{repo}"`; the payload carries `org` and `repo`
/// so a batch function can build a single multi-repository query.
pub struct RepositoryBatcher {
    manager: Arc<OptimizationManager>,
    service: String,
}

impl RepositoryBatcher {
    pub fn new(manager: Arc<OptimizationManager>, service: impl Into<String>) -> Self {
        Self {
            manager,
            service: service.into(),
        }
    }

    fn requests(org: &str, repos: &[String]) -> Vec<BatchRequest> {
        repos
            .iter()
            .map(|repo| {
                BatchRequest::new(
                    format!("{org}/{repo}"),
                    json!({ "org": org, "repo": repo }),
                )
            })
            .collect()
    }

    async fn lookup(
        &self,
        ctx: &Context,
        batch_key: &str,
        org: &str,
        repos: &[String],
        batch_fn: BatchFn,
    ) -> Result<HashMap<String, Value>> {
        let responses = self
            .manager
            .execute_batch(ctx, &self.service, batch_key, Self::requests(org, repos), batch_fn)
            .await?;

        let prefix = format!("{org}/");
        let mut found = HashMap::with_capacity(responses.len());
        for response in responses {
            let repo = response
                .id
                .strip_prefix(&prefix)
                .unwrap_or(&response.id)
                .to_string();
            match (response.data, response.error) {
                (Some(data), None) => {
                    found.insert(repo, data);
                }
                (_, Some(error)) => debug!(repo = %repo, error = %error, "repository lookup failed"),
                (None, None) => debug!(repo = %repo, "repository lookup returned nothing"),
            }
        }
        Ok(found)
    }

    /// Default branch for each repository. Repositories whose lookup failed
    /// are left out of the result.
    pub async fn default_branches(
        &self,
        ctx: &Context,
        org: &str,
        repos: &[String],
        batch_fn: BatchFn,
    ) -> Result<HashMap<String, String>> {
        let raw = self
            .lookup(ctx, &format!("{org}:default_branch"), org, repos, batch_fn)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|(repo, data)| {
                let branch = match data {
                    Value::String(branch) => Some(branch),
                    Value::Object(map) => map
                        .get("default_branch")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                };
                branch.map(|branch| (repo, branch))
            })
            .collect())
    }

    /// Raw metadata document for each repository.
    pub async fn metadata(
        &self,
        ctx: &Context,
        org: &str,
        repos: &[String],
        batch_fn: BatchFn,
    ) -> Result<HashMap<String, Value>> {
        self.lookup(ctx, &format!("{org}:metadata"), org, repos, batch_fn)
            .await
    }
}
