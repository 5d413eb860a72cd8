//! Persistence collaborators, expressed as traits only (spec §1 Non-goals:
//! "no bundled storage backend"). The playground orchestrator and the
//! deployment resolver depend on these rather than on any concrete
//! database, so a caller can back them with whatever store it already runs.

use async_trait::async_trait;

use crate::{
    domain::{AgentInput, Deployment, Experiment, ModelData, Tool, Version},
    error::Result,
};

#[async_trait]
pub trait VersionRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Version>>;
    /// Store `version` if an entry with the same id doesn't already exist
    /// (spec §3: versions are content-addressed, so this is always an
    /// upsert-by-id rather than an overwrite).
    async fn put_if_absent(&self, version: Version) -> Result<()>;
}

#[async_trait]
pub trait AgentInputRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<AgentInput>>;
    async fn put_if_absent(&self, input: AgentInput) -> Result<()>;
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>>;
    async fn put(&self, deployment: Deployment) -> Result<()>;
}

#[async_trait]
pub trait ExperimentRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Experiment>>;
    async fn put(&self, experiment: Experiment) -> Result<()>;
}

/// Read-only lookup of catalog entries by model id, keyed the same way as
/// [`crate::pipeline::ModelCatalog`] but async, for repository-backed
/// catalogs (spec §4.5 step 1 needs to list every configured model, which a
/// static in-memory [`crate::pipeline::ModelCatalog`] cannot answer).
#[async_trait]
pub trait ModelRepository: Send + Sync {
    async fn get(&self, model_id: &str) -> Result<Option<ModelData>>;
    /// Every model a given provider is configured to serve, used by the
    /// playground's model-selection UI surface (spec §4.5 step 1).
    async fn list(&self) -> Result<Vec<ModelData>>;
}

/// Resolves a `Version.enabled_tools` name list into full tool definitions
/// (schemas included) at call time, so `Version` itself only ever stores
/// names and stays a small, stable content-hash input.
pub trait ToolCatalog: Send + Sync {
    fn get(&self, name: &str) -> Option<Tool>;
}

/// Resolves a `completion_query` (spec §4.5 step 1) against whatever
/// completions store the caller runs. Out of scope here is the query
/// language itself; this trait only needs to hand back the distinct
/// `(variables, messages)` pairs the query selected, already materialised
/// as inputs.
#[async_trait]
pub trait CompletionQueryStore: Send + Sync {
    async fn query(&self, query: &str) -> Result<Vec<AgentInput>>;
}
