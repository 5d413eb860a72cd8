//! Deployment resolver (spec §4.6): pins a `Version` behind a stable,
//! caller-provided identifier. `upsert` either creates the deployment or
//! hands back a confirmation URL for an update; `resolve` returns the
//! pinned version with caller overrides validated against it; `archive`
//! hides a deployment from listings without deleting it.

use chrono::Utc;
use serde_json::Value;

use crate::{
    domain::{Deployment, Version},
    error::{GatewayError, Result},
    repository::{DeploymentRepository, VersionRepository},
    schema,
};

/// Result of [`DeploymentResolver::upsert`]: either the deployment was
/// created outright, or one already exists and the caller must confirm the
/// update via the returned URL (spec §4.6: "otherwise return a confirmation
/// URL -- the caller (a web UI) confirms the update via a PATCH").
pub enum UpsertOutcome {
    Created(Deployment),
    ConfirmationRequired { confirm_url: String },
}

/// Caller-supplied values applied on top of a deployment's pinned `Version`
/// at resolve time (spec §4.6 `resolve`).
#[derive(Debug, Default, Clone)]
pub struct RuntimeOverrides {
    pub variables: Option<Value>,
    pub output_schema: Option<Value>,
}

pub struct DeploymentResolver<'a> {
    pub deployments: &'a dyn DeploymentRepository,
    pub versions: &'a dyn VersionRepository,
}

impl<'a> DeploymentResolver<'a> {
    pub fn new(deployments: &'a dyn DeploymentRepository, versions: &'a dyn VersionRepository) -> Self {
        Self { deployments, versions }
    }

    pub async fn upsert(&self, agent_id: &str, version_id: &str, deployment_id: &str, author: &str) -> Result<UpsertOutcome> {
        let version = self
            .versions
            .get(version_id)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("version '{version_id}' does not exist")))?;

        match self.deployments.get(deployment_id).await? {
            None => {
                let now = Utc::now();
                let deployment = Deployment {
                    id: deployment_id.to_string(),
                    agent_id: agent_id.to_string(),
                    version,
                    metadata: Value::Null,
                    created_by: author.to_string(),
                    created_at: now,
                    updated_at: now,
                    archived_at: None,
                };
                self.deployments.put(deployment.clone()).await?;
                Ok(UpsertOutcome::Created(deployment))
            }
            Some(existing) => {
                check_update_compatibility(&existing.version, &version)?;
                Ok(UpsertOutcome::ConfirmationRequired { confirm_url: format!("/v1/deployments/{deployment_id}") })
            }
        }
    }

    /// Apply a confirmed update (the PATCH the `confirm_url` from `upsert`
    /// points at). Re-runs the same compatibility check so a caller can't
    /// bypass it by going straight to this method.
    pub async fn confirm_update(&self, deployment_id: &str, version_id: &str) -> Result<Deployment> {
        let version = self
            .versions
            .get(version_id)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("version '{version_id}' does not exist")))?;

        let mut existing = self
            .deployments
            .get(deployment_id)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("deployment '{deployment_id}' does not exist")))?;

        check_update_compatibility(&existing.version, &version)?;

        existing.version = version;
        existing.updated_at = Utc::now();
        self.deployments.put(existing.clone()).await?;
        Ok(existing)
    }

    pub async fn resolve(&self, deployment_id: &str, overrides: RuntimeOverrides) -> Result<Version> {
        self.resolve_with_agent(deployment_id, overrides).await.map(|(_, version)| version)
    }

    /// Same as [`Self::resolve`] but also hands back the deployment's
    /// `agent_id`, needed by callers (the service facade) that route a
    /// completion under the deployment's agent namespace rather than one
    /// the caller supplied directly.
    pub async fn resolve_with_agent(&self, deployment_id: &str, overrides: RuntimeOverrides) -> Result<(String, Version)> {
        let deployment = self
            .deployments
            .get(deployment_id)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("deployment '{deployment_id}' does not exist")))?;

        let agent_id = deployment.agent_id.clone();
        let mut version = deployment.version;

        if let Some(variables) = &overrides.variables {
            match &version.input_variables_schema {
                Some(schema) => schema::validate(variables, schema).map_err(GatewayError::BadRequest)?,
                None => {
                    return Err(GatewayError::BadRequest(
                        "Input variables are provided but the version does not support them".into(),
                    ));
                }
            }
        }

        if let Some(output_schema) = overrides.output_schema {
            if !schema::schemas_structurally_compatible(version.output_schema.as_ref(), Some(&output_schema)) {
                return Err(GatewayError::BadRequest(
                    "runtime output schema is not structurally compatible with the deployment's pinned schema".into(),
                ));
            }
            version.output_schema = Some(output_schema);
        }

        Ok((agent_id, version))
    }

    pub async fn archive(&self, deployment_id: &str) -> Result<Deployment> {
        let mut deployment = self
            .deployments
            .get(deployment_id)
            .await?
            .ok_or_else(|| GatewayError::BadRequest(format!("deployment '{deployment_id}' does not exist")))?;

        deployment.archived_at = Some(Utc::now());
        deployment.updated_at = Utc::now();
        self.deployments.put(deployment.clone()).await?;
        Ok(deployment)
    }
}

/// Spec §4.6 / §8 property 9: an update is rejected when the new version's
/// `input_variables_schema` or `output_schema` is structurally incompatible
/// with the existing deployment's -- either side having the schema while
/// the other doesn't counts as incompatible, as does differing object
/// shape.
fn check_update_compatibility(existing: &Version, incoming: &Version) -> Result<()> {
    if !schema::schemas_structurally_compatible(existing.input_variables_schema.as_ref(), incoming.input_variables_schema.as_ref()) {
        return Err(GatewayError::BadRequest(
            "new version's input_variables_schema is not structurally compatible with the existing deployment's".into(),
        ));
    }
    if !schema::schemas_structurally_compatible(existing.output_schema.as_ref(), incoming.output_schema.as_ref()) {
        return Err(GatewayError::BadRequest(
            "new version's output_schema is not structurally compatible with the existing deployment's".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::Mutex, sync::Arc};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::domain::message::{Message, Role};

    #[derive(Default)]
    struct FakeVersions(Mutex<Vec<Version>>);

    #[async_trait]
    impl VersionRepository for FakeVersions {
        async fn get(&self, id: &str) -> Result<Option<Version>> {
            Ok(self.0.lock().unwrap().iter().find(|v| v.id == id).cloned())
        }
        async fn put_if_absent(&self, version: Version) -> Result<()> {
            let mut guard = self.0.lock().unwrap();
            if !guard.iter().any(|v| v.id == version.id) {
                guard.push(version);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDeployments(Mutex<Option<Deployment>>);

    #[async_trait]
    impl DeploymentRepository for FakeDeployments {
        async fn get(&self, agent_id: &str) -> Result<Option<Deployment>> {
            Ok(self.0.lock().unwrap().clone().filter(|d| d.id == agent_id))
        }
        async fn put(&self, deployment: Deployment) -> Result<()> {
            *self.0.lock().unwrap() = Some(deployment);
            Ok(())
        }
    }

    fn version_with_schema(schema: Option<Value>) -> Version {
        Version {
            id: String::new(),
            model: "gpt-4.1".into(),
            provider: None,
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            parallel_tool_calls: None,
            enabled_tools: vec![],
            tool_choice: None,
            prompt: vec![Message::text(Role::System, "hi")],
            input_variables_schema: schema,
            output_schema: None,
            structured_generation: false,
            use_structured_generation: false,
            reasoning_effort: None,
            reasoning_budget: None,
            use_fallback: Default::default(),
        }
        .with_id()
    }

    #[tokio::test]
    async fn upsert_creates_when_no_deployment_exists() {
        let versions = FakeVersions::default();
        let version = version_with_schema(None);
        versions.0.lock().unwrap().push(version.clone());
        let deployments = FakeDeployments::default();

        let resolver = DeploymentResolver::new(&deployments, &versions);
        let outcome = resolver.upsert("agent", &version.id, "agent:production#1", "me").await.unwrap();

        assert!(matches!(outcome, UpsertOutcome::Created(_)));
    }

    #[tokio::test]
    async fn upsert_requires_confirmation_when_schemas_are_compatible() {
        let versions = FakeVersions::default();
        let v1 = version_with_schema(None);
        let v2 = version_with_schema(None);
        versions.0.lock().unwrap().extend([v1.clone(), v2.clone()]);
        let deployments = FakeDeployments::default();

        let resolver = DeploymentResolver::new(&deployments, &versions);
        resolver.upsert("agent", &v1.id, "d1", "me").await.unwrap();
        let outcome = resolver.upsert("agent", &v2.id, "d1", "me").await.unwrap();

        assert!(matches!(outcome, UpsertOutcome::ConfirmationRequired { .. }));
    }

    #[tokio::test]
    async fn upsert_rejects_adding_an_input_schema_that_didnt_exist_before() {
        let versions = FakeVersions::default();
        let without_schema = version_with_schema(None);
        let with_schema = version_with_schema(Some(json!({"type": "object", "properties": {"x": {"type": "string"}}})));
        versions.0.lock().unwrap().extend([without_schema.clone(), with_schema.clone()]);
        let deployments = FakeDeployments::default();

        let resolver = DeploymentResolver::new(&deployments, &versions);
        resolver.upsert("agent", &without_schema.id, "d1", "me").await.unwrap();
        let result = resolver.upsert("agent", &with_schema.id, "d1", "me").await;

        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }

    #[tokio::test]
    async fn resolve_rejects_variables_when_version_has_no_schema() {
        let versions = FakeVersions::default();
        let version = version_with_schema(None);
        versions.0.lock().unwrap().push(version.clone());
        let deployments = FakeDeployments::default();
        deployments.0.lock().unwrap().replace(Deployment {
            id: "d1".into(),
            agent_id: "agent".into(),
            version,
            metadata: Value::Null,
            created_by: "me".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived_at: None,
        });

        let resolver = DeploymentResolver::new(&deployments, &versions);
        let result = resolver.resolve("d1", RuntimeOverrides { variables: Some(json!({"name": "John"})), output_schema: None }).await;

        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }

    #[tokio::test]
    async fn archive_sets_archived_at_without_removing_the_deployment() {
        let versions = FakeVersions::default();
        let version = version_with_schema(None);
        let deployments = FakeDeployments::default();
        deployments.0.lock().unwrap().replace(Deployment {
            id: "d1".into(),
            agent_id: "agent".into(),
            version,
            metadata: Value::Null,
            created_by: "me".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            archived_at: None,
        });

        let resolver = DeploymentResolver::new(&deployments, &versions);
        let archived = resolver.archive("d1").await.unwrap();

        assert!(archived.is_archived());
        assert!(resolver.deployments.get("d1").await.unwrap().is_some());
    }
}
