//! Stage capabilities and their declared contracts.
//!
//! A capability is the external implementation of one stage, typically
//! backed by an LLM. The pipeline never looks inside it: it validates the
//! input and output against the declared contracts and extracts artifacts
//! with the declared rules.

mod contract;
mod extraction;
mod registry;

pub use contract::{FieldKind, FieldRule, StageContract};
pub use extraction::{extract_artifacts, ArtifactRule};
pub use registry::StageRegistry;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::core::{StageAudit, StageName};
use crate::errors::StageError;

/// A successful capability invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageResponse {
    /// Structured output.
    pub output: serde_json::Value,
    /// Audit trail of the invocation.
    pub audit: StageAudit,
}

impl StageResponse {
    /// Creates a response without audit data.
    #[must_use]
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            audit: StageAudit::default(),
        }
    }

    /// Attaches an audit trail.
    #[must_use]
    pub fn with_audit(mut self, audit: StageAudit) -> Self {
        self.audit = audit;
        self
    }
}

/// The implementation of one pipeline stage.
///
/// Implementations own their bounded internal retry of transient upstream
/// failures; callers never retry. A capability may be shared by concurrent
/// runs and must not keep per-invocation state.
#[async_trait]
pub trait StageCapability: Send + Sync + Debug {
    /// Returns the stage this capability implements.
    fn stage(&self) -> StageName;

    /// Returns the contract the input must satisfy.
    fn input_contract(&self) -> StageContract {
        StageContract::input_for(self.stage())
    }

    /// Returns the contract the output must satisfy.
    fn output_contract(&self) -> StageContract {
        StageContract::output_for(self.stage())
    }

    /// Returns how a valid output becomes artifacts.
    fn artifact_rules(&self) -> Vec<ArtifactRule> {
        ArtifactRule::defaults_for(self.stage())
    }

    /// Executes the stage.
    async fn execute(&self, input: serde_json::Value) -> Result<StageResponse, StageError>;
}

/// A capability backed by a synchronous function.
pub struct FnCapability<F>
where
    F: Fn(&serde_json::Value) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    stage: StageName,
    func: F,
}

impl<F> FnCapability<F>
where
    F: Fn(&serde_json::Value) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    /// Creates a new function-based capability.
    pub const fn new(stage: StageName, func: F) -> Self {
        Self { stage, func }
    }
}

impl<F> Debug for FnCapability<F>
where
    F: Fn(&serde_json::Value) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCapability")
            .field("stage", &self.stage)
            .finish()
    }
}

#[async_trait]
impl<F> StageCapability for FnCapability<F>
where
    F: Fn(&serde_json::Value) -> Result<serde_json::Value, StageError> + Send + Sync,
{
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn execute(&self, input: serde_json::Value) -> Result<StageResponse, StageError> {
        (self.func)(&input).map(StageResponse::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_capability() {
        let capability = FnCapability::new(StageName::Builder, |input| {
            Ok(json!({"status": "success", "logs": input["repo_path"].clone()}))
        });

        assert_eq!(capability.stage(), StageName::Builder);
        let response = capability.execute(json!({"repo_path": "/tmp/x"})).await.unwrap();
        assert_eq!(response.output["logs"], "/tmp/x");
        assert_eq!(response.audit, StageAudit::default());
    }

    #[tokio::test]
    async fn test_default_declarations_follow_stage() {
        let capability = FnCapability::new(StageName::QaAgent, |_| Err(StageError::upstream("down")));

        assert!(capability.input_contract().validate(&json!({"endpoints": {}})).is_ok());
        assert!(capability.output_contract().validate(&json!({})).is_err());
        assert_eq!(capability.artifact_rules().len(), 1);
        assert!(capability.execute(json!({})).await.is_err());
    }

    #[test]
    fn test_response_with_audit() {
        let response = StageResponse::new(json!({})).with_audit(StageAudit {
            prompt: Some("design".into()),
            response: Some("{}".into()),
            cost_units: Some(42),
        });
        assert_eq!(response.audit.cost_units, Some(42));
    }
}
