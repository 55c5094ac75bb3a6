//! Identifiers for the fixed set of generation stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One named unit of work in the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Turns the free-text request into a structured specification.
    RequirementInterpreter,
    /// Selects the system architecture.
    SystemArchitect,
    /// Produces the OpenAPI document.
    ApiDesigner,
    /// Produces the SQL migration and ER diagram.
    DbDesigner,
    /// Generates backend sources.
    BackendGenerator,
    /// Generates frontend sources.
    FrontendGenerator,
    /// Generates container and compose configuration.
    InfraEngineer,
    /// Builds the generated project.
    Builder,
    /// Deploys the built project.
    Deployer,
    /// Runs smoke tests against the deployment.
    QaAgent,
    /// Diagnoses build failures.
    RecoveryAgent,
}

impl StageName {
    /// Every stage in pipeline order, recovery last.
    pub const ALL: [Self; 11] = [
        Self::RequirementInterpreter,
        Self::SystemArchitect,
        Self::ApiDesigner,
        Self::DbDesigner,
        Self::BackendGenerator,
        Self::FrontendGenerator,
        Self::InfraEngineer,
        Self::Builder,
        Self::Deployer,
        Self::QaAgent,
        Self::RecoveryAgent,
    ];

    /// Returns the wire name of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RequirementInterpreter => "requirement_interpreter",
            Self::SystemArchitect => "system_architect",
            Self::ApiDesigner => "api_designer",
            Self::DbDesigner => "db_designer",
            Self::BackendGenerator => "backend_generator",
            Self::FrontendGenerator => "frontend_generator",
            Self::InfraEngineer => "infra_engineer",
            Self::Builder => "builder",
            Self::Deployer => "deployer",
            Self::QaAgent => "qa_agent",
            Self::RecoveryAgent => "recovery_agent",
        }
    }

    /// Human-readable label used in failure messages.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RequirementInterpreter => "interpret requirements",
            Self::SystemArchitect => "design architecture",
            Self::ApiDesigner => "design API",
            Self::DbDesigner => "design data schema",
            Self::BackendGenerator => "generate backend",
            Self::FrontendGenerator => "generate frontend",
            Self::InfraEngineer => "generate infrastructure config",
            Self::Builder => "build",
            Self::Deployer => "deploy",
            Self::QaAgent => "QA smoke test",
            Self::RecoveryAgent => "diagnose build failure",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown stage name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown stage: {0}")]
pub struct UnknownStageError(pub String);

impl FromStr for StageName {
    type Err = UnknownStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStageError(s.to_string()))
    }
}
