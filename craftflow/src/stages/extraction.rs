//! Rules that turn stage outputs into persisted artifacts.

use serde_json::Value;
use uuid::Uuid;

use crate::core::{Artifact, StageName};

/// How one part of a stage output becomes artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRule {
    /// A single top-level field becomes one artifact.
    Field {
        /// Output field to read.
        field: &'static str,
        /// Artifact type tag.
        artifact_type: &'static str,
        /// Artifact name.
        name: &'static str,
    },
    /// An object of `path -> contents` becomes one artifact per entry.
    FileMap {
        /// Output field holding the map.
        field: &'static str,
        /// Artifact type tag.
        artifact_type: &'static str,
    },
    /// The whole output document becomes one JSON artifact.
    Document {
        /// Artifact type tag.
        artifact_type: &'static str,
        /// Artifact name.
        name: &'static str,
    },
}

impl ArtifactRule {
    /// Returns the built-in rules of a stage.
    #[must_use]
    pub fn defaults_for(stage: StageName) -> Vec<Self> {
        match stage {
            StageName::RequirementInterpreter => vec![Self::Document {
                artifact_type: "specification",
                name: "project_spec.json",
            }],
            StageName::SystemArchitect => vec![Self::Field {
                field: "diagram_mermaid",
                artifact_type: "diagram",
                name: "architecture.mmd",
            }],
            StageName::ApiDesigner => vec![Self::Field {
                field: "openapi_yaml",
                artifact_type: "openapi",
                name: "openapi.yaml",
            }],
            StageName::DbDesigner => vec![
                Self::Field {
                    field: "sql_migration",
                    artifact_type: "sql",
                    name: "migration.sql",
                },
                Self::Field {
                    field: "er_mermaid",
                    artifact_type: "diagram",
                    name: "er_diagram.mmd",
                },
            ],
            StageName::BackendGenerator | StageName::FrontendGenerator => vec![Self::FileMap {
                field: "files",
                artifact_type: "code",
            }],
            StageName::InfraEngineer => vec![Self::Field {
                field: "docker_compose",
                artifact_type: "docker",
                name: "docker-compose.yml",
            }],
            StageName::QaAgent => vec![Self::Document {
                artifact_type: "qa_report",
                name: "qa_report.json",
            }],
            StageName::Builder | StageName::Deployer | StageName::RecoveryAgent => Vec::new(),
        }
    }

    fn apply(&self, output: &Value) -> Vec<(&'static str, String, String)> {
        match self {
            Self::Field {
                field,
                artifact_type,
                name,
            } => output
                .get(*field)
                .and_then(render)
                .map(|content| vec![(*artifact_type, (*name).to_string(), content)])
                .unwrap_or_default(),
            Self::FileMap { field, artifact_type } => output
                .get(*field)
                .and_then(Value::as_object)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|(path, contents)| {
                            render(contents).map(|content| (*artifact_type, path.clone(), content))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Self::Document {
                artifact_type,
                name,
            } => serde_json::to_string_pretty(output)
                .map(|content| vec![(*artifact_type, (*name).to_string(), content)])
                .unwrap_or_default(),
        }
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => serde_json::to_string_pretty(other).ok(),
    }
}

/// Applies extraction rules to a validated stage output.
///
/// Absent or null fields produce nothing.
#[must_use]
pub fn extract_artifacts(
    rules: &[ArtifactRule],
    stage: StageName,
    run_id: Uuid,
    execution_id: Uuid,
    output: &Value,
) -> Vec<Artifact> {
    rules
        .iter()
        .flat_map(|rule| rule.apply(output))
        .map(|(artifact_type, name, content)| {
            Artifact::new(run_id, Some(execution_id), artifact_type, name, content)
                .with_metadata(serde_json::json!({ "stage": stage }))
        })
        .collect()
}
