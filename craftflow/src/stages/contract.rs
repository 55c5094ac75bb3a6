//! Declarative shape contracts for stage inputs and outputs.

use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use tracing::warn;

use crate::core::StageName;

/// The JSON shape a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Any value, including null.
    Any,
    /// A string.
    String,
    /// A string with at least one non-whitespace character.
    NonEmptyString,
    /// An array.
    Array,
    /// An object.
    Object,
    /// An object with at least one key.
    NonEmptyObject,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::NonEmptyString => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::NonEmptyObject => value.as_object().is_some_and(|o| !o.is_empty()),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any value"),
            Self::String => write!(f, "a string"),
            Self::NonEmptyString => write!(f, "a non-empty string"),
            Self::Array => write!(f, "an array"),
            Self::Object => write!(f, "an object"),
            Self::NonEmptyObject => write!(f, "a non-empty object"),
        }
    }
}

/// A constraint on one top-level field.
#[derive(Debug, Clone)]
pub struct FieldRule {
    field: String,
    kind: FieldKind,
    required: bool,
    pattern: Option<Regex>,
}

impl FieldRule {
    /// Creates a rule for a field that must be present.
    #[must_use]
    pub fn required(field: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            field: field.into(),
            kind,
            required: true,
            pattern: None,
        }
    }

    /// Creates a rule that applies only when the field is present.
    #[must_use]
    pub fn optional(field: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            required: false,
            ..Self::required(field, kind)
        }
    }

    /// Requires string values to match a pattern.
    #[must_use]
    pub fn matching(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Returns the field name.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns whether the field must be present.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    fn check(&self, payload: &serde_json::Map<String, Value>) -> Option<String> {
        let Some(value) = payload.get(&self.field) else {
            return self
                .required
                .then(|| format!("missing required field '{}'", self.field));
        };
        if !self.kind.accepts(value) {
            return Some(format!("field '{}' must be {}", self.field, self.kind));
        }
        match (&self.pattern, value.as_str()) {
            (Some(pattern), Some(text)) if !pattern.is_match(text) => Some(format!(
                "field '{}' does not match /{}/",
                self.field,
                pattern.as_str()
            )),
            _ => None,
        }
    }
}

/// A list of field rules applied to a JSON object payload.
#[derive(Debug, Clone, Default)]
pub struct StageContract {
    rules: Vec<FieldRule>,
}

impl StageContract {
    /// Creates a contract that accepts any object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Adds a required field.
    #[must_use]
    pub fn require(self, field: &str, kind: FieldKind) -> Self {
        self.with_rule(FieldRule::required(field, kind))
    }

    /// Returns the rules.
    #[must_use]
    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Checks a payload, returning every violation joined into one message.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        let Some(object) = payload.as_object() else {
            return Err("payload must be a JSON object".to_string());
        };
        let violations: Vec<String> = self.rules.iter().filter_map(|r| r.check(object)).collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations.join("; "))
        }
    }

    /// Returns the default input contract of a stage.
    #[must_use]
    pub fn input_for(stage: StageName) -> Self {
        let contract = Self::new();
        match stage {
            StageName::RequirementInterpreter => {
                contract.require("raw_text", FieldKind::NonEmptyString)
            }
            StageName::SystemArchitect | StageName::ApiDesigner => {
                contract.require("project_spec", FieldKind::Object)
            }
            StageName::DbDesigner => contract.require("entities", FieldKind::Array),
            StageName::BackendGenerator => contract
                .require("openapi_yaml", FieldKind::String)
                .require("sql_migration", FieldKind::String),
            StageName::FrontendGenerator => contract.require("openapi_yaml", FieldKind::String),
            StageName::InfraEngineer => contract.require("services", FieldKind::Array),
            StageName::Builder => contract.require("repo_path", FieldKind::NonEmptyString),
            StageName::Deployer => contract
                .require("artifacts", FieldKind::Array)
                .require("target", FieldKind::String),
            StageName::QaAgent => contract.require("endpoints", FieldKind::Object),
            StageName::RecoveryAgent => contract.require("logs", FieldKind::String),
        }
    }

    /// Returns the default output contract of a stage.
    #[must_use]
    pub fn output_for(stage: StageName) -> Self {
        let contract = Self::new();
        match stage {
            StageName::RequirementInterpreter => {
                contract
                    .require("title", FieldKind::String)
                    .require("features", FieldKind::Array)
            }
            StageName::SystemArchitect => contract
                .require("selected_architecture", FieldKind::Any)
                .require("diagram_mermaid", FieldKind::String),
            StageName::ApiDesigner => {
                let rule = FieldRule::required("openapi_yaml", FieldKind::String);
                let rule = match openapi_header() {
                    Some(header) => rule.matching(header.clone()),
                    None => rule,
                };
                contract.with_rule(rule)
            }
            StageName::DbDesigner => contract
                .require("sql_migration", FieldKind::String)
                .require("er_mermaid", FieldKind::String),
            StageName::BackendGenerator => contract.require("files", FieldKind::NonEmptyObject),
            StageName::FrontendGenerator => contract
                .require("files", FieldKind::Object)
                .require("pages", FieldKind::Any),
            StageName::InfraEngineer => contract.require("docker_compose", FieldKind::String),
            StageName::Builder => contract
                .require("status", FieldKind::String)
                .require("logs", FieldKind::String),
            StageName::Deployer => contract
                .require("status", FieldKind::String)
                .require("endpoints", FieldKind::Object),
            StageName::QaAgent => contract.require("smoke_test_results", FieldKind::Array),
            StageName::RecoveryAgent => contract
                .require("diagnosis", FieldKind::NonEmptyObject)
                .require("fixes", FieldKind::Array),
        }
    }
}

/// The compiled `openapi:` header check, or `None` if it failed to compile.
fn openapi_header() -> Option<&'static Regex> {
    static OPENAPI_HEADER: OnceLock<Option<Regex>> = OnceLock::new();
    OPENAPI_HEADER
        .get_or_init(|| match Regex::new(r"(?m)^openapi:") {
            Ok(header) => Some(header),
            Err(e) => {
                warn!(error = %e, "OpenAPI header pattern disabled");
                None
            }
        })
        .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_valid_payload() {
        let contract = StageContract::output_for(StageName::RequirementInterpreter);
        assert!(contract
            .validate(&json!({"title": "Todo", "features": [], "extra": 1}))
            .is_ok());
    }

    #[test]
    fn test_reports_every_violation() {
        let contract = StageContract::output_for(StageName::DbDesigner);
        let err = contract.validate(&json!({"sql_migration": 42})).unwrap_err();
        assert_eq!(
            err,
            "field 'sql_migration' must be a string; missing required field 'er_mermaid'"
        );
    }

    #[test]
    fn test_rejects_non_object() {
        let contract = StageContract::new();
        assert!(contract.validate(&json!("text")).is_err());
        assert!(contract.validate(&json!({})).is_ok());
    }

    #[test]
    fn test_non_empty_kinds() {
        let input = StageContract::input_for(StageName::RequirementInterpreter);
        assert!(input.validate(&json!({"raw_text": "   "})).is_err());
        assert!(input.validate(&json!({"raw_text": "A blog"})).is_ok());

        let recovery = StageContract::output_for(StageName::RecoveryAgent);
        assert!(recovery.validate(&json!({"diagnosis": {}, "fixes": []})).is_err());
        assert!(recovery
            .validate(&json!({"diagnosis": {"root_cause": "missing dependency"}, "fixes": []}))
            .is_ok());
    }

    #[test]
    fn test_openapi_pattern() {
        let contract = StageContract::output_for(StageName::ApiDesigner);
        assert!(contract
            .validate(&json!({"openapi_yaml": "openapi: 3.0.0\ninfo:\n  title: x"}))
            .is_ok());
        let err = contract
            .validate(&json!({"openapi_yaml": "swagger: 2.0"}))
            .unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[test]
    fn test_openapi_header_is_compiled_once() {
        let first = openapi_header().unwrap();
        let second = openapi_header().unwrap();
        assert!(std::ptr::eq(first, second));

        let contract = StageContract::output_for(StageName::ApiDesigner);
        assert!(contract.validate(&json!({"openapi_yaml": "swagger: 2.0"})).is_err());
    }

    #[test]
    fn test_optional_rule_only_checks_when_present() {
        let contract = StageContract::new().with_rule(FieldRule::optional("patches", FieldKind::Array));
        assert!(contract.validate(&json!({})).is_ok());
        assert!(contract.validate(&json!({"patches": "x"})).is_err());
        assert!(!contract.rules()[0].is_required());
        assert_eq!(contract.rules()[0].field(), "patches");
    }

    #[test]
    fn test_every_stage_has_contracts() {
        for stage in StageName::ALL {
            assert!(!StageContract::input_for(stage).rules().is_empty(), "{stage}");
            assert!(!StageContract::output_for(stage).rules().is_empty(), "{stage}");
        }
    }
}
