//! Canned stage outputs for pipeline tests.

use serde_json::{json, Value};
use std::sync::Arc;

use super::ScriptedStage;
use crate::core::StageName;
use crate::stages::StageRegistry;

/// Returns an output that satisfies the stage's output contract.
#[must_use]
pub fn output_for(stage: StageName) -> Value {
    match stage {
        StageName::RequirementInterpreter => json!({
            "title": "Todo App",
            "features": ["create todos", "list todos"],
            "entities": [{"name": "Todo", "fields": ["id", "title", "done"]}],
        }),
        StageName::SystemArchitect => json!({
            "selected_architecture": {"name": "monolith", "backend": "fastapi"},
            "diagram_mermaid": "graph TD; web-->api; api-->db",
        }),
        StageName::ApiDesigner => json!({
            "openapi_yaml": "openapi: 3.0.0\ninfo:\n  title: Todo API\n",
        }),
        StageName::DbDesigner => json!({
            "sql_migration": "CREATE TABLE todos (id SERIAL PRIMARY KEY);",
            "er_mermaid": "erDiagram\n  TODO {}",
        }),
        StageName::BackendGenerator => json!({
            "files": {
                "app/main.py": "from fastapi import FastAPI",
                "requirements.txt": "fastapi",
            },
        }),
        StageName::FrontendGenerator => json!({
            "files": {"src/App.tsx": "export default function App() {}"},
            "pages": ["/"],
        }),
        StageName::InfraEngineer => json!({
            "docker_compose": "services:\n  backend: {}\n",
        }),
        StageName::Builder => json!({
            "status": "success",
            "logs": "build ok",
            "artifacts": ["backend:latest", "frontend:latest"],
        }),
        StageName::Deployer => json!({
            "status": "deployed",
            "endpoints": {
                "backend": "http://localhost:8000",
                "frontend": "http://localhost:3000",
            },
        }),
        StageName::QaAgent => json!({
            "smoke_test_results": [{"endpoint": "/health", "passed": true}],
        }),
        StageName::RecoveryAgent => json!({
            "diagnosis": {"root_cause": "missing dependency"},
            "fixes": [{"file": "requirements.txt", "patch": "+uvicorn"}],
        }),
    }
}

/// Returns a builder output that reports a failed build.
#[must_use]
pub fn failed_build(logs: &str) -> Value {
    json!({"status": "failed", "logs": logs})
}

/// Returns a registry where every stage succeeds with [`output_for`].
#[must_use]
pub fn scripted_registry() -> StageRegistry {
    StageName::ALL
        .into_iter()
        .fold(StageRegistry::new(), |registry, stage| {
            registry.with(Arc::new(ScriptedStage::always(stage, output_for(stage))))
        })
}
