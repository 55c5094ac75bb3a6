//! Scripted stage capabilities for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::StageName;
use crate::errors::StageError;
use crate::stages::{StageCapability, StageResponse};

/// A capability that replays a script of responses.
///
/// Responses are consumed in order and the last one repeats, so
/// `ScriptedStage::new(stage).then_err(e)` fails on every call and
/// `.then_err(e).then_ok(v)` fails once, then succeeds.
#[derive(Debug)]
pub struct ScriptedStage {
    stage: StageName,
    script: Mutex<VecDeque<Result<Value, StageError>>>,
    inputs: Mutex<Vec<Value>>,
}

impl ScriptedStage {
    /// Creates a stage with an empty script.
    #[must_use]
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            script: Mutex::new(VecDeque::new()),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Creates a stage that always returns the output.
    #[must_use]
    pub fn always(stage: StageName, output: Value) -> Self {
        Self::new(stage).then_ok(output)
    }

    /// Appends a successful response.
    #[must_use]
    pub fn then_ok(mut self, output: Value) -> Self {
        self.script.get_mut().push_back(Ok(output));
        self
    }

    /// Appends a failed response.
    #[must_use]
    pub fn then_err(mut self, error: StageError) -> Self {
        self.script.get_mut().push_back(Err(error));
        self
    }

    /// Returns the number of times the stage was invoked.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Returns every input received, in order.
    #[must_use]
    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().clone()
    }

    /// Returns the most recent input.
    #[must_use]
    pub fn last_input(&self) -> Option<Value> {
        self.inputs.lock().last().cloned()
    }

    fn next_response(&self) -> Result<Value, StageError> {
        let mut script = self.script.lock();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| Err(StageError::Unhandled("no scripted response".into())))
    }
}

#[async_trait]
impl StageCapability for ScriptedStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn execute(&self, input: Value) -> Result<StageResponse, StageError> {
        self.inputs.lock().push(input);
        self.next_response().map(StageResponse::new)
    }
}

/// A capability that panics when invoked.
#[derive(Debug)]
pub struct PanickingStage {
    stage: StageName,
    message: String,
}

impl PanickingStage {
    /// Creates a new panicking stage.
    #[must_use]
    pub fn new(stage: StageName, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[async_trait]
impl StageCapability for PanickingStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn execute(&self, _input: Value) -> Result<StageResponse, StageError> {
        panic!("{}", self.message)
    }
}

/// A capability that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowStage {
    stage: StageName,
    delay: Duration,
    output: Value,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub const fn new(stage: StageName, delay: Duration, output: Value) -> Self {
        Self {
            stage,
            delay,
            output,
        }
    }
}

#[async_trait]
impl StageCapability for SlowStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn execute(&self, _input: Value) -> Result<StageResponse, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(StageResponse::new(self.output.clone()))
    }
}
