//! Lookup of stage capabilities by stage name.

use std::collections::HashMap;
use std::sync::Arc;

use super::StageCapability;
use crate::core::StageName;
use crate::errors::{CraftflowError, Result};

/// The capabilities a coordinator can invoke.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    capabilities: HashMap<StageName, Arc<dyn StageCapability>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability under the stage it declares, replacing any
    /// previous one.
    pub fn register(&mut self, capability: Arc<dyn StageCapability>) {
        self.capabilities.insert(capability.stage(), capability);
    }

    /// Registers a capability, builder style.
    #[must_use]
    pub fn with(mut self, capability: Arc<dyn StageCapability>) -> Self {
        self.register(capability);
        self
    }

    /// Returns the capability for a stage.
    pub fn get(&self, stage: StageName) -> Result<Arc<dyn StageCapability>> {
        self.capabilities
            .get(&stage)
            .cloned()
            .ok_or(CraftflowError::MissingStage(stage))
    }

    /// Returns true if a capability is registered for the stage.
    #[must_use]
    pub fn contains(&self, stage: StageName) -> bool {
        self.capabilities.contains_key(&stage)
    }

    /// Fails with the first stage, in pipeline order, that has no capability.
    pub fn ensure_complete(&self) -> Result<()> {
        match StageName::ALL.into_iter().find(|stage| !self.contains(*stage)) {
            Some(missing) => Err(CraftflowError::MissingStage(missing)),
            None => Ok(()),
        }
    }

    /// Returns the number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
