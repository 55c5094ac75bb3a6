//! Testing utilities for craftflow pipelines.
//!
//! This module provides:
//! - Scripted, panicking and slow stage capabilities
//! - Contract-satisfying outputs for every stage

pub mod fixtures;
mod mocks;

pub use fixtures::{failed_build, output_for, scripted_registry};
pub use mocks::{PanickingStage, ScriptedStage, SlowStage};
