//! Run coordination.
//!
//! This module provides:
//! - The stage executor, which turns one capability call into one record
//! - The coordinator state machine and its fan-out steps
//! - The build recovery cycle
//! - The supervisor that runs coordinators in the background

mod coordinator;
mod executor;
mod recovery;
mod supervisor;


pub use coordinator::{PipelineCoordinator, RunReport};
pub use executor::{StageExecutor, StageOutcome};
pub use recovery::{attempt_recovery, RecoveryPlan};
pub use supervisor::{RunSnapshot, RunSupervisor};

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
