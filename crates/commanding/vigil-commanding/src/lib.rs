//! # Vigil Commanding
//!
//! Post-transmission command verification.
//!
//! After a command leaves the ground, a [`CommandVerificationHandler`] decides
//! whether it actually took effect. The handler resolves the verifiers that
//! apply to the command (inherited from base meta-commands, overridden or
//! disabled per command), arms their check windows on an injected
//! [`Scheduler`], routes command-history and telemetry evidence to them, and
//! turns each verifier outcome into command-history acknowledgements and,
//! through termination actions, into the final command completion.
//!
//! ## Key Features
//!
//! - Four verifier kinds sharing one state machine: algorithm, container,
//!   match criteria and parameter value change
//! - Check windows anchored to command release or to the previous verifier,
//!   with chained successors
//! - Exactly-once terminal transitions under racing timers and evidence
//! - In-process command history, telemetry feed, mission database and a
//!   manual scheduler for simulation and tests
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vigil_commanding::{
//!     AckStatus, CheckWindow, CommandId, CommandVerificationHandler, CommandVerifier,
//!     InMemoryCommandHistory, InMemoryMissionDatabase, InMemoryTelemetryFeed, ManualScheduler,
//!     MetaCommand, PreparedCommandBuilder, Scheduler, TerminationAction, VerificationServices,
//!     VerifierKind,
//! };
//!
//! let scheduler = Arc::new(ManualScheduler::new());
//! let history = Arc::new(InMemoryCommandHistory::new());
//! let telemetry = Arc::new(InMemoryTelemetryFeed::new());
//!
//! let cmd = Arc::new(MetaCommand::new("/sc/SWITCH_ON").with_verifier(
//!     CommandVerifier::new(
//!         "Complete",
//!         VerifierKind::Container { container: "/sc/hk".to_string() },
//!         CheckWindow::immediate(Duration::from_secs(5)),
//!     )
//!     .on_success(TerminationAction::Success),
//! ));
//! let id = CommandId::new("/sc/SWITCH_ON", "ops", 1, scheduler.now());
//! history.add_command(&id);
//!
//! let services = VerificationServices::builder()
//!     .scheduler(scheduler.clone())
//!     .mission_database(Arc::new(InMemoryMissionDatabase::new()))
//!     .command_history(history.clone())
//!     .telemetry(telemetry.clone())
//!     .build()
//!     .unwrap();
//!
//! let handler = CommandVerificationHandler::new(
//!     Arc::new(PreparedCommandBuilder::new(id.clone(), cmd).build()),
//!     services,
//! );
//! handler.start().unwrap();
//!
//! scheduler.advance(Duration::from_millis(100));
//! telemetry.publish_container("/sc/hk", scheduler.now());
//!
//! assert_eq!(
//!     history.ack_statuses(&id, "Verifier_Complete"),
//!     vec![AckStatus::Pending, AckStatus::Ok]
//! );
//! assert_eq!(history.completion(&id).map(|a| a.status), Some(AckStatus::Ok));
//! ```

pub mod algorithm;
pub mod config;
pub mod criteria;
pub mod handler;
pub mod history;
pub mod mdb;
mod observability;
pub mod prepared;
pub mod scheduler;
pub mod telemetry;
pub mod types;
pub mod verifier;

pub use algorithm::{AlgorithmExecListener, AlgorithmExecutionContext, AlgorithmManager};
pub use config::{SubscriptionFailurePolicy, VerificationConfig};
pub use criteria::{Comparison, ComparisonOperator, MatchCriteria, Operand};
pub use handler::{CommandVerificationHandler, VerificationServices, VerificationServicesBuilder};
pub use history::{
    AckRecord, AckStatus, CommandHistoryConsumer, CommandHistoryPublisher,
    CommandHistorySubscriptions, InMemoryCommandHistory,
};
pub use mdb::{
    Algorithm, CheckWindow, CommandVerifier, InMemoryMissionDatabase, MetaCommand,
    MissionDatabase, TerminationAction, TimeWindowAnchor, VerifierKind, VerifierType,
};
pub use prepared::{PreparedCommand, PreparedCommandBuilder, VerifierOverride, WindowOverride};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use telemetry::{InMemoryTelemetryFeed, TelemetryConsumer, TelemetryFeed};
pub use types::*;
pub use verifier::{Verifier, VerifierId, VerifierState};

use vigil_core::VigilError;

/// Result type for verification operations
pub type Result<T> = std::result::Result<T, VerifyError>;

/// Verification-specific errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid command id: {0}")]
    InvalidCommandId(String),

    #[error("Algorithm subsystem unavailable: {0}")]
    AlgorithmUnavailable(String),

    #[error("Telemetry feed unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error(transparent)]
    Core(#[from] VigilError),
}

impl VerifyError {
    /// Configuration problems abort verification setup for the whole command
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::AlgorithmUnavailable(_)
                | Self::TelemetryUnavailable(_)
                | Self::Core(VigilError::Configuration(_))
        )
    }
}

impl From<serde_json::Error> for VerifyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for VerifyError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<VerifyError> for VigilError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Configuration(msg)
            | VerifyError::AlgorithmUnavailable(msg)
            | VerifyError::TelemetryUnavailable(msg) => VigilError::Configuration(msg),
            VerifyError::InvalidCommandId(msg) => VigilError::NotFound(msg),
            VerifyError::Core(inner) => inner,
            other => VigilError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(VerifyError::Configuration("x".into()).is_configuration());
        assert!(VerifyError::AlgorithmUnavailable("x".into()).is_configuration());
        assert!(VerifyError::Core(VigilError::config("x")).is_configuration());
        assert!(!VerifyError::Evaluation("x".into()).is_configuration());
        assert!(!VerifyError::InvalidCommandId("x".into()).is_configuration());
    }

    #[test]
    fn test_into_core_error() {
        let core: VigilError = VerifyError::InvalidCommandId("cmd-1".into()).into();
        assert_eq!(core, VigilError::NotFound("cmd-1".into()));

        let core: VigilError = VerifyError::TelemetryUnavailable("no feed".into()).into();
        assert_eq!(core, VigilError::Configuration("no feed".into()));
    }
}
