//! Engine error types.

use thiserror::Error;

use formation_core::CoreError;
use formation_provider::{ProviderError, RegistryError};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that escalate to the system machine's single error-handling
/// decision, plus the synchronous `InvalidTransition` programmer error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Nodes never became reachable within the deadline.
    #[error("{0} did not become reachable before the deadline")]
    ReachabilityTimeout(String),

    /// Dependencies never completed within the deadline.
    #[error("{0} did not finish provisioning before the deadline")]
    ParentWaitTimeout(String),

    /// A collaborator call failed.
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),

    /// Remote configuration application failed.
    #[error("configuration apply failed on node {node:?}: {reason}")]
    ConfigurationApply { node: String, reason: String },

    /// An event was fired in a state with no declared transition for it.
    #[error("no transition from state {state:?} on event {event:?}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    /// A named collaborator plugin is not registered.
    #[error(transparent)]
    CollaboratorNotFound(#[from] RegistryError),

    /// The system description itself is unusable.
    #[error(transparent)]
    Core(#[from] CoreError),
}
