//! Error types for the Parley engine
//!
//! Domain errors use thiserror per subsystem; user-supplied handlers return
//! `anyhow::Result` and are converted at the dispatch boundary.

use thiserror::Error;

use super::message::{ActivityId, Performative};
use super::state::StateId;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Workflow-state errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Protocol/transition errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Activity lifecycle errors
    #[error("Activity error: {0}")]
    Activity(#[from] ActivityError),

    /// Scheduler lifecycle errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Transport failure reported by the external collaborator
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Workflow-state errors
#[derive(Debug, Error)]
pub enum StateError {
    /// Mutation or listener registration attempted on a constant state
    #[error("state '{state}' is frozen and rejects {operation}")]
    Frozen {
        /// Current value of the frozen state
        state: StateId,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Assignment attempted after a terminal state was reached
    #[error("state '{current}' is terminal; cannot assign '{requested}'")]
    Terminal {
        /// Terminal value currently held
        current: StateId,
        /// Value the caller tried to assign
        requested: StateId,
    },
}

/// Convenience result alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Protocol and transition-table errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No transition registered for this `(state, performative)` pair.
    ///
    /// The dispatch path answers this with a NotUnderstood reply rather than
    /// failing the activity.
    #[error("no transition from state '{state}' on performative {performative:?}")]
    NoTransition {
        /// State the activity was in
        state: StateId,
        /// Performative of the unmatched message
        performative: Performative,
    },

    /// A second transition was registered for the same `(state, trigger)` pair
    #[error("duplicate transition from state '{state}' on trigger {trigger}")]
    DuplicateTransition {
        /// From-state of the conflicting entry
        state: StateId,
        /// Human-readable trigger description
        trigger: String,
    },

    /// An activity type name was registered twice
    #[error("activity type '{0}' is already registered")]
    DuplicateActivityType(String),

    /// A message referenced an activity type with no registered factory
    #[error("unknown activity type '{0}'")]
    UnknownActivityType(String),

    /// A message arrived without a conversation id to route on
    #[error("message carries no conversation id")]
    MissingConversationId,

    /// A conversation was asked to speak before a counterparty was known
    #[error("conversation {0} has no peer target")]
    MissingPeer(ActivityId),
}

/// Convenience result alias for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Activity lifecycle errors
///
/// `Clone` because the terminal variant is captured into the activity's
/// completion result and observed by every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// A registered handler returned an error or panicked
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// No live activity with this id
    #[error("activity {0} not found")]
    NotFound(ActivityId),

    /// An activity with this id is already registered
    #[error("activity {0} is already registered")]
    AlreadyRegistered(ActivityId),

    /// Cancellation is not supported by the engine
    #[error("activity cancellation is unsupported")]
    CancelUnsupported,

    /// The owning activity finished while this one was still live
    #[error("owning activity finished before this one completed")]
    OwnerFinished,

    /// The engine was stopped while the activity was still live
    #[error("engine shut down before the activity completed")]
    Shutdown,
}

/// Scheduler lifecycle errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `start` called on an engine that is already running
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// `stop` called on an engine that was never started
    #[error("scheduler is not running")]
    NotRunning,

    /// Work submitted while the worker pool is shutting down
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// Failed to spawn a scheduler or worker thread
    #[error("thread spawn failed: {0}")]
    Spawn(String),
}

/// Convenience result alias for scheduler operations
pub type SchedResult<T> = std::result::Result<T, SchedulerError>;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
