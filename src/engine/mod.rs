//! Activity-scheduling engine for distributed peers
//!
//! A peer process tracks its units of distributed work as *activities*:
//! state machines advanced by performative-tagged messages and by state
//! changes of sub-activities. The [`ActivityManager`] owns the registries
//! and a fair scheduler that executes one action per activity tree at a
//! time while unrelated trees run in parallel on a bounded worker pool.
//!
//! The engine is transport-agnostic: inbound messages arrive through
//! [`ActivityManager::handle_message`], outbound ones leave through the
//! [`Transport`] implementation supplied by the embedding process.

pub mod activity;
pub mod completion;
pub mod conversation;
pub mod error;
pub mod manager;
pub mod message;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod transition;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use activity::{Action, ActionQueue, Activity, ActivityCore, FsmActivity, QueuedAction};
pub use completion::{ActivityResult, CompletionHandle};
pub use conversation::{Conversation, PROPOSAL_TYPE};
pub use error::{
    ActivityError, EngineError, ProtocolError, Result, SchedulerError, StateError,
};
pub use manager::{ActivityFactory, ActivityManager, CompletionListener};
pub use message::{
    ActivityId, ChannelTransport, ClockSource, CountingClock, Message, Performative,
    RecordingTransport, StaticDirectory, Target, TargetDirectory, Transport,
};
pub use state::{ListenerHandle, StateId, StateListener, WorkflowState};
pub use task::TaskActivity;
pub use transition::{Transition, TransitionTable, Trigger, TriggerEvent};

fn default_workers() -> usize {
    4
}

fn default_idle_wait_ms() -> u64 {
    10
}

fn default_local_target() -> Target {
    Target::new("local")
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads executing actions (bounds tree-level parallelism)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fallback sleep of the scheduling thread when no tree has pending
    /// work, in milliseconds; also bounds wakeup latency after a missed
    /// notification
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    /// Target other peers should use to address this process
    #[serde(default = "default_local_target")]
    pub local_target: Target,

    /// Emit additional per-action debug logging
    #[serde(default)]
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            idle_wait_ms: default_idle_wait_ms(),
            local_target: default_local_target(),
            debug: false,
        }
    }
}

impl EngineConfig {
    /// The idle fallback wait as a [`Duration`]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.idle_wait(), Duration::from_millis(10));
        assert_eq!(config.local_target, Target::new("local"));
        assert!(!config.debug);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"workers": 2}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.idle_wait_ms, 10);
    }
}
