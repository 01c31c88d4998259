//! Declarative transition tables
//!
//! A transition table maps `(current state, trigger)` to `(next state,
//! handler)`. Tables are built once per activity *type* through explicit
//! registration calls at process start and shared read-only by every
//! instance of that type. Triggers come in two shapes: an inbound-message
//! performative, or a sub-activity of a given type reaching a given state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::activity::Activity;
use super::error::{ProtocolError, ProtocolResult};
use super::manager::ActivityManager;
use super::message::{Message, Performative};
use super::state::StateId;

/// What causes a transition to fire
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// An inbound message with this performative, payload-independent
    Performative(Performative),

    /// A sub-activity of the named type reaching the given state
    ChildState {
        /// Type name of the sub-activity
        activity_type: String,
        /// State the sub-activity reached
        state: StateId,
    },
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Performative(p) => write!(f, "performative {p:?}"),
            Trigger::ChildState {
                activity_type,
                state,
            } => write!(f, "child {activity_type} -> {state}"),
        }
    }
}

/// The event handed to a transition handler when it fires
pub enum TriggerEvent<'a> {
    /// The inbound message that matched a performative trigger
    Message(&'a Message),

    /// The sub-activity (and the state it reached) that matched a
    /// child-state trigger
    Child {
        /// The sub-activity that changed state
        activity: &'a Arc<dyn Activity>,
        /// State the sub-activity reached
        state: StateId,
    },
}

/// Handler invoked when a transition fires
///
/// Receives the engine, the activity the transition belongs to, and the
/// triggering event. Handler failures are captured into the activity's
/// result, never propagated to the scheduler.
pub type TransitionHandler =
    Arc<dyn Fn(&ActivityManager, &dyn Activity, TriggerEvent<'_>) -> anyhow::Result<()> + Send + Sync>;

/// One entry of a transition table
#[derive(Clone)]
pub struct Transition {
    /// State the activity must be in for this entry to match
    pub from: StateId,
    /// What fires the transition
    pub trigger: Trigger,
    /// State assigned after the handler runs
    pub to: StateId,
    /// Business logic invoked when the transition fires
    pub handler: TransitionHandler,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("trigger", &self.trigger)
            .field("to", &self.to)
            .finish()
    }
}

/// Per-activity-type table of transitions, built once and shared read-only
#[derive(Default)]
pub struct TransitionTable {
    entries: HashMap<(StateId, Trigger), Transition>,
}

impl TransitionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transition; at most one entry per `(from, trigger)` pair
    pub fn register(
        &mut self,
        from: StateId,
        trigger: Trigger,
        to: StateId,
        handler: impl Fn(&ActivityManager, &dyn Activity, TriggerEvent<'_>) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
    ) -> ProtocolResult<()> {
        let key = (from, trigger.clone());
        if self.entries.contains_key(&key) {
            return Err(ProtocolError::DuplicateTransition {
                state: from,
                trigger: trigger.to_string(),
            });
        }
        self.entries.insert(
            key,
            Transition {
                from,
                trigger,
                to,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Shorthand for registering a performative-triggered transition
    pub fn on_performative(
        &mut self,
        from: StateId,
        performative: Performative,
        to: StateId,
        handler: impl Fn(&ActivityManager, &dyn Activity, TriggerEvent<'_>) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
    ) -> ProtocolResult<()> {
        self.register(from, Trigger::Performative(performative), to, handler)
    }

    /// Shorthand for registering a child-state-triggered transition
    pub fn on_child_state(
        &mut self,
        from: StateId,
        activity_type: impl Into<String>,
        state: StateId,
        to: StateId,
        handler: impl Fn(&ActivityManager, &dyn Activity, TriggerEvent<'_>) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
    ) -> ProtocolResult<()> {
        self.register(
            from,
            Trigger::ChildState {
                activity_type: activity_type.into(),
                state,
            },
            to,
            handler,
        )
    }

    /// Resolve an inbound message against the current state
    ///
    /// A miss is not an error here; the dispatch path turns it into a
    /// NotUnderstood reply.
    pub fn resolve_message(&self, from: StateId, message: &Message) -> Option<&Transition> {
        self.entries
            .get(&(from, Trigger::Performative(message.performative)))
    }

    /// Resolve a sub-activity state change against the current state
    pub fn resolve_child(
        &self,
        from: StateId,
        activity_type: &str,
        child_state: StateId,
    ) -> Option<&Transition> {
        self.entries.get(&(
            from,
            Trigger::ChildState {
                activity_type: activity_type.to_string(),
                state: child_state,
            },
        ))
    }

    /// Number of registered transitions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TransitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::message::Target;
    use crate::engine::state::{ACCEPTED, PROPOSED, STARTED};
    use proptest::prelude::*;

    fn noop(
        _: &ActivityManager,
        _: &dyn Activity,
        _: TriggerEvent<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn message(performative: Performative) -> Message {
        Message::new(
            performative,
            Target::new("peer"),
            Target::new("peer"),
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_resolve_message() {
        let mut table = TransitionTable::new();
        table
            .on_performative(STARTED, Performative::Propose, PROPOSED, noop)
            .unwrap();

        let hit = table
            .resolve_message(STARTED, &message(Performative::Propose))
            .unwrap();
        assert_eq!(hit.to, PROPOSED);

        assert!(
            table
                .resolve_message(STARTED, &message(Performative::Confirm))
                .is_none()
        );
        assert!(
            table
                .resolve_message(PROPOSED, &message(Performative::Propose))
                .is_none()
        );
    }

    #[test]
    fn test_resolve_child() {
        let mut table = TransitionTable::new();
        table
            .on_child_state(STARTED, "proposal", ACCEPTED, PROPOSED, noop)
            .unwrap();

        assert!(table.resolve_child(STARTED, "proposal", ACCEPTED).is_some());
        assert!(table.resolve_child(STARTED, "other", ACCEPTED).is_none());
        assert!(table.resolve_child(STARTED, "proposal", PROPOSED).is_none());
    }

    #[test]
    fn test_duplicate_registration_errors() {
        let mut table = TransitionTable::new();
        table
            .on_performative(STARTED, Performative::Propose, PROPOSED, noop)
            .unwrap();
        let err = table
            .on_performative(STARTED, Performative::Propose, ACCEPTED, noop)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateTransition { .. }));
        assert_eq!(table.len(), 1);
    }

    const STATES: [StateId; 4] = [STARTED, PROPOSED, ACCEPTED, crate::engine::state::CONFIRMED];
    const PERFORMATIVES: [Performative; 5] = [
        Performative::Request,
        Performative::Propose,
        Performative::AcceptProposal,
        Performative::Confirm,
        Performative::Inform,
    ];

    proptest! {
        // Whatever mix of registrations is attempted, resolution finds
        // exactly the pairs that were successfully registered.
        #[test]
        fn prop_resolve_matches_registrations(
            pairs in prop::collection::vec((0usize..4, 0usize..5), 0..16),
            query_state in 0usize..4,
            query_perf in 0usize..5,
        ) {
            let mut table = TransitionTable::new();
            let mut registered = std::collections::HashSet::new();
            for (s, p) in pairs {
                let ok = table
                    .on_performative(STATES[s], PERFORMATIVES[p], STATES[s], noop)
                    .is_ok();
                prop_assert_eq!(ok, registered.insert((s, p)));
            }

            let hit = table
                .resolve_message(STATES[query_state], &message(PERFORMATIVES[query_perf]))
                .is_some();
            prop_assert_eq!(hit, registered.contains(&(query_state, query_perf)));
        }
    }
}
