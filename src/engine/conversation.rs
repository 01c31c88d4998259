//! Conversations: two-party request/reply protocol machines
//!
//! A conversation is the lightest sub-activity: a state cell plus a map of
//! `(state, performative) -> state` built once per protocol. Transitions fire
//! both when the owner speaks (`say`) and when the counterparty's message
//! arrives, which is what produces the initiator-side state sequence
//! `started -> proposed -> accepted -> confirmed` for the canonical proposal
//! protocol. A conversation has no lifecycle of its own beyond its owning
//! activity; it is discarded with the parent.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::activity::{Activity, ActivityCore};
use super::error::{EngineError, ProtocolError, Result};
use super::manager::ActivityManager;
use super::message::{ActivityId, Message, Performative, Target};
use super::state::{ACCEPTED, CONFIRMED, DISCONFIRMED, PROPOSED, STARTED, StateId};

/// A two-party sub-activity implementing one request/reply exchange
pub struct Conversation {
    core: ActivityCore,
    transitions: HashMap<(StateId, Performative), StateId>,
    last_message: Mutex<Option<Message>>,
    peer: Mutex<Option<Target>>,
    end_state: StateId,
}

/// Type name under which proposal conversations register
pub const PROPOSAL_TYPE: &str = "proposal";

impl Conversation {
    /// Create a conversation with explicit start and end states
    pub fn new(type_name: impl Into<String>, start: StateId, end: StateId) -> Self {
        Self::with_id(ActivityId::new(), type_name, start, end)
    }

    /// Create a conversation with an explicit id
    ///
    /// Used on the receiving side, where the id arrives with the first
    /// message for an unknown conversation.
    pub fn with_id(
        id: ActivityId,
        type_name: impl Into<String>,
        start: StateId,
        end: StateId,
    ) -> Self {
        Self::with_terminals(id, type_name, start, end, vec![end])
    }

    fn with_terminals(
        id: ActivityId,
        type_name: impl Into<String>,
        start: StateId,
        end: StateId,
        terminals: Vec<StateId>,
    ) -> Self {
        Self {
            core: ActivityCore::with_states(id, type_name, start, terminals),
            transitions: HashMap::new(),
            last_message: Mutex::new(None),
            peer: Mutex::new(None),
            end_state: end,
        }
    }

    /// The canonical propose/accept/confirm protocol
    ///
    /// `started -> proposed` on Propose, `proposed -> accepted` on
    /// AcceptProposal, `accepted -> confirmed` on Confirm and
    /// `accepted -> disconfirmed` on Disconfirm. Both terminal protocol
    /// states end the conversation.
    pub fn proposal() -> Self {
        Self::proposal_with_id(ActivityId::new())
    }

    /// The proposal protocol with an explicit id (receiving side)
    pub fn proposal_with_id(id: ActivityId) -> Self {
        let mut conversation = Self::with_terminals(
            id,
            PROPOSAL_TYPE,
            STARTED,
            CONFIRMED,
            vec![CONFIRMED, DISCONFIRMED],
        );
        conversation.register_performative_transition(STARTED, Performative::Propose, PROPOSED);
        conversation.register_performative_transition(
            PROPOSED,
            Performative::AcceptProposal,
            ACCEPTED,
        );
        conversation.register_performative_transition(ACCEPTED, Performative::Confirm, CONFIRMED);
        conversation.register_performative_transition(
            ACCEPTED,
            Performative::Disconfirm,
            DISCONFIRMED,
        );
        conversation
    }

    /// The proposal protocol bound to a counterparty
    pub fn proposal_to(peer: Target) -> Self {
        let conversation = Self::proposal();
        conversation.set_peer(peer);
        conversation
    }

    /// Register one `(state, performative) -> state` protocol step
    ///
    /// Called at construction time, once per protocol. The first entry for a
    /// `(state, performative)` pair wins; later registrations are ignored.
    pub fn register_performative_transition(
        &mut self,
        from: StateId,
        performative: Performative,
        to: StateId,
    ) {
        self.transitions.entry((from, performative)).or_insert(to);
    }

    /// Declared end state of the protocol
    pub fn end_state(&self) -> StateId {
        self.end_state
    }

    /// Counterparty of this conversation, once known
    pub fn peer(&self) -> Option<Target> {
        self.peer.lock().clone()
    }

    /// Set the counterparty this conversation speaks to
    pub fn set_peer(&self, peer: Target) {
        *self.peer.lock() = Some(peer);
    }

    /// The most recent message spoken or received
    pub fn last_message(&self) -> Option<Message> {
        self.last_message.lock().clone()
    }

    /// Look up the protocol step for a `(state, performative)` pair
    pub fn transition_for(&self, from: StateId, performative: Performative) -> Option<StateId> {
        self.transitions.get(&(from, performative)).copied()
    }

    /// Speak: stamp, remember, and transport the message, then advance the
    /// protocol state if the spoken performative is a registered step
    pub fn say(&self, engine: &ActivityManager, mut message: Message) -> Result<()> {
        if message.conversation_id.is_none() {
            message.conversation_id = Some(self.core.id());
        }
        message.clock = engine.clock().tick();

        let peer = self
            .peer()
            .ok_or(ProtocolError::MissingPeer(self.core.id()))?;

        *self.last_message.lock() = Some(message.clone());
        engine
            .transport()
            .send(&peer, message.clone())
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        self.apply(message.performative);
        Ok(())
    }

    /// Advance the protocol if `(current, performative)` is a registered
    /// step; returns the transition that fired
    fn apply(&self, performative: Performative) -> Option<(StateId, StateId)> {
        let current = self.core.state().current();
        let to = self.transition_for(current, performative)?;
        match self.core.state().compare_and_assign(current, to) {
            Ok(true) => Some((current, to)),
            Ok(false) => None,
            Err(_) => None,
        }
    }
}

impl Activity for Conversation {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn initiate(&self, _engine: &ActivityManager) -> Result<()> {
        // A conversation speaks only when its owner tells it to.
        Ok(())
    }

    fn handle_message(&self, _engine: &ActivityManager, message: &Message) -> Result<()> {
        *self.last_message.lock() = Some(message.clone());

        // Lazily bind the counterparty on the receiving side.
        {
            let mut peer = self.peer.lock();
            if peer.is_none() {
                *peer = Some(message.reply_to.clone());
            }
        }

        let current = self.core.state().current();
        match self.transition_for(current, message.performative) {
            Some(to) => {
                if self.core.state().compare_and_assign(current, to)? {
                    tracing::debug!(
                        conversation = %self.core.id(),
                        %current,
                        %to,
                        performative = ?message.performative,
                        "conversation advanced"
                    );
                }
                Ok(())
            }
            // The NotUnderstood reply for unmatched pairs is centralized in
            // the manager's dispatch path.
            None => Err(ProtocolError::NoTransition {
                state: current,
                performative: message.performative,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_protocol_steps() {
        let conversation = Conversation::proposal();
        assert_eq!(
            conversation.transition_for(STARTED, Performative::Propose),
            Some(PROPOSED)
        );
        assert_eq!(
            conversation.transition_for(PROPOSED, Performative::AcceptProposal),
            Some(ACCEPTED)
        );
        assert_eq!(
            conversation.transition_for(ACCEPTED, Performative::Confirm),
            Some(CONFIRMED)
        );
        assert_eq!(
            conversation.transition_for(ACCEPTED, Performative::Disconfirm),
            Some(DISCONFIRMED)
        );
        assert_eq!(
            conversation.transition_for(STARTED, Performative::Confirm),
            None
        );
    }

    #[test]
    fn test_apply_advances_only_registered_steps() {
        let conversation = Conversation::proposal();
        assert!(conversation.apply(Performative::Confirm).is_none());
        assert_eq!(conversation.core.state().current(), STARTED);

        assert_eq!(
            conversation.apply(Performative::Propose),
            Some((STARTED, PROPOSED))
        );
        assert_eq!(conversation.core.state().current(), PROPOSED);
    }

    #[test]
    fn test_end_states_are_terminal() {
        let conversation = Conversation::proposal();
        let terminal = conversation.core.state().terminal_states();
        assert!(terminal.contains(&CONFIRMED));
        assert!(terminal.contains(&DISCONFIRMED));
    }

    #[test]
    fn test_first_registration_wins() {
        let mut conversation = Conversation::new("ping", STARTED, CONFIRMED);
        conversation.register_performative_transition(STARTED, Performative::Inform, PROPOSED);
        conversation.register_performative_transition(STARTED, Performative::Inform, ACCEPTED);
        assert_eq!(
            conversation.transition_for(STARTED, Performative::Inform),
            Some(PROPOSED)
        );
    }
}
