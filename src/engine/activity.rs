//! Activities: units of distributed work, action queues, and the FSM variant
//!
//! An activity is one tracked unit of work with an explicit workflow state,
//! an ordered action queue, and a completion handle. Activities form trees:
//! a child shares its parent's action queue, so every action belonging to a
//! tree executes strictly one at a time in enqueue order while unrelated
//! trees run in parallel. `FsmActivity` automates message handling entirely
//! through its type's transition table.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::completion::CompletionHandle;
use super::error::{ActivityError, ProtocolError, Result};
use super::manager::ActivityManager;
use super::message::{ActivityId, Message};
use super::state::{COMPLETED, CREATED, FAILED, StateId, WorkflowState};
use super::transition::{TransitionTable, TriggerEvent};

/// One queued step of work for an activity tree
#[derive(Clone)]
pub enum Action {
    /// Deliver an inbound message to the target activity
    HandleMessage(Message),

    /// Tell the target activity that one of its children reached a state
    ChildTransition {
        /// The child that changed state
        child: Arc<dyn Activity>,
        /// State the child reached
        state: StateId,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::HandleMessage(m) => write!(f, "HandleMessage({:?})", m.performative),
            Action::ChildTransition { child, state } => {
                write!(f, "ChildTransition({} -> {state})", child.core().id())
            }
        }
    }
}

/// An action plus the activity it must be executed against
///
/// The tag matters because a whole tree shares one physical queue.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    /// Activity the action targets
    pub target: ActivityId,
    /// The action itself
    pub action: Action,
}

/// FIFO action queue shared by every activity of one tree
#[derive(Default)]
pub struct ActionQueue {
    inner: Mutex<VecDeque<QueuedAction>>,
}

impl ActionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action
    pub fn push(&self, action: QueuedAction) {
        self.inner.lock().push_back(action);
    }

    /// Pop the oldest action
    pub fn pop(&self) -> Option<QueuedAction> {
        self.inner.lock().pop_front()
    }

    /// Number of pending actions
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no actions are pending
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("pending", &self.len())
            .finish()
    }
}

/// Shared base record composed into every activity implementation
pub struct ActivityCore {
    id: ActivityId,
    type_name: String,
    state: WorkflowState,
    queue: RwLock<Arc<ActionQueue>>,
    last_action: Mutex<Instant>,
    parent: RwLock<Option<ActivityId>>,
    root: RwLock<ActivityId>,
    error: Mutex<Option<ActivityError>>,
    completion: Arc<CompletionHandle>,
}

impl ActivityCore {
    /// Create a core with the default lifecycle states
    /// (`created` initial, `completed`/`failed` terminal)
    pub fn new(type_name: impl Into<String>) -> Self {
        Self::with_states(ActivityId::new(), type_name, CREATED, vec![COMPLETED, FAILED])
    }

    /// Create a core with an explicit id and the default lifecycle states
    pub fn with_id(id: ActivityId, type_name: impl Into<String>) -> Self {
        Self::with_states(id, type_name, CREATED, vec![COMPLETED, FAILED])
    }

    /// Create a core with explicit initial and terminal states
    ///
    /// `failed` is always treated as terminal in addition to the given set.
    pub fn with_states(
        id: ActivityId,
        type_name: impl Into<String>,
        initial: StateId,
        mut terminal: Vec<StateId>,
    ) -> Self {
        if !terminal.contains(&FAILED) {
            terminal.push(FAILED);
        }
        Self {
            id,
            type_name: type_name.into(),
            state: WorkflowState::with_terminal(initial, terminal),
            queue: RwLock::new(Arc::new(ActionQueue::new())),
            last_action: Mutex::new(Instant::now()),
            parent: RwLock::new(None),
            root: RwLock::new(id),
            error: Mutex::new(None),
            completion: Arc::new(CompletionHandle::new()),
        }
    }

    /// Identity of this activity
    pub fn id(&self) -> ActivityId {
        self.id
    }

    /// Registered type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The activity's workflow state cell
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// The action queue this activity currently feeds (shared per tree)
    pub fn queue(&self) -> Arc<ActionQueue> {
        Arc::clone(&self.queue.read())
    }

    /// The activity's completion handle
    pub fn completion(&self) -> Arc<CompletionHandle> {
        Arc::clone(&self.completion)
    }

    /// Parent activity id, if any
    pub fn parent(&self) -> Option<ActivityId> {
        *self.parent.read()
    }

    /// Root of this activity's ancestor chain (self for a root activity)
    pub fn root(&self) -> ActivityId {
        *self.root.read()
    }

    /// When an action for this tree last executed (or was last considered)
    pub fn last_action(&self) -> Instant {
        *self.last_action.lock()
    }

    /// Refresh the last-action timestamp
    pub fn stamp_last_action(&self) {
        *self.last_action.lock() = Instant::now();
    }

    /// Enqueue an action targeted at this activity onto the tree's queue
    pub fn push_action(&self, action: Action) {
        self.queue().push(QueuedAction {
            target: self.id,
            action,
        });
    }

    pub(crate) fn set_parent(&self, parent: ActivityId, root: ActivityId, queue: Arc<ActionQueue>) {
        *self.parent.write() = Some(parent);
        *self.root.write() = root;
        *self.queue.write() = queue;
    }

    pub(crate) fn set_error(&self, error: ActivityError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn take_error(&self) -> Option<ActivityError> {
        self.error.lock().take()
    }
}

impl fmt::Debug for ActivityCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityCore")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("state", &self.state.current())
            .field("pending", &self.queue().len())
            .finish()
    }
}

/// A unit of distributed work
///
/// Implementations compose an [`ActivityCore`] and supply behavior. The
/// engine invokes `initiate` exactly once, only on the peer that originates
/// the unit of work, and invokes `handle_message`/`handle_child_transition`
/// exclusively from the scheduler's worker pool, one action per tree at a
/// time.
pub trait Activity: Send + Sync {
    /// The shared base record
    fn core(&self) -> &ActivityCore;

    /// Downcast support for handlers that know the concrete type
    fn as_any(&self) -> &dyn Any;

    /// Perform initial side effects (outbound sends happen before return)
    fn initiate(&self, engine: &ActivityManager) -> Result<()>;

    /// Handle one inbound message addressed to this activity's id
    fn handle_message(&self, engine: &ActivityManager, message: &Message) -> Result<()>;

    /// Handle a registered child reaching a new state
    fn handle_child_transition(
        &self,
        _engine: &ActivityManager,
        _child: &Arc<dyn Activity>,
        _state: StateId,
    ) -> Result<()> {
        Ok(())
    }
}

/// An activity whose message handling is fully table-driven
///
/// Every inbound message and child state change is resolved against the
/// owning type's [`TransitionTable`]; the matched handler runs and the
/// table's target state is assigned by compare-and-set. Messages with no
/// matching entry surface as [`ProtocolError::NoTransition`], which the
/// dispatch path answers with a NotUnderstood reply.
pub struct FsmActivity {
    core: ActivityCore,
    table: Arc<TransitionTable>,
}

impl FsmActivity {
    /// Create an FSM activity with a fresh id
    pub fn new(type_name: impl Into<String>, table: Arc<TransitionTable>) -> Self {
        Self {
            core: ActivityCore::new(type_name),
            table,
        }
    }

    /// Create an FSM activity with an explicit id (remote-announced units)
    pub fn with_id(
        id: ActivityId,
        type_name: impl Into<String>,
        table: Arc<TransitionTable>,
    ) -> Self {
        Self {
            core: ActivityCore::with_id(id, type_name),
            table,
        }
    }

    /// The shared transition table of this activity's type
    pub fn table(&self) -> &Arc<TransitionTable> {
        &self.table
    }

    fn fire(
        &self,
        engine: &ActivityManager,
        from: StateId,
        to: StateId,
        event: TriggerEvent<'_>,
        handler: &super::transition::TransitionHandler,
    ) -> Result<()> {
        let run = handler.as_ref();
        run(engine, self, event).map_err(|e| ActivityError::HandlerFailed(e.to_string()))?;
        match self.core.state.compare_and_assign(from, to)? {
            true => Ok(()),
            false => {
                // The handler (or a listener) already moved the state.
                tracing::debug!(
                    activity = %self.core.id,
                    %from,
                    %to,
                    current = %self.core.state.current(),
                    "transition target skipped; state moved during handler"
                );
                Ok(())
            }
        }
    }
}

impl Activity for FsmActivity {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn initiate(&self, _engine: &ActivityManager) -> Result<()> {
        Ok(())
    }

    fn handle_message(&self, engine: &ActivityManager, message: &Message) -> Result<()> {
        let current = self.core.state.current();
        match self.table.resolve_message(current, message) {
            Some(transition) => self.fire(
                engine,
                current,
                transition.to,
                TriggerEvent::Message(message),
                &transition.handler,
            ),
            None => Err(ProtocolError::NoTransition {
                state: current,
                performative: message.performative,
            }
            .into()),
        }
    }

    fn handle_child_transition(
        &self,
        engine: &ActivityManager,
        child: &Arc<dyn Activity>,
        state: StateId,
    ) -> Result<()> {
        let current = self.core.state.current();
        match self
            .table
            .resolve_child(current, child.core().type_name(), state)
        {
            Some(transition) => self.fire(
                engine,
                current,
                transition.to,
                TriggerEvent::Child {
                    activity: child,
                    state,
                },
                &transition.handler,
            ),
            None => {
                // Child states without a registered transition are simply
                // not interesting in the current state.
                tracing::debug!(
                    activity = %self.core.id,
                    child = %child.core().id(),
                    child_state = %state,
                    %current,
                    "ignoring unmatched child transition"
                );
                Ok(())
            }
        }
    }
}
