//! Workflow states: named state cells with compare-and-set transitions
//!
//! A `WorkflowState` holds one of a fixed set of named state constants and a
//! list of listeners fired synchronously on every change. All transitions go
//! through `assign` or `compare_and_assign`; no external lock is ever taken
//! around a state cell. Constant (frozen) instances exist purely as
//! comparison tokens and reject both mutation and listener registration.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::error::{StateError, StateResult};

/// Interned name of a workflow state
///
/// States compare by name; well-known states are exported as constants so
/// unrelated activity types can share them as tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StateId(&'static str);

impl StateId {
    /// Create a state id from a static name
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Get the state name
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Initial state of every activity before the manager admits it
pub const CREATED: StateId = StateId::new("created");
/// State assigned when an activity is registered and admitted for scheduling
pub const STARTED: StateId = StateId::new("started");
/// Terminal state of a successfully finished activity
pub const COMPLETED: StateId = StateId::new("completed");
/// Terminal state of a failed activity
pub const FAILED: StateId = StateId::new("failed");

/// Conversation protocol state: a proposal is outstanding
pub const PROPOSED: StateId = StateId::new("proposed");
/// Conversation protocol state: the proposal was accepted
pub const ACCEPTED: StateId = StateId::new("accepted");
/// Conversation protocol state: the accepted proposal was confirmed
pub const CONFIRMED: StateId = StateId::new("confirmed");
/// Conversation protocol state: the accepted proposal was disconfirmed
pub const DISCONFIRMED: StateId = StateId::new("disconfirmed");

/// Listener invoked synchronously with `(from, to)` on every state change
pub type StateListener = Arc<dyn Fn(StateId, StateId) + Send + Sync>;

/// Handle identifying a registered listener, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

/// A mutable (or frozen) cell holding a workflow state
pub struct WorkflowState {
    current: Mutex<StateId>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener: AtomicU64,
    terminal: Vec<StateId>,
    frozen: bool,
}

impl WorkflowState {
    /// Create a mutable state cell with no terminal states
    pub fn new(initial: StateId) -> Self {
        Self::with_terminal(initial, Vec::new())
    }

    /// Create a mutable state cell with the given terminal states
    ///
    /// Once the current value is a member of `terminal`, every further
    /// assignment is rejected with [`StateError::Terminal`].
    pub fn with_terminal(initial: StateId, terminal: Vec<StateId>) -> Self {
        Self {
            current: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            terminal,
            frozen: false,
        }
    }

    /// Create a frozen state usable only as a comparison token
    pub fn constant(value: StateId) -> Self {
        Self {
            current: Mutex::new(value),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            terminal: Vec::new(),
            frozen: true,
        }
    }

    /// Current state value
    pub fn current(&self) -> StateId {
        *self.current.lock()
    }

    /// Whether the current value equals `state`
    pub fn is(&self, state: StateId) -> bool {
        self.current() == state
    }

    /// Whether the current value is one of the declared terminal states
    pub fn is_terminal(&self) -> bool {
        self.terminal.contains(&self.current())
    }

    /// Whether this cell is a frozen comparison token
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Declared terminal states
    pub fn terminal_states(&self) -> &[StateId] {
        &self.terminal
    }

    /// Unconditionally assign a new state and fire listeners
    pub fn assign(&self, next: StateId) -> StateResult<()> {
        if self.frozen {
            return Err(StateError::Frozen {
                state: self.current(),
                operation: "assign",
            });
        }
        let from = {
            let mut current = self.current.lock();
            if self.terminal.contains(&current) {
                return Err(StateError::Terminal {
                    current: *current,
                    requested: next,
                });
            }
            let from = *current;
            *current = next;
            from
        };
        self.fire(from, next);
        Ok(())
    }

    /// Atomically assign `next` if the current value equals `expected`
    ///
    /// Returns `Ok(false)` on mismatch without touching the state. Listeners
    /// fire only on a successful swap.
    pub fn compare_and_assign(&self, expected: StateId, next: StateId) -> StateResult<bool> {
        if self.frozen {
            return Err(StateError::Frozen {
                state: self.current(),
                operation: "compare_and_assign",
            });
        }
        {
            let mut current = self.current.lock();
            if self.terminal.contains(&current) {
                return Err(StateError::Terminal {
                    current: *current,
                    requested: next,
                });
            }
            if *current != expected {
                return Ok(false);
            }
            *current = next;
        }
        self.fire(expected, next);
        Ok(true)
    }

    /// Register a change listener
    ///
    /// Listeners run synchronously on the thread performing the transition;
    /// they may enqueue further work but must not block.
    pub fn add_listener(
        &self,
        listener: impl Fn(StateId, StateId) + Send + Sync + 'static,
    ) -> StateResult<ListenerHandle> {
        if self.frozen {
            return Err(StateError::Frozen {
                state: self.current(),
                operation: "add_listener",
            });
        }
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(listener)));
        Ok(ListenerHandle(id))
    }

    /// Remove a previously registered listener; returns whether it existed
    pub fn remove_listener(&self, handle: ListenerHandle) -> StateResult<bool> {
        if self.frozen {
            return Err(StateError::Frozen {
                state: self.current(),
                operation: "remove_listener",
            });
        }
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle.0);
        Ok(listeners.len() != before)
    }

    /// Invoke listeners outside the state lock so a listener may read the
    /// cell or register further listeners.
    fn fire(&self, from: StateId, to: StateId) {
        let snapshot: Vec<StateListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(from, to);
        }
    }
}

impl fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowState")
            .field("current", &self.current())
            .field("frozen", &self.frozen)
            .field("terminal", &self.terminal)
            .finish()
    }
}
