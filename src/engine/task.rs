//! Task activities: coordinating many conversations toward one outcome
//!
//! A `TaskActivity` owns zero or more sub-activities (usually
//! [`Conversation`](super::conversation::Conversation)s), multiplexes their
//! state changes into per-own-state queues, and advances its own state from a
//! private sequential control loop. The loop consumes the queue registered
//! for the *current* task state; when no queue is registered for that state
//! it parks on a generic state-changed signal until another codepath moves
//! the state. The loop exits when the task reaches its declared end state.
//!
//! Sub-activity changes reach the task through the scheduler (a
//! child-transition action on the shared tree queue), never directly, so the
//! control loop and message handling for the whole tree stay serialized.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::activity::{Activity, ActivityCore};
use super::error::{ActivityError, Result};
use super::manager::ActivityManager;
use super::message::ActivityId;
use super::state::{COMPLETED, CREATED, FAILED, StateId};

/// Handler invoked when a registered child state change fires
///
/// Receives the engine, the task itself, and the triggering sub-activity.
/// This is where business decisions live: accept or reject a proposal, tally
/// outstanding replies, emit further messages, assign the next task state.
pub type TaskHandler =
    Arc<dyn Fn(&ActivityManager, &Arc<dyn Activity>, &Arc<dyn Activity>) -> anyhow::Result<()> + Send + Sync>;

/// Hook performing the task's initial side effects (fan-out sends, spawning
/// conversations); runs before `initiate` returns
pub type StartFn =
    Arc<dyn Fn(&ActivityManager, &Arc<dyn Activity>) -> anyhow::Result<()> + Send + Sync>;

struct TaskRule {
    from: StateId,
    child_state: StateId,
    to: StateId,
    handler: TaskHandler,
}

struct ChildEvent {
    child: Arc<dyn Activity>,
    state: StateId,
}

/// Per-own-state queue of child events feeding the control loop
#[derive(Default)]
struct StateQueue {
    events: Mutex<VecDeque<ChildEvent>>,
    ready: Condvar,
}

impl StateQueue {
    fn push(&self, event: ChildEvent) {
        self.events.lock().push_back(event);
        self.ready.notify_all();
    }

    fn push_front(&self, event: ChildEvent) {
        self.events.lock().push_front(event);
        self.ready.notify_all();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<ChildEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            if self.ready.wait_until(&mut events, deadline).timed_out() {
                return None;
            }
        }
    }
}

/// Generic state-changed signal for task states without a registered queue
#[derive(Default)]
struct StateSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl StateSignal {
    fn notify(&self) {
        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    fn wait_for(&self, timeout: Duration) {
        let mut generation = self.generation.lock();
        let _ = self.changed.wait_for(&mut generation, timeout);
    }
}

/// A higher-level activity coordinating sub-activities via a control loop
pub struct TaskActivity {
    core: ActivityCore,
    end_state: StateId,
    rules: Vec<TaskRule>,
    queues: HashMap<StateId, Arc<StateQueue>>,
    start_fn: Option<StartFn>,
    signal: Arc<StateSignal>,
}

/// How long blocked waits poll for shutdown/state changes
const LOOP_WAIT: Duration = Duration::from_millis(25);

impl TaskActivity {
    /// Create a task that ends when its state reaches `end_state`
    pub fn new(type_name: impl Into<String>, end_state: StateId) -> Self {
        Self::with_id(ActivityId::new(), type_name, end_state)
    }

    /// Create a task with an explicit id
    pub fn with_id(id: ActivityId, type_name: impl Into<String>, end_state: StateId) -> Self {
        Self {
            core: ActivityCore::with_states(id, type_name, CREATED, vec![end_state, COMPLETED]),
            end_state,
            rules: Vec::new(),
            queues: HashMap::new(),
            start_fn: None,
            signal: Arc::new(StateSignal::default()),
        }
    }

    /// Set the hook performing initial side effects
    pub fn on_start(
        &mut self,
        hook: impl Fn(&ActivityManager, &Arc<dyn Activity>) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
    ) {
        self.start_fn = Some(Arc::new(hook));
    }

    /// Map a sub-activity reaching `child_state`, while this task is in
    /// `from`, to the transition `from -> to` plus a handler
    ///
    /// Registration also creates the per-own-state queue for `from`.
    pub fn register_conversation_handler(
        &mut self,
        from: StateId,
        child_state: StateId,
        to: StateId,
        handler: impl Fn(&ActivityManager, &Arc<dyn Activity>, &Arc<dyn Activity>) -> anyhow::Result<()>
        + Send
        + Sync
        + 'static,
    ) {
        self.rules.push(TaskRule {
            from,
            child_state,
            to,
            handler: Arc::new(handler),
        });
        self.queues.entry(from).or_default();
    }

    /// Declared end state of this task
    pub fn end_state(&self) -> StateId {
        self.end_state
    }

    fn rule_for(&self, from: StateId, child_state: StateId) -> Option<&TaskRule> {
        self.rules
            .iter()
            .find(|r| r.from == from && r.child_state == child_state)
    }

    fn fail(&self, error: ActivityError) {
        self.core.set_error(error);
        if let Err(e) = self.core.state().assign(FAILED) {
            tracing::debug!(task = %self.core.id(), error = %e, "task already terminal");
        }
    }

    /// The private sequential control loop; runs on a dedicated thread
    fn run_loop(&self, engine: &ActivityManager, this: &Arc<dyn Activity>) {
        loop {
            let current = self.core.state().current();
            if current == self.end_state || self.core.state().is_terminal() {
                break;
            }
            // An engine that has not been started yet is not a reason to
            // exit; only an actual shutdown is.
            if engine.is_shutdown() {
                break;
            }

            let Some(queue) = self.queues.get(&current) else {
                // No queue for this state: wait for someone to move it.
                self.signal.wait_for(LOOP_WAIT);
                continue;
            };

            let Some(event) = queue.pop_timeout(LOOP_WAIT) else {
                continue;
            };

            let Some(rule) = self.rule_for(current, event.state) else {
                tracing::debug!(
                    task = %self.core.id(),
                    child = %event.child.core().id(),
                    child_state = %event.state,
                    state = %current,
                    "dropping child event with no rule in current state"
                );
                continue;
            };

            match self.core.state().compare_and_assign(current, rule.to) {
                Ok(true) => {
                    if let Err(e) = (rule.handler)(engine, this, &event.child) {
                        tracing::error!(
                            task = %self.core.id(),
                            error = %e,
                            "task handler failed"
                        );
                        self.fail(ActivityError::HandlerFailed(e.to_string()));
                        break;
                    }
                }
                Ok(false) => {
                    // State moved under us; requeue and re-evaluate.
                    queue.push_front(event);
                }
                Err(_) => break,
            }
        }
        tracing::debug!(
            task = %self.core.id(),
            state = %self.core.state().current(),
            "task control loop exited"
        );
    }
}

impl Activity for TaskActivity {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn initiate(&self, engine: &ActivityManager) -> Result<()> {
        let id = self.core.id();
        let this = engine
            .activity(id)
            .ok_or(ActivityError::NotFound(id))?;

        // Wake the control loop whenever the task's own state moves.
        let signal = Arc::clone(&self.signal);
        self.core.state().add_listener(move |_, _| signal.notify())?;

        if let Some(start) = &self.start_fn {
            start(engine, &this).map_err(|e| ActivityError::HandlerFailed(e.to_string()))?;
        }

        let engine = engine.clone();
        thread::Builder::new()
            .name(format!("parley-task-{id}"))
            .spawn(move || {
                if let Some(this) = engine.activity(id) {
                    if let Some(task) = this.as_any().downcast_ref::<TaskActivity>() {
                        task.run_loop(&engine, &this);
                    }
                }
            })
            .map_err(|e| ActivityError::HandlerFailed(format!("task thread spawn: {e}")))?;

        Ok(())
    }

    fn handle_message(
        &self,
        _engine: &ActivityManager,
        message: &super::message::Message,
    ) -> Result<()> {
        // Tasks coordinate through their sub-activities; a direct message
        // has no meaning and earns a NotUnderstood from the dispatch path.
        Err(super::error::ProtocolError::NoTransition {
            state: self.core.state().current(),
            performative: message.performative,
        }
        .into())
    }

    fn handle_child_transition(
        &self,
        _engine: &ActivityManager,
        child: &Arc<dyn Activity>,
        state: StateId,
    ) -> Result<()> {
        let mut routed = false;
        for rule in self.rules.iter().filter(|r| r.child_state == state) {
            if let Some(queue) = self.queues.get(&rule.from) {
                queue.push(ChildEvent {
                    child: Arc::clone(child),
                    state,
                });
                routed = true;
            }
        }
        if !routed {
            tracing::debug!(
                task = %self.core.id(),
                child = %child.core().id(),
                child_state = %state,
                "child state change matches no rule"
            );
        }
        Ok(())
    }
}
