//! ActivityManager: type registry, live registry, and the scheduling loop
//!
//! The manager is the process-wide owner of the activity-id map, the parent
//! map, and the ready queue; everything that needs it receives it explicitly
//! (no hidden singletons). One dedicated scheduling thread picks root trees
//! and feeds single actions to the worker pool; workers re-admit the root
//! when the action completes, which is the sole re-admission path and the
//! source of the one-action-per-tree-at-a-time guarantee.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::Mutex;

use super::EngineConfig;
use super::activity::{Action, Activity, QueuedAction};
use super::completion::{ActivityResult, CompletionHandle};
use super::error::{ActivityError, EngineError, ProtocolError, Result, SchedulerError};
use super::message::{
    ActivityId, ClockSource, Message, Performative, Target, TargetDirectory, Transport,
};
use super::scheduler::{Job, ReadyQueue, SchedulingSnapshot, WorkerPool};
use super::state::{CREATED, FAILED, STARTED};
use super::transition::TransitionTable;

/// Constructor for a registered activity type
///
/// Invoked when a message announces a unit of work that does not yet exist
/// locally. Receives the engine (for the local target and registries), the
/// announced id, and the triggering message.
pub type ActivityFactory =
    Arc<dyn Fn(&ActivityManager, ActivityId, &Message) -> Result<Arc<dyn Activity>> + Send + Sync>;

/// Callback invoked once when an activity reaches a terminal state
pub type CompletionListener = Arc<dyn Fn(&ActivityResult) + Send + Sync>;

struct ActivityTypeInfo {
    table: Arc<TransitionTable>,
    factory: ActivityFactory,
}

struct Inner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn ClockSource>,
    directory: Arc<dyn TargetDirectory>,
    types: DashMap<String, ActivityTypeInfo>,
    activities: DashMap<ActivityId, Arc<dyn Activity>>,
    parents: DashMap<ActivityId, ActivityId>,
    ready: Arc<ReadyQueue>,
    running: AtomicBool,
    stopped: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Option<WorkerPool>>,
}

/// The engine: activity registries plus the fair scheduler
///
/// Cheap to clone; clones share one engine instance.
#[derive(Clone)]
pub struct ActivityManager {
    inner: Arc<Inner>,
}

impl ActivityManager {
    /// Create an engine with explicit collaborators
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn ClockSource>,
        directory: Arc<dyn TargetDirectory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                clock,
                directory,
                types: DashMap::new(),
                activities: DashMap::new(),
                parents: DashMap::new(),
                ready: Arc::new(ReadyQueue::new()),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                scheduler: Mutex::new(None),
                workers: Mutex::new(None),
            }),
        }
    }

    /// Create an engine with the default in-process clock and an empty
    /// directory
    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            config,
            transport,
            Arc::new(super::message::CountingClock::new()),
            Arc::new(super::message::StaticDirectory::default()),
        )
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The outbound transport collaborator
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The external logical clock
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.inner.clock
    }

    /// The peer/target directory collaborator
    pub fn directory(&self) -> &Arc<dyn TargetDirectory> {
        &self.inner.directory
    }

    /// Target other peers should address replies to
    pub fn local_target(&self) -> &Target {
        &self.inner.config.local_target
    }

    /// Whether the scheduling loop is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether `stop` has been called
    ///
    /// Distinct from `!is_running()`: an engine that was never started is
    /// not shut down, and control loops of activities registered before
    /// `start` keep waiting rather than exiting.
    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Register an activity type: its transition table (built once, shared
    /// by all instances) and its factory
    pub fn register_activity_type(
        &self,
        name: impl Into<String>,
        table: Arc<TransitionTable>,
        factory: impl Fn(&ActivityManager, ActivityId, &Message) -> Result<Arc<dyn Activity>>
        + Send
        + Sync
        + 'static,
    ) -> Result<()> {
        let name = name.into();
        if self.inner.types.contains_key(&name) {
            return Err(ProtocolError::DuplicateActivityType(name).into());
        }
        self.inner.types.insert(
            name,
            ActivityTypeInfo {
                table,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    /// The shared transition table of a registered type
    pub fn transition_table(&self, type_name: &str) -> Option<Arc<TransitionTable>> {
        self.inner
            .types
            .get(type_name)
            .map(|entry| Arc::clone(&entry.table))
    }

    /// Look up a live activity
    pub fn activity(&self, id: ActivityId) -> Option<Arc<dyn Activity>> {
        self.inner
            .activities
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Root of a live activity's ancestor chain
    pub fn root_of(&self, id: ActivityId) -> Option<ActivityId> {
        self.activity(id).map(|a| a.core().root())
    }

    /// Number of live activities
    pub fn live_count(&self) -> usize {
        self.inner.activities.len()
    }

    /// Total pending actions across all live trees
    pub fn pending_actions(&self) -> usize {
        self.inner
            .activities
            .iter()
            .filter(|entry| entry.value().core().root() == *entry.key())
            .map(|entry| entry.value().core().queue().len())
            .sum()
    }

    /// Register and start a locally originated activity
    ///
    /// Wires lifecycle listeners, marks the state `started`, admits the root
    /// for scheduling, and calls `initiate` exactly once. With a parent, the
    /// activity shares the parent's action queue and every state change is
    /// enqueued as a parent-targeted transition action. The returned handle
    /// is released when the activity reaches a terminal state.
    pub fn initiate_activity(
        &self,
        activity: Arc<dyn Activity>,
        parent: Option<ActivityId>,
        listener: Option<CompletionListener>,
    ) -> Result<Arc<CompletionHandle>> {
        self.register(activity, parent, listener, true)
    }

    fn register(
        &self,
        activity: Arc<dyn Activity>,
        parent: Option<ActivityId>,
        listener: Option<CompletionListener>,
        locally_initiated: bool,
    ) -> Result<Arc<CompletionHandle>> {
        let core = activity.core();
        let id = core.id();
        if self.inner.activities.contains_key(&id) {
            return Err(ActivityError::AlreadyRegistered(id).into());
        }

        // Parent wiring happens before the first enqueue so the whole tree
        // shares one physical queue from the start.
        if let Some(pid) = parent {
            let parent_activity = self
                .activity(pid)
                .ok_or(ActivityError::NotFound(pid))?;
            let parent_core = parent_activity.core();
            core.set_parent(pid, parent_core.root(), parent_core.queue());
            self.inner.parents.insert(id, pid);
        }

        self.inner.activities.insert(id, Arc::clone(&activity));

        // Child propagation: every state change becomes a parent-targeted
        // transition action on the shared queue. Registered before the
        // terminal listener so a terminal child is announced to its parent
        // before it is deregistered.
        if let Some(pid) = parent {
            let weak = Arc::downgrade(&activity);
            let queue = core.queue();
            let ready = Arc::clone(&self.inner.ready);
            core.state().add_listener(move |_, to| {
                if let Some(child) = weak.upgrade() {
                    queue.push(QueuedAction {
                        target: pid,
                        action: Action::ChildTransition { child, state: to },
                    });
                    ready.notify();
                }
            })?;
        }

        // Terminal lifecycle: release the completion handle, invoke the
        // listener, deregister, and retire the root from scheduling.
        {
            let weak = Arc::downgrade(&activity);
            let inner_weak = Arc::downgrade(&self.inner);
            core.state().add_listener(move |_, _| {
                let (Some(activity), Some(inner)) = (weak.upgrade(), inner_weak.upgrade()) else {
                    return;
                };
                if activity.core().state().is_terminal() {
                    finish_activity(&inner, &activity, listener.as_deref());
                }
            })?;
        }

        if core.state().is(CREATED) {
            core.state().assign(STARTED)?;
        }
        if parent.is_none() {
            self.inner.ready.insert(id);
        }

        if locally_initiated {
            tracing::debug!(activity = %id, type_name = core.type_name(), "initiating activity");
            if let Err(e) = activity.initiate(self) {
                self.fail_activity(id, e);
            }
        } else {
            tracing::debug!(activity = %id, type_name = core.type_name(), "registered remote activity");
        }

        Ok(core.completion())
    }

    /// Route one inbound message
    ///
    /// Known conversation ids get the message appended to their tree's
    /// action queue; unknown ids with a registered `activity_type` cause the
    /// type's factory to construct and register a new activity first (its
    /// `initiate` is *not* called: the unit originated remotely). The
    /// message is never processed inline; the scheduler controls execution
    /// order.
    pub fn handle_message(&self, message: Message) -> Result<()> {
        let Some(id) = message.conversation_id else {
            tracing::warn!("dropping message without conversation id");
            self.send_not_understood(&message);
            return Err(ProtocolError::MissingConversationId.into());
        };

        let activity = match self.activity(id) {
            Some(activity) => activity,
            None => match &message.activity_type {
                Some(type_name) => {
                    let Some(entry) = self.inner.types.get(type_name) else {
                        self.send_not_understood(&message);
                        return Err(ProtocolError::UnknownActivityType(type_name.clone()).into());
                    };
                    let factory = Arc::clone(&entry.factory);
                    drop(entry);

                    let activity = factory(self, id, &message)?;
                    let parent = message
                        .parent_id
                        .filter(|pid| self.inner.activities.contains_key(pid));
                    self.register(Arc::clone(&activity), parent, None, false)?;
                    activity
                }
                None => {
                    // Common benign case: a late message for a conversation
                    // that already completed and was deregistered.
                    tracing::warn!(conversation = %id, "message for unknown conversation");
                    self.send_not_understood(&message);
                    return Ok(());
                }
            },
        };

        activity.core().push_action(Action::HandleMessage(message));
        self.inner.ready.notify();
        Ok(())
    }

    /// Start the scheduling thread and the worker pool
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning.into());
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        *self.inner.workers.lock() = Some(WorkerPool::new(self.inner.config.workers)?);

        let engine = self.clone();
        let handle = thread::Builder::new()
            .name("parley-scheduler".to_string())
            .spawn(move || engine.scheduling_loop())
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
        *self.inner.scheduler.lock() = Some(handle);

        tracing::info!(workers = self.inner.config.workers, "engine started");
        Ok(())
    }

    /// Stop scheduling and abort still-live activities
    ///
    /// Queued work is treated as a best-effort abort: every live activity is
    /// failed with [`ActivityError::Shutdown`] so blocked completion waiters
    /// are released rather than left hanging.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning.into());
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.ready.notify();
        if let Some(handle) = self.inner.scheduler.lock().take() {
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }
        if let Some(pool) = self.inner.workers.lock().take() {
            pool.shutdown();
        }

        let live: Vec<Arc<dyn Activity>> = self
            .inner
            .activities
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for activity in live {
            let core = activity.core();
            core.set_error(ActivityError::Shutdown);
            if core.state().assign(FAILED).is_ok() {
                tracing::warn!(activity = %core.id(), "aborted by shutdown");
            }
        }

        tracing::info!("engine stopped");
        Ok(())
    }

    /// One full pass of the dedicated scheduling thread
    fn scheduling_loop(&self) {
        let idle = self.inner.config.idle_wait();
        while self.inner.running.load(Ordering::SeqCst) {
            let Some(root) = self
                .inner
                .ready
                .take_best(|id| self.snapshot_for(id), idle)
            else {
                continue;
            };
            if !self.inner.running.load(Ordering::SeqCst) {
                self.inner.ready.insert(root);
                break;
            }
            let Some(root_activity) = self.activity(root) else {
                continue;
            };

            match root_activity.core().queue().pop() {
                Some(action) => {
                    let engine = self.clone();
                    let job: Job = Box::new(move || engine.execute_action(root, action));
                    let submitted = {
                        let workers = self.inner.workers.lock();
                        match workers.as_ref() {
                            Some(pool) => pool.execute(job),
                            None => Err(SchedulerError::ShuttingDown),
                        }
                    };
                    if submitted.is_err() {
                        self.inner.ready.insert(root);
                    }
                }
                None => {
                    // Raced with a consumer; stamp and put the root back.
                    root_activity.core().stamp_last_action();
                    self.inner.ready.insert(root);
                }
            }
        }
    }

    /// Live scheduling facts for one root; refreshes the idle stamp of
    /// empty trees so they do not accumulate artificial age
    fn snapshot_for(&self, id: ActivityId) -> Option<SchedulingSnapshot> {
        let activity = self.activity(id)?;
        let core = activity.core();
        let queue_len = core.queue().len();
        if queue_len == 0 {
            core.stamp_last_action();
        }
        Some(SchedulingSnapshot {
            id,
            waiting: core.completion().waiting_count(),
            queue_len,
            idle: core.last_action().elapsed(),
        })
    }

    /// Execute one action on a worker thread, then re-admit the root
    fn execute_action(&self, root: ActivityId, action: QueuedAction) {
        let target = action.target;
        if self.inner.config.debug {
            tracing::debug!(%root, activity = %target, action = ?action.action, "executing action");
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(&action)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(EngineError::Protocol(ProtocolError::NoTransition {
                state,
                performative,
            }))) => {
                tracing::warn!(
                    activity = %target,
                    %state,
                    ?performative,
                    "message not understood"
                );
                if let Action::HandleMessage(message) = &action.action {
                    self.send_not_understood(message);
                }
            }
            Ok(Err(error)) => self.fail_activity(target, error),
            Err(panic) => self.fail_activity(
                target,
                ActivityError::HandlerFailed(format!("panic: {}", panic_message(panic))).into(),
            ),
        }

        // Sole re-admission path: completion of the action puts the root
        // back, keeping one in-flight action per tree.
        if let Some(root_activity) = self.activity(root) {
            root_activity.core().stamp_last_action();
            self.inner.ready.insert(root);
        }
    }

    fn dispatch(&self, action: &QueuedAction) -> Result<()> {
        let Some(target) = self.activity(action.target) else {
            tracing::debug!(activity = %action.target, "dropping action for deregistered activity");
            return Ok(());
        };
        match &action.action {
            Action::HandleMessage(message) => target.handle_message(self, message),
            Action::ChildTransition { child, state } => {
                target.handle_child_transition(self, child, *state)
            }
        }
    }

    /// Capture a failure into the activity's result and force `failed`
    fn fail_activity(&self, id: ActivityId, error: EngineError) {
        let activity_error = match error {
            EngineError::Activity(e) => e,
            other => ActivityError::HandlerFailed(other.to_string()),
        };
        let Some(activity) = self.activity(id) else {
            tracing::error!(activity = %id, error = %activity_error, "failure for unknown activity");
            return;
        };
        tracing::error!(activity = %id, error = %activity_error, "activity failed");
        let core = activity.core();
        core.set_error(activity_error);
        if let Err(e) = core.state().assign(FAILED) {
            tracing::debug!(activity = %id, error = %e, "activity already terminal");
        }
    }

    /// Centralized protocol-mismatch reply
    fn send_not_understood(&self, original: &Message) {
        // Never answer NotUnderstood with NotUnderstood.
        if original.performative == Performative::NotUnderstood {
            return;
        }
        let mut reply = original.reply(
            Performative::NotUnderstood,
            self.local_target().clone(),
            serde_json::json!({ "reason": "no registered transition" }),
        );
        reply.clock = self.inner.clock.tick();
        if let Err(e) = self.inner.transport.send(&original.reply_to, reply) {
            tracing::error!(error = %e, "failed to send NotUnderstood reply");
        }
    }
}

impl std::fmt::Debug for ActivityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityManager")
            .field("running", &self.is_running())
            .field("live", &self.live_count())
            .field("types", &self.inner.types.len())
            .finish()
    }
}

/// Terminal-state bookkeeping: release the handle, invoke the listener,
/// remove from the registries and the ready queue
fn finish_activity(
    inner: &Arc<Inner>,
    activity: &Arc<dyn Activity>,
    listener: Option<&(dyn Fn(&ActivityResult) + Send + Sync)>,
) {
    let core = activity.core();
    let result = ActivityResult {
        activity: core.id(),
        state: core.state().current(),
        error: core.take_error(),
    };
    if core.completion().complete(result.clone()) {
        tracing::info!(
            activity = %core.id(),
            state = %result.state,
            success = result.is_success(),
            "activity finished"
        );
        if let Some(callback) = listener {
            callback(&result);
        }
    }
    inner.activities.remove(&core.id());
    inner.parents.remove(&core.id());
    inner.ready.remove(core.id());

    // A finished activity takes its still-live children with it: once the
    // root of a tree is gone nothing re-admits the tree for scheduling, so
    // a surviving descendant would accept messages it can never process.
    // Failing each child cascades through its own terminal listener.
    let orphans: Vec<ActivityId> = inner
        .parents
        .iter()
        .filter(|entry| *entry.value() == core.id())
        .map(|entry| *entry.key())
        .collect();
    for orphan in orphans {
        let Some(child) = inner
            .activities
            .get(&orphan)
            .map(|entry| Arc::clone(entry.value()))
        else {
            inner.parents.remove(&orphan);
            continue;
        };
        let child_core = child.core();
        tracing::warn!(
            activity = %orphan,
            owner = %core.id(),
            state = %child_core.state().current(),
            "discarding activity with its finished owner"
        );
        child_core.set_error(ActivityError::OwnerFinished);
        if let Err(e) = child_core.state().assign(FAILED) {
            tracing::debug!(activity = %orphan, error = %e, "orphan already terminal");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
