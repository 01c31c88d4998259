//! Scheduler behavior observable from outside: per-tree serialization,
//! centralized NotUnderstood replies, bounded completion waits, and the
//! waiting-caller priority boost.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parley::EngineConfig;
use parley::engine::{
    Activity, ActivityCore, ActivityManager, Conversation, Message, Performative,
    RecordingTransport, Result, Target, Transport,
};
use parley::engine::state::STARTED;

/// Test activity that records handler concurrency per tree
struct Probe {
    core: ActivityCore,
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    handled: Arc<AtomicUsize>,
    delay: Duration,
}

impl Probe {
    fn new(
        current: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
        handled: Arc<AtomicUsize>,
        delay: Duration,
    ) -> Self {
        Self {
            core: ActivityCore::new("probe"),
            current,
            max_seen,
            handled,
            delay,
        }
    }
}

impl Activity for Probe {
    fn core(&self) -> &ActivityCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn initiate(&self, _engine: &ActivityManager) -> Result<()> {
        Ok(())
    }

    fn handle_message(&self, _engine: &ActivityManager, _message: &Message) -> Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn recording_engine(workers: usize) -> (ActivityManager, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let engine = ActivityManager::with_transport(
        EngineConfig {
            workers,
            ..EngineConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    (engine, transport)
}

fn inbound(performative: Performative, id: parley::engine::ActivityId) -> Message {
    let peer = Target::new("remote");
    Message::new(performative, peer.clone(), peer, serde_json::Value::Null).with_conversation(id)
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn test_tree_actions_never_run_concurrently() {
    init_tracing();
    let (engine, _) = recording_engine(4);
    engine.start().unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    // Root and child share the counters along with the action queue.
    let root = Arc::new(Probe::new(
        Arc::clone(&current),
        Arc::clone(&max_seen),
        Arc::clone(&handled),
        Duration::from_millis(10),
    ));
    let child = Arc::new(Probe::new(
        Arc::clone(&current),
        Arc::clone(&max_seen),
        Arc::clone(&handled),
        Duration::from_millis(10),
    ));
    let root_id = root.core().id();
    let child_id = child.core().id();
    engine
        .initiate_activity(root as Arc<dyn Activity>, None, None)
        .unwrap();
    engine
        .initiate_activity(child as Arc<dyn Activity>, Some(root_id), None)
        .unwrap();

    for i in 0..12 {
        let target = if i % 2 == 0 { root_id } else { child_id };
        engine
            .handle_message(inbound(Performative::Inform, target))
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        handled.load(Ordering::SeqCst) == 12
    }));
    // Four workers were available, yet the tree stayed serialized.
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);

    engine.stop().unwrap();
}

#[test]
fn test_unmatched_message_earns_not_understood() {
    let (engine, transport) = recording_engine(2);
    engine.start().unwrap();

    let conversation = Arc::new(Conversation::proposal_to(Target::new("remote")));
    let id = conversation.core().id();
    engine
        .initiate_activity(Arc::clone(&conversation) as Arc<dyn Activity>, None, None)
        .unwrap();

    // No step from `started` on Confirm.
    engine
        .handle_message(inbound(Performative::Confirm, id))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        transport.sent_with(Performative::NotUnderstood).len() == 1
    }));
    let (target, reply) = transport.sent_with(Performative::NotUnderstood).remove(0);
    assert_eq!(target, Target::new("remote"));
    assert_eq!(reply.conversation_id, Some(id));

    // The mismatch neither failed nor advanced the conversation.
    assert!(conversation.core().state().is(STARTED));
    assert!(engine.activity(id).is_some());

    engine.stop().unwrap();
}

#[test]
fn test_wait_timeout_leaves_activity_untouched() {
    let (engine, _) = recording_engine(1);

    let probe = Arc::new(Probe::new(
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Duration::ZERO,
    ));
    let id = probe.core().id();
    let handle = engine
        .initiate_activity(probe as Arc<dyn Activity>, None, None)
        .unwrap();

    let start = Instant::now();
    assert!(handle.wait_timeout(Duration::from_millis(100)).is_none());
    assert!(start.elapsed() >= Duration::from_millis(100));

    // Nothing completed, nothing failed.
    assert!(!handle.is_complete());
    assert!(engine.activity(id).is_some_and(|a| a.core().state().is(STARTED)));
}

#[test]
fn test_waited_on_conversation_overtakes_backlog() {
    init_tracing();
    // One worker, so the backlog tree and the waited-on conversation
    // compete for a single execution slot.
    let (engine, _) = recording_engine(1);
    engine.start().unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let backlog = Arc::new(Probe::new(
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Arc::clone(&handled),
        Duration::from_millis(30),
    ));
    let backlog_id = backlog.core().id();
    engine
        .initiate_activity(backlog as Arc<dyn Activity>, None, None)
        .unwrap();
    for _ in 0..10 {
        engine
            .handle_message(inbound(Performative::Inform, backlog_id))
            .unwrap();
    }

    let conversation = Arc::new(Conversation::proposal_with_id(
        parley::engine::ActivityId::new(),
    ));
    let id = conversation.core().id();
    let handle = engine
        .initiate_activity(conversation as Arc<dyn Activity>, None, None)
        .unwrap();

    let waiter_handle = Arc::clone(&handle);
    let (sender, receiver) = crossbeam::channel::bounded(1);
    let waiter = thread::spawn(move || {
        let _ = sender.send(waiter_handle.wait());
    });
    assert!(wait_until(Duration::from_secs(2), || {
        handle.waiting_count() > 0
    }));

    // Drive the conversation to its terminal state; with a blocked waiter
    // these three actions outrank the probe backlog.
    for performative in [
        Performative::Propose,
        Performative::AcceptProposal,
        Performative::Confirm,
    ] {
        engine.handle_message(inbound(performative, id)).unwrap();
    }

    let result = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("waited-on conversation should finish despite the backlog");
    assert!(result.is_success());
    waiter.join().unwrap();

    engine.stop().unwrap();
}
