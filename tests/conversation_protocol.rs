//! End-to-end proposal protocol on the initiator side: speak a proposal,
//! receive the acceptance, speak the confirmation, observe the state
//! sequence and the released completion handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use parley::EngineConfig;
use parley::engine::{
    Activity, ActivityManager, Conversation, Message, Performative, RecordingTransport, StateId,
    Target, Transport,
};
use parley::engine::state::{ACCEPTED, CONFIRMED, PROPOSED, STARTED};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

#[test]
fn test_initiator_runs_full_proposal_protocol() {
    init_tracing();
    let transport = Arc::new(RecordingTransport::new());
    let engine = ActivityManager::with_transport(
        EngineConfig::default(),
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    engine.start().unwrap();

    let peer = Target::new("peer-b");
    let conversation = Arc::new(Conversation::proposal_to(peer.clone()));
    let id = conversation.core().id();

    let events: Arc<Mutex<Vec<(StateId, StateId)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    conversation
        .core()
        .state()
        .add_listener(move |from, to| sink.lock().push((from, to)))
        .unwrap();

    let handle = engine
        .initiate_activity(Arc::clone(&conversation) as Arc<dyn Activity>, None, None)
        .unwrap();

    // Speak the proposal; the outbound step advances started -> proposed.
    conversation
        .say(
            &engine,
            Message::new(
                Performative::Propose,
                Target::new("local"),
                Target::new("local"),
                serde_json::json!({"price": 10}),
            ),
        )
        .unwrap();
    assert!(conversation.core().state().is(PROPOSED));

    // The counterparty accepts; delivery goes through the scheduler.
    let acceptance = Message::new(
        Performative::AcceptProposal,
        peer.clone(),
        peer.clone(),
        serde_json::Value::Null,
    )
    .with_conversation(id);
    engine.handle_message(acceptance).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        conversation.core().state().is(ACCEPTED)
    }));

    // Confirm; the terminal protocol state releases the handle.
    conversation
        .say(
            &engine,
            Message::new(
                Performative::Confirm,
                Target::new("local"),
                Target::new("local"),
                serde_json::Value::Null,
            ),
        )
        .unwrap();

    let result = handle.wait_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(result.state, CONFIRMED);
    assert!(result.is_success());
    assert_eq!(
        events.lock().as_slice(),
        &[
            (STARTED, PROPOSED),
            (PROPOSED, ACCEPTED),
            (ACCEPTED, CONFIRMED),
        ]
    );

    // Both spoken messages went to the counterparty with increasing clocks.
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(target, _)| *target == peer));
    assert_eq!(sent[0].1.performative, Performative::Propose);
    assert_eq!(sent[1].1.performative, Performative::Confirm);
    assert!(sent[0].1.clock < sent[1].1.clock);
    assert_eq!(sent[0].1.conversation_id, Some(id));

    // Terminal activities deregister.
    assert_eq!(engine.live_count(), 0);
    assert!(engine.activity(id).is_none());

    engine.stop().unwrap();
}

#[test]
fn test_receiver_side_is_constructed_from_first_message() {
    let transport = Arc::new(RecordingTransport::new());
    let engine = ActivityManager::with_transport(
        EngineConfig::default(),
        Arc::clone(&transport) as Arc<dyn Transport>,
    );
    engine
        .register_activity_type(
            parley::engine::PROPOSAL_TYPE,
            Arc::new(parley::engine::TransitionTable::new()),
            |_, id, _| Ok(Arc::new(Conversation::proposal_with_id(id))),
        )
        .unwrap();
    engine.start().unwrap();

    let initiator = Target::new("peer-a");
    let id = parley::engine::ActivityId::new();
    let proposal = Message::new(
        Performative::Propose,
        initiator.clone(),
        initiator.clone(),
        serde_json::json!({"price": 10}),
    )
    .with_conversation(id)
    .with_activity_type(parley::engine::PROPOSAL_TYPE);
    engine.handle_message(proposal).unwrap();

    // Constructed, registered, and advanced by the very first message.
    assert!(wait_until(Duration::from_secs(2), || {
        engine
            .activity(id)
            .is_some_and(|a| a.core().state().is(PROPOSED))
    }));

    let conversation = engine.activity(id).unwrap();
    let conversation = conversation
        .as_any()
        .downcast_ref::<Conversation>()
        .unwrap();
    // The counterparty was bound lazily from the message.
    assert_eq!(conversation.peer(), Some(initiator));

    engine.stop().unwrap();
}
