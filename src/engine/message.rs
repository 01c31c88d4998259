//! Messages, performatives, identifiers, and collaborator traits
//!
//! The engine never parses transport framing; it consumes and produces
//! `Message` values and hands them to a `Transport` implementation supplied
//! by the embedding peer process. The logical clock used to stamp outbound
//! messages is likewise supplied externally through `ClockSource`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for an activity or conversation (128-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ActivityId(pub Uuid);

impl ActivityId {
    /// Create a new random ActivityId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Speech-act tag of a message, used purely for transition matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Performative {
    /// Ask the receiver to perform an action
    Request,
    /// Pass information to the receiver
    Inform,
    /// Agree to a previously received request
    Agree,
    /// Refuse a previously received request
    Refuse,
    /// Submit a proposal
    Propose,
    /// Accept a previously received proposal
    AcceptProposal,
    /// Reject a previously received proposal
    RejectProposal,
    /// Confirm an accepted proposal
    Confirm,
    /// Disconfirm an accepted proposal
    Disconfirm,
    /// Solicit proposals from a set of peers
    CallForProposal,
    /// The sender could not interpret a received message
    NotUnderstood,
}

/// Opaque descriptor of a peer endpoint
///
/// The engine treats targets as tokens: it compares them and passes them to
/// the transport, never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target(pub String);

impl Target {
    /// Create a target from any string-like descriptor
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self(descriptor.into())
    }

    /// Get the inner descriptor
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A performative-tagged message exchanged between peers
///
/// Field shape only; the wire format belongs to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Speech-act tag driving transition matching
    pub performative: Performative,

    /// Conversation/activity this message belongs to
    pub conversation_id: Option<ActivityId>,

    /// Parent activity, set when announcing a sub-unit of work
    pub parent_id: Option<ActivityId>,

    /// Activity type to instantiate when no activity exists locally
    pub activity_type: Option<String>,

    /// Peer that produced the message
    pub sender: Target,

    /// Where replies to this message should be addressed
    pub reply_to: Target,

    /// Opaque payload, never interpreted by the scheduler
    pub content: serde_json::Value,

    /// External logical clock value for message ordering
    pub clock: u64,

    /// Wall-clock send time (debug metadata, never used for ordering)
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with no conversation id and an unstamped clock
    pub fn new(
        performative: Performative,
        sender: Target,
        reply_to: Target,
        content: serde_json::Value,
    ) -> Self {
        Self {
            performative,
            conversation_id: None,
            parent_id: None,
            activity_type: None,
            sender,
            reply_to,
            content,
            clock: 0,
            sent_at: Utc::now(),
        }
    }

    /// Build a reply to this message, carrying over the conversation id
    ///
    /// The reply is addressed by sending it to `self.reply_to`; this only
    /// constructs the value.
    pub fn reply(&self, performative: Performative, sender: Target, content: serde_json::Value) -> Self {
        Self {
            performative,
            conversation_id: self.conversation_id,
            parent_id: None,
            activity_type: None,
            reply_to: sender.clone(),
            sender,
            content,
            clock: 0,
            sent_at: Utc::now(),
        }
    }

    /// Attach a conversation id
    pub fn with_conversation(mut self, id: ActivityId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    /// Attach a parent activity id
    pub fn with_parent(mut self, id: ActivityId) -> Self {
        self.parent_id = Some(id);
        self
    }

    /// Attach an activity type for remote instantiation
    pub fn with_activity_type(mut self, type_name: impl Into<String>) -> Self {
        self.activity_type = Some(type_name.into());
        self
    }
}

/// Outbound message delivery, implemented by the embedding peer
pub trait Transport: Send + Sync {
    /// Send a message to a single target
    fn send(&self, target: &Target, message: Message) -> anyhow::Result<()>;

    /// Send a message to every reachable peer
    fn broadcast(&self, message: Message) -> anyhow::Result<()>;
}

/// Monotonic logical clock supplied by the embedding peer
pub trait ClockSource: Send + Sync {
    /// Produce the next clock value; successive calls strictly increase
    fn tick(&self) -> u64;
}

/// Default in-process clock backed by an atomic counter
#[derive(Debug, Default)]
pub struct CountingClock {
    counter: AtomicU64,
}

impl CountingClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClockSource for CountingClock {
    fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Candidate-peer lookup for broadcast-style tasks (call-for-proposal fan-out)
pub trait TargetDirectory: Send + Sync {
    /// Yield the targets satisfying the given predicate
    fn targets(&self, filter: &dyn Fn(&Target) -> bool) -> Vec<Target>;
}

/// Directory over a fixed set of targets
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<Target>,
}

impl StaticDirectory {
    /// Create a directory over the given targets
    pub fn new(entries: Vec<Target>) -> Self {
        Self { entries }
    }
}

impl TargetDirectory for StaticDirectory {
    fn targets(&self, filter: &dyn Fn(&Target) -> bool) -> Vec<Target> {
        self.entries.iter().filter(|t| filter(t)).cloned().collect()
    }
}

/// In-memory transport that records every send, for tests and embedding
/// processes that loop messages back locally
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Target, Message)>>,
    broadcasts: Mutex<Vec<Message>>,
}

impl RecordingTransport {
    /// Create an empty recording transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every `(target, message)` pair sent so far
    pub fn sent(&self) -> Vec<(Target, Message)> {
        self.sent.lock().clone()
    }

    /// Snapshot of every broadcast so far
    pub fn broadcasts(&self) -> Vec<Message> {
        self.broadcasts.lock().clone()
    }

    /// Messages sent with the given performative
    pub fn sent_with(&self, performative: Performative) -> Vec<(Target, Message)> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, m)| m.performative == performative)
            .cloned()
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, target: &Target, message: Message) -> anyhow::Result<()> {
        self.sent.lock().push((target.clone(), message));
        Ok(())
    }

    fn broadcast(&self, message: Message) -> anyhow::Result<()> {
        self.broadcasts.lock().push(message);
        Ok(())
    }
}

/// Transport that forwards every send onto a crossbeam channel
///
/// Useful when a test or embedding process wants to pump deliveries itself.
pub struct ChannelTransport {
    sender: crossbeam::channel::Sender<(Target, Message)>,
}

impl ChannelTransport {
    /// Create a transport plus the receiving end of its channel
    pub fn pair() -> (Self, crossbeam::channel::Receiver<(Target, Message)>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, target: &Target, message: Message) -> anyhow::Result<()> {
        self.sender
            .send((target.clone(), message))
            .map_err(|_| anyhow::anyhow!("channel transport receiver dropped"))
    }

    fn broadcast(&self, message: Message) -> anyhow::Result<()> {
        self.send(&Target::new("*"), message)
    }
}
