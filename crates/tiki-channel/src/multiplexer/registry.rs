//! Bookkeeping owned by one multiplexer: the reference counter, pending
//! requests, joined topics and their timers.
//!
//! Only [`super::Inner`] touches a `Registry`, always under its mutex.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::frame::{Push, Reference};

/// Handler invoked for pushes matching a topic and event.
pub type PushHandler = Arc<dyn Fn(&Push) + Send + Sync>;

pub(crate) type ReplySender = oneshot::Sender<Result<Value, ChannelError>>;

/// Identifies a scheduled callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What an outstanding request was for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Join,
    Event(String),
    Leave,
}

/// A request waiting for its reply.
pub(crate) struct Pending {
    pub topic: String,
    pub kind: RequestKind,
    reply_tx: ReplySender,
}

impl Pending {
    pub fn new(topic: String, kind: RequestKind, reply_tx: ReplySender) -> Self {
        Self {
            topic,
            kind,
            reply_tx,
        }
    }

    /// Deliver the outcome. Consumes the entry, so it happens once.
    pub fn resolve(self, result: Result<Value, ChannelError>) {
        // The caller may have stopped waiting; that is not an error.
        let _ = self.reply_tx.send(result);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TopicStatus {
    Joining,
    Joined,
}

/// A topic hosted on the multiplexer.
pub(crate) struct TopicEntry {
    pub join_ref: Reference,
    pub status: TopicStatus,
    /// Parent of every timer token of this topic.
    pub cancel: CancellationToken,
    pub timers: HashMap<TimerId, CancellationToken>,
    pub handlers: Vec<(String, PushHandler)>,
}

impl TopicEntry {
    pub fn new(join_ref: Reference, cancel: CancellationToken) -> Self {
        Self {
            join_ref,
            status: TopicStatus::Joining,
            cancel,
            timers: HashMap::new(),
            handlers: Vec::new(),
        }
    }

    pub fn handlers_for(&self, event: &str) -> Vec<PushHandler> {
        self.handlers
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

pub(crate) struct Registry {
    next_ref: u64,
    next_timer: u64,
    pending: HashMap<Reference, Pending>,
    pub topics: HashMap<String, TopicEntry>,
    /// Reference of the heartbeat awaiting its reply.
    pub heartbeat: Option<Reference>,
    pub closed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_ref: 0,
            next_timer: 0,
            pending: HashMap::new(),
            topics: HashMap::new(),
            heartbeat: None,
            closed: false,
        }
    }

    /// Next reference. Never reused for the lifetime of the registry.
    pub fn allocate(&mut self) -> Reference {
        self.next_ref += 1;
        Reference::new(self.next_ref)
    }

    pub fn allocate_timer(&mut self) -> TimerId {
        self.next_timer += 1;
        TimerId(self.next_timer)
    }

    pub fn insert_pending(&mut self, reference: Reference, pending: Pending) {
        let previous = self.pending.insert(reference, pending);
        debug_assert!(previous.is_none(), "reference {reference} reused");
    }

    pub fn take_pending(&mut self, reference: Reference) -> Option<Pending> {
        self.pending.remove(&reference)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_joined(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|entry| entry.status == TopicStatus::Joined)
    }

    pub fn mark_joined(&mut self, topic: &str) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.status = TopicStatus::Joined;
        }
    }

    /// Remove a topic, cancel its timers and take its outstanding requests.
    pub fn remove_topic(&mut self, topic: &str) -> Option<(TopicEntry, Vec<Pending>)> {
        let entry = self.topics.remove(topic)?;
        entry.cancel.cancel();

        let refs: Vec<Reference> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.topic == topic)
            .map(|(reference, _)| *reference)
            .collect();
        let drained = refs
            .into_iter()
            .filter_map(|reference| self.pending.remove(&reference))
            .collect();

        Some((entry, drained))
    }

    /// Mark closed and take everything outstanding.
    pub fn close(&mut self) -> Vec<Pending> {
        self.closed = true;
        self.heartbeat = None;
        for (_, entry) in self.topics.drain() {
            entry.cancel.cancel();
        }
        self.pending.drain().map(|(_, pending)| pending).collect()
    }

    /// Cancel one timer wherever it lives.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        for entry in self.topics.values_mut() {
            if let Some(token) = entry.timers.remove(&id) {
                token.cancel();
                return true;
            }
        }
        false
    }

    /// Drop the bookkeeping of a one-shot timer that already fired.
    pub fn forget_timer(&mut self, topic: &str, id: TimerId) {
        if let Some(entry) = self.topics.get_mut(topic) {
            let _ = entry.timers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(topic: &str) -> (Pending, oneshot::Receiver<Result<Value, ChannelError>>) {
        let (tx, rx) = oneshot::channel();
        (Pending::new(topic.into(), RequestKind::Event("e".into()), tx), rx)
    }

    #[test]
    fn references_start_at_one_and_increase() {
        let mut registry = Registry::new();
        let refs: Vec<u64> = (0..4).map(|_| registry.allocate().get()).collect();
        assert_eq!(refs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn remove_topic_drains_only_its_requests() {
        let mut registry = Registry::new();
        let a = registry.allocate();
        let b = registry.allocate();
        let _ = registry
            .topics
            .insert("lv:a".into(), TopicEntry::new(a, CancellationToken::new()));
        let (p1, _rx1) = pending("lv:a");
        let (p2, _rx2) = pending("lv:b");
        registry.insert_pending(a, p1);
        registry.insert_pending(b, p2);

        let (entry, drained) = registry.remove_topic("lv:a").unwrap();
        assert!(entry.cancel.is_cancelled());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].topic, "lv:a");
        assert_eq!(registry.pending_len(), 1);
        assert!(registry.remove_topic("lv:a").is_none());
    }

    #[test]
    fn close_takes_everything_and_cancels_topics() {
        let mut registry = Registry::new();
        let r = registry.allocate();
        let token = CancellationToken::new();
        let _ = registry
            .topics
            .insert("lv:a".into(), TopicEntry::new(r, token.clone()));
        let (p, _rx) = pending("lv:a");
        registry.insert_pending(r, p);

        let drained = registry.close();
        assert_eq!(drained.len(), 1);
        assert!(registry.closed);
        assert!(token.is_cancelled());
        assert!(registry.topics.is_empty());
    }

    #[test]
    fn cancel_timer_finds_owning_topic() {
        let mut registry = Registry::new();
        let r = registry.allocate();
        let mut entry = TopicEntry::new(r, CancellationToken::new());
        let id = registry.allocate_timer();
        let token = entry.cancel.child_token();
        let _ = entry.timers.insert(id, token.clone());
        let _ = registry.topics.insert("lv:a".into(), entry);

        assert!(registry.cancel_timer(id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel_timer(id));
    }

    #[tokio::test]
    async fn resolve_delivers_once() {
        let (p, rx) = pending("lv:a");
        p.resolve(Ok(Value::Bool(true)));
        assert_eq!(rx.await.unwrap().unwrap(), Value::Bool(true));
    }
}
