//! Structural change notifications, one broadcast channel per knowledge base.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A structural change committed to a knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    PageCreated {
        id: String,
        parent: Option<String>,
    },
    PageMoved {
        id: String,
        old_parent: Option<String>,
        new_parent: Option<String>,
    },
    PageDeleted {
        id: String,
    },
    /// A page sibling group was bulk-reordered.
    PagesReordered {
        parent: Option<String>,
    },
    /// Block order or nesting changed on a page.
    BlockReordered {
        page_id: String,
    },
    LinkAdded {
        source: String,
        target: String,
    },
    LinkRemoved {
        source: String,
        target: String,
    },
    KnowledgeBaseDeleted {
        id: String,
    },
}

/// An event as delivered to subscribers.
///
/// `seq` starts at 1 and increases by one per event on a knowledge base's
/// channel, so consumers can drop duplicates and detect gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventEnvelope {
    pub kb_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: ChangeEvent,
}

struct Channel {
    sender: broadcast::Sender<EventEnvelope>,
    last_seq: u64,
    /// The most recent envelopes, oldest first, for subscribers catching up.
    history: VecDeque<EventEnvelope>,
}

/// Fans events out to subscribers of each knowledge base.
///
/// Publishing never blocks: each subscriber has its own cursor into a bounded
/// ring buffer, and one that falls behind sees `RecvError::Lagged` without
/// affecting anyone else. Events for a knowledge base nobody has subscribed
/// to are dropped.
///
/// Each channel also keeps the last `history` envelopes so a lagged
/// subscriber can [`replay`](Notifier::replay) what it missed.
pub struct Notifier {
    capacity: usize,
    history: usize,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Notifier {
    pub fn new(capacity: usize, history: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a knowledge base's events, creating its channel on first use.
    pub fn subscribe(&self, kb_id: &str) -> broadcast::Receiver<EventEnvelope> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(kb_id.to_string())
            .or_insert_with(|| Channel {
                sender: broadcast::channel(self.capacity).0,
                last_seq: 0,
                history: VecDeque::new(),
            })
            .sender
            .subscribe()
    }

    /// Number of live receivers for a knowledge base.
    pub fn subscriber_count(&self, kb_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(kb_id).map_or(0, |c| c.sender.receiver_count())
    }

    /// Sends events in order. Callers hold the knowledge base's write lock,
    /// which makes delivery order match commit order.
    pub fn publish(&self, kb_id: &str, events: impl IntoIterator<Item = ChangeEvent>) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = channels.get_mut(kb_id) else {
            return;
        };
        for event in events {
            channel.last_seq += 1;
            let envelope = EventEnvelope {
                kb_id: kb_id.to_string(),
                seq: channel.last_seq,
                event,
            };
            if self.history > 0 {
                if channel.history.len() == self.history {
                    channel.history.pop_front();
                }
                channel.history.push_back(envelope.clone());
            }
            match channel.sender.send(envelope) {
                Ok(n) => debug!(kb_id, seq = channel.last_seq, subscribers = n, "change event sent"),
                Err(_) => {
                    // Every receiver is gone.
                }
            }
        }
    }

    /// Envelopes published after `after_seq`, oldest first.
    ///
    /// `None` means some of them are no longer retained (or the channel is
    /// gone), and the caller has to re-read state instead.
    pub fn replay(&self, kb_id: &str, after_seq: u64) -> Option<Vec<EventEnvelope>> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = channels.get(kb_id)?;
        if after_seq >= channel.last_seq {
            return Some(Vec::new());
        }
        let oldest = channel.history.front().map_or(channel.last_seq + 1, |e| e.seq);
        if after_seq + 1 < oldest {
            return None;
        }
        Some(
            channel
                .history
                .iter()
                .filter(|e| e.seq > after_seq)
                .cloned()
                .collect(),
        )
    }

    /// Drains `rx` and fills any gap after `last_seq` from history, so the
    /// result continues exactly where the caller left off. Advances
    /// `last_seq` past what it returns.
    ///
    /// Returns `None` when the gap reaches further back than the history; the
    /// caller should re-read state and resume from the current sequence.
    pub fn catch_up(
        &self,
        kb_id: &str,
        rx: &mut broadcast::Receiver<EventEnvelope>,
        last_seq: &mut u64,
    ) -> Option<Vec<EventEnvelope>> {
        let mut received = Vec::new();
        let mut lagged = false;
        loop {
            match rx.try_recv() {
                Ok(envelope) => received.push(envelope),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(kb_id, skipped, "event subscriber lagged; replaying from history");
                    lagged = true;
                }
                Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => break,
            }
        }

        let gap = received.iter().find(|e| e.seq > *last_seq).is_some_and(|e| e.seq > *last_seq + 1);
        let mut out = if lagged || gap {
            match self.replay(kb_id, *last_seq) {
                Some(events) => events,
                None => {
                    warn!(kb_id, last_seq = *last_seq, "missed events are older than the history; state should be re-read");
                    return None;
                }
            }
        } else {
            Vec::new()
        };

        for envelope in received {
            if envelope.seq > out.last().map_or(*last_seq, |e| e.seq) {
                out.push(envelope);
            }
        }
        if let Some(last) = out.last() {
            *last_seq = last.seq;
        }
        Some(out)
    }

    /// Drops a knowledge base's channel. Receivers see `Closed` once they
    /// have drained what was already sent.
    pub fn close(&self, kb_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.remove(kb_id);
    }
}

/// Takes every event currently buffered for `rx` without waiting. A lagged
/// receiver skips the events it missed and logs how many.
pub fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(envelope) => out.push(envelope),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged; replay the gap or re-read state");
            }
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => break,
        }
    }
    out
}
