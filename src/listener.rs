//! The pair listener: one logical document lives in two addressable slots
//! (its draft and its published identity), each with its own real-time
//! channel. This module merges the two channels into a single time-ordered
//! event stream. Within one slot events arrive in server-applied order;
//! across slots there is no ordering guarantee, the two identities evolve
//! independently.

use std::fmt;

use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::debug;

use crate::mutation::{Snapshot, Transaction};

/// One of the two addressable identities of a logical document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Draft,
    Published,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Draft => write!(f, "draft"),
            Slot::Published => write!(f, "published"),
        }
    }
}

/// The id pair of a logical document. At most one of the two slots holds a
/// document in the authoritative store at any time, though both may be
/// transiently absent or present during transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdPair {
    pub draft_id: SmolStr,
    pub published_id: SmolStr,
}

impl IdPair {
    pub fn new(draft_id: impl Into<SmolStr>, published_id: impl Into<SmolStr>) -> IdPair {
        IdPair {
            draft_id: draft_id.into(),
            published_id: published_id.into(),
        }
    }

    /// The conventional pair for a published document id: drafts live under
    /// the `drafts.` prefix.
    pub fn for_document(published_id: &str) -> IdPair {
        IdPair {
            draft_id: SmolStr::new(format!("drafts.{}", published_id)),
            published_id: SmolStr::new(published_id),
        }
    }

    pub fn id_for(&self, slot: Slot) -> &SmolStr {
        match slot {
            Slot::Draft => &self.draft_id,
            Slot::Published => &self.published_id,
        }
    }

    pub fn slot_of(&self, document_id: &str) -> Option<Slot> {
        if document_id == self.draft_id {
            Some(Slot::Draft)
        } else if document_id == self.published_id {
            Some(Slot::Published)
        } else {
            None
        }
    }
}

/// What a single slot's channel delivers.
///
/// The transport must send one `Snapshot` at subscribe time, `Mutation`s in
/// server-applied order afterwards, and a `Reconnect` whenever the
/// connection was interrupted and resumed — followed by a fresh `Snapshot`
/// for the slot, since incremental events may have been missed. Connection
/// loss is never silently swallowed.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEvent {
    Snapshot(Snapshot),
    Mutation(Transaction),
    Reconnect,
}

/// A slot event tagged with the slot it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Snapshot { slot: Slot, snapshot: Snapshot },
    Mutation { slot: Slot, transaction: Transaction },
    Reconnect,
}

/// The transport collaborator: hands out one event channel per document id.
/// Dropping the receiver is the explicit close; the transport must stop
/// delivering and release the server-side subscription when it observes it.
pub trait Listen {
    fn subscribe(&self, document_id: &str) -> mpsc::UnboundedReceiver<SlotEvent>;
}

/// Merges the two slot channels of one id pair into a single stream.
///
/// Per-slot FIFO order is preserved; the interleaving across slots is
/// unspecified. `close` drops both receivers synchronously, after which no
/// further event is delivered and no background work remains.
pub struct PairListener {
    draft: Option<mpsc::UnboundedReceiver<SlotEvent>>,
    published: Option<mpsc::UnboundedReceiver<SlotEvent>>,
}

impl PairListener {
    pub fn open(transport: &impl Listen, ids: &IdPair) -> PairListener {
        debug!(draft = %ids.draft_id, published = %ids.published_id, "subscribing to pair");
        PairListener {
            draft: Some(transport.subscribe(&ids.draft_id)),
            published: Some(transport.subscribe(&ids.published_id)),
        }
    }

    pub fn from_channels(
        draft: mpsc::UnboundedReceiver<SlotEvent>,
        published: mpsc::UnboundedReceiver<SlotEvent>,
    ) -> PairListener {
        PairListener {
            draft: Some(draft),
            published: Some(published),
        }
    }

    /// The next merged event; `None` once both channels have ended.
    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        loop {
            match (self.draft.as_mut(), self.published.as_mut()) {
                (None, None) => return None,
                (Some(draft), None) => match draft.recv().await {
                    Some(event) => return Some(tag(Slot::Draft, event)),
                    None => self.draft = None,
                },
                (None, Some(published)) => match published.recv().await {
                    Some(event) => return Some(tag(Slot::Published, event)),
                    None => self.published = None,
                },
                (Some(draft), Some(published)) => {
                    let mut ended = None;
                    tokio::select! {
                        event = draft.recv() => match event {
                            Some(event) => return Some(tag(Slot::Draft, event)),
                            None => ended = Some(Slot::Draft),
                        },
                        event = published.recv() => match event {
                            Some(event) => return Some(tag(Slot::Published, event)),
                            None => ended = Some(Slot::Published),
                        },
                    }
                    match ended {
                        Some(Slot::Draft) => self.draft = None,
                        Some(Slot::Published) => self.published = None,
                        None => {}
                    }
                }
            }
        }
    }

    /// Drop both subscriptions. Synchronous: nothing is delivered after this
    /// returns.
    pub fn close(&mut self) {
        self.draft = None;
        self.published = None;
    }

    pub fn is_closed(&self) -> bool {
        self.draft.is_none() && self.published.is_none()
    }
}

fn tag(slot: Slot, event: SlotEvent) -> ListenerEvent {
    match event {
        SlotEvent::Snapshot(snapshot) => ListenerEvent::Snapshot { slot, snapshot },
        SlotEvent::Mutation(transaction) => ListenerEvent::Mutation { slot, transaction },
        SlotEvent::Reconnect => ListenerEvent::Reconnect,
    }
}
