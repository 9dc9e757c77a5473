//! The checked-out document pair: one buffered document per slot, driven by
//! the merged listener stream, exposed to the rendering layer as a single
//! logical document (the draft wins over the published version wherever both
//! exist).
//!
//! All state changes go through one owner: local edits are synchronous
//! calls, remote events are folded in by [`DocumentPair::next_event`], and
//! only [`DocumentPair::commit`] suspends. There is no internal locking
//! because there is no concurrent writer.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::debug;

use crate::buffer::{BufferEvent, BufferedDocument, CommitRequest};
use crate::error::{CommitError, MutationError};
use crate::keys::KeyGenerator;
use crate::listener::{IdPair, Listen, ListenerEvent, PairListener, Slot};
use crate::mutation::{Mutation, Transaction};
use crate::patch::PatchOp;
use crate::schema::Schema;
use crate::value::{ensure_array_keys, Value, KEY_FIELD};

/// Where a transaction reported by [`PairEvent::Mutation`] came from: an
/// echo of this pair's own commit, or another session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PairEvent {
    /// Both slots have delivered their initial (or post-reconnect) snapshot.
    Ready,
    /// The merged view changed; read it with [`DocumentPair::value`].
    ViewChanged,
    ConsistencyChanged(bool),
    Mutation {
        slot: Slot,
        transaction_id: SmolStr,
        origin: Origin,
    },
    /// A buffered local edit was dropped during a rebase. The edit should be
    /// re-derived against the current value.
    RebaseConflict {
        slot: Slot,
        transaction_id: SmolStr,
        error: MutationError,
    },
    /// The connection dropped; snapshots must arrive again before the pair
    /// is ready.
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitSuccess {
    pub transaction_id: SmolStr,
    pub result_rev: Option<SmolStr>,
}

/// The commit collaborator: ships one transaction to the remote store.
/// Every failure means the same thing to the buffer — keep the local edits.
pub trait CommitFunction {
    fn commit(
        &self,
        transaction: Transaction,
    ) -> impl Future<Output = Result<CommitSuccess, CommitError>> + Send;
}

pub struct DocumentPair {
    ids: IdPair,
    listener: PairListener,
    draft: BufferedDocument,
    published: BufferedDocument,
    keys: Arc<dyn KeyGenerator>,
    schema: Option<Schema>,
    queued: VecDeque<PairEvent>,
    last_view: Option<Arc<Value>>,
    ready: bool,
    was_consistent: bool,
}

impl DocumentPair {
    pub fn new(listener: PairListener, ids: IdPair, keys: Arc<dyn KeyGenerator>) -> DocumentPair {
        let draft = BufferedDocument::new(ids.draft_id.clone());
        let published = BufferedDocument::new(ids.published_id.clone());
        DocumentPair {
            ids,
            listener,
            draft,
            published,
            keys,
            schema: None,
            queued: VecDeque::new(),
            last_view: None,
            ready: false,
            was_consistent: false,
        }
    }

    /// Subscribe to both slots of `ids` on `transport` and check the pair
    /// out.
    pub fn checkout(
        transport: &impl Listen,
        ids: IdPair,
        keys: Arc<dyn KeyGenerator>,
    ) -> DocumentPair {
        let listener = PairListener::open(transport, &ids);
        DocumentPair::new(listener, ids, keys)
    }

    /// Attach a schema for pre-flight checks of staged patches.
    pub fn with_schema(mut self, schema: Schema) -> DocumentPair {
        self.schema = Some(schema);
        self
    }

    pub fn ids(&self) -> &IdPair {
        &self.ids
    }

    pub fn draft(&self) -> &BufferedDocument {
        &self.draft
    }

    pub fn published(&self) -> &BufferedDocument {
        &self.published
    }

    /// The merged optimistic view: the draft where one exists, otherwise the
    /// published document.
    pub fn value(&self) -> Option<Arc<Value>> {
        self.current_view()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_consistent(&self) -> bool {
        self.draft.is_consistent() && self.published.is_consistent()
    }

    /// Pump the listener and return the next consumer-facing notification.
    /// `None` once the listener has ended. Processing happens entirely
    /// inside this call; nothing runs in the background.
    pub async fn next_event(&mut self) -> Option<PairEvent> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some(event);
            }
            let event = self.listener.recv().await?;
            self.process(event);
        }
    }

    /// Stage a patch against the logical document. Editing a document that
    /// only exists in its published form springs the draft into existence as
    /// a copy, in the same transaction.
    pub fn patch(&mut self, ops: Vec<PatchOp>) -> Result<(), MutationError> {
        if let Some(schema) = &self.schema {
            if let Some(doc) = self.current_view() {
                if let Some(doc_type) = doc.get("_type").and_then(|v| v.as_str()) {
                    schema.check_ops(doc_type, &ops)?;
                }
            }
        }
        let keys = self.keys.clone();
        let ops: Vec<PatchOp> = ops
            .into_iter()
            .map(|op| ensure_op_keys(op, keys.as_ref()))
            .collect();
        let draft_id = self.ids.draft_id.clone();
        let mutations = if self.draft.value().is_some() {
            vec![Mutation::patch(draft_id, ops)]
        } else if let Some(published) = self.published.value() {
            let proto = draft_proto(published, &draft_id);
            vec![
                Mutation::create_if_not_exists(draft_id.clone(), proto),
                Mutation::patch(draft_id, ops),
            ]
        } else {
            return Err(MutationError::DocumentMissing { id: draft_id });
        };
        let transaction = Transaction::new(keys.generate(), mutations);
        let events = self.draft.stage(transaction)?;
        self.absorb(Slot::Draft, events);
        Ok(())
    }

    /// Stage the creation of a new draft document.
    pub fn create(&mut self, document: Value) -> Result<(), MutationError> {
        let Value::Object(mut props) = document else {
            return Err(MutationError::InvalidDocument {
                reason: "document must be an object",
            });
        };
        let draft_id = self.ids.draft_id.clone();
        if let Some(id) = props.get("_id").and_then(|v| v.as_str()) {
            if id != self.ids.draft_id && id != self.ids.published_id {
                return Err(MutationError::IdMismatch {
                    expected: draft_id,
                    actual: SmolStr::new(id),
                });
            }
        }
        props.insert(
            SmolStr::new("_id"),
            Arc::new(Value::String(draft_id.to_string())),
        );
        let keys = self.keys.clone();
        let document = ensure_array_keys(&Arc::new(Value::Object(props)), keys.as_ref());
        let transaction = Transaction::new(
            keys.generate(),
            vec![Mutation::create(draft_id, (*document).clone())],
        );
        let events = self.draft.stage(transaction)?;
        self.absorb(Slot::Draft, events);
        Ok(())
    }

    /// Stage the deletion of the logical document: every slot that
    /// currently holds a document gets a delete.
    pub fn delete(&mut self) -> Result<(), MutationError> {
        let keys = self.keys.clone();
        for slot in [Slot::Draft, Slot::Published] {
            if self.buffer(slot).value().is_none() {
                continue;
            }
            let id = self.ids.id_for(slot).clone();
            let transaction = Transaction::new(keys.generate(), vec![Mutation::delete(id)]);
            let events = self.buffer_mut(slot).stage(transaction)?;
            self.absorb(slot, events);
        }
        Ok(())
    }

    /// Send everything buffered so far through the commit function, draft
    /// first. Edits staged after this call started are not included. On
    /// failure the affected buffer keeps its edits and the error is returned
    /// to the caller; nothing is retried here.
    pub async fn commit<C: CommitFunction>(&mut self, client: &C) -> Result<(), CommitError> {
        let keys = self.keys.clone();
        for slot in [Slot::Draft, Slot::Published] {
            let request = self.buffer_mut(slot).prepare_commit(keys.as_ref())?;
            let Some(request) = request else {
                continue;
            };
            let transaction_id = request.transaction.id.clone();
            debug!(%slot, txn = %transaction_id, "submitting commit");
            match client.commit(request.transaction).await {
                Ok(success) => {
                    debug!(%slot, txn = %transaction_id, result_rev = ?success.result_rev, "commit succeeded");
                    self.buffer_mut(slot).commit_succeeded(&transaction_id);
                }
                Err(error) => {
                    self.buffer_mut(slot).commit_failed(&transaction_id);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Squash and dispatch manually instead of [`DocumentPair::commit`]:
    /// returns the requests to submit, to be acknowledged later with
    /// [`DocumentPair::commit_succeeded`] or [`DocumentPair::commit_failed`].
    pub fn prepare_commits(&mut self) -> Result<Vec<(Slot, CommitRequest)>, CommitError> {
        let keys = self.keys.clone();
        let mut requests = Vec::new();
        for slot in [Slot::Draft, Slot::Published] {
            if let Some(request) = self.buffer_mut(slot).prepare_commit(keys.as_ref())? {
                requests.push((slot, request));
            }
        }
        Ok(requests)
    }

    pub fn commit_succeeded(&mut self, slot: Slot, transaction_id: &str) {
        self.buffer_mut(slot).commit_succeeded(transaction_id);
    }

    pub fn commit_failed(&mut self, slot: Slot, transaction_id: &str) {
        self.buffer_mut(slot).commit_failed(transaction_id);
    }

    /// Tear the pair down: the listener subscription is released
    /// synchronously and no further event will be processed. An in-flight
    /// commit still runs to completion; its result is simply irrelevant.
    pub fn close(&mut self) {
        self.listener.close();
    }

    fn process(&mut self, event: ListenerEvent) {
        match event {
            ListenerEvent::Snapshot { slot, snapshot } => {
                let events = self.buffer_mut(slot).handle_snapshot(snapshot);
                self.absorb(slot, events);
                if !self.ready && self.draft.has_snapshot() && self.published.has_snapshot() {
                    self.ready = true;
                    self.queued.push_back(PairEvent::Ready);
                }
            }
            ListenerEvent::Mutation { slot, transaction } => {
                let events = self.buffer_mut(slot).handle_transaction(transaction);
                self.absorb(slot, events);
            }
            ListenerEvent::Reconnect => {
                let events = self.draft.handle_reconnect();
                self.absorb(Slot::Draft, events);
                let events = self.published.handle_reconnect();
                self.absorb(Slot::Published, events);
                if self.ready {
                    self.ready = false;
                    self.queued.push_back(PairEvent::Reconnecting);
                }
            }
        }
    }

    fn absorb(&mut self, slot: Slot, events: Vec<BufferEvent>) {
        for event in events {
            match event {
                // the pair derives its own view and consistency transitions
                BufferEvent::ViewChanged | BufferEvent::ConsistencyChanged(_) => {}
                BufferEvent::RemoteMutation { transaction_id } => {
                    self.queued.push_back(PairEvent::Mutation {
                        slot,
                        transaction_id,
                        origin: Origin::Remote,
                    })
                }
                BufferEvent::LocalEcho { transaction_id } => {
                    self.queued.push_back(PairEvent::Mutation {
                        slot,
                        transaction_id,
                        origin: Origin::Local,
                    })
                }
                BufferEvent::RebaseConflict {
                    transaction_id,
                    error,
                } => self.queued.push_back(PairEvent::RebaseConflict {
                    slot,
                    transaction_id,
                    error,
                }),
            }
        }
        self.note_view();
        self.note_consistency();
    }

    fn current_view(&self) -> Option<Arc<Value>> {
        self.draft
            .value()
            .or_else(|| self.published.value())
            .cloned()
    }

    fn note_view(&mut self) {
        let view = self.current_view();
        if view != self.last_view {
            self.last_view = view;
            self.queued.push_back(PairEvent::ViewChanged);
        }
    }

    fn note_consistency(&mut self) {
        let now = self.is_consistent();
        if now != self.was_consistent {
            self.was_consistent = now;
            self.queued.push_back(PairEvent::ConsistencyChanged(now));
        }
    }

    fn buffer(&self, slot: Slot) -> &BufferedDocument {
        match slot {
            Slot::Draft => &self.draft,
            Slot::Published => &self.published,
        }
    }

    fn buffer_mut(&mut self, slot: Slot) -> &mut BufferedDocument {
        match slot {
            Slot::Draft => &mut self.draft,
            Slot::Published => &mut self.published,
        }
    }
}

/// The draft a published document turns into when it is first edited.
fn draft_proto(published: &Arc<Value>, draft_id: &SmolStr) -> Value {
    match published.as_ref() {
        Value::Object(props) => {
            let mut props = props.clone();
            props.insert(
                SmolStr::new("_id"),
                Arc::new(Value::String(draft_id.to_string())),
            );
            Value::Object(props)
        }
        other => other.clone(),
    }
}

/// Keys are assigned once, when the edit is staged, so that rebase replay is
/// deterministic and independently staged inserts can never collide.
fn ensure_op_keys(op: PatchOp, keys: &dyn KeyGenerator) -> PatchOp {
    match op {
        PatchOp::Set { path, value } => PatchOp::Set {
            path,
            value: ensured(value, keys),
        },
        PatchOp::SetIfMissing { path, value } => PatchOp::SetIfMissing {
            path,
            value: ensured(value, keys),
        },
        PatchOp::Insert {
            position,
            at,
            items,
        } => PatchOp::Insert {
            position,
            at,
            items: items
                .into_iter()
                .map(|item| keyed_item(item, keys))
                .collect(),
        },
        other => other,
    }
}

fn ensured(value: Value, keys: &dyn KeyGenerator) -> Value {
    (*ensure_array_keys(&Arc::new(value), keys)).clone()
}

/// An object item about to enter an array gets its `_key` up front.
fn keyed_item(item: Value, keys: &dyn KeyGenerator) -> Value {
    let item = match item {
        Value::Object(mut props) => {
            if !props.contains_key(KEY_FIELD) {
                props.insert(
                    SmolStr::new(KEY_FIELD),
                    Arc::new(Value::String(keys.generate().to_string())),
                );
            }
            Value::Object(props)
        }
        other => other,
    };
    ensured(item, keys)
}
