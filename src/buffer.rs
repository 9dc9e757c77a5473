//! The buffered document: the reconciliation core for one document slot.
//!
//! Why does this exist? Local edits must be visible immediately ("on the UI
//! thread"), while the authoritative order of transactions is only known
//! once they come back on the listener channel. So the buffer keeps two
//! models of the document: the *remote* snapshot, which tracks exactly what
//! the listener has confirmed, and the *local* view, which is the remote
//! snapshot with every not-yet-confirmed local transaction folded on top.
//!
//! Local transactions live in two queues: `pending` (staged, not yet
//! dispatched in a commit) and `submitted` (dispatched, awaiting their echo
//! on the listener channel). Incoming remote transactions that do not chain
//! onto the remote snapshot's revision yet wait in `incoming`.
//!
//! When a remote transaction folds in, one of three things happens:
//! 1. it is the echo of our own front-most unconfirmed transaction — the
//!    remote snapshot catches up and the local view is already correct;
//! 2. it is ours but arrived out of the expected order — the queues are
//!    scrubbed and the local view is rebuilt (a rebase);
//! 3. it is someone else's — it becomes the new base and the local queues
//!    are replayed on top of it. A queued transaction that no longer applies
//!    is dropped and reported as a conflict, never silently.

use std::collections::VecDeque;
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::error::{CommitError, MutationError};
use crate::keys::KeyGenerator;
use crate::mutation::{MutationKind, Snapshot, Transaction};
use crate::value::Value;

/// Consumer-facing effects of feeding one input into the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// The local view changed; read it with [`BufferedDocument::value`].
    ViewChanged,
    ConsistencyChanged(bool),
    /// A foreign transaction was folded into the remote snapshot.
    RemoteMutation { transaction_id: SmolStr },
    /// The listener echoed a transaction this buffer committed.
    LocalEcho { transaction_id: SmolStr },
    /// A buffered local transaction no longer applies against the new remote
    /// base and was dropped. The caller should re-derive the edit.
    RebaseConflict {
        transaction_id: SmolStr,
        error: MutationError,
    },
}

/// A squashed transaction ready to be sent through the commit function.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub transaction: Transaction,
}

#[derive(Debug)]
pub struct BufferedDocument {
    id: SmolStr,
    /// What the listener has confirmed so far; `None` until the initial
    /// snapshot arrives.
    remote: Option<Snapshot>,
    /// Remote transactions that do not chain onto `remote` yet.
    incoming: VecDeque<Transaction>,
    /// Dispatched commits awaiting their listener echo.
    submitted: VecDeque<Transaction>,
    /// Staged local transactions, not yet dispatched.
    pending: VecDeque<Transaction>,
    /// The optimistic view: `remote` plus `submitted` plus `pending`.
    local: Option<Arc<Value>>,
    /// Set between a connection interruption and the fresh snapshot;
    /// incremental events are not trusted while this holds.
    reconnecting: bool,
    was_consistent: bool,
}

impl BufferedDocument {
    pub fn new(id: impl Into<SmolStr>) -> BufferedDocument {
        BufferedDocument {
            id: id.into(),
            remote: None,
            incoming: VecDeque::new(),
            submitted: VecDeque::new(),
            pending: VecDeque::new(),
            local: None,
            reconnecting: false,
            was_consistent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The optimistic local view of the document.
    pub fn value(&self) -> Option<&Arc<Value>> {
        self.local.as_ref()
    }

    pub fn remote_snapshot(&self) -> Option<&Snapshot> {
        self.remote.as_ref()
    }

    pub fn has_snapshot(&self) -> bool {
        self.remote.is_some() && !self.reconnecting
    }

    /// Consistent means: snapshot present, connection live, and no local or
    /// incoming transaction unaccounted for.
    pub fn is_consistent(&self) -> bool {
        self.remote.is_some()
            && !self.reconnecting
            && self.incoming.is_empty()
            && self.submitted.is_empty()
            && self.pending.is_empty()
    }

    pub fn has_local_edits(&self) -> bool {
        !self.pending.is_empty() || !self.submitted.is_empty()
    }

    /// A commit has been dispatched and its echo has not arrived yet.
    pub fn in_flight(&self) -> bool {
        !self.submitted.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// A fresh authoritative snapshot: the initial one, or a resync after a
    /// reconnect. Becomes the new base; stale incoming events are dropped
    /// and the local queues are replayed on top.
    pub fn handle_snapshot(&mut self, snapshot: Snapshot) -> Vec<BufferEvent> {
        debug!(id = %self.id, revision = ?snapshot.revision, "received snapshot");
        self.reconnecting = false;
        self.incoming.clear();
        self.remote = Some(snapshot);
        let mut events = Vec::new();
        self.rebase(&mut events);
        self.note_consistency(&mut events);
        events
    }

    /// The connection was interrupted and resumed. Incremental events may
    /// have been missed, so nothing is trusted until the next snapshot.
    pub fn handle_reconnect(&mut self) -> Vec<BufferEvent> {
        debug!(id = %self.id, "reconnect; awaiting fresh snapshot");
        self.reconnecting = true;
        self.incoming.clear();
        let mut events = Vec::new();
        self.note_consistency(&mut events);
        events
    }

    /// A transaction arrived on the listener channel.
    pub fn handle_transaction(&mut self, transaction: Transaction) -> Vec<BufferEvent> {
        let mut events = Vec::new();
        if self.reconnecting {
            debug!(id = %self.id, txn = %transaction.id, "dropping transaction while reconnecting");
            return events;
        }
        if self.remote.is_none() {
            warn!(id = %self.id, txn = %transaction.id, "transaction before initial snapshot; dropping");
            return events;
        }
        self.incoming.push_back(transaction);
        self.consider_incoming(&mut events);
        self.note_consistency(&mut events);
        events
    }

    /// Stage a local transaction: apply it to the local view immediately and
    /// queue it for a later commit. A transaction that fails to apply leaves
    /// the buffer untouched.
    pub fn stage(&mut self, transaction: Transaction) -> Result<Vec<BufferEvent>, MutationError> {
        let view = Snapshot {
            document: self.local.clone(),
            revision: self.remote.as_ref().and_then(|s| s.revision.clone()),
        };
        let next = transaction.apply(&view)?;
        debug!(id = %self.id, txn = %transaction.id, "staged local transaction");
        self.pending.push_back(transaction);
        let mut events = Vec::new();
        if next.document != self.local {
            self.local = next.document;
            events.push(BufferEvent::ViewChanged);
        }
        self.note_consistency(&mut events);
        Ok(events)
    }

    /// Squash everything pending into one transaction and hand it out for
    /// dispatch. Returns `None` when there is nothing to send or a commit is
    /// already outstanding — transactions staged while a commit is in flight
    /// wait for the next one, so an in-flight commit never absorbs newer
    /// edits.
    ///
    /// A stale revision guard refuses the whole commit outright, leaving the
    /// buffer exactly as it was.
    pub fn prepare_commit(
        &mut self,
        keys: &dyn KeyGenerator,
    ) -> Result<Option<CommitRequest>, CommitError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        if self.in_flight() {
            debug!(id = %self.id, "commit already in flight; holding newer edits");
            return Ok(None);
        }
        let head_rev = self.remote.as_ref().and_then(|s| s.revision.clone());
        for transaction in &self.pending {
            for mutation in &transaction.mutations {
                if let MutationKind::Patch(patch) = &mutation.kind {
                    if let Some(guard) = &patch.if_revision {
                        if head_rev.as_ref() != Some(guard) {
                            return Err(CommitError::StaleRevisionGuard {
                                expected: guard.clone(),
                                actual: head_rev,
                            });
                        }
                    }
                }
            }
        }
        let id = keys.generate();
        let mut mutations = Vec::new();
        for transaction in self.pending.drain(..) {
            mutations.extend(transaction.mutations);
        }
        let squashed = Transaction {
            id: id.clone(),
            mutations,
            previous_rev: head_rev,
            result_rev: None,
        };
        debug!(id = %self.id, txn = %id, mutations = squashed.mutations.len(), "dispatching commit");
        self.submitted.push_back(squashed.clone());
        Ok(Some(CommitRequest {
            transaction: squashed,
        }))
    }

    /// The commit function resolved successfully. The submitted transaction
    /// stays queued until its echo arrives on the listener channel (which
    /// may already have happened).
    pub fn commit_succeeded(&mut self, transaction_id: &str) {
        debug!(id = %self.id, txn = transaction_id, "commit acknowledged");
    }

    /// The commit function failed. The transaction returns to the front of
    /// the pending queue: the optimistic view is untouched and retrying is
    /// the caller's decision. Nothing is rolled back or discarded.
    pub fn commit_failed(&mut self, transaction_id: &str) {
        if let Some(position) = self
            .submitted
            .iter()
            .position(|t| t.id == transaction_id)
        {
            warn!(id = %self.id, txn = transaction_id, "commit failed; keeping local edits buffered");
            if let Some(transaction) = self.submitted.remove(position) {
                self.pending.push_front(transaction);
            }
        }
    }

    /// Fold every applicable incoming transaction into the remote snapshot,
    /// in revision-chain order.
    fn consider_incoming(&mut self, events: &mut Vec<BufferEvent>) {
        let mut must_rebase = false;
        let mut guard = 0;
        loop {
            let Some(head) = self.remote.as_ref() else {
                return;
            };
            let Some(position) = self.incoming.iter().position(|t| applicable(head, t)) else {
                break;
            };
            guard += 1;
            if guard > 100 {
                warn!(id = %self.id, "stuck flushing incoming transactions");
                break;
            }
            let transaction = self
                .incoming
                .remove(position)
                .expect("position comes from the same queue");
            match transaction.apply(head) {
                Ok(next) => self.remote = Some(next),
                Err(error) => {
                    // the store applied it, so this is local divergence;
                    // drop it and let the next snapshot repair us
                    warn!(id = %self.id, txn = %transaction.id, %error, "remote transaction did not apply to snapshot");
                    continue;
                }
            }
            let ours = self.consume_unresolved(&transaction.id, &mut must_rebase);
            if ours {
                debug!(id = %self.id, txn = %transaction.id, "listener echoed our transaction");
                events.push(BufferEvent::LocalEcho {
                    transaction_id: transaction.id.clone(),
                });
            } else {
                events.push(BufferEvent::RemoteMutation {
                    transaction_id: transaction.id.clone(),
                });
                if self.has_local_edits() {
                    must_rebase = true;
                }
            }
        }
        if must_rebase {
            self.rebase(events);
        } else if !self.has_local_edits() {
            // no unconfirmed local work: the view follows the snapshot
            let head_doc = self.remote.as_ref().and_then(|s| s.document.clone());
            if head_doc != self.local {
                self.local = head_doc;
                events.push(BufferEvent::ViewChanged);
            }
        }
        if !self.incoming.is_empty() {
            debug!(id = %self.id, held = self.incoming.len(), "incoming transactions do not chain onto the snapshot yet");
        }
    }

    /// Remove an incoming transaction from the unconfirmed queues if it was
    /// ours. Consuming the expected front needs no rebase; anything else
    /// means our idea of the ordering was wrong.
    fn consume_unresolved(&mut self, transaction_id: &str, must_rebase: &mut bool) -> bool {
        if self.submitted.is_empty() && self.pending.is_empty() {
            return false;
        }
        if let Some(front) = self.submitted.front() {
            if front.id == transaction_id {
                self.submitted.pop_front();
                return true;
            }
        } else if let Some(front) = self.pending.front() {
            if front.id == transaction_id {
                self.pending.pop_front();
                return true;
            }
        }
        let before = self.submitted.len() + self.pending.len();
        self.submitted.retain(|t| t.id != transaction_id);
        self.pending.retain(|t| t.id != transaction_id);
        let scrubbed = before - (self.submitted.len() + self.pending.len());
        if scrubbed > 0 {
            debug!(id = %self.id, txn = transaction_id, "our transaction arrived out of order; scrubbed");
            *must_rebase = true;
            return true;
        }
        false
    }

    /// Rebuild the local view by replaying the unconfirmed queues over the
    /// remote snapshot. Transactions that no longer apply are dropped, each
    /// with a conflict report.
    fn rebase(&mut self, events: &mut Vec<BufferEvent>) {
        let Some(head) = self.remote.as_ref() else {
            return;
        };
        let mut snapshot = head.clone();
        for queue in [&mut self.submitted, &mut self.pending] {
            let mut kept = VecDeque::with_capacity(queue.len());
            for transaction in queue.drain(..) {
                match transaction.apply(&snapshot) {
                    Ok(next) => {
                        snapshot = next;
                        kept.push_back(transaction);
                    }
                    Err(error) => {
                        warn!(id = %self.id, txn = %transaction.id, %error, "local transaction dropped during rebase");
                        events.push(BufferEvent::RebaseConflict {
                            transaction_id: transaction.id.clone(),
                            error,
                        });
                    }
                }
            }
            *queue = kept;
        }
        if snapshot.document != self.local {
            self.local = snapshot.document;
            events.push(BufferEvent::ViewChanged);
        }
    }

    fn note_consistency(&mut self, events: &mut Vec<BufferEvent>) {
        let now = self.is_consistent();
        if now != self.was_consistent {
            debug!(id = %self.id, consistent = now, "consistency changed");
            self.was_consistent = now;
            events.push(BufferEvent::ConsistencyChanged(now));
        }
    }
}

/// Whether a transaction chains onto the snapshot. With a missing document
/// only create-shaped transactions qualify; with chain information on both
/// sides the revisions must match; without it, per-slot delivery order is
/// trusted.
fn applicable(head: &Snapshot, transaction: &Transaction) -> bool {
    if head.document.is_none() {
        return transaction.applies_to_missing_document();
    }
    match (&transaction.previous_rev, &head.revision) {
        (Some(previous), Some(revision)) => previous == revision,
        _ => true,
    }
}
