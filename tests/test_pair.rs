use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lakefront::{
    CommitError, CommitFunction, CommitSuccess, DocumentPair, FieldKind, IdPair, KeyGenerator,
    Listen, ListenerEvent, MutationError, Origin, PairEvent, PairListener, PatchOp, Path, Schema,
    Slot, SlotEvent, Snapshot, Transaction, TypeSchema, Value,
};
use maplit::hashmap;
use pretty_assertions::assert_eq;
use serde_json::json;
use smol_str::SmolStr;
use tokio::sync::mpsc;

const PUBLISHED_ID: &str = "article-1";
const DRAFT_ID: &str = "drafts.article-1";

struct SeqKeys(AtomicUsize);

impl SeqKeys {
    fn new() -> Arc<SeqKeys> {
        Arc::new(SeqKeys(AtomicUsize::new(0)))
    }
}

impl KeyGenerator for SeqKeys {
    fn generate(&self) -> SmolStr {
        SmolStr::new(format!("gen{}", self.0.fetch_add(1, Ordering::Relaxed)))
    }
}

struct FakeTransport {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<SlotEvent>>>,
}

impl FakeTransport {
    fn new() -> FakeTransport {
        FakeTransport {
            senders: Mutex::new(HashMap::new()),
        }
    }

    fn send(&self, document_id: &str, event: SlotEvent) {
        self.senders
            .lock()
            .unwrap()
            .get(document_id)
            .expect("no subscription for id")
            .send(event)
            .expect("receiver dropped");
    }

    fn is_closed(&self, document_id: &str) -> bool {
        self.senders
            .lock()
            .unwrap()
            .get(document_id)
            .expect("no subscription for id")
            .is_closed()
    }
}

impl Listen for FakeTransport {
    fn subscribe(&self, document_id: &str) -> mpsc::UnboundedReceiver<SlotEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap()
            .insert(document_id.to_string(), tx);
        rx
    }
}

struct RecordingCommit {
    log: Mutex<Vec<Transaction>>,
    result_rev: &'static str,
}

impl RecordingCommit {
    fn new(result_rev: &'static str) -> RecordingCommit {
        RecordingCommit {
            log: Mutex::new(Vec::new()),
            result_rev,
        }
    }

    fn sent(&self) -> Vec<Transaction> {
        self.log.lock().unwrap().clone()
    }
}

impl CommitFunction for RecordingCommit {
    fn commit(
        &self,
        transaction: Transaction,
    ) -> impl Future<Output = Result<CommitSuccess, CommitError>> + Send {
        let transaction_id = transaction.id.clone();
        self.log.lock().unwrap().push(transaction);
        std::future::ready(Ok(CommitSuccess {
            transaction_id,
            result_rev: Some(SmolStr::new(self.result_rev)),
        }))
    }
}

struct FailingCommit;

impl CommitFunction for FailingCommit {
    fn commit(
        &self,
        _transaction: Transaction,
    ) -> impl Future<Output = Result<CommitSuccess, CommitError>> + Send {
        std::future::ready(Err(CommitError::RevisionMismatch))
    }
}

fn doc(json: serde_json::Value) -> Arc<Value> {
    Arc::new(Value::from_json(&json))
}

fn snapshot(json: serde_json::Value, revision: &str) -> SlotEvent {
    SlotEvent::Snapshot(Snapshot::new(Some(doc(json)), Some(SmolStr::new(revision))))
}

fn absent() -> SlotEvent {
    SlotEvent::Snapshot(Snapshot::absent())
}

fn path(s: &str) -> Path {
    s.parse().unwrap()
}

fn set(target: &str, value: serde_json::Value) -> PatchOp {
    PatchOp::set(path(target), Value::from_json(&value))
}

async fn pump_until(
    pair: &mut DocumentPair,
    pred: impl Fn(&PairEvent) -> bool,
) -> Vec<PairEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), pair.next_event())
            .await
            .expect("timed out waiting for a pair event")
            .expect("listener ended");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn checkout(transport: &FakeTransport) -> DocumentPair {
    DocumentPair::checkout(
        transport,
        IdPair::for_document(PUBLISHED_ID),
        SeqKeys::new(),
    )
}

#[test_log::test(tokio::test)]
async fn listener_merges_channels_preserving_per_slot_order() {
    let (draft_tx, draft_rx) = mpsc::unbounded_channel();
    let (published_tx, published_rx) = mpsc::unbounded_channel();
    let mut listener = PairListener::from_channels(draft_rx, published_rx);

    draft_tx.send(snapshot(json!({"n": 1.0}), "d1")).unwrap();
    draft_tx.send(snapshot(json!({"n": 2.0}), "d2")).unwrap();
    published_tx.send(snapshot(json!({"n": 3.0}), "p1")).unwrap();
    published_tx.send(SlotEvent::Reconnect).unwrap();

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(listener.recv().await.unwrap());
    }
    let draft_revs: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ListenerEvent::Snapshot {
                slot: Slot::Draft,
                snapshot,
            } => Some(snapshot.revision.clone().unwrap().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(draft_revs, vec!["d1", "d2"]);
    assert!(events.iter().any(|e| matches!(e, ListenerEvent::Reconnect)));

    listener.close();
    assert!(listener.is_closed());
    assert!(draft_tx.is_closed());
    assert!(published_tx.is_closed());
    assert_eq!(listener.recv().await, None);
}

#[test_log::test(tokio::test)]
async fn checkout_becomes_ready_and_prefers_the_draft() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    assert!(!pair.is_ready());

    transport.send(PUBLISHED_ID, snapshot(json!({"title": "published"}), "p1"));
    transport.send(DRAFT_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    assert!(pair.is_ready());
    assert!(pair.is_consistent());
    assert_eq!(pair.value().unwrap().to_json(), json!({"title": "published"}));

    // a draft appears; it wins over the published version
    transport.send(DRAFT_ID, snapshot(json!({"title": "draft"}), "d1"));
    pump_until(&mut pair, |e| matches!(e, PairEvent::ViewChanged)).await;
    assert_eq!(pair.value().unwrap().to_json(), json!({"title": "draft"}));
}

#[test_log::test(tokio::test)]
async fn editing_a_published_document_springs_the_draft() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(
        PUBLISHED_ID,
        snapshot(json!({"_type": "article", "title": "A"}), "p1"),
    );
    transport.send(DRAFT_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.patch(vec![set("title", json!("B"))]).unwrap();
    let view = pair.value().unwrap();
    assert_eq!(view.get("title").unwrap().as_str(), Some("B"));
    // the draft copy carries the draft id
    assert_eq!(view.get("_id").unwrap().as_str(), Some(DRAFT_ID));
    assert!(!pair.is_consistent());

    let client = RecordingCommit::new("d1");
    pair.commit(&client).await.unwrap();
    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    // one transaction: spring the draft into existence, then patch it
    assert_eq!(sent[0].mutations.len(), 2);
    assert_eq!(
        sent[0].to_wire()["mutations"][0]["createIfNotExists"]["_id"],
        json!(DRAFT_ID)
    );

    // the listener echoes the committed transaction
    let mut echo = sent[0].clone();
    echo.result_rev = Some(SmolStr::new("d1"));
    transport.send(DRAFT_ID, SlotEvent::Mutation(echo));
    let events = pump_until(&mut pair, |e| {
        matches!(e, PairEvent::ConsistencyChanged(true))
    })
    .await;
    assert!(events.iter().any(|e| matches!(
        e,
        PairEvent::Mutation {
            slot: Slot::Draft,
            origin: Origin::Local,
            ..
        }
    )));
    assert!(pair.is_consistent());
}

#[test_log::test(tokio::test)]
async fn insert_items_get_fresh_keys_at_stage_time() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(DRAFT_ID, snapshot(json!({"blocks": [{"_key": "k1"}]}), "d1"));
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    let insert = |pair: &mut DocumentPair| {
        pair.patch(vec![PatchOp::insert(
            lakefront::InsertPosition::After,
            path("blocks[_key==\"k1\"]"),
            vec![Value::from_json(&json!({"text": "new"}))],
        )])
        .unwrap();
    };
    insert(&mut pair);
    insert(&mut pair);

    let blocks = pair.value().unwrap();
    let keys: Vec<String> = blocks
        .get("blocks")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b.key().unwrap().to_string())
        .collect();
    assert_eq!(keys[0], "k1");
    // two independently staged inserts never share a generated key
    assert_ne!(keys[1], keys[2]);
    assert!(keys[1].starts_with("gen"));
    assert!(keys[2].starts_with("gen"));
}

#[test_log::test(tokio::test)]
async fn remote_change_rebases_under_local_edits() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(DRAFT_ID, snapshot(json!({"title": "A"}), "d1"));
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.patch(vec![set("title", json!("B"))]).unwrap();

    let mut remote = Transaction::new(
        "other",
        vec![lakefront::Mutation::patch(
            DRAFT_ID,
            vec![set("subtitle", json!("x"))],
        )],
    );
    remote.previous_rev = Some(SmolStr::new("d1"));
    remote.result_rev = Some(SmolStr::new("d2"));
    transport.send(DRAFT_ID, SlotEvent::Mutation(remote));

    pump_until(&mut pair, |e| {
        matches!(
            e,
            PairEvent::Mutation {
                origin: Origin::Remote,
                ..
            }
        )
    })
    .await;
    assert_eq!(
        pair.value().unwrap().to_json(),
        json!({"title": "B", "subtitle": "x"})
    );
}

#[test_log::test(tokio::test)]
async fn conflicting_local_edit_is_reported_through_the_pair() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(DRAFT_ID, snapshot(json!({"meta": {"author": "x"}}), "d1"));
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.patch(vec![set("meta.author", json!("y"))]).unwrap();

    let mut remote = Transaction::new(
        "other",
        vec![lakefront::Mutation::patch(
            DRAFT_ID,
            vec![set("meta", json!("gone"))],
        )],
    );
    remote.previous_rev = Some(SmolStr::new("d1"));
    remote.result_rev = Some(SmolStr::new("d2"));
    transport.send(DRAFT_ID, SlotEvent::Mutation(remote));

    let events = pump_until(&mut pair, |e| matches!(e, PairEvent::RebaseConflict { .. })).await;
    assert!(events.iter().any(|e| matches!(
        e,
        PairEvent::RebaseConflict {
            slot: Slot::Draft,
            error: MutationError::Patch(_),
            ..
        }
    )));
    assert_eq!(pair.value().unwrap().to_json(), json!({"meta": "gone"}));
}

#[test_log::test(tokio::test)]
async fn commit_failure_keeps_the_buffered_edits() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(DRAFT_ID, snapshot(json!({"title": "A"}), "d1"));
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.patch(vec![set("title", json!("B"))]).unwrap();
    let err = pair.commit(&FailingCommit).await.unwrap_err();
    assert_eq!(err, CommitError::RevisionMismatch);

    // nothing was rolled back or discarded
    assert_eq!(pair.value().unwrap().to_json(), json!({"title": "B"}));
    assert_eq!(pair.draft().pending_len(), 1);
    assert!(!pair.is_consistent());

    // a retry goes through
    let client = RecordingCommit::new("d2");
    pair.commit(&client).await.unwrap();
    assert_eq!(client.sent().len(), 1);
}

#[test_log::test(tokio::test)]
async fn reconnect_requires_fresh_snapshots_and_keeps_local_edits() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(DRAFT_ID, snapshot(json!({"title": "A"}), "d1"));
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.patch(vec![set("title", json!("B"))]).unwrap();

    transport.send(DRAFT_ID, SlotEvent::Reconnect);
    pump_until(&mut pair, |e| matches!(e, PairEvent::Reconnecting)).await;
    assert!(!pair.is_ready());
    assert!(!pair.is_consistent());

    // fresh snapshots arrive; the remote gained a subtitle meanwhile
    transport.send(
        DRAFT_ID,
        snapshot(json!({"title": "A", "subtitle": "x"}), "d3"),
    );
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    assert_eq!(
        pair.value().unwrap().to_json(),
        json!({"title": "B", "subtitle": "x"})
    );
}

#[test_log::test(tokio::test)]
async fn schema_preflight_refuses_incompatible_edits() {
    let schema = Schema {
        types: hashmap! {
            SmolStr::new("article") => TypeSchema {
                fields: hashmap! { SmolStr::new("title") => FieldKind::String },
            }
        },
    };

    let transport = FakeTransport::new();
    let mut pair = checkout(&transport).with_schema(schema);
    transport.send(
        DRAFT_ID,
        snapshot(json!({"_type": "article", "title": "A"}), "d1"),
    );
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    let err = pair
        .patch(vec![PatchOp::inc(path("title"), 1.0)])
        .unwrap_err();
    assert!(matches!(err, MutationError::Schema(_)));
    // nothing was staged
    assert!(pair.is_consistent());
}

#[test_log::test(tokio::test)]
async fn delete_targets_every_slot_that_holds_a_document() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(PUBLISHED_ID, snapshot(json!({"title": "A"}), "p1"));
    transport.send(DRAFT_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.delete().unwrap();
    assert_eq!(pair.value(), None);

    let client = RecordingCommit::new("p2");
    pair.commit(&client).await.unwrap();
    let sent = client.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].to_wire()["mutations"],
        json!([{"delete": {"id": PUBLISHED_ID}}])
    );
}

#[test_log::test(tokio::test)]
async fn close_releases_the_subscriptions() {
    let transport = FakeTransport::new();
    let mut pair = checkout(&transport);
    transport.send(DRAFT_ID, absent());
    transport.send(PUBLISHED_ID, absent());
    pump_until(&mut pair, |e| matches!(e, PairEvent::Ready)).await;

    pair.close();
    assert!(transport.is_closed(DRAFT_ID));
    assert!(transport.is_closed(PUBLISHED_ID));
    assert_eq!(pair.next_event().await, None);
}
