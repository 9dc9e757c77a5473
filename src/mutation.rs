use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::MutationError;
use crate::patch::{apply_all, PatchOp};
use crate::value::Value;

/// The authoritative state of one document slot at a point in time. `None`
/// means the slot holds no document (not yet created, or deleted). The
/// revision is an opaque token minted by the remote store; the client never
/// invents one.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub document: Option<Arc<Value>>,
    pub revision: Option<SmolStr>,
}

impl Snapshot {
    pub fn new(document: Option<Arc<Value>>, revision: Option<SmolStr>) -> Snapshot {
        Snapshot { document, revision }
    }

    pub fn absent() -> Snapshot {
        Snapshot {
            document: None,
            revision: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.document.is_some()
    }
}

/// An ordered list of patch operations plus an optional expected-revision
/// guard.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatch {
    pub ops: Vec<PatchOp>,
    pub if_revision: Option<SmolStr>,
}

/// A named operation on a whole document slot.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    Create(Arc<Value>),
    CreateIfNotExists(Arc<Value>),
    CreateOrReplace(Arc<Value>),
    Delete,
    Patch(DocumentPatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub document_id: SmolStr,
    pub kind: MutationKind,
}

impl Mutation {
    pub fn create(document_id: impl Into<SmolStr>, document: Value) -> Mutation {
        Mutation {
            document_id: document_id.into(),
            kind: MutationKind::Create(Arc::new(document)),
        }
    }

    pub fn create_if_not_exists(document_id: impl Into<SmolStr>, document: Value) -> Mutation {
        Mutation {
            document_id: document_id.into(),
            kind: MutationKind::CreateIfNotExists(Arc::new(document)),
        }
    }

    pub fn create_or_replace(document_id: impl Into<SmolStr>, document: Value) -> Mutation {
        Mutation {
            document_id: document_id.into(),
            kind: MutationKind::CreateOrReplace(Arc::new(document)),
        }
    }

    pub fn delete(document_id: impl Into<SmolStr>) -> Mutation {
        Mutation {
            document_id: document_id.into(),
            kind: MutationKind::Delete,
        }
    }

    pub fn patch(document_id: impl Into<SmolStr>, ops: Vec<PatchOp>) -> Mutation {
        Mutation {
            document_id: document_id.into(),
            kind: MutationKind::Patch(DocumentPatch {
                ops,
                if_revision: None,
            }),
        }
    }

    pub fn patch_with_guard(
        document_id: impl Into<SmolStr>,
        ops: Vec<PatchOp>,
        if_revision: impl Into<SmolStr>,
    ) -> Mutation {
        Mutation {
            document_id: document_id.into(),
            kind: MutationKind::Patch(DocumentPatch {
                ops,
                if_revision: Some(if_revision.into()),
            }),
        }
    }

    /// Whether this mutation can be the first thing to happen to a slot that
    /// currently holds no document.
    pub fn applies_to_missing_document(&self) -> bool {
        !matches!(self.kind, MutationKind::Patch(_))
    }

    /// Apply to a document value, yielding the next value (`None` deletes).
    pub fn apply(&self, document: Option<&Arc<Value>>) -> Result<Option<Arc<Value>>, MutationError> {
        match (&self.kind, document) {
            (MutationKind::Create(_), Some(_)) => Err(MutationError::DocumentExists {
                id: self.document_id.clone(),
            }),
            (MutationKind::Create(value), None) => Ok(Some(value.clone())),
            (MutationKind::CreateIfNotExists(_), Some(existing)) => Ok(Some(existing.clone())),
            (MutationKind::CreateIfNotExists(value), None) => Ok(Some(value.clone())),
            (MutationKind::CreateOrReplace(value), _) => Ok(Some(value.clone())),
            (MutationKind::Delete, _) => Ok(None),
            (MutationKind::Patch(patch), Some(existing)) => {
                Ok(Some(apply_all(existing, &patch.ops)?))
            }
            (MutationKind::Patch(_), None) => Err(MutationError::DocumentMissing {
                id: self.document_id.clone(),
            }),
        }
    }

    pub(crate) fn to_wire(&self) -> serde_json::Value {
        use serde_json::json;
        match &self.kind {
            MutationKind::Create(value) => json!({"create": doc_wire(&self.document_id, value)}),
            MutationKind::CreateIfNotExists(value) => {
                json!({"createIfNotExists": doc_wire(&self.document_id, value)})
            }
            MutationKind::CreateOrReplace(value) => {
                json!({"createOrReplace": doc_wire(&self.document_id, value)})
            }
            MutationKind::Delete => json!({"delete": {"id": self.document_id.as_str()}}),
            MutationKind::Patch(patch) => {
                let mut body = serde_json::Map::new();
                body.insert("id".to_string(), json!(self.document_id.as_str()));
                if let Some(guard) = &patch.if_revision {
                    body.insert("ifRevisionID".to_string(), json!(guard.as_str()));
                }
                let ops: Vec<serde_json::Value> =
                    patch.ops.iter().map(|op| op.to_wire()).collect();
                body.insert("ops".to_string(), json!(ops));
                json!({"patch": body})
            }
        }
    }
}

fn doc_wire(id: &SmolStr, value: &Arc<Value>) -> serde_json::Value {
    let mut wire = value.to_json();
    if let serde_json::Value::Object(props) = &mut wire {
        props.insert("_id".to_string(), serde_json::Value::String(id.to_string()));
    }
    wire
}

/// An ordered list of mutations applied atomically by the remote store.
/// `previous_rev`/`result_rev` describe the revision chain as reported on the
/// listener channel; locally staged transactions carry neither.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: SmolStr,
    pub mutations: Vec<Mutation>,
    pub previous_rev: Option<SmolStr>,
    pub result_rev: Option<SmolStr>,
}

impl Transaction {
    pub fn new(id: impl Into<SmolStr>, mutations: Vec<Mutation>) -> Transaction {
        Transaction {
            id: id.into(),
            mutations,
            previous_rev: None,
            result_rev: None,
        }
    }

    pub fn applies_to_missing_document(&self) -> bool {
        self.mutations
            .first()
            .map(Mutation::applies_to_missing_document)
            .unwrap_or(false)
    }

    /// Fold this transaction over a snapshot. Revision guards are checked
    /// against the snapshot's revision; the resulting revision is the
    /// server-reported one, or carried over for transactions the server has
    /// not acknowledged yet.
    pub fn apply(&self, snapshot: &Snapshot) -> Result<Snapshot, MutationError> {
        for mutation in &self.mutations {
            if let MutationKind::Patch(patch) = &mutation.kind {
                if let Some(guard) = &patch.if_revision {
                    if snapshot.revision.as_ref() != Some(guard) {
                        return Err(MutationError::RevisionMismatch {
                            expected: guard.clone(),
                            actual: snapshot.revision.clone(),
                        });
                    }
                }
            }
        }
        let mut document = snapshot.document.clone();
        for mutation in &self.mutations {
            document = mutation.apply(document.as_ref())?;
        }
        Ok(Snapshot {
            document,
            revision: self
                .result_rev
                .clone()
                .or_else(|| snapshot.revision.clone()),
        })
    }

    /// The wire shape of this transaction for a commit request.
    pub fn to_wire(&self) -> serde_json::Value {
        use serde_json::json;
        let mutations: Vec<serde_json::Value> =
            self.mutations.iter().map(|m| m.to_wire()).collect();
        json!({
            "transactionId": self.id.as_str(),
            "mutations": mutations,
        })
    }
}
