use smol_str::SmolStr;
use thiserror::Error;

use crate::schema::FieldKind;
use crate::value::ValueKind;

/// Structural errors raised while applying a patch operation to a tree.
///
/// A patch containing any of these fails as a whole; the input tree is never
/// observed in a partially patched state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatchError {
    #[error("expected {expected} at `{at}`, found {found}")]
    PathTypeMismatch {
        at: String,
        expected: &'static str,
        found: ValueKind,
    },
    #[error("missing intermediate container on the way to `{at}`")]
    MissingIntermediateContainer { at: String },
    #[error("index {index} is out of bounds for array of length {len} at `{at}`")]
    IndexOutOfRange { at: String, index: usize, len: usize },
    #[error("no array element with key `{key}` at `{at}`")]
    KeyNotFound { at: String, key: SmolStr },
    #[error("increment target at `{at}` is {found}, not a number")]
    NonNumericIncrement { at: String, found: ValueKind },
    #[error("text patch at `{at}` did not apply cleanly")]
    DiffApplyFailure { at: String },
    #[error("insert anchor `{at}` must end in an array element reference")]
    BadInsertAnchor { at: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{0}` is not a valid path")]
pub struct ParsePathError(pub String);

/// Errors raised when applying a whole-document mutation to a snapshot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("document `{id}` already exists")]
    DocumentExists { id: SmolStr },
    #[error("document `{id}` does not exist")]
    DocumentMissing { id: SmolStr },
    #[error("document id `{actual}` does not match mutation target `{expected}`")]
    IdMismatch { expected: SmolStr, actual: SmolStr },
    #[error("revision guard `{expected}` does not match snapshot revision {actual:?}")]
    RevisionMismatch {
        expected: SmolStr,
        actual: Option<SmolStr>,
    },
    #[error("invalid document: {reason}")]
    InvalidDocument { reason: &'static str },
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Pre-flight schema check failures, raised before an edit is staged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("field `{field}` of type `{doc_type}` is declared {declared}, incompatible with {operation}")]
    IncompatibleField {
        doc_type: SmolStr,
        field: SmolStr,
        declared: FieldKind,
        operation: &'static str,
    },
}

/// Commit failures, either detected locally before dispatch or reported by
/// the remote store. The buffer treats every variant the same way: the local
/// edits stay buffered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommitError {
    #[error("revision guard `{expected}` is stale against remote revision {actual:?}")]
    StaleRevisionGuard {
        expected: SmolStr,
        actual: Option<SmolStr>,
    },
    #[error("the remote store rejected the transaction: revision mismatch")]
    RevisionMismatch,
    #[error("permission denied")]
    PermissionDenied,
    #[error("network error: {0}")]
    Network(String),
    #[error("validation error: {0}")]
    Validation(String),
}
