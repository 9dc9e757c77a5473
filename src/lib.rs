//! lakefront is the client side of a remote document store: it keeps an
//! optimistic, locally edited view of a document while a real-time event
//! stream delivers the authoritative transactions, and reconciles the two
//! without ever losing a local edit silently.
//!
//! The pieces, leaves first:
//!
//! - [`Path`] addresses into a JSON-like tree by field name, array index, or
//!   stable array-element key.
//! - [`PatchOp`] is a small structural patch algebra over those paths, and
//!   [`apply_op`]/[`apply_all`] apply it immutably: the result shares every
//!   untouched subtree with the input.
//! - [`Mutation`] and [`Transaction`] lift patches to whole-document
//!   operations with create/delete semantics and revision guards.
//! - [`PairListener`] merges the draft and published channels of one
//!   logical document into a single event stream.
//! - [`BufferedDocument`] is the reconciliation core for one slot: it
//!   buffers unacknowledged local transactions, folds remote ones into its
//!   snapshot, and rebases the optimistic view when the two disagree.
//! - [`DocumentPair`] checks out both slots, exposes the merged view to the
//!   rendering layer, and drives commits through the [`CommitFunction`]
//!   collaborator.
//!
//! Everything here is in-memory and single-owner per document; separate
//! pairs are fully independent.

mod buffer;
mod error;
mod keys;
mod listener;
mod mutation;
mod pair;
mod patch;
mod path;
mod schema;
mod value;

pub use buffer::{BufferEvent, BufferedDocument, CommitRequest};
pub use error::{CommitError, MutationError, ParsePathError, PatchError, SchemaError};
pub use keys::{KeyGenerator, RandomKeys};
pub use listener::{IdPair, Listen, ListenerEvent, PairListener, Slot, SlotEvent};
pub use mutation::{DocumentPatch, Mutation, MutationKind, Snapshot, Transaction};
pub use pair::{CommitFunction, CommitSuccess, DocumentPair, Origin, PairEvent};
pub use patch::{apply_all, apply_op, InsertPosition, PatchOp};
pub use path::{Path, Segment};
pub use schema::{FieldKind, Schema, TypeSchema};
pub use value::{Value, ValueKind, KEY_FIELD};
