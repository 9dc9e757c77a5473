mod apply;
mod text;

use crate::error::PatchError;
use crate::path::Path;
use crate::value::Value;

pub use apply::{apply_all, apply_op};

/// A structural operation scoped to a path. Operations never partially
/// apply: a patch either succeeds against a tree as a whole or is rejected
/// as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Replace the value at the path; creates the final key of the path if
    /// its parent exists, and nothing else.
    Set { path: Path, value: Value },
    /// Set only where the path currently resolves to nothing (or null).
    SetIfMissing { path: Path, value: Value },
    /// Remove the key or element; removing something already absent is a
    /// no-op. Arrays close the gap.
    Unset { path: Path },
    /// Numeric delta. The target must already be a number.
    Inc { path: Path, amount: f64 },
    Dec { path: Path, amount: f64 },
    /// Apply a diff-match-patch patch string to a string value.
    DiffMatchPatch { path: Path, patch: String },
    /// Splice new elements into an array relative to the element referenced
    /// by the final segment of `at`.
    Insert {
        position: InsertPosition,
        at: Path,
        items: Vec<Value>,
    },
    /// Reposition an element within the array at `path`.
    Move { path: Path, from: usize, to: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPosition {
    Before,
    After,
    Replace,
}

impl PatchOp {
    pub fn set(path: Path, value: Value) -> PatchOp {
        PatchOp::Set { path, value }
    }

    pub fn set_if_missing(path: Path, value: Value) -> PatchOp {
        PatchOp::SetIfMissing { path, value }
    }

    pub fn unset(path: Path) -> PatchOp {
        PatchOp::Unset { path }
    }

    pub fn inc(path: Path, amount: f64) -> PatchOp {
        PatchOp::Inc { path, amount }
    }

    pub fn dec(path: Path, amount: f64) -> PatchOp {
        PatchOp::Dec { path, amount }
    }

    pub fn insert(position: InsertPosition, at: Path, items: Vec<Value>) -> PatchOp {
        PatchOp::Insert {
            position,
            at,
            items,
        }
    }

    pub fn move_item(path: Path, from: usize, to: usize) -> PatchOp {
        PatchOp::Move { path, from, to }
    }

    pub fn diff_match_patch(path: Path, patch: impl Into<String>) -> PatchOp {
        PatchOp::DiffMatchPatch {
            path,
            patch: patch.into(),
        }
    }

    /// Build a `DiffMatchPatch` op from the old and new text.
    pub fn text_diff(path: Path, before: &str, after: &str) -> Result<PatchOp, PatchError> {
        let patch = text::make_patch_text(before, after).ok_or(PatchError::DiffApplyFailure {
            at: path.to_string(),
        })?;
        Ok(PatchOp::DiffMatchPatch { path, patch })
    }

    /// The path this operation is addressed to.
    pub fn path(&self) -> &Path {
        match self {
            PatchOp::Set { path, .. }
            | PatchOp::SetIfMissing { path, .. }
            | PatchOp::Unset { path }
            | PatchOp::Inc { path, .. }
            | PatchOp::Dec { path, .. }
            | PatchOp::DiffMatchPatch { path, .. }
            | PatchOp::Move { path, .. } => path,
            PatchOp::Insert { at, .. } => at,
        }
    }

    /// The wire shape of this operation within a patch mutation.
    pub(crate) fn to_wire(&self) -> serde_json::Value {
        use serde_json::json;
        fn keyed(path: &Path, value: serde_json::Value) -> serde_json::Value {
            let mut map = serde_json::Map::new();
            map.insert(path.to_string(), value);
            serde_json::Value::Object(map)
        }
        match self {
            PatchOp::Set { path, value } => json!({"set": keyed(path, value.to_json())}),
            PatchOp::SetIfMissing { path, value } => {
                json!({"setIfMissing": keyed(path, value.to_json())})
            }
            PatchOp::Unset { path } => json!({"unset": [path.to_string()]}),
            PatchOp::Inc { path, amount } => json!({"inc": keyed(path, json!(amount))}),
            PatchOp::Dec { path, amount } => json!({"dec": keyed(path, json!(amount))}),
            PatchOp::DiffMatchPatch { path, patch } => {
                json!({"diffMatchPatch": keyed(path, json!(patch))})
            }
            PatchOp::Insert {
                position,
                at,
                items,
            } => {
                let anchor = match position {
                    InsertPosition::Before => "before",
                    InsertPosition::After => "after",
                    InsertPosition::Replace => "replace",
                };
                let items: Vec<serde_json::Value> = items.iter().map(Value::to_json).collect();
                let mut inner = serde_json::Map::new();
                inner.insert(anchor.to_string(), json!(at.to_string()));
                inner.insert("items".to_string(), json!(items));
                json!({"insert": inner})
            }
            PatchOp::Move { path, from, to } => {
                json!({"move": {"path": path.to_string(), "from": from, "to": to}})
            }
        }
    }
}
