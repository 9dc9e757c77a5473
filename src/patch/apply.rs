//! The immutable tree accessor: applies one operation to a value by
//! rebuilding only the spine of the addressed path. Sibling subtrees are
//! carried over behind their existing `Arc`s, which is what makes retained
//! old views safe and cheap.

use std::sync::Arc;

use crate::error::PatchError;
use crate::path::{Path, Segment};
use crate::value::{index_of_key, Value, ValueKind};

use super::{text, InsertPosition, PatchOp};

/// Apply a sequence of operations in order. Stops at the first failure; the
/// caller keeps its original tree, so a failed patch is never observed
/// partially applied.
pub fn apply_all(doc: &Arc<Value>, ops: &[PatchOp]) -> Result<Arc<Value>, PatchError> {
    let mut current = doc.clone();
    for op in ops {
        current = apply_op(&current, op)?;
    }
    Ok(current)
}

pub fn apply_op(doc: &Arc<Value>, op: &PatchOp) -> Result<Arc<Value>, PatchError> {
    match op {
        PatchOp::Set { path, value } => {
            update_in(doc, path, path.segments(), &|_| Ok(Arc::new(value.clone())))
        }
        PatchOp::SetIfMissing { path, value } => {
            update_in(doc, path, path.segments(), &|current| match current {
                Some(existing) if !existing.is_null() => Ok(existing.clone()),
                _ => Ok(Arc::new(value.clone())),
            })
        }
        PatchOp::Unset { path } => {
            if path.is_root() {
                // removing the document itself is a mutation, not a patch
                return Ok(doc.clone());
            }
            match unset_in(doc, path, path.segments())? {
                Removal::Unchanged => Ok(doc.clone()),
                Removal::Replaced(value) => Ok(value),
                Removal::Removed => unreachable!("non-root unset cannot remove the root"),
            }
        }
        PatchOp::Inc { path, amount } => increment(doc, path, *amount),
        PatchOp::Dec { path, amount } => increment(doc, path, -*amount),
        PatchOp::DiffMatchPatch { path, patch } => {
            update_in(doc, path, path.segments(), &|current| {
                match current.map(AsRef::as_ref) {
                    Some(Value::String(source)) => text::apply_patch_text(patch, source)
                        .map(|patched| Arc::new(Value::String(patched)))
                        .ok_or(PatchError::DiffApplyFailure {
                            at: path.to_string(),
                        }),
                    other => Err(PatchError::PathTypeMismatch {
                        at: path.to_string(),
                        expected: "a string",
                        found: other.map(Value::kind).unwrap_or(ValueKind::Null),
                    }),
                }
            })
        }
        PatchOp::Insert {
            position,
            at,
            items,
        } => insert(doc, *position, at, items),
        PatchOp::Move { path, from, to } => move_item(doc, path, *from, *to),
    }
}

fn increment(doc: &Arc<Value>, path: &Path, amount: f64) -> Result<Arc<Value>, PatchError> {
    update_in(doc, path, path.segments(), &|current| {
        match current.map(AsRef::as_ref) {
            Some(Value::Number(n)) => Ok(Arc::new(Value::Number(n + amount))),
            other => Err(PatchError::NonNumericIncrement {
                at: path.to_string(),
                found: other.map(Value::kind).unwrap_or(ValueKind::Null),
            }),
        }
    })
}

fn insert(
    doc: &Arc<Value>,
    position: InsertPosition,
    at: &Path,
    items: &[Value],
) -> Result<Arc<Value>, PatchError> {
    let anchor = || PatchError::BadInsertAnchor {
        at: at.to_string(),
    };
    let ref_segment = at.last().ok_or_else(anchor)?;
    if matches!(ref_segment, Segment::Field(_)) {
        return Err(anchor());
    }
    let parent = at.parent();
    update_in(doc, at, parent.segments(), &|current| {
        let existing = match current.map(AsRef::as_ref) {
            Some(Value::Array(existing)) => existing,
            Some(other) => {
                return Err(PatchError::PathTypeMismatch {
                    at: at.to_string(),
                    expected: "an array",
                    found: other.kind(),
                })
            }
            None => {
                return Err(PatchError::MissingIntermediateContainer {
                    at: at.to_string(),
                })
            }
        };
        let len = existing.len();
        let index = match ref_segment {
            Segment::Index(i) => *i,
            Segment::Key(key) => {
                index_of_key(existing, key).ok_or_else(|| PatchError::KeyNotFound {
                    at: at.to_string(),
                    key: key.clone(),
                })?
            }
            Segment::Field(_) => unreachable!("field anchors are rejected above"),
        };
        let out_of_range = || PatchError::IndexOutOfRange {
            at: at.to_string(),
            index,
            len,
        };
        // `Before` may reference one past the end, which appends
        let (replace, insert_at) = match position {
            InsertPosition::Before if index <= len => (false, index),
            InsertPosition::After if index < len => (false, index + 1),
            InsertPosition::Replace if index < len => (true, index),
            _ => return Err(out_of_range()),
        };
        let mut spliced = existing.to_vec();
        if replace {
            spliced.remove(insert_at);
        }
        for (offset, item) in items.iter().enumerate() {
            spliced.insert(insert_at + offset, Arc::new(item.clone()));
        }
        Ok(Arc::new(Value::Array(spliced)))
    })
}

fn move_item(doc: &Arc<Value>, path: &Path, from: usize, to: usize) -> Result<Arc<Value>, PatchError> {
    update_in(doc, path, path.segments(), &|current| {
        let existing = match current.map(AsRef::as_ref) {
            Some(Value::Array(existing)) => existing,
            Some(other) => {
                return Err(PatchError::PathTypeMismatch {
                    at: path.to_string(),
                    expected: "an array",
                    found: other.kind(),
                })
            }
            None => {
                return Err(PatchError::MissingIntermediateContainer {
                    at: path.to_string(),
                })
            }
        };
        let len = existing.len();
        for index in [from, to] {
            if index >= len {
                return Err(PatchError::IndexOutOfRange {
                    at: path.to_string(),
                    index,
                    len,
                });
            }
        }
        let mut moved = existing.to_vec();
        let element = moved.remove(from);
        moved.insert(to, element);
        Ok(Arc::new(Value::Array(moved)))
    })
}

/// Walk `rest` down from `current` and apply `update` to the addressed
/// value, rebuilding the spine on the way back up. The closure sees `None`
/// only for an absent final object field; anything absent earlier is a
/// `MissingIntermediateContainer` (the algebra refuses to guess structure).
fn update_in<F>(
    current: &Arc<Value>,
    context: &Path,
    rest: &[Segment],
    update: &F,
) -> Result<Arc<Value>, PatchError>
where
    F: Fn(Option<&Arc<Value>>) -> Result<Arc<Value>, PatchError>,
{
    let Some((head, tail)) = rest.split_first() else {
        return update(Some(current));
    };
    match (head, current.as_ref()) {
        (Segment::Field(name), Value::Object(props)) => {
            let child = props.get(name.as_str());
            let new_child = match child {
                Some(child) => update_in(child, context, tail, update)?,
                None if tail.is_empty() => update(None)?,
                None => {
                    return Err(PatchError::MissingIntermediateContainer {
                        at: context.to_string(),
                    })
                }
            };
            if let Some(child) = child {
                if Arc::ptr_eq(child, &new_child) {
                    return Ok(current.clone());
                }
            }
            let mut props = props.clone();
            props.insert(name.clone(), new_child);
            Ok(Arc::new(Value::Object(props)))
        }
        (Segment::Index(index), Value::Array(items)) => {
            let child = items.get(*index).ok_or_else(|| PatchError::IndexOutOfRange {
                at: context.to_string(),
                index: *index,
                len: items.len(),
            })?;
            let new_child = update_in(child, context, tail, update)?;
            if Arc::ptr_eq(child, &new_child) {
                return Ok(current.clone());
            }
            let mut items = items.clone();
            items[*index] = new_child;
            Ok(Arc::new(Value::Array(items)))
        }
        (Segment::Key(key), Value::Array(items)) => {
            let index = index_of_key(items, key).ok_or_else(|| PatchError::KeyNotFound {
                at: context.to_string(),
                key: key.clone(),
            })?;
            let child = &items[index];
            let new_child = update_in(child, context, tail, update)?;
            if Arc::ptr_eq(child, &new_child) {
                return Ok(current.clone());
            }
            let mut items = items.clone();
            items[index] = new_child;
            Ok(Arc::new(Value::Array(items)))
        }
        (segment, found) => Err(PatchError::PathTypeMismatch {
            at: context.to_string(),
            expected: segment.expects(),
            found: found.kind(),
        }),
    }
}

enum Removal {
    Unchanged,
    Replaced(Arc<Value>),
    Removed,
}

fn unset_in(current: &Arc<Value>, context: &Path, rest: &[Segment]) -> Result<Removal, PatchError> {
    let Some((head, tail)) = rest.split_first() else {
        return Ok(Removal::Removed);
    };
    match (head, current.as_ref()) {
        (Segment::Field(name), Value::Object(props)) => {
            let Some(child) = props.get(name.as_str()) else {
                return Ok(Removal::Unchanged);
            };
            match unset_in(child, context, tail)? {
                Removal::Unchanged => Ok(Removal::Unchanged),
                Removal::Removed => {
                    let mut props = props.clone();
                    props.remove(name.as_str());
                    Ok(Removal::Replaced(Arc::new(Value::Object(props))))
                }
                Removal::Replaced(value) => {
                    let mut props = props.clone();
                    props.insert(name.clone(), value);
                    Ok(Removal::Replaced(Arc::new(Value::Object(props))))
                }
            }
        }
        (Segment::Index(index), Value::Array(items)) => {
            let Some(child) = items.get(*index) else {
                return Ok(Removal::Unchanged);
            };
            unset_element(items, *index, child, context, tail)
        }
        (Segment::Key(key), Value::Array(items)) => {
            let Some(index) = index_of_key(items, key) else {
                return Ok(Removal::Unchanged);
            };
            unset_element(items, index, &items[index], context, tail)
        }
        (segment, found) => Err(PatchError::PathTypeMismatch {
            at: context.to_string(),
            expected: segment.expects(),
            found: found.kind(),
        }),
    }
}

fn unset_element(
    items: &[Arc<Value>],
    index: usize,
    child: &Arc<Value>,
    context: &Path,
    tail: &[Segment],
) -> Result<Removal, PatchError> {
    match unset_in(child, context, tail)? {
        Removal::Unchanged => Ok(Removal::Unchanged),
        Removal::Removed => {
            let mut items = items.to_vec();
            items.remove(index);
            Ok(Removal::Replaced(Arc::new(Value::Array(items))))
        }
        Removal::Replaced(value) => {
            let mut items = items.to_vec();
            items[index] = value;
            Ok(Removal::Replaced(Arc::new(Value::Array(items))))
        }
    }
}
