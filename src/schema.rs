//! Pre-flight checks against the declared field kinds of a document type.
//! The schema layer is consumed, not produced, here: the rendering side
//! hands us a map of declared kinds and we refuse edits that are certain to
//! fail, before they are ever staged. The patch algebra itself stays
//! schema-agnostic.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::SchemaError;
use crate::patch::PatchOp;
use crate::path::{Path, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    #[serde(default)]
    pub fields: HashMap<SmolStr, FieldKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub types: HashMap<SmolStr, TypeSchema>,
}

impl Schema {
    /// Check that numeric deltas and text patches target fields whose
    /// declared kind can carry them. Only declared top-level fields are
    /// checked; everything else passes through to the algebra's own errors.
    pub fn check_ops(&self, doc_type: &str, ops: &[PatchOp]) -> Result<(), SchemaError> {
        let Some(schema) = self.types.get(doc_type) else {
            return Ok(());
        };
        for op in ops {
            match op {
                PatchOp::Inc { path, .. } | PatchOp::Dec { path, .. } => {
                    expect_kind(schema, doc_type, path, FieldKind::Number, "a numeric delta")?
                }
                PatchOp::DiffMatchPatch { path, .. } => {
                    expect_kind(schema, doc_type, path, FieldKind::String, "a text patch")?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn expect_kind(
    schema: &TypeSchema,
    doc_type: &str,
    path: &Path,
    want: FieldKind,
    operation: &'static str,
) -> Result<(), SchemaError> {
    if let [Segment::Field(name)] = path.segments() {
        if let Some(declared) = schema.fields.get(name) {
            if *declared != want {
                return Err(SchemaError::IncompatibleField {
                    doc_type: SmolStr::new(doc_type),
                    field: name.clone(),
                    declared: *declared,
                    operation,
                });
            }
        }
    }
    Ok(())
}
