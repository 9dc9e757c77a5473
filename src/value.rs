use std::{collections::HashMap, fmt, sync::Arc};

use smol_str::SmolStr;

use crate::keys::KeyGenerator;

/// The field carrying the stable per-element key of keyed array members.
pub const KEY_FIELD: &str = "_key";

/// A JSON-like tree value. Children are held behind `Arc` so that rebuilding
/// one spine of the tree shares every untouched subtree with the previous
/// version by pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Arc<Value>>),
    Object(HashMap<SmolStr, Arc<Value>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "a boolean",
            ValueKind::Number => "a number",
            ValueKind::String => "a string",
            ValueKind::Array => "an array",
            ValueKind::Object => "an object",
        };
        write!(f, "{}", name)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| Arc::new(Value::from_json(v)))
                    .collect(),
            ),
            serde_json::Value::Object(props) => Value::Object(
                props
                    .iter()
                    .map(|(k, v)| (SmolStr::new(k), Arc::new(Value::from_json(v))))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(
                serde_json::Number::from_f64(*n).unwrap_or_else(|| serde_json::Number::from(0)),
            ),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            Value::Object(props) => serde_json::Value::Object(
                props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&HashMap<SmolStr, Arc<Value>>> {
        match self {
            Value::Object(props) => Some(props),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Arc<Value>]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Object field lookup; `None` on anything that is not an object.
    pub fn get(&self, name: &str) -> Option<&Arc<Value>> {
        self.as_object().and_then(|props| props.get(name))
    }

    /// The stable key of a keyed array element.
    pub fn key(&self) -> Option<&str> {
        self.get(KEY_FIELD).and_then(|v| v.as_str())
    }
}

/// Position of the element with the given `_key`, by linear scan. Arrays in
/// this domain are short; no index is maintained.
pub(crate) fn index_of_key(items: &[Arc<Value>], key: &str) -> Option<usize> {
    items.iter().position(|item| item.key() == Some(key))
}

/// Walk a value and give every keyless object in an array a fresh `_key`.
///
/// Untouched subtrees come back pointer-identical, so calling this on an
/// unchanged value is free. Runs once when a value is staged, never during
/// rebase replay, which keeps replayed patches deterministic.
pub(crate) fn ensure_array_keys(value: &Arc<Value>, keys: &dyn KeyGenerator) -> Arc<Value> {
    match value.as_ref() {
        Value::Array(items) => {
            let mut changed = false;
            let new_items: Vec<Arc<Value>> = items
                .iter()
                .map(|item| {
                    let mut new_item = ensure_array_keys(item, keys);
                    if let Value::Object(props) = new_item.as_ref() {
                        if !props.contains_key(KEY_FIELD) {
                            let mut props = props.clone();
                            props.insert(
                                SmolStr::new(KEY_FIELD),
                                Arc::new(Value::String(keys.generate().to_string())),
                            );
                            new_item = Arc::new(Value::Object(props));
                        }
                    }
                    changed = changed || !Arc::ptr_eq(&new_item, item);
                    new_item
                })
                .collect();
            if changed {
                Arc::new(Value::Array(new_items))
            } else {
                value.clone()
            }
        }
        Value::Object(props) => {
            let mut changed = false;
            let new_props: HashMap<SmolStr, Arc<Value>> = props
                .iter()
                .map(|(k, v)| {
                    let new_v = ensure_array_keys(v, keys);
                    changed = changed || !Arc::ptr_eq(&new_v, v);
                    (k.clone(), new_v)
                })
                .collect();
            if changed {
                Arc::new(Value::Object(new_props))
            } else {
                value.clone()
            }
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyGenerator;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SeqKeys(AtomicUsize);

    impl KeyGenerator for SeqKeys {
        fn generate(&self) -> SmolStr {
            let n = self.0.fetch_add(1, Ordering::Relaxed);
            SmolStr::new(format!("k{}", n))
        }
    }

    #[test]
    fn json_round_trip() {
        let json = json!({
            "title": "A",
            "count": 3.0,
            "tags": ["x", "y"],
            "nested": {"flag": true, "nothing": null}
        });
        assert_eq!(Value::from_json(&json).to_json(), json);
    }

    #[test]
    fn key_lookup() {
        let v = Value::from_json(&json!([{"_key": "a", "n": 1.0}, {"_key": "b"}]));
        let items = v.as_array().unwrap();
        assert_eq!(index_of_key(items, "b"), Some(1));
        assert_eq!(index_of_key(items, "zz"), None);
    }

    #[test]
    fn ensure_keys_assigns_only_where_missing() {
        let keys = SeqKeys(AtomicUsize::new(0));
        let v = Arc::new(Value::from_json(&json!({
            "blocks": [{"_key": "keep"}, {"text": "fresh"}],
            "plain": [1.0, 2.0]
        })));
        let ensured = ensure_array_keys(&v, &keys);
        let blocks = ensured.get("blocks").unwrap().as_array().unwrap();
        assert_eq!(blocks[0].key(), Some("keep"));
        assert_eq!(blocks[1].key(), Some("k0"));
        // primitive arrays are left alone, pointer and all
        assert!(Arc::ptr_eq(
            v.get("plain").unwrap(),
            ensured.get("plain").unwrap()
        ));
    }

    #[test]
    fn ensure_keys_is_identity_on_fully_keyed_values() {
        let keys = SeqKeys(AtomicUsize::new(0));
        let v = Arc::new(Value::from_json(&json!({"blocks": [{"_key": "a"}]})));
        let ensured = ensure_array_keys(&v, &keys);
        assert!(Arc::ptr_eq(&v, &ensured));
    }
}
