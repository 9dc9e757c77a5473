use std::{fmt, str::FromStr, sync::Arc};

use smol_str::SmolStr;

use crate::{
    error::{ParsePathError, PatchError},
    value::{index_of_key, Value},
};

/// One step into a document tree: an object field, an array position, or a
/// stable array-element key. Keys address elements independently of position,
/// which insulates a patch from concurrent reordering of its target array.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    Field(SmolStr),
    Index(usize),
    Key(SmolStr),
}

impl Segment {
    /// The kind of container this segment can step into.
    pub(crate) fn expects(&self) -> &'static str {
        match self {
            Segment::Field(_) => "an object",
            Segment::Index(_) | Segment::Key(_) => "an array",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path(Vec<Segment>);

impl Path {
    pub fn root() -> Path {
        Path(Vec::new())
    }

    pub fn field(mut self, name: impl Into<SmolStr>) -> Path {
        self.0.push(Segment::Field(name.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Path {
        self.0.push(Segment::Index(index));
        self
    }

    pub fn key(mut self, key: impl Into<SmolStr>) -> Path {
        self.0.push(Segment::Key(key.into()));
        self
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Everything but the final segment.
    pub fn parent(&self) -> Path {
        let mut segments = self.0.clone();
        segments.pop();
        Path(segments)
    }

    /// The final segment, if any.
    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.len() >= prefix.0.len()
            && self.0.iter().zip(prefix.0.iter()).all(|(a, b)| a == b)
    }

    /// Walk this path down from `root`. A segment that finds nothing yields
    /// `Ok(None)`; a segment aimed at the wrong kind of container is a
    /// `PathTypeMismatch`, never a silent `None`.
    pub fn resolve<'a>(&self, root: &'a Arc<Value>) -> Result<Option<&'a Arc<Value>>, PatchError> {
        let mut current = root;
        for segment in &self.0 {
            let next = match (segment, current.as_ref()) {
                (Segment::Field(name), Value::Object(props)) => props.get(name.as_str()),
                (Segment::Index(i), Value::Array(items)) => items.get(*i),
                (Segment::Key(key), Value::Array(items)) => {
                    index_of_key(items, key).map(|i| &items[i])
                }
                (segment, found) => {
                    return Err(PatchError::PathTypeMismatch {
                        at: self.to_string(),
                        expected: segment.expects(),
                        found: found.kind(),
                    })
                }
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Field(name) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", name)?;
                }
                Segment::Index(index) => write!(f, "[{}]", index)?,
                Segment::Key(key) => write!(f, "[_key==\"{}\"]", key)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = ParsePathError;

    fn from_str(input: &str) -> Result<Path, ParsePathError> {
        let bad = || ParsePathError(input.to_string());
        let mut segments = Vec::new();
        let mut rest = input;
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped.find(']').ok_or_else(bad)?;
                let inner = &stripped[..end];
                if let Some(key) = inner
                    .strip_prefix("_key==\"")
                    .and_then(|k| k.strip_suffix('"'))
                {
                    if key.is_empty() {
                        return Err(bad());
                    }
                    segments.push(Segment::Key(SmolStr::new(key)));
                } else {
                    let index: usize = inner.parse().map_err(|_| bad())?;
                    segments.push(Segment::Index(index));
                }
                rest = &stripped[end + 1..];
                // a dot may separate a bracket from a following field
                if let Some(after_dot) = rest.strip_prefix('.') {
                    if after_dot.is_empty() {
                        return Err(bad());
                    }
                    rest = after_dot;
                }
            } else {
                let end = rest
                    .find(|c| c == '.' || c == '[')
                    .unwrap_or(rest.len());
                let name = &rest[..end];
                if name.is_empty() {
                    return Err(bad());
                }
                segments.push(Segment::Field(SmolStr::new(name)));
                rest = &rest[end..];
                if let Some(after_dot) = rest.strip_prefix('.') {
                    if after_dot.is_empty() {
                        return Err(bad());
                    }
                    rest = after_dot;
                }
            }
        }
        Ok(Path(segments))
    }
}
