//! Structural query keys.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a cacheable read: an ordered tuple of JSON segments,
/// e.g. `["projects", {}]` or `["task", 42]`.
///
/// Equality and hashing go through a canonical encoding (object keys sorted,
/// no whitespace), so two keys built from structurally equal parts always
/// land in the same cache slot, whatever order their filter fields were
/// inserted in.
#[derive(Clone)]
pub struct QueryKey {
  parts: Vec<Value>,
  canonical: String,
}

impl QueryKey {
  /// Start a key with its resource kind.
  pub fn new(kind: impl Into<String>) -> Self {
    Self::from_parts(vec![Value::String(kind.into())])
  }

  /// Build a key from already-assembled segments.
  pub fn from_parts(parts: Vec<Value>) -> Self {
    let canonical = canonical_parts(&parts);
    Self { parts, canonical }
  }

  /// Append a segment (an id, a filter object, ...).
  pub fn with(mut self, part: impl Into<Value>) -> Self {
    self.parts.push(part.into());
    self.canonical = canonical_parts(&self.parts);
    self
  }

  /// Parse a key previously produced by [`QueryKey::to_json`].
  pub fn from_json(s: &str) -> serde_json::Result<Self> {
    let parts: Vec<Value> = serde_json::from_str(s)?;
    Ok(Self::from_parts(parts))
  }

  /// Canonical JSON array form.
  pub fn to_json(&self) -> &str {
    &self.canonical
  }

  pub fn parts(&self) -> &[Value] {
    &self.parts
  }

  /// Resource kind (first segment), if it is a string.
  pub fn kind(&self) -> Option<&str> {
    self.parts.first().and_then(Value::as_str)
  }

  /// True if `prefix` matches the leading segments of this key.
  /// A key is a prefix of itself.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    prefix.parts.len() <= self.parts.len()
      && self
        .parts
        .iter()
        .zip(&prefix.parts)
        .all(|(a, b)| canonical_value(a) == canonical_value(b))
  }

  /// SHA256 of the canonical form, for stable fixed-length storage ids.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl PartialEq for QueryKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.canonical)
  }
}

fn canonical_parts(parts: &[Value]) -> String {
  let mut out = String::from("[");
  for (i, part) in parts.iter().enumerate() {
    if i > 0 {
      out.push(',');
    }
    write_canonical(part, &mut out);
  }
  out.push(']');
  out
}

fn canonical_value(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

/// Serialize with object keys sorted, independent of the map's own ordering.
///
/// `serde_json::to_string` only sorts while `Map` is a `BTreeMap`. Any crate
/// in the build enabling serde_json's `preserve_order` feature switches it to
/// insertion order, which would split equal keys across slots.
fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      out.push('{');
      for (i, (k, v)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(k.clone()).to_string());
        out.push(':');
        write_canonical(v, out);
      }
      out.push('}');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}
