//! Query key codec
//!
//! A query key identifies one `(function name, argument list)` pair. Keys
//! are derived from the canonical JSON serialization of the pair, so two
//! calls with structurally equal arguments land on the same key no matter
//! which process computed it or how object fields were ordered.

use blake3::Hasher;
use serde_json::Value;
use std::fmt;

/// Canonical identifier of a live query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    /// Encode a function name and its arguments into a key
    pub fn encode(name: &str, args: &[Value]) -> Self {
        // (name, args) as a JSON array keeps the name and the argument list
        // unambiguously separated; object keys serialize in sorted order.
        let canonical = Value::Array(vec![
            Value::String(name.to_string()),
            Value::Array(args.to_vec()),
        ]);
        QueryKey(canonical.to_string())
    }

    /// The canonical string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short content hash, used to keep log lines readable
    pub fn fingerprint(&self) -> String {
        let mut hasher = Hasher::new();
        hasher.update(self.0.as_bytes());
        hasher.finalize().to_hex()[..12].to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
