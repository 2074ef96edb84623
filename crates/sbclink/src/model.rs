//! Host-side mirror of the firmware object model.
//!
//! The firmware pushes JSON patches over the link; the mirror merges them
//! per key and serves `get_object_model` IPC queries. This is deliberately
//! a thin cache, not a typed model: clients interpret the JSON themselves.

use std::sync::RwLock;

use serde_json::{Map, Value};
use tracing::warn;

pub struct ObjectModelMirror {
    root: RwLock<Value>,
}

impl ObjectModelMirror {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Value::Object(Map::new())),
        }
    }

    /// Merge a JSON patch from the firmware into the mirror.
    pub fn apply_patch(&self, patch: &str) {
        let parsed: Value = match serde_json::from_str(patch) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "discarding unparsable object-model patch");
                return;
            }
        };
        if let Ok(mut root) = self.root.write() {
            merge(&mut root, parsed);
        }
    }

    /// Fetch a subtree by dotted key (`"move.axes"`); empty key returns the
    /// whole model. Missing paths yield JSON null.
    pub fn query(&self, key: &str) -> Value {
        let root = match self.root.read() {
            Ok(root) => root,
            Err(_) => return Value::Null,
        };
        if key.is_empty() {
            return root.clone();
        }
        let mut node = &*root;
        for part in key.split('.') {
            node = match node.get(part) {
                Some(child) => child,
                None => return Value::Null,
            };
        }
        node.clone()
    }
}

impl Default for ObjectModelMirror {
    fn default() -> Self {
        Self::new()
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_merge_per_key() {
        let mirror = ObjectModelMirror::new();
        mirror.apply_patch(r#"{"state":{"status":"idle","upTime":5}}"#);
        mirror.apply_patch(r#"{"state":{"status":"processing"},"heat":{"heaters":[]}}"#);

        assert_eq!(mirror.query("state.status"), Value::from("processing"));
        assert_eq!(mirror.query("state.upTime"), Value::from(5));
        assert!(mirror.query("heat").is_object());
    }

    #[test]
    fn arrays_replace_rather_than_merge() {
        let mirror = ObjectModelMirror::new();
        mirror.apply_patch(r#"{"tools":[1,2,3]}"#);
        mirror.apply_patch(r#"{"tools":[4]}"#);
        assert_eq!(mirror.query("tools"), serde_json::json!([4]));
    }

    #[test]
    fn missing_key_is_null() {
        let mirror = ObjectModelMirror::new();
        assert_eq!(mirror.query("no.such.key"), Value::Null);
    }

    #[test]
    fn bad_patch_is_ignored() {
        let mirror = ObjectModelMirror::new();
        mirror.apply_patch("{not json");
        assert!(mirror.query("").is_object());
    }
}
