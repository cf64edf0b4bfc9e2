pub mod refs;
pub mod tree;
pub mod value;

pub use refs::SchemaRefs;
pub use tree::{
    invalid_field_names, ArrayNode, BooleanNode, InvalidFieldName, NodePath, NumberNode,
    ObjectNode, PathSegment, Property, SchemaNode, SchemaTree, StringNode,
};
pub use value::{ValueNode, ValueTree};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of a schema document. `serde_json` keeps object keys
/// sorted, so serialization is canonical and the hash is stable across
/// property insertion order.
pub fn hash_schema(schema: &Value) -> String {
    hash_value(schema)
}

/// Content hash of a row's data; same canonicalization as schemas.
pub fn hash_content(data: &Value) -> String {
    hash_value(data)
}

fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_stable_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(hash_schema(&a), hash_schema(&b));
    }

    #[test]
    fn hash_distinguishes_content() {
        assert_ne!(hash_content(&json!({"a": 1})), hash_content(&json!({"a": 2})));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = hash_schema(&json!({}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
