use serde_json::{json, Value};
use std::collections::HashMap;

/// Registry of well-known sub-schemas referenced from table schemas via
/// `{"$ref": "<id>"}`. System-managed fields (row id, version id,
/// timestamps) validate against the same canonical shape in every table.
#[derive(Debug, Clone)]
pub struct SchemaRefs {
    refs: HashMap<String, Value>,
}

impl SchemaRefs {
    pub fn empty() -> Self {
        SchemaRefs { refs: HashMap::new() }
    }

    /// The fixed platform registry.
    pub fn standard() -> Self {
        let mut refs = HashMap::new();
        refs.insert("row-id".to_string(), json!({ "type": "string" }));
        refs.insert("row-version-id".to_string(), json!({ "type": "string" }));
        refs.insert("created-at".to_string(), json!({ "type": "string" }));
        refs.insert("updated-at".to_string(), json!({ "type": "string" }));
        refs.insert("published-at".to_string(), json!({ "type": "string" }));
        SchemaRefs { refs }
    }

    pub fn insert(&mut self, id: impl Into<String>, schema: Value) {
        self.refs.insert(id.into(), schema);
    }

    pub fn resolve(&self, id: &str) -> Option<&Value> {
        self.refs.get(id)
    }
}

impl Default for SchemaRefs {
    fn default() -> Self {
        SchemaRefs::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_resolves_row_id() {
        let refs = SchemaRefs::standard();
        assert_eq!(refs.resolve("row-id"), Some(&json!({ "type": "string" })));
        assert!(refs.resolve("unknown").is_none());
    }

    #[test]
    fn custom_refs_can_be_registered() {
        let mut refs = SchemaRefs::empty();
        refs.insert("color", json!({ "type": "string" }));
        assert!(refs.resolve("color").is_some());
    }
}
