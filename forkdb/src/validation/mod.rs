use crate::schema::value::json_type_name;
use crate::schema::{SchemaNode, SchemaTree};
use serde_json::Value;

/// Result of validating one row's data against a schema tree.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validation issues for one row in a batch, keyed by the id the caller
/// supplied so every invalid row is reported, not just the first.
#[derive(Debug, Clone)]
pub struct RowIssues {
    pub row_id: String,
    pub errors: Vec<String>,
}

/// Validate row data against a schema tree, collecting every error:
/// missing required properties, unknown properties, and type mismatches
/// at any depth.
pub fn validate_value(schema: &SchemaTree, data: &Value) -> ValidationResult {
    let mut result = ValidationResult::default();
    validate_node(&schema.root, Some(data), &mut result);
    result
}

fn validate_node(schema: &SchemaNode, data: Option<&Value>, result: &mut ValidationResult) {
    let Some(value) = data else { return };
    if value.is_null() {
        // null reads as unset; required-ness is checked by the parent
        return;
    }

    match schema {
        SchemaNode::Object(object) => {
            let Some(mapping) = value.as_object() else {
                result.errors.push(type_error(schema, value));
                return;
            };
            for property in &object.properties {
                let child = mapping.get(&property.name);
                let unset = matches!(child, None | Some(Value::Null));
                if property.required && unset {
                    result.errors.push(format!(
                        "Required property '{}' is missing at '{}'",
                        property.name,
                        object.path.query()
                    ));
                    continue;
                }
                validate_node(&property.node, child, result);
            }
            for key in mapping.keys() {
                if !object.properties.iter().any(|p| &p.name == key) {
                    result.errors.push(format!(
                        "Unknown property '{}' at '{}'",
                        key,
                        object.path.query()
                    ));
                }
            }
        }
        SchemaNode::Array(array) => {
            let Some(entries) = value.as_array() else {
                result.errors.push(type_error(schema, value));
                return;
            };
            for entry in entries {
                validate_node(&array.items, Some(entry), result);
            }
        }
        SchemaNode::String(_) => {
            if !value.is_string() {
                result.errors.push(type_error(schema, value));
            }
        }
        SchemaNode::Number(_) => {
            if !value.is_number() {
                result.errors.push(type_error(schema, value));
            }
        }
        SchemaNode::Boolean(_) => {
            if !value.is_boolean() {
                result.errors.push(type_error(schema, value));
            }
        }
    }
}

fn type_error(schema: &SchemaNode, value: &Value) -> String {
    format!(
        "Value at '{}' expected {}, got {}",
        schema.path().query(),
        schema.type_name(),
        json_type_name(value)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRefs;
    use serde_json::json;

    fn schema() -> SchemaTree {
        let doc = json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "views": { "type": "number" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "meta": {
                    "type": "object",
                    "properties": { "pinned": { "type": "boolean" } },
                    "required": ["pinned"]
                }
            },
            "required": ["title"]
        });
        SchemaTree::build(&doc, &SchemaRefs::standard()).unwrap()
    }

    #[test]
    fn valid_row_passes() {
        let result = validate_value(
            &schema(),
            &json!({ "title": "Hi", "views": 2, "tags": ["a"], "meta": { "pinned": true } }),
        );
        assert!(result.is_ok(), "{:?}", result.errors);
    }

    #[test]
    fn missing_required_reported() {
        let result = validate_value(&schema(), &json!({ "views": 2 }));
        assert!(result.errors.iter().any(|e| e.contains("title")));
    }

    #[test]
    fn null_counts_as_unset_for_required() {
        let result = validate_value(&schema(), &json!({ "title": null }));
        assert!(!result.is_ok());
    }

    #[test]
    fn collects_every_error_not_just_the_first() {
        let result = validate_value(
            &schema(),
            &json!({ "views": "many", "tags": [1, 2], "extra": true }),
        );
        // missing title, wrong views type, two wrong tag entries, unknown prop
        assert!(result.errors.len() >= 5, "{:?}", result.errors);
        assert!(result.errors.iter().any(|e| e.contains("$.views")));
        assert!(result.errors.iter().any(|e| e.contains("$.tags[*]")));
        assert!(result.errors.iter().any(|e| e.contains("extra")));
    }

    #[test]
    fn nested_required_uses_query_path() {
        let result = validate_value(&schema(), &json!({ "title": "Hi", "meta": {} }));
        assert!(result.errors.iter().any(|e| e.contains("pinned") && e.contains("$.meta")));
    }
}
