use crate::error::{ForkDbError, Result};
use crate::ident;
use crate::schema::refs::SchemaRefs;
use serde_json::Value;

/// One step on the path from the schema root to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Property(String),
    Items,
}

/// Path of a node inside a schema, rendering the two addressing schemes
/// the platform needs: JSON-Pointer paths into the schema document (for
/// patch application) and `$`-rooted query paths into row data (for
/// query pushdown).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodePath(Vec<PathSegment>);

impl NodePath {
    pub fn root() -> Self {
        NodePath(Vec::new())
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    fn child_property(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Property(name.to_string()));
        NodePath(segments)
    }

    fn child_items(&self) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Items);
        NodePath(segments)
    }

    /// JSON-Pointer-style path into the schema document,
    /// e.g. `/properties/tags/items`.
    pub fn pointer(&self) -> String {
        let mut out = String::new();
        for segment in &self.0 {
            match segment {
                PathSegment::Property(name) => {
                    out.push_str("/properties/");
                    out.push_str(name);
                }
                PathSegment::Items => out.push_str("/items"),
            }
        }
        out
    }

    /// Database query path into row data, e.g. `$.tags[*]`.
    pub fn query(&self) -> String {
        let mut out = String::from("$");
        for segment in &self.0 {
            match segment {
                PathSegment::Property(name) => {
                    out.push('.');
                    out.push_str(name);
                }
                PathSegment::Items => out.push_str("[*]"),
            }
        }
        out
    }
}

/// A typed schema node. Closed set of variants; traversals are plain
/// pattern matches.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Object(ObjectNode),
    Array(ArrayNode),
    String(StringNode),
    Number(NumberNode),
    Boolean(BooleanNode),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub path: NodePath,
    pub properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub required: bool,
    pub node: SchemaNode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayNode {
    pub path: NodePath,
    pub items: Box<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringNode {
    pub path: NodePath,
    /// Target table id when this string references rows of another table.
    pub foreign_key: Option<String>,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberNode {
    pub path: NodePath,
    pub default: Option<serde_json::Number>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BooleanNode {
    pub path: NodePath,
    pub default: Option<bool>,
}

impl SchemaNode {
    pub fn path(&self) -> &NodePath {
        match self {
            SchemaNode::Object(n) => &n.path,
            SchemaNode::Array(n) => &n.path,
            SchemaNode::String(n) => &n.path,
            SchemaNode::Number(n) => &n.path,
            SchemaNode::Boolean(n) => &n.path,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SchemaNode::Object(_) => "object",
            SchemaNode::Array(_) => "array",
            SchemaNode::String(_) => "string",
            SchemaNode::Number(_) => "number",
            SchemaNode::Boolean(_) => "boolean",
        }
    }
}

/// A fully-built schema tree plus the hash of the document it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaTree {
    pub root: SchemaNode,
    pub hash: String,
}

impl SchemaTree {
    /// Build a typed tree from a JSON Schema document, resolving `$ref`
    /// ids through the registry. Fails on unknown types, required names
    /// missing from `properties`, and invalid field names.
    pub fn build(schema: &Value, refs: &SchemaRefs) -> Result<Self> {
        let root = build_node(schema, refs, NodePath::root())?;
        Ok(SchemaTree { root, hash: super::hash_schema(schema) })
    }

    /// Deduplicated, sorted list of foreign-key target tables anywhere
    /// in the tree.
    pub fn foreign_keys(&self) -> Vec<String> {
        let mut targets = Vec::new();
        collect_foreign_keys(&self.root, &mut targets);
        targets.sort();
        targets.dedup();
        targets
    }
}

fn collect_foreign_keys(node: &SchemaNode, out: &mut Vec<String>) {
    match node {
        SchemaNode::Object(object) => {
            for property in &object.properties {
                collect_foreign_keys(&property.node, out);
            }
        }
        SchemaNode::Array(array) => collect_foreign_keys(&array.items, out),
        SchemaNode::String(string) => {
            if let Some(target) = &string.foreign_key {
                out.push(target.clone());
            }
        }
        SchemaNode::Number(_) | SchemaNode::Boolean(_) => {}
    }
}

fn build_node(schema: &Value, refs: &SchemaRefs, path: NodePath) -> Result<SchemaNode> {
    let object = schema.as_object().ok_or_else(|| {
        ForkDbError::Schema(format!("Schema node at '{}' must be an object", path.pointer()))
    })?;

    if let Some(reference) = object.get("$ref") {
        let id = reference.as_str().ok_or_else(|| {
            ForkDbError::Schema(format!("$ref at '{}' must be a string", path.pointer()))
        })?;
        let resolved = refs.resolve(id).ok_or_else(|| {
            ForkDbError::Schema(format!("Unknown $ref '{}' at '{}'", id, path.pointer()))
        })?;
        return build_node(resolved, refs, path);
    }

    let type_name = object.get("type").and_then(Value::as_str).ok_or_else(|| {
        ForkDbError::Schema(format!("Schema node at '{}' has no type", path.pointer()))
    })?;

    match type_name {
        "object" => {
            let empty = serde_json::Map::new();
            let properties_value = match object.get("properties") {
                Some(v) => v.as_object().ok_or_else(|| {
                    ForkDbError::Schema(format!(
                        "'properties' at '{}' must be an object",
                        path.pointer()
                    ))
                })?,
                None => &empty,
            };

            let mut required_names: Vec<&str> = Vec::new();
            if let Some(required) = object.get("required") {
                let list = required.as_array().ok_or_else(|| {
                    ForkDbError::Schema(format!(
                        "'required' at '{}' must be an array",
                        path.pointer()
                    ))
                })?;
                for entry in list {
                    let name = entry.as_str().ok_or_else(|| {
                        ForkDbError::Schema(format!(
                            "'required' entries at '{}' must be strings",
                            path.pointer()
                        ))
                    })?;
                    if !properties_value.contains_key(name) {
                        return Err(ForkDbError::Schema(format!(
                            "Required property '{}' at '{}' is not declared in 'properties'",
                            name,
                            path.pointer()
                        )));
                    }
                    required_names.push(name);
                }
            }

            let mut properties = Vec::new();
            for (name, property_schema) in properties_value {
                ident::validate_field_name(name).map_err(|_| {
                    ForkDbError::Schema(format!(
                        "Invalid field name '{}' at '{}'",
                        name,
                        path.pointer()
                    ))
                })?;
                let node = build_node(property_schema, refs, path.child_property(name))?;
                properties.push(Property {
                    name: name.clone(),
                    required: required_names.contains(&name.as_str()),
                    node,
                });
            }
            Ok(SchemaNode::Object(ObjectNode { path, properties }))
        }
        "array" => {
            let items = object.get("items").ok_or_else(|| {
                ForkDbError::Schema(format!(
                    "Array schema at '{}' must declare exactly one 'items' schema",
                    path.pointer()
                ))
            })?;
            let node = build_node(items, refs, path.child_items())?;
            Ok(SchemaNode::Array(ArrayNode { path, items: Box::new(node) }))
        }
        "string" => {
            let foreign_key = match object.get("foreignKey") {
                Some(v) => Some(
                    v.as_str()
                        .ok_or_else(|| {
                            ForkDbError::Schema(format!(
                                "'foreignKey' at '{}' must be a string",
                                path.pointer()
                            ))
                        })?
                        .to_string(),
                ),
                None => None,
            };
            let default = match object.get("default") {
                Some(v) => Some(
                    v.as_str()
                        .ok_or_else(|| {
                            ForkDbError::Schema(format!(
                                "String default at '{}' must be a string",
                                path.pointer()
                            ))
                        })?
                        .to_string(),
                ),
                None => None,
            };
            Ok(SchemaNode::String(StringNode { path, foreign_key, default }))
        }
        "number" | "integer" => {
            let default = match object.get("default") {
                Some(v) => Some(v.as_number().cloned().ok_or_else(|| {
                    ForkDbError::Schema(format!(
                        "Number default at '{}' must be a number",
                        path.pointer()
                    ))
                })?),
                None => None,
            };
            Ok(SchemaNode::Number(NumberNode { path, default }))
        }
        "boolean" => {
            let default = match object.get("default") {
                Some(v) => Some(v.as_bool().ok_or_else(|| {
                    ForkDbError::Schema(format!(
                        "Boolean default at '{}' must be a boolean",
                        path.pointer()
                    ))
                })?),
                None => None,
            };
            Ok(SchemaNode::Boolean(BooleanNode { path, default }))
        }
        other => Err(ForkDbError::Schema(format!(
            "Unsupported schema type '{}' at '{}'",
            other,
            path.pointer()
        ))),
    }
}

/// A property name in a schema document that fails identifier rules,
/// reported with the pointer of its parent node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFieldName {
    pub pointer: String,
    pub name: String,
}

/// Collect every offending property name in a raw schema document, for
/// user-facing error reporting. Unlike `SchemaTree::build`, this never
/// stops at the first problem.
pub fn invalid_field_names(schema: &Value) -> Vec<InvalidFieldName> {
    let mut out = Vec::new();
    walk_field_names(schema, "", &mut out);
    out
}

fn walk_field_names(schema: &Value, pointer: &str, out: &mut Vec<InvalidFieldName>) {
    let Some(object) = schema.as_object() else { return };
    if let Some(properties) = object.get("properties").and_then(Value::as_object) {
        for (name, child) in properties {
            if !ident::is_valid_field_name(name) {
                out.push(InvalidFieldName { pointer: pointer.to_string(), name: name.clone() });
            }
            let child_pointer = format!("{pointer}/properties/{name}");
            walk_field_names(child, &child_pointer, out);
        }
    }
    if let Some(items) = object.get("items") {
        walk_field_names(items, &format!("{pointer}/items"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "views": { "type": "number", "default": 0 },
                "published": { "type": "boolean", "default": false },
                "author": { "type": "string", "foreignKey": "authors" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "meta": {
                    "type": "object",
                    "properties": {
                        "editor": { "type": "string", "foreignKey": "authors" }
                    }
                }
            },
            "required": ["title"]
        })
    }

    #[test]
    fn builds_typed_tree() {
        let tree = SchemaTree::build(&post_schema(), &SchemaRefs::standard()).unwrap();
        let SchemaNode::Object(root) = &tree.root else { panic!("expected object root") };
        let title = root.properties.iter().find(|p| p.name == "title").unwrap();
        assert!(title.required);
        assert!(matches!(title.node, SchemaNode::String(_)));
        let tags = root.properties.iter().find(|p| p.name == "tags").unwrap();
        assert!(!tags.required);
        assert!(matches!(tags.node, SchemaNode::Array(_)));
    }

    #[test]
    fn pointer_and_query_paths() {
        let tree = SchemaTree::build(&post_schema(), &SchemaRefs::standard()).unwrap();
        let SchemaNode::Object(root) = &tree.root else { panic!() };
        let tags = root.properties.iter().find(|p| p.name == "tags").unwrap();
        let SchemaNode::Array(array) = &tags.node else { panic!() };
        assert_eq!(array.items.path().pointer(), "/properties/tags/items");
        assert_eq!(array.items.path().query(), "$.tags[*]");

        let meta = root.properties.iter().find(|p| p.name == "meta").unwrap();
        let SchemaNode::Object(meta_object) = &meta.node else { panic!() };
        let editor = &meta_object.properties[0];
        assert_eq!(editor.node.path().pointer(), "/properties/meta/properties/editor");
        assert_eq!(editor.node.path().query(), "$.meta.editor");
    }

    #[test]
    fn path_round_trips_into_schema_document() {
        // Navigating the original document by each leaf's pointer lands
        // on a node of the same type.
        let schema = post_schema();
        let tree = SchemaTree::build(&schema, &SchemaRefs::standard()).unwrap();
        let mut leaves = Vec::new();
        collect_leaves(&tree.root, &mut leaves);
        assert!(!leaves.is_empty());
        for (pointer, type_name) in leaves {
            let node = schema.pointer(&pointer).unwrap_or_else(|| panic!("{pointer}"));
            let found = node.get("type").and_then(Value::as_str).unwrap();
            // integer folds into the number variant
            assert!(found == type_name || (found == "integer" && type_name == "number"));
        }
    }

    fn collect_leaves(node: &SchemaNode, out: &mut Vec<(String, &'static str)>) {
        match node {
            SchemaNode::Object(object) => {
                for property in &object.properties {
                    collect_leaves(&property.node, out);
                }
            }
            SchemaNode::Array(array) => collect_leaves(&array.items, out),
            leaf => out.push((leaf.path().pointer(), leaf.type_name())),
        }
    }

    #[test]
    fn foreign_keys_deduplicated_and_sorted() {
        let tree = SchemaTree::build(&post_schema(), &SchemaRefs::standard()).unwrap();
        assert_eq!(tree.foreign_keys(), vec!["authors".to_string()]);
    }

    #[test]
    fn required_name_must_exist_in_properties() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "required": ["a", "missing"]
        });
        let err = SchemaTree::build(&schema, &SchemaRefs::standard()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn invalid_field_name_fails_build() {
        let schema = json!({
            "type": "object",
            "properties": { "__hidden": { "type": "string" } }
        });
        assert!(SchemaTree::build(&schema, &SchemaRefs::standard()).is_err());
    }

    #[test]
    fn array_requires_items() {
        let schema = json!({ "type": "array" });
        assert!(SchemaTree::build(&schema, &SchemaRefs::standard()).is_err());
    }

    #[test]
    fn ref_resolution_through_registry() {
        let schema = json!({
            "type": "object",
            "properties": { "id": { "$ref": "row-id" } }
        });
        let tree = SchemaTree::build(&schema, &SchemaRefs::standard()).unwrap();
        let SchemaNode::Object(root) = &tree.root else { panic!() };
        assert!(matches!(root.properties[0].node, SchemaNode::String(_)));

        let unknown = json!({ "$ref": "nope" });
        assert!(SchemaTree::build(&unknown, &SchemaRefs::standard()).is_err());
    }

    #[test]
    fn invalid_field_names_reports_every_offender() {
        let schema = json!({
            "type": "object",
            "properties": {
                "__a": { "type": "string" },
                "ok": {
                    "type": "object",
                    "properties": { "9bad": { "type": "number" } }
                }
            }
        });
        let bad = invalid_field_names(&schema);
        assert_eq!(bad.len(), 2);
        assert!(bad.iter().any(|f| f.name == "__a" && f.pointer.is_empty()));
        assert!(bad.iter().any(|f| f.name == "9bad" && f.pointer == "/properties/ok"));
    }
}
