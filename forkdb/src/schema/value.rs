use crate::error::{ForkDbError, Result};
use crate::schema::tree::{NodePath, SchemaNode, SchemaTree};
use serde_json::Value;
use std::collections::BTreeMap;

/// A row's data bound to its schema, node by node. Built only from data
/// that already passed validation; plugins mutate this tree before it is
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueNode {
    Object(ObjectValue),
    Array(ArrayValue),
    String(StringValue),
    Number(NumberValue),
    Boolean(BooleanValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValue {
    pub path: NodePath,
    /// Whether the object itself appeared in the row data. An absent
    /// optional object round-trips as absent.
    pub present: bool,
    pub properties: Vec<(String, ValueNode)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub path: NodePath,
    pub present: bool,
    pub items: Vec<ValueNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringValue {
    pub path: NodePath,
    pub value: Option<String>,
    pub default: Option<String>,
    /// Target table id when this leaf references another table's rows.
    pub foreign_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberValue {
    pub path: NodePath,
    pub value: Option<serde_json::Number>,
    pub default: Option<serde_json::Number>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BooleanValue {
    pub path: NodePath,
    pub value: Option<bool>,
    pub default: Option<bool>,
}

impl StringValue {
    /// The concrete value, falling back to the schema default when unset.
    pub fn plain_value(&self) -> Option<&str> {
        self.value.as_deref().or(self.default.as_deref())
    }
}

impl NumberValue {
    pub fn plain_value(&self) -> Option<&serde_json::Number> {
        self.value.as_ref().or(self.default.as_ref())
    }
}

impl BooleanValue {
    pub fn plain_value(&self) -> Option<bool> {
        self.value.or(self.default)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueTree {
    pub row_id: String,
    pub root: ValueNode,
}

impl ValueTree {
    /// Bind row data to the schema tree. The data is expected to have
    /// passed validation; a shape mismatch here is still reported as a
    /// validation error rather than silently dropped.
    pub fn build(schema: &SchemaTree, row_id: &str, data: &Value) -> Result<Self> {
        let root = bind(&schema.root, Some(data))?;
        Ok(ValueTree { row_id: row_id.to_string(), root })
    }

    /// Serialize the (possibly plugin-mutated) tree back into row data.
    /// Unset values are omitted; schema defaults are not baked in.
    pub fn to_value(&self) -> Value {
        render(&self.root).unwrap_or(Value::Object(serde_json::Map::new()))
    }

    /// Every foreign-key reference in the tree as sorted, deduplicated
    /// `(target table, row ids)` pairs. Defaults count: an unset leaf
    /// with a default still references that row.
    pub fn foreign_keys(&self) -> Vec<(String, Vec<String>)> {
        let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        collect_references(&self.root, &mut by_table);
        by_table
            .into_iter()
            .map(|(table, mut ids)| {
                ids.sort();
                ids.dedup();
                (table, ids)
            })
            .collect()
    }

    /// Rewrite every foreign-key leaf targeting `table` whose value is
    /// `old` to `new`. Returns whether anything changed.
    pub fn replace_foreign_key_value(&mut self, table: &str, old: &str, new: &str) -> bool {
        replace_references(&mut self.root, table, old, new)
    }
}

fn bind(schema: &SchemaNode, data: Option<&Value>) -> Result<ValueNode> {
    match schema {
        SchemaNode::Object(object) => {
            let mapping = match data {
                Some(Value::Object(map)) => Some(map),
                Some(other) => return Err(mismatch(schema, other)),
                None => None,
            };
            let mut properties = Vec::with_capacity(object.properties.len());
            for property in &object.properties {
                let child = mapping.and_then(|m| m.get(&property.name));
                properties.push((property.name.clone(), bind(&property.node, child)?));
            }
            Ok(ValueNode::Object(ObjectValue {
                path: object.path.clone(),
                present: mapping.is_some(),
                properties,
            }))
        }
        SchemaNode::Array(array) => {
            let entries = match data {
                Some(Value::Array(entries)) => Some(entries),
                Some(other) => return Err(mismatch(schema, other)),
                None => None,
            };
            let mut items = Vec::new();
            if let Some(entries) = entries {
                for entry in entries {
                    items.push(bind(&array.items, Some(entry))?);
                }
            }
            Ok(ValueNode::Array(ArrayValue {
                path: array.path.clone(),
                present: entries.is_some(),
                items,
            }))
        }
        SchemaNode::String(string) => {
            let value = match data {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => return Err(mismatch(schema, other)),
            };
            Ok(ValueNode::String(StringValue {
                path: string.path.clone(),
                value,
                default: string.default.clone(),
                foreign_key: string.foreign_key.clone(),
            }))
        }
        SchemaNode::Number(number) => {
            let value = match data {
                Some(Value::Number(n)) => Some(n.clone()),
                Some(Value::Null) | None => None,
                Some(other) => return Err(mismatch(schema, other)),
            };
            Ok(ValueNode::Number(NumberValue {
                path: number.path.clone(),
                value,
                default: number.default.clone(),
            }))
        }
        SchemaNode::Boolean(boolean) => {
            let value = match data {
                Some(Value::Bool(b)) => Some(*b),
                Some(Value::Null) | None => None,
                Some(other) => return Err(mismatch(schema, other)),
            };
            Ok(ValueNode::Boolean(BooleanValue {
                path: boolean.path.clone(),
                value,
                default: boolean.default,
            }))
        }
    }
}

fn mismatch(schema: &SchemaNode, value: &Value) -> ForkDbError {
    ForkDbError::Validation(format!(
        "Value at '{}' expected {}, got {}",
        schema.path().query(),
        schema.type_name(),
        json_type_name(value)
    ))
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render(node: &ValueNode) -> Option<Value> {
    match node {
        ValueNode::Object(object) => {
            if !object.present {
                return None;
            }
            let mut map = serde_json::Map::new();
            for (name, child) in &object.properties {
                if let Some(value) = render(child) {
                    map.insert(name.clone(), value);
                }
            }
            Some(Value::Object(map))
        }
        ValueNode::Array(array) => {
            if !array.present {
                return None;
            }
            Some(Value::Array(array.items.iter().filter_map(render).collect()))
        }
        ValueNode::String(string) => string.value.clone().map(Value::String),
        ValueNode::Number(number) => number.value.clone().map(Value::Number),
        ValueNode::Boolean(boolean) => boolean.value.map(Value::Bool),
    }
}

fn collect_references(node: &ValueNode, out: &mut BTreeMap<String, Vec<String>>) {
    match node {
        ValueNode::Object(object) => {
            for (_, child) in &object.properties {
                collect_references(child, out);
            }
        }
        ValueNode::Array(array) => {
            for item in &array.items {
                collect_references(item, out);
            }
        }
        ValueNode::String(string) => {
            if let (Some(table), Some(value)) = (&string.foreign_key, string.plain_value()) {
                out.entry(table.clone()).or_default().push(value.to_string());
            }
        }
        ValueNode::Number(_) | ValueNode::Boolean(_) => {}
    }
}

fn replace_references(node: &mut ValueNode, table: &str, old: &str, new: &str) -> bool {
    match node {
        ValueNode::Object(object) => {
            let mut changed = false;
            for (_, child) in &mut object.properties {
                changed |= replace_references(child, table, old, new);
            }
            changed
        }
        ValueNode::Array(array) => {
            let mut changed = false;
            for item in &mut array.items {
                changed |= replace_references(item, table, old, new);
            }
            changed
        }
        ValueNode::String(string) => {
            if string.foreign_key.as_deref() == Some(table) && string.value.as_deref() == Some(old)
            {
                string.value = Some(new.to_string());
                true
            } else {
                false
            }
        }
        ValueNode::Number(_) | ValueNode::Boolean(_) => false,
    }
}
