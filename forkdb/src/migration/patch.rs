use crate::error::{ForkDbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-Patch subset the platform emits for schema updates.
/// `replace` is the guaranteed operation; `add`/`remove` cover property
/// introduction and retirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Replace { path: String, value: Value },
    Add { path: String, value: Value },
    Remove { path: String },
}

/// Apply patches in order to a document, returning the new document.
/// Paths are JSON Pointers into the schema document.
pub fn apply_patches(document: &Value, patches: &[PatchOp]) -> Result<Value> {
    let mut result = document.clone();
    for patch in patches {
        apply_one(&mut result, patch)?;
    }
    Ok(result)
}

fn apply_one(document: &mut Value, patch: &PatchOp) -> Result<()> {
    match patch {
        PatchOp::Replace { path, value } => {
            let target = document.pointer_mut(path).ok_or_else(|| {
                ForkDbError::Migration(format!("replace: path '{path}' does not exist"))
            })?;
            *target = value.clone();
            Ok(())
        }
        PatchOp::Add { path, value } => {
            let (parent_path, token) = split_pointer(path)?;
            let parent = document.pointer_mut(parent_path).ok_or_else(|| {
                ForkDbError::Migration(format!("add: parent of '{path}' does not exist"))
            })?;
            match parent {
                Value::Object(map) => {
                    map.insert(token, value.clone());
                    Ok(())
                }
                Value::Array(entries) => {
                    if token == "-" {
                        entries.push(value.clone());
                        return Ok(());
                    }
                    let index: usize = token.parse().map_err(|_| {
                        ForkDbError::Migration(format!("add: bad array index in '{path}'"))
                    })?;
                    if index > entries.len() {
                        return Err(ForkDbError::Migration(format!(
                            "add: index out of bounds in '{path}'"
                        )));
                    }
                    entries.insert(index, value.clone());
                    Ok(())
                }
                _ => Err(ForkDbError::Migration(format!(
                    "add: parent of '{path}' is not a container"
                ))),
            }
        }
        PatchOp::Remove { path } => {
            let (parent_path, token) = split_pointer(path)?;
            let parent = document.pointer_mut(parent_path).ok_or_else(|| {
                ForkDbError::Migration(format!("remove: parent of '{path}' does not exist"))
            })?;
            match parent {
                Value::Object(map) => {
                    map.remove(&token).ok_or_else(|| {
                        ForkDbError::Migration(format!("remove: path '{path}' does not exist"))
                    })?;
                    Ok(())
                }
                Value::Array(entries) => {
                    let index: usize = token.parse().map_err(|_| {
                        ForkDbError::Migration(format!("remove: bad array index in '{path}'"))
                    })?;
                    if index >= entries.len() {
                        return Err(ForkDbError::Migration(format!(
                            "remove: index out of bounds in '{path}'"
                        )));
                    }
                    entries.remove(index);
                    Ok(())
                }
                _ => Err(ForkDbError::Migration(format!(
                    "remove: parent of '{path}' is not a container"
                ))),
            }
        }
    }
}

/// Split a pointer into its parent pointer and final, unescaped token.
fn split_pointer(path: &str) -> Result<(&str, String)> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(ForkDbError::Migration(format!("bad JSON pointer '{path}'")));
    }
    let cut = path.rfind('/').unwrap_or(0);
    let token = path[cut + 1..].replace("~1", "/").replace("~0", "~");
    Ok((&path[..cut], token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_swaps_existing_value() {
        let doc = json!({ "properties": { "title": { "type": "string" } } });
        let patched = apply_patches(
            &doc,
            &[PatchOp::Replace {
                path: "/properties/title/type".into(),
                value: json!("number"),
            }],
        )
        .unwrap();
        assert_eq!(patched["properties"]["title"]["type"], "number");
    }

    #[test]
    fn replace_missing_path_fails() {
        let doc = json!({});
        let err = apply_patches(
            &doc,
            &[PatchOp::Replace { path: "/nope".into(), value: json!(1) }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nope"));
    }

    #[test]
    fn add_inserts_object_key_and_array_entry() {
        let doc = json!({ "properties": {}, "required": ["a"] });
        let patched = apply_patches(
            &doc,
            &[
                PatchOp::Add {
                    path: "/properties/views".into(),
                    value: json!({ "type": "number" }),
                },
                PatchOp::Add { path: "/required/-".into(), value: json!("views") },
                PatchOp::Add { path: "/required/0".into(), value: json!("z") },
            ],
        )
        .unwrap();
        assert_eq!(patched["properties"]["views"]["type"], "number");
        assert_eq!(patched["required"], json!(["z", "a", "views"]));
    }

    #[test]
    fn remove_deletes_key_and_entry() {
        let doc = json!({ "properties": { "a": {}, "b": {} }, "required": ["a", "b"] });
        let patched = apply_patches(
            &doc,
            &[
                PatchOp::Remove { path: "/properties/b".into() },
                PatchOp::Remove { path: "/required/1".into() },
            ],
        )
        .unwrap();
        assert_eq!(patched, json!({ "properties": { "a": {} }, "required": ["a"] }));
    }

    #[test]
    fn patches_apply_in_order() {
        let doc = json!({ "a": 1 });
        let patched = apply_patches(
            &doc,
            &[
                PatchOp::Replace { path: "/a".into(), value: json!(2) },
                PatchOp::Replace { path: "/a".into(), value: json!(3) },
            ],
        )
        .unwrap();
        assert_eq!(patched["a"], 3);
    }

    #[test]
    fn escaped_tokens_unescape() {
        let doc = json!({ "a/b": 1 });
        let patched =
            apply_patches(&doc, &[PatchOp::Remove { path: "/a~1b".into() }]).unwrap();
        assert_eq!(patched, json!({}));
    }

    #[test]
    fn serde_shape_matches_json_patch() {
        let op: PatchOp =
            serde_json::from_value(json!({ "op": "replace", "path": "/a", "value": 1 })).unwrap();
        assert_eq!(op, PatchOp::Replace { path: "/a".into(), value: json!(1) });
    }
}
