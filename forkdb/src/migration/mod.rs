pub mod patch;

pub use patch::{apply_patches, PatchOp};

use crate::error::{ForkDbError, Result};
use crate::schema::hash_schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded schema change for a table. The per-table sequence is
/// append-only and keyed by the table's `created_id`, so the log
/// survives renames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Migration {
    /// Full schema snapshot; always the first entry.
    Init { schema: Value, hash: String },
    /// JSON-Patch list plus the hash of the schema it produces.
    Update { patches: Vec<PatchOp>, hash: String },
    Rename { table_id: String, next_table_id: String },
    Remove,
}

impl Migration {
    pub fn kind(&self) -> &'static str {
        match self {
            Migration::Init { .. } => "init",
            Migration::Update { .. } => "update",
            Migration::Rename { .. } => "rename",
            Migration::Remove => "remove",
        }
    }

    /// Human-readable description of this migration.
    pub fn describe(&self) -> String {
        match self {
            Migration::Init { hash, .. } => format!("schema initialized ({})", short(hash)),
            Migration::Update { patches, hash } => {
                format!("schema updated, {} patch(es) ({})", patches.len(), short(hash))
            }
            Migration::Rename { table_id, next_table_id } => {
                format!("table renamed '{table_id}' -> '{next_table_id}'")
            }
            Migration::Remove => "table removed".to_string(),
        }
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}

/// Replay a table's full migration log, verifying the hash chain at
/// every step. Returns the final schema, or `None` once the table was
/// removed. A hash mismatch means the log is inconsistent with the
/// schemas it claims to produce — fatal, not retryable.
pub fn replay(log: &[Migration]) -> Result<Option<Value>> {
    schema_at(log, log.len())
}

/// Reconstruct the schema after the first `upto` entries of the log.
pub fn schema_at(log: &[Migration], upto: usize) -> Result<Option<Value>> {
    let mut schema: Option<Value> = None;
    for (index, migration) in log.iter().take(upto).enumerate() {
        match migration {
            Migration::Init { schema: snapshot, hash } => {
                if index != 0 {
                    return Err(ForkDbError::Migration(format!(
                        "init migration at position {index}, expected it only first"
                    )));
                }
                verify_hash(snapshot, hash, index)?;
                schema = Some(snapshot.clone());
            }
            Migration::Update { patches, hash } => {
                let current = schema.as_ref().ok_or_else(|| {
                    ForkDbError::Migration(format!(
                        "update migration at position {index} without a live schema"
                    ))
                })?;
                let next = apply_patches(current, patches)?;
                verify_hash(&next, hash, index)?;
                schema = Some(next);
            }
            Migration::Rename { .. } => {
                if schema.is_none() {
                    return Err(ForkDbError::Migration(format!(
                        "rename migration at position {index} without a live schema"
                    )));
                }
            }
            Migration::Remove => {
                if schema.is_none() {
                    return Err(ForkDbError::Migration(format!(
                        "remove migration at position {index} without a live schema"
                    )));
                }
                if index + 1 < upto.min(log.len()) {
                    return Err(ForkDbError::Migration(format!(
                        "migrations recorded after remove at position {index}"
                    )));
                }
                schema = None;
            }
        }
    }
    Ok(schema)
}

fn verify_hash(schema: &Value, expected: &str, index: usize) -> Result<()> {
    let actual = hash_schema(schema);
    if actual != expected {
        return Err(ForkDbError::Migration(format!(
            "hash chain mismatch at position {index}: log says {}, schema state is {}",
            short(expected),
            short(&actual)
        )));
    }
    Ok(())
}
