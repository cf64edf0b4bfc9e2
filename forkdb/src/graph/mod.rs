// Branch/revision graph: entities and the resolvers the mutation and
// diff engines use for identity resolution.

use crate::db::VersionDb;
use crate::error::{ForkDbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Organizational container; owns exactly one root branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_branch_id: String,
    pub created_at: DateTime<Utc>,
}

/// A named, independently-mutable line of revisions. A branch may have
/// been forked from a revision of another branch, forming a branch tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub parent_branch_id: Option<String>,
    pub parent_revision_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One snapshot in a branch's history. Exactly one revision per branch
/// is the mutable draft; at most one is the published head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,
    pub branch_id: String,
    /// Predecessor revision; crosses branches at fork points.
    pub parent_id: Option<String>,
    pub is_start: bool,
    pub is_head: bool,
    pub is_draft: bool,
    /// Cached on the draft: whether its table set differs from the head's.
    pub has_changes: bool,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One version of a table. `created_id` is the stable identity that
/// survives renames; `version_id` changes on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub version_id: String,
    pub created_id: String,
    /// Current display name.
    pub id: String,
    pub readonly: bool,
    pub schema: Value,
    pub schema_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One version of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub version_id: String,
    pub created_id: String,
    pub id: String,
    pub table_created_id: String,
    pub data: Value,
    pub readonly: bool,
    /// Hash of the schema this row's data was validated against.
    pub schema_hash: String,
    pub content_hash: String,
    /// First time this row appeared in a non-draft revision.
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Resolvers ────────────────────────────────────────────────────

/// The branch's draft revision. A branch without one is corrupted
/// state, not a user error.
pub fn resolve_draft(db: &VersionDb, branch_id: &str) -> Result<Revision> {
    db.draft_revision(branch_id)?.ok_or_else(|| {
        ForkDbError::Invariant(format!("branch '{branch_id}' has no draft revision"))
    })
}

/// The branch's head revision, if it has published anything yet.
pub fn resolve_head(db: &VersionDb, branch_id: &str) -> Result<Option<Revision>> {
    db.head_revision(branch_id)
}

/// The branch's start revision; always present.
pub fn resolve_start(db: &VersionDb, branch_id: &str) -> Result<Revision> {
    db.start_revision(branch_id)?.ok_or_else(|| {
        ForkDbError::Invariant(format!("branch '{branch_id}' has no start revision"))
    })
}

/// The (branch, revision) this branch was forked from, derived from its
/// start revision's parent. `None` for a project's root branch.
pub fn resolve_parent_branch_point(
    db: &VersionDb,
    branch_id: &str,
) -> Result<Option<(Branch, Revision)>> {
    let start = resolve_start(db, branch_id)?;
    let Some(parent_id) = start.parent_id else { return Ok(None) };
    let revision = db
        .get_revision(&parent_id)?
        .ok_or_else(|| ForkDbError::Invariant(format!("dangling parent revision '{parent_id}'")))?;
    let branch = db
        .get_branch(&revision.branch_id)?
        .ok_or_else(|| {
            ForkDbError::Invariant(format!("dangling branch '{}'", revision.branch_id))
        })?;
    Ok(Some((branch, revision)))
}

/// Start revisions of other branches forked from this revision.
pub fn resolve_child_branches(db: &VersionDb, revision_id: &str) -> Result<Vec<Revision>> {
    db.child_start_revisions(revision_id)
}

/// Resolve a table inside a revision by current id or created id.
pub fn find_table(
    db: &VersionDb,
    revision_id: &str,
    table_id: &str,
) -> Result<Option<TableRecord>> {
    db.find_table_in_revision(revision_id, table_id)
}

pub fn find_table_or_throw(
    db: &VersionDb,
    revision_id: &str,
    table_id: &str,
) -> Result<TableRecord> {
    find_table(db, revision_id, table_id)?
        .ok_or_else(|| ForkDbError::not_found("Table", format!("{table_id} in {revision_id}")))
}

/// Resolve a row inside a table version by created id or current id.
pub fn find_row(
    db: &VersionDb,
    table_version_id: &str,
    row_id: &str,
) -> Result<Option<RowRecord>> {
    db.find_row_in_table(table_version_id, row_id)
}

pub fn find_row_or_throw(
    db: &VersionDb,
    table_version_id: &str,
    row_id: &str,
) -> Result<RowRecord> {
    find_row(db, table_version_id, row_id)?
        .ok_or_else(|| ForkDbError::not_found("Row", format!("{row_id} in {table_version_id}")))
}
