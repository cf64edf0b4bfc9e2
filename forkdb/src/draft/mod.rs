// The draft mutation engine. Every operation runs against a branch's
// draft revision inside one unit-of-work transaction and versions
// tables/rows copy-on-write: the first write in a draft clones the
// version and relinks it, later writes reuse the clone, commit freezes
// it.

use crate::db::VersionDb;
use crate::error::{ForkDbError, Result};
use crate::graph::{
    self, Branch, Project, Revision, RowRecord, TableRecord,
};
use crate::ident;
use crate::migration::{apply_patches, Migration, PatchOp};
use crate::plugin::{DraftRow, PluginSet, PluginWarning};
use crate::schema::{hash_content, invalid_field_names, SchemaRefs, SchemaTree, ValueTree};
use crate::util::new_id;
use crate::validation::{validate_value, RowIssues};
use chrono::Utc;
use serde_json::Value;

/// A new row for `create_rows`. Rows without an id get one from the
/// row-id plugin.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub id: Option<String>,
    pub data: Value,
}

/// Full-data replacement for one row.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub row_id: String,
    pub data: Value,
}

/// JSON-Patch update for one row's data.
#[derive(Debug, Clone)]
pub struct RowPatch {
    pub row_id: String,
    pub patches: Vec<PatchOp>,
}

#[derive(Debug, Clone)]
pub struct RowRename {
    pub row_id: String,
    pub next_id: String,
}

/// Result of a table-level write: the (possibly new) table version and
/// the version id it had before the operation. Callers compare the two
/// to learn whether the version actually changed.
#[derive(Debug, Clone)]
pub struct TableWrite {
    pub table: TableRecord,
    pub previous_version_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RowWrite {
    pub row: RowRecord,
    pub previous_version_id: Option<String>,
    pub warnings: Vec<PluginWarning>,
}

/// Result of a row batch: one table write (the table is cloned at most
/// once per batch) plus the per-row outcomes.
#[derive(Debug, Clone)]
pub struct RowBatchWrite {
    pub table: TableWrite,
    pub rows: Vec<RowWrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub previous_head_id: Option<String>,
    pub previous_draft_id: String,
    pub new_draft_id: String,
}

/// The engine is only constructed by `Store::unit_of_work`, so every
/// operation is guaranteed to run inside the ambient transaction.
pub struct DraftEngine<'a> {
    db: VersionDb<'a>,
    plugins: &'a PluginSet,
    refs: &'a SchemaRefs,
    published: Vec<String>,
}

impl<'a> DraftEngine<'a> {
    pub(crate) fn new(db: VersionDb<'a>, plugins: &'a PluginSet, refs: &'a SchemaRefs) -> Self {
        DraftEngine { db, plugins, refs, published: Vec::new() }
    }

    /// Revision ids committed during this unit of work, for the
    /// notification hook. Consumes the engine, releasing the
    /// transaction borrow.
    pub(crate) fn into_published(self) -> Vec<String> {
        self.published
    }

    pub fn db(&self) -> &VersionDb<'a> {
        &self.db
    }

    // ── Projects & branches ──────────────────────────────────────────

    /// Create a project with its root branch, an empty immutable start
    /// revision and a fresh draft.
    pub fn create_project(&mut self, name: &str) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(ForkDbError::Validation("Project name must not be empty".into()));
        }
        if self.db.get_project_by_name(name)?.is_some() {
            return Err(ForkDbError::Validation(format!("Project '{name}' already exists")));
        }

        let now = Utc::now();
        let project = Project {
            id: new_id(),
            name: name.to_string(),
            root_branch_id: new_id(),
            created_at: now,
        };
        self.db.insert_project(&project)?;
        self.db.insert_branch(&Branch {
            id: project.root_branch_id.clone(),
            project_id: project.id.clone(),
            name: "main".to_string(),
            parent_branch_id: None,
            parent_revision_id: None,
            created_at: now,
        })?;

        let start = Revision {
            id: new_id(),
            branch_id: project.root_branch_id.clone(),
            parent_id: None,
            is_start: true,
            is_head: false,
            is_draft: false,
            has_changes: false,
            comment: None,
            created_at: now,
        };
        self.db.insert_revision(&start)?;
        self.db.insert_revision(&Revision {
            id: new_id(),
            branch_id: project.root_branch_id.clone(),
            parent_id: Some(start.id),
            is_start: false,
            is_head: false,
            is_draft: true,
            has_changes: false,
            comment: None,
            created_at: now,
        })?;

        log::debug!("created project '{name}' ({})", project.id);
        Ok(project)
    }

    /// Fork a branch from a committed revision. The new branch's start
    /// revision shares the source revision's table versions and doubles
    /// as its head; a fresh draft is forked on top.
    pub fn create_branch(
        &mut self,
        project_id: &str,
        name: &str,
        from_revision_id: &str,
    ) -> Result<Branch> {
        let project = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| ForkDbError::not_found("Project", project_id))?;
        let source = self
            .db
            .get_revision(from_revision_id)?
            .ok_or_else(|| ForkDbError::not_found("Revision", from_revision_id))?;
        if source.is_draft {
            return Err(ForkDbError::Validation(
                "Cannot fork a branch from a draft revision".into(),
            ));
        }
        if self.db.list_branches(&project.id)?.iter().any(|b| b.name == name) {
            return Err(ForkDbError::Validation(format!(
                "Branch '{name}' already exists in project '{}'",
                project.name
            )));
        }

        let now = Utc::now();
        let branch = Branch {
            id: new_id(),
            project_id: project.id.clone(),
            name: name.to_string(),
            parent_branch_id: Some(source.branch_id.clone()),
            parent_revision_id: Some(source.id.clone()),
            created_at: now,
        };
        self.db.insert_branch(&branch)?;

        let start = Revision {
            id: new_id(),
            branch_id: branch.id.clone(),
            parent_id: Some(source.id.clone()),
            is_start: true,
            is_head: true,
            is_draft: false,
            has_changes: false,
            comment: None,
            created_at: now,
        };
        self.db.insert_revision(&start)?;
        self.db.copy_revision_tables(&source.id, &start.id)?;

        let draft = Revision {
            id: new_id(),
            branch_id: branch.id.clone(),
            parent_id: Some(start.id.clone()),
            is_start: false,
            is_head: false,
            is_draft: true,
            has_changes: false,
            comment: None,
            created_at: now,
        };
        self.db.insert_revision(&draft)?;
        self.db.copy_revision_tables(&start.id, &draft.id)?;

        log::debug!("forked branch '{name}' from revision {from_revision_id}");
        Ok(branch)
    }

    // ── Tables ───────────────────────────────────────────────────────

    pub fn create_table(
        &mut self,
        revision_id: &str,
        table_id: &str,
        schema: &Value,
    ) -> Result<TableWrite> {
        ident::validate_table_id(table_id)?;
        self.create_table_inner(revision_id, table_id, schema)
    }

    /// Platform-managed tables carry the reserved prefix and bypass the
    /// user-facing id rules.
    pub fn create_system_table(
        &mut self,
        revision_id: &str,
        table_id: &str,
        schema: &Value,
    ) -> Result<TableWrite> {
        ident::validate_table_id_format(table_id)?;
        if !ident::is_system_table(table_id) {
            return Err(ForkDbError::Validation(format!(
                "System table id '{table_id}' must start with '{}'",
                ident::SYSTEM_TABLE_PREFIX
            )));
        }
        self.create_table_inner(revision_id, table_id, schema)
    }

    fn create_table_inner(
        &mut self,
        revision_id: &str,
        table_id: &str,
        schema: &Value,
    ) -> Result<TableWrite> {
        let revision = self.require_draft(revision_id)?;
        if self.db.find_table_in_revision(&revision.id, table_id)?.is_some() {
            return Err(ForkDbError::Validation(format!(
                "Table '{table_id}' already exists in this revision"
            )));
        }

        let offenders = invalid_field_names(schema);
        if !offenders.is_empty() {
            let listed: Vec<String> = offenders
                .iter()
                .map(|f| format!("'{}' at '{}'", f.name, f.pointer))
                .collect();
            return Err(ForkDbError::Validation(format!(
                "Invalid field name(s): {}",
                listed.join(", ")
            )));
        }
        let tree = SchemaTree::build(schema, self.refs)?;

        let table = TableRecord {
            version_id: new_id(),
            created_id: new_id(),
            id: table_id.to_string(),
            readonly: false,
            schema: schema.clone(),
            schema_hash: tree.hash.clone(),
            created_at: Utc::now(),
        };
        self.db.insert_table_version(&table)?;
        self.db.link_revision_table(&revision.id, &table.version_id)?;
        self.db.append_migration(
            &table.created_id,
            &Migration::Init { schema: schema.clone(), hash: tree.hash },
        )?;
        self.recompute_has_changes(&revision.id)?;

        log::debug!("created table '{table_id}' ({})", table.version_id);
        Ok(TableWrite { table, previous_version_id: None })
    }

    pub fn rename_table(
        &mut self,
        revision_id: &str,
        table_id: &str,
        next_table_id: &str,
    ) -> Result<TableWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;

        ident::validate_table_id(next_table_id)?;
        if table.id == next_table_id {
            return Err(ForkDbError::Invariant(format!(
                "Rename of table '{table_id}' to its current id"
            )));
        }
        if self.db.find_table_in_revision(&revision.id, next_table_id)?.is_some() {
            return Err(ForkDbError::Validation(format!(
                "Table id '{next_table_id}' is already taken in this revision"
            )));
        }

        let (mut draft_table, previous) = self.draft_table_version(&revision, table)?;
        self.db.rename_table_version(&draft_table.version_id, next_table_id)?;
        let old_id = std::mem::replace(&mut draft_table.id, next_table_id.to_string());
        self.db.append_migration(
            &draft_table.created_id,
            &Migration::Rename { table_id: old_id, next_table_id: next_table_id.to_string() },
        )?;
        self.recompute_has_changes(&revision.id)?;

        Ok(TableWrite { table: draft_table, previous_version_id: Some(previous) })
    }

    pub fn remove_table(
        &mut self,
        revision_id: &str,
        table_id: &str,
        force_system: bool,
    ) -> Result<TableWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;
        if ident::is_system_table(&table.id) && !force_system {
            return Err(ForkDbError::Validation(format!(
                "Table '{}' is a reserved system table",
                table.id
            )));
        }

        self.db.unlink_revision_table(&revision.id, &table.version_id)?;
        self.db.append_migration(&table.created_id, &Migration::Remove)?;
        self.recompute_has_changes(&revision.id)?;

        let previous = table.version_id.clone();
        Ok(TableWrite { table, previous_version_id: Some(previous) })
    }

    /// Apply a JSON-Patch list to a table's schema. Existing draft rows
    /// are revalidated against the result and handed to the migration
    /// plugins; an `update` migration records the patches and the new
    /// hash.
    pub fn update_table_schema(
        &mut self,
        revision_id: &str,
        table_id: &str,
        patches: Vec<PatchOp>,
    ) -> Result<TableWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;

        let next_schema = apply_patches(&table.schema, &patches)?;
        let offenders = invalid_field_names(&next_schema);
        if !offenders.is_empty() {
            let listed: Vec<String> =
                offenders.iter().map(|f| format!("'{}'", f.name)).collect();
            return Err(ForkDbError::Validation(format!(
                "Schema patch introduces invalid field name(s): {}",
                listed.join(", ")
            )));
        }
        let tree = SchemaTree::build(&next_schema, self.refs)?;

        // every existing row must fit the new schema
        let rows = self.db.rows_in_table(&table.version_id)?;
        let mut issues = Vec::new();
        for row in &rows {
            let result = validate_value(&tree, &row.data);
            if !result.is_ok() {
                issues.push(RowIssues { row_id: row.id.clone(), errors: result.errors });
            }
        }
        if !issues.is_empty() {
            return Err(batch_validation_error(issues));
        }

        let (mut draft_table, previous) = self.draft_table_version(&revision, table)?;
        self.db.update_table_version_schema(&draft_table.version_id, &next_schema, &tree.hash)?;
        draft_table.schema = next_schema.clone();
        draft_table.schema_hash = tree.hash.clone();

        // migration plugins may rewrite rows for the new schema
        let mut draft_rows = Vec::new();
        for row in &rows {
            draft_rows.push(DraftRow {
                id: Some(row.id.clone()),
                tree: ValueTree::build(&tree, &row.id, &row.data)?,
            });
        }
        self.plugins.run_migrate(&tree, &mut draft_rows);
        for (row, draft_row) in rows.iter().zip(&draft_rows) {
            let data = draft_row.tree.to_value();
            if data != row.data {
                let (draft_row_record, _) = self.draft_row_version(&draft_table, &row.created_id)?;
                self.db.update_row_version(
                    &draft_row_record.version_id,
                    &data,
                    &hash_content(&data),
                    &tree.hash,
                )?;
            }
        }

        self.db.append_migration(
            &draft_table.created_id,
            &Migration::Update { patches, hash: tree.hash },
        )?;
        self.recompute_has_changes(&revision.id)?;

        Ok(TableWrite { table: draft_table, previous_version_id: Some(previous) })
    }

    // ── Rows ─────────────────────────────────────────────────────────

    /// Create a batch of rows. Every invalid row is reported, not just
    /// the first; the owning table is cloned once for the whole batch.
    pub fn create_rows(
        &mut self,
        revision_id: &str,
        table_id: &str,
        rows: Vec<NewRow>,
        skip_reference_check: bool,
    ) -> Result<RowBatchWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;
        let tree = SchemaTree::build(&table.schema, self.refs)?;

        let mut issues: Vec<RowIssues> = Vec::new();
        let mut prepared: Vec<(String, ValueTree, Vec<PluginWarning>)> = Vec::new();
        let mut batch_ids: Vec<String> = Vec::new();

        for (index, new_row) in rows.iter().enumerate() {
            let label = new_row.id.clone().unwrap_or_else(|| format!("#{index}"));
            let mut errors = Vec::new();

            let result = validate_value(&tree, &new_row.data);
            errors.extend(result.errors);

            if !errors.is_empty() {
                issues.push(RowIssues { row_id: label, errors });
                continue;
            }

            let mut draft_row = DraftRow {
                id: new_row.id.clone(),
                tree: ValueTree::build(&tree, label.as_str(), &new_row.data)?,
            };
            let warnings = self.plugins.run_create(&tree, &mut draft_row);

            let Some(row_id) = draft_row.id.clone().filter(|id| !id.is_empty()) else {
                issues.push(RowIssues {
                    row_id: label,
                    errors: vec!["Row has no id and no plugin assigned one".into()],
                });
                continue;
            };

            if let Err(e) = ident::validate_row_id(&row_id) {
                errors.push(e.to_string());
            }
            if batch_ids.contains(&row_id) {
                errors.push(format!("Duplicate row id '{row_id}' in batch"));
            }
            if self.db.find_row_in_table(&table.version_id, &row_id)?.is_some() {
                errors.push(format!("Row '{row_id}' already exists in table '{}'", table.id));
            }
            if !skip_reference_check {
                errors.extend(self.missing_references(
                    &revision.id,
                    &table,
                    &draft_row.tree,
                    &batch_ids,
                )?);
            }

            if errors.is_empty() {
                batch_ids.push(row_id.clone());
                draft_row.tree.row_id = row_id.clone();
                prepared.push((row_id, draft_row.tree, warnings));
            } else {
                issues.push(RowIssues { row_id, errors });
            }
        }

        if !issues.is_empty() {
            return Err(batch_validation_error(issues));
        }

        let (draft_table, previous) = self.draft_table_version(&revision, table)?;
        let mut written = Vec::new();
        for (row_id, value_tree, warnings) in prepared {
            let data = value_tree.to_value();
            let row = RowRecord {
                version_id: new_id(),
                created_id: row_id.clone(),
                id: row_id,
                table_created_id: draft_table.created_id.clone(),
                content_hash: hash_content(&data),
                data,
                readonly: false,
                schema_hash: draft_table.schema_hash.clone(),
                published_at: None,
                created_at: Utc::now(),
            };
            self.db.insert_row_version(&row)?;
            self.db.link_table_row(&draft_table.version_id, &row.version_id)?;
            written.push(RowWrite { row, previous_version_id: None, warnings });
        }
        self.recompute_has_changes(&revision.id)?;

        Ok(RowBatchWrite {
            table: TableWrite { table: draft_table, previous_version_id: Some(previous) },
            rows: written,
        })
    }

    /// Replace row data wholesale. The table is cloned once per batch,
    /// and only if some row actually changed.
    pub fn update_rows(
        &mut self,
        revision_id: &str,
        table_id: &str,
        updates: Vec<RowUpdate>,
    ) -> Result<RowBatchWrite> {
        self.write_rows(revision_id, table_id, updates)
    }

    /// JSON-Patch row data (`replace` is the guaranteed operation).
    pub fn patch_rows(
        &mut self,
        revision_id: &str,
        table_id: &str,
        patches: Vec<RowPatch>,
    ) -> Result<RowBatchWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;

        let mut updates = Vec::new();
        let mut issues = Vec::new();
        for patch in patches {
            let row = graph::find_row_or_throw(&self.db, &table.version_id, &patch.row_id)?;
            match apply_patches(&row.data, &patch.patches) {
                Ok(data) => updates.push(RowUpdate { row_id: patch.row_id, data }),
                Err(e) => {
                    issues.push(RowIssues { row_id: patch.row_id, errors: vec![e.to_string()] })
                }
            }
        }
        if !issues.is_empty() {
            return Err(batch_validation_error(issues));
        }
        self.write_rows(revision_id, table_id, updates)
    }

    fn write_rows(
        &mut self,
        revision_id: &str,
        table_id: &str,
        updates: Vec<RowUpdate>,
    ) -> Result<RowBatchWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;
        let tree = SchemaTree::build(&table.schema, self.refs)?;

        // identity resolution is fatal; schema validation is collected
        let mut issues = Vec::new();
        let mut prepared: Vec<(RowRecord, ValueTree, Vec<PluginWarning>)> = Vec::new();
        for update in &updates {
            let row = graph::find_row_or_throw(&self.db, &table.version_id, &update.row_id)?;
            let result = validate_value(&tree, &update.data);
            if !result.is_ok() {
                issues.push(RowIssues { row_id: update.row_id.clone(), errors: result.errors });
                continue;
            }
            let mut draft_row = DraftRow {
                id: Some(row.id.clone()),
                tree: ValueTree::build(&tree, &row.id, &update.data)?,
            };
            let warnings = self.plugins.run_update(&tree, &mut draft_row);
            prepared.push((row, draft_row.tree, warnings));
        }
        if !issues.is_empty() {
            return Err(batch_validation_error(issues));
        }

        let any_changed = prepared.iter().any(|(row, tree, _)| tree.to_value() != row.data);
        if !any_changed {
            let previous = table.version_id.clone();
            let rows = prepared
                .into_iter()
                .map(|(row, _, warnings)| RowWrite {
                    previous_version_id: Some(row.version_id.clone()),
                    row,
                    warnings,
                })
                .collect();
            return Ok(RowBatchWrite {
                table: TableWrite { table, previous_version_id: Some(previous) },
                rows,
            });
        }

        let (draft_table, previous) = self.draft_table_version(&revision, table)?;
        let mut written = Vec::new();
        for (row, value_tree, warnings) in prepared {
            let data = value_tree.to_value();
            if data == row.data {
                written.push(RowWrite {
                    previous_version_id: Some(row.version_id.clone()),
                    row,
                    warnings,
                });
                continue;
            }
            let (mut draft_row, row_previous) =
                self.draft_row_version(&draft_table, &row.created_id)?;
            let content_hash = hash_content(&data);
            self.db.update_row_version(
                &draft_row.version_id,
                &data,
                &content_hash,
                &draft_table.schema_hash,
            )?;
            draft_row.data = data;
            draft_row.content_hash = content_hash;
            draft_row.schema_hash = draft_table.schema_hash.clone();
            written.push(RowWrite {
                row: draft_row,
                previous_version_id: Some(row_previous),
                warnings,
            });
        }
        self.recompute_has_changes(&revision.id)?;

        Ok(RowBatchWrite {
            table: TableWrite { table: draft_table, previous_version_id: Some(previous) },
            rows: written,
        })
    }

    /// Detach rows from the draft table version. Versions referenced by
    /// other revisions stay alive for those revisions.
    pub fn remove_rows(
        &mut self,
        revision_id: &str,
        table_id: &str,
        row_ids: &[String],
    ) -> Result<TableWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;

        let mut resolved = Vec::new();
        for row_id in row_ids {
            resolved.push(graph::find_row_or_throw(&self.db, &table.version_id, row_id)?);
        }

        let (draft_table, previous) = self.draft_table_version(&revision, table)?;
        for row in resolved {
            self.db.unlink_table_row(&draft_table.version_id, &row.version_id)?;
        }
        self.recompute_has_changes(&revision.id)?;

        Ok(TableWrite { table: draft_table, previous_version_id: Some(previous) })
    }

    /// Rename rows, preserving `created_id`. Foreign-key leaves in other
    /// draft tables that reference the old id are rewritten so raw data
    /// keeps reading naturally; resolution itself goes through
    /// `created_id` and would survive without the rewrite.
    pub fn rename_rows(
        &mut self,
        revision_id: &str,
        table_id: &str,
        renames: Vec<RowRename>,
    ) -> Result<RowBatchWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;

        let mut resolved = Vec::new();
        for rename in &renames {
            let row = graph::find_row_or_throw(&self.db, &table.version_id, &rename.row_id)?;
            ident::validate_row_id(&rename.next_id)?;
            if row.id == rename.next_id {
                return Err(ForkDbError::Invariant(format!(
                    "Rename of row '{}' to its current id",
                    rename.row_id
                )));
            }
            if self.db.find_row_in_table(&table.version_id, &rename.next_id)?.is_some() {
                return Err(ForkDbError::Validation(format!(
                    "Row id '{}' is already taken in table '{}'",
                    rename.next_id, table.id
                )));
            }
            resolved.push((row, rename.clone()));
        }

        let (draft_table, previous) = self.draft_table_version(&revision, table)?;
        let mut written = Vec::new();
        for (row, rename) in resolved {
            let (mut draft_row, row_previous) =
                self.draft_row_version(&draft_table, &row.created_id)?;
            self.db.rename_row_version(&draft_row.version_id, &rename.next_id)?;
            draft_row.id = rename.next_id.clone();
            self.rewrite_references(&revision, &draft_table, &row.id, &rename.next_id)?;
            written.push(RowWrite {
                row: draft_row,
                previous_version_id: Some(row_previous),
                warnings: Vec::new(),
            });
        }
        self.recompute_has_changes(&revision.id)?;

        Ok(RowBatchWrite {
            table: TableWrite { table: draft_table, previous_version_id: Some(previous) },
            rows: written,
        })
    }

    /// Re-run the compute plugins over a table's draft rows, persisting
    /// whatever they change.
    pub fn compute_rows(&mut self, revision_id: &str, table_id: &str) -> Result<RowBatchWrite> {
        let revision = self.require_draft(revision_id)?;
        let table = graph::find_table_or_throw(&self.db, &revision.id, table_id)?;
        let tree = SchemaTree::build(&table.schema, self.refs)?;

        let rows = self.db.rows_in_table(&table.version_id)?;
        let mut draft_rows = Vec::new();
        for row in &rows {
            draft_rows.push(DraftRow {
                id: Some(row.id.clone()),
                tree: ValueTree::build(&tree, &row.id, &row.data)?,
            });
        }
        let warnings = self.plugins.run_compute(&tree, &mut draft_rows);

        let updates: Vec<RowUpdate> = rows
            .iter()
            .zip(&draft_rows)
            .map(|(row, draft_row)| RowUpdate {
                row_id: row.created_id.clone(),
                data: draft_row.tree.to_value(),
            })
            .collect();
        let mut batch = self.write_rows(revision_id, table_id, updates)?;
        if let Some(first) = batch.rows.first_mut() {
            first.warnings.extend(warnings);
        }
        Ok(batch)
    }

    // ── Draft lifecycle ──────────────────────────────────────────────

    /// Re-derive the draft's cached `has_changes` flag by comparing its
    /// table version set with the head's.
    pub fn recompute_has_changes(&mut self, revision_id: &str) -> Result<bool> {
        let revision = self.require_draft(revision_id)?;
        let head = self.db.head_revision(&revision.branch_id)?;
        let differs = self.db.revision_sets_differ(&revision.id, head.as_ref().map(|h| h.id.as_str()))?;
        self.db.set_has_changes(&revision.id, differs)?;
        Ok(differs)
    }

    /// Freeze the draft, promote it to head, fork a fresh draft child.
    /// Rejected when the draft has no changes.
    pub fn commit(&mut self, branch_id: &str, comment: Option<&str>) -> Result<CommitOutcome> {
        let draft = graph::resolve_draft(&self.db, branch_id)?;
        if !self.recompute_has_changes(&draft.id)? {
            return Err(ForkDbError::Invariant(format!(
                "Draft {} has no changes to commit",
                draft.id
            )));
        }
        let previous_head = graph::resolve_head(&self.db, branch_id)?;

        let now = Utc::now();
        self.db.freeze_revision(&draft.id, &now)?;
        if let Some(head) = &previous_head {
            self.db.clear_head(&head.id)?;
        }
        self.db.mark_committed(&draft.id, comment)?;

        let new_draft = Revision {
            id: new_id(),
            branch_id: branch_id.to_string(),
            parent_id: Some(draft.id.clone()),
            is_start: false,
            is_head: false,
            is_draft: true,
            has_changes: false,
            comment: None,
            created_at: now,
        };
        self.db.insert_revision(&new_draft)?;
        self.db.copy_revision_tables(&draft.id, &new_draft.id)?;

        self.published.push(draft.id.clone());
        log::debug!("committed draft {} on branch {branch_id}", draft.id);

        Ok(CommitOutcome {
            previous_head_id: previous_head.map(|h| h.id),
            previous_draft_id: draft.id,
            new_draft_id: new_draft.id,
        })
    }

    /// Discard draft-only modifications by resetting the draft's table
    /// set to the head's. No-op for an unpublished branch; idempotent.
    pub fn revert(&mut self, branch_id: &str) -> Result<()> {
        let draft = graph::resolve_draft(&self.db, branch_id)?;
        let Some(head) = graph::resolve_head(&self.db, branch_id)? else {
            return Ok(());
        };
        self.db.clear_revision_tables(&draft.id)?;
        self.db.copy_revision_tables(&head.id, &draft.id)?;
        self.db.set_has_changes(&draft.id, false)?;
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    fn require_draft(&self, revision_id: &str) -> Result<Revision> {
        let revision = self
            .db
            .get_revision(revision_id)?
            .ok_or_else(|| ForkDbError::not_found("Revision", revision_id))?;
        if !revision.is_draft {
            return Err(ForkDbError::Invariant(format!(
                "Revision {revision_id} is not a draft"
            )));
        }
        Ok(revision)
    }

    /// Copy-on-write entry point for tables. A version still frozen
    /// from an earlier revision is cloned and relinked; a version this
    /// draft already owns gets a fresh version id in place, so every
    /// mutation batch yields a distinct version id either way.
    fn draft_table_version(
        &mut self,
        revision: &Revision,
        table: TableRecord,
    ) -> Result<(TableRecord, String)> {
        let previous = table.version_id.clone();
        if !table.readonly {
            let mut bumped = table;
            bumped.version_id = new_id();
            self.db.bump_table_version(&previous, &bumped.version_id)?;
            return Ok((bumped, previous));
        }
        let clone = TableRecord {
            version_id: new_id(),
            readonly: false,
            created_at: Utc::now(),
            ..table
        };
        self.db.insert_table_version(&clone)?;
        self.db.copy_table_rows(&previous, &clone.version_id)?;
        self.db.replace_revision_table(&revision.id, &previous, &clone.version_id)?;
        Ok((clone, previous))
    }

    /// Copy-on-write entry point for rows within a draft-owned table
    /// version; same bump-or-clone rule as tables.
    fn draft_row_version(
        &mut self,
        draft_table: &TableRecord,
        row_ref: &str,
    ) -> Result<(RowRecord, String)> {
        let row = graph::find_row_or_throw(&self.db, &draft_table.version_id, row_ref)?;
        let previous = row.version_id.clone();
        if !row.readonly {
            let mut bumped = row;
            bumped.version_id = new_id();
            self.db.bump_row_version(&previous, &bumped.version_id)?;
            return Ok((bumped, previous));
        }
        let clone = RowRecord {
            version_id: new_id(),
            readonly: false,
            created_at: Utc::now(),
            ..row
        };
        self.db.insert_row_version(&clone)?;
        self.db.replace_table_row(&draft_table.version_id, &previous, &clone.version_id)?;
        Ok((clone, previous))
    }

    /// Foreign-key targets that do not resolve inside the revision.
    /// Targets inside the same table may be satisfied by earlier rows
    /// of the current batch.
    fn missing_references(
        &self,
        revision_id: &str,
        table: &TableRecord,
        tree: &ValueTree,
        batch_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        for (target, row_ids) in tree.foreign_keys() {
            let Some(target_table) = self.db.find_table_in_revision(revision_id, &target)? else {
                errors.push(format!("Reference target table '{target}' does not exist"));
                continue;
            };
            for row_id in row_ids {
                if target_table.created_id == table.created_id && batch_ids.contains(&row_id) {
                    continue;
                }
                if self.db.find_row_in_table(&target_table.version_id, &row_id)?.is_none() {
                    errors.push(format!(
                        "Reference to missing row '{row_id}' in table '{target}'"
                    ));
                }
            }
        }
        Ok(errors)
    }

    /// Rewrite foreign-key leaf values in other draft tables after a
    /// row rename.
    fn rewrite_references(
        &mut self,
        revision: &Revision,
        renamed_table: &TableRecord,
        old_id: &str,
        new_id: &str,
    ) -> Result<()> {
        let tables = self.db.tables_in_revision(&revision.id)?;
        for other in tables {
            if other.created_id == renamed_table.created_id {
                continue;
            }
            let tree = SchemaTree::build(&other.schema, self.refs)?;
            let targets: Vec<String> = tree
                .foreign_keys()
                .into_iter()
                .filter(|t| t == &renamed_table.id || t == &renamed_table.created_id)
                .collect();
            if targets.is_empty() {
                continue;
            }

            let mut draft_other: Option<TableRecord> = None;
            for row in self.db.rows_in_table(&other.version_id)? {
                let mut value_tree = ValueTree::build(&tree, &row.id, &row.data)?;
                let mut changed = false;
                for target in &targets {
                    changed |= value_tree.replace_foreign_key_value(target, old_id, new_id);
                }
                if !changed {
                    continue;
                }
                let table_version = match &draft_other {
                    Some(existing) => existing.clone(),
                    None => {
                        let (clone, _) = self.draft_table_version(revision, other.clone())?;
                        draft_other = Some(clone.clone());
                        clone
                    }
                };
                let (draft_row, _) = self.draft_row_version(&table_version, &row.created_id)?;
                let data = value_tree.to_value();
                self.db.update_row_version(
                    &draft_row.version_id,
                    &data,
                    &hash_content(&data),
                    &draft_row.schema_hash,
                )?;
            }
        }
        Ok(())
    }
}

fn batch_validation_error(issues: Vec<RowIssues>) -> ForkDbError {
    let parts: Vec<String> = issues
        .iter()
        .map(|issue| format!("row '{}': {}", issue.row_id, issue.errors.join("; ")))
        .collect();
    ForkDbError::Validation(format!("{} invalid row(s): {}", issues.len(), parts.join(" | ")))
}
