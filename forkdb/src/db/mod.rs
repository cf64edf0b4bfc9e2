use crate::error::Result;
use crate::graph::{Branch, Project, Revision, RowRecord, TableRecord};
use crate::migration::Migration;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

/// The SQLite access layer. Borrows a connection so the same queries
/// run inside a unit-of-work transaction and on the plain read path.
pub struct VersionDb<'c> {
    conn: &'c Connection,
}

/// Raw `(from, to)` version pairing for one `created_id`, as produced by
/// the diff queries. The diff engine derives change flags from it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionPairRecord {
    pub created_id: String,
    pub from_version: Option<String>,
    pub from_id: Option<String>,
    pub to_version: Option<String>,
    pub to_id: Option<String>,
}

/// Aggregate diff counts computed in SQL without materializing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffTotalsRecord {
    pub total: i64,
    pub added: i64,
    pub removed: i64,
    pub modified: i64,
    pub renamed: i64,
}

impl<'c> VersionDb<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        VersionDb { conn }
    }

    /// Create all tables and indexes. Idempotent.
    pub fn initialize(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                root_branch_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS branches (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                name TEXT NOT NULL,
                parent_branch_id TEXT,
                parent_revision_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_branches_project ON branches(project_id);

            CREATE TABLE IF NOT EXISTS revisions (
                id TEXT PRIMARY KEY,
                branch_id TEXT NOT NULL REFERENCES branches(id),
                parent_id TEXT,
                is_start INTEGER NOT NULL DEFAULT 0,
                is_head INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                has_changes INTEGER NOT NULL DEFAULT 0,
                comment TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_revisions_one_draft
                ON revisions(branch_id) WHERE is_draft = 1;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_revisions_one_head
                ON revisions(branch_id) WHERE is_head = 1;
            CREATE INDEX IF NOT EXISTS idx_revisions_parent ON revisions(parent_id);

            CREATE TABLE IF NOT EXISTS table_versions (
                version_id TEXT PRIMARY KEY,
                created_id TEXT NOT NULL,
                id TEXT NOT NULL,
                readonly INTEGER NOT NULL DEFAULT 0,
                schema TEXT NOT NULL,
                schema_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_table_versions_created
                ON table_versions(created_id);

            CREATE TABLE IF NOT EXISTS row_versions (
                version_id TEXT PRIMARY KEY,
                created_id TEXT NOT NULL,
                id TEXT NOT NULL,
                table_created_id TEXT NOT NULL,
                data TEXT NOT NULL,
                readonly INTEGER NOT NULL DEFAULT 0,
                schema_hash TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                published_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_row_versions_created
                ON row_versions(created_id);

            CREATE TABLE IF NOT EXISTS revision_tables (
                revision_id TEXT NOT NULL REFERENCES revisions(id),
                table_version_id TEXT NOT NULL
                    REFERENCES table_versions(version_id) ON UPDATE CASCADE,
                PRIMARY KEY (revision_id, table_version_id)
            );

            CREATE INDEX IF NOT EXISTS idx_revision_tables_version
                ON revision_tables(table_version_id);

            CREATE TABLE IF NOT EXISTS table_rows (
                table_version_id TEXT NOT NULL
                    REFERENCES table_versions(version_id) ON UPDATE CASCADE,
                row_version_id TEXT NOT NULL
                    REFERENCES row_versions(version_id) ON UPDATE CASCADE,
                PRIMARY KEY (table_version_id, row_version_id)
            );

            CREATE INDEX IF NOT EXISTS idx_table_rows_version
                ON table_rows(row_version_id);

            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_created_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_migrations_table
                ON migrations(table_created_id);
            ",
        )?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────

    pub fn insert_project(&self, project: &Project) -> Result<()> {
        self.conn.execute(
            "INSERT INTO projects (id, name, root_branch_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![project.id, project.name, project.root_branch_id, sql_ts(&project.created_at)],
        )?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, name, root_branch_id, created_at FROM projects WHERE id = ?1",
                params![id],
                map_project,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, name, root_branch_id, created_at FROM projects WHERE name = ?1",
                params![name],
                map_project,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, root_branch_id, created_at FROM projects ORDER BY name")?;
        let rows = stmt.query_map([], map_project)?;
        collect(rows)
    }

    // ── Branches ─────────────────────────────────────────────────────

    pub fn insert_branch(&self, branch: &Branch) -> Result<()> {
        self.conn.execute(
            "INSERT INTO branches
                 (id, project_id, name, parent_branch_id, parent_revision_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                branch.id,
                branch.project_id,
                branch.name,
                branch.parent_branch_id,
                branch.parent_revision_id,
                sql_ts(&branch.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn get_branch(&self, id: &str) -> Result<Option<Branch>> {
        let result = self
            .conn
            .query_row(
                "SELECT id, project_id, name, parent_branch_id, parent_revision_id, created_at
                 FROM branches WHERE id = ?1",
                params![id],
                map_branch,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_branches(&self, project_id: &str) -> Result<Vec<Branch>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, name, parent_branch_id, parent_revision_id, created_at
             FROM branches WHERE project_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![project_id], map_branch)?;
        collect(rows)
    }

    // ── Revisions ────────────────────────────────────────────────────

    pub fn insert_revision(&self, revision: &Revision) -> Result<()> {
        self.conn.execute(
            "INSERT INTO revisions
                 (id, branch_id, parent_id, is_start, is_head, is_draft, has_changes,
                  comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                revision.id,
                revision.branch_id,
                revision.parent_id,
                revision.is_start,
                revision.is_head,
                revision.is_draft,
                revision.has_changes,
                revision.comment,
                sql_ts(&revision.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn get_revision(&self, id: &str) -> Result<Option<Revision>> {
        let result = self
            .conn
            .query_row(
                &format!("{REVISION_COLUMNS} WHERE id = ?1"),
                params![id],
                map_revision,
            )
            .optional()?;
        Ok(result)
    }

    pub fn draft_revision(&self, branch_id: &str) -> Result<Option<Revision>> {
        self.revision_by_flag(branch_id, "is_draft")
    }

    pub fn head_revision(&self, branch_id: &str) -> Result<Option<Revision>> {
        self.revision_by_flag(branch_id, "is_head")
    }

    pub fn start_revision(&self, branch_id: &str) -> Result<Option<Revision>> {
        self.revision_by_flag(branch_id, "is_start")
    }

    fn revision_by_flag(&self, branch_id: &str, flag: &str) -> Result<Option<Revision>> {
        let result = self
            .conn
            .query_row(
                &format!("{REVISION_COLUMNS} WHERE branch_id = ?1 AND {flag} = 1"),
                params![branch_id],
                map_revision,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_revisions(&self, branch_id: &str) -> Result<Vec<Revision>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{REVISION_COLUMNS} WHERE branch_id = ?1 ORDER BY created_at, id"))?;
        let rows = stmt.query_map(params![branch_id], map_revision)?;
        collect(rows)
    }

    /// Start revisions of branches forked from the given revision.
    pub fn child_start_revisions(&self, revision_id: &str) -> Result<Vec<Revision>> {
        let mut stmt = self.conn.prepare(&format!(
            "{REVISION_COLUMNS} WHERE parent_id = ?1 AND is_start = 1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![revision_id], map_revision)?;
        collect(rows)
    }

    pub fn set_has_changes(&self, revision_id: &str, has_changes: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE revisions SET has_changes = ?2 WHERE id = ?1",
            params![revision_id, has_changes],
        )?;
        Ok(())
    }

    pub fn mark_committed(&self, revision_id: &str, comment: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE revisions SET is_draft = 0, is_head = 1, comment = ?2 WHERE id = ?1",
            params![revision_id, comment],
        )?;
        Ok(())
    }

    pub fn clear_head(&self, revision_id: &str) -> Result<()> {
        self.conn
            .execute("UPDATE revisions SET is_head = 0 WHERE id = ?1", params![revision_id])?;
        Ok(())
    }

    // ── Table versions ───────────────────────────────────────────────

    pub fn insert_table_version(&self, table: &TableRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO table_versions
                 (version_id, created_id, id, readonly, schema, schema_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                table.version_id,
                table.created_id,
                table.id,
                table.readonly,
                table.schema.to_string(),
                table.schema_hash,
                sql_ts(&table.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn table_by_version(&self, version_id: &str) -> Result<Option<TableRecord>> {
        let result = self
            .conn
            .query_row(
                &format!("{TABLE_COLUMNS} FROM table_versions t WHERE t.version_id = ?1"),
                params![version_id],
                map_table,
            )
            .optional()?;
        Ok(result)
    }

    pub fn tables_in_revision(&self, revision_id: &str) -> Result<Vec<TableRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{TABLE_COLUMNS} FROM revision_tables rt
             JOIN table_versions t ON t.version_id = rt.table_version_id
             WHERE rt.revision_id = ?1 ORDER BY t.id"
        ))?;
        let rows = stmt.query_map(params![revision_id], map_table)?;
        collect(rows)
    }

    /// Resolve by current id first, then by stable created id.
    pub fn find_table_in_revision(
        &self,
        revision_id: &str,
        table_ref: &str,
    ) -> Result<Option<TableRecord>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "{TABLE_COLUMNS} FROM revision_tables rt
                     JOIN table_versions t ON t.version_id = rt.table_version_id
                     WHERE rt.revision_id = ?1 AND (t.id = ?2 OR t.created_id = ?2)
                     ORDER BY (t.id = ?2) DESC LIMIT 1"
                ),
                params![revision_id, table_ref],
                map_table,
            )
            .optional()?;
        Ok(result)
    }

    pub fn update_table_version_schema(
        &self,
        version_id: &str,
        schema: &Value,
        schema_hash: &str,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE table_versions SET schema = ?2, schema_hash = ?3 WHERE version_id = ?1",
            params![version_id, schema.to_string(), schema_hash],
        )?;
        Ok(())
    }

    pub fn rename_table_version(&self, version_id: &str, next_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE table_versions SET id = ?2 WHERE version_id = ?1",
            params![version_id, next_id],
        )?;
        Ok(())
    }

    /// Give a draft-owned table version a fresh version id. Link rows
    /// follow through `ON UPDATE CASCADE`; only the owning draft
    /// references a non-readonly version, so nothing else can observe
    /// the change.
    pub fn bump_table_version(&self, version_id: &str, next_version_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE table_versions SET version_id = ?2 WHERE version_id = ?1",
            params![version_id, next_version_id],
        )?;
        Ok(())
    }

    // ── Row versions ─────────────────────────────────────────────────

    pub fn insert_row_version(&self, row: &RowRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO row_versions
                 (version_id, created_id, id, table_created_id, data, readonly,
                  schema_hash, content_hash, published_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.version_id,
                row.created_id,
                row.id,
                row.table_created_id,
                row.data.to_string(),
                row.readonly,
                row.schema_hash,
                row.content_hash,
                row.published_at.as_ref().map(sql_ts),
                sql_ts(&row.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn row_by_version(&self, version_id: &str) -> Result<Option<RowRecord>> {
        let result = self
            .conn
            .query_row(
                &format!("{ROW_COLUMNS} FROM row_versions r WHERE r.version_id = ?1"),
                params![version_id],
                map_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn rows_in_table(&self, table_version_id: &str) -> Result<Vec<RowRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ROW_COLUMNS} FROM table_rows tr
             JOIN row_versions r ON r.version_id = tr.row_version_id
             WHERE tr.table_version_id = ?1 ORDER BY r.created_id"
        ))?;
        let rows = stmt.query_map(params![table_version_id], map_row)?;
        collect(rows)
    }

    pub fn count_rows(&self, table_version_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM table_rows WHERE table_version_id = ?1",
            params![table_version_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Resolve by stable created id first, then by current id.
    pub fn find_row_in_table(
        &self,
        table_version_id: &str,
        row_ref: &str,
    ) -> Result<Option<RowRecord>> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "{ROW_COLUMNS} FROM table_rows tr
                     JOIN row_versions r ON r.version_id = tr.row_version_id
                     WHERE tr.table_version_id = ?1 AND (r.created_id = ?2 OR r.id = ?2)
                     ORDER BY (r.created_id = ?2) DESC LIMIT 1"
                ),
                params![table_version_id, row_ref],
                map_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn update_row_version(
        &self,
        version_id: &str,
        data: &Value,
        content_hash: &str,
        schema_hash: &str,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE row_versions SET data = ?2, content_hash = ?3, schema_hash = ?4
             WHERE version_id = ?1",
            params![version_id, data.to_string(), content_hash, schema_hash],
        )?;
        Ok(())
    }

    pub fn rename_row_version(&self, version_id: &str, next_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE row_versions SET id = ?2 WHERE version_id = ?1",
            params![version_id, next_id],
        )?;
        Ok(())
    }

    /// Give a draft-owned row version a fresh version id; see
    /// `bump_table_version`.
    pub fn bump_row_version(&self, version_id: &str, next_version_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE row_versions SET version_id = ?2 WHERE version_id = ?1",
            params![version_id, next_version_id],
        )?;
        Ok(())
    }

    // ── Revision/table and table/row links ───────────────────────────

    pub fn link_revision_table(&self, revision_id: &str, table_version_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO revision_tables (revision_id, table_version_id)
             VALUES (?1, ?2)",
            params![revision_id, table_version_id],
        )?;
        Ok(())
    }

    pub fn unlink_revision_table(&self, revision_id: &str, table_version_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM revision_tables WHERE revision_id = ?1 AND table_version_id = ?2",
            params![revision_id, table_version_id],
        )?;
        Ok(())
    }

    pub fn replace_revision_table(
        &self,
        revision_id: &str,
        old_version_id: &str,
        new_version_id: &str,
    ) -> Result<()> {
        self.unlink_revision_table(revision_id, old_version_id)?;
        self.link_revision_table(revision_id, new_version_id)
    }

    pub fn copy_revision_tables(&self, from_revision: &str, to_revision: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO revision_tables (revision_id, table_version_id)
             SELECT ?2, table_version_id FROM revision_tables WHERE revision_id = ?1",
            params![from_revision, to_revision],
        )?;
        Ok(())
    }

    pub fn clear_revision_tables(&self, revision_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM revision_tables WHERE revision_id = ?1", params![revision_id])?;
        Ok(())
    }

    pub fn link_table_row(&self, table_version_id: &str, row_version_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO table_rows (table_version_id, row_version_id)
             VALUES (?1, ?2)",
            params![table_version_id, row_version_id],
        )?;
        Ok(())
    }

    pub fn unlink_table_row(&self, table_version_id: &str, row_version_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM table_rows WHERE table_version_id = ?1 AND row_version_id = ?2",
            params![table_version_id, row_version_id],
        )?;
        Ok(())
    }

    pub fn replace_table_row(
        &self,
        table_version_id: &str,
        old_row_version: &str,
        new_row_version: &str,
    ) -> Result<()> {
        self.unlink_table_row(table_version_id, old_row_version)?;
        self.link_table_row(table_version_id, new_row_version)
    }

    pub fn copy_table_rows(&self, from_table_version: &str, to_table_version: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO table_rows (table_version_id, row_version_id)
             SELECT ?2, row_version_id FROM table_rows WHERE table_version_id = ?1",
            params![from_table_version, to_table_version],
        )?;
        Ok(())
    }

    /// Freeze everything a revision references: tables and rows become
    /// readonly, rows get their first `published_at` stamped.
    pub fn freeze_revision(&self, revision_id: &str, published_at: &DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE table_versions SET readonly = 1 WHERE version_id IN
                 (SELECT table_version_id FROM revision_tables WHERE revision_id = ?1)",
            params![revision_id],
        )?;
        self.conn.execute(
            "UPDATE row_versions SET readonly = 1,
                    published_at = COALESCE(published_at, ?2)
             WHERE version_id IN
                 (SELECT row_version_id FROM table_rows WHERE table_version_id IN
                     (SELECT table_version_id FROM revision_tables WHERE revision_id = ?1))",
            params![revision_id, sql_ts(published_at)],
        )?;
        Ok(())
    }

    /// Whether two revisions reference different table version sets.
    /// Pass `None` for an absent head; it compares against the empty set.
    pub fn revision_sets_differ(&self, revision_id: &str, other: Option<&str>) -> Result<bool> {
        let other = other.unwrap_or("");
        let differ = self.conn.query_row(
            "SELECT EXISTS(
                 SELECT table_version_id FROM revision_tables WHERE revision_id = ?1
                 EXCEPT
                 SELECT table_version_id FROM revision_tables WHERE revision_id = ?2)
             OR EXISTS(
                 SELECT table_version_id FROM revision_tables WHERE revision_id = ?2
                 EXCEPT
                 SELECT table_version_id FROM revision_tables WHERE revision_id = ?1)",
            params![revision_id, other],
            |row| row.get(0),
        )?;
        Ok(differ)
    }

    // ── Migration log ────────────────────────────────────────────────

    pub fn append_migration(&self, table_created_id: &str, migration: &Migration) -> Result<()> {
        self.conn.execute(
            "INSERT INTO migrations (table_created_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                table_created_id,
                migration.kind(),
                serde_json::to_string(migration)?,
                sql_ts(&Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn migrations_for(&self, table_created_id: &str) -> Result<Vec<Migration>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM migrations WHERE table_created_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![table_created_id], |row| {
            let payload: String = row.get(0)?;
            serde_json::from_str(&payload).map_err(|e| conversion_error(Box::new(e)))
        })?;
        collect(rows)
    }

    // ── Diff queries ─────────────────────────────────────────────────

    /// Paired table versions of two revisions, cursor-paginated and
    /// ordered by `created_id`. System tables are filtered out unless
    /// requested.
    pub fn table_diff_entries(
        &self,
        from_revision: &str,
        to_revision: &str,
        include_system: bool,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<VersionPairRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{TABLE_DIFF_CTE}
             SELECT COALESCE(f.created_id, t.created_id) AS created_id,
                    f.version_id, f.id, t.version_id, t.id
             FROM f FULL OUTER JOIN t ON f.created_id = t.created_id
             WHERE (?3 OR substr(COALESCE(t.id, f.id), 1, 2) != '__')
               AND (f.version_id IS NULL OR t.version_id IS NULL
                    OR f.version_id != t.version_id OR f.id != t.id)
               AND COALESCE(f.created_id, t.created_id) > ?4
             ORDER BY created_id LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![from_revision, to_revision, include_system, cursor.unwrap_or(""), limit],
            map_version_pair,
        )?;
        collect(rows)
    }

    pub fn table_diff_totals(
        &self,
        from_revision: &str,
        to_revision: &str,
        include_system: bool,
    ) -> Result<DiffTotalsRecord> {
        let totals = self.conn.query_row(
            &format!(
                "{TABLE_DIFF_CTE}
                 SELECT COUNT(*),
                        IFNULL(SUM(f.created_id IS NULL), 0),
                        IFNULL(SUM(t.created_id IS NULL), 0),
                        IFNULL(SUM(f.created_id IS NOT NULL AND t.created_id IS NOT NULL
                                   AND f.version_id != t.version_id), 0),
                        IFNULL(SUM(f.created_id IS NOT NULL AND t.created_id IS NOT NULL
                                   AND f.id != t.id), 0)
                 FROM f FULL OUTER JOIN t ON f.created_id = t.created_id
                 WHERE (?3 OR substr(COALESCE(t.id, f.id), 1, 2) != '__')"
            ),
            params![from_revision, to_revision, include_system],
            map_totals,
        )?;
        Ok(totals)
    }

    /// Paired row versions of two table versions. Pass `None` when the
    /// table is absent on one side; that side reads as the empty set.
    pub fn row_diff_entries(
        &self,
        from_table_version: Option<&str>,
        to_table_version: Option<&str>,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Vec<VersionPairRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ROW_DIFF_CTE}
             SELECT COALESCE(f.created_id, t.created_id) AS created_id,
                    f.version_id, f.id, t.version_id, t.id
             FROM f FULL OUTER JOIN t ON f.created_id = t.created_id
             WHERE (f.version_id IS NULL OR t.version_id IS NULL
                    OR f.version_id != t.version_id OR f.id != t.id)
               AND COALESCE(f.created_id, t.created_id) > ?3
             ORDER BY created_id LIMIT ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                from_table_version.unwrap_or(""),
                to_table_version.unwrap_or(""),
                cursor.unwrap_or(""),
                limit
            ],
            map_version_pair,
        )?;
        collect(rows)
    }

    pub fn row_diff_totals(
        &self,
        from_table_version: Option<&str>,
        to_table_version: Option<&str>,
    ) -> Result<DiffTotalsRecord> {
        let totals = self.conn.query_row(
            &format!(
                "{ROW_DIFF_CTE}
                 SELECT COUNT(*),
                        IFNULL(SUM(f.created_id IS NULL), 0),
                        IFNULL(SUM(t.created_id IS NULL), 0),
                        IFNULL(SUM(f.created_id IS NOT NULL AND t.created_id IS NOT NULL
                                   AND f.version_id != t.version_id), 0),
                        IFNULL(SUM(f.created_id IS NOT NULL AND t.created_id IS NOT NULL
                                   AND f.id != t.id), 0)
                 FROM f FULL OUTER JOIN t ON f.created_id = t.created_id"
            ),
            params![from_table_version.unwrap_or(""), to_table_version.unwrap_or("")],
            map_totals,
        )?;
        Ok(totals)
    }

    /// LIMIT-1 existence probe: is there any row-level difference
    /// between these two table versions?
    pub fn has_row_changes(
        &self,
        from_table_version: Option<&str>,
        to_table_version: Option<&str>,
    ) -> Result<bool> {
        let has = self.conn.query_row(
            &format!(
                "{ROW_DIFF_CTE}
                 SELECT EXISTS(
                     SELECT 1 FROM f FULL OUTER JOIN t ON f.created_id = t.created_id
                     WHERE f.version_id IS NULL OR t.version_id IS NULL
                        OR f.version_id != t.version_id OR f.id != t.id
                     LIMIT 1)"
            ),
            params![from_table_version.unwrap_or(""), to_table_version.unwrap_or("")],
            |row| row.get(0),
        )?;
        Ok(has)
    }

    // ── Garbage collection ───────────────────────────────────────────

    /// Delete table/row versions no revision references any more.
    /// Returns (tables deleted, rows deleted).
    pub fn sweep_orphans(&self) -> Result<(usize, usize)> {
        self.conn.execute(
            "DELETE FROM table_rows WHERE table_version_id NOT IN
                 (SELECT table_version_id FROM revision_tables)",
            [],
        )?;
        let rows = self.conn.execute(
            "DELETE FROM row_versions WHERE version_id NOT IN
                 (SELECT row_version_id FROM table_rows)",
            [],
        )?;
        let tables = self.conn.execute(
            "DELETE FROM table_versions WHERE version_id NOT IN
                 (SELECT table_version_id FROM revision_tables)",
            [],
        )?;
        Ok((tables, rows))
    }
}

const REVISION_COLUMNS: &str = "SELECT id, branch_id, parent_id, is_start, is_head, is_draft, \
     has_changes, comment, created_at FROM revisions";

const TABLE_COLUMNS: &str =
    "SELECT t.version_id, t.created_id, t.id, t.readonly, t.schema, t.schema_hash, t.created_at";

const ROW_COLUMNS: &str = "SELECT r.version_id, r.created_id, r.id, r.table_created_id, r.data, \
     r.readonly, r.schema_hash, r.content_hash, r.published_at, r.created_at";

const TABLE_DIFF_CTE: &str = "WITH f AS (
         SELECT tv.created_id, tv.version_id, tv.id
         FROM revision_tables rt JOIN table_versions tv ON tv.version_id = rt.table_version_id
         WHERE rt.revision_id = ?1
     ), t AS (
         SELECT tv.created_id, tv.version_id, tv.id
         FROM revision_tables rt JOIN table_versions tv ON tv.version_id = rt.table_version_id
         WHERE rt.revision_id = ?2
     )";

const ROW_DIFF_CTE: &str = "WITH f AS (
         SELECT rv.created_id, rv.version_id, rv.id
         FROM table_rows tr JOIN row_versions rv ON rv.version_id = tr.row_version_id
         WHERE tr.table_version_id = ?1
     ), t AS (
         SELECT rv.created_id, rv.version_id, rv.id
         FROM table_rows tr JOIN row_versions rv ON rv.version_id = tr.row_version_id
         WHERE tr.table_version_id = ?2
     )";

// ── Row mapping helpers ──────────────────────────────────────────────

fn sql_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(Box::new(e)))
}

fn parse_json(value: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&value).map_err(|e| conversion_error(Box::new(e)))
}

fn conversion_error(
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err)
}

fn map_project(row: &rusqlite::Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root_branch_id: row.get(2)?,
        created_at: parse_ts(row.get(3)?)?,
    })
}

fn map_branch(row: &rusqlite::Row) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        parent_branch_id: row.get(3)?,
        parent_revision_id: row.get(4)?,
        created_at: parse_ts(row.get(5)?)?,
    })
}

fn map_revision(row: &rusqlite::Row) -> rusqlite::Result<Revision> {
    Ok(Revision {
        id: row.get(0)?,
        branch_id: row.get(1)?,
        parent_id: row.get(2)?,
        is_start: row.get(3)?,
        is_head: row.get(4)?,
        is_draft: row.get(5)?,
        has_changes: row.get(6)?,
        comment: row.get(7)?,
        created_at: parse_ts(row.get(8)?)?,
    })
}

fn map_table(row: &rusqlite::Row) -> rusqlite::Result<TableRecord> {
    Ok(TableRecord {
        version_id: row.get(0)?,
        created_id: row.get(1)?,
        id: row.get(2)?,
        readonly: row.get(3)?,
        schema: parse_json(row.get(4)?)?,
        schema_hash: row.get(5)?,
        created_at: parse_ts(row.get(6)?)?,
    })
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<RowRecord> {
    let published_at: Option<String> = row.get(8)?;
    Ok(RowRecord {
        version_id: row.get(0)?,
        created_id: row.get(1)?,
        id: row.get(2)?,
        table_created_id: row.get(3)?,
        data: parse_json(row.get(4)?)?,
        readonly: row.get(5)?,
        schema_hash: row.get(6)?,
        content_hash: row.get(7)?,
        published_at: published_at.map(parse_ts).transpose()?,
        created_at: parse_ts(row.get(9)?)?,
    })
}

fn map_version_pair(row: &rusqlite::Row) -> rusqlite::Result<VersionPairRecord> {
    Ok(VersionPairRecord {
        created_id: row.get(0)?,
        from_version: row.get(1)?,
        from_id: row.get(2)?,
        to_version: row.get(3)?,
        to_id: row.get(4)?,
    })
}

fn map_totals(row: &rusqlite::Row) -> rusqlite::Result<DiffTotalsRecord> {
    Ok(DiffTotalsRecord {
        total: row.get(0)?,
        added: row.get(1)?,
        removed: row.get(2)?,
        modified: row.get(3)?,
        renamed: row.get(4)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::hash_schema;
    use crate::util::new_id;
    use serde_json::json;

    pub(crate) struct Seeded {
        pub project_id: String,
        pub branch_id: String,
        pub start_id: String,
        pub draft_id: String,
    }

    /// Insert a project with a root branch, an empty immutable start
    /// revision and a draft child.
    pub(crate) fn seed_project(db: &VersionDb, name: &str) -> Seeded {
        let now = Utc::now();
        let project_id = new_id();
        let branch_id = new_id();
        let start_id = new_id();
        let draft_id = new_id();

        db.insert_project(&Project {
            id: project_id.clone(),
            name: name.to_string(),
            root_branch_id: branch_id.clone(),
            created_at: now,
        })
        .unwrap();
        db.insert_branch(&Branch {
            id: branch_id.clone(),
            project_id: project_id.clone(),
            name: "main".to_string(),
            parent_branch_id: None,
            parent_revision_id: None,
            created_at: now,
        })
        .unwrap();
        db.insert_revision(&Revision {
            id: start_id.clone(),
            branch_id: branch_id.clone(),
            parent_id: None,
            is_start: true,
            is_head: false,
            is_draft: false,
            has_changes: false,
            comment: None,
            created_at: now,
        })
        .unwrap();
        db.insert_revision(&Revision {
            id: draft_id.clone(),
            branch_id: branch_id.clone(),
            parent_id: Some(start_id.clone()),
            is_start: false,
            is_head: false,
            is_draft: true,
            has_changes: false,
            comment: None,
            created_at: now,
        })
        .unwrap();

        Seeded { project_id, branch_id, start_id, draft_id }
    }

    pub(crate) fn seed_table(db: &VersionDb, revision_id: &str, table_id: &str) -> TableRecord {
        let schema = json!({ "type": "object", "properties": {} });
        let table = TableRecord {
            version_id: new_id(),
            created_id: new_id(),
            id: table_id.to_string(),
            readonly: false,
            schema_hash: hash_schema(&schema),
            schema,
            created_at: Utc::now(),
        };
        db.insert_table_version(&table).unwrap();
        db.link_revision_table(revision_id, &table.version_id).unwrap();
        table
    }

    fn mem() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        VersionDb::initialize(&conn).unwrap();
        conn
    }

    #[test]
    fn project_round_trip() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        let project = db.get_project(&seeded.project_id).unwrap().unwrap();
        assert_eq!(project.name, "demo");
        assert_eq!(project.root_branch_id, seeded.branch_id);
        assert_eq!(db.get_project_by_name("demo").unwrap().unwrap().id, project.id);
        assert_eq!(db.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn one_draft_per_branch_enforced_by_index() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        let second_draft = Revision {
            id: new_id(),
            branch_id: seeded.branch_id.clone(),
            parent_id: None,
            is_start: false,
            is_head: false,
            is_draft: true,
            has_changes: false,
            comment: None,
            created_at: Utc::now(),
        };
        assert!(db.insert_revision(&second_draft).is_err());
    }

    #[test]
    fn find_table_prefers_current_id() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        let table = seed_table(&db, &seeded.draft_id, "posts");
        let by_id = db.find_table_in_revision(&seeded.draft_id, "posts").unwrap().unwrap();
        assert_eq!(by_id.version_id, table.version_id);
        let by_created =
            db.find_table_in_revision(&seeded.draft_id, &table.created_id).unwrap().unwrap();
        assert_eq!(by_created.version_id, table.version_id);
        assert!(db.find_table_in_revision(&seeded.draft_id, "ghost").unwrap().is_none());
    }

    #[test]
    fn version_sharing_across_revisions() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        let table = seed_table(&db, &seeded.draft_id, "posts");
        db.copy_revision_tables(&seeded.draft_id, &seeded.start_id).unwrap();
        let shared = db.tables_in_revision(&seeded.start_id).unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].version_id, table.version_id);
    }

    #[test]
    fn revision_sets_differ_against_missing_head() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        assert!(!db.revision_sets_differ(&seeded.draft_id, None).unwrap());
        seed_table(&db, &seeded.draft_id, "posts");
        assert!(db.revision_sets_differ(&seeded.draft_id, None).unwrap());
        assert!(db.revision_sets_differ(&seeded.draft_id, Some(&seeded.start_id)).unwrap());

        db.copy_revision_tables(&seeded.draft_id, &seeded.start_id).unwrap();
        assert!(!db.revision_sets_differ(&seeded.draft_id, Some(&seeded.start_id)).unwrap());
    }

    #[test]
    fn migration_log_round_trip_in_order() {
        let conn = mem();
        let db = VersionDb::new(&conn);

        let schema = json!({ "type": "object", "properties": {} });
        let init = Migration::Init { hash: hash_schema(&schema), schema };
        db.append_migration("tbl-1", &init).unwrap();
        db.append_migration(
            "tbl-1",
            &Migration::Rename { table_id: "a".into(), next_table_id: "b".into() },
        )
        .unwrap();
        db.append_migration("tbl-2", &Migration::Remove).unwrap();

        let log = db.migrations_for("tbl-1").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].kind(), "init");
        assert_eq!(log[1].kind(), "rename");
    }

    #[test]
    fn sweep_orphans_keeps_referenced_versions() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        let kept = seed_table(&db, &seeded.draft_id, "kept");
        let orphan = TableRecord { version_id: new_id(), ..kept.clone() };
        db.insert_table_version(&orphan).unwrap();

        let (tables, rows) = db.sweep_orphans().unwrap();
        assert_eq!((tables, rows), (1, 0));
        assert!(db.table_by_version(&orphan.version_id).unwrap().is_none());
        assert!(db.table_by_version(&kept.version_id).unwrap().is_some());
    }

    #[test]
    fn freeze_revision_marks_versions_readonly() {
        let conn = mem();
        let db = VersionDb::new(&conn);
        let seeded = seed_project(&db, "demo");

        let table = seed_table(&db, &seeded.draft_id, "posts");
        let row = RowRecord {
            version_id: new_id(),
            created_id: "p1".into(),
            id: "p1".into(),
            table_created_id: table.created_id.clone(),
            data: json!({}),
            readonly: false,
            schema_hash: table.schema_hash.clone(),
            content_hash: hash_schema(&json!({})),
            published_at: None,
            created_at: Utc::now(),
        };
        db.insert_row_version(&row).unwrap();
        db.link_table_row(&table.version_id, &row.version_id).unwrap();

        db.freeze_revision(&seeded.draft_id, &Utc::now()).unwrap();

        assert!(db.table_by_version(&table.version_id).unwrap().unwrap().readonly);
        let frozen = db.row_by_version(&row.version_id).unwrap().unwrap();
        assert!(frozen.readonly);
        assert!(frozen.published_at.is_some());
    }
}
