// Structural comparison between two revisions. Read-only: the engine
// runs plain snapshot queries and takes no locks that would block
// concurrent drafts.

use crate::db::{DiffTotalsRecord, VersionDb, VersionPairRecord};
use crate::error::{ForkDbError, Result};
use crate::graph::TableRecord;
use serde::Serialize;

/// What changed for one `created_id` between the two revisions. Renamed
/// and modified are independent facts: a table or row can be both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChangeFlags {
    pub added: bool,
    pub removed: bool,
    pub modified: bool,
    pub renamed: bool,
}

impl ChangeFlags {
    fn from_pair(pair: &VersionPairRecord) -> Self {
        let both = pair.from_version.is_some() && pair.to_version.is_some();
        ChangeFlags {
            added: pair.from_version.is_none(),
            removed: pair.to_version.is_none(),
            modified: both && pair.from_version != pair.to_version,
            renamed: both && pair.from_id != pair.to_id,
        }
    }

    pub fn any(&self) -> bool {
        self.added || self.removed || self.modified || self.renamed
    }
}

/// One side of a diff entry: the version the entity had in one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffSide {
    pub version_id: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub created_id: String,
    pub from: Option<DiffSide>,
    pub to: Option<DiffSide>,
    pub change: ChangeFlags,
}

/// Aggregate counts; `total` is the union of both revisions' sets by
/// `created_id`, so `added + modified + removed + renamed` may exceed
/// none of it only when rename and modify overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub total: i64,
    pub added: i64,
    pub modified: i64,
    pub removed: i64,
    pub renamed: i64,
}

impl From<DiffTotalsRecord> for DiffSummary {
    fn from(totals: DiffTotalsRecord) -> Self {
        DiffSummary {
            total: totals.total,
            added: totals.added,
            modified: totals.modified,
            removed: totals.removed,
            renamed: totals.renamed,
        }
    }
}

/// One page of a cursor-paginated diff listing, ordered by `created_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffPage {
    pub entries: Vec<DiffEntry>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Include reserved `__`-prefixed tables.
    pub include_system: bool,
    pub cursor: Option<String>,
    pub limit: i64,
}

impl Default for DiffOptions {
    fn default() -> Self {
        DiffOptions { include_system: false, cursor: None, limit: 100 }
    }
}

pub struct DiffEngine<'c> {
    db: VersionDb<'c>,
}

impl<'c> DiffEngine<'c> {
    pub fn new(db: VersionDb<'c>) -> Self {
        DiffEngine { db }
    }

    /// Aggregate table-level counts between two revisions, computed in
    /// one query without materializing entries.
    pub fn table_diff_summary(
        &self,
        from_revision: &str,
        to_revision: &str,
        include_system: bool,
    ) -> Result<DiffSummary> {
        self.require_revision(from_revision)?;
        self.require_revision(to_revision)?;
        let totals = self.db.table_diff_totals(from_revision, to_revision, include_system)?;
        Ok(totals.into())
    }

    /// Cursor-paginated table diff entries.
    pub fn table_diffs(
        &self,
        from_revision: &str,
        to_revision: &str,
        options: &DiffOptions,
    ) -> Result<DiffPage> {
        self.require_revision(from_revision)?;
        self.require_revision(to_revision)?;
        let pairs = self.db.table_diff_entries(
            from_revision,
            to_revision,
            options.include_system,
            options.cursor.as_deref(),
            options.limit,
        )?;
        Ok(page_from(pairs, options.limit))
    }

    /// Aggregate row-level counts for one table (referenced by current
    /// id or `created_id`).
    pub fn row_diff_summary(
        &self,
        from_revision: &str,
        to_revision: &str,
        table_ref: &str,
    ) -> Result<DiffSummary> {
        let (from_table, to_table) =
            self.resolve_table_sides(from_revision, to_revision, table_ref)?;
        let totals = self.db.row_diff_totals(
            from_table.as_ref().map(|t| t.version_id.as_str()),
            to_table.as_ref().map(|t| t.version_id.as_str()),
        )?;
        Ok(totals.into())
    }

    /// Cursor-paginated row diff entries for one table.
    pub fn row_diffs(
        &self,
        from_revision: &str,
        to_revision: &str,
        table_ref: &str,
        options: &DiffOptions,
    ) -> Result<DiffPage> {
        let (from_table, to_table) =
            self.resolve_table_sides(from_revision, to_revision, table_ref)?;
        let pairs = self.db.row_diff_entries(
            from_table.as_ref().map(|t| t.version_id.as_str()),
            to_table.as_ref().map(|t| t.version_id.as_str()),
            options.cursor.as_deref(),
            options.limit,
        )?;
        Ok(page_from(pairs, options.limit))
    }

    /// Short-circuit boolean: is there any row-level difference for this
    /// table between the two revisions? Avoids computing the diff when
    /// the caller only needs yes/no.
    pub fn has_row_changes(
        &self,
        from_revision: &str,
        to_revision: &str,
        table_ref: &str,
    ) -> Result<bool> {
        let (from_table, to_table) =
            self.resolve_table_sides(from_revision, to_revision, table_ref)?;
        match (&from_table, &to_table) {
            (Some(f), Some(t)) if f.version_id == t.version_id => Ok(false),
            _ => self.db.has_row_changes(
                from_table.as_ref().map(|t| t.version_id.as_str()),
                to_table.as_ref().map(|t| t.version_id.as_str()),
            ),
        }
    }

    fn require_revision(&self, revision_id: &str) -> Result<()> {
        if self.db.get_revision(revision_id)?.is_none() {
            return Err(ForkDbError::not_found("Revision", revision_id));
        }
        Ok(())
    }

    /// The table's version on each side; absent on one side means the
    /// table was added or removed there. Absent on both is not-found.
    fn resolve_table_sides(
        &self,
        from_revision: &str,
        to_revision: &str,
        table_ref: &str,
    ) -> Result<(Option<TableRecord>, Option<TableRecord>)> {
        self.require_revision(from_revision)?;
        self.require_revision(to_revision)?;
        let mut from_table = self.db.find_table_in_revision(from_revision, table_ref)?;
        let to_table = match &from_table {
            // match the to-side by stable identity, not display name
            Some(table) => self.db.find_table_in_revision(to_revision, &table.created_id)?,
            None => self.db.find_table_in_revision(to_revision, table_ref)?,
        };
        if from_table.is_none() {
            if let Some(table) = &to_table {
                from_table = self.db.find_table_in_revision(from_revision, &table.created_id)?;
            }
        }
        if from_table.is_none() && to_table.is_none() {
            return Err(ForkDbError::not_found("Table", table_ref));
        }
        Ok((from_table, to_table))
    }
}

fn page_from(pairs: Vec<VersionPairRecord>, limit: i64) -> DiffPage {
    let entries: Vec<DiffEntry> = pairs
        .into_iter()
        .map(|pair| {
            let change = ChangeFlags::from_pair(&pair);
            DiffEntry {
                created_id: pair.created_id,
                from: match (pair.from_version, pair.from_id) {
                    (Some(version_id), Some(id)) => Some(DiffSide { version_id, id }),
                    _ => None,
                },
                to: match (pair.to_version, pair.to_id) {
                    (Some(version_id), Some(id)) => Some(DiffSide { version_id, id }),
                    _ => None,
                },
                change,
            }
        })
        .collect();
    let next_cursor = if limit >= 0 && entries.len() as i64 == limit {
        entries.last().map(|e| e.created_id.clone())
    } else {
        None
    };
    DiffPage { entries, next_cursor }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::VersionDb;
    use crate::draft::{DraftEngine, NewRow, RowRename, RowUpdate};
    use crate::graph;
    use crate::plugin::PluginSet;
    use crate::schema::SchemaRefs;
    use rusqlite::Connection;
    use serde_json::{json, Value};

    struct Fixture {
        conn: Connection,
        plugins: PluginSet,
        refs: SchemaRefs,
    }

    impl Fixture {
        fn new() -> Self {
            let conn = Connection::open_in_memory().unwrap();
            VersionDb::initialize(&conn).unwrap();
            Fixture { conn, plugins: PluginSet::default(), refs: SchemaRefs::standard() }
        }

        fn engine(&self) -> DraftEngine<'_> {
            DraftEngine::new(VersionDb::new(&self.conn), &self.plugins, &self.refs)
        }

        fn diff(&self) -> DiffEngine<'_> {
            DiffEngine::new(VersionDb::new(&self.conn))
        }
    }

    fn posts_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "title": { "type": "string" } },
            "required": ["title"]
        })
    }

    /// Branch with `posts` (one row `p1`) committed once. Returns
    /// (branch, start, head, draft).
    fn committed_posts(fixture: &Fixture) -> (String, String, String, String) {
        let mut engine = fixture.engine();
        let project = engine.create_project("demo").unwrap();
        let branch_id = project.root_branch_id;
        let draft = graph::resolve_draft(engine.db(), &branch_id).unwrap();
        engine.create_table(&draft.id, "posts", &posts_schema()).unwrap();
        engine
            .create_rows(
                &draft.id,
                "posts",
                vec![NewRow { id: Some("p1".into()), data: json!({ "title": "Hello" }) }],
                false,
            )
            .unwrap();
        let outcome = engine.commit(&branch_id, None).unwrap();
        let start = graph::resolve_start(engine.db(), &branch_id).unwrap();
        (branch_id, start.id, outcome.previous_draft_id, outcome.new_draft_id)
    }

    #[test]
    fn start_vs_head_shows_table_and_row_added() {
        let fixture = Fixture::new();
        let (_, start, head, _) = committed_posts(&fixture);
        let diff = fixture.diff();

        let summary = diff.table_diff_summary(&start, &head, false).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.modified, 0);

        let page = diff.table_diffs(&start, &head, &DiffOptions::default()).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.entries[0].change.added);
        assert!(page.entries[0].from.is_none());

        let rows = diff.row_diffs(&start, &head, "posts", &DiffOptions::default()).unwrap();
        assert_eq!(rows.entries.len(), 1);
        assert_eq!(rows.entries[0].created_id, "p1");
        assert!(rows.entries[0].change.added);
    }

    #[test]
    fn update_in_draft_shows_modified_on_both_levels() {
        let fixture = Fixture::new();
        let (branch_id, _, head, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            engine
                .update_rows(
                    &draft,
                    "posts",
                    vec![RowUpdate { row_id: "p1".into(), data: json!({ "title": "Hi" }) }],
                )
                .unwrap();
            let revision = graph::resolve_draft(engine.db(), &branch_id).unwrap();
            assert!(revision.has_changes);
        }
        let diff = fixture.diff();

        let summary = diff.table_diff_summary(&head, &draft, false).unwrap();
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.added, 0);
        assert_eq!(summary.renamed, 0);

        let rows = diff.row_diffs(&head, &draft, "posts", &DiffOptions::default()).unwrap();
        assert_eq!(rows.entries.len(), 1);
        let entry = &rows.entries[0];
        assert!(entry.change.modified && !entry.change.renamed);
        assert_ne!(entry.from.as_ref().unwrap().version_id, entry.to.as_ref().unwrap().version_id);
    }

    #[test]
    fn rename_is_classified_as_renamed_not_added_plus_removed() {
        let fixture = Fixture::new();
        let (_, _, head, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            engine.rename_table(&draft, "posts", "articles").unwrap();
        }
        let diff = fixture.diff();

        let summary = diff.table_diff_summary(&head, &draft, false).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.renamed, 1);
        assert_eq!(summary.added, 0);
        assert_eq!(summary.removed, 0);

        let page = diff.table_diffs(&head, &draft, &DiffOptions::default()).unwrap();
        let entry = &page.entries[0];
        assert!(entry.change.renamed);
        // the clone that carried the rename also changed the version id
        assert!(entry.change.modified);
        assert_eq!(entry.from.as_ref().unwrap().id, "posts");
        assert_eq!(entry.to.as_ref().unwrap().id, "articles");
    }

    #[test]
    fn rename_plus_content_change_is_one_entry_with_both_flags() {
        let fixture = Fixture::new();
        let (_, _, head, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            engine
                .rename_rows(
                    &draft,
                    "posts",
                    vec![RowRename { row_id: "p1".into(), next_id: "post-1".into() }],
                )
                .unwrap();
            engine
                .update_rows(
                    &draft,
                    "posts",
                    vec![RowUpdate { row_id: "p1".into(), data: json!({ "title": "Hi" }) }],
                )
                .unwrap();
        }
        let diff = fixture.diff();

        let rows = diff.row_diffs(&head, &draft, "posts", &DiffOptions::default()).unwrap();
        assert_eq!(rows.entries.len(), 1);
        let entry = &rows.entries[0];
        assert_eq!(entry.created_id, "p1");
        assert!(entry.change.renamed && entry.change.modified);

        let summary = diff.row_diff_summary(&head, &draft, "posts").unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.renamed, 1);
        assert_eq!(summary.modified, 1);
    }

    #[test]
    fn summary_counts_match_listing() {
        let fixture = Fixture::new();
        let (branch_id, _, head, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            engine.create_table(&draft, "authors", &posts_schema()).unwrap();
            engine.rename_table(&draft, "posts", "articles").unwrap();
            let _ = branch_id;
        }
        let diff = fixture.diff();

        let summary = diff.table_diff_summary(&head, &draft, false).unwrap();
        let page = diff.table_diffs(&head, &draft, &DiffOptions::default()).unwrap();

        let added = page.entries.iter().filter(|e| e.change.added).count() as i64;
        let removed = page.entries.iter().filter(|e| e.change.removed).count() as i64;
        let modified = page.entries.iter().filter(|e| e.change.modified).count() as i64;
        let renamed = page.entries.iter().filter(|e| e.change.renamed).count() as i64;
        assert_eq!(summary.added, added);
        assert_eq!(summary.removed, removed);
        assert_eq!(summary.modified, modified);
        assert_eq!(summary.renamed, renamed);
        assert!(summary.added + summary.removed + summary.modified >= page.entries.len() as i64);
        assert!(summary.total >= page.entries.len() as i64);
    }

    #[test]
    fn existence_probe_short_circuits() {
        let fixture = Fixture::new();
        let (_, _, head, draft) = committed_posts(&fixture);
        let diff = fixture.diff();

        // shared version short-circuits without querying rows
        assert!(!diff.has_row_changes(&head, &draft, "posts").unwrap());

        {
            let mut engine = fixture.engine();
            engine
                .update_rows(
                    &draft,
                    "posts",
                    vec![RowUpdate { row_id: "p1".into(), data: json!({ "title": "Hi" }) }],
                )
                .unwrap();
        }
        assert!(diff.has_row_changes(&head, &draft, "posts").unwrap());
    }

    #[test]
    fn pagination_is_stable_by_created_id() {
        let fixture = Fixture::new();
        let (_, start, _, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            let rows: Vec<NewRow> = (0..5)
                .map(|n| NewRow { id: Some(format!("r{n}")), data: json!({ "title": "x" }) })
                .collect();
            engine.create_rows(&draft, "posts", rows, false).unwrap();
        }
        let diff = fixture.diff();

        let mut seen = Vec::new();
        let mut options = DiffOptions { limit: 2, ..DiffOptions::default() };
        loop {
            let page = diff.row_diffs(&start, &draft, "posts", &options).unwrap();
            seen.extend(page.entries.iter().map(|e| e.created_id.clone()));
            match page.next_cursor {
                Some(cursor) => options.cursor = Some(cursor),
                None => break,
            }
        }
        // p1 plus r0..r4, in created_id order, no duplicates
        assert_eq!(seen, vec!["p1", "r0", "r1", "r2", "r3", "r4"]);
    }

    #[test]
    fn system_tables_hidden_unless_requested() {
        let fixture = Fixture::new();
        let (_, start, _, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            engine.create_system_table(&draft, "__meta", &posts_schema()).unwrap();
        }
        let diff = fixture.diff();

        let hidden = diff.table_diffs(&start, &draft, &DiffOptions::default()).unwrap();
        assert!(hidden.entries.iter().all(|e| {
            e.to.as_ref().map(|s| !s.id.starts_with("__")).unwrap_or(true)
        }));

        let options = DiffOptions { include_system: true, ..DiffOptions::default() };
        let shown = diff.table_diffs(&start, &draft, &options).unwrap();
        assert!(shown
            .entries
            .iter()
            .any(|e| e.to.as_ref().map(|s| s.id == "__meta").unwrap_or(false)));

        let summary_hidden = diff.table_diff_summary(&start, &draft, false).unwrap();
        let summary_shown = diff.table_diff_summary(&start, &draft, true).unwrap();
        assert_eq!(summary_shown.total, summary_hidden.total + 1);
    }

    #[test]
    fn diffing_unknown_revision_is_not_found() {
        let fixture = Fixture::new();
        let (_, start, _, _) = committed_posts(&fixture);
        let diff = fixture.diff();
        assert!(matches!(
            diff.table_diff_summary(&start, "ghost", false),
            Err(ForkDbError::NotFound { .. })
        ));
        assert!(matches!(
            diff.row_diffs(&start, &start, "ghost-table", &DiffOptions::default()),
            Err(ForkDbError::NotFound { .. })
        ));
    }

    #[test]
    fn rename_matches_by_created_id_against_third_revision() {
        let fixture = Fixture::new();
        let (branch_id, start, head, draft) = committed_posts(&fixture);
        {
            let mut engine = fixture.engine();
            engine.rename_table(&draft, "posts", "articles").unwrap();
            engine.commit(&branch_id, None).unwrap();
        }
        let diff = fixture.diff();

        // against an unrelated revision the table still pairs by created_id
        let summary = diff.table_diff_summary(&start, &draft, false).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.added, 1);

        // and between the pre- and post-rename revisions it is a rename
        let page = diff.table_diffs(&head, &draft, &DiffOptions::default()).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.entries[0].change.renamed);
        // row sets pair across the rename through the renamed table ref
        let rows = diff.row_diffs(&head, &draft, "articles", &DiffOptions::default()).unwrap();
        assert!(rows.entries.is_empty());
    }
}
