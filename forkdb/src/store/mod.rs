use crate::config::StoreConfig;
use crate::db::VersionDb;
use crate::diff::DiffEngine;
use crate::draft::DraftEngine;
use crate::error::{ForkDbError, Result};
use crate::graph::{self, Branch, Project, Revision, RowRecord, TableRecord};
use crate::migration::Migration;
use crate::notify::CommitNotifier;
use crate::plugin::{AutoIdPlugin, PluginSet, RowPlugin};
use crate::schema::SchemaRefs;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// The main entry point for ForkDB. Opens the SQLite database, loads
/// the optional `forkdb.yaml` config, and hands out read access plus
/// scoped units of work for mutations.
pub struct Store {
    conn: Connection,
    config: StoreConfig,
    plugins: PluginSet,
    refs: SchemaRefs,
    notifier: Option<Box<dyn CommitNotifier>>,
}

impl Store {
    /// Open a store directory, creating it (and the database) on first
    /// use.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let config = StoreConfig::load(dir)?;
        let conn = Connection::open(dir.join(&config.database_file))?;
        Store::from_connection(conn, config)
    }

    /// In-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Store::from_connection(Connection::open_in_memory()?, StoreConfig::default())
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        VersionDb::initialize(&conn)?;

        let plugins =
            PluginSet::new(vec![Box::new(AutoIdPlugin::new(config.auto_id)) as Box<dyn RowPlugin>]);
        Ok(Store { conn, config, plugins, refs: SchemaRefs::standard(), notifier: None })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Replace the ordered plugin list. The default list carries the
    /// row-id plugin configured by `auto_id`.
    pub fn set_plugins(&mut self, plugins: PluginSet) {
        self.plugins = plugins;
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn RowPlugin>) {
        self.plugins.push(plugin);
    }

    /// Inject the commit notification hook.
    pub fn set_notifier(&mut self, notifier: Box<dyn CommitNotifier>) {
        self.notifier = Some(notifier);
    }

    pub fn set_schema_refs(&mut self, refs: SchemaRefs) {
        self.refs = refs;
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn db(&self) -> VersionDb<'_> {
        VersionDb::new(&self.conn)
    }

    /// The read-only diff engine over this store.
    pub fn diff(&self) -> DiffEngine<'_> {
        DiffEngine::new(self.db())
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.db().list_projects()
    }

    pub fn project(&self, name: &str) -> Result<Project> {
        self.db()
            .get_project_by_name(name)?
            .ok_or_else(|| ForkDbError::not_found("Project", name))
    }

    pub fn list_branches(&self, project_id: &str) -> Result<Vec<Branch>> {
        self.db().list_branches(project_id)
    }

    pub fn branch(&self, branch_id: &str) -> Result<Branch> {
        self.db()
            .get_branch(branch_id)?
            .ok_or_else(|| ForkDbError::not_found("Branch", branch_id))
    }

    pub fn list_revisions(&self, branch_id: &str) -> Result<Vec<Revision>> {
        self.db().list_revisions(branch_id)
    }

    pub fn resolve_draft(&self, branch_id: &str) -> Result<Revision> {
        graph::resolve_draft(&self.db(), branch_id)
    }

    pub fn resolve_head(&self, branch_id: &str) -> Result<Option<Revision>> {
        graph::resolve_head(&self.db(), branch_id)
    }

    pub fn resolve_start(&self, branch_id: &str) -> Result<Revision> {
        graph::resolve_start(&self.db(), branch_id)
    }

    pub fn tables(&self, revision_id: &str) -> Result<Vec<TableRecord>> {
        self.db().tables_in_revision(revision_id)
    }

    pub fn rows(&self, revision_id: &str, table_ref: &str) -> Result<Vec<RowRecord>> {
        let db = self.db();
        let table = graph::find_table_or_throw(&db, revision_id, table_ref)?;
        db.rows_in_table(&table.version_id)
    }

    /// The table's full migration log, oldest first.
    pub fn migration_log(&self, revision_id: &str, table_ref: &str) -> Result<Vec<Migration>> {
        let db = self.db();
        let table = graph::find_table_or_throw(&db, revision_id, table_ref)?;
        db.migrations_for(&table.created_id)
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Run a logical mutation inside one IMMEDIATE transaction. The
    /// closure gets the only way to construct draft operations, so core
    /// calls can never run outside an active transaction. On `Ok` the
    /// transaction commits and the notifier hears about every revision
    /// committed inside; on `Err` everything rolls back.
    pub fn unit_of_work<T>(
        &mut self,
        f: impl FnOnce(&mut DraftEngine) -> Result<T>,
    ) -> Result<T> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut engine = DraftEngine::new(VersionDb::new(&tx), &self.plugins, &self.refs);
        let result = f(&mut engine);
        let published = engine.into_published();

        match result {
            Ok(value) => {
                tx.commit()?;
                if let Some(notifier) = &self.notifier {
                    for revision_id in &published {
                        notifier.notify(revision_id);
                    }
                }
                Ok(value)
            }
            Err(e) => {
                // dropping the transaction rolls it back
                log::debug!("unit of work rolled back: {e}");
                Err(e)
            }
        }
    }

    /// Drop table/row versions no revision references any more. Meant
    /// to run periodically, outside the mutation path.
    pub fn sweep_orphans(&self) -> Result<(usize, usize)> {
        let swept = self.db().sweep_orphans()?;
        if swept != (0, 0) {
            log::info!("swept {} table and {} row versions", swept.0, swept.1);
        }
        Ok(swept)
    }
}
