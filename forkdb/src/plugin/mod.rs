// Computed-field extension points. Plugins run in the fixed order of an
// explicit list handed to the store at construction; they may mutate a
// row's value tree before it is persisted, and report recoverable
// problems as warnings attached to the row rather than failing the
// owning mutation.

use crate::schema::{SchemaTree, ValueTree};
use serde::{Deserialize, Serialize};

/// A row travelling through the mutation pipeline: the caller-supplied
/// id (absent until assigned) and the value tree plugins may rewrite.
#[derive(Debug, Clone)]
pub struct DraftRow {
    pub id: Option<String>,
    pub tree: ValueTree,
}

/// A recoverable plugin problem, reported alongside the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginWarning {
    pub plugin: String,
    pub message: String,
}

#[allow(unused_variables)]
pub trait RowPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per row before a new row version is persisted.
    fn create_row(&self, schema: &SchemaTree, row: &mut DraftRow) -> Vec<PluginWarning> {
        Vec::new()
    }

    /// Called once per row before an updated row version is persisted.
    fn update_row(&self, schema: &SchemaTree, row: &mut DraftRow) -> Vec<PluginWarning> {
        Vec::new()
    }

    /// Batch recomputation over a table's draft rows.
    fn compute_rows(&self, schema: &SchemaTree, rows: &mut [DraftRow]) -> Vec<PluginWarning> {
        Vec::new()
    }

    /// Called when a table's schema changes, with the rows bound to the
    /// new schema.
    fn migrate_rows(&self, schema: &SchemaTree, rows: &mut [DraftRow]) -> Vec<PluginWarning> {
        Vec::new()
    }
}

/// The ordered plugin list. Order is fixed at construction.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn RowPlugin>>,
}

impl PluginSet {
    pub fn new(plugins: Vec<Box<dyn RowPlugin>>) -> Self {
        PluginSet { plugins }
    }

    pub fn push(&mut self, plugin: Box<dyn RowPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn run_create(&self, schema: &SchemaTree, row: &mut DraftRow) -> Vec<PluginWarning> {
        self.plugins.iter().flat_map(|p| p.create_row(schema, row)).collect()
    }

    pub fn run_update(&self, schema: &SchemaTree, row: &mut DraftRow) -> Vec<PluginWarning> {
        self.plugins.iter().flat_map(|p| p.update_row(schema, row)).collect()
    }

    pub fn run_compute(&self, schema: &SchemaTree, rows: &mut [DraftRow]) -> Vec<PluginWarning> {
        self.plugins.iter().flat_map(|p| p.compute_rows(schema, rows)).collect()
    }

    pub fn run_migrate(&self, schema: &SchemaTree, rows: &mut [DraftRow]) -> Vec<PluginWarning> {
        self.plugins.iter().flat_map(|p| p.migrate_rows(schema, rows)).collect()
    }
}

/// Id generation strategy for rows created without an explicit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    Ulid,
    Uuid,
    Nanoid,
}

/// Alphabet chosen so generated ids always satisfy row-id rules
/// (no leading '-').
const NANOID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Assigns ids to rows created without one.
pub struct AutoIdPlugin {
    strategy: AutoIdStrategy,
}

impl AutoIdPlugin {
    pub fn new(strategy: AutoIdStrategy) -> Self {
        AutoIdPlugin { strategy }
    }

    fn generate(&self) -> String {
        match self.strategy {
            AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            AutoIdStrategy::Nanoid => nanoid::nanoid!(21, &NANOID_ALPHABET),
        }
    }
}

impl RowPlugin for AutoIdPlugin {
    fn name(&self) -> &'static str {
        "auto-id"
    }

    fn create_row(&self, _schema: &SchemaTree, row: &mut DraftRow) -> Vec<PluginWarning> {
        if row.id.as_deref().map_or(true, str::is_empty) {
            let id = self.generate();
            row.tree.row_id = id.clone();
            row.id = Some(id);
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::validate_row_id;
    use crate::schema::SchemaRefs;
    use serde_json::json;

    fn schema() -> SchemaTree {
        SchemaTree::build(
            &json!({ "type": "object", "properties": { "title": { "type": "string" } } }),
            &SchemaRefs::standard(),
        )
        .unwrap()
    }

    fn draft_row(id: Option<&str>) -> DraftRow {
        let schema = schema();
        DraftRow {
            id: id.map(String::from),
            tree: ValueTree::build(&schema, id.unwrap_or(""), &json!({ "title": "x" })).unwrap(),
        }
    }

    #[test]
    fn assigns_missing_ids_only() {
        let schema = schema();
        let plugins = PluginSet::new(vec![Box::new(AutoIdPlugin::new(AutoIdStrategy::Ulid))]);

        let mut row = draft_row(None);
        let warnings = plugins.run_create(&schema, &mut row);
        assert!(warnings.is_empty());
        let id = row.id.clone().unwrap();
        assert!(validate_row_id(&id).is_ok());
        assert_eq!(row.tree.row_id, id);

        let mut named = draft_row(Some("p1"));
        plugins.run_create(&schema, &mut named);
        assert_eq!(named.id.as_deref(), Some("p1"));
    }

    #[test]
    fn every_strategy_yields_valid_row_ids() {
        for strategy in [AutoIdStrategy::Ulid, AutoIdStrategy::Uuid, AutoIdStrategy::Nanoid] {
            let plugin = AutoIdPlugin::new(strategy);
            let id = plugin.generate();
            assert!(validate_row_id(&id).is_ok(), "{strategy:?}: {id}");
        }
    }

    #[test]
    fn plugins_run_in_list_order() {
        struct Stamp(&'static str);
        impl RowPlugin for Stamp {
            fn name(&self) -> &'static str {
                self.0
            }
            fn create_row(&self, _s: &SchemaTree, row: &mut DraftRow) -> Vec<PluginWarning> {
                let mut id = row.id.take().unwrap_or_default();
                id.push_str(self.0);
                row.id = Some(id);
                vec![PluginWarning { plugin: self.0.into(), message: "ran".into() }]
            }
        }

        let schema = schema();
        let plugins = PluginSet::new(vec![Box::new(Stamp("a")), Box::new(Stamp("b"))]);
        let mut row = draft_row(Some(""));
        let warnings = plugins.run_create(&schema, &mut row);
        assert_eq!(row.id.as_deref(), Some("ab"));
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].plugin, "a");
    }
}
