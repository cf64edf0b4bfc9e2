pub mod config;
pub mod db;
pub mod diff;
pub mod draft;
pub mod error;
pub mod graph;
pub mod ident;
pub mod migration;
pub mod notify;
pub mod plugin;
pub mod schema;
pub mod store;
pub mod validation;

mod util;

pub use config::StoreConfig;
pub use diff::{DiffEngine, DiffOptions, DiffPage, DiffSummary};
pub use draft::{DraftEngine, NewRow, RowPatch, RowRename, RowUpdate};
pub use error::{ForkDbError, Result};
pub use graph::{Branch, Project, Revision, RowRecord, TableRecord};
pub use notify::CommitNotifier;
pub use plugin::{AutoIdStrategy, PluginSet, RowPlugin};
pub use schema::{SchemaRefs, SchemaTree, ValueTree};
pub use store::Store;
