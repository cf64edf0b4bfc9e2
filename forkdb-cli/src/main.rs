use clap::{Parser, Subcommand, ValueEnum};
use forkdb::{DiffOptions, NewRow, RowUpdate, Store};
use std::path::PathBuf;
use std::process;

/// ForkDB CLI — inspect and mutate a ForkDB store from the command line
#[derive(Parser)]
#[command(name = "forkdb", version, about)]
struct Cli {
    /// Path to the store directory (default: current directory)
    #[arg(long, default_value = ".")]
    store_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create a project with its root branch and draft
    CreateProject {
        /// Project name
        name: String,
    },

    /// List projects
    Projects,

    /// List a project's branches
    Branches {
        /// Project name
        project: String,
    },

    /// Fork a branch from another branch's head
    CreateBranch {
        /// Project name
        project: String,
        /// Source branch name
        from_branch: String,
        /// New branch name
        name: String,
    },

    /// Show a branch's revision history
    Log {
        /// Project name
        project: String,
        /// Branch name
        branch: String,
    },

    /// Create a table in the branch's draft
    CreateTable {
        project: String,
        branch: String,
        /// Table id
        table: String,
        /// JSON Schema document (inline JSON)
        schema: String,
    },

    /// Rename a table in the branch's draft
    RenameTable {
        project: String,
        branch: String,
        table: String,
        next_id: String,
    },

    /// Remove a table from the branch's draft
    RemoveTable {
        project: String,
        branch: String,
        table: String,
    },

    /// List tables in the branch's draft
    Tables {
        project: String,
        branch: String,
    },

    /// List rows of a table in the branch's draft
    Rows {
        project: String,
        branch: String,
        table: String,
    },

    /// Insert a row into the branch's draft
    Insert {
        project: String,
        branch: String,
        table: String,
        /// Row data (inline JSON)
        data: String,
        /// Row id (autogenerated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Skip foreign-key existence checks
        #[arg(long)]
        skip_reference_check: bool,
    },

    /// Replace a row's data in the branch's draft
    Update {
        project: String,
        branch: String,
        table: String,
        id: String,
        /// Row data (inline JSON)
        data: String,
    },

    /// Remove rows from the branch's draft
    Remove {
        project: String,
        branch: String,
        table: String,
        ids: Vec<String>,
    },

    /// Commit the branch's draft
    Commit {
        project: String,
        branch: String,
        /// Commit comment
        #[arg(long)]
        comment: Option<String>,
    },

    /// Discard draft changes, resetting to the head
    Revert {
        project: String,
        branch: String,
    },

    /// Diff two revisions (tables, or one table's rows)
    Diff {
        /// From revision id
        from: String,
        /// To revision id
        to: String,
        /// Diff one table's rows instead of the table set
        #[arg(long)]
        table: Option<String>,
        /// Counts only
        #[arg(long)]
        summary: bool,
        /// Include reserved system tables
        #[arg(long)]
        include_system: bool,
    },

    /// Show a table's migration log
    Migrations {
        project: String,
        branch: String,
        table: String,
    },

    /// Drop table/row versions no revision references
    Sweep,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = Store::open(&cli.store_dir)?;

    match cli.command {
        Command::CreateProject { name } => {
            let project = store.unit_of_work(|engine| engine.create_project(&name))?;
            print_output(&serde_json::to_value(&project)?, &cli.format);
        }

        Command::Projects => {
            let projects = store.list_projects()?;
            print_output(&serde_json::to_value(&projects)?, &cli.format);
        }

        Command::Branches { project } => {
            let project = store.project(&project)?;
            let branches = store.list_branches(&project.id)?;
            print_output(&serde_json::to_value(&branches)?, &cli.format);
        }

        Command::CreateBranch { project, from_branch, name } => {
            let project = store.project(&project)?;
            let source = resolve_branch(&store, &project.id, &from_branch)?;
            let head = store
                .resolve_head(&source.id)?
                .ok_or("source branch has no head revision to fork from")?;
            let branch =
                store.unit_of_work(|engine| engine.create_branch(&project.id, &name, &head.id))?;
            print_output(&serde_json::to_value(&branch)?, &cli.format);
        }

        Command::Log { project, branch } => {
            let branch = find_branch(&store, &project, &branch)?;
            let revisions = store.list_revisions(&branch.id)?;
            print_output(&serde_json::to_value(&revisions)?, &cli.format);
        }

        Command::CreateTable { project, branch, table, schema } => {
            let draft = draft_of(&store, &project, &branch)?;
            let schema: serde_json::Value = serde_json::from_str(&schema)?;
            let write =
                store.unit_of_work(|engine| engine.create_table(&draft, &table, &schema))?;
            print_output(&serde_json::to_value(&write.table)?, &cli.format);
        }

        Command::RenameTable { project, branch, table, next_id } => {
            let draft = draft_of(&store, &project, &branch)?;
            let write =
                store.unit_of_work(|engine| engine.rename_table(&draft, &table, &next_id))?;
            print_output(&serde_json::to_value(&write.table)?, &cli.format);
        }

        Command::RemoveTable { project, branch, table } => {
            let draft = draft_of(&store, &project, &branch)?;
            let write =
                store.unit_of_work(|engine| engine.remove_table(&draft, &table, false))?;
            print_output(
                &serde_json::json!({ "removed": write.table.id, "version_id": write.table.version_id }),
                &cli.format,
            );
        }

        Command::Tables { project, branch } => {
            let draft = draft_of(&store, &project, &branch)?;
            let tables = store.tables(&draft)?;
            print_output(&serde_json::to_value(&tables)?, &cli.format);
        }

        Command::Rows { project, branch, table } => {
            let draft = draft_of(&store, &project, &branch)?;
            let rows = store.rows(&draft, &table)?;
            print_output(&serde_json::to_value(&rows)?, &cli.format);
        }

        Command::Insert { project, branch, table, data, id, skip_reference_check } => {
            let draft = draft_of(&store, &project, &branch)?;
            let data: serde_json::Value = serde_json::from_str(&data)?;
            let batch = store.unit_of_work(|engine| {
                engine.create_rows(
                    &draft,
                    &table,
                    vec![NewRow { id, data }],
                    skip_reference_check,
                )
            })?;
            let row = &batch.rows[0];
            print_output(
                &serde_json::json!({
                    "row": row.row,
                    "warnings": row.warnings,
                    "table_version_id": batch.table.table.version_id,
                    "previous_table_version_id": batch.table.previous_version_id,
                }),
                &cli.format,
            );
        }

        Command::Update { project, branch, table, id, data } => {
            let draft = draft_of(&store, &project, &branch)?;
            let data: serde_json::Value = serde_json::from_str(&data)?;
            let batch = store.unit_of_work(|engine| {
                engine.update_rows(&draft, &table, vec![RowUpdate { row_id: id, data }])
            })?;
            let row = &batch.rows[0];
            print_output(
                &serde_json::json!({
                    "row": row.row,
                    "previous_version_id": row.previous_version_id,
                    "table_version_id": batch.table.table.version_id,
                }),
                &cli.format,
            );
        }

        Command::Remove { project, branch, table, ids } => {
            let draft = draft_of(&store, &project, &branch)?;
            let write = store.unit_of_work(|engine| engine.remove_rows(&draft, &table, &ids))?;
            print_output(
                &serde_json::json!({ "ok": true, "table_version_id": write.table.version_id }),
                &cli.format,
            );
        }

        Command::Commit { project, branch, comment } => {
            let found = find_branch(&store, &project, &branch)?;
            let outcome =
                store.unit_of_work(|engine| engine.commit(&found.id, comment.as_deref()))?;
            print_output(
                &serde_json::json!({
                    "previous_head_id": outcome.previous_head_id,
                    "previous_draft_id": outcome.previous_draft_id,
                    "new_draft_id": outcome.new_draft_id,
                }),
                &cli.format,
            );
        }

        Command::Revert { project, branch } => {
            let found = find_branch(&store, &project, &branch)?;
            store.unit_of_work(|engine| engine.revert(&found.id))?;
            print_output(&serde_json::json!({ "ok": true }), &cli.format);
        }

        Command::Diff { from, to, table, summary, include_system } => {
            let diff = store.diff();
            let value = match (table, summary) {
                (Some(table), true) => {
                    serde_json::to_value(diff.row_diff_summary(&from, &to, &table)?)?
                }
                (Some(table), false) => {
                    let options = DiffOptions { include_system, ..DiffOptions::default() };
                    serde_json::to_value(diff.row_diffs(&from, &to, &table, &options)?)?
                }
                (None, true) => {
                    serde_json::to_value(diff.table_diff_summary(&from, &to, include_system)?)?
                }
                (None, false) => {
                    let options = DiffOptions { include_system, ..DiffOptions::default() };
                    serde_json::to_value(diff.table_diffs(&from, &to, &options)?)?
                }
            };
            print_output(&value, &cli.format);
        }

        Command::Migrations { project, branch, table } => {
            let draft = draft_of(&store, &project, &branch)?;
            let log = store.migration_log(&draft, &table)?;
            let described: Vec<_> = log
                .iter()
                .map(|m| serde_json::json!({ "kind": m.kind(), "description": m.describe() }))
                .collect();
            print_output(&serde_json::Value::Array(described), &cli.format);
        }

        Command::Sweep => {
            let (tables, rows) = store.sweep_orphans()?;
            print_output(
                &serde_json::json!({ "tables_swept": tables, "rows_swept": rows }),
                &cli.format,
            );
        }
    }

    Ok(())
}

fn find_branch(
    store: &Store,
    project_name: &str,
    branch_name: &str,
) -> Result<forkdb::Branch, Box<dyn std::error::Error>> {
    let project = store.project(project_name)?;
    resolve_branch(store, &project.id, branch_name)
}

fn resolve_branch(
    store: &Store,
    project_id: &str,
    branch_name: &str,
) -> Result<forkdb::Branch, Box<dyn std::error::Error>> {
    store
        .list_branches(project_id)?
        .into_iter()
        .find(|b| b.name == branch_name)
        .ok_or_else(|| format!("Branch '{branch_name}' not found").into())
}

fn draft_of(
    store: &Store,
    project_name: &str,
    branch_name: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let branch = find_branch(store, project_name, branch_name)?;
    Ok(store.resolve_draft(&branch.id)?.id)
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value).unwrap());
        }
    }
}
