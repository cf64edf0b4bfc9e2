// Identifier rules for tables, rows and schema field names.

use crate::error::{ForkDbError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Tables whose id starts with this prefix are platform-managed and
/// hidden from diffs unless explicitly requested.
pub const SYSTEM_TABLE_PREFIX: &str = "__";

pub const MAX_IDENT_LEN: usize = 64;

fn table_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").unwrap())
}

fn row_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\w[\w-]*$").unwrap())
}

/// Whether a table id names a reserved system table.
pub fn is_system_table(table_id: &str) -> bool {
    table_id.starts_with(SYSTEM_TABLE_PREFIX)
}

/// Validate a user-facing table id: `[A-Za-z_][A-Za-z0-9_-]*`, 1-64
/// characters, and outside the reserved system prefix.
pub fn validate_table_id(table_id: &str) -> Result<()> {
    validate_table_id_format(table_id)?;
    if is_system_table(table_id) {
        return Err(ForkDbError::Validation(format!(
            "Table id '{table_id}' uses the reserved prefix '{SYSTEM_TABLE_PREFIX}'"
        )));
    }
    Ok(())
}

/// Format-only check, shared with system-table creation.
pub fn validate_table_id_format(table_id: &str) -> Result<()> {
    if table_id.is_empty() || table_id.len() > MAX_IDENT_LEN {
        return Err(ForkDbError::Validation(format!(
            "Table id '{table_id}' must be 1-{MAX_IDENT_LEN} characters"
        )));
    }
    if !table_id_re().is_match(table_id) {
        return Err(ForkDbError::Validation(format!(
            "Table id '{table_id}' must match [A-Za-z_][A-Za-z0-9_-]*"
        )));
    }
    Ok(())
}

/// Validate a row id: `\w[\w-]*`, 1-64 characters.
pub fn validate_row_id(row_id: &str) -> Result<()> {
    if row_id.is_empty() || row_id.len() > MAX_IDENT_LEN {
        return Err(ForkDbError::Validation(format!(
            "Row id '{row_id}' must be 1-{MAX_IDENT_LEN} characters"
        )));
    }
    if !row_id_re().is_match(row_id) {
        return Err(ForkDbError::Validation(format!(
            "Row id '{row_id}' must match \\w[\\w-]*"
        )));
    }
    Ok(())
}

/// Whether a schema property name is acceptable. Field names follow the
/// table-id shape and may not start with the system prefix.
pub fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENT_LEN
        && !name.starts_with(SYSTEM_TABLE_PREFIX)
        && table_id_re().is_match(name)
}

pub fn validate_field_name(name: &str) -> Result<()> {
    if is_valid_field_name(name) {
        Ok(())
    } else {
        Err(ForkDbError::Validation(format!(
            "Invalid field name '{name}': must match [A-Za-z_][A-Za-z0-9_-]*, \
             be 1-{MAX_IDENT_LEN} characters and not start with '{SYSTEM_TABLE_PREFIX}'"
        )))
    }
}
