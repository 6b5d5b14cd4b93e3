use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Record database configuration.
///
/// The database holds the records the retention job purges.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DatabaseConfig {
    /// No database. Runs purge an empty in-memory store, which is only
    /// useful for trying out a schedule.
    #[default]
    None,

    /// SQLite database.
    #[cfg(feature = "database-sqlite")]
    Sqlite(SqliteConfig),
}

impl DatabaseConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, DatabaseConfig::None)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DatabaseConfig::None => Ok(()),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(c) => c.validate(),
        }
    }
}

/// SQLite configuration.
#[cfg(feature = "database-sqlite")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    /// Use `:memory:` for an in-memory database (testing only).
    pub path: String,

    /// Create the database file if it doesn't exist.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    /// Enable WAL mode for better concurrency.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_sqlite_max_connections")]
    pub max_connections: u32,

    /// Table holding the purgeable records.
    #[serde(default)]
    pub table: RecordTableConfig,
}

#[cfg(feature = "database-sqlite")]
impl SqliteConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.path.is_empty() {
            return Err(ConfigError::Validation(
                "SQLite path cannot be empty".into(),
            ));
        }
        self.table.validate()
    }
}

/// Names of the table and columns the SQLite record store reads.
///
/// Both timestamp columns hold epoch milliseconds. Rows whose
/// `deleted_at_column` is non-zero are already soft-deleted and never selected.
#[cfg(feature = "database-sqlite")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordTableConfig {
    #[serde(default = "default_table_name")]
    pub name: String,

    #[serde(default = "default_id_column")]
    pub id_column: String,

    #[serde(default = "default_owner_column")]
    pub owner_column: String,

    #[serde(default = "default_updated_at_column")]
    pub updated_at_column: String,

    #[serde(default = "default_deleted_at_column")]
    pub deleted_at_column: String,
}

#[cfg(feature = "database-sqlite")]
impl Default for RecordTableConfig {
    fn default() -> Self {
        Self {
            name: default_table_name(),
            id_column: default_id_column(),
            owner_column: default_owner_column(),
            updated_at_column: default_updated_at_column(),
            deleted_at_column: default_deleted_at_column(),
        }
    }
}

#[cfg(feature = "database-sqlite")]
impl RecordTableConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // Names are interpolated into SQL, so only plain identifiers pass.
        for (field, value) in [
            ("name", &self.name),
            ("id_column", &self.id_column),
            ("owner_column", &self.owner_column),
            ("updated_at_column", &self.updated_at_column),
            ("deleted_at_column", &self.deleted_at_column),
        ] {
            if !is_identifier(value) {
                return Err(ConfigError::Validation(format!(
                    "database.table.{field} '{value}' is not a valid SQL identifier"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(feature = "database-sqlite")]
fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(feature = "database-sqlite")]
fn default_true() -> bool {
    true
}

#[cfg(feature = "database-sqlite")]
fn default_busy_timeout() -> u64 {
    5000 // 5 seconds
}

#[cfg(feature = "database-sqlite")]
fn default_sqlite_max_connections() -> u32 {
    5
}

#[cfg(feature = "database-sqlite")]
fn default_table_name() -> String {
    "records".to_string()
}

#[cfg(feature = "database-sqlite")]
fn default_id_column() -> String {
    "id".to_string()
}

#[cfg(feature = "database-sqlite")]
fn default_owner_column() -> String {
    "owner_id".to_string()
}

#[cfg(feature = "database-sqlite")]
fn default_updated_at_column() -> String {
    "update_at".to_string()
}

#[cfg(feature = "database-sqlite")]
fn default_deleted_at_column() -> String {
    "delete_at".to_string()
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sqlite_defaults() {
        let config: DatabaseConfig = toml::from_str(
            r#"
            type = "sqlite"
            path = "records.db"
        "#,
        )
        .unwrap();
        let DatabaseConfig::Sqlite(sqlite) = config else {
            panic!("expected sqlite config");
        };
        assert_eq!(sqlite.table.name, "records");
        assert_eq!(sqlite.table.updated_at_column, "update_at");
        assert!(sqlite.wal_mode);
    }

    #[test]
    fn test_rejects_non_identifier_column() {
        let config: DatabaseConfig = toml::from_str(
            r#"
            type = "sqlite"
            path = "records.db"

            [table]
            name = "records; DROP TABLE x"
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
