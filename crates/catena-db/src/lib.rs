//! # catena-db
//!
//! The relational backend capability for Catena.
//!
//! The core never talks to SQLite directly; it depends on the small
//! [`Database`] trait (text SQL in, [`ResultSet`] out, plus named
//! savepoints and schema introspection). [`sqlite::SqliteDatabase`] is
//! the production implementation; chain state lives in one such file and
//! replays deterministically from the genesis block.

pub mod sqlite;
pub mod value;

pub use sqlite::SqliteDatabase;
pub use value::{ResultSet, Value};

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// One column of a table definition, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub primary_key: bool,
}

/// An ordered table definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Whether the definition contains a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

/// The backend capability the core executes against.
///
/// Statements arrive as rendered SQL text. Mutating apply operations run
/// inside nested savepoints (block-level around transaction-level), so
/// implementations must support named savepoints.
pub trait Database: Send {
    /// Run a statement that returns rows.
    fn query(&self, sql: &str) -> Result<ResultSet>;

    /// Run a statement that returns no rows; yields the affected row count.
    fn execute(&self, sql: &str) -> Result<usize>;

    /// Open a named savepoint.
    fn savepoint(&self, name: &str) -> Result<()>;

    /// Commit and close a named savepoint.
    fn release(&self, name: &str) -> Result<()>;

    /// Roll back to a named savepoint and close it.
    fn rollback_to(&self, name: &str) -> Result<()>;

    /// Whether a table exists.
    fn table_exists(&self, name: &str) -> Result<bool>;

    /// The ordered column definition of a table, if it exists.
    fn definition(&self, table: &str) -> Result<Option<TableSchema>>;

    /// All user-visible table names, sorted.
    fn all_tables(&self) -> Result<Vec<String>>;
}
