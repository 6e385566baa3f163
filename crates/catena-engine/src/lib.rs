//! # catena-engine
//!
//! The SQL executive: the component that decides whether a signed
//! statement may run, rewrites it into backend form, and dispatches it
//! against the relational backend.
//!
//! ## Modules
//!
//! - [`metadata`] — the five reserved tables (`grants`, `users`,
//!   `databases`, `blocks`, `info`) the core manages inside the backend
//! - [`grants`] — dynamic privilege lookup against the grants table
//! - [`context`] — execution context: database scope, invoker, block
//! - [`rewrite`] — frontend-to-backend statement rewriting
//! - [`verify`] — static verification of rewritten statements
//! - [`executive`] — authorization and dispatch

pub mod context;
pub mod executive;
pub mod grants;
pub mod metadata;
pub mod rewrite;
pub mod verify;

pub use context::{BlockContext, Context};
pub use executive::Executive;
pub use metadata::Metadata;

use catena_db::DbError;
use catena_sql::SqlError;

/// Error types for statement execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    Db(#[from] DbError),

    /// Authorization failed.
    #[error("privilege required")]
    PrivilegeRequired,

    /// A database-scoped statement ran without a database context.
    #[error("statement requires a database context")]
    RequiresDatabaseContext,

    /// A `FAIL` statement ran, or no `IF` branch matched.
    #[error("execution failed")]
    ExecutionFailed,

    #[error("table does not exist: {0}")]
    TableDoesNotExist(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("column does not exist: {0}")]
    ColumnDoesNotExist(String),

    #[error("database does not exist: {0}")]
    DatabaseDoesNotExist(String),

    #[error("database already exists: {0}")]
    DatabaseAlreadyExists(String),

    /// A database still holds tables and cannot be dropped.
    #[error("database not empty: {0}")]
    DatabaseNotEmpty(String),

    /// Duplicate column names in an insert list or table definition.
    #[error("inconsistent columns: {0}")]
    InconsistentColumns(String),

    /// The head pointer or another metadata invariant is corrupt.
    #[error("metadata error: {0}")]
    Metadata(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
