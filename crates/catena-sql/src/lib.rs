//! # catena-sql
//!
//! The Catena SQL dialect: lexer, AST, parser, canonical rendering, and
//! the fold visitor used to rewrite statements before execution.
//!
//! The dialect is deliberately restricted. Every statement a peer accepts
//! is re-executed on every node, so the language admits only constructs
//! whose evaluation is deterministic: no clock, no randomness, no
//! environment. The two client-side macros (`version()`, `uuid()`) are
//! resolved by the frontend rewriter *before* a transaction is signed and
//! never reach the chain as calls.
//!
//! ## Modules
//!
//! - [`token`] — hand-written lexer
//! - [`ast`] — statement and expression trees
//! - [`parser`] — recursive descent with a hard nesting bound
//! - [`render`] — canonical reserialization behind a [`render::Dialect`]
//! - [`fold`] — rebuild-style visitor with rewrite interception points
//! - [`privilege`] — static privilege declaration per statement
//! - [`template`] — template text and template hash of a statement

pub mod ast;
pub mod fold;
pub mod parser;
pub mod privilege;
pub mod render;
pub mod template;
pub mod token;

pub use ast::{Expression, Literal, Statement};
pub use parser::parse_statement;
pub use privilege::{Privilege, PrivilegeKind};
pub use render::{render_statement, Dialect, SqliteDialect, StandardDialect};

/// Maximum combined nesting depth of subexpressions and sub-statements.
pub const MAX_DEPTH: usize = 10;

/// Error types for SQL processing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SqlError {
    /// Syntax error while lexing or parsing.
    #[error("parse error: {0}")]
    Parse(String),

    /// Statement exceeds the [`MAX_DEPTH`] nesting bound.
    #[error("nesting exceeds {MAX_DEPTH} levels")]
    NestingTooDeep,

    /// An unbound parameter survived to a point where a value was required.
    #[error("unbound parameter: ?{0}")]
    UnboundParameter(String),

    /// The same parameter name was bound to two different values.
    #[error("inconsistent parameter: ?{0}")]
    InconsistentParameter(String),

    /// A `$variable` is not defined in the execution context.
    #[error("unknown variable: ${0}")]
    UnknownVariable(String),

    /// A function call is not on the deterministic whitelist.
    #[error("function not allowed: {0}")]
    ForbiddenFunction(String),

    /// A node cannot be rendered in the requested dialect.
    #[error("cannot render {0} in this dialect")]
    Render(String),
}

pub type Result<T> = std::result::Result<T, SqlError>;
