//! Statement and expression trees for the Catena SQL dialect.
//!
//! Identifiers are stored lowercased. Column definitions and `SET`
//! assignments are ordered vectors of pairs so that canonical rendering
//! is deterministic.

use catena_crypto::Hash;

use crate::privilege::PrivilegeKind;

/// Column types of the dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Text,
    Int,
    Blob,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Text => f.write_str("TEXT"),
            DataType::Int => f.write_str("INT"),
            DataType::Blob => f.write_str("BLOB"),
        }
    }
}

/// A literal value.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOperator {
    /// Prefix `-`.
    Negate,
    /// Prefix `NOT`.
    Not,
    /// Postfix `IS NULL`.
    IsNull,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
    Concat,
}

/// An expression node.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Literal(Literal),
    /// Reference to a column of the current table context.
    Column(String),
    /// `*` in a select column list.
    AllColumns,
    /// `$name`, substituted from the execution context at apply time.
    Variable(String),
    /// `?name` awaiting a value.
    UnboundParameter(String),
    /// `?name:value`.
    BoundParameter(String, Literal),
    Unary {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Function call. Only whitelisted functions survive the backend
    /// rewrite; frontend macros are resolved before signing.
    Call {
        function: String,
        arguments: Vec<Expression>,
    },
    /// `CASE WHEN e THEN e … [ELSE e] END`.
    Case {
        branches: Vec<(Expression, Expression)>,
        otherwise: Option<Box<Expression>>,
    },
    /// `EXISTS (select)`.
    Exists(Box<Select>),
}

/// `LEFT JOIN t ON e`.
#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    pub table: String,
    pub on: Expression,
}

/// Sort direction in `ORDER BY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// A `SELECT` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<Expression>,
    pub from: Option<String>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expression>,
    pub order_by: Vec<(Expression, OrderDirection)>,
    pub limit: Option<u64>,
}

/// An `INSERT` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub or_replace: bool,
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Expression>>,
}

/// An `UPDATE` statement. Assignments preserve source order.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Expression)>,
    pub where_clause: Option<Expression>,
}

/// A `DELETE` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub table: String,
    pub where_clause: Option<Expression>,
}

/// One column of a `CREATE TABLE`.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub primary_key: bool,
}

/// A `CREATE TABLE` statement. Column order is preserved.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateTable {
    pub table: String,
    pub columns: Vec<ColumnDefinition>,
}

/// The object of a `SHOW`.
#[derive(Clone, Debug, PartialEq)]
pub enum Show {
    Tables,
    Databases { for_user: Option<Hash> },
    Grants,
    All,
}

/// The privilege clause of a `GRANT`/`REVOKE`.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivilegeSpec {
    pub kind: PrivilegeKind,
    pub table: Option<String>,
}

/// A parsed statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    CreateTable(CreateTable),
    DropTable {
        table: String,
    },
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
    },
    CreateDatabase {
        database: String,
    },
    DropDatabase {
        database: String,
    },
    Show(Show),
    Describe {
        table: String,
    },
    Grant {
        privilege: PrivilegeSpec,
        /// `None` means `TO NULL`: anyone.
        user: Option<Hash>,
    },
    Revoke {
        privilege: PrivilegeSpec,
        user: Option<Hash>,
    },
    If {
        branches: Vec<(Expression, Statement)>,
        otherwise: Option<Box<Statement>>,
    },
    Block(Vec<Statement>),
    Fail,
}

impl Statement {
    /// Whether executing this statement can change state. Reads
    /// (`SELECT`, `SHOW`, `DESCRIBE`) are the only non-mutating
    /// statements.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Statement::Select(_) | Statement::Show(_) | Statement::Describe { .. }
        )
    }

    /// Whether this statement only makes sense inside a database scope.
    pub fn requires_database(&self) -> bool {
        match self {
            Statement::Select(select) => select.from.is_some(),
            Statement::Insert(_)
            | Statement::Update(_)
            | Statement::Delete(_)
            | Statement::CreateTable(_)
            | Statement::DropTable { .. }
            | Statement::CreateIndex { .. }
            | Statement::Describe { .. }
            | Statement::Grant { .. }
            | Statement::Revoke { .. } => true,
            Statement::Show(show) => matches!(show, Show::Tables | Show::Grants),
            Statement::CreateDatabase { .. } | Statement::DropDatabase { .. } => false,
            Statement::If {
                branches,
                otherwise,
            } => {
                branches.iter().any(|(_, s)| s.requires_database())
                    || otherwise.as_deref().is_some_and(|s| s.requires_database())
            }
            Statement::Block(statements) => statements.iter().any(|s| s.requires_database()),
            Statement::Fail => false,
        }
    }
}
