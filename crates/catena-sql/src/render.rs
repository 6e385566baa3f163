//! Canonical reserialization of statements.
//!
//! Rendering is deterministic: identifiers are always double-quoted,
//! keywords are uppercase, `ORDER BY` directions are explicit, and
//! parentheses are emitted only where precedence demands them. Two
//! statements are template-equal exactly when their standard-dialect
//! renderings (with bound parameters unbound) are byte-identical.

use crate::ast::{
    BinaryOperator, Expression, Literal, OrderDirection, Select, Show, Statement, UnaryOperator,
};
use crate::{Result, SqlError};

/// A rendering dialect.
///
/// The standard dialect is the canonical frontend form used for signing
/// and template hashing. The SQLite dialect is what reaches the backend;
/// by the time a statement renders there, every variable and parameter
/// must already have been rewritten away.
pub trait Dialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{name}\"")
    }

    fn render_blob(&self, bytes: &[u8]) -> String {
        format!("X'{}'", hex::encode_upper(bytes))
    }

    fn render_variable(&self, name: &str) -> Result<String>;

    fn render_parameter(&self, name: &str, value: Option<&Literal>) -> Result<String>;
}

/// The canonical frontend dialect.
pub struct StandardDialect;

impl Dialect for StandardDialect {
    fn render_variable(&self, name: &str) -> Result<String> {
        Ok(format!("${name}"))
    }

    fn render_parameter(&self, name: &str, value: Option<&Literal>) -> Result<String> {
        match value {
            None => Ok(format!("?{name}")),
            Some(literal) => Ok(format!(
                "?{name}:{}",
                render_literal(literal, &StandardDialect)
            )),
        }
    }
}

/// The backend dialect. Refuses variables and parameters; those are
/// rewrite-time constructs that must not reach the database.
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn render_variable(&self, name: &str) -> Result<String> {
        Err(SqlError::Render(format!("variable ${name}")))
    }

    fn render_parameter(&self, name: &str, _value: Option<&Literal>) -> Result<String> {
        Err(SqlError::Render(format!("parameter ?{name}")))
    }
}

/// Render a statement including its terminating semicolon.
pub fn render_statement(statement: &Statement, dialect: &dyn Dialect) -> Result<String> {
    Ok(format!("{};", statement_text(statement, dialect)?))
}

fn statement_text(statement: &Statement, dialect: &dyn Dialect) -> Result<String> {
    match statement {
        Statement::Select(select) => select_text(select, dialect),
        Statement::Insert(insert) => {
            let verb = if insert.or_replace {
                "INSERT OR REPLACE INTO"
            } else {
                "INSERT INTO"
            };
            let columns = insert
                .columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            let rows = insert
                .values
                .iter()
                .map(|row| {
                    Ok(format!(
                        "({})",
                        row.iter()
                            .map(|e| expression_text(e, 0, dialect))
                            .collect::<Result<Vec<_>>>()?
                            .join(", ")
                    ))
                })
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            Ok(format!(
                "{verb} {} ({columns}) VALUES {rows}",
                dialect.quote_identifier(&insert.table)
            ))
        }
        Statement::Update(update) => {
            let assignments = update
                .assignments
                .iter()
                .map(|(column, value)| {
                    Ok(format!(
                        "{} = {}",
                        dialect.quote_identifier(column),
                        expression_text(value, 0, dialect)?
                    ))
                })
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let mut out = format!(
                "UPDATE {} SET {assignments}",
                dialect.quote_identifier(&update.table)
            );
            if let Some(e) = &update.where_clause {
                out.push_str(&format!(" WHERE {}", expression_text(e, 0, dialect)?));
            }
            Ok(out)
        }
        Statement::Delete(delete) => {
            let mut out = format!("DELETE FROM {}", dialect.quote_identifier(&delete.table));
            if let Some(e) = &delete.where_clause {
                out.push_str(&format!(" WHERE {}", expression_text(e, 0, dialect)?));
            }
            Ok(out)
        }
        Statement::CreateTable(create) => {
            let columns = create
                .columns
                .iter()
                .map(|c| {
                    let mut def =
                        format!("{} {}", dialect.quote_identifier(&c.name), c.data_type);
                    if c.primary_key {
                        def.push_str(" PRIMARY KEY");
                    }
                    def
                })
                .collect::<Vec<_>>()
                .join(", ");
            Ok(format!(
                "CREATE TABLE {} ({columns})",
                dialect.quote_identifier(&create.table)
            ))
        }
        Statement::DropTable { table } => {
            Ok(format!("DROP TABLE {}", dialect.quote_identifier(table)))
        }
        Statement::CreateIndex {
            name,
            table,
            columns,
        } => {
            let columns = columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            Ok(format!(
                "CREATE INDEX {} ON {} ({columns})",
                dialect.quote_identifier(name),
                dialect.quote_identifier(table)
            ))
        }
        Statement::CreateDatabase { database } => Ok(format!(
            "CREATE DATABASE {}",
            dialect.quote_identifier(database)
        )),
        Statement::DropDatabase { database } => Ok(format!(
            "DROP DATABASE {}",
            dialect.quote_identifier(database)
        )),
        Statement::Show(show) => Ok(match show {
            Show::Tables => "SHOW TABLES".to_string(),
            Show::Grants => "SHOW GRANTS".to_string(),
            Show::All => "SHOW ALL".to_string(),
            Show::Databases { for_user } => match for_user {
                None => "SHOW DATABASES".to_string(),
                Some(user) => format!("SHOW DATABASES FOR {}", dialect.render_blob(user.as_bytes())),
            },
        }),
        Statement::Describe { table } => {
            Ok(format!("DESCRIBE {}", dialect.quote_identifier(table)))
        }
        Statement::Grant { privilege, user } => {
            Ok(grant_text("GRANT", privilege, user, dialect))
        }
        Statement::Revoke { privilege, user } => {
            Ok(grant_text("REVOKE", privilege, user, dialect))
        }
        Statement::If {
            branches,
            otherwise,
        } => {
            let mut out = String::new();
            for (i, (condition, body)) in branches.iter().enumerate() {
                let lead = if i == 0 { "IF" } else { " ELSE IF" };
                out.push_str(&format!(
                    "{lead} {} THEN {}",
                    expression_text(condition, 0, dialect)?,
                    statement_text(body, dialect)?
                ));
            }
            if let Some(body) = otherwise {
                out.push_str(&format!(" ELSE {}", statement_text(body, dialect)?));
            }
            out.push_str(" END");
            Ok(out)
        }
        Statement::Block(statements) => {
            let mut out = String::from("DO");
            for statement in statements {
                out.push_str(&format!(" {};", statement_text(statement, dialect)?));
            }
            out.push_str(" END");
            Ok(out)
        }
        Statement::Fail => Ok("FAIL".to_string()),
    }
}

fn grant_text(
    verb: &str,
    privilege: &crate::ast::PrivilegeSpec,
    user: &Option<catena_crypto::Hash>,
    dialect: &dyn Dialect,
) -> String {
    let mut out = format!("{verb} {}", privilege.kind.render());
    if let Some(table) = &privilege.table {
        out.push_str(&format!(" ON {}", dialect.quote_identifier(table)));
    }
    match user {
        Some(hash) => out.push_str(&format!(" TO {}", dialect.render_blob(hash.as_bytes()))),
        None => out.push_str(" TO NULL"),
    }
    out
}

fn select_text(select: &Select, dialect: &dyn Dialect) -> Result<String> {
    let mut out = String::from("SELECT");
    if select.distinct {
        out.push_str(" DISTINCT");
    }
    let columns = select
        .columns
        .iter()
        .map(|e| expression_text(e, 0, dialect))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    out.push(' ');
    out.push_str(&columns);

    if let Some(from) = &select.from {
        out.push_str(&format!(" FROM {}", dialect.quote_identifier(from)));
        for join in &select.joins {
            out.push_str(&format!(
                " LEFT JOIN {} ON {}",
                dialect.quote_identifier(&join.table),
                expression_text(&join.on, 0, dialect)?
            ));
        }
    }
    if let Some(e) = &select.where_clause {
        out.push_str(&format!(" WHERE {}", expression_text(e, 0, dialect)?));
    }
    if !select.order_by.is_empty() {
        let terms = select
            .order_by
            .iter()
            .map(|(e, direction)| {
                let dir = match direction {
                    OrderDirection::Ascending => "ASC",
                    OrderDirection::Descending => "DESC",
                };
                Ok(format!("{} {dir}", expression_text(e, 0, dialect)?))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        out.push_str(&format!(" ORDER BY {terms}"));
    }
    if let Some(limit) = select.limit {
        out.push_str(&format!(" LIMIT {limit}"));
    }
    Ok(out)
}

/// Binding strength of an expression, used to decide parenthesization.
fn precedence(expression: &Expression) -> u8 {
    match expression {
        Expression::Binary { op, .. } => match op {
            BinaryOperator::Or => 1,
            BinaryOperator::And => 2,
            BinaryOperator::Equal
            | BinaryOperator::NotEqual
            | BinaryOperator::Less
            | BinaryOperator::Greater
            | BinaryOperator::LessOrEqual
            | BinaryOperator::GreaterOrEqual => 4,
            BinaryOperator::Add | BinaryOperator::Subtract | BinaryOperator::Concat => 5,
            BinaryOperator::Multiply | BinaryOperator::Divide => 6,
        },
        Expression::Unary { op, .. } => match op {
            UnaryOperator::Not => 3,
            UnaryOperator::IsNull => 4,
            UnaryOperator::Negate => 7,
        },
        _ => 8,
    }
}

fn binary_symbol(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Equal => "=",
        BinaryOperator::NotEqual => "<>",
        BinaryOperator::Less => "<",
        BinaryOperator::Greater => ">",
        BinaryOperator::LessOrEqual => "<=",
        BinaryOperator::GreaterOrEqual => ">=",
        BinaryOperator::And => "AND",
        BinaryOperator::Or => "OR",
        BinaryOperator::Add => "+",
        BinaryOperator::Subtract => "-",
        BinaryOperator::Multiply => "*",
        BinaryOperator::Divide => "/",
        BinaryOperator::Concat => "||",
    }
}

fn expression_text(
    expression: &Expression,
    parent_precedence: u8,
    dialect: &dyn Dialect,
) -> Result<String> {
    let own = precedence(expression);
    let text = match expression {
        Expression::Literal(literal) => render_literal(literal, dialect),
        Expression::Column(name) => dialect.quote_identifier(name),
        Expression::AllColumns => "*".to_string(),
        Expression::Variable(name) => dialect.render_variable(name)?,
        Expression::UnboundParameter(name) => dialect.render_parameter(name, None)?,
        Expression::BoundParameter(name, value) => {
            dialect.render_parameter(name, Some(value))?
        }
        Expression::Unary { op, expr } => match op {
            UnaryOperator::Negate => format!("-{}", expression_text(expr, own, dialect)?),
            UnaryOperator::Not => format!("NOT {}", expression_text(expr, own, dialect)?),
            UnaryOperator::IsNull => {
                format!("{} IS NULL", expression_text(expr, own + 1, dialect)?)
            }
        },
        Expression::Binary { op, left, right } => {
            format!(
                "{} {} {}",
                expression_text(left, own, dialect)?,
                binary_symbol(*op),
                expression_text(right, own + 1, dialect)?
            )
        }
        Expression::Call {
            function,
            arguments,
        } => {
            let arguments = arguments
                .iter()
                .map(|e| expression_text(e, 0, dialect))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            format!("{function}({arguments})")
        }
        Expression::Case {
            branches,
            otherwise,
        } => {
            let mut out = String::from("CASE");
            for (condition, value) in branches {
                out.push_str(&format!(
                    " WHEN {} THEN {}",
                    expression_text(condition, 0, dialect)?,
                    expression_text(value, 0, dialect)?
                ));
            }
            if let Some(value) = otherwise {
                out.push_str(&format!(" ELSE {}", expression_text(value, 0, dialect)?));
            }
            out.push_str(" END");
            out
        }
        Expression::Exists(select) => {
            format!("EXISTS ({})", select_text(select, dialect)?)
        }
    };
    if own < parent_precedence {
        Ok(format!("({text})"))
    } else {
        Ok(text)
    }
}

/// Render a literal value.
pub fn render_literal(literal: &Literal, dialect: &dyn Dialect) -> String {
    match literal {
        Literal::Int(n) => n.to_string(),
        Literal::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Literal::Blob(bytes) => dialect.render_blob(bytes),
        Literal::Null => "NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_statement;

    fn roundtrip(sql: &str) {
        let parsed = parse_statement(sql).expect("parse");
        let rendered = render_statement(&parsed, &StandardDialect).expect("render");
        let reparsed = parse_statement(&rendered).expect("reparse");
        assert_eq!(parsed, reparsed, "round trip changed AST for: {sql}");
        // Rendering must be a fixed point.
        let rerendered = render_statement(&reparsed, &StandardDialect).expect("rerender");
        assert_eq!(rendered, rerendered);
    }

    #[test]
    fn test_roundtrip_selects() {
        roundtrip("SELECT x FROM t;");
        roundtrip("SELECT DISTINCT a, b FROM t WHERE a = 1 ORDER BY b DESC LIMIT 3;");
        roundtrip("SELECT a FROM t LEFT JOIN u ON a = b WHERE NOT a IS NULL;");
        roundtrip("SELECT 1 + 2 * 3, (1 + 2) * 3;");
        roundtrip("SELECT a || 'x' || 'y' FROM t;");
        roundtrip("SELECT CASE WHEN a = 1 THEN 'x' ELSE 'y' END FROM t;");
        roundtrip("SELECT a FROM t WHERE EXISTS (SELECT b FROM u WHERE b = a);");
        roundtrip("SELECT -a, - -a FROM t;");
        roundtrip("SELECT length(a), abs(b - 1) FROM t;");
    }

    #[test]
    fn test_roundtrip_mutations() {
        roundtrip("INSERT INTO t (a, b) VALUES (1, X'FF'), (2, NULL);");
        roundtrip("INSERT OR REPLACE INTO t (a) VALUES ('it''s');");
        roundtrip("UPDATE t SET a = 1, b = a + 1 WHERE a < 10;");
        roundtrip("DELETE FROM t WHERE a IS NULL;");
        roundtrip("CREATE TABLE t (id INT PRIMARY KEY, name TEXT, data BLOB);");
        roundtrip("DROP TABLE t;");
        roundtrip("CREATE INDEX i ON t (a, b);");
        roundtrip("CREATE DATABASE d;");
        roundtrip("DROP DATABASE d;");
    }

    #[test]
    fn test_roundtrip_control() {
        roundtrip("IF a = 1 THEN DELETE FROM t ELSE FAIL END;");
        roundtrip("IF a = 1 THEN FAIL ELSE IF a = 2 THEN FAIL END;");
        roundtrip("DO INSERT INTO t (a) VALUES (1); DELETE FROM u; END;");
        roundtrip("FAIL;");
    }

    #[test]
    fn test_roundtrip_grants_and_show() {
        let h = "ab".repeat(32);
        roundtrip(&format!("GRANT insert ON test TO X'{h}';"));
        roundtrip("GRANT grant TO NULL;");
        roundtrip(&format!("GRANT template X'{h}' TO NULL;"));
        roundtrip(&format!("REVOKE update ON t TO X'{h}';"));
        roundtrip("SHOW TABLES;");
        roundtrip(&format!("SHOW DATABASES FOR X'{h}';"));
        roundtrip("SHOW GRANTS;");
        roundtrip("DESCRIBE t;");
    }

    #[test]
    fn test_roundtrip_parameters() {
        roundtrip("SELECT a FROM t WHERE a = ?x;");
        roundtrip("SELECT a FROM t WHERE a = ?x:42 AND b = ?y:'s' AND c = ?z:NULL;");
        roundtrip("SELECT a FROM t WHERE a = $invoker;");
    }

    #[test]
    fn test_canonical_text_is_normalized() {
        let a = parse_statement("select X from TEST where x=42;").expect("parse");
        let b = parse_statement("SELECT x FROM test WHERE x = 42;").expect("parse");
        let ra = render_statement(&a, &StandardDialect).expect("render");
        let rb = render_statement(&b, &StandardDialect).expect("render");
        assert_eq!(ra, rb);
        assert_eq!(ra, "SELECT \"x\" FROM \"test\" WHERE \"x\" = 42;");
    }

    #[test]
    fn test_backend_dialect_rejects_variables() {
        let stmt = parse_statement("SELECT $invoker;").expect("parse");
        assert!(render_statement(&stmt, &SqliteDialect).is_err());
    }

    #[test]
    fn test_backend_dialect_rejects_parameters() {
        let stmt = parse_statement("SELECT ?x;").expect("parse");
        assert!(render_statement(&stmt, &SqliteDialect).is_err());
        let stmt = parse_statement("SELECT ?x:1;").expect("parse");
        assert!(render_statement(&stmt, &SqliteDialect).is_err());
    }

    #[test]
    fn test_precedence_parens_preserved() {
        let stmt = parse_statement("SELECT (1 + 2) * 3;").expect("parse");
        let rendered = render_statement(&stmt, &StandardDialect).expect("render");
        assert_eq!(rendered, "SELECT (1 + 2) * 3;");
    }

    #[test]
    fn test_string_escaping() {
        let stmt = parse_statement("SELECT 'it''s';").expect("parse");
        let rendered = render_statement(&stmt, &StandardDialect).expect("render");
        assert_eq!(rendered, "SELECT 'it''s';");
    }
}
