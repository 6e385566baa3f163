//! Frontend-to-backend statement rewriting.
//!
//! The backend rewriter runs at apply time. It substitutes every
//! `$variable` with a literal from the execution context, resolves
//! parameters (an unbound parameter without a caller value fails, a
//! re-bound parameter must agree with its first binding), restricts
//! function calls to the deterministic whitelist, and renames tables and
//! columns into their backend forms.
//!
//! The whitelist is load-bearing: any function added to it must be
//! deterministic across nodes (no clock, no randomness, no locale).

use std::collections::BTreeMap;

use catena_sql::ast::{Expression, Literal, Statement};
use catena_sql::fold::{fold_expression, Fold};
use catena_sql::{Result as SqlResult, SqlError};

use crate::context::Context;

/// Functions that may reach the backend, mapped to their backend names.
const FUNCTION_WHITELIST: [(&str, &str); 2] = [("length", "LENGTH"), ("abs", "ABS")];

/// Map a frontend table name to its backend name.
///
/// Tables are scoped per database as `<db>$<table>`. A frontend name
/// beginning with the backend-reserved `sqlite_` prefix is rewritten to
/// `sqlite$_<rest>`; `$` cannot occur in a frontend identifier, so the
/// mapping is injective and cannot alias an internal table.
pub fn backend_table_name(database: &str, table: &str) -> String {
    match table.strip_prefix("sqlite_") {
        Some(rest) => format!("{database}$sqlite$_{rest}"),
        None => format!("{database}${table}"),
    }
}

/// Map a frontend column name to its backend name. The implicit backend
/// row identifiers are shadowed so user columns named `rowid`/`oid` stay
/// addressable.
pub fn backend_column_name(column: &str) -> String {
    match column {
        "rowid" => "$rowid".to_string(),
        "oid" => "$oid".to_string(),
        other => other.to_string(),
    }
}

/// Undo [`backend_table_name`] for display.
pub fn frontend_table_name(database: &str, backend: &str) -> Option<String> {
    let rest = backend.strip_prefix(database)?.strip_prefix('$')?;
    Some(match rest.strip_prefix("sqlite$_") {
        Some(tail) => format!("sqlite_{tail}"),
        None => rest.to_string(),
    })
}

/// Undo [`backend_column_name`] for display.
pub fn frontend_column_name(backend: &str) -> String {
    match backend {
        "$rowid" => "rowid".to_string(),
        "$oid" => "oid".to_string(),
        other => other.to_string(),
    }
}

/// The backend rewriter. One instance rewrites one statement, carrying
/// parameter bindings across the whole tree so inconsistent re-binds are
/// caught wherever they appear.
pub struct BackendRewriter<'a> {
    context: &'a Context,
    bindings: BTreeMap<String, Literal>,
}

impl<'a> BackendRewriter<'a> {
    pub fn new(context: &'a Context) -> Self {
        Self {
            context,
            bindings: context.parameters.clone(),
        }
    }

    pub fn rewrite(mut self, statement: Statement) -> SqlResult<Statement> {
        self.fold_statement(statement)
    }

    /// Rewrite a bare expression (used for `IF` condition evaluation).
    pub fn rewrite_expression(mut self, expression: Expression) -> SqlResult<Expression> {
        self.fold_expression(expression)
    }

    fn bind(&mut self, name: String, value: Literal) -> SqlResult<Expression> {
        match self.bindings.get(&name) {
            Some(existing) if *existing != value => Err(SqlError::InconsistentParameter(name)),
            _ => {
                self.bindings.insert(name, value.clone());
                Ok(Expression::Literal(value))
            }
        }
    }
}

impl Fold for BackendRewriter<'_> {
    fn fold_expression(&mut self, expression: Expression) -> SqlResult<Expression> {
        match expression {
            Expression::Variable(name) => match self.context.variable(&name) {
                Some(literal) => Ok(Expression::Literal(literal)),
                None => Err(SqlError::UnknownVariable(name)),
            },
            Expression::UnboundParameter(name) => match self.bindings.get(&name) {
                Some(value) => Ok(Expression::Literal(value.clone())),
                None => Err(SqlError::UnboundParameter(name)),
            },
            Expression::BoundParameter(name, value) => self.bind(name, value),
            Expression::Call {
                function,
                arguments,
            } => {
                let backend = FUNCTION_WHITELIST
                    .iter()
                    .find(|(frontend, _)| *frontend == function)
                    .map(|(_, backend)| backend.to_string())
                    .ok_or(SqlError::ForbiddenFunction(function))?;
                Ok(Expression::Call {
                    function: backend,
                    arguments: arguments
                        .into_iter()
                        .map(|e| self.fold_expression(e))
                        .collect::<SqlResult<Vec<_>>>()?,
                })
            }
            other => fold_expression(self, other),
        }
    }

    fn fold_table_name(&mut self, name: String) -> SqlResult<String> {
        Ok(backend_table_name(&self.context.database, &name))
    }

    fn fold_column_name(&mut self, name: String) -> SqlResult<String> {
        Ok(backend_column_name(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockContext;
    use catena_crypto::KeyPair;
    use catena_sql::render::{render_statement, SqliteDialect};
    use catena_sql::parse_statement;

    fn test_context() -> Context {
        let kp = KeyPair::from_bytes(&[9u8; 32]);
        Context::new("d", kp.verifying_key.clone(), BlockContext::unmined())
    }

    fn rewrite(sql: &str, context: &Context) -> SqlResult<String> {
        let statement = parse_statement(sql).expect("parse");
        let rewritten = BackendRewriter::new(context).rewrite(statement)?;
        render_statement(&rewritten, &SqliteDialect)
    }

    #[test]
    fn test_table_and_column_renaming() {
        let out = rewrite("SELECT rowid, x FROM test;", &test_context()).expect("rewrite");
        assert_eq!(out, "SELECT \"$rowid\", \"x\" FROM \"d$test\";");
    }

    #[test]
    fn test_reserved_prefix_mangling() {
        assert_eq!(backend_table_name("d", "sqlite_master"), "d$sqlite$_master");
        assert_eq!(
            frontend_table_name("d", "d$sqlite$_master").as_deref(),
            Some("sqlite_master")
        );
        assert_eq!(frontend_table_name("d", "d$plain").as_deref(), Some("plain"));
        assert_eq!(frontend_table_name("d", "e$plain"), None);
    }

    #[test]
    fn test_variable_substitution() {
        let mut context = test_context();
        context.block.height = 7;
        let out = rewrite("INSERT INTO t (h) VALUES ($blockHeight);", &context).expect("rewrite");
        assert!(out.contains("VALUES (7)"));
    }

    #[test]
    fn test_unknown_variable_fails() {
        let err = rewrite("SELECT $nope FROM t;", &test_context()).unwrap_err();
        assert!(matches!(err, SqlError::UnknownVariable(_)));
    }

    #[test]
    fn test_unbound_parameter_fails_without_value() {
        let err = rewrite("SELECT x FROM t WHERE x = ?v;", &test_context()).unwrap_err();
        assert_eq!(err, SqlError::UnboundParameter("v".into()));
    }

    #[test]
    fn test_unbound_parameter_takes_context_value() {
        let mut context = test_context();
        context.parameters.insert("v".into(), Literal::Int(5));
        let out = rewrite("SELECT x FROM t WHERE x = ?v;", &context).expect("rewrite");
        assert!(out.contains("= 5"));
    }

    #[test]
    fn test_bound_parameter_inlines_value() {
        let out = rewrite("SELECT x FROM t WHERE x = ?v:3;", &test_context()).expect("rewrite");
        assert!(out.contains("= 3"));
    }

    #[test]
    fn test_inconsistent_rebind_fails() {
        let err = rewrite(
            "SELECT x FROM t WHERE x = ?v:3 AND y = ?v:4;",
            &test_context(),
        )
        .unwrap_err();
        assert_eq!(err, SqlError::InconsistentParameter("v".into()));
    }

    #[test]
    fn test_consistent_rebind_allowed() {
        let out = rewrite(
            "SELECT x FROM t WHERE x = ?v:3 AND y = ?v:3;",
            &test_context(),
        )
        .expect("rewrite");
        assert!(out.contains("\"x\" = 3 AND \"y\" = 3"));
    }

    #[test]
    fn test_bound_parameter_conflicts_with_context() {
        let mut context = test_context();
        context.parameters.insert("v".into(), Literal::Int(9));
        let err = rewrite("SELECT x FROM t WHERE x = ?v:3;", &context).unwrap_err();
        assert_eq!(err, SqlError::InconsistentParameter("v".into()));
    }

    #[test]
    fn test_function_whitelist() {
        let out = rewrite("SELECT length(x), abs(y) FROM t;", &test_context()).expect("rewrite");
        assert!(out.contains("LENGTH(\"x\")"));
        assert!(out.contains("ABS(\"y\")"));
        let err = rewrite("SELECT random() FROM t;", &test_context()).unwrap_err();
        assert_eq!(err, SqlError::ForbiddenFunction("random".into()));
    }
}
