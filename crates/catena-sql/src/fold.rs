//! Rebuild-style visitor over the AST.
//!
//! A [`Fold`] consumes nodes and returns (possibly rewritten) nodes. The
//! default methods rebuild the tree unchanged, so an implementation only
//! overrides the interception points it cares about: whole expressions,
//! table names, or column names.

use crate::ast::{
    ColumnDefinition, CreateTable, Delete, Expression, Insert, Join, Literal, Select, Statement,
    Update,
};
use crate::Result;

/// A rewriting visitor.
pub trait Fold {
    fn fold_statement(&mut self, statement: Statement) -> Result<Statement> {
        fold_statement(self, statement)
    }

    fn fold_expression(&mut self, expression: Expression) -> Result<Expression> {
        fold_expression(self, expression)
    }

    fn fold_select(&mut self, select: Select) -> Result<Select> {
        fold_select(self, select)
    }

    /// Called for every referenced or defined table name.
    fn fold_table_name(&mut self, name: String) -> Result<String> {
        Ok(name)
    }

    /// Called for every referenced or defined column name.
    fn fold_column_name(&mut self, name: String) -> Result<String> {
        Ok(name)
    }
}

/// Default statement walker.
pub fn fold_statement<F: Fold + ?Sized>(f: &mut F, statement: Statement) -> Result<Statement> {
    Ok(match statement {
        Statement::Select(select) => Statement::Select(f.fold_select(select)?),
        Statement::Insert(insert) => Statement::Insert(Insert {
            or_replace: insert.or_replace,
            table: f.fold_table_name(insert.table)?,
            columns: insert
                .columns
                .into_iter()
                .map(|c| f.fold_column_name(c))
                .collect::<Result<Vec<_>>>()?,
            values: insert
                .values
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|e| f.fold_expression(e))
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?,
        }),
        Statement::Update(update) => Statement::Update(Update {
            table: f.fold_table_name(update.table)?,
            assignments: update
                .assignments
                .into_iter()
                .map(|(column, value)| {
                    Ok((f.fold_column_name(column)?, f.fold_expression(value)?))
                })
                .collect::<Result<Vec<_>>>()?,
            where_clause: update
                .where_clause
                .map(|e| f.fold_expression(e))
                .transpose()?,
        }),
        Statement::Delete(delete) => Statement::Delete(Delete {
            table: f.fold_table_name(delete.table)?,
            where_clause: delete
                .where_clause
                .map(|e| f.fold_expression(e))
                .transpose()?,
        }),
        Statement::CreateTable(create) => Statement::CreateTable(CreateTable {
            table: f.fold_table_name(create.table)?,
            columns: create
                .columns
                .into_iter()
                .map(|c| {
                    Ok(ColumnDefinition {
                        name: f.fold_column_name(c.name)?,
                        data_type: c.data_type,
                        primary_key: c.primary_key,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        }),
        Statement::DropTable { table } => Statement::DropTable {
            table: f.fold_table_name(table)?,
        },
        Statement::CreateIndex {
            name,
            table,
            columns,
        } => Statement::CreateIndex {
            name: f.fold_table_name(name)?,
            table: f.fold_table_name(table)?,
            columns: columns
                .into_iter()
                .map(|c| f.fold_column_name(c))
                .collect::<Result<Vec<_>>>()?,
        },
        Statement::If {
            branches,
            otherwise,
        } => Statement::If {
            branches: branches
                .into_iter()
                .map(|(condition, body)| {
                    Ok((f.fold_expression(condition)?, f.fold_statement(body)?))
                })
                .collect::<Result<Vec<_>>>()?,
            otherwise: match otherwise {
                Some(body) => Some(Box::new(f.fold_statement(*body)?)),
                None => None,
            },
        },
        Statement::Block(statements) => Statement::Block(
            statements
                .into_iter()
                .map(|s| f.fold_statement(s))
                .collect::<Result<Vec<_>>>()?,
        ),
        // Database-level and metadata statements carry frontend names that
        // the executive interprets directly; they are not backend-rewritten.
        other @ (Statement::CreateDatabase { .. }
        | Statement::DropDatabase { .. }
        | Statement::Show(_)
        | Statement::Describe { .. }
        | Statement::Grant { .. }
        | Statement::Revoke { .. }
        | Statement::Fail) => other,
    })
}

/// Default select walker.
pub fn fold_select<F: Fold + ?Sized>(f: &mut F, select: Select) -> Result<Select> {
    Ok(Select {
        distinct: select.distinct,
        columns: select
            .columns
            .into_iter()
            .map(|e| f.fold_expression(e))
            .collect::<Result<Vec<_>>>()?,
        from: select.from.map(|t| f.fold_table_name(t)).transpose()?,
        joins: select
            .joins
            .into_iter()
            .map(|join| {
                Ok(Join {
                    table: f.fold_table_name(join.table)?,
                    on: f.fold_expression(join.on)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        where_clause: select
            .where_clause
            .map(|e| f.fold_expression(e))
            .transpose()?,
        order_by: select
            .order_by
            .into_iter()
            .map(|(e, direction)| Ok((f.fold_expression(e)?, direction)))
            .collect::<Result<Vec<_>>>()?,
        limit: select.limit,
    })
}

/// Default expression walker.
pub fn fold_expression<F: Fold + ?Sized>(f: &mut F, expression: Expression) -> Result<Expression> {
    Ok(match expression {
        Expression::Column(name) => Expression::Column(f.fold_column_name(name)?),
        Expression::Unary { op, expr } => Expression::Unary {
            op,
            expr: Box::new(f.fold_expression(*expr)?),
        },
        Expression::Binary { op, left, right } => Expression::Binary {
            op,
            left: Box::new(f.fold_expression(*left)?),
            right: Box::new(f.fold_expression(*right)?),
        },
        Expression::Call {
            function,
            arguments,
        } => Expression::Call {
            function,
            arguments: arguments
                .into_iter()
                .map(|e| f.fold_expression(e))
                .collect::<Result<Vec<_>>>()?,
        },
        Expression::Case {
            branches,
            otherwise,
        } => Expression::Case {
            branches: branches
                .into_iter()
                .map(|(condition, value)| {
                    Ok((f.fold_expression(condition)?, f.fold_expression(value)?))
                })
                .collect::<Result<Vec<_>>>()?,
            otherwise: match otherwise {
                Some(value) => Some(Box::new(f.fold_expression(*value)?)),
                None => None,
            },
        },
        Expression::Exists(select) => Expression::Exists(Box::new(f.fold_select(*select)?)),
        leaf @ (Expression::Literal(_)
        | Expression::AllColumns
        | Expression::Variable(_)
        | Expression::UnboundParameter(_)
        | Expression::BoundParameter(..)) => leaf,
    })
}

/// Client-side macro resolution, run before a statement is signed.
///
/// `version()` becomes the node's version string and `uuid()` a freshly
/// generated v4 UUID. Both are resolved here precisely because they are
/// not deterministic; the chain only ever sees the resulting literals.
pub struct FrontendRewriter {
    version: String,
}

impl FrontendRewriter {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    pub fn rewrite(&mut self, statement: Statement) -> Result<Statement> {
        self.fold_statement(statement)
    }
}

impl Fold for FrontendRewriter {
    fn fold_expression(&mut self, expression: Expression) -> Result<Expression> {
        if let Expression::Call {
            function,
            arguments,
        } = &expression
        {
            if arguments.is_empty() {
                match function.as_str() {
                    "version" => {
                        return Ok(Expression::Literal(Literal::Text(self.version.clone())))
                    }
                    "uuid" => {
                        return Ok(Expression::Literal(Literal::Text(
                            uuid::Uuid::new_v4().to_string(),
                        )))
                    }
                    _ => {}
                }
            }
        }
        fold_expression(self, expression)
    }
}

/// Replace every bound parameter with its unbound form. Used to compute
/// the template text of a statement.
pub struct Unbinder;

impl Fold for Unbinder {
    fn fold_expression(&mut self, expression: Expression) -> Result<Expression> {
        if let Expression::BoundParameter(name, _) = expression {
            return Ok(Expression::UnboundParameter(name));
        }
        fold_expression(self, expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_statement;
    use crate::render::{render_statement, StandardDialect};

    struct TablePrefixer;

    impl Fold for TablePrefixer {
        fn fold_table_name(&mut self, name: String) -> Result<String> {
            Ok(format!("p_{name}"))
        }
    }

    #[test]
    fn test_identity_fold() {
        struct Identity;
        impl Fold for Identity {}
        let stmt = parse_statement(
            "DO UPDATE t SET a = CASE WHEN b = 1 THEN 2 ELSE 3 END; DELETE FROM u WHERE EXISTS (SELECT x FROM v); END;",
        )
        .expect("parse");
        let folded = Identity.fold_statement(stmt.clone()).expect("fold");
        assert_eq!(stmt, folded);
    }

    #[test]
    fn test_table_names_reach_fold_hook() {
        let stmt = parse_statement("SELECT a FROM t LEFT JOIN u ON a = b;").expect("parse");
        let folded = TablePrefixer.fold_statement(stmt).expect("fold");
        let text = render_statement(&folded, &StandardDialect).expect("render");
        assert!(text.contains("\"p_t\""));
        assert!(text.contains("\"p_u\""));
    }

    #[test]
    fn test_grant_table_names_untouched() {
        let stmt = parse_statement("GRANT insert ON test TO NULL;").expect("parse");
        let folded = TablePrefixer.fold_statement(stmt.clone()).expect("fold");
        assert_eq!(stmt, folded);
    }

    #[test]
    fn test_frontend_version_macro() {
        let stmt = parse_statement("INSERT INTO t (a) VALUES (version());").expect("parse");
        let folded = FrontendRewriter::new("1.2.3").rewrite(stmt).expect("fold");
        let text = render_statement(&folded, &StandardDialect).expect("render");
        assert!(text.contains("'1.2.3'"));
    }

    #[test]
    fn test_frontend_uuid_macro_resolves_to_literal() {
        let stmt = parse_statement("INSERT INTO t (a) VALUES (uuid());").expect("parse");
        let folded = FrontendRewriter::new("1").rewrite(stmt).expect("fold");
        let Statement::Insert(insert) = folded else {
            panic!("expected insert");
        };
        assert!(matches!(
            insert.values[0][0],
            Expression::Literal(Literal::Text(_))
        ));
    }

    #[test]
    fn test_unbinder() {
        let stmt = parse_statement("SELECT a FROM t WHERE a = ?x:42;").expect("parse");
        let folded = Unbinder.fold_statement(stmt).expect("fold");
        let text = render_statement(&folded, &StandardDialect).expect("render");
        assert!(text.contains("?x"));
        assert!(!text.contains("42"));
    }
}
