//! Static verification of rewritten statements.
//!
//! Runs after the backend rewrite, immediately before rendering. Asserts
//! that every referenced table and column exists, that insert column
//! lists are consistent, and that no variables or parameters survived
//! the rewrite. Subqueries are verified with their own table context
//! joined onto the enclosing one, so correlated references resolve.

use catena_db::{Database, TableSchema};
use catena_sql::ast::{Expression, Select, Statement};
use catena_sql::SqlError;

use crate::{EngineError, Result};

/// The statement verifier.
pub struct Verifier<'a> {
    db: &'a dyn Database,
}

impl<'a> Verifier<'a> {
    pub fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    /// Verify a rewritten statement. `creating` relaxes column references
    /// in contexts where the referenced table is being defined by the
    /// statement itself.
    pub fn verify(&self, statement: &Statement, creating: bool) -> Result<()> {
        match statement {
            Statement::Select(select) => {
                self.verify_select(select, &[])?;
                Ok(())
            }
            Statement::Insert(insert) => {
                let schema = self.require_table(&insert.table)?;
                let mut seen = Vec::new();
                for column in &insert.columns {
                    if seen.contains(&column) {
                        return Err(EngineError::InconsistentColumns(column.clone()));
                    }
                    if !schema.has_column(column) {
                        return Err(EngineError::ColumnDoesNotExist(column.clone()));
                    }
                    seen.push(column);
                }
                for row in &insert.values {
                    if row.len() != insert.columns.len() {
                        return Err(EngineError::InconsistentColumns(format!(
                            "{} values for {} columns",
                            row.len(),
                            insert.columns.len()
                        )));
                    }
                    for expression in row {
                        self.verify_expression(expression, &[], creating)?;
                    }
                }
                Ok(())
            }
            Statement::Update(update) => {
                let schema = self.require_table(&update.table)?;
                for (column, value) in &update.assignments {
                    if !schema.has_column(column) {
                        return Err(EngineError::ColumnDoesNotExist(column.clone()));
                    }
                    self.verify_expression(value, std::slice::from_ref(&schema), creating)?;
                }
                if let Some(e) = &update.where_clause {
                    self.verify_expression(e, std::slice::from_ref(&schema), creating)?;
                }
                Ok(())
            }
            Statement::Delete(delete) => {
                let schema = self.require_table(&delete.table)?;
                if let Some(e) = &delete.where_clause {
                    self.verify_expression(e, std::slice::from_ref(&schema), creating)?;
                }
                Ok(())
            }
            Statement::CreateTable(create) => {
                if self.db.table_exists(&create.table)? {
                    return Err(EngineError::TableAlreadyExists(create.table.clone()));
                }
                let mut seen = Vec::new();
                for column in &create.columns {
                    if seen.contains(&&column.name) {
                        return Err(EngineError::InconsistentColumns(column.name.clone()));
                    }
                    seen.push(&column.name);
                }
                Ok(())
            }
            Statement::DropTable { table } => {
                self.require_table(table)?;
                Ok(())
            }
            Statement::CreateIndex { table, columns, .. } => {
                let schema = self.require_table(table)?;
                for column in columns {
                    if !schema.has_column(column) {
                        return Err(EngineError::ColumnDoesNotExist(column.clone()));
                    }
                }
                Ok(())
            }
            Statement::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    self.verify_expression(condition, &[], creating)?;
                    self.verify(body, creating)?;
                }
                if let Some(body) = otherwise {
                    self.verify(body, creating)?;
                }
                Ok(())
            }
            Statement::Block(statements) => {
                for s in statements {
                    self.verify(s, creating)?;
                }
                Ok(())
            }
            // Metadata statements never reach the backend; the executive
            // interprets them directly.
            Statement::CreateDatabase { .. }
            | Statement::DropDatabase { .. }
            | Statement::Show(_)
            | Statement::Describe { .. }
            | Statement::Grant { .. }
            | Statement::Revoke { .. }
            | Statement::Fail => Ok(()),
        }
    }

    fn require_table(&self, table: &str) -> Result<TableSchema> {
        self.db
            .definition(table)?
            .ok_or_else(|| EngineError::TableDoesNotExist(table.to_string()))
    }

    fn verify_select(&self, select: &Select, outer: &[TableSchema]) -> Result<Vec<TableSchema>> {
        let mut tables: Vec<TableSchema> = outer.to_vec();
        if let Some(from) = &select.from {
            tables.push(self.require_table(from)?);
            for join in &select.joins {
                tables.push(self.require_table(&join.table)?);
            }
        }
        for e in &select.columns {
            self.verify_expression(e, &tables, false)?;
        }
        for join in &select.joins {
            self.verify_expression(&join.on, &tables, false)?;
        }
        if let Some(e) = &select.where_clause {
            self.verify_expression(e, &tables, false)?;
        }
        for (e, _) in &select.order_by {
            self.verify_expression(e, &tables, false)?;
        }
        Ok(tables)
    }

    fn verify_expression(
        &self,
        expression: &Expression,
        tables: &[TableSchema],
        creating: bool,
    ) -> Result<()> {
        match expression {
            Expression::Column(name) => {
                if tables.is_empty() {
                    if creating {
                        return Ok(());
                    }
                    return Err(EngineError::ColumnDoesNotExist(name.clone()));
                }
                if tables.iter().any(|t| t.has_column(name)) {
                    Ok(())
                } else {
                    Err(EngineError::ColumnDoesNotExist(name.clone()))
                }
            }
            Expression::Variable(name) => {
                Err(EngineError::Sql(SqlError::UnknownVariable(name.clone())))
            }
            Expression::UnboundParameter(name) | Expression::BoundParameter(name, _) => {
                Err(EngineError::Sql(SqlError::UnboundParameter(name.clone())))
            }
            Expression::Literal(_) | Expression::AllColumns => Ok(()),
            Expression::Unary { expr, .. } => self.verify_expression(expr, tables, creating),
            Expression::Binary { left, right, .. } => {
                self.verify_expression(left, tables, creating)?;
                self.verify_expression(right, tables, creating)
            }
            Expression::Call { arguments, .. } => {
                for e in arguments {
                    self.verify_expression(e, tables, creating)?;
                }
                Ok(())
            }
            Expression::Case {
                branches,
                otherwise,
            } => {
                for (condition, value) in branches {
                    self.verify_expression(condition, tables, creating)?;
                    self.verify_expression(value, tables, creating)?;
                }
                if let Some(value) = otherwise {
                    self.verify_expression(value, tables, creating)?;
                }
                Ok(())
            }
            Expression::Exists(select) => {
                self.verify_select(select, tables)?;
                Ok(())
            }
        }
    }
}
