//! The SQL executive: authorize, rewrite, verify, dispatch.
//!
//! Authorization order: a template grant for the statement's shape
//! short-circuits everything; otherwise declared privileges are checked
//! against the grants table, with the database owner passing implicitly
//! inside their own database. The `never` privilege kind fails before
//! the owner bypass, so operations marked with it stay closed to
//! everyone.

use catena_db::{Database, ResultSet, Value};
use catena_sql::ast::{Expression, Literal, Select, Show, Statement};
use catena_sql::render::{render_statement, SqliteDialect};
use catena_sql::template::template_hash;
use catena_sql::{Privilege, PrivilegeKind};
use tracing::debug;

use crate::context::Context;
use crate::grants;
use crate::metadata::{sql_text, Metadata};
use crate::rewrite::{
    backend_table_name, frontend_column_name, frontend_table_name, BackendRewriter,
};
use crate::verify::Verifier;
use crate::{EngineError, Result};

/// The statement executive for one backend database.
pub struct Executive<'a> {
    db: &'a dyn Database,
}

impl<'a> Executive<'a> {
    pub fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    /// Authorize and run a statement.
    pub fn perform(&self, statement: &Statement, context: &Context) -> Result<ResultSet> {
        self.perform_granted(statement, context, false)
    }

    /// Authorize and run a statement with an inherited template grant.
    pub fn perform_granted(
        &self,
        statement: &Statement,
        context: &Context,
        template_granted: bool,
    ) -> Result<ResultSet> {
        if statement.requires_database() && context.database.is_empty() {
            return Err(EngineError::RequiresDatabaseContext);
        }
        let invoker = context.invoker_hash();

        let mut template_granted = template_granted;
        if !template_granted && !context.database.is_empty() {
            let hash = template_hash(statement)?;
            template_granted = grants::check(
                self.db,
                &[Privilege::global(PrivilegeKind::Template(hash))],
                &invoker,
                &context.database,
            )?;
        }

        if !template_granted {
            let privileges = statement.required_privileges();
            if !privileges.is_empty() {
                // Nothing opens a never-privileged operation, including
                // database ownership.
                if privileges.iter().any(|p| p.kind == PrivilegeKind::Never) {
                    return Err(EngineError::PrivilegeRequired);
                }
                let metadata = Metadata::new(self.db);
                let owner = metadata.database_owner(&context.database)?;
                let is_owner = owner.as_ref() == Some(&invoker);
                if !is_owner
                    && !grants::check(self.db, &privileges, &invoker, &context.database)?
                {
                    debug!(
                        database = %context.database,
                        invoker = %invoker,
                        "privilege check failed"
                    );
                    return Err(EngineError::PrivilegeRequired);
                }
            }
        }

        self.dispatch(statement, context, template_granted)
    }

    fn dispatch(
        &self,
        statement: &Statement,
        context: &Context,
        template_granted: bool,
    ) -> Result<ResultSet> {
        let metadata = Metadata::new(self.db);
        match statement {
            Statement::Fail => Err(EngineError::ExecutionFailed),

            Statement::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.evaluate_condition(condition, context)? {
                        return self.perform_granted(body, context, template_granted);
                    }
                }
                match otherwise {
                    Some(body) => self.perform_granted(body, context, template_granted),
                    None => Err(EngineError::ExecutionFailed),
                }
            }

            Statement::Block(statements) => {
                let mut last = ResultSet::default();
                for s in statements {
                    last = self.perform_granted(s, context, template_granted)?;
                }
                Ok(last)
            }

            Statement::CreateDatabase { database } => {
                if metadata.database_owner(database)?.is_some() {
                    return Err(EngineError::DatabaseAlreadyExists(database.clone()));
                }
                metadata.create_database(database, &context.invoker_hash())?;
                Ok(ResultSet::default())
            }

            Statement::DropDatabase { database } => {
                match metadata.database_owner(database)? {
                    None => Err(EngineError::DatabaseDoesNotExist(database.clone())),
                    Some(owner) if owner != context.invoker_hash() => {
                        Err(EngineError::PrivilegeRequired)
                    }
                    Some(_) => {
                        let prefix = format!("{database}$");
                        let occupied = self
                            .db
                            .all_tables()?
                            .iter()
                            .any(|t| t.starts_with(&prefix));
                        if occupied {
                            return Err(EngineError::DatabaseNotEmpty(database.clone()));
                        }
                        metadata.drop_database(database)?;
                        Ok(ResultSet::default())
                    }
                }
            }

            Statement::Grant { privilege, user } => {
                metadata.add_grant(
                    user.as_ref(),
                    &privilege.kind.storage_key(),
                    privilege.table.as_deref(),
                    &context.database,
                )?;
                Ok(ResultSet::default())
            }

            Statement::Revoke { privilege, user } => {
                metadata.remove_grant(
                    user.as_ref(),
                    &privilege.kind.storage_key(),
                    privilege.table.as_deref(),
                    &context.database,
                )?;
                Ok(ResultSet::default())
            }

            Statement::Show(show) => self.show(show, context),

            Statement::Describe { table } => {
                let backend = backend_table_name(&context.database, table);
                let schema = self
                    .db
                    .definition(&backend)?
                    .ok_or_else(|| EngineError::TableDoesNotExist(table.clone()))?;
                Ok(ResultSet {
                    columns: vec!["column".into(), "type".into(), "key".into()],
                    rows: schema
                        .columns
                        .into_iter()
                        .map(|c| {
                            vec![
                                Value::Text(frontend_column_name(&c.name)),
                                Value::Text(c.data_type),
                                Value::Int(c.primary_key as i64),
                            ]
                        })
                        .collect(),
                })
            }

            other => self.run_backend(other, context),
        }
    }

    /// Evaluate an `IF` condition as `SELECT CASE WHEN c THEN 1 ELSE 0 END`.
    fn evaluate_condition(&self, condition: &Expression, context: &Context) -> Result<bool> {
        let case = Expression::Case {
            branches: vec![(
                condition.clone(),
                Expression::Literal(Literal::Int(1)),
            )],
            otherwise: Some(Box::new(Expression::Literal(Literal::Int(0)))),
        };
        let probe = Statement::Select(Select {
            distinct: false,
            columns: vec![case],
            from: None,
            joins: vec![],
            where_clause: None,
            order_by: vec![],
            limit: None,
        });
        let rewritten = BackendRewriter::new(context).rewrite(probe)?;
        Verifier::new(self.db).verify(&rewritten, false)?;
        let sql = render_statement(&rewritten, &SqliteDialect)?;
        let rs = self.db.query(&sql)?;
        Ok(rs.scalar().is_some_and(Value::is_truthy))
    }

    /// The default path: rewrite, verify, render, execute.
    fn run_backend(&self, statement: &Statement, context: &Context) -> Result<ResultSet> {
        let rewritten = BackendRewriter::new(context).rewrite(statement.clone())?;
        let creating = matches!(statement, Statement::CreateTable(_));
        Verifier::new(self.db).verify(&rewritten, creating)?;
        let sql = render_statement(&rewritten, &SqliteDialect)?;

        if statement.is_mutating() {
            self.db.execute(&sql)?;
            Ok(ResultSet::default())
        } else {
            let mut rs = self.db.query(&sql)?;
            for column in &mut rs.columns {
                *column = frontend_column_name(column);
            }
            Ok(rs)
        }
    }

    fn show(&self, show: &Show, context: &Context) -> Result<ResultSet> {
        let metadata = Metadata::new(self.db);
        match show {
            Show::Tables => {
                let prefix = format!("{}$", context.database);
                let rows = self
                    .db
                    .all_tables()?
                    .into_iter()
                    .filter(|t| t.starts_with(&prefix))
                    .filter_map(|t| frontend_table_name(&context.database, &t))
                    .map(|t| vec![Value::Text(t)])
                    .collect();
                Ok(ResultSet {
                    columns: vec!["table".into()],
                    rows,
                })
            }
            Show::Databases { for_user } => {
                let names = match for_user {
                    Some(user) => metadata.databases_for(user)?,
                    None => metadata.databases()?,
                };
                Ok(ResultSet {
                    columns: vec!["database".into()],
                    rows: names.into_iter().map(|n| vec![Value::Text(n)]).collect(),
                })
            }
            Show::Grants => self.db.query(&format!(
                "SELECT user, kind, \"table\" FROM grants WHERE database = {} ORDER BY kind, \"table\"",
                sql_text(&context.database)
            )).map_err(Into::into),
            Show::All => self
                .db
                .query("SELECT key, value FROM info ORDER BY key")
                .map_err(Into::into),
        }
    }
}
