//! Static privilege declaration.
//!
//! Every statement declares the privileges its execution requires. Read
//! statements declare none. The [`PrivilegeKind::Never`] kind can never be
//! satisfied by any grant; it marks operations that must not be
//! user-executable.

use catena_crypto::Hash;

use crate::ast::{Expression, Statement};

/// The kind of a privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivilegeKind {
    Create,
    Delete,
    Drop,
    Insert,
    Update,
    Grant,
    /// Authorization of one specific statement shape, identified by its
    /// template hash.
    Template(Hash),
    /// Satisfied by nothing.
    Never,
}

impl PrivilegeKind {
    /// The string stored in the `kind` column of the grants table.
    /// Template kinds embed their hash so the schema stays flat.
    pub fn storage_key(&self) -> String {
        match self {
            PrivilegeKind::Create => "create".into(),
            PrivilegeKind::Delete => "delete".into(),
            PrivilegeKind::Drop => "drop".into(),
            PrivilegeKind::Insert => "insert".into(),
            PrivilegeKind::Update => "update".into(),
            PrivilegeKind::Grant => "grant".into(),
            PrivilegeKind::Template(hash) => format!("template:{hash}"),
            PrivilegeKind::Never => "never".into(),
        }
    }

    /// The keyword rendered in `GRANT`/`REVOKE` statements.
    pub fn render(&self) -> String {
        match self {
            PrivilegeKind::Template(hash) => {
                format!("template X'{}'", hex::encode_upper(hash.as_bytes()))
            }
            other => other.storage_key().to_uppercase(),
        }
    }
}

/// A single required privilege: a kind, optionally scoped to a table.
#[derive(Clone, Debug, PartialEq)]
pub struct Privilege {
    pub kind: PrivilegeKind,
    pub table: Option<String>,
}

impl Privilege {
    pub fn on(kind: PrivilegeKind, table: &str) -> Self {
        Self {
            kind,
            table: Some(table.to_string()),
        }
    }

    pub fn global(kind: PrivilegeKind) -> Self {
        Self { kind, table: None }
    }
}

impl Statement {
    /// The privileges required to execute this statement.
    ///
    /// `CREATE DATABASE` and `DROP DATABASE` declare none; ownership rules
    /// in the executive govern them instead. Compound statements
    /// aggregate their children.
    pub fn required_privileges(&self) -> Vec<Privilege> {
        match self {
            Statement::Select(_) | Statement::Show(_) | Statement::Describe { .. } => vec![],
            Statement::Insert(insert) => {
                vec![Privilege::on(PrivilegeKind::Insert, &insert.table)]
            }
            Statement::Update(update) => {
                vec![Privilege::on(PrivilegeKind::Update, &update.table)]
            }
            Statement::Delete(delete) => {
                vec![Privilege::on(PrivilegeKind::Delete, &delete.table)]
            }
            Statement::CreateTable(create) => {
                vec![Privilege::on(PrivilegeKind::Create, &create.table)]
            }
            Statement::DropTable { table } => vec![Privilege::on(PrivilegeKind::Drop, table)],
            Statement::CreateIndex { .. } => vec![Privilege::global(PrivilegeKind::Never)],
            Statement::CreateDatabase { .. } | Statement::DropDatabase { .. } => vec![],
            Statement::Grant { .. } | Statement::Revoke { .. } => {
                vec![Privilege::global(PrivilegeKind::Grant)]
            }
            Statement::If {
                branches,
                otherwise,
            } => {
                let mut privileges = Vec::new();
                for (_, statement) in branches {
                    privileges.extend(statement.required_privileges());
                }
                if let Some(statement) = otherwise {
                    privileges.extend(statement.required_privileges());
                }
                privileges
            }
            Statement::Block(statements) => statements
                .iter()
                .flat_map(|s| s.required_privileges())
                .collect(),
            Statement::Fail => vec![],
        }
    }

    /// Whether any required privilege touches one of the given reserved
    /// table names. Used by payload application to drop transactions that
    /// try to write metadata directly.
    pub fn touches_tables(&self, reserved: &[&str]) -> bool {
        self.required_privileges().iter().any(|p| {
            p.table
                .as_deref()
                .is_some_and(|t| reserved.contains(&t))
        }) || self.grant_touches(reserved)
    }

    fn grant_touches(&self, reserved: &[&str]) -> bool {
        match self {
            Statement::Grant { privilege, .. } | Statement::Revoke { privilege, .. } => privilege
                .table
                .as_deref()
                .is_some_and(|t| reserved.contains(&t)),
            Statement::If {
                branches,
                otherwise,
            } => {
                branches.iter().any(|(_, s)| s.grant_touches(reserved))
                    || otherwise
                        .as_deref()
                        .is_some_and(|s| s.grant_touches(reserved))
            }
            Statement::Block(statements) => statements.iter().any(|s| s.grant_touches(reserved)),
            _ => false,
        }
    }
}

/// Collect the names of unbound parameters appearing anywhere in a
/// statement, in no particular order.
pub fn unbound_parameters(statement: &Statement) -> Vec<String> {
    let mut names = Vec::new();
    collect_statement(statement, &mut |e| {
        if let Expression::UnboundParameter(name) = e {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    });
    names
}

fn collect_statement(statement: &Statement, f: &mut impl FnMut(&Expression)) {
    match statement {
        Statement::Select(select) => collect_select(select, f),
        Statement::Insert(insert) => {
            for row in &insert.values {
                for e in row {
                    collect_expression(e, f);
                }
            }
        }
        Statement::Update(update) => {
            for (_, e) in &update.assignments {
                collect_expression(e, f);
            }
            if let Some(e) = &update.where_clause {
                collect_expression(e, f);
            }
        }
        Statement::Delete(delete) => {
            if let Some(e) = &delete.where_clause {
                collect_expression(e, f);
            }
        }
        Statement::If {
            branches,
            otherwise,
        } => {
            for (condition, s) in branches {
                collect_expression(condition, f);
                collect_statement(s, f);
            }
            if let Some(s) = otherwise {
                collect_statement(s, f);
            }
        }
        Statement::Block(statements) => {
            for s in statements {
                collect_statement(s, f);
            }
        }
        _ => {}
    }
}

fn collect_select(select: &crate::ast::Select, f: &mut impl FnMut(&Expression)) {
    for e in &select.columns {
        collect_expression(e, f);
    }
    for join in &select.joins {
        collect_expression(&join.on, f);
    }
    if let Some(e) = &select.where_clause {
        collect_expression(e, f);
    }
    for (e, _) in &select.order_by {
        collect_expression(e, f);
    }
}

fn collect_expression(expression: &Expression, f: &mut impl FnMut(&Expression)) {
    f(expression);
    match expression {
        Expression::Unary { expr, .. } => collect_expression(expr, f),
        Expression::Binary { left, right, .. } => {
            collect_expression(left, f);
            collect_expression(right, f);
        }
        Expression::Call { arguments, .. } => {
            for e in arguments {
                collect_expression(e, f);
            }
        }
        Expression::Case {
            branches,
            otherwise,
        } => {
            for (c, v) in branches {
                collect_expression(c, f);
                collect_expression(v, f);
            }
            if let Some(e) = otherwise {
                collect_expression(e, f);
            }
        }
        Expression::Exists(select) => collect_select(select, f),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_statement;

    #[test]
    fn test_select_declares_nothing() {
        let stmt = parse_statement("SELECT x FROM t;").expect("parse");
        assert!(stmt.required_privileges().is_empty());
    }

    #[test]
    fn test_insert_declares_insert() {
        let stmt = parse_statement("INSERT INTO test (x) VALUES (1);").expect("parse");
        assert_eq!(
            stmt.required_privileges(),
            vec![Privilege::on(PrivilegeKind::Insert, "test")]
        );
    }

    #[test]
    fn test_create_index_is_never_satisfiable() {
        let stmt = parse_statement("CREATE INDEX i ON t (x);").expect("parse");
        assert_eq!(
            stmt.required_privileges(),
            vec![Privilege::global(PrivilegeKind::Never)]
        );
    }

    #[test]
    fn test_block_aggregates_children() {
        let stmt =
            parse_statement("DO INSERT INTO a (x) VALUES (1); DELETE FROM b; END;").expect("parse");
        let privileges = stmt.required_privileges();
        assert_eq!(privileges.len(), 2);
        assert_eq!(privileges[0].kind, PrivilegeKind::Insert);
        assert_eq!(privileges[1].kind, PrivilegeKind::Delete);
    }

    #[test]
    fn test_touches_reserved_tables() {
        let stmt = parse_statement("INSERT INTO grants (x) VALUES (1);").expect("parse");
        assert!(stmt.touches_tables(&["grants", "users"]));
        let stmt = parse_statement("INSERT INTO mine (x) VALUES (1);").expect("parse");
        assert!(!stmt.touches_tables(&["grants", "users"]));
    }

    #[test]
    fn test_unbound_parameter_collection() {
        let stmt =
            parse_statement("SELECT x FROM t WHERE a = ?p AND b = ?q:2 AND c = ?p;").expect("parse");
        assert_eq!(unbound_parameters(&stmt), vec!["p".to_string()]);
    }

    #[test]
    fn test_template_storage_key_embeds_hash() {
        let hash = catena_crypto::Hash::of(b"shape");
        let key = PrivilegeKind::Template(hash).storage_key();
        assert!(key.starts_with("template:"));
        assert!(key.contains(&hash.to_hex()));
    }
}
