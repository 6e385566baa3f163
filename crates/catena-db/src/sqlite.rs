//! SQLite implementation of the [`Database`] capability.
//!
//! One connection per database file. WAL mode, foreign keys, and a busy
//! timeout are configured on open. An in-memory variant backs the tests
//! and the `--in-memory-database` mode.

use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::trace;

use crate::value::{ResultSet, Value};
use crate::{ColumnSchema, Database, DbError, Result, TableSchema};

/// A SQLite-backed database.
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Open or create a database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self { conn })
    }
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

fn quote_savepoint(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Database for SqliteDatabase {
    fn query(&self, sql: &str) -> Result<ResultSet> {
        trace!(sql, "backend query");
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let column_count = columns.len();

        let mut rows = Vec::new();
        let mut raw = stmt.query([])?;
        while let Some(row) = raw.next()? {
            let mut out = Vec::with_capacity(column_count);
            for i in 0..column_count {
                out.push(match row.get_ref(i)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(n) => Value::Int(n),
                    ValueRef::Real(f) => Value::Text(f.to_string()),
                    ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => Value::Blob(b.to_vec()),
                });
            }
            rows.push(out);
        }
        Ok(ResultSet { columns, rows })
    }

    fn execute(&self, sql: &str) -> Result<usize> {
        trace!(sql, "backend execute");
        Ok(self.conn.execute(sql, [])?)
    }

    fn savepoint(&self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", quote_savepoint(name)))?;
        Ok(())
    }

    fn release(&self, name: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {}", quote_savepoint(name)))?;
        Ok(())
    }

    fn rollback_to(&self, name: &str) -> Result<()> {
        // ROLLBACK TO leaves the savepoint open; release it so nesting
        // stays balanced.
        let quoted = quote_savepoint(name);
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {quoted}; RELEASE SAVEPOINT {quoted};"
        ))?;
        Ok(())
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn definition(&self, table: &str) -> Result<Option<TableSchema>> {
        if !self.table_exists(table)? {
            return Ok(None);
        }
        let mut stmt = self.conn.prepare("SELECT name, type, pk FROM pragma_table_info(?1)")?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnSchema {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    primary_key: row.get::<_, i64>(2)? > 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if columns.is_empty() {
            return Err(DbError::Backend(format!(
                "table {table} exists but has no columns"
            )));
        }
        Ok(Some(TableSchema {
            name: table.to_string(),
            columns,
        }))
    }

    fn all_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> SqliteDatabase {
        SqliteDatabase::open_memory().expect("open in-memory db")
    }

    #[test]
    fn test_execute_and_query() {
        let db = test_db();
        db.execute("CREATE TABLE t (x INTEGER)").expect("create");
        db.execute("INSERT INTO t (x) VALUES (42)").expect("insert");
        let rs = db.query("SELECT x FROM t").expect("select");
        assert_eq!(rs.columns, vec!["x"]);
        assert_eq!(rs.rows, vec![vec![Value::Int(42)]]);
    }

    #[test]
    fn test_value_kinds() {
        let db = test_db();
        let rs = db
            .query("SELECT 1, 'text', X'AB', NULL")
            .expect("select");
        assert_eq!(
            rs.rows[0],
            vec![
                Value::Int(1),
                Value::Text("text".into()),
                Value::Blob(vec![0xAB]),
                Value::Null
            ]
        );
    }

    #[test]
    fn test_savepoint_rollback() {
        let db = test_db();
        db.execute("CREATE TABLE t (x INTEGER)").expect("create");
        db.savepoint("outer").expect("savepoint");
        db.execute("INSERT INTO t (x) VALUES (1)").expect("insert");
        db.rollback_to("outer").expect("rollback");
        let rs = db.query("SELECT COUNT(*) FROM t").expect("count");
        assert_eq!(rs.scalar(), Some(&Value::Int(0)));
    }

    #[test]
    fn test_nested_savepoints() {
        let db = test_db();
        db.execute("CREATE TABLE t (x INTEGER)").expect("create");
        db.savepoint("block").expect("savepoint");
        db.execute("INSERT INTO t (x) VALUES (1)").expect("insert");
        db.savepoint("tr").expect("savepoint");
        db.execute("INSERT INTO t (x) VALUES (2)").expect("insert");
        db.rollback_to("tr").expect("rollback inner");
        db.release("block").expect("release outer");
        let rs = db.query("SELECT COUNT(*) FROM t").expect("count");
        assert_eq!(rs.scalar(), Some(&Value::Int(1)));
    }

    #[test]
    fn test_table_introspection() {
        let db = test_db();
        db.execute("CREATE TABLE \"d$t\" (\"id\" INT PRIMARY KEY, \"name\" TEXT)")
            .expect("create");
        assert!(db.table_exists("d$t").expect("exists"));
        assert!(!db.table_exists("other").expect("exists"));

        let schema = db.definition("d$t").expect("definition").expect("present");
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[0].name, "id");
        assert!(schema.columns[0].primary_key);
        assert!(schema.has_column("name"));
        assert!(!schema.has_column("missing"));
    }

    #[test]
    fn test_missing_definition_is_none() {
        let db = test_db();
        assert!(db.definition("nope").expect("definition").is_none());
    }

    #[test]
    fn test_all_tables_sorted() {
        let db = test_db();
        db.execute("CREATE TABLE b (x INT)").expect("create");
        db.execute("CREATE TABLE a (x INT)").expect("create");
        assert_eq!(db.all_tables().expect("tables"), vec!["a", "b"]);
    }
}
