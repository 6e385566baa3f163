//! The reserved metadata tables.
//!
//! Five tables live alongside user data in the backend and are managed
//! exclusively by the core: `grants` (authorization rows), `users`
//! (per-invoker counters), `databases` (ownership), `blocks` (append-only
//! archive), and `info` (head pointer and node facts). Transactions whose
//! declared privileges touch any of them are filtered out during payload
//! application.

use catena_crypto::Hash;
use catena_db::{Database, Value};

use crate::{EngineError, Result};

/// Table names users may never target.
pub const RESERVED_TABLES: [&str; 5] = ["grants", "users", "databases", "blocks", "info"];

/// `info` key holding the head block hash.
pub const INFO_HEAD: &str = "head";
/// `info` key holding the head block index.
pub const INFO_INDEX: &str = "index";
/// `info` key holding the genesis seed.
pub const INFO_SEED: &str = "seed";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS grants (
    user BLOB,
    kind TEXT NOT NULL,
    "table" TEXT,
    database TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    user BLOB PRIMARY KEY,
    counter INT NOT NULL
);

CREATE TABLE IF NOT EXISTS databases (
    name TEXT PRIMARY KEY,
    owner BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    signature BLOB PRIMARY KEY,
    "index" INT NOT NULL,
    previous BLOB NOT NULL,
    payload BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Escape a text value for embedding in a SQL literal.
pub fn sql_text(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Render bytes as a SQL blob literal.
pub fn sql_blob(bytes: &[u8]) -> String {
    format!("X'{}'", hex::encode_upper(bytes))
}

/// Accessor over the reserved tables of one backend database.
pub struct Metadata<'a> {
    db: &'a dyn Database,
}

impl<'a> Metadata<'a> {
    pub fn new(db: &'a dyn Database) -> Self {
        Self { db }
    }

    /// Create the reserved tables if absent.
    pub fn install(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                self.db.execute(statement)?;
            }
        }
        Ok(())
    }

    // ----- info -----

    pub fn info_get(&self, key: &str) -> Result<Option<String>> {
        let rs = self.db.query(&format!(
            "SELECT value FROM info WHERE key = {}",
            sql_text(key)
        ))?;
        Ok(rs.rows.first().and_then(|row| match row.first() {
            Some(Value::Text(s)) => Some(s.clone()),
            _ => None,
        }))
    }

    pub fn info_set(&self, key: &str, value: &str) -> Result<()> {
        self.db.execute(&format!(
            "INSERT OR REPLACE INTO info (key, value) VALUES ({}, {})",
            sql_text(key),
            sql_text(value)
        ))?;
        Ok(())
    }

    /// The head pointer, if one has been written.
    pub fn head(&self) -> Result<Option<(u64, Hash)>> {
        let hash = self.info_get(INFO_HEAD)?;
        let index = self.info_get(INFO_INDEX)?;
        match (hash, index) {
            (None, None) => Ok(None),
            (Some(hash), Some(index)) => {
                let hash = hash
                    .parse::<Hash>()
                    .map_err(|e| EngineError::Metadata(format!("bad head hash: {e}")))?;
                let index = index
                    .parse::<u64>()
                    .map_err(|e| EngineError::Metadata(format!("bad head index: {e}")))?;
                Ok(Some((index, hash)))
            }
            _ => Err(EngineError::Metadata(
                "head pointer is half-written".into(),
            )),
        }
    }

    pub fn set_head(&self, index: u64, hash: &Hash) -> Result<()> {
        self.info_set(INFO_HEAD, &hash.to_hex())?;
        self.info_set(INFO_INDEX, &index.to_string())
    }

    // ----- users -----

    /// Last executed counter for an invoker, if any transaction of theirs
    /// has been accepted.
    pub fn counter(&self, user: &Hash) -> Result<Option<u64>> {
        let rs = self.db.query(&format!(
            "SELECT counter FROM users WHERE user = {}",
            sql_blob(user.as_bytes())
        ))?;
        match rs.scalar() {
            Some(Value::Int(n)) if *n >= 0 => Ok(Some(*n as u64)),
            Some(_) => Err(EngineError::Metadata("bad counter value".into())),
            None => Ok(None),
        }
    }

    pub fn set_counter(&self, user: &Hash, counter: u64) -> Result<()> {
        self.db.execute(&format!(
            "INSERT OR REPLACE INTO users (user, counter) VALUES ({}, {counter})",
            sql_blob(user.as_bytes())
        ))?;
        Ok(())
    }

    // ----- databases -----

    pub fn database_owner(&self, name: &str) -> Result<Option<Hash>> {
        let rs = self.db.query(&format!(
            "SELECT owner FROM databases WHERE name = {}",
            sql_text(name)
        ))?;
        match rs.scalar() {
            Some(Value::Blob(bytes)) => {
                let arr: [u8; 32] = bytes
                    .clone()
                    .try_into()
                    .map_err(|_| EngineError::Metadata("bad owner hash".into()))?;
                Ok(Some(Hash::from_bytes(arr)))
            }
            Some(_) => Err(EngineError::Metadata("bad owner value".into())),
            None => Ok(None),
        }
    }

    pub fn create_database(&self, name: &str, owner: &Hash) -> Result<()> {
        self.db.execute(&format!(
            "INSERT INTO databases (name, owner) VALUES ({}, {})",
            sql_text(name),
            sql_blob(owner.as_bytes())
        ))?;
        Ok(())
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        self.db
            .execute(&format!("DELETE FROM databases WHERE name = {}", sql_text(name)))?;
        Ok(())
    }

    /// All database names, sorted.
    pub fn databases(&self) -> Result<Vec<String>> {
        let rs = self.db.query("SELECT name FROM databases ORDER BY name")?;
        Ok(rs
            .rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::Text(s)) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// Databases a user owns or holds any grant in, sorted.
    pub fn databases_for(&self, user: &Hash) -> Result<Vec<String>> {
        let user_blob = sql_blob(user.as_bytes());
        let rs = self.db.query(&format!(
            "SELECT name FROM databases WHERE owner = {user_blob}
             UNION
             SELECT database FROM grants WHERE user = {user_blob} OR user IS NULL
             ORDER BY name"
        ))?;
        Ok(rs
            .rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::Text(s)) => Some(s),
                _ => None,
            })
            .collect())
    }

    // ----- grants -----

    pub fn add_grant(
        &self,
        user: Option<&Hash>,
        kind: &str,
        table: Option<&str>,
        database: &str,
    ) -> Result<()> {
        let user = match user {
            Some(h) => sql_blob(h.as_bytes()),
            None => "NULL".to_string(),
        };
        let table = match table {
            Some(t) => sql_text(t),
            None => "NULL".to_string(),
        };
        self.db.execute(&format!(
            "INSERT INTO grants (user, kind, \"table\", database) VALUES ({user}, {}, {table}, {})",
            sql_text(kind),
            sql_text(database)
        ))?;
        Ok(())
    }

    pub fn remove_grant(
        &self,
        user: Option<&Hash>,
        kind: &str,
        table: Option<&str>,
        database: &str,
    ) -> Result<()> {
        let user = match user {
            Some(h) => format!("user = {}", sql_blob(h.as_bytes())),
            None => "user IS NULL".to_string(),
        };
        let table = match table {
            Some(t) => format!("\"table\" = {}", sql_text(t)),
            None => "\"table\" IS NULL".to_string(),
        };
        self.db.execute(&format!(
            "DELETE FROM grants WHERE {user} AND kind = {} AND {table} AND database = {}",
            sql_text(kind),
            sql_text(database)
        ))?;
        Ok(())
    }

    // ----- blocks -----

    /// Append a block to the archive.
    pub fn archive_block(
        &self,
        signature: &Hash,
        index: u64,
        previous: &Hash,
        payload: &[u8],
    ) -> Result<()> {
        self.db.execute(&format!(
            "INSERT INTO blocks (signature, \"index\", previous, payload) VALUES ({}, {index}, {}, {})",
            sql_blob(signature.as_bytes()),
            sql_blob(previous.as_bytes()),
            sql_blob(payload)
        ))?;
        Ok(())
    }

    /// Number of archived blocks.
    pub fn archived_count(&self) -> Result<u64> {
        let rs = self.db.query("SELECT COUNT(*) FROM blocks")?;
        match rs.scalar() {
            Some(Value::Int(n)) => Ok(*n as u64),
            _ => Err(EngineError::Metadata("bad archive count".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catena_db::SqliteDatabase;

    fn test_db() -> SqliteDatabase {
        let db = SqliteDatabase::open_memory().expect("open");
        Metadata::new(&db).install().expect("install");
        db
    }

    #[test]
    fn test_install_is_idempotent() {
        let db = test_db();
        Metadata::new(&db).install().expect("reinstall");
    }

    #[test]
    fn test_head_roundtrip() {
        let db = test_db();
        let meta = Metadata::new(&db);
        assert!(meta.head().expect("head").is_none());
        let hash = Hash::of(b"block");
        meta.set_head(3, &hash).expect("set");
        assert_eq!(meta.head().expect("head"), Some((3, hash)));
    }

    #[test]
    fn test_half_written_head_is_error() {
        let db = test_db();
        let meta = Metadata::new(&db);
        meta.info_set(INFO_HEAD, &Hash::zero().to_hex()).expect("set");
        assert!(meta.head().is_err());
    }

    #[test]
    fn test_counter_roundtrip() {
        let db = test_db();
        let meta = Metadata::new(&db);
        let user = Hash::of(b"user");
        assert_eq!(meta.counter(&user).expect("counter"), None);
        meta.set_counter(&user, 0).expect("set");
        assert_eq!(meta.counter(&user).expect("counter"), Some(0));
        meta.set_counter(&user, 1).expect("set");
        assert_eq!(meta.counter(&user).expect("counter"), Some(1));
    }

    #[test]
    fn test_database_ownership() {
        let db = test_db();
        let meta = Metadata::new(&db);
        let owner = Hash::of(b"owner");
        assert!(meta.database_owner("d").expect("owner").is_none());
        meta.create_database("d", &owner).expect("create");
        assert_eq!(meta.database_owner("d").expect("owner"), Some(owner));
        meta.drop_database("d").expect("drop");
        assert!(meta.database_owner("d").expect("owner").is_none());
    }

    #[test]
    fn test_databases_for_user() {
        let db = test_db();
        let meta = Metadata::new(&db);
        let alice = Hash::of(b"alice");
        let bob = Hash::of(b"bob");
        meta.create_database("mine", &alice).expect("create");
        meta.create_database("theirs", &bob).expect("create");
        meta.add_grant(Some(&alice), "insert", Some("t"), "theirs")
            .expect("grant");
        assert_eq!(
            meta.databases_for(&alice).expect("list"),
            vec!["mine", "theirs"]
        );
        assert_eq!(meta.databases_for(&bob).expect("list"), vec!["theirs"]);
    }

    #[test]
    fn test_grant_add_remove() {
        let db = test_db();
        let meta = Metadata::new(&db);
        meta.add_grant(None, "insert", Some("t"), "d").expect("add");
        meta.remove_grant(None, "insert", Some("t"), "d").expect("remove");
        let rs = db.query("SELECT COUNT(*) FROM grants").expect("count");
        assert_eq!(rs.scalar(), Some(&Value::Int(0)));
    }

    #[test]
    fn test_archive() {
        let db = test_db();
        let meta = Metadata::new(&db);
        let sig = Hash::of(b"sig");
        meta.archive_block(&sig, 0, &Hash::zero(), b"{}").expect("archive");
        assert_eq!(meta.archived_count().expect("count"), 1);
    }
}
