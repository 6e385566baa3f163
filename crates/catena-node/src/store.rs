//! The node database: persisted identity and peer table.
//!
//! Distinct from the chain database. Holds a `config` key/value table
//! (keys `publicKey`, `privateKey`, `uuid`, `genesisSeed`) and a `peers`
//! table of known gossip addresses.

use std::path::Path;

use catena_crypto::KeyPair;
use rusqlite::Connection;
use uuid::Uuid;

/// Config key for the node's public key (hex).
const CONFIG_PUBLIC_KEY: &str = "publicKey";
/// Config key for the node's private key (hex).
const CONFIG_PRIVATE_KEY: &str = "privateKey";
/// Config key for the node UUID.
const CONFIG_UUID: &str = "uuid";
/// Config key for the genesis seed the node was initialized with.
const CONFIG_SEED: &str = "genesisSeed";

/// Node store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt node store: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The node database.
pub struct NodeStore {
    conn: Connection,
}

impl NodeStore {
    /// Open or create the node database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    /// Open an in-memory node database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS config (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS peers (
                 url TEXT PRIMARY KEY,
                 last_seen INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(Self { conn })
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    /// Load the persisted identity, generating and persisting one on
    /// first use.
    pub fn identity(&self) -> Result<KeyPair> {
        match (self.get(CONFIG_PUBLIC_KEY)?, self.get(CONFIG_PRIVATE_KEY)?) {
            (Some(public), Some(private)) => {
                let secret: [u8; 32] = hex::decode(&private)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| StoreError::Corrupt("bad private key".into()))?;
                let keypair = KeyPair::from_bytes(&secret);
                if keypair.verifying_key.to_hex() != public {
                    return Err(StoreError::Corrupt(
                        "public key does not match private key".into(),
                    ));
                }
                Ok(keypair)
            }
            _ => {
                let keypair = KeyPair::generate();
                self.set(CONFIG_PUBLIC_KEY, &keypair.verifying_key.to_hex())?;
                self.set(CONFIG_PRIVATE_KEY, &keypair.signing_key.to_hex())?;
                Ok(keypair)
            }
        }
    }

    /// Load the persisted node UUID, generating one on first use.
    pub fn uuid(&self) -> Result<Uuid> {
        match self.get(CONFIG_UUID)? {
            Some(text) => text
                .parse()
                .map_err(|_| StoreError::Corrupt("bad node uuid".into())),
            None => {
                let uuid = Uuid::new_v4();
                self.set(CONFIG_UUID, &uuid.to_string())?;
                Ok(uuid)
            }
        }
    }

    pub fn genesis_seed(&self) -> Result<Option<String>> {
        self.get(CONFIG_SEED)
    }

    pub fn set_genesis_seed(&self, seed: &str) -> Result<()> {
        self.set(CONFIG_SEED, seed)
    }

    /// Remember a peer address.
    pub fn save_peer(&self, url: &str, last_seen: u64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO peers (url, last_seen) VALUES (?1, ?2)",
            rusqlite::params![url, last_seen as i64],
        )?;
        Ok(())
    }

    /// All remembered peer addresses.
    pub fn peers(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT url FROM peers ORDER BY last_seen DESC")?;
        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(urls)
    }

    /// Forget all peers (`--initialize`).
    pub fn truncate_peers(&self) -> Result<()> {
        self.conn.execute("DELETE FROM peers", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable() {
        let store = NodeStore::open_memory().expect("open");
        let first = store.identity().expect("identity");
        let second = store.identity().expect("identity");
        assert_eq!(first.verifying_key, second.verifying_key);
        assert_eq!(
            first.signing_key.to_bytes(),
            second.signing_key.to_bytes()
        );
    }

    #[test]
    fn test_uuid_is_stable() {
        let store = NodeStore::open_memory().expect("open");
        let first = store.uuid().expect("uuid");
        let second = store.uuid().expect("uuid");
        assert_eq!(first, second);
    }

    #[test]
    fn test_peer_table() {
        let store = NodeStore::open_memory().expect("open");
        store.save_peer("peer1:8338", 10).expect("save");
        store.save_peer("peer2:8338", 20).expect("save");
        store.save_peer("peer1:8338", 30).expect("resave");
        assert_eq!(store.peers().expect("peers"), vec!["peer1:8338", "peer2:8338"]);
        store.truncate_peers().expect("truncate");
        assert!(store.peers().expect("peers").is_empty());
    }

    #[test]
    fn test_genesis_seed_roundtrip() {
        let store = NodeStore::open_memory().expect("open");
        assert_eq!(store.genesis_seed().expect("seed"), None);
        store.set_genesis_seed("hello").expect("set");
        assert_eq!(store.genesis_seed().expect("seed"), Some("hello".into()));
    }
}
