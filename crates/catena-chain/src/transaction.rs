//! Signed SQL transactions.
//!
//! A transaction binds a parsed statement to an invoker public key, a
//! per-invoker counter, and a target database. The signature covers the
//! canonical serialization of those four fields: stable JSON with sorted
//! keys, the statement rendered in the standard dialect. Counters make
//! every signed payload single-use; replaying it fails the counter
//! filter during payload application.

use catena_crypto::{KeyPair, Signature, VerifyingKey};
use catena_sql::ast::Statement;
use catena_sql::parse_statement;
use catena_sql::render::{render_statement, StandardDialect};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ChainError, Result};

/// A signed SQL statement.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub invoker: VerifyingKey,
    pub database: String,
    pub counter: u64,
    pub statement: Statement,
    pub signature: Signature,
}

impl Transaction {
    /// Sign a statement, producing a complete transaction.
    pub fn new(
        keypair: &KeyPair,
        database: impl Into<String>,
        counter: u64,
        statement: Statement,
    ) -> Result<Self> {
        let database = database.into();
        validate_database_name(&database)?;
        let payload = canonical_payload(
            &keypair.verifying_key,
            &database,
            counter,
            &statement_text(&statement)?,
        );
        let signature = keypair.signing_key.sign(payload.as_bytes());
        Ok(Self {
            invoker: keypair.verifying_key.clone(),
            database,
            counter,
            statement,
            signature,
        })
    }

    /// The canonical standard-dialect text of the statement.
    pub fn statement_text(&self) -> Result<String> {
        statement_text(&self.statement)
    }

    /// Verify the signature against the canonical serialization.
    pub fn verify(&self) -> Result<()> {
        validate_database_name(&self.database)?;
        let payload = canonical_payload(
            &self.invoker,
            &self.database,
            self.counter,
            &self.statement_text()?,
        );
        self.invoker
            .verify(payload.as_bytes(), &self.signature)
            .map_err(|_| {
                ChainError::PayloadSignature(format!(
                    "transaction {} by {}",
                    self.signature.to_hex(),
                    self.invoker.to_hex()
                ))
            })
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

fn statement_text(statement: &Statement) -> Result<String> {
    Ok(render_statement(statement, &StandardDialect)?)
}

/// Stable JSON with sorted keys over the four signed fields.
fn canonical_payload(
    invoker: &VerifyingKey,
    database: &str,
    counter: u64,
    statement: &str,
) -> String {
    // serde_json maps are BTreeMap-backed, so object keys serialize sorted.
    serde_json::json!({
        "counter": counter,
        "database": database,
        "invoker": invoker.to_hex(),
        "statement": statement,
    })
    .to_string()
}

/// Database names are lowercase `[a-z][a-z0-9_]*`; the empty name is the
/// database-less scope and is valid only for statements that allow it.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Ok(());
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or(' ');
    if first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(())
    } else {
        Err(ChainError::Format(format!("invalid database name: {name}")))
    }
}

/// The wire shape of a transaction in gossip messages and block payloads.
#[derive(Serialize, Deserialize)]
struct WireTransaction {
    invoker: String,
    database: String,
    counter: u64,
    statement: String,
    signature: String,
}

impl Serialize for Transaction {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let statement = self
            .statement_text()
            .map_err(|e| serde::ser::Error::custom(e.to_string()))?;
        WireTransaction {
            invoker: self.invoker.to_hex(),
            database: self.database.clone(),
            counter: self.counter,
            statement,
            signature: self.signature.to_hex(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Transaction {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = WireTransaction::deserialize(deserializer)?;
        let invoker = VerifyingKey::from_hex(&wire.invoker).map_err(D::Error::custom)?;
        let signature = Signature::from_hex(&wire.signature).map_err(D::Error::custom)?;
        let statement = parse_statement(&wire.statement).map_err(D::Error::custom)?;
        Ok(Transaction {
            invoker,
            database: wire.database,
            counter: wire.counter,
            statement,
            signature,
        })
    }
}
