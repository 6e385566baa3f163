//! # catena-chain
//!
//! The ledger core: signed SQL transactions, proof-of-work blocks, chain
//! bookkeeping with fork choice, the canonical payload reducer, and the
//! bounded replay queue in front of the permanent store.
//!
//! ## Modules
//!
//! - [`transaction`] — a signed SQL statement bound to an invoker and counter
//! - [`block`] — header + payload container with canonical bytes-for-signing
//! - [`pow`] — proof-of-work mining and verification
//! - [`chain`] — a genesis-rooted block sequence
//! - [`ledger`] — chain set, orphan pool, longest-chain selection
//! - [`apply`] — deterministic application of a block's payload
//! - [`queue`] — replay queue and permanent store
//! - [`miner`] — mempool and candidate block assembly

pub mod apply;
pub mod block;
pub mod chain;
pub mod ledger;
pub mod miner;
pub mod pow;
pub mod queue;
pub mod transaction;

pub use block::{Block, Payload};
pub use chain::Chain;
pub use ledger::{Ledger, LedgerDelegate, ReceiveOutcome};
pub use miner::Mempool;
pub use queue::{PermanentStore, ReplayQueue};
pub use transaction::Transaction;

/// Maximum transactions per block.
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 100;

/// Maximum payload-for-signing size in bytes (1 MiB).
pub const MAX_PAYLOAD_FOR_SIGNING: usize = 1 << 20;

/// Error types for ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Block index/previous does not extend the known head.
    #[error("block does not extend the known head")]
    Inconsecutive,

    /// Proof-of-work check failed.
    #[error("block signature invalid")]
    Signature,

    /// A transaction in the payload failed validation.
    #[error("payload signature invalid: {0}")]
    PayloadSignature(String),

    /// More than [`MAX_TRANSACTIONS_PER_BLOCK`] transactions.
    #[error("too many transactions: {0}")]
    TooManyTransactions(usize),

    /// Payload-for-signing exceeds [`MAX_PAYLOAD_FOR_SIGNING`].
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Malformed JSON, name, or other wire-format problem.
    #[error("format error: {0}")]
    Format(String),

    /// Head pointer mismatch or other metadata corruption.
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error(transparent)]
    Engine(#[from] catena_engine::EngineError),

    #[error(transparent)]
    Db(#[from] catena_db::DbError),

    #[error(transparent)]
    Sql(#[from] catena_sql::SqlError),

    #[error(transparent)]
    Crypto(#[from] catena_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, ChainError>;
