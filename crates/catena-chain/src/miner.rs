//! Mempool and candidate block assembly.
//!
//! The miner exclusively owns the mempool; `append` is the only mutation
//! point for incoming transactions. Block assembly snapshots up to the
//! per-block transaction limit; accepted transactions are removed once
//! their block lands on the ledger.

use catena_crypto::{keys, Hash, Signature};
use tracing::debug;

use crate::block::Block;
use crate::transaction::Transaction;
use crate::{Result, MAX_TRANSACTIONS_PER_BLOCK};

/// Pending transaction buffer.
#[derive(Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Verify and enqueue a transaction. Returns `false` if an identical
    /// signature is already pending.
    pub fn append(&mut self, transaction: Transaction) -> Result<bool> {
        transaction.verify()?;
        if self
            .transactions
            .iter()
            .any(|t| t.signature == transaction.signature)
        {
            return Ok(false);
        }
        debug!(signature = %transaction.signature.to_hex(), "transaction enqueued");
        self.transactions.push(transaction);
        Ok(true)
    }

    /// Number of pending transactions from one invoker. The query
    /// endpoint offsets fresh counters by this so queued statements from
    /// the same identity stay consecutive.
    pub fn pending_for(&self, invoker: &Hash) -> u64 {
        self.transactions
            .iter()
            .filter(|t| keys::invoker_hash(&t.invoker) == *invoker)
            .count() as u64
    }

    /// Snapshot up to the per-block limit, in arrival order.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .take(MAX_TRANSACTIONS_PER_BLOCK)
            .cloned()
            .collect()
    }

    /// Drop transactions that landed in an accepted block.
    pub fn remove(&mut self, accepted: &[Signature]) {
        self.transactions
            .retain(|t| !accepted.contains(&t.signature));
    }
}

/// Assemble an unmined candidate block on top of `head`.
pub fn build_candidate(
    head: &Block,
    miner: Hash,
    timestamp: u64,
    transactions: Vec<Transaction>,
) -> Block {
    let mut transactions = transactions;
    transactions.truncate(MAX_TRANSACTIONS_PER_BLOCK);
    Block::next(head, miner, timestamp, transactions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catena_crypto::KeyPair;
    use catena_sql::parse_statement;

    fn tx(seed: u8, counter: u64) -> Transaction {
        let kp = KeyPair::from_bytes(&[seed; 32]);
        let statement = parse_statement("INSERT INTO test (x) VALUES (1);").expect("parse");
        Transaction::new(&kp, "d", counter, statement).expect("sign")
    }

    #[test]
    fn test_append_and_dedup() {
        let mut pool = Mempool::new();
        let t = tx(1, 0);
        assert!(pool.append(t.clone()).expect("append"));
        assert!(!pool.append(t).expect("append"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_append_rejects_bad_signature() {
        let mut pool = Mempool::new();
        let mut t = tx(1, 0);
        t.counter = 5;
        assert!(pool.append(t).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pending_for_counts_by_invoker() {
        let mut pool = Mempool::new();
        pool.append(tx(1, 0)).expect("append");
        pool.append(tx(1, 1)).expect("append");
        pool.append(tx(2, 0)).expect("append");
        let a = keys::invoker_hash(&KeyPair::from_bytes(&[1u8; 32]).verifying_key);
        let b = keys::invoker_hash(&KeyPair::from_bytes(&[2u8; 32]).verifying_key);
        assert_eq!(pool.pending_for(&a), 2);
        assert_eq!(pool.pending_for(&b), 1);
    }

    #[test]
    fn test_remove_accepted() {
        let mut pool = Mempool::new();
        let t0 = tx(1, 0);
        let t1 = tx(1, 1);
        pool.append(t0.clone()).expect("append");
        pool.append(t1.clone()).expect("append");
        pool.remove(&[t0.signature]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.snapshot()[0], t1);
    }

    #[test]
    fn test_candidate_respects_block_limit() {
        let head = {
            let mut b = Block::genesis("g", Hash::of(b"m"), 0);
            crate::pow::mine(&mut b, 0, &Default::default());
            b
        };
        let transactions: Vec<Transaction> =
            (0..MAX_TRANSACTIONS_PER_BLOCK as u64 + 5).map(|c| tx(1, c)).collect();
        let candidate = build_candidate(&head, Hash::of(b"m"), 1, transactions);
        assert_eq!(
            candidate.payload.transactions().len(),
            MAX_TRANSACTIONS_PER_BLOCK
        );
        assert_eq!(candidate.index, 1);
        assert_eq!(candidate.previous, head.signature);
    }
}
