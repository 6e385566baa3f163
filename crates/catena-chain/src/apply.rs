//! The canonical payload reducer.
//!
//! Applies one block to a backend database. Transactions run in
//! (counter, signature) order inside per-transaction savepoints nested
//! under one block savepoint. A failing transaction is rolled back and
//! logged; the block still commits and the invoker's counter still
//! advances. A failure outside the per-transaction scope rolls the whole
//! block back.

use std::collections::HashMap;

use catena_crypto::{keys, Hash};
use catena_db::Database;
use catena_engine::metadata::RESERVED_TABLES;
use catena_engine::{BlockContext, Context, Executive, Metadata};
use tracing::warn;

use crate::block::Block;
use crate::transaction::Transaction;
use crate::{ChainError, Result};

/// The `$block*` variable values for transactions inside this block.
fn block_context(block: &Block) -> BlockContext {
    BlockContext {
        height: block.index,
        signature: block.signature,
        previous: block.previous,
        miner: block.miner,
        timestamp: block.timestamp,
    }
}

/// Apply a block to the backend.
///
/// With `replay` set, surviving transactions are executed through the
/// executive; without it only the counters, archive, and head pointer
/// advance (used when the chain database is already materialized).
pub fn apply_block(block: &Block, db: &dyn Database, difficulty: u32, replay: bool) -> Result<()> {
    let metadata = Metadata::new(db);
    match metadata.head()? {
        None => {
            if !block.is_genesis() {
                return Err(ChainError::Metadata(format!(
                    "no head pointer but block index is {}",
                    block.index
                )));
            }
        }
        Some((head_index, head_hash)) => {
            if block.index != head_index + 1 || block.previous != head_hash {
                return Err(ChainError::Inconsecutive);
            }
        }
    }
    block.validate(difficulty)?;

    let block_savepoint = format!("block-{}", block.signature);
    db.savepoint(&block_savepoint)?;
    match apply_payload(block, db, replay) {
        Ok(()) => {
            db.release(&block_savepoint)?;
            Ok(())
        }
        Err(e) => {
            db.rollback_to(&block_savepoint)?;
            Err(e)
        }
    }
}

fn apply_payload(block: &Block, db: &dyn Database, replay: bool) -> Result<()> {
    let metadata = Metadata::new(db);

    // Deterministic ordering: counter ascending, signature bytes as the
    // tie-break.
    let mut transactions: Vec<&Transaction> = block.payload.transactions().iter().collect();
    transactions.sort_by(|a, b| {
        a.counter
            .cmp(&b.counter)
            .then_with(|| a.signature.to_bytes().cmp(&b.signature.to_bytes()))
    });

    // Filter: no reserved-table writes, and counters must continue each
    // invoker's accepted sequence, consecutively within the block.
    let mut next_counter: HashMap<Hash, u64> = HashMap::new();
    let mut survivors: Vec<(Hash, &Transaction)> = Vec::new();
    for tx in transactions {
        if tx.statement.touches_tables(&RESERVED_TABLES) {
            warn!(signature = %tx.signature.to_hex(), "transaction touches reserved tables, dropped");
            continue;
        }
        let invoker = keys::invoker_hash(&tx.invoker);
        let expected = match next_counter.get(&invoker) {
            Some(n) => *n,
            None => metadata.counter(&invoker)?.map(|c| c + 1).unwrap_or(0),
        };
        if tx.counter != expected {
            warn!(
                signature = %tx.signature.to_hex(),
                counter = tx.counter,
                expected,
                "transaction counter out of sequence, dropped"
            );
            continue;
        }
        next_counter.insert(invoker, expected + 1);
        survivors.push((invoker, tx));
    }

    let context_block = block_context(block);
    for (invoker, tx) in survivors {
        let savepoint = format!("tr-{}", tx.signature.to_hex());
        db.savepoint(&savepoint)?;
        let outcome = if replay {
            let context = Context::new(
                tx.database.clone(),
                tx.invoker.clone(),
                context_block.clone(),
            );
            Executive::new(db)
                .perform(&tx.statement, &context)
                .map(|_| ())
        } else {
            Ok(())
        };
        match outcome {
            Ok(()) => db.release(&savepoint)?,
            Err(e) => {
                // Isolated: the transaction rolls back, the block commits.
                warn!(
                    signature = %tx.signature.to_hex(),
                    error = %e,
                    "transaction failed, rolled back"
                );
                db.rollback_to(&savepoint)?;
            }
        }
        // Counter advances for every filter survivor, success or not.
        metadata.set_counter(&invoker, tx.counter)?;
    }

    let payload = serde_json::to_vec(&block.payload).map_err(|e| ChainError::Format(e.to_string()))?;
    metadata.archive_block(&block.signature, block.index, &block.previous, &payload)?;
    metadata.set_head(block.index, &block.signature)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow;
    use catena_crypto::KeyPair;
    use catena_db::{SqliteDatabase, Value};
    use catena_sql::parse_statement;

    fn fresh_db() -> SqliteDatabase {
        let db = SqliteDatabase::open_memory().expect("open");
        Metadata::new(&db).install().expect("install");
        db
    }

    fn mined_genesis() -> Block {
        let mut block = Block::genesis("g", Hash::of(b"m"), 0);
        pow::mine(&mut block, 0, &Default::default());
        block
    }

    fn mined_next(previous: &Block, timestamp: u64, transactions: Vec<Transaction>) -> Block {
        let mut block = Block::next(previous, Hash::of(b"m"), timestamp, transactions);
        pow::mine(&mut block, 0, &Default::default());
        block
    }

    fn tx(kp: &KeyPair, counter: u64, sql: &str) -> Transaction {
        Transaction::new(kp, "d", counter, parse_statement(sql).expect("parse")).expect("sign")
    }

    fn root() -> KeyPair {
        KeyPair::from_bytes(&[1u8; 32])
    }

    fn user() -> KeyPair {
        KeyPair::from_bytes(&[2u8; 32])
    }

    /// Genesis plus a block that sets up database `d` with table `test`.
    fn setup_chain(db: &SqliteDatabase) -> Block {
        let genesis = mined_genesis();
        apply_block(&genesis, db, 0, true).expect("apply genesis");
        let setup = mined_next(
            &genesis,
            1,
            vec![
                Transaction::new(
                    &root(),
                    "",
                    0,
                    parse_statement("CREATE DATABASE d;").expect("parse"),
                )
                .expect("sign"),
                tx(&root(), 1, "CREATE TABLE test (x INT);"),
            ],
        );
        apply_block(&setup, db, 0, true).expect("apply setup");
        setup
    }

    #[test]
    fn test_genesis_sets_head() {
        let db = fresh_db();
        let genesis = mined_genesis();
        apply_block(&genesis, &db, 0, true).expect("apply");
        let metadata = Metadata::new(&db);
        assert_eq!(metadata.head().expect("head"), Some((0, genesis.signature)));
        assert_eq!(metadata.archived_count().expect("count"), 1);
    }

    #[test]
    fn test_non_genesis_without_head_is_metadata_error() {
        let db = fresh_db();
        let genesis = mined_genesis();
        let b1 = mined_next(&genesis, 1, vec![]);
        assert!(matches!(
            apply_block(&b1, &db, 0, true),
            Err(ChainError::Metadata(_))
        ));
    }

    #[test]
    fn test_inconsecutive_block_rejected() {
        let db = fresh_db();
        let genesis = mined_genesis();
        apply_block(&genesis, &db, 0, true).expect("apply");
        let b1 = mined_next(&genesis, 1, vec![]);
        let b2 = mined_next(&b1, 2, vec![]);
        assert!(matches!(
            apply_block(&b2, &db, 0, true),
            Err(ChainError::Inconsecutive)
        ));
    }

    #[test]
    fn test_grant_and_insert_flow() {
        let db = fresh_db();
        let setup = setup_chain(&db);
        let user_hash = keys::invoker_hash(&user().verifying_key);

        let grant = tx(
            &root(),
            2,
            &format!(
                "GRANT insert ON test TO X'{}';",
                hex_upper(user_hash.as_bytes())
            ),
        );
        let granted = mined_next(&setup, 2, vec![grant]);
        apply_block(&granted, &db, 0, true).expect("apply");

        let insert = tx(&user(), 0, "INSERT INTO test (x) VALUES (42);");
        let block = mined_next(&granted, 3, vec![insert]);
        apply_block(&block, &db, 0, true).expect("apply");

        let rs = db.query("SELECT \"x\" FROM \"d$test\"").expect("select");
        assert_eq!(rs.rows, vec![vec![Value::Int(42)]]);
        assert_eq!(
            Metadata::new(&db).counter(&user_hash).expect("counter"),
            Some(0)
        );
    }

    #[test]
    fn test_counter_replay_is_filtered() {
        let db = fresh_db();
        let setup = setup_chain(&db);
        let user_hash = keys::invoker_hash(&user().verifying_key);

        let grant = tx(
            &root(),
            2,
            &format!(
                "GRANT insert ON test TO X'{}';",
                hex_upper(user_hash.as_bytes())
            ),
        );
        let granted = mined_next(&setup, 2, vec![grant]);
        apply_block(&granted, &db, 0, true).expect("apply");

        let first = tx(&user(), 0, "INSERT INTO test (x) VALUES (1);");
        let block = mined_next(&granted, 3, vec![first]);
        apply_block(&block, &db, 0, true).expect("apply");

        // A replayed counter 0 is dropped; counter 1 is accepted.
        let replayed = tx(&user(), 0, "INSERT INTO test (x) VALUES (2);");
        let fresh = tx(&user(), 1, "INSERT INTO test (x) VALUES (3);");
        let block = mined_next(&block, 3, vec![replayed, fresh]);
        apply_block(&block, &db, 0, true).expect("apply");

        let rs = db
            .query("SELECT \"x\" FROM \"d$test\" ORDER BY \"x\" ASC")
            .expect("select");
        assert_eq!(rs.rows, vec![vec![Value::Int(1)], vec![Value::Int(3)]]);
        assert_eq!(
            Metadata::new(&db).counter(&user_hash).expect("counter"),
            Some(1)
        );
    }

    #[test]
    fn test_same_invoker_counters_must_be_consecutive_within_block() {
        let db = fresh_db();
        let setup = setup_chain(&db);

        // Counters 2 and 4 from root: 2 applies, 4 has a gap and drops.
        let a = tx(&root(), 2, "INSERT INTO test (x) VALUES (10);");
        let b = tx(&root(), 4, "INSERT INTO test (x) VALUES (11);");
        let block = mined_next(&setup, 2, vec![a, b]);
        apply_block(&block, &db, 0, true).expect("apply");

        let rs = db.query("SELECT \"x\" FROM \"d$test\"").expect("select");
        assert_eq!(rs.rows, vec![vec![Value::Int(10)]]);
    }

    #[test]
    fn test_reserved_table_transactions_dropped() {
        let db = fresh_db();
        let setup = setup_chain(&db);
        let poison = tx(&root(), 2, "INSERT INTO users (x) VALUES (1);");
        let block = mined_next(&setup, 2, vec![poison]);
        apply_block(&block, &db, 0, true).expect("apply");
        // Dropped before execution, so the root counter did not advance.
        let root_hash = keys::invoker_hash(&root().verifying_key);
        assert_eq!(
            Metadata::new(&db).counter(&root_hash).expect("counter"),
            Some(1)
        );
    }

    #[test]
    fn test_failed_transaction_is_isolated() {
        let db = fresh_db();
        let setup = setup_chain(&db);

        // Counter 2 fails (unknown table), counter 3 still applies, and
        // the failed counter still advances.
        let bad = tx(&root(), 2, "INSERT INTO missing (x) VALUES (1);");
        let good = tx(&root(), 3, "INSERT INTO test (x) VALUES (5);");
        let block = mined_next(&setup, 2, vec![bad, good]);
        apply_block(&block, &db, 0, true).expect("apply");

        let rs = db.query("SELECT \"x\" FROM \"d$test\"").expect("select");
        assert_eq!(rs.rows, vec![vec![Value::Int(5)]]);
        let root_hash = keys::invoker_hash(&root().verifying_key);
        assert_eq!(
            Metadata::new(&db).counter(&root_hash).expect("counter"),
            Some(3)
        );
        assert_eq!(Metadata::new(&db).head().expect("head").map(|h| h.0), Some(2));
    }

    #[test]
    fn test_privilege_isolation_leaves_state_unchanged() {
        let db = fresh_db();
        let setup = setup_chain(&db);
        let user_hash = keys::invoker_hash(&user().verifying_key);

        let grant = tx(
            &root(),
            2,
            &format!(
                "GRANT insert ON test TO X'{}';",
                hex_upper(user_hash.as_bytes())
            ),
        );
        let granted = mined_next(&setup, 2, vec![grant]);
        apply_block(&granted, &db, 0, true).expect("apply");

        let insert = tx(&user(), 0, "INSERT INTO test (x) VALUES (1);");
        let drop = tx(&user(), 1, "DROP TABLE test;");
        let block = mined_next(&granted, 3, vec![insert, drop]);
        apply_block(&block, &db, 0, true).expect("apply");

        // The drop failed with a privilege error; the insert survived.
        let rs = db.query("SELECT \"x\" FROM \"d$test\"").expect("select");
        assert_eq!(rs.rows, vec![vec![Value::Int(1)]]);
    }

    #[test]
    fn test_determinism_across_fresh_databases() {
        let blocks = {
            let db = fresh_db();
            let genesis = mined_genesis();
            apply_block(&genesis, &db, 0, true).expect("apply");
            let setup = mined_next(
                &genesis,
                1,
                vec![
                    Transaction::new(
                        &root(),
                        "",
                        0,
                        parse_statement("CREATE DATABASE d;").expect("parse"),
                    )
                    .expect("sign"),
                    tx(&root(), 1, "CREATE TABLE test (x INT);"),
                    tx(&root(), 2, "INSERT INTO test (x) VALUES (7), (8);"),
                ],
            );
            apply_block(&setup, &db, 0, true).expect("apply");
            vec![genesis, setup]
        };

        let mut states = Vec::new();
        for _ in 0..2 {
            let db = fresh_db();
            for block in &blocks {
                apply_block(block, &db, 0, true).expect("apply");
            }
            let rs = db
                .query("SELECT * FROM \"d$test\" ORDER BY rowid")
                .expect("select");
            states.push(rs);
        }
        assert_eq!(states[0], states[1]);
    }

    #[test]
    fn test_no_replay_advances_bookkeeping_only() {
        let db = fresh_db();
        let genesis = mined_genesis();
        apply_block(&genesis, &db, 0, true).expect("apply");
        let setup = mined_next(
            &genesis,
            1,
            vec![Transaction::new(
                &root(),
                "",
                0,
                parse_statement("CREATE DATABASE d;").expect("parse"),
            )
            .expect("sign")],
        );
        apply_block(&setup, &db, 0, false).expect("apply");

        let metadata = Metadata::new(&db);
        assert_eq!(metadata.head().expect("head").map(|h| h.0), Some(1));
        // The statement did not run.
        assert!(metadata.database_owner("d").expect("owner").is_none());
        // But the counter advanced.
        let root_hash = keys::invoker_hash(&root().verifying_key);
        assert_eq!(metadata.counter(&root_hash).expect("counter"), Some(0));
    }

    fn hex_upper(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }
}
