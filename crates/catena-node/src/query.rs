//! The line-oriented query endpoint.
//!
//! A client sends its username (hex public key, or `random` for an
//! ephemeral identity), its password (hex private key), a database name,
//! and then SQL statements, one per line. Read-only statements run
//! against the confirmed chain state; mutating statements are signed
//! into a transaction and queued on the mempool. Field metadata precedes
//! rows; `#done`, `#queued`, or `#error` terminates each response.

use std::sync::Arc;

use catena_chain::Transaction;
use catena_crypto::{keys, KeyPair, SigningKey, VerifyingKey};
use catena_engine::{BlockContext, Context, Executive};
use catena_sql::fold::FrontendRewriter;
use catena_sql::parse_statement;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::node::Node;

/// Accept query connections until the listener fails.
pub async fn serve_query(node: Arc<Node>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query endpoint listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(node, stream).await {
                debug!(error = %e, "query connection ended");
            }
        });
    }
}

async fn handle_client(node: Arc<Node>, stream: TcpStream) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let username = match lines.next_line().await? {
        Some(line) => line.trim().to_string(),
        None => return Ok(()),
    };
    let password = match lines.next_line().await? {
        Some(line) => line.trim().to_string(),
        None => return Ok(()),
    };
    let database = match lines.next_line().await? {
        Some(line) => line.trim().to_lowercase(),
        None => return Ok(()),
    };

    let keypair = match credentials(&username, &password) {
        Ok(keypair) => keypair,
        Err(message) => {
            write_line(&mut write, &format!("#error {message}")).await?;
            return Ok(());
        }
    };
    write_line(&mut write, "#ok").await?;

    while let Some(line) = lines.next_line().await? {
        let sql = line.trim();
        if sql.is_empty() {
            continue;
        }
        let responses = run_statement(&node, &keypair, &database, sql).await;
        for response in responses {
            write_line(&mut write, &response).await?;
        }
    }
    Ok(())
}

fn credentials(username: &str, password: &str) -> Result<KeyPair, String> {
    if username == "random" {
        return Ok(KeyPair::generate());
    }
    let public = VerifyingKey::from_hex(username).map_err(|e| format!("bad username: {e}"))?;
    let private = SigningKey::from_hex(password).map_err(|e| format!("bad password: {e}"))?;
    if private.verifying_key() != public {
        return Err("password does not match username".to_string());
    }
    Ok(KeyPair::from_bytes(&private.to_bytes()))
}

async fn run_statement(
    node: &Arc<Node>,
    keypair: &KeyPair,
    database: &str,
    sql: &str,
) -> Vec<String> {
    let statement = match parse_statement(sql) {
        Ok(statement) => statement,
        Err(e) => return vec![format!("#error {e}")],
    };
    let statement = match FrontendRewriter::new(env!("CARGO_PKG_VERSION")).rewrite(statement) {
        Ok(statement) => statement,
        Err(e) => return vec![format!("#error {e}")],
    };

    if statement.is_mutating() {
        // Sign a transaction continuing this invoker's counter sequence,
        // past anything already pending in the mempool.
        let invoker = keys::invoker_hash(&keypair.verifying_key);
        let persisted = {
            let chain = node.chain.lock().expect("chain mutex");
            let metadata = catena_engine::Metadata::new(chain.queue.store().database());
            match metadata.counter(&invoker) {
                Ok(counter) => counter,
                Err(e) => return vec![format!("#error {e}")],
            }
        };
        let pending = node
            .mempool
            .lock()
            .expect("mempool mutex")
            .pending_for(&invoker);
        let counter = persisted.map(|c| c + 1).unwrap_or(0) + pending;
        let tx = match Transaction::new(keypair, database, counter, statement) {
            Ok(tx) => tx,
            Err(e) => return vec![format!("#error {e}")],
        };
        node.receive_transaction(tx, None).await;
        return vec![format!("#queued {counter}")];
    }

    // Read-only: execute against the permanent store's confirmed view.
    let result = {
        let chain = node.chain.lock().expect("chain mutex");
        let db = chain.queue.store().database();
        let context = Context::new(
            database,
            keypair.verifying_key.clone(),
            BlockContext::unmined(),
        );
        Executive::new(db).perform(&statement, &context)
    };
    match result {
        Ok(rs) => {
            let mut out = Vec::with_capacity(rs.rows.len() + 2);
            out.push(format!(
                "#fields {}",
                serde_json::to_string(&rs.columns).unwrap_or_default()
            ));
            for row in rs.rows {
                let rendered: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                out.push(serde_json::to_string(&rendered).unwrap_or_default());
            }
            out.push("#done".to_string());
            out
        }
        Err(e) => vec![format!("#error {e}")],
    }
}

async fn write_line(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> std::io::Result<()> {
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_credentials() {
        let a = credentials("random", "").expect("random identity");
        let b = credentials("random", "").expect("random identity");
        assert_ne!(a.verifying_key, b.verifying_key);
    }

    #[test]
    fn test_matching_credentials() {
        let kp = KeyPair::generate();
        let restored = credentials(&kp.verifying_key.to_hex(), &kp.signing_key.to_hex())
            .expect("credentials");
        assert_eq!(restored.verifying_key, kp.verifying_key);
    }

    #[test]
    fn test_mismatched_credentials_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert!(credentials(&a.verifying_key.to_hex(), &b.signing_key.to_hex()).is_err());
    }

    #[test]
    fn test_garbage_credentials_rejected() {
        assert!(credentials("zzz", "yyy").is_err());
    }
}
