//! The node orchestrator.
//!
//! Owns the ledger (behind the ledger mutex), the miner's mempool, the
//! peer table with its candidate and query queues (behind the node
//! mutex), and the per-peer connection senders. A timer fires every two
//! seconds and runs one scheduler step. Lock order is node before peer
//! before chain; no lock is held across an await after a step is
//! decided.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use catena_chain::{
    miner, pow, Block, Ledger, Mempool, ReceiveOutcome, ReplayQueue, Transaction,
};
use catena_crypto::{keys, Hash, KeyPair};
use catena_gossip::{BlockSource, Frame, GossipMessage, IndexInfo, Peer, PeerEvent, PeerState};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval of the scheduler tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// The ledger and its materialization, guarded together by the ledger
/// mutex so splice events reach the queue atomically.
pub struct ChainState {
    pub ledger: Ledger,
    pub queue: ReplayQueue,
}

impl ChainState {
    pub fn receive(&mut self, block: Block) -> catena_chain::Result<ReceiveOutcome> {
        self.ledger.receive(block, &mut self.queue)
    }
}

/// A block hash advertised by a peer and not yet fetched.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub hash: Hash,
    pub height: u64,
    pub peer: String,
}

/// Peer table and work queues, guarded by the node mutex.
#[derive(Default)]
pub struct Scheduler {
    pub peers: HashMap<String, Peer>,
    pub candidates: VecDeque<Candidate>,
    pub query_queue: VecDeque<String>,
}

impl Scheduler {
    /// Queue a candidate unless one for the same hash is already queued.
    pub fn push_candidate(&mut self, candidate: Candidate) {
        if !self.candidates.iter().any(|c| c.hash == candidate.hash) {
            self.candidates.push_back(candidate);
        }
    }
}

/// The running node.
pub struct Node {
    pub uuid: Uuid,
    pub keypair: KeyPair,
    pub gossip_port: u16,
    pub mine: bool,
    pub chain: Arc<StdMutex<ChainState>>,
    pub scheduler: Arc<TokioMutex<Scheduler>>,
    pub mempool: Arc<StdMutex<Mempool>>,
    pub mining_abort: Arc<AtomicBool>,
    pub connections: Arc<TokioMutex<HashMap<String, mpsc::UnboundedSender<Frame>>>>,
}

/// Adapter exposing a chain snapshot to the peer state machine.
struct ChainSource {
    info: IndexInfo,
    blocks: HashMap<Hash, Block>,
}

impl BlockSource for ChainSource {
    fn index_info(&self) -> IndexInfo {
        self.info.clone()
    }

    fn block(&self, hash: &Hash) -> Option<Block> {
        self.blocks.get(hash).cloned()
    }
}

impl Node {
    pub fn new(
        uuid: Uuid,
        keypair: KeyPair,
        gossip_port: u16,
        mine: bool,
        ledger: Ledger,
        queue: ReplayQueue,
    ) -> Arc<Self> {
        Arc::new(Self {
            uuid,
            keypair,
            gossip_port,
            mine,
            chain: Arc::new(StdMutex::new(ChainState { ledger, queue })),
            scheduler: Arc::new(TokioMutex::new(Scheduler::default())),
            mempool: Arc::new(StdMutex::new(Mempool::new())),
            mining_abort: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(TokioMutex::new(HashMap::new())),
        })
    }

    /// The miner identity derived from the node keypair.
    pub fn miner_identity(&self) -> Hash {
        keys::miner_identity(&self.keypair.verifying_key)
    }

    /// Snapshot the parts of the chain the gossip layer needs. The chain
    /// lock is taken briefly and dropped before any transmission.
    fn chain_source(&self, peer_urls: Vec<String>) -> ChainSource {
        let chain = self.chain.lock().expect("chain mutex");
        let longest = chain.ledger.longest();
        let head = longest.highest();
        let info = IndexInfo {
            highest: head.signature,
            height: head.index,
            genesis: longest.genesis_hash(),
            peers: peer_urls,
        };
        let blocks = longest.blocks_from(0).map(|b| (b.signature, b.clone())).collect();
        ChainSource { info, blocks }
    }

    pub fn local_height(&self) -> u64 {
        let chain = self.chain.lock().expect("chain mutex");
        chain.ledger.longest().height()
    }

    /// Register a connection's outbound sender under its peer address.
    pub async fn register_connection(
        &self,
        url: &str,
        sender: mpsc::UnboundedSender<Frame>,
        peer: Peer,
    ) {
        self.connections
            .lock()
            .await
            .insert(url.to_string(), sender);
        let mut scheduler = self.scheduler.lock().await;
        scheduler.peers.insert(url.to_string(), peer);
        info!(url, "peer registered");
    }

    /// A connection closed; fail the peer and drop the sender.
    pub async fn connection_closed(&self, url: &str) {
        self.connections.lock().await.remove(url);
        let mut scheduler = self.scheduler.lock().await;
        if let Some(peer) = scheduler.peers.get_mut(url) {
            peer.fail("connection closed");
        }
    }

    async fn send(&self, url: &str, frame: Frame) {
        let sent = {
            let connections = self.connections.lock().await;
            match connections.get(url) {
                Some(sender) => sender.send(frame).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.connection_closed(url).await;
        }
    }

    /// Process one frame received from a peer connection.
    pub async fn handle_frame(&self, url: &str, frame: Frame) {
        let peer_urls: Vec<String> = {
            let scheduler = self.scheduler.lock().await;
            scheduler.peers.keys().cloned().collect()
        };
        let source = self.chain_source(peer_urls);
        let height = source.info.height;

        let events = {
            let mut scheduler = self.scheduler.lock().await;
            let Some(peer) = scheduler.peers.get_mut(url) else {
                warn!(url, "frame from unknown peer");
                return;
            };
            match peer.handle(frame, &source, height) {
                Ok(events) => events,
                Err(e) => {
                    peer.fail(e.to_string());
                    return;
                }
            }
        };

        for event in events {
            self.process_event(url, event).await;
        }
    }

    async fn process_event(&self, url: &str, event: PeerEvent) {
        match event {
            PeerEvent::Reply(frame) => self.send(url, frame).await,
            PeerEvent::Candidate { hash, height } => {
                let mut scheduler = self.scheduler.lock().await;
                scheduler.push_candidate(Candidate {
                    hash,
                    height,
                    peer: url.to_string(),
                });
            }
            PeerEvent::BlockReceived(block) => {
                self.receive_block(block, Some(url)).await;
            }
            PeerEvent::TransactionReceived(tx) => {
                self.receive_transaction(tx, Some(url)).await;
            }
            PeerEvent::PeersAdvertised(urls) => {
                let mut scheduler = self.scheduler.lock().await;
                for advertised in urls {
                    scheduler
                        .peers
                        .entry(advertised.clone())
                        .or_insert_with(|| Peer::new(advertised));
                }
            }
        }
    }

    /// Hand a block to the ledger and react to the outcome.
    pub async fn receive_block(&self, block: Block, from: Option<&str>) {
        let outcome = {
            let mut chain = self.chain.lock().expect("chain mutex");
            chain.receive(block.clone())
        };
        match outcome {
            Ok(ReceiveOutcome::Extended) | Ok(ReceiveOutcome::Branched) => {
                debug!(index = block.index, "block accepted");
                // The head may have moved; restart any in-flight mining.
                self.mining_abort.store(true, Ordering::Relaxed);
                let accepted: Vec<_> = block
                    .payload
                    .transactions()
                    .iter()
                    .map(|t| t.signature)
                    .collect();
                self.mempool.lock().expect("mempool mutex").remove(&accepted);
            }
            Ok(ReceiveOutcome::Orphaned { missing }) => {
                if let Some(peer) = from {
                    let mut scheduler = self.scheduler.lock().await;
                    scheduler.push_candidate(Candidate {
                        hash: missing,
                        height: block.index.saturating_sub(1),
                        peer: peer.to_string(),
                    });
                }
            }
            Ok(ReceiveOutcome::Duplicate) => {}
            Err(e) => {
                warn!(error = %e, "block rejected");
                if let Some(url) = from {
                    let mut scheduler = self.scheduler.lock().await;
                    if let Some(peer) = scheduler.peers.get_mut(url) {
                        peer.fail(format!("sent invalid block: {e}"));
                    }
                }
            }
        }
    }

    /// Enqueue a transaction, forwarding it on first sight.
    pub async fn receive_transaction(&self, tx: Transaction, from: Option<&str>) {
        let fresh = {
            let mut mempool = self.mempool.lock().expect("mempool mutex");
            match mempool.append(tx.clone()) {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!(error = %e, "transaction rejected");
                    return;
                }
            }
        };
        if fresh {
            self.broadcast(GossipMessage::tx(tx), from).await;
        }
    }

    /// Best-effort push to every connected or queried peer.
    pub async fn broadcast(&self, message: GossipMessage, except: Option<&str>) {
        let frames: Vec<(String, Frame)> = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler
                .peers
                .iter_mut()
                .filter(|(url, peer)| {
                    peer.state().accepts_broadcast() && Some(url.as_str()) != except
                })
                .map(|(url, peer)| (url.clone(), peer.announce(message.clone())))
                .collect()
        };
        for (url, frame) in frames {
            self.send(&url, frame).await;
        }
    }

    /// One scheduler step: dispatch one candidate fetch, advance one
    /// queued peer query, refill the query queue when it runs dry, and
    /// expire overdue requests.
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut outgoing: Vec<(String, Frame)> = Vec::new();

        {
            let mut scheduler = self.scheduler.lock().await;

            for peer in scheduler.peers.values_mut() {
                peer.check_timeouts(now);
            }

            if let Some(candidate) = scheduler.candidates.pop_front() {
                let known = {
                    let chain = self.chain.lock().expect("chain mutex");
                    chain.ledger.knows(&candidate.hash)
                };
                if !known {
                    if let Some(peer) = scheduler.peers.get_mut(&candidate.peer) {
                        if !peer.state().is_terminal() {
                            outgoing.push((
                                candidate.peer.clone(),
                                peer.begin_fetch(candidate.hash, now),
                            ));
                        }
                    }
                }
            }

            if let Some(url) = scheduler.query_queue.pop_front() {
                if let Some(peer) = scheduler.peers.get_mut(&url) {
                    if peer.can_query() {
                        outgoing.push((url, peer.begin_query(now)));
                    }
                }
            }
            if scheduler.query_queue.is_empty() {
                let urls: Vec<String> = scheduler.peers.keys().cloned().collect();
                scheduler.query_queue.extend(urls);
            }
        }

        for (url, frame) in outgoing {
            self.send(&url, frame).await;
        }
    }

    /// Current epoch seconds.
    pub fn now_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Run the scheduler tick loop until shutdown.
pub async fn run_ticker(node: Arc<Node>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                node.tick().await;
                dial_new_peers(&node).await;
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Dial every peer still in the `new` state (joined explicitly or
/// learned through index exchange).
async fn dial_new_peers(node: &Arc<Node>) {
    let fresh: Vec<String> = {
        let mut scheduler = node.scheduler.lock().await;
        scheduler
            .peers
            .iter_mut()
            .filter(|(_, peer)| matches!(peer.state(), PeerState::New))
            .map(|(url, peer)| {
                peer.set_connecting();
                url.clone()
            })
            .collect()
    };
    for url in fresh {
        tokio::spawn(crate::transport::dial(node.clone(), url));
    }
}

/// Run the mining loop until shutdown. Mines only while transactions are
/// pending; a freshly accepted block aborts and restarts the search.
pub async fn run_miner(node: Arc<Node>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }

        let transactions = {
            let mempool = node.mempool.lock().expect("mempool mutex");
            mempool.snapshot()
        };
        if transactions.is_empty() {
            continue;
        }

        let (head, difficulty) = {
            let chain = node.chain.lock().expect("chain mutex");
            (
                chain.ledger.longest().highest().clone(),
                chain.ledger.difficulty(),
            )
        };
        let mut candidate = miner::build_candidate(
            &head,
            node.miner_identity(),
            Node::now_timestamp(),
            transactions,
        );

        node.mining_abort.store(false, Ordering::Relaxed);
        let abort = node.mining_abort.clone();
        let mined = tokio::task::spawn_blocking(move || {
            if pow::mine(&mut candidate, difficulty, &abort) {
                Some(candidate)
            } else {
                None
            }
        })
        .await
        .ok()
        .flatten();

        if let Some(block) = mined {
            info!(index = block.index, signature = %block.signature, "block mined");
            node.receive_block(block.clone(), None).await;
            node.broadcast(GossipMessage::Block { block }, None).await;
        }
    }
}
