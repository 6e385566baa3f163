//! The per-peer state machine.
//!
//! A peer advances `new → connecting → connected → querying → queried`,
//! with terminal `failed(reason)` and `ignored(reason)` branches;
//! `passive` marks peers that dialed us and are never dialed back. The
//! machine is pure: the node feeds in decoded frames and the current
//! time, and carries the returned [`PeerEvent`]s to the transport, the
//! ledger, and the candidate queue. Peer failures never propagate as
//! errors; they transition state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use catena_chain::Block;
use catena_crypto::Hash;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messages::GossipMessage;
use crate::wire::{Frame, Role, SequenceCounter};
use crate::{GossipError, Result, PROTOCOL_VERSION};

/// How long an outstanding request may wait for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle states of a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Querying,
    Queried,
    Failed(String),
    Ignored(String),
    Passive,
}

impl PeerState {
    /// Whether mined blocks should be pushed to this peer.
    pub fn accepts_broadcast(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Queried)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed(_) | PeerState::Ignored(_))
    }
}

/// The local chain view a peer needs to answer queries.
#[derive(Clone, Debug)]
pub struct IndexInfo {
    pub highest: Hash,
    pub height: u64,
    pub genesis: Hash,
    pub peers: Vec<String>,
}

/// What the node must supply to serve `query` and `fetch` requests.
pub trait BlockSource {
    fn index_info(&self) -> IndexInfo;
    fn block(&self, hash: &Hash) -> Option<Block>;
}

/// Events produced by feeding a frame to a peer.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    /// Send this frame back over the peer's connection.
    Reply(Frame),
    /// The peer advertised a chain taller than ours; fetch this hash.
    Candidate { hash: Hash, height: u64 },
    /// A block arrived (pushed or fetched).
    BlockReceived(Block),
    /// A pending transaction arrived.
    TransactionReceived(catena_chain::Transaction),
    /// The peer listed addresses of further peers.
    PeersAdvertised(Vec<String>),
}

/// Handshake headers presented when a connection opens.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub uuid: Uuid,
    pub port: u32,
    pub version: u32,
}

impl Handshake {
    /// Validate against our own identity. Rejects self-connections,
    /// version mismatches, and ports outside (0, 65536).
    pub fn validate(&self, own_uuid: &Uuid) -> Result<()> {
        if self.uuid == *own_uuid {
            return Err(GossipError::HandshakeRejected("own UUID".into()));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(GossipError::HandshakeRejected(format!(
                "version {} unsupported",
                self.version
            )));
        }
        if self.port == 0 || self.port >= 65536 {
            return Err(GossipError::HandshakeRejected(format!(
                "port {} out of range",
                self.port
            )));
        }
        Ok(())
    }
}

enum RequestKind {
    Query,
    Fetch(Hash),
}

struct PendingRequest {
    kind: RequestKind,
    deadline: Instant,
}

/// One remote peer.
pub struct Peer {
    pub url: String,
    pub uuid: Option<Uuid>,
    state: PeerState,
    counter: SequenceCounter,
    pending: HashMap<u64, PendingRequest>,
}

impl Peer {
    /// A peer we intend to dial.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            uuid: None,
            state: PeerState::New,
            counter: SequenceCounter::new(Role::Initiator),
            pending: HashMap::new(),
        }
    }

    /// A peer that dialed us.
    pub fn inbound(url: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            url: url.into(),
            uuid: Some(uuid),
            state: PeerState::Passive,
            counter: SequenceCounter::new(Role::Acceptor),
            pending: HashMap::new(),
        }
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn set_connecting(&mut self) {
        self.state = PeerState::Connecting;
    }

    /// The dial completed and the handshake validated.
    pub fn set_connected(&mut self, uuid: Uuid) {
        self.uuid = Some(uuid);
        self.state = PeerState::Connected;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(url = %self.url, %reason, "peer failed");
        self.pending.clear();
        self.state = PeerState::Failed(reason);
    }

    pub fn ignore(&mut self, reason: impl Into<String>) {
        self.pending.clear();
        self.state = PeerState::Ignored(reason.into());
    }

    /// Whether this peer is eligible for the query scheduler.
    pub fn can_query(&self) -> bool {
        matches!(
            self.state,
            PeerState::Connected | PeerState::Queried | PeerState::Passive
        )
    }

    /// Start an index query. Returns the frame to transmit.
    pub fn begin_query(&mut self, now: Instant) -> Frame {
        let seq = self.counter.next();
        self.pending.insert(
            seq,
            PendingRequest {
                kind: RequestKind::Query,
                deadline: now + REQUEST_TIMEOUT,
            },
        );
        if self.state == PeerState::Connected || self.state == PeerState::Queried {
            self.state = PeerState::Querying;
        }
        Frame::new(seq, GossipMessage::Query)
    }

    /// Request one block. Returns the frame to transmit.
    pub fn begin_fetch(&mut self, hash: Hash, now: Instant) -> Frame {
        let seq = self.counter.next();
        self.pending.insert(
            seq,
            PendingRequest {
                kind: RequestKind::Fetch(hash),
                deadline: now + REQUEST_TIMEOUT,
            },
        );
        Frame::new(seq, GossipMessage::Fetch { hash })
    }

    /// Number a fire-and-forget push (block or transaction forward). No
    /// response is expected, so nothing is registered as pending.
    pub fn announce(&mut self, message: GossipMessage) -> Frame {
        Frame::new(self.counter.next(), message)
    }

    /// Fail the peer if any outstanding request expired. Returns whether
    /// a timeout fired.
    pub fn check_timeouts(&mut self, now: Instant) -> bool {
        if self.pending.values().any(|r| now >= r.deadline) {
            self.fail("request timed out");
            true
        } else {
            false
        }
    }

    /// Process one received frame.
    ///
    /// A frame whose sequence number matches one of our outstanding
    /// requests is a response; everything else is a request from the
    /// remote side.
    pub fn handle(
        &mut self,
        frame: Frame,
        source: &dyn BlockSource,
        local_height: u64,
    ) -> Result<Vec<PeerEvent>> {
        if let Some(request) = self.pending.remove(&frame.seq) {
            return self.handle_response(request, frame, local_height);
        }
        self.handle_request(frame, source)
    }

    fn handle_request(&mut self, frame: Frame, source: &dyn BlockSource) -> Result<Vec<PeerEvent>> {
        let events = match frame.message {
            GossipMessage::Query => {
                let info = source.index_info();
                vec![PeerEvent::Reply(Frame::new(
                    frame.seq,
                    GossipMessage::Index {
                        highest: info.highest,
                        height: info.height,
                        genesis: info.genesis,
                        peers: info.peers,
                    },
                ))]
            }
            GossipMessage::Fetch { hash } => {
                let reply = match source.block(&hash) {
                    Some(block) => GossipMessage::Block { block },
                    None => GossipMessage::Error {
                        message: format!("unknown block {hash}"),
                    },
                };
                vec![PeerEvent::Reply(Frame::new(frame.seq, reply))]
            }
            GossipMessage::Block { block } => vec![PeerEvent::BlockReceived(block)],
            GossipMessage::Tx { tx, signature } => {
                if tx.signature != signature {
                    return Err(GossipError::Format(
                        "transaction signature mismatch".into(),
                    ));
                }
                vec![PeerEvent::TransactionReceived(tx)]
            }
            GossipMessage::Index { .. } | GossipMessage::Error { .. } => {
                // Responses with no matching request.
                return Err(GossipError::Format("unsolicited response".into()));
            }
        };
        Ok(events)
    }

    fn handle_response(
        &mut self,
        request: PendingRequest,
        frame: Frame,
        local_height: u64,
    ) -> Result<Vec<PeerEvent>> {
        match (request.kind, frame.message) {
            (
                RequestKind::Query,
                GossipMessage::Index {
                    highest,
                    height,
                    genesis: _,
                    peers,
                },
            ) => {
                if self.state == PeerState::Querying {
                    self.state = PeerState::Queried;
                }
                let mut events = vec![PeerEvent::PeersAdvertised(peers)];
                if height > local_height {
                    debug!(url = %self.url, height, local_height, "peer is ahead");
                    events.push(PeerEvent::Candidate {
                        hash: highest,
                        height,
                    });
                }
                Ok(events)
            }
            (RequestKind::Fetch(_), GossipMessage::Block { block }) => {
                Ok(vec![PeerEvent::BlockReceived(block)])
            }
            (RequestKind::Fetch(hash), GossipMessage::Error { message }) => {
                debug!(url = %self.url, %hash, message, "fetch failed");
                Ok(vec![])
            }
            (_, message) => Err(GossipError::Format(format!(
                "response does not answer the request: {message:?}"
            ))),
        }
    }
}
