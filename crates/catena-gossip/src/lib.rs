//! # catena-gossip
//!
//! The gossip protocol: typed messages, numbered frames, and the
//! per-peer state machine. Socket plumbing stays outside this crate; the
//! node feeds decoded frames in and carries the returned events out to
//! whatever transport it uses.
//!
//! ## Modules
//!
//! - [`messages`] — the `{"t": …}`-tagged message payloads
//! - [`wire`] — `[seq, message]` frames with even/odd sequence discipline
//! - [`peer`] — peer lifecycle, request tracking, timeouts

pub mod messages;
pub mod peer;
pub mod wire;

pub use messages::GossipMessage;
pub use peer::{BlockSource, IndexInfo, Peer, PeerEvent, PeerState};
pub use wire::{Frame, Role, SequenceCounter};

/// Gossip protocol version carried in the `X-Version` handshake header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error types for gossip processing.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    /// Malformed frame, message, or peer address.
    #[error("format error: {0}")]
    Format(String),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An outstanding request passed its deadline.
    #[error("request timed out")]
    Timeout,

    /// The opening handshake was rejected.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error(transparent)]
    Chain(#[from] catena_chain::ChainError),
}

pub type Result<T> = std::result::Result<T, GossipError>;
