//! Frames: `[seq, message]` JSON arrays.
//!
//! The connection initiator numbers its requests with even sequence
//! numbers starting at 0, the acceptor with odd numbers starting at 1,
//! so both sides can originate requests on one bidirectional connection
//! without collision. A response reuses the request's sequence number.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::messages::GossipMessage;
use crate::{GossipError, Result};

/// Which side of the connection this endpoint is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Allocates this side's request sequence numbers.
#[derive(Clone, Debug)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new(role: Role) -> Self {
        Self {
            next: match role {
                Role::Initiator => 0,
                Role::Acceptor => 1,
            },
        }
    }

    /// Hand out the next sequence number for an outgoing request.
    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next += 2;
        seq
    }
}

/// One frame on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub message: GossipMessage,
}

impl Frame {
    pub fn new(seq: u64, message: GossipMessage) -> Self {
        Self { seq, message }
    }

    /// Encode for transmission.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GossipError::Format(e.to_string()))
    }

    /// Decode a received frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GossipError::Format(e.to_string()))
    }
}

impl Serialize for Frame {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (self.seq, &self.message).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (seq, message): (u64, GossipMessage) = Deserialize::deserialize(deserializer)?;
        if seq > u64::MAX / 2 {
            return Err(D::Error::custom("sequence number out of range"));
        }
        Ok(Frame { seq, message })
    }
}
