//! Gossip connection plumbing.
//!
//! Line-framed JSON over TCP: the first line each side sends is its
//! handshake (the `X-UUID` / `X-Port` / `X-Version` contract as a JSON
//! object), every following line is one `[seq, message]` frame. The
//! protocol state machine itself lives in `catena-gossip`; this module
//! only moves lines between sockets and the node.

use std::sync::Arc;

use catena_gossip::peer::Handshake;
use catena_gossip::{Frame, Peer, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::node::Node;

/// The handshake line.
#[derive(Debug, Serialize, Deserialize)]
struct WireHandshake {
    uuid: Uuid,
    port: u32,
    version: u32,
}

impl WireHandshake {
    fn own(node: &Node) -> Self {
        Self {
            uuid: node.uuid,
            port: node.gossip_port as u32,
            version: PROTOCOL_VERSION,
        }
    }

    fn to_handshake(&self) -> Handshake {
        Handshake {
            uuid: self.uuid,
            port: self.port,
            version: self.version,
        }
    }
}

/// Accept inbound gossip connections until the listener fails.
pub async fn serve_gossip(node: Arc<Node>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "gossip endpoint listening");
    loop {
        let (stream, addr) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_inbound(node, stream, addr.ip().to_string()).await {
                debug!(error = %e, "inbound gossip connection ended");
            }
        });
    }
}

async fn handle_inbound(
    node: Arc<Node>,
    stream: TcpStream,
    remote_ip: String,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // Their handshake first, then ours in reply.
    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let hello: WireHandshake = match serde_json::from_str(&first) {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "malformed handshake");
            return Ok(());
        }
    };
    if let Err(e) = hello.to_handshake().validate(&node.uuid) {
        warn!(error = %e, "handshake rejected");
        return Ok(());
    }
    let own = serde_json::to_string(&WireHandshake::own(&node)).unwrap_or_default();
    write.write_all(own.as_bytes()).await?;
    write.write_all(b"\n").await?;

    let url = format!("{remote_ip}:{}", hello.port);
    let (sender, receiver) = mpsc::unbounded_channel();
    node.register_connection(&url, sender, Peer::inbound(&url, hello.uuid))
        .await;
    spawn_writer(receiver, write);

    pump_frames(node, lines, url).await
}

/// Dial a peer, run the handshake, and pump frames until the connection
/// drops. The peer ends up `failed` on any error.
pub async fn dial(node: Arc<Node>, url: String) {
    {
        let mut scheduler = node.scheduler.lock().await;
        let peer = scheduler
            .peers
            .entry(url.clone())
            .or_insert_with(|| Peer::new(&url));
        peer.set_connecting();
    }

    match connect(node.clone(), &url).await {
        Ok(()) => {}
        Err(e) => {
            let mut scheduler = node.scheduler.lock().await;
            if let Some(peer) = scheduler.peers.get_mut(&url) {
                peer.fail(e.to_string());
            }
        }
    }
}

async fn connect(node: Arc<Node>, url: &str) -> std::io::Result<()> {
    let stream = TcpStream::connect(url).await?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let own = serde_json::to_string(&WireHandshake::own(&node)).unwrap_or_default();
    write.write_all(own.as_bytes()).await?;
    write.write_all(b"\n").await?;

    let Some(reply) = lines.next_line().await? else {
        return Err(std::io::Error::other("peer closed during handshake"));
    };
    let hello: WireHandshake =
        serde_json::from_str(&reply).map_err(std::io::Error::other)?;
    hello
        .to_handshake()
        .validate(&node.uuid)
        .map_err(std::io::Error::other)?;

    let (sender, receiver) = mpsc::unbounded_channel();
    {
        let mut peer = Peer::new(url);
        peer.set_connected(hello.uuid);
        node.register_connection(url, sender, peer).await;
    }
    spawn_writer(receiver, write);

    pump_frames(node, lines, url.to_string()).await
}

fn spawn_writer(
    mut receiver: mpsc::UnboundedReceiver<Frame>,
    mut write: tokio::net::tcp::OwnedWriteHalf,
) {
    tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            let Ok(text) = frame.encode() else { break };
            if write.write_all(text.as_bytes()).await.is_err() {
                break;
            }
            if write.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });
}

async fn pump_frames(
    node: Arc<Node>,
    mut lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    url: String,
) -> std::io::Result<()> {
    while let Some(line) = lines.next_line().await? {
        match Frame::decode(&line) {
            Ok(frame) => node.handle_frame(&url, frame).await,
            Err(e) => {
                warn!(url, error = %e, "malformed frame");
                break;
            }
        }
    }
    node.connection_closed(&url).await;
    Ok(())
}
