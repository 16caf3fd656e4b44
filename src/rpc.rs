//! Peer-to-peer messages and the transports that carry them.
use crate::error::{Error, Result};
use crate::peer::{Peer, PeerId, Rank};
use crate::world_view::WorldView;
use async_trait::async_trait;
use bytes::Bytes;
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[cfg(feature = "http-rpc")]
pub mod http;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Heartbeat { id: PeerId, rank: Rank },
    WorldView(WorldView),
}

impl Message {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Message> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Best-effort delivery to every configured peer. No ordering, no
/// retransmission; a lost message is superseded by the next period's.
#[async_trait]
pub trait Transport: Clone + Send + Sync + 'static {
    async fn broadcast(&self, message: Bytes) -> Result<()>;

    async fn recv(&self) -> Result<Bytes>;
}

/// Pulls a peer's full world view, used by a freshly promoted primary.
#[async_trait]
pub trait Handoff: Clone + Send + Sync + 'static {
    async fn fetch(&self, address: &str) -> Result<WorldView>;
}

/// For builds without a handoff endpoint; the new primary relies on the
/// periodic broadcasts alone.
#[derive(Clone, Debug, Default)]
pub struct NoHandoff;

#[async_trait]
impl Handoff for NoHandoff {
    async fn fetch(&self, address: &str) -> Result<WorldView> {
        Err(Error::Handoff(format!("no handoff transport for {}", address)))
    }
}

/// Sends each message as one datagram to every peer address.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: Arc<Vec<SocketAddr>>,
}

impl UdpTransport {
    pub async fn bind(address: &str, peers: &[Peer]) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(address).await?;
        let mut addrs = Vec::new();
        for peer in peers {
            match tokio::net::lookup_host(peer.address.as_str()).await?.next() {
                Some(addr) => addrs.push(addr),
                None => {
                    return Err(Error::Config(format!(
                        "peer {} address {} does not resolve",
                        peer.id, peer.address
                    )))
                }
            }
        }
        Ok(UdpTransport {
            socket: Arc::new(socket),
            peers: Arc::new(addrs),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn broadcast(&self, message: Bytes) -> Result<()> {
        if message.len() > MAX_DATAGRAM {
            return Err(Error::Config(format!(
                "message of {} bytes does not fit a datagram",
                message.len()
            )));
        }
        for addr in self.peers.iter() {
            // One unreachable peer must not keep the message from the rest.
            if let Err(e) = self.socket.send_to(&message, addr).await {
                warn!(target: "net", "Send to {} failed: {}", addr, e);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        trace!(target: "net", "Received {} bytes from {}", len, from);
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }
}
