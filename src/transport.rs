//! A routed multi-frame message socket over TCP.
//!
//! Peers exchange multipart messages: a `u32` big-endian frame count, then a
//! `u32` big-endian length and payload per frame. The listener assigns every
//! accepted connection a routing id; inbound messages surface to the engine
//! tagged with it, and replies are addressed by it, so the engine never
//! handles connections directly. A reply addressed to a routing id whose
//! connection has gone away is silently dropped.

use anyhow::Context;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Most frames a peer may send in one message.
pub const MAX_FRAMES: u32 = 16;

/// Largest single frame a peer may send.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Transport-assigned identity of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingId(u64);

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Peers = Arc<Mutex<HashMap<RoutingId, mpsc::UnboundedSender<Vec<Vec<u8>>>>>>;

/// Listening side of the routed socket.
pub struct Router {
    local_addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<(RoutingId, Vec<Vec<u8>>)>,
    peers: Peers,
    accept_loop: JoinHandle<()>,
}

impl Router {
    /// Bind and start accepting peers. Inbound messages queue up until they
    /// are drained with [`recv`](Router::recv).
    pub async fn bind(addr: SocketAddr) -> Result<Router> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read local address")?;
        let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let accept_loop = tokio::spawn(accept_loop(listener, peers.clone(), inbound_tx));
        Ok(Router {
            local_addr,
            inbound,
            peers,
            accept_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next inbound message, as the raw frames the peer sent.
    pub async fn recv(&mut self) -> Option<(RoutingId, Vec<Vec<u8>>)> {
        self.inbound.recv().await
    }

    /// Queue a message to a peer.
    pub fn send(&self, routing_id: RoutingId, frames: Vec<Vec<u8>>) {
        match self.peers.lock().get(&routing_id) {
            Some(outbound) => {
                // The write task drains the queue; failure means the peer is
                // mid-disconnect, which is the same as being gone.
                let _ = outbound.send(frames);
            }
            None => tracing::trace!(%routing_id, "Dropping reply to disconnected peer"),
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Peers,
    inbound: mpsc::UnboundedSender<(RoutingId, Vec<Vec<u8>>)>,
) {
    let mut next_id = 0u64;
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Failed to accept connection: {e:#}");
                continue;
            }
        };
        let routing_id = RoutingId(next_id);
        next_id += 1;
        tracing::debug!(%routing_id, %peer_addr, "Peer connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        peers.lock().insert(routing_id, outbound_tx);
        tokio::spawn(connection(
            stream,
            routing_id,
            peers.clone(),
            inbound.clone(),
            outbound_rx,
        ));
    }
}

async fn connection(
    stream: TcpStream,
    routing_id: RoutingId,
    peers: Peers,
    inbound: mpsc::UnboundedSender<(RoutingId, Vec<Vec<u8>>)>,
    mut outbound: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let mut send_task = tokio::spawn(async move {
        while let Some(frames) = outbound.recv().await {
            if let Err(e) = write_message(&mut writer, &frames).await {
                tracing::trace!(%routing_id, "Failed to write to peer: {e:#}");
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(frames)) => {
                    if inbound.send((routing_id, frames)).is_err() {
                        // The engine is gone; no point reading further.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%routing_id, "Dropping peer: {e:#}");
                    break;
                }
            }
        }
    });

    // If either direction finishes, tear the whole connection down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    peers.lock().remove(&routing_id);
    tracing::debug!(%routing_id, "Peer disconnected");
}

/// Read one multipart message. Returns `None` on a clean end of stream; an
/// end of stream in the middle of a message is an error.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncRead + Unpin,
{
    let frame_count = match reader.read_u32().await {
        Ok(count) => count,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if frame_count == 0 || frame_count > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame count {frame_count}"),
        ));
    }
    let mut frames = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        let len = reader.read_u32().await?;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the limit"),
            ));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(Some(frames))
}

/// Write one multipart message.
pub async fn write_message<W>(writer: &mut W, frames: &[Vec<u8>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(frames.len() as u32).await?;
    for frame in frames {
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_round_trip_through_the_codec() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frames = vec![Vec::new(), b"acquire".to_vec(), b"key".to_vec()];
        write_message(&mut client, &frames).await.unwrap();
        drop(client);

        assert_eq!(read_message(&mut server).await.unwrap(), Some(frames));
        // The dropped writer reads as a clean end of stream.
        assert_eq!(read_message(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let _ = client.write_u32(1).await;
            let _ = client.write_u32(MAX_FRAME_LEN + 1).await;
        });

        let err = read_message(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn router_tags_peers_and_routes_replies() {
        let mut router = Router::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut peer = TcpStream::connect(router.local_addr()).await.unwrap();

        write_message(&mut peer, &[Vec::new(), b"hello".to_vec()])
            .await
            .unwrap();
        let (routing_id, frames) = router.recv().await.unwrap();
        assert_eq!(frames, vec![Vec::new(), b"hello".to_vec()]);

        router.send(routing_id, vec![Vec::new(), b"hi".to_vec()]);
        let reply = read_message(&mut peer).await.unwrap().unwrap();
        assert_eq!(reply, vec![Vec::new(), b"hi".to_vec()]);
    }
}
