//! The lock server event loop.
//!
//! Single-threaded by construction: the loop task owns the lock table, the
//! request table and the timer queue, and is the only place any of them is
//! touched. Each iteration waits for an inbound message no longer than the
//! soonest pending timer, then either dispatches the message or fires the
//! timer.

use crate::lock::ClientId;
use crate::lock::Key;
use crate::lock::Lock;
use crate::request::LockRequest;
use crate::request::TimerEvent;
use crate::tasks::TaskQueue;
use crate::transport;
use crate::transport::Router;
use crate::transport::RoutingId;
use crate::wire;
use crate::wire::Command;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;

pub struct LockServer {
    pub(crate) router: Router,
    pub(crate) tasks: TaskQueue<TimerEvent>,
    pub(crate) active_locks: HashMap<Key, Lock>,
    pub(crate) active_requests: HashMap<(Key, ClientId), LockRequest>,
    stopping: Arc<AtomicBool>,
}

/// Handle for stopping a running [`LockServer`] from within the process.
/// Remote peers cannot stop the server; only this handle arms the `stop`
/// command.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
}

impl LockServer {
    /// Bind the listening socket. Nothing is processed until
    /// [`run`](LockServer::run) is awaited, but peers may already connect
    /// and their messages queue up.
    pub async fn bind(addr: SocketAddr) -> Result<(LockServer, ServerHandle)> {
        let router = Router::bind(addr).await?;
        let local_addr = router.local_addr();
        let stopping = Arc::new(AtomicBool::new(false));
        let server = LockServer {
            router,
            tasks: TaskQueue::new(),
            active_locks: HashMap::new(),
            active_requests: HashMap::new(),
            stopping: stopping.clone(),
        };
        Ok((
            server,
            ServerHandle {
                local_addr,
                stopping,
            },
        ))
    }

    /// Drive the event loop until a sanctioned `stop` command arrives.
    pub async fn run(mut self) -> Result<()> {
        println!(
            "This is zlock server, running on {}",
            self.router.local_addr()
        );
        tracing::info!(addr = %self.router.local_addr(), "Lock server running");

        loop {
            // Wait for traffic, but no longer than the soonest timer.
            let message = match self.tasks.next_due_in() {
                None => self.router.recv().await,
                Some(due_in) => match tokio::time::timeout(due_in, self.router.recv()).await {
                    Ok(message) => message,
                    Err(_elapsed) => {
                        let (task, event) = self
                            .tasks
                            .pop_due()
                            .expect("timer elapsed with an empty task queue");
                        self.run_timer(task, event);
                        continue;
                    }
                },
            };
            let (routing_id, frames) = message.context("Transport closed unexpectedly")?;

            if frames.len() < 2 || !frames[0].is_empty() {
                // Not well formed as [empty, command, ...]; drop silently.
                tracing::trace!(%routing_id, "Dropping malformed message");
                continue;
            }
            match wire::parse(&frames[1..]) {
                Ok(Command::Hello) => reply(&self.router, routing_id, wire::HELLO),
                Ok(Command::Acquire {
                    key,
                    client_id,
                    timeout,
                    read_only,
                }) => {
                    tracing::debug!(
                        %routing_id,
                        key = %String::from_utf8_lossy(&key),
                        client_id = %String::from_utf8_lossy(&client_id),
                        timeout_secs = timeout.as_secs_f64(),
                        read_only,
                        "Acquire requested"
                    );
                    self.acquire_request(routing_id, key, client_id, timeout, read_only);
                }
                Ok(Command::Release { key, client_id }) => {
                    tracing::debug!(
                        %routing_id,
                        key = %String::from_utf8_lossy(&key),
                        client_id = %String::from_utf8_lossy(&client_id),
                        "Release requested"
                    );
                    self.release_request(routing_id, key, client_id);
                }
                Ok(Command::Stop) if self.stopping.load(Ordering::SeqCst) => {
                    reply(&self.router, routing_id, wire::OK);
                    break;
                }
                Ok(Command::Stop) => {
                    // Only the in-process handle may arm a stop.
                    tracing::warn!(%routing_id, "Ignoring stop from remote peer");
                    reply(&self.router, routing_id, wire::ERR_INVALID_COMMAND);
                }
                Err(err) => reply(&self.router, routing_id, err.reply()),
            }
        }

        tracing::info!("Lock server stopped");
        Ok(())
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag the server as stopping, then poke it over its own socket with a
    /// framed `stop` so the loop wakes up and exits.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);

        let mut target = self.local_addr;
        if target.ip().is_unspecified() {
            target.set_ip(match target.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let mut stream = TcpStream::connect(target)
            .await
            .with_context(|| format!("Failed to connect to own socket on {target}"))?;
        transport::write_message(&mut stream, &[Vec::new(), b"stop".to_vec()])
            .await
            .context("Failed to send stop")?;
        let response = transport::read_message(&mut stream)
            .await
            .context("Failed to read stop reply")?
            .context("Server closed the connection before acknowledging stop")?;
        ensure!(
            response.last().map(|frame| frame.as_slice()) == Some(wire::OK),
            "Unexpected stop reply: {response:?}"
        );
        Ok(())
    }
}

/// Send a single-payload reply to a peer, framed as `[empty, payload]`.
pub(crate) fn reply(router: &Router, routing_id: RoutingId, payload: &[u8]) {
    tracing::trace!(
        %routing_id,
        payload = %String::from_utf8_lossy(payload),
        "Replying"
    );
    router.send(routing_id, vec![Vec::new(), payload.to_vec()]);
}
