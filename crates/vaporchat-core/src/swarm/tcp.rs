//! Direct-mode swarm over plain TCP.
//!
//! Announce = bind a listener; lookup = dial a configured bootstrap list.
//! Good enough for LAN use, loopback testing, and hosts that exchange
//! addresses out of band. A DHT-backed implementation plugs in behind the
//! same trait.

use super::{PeerId, Swarm, SwarmConn, SwarmKey, TransportMode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// TCP-backed swarm for direct connections.
pub struct TcpSwarm {
    bind_addr: String,
    bootstrap: Vec<String>,
    bound: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSwarm {
    /// Create a swarm that listens on `bind_addr` and dials `bootstrap`.
    pub fn new(bind_addr: impl Into<String>, bootstrap: Vec<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bootstrap,
            bound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The address the most recent join bound to.
    ///
    /// Useful when binding to port 0 in tests.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().await
    }
}

#[async_trait]
impl Swarm for TcpSwarm {
    async fn join(&self, key: &SwarmKey, mode: TransportMode) -> Result<mpsc::Receiver<SwarmConn>> {
        debug!(?key, ?mode, "joining swarm");
        let (conn_tx, conn_rx) = mpsc::channel(16);

        // Announce: accept inbound members.
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| Error::Transport(format!("bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("no local addr: {e}")))?;
        *self.bound.lock().await = Some(addr);
        info!(%addr, "announcing on swarm");

        let tx = conn_tx.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let conn = SwarmConn {
                            peer: PeerId::new(peer_addr.to_string()),
                            stream: Box::new(stream),
                        };
                        if tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        // Lookup: dial everyone we were told about.
        let bootstrap = self.bootstrap.clone();
        let dial = tokio::spawn(async move {
            for addr in bootstrap {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        let conn = SwarmConn {
                            peer: PeerId::new(addr.clone()),
                            stream: Box::new(stream),
                        };
                        if conn_tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "dial failed");
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(accept);
        tasks.push(dial);
        Ok(conn_rx)
    }

    async fn leave(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key() -> SwarmKey {
        SwarmKey([0u8; 32])
    }

    #[tokio::test]
    async fn test_dialer_reaches_listener() {
        let server = TcpSwarm::new("127.0.0.1:0", vec![]);
        let mut server_rx = server.join(&key(), TransportMode::Direct).await.expect("join");
        let addr = server.local_addr().await.expect("bound");

        let client = TcpSwarm::new("127.0.0.1:0", vec![addr.to_string()]);
        let mut client_rx = client.join(&key(), TransportMode::Direct).await.expect("join");

        let mut inbound = server_rx.recv().await.expect("inbound conn");
        let mut outbound = client_rx.recv().await.expect("outbound conn");
        assert_eq!(outbound.peer.as_str(), addr.to_string());

        outbound.stream.write_all(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        server.leave().await.expect("leave");
        client.leave().await.expect("leave");
    }

    #[tokio::test]
    async fn test_leave_stops_accepting() {
        let server = TcpSwarm::new("127.0.0.1:0", vec![]);
        let mut rx = server.join(&key(), TransportMode::Direct).await.expect("join");
        server.leave().await.expect("leave");
        // The accept task is gone, so the channel drains and closes.
        assert!(rx.recv().await.is_none());
    }
}
