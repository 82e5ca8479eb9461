//! Development relay server
//!
//! Accepts WebSocket connections and forwards every text frame verbatim to
//! all other connected clients. The relay never parses envelopes; room
//! scoping and addressing are enforced by receivers.

use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info};

type ClientMap = Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<Message>>>>;

/// Message relay for peers without a shared process
pub struct RelayServer {
    local_addr: SocketAddr,
    clients: ClientMap,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RelayServer {
    /// Bind the listener and start accepting clients
    ///
    /// Use port 0 to let the OS choose; the bound address is available from
    /// [`RelayServer::local_addr`].
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(Error::IoError)?;
        let local_addr = listener.local_addr().map_err(Error::IoError)?;
        info!("Relay server listening on {}", local_addr);

        let clients: ClientMap = Arc::new(RwLock::new(HashMap::new()));
        let accept_task = tokio::spawn(Self::accept_loop(listener, Arc::clone(&clients)));

        Ok(Self {
            local_addr,
            clients,
            accept_task,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should dial
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Number of currently connected clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Stop accepting and drop all client sessions
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        self.clients.write().await.clear();
    }

    async fn accept_loop(listener: TcpListener, clients: ClientMap) {
        let mut next_id: u64 = 0;

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Relay accept failed: {}", e);
                    continue;
                }
            };

            next_id += 1;
            let id = next_id;
            let clients = Arc::clone(&clients);
            tokio::spawn(async move {
                if let Err(e) = Self::serve_client(id, stream, addr, clients).await {
                    debug!("Relay client {} ended: {}", id, e);
                }
            });
        }
    }

    async fn serve_client(
        id: u64,
        stream: TcpStream,
        addr: SocketAddr,
        clients: ClientMap,
    ) -> Result<()> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| Error::WebSocketError(format!("Handshake failed: {}", e)))?;
        debug!("Relay client {} connected from {}", id, addr);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        clients.write().await.insert(id, tx);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let peers = clients.read().await;
                    for (other_id, tx) in peers.iter() {
                        if *other_id == id {
                            continue;
                        }
                        let _ = tx.send(Message::Text(text.clone()));
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Relay client {} read error: {}", id, e);
                    break;
                }
            }
        }

        clients.write().await.remove(&id);
        writer_task.abort();
        debug!("Relay client {} disconnected", id);
        Ok(())
    }
}
