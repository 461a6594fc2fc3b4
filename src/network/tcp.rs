//! TCP Transport
//!
//! Accepts and dials TCP connections, surfaces each one as a [`TcpPeer`],
//! and funnels every received frame into a single inbound queue.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::{lock, read_frame, write_frame, Peer, PeerHandler, Rpc, Transport};
use crate::config::WolfStoreConfig;
use crate::error::{Error, Result};

/// TCP transport options
#[derive(Debug, Clone)]
pub struct TcpTransportOpts {
    /// Address to listen on
    pub listen_address: String,
    /// Largest frame accepted from a peer
    pub max_frame_bytes: usize,
    /// Capacity of the inbound message queue
    pub inbound_queue: usize,
    /// Timeout for establishing an outbound connection
    pub dial_timeout: Duration,
}

impl TcpTransportOpts {
    /// Derive transport options from node configuration
    pub fn from_config(config: &WolfStoreConfig) -> Self {
        Self {
            listen_address: config.node.bind_address.clone(),
            max_frame_bytes: config.transport.max_frame_bytes,
            inbound_queue: config.transport.inbound_queue,
            dial_timeout: config.dial_timeout(),
        }
    }
}

/// A TCP connection to a remote node
pub struct TcpPeer {
    remote_addr: String,
    outbound: bool,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, data).await?;
        Ok(data.len())
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// State shared between the transport handle and its background tasks
struct Shared {
    opts: TcpTransportOpts,
    handler: RwLock<Option<Arc<dyn PeerHandler>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Rpc>>>,
    shutdown: watch::Sender<bool>,
    /// Accept loop and per-connection read loops
    tasks: Mutex<JoinSet<()>>,
    /// Connections whose read loop is still running
    connections: Mutex<Vec<Arc<TcpPeer>>>,
}

impl Shared {
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpTransport {
    /// Create a new transport (not yet listening)
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(opts.inbound_queue.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                opts,
                handler: RwLock::new(None),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                shutdown,
                tasks: Mutex::new(JoinSet::new()),
                connections: Mutex::new(Vec::new()),
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            local_addr: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn set_peer_handler(&self, handler: Arc<dyn PeerHandler>) {
        let mut slot = self
            .shared
            .handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(handler);
    }

    async fn listen_and_accept(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        if self.local_addr().is_some() {
            return Err(Error::Network("transport is already listening".into()));
        }

        let listener = TcpListener::bind(&self.shared.opts.listen_address).await?;
        let addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(addr);
        tracing::info!("TCP transport listening on {}", addr);

        let shutdown_rx = self.shared.shutdown.subscribe();
        let shared = Arc::clone(&self.shared);
        self.shared.spawn(accept_loop(listener, shared, shutdown_rx));
        Ok(())
    }

    async fn dial(&self, address: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let connect = timeout(self.shared.opts.dial_timeout, TcpStream::connect(address)).await;
        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Dial {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::Dial {
                    address: address.to_string(),
                    reason: "connect timed out".into(),
                })
            }
        };

        attach(&self.shared, stream, true)
    }

    fn consume(&self) -> Result<mpsc::Receiver<Rpc>> {
        lock(&self.inbound_rx).take().ok_or(Error::ConsumerTaken)
    }

    async fn close(&self) -> Result<()> {
        if self.shared.shutdown.send_replace(true) {
            return Ok(());
        }

        // Read loops hold their own sender clones; aborting them drops the rest
        lock(&self.shared.inbound_tx).take();

        let mut tasks = std::mem::take(&mut *lock(&self.shared.tasks));
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let connections = std::mem::take(&mut *lock(&self.shared.connections));
        for peer in connections {
            if let Err(e) = peer.close().await {
                tracing::debug!("Failed to close connection to {}: {}", peer.remote_addr(), e);
            }
        }

        tracing::info!("TCP transport closed");
        Ok(())
    }
}

/// Resolve once shutdown is signalled, including before the first poll
async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *shutdown_rx.borrow_and_update();
        if closed || shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Accept connections until shutdown
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::debug!("Accepted connection from {}", addr);
                        if let Err(e) = attach(&shared, stream, false) {
                            tracing::warn!("Rejected connection from {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_signalled(&mut shutdown_rx) => break,
        }
    }

    tracing::debug!("Accept loop stopped");
}

/// Register a connection with the peer handler and start reading from it
fn attach(shared: &Arc<Shared>, stream: TcpStream, outbound: bool) -> Result<()> {
    let remote_addr = stream.peer_addr()?.to_string();
    stream.set_nodelay(true)?;

    let inbound_tx = lock(&shared.inbound_tx)
        .clone()
        .ok_or(Error::TransportClosed)?;

    let (reader, writer) = stream.into_split();
    let connection = Arc::new(TcpPeer {
        remote_addr,
        outbound,
        writer: tokio::sync::Mutex::new(writer),
    });
    let peer: Arc<dyn Peer> = connection.clone();

    let handler = shared
        .handler
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    if let Some(ref handler) = handler {
        handler.on_peer(Arc::clone(&peer))?;
    }

    lock(&shared.connections).push(Arc::clone(&connection));
    let shutdown_rx = shared.shutdown.subscribe();
    let max_frame_bytes = shared.opts.max_frame_bytes;
    let tracked = Arc::clone(shared);

    shared.spawn(async move {
        read_loop(reader, &peer, inbound_tx, shutdown_rx, max_frame_bytes).await;
        lock(&tracked.connections).retain(|live| !Arc::ptr_eq(live, &connection));
        if let Some(handler) = handler {
            handler.on_disconnect(&peer);
        }
    });

    Ok(())
}

/// Forward frames from one connection into the inbound queue
async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: &Arc<dyn Peer>,
    inbound_tx: mpsc::Sender<Rpc>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_frame_bytes: usize,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_bytes) => frame,
            _ = shutdown_signalled(&mut shutdown_rx) => break,
        };

        match frame {
            Ok(payload) => {
                tracing::trace!("Received {} bytes from {}", payload.len(), peer.remote_addr());
                let rpc = Rpc {
                    from: peer.remote_addr().to_string(),
                    payload,
                };
                tokio::select! {
                    sent = inbound_tx.send(rpc) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_signalled(&mut shutdown_rx) => break,
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading from {}: {}", peer.remote_addr(), e);
                break;
            }
        }
    }

    tracing::debug!("Connection to {} closed", peer.remote_addr());
}
