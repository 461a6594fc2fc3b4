//! File Server
//!
//! Orchestrates replication: local writes are persisted and then broadcast
//! to every registered peer, bootstrap peers are dialed at startup, and a
//! single control loop processes inbound payloads until shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use futures::future::join_all;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::protocol::Payload;
use super::registry::PeerRegistry;
use crate::config::WolfStoreConfig;
use crate::error::{Error, PeerFailure, Result};
use crate::network::{lock, Peer, Rpc, Transport};
use crate::store::{DiskStore, PathTransform, Store, TeeReader};

/// Options for building a [`FileServer`]
#[derive(Clone)]
pub struct FileServerOpts {
    /// Root directory of the local store
    pub storage_root: PathBuf,
    /// Key to path mapping used by the local store
    pub path_transform: PathTransform,
    /// Peer transport
    pub transport: Arc<dyn Transport>,
    /// Addresses dialed at startup (empty entries are skipped)
    pub bootstrap_nodes: Vec<String>,
    /// How long to keep retrying a failed bootstrap dial; `None` dials once
    pub dial_retry_window: Option<Duration>,
    /// Persist payloads received from peers
    pub persist_inbound: bool,
}

impl FileServerOpts {
    /// Derive server options from node configuration
    pub fn from_config(config: &WolfStoreConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            storage_root: config.storage_root().clone(),
            path_transform: config.store.path_transform,
            transport,
            bootstrap_nodes: config.bootstrap_nodes(),
            dial_retry_window: config.dial_retry_window(),
            persist_inbound: config.cluster.persist_inbound,
        }
    }
}

/// Lifecycle of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Built but not started
    Created,
    /// Control loop running
    Running,
    /// Stop signalled
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Created => write!(f, "CREATED"),
            ServerState::Running => write!(f, "RUNNING"),
            ServerState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Point-in-time server counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub state: ServerState,
    pub peers: usize,
    pub messages_applied: u64,
    pub messages_dropped: u64,
}

/// Replication controller for one node
pub struct FileServer {
    opts: FileServerOpts,
    store: Arc<dyn Store>,
    registry: Arc<PeerRegistry>,
    state: Mutex<ServerState>,
    quit: watch::Sender<bool>,
    /// Outstanding bootstrap dials; `None` until bootstrap is launched
    pending_dials: Arc<watch::Sender<Option<usize>>>,
    dials: Mutex<JoinSet<()>>,
    messages_applied: AtomicU64,
    messages_dropped: AtomicU64,
}

impl FileServer {
    /// Create a server backed by a [`DiskStore`] at the configured root
    pub fn new(opts: FileServerOpts) -> Self {
        let store = Arc::new(DiskStore::new(opts.storage_root.clone(), opts.path_transform));
        Self::with_store(opts, store)
    }

    /// Create a server with an explicit store
    pub fn with_store(opts: FileServerOpts, store: Arc<dyn Store>) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        opts.transport.set_peer_handler(registry.clone());
        let (quit, _) = watch::channel(false);
        let (pending_dials, _) = watch::channel(None);

        Self {
            opts,
            store,
            registry,
            state: Mutex::new(ServerState::Created),
            quit,
            pending_dials: Arc::new(pending_dials),
            dials: Mutex::new(JoinSet::new()),
            messages_applied: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Registry of connected peers
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    /// Snapshot of server counters
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            state: self.state(),
            peers: self.registry.len(),
            messages_applied: self.messages_applied.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }

    /// Register a usable connection. Never fails.
    pub fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<()> {
        self.registry.register(peer);
        Ok(())
    }

    /// Persist `reader` under `key`, then broadcast the content to all peers.
    ///
    /// A store failure is returned before any peer is contacted. A broadcast
    /// failure is returned after the local write has committed.
    pub async fn store_data<R>(&self, key: &str, reader: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut tee = TeeReader::new(reader);
        let written = self.store.write(key, &mut tee).await?;
        if written != tee.buffered().len() as u64 {
            tracing::warn!(
                "Store reported {} bytes for {} but {} were read",
                written,
                key,
                tee.buffered().len()
            );
        }
        tracing::debug!("Stored {} ({} bytes)", key, written);

        let payload = Payload::new(key, tee.into_buffer());
        self.broadcast(&payload).await
    }

    /// Send one encoding of `payload` to every registered peer.
    ///
    /// Every peer is attempted; failures are collected into
    /// [`Error::Broadcast`].
    pub async fn broadcast(&self, payload: &Payload) -> Result<()> {
        let encoded = payload.encode()?;
        let peers = self.registry.snapshot();

        if peers.is_empty() {
            tracing::debug!("No peers to broadcast {} to", payload.key);
            return Ok(());
        }

        let encoded = encoded.as_slice();
        let sends = peers.iter().map(|peer| async move {
            let failure = match peer.send(encoded).await {
                Ok(n) if n == encoded.len() => None,
                Ok(n) => Some(format!("short write ({}/{} bytes)", n, encoded.len())),
                Err(e) => Some(e.to_string()),
            };
            failure.map(|reason| PeerFailure {
                peer: peer.remote_addr().to_string(),
                reason,
            })
        });
        let failed: Vec<PeerFailure> = join_all(sends).await.into_iter().flatten().collect();

        if failed.is_empty() {
            tracing::debug!("Broadcast {} to {} peers", payload.key, peers.len());
            return Ok(());
        }

        for failure in &failed {
            tracing::warn!("Failed to replicate {} to {}", payload.key, failure);
        }
        Err(Error::Broadcast {
            attempted: peers.len(),
            failed,
        })
    }

    /// Start listening, dial bootstrap peers, and run the control loop.
    /// Returns once the server is stopped.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ServerState::Created => *state = ServerState::Running,
                ServerState::Running => return Err(Error::AlreadyStarted),
                ServerState::Stopped => return Err(Error::ShuttingDown),
            }
        }

        let inbound = match self.transport_ready().await {
            Ok(inbound) => inbound,
            Err(e) => {
                *lock(&self.state) = ServerState::Stopped;
                self.quit.send_replace(true);
                return Err(e);
            }
        };

        self.bootstrap_network();
        self.run_loop(inbound).await;
        Ok(())
    }

    async fn transport_ready(&self) -> Result<mpsc::Receiver<Rpc>> {
        let inbound = self.opts.transport.consume()?;
        self.opts.transport.listen_and_accept().await?;
        Ok(inbound)
    }

    /// Signal the control loop to exit. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == ServerState::Stopped {
                tracing::debug!("Stop requested on a stopped server");
                return false;
            }
            *state = ServerState::Stopped;
        }

        self.quit.send_replace(true);
        lock(&self.dials).abort_all();
        true
    }

    /// Wait until bootstrap dialing has been launched and every dial has finished.
    /// Returns early if the server stops first.
    pub async fn wait_bootstrap(&self) {
        let mut pending = self.pending_dials.subscribe();
        let mut quit = self.quit.subscribe();

        tokio::select! {
            _ = wait_until(&mut pending, |pending| *pending == Some(0)) => {}
            _ = wait_until_set(&mut quit) => {}
        }
    }

    /// Dial every bootstrap address on its own task
    fn bootstrap_network(&self) {
        let addrs: Vec<String> = self
            .opts
            .bootstrap_nodes
            .iter()
            .filter(|addr| !addr.is_empty())
            .cloned()
            .collect();

        let mut dials = lock(&self.dials);
        self.pending_dials.send_replace(Some(addrs.len()));

        for addr in addrs {
            let transport = Arc::clone(&self.opts.transport);
            let retry_window = self.opts.dial_retry_window;
            let pending = PendingDial(Arc::clone(&self.pending_dials));

            dials.spawn(async move {
                let _pending = pending;
                tracing::info!("Attempting to connect with remote server {}", addr);
                if let Err(e) = dial_with_retry(transport.as_ref(), &addr, retry_window).await {
                    tracing::warn!("Dial error: {}", e);
                }
            });
        }
    }

    /// Process inbound messages in arrival order until quit
    async fn run_loop(&self, mut inbound: mpsc::Receiver<Rpc>) {
        let mut quit = self.quit.subscribe();

        loop {
            tokio::select! {
                _ = wait_until_set(&mut quit) => break,
                message = inbound.recv() => {
                    match message {
                        Some(rpc) => self.handle_message(rpc).await,
                        None => {
                            tracing::warn!("Inbound message stream ended");
                            break;
                        }
                    }
                }
            }
        }

        *lock(&self.state) = ServerState::Stopped;
        self.quit.send_replace(true);
        lock(&self.dials).abort_all();

        tracing::info!("File server stopped due to user quit action");
        if let Err(e) = self.opts.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }
    }

    async fn handle_message(&self, rpc: Rpc) {
        let payload = match Payload::decode(&rpc.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping message from {}: {}", rpc.from, e);
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        tracing::debug!(
            "Received {} ({} bytes) from {}",
            payload.key,
            payload.data.len(),
            rpc.from
        );

        if self.opts.persist_inbound {
            let mut data = payload.data.as_slice();
            if let Err(e) = self.store.write(&payload.key, &mut data).await {
                tracing::warn!("Failed to persist {} from {}: {}", payload.key, rpc.from, e);
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.messages_applied.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts down the outstanding bootstrap dials when a dial task finishes or is aborted
struct PendingDial(Arc<watch::Sender<Option<usize>>>);

impl Drop for PendingDial {
    fn drop(&mut self) {
        self.0.send_modify(|pending| {
            if let Some(n) = pending {
                *n = n.saturating_sub(1);
            }
        });
    }
}

/// Resolve once `done` holds for the current value or the sender is gone
async fn wait_until<T>(rx: &mut watch::Receiver<T>, done: impl Fn(&T) -> bool) {
    loop {
        let ready = done(&*rx.borrow_and_update());
        if ready || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve once the flag is set or its sender is gone
async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    wait_until(flag, |set| *set).await
}

/// Dial once, or keep retrying with exponential backoff inside `retry_window`
async fn dial_with_retry(
    transport: &dyn Transport,
    addr: &str,
    retry_window: Option<Duration>,
) -> Result<()> {
    let Some(window) = retry_window else {
        return transport.dial(addr).await;
    };

    let policy = ExponentialBackoff {
        max_elapsed_time: Some(window),
        ..ExponentialBackoff::default()
    };

    backoff::future::retry(policy, move || async move {
        transport.dial(addr).await.map_err(|e| {
            if e.is_retryable() {
                tracing::debug!("Retrying dial to {}: {}", addr, e);
                backoff::Error::transient(e)
            } else {
                backoff::Error::permanent(e)
            }
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    use crate::network::{PeerHandler, TcpTransport, TcpTransportOpts};
    use tempfile::tempdir;

    /// Store double that records every write
    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    impl RecordingStore {
        fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        fn writes(&self) -> Vec<(String, Vec<u8>)> {
            lock(&self.writes).clone()
        }
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn write(&self, key: &str, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            if self.fail {
                return Err(Error::StoreWrite {
                    key: key.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            let len = data.len() as u64;
            lock(&self.writes).push((key.to_string(), data));
            Ok(len)
        }
    }

    /// Peer double that records every send
    struct RecordingPeer {
        addr: String,
        sent: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl RecordingPeer {
        fn new(addr: &str) -> Arc<Self> {
            Arc::new(Self { addr: addr.into(), sent: Mutex::new(Vec::new()), fail: false })
        }

        fn broken(addr: &str) -> Arc<Self> {
            Arc::new(Self { addr: addr.into(), sent: Mutex::new(Vec::new()), fail: true })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            lock(&self.sent).clone()
        }
    }

    #[async_trait]
    impl Peer for RecordingPeer {
        fn remote_addr(&self) -> &str {
            &self.addr
        }

        fn is_outbound(&self) -> bool {
            true
        }

        async fn send(&self, data: &[u8]) -> Result<usize> {
            lock(&self.sent).push(data.to_vec());
            if self.fail {
                return Err(Error::Network("broken pipe".into()));
            }
            Ok(data.len())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Transport double fed through a channel
    struct ChannelTransport {
        inbound: Mutex<Option<mpsc::Receiver<Rpc>>>,
        handler: Mutex<Option<Arc<dyn PeerHandler>>>,
        dialed: Mutex<Vec<String>>,
        dial_failures: AtomicUsize,
        failures_before_success: usize,
        listen_calls: AtomicUsize,
        close_calls: AtomicUsize,
    }

    impl ChannelTransport {
        fn new() -> (Arc<Self>, mpsc::Sender<Rpc>) {
            Self::flaky(0)
        }

        fn flaky(failures_before_success: usize) -> (Arc<Self>, mpsc::Sender<Rpc>) {
            let (tx, rx) = mpsc::channel(16);
            let transport = Arc::new(Self {
                inbound: Mutex::new(Some(rx)),
                handler: Mutex::new(None),
                dialed: Mutex::new(Vec::new()),
                dial_failures: AtomicUsize::new(0),
                failures_before_success,
                listen_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
            });
            (transport, tx)
        }

        fn connect(&self, peer: Arc<dyn Peer>) {
            let handler = lock(&self.handler).clone().unwrap();
            handler.on_peer(peer).unwrap();
        }

        fn disconnect(&self, peer: &Arc<dyn Peer>) {
            let handler = lock(&self.handler).clone().unwrap();
            handler.on_disconnect(peer);
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        fn set_peer_handler(&self, handler: Arc<dyn PeerHandler>) {
            *lock(&self.handler) = Some(handler);
        }

        async fn listen_and_accept(&self) -> Result<()> {
            self.listen_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dial(&self, address: &str) -> Result<()> {
            lock(&self.dialed).push(address.to_string());
            if self.dial_failures.load(Ordering::SeqCst) < self.failures_before_success {
                self.dial_failures.fetch_add(1, Ordering::SeqCst);
                return Err(Error::Dial { address: address.into(), reason: "refused".into() });
            }
            Ok(())
        }

        fn consume(&self) -> Result<mpsc::Receiver<Rpc>> {
            lock(&self.inbound).take().ok_or(Error::ConsumerTaken)
        }

        async fn close(&self) -> Result<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn opts(transport: Arc<ChannelTransport>, bootstrap_nodes: Vec<String>) -> FileServerOpts {
        FileServerOpts {
            storage_root: PathBuf::from("unused"),
            path_transform: PathTransform::Flat,
            transport,
            bootstrap_nodes,
            dial_retry_window: None,
            persist_inbound: true,
        }
    }

    fn rpc(from: &str, payload: Vec<u8>) -> Rpc {
        Rpc { from: from.into(), payload }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_store_data_replicates_to_every_peer() {
        let (transport, _tx) = ChannelTransport::new();
        let store = Arc::new(RecordingStore::default());
        let server = FileServer::with_store(opts(transport.clone(), vec![]), store.clone());

        let a = RecordingPeer::new("10.0.0.1:7700");
        let b = RecordingPeer::new("10.0.0.2:7700");
        transport.connect(a.clone());
        transport.connect(b.clone());
        assert_eq!(server.peers().len(), 2);

        server.store_data("greeting", &b"hello"[..]).await.unwrap();

        assert_eq!(store.writes(), vec![("greeting".to_string(), b"hello".to_vec())]);
        let expected = Payload::new("greeting", b"hello".to_vec()).encode().unwrap();
        assert_eq!(a.sent(), vec![expected.clone()]);
        assert_eq!(b.sent(), vec![expected.clone()]);
        assert_eq!(
            Payload::decode(&expected).unwrap(),
            Payload::new("greeting", b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn test_store_failure_skips_broadcast() {
        let (transport, _tx) = ChannelTransport::new();
        let store = Arc::new(RecordingStore::failing());
        let server = FileServer::with_store(opts(transport.clone(), vec![]), store);

        let peer = RecordingPeer::new("10.0.0.1:7700");
        server.on_peer(peer.clone()).unwrap();

        let err = server.store_data("doomed", &b"data"[..]).await.unwrap_err();
        assert!(matches!(err, Error::StoreWrite { .. }));
        assert!(peer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_healthy_peers_despite_failure() {
        let (transport, _tx) = ChannelTransport::new();
        let store = Arc::new(RecordingStore::default());
        let server = FileServer::with_store(opts(transport.clone(), vec![]), store.clone());

        let healthy = RecordingPeer::new("10.0.0.1:7700");
        let broken = RecordingPeer::broken("10.0.0.2:7700");
        let also_healthy = RecordingPeer::new("10.0.0.3:7700");
        for peer in [healthy.clone(), broken.clone(), also_healthy.clone()] {
            transport.connect(peer);
        }

        let err = server.store_data("report", &b"q3"[..]).await.unwrap_err();

        match err {
            Error::Broadcast { attempted, ref failed } => {
                assert_eq!(attempted, 3);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].peer, "10.0.0.2:7700");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.writes().len(), 1);
        assert_eq!(healthy.sent().len(), 1);
        assert_eq!(also_healthy.sent().len(), 1);
        assert_eq!(broken.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_peers_succeeds() {
        let (transport, _tx) = ChannelTransport::new();
        let server = FileServer::with_store(opts(transport, vec![]), Arc::new(RecordingStore::default()));

        server.broadcast(&Payload::new("lonely", b"x".to_vec())).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_not_broadcast_to() {
        let (transport, _tx) = ChannelTransport::new();
        let server = FileServer::with_store(opts(transport.clone(), vec![]), Arc::new(RecordingStore::default()));

        let gone = RecordingPeer::new("10.0.0.9:7700");
        let gone_dyn: Arc<dyn Peer> = gone.clone();
        transport.connect(gone_dyn.clone());
        transport.disconnect(&gone_dyn);

        server.store_data("k", &b"v"[..]).await.unwrap();
        assert!(gone.sent().is_empty());
        assert!(server.peers().is_empty());
    }

    #[tokio::test]
    async fn test_loop_survives_malformed_message() {
        let (transport, tx) = ChannelTransport::new();
        let store = Arc::new(RecordingStore::default());
        let server = Arc::new(FileServer::with_store(opts(transport.clone(), vec![]), store.clone()));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });

        tx.send(rpc("10.0.0.1:7700", vec![0xff; 5])).await.unwrap();
        let valid = Payload::new("after", b"garbage".to_vec()).encode().unwrap();
        tx.send(rpc("10.0.0.1:7700", valid)).await.unwrap();

        wait_for(|| server.stats().messages_applied == 1).await;
        let stats = server.stats();
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.state, ServerState::Running);
        assert_eq!(store.writes(), vec![("after".to_string(), b"garbage".to_vec())]);

        assert!(server.stop());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_inbound_not_persisted_when_disabled() {
        let (transport, tx) = ChannelTransport::new();
        let store = Arc::new(RecordingStore::default());
        let mut options = opts(transport.clone(), vec![]);
        options.persist_inbound = false;
        let server = Arc::new(FileServer::with_store(options, store.clone()));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });

        let payload = Payload::new("observed", b"only".to_vec()).encode().unwrap();
        tx.send(rpc("10.0.0.1:7700", payload)).await.unwrap();
        wait_for(|| server.stats().messages_applied == 1).await;
        assert!(store.writes().is_empty());

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_ends_loop_and_closes_transport_once() {
        let (transport, _tx) = ChannelTransport::new();
        let server = Arc::new(FileServer::with_store(
            opts(transport.clone(), vec![]),
            Arc::new(RecordingStore::default()),
        ));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });
        wait_for(|| transport.listen_calls.load(Ordering::SeqCst) == 1).await;

        assert!(server.stop());
        assert!(!server.stop());

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not exit")
            .unwrap()
            .unwrap();
        assert_eq!(transport.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_and_after_stop() {
        let (transport, _tx) = ChannelTransport::new();
        let server = Arc::new(FileServer::with_store(
            opts(transport.clone(), vec![]),
            Arc::new(RecordingStore::default()),
        ));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });
        wait_for(|| server.state() == ServerState::Running).await;
        assert!(matches!(server.start().await, Err(Error::AlreadyStarted)));

        server.stop();
        handle.await.unwrap().unwrap();
        assert!(matches!(server.start().await, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (transport, _tx) = ChannelTransport::new();
        let server = FileServer::with_store(opts(transport.clone(), vec![]), Arc::new(RecordingStore::default()));

        assert!(server.stop());
        assert!(matches!(server.start().await, Err(Error::ShuttingDown)));
        assert_eq!(transport.listen_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_dials_non_empty_addresses() {
        let (transport, _tx) = ChannelTransport::new();
        let bootstrap = vec![
            "10.0.0.1:7700".to_string(),
            String::new(),
            "10.0.0.2:7700".to_string(),
        ];
        let server = Arc::new(FileServer::with_store(
            opts(transport.clone(), bootstrap),
            Arc::new(RecordingStore::default()),
        ));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });
        wait_for(|| lock(&transport.dialed).len() == 2).await;
        server.wait_bootstrap().await;

        let mut dialed = lock(&transport.dialed).clone();
        dialed.sort();
        assert_eq!(dialed, vec!["10.0.0.1:7700", "10.0.0.2:7700"]);

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_dial_does_not_abort_start() {
        let (transport, _tx) = ChannelTransport::flaky(usize::MAX);
        let server = Arc::new(FileServer::with_store(
            opts(transport.clone(), vec!["10.0.0.1:7700".into()]),
            Arc::new(RecordingStore::default()),
        ));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });
        wait_for(|| !lock(&transport.dialed).is_empty()).await;
        server.wait_bootstrap().await;

        assert_eq!(lock(&transport.dialed).len(), 1);
        assert_eq!(server.state(), ServerState::Running);

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_aborts_retrying_dials() {
        let (transport, _tx) = ChannelTransport::flaky(usize::MAX);
        let mut options = opts(transport.clone(), vec!["10.0.0.1:7700".into()]);
        options.dial_retry_window = Some(Duration::from_secs(20));
        let server = Arc::new(FileServer::with_store(options, Arc::new(RecordingStore::default())));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });
        wait_for(|| !lock(&transport.dialed).is_empty()).await;

        let waiting = Arc::clone(&server);
        let waiter = tokio::spawn(async move { waiting.wait_bootstrap().await });

        assert!(server.stop());
        tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .expect("wait_bootstrap outlived stop")
            .unwrap();
        handle.await.unwrap().unwrap();

        let attempts = lock(&transport.dialed).len();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(lock(&transport.dialed).len(), attempts);
    }

    #[tokio::test]
    async fn test_wait_bootstrap_without_bootstrap_nodes() {
        let (transport, _tx) = ChannelTransport::new();
        let server = Arc::new(FileServer::with_store(
            opts(transport.clone(), vec![]),
            Arc::new(RecordingStore::default()),
        ));

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.start().await });
        tokio::time::timeout(Duration::from_secs(1), server.wait_bootstrap())
            .await
            .expect("bootstrap never completed");
        assert_eq!(server.state(), ServerState::Running);

        server.stop();
        handle.await.unwrap().unwrap();
    }

    fn tcp_node(root: &std::path::Path, bootstrap_nodes: Vec<String>) -> (Arc<FileServer>, Arc<TcpTransport>) {
        let transport = Arc::new(TcpTransport::new(TcpTransportOpts {
            listen_address: "127.0.0.1:0".into(),
            max_frame_bytes: 1024 * 1024,
            inbound_queue: 16,
            dial_timeout: Duration::from_secs(2),
        }));
        let server = Arc::new(FileServer::new(FileServerOpts {
            storage_root: root.to_path_buf(),
            path_transform: PathTransform::Cas,
            transport: transport.clone(),
            bootstrap_nodes,
            dial_retry_window: None,
            persist_inbound: true,
        }));
        (server, transport)
    }

    #[tokio::test]
    async fn test_write_replicates_between_tcp_nodes() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();

        let (node_a, transport_a) = tcp_node(dir_a.path(), vec![]);
        let running_a = Arc::clone(&node_a);
        let handle_a = tokio::spawn(async move { running_a.start().await });
        wait_for(|| transport_a.local_addr().is_some()).await;
        let addr_a = transport_a.local_addr().unwrap().to_string();

        let (node_b, _transport_b) = tcp_node(dir_b.path(), vec![addr_a]);
        let running_b = Arc::clone(&node_b);
        let handle_b = tokio::spawn(async move { running_b.start().await });
        node_b.wait_bootstrap().await;
        assert_eq!(node_b.peers().len(), 1);
        wait_for(|| node_a.peers().len() == 1).await;

        node_b.store_data("photos/cat.jpg", &b"not really a jpeg"[..]).await.unwrap();

        wait_for(|| node_a.stats().messages_applied == 1).await;
        let store_a = DiskStore::new(dir_a.path(), PathTransform::Cas);
        assert_eq!(store_a.read("photos/cat.jpg").await.unwrap(), b"not really a jpeg");
        let store_b = DiskStore::new(dir_b.path(), PathTransform::Cas);
        assert_eq!(store_b.read("photos/cat.jpg").await.unwrap(), b"not really a jpeg");
        assert_eq!(node_b.stats().messages_applied, 0);

        node_b.stop();
        node_a.stop();
        handle_b.await.unwrap().unwrap();
        handle_a.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_retries_within_window() {
        let (transport, _tx) = ChannelTransport::flaky(2);

        dial_with_retry(transport.as_ref(), "10.0.0.1:7700", Some(Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(lock(&transport.dialed).len(), 3);
    }
}
