//! Node controller.
//!
//! Composes discovery, the shared-folder index, the inbound server, and the
//! transfer coordinator into one lifecycle:
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │                           Node                               │
//!  │                                                              │
//!  │  ┌────────────┐   ┌────────────┐   ┌──────────────────────┐  │
//!  │  │ advertise  │   │   browse   │   │   TCP accept loop    │  │
//!  │  │  (mDNS)    │   │   (mDNS)   │   │ (sessions→dispatcher)│  │
//!  │  └────────────┘   └─────┬──────┘   └──────────┬───────────┘  │
//!  │                         │                     │              │
//!  │                     PeerCache            SharedIndex         │
//!  │                         │                     ▲              │
//!  │               ┌─────────▼──────────┐   ┌──────┴──────┐       │
//!  │               │ TransferCoordinator│   │ watcher +   │       │
//!  │               │  (downloads)       │   │ rescan task │       │
//!  │               └────────────────────┘   └─────────────┘       │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every child task hangs off one cancellation token; `stop` cancels it,
//! unregisters discovery, cancels transfers, and waits for the tasks to
//! drain. Stopping twice is a no-op.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use log::info;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::config::{Identity, NodeConfig};
use crate::discovery::{Discovery, DiscoveryControl, PeerCache};
use crate::error::{ShareError, ShareResult};
use crate::index::SharedIndex;
use crate::monitor::{connectivity_channel, spawn_network_monitor, ConnectivityHandle};
use crate::protocol::{DevicePeer, Message, Ping, SharedFile};
use crate::server::run_acceptor;
use crate::session::{client_handshake, now_millis, Session};
use crate::transfer::{DownloadRequest, RetryPolicy, Transfer, TransferCoordinator};

struct NodeInner {
    identity: Identity,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    discovery: Arc<Discovery>,
    index: SharedIndex,
    peers: PeerCache,
    coordinator: TransferCoordinator,
    connectivity: ConnectivityHandle,
    stopped: AtomicBool,
}

/// A running node. Cheap to clone; all clones share the same lifecycle.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Validate the config, index the shared root, bind the listener,
    /// register with discovery, and spawn every background task.
    pub async fn start(config: NodeConfig) -> ShareResult<Node> {
        config.validate()?;
        let identity = config.identity();

        let index = SharedIndex::new(&config.shared_root)?;
        let indexed = index.rescan().await;
        info!(
            "indexed {} files under {}",
            indexed,
            config.shared_root.display()
        );

        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let peers = PeerCache::new();
        let discovery = Discovery::start(identity.clone(), local_addr.port(), peers.clone())?;
        let coordinator = TransferCoordinator::new(
            identity.clone(),
            peers.clone(),
            RetryPolicy::default(),
            cancel.child_token(),
        );
        let (connectivity, connectivity_rx) = connectivity_channel();

        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_acceptor(
            listener,
            identity.clone(),
            index.clone(),
            cancel.child_token(),
        )));
        handles.push(discovery.spawn_browse(cancel.child_token()));
        handles.extend(index.spawn_tasks(cancel.child_token()));
        let control: Arc<dyn DiscoveryControl> = discovery.clone();
        handles.push(spawn_network_monitor(
            connectivity_rx,
            control,
            peers.clone(),
            cancel.child_token(),
        ));

        info!(
            "node {} ({}) up on {}",
            identity.nickname, identity.device_id, local_addr
        );

        Ok(Node {
            inner: Arc::new(NodeInner {
                identity,
                local_addr,
                cancel,
                handles: Mutex::new(handles),
                discovery,
                index,
                peers,
                coordinator,
                connectivity,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Graceful shutdown: unregister discovery, cancel transfers, stop the
    /// accept loop, and wait for every task. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping node {}", self.inner.identity.nickname);
        self.inner.discovery.shutdown();
        self.inner.coordinator.shutdown();
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("node {} stopped", self.inner.identity.nickname);
    }

    pub fn device_id(&self) -> &str {
        &self.inner.identity.device_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Feed for host-reported connectivity transitions.
    pub fn connectivity_handle(&self) -> ConnectivityHandle {
        self.inner.connectivity.clone()
    }

    // ── peers ──────────────────────────────────────────────────────────────

    /// Restartable stream of peer-set snapshots.
    pub fn peers(&self) -> WatchStream<Vec<DevicePeer>> {
        WatchStream::new(self.inner.peers.subscribe())
    }

    pub fn peer_list(&self) -> Vec<DevicePeer> {
        self.inner.peers.snapshot()
    }

    // ── local files ────────────────────────────────────────────────────────

    /// Restartable stream of local index snapshots.
    pub fn local_files(&self) -> WatchStream<Vec<SharedFile>> {
        WatchStream::new(self.inner.index.subscribe())
    }

    pub fn local_file_list(&self) -> Vec<SharedFile> {
        self.inner.index.files()
    }

    /// Force a rescan of the shared root.
    pub fn refresh_local_index(&self) {
        self.inner.index.trigger_rescan();
    }

    // ── remote operations ──────────────────────────────────────────────────

    /// List a peer's shared files over a one-shot session.
    pub async fn remote_files(&self, peer_device_id: &str) -> ShareResult<Vec<SharedFile>> {
        self.ensure_running()?;
        let mut session = self.open_peer_session(peer_device_id).await?;

        if let Err(e) = session.send(&Message::ListFiles).await {
            session.close().await;
            return Err(e);
        }
        let files = loop {
            match session.recv().await {
                Ok(Message::FileList(list)) => break list.files,
                Ok(Message::TransferProgress(_)) => continue,
                Ok(other) => {
                    session.close().await;
                    return Err(ShareError::UnexpectedMessage {
                        expected: "FILE_LIST",
                        got: other.type_tag().to_string(),
                    });
                }
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            }
        };
        session.close().await;
        Ok(files)
    }

    /// Round-trip latency to a peer.
    pub async fn ping(&self, peer_device_id: &str) -> ShareResult<Duration> {
        self.ensure_running()?;
        let mut session = self.open_peer_session(peer_device_id).await?;

        let sent_at = Instant::now();
        if let Err(e) = session
            .send(&Message::Ping(Ping {
                timestamp: now_millis(),
            }))
            .await
        {
            session.close().await;
            return Err(e);
        }
        let latency = loop {
            match session.recv().await {
                Ok(Message::Pong(_)) => break sent_at.elapsed(),
                Ok(Message::TransferProgress(_)) => continue,
                Ok(other) => {
                    session.close().await;
                    return Err(ShareError::UnexpectedMessage {
                        expected: "PONG",
                        got: other.type_tag().to_string(),
                    });
                }
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            }
        };
        session.close().await;
        Ok(latency)
    }

    // ── transfers ──────────────────────────────────────────────────────────

    pub fn start_download(&self, request: DownloadRequest) -> ShareResult<String> {
        self.ensure_running()?;
        self.inner.coordinator.start_download(request)
    }

    pub fn cancel_transfer(&self, transfer_id: &str) {
        self.inner.coordinator.cancel_transfer(transfer_id);
    }

    pub fn observe_transfers(&self) -> WatchStream<Vec<Transfer>> {
        self.inner.coordinator.observe_transfers()
    }

    pub fn observe_transfer(&self, transfer_id: &str) -> impl Stream<Item = Transfer> + Send {
        self.inner.coordinator.observe_transfer(transfer_id)
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<Transfer> {
        self.inner.coordinator.get_transfer(transfer_id)
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn ensure_running(&self) -> ShareResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(ShareError::NotRunning);
        }
        Ok(())
    }

    async fn open_peer_session(&self, peer_device_id: &str) -> ShareResult<Session> {
        let peer = self
            .inner
            .peers
            .get(peer_device_id)
            .ok_or_else(|| ShareError::PeerUnknown(peer_device_id.to_string()))?;
        if !peer.online {
            return Err(ShareError::PeerOffline(peer_device_id.to_string()));
        }

        let mut session = Session::connect(&format!("{}:{}", peer.address, peer.port)).await?;
        if let Err(e) = client_handshake(&mut session, &self.inner.identity).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }
}
