//! DNS-SD peer discovery.
//!
//! Two halves share one mDNS daemon:
//!
//! 1. **Advertise**: registers this node as a `_p2p-file-share._tcp.`
//!    instance carrying `deviceId`, `nickname`, and protocol `version` in
//!    the TXT record. Re-registered when connectivity returns.
//!
//! 2. **Browse**: a producer task drains the daemon's event receiver and
//!    folds additions, re-resolutions, and removals into the shared
//!    [`PeerCache`]. Consumers read the cache through a restartable
//!    `watch` snapshot stream.
//!
//! Loss events only carry the instance name, so the cache keeps a side
//! mapping from instance name to device id. Peers that stay offline past a
//! grace window are evicted by a periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::config::Identity;
use crate::error::{ShareError, ShareResult};
use crate::protocol::{
    DevicePeer, PROTOCOL_VERSION, SERVICE_TYPE, TXT_DEVICE_ID, TXT_NICKNAME, TXT_VERSION,
};

/// How long a peer may stay offline before the sweep drops it entirely.
const OFFLINE_EVICT_SECS: u64 = 60;

/// Cadence of the eviction sweep.
const EVICT_SWEEP_SECS: u64 = 10;

// ────────────────────────────────────────────────────────────────────────────
// Peer cache
// ────────────────────────────────────────────────────────────────────────────

struct CachedPeer {
    peer: DevicePeer,
    offline_since: Option<Instant>,
}

#[derive(Default)]
struct CacheState {
    /// deviceId → peer.
    peers: HashMap<String, CachedPeer>,
    /// Instance fullname → deviceId; loss events only name the instance.
    instances: HashMap<String, String>,
}

/// Thread-safe peer table shared by the browse task, the network monitor,
/// and the transfer path. Concurrent readers, one writer at a time.
#[derive(Clone)]
pub struct PeerCache {
    state: Arc<RwLock<CacheState>>,
    tx: Arc<watch::Sender<Vec<DevicePeer>>>,
}

impl PeerCache {
    pub fn new() -> PeerCache {
        let (tx, _) = watch::channel(Vec::new());
        PeerCache {
            state: Arc::new(RwLock::new(CacheState::default())),
            tx: Arc::new(tx),
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DevicePeer> {
        self.state.read().peers.get(device_id).map(|c| c.peer.clone())
    }

    pub fn snapshot(&self) -> Vec<DevicePeer> {
        let mut peers: Vec<DevicePeer> =
            self.state.read().peers.values().map(|c| c.peer.clone()).collect();
        peers.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        peers
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DevicePeer>> {
        self.tx.subscribe()
    }

    /// Insert or refresh a peer from a resolution. Returns `true` when a
    /// user-visible field actually changed, so duplicate resolutions of the
    /// same instance stay silent.
    pub fn upsert(&self, instance: &str, peer: DevicePeer) -> bool {
        let changed = {
            let mut state = self.state.write();
            state
                .instances
                .insert(instance.to_string(), peer.device_id.clone());

            match state.peers.get(&peer.device_id) {
                Some(existing) if existing.peer == peer => false,
                _ => {
                    state.peers.insert(
                        peer.device_id.clone(),
                        CachedPeer {
                            peer,
                            offline_since: None,
                        },
                    );
                    true
                }
            }
        };
        if changed {
            self.publish();
        }
        changed
    }

    /// Mark the peer behind an instance name offline; returns its device id
    /// when the instance was known.
    pub fn mark_offline_instance(&self, instance: &str) -> Option<String> {
        let device_id = {
            let mut state = self.state.write();
            let device_id = state.instances.get(instance)?.clone();
            if let Some(cached) = state.peers.get_mut(&device_id) {
                cached.peer.online = false;
                cached.offline_since = Some(Instant::now());
            }
            device_id
        };
        self.publish();
        Some(device_id)
    }

    pub fn mark_all_offline(&self) {
        {
            let mut state = self.state.write();
            let now = Instant::now();
            for cached in state.peers.values_mut() {
                if cached.peer.online {
                    cached.peer.online = false;
                    cached.offline_since = Some(now);
                }
            }
        }
        self.publish();
    }

    /// Drop peers that have been offline longer than `grace`. Returns the
    /// number of evicted entries.
    pub fn evict_stale(&self, grace: Duration) -> usize {
        let evicted = {
            let mut state = self.state.write();
            let before = state.peers.len();
            state.peers.retain(|_, cached| match cached.offline_since {
                Some(since) => since.elapsed() < grace,
                None => true,
            });
            let retained: Vec<String> = state.peers.keys().cloned().collect();
            state
                .instances
                .retain(|_, device_id| retained.contains(device_id));
            before - state.peers.len()
        };
        if evicted > 0 {
            self.publish();
        }
        evicted
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}

impl Default for PeerCache {
    fn default() -> Self {
        PeerCache::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Discovery service
// ────────────────────────────────────────────────────────────────────────────

/// Control surface the network monitor needs; kept narrow so tests can
/// stub it without an mDNS daemon.
pub(crate) trait DiscoveryControl: Send + Sync {
    fn reannounce(&self);
    fn restart_browse(&self);
}

pub struct Discovery {
    daemon: ServiceDaemon,
    identity: Identity,
    port: u16,
    cache: PeerCache,
    fullname: RwLock<Option<String>>,
    restart: Notify,
}

impl Discovery {
    /// Create the daemon and register our service record.
    pub fn start(identity: Identity, port: u16, cache: PeerCache) -> ShareResult<Arc<Discovery>> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| ShareError::DiscoveryStartFailed(e.to_string()))?;

        let discovery = Arc::new(Discovery {
            daemon,
            identity,
            port,
            cache,
            fullname: RwLock::new(None),
            restart: Notify::new(),
        });
        discovery.register()?;
        Ok(discovery)
    }

    /// Register (or re-register) the service record. The instance name is
    /// the nickname; if another instance already owns it the daemon's
    /// automatic rename is accepted as-is.
    fn register(&self) -> ShareResult<()> {
        let properties = [
            (TXT_DEVICE_ID, self.identity.device_id.as_str()),
            (TXT_NICKNAME, self.identity.nickname.as_str()),
            (TXT_VERSION, PROTOCOL_VERSION),
        ];
        let host = format!("{}.local.", self.identity.device_id);

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.identity.nickname,
            &host,
            "",
            self.port,
            &properties[..],
        )
        .map_err(|e| ShareError::DiscoveryStartFailed(e.to_string()))?
        .enable_addr_auto();

        *self.fullname.write() = Some(info.get_fullname().to_string());

        self.daemon
            .register(info)
            .map_err(|e| ShareError::DiscoveryStartFailed(e.to_string()))?;

        info!(
            "advertising {} as {:?} on port {}",
            SERVICE_TYPE, self.identity.nickname, self.port
        );
        Ok(())
    }

    /// Unregister, stop browsing, and shut the daemon down. Idempotent.
    pub fn shutdown(&self) {
        if let Some(fullname) = self.fullname.write().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!("unregister {} failed: {}", fullname, e);
            }
        }
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        let _ = self.daemon.shutdown();
    }

    /// Drain browse events into the peer cache until cancelled.
    pub(crate) fn spawn_browse(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = match discovery.daemon.browse(SERVICE_TYPE) {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("browse failed to start: {}", e);
                    return;
                }
            };
            let mut sweep = interval(Duration::from_secs(EVICT_SWEEP_SECS));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    _ = discovery.restart.notified() => {
                        let _ = discovery.daemon.stop_browse(SERVICE_TYPE);
                        match discovery.daemon.browse(SERVICE_TYPE) {
                            Ok(rx) => {
                                events = rx;
                                info!("browse restarted");
                            }
                            Err(e) => warn!("browse restart failed: {}", e),
                        }
                    }

                    _ = sweep.tick() => {
                        let evicted = discovery
                            .cache
                            .evict_stale(Duration::from_secs(OFFLINE_EVICT_SECS));
                        if evicted > 0 {
                            debug!("evicted {} stale peers", evicted);
                        }
                    }

                    event = events.recv_async() => {
                        match event {
                            Ok(event) => discovery.handle_event(event),
                            Err(e) => {
                                debug!("browse channel closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => self.handle_resolved(&info),
            ServiceEvent::ServiceRemoved(_, fullname) => {
                if let Some(device_id) = self.cache.mark_offline_instance(&fullname) {
                    info!("peer lost: {}", device_id);
                }
            }
            ServiceEvent::ServiceFound(_, fullname) => {
                debug!("service found, awaiting resolve: {}", fullname);
            }
            other => debug!("browse event: {:?}", other),
        }
    }

    fn handle_resolved(&self, info: &ServiceInfo) {
        let fullname = info.get_fullname();

        let device_id = match info.get_property_val_str(TXT_DEVICE_ID) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                // A record without a deviceId is useless; drop it and keep
                // browsing.
                warn!("dropping resolution of {} (no deviceId in TXT)", fullname);
                return;
            }
        };
        if device_id == self.identity.device_id {
            return;
        }

        let address = match info
            .get_addresses()
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| info.get_addresses().iter().next())
        {
            Some(addr) => addr.to_string(),
            None => {
                warn!("dropping resolution of {} (no address)", fullname);
                return;
            }
        };

        let nickname = info
            .get_property_val_str(TXT_NICKNAME)
            .unwrap_or(&device_id)
            .to_string();

        let peer = DevicePeer {
            device_id: device_id.clone(),
            nickname,
            address,
            port: info.get_port(),
            online: true,
        };

        if self.cache.upsert(fullname, peer) {
            info!("peer discovered/updated: {}", device_id);
        }
    }
}

impl DiscoveryControl for Discovery {
    fn reannounce(&self) {
        if let Err(e) = self.register() {
            warn!("re-announce failed: {}", e);
        }
    }

    fn restart_browse(&self) {
        self.restart.notify_one();
    }
}
