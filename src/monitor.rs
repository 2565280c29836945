//! Connectivity monitor.
//!
//! The host environment owns the actual network-state source; it pushes
//! up/down transitions through a [`ConnectivityHandle`]. A small task turns
//! those transitions into the right reactions: on regained connectivity the
//! service record is re-announced and browsing restarts to flush stale
//! peers, on loss every cached peer is marked offline. In-flight transfers
//! are left to hit their own timeouts.

use std::sync::Arc;

use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::{DiscoveryControl, PeerCache};

/// Write side of the connectivity feed, handed to the embedder.
#[derive(Clone)]
pub struct ConnectivityHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityHandle {
    pub fn set_available(&self, available: bool) {
        self.tx.send_replace(available);
    }

    pub fn is_available(&self) -> bool {
        *self.tx.borrow()
    }
}

/// New feed, initially "available".
pub(crate) fn connectivity_channel() -> (ConnectivityHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(true);
    (ConnectivityHandle { tx: Arc::new(tx) }, rx)
}

pub(crate) fn spawn_network_monitor(
    mut rx: watch::Receiver<bool>,
    discovery: Arc<dyn DiscoveryControl>,
    peers: PeerCache,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let available = *rx.borrow_and_update();
                    if available {
                        info!("network available; re-announcing and refreshing browse");
                        discovery.reannounce();
                        discovery.restart_browse();
                    } else {
                        info!("network lost; marking all peers offline");
                        peers.mark_all_offline();
                    }
                }
            }
        }
    })
}
