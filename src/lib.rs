//! Decentralized LAN peer-to-peer file sharing.
//!
//! Each [`Node`] advertises itself over mDNS (`_p2p-file-share._tcp.`),
//! discovers peers the same way, serves its shared folder to remote
//! requesters, and downloads from peers over a newline-delimited JSON
//! envelope protocol with raw bulk streaming, with progress reporting,
//! cancellation, and automatic retry with exponential backoff.
//!
//! ```no_run
//! use lanshare::{DownloadRequest, Node, NodeConfig};
//!
//! # async fn demo() -> lanshare::ShareResult<()> {
//! let node = Node::start(NodeConfig {
//!     device_id: "0a1b2c3d".into(),
//!     nickname: "workbench".into(),
//!     shared_root: "/srv/shared".into(),
//!     port: 8888,
//! })
//! .await?;
//!
//! for peer in node.peer_list() {
//!     let files = node.remote_files(&peer.device_id).await?;
//!     if let Some(file) = files.first() {
//!         node.start_download(DownloadRequest {
//!             peer_device_id: peer.device_id.clone(),
//!             file_id: file.file_id.clone(),
//!             destination_path: format!("/tmp/{}", file.name).into(),
//!         })?;
//!     }
//! }
//!
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod index;
pub mod monitor;
pub mod node;
pub mod protocol;
pub mod transfer;

mod server;
mod session;

pub use config::{Identity, NodeConfig};
pub use discovery::PeerCache;
pub use error::{ErrorCode, ShareError, ShareResult};
pub use index::SharedIndex;
pub use monitor::ConnectivityHandle;
pub use node::Node;
pub use protocol::{DevicePeer, SharedFile};
pub use transfer::{DownloadRequest, RetryPolicy, Transfer, TransferCoordinator, TransferState};
