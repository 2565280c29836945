//! Node configuration.
//!
//! Everything the controller needs is passed in explicitly as a
//! [`NodeConfig`]; there is no process-wide mutable state. The demo binary
//! fills one in from a TOML file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ShareError, ShareResult};
use crate::protocol::DEFAULT_PORT;

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// How this node identifies itself to peers, in the handshake and in the
/// advertised TXT record.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: String,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Opaque stable identifier for this device. Generated once and reused
    /// so peers can recognise the node across restarts.
    pub device_id: String,
    /// Human-friendly label shown to peers; also the advertised instance
    /// name.
    pub nickname: String,
    /// Directory whose contents are indexed and served.
    pub shared_root: PathBuf,
    /// TCP listen port; `0` binds an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl NodeConfig {
    pub fn load(path: &std::path::Path) -> ShareResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig =
            toml::from_str(&raw).map_err(|e| ShareError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ShareResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(ShareError::Config("device_id must not be empty".into()));
        }
        if self.nickname.trim().is_empty() {
            return Err(ShareError::Config("nickname must not be empty".into()));
        }
        if !self.shared_root.is_dir() {
            return Err(ShareError::Config(format!(
                "shared_root {} is not a directory",
                self.shared_root.display()
            )));
        }
        Ok(())
    }

    pub fn identity(&self) -> Identity {
        Identity {
            device_id: self.device_id.clone(),
            nickname: self.nickname.clone(),
        }
    }
}
