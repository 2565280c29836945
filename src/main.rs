//! Headless node host: load a TOML config (or generate an identity), start
//! the node, run until ctrl-c.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use uuid::Uuid;

use lanshare::protocol::DEFAULT_PORT;
use lanshare::{Node, NodeConfig};

fn setup_logger() -> Result<()> {
    let config = ConfigBuilder::new().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        LevelFilter::Info,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Ok(log_file) = std::fs::File::create("lanshare.log") {
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, log_file));
    }

    CombinedLogger::init(loggers).ok();
    Ok(())
}

fn load_or_generate(path: &Path) -> Result<NodeConfig> {
    if path.exists() {
        let config =
            NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
        return Ok(config);
    }

    let device_id = Uuid::new_v4().to_string();
    let nickname = format!("lanshare-{}", &device_id[..8]);
    let shared_root = std::env::current_dir()?.join("shared");
    std::fs::create_dir_all(&shared_root)
        .with_context(|| format!("creating {}", shared_root.display()))?;
    info!(
        "no config at {}; starting as {} sharing {}",
        path.display(),
        nickname,
        shared_root.display()
    );

    Ok(NodeConfig {
        device_id,
        nickname,
        shared_root,
        port: DEFAULT_PORT,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lanshare.toml"));
    let config = load_or_generate(&config_path)?;

    let node = Node::start(config).await.context("failed to start node")?;
    info!("node running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    node.stop().await;
    Ok(())
}
