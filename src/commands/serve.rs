//! Server command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use securechat::{Server, ServerConfig, ServerIdentity};

use super::CommandExecutor;

/// Run the chat server.
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// TOML config file (defaults are used when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Override the key directory
    #[arg(long)]
    pub key_dir: Option<PathBuf>,
}

impl ServeCommand {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(dir) = &self.key_dir {
            config.server_cert = dir.join("server_cert.pem");
            config.key_dir = dir.clone();
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

impl CommandExecutor for ServeCommand {
    fn execute(&self) -> Result<()> {
        let config = self.load_config()?;
        let identity = ServerIdentity::load(&config).with_context(|| {
            format!(
                "Failed to load server identity from {}",
                config.key_dir.display()
            )
        })?;
        info!(name = identity.name(), roster = ?config.roster, "server identity loaded");

        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(async move {
            let server = Server::new(config, identity);
            server.serve().await
        })
        .context("Server stopped")?;
        Ok(())
    }
}
