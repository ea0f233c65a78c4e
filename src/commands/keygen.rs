//! Key generation command.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use securechat::config::{validate_username, DEFAULT_KEY_DIR};
use securechat::crypto::{private_key_path, public_key_path, SigningKeyPair};

use super::CommandExecutor;

/// Generate an Ed25519 identity key pair.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Key owner (a roster username, "server" or "ca")
    #[arg(short, long)]
    pub name: String,

    /// Directory to write <name>_pubkey.pem and <name>_privkey.pem into
    #[arg(short, long, default_value = DEFAULT_KEY_DIR)]
    pub dir: PathBuf,

    /// Overwrite existing keys
    #[arg(long)]
    pub force: bool,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        validate_username(&self.name).context("Invalid key name")?;

        let key_path = private_key_path(&self.dir, &self.name);
        if key_path.exists() && !self.force {
            bail!(
                "{} already exists (use --force to overwrite)",
                key_path.display()
            );
        }

        let keypair = SigningKeyPair::generate();
        keypair
            .save_to_dir(&self.dir, &self.name)
            .context("Failed to save key pair")?;

        println!("Generated key pair for {}:", self.name);
        println!("  Public:  {}", public_key_path(&self.dir, &self.name).display());
        println!("  Private: {}", key_path.display());
        println!(
            "  Fingerprint: {}",
            hex::encode(&keypair.verifying_key().as_bytes()[..8])
        );
        Ok(())
    }
}
