//! One-shot provisioning: CA, server certificate and roster keys.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use securechat::client::CA_KEY_NAME;
use securechat::config::{ServerConfig, DEFAULT_KEY_DIR, DEFAULT_ROSTER, DEFAULT_SERVER_NAME};
use securechat::crypto::{private_key_path, Certificate, SigningKeyPair};

use super::{days_to_secs, CommandExecutor, DEFAULT_CERT_DAYS};

/// Create a CA, a certified server key and a key pair per roster user.
#[derive(Args, Debug)]
pub struct InitPkiCommand {
    /// Output directory
    #[arg(short, long, default_value = DEFAULT_KEY_DIR)]
    pub dir: PathBuf,

    /// Server certificate subject
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    pub server_name: String,

    /// Roster usernames (defaults to alice, bob, charlie, dave)
    #[arg(short, long, num_args = 1..)]
    pub users: Vec<String>,

    /// Certificate validity in days
    #[arg(long, default_value_t = DEFAULT_CERT_DAYS)]
    pub days: u64,

    /// Also write a matching server config to this path
    #[arg(long)]
    pub write_config: Option<PathBuf>,

    /// Overwrite an existing CA
    #[arg(long)]
    pub force: bool,
}

impl CommandExecutor for InitPkiCommand {
    fn execute(&self) -> Result<()> {
        let roster: Vec<String> = if self.users.is_empty() {
            DEFAULT_ROSTER.iter().map(|s| s.to_string()).collect()
        } else {
            self.users.clone()
        };

        let config = ServerConfig {
            server_name: self.server_name.clone(),
            roster,
            key_dir: self.dir.clone(),
            server_cert: self.dir.join("server_cert.pem"),
            ..Default::default()
        };
        config.validate().context("Invalid roster")?;

        if private_key_path(&self.dir, CA_KEY_NAME).exists() && !self.force {
            bail!(
                "{} already contains a CA (use --force to overwrite)",
                self.dir.display()
            );
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let ca = SigningKeyPair::generate();
        ca.save_to_dir(&self.dir, CA_KEY_NAME)
            .context("Failed to save CA key")?;

        let server = SigningKeyPair::generate();
        server
            .save_to_dir(&self.dir, &config.server_key)
            .context("Failed to save server key")?;
        Certificate::issue(
            &config.server_name,
            server.verifying_key(),
            CA_KEY_NAME,
            &ca,
            days_to_secs(self.days),
        )
        .and_then(|cert| cert.save(&config.server_cert))
        .context("Failed to issue server certificate")?;

        for user in &config.roster {
            SigningKeyPair::generate()
                .save_to_dir(&self.dir, user)
                .with_context(|| format!("Failed to save key for {}", user))?;
        }

        println!("Initialized PKI in {}", self.dir.display());
        println!("  CA:     {}_pubkey.pem", CA_KEY_NAME);
        println!("  Server: {} ({})", config.server_cert.display(), config.server_name);
        println!("  Users:  {}", config.roster.join(", "));

        if let Some(path) = &self.write_config {
            fs::write(path, config.to_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("  Config: {}", path.display());
        }
        Ok(())
    }
}
