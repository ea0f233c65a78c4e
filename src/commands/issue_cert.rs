//! Certificate issuing command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use securechat::client::CA_KEY_NAME;
use securechat::config::DEFAULT_KEY_DIR;
use securechat::crypto::{load_verifying_key, public_key_path, Certificate, SigningKeyPair};

use super::{days_to_secs, CommandExecutor, DEFAULT_CERT_DAYS};

/// Issue a CA-signed certificate for an existing public key.
#[derive(Args, Debug)]
pub struct IssueCertCommand {
    /// Certificate subject (clients check it against the expected server name)
    #[arg(short, long)]
    pub subject: String,

    /// Base name of the public key to certify (defaults to the subject)
    #[arg(short, long)]
    pub key: Option<String>,

    /// Directory holding the CA key pair and the subject's public key
    #[arg(short, long, default_value = DEFAULT_KEY_DIR)]
    pub dir: PathBuf,

    /// Base name of the CA key pair
    #[arg(long, default_value = CA_KEY_NAME)]
    pub ca: String,

    /// Validity in days
    #[arg(long, default_value_t = DEFAULT_CERT_DAYS)]
    pub days: u64,

    /// Output file (defaults to <dir>/<subject>_cert.pem)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl CommandExecutor for IssueCertCommand {
    fn execute(&self) -> Result<()> {
        let key_name = self.key.as_deref().unwrap_or(&self.subject);

        let ca = SigningKeyPair::load_from_dir(&self.dir, &self.ca)
            .with_context(|| format!("Failed to load CA key '{}'", self.ca))?;
        let subject_key = load_verifying_key(&public_key_path(&self.dir, key_name))
            .with_context(|| format!("Failed to load public key '{}'", key_name))?;

        let cert = Certificate::issue(
            &self.subject,
            &subject_key,
            &self.ca,
            &ca,
            days_to_secs(self.days),
        )
        .context("Failed to issue certificate")?;

        let output = self
            .output
            .clone()
            .unwrap_or_else(|| self.dir.join(format!("{}_cert.pem", self.subject)));
        cert.save(&output)
            .with_context(|| format!("Failed to write {}", output.display()))?;

        println!("Issued certificate for {} ({} days)", self.subject, self.days);
        println!("  {}", output.display());
        Ok(())
    }
}
