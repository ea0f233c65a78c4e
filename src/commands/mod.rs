//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod init_pki;
mod issue_cert;
mod keygen;
mod serve;

pub use init_pki::InitPkiCommand;
pub use issue_cert::IssueCertCommand;
pub use keygen::KeygenCommand;
pub use serve::ServeCommand;

use anyhow::Result;

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Validity used when issuing certificates, in days.
pub const DEFAULT_CERT_DAYS: u64 = 365;

pub(crate) fn days_to_secs(days: u64) -> u64 {
    days.saturating_mul(24 * 60 * 60)
}
