//! Command-line front end (§4.J).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "upatch-manage", about = "Apply and remove live ELF hot patches")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply a patch object to a running process.
    Patch(PatchArgs),
    /// Remove a previously applied patch.
    Unpatch(UnpatchArgs),
    /// Report whether a patch UUID is currently applied.
    Info(InfoArgs),
}

#[derive(clap::Args)]
pub struct PatchArgs {
    #[arg(long)]
    pub pid: i32,
    #[arg(long)]
    pub upatch: PathBuf,
    #[arg(long)]
    pub binary: PathBuf,
    #[arg(long)]
    pub uuid: String,
}

#[derive(clap::Args)]
pub struct UnpatchArgs {
    #[arg(long)]
    pub pid: i32,
    #[arg(long)]
    pub binary: PathBuf,
    #[arg(long)]
    pub uuid: String,
}

#[derive(clap::Args)]
pub struct InfoArgs {
    #[arg(long)]
    pub pid: i32,
    #[arg(long)]
    pub binary: PathBuf,
    #[arg(long)]
    pub uuid: String,
}

/// A valid patch UUID is 40 hex characters (§4.J). Checked before any ptrace
/// call is made so malformed invocations fail fast.
pub fn validate_uuid(uuid: &str) -> Result<(), String> {
    if uuid.len() == 40 && uuid.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(format!(
            "uuid must be exactly 40 hex characters, got `{uuid}` ({} chars)",
            uuid.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_40_hex_chars() {
        assert!(validate_uuid(&"a".repeat(40)).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(validate_uuid("abc").is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(validate_uuid(&"z".repeat(40)).is_err());
    }
}
