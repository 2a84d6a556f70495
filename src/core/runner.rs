//! Firewall command execution
//!
//! [`ChainCommand`] is the closed set of operations chainward ever performs on
//! the managed chain. [`CommandRunner`] is the seam between the synchronizer and
//! the host: [`IptablesRunner`] spawns the real tool, tests substitute a
//! recording runner.

use crate::core::error::{Error, Result};
use crate::elevation::{ElevationMethod, build_elevated_command};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, error};

/// A single operation against the managed chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCommand {
    /// `-A <chain> -s <source> -j <target>`
    Append {
        chain: String,
        source: String,
        target: String,
    },
    /// `-A <chain> -i <interface> -j <target>`
    AppendInterface {
        chain: String,
        interface: String,
        target: String,
    },
    /// `-F <chain>`
    Flush { chain: String },
}

impl ChainCommand {
    pub fn append(chain: &str, source: &str, target: &str) -> Self {
        Self::Append {
            chain: chain.to_string(),
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    pub fn append_interface(chain: &str, interface: &str, target: &str) -> Self {
        Self::AppendInterface {
            chain: chain.to_string(),
            interface: interface.to_string(),
            target: target.to_string(),
        }
    }

    pub fn flush(chain: &str) -> Self {
        Self::Flush {
            chain: chain.to_string(),
        }
    }

    /// Arguments passed to the firewall tool, in order.
    pub fn args(&self) -> Vec<&str> {
        match self {
            Self::Append {
                chain,
                source,
                target,
            } => vec!["-A", chain, "-s", source, "-j", target],
            Self::AppendInterface {
                chain,
                interface,
                target,
            } => vec!["-A", chain, "-i", interface, "-j", target],
            Self::Flush { chain } => vec!["-F", chain],
        }
    }

    pub fn chain(&self) -> &str {
        match self {
            Self::Append { chain, .. }
            | Self::AppendInterface { chain, .. }
            | Self::Flush { chain } => chain,
        }
    }
}

impl fmt::Display for ChainCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// Executes chain commands against the host firewall
///
/// Implementations must be shareable across tasks: rebuilds issue their
/// re-append commands concurrently from spawned tasks.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs one command to completion. Non-zero exit and spawn failures are errors.
    fn run(&self, command: &ChainCommand) -> impl Future<Output = Result<()>> + Send;
}

/// Runs commands through the `iptables` binary
#[derive(Debug, Clone)]
pub struct IptablesRunner {
    binary: PathBuf,
    elevation: ElevationMethod,
}

impl IptablesRunner {
    /// Creates a runner for an explicit binary path.
    pub fn new(binary: impl Into<PathBuf>, elevation: ElevationMethod) -> Self {
        Self {
            binary: binary.into(),
            elevation,
        }
    }

    /// Creates a runner using [`crate::utils::locate_iptables`] to find the binary.
    pub fn locate(configured: Option<&Path>, elevation: ElevationMethod) -> Self {
        Self::new(crate::utils::locate_iptables(configured), elevation)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl CommandRunner for IptablesRunner {
    async fn run(&self, command: &ChainCommand) -> Result<()> {
        let args = command.args();
        debug!("Running {} {}", self.binary.display(), command);

        let output = build_elevated_command(&self.binary, &args, self.elevation)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.binary.display());
                Error::Iptables {
                    message: format!("Failed to spawn {}: {e}", self.binary.display()),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("`{command}` exited with {}", output.status)
            } else {
                stderr.clone()
            };
            Err(Error::Iptables {
                message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_args() {
        let cmd = ChainCommand::append("ALLOW", "10.0.0.1", "ACCEPT");
        assert_eq!(cmd.args(), ["-A", "ALLOW", "-s", "10.0.0.1", "-j", "ACCEPT"]);
        assert_eq!(cmd.chain(), "ALLOW");
    }

    #[test]
    fn test_interface_args() {
        let cmd = ChainCommand::append_interface("ALLOW", "wg0", "ACCEPT");
        assert_eq!(cmd.args(), ["-A", "ALLOW", "-i", "wg0", "-j", "ACCEPT"]);
    }

    #[test]
    fn test_flush_display() {
        assert_eq!(ChainCommand::flush("ALLOW").to_string(), "-F ALLOW");
    }
}
