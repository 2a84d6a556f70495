//! Privilege elevation for firewall commands
//!
//! iptables needs `CAP_NET_ADMIN`. chainward is normally run as root by its
//! service manager, in which case commands are executed directly. When it is
//! not, the firewall tool can be prefixed with a non-interactive elevation
//! helper.
//!
//! # Environment Variables
//!
//! - `CHAINWARD_ELEVATION_METHOD`: Force a specific method (`none`, `sudo` or `run0`),
//!   overriding the configuration file.
//! - `CHAINWARD_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - `sudo` is invoked with `-n` so a missing sudoers entry fails instead of prompting
//! - Elevation helpers are checked for availability before use

use std::path::Path;
use tokio::process::Command;

/// How firewall commands gain privileges when not running as root
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    /// Run the tool directly (root or capabilities already granted)
    #[default]
    None,
    /// `sudo -n <tool> ...`
    Sudo,
    /// `run0 <tool> ...` (systemd v256+)
    Run0,
}

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `CHAINWARD_ELEVATION_METHOD`
    #[error("Invalid CHAINWARD_ELEVATION_METHOD '{0}'. Valid options: none, sudo, run0")]
    InvalidMethod(String),
}

/// Resolves the effective method: the environment override wins over the configured one.
fn effective_method(configured: ElevationMethod) -> Result<ElevationMethod, ElevationError> {
    match std::env::var("CHAINWARD_ELEVATION_METHOD") {
        Ok(value) if !value.is_empty() => value
            .parse::<ElevationMethod>()
            .map_err(|_| ElevationError::InvalidMethod(value)),
        _ => Ok(configured),
    }
}

/// Builds a command that runs `program` with `args`, elevated if required.
///
/// # Errors
///
/// Returns `Err` if the elevation helper is missing or the environment
/// override names an unknown method.
pub fn build_elevated_command(
    program: &Path,
    args: &[&str],
    method: ElevationMethod,
) -> Result<Command, ElevationError> {
    // 1. Strict test mode override
    if std::env::var("CHAINWARD_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    match effective_method(method)? {
        ElevationMethod::None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        ElevationMethod::Sudo => {
            if crate::utils::find_binary("sudo").is_none() {
                return Err(ElevationError::MethodNotAvailable("sudo".into()));
            }
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program).args(args);
            Ok(cmd)
        }
        ElevationMethod::Run0 => {
            if crate::utils::find_binary("run0").is_none() {
                return Err(ElevationError::MethodNotAvailable("run0".into()));
            }
            let mut cmd = Command::new("run0");
            cmd.arg(program).args(args);
            Ok(cmd)
        }
    }
}
