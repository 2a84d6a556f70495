//! Utility functions for directory management and binary resolution
//!
//! # Directory Structure
//!
//! - Config: `~/.config/chainward/` - `config.json`
//! - State: `~/.local/state/chainward/` - entry snapshots, audit log
//!
//! When running as a system service without a home directory these resolve
//! to `None` and the features that need them stay disabled.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Path used when `iptables` cannot be found in `PATH`.
pub const DEFAULT_IPTABLES_PATH: &str = match option_env!("CHAINWARD_SYSTEM_IPTABLES_PATH") {
    Some(path) => path,
    None => "/usr/sbin/iptables",
};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "chainward", "chainward")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);

        if let Some(dir) = get_config_dir() {
            builder.create(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            builder.create(dir)?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(dir) = get_config_dir() {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(dir) = get_state_dir() {
            std::fs::create_dir_all(dir)?;
        }
    }

    Ok(())
}

/// Searches `PATH` for an executable file named `name`.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(name);
            if full_path.is_file() {
                Some(full_path)
            } else {
                None
            }
        })
    })
}

/// Resolves the firewall tool: explicit path, then `PATH`, then [`DEFAULT_IPTABLES_PATH`].
pub fn locate_iptables(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }

    find_binary("iptables").unwrap_or_else(|| {
        tracing::debug!("iptables not found in PATH, using {DEFAULT_IPTABLES_PATH}");
        PathBuf::from(DEFAULT_IPTABLES_PATH)
    })
}
