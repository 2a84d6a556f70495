use thiserror::Error;

/// Core error types for chainward
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Entry snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// One or more entries could not be re-appended after a chain flush
    #[error("Failed to repopulate chain after flush: {}", failed.join(", "))]
    Repopulate { failed: Vec<String> },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Entry snapshot errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot corrupted: invalid structure")]
    Corrupted,

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables failure messages and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify the chain")
                .with_suggestion("Run chainward as root or set \"elevation\" to sudo or run0")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // Missing binary
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or set \"iptables_path\" in the configuration");
        }

        // Chain missing: iptables reports this the same way for chains and targets
        if lower.contains("no chain/target/match by that name")
            || (lower.contains("chain") && lower.contains("does not exist"))
        {
            return ErrorTranslation::new("Chain or jump target not found")
                .with_suggestion("Create the chain first: iptables -N <chain>")
                .with_suggestion("Check that the jump target is a built-in action or existing chain");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Another firewall manager may be modifying the ruleset")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Invalid source address")
                .with_suggestion("Use proper IP format: 192.168.1.1 or 192.168.1.0/24")
                .with_suggestion("IPv6 addresses need a chain managed through ip6tables");
        }

        if lower.contains("can't initialize") || lower.contains("table does not exist") {
            return ErrorTranslation::new("Failed to initialize the iptables filter table")
                .with_suggestion("Check kernel modules: lsmod | grep ip_tables")
                .with_suggestion("Load the module: sudo modprobe ip_tables");
        }

        if lower.contains("bad argument") || lower.contains("unknown option") {
            return ErrorTranslation::new("iptables rejected the generated arguments")
                .with_suggestion("Check the key, interface and target values for typos");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_missing_command() {
        let translation = IptablesErrorPattern::match_error("No such file or directory (os error 2)");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3);
    }

    #[test]
    fn test_missing_chain() {
        let translation = IptablesErrorPattern::match_error(
            "iptables: No chain/target/match by that name.",
        );
        assert!(translation.user_message.contains("not found"));
        assert!(translation.suggestions.iter().any(|s| s.contains("-N")));
    }

    #[test]
    fn test_permission_error() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
        assert!(translation.suggestions.iter().any(|s| s.contains("sudo")));
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("lock"));
    }

    #[test]
    fn test_generic_fallback_keeps_message() {
        let translation = IptablesErrorPattern::match_error("something odd happened");
        assert!(translation.user_message.contains("something odd happened"));
    }

    #[test]
    fn test_repopulate_message_lists_keys() {
        let err = Error::Repopulate {
            failed: vec!["10.0.0.1".into(), "10.0.0.2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1, 10.0.0.2"));
    }
}
