//! Input validation for values that end up on an iptables command line
//!
//! Arguments are handed to the child process directly (no shell), so the
//! main concern is option injection: a key such as `-j DROP` or a chain name
//! starting with `-` would otherwise be parsed as a flag by iptables.

use ipnetwork::IpNetwork;

/// Maximum length of a chain or target name (`XT_EXTENSION_MAXNAMELEN - 1`).
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Maximum length of an interface name (`IFNAMSIZ - 1`).
pub const MAX_INTERFACE_LEN: usize = 15;

/// Validates a user-defined chain name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 28 characters, starts
/// with `-`, or contains whitespace or control characters.
///
/// # Examples
///
/// ```
/// use chainward::validators::validate_chain_name;
///
/// assert!(validate_chain_name("ALLOWLIST").is_ok());
/// assert!(validate_chain_name("-F").is_err());
/// ```
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if name.starts_with('-') {
        return Err("Chain name cannot start with '-'".to_string());
    }

    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Chain name contains whitespace or control characters".to_string());
    }

    Ok(())
}

/// Validates a managed key: an IPv4/IPv6 address or CIDR network.
///
/// The key is returned trimmed but otherwise as given, so `10.0.0.1` stays
/// `10.0.0.1` rather than becoming `10.0.0.1/32`.
///
/// # Errors
///
/// Returns `Err` if the key does not parse as an address or network.
pub fn validate_key(key: &str) -> Result<String, String> {
    let key = key.trim();

    if key.is_empty() {
        return Err("Address cannot be empty".to_string());
    }

    key.parse::<IpNetwork>()
        .map_err(|e| format!("Invalid address or network '{key}': {e}"))?;

    Ok(key.to_string())
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// iptables additionally accepts a trailing `+` as a prefix wildcard
/// (`eth+` matches every `eth*` interface).
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > MAX_INTERFACE_LEN {
        return Err(format!(
            "Interface name too long (max {MAX_INTERFACE_LEN} characters)"
        ));
    }

    if name == "." || name == ".." || name.starts_with('-') {
        return Err("Invalid interface name".to_string());
    }

    let stem = name.strip_suffix('+').unwrap_or(name);
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a jump target (built-in verdict or user chain).
///
/// # Errors
///
/// Returns `Err` if the target is empty, too long, starts with `-`, or
/// contains anything other than ASCII alphanumerics, `_` and `-`.
pub fn validate_target(target: &str) -> Result<String, String> {
    if target.is_empty() {
        return Err("Target cannot be empty".to_string());
    }

    if target.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "Target too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if target.starts_with('-') {
        return Err("Target cannot start with '-'".to_string());
    }

    if !target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err("Target contains invalid characters".to_string());
    }

    Ok(target.to_string())
}
