//! Line protocol read by `chainward run`
//!
//! One command per line, words separated by whitespace:
//!
//! | Line | Operation |
//! |---|---|
//! | `add <key> [target]` | [`ChainSync::add_with_target`] |
//! | `keepalive <key>` | [`ChainSync::keep_alive`] |
//! | `iface <name> [target] [--allow-failure]` | [`ChainSync::add_interface`] |
//! | `del <key>` | [`ChainSync::remove`] |
//! | `list` | [`ChainSync::list`] |
//! | `flush` | [`ChainSync::flush`] |
//! | `flush-all` | [`ChainSync::flush_all`] |
//!
//! A missing target means the synchronizer's default target.

use crate::core::error::{Error, Result};
use crate::core::runner::CommandRunner;
use crate::core::sync::ChainSync;

const ALLOW_FAILURE_FLAG: &str = "--allow-failure";

/// A parsed protocol line, borrowing from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCommand<'a> {
    Add {
        key: &'a str,
        target: Option<&'a str>,
    },
    KeepAlive {
        key: &'a str,
    },
    Interface {
        interface: &'a str,
        target: Option<&'a str>,
        allow_failure: bool,
    },
    Remove {
        key: &'a str,
    },
    List,
    Flush,
    FlushAll,
}

impl<'a> LineCommand<'a> {
    /// Parses one line. Values are checked later by the synchronizer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for unknown commands, wrong arity or
    /// unknown flags.
    pub fn parse(line: &'a str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();

        match *words.as_slice() {
            ["add", key] => Ok(Self::Add { key, target: None }),
            ["add", key, target] => Ok(Self::Add {
                key,
                target: Some(target),
            }),
            ["keepalive", key] => Ok(Self::KeepAlive { key }),
            ["iface", interface, ref rest @ ..] => parse_interface(interface, rest),
            ["del", key] => Ok(Self::Remove { key }),
            ["list"] => Ok(Self::List),
            ["flush"] => Ok(Self::Flush),
            ["flush-all"] => Ok(Self::FlushAll),
            _ => Err(Error::validation(
                "command",
                format!("unrecognized command '{}'", line.trim()),
            )),
        }
    }
}

fn parse_interface<'a>(interface: &'a str, rest: &[&'a str]) -> Result<LineCommand<'a>> {
    let mut target = None;
    let mut allow_failure = false;

    for &word in rest {
        if word == ALLOW_FAILURE_FLAG {
            allow_failure = true;
        } else if word.starts_with("--") {
            return Err(Error::validation("command", format!("unknown flag '{word}'")));
        } else if target.replace(word).is_some() {
            return Err(Error::validation("command", "iface takes at most one target"));
        }
    }

    Ok(LineCommand::Interface {
        interface,
        target,
        allow_failure,
    })
}

/// Parses and runs one line, returning the text to print.
///
/// # Errors
///
/// Returns parse errors and whatever the synchronizer operation returns.
pub async fn execute<R: CommandRunner>(sync: &ChainSync<R>, line: &str) -> Result<String> {
    let default_target = sync.settings().default_target.as_str();

    match LineCommand::parse(line)? {
        LineCommand::Add { key, target } => {
            let admitted = sync
                .add_with_target(key, target.unwrap_or(default_target))
                .await?;
            Ok(admission_message(key, admitted))
        }
        LineCommand::KeepAlive { key } => Ok(admission_message(key, sync.keep_alive(key).await?)),
        LineCommand::Interface {
            interface,
            target,
            allow_failure,
        } => {
            let target = target.unwrap_or(default_target);
            sync.add_interface(interface, target, allow_failure).await?;
            Ok(format!("interface {interface} -> {target}"))
        }
        LineCommand::Remove { key } => Ok(if sync.remove(key).await? {
            format!("removed {key}")
        } else {
            format!("not removed {key} (unknown, or chain flush failed)")
        }),
        LineCommand::List => {
            let entries = sync.list();
            if entries.is_empty() {
                return Ok("(empty)".to_string());
            }
            Ok(entries
                .iter()
                .map(|(key, target)| format!("{key} {target}"))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        LineCommand::Flush => {
            sync.flush(false).await?;
            Ok(format!("flushed {}", sync.chain()))
        }
        LineCommand::FlushAll => {
            sync.flush_all().await?;
            Ok(format!("flushed {} and cleared all entries", sync.chain()))
        }
    }
}

fn admission_message(key: &str, admitted: bool) -> String {
    if admitted {
        format!("admitted {key}")
    } else {
        format!("refreshed {key}")
    }
}
