//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::error::{Error, Result};
use crate::core::runner::{ChainCommand, CommandRunner};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("CHAINWARD_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("CHAINWARD_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug, Default)]
struct RunnerState {
    issued: Vec<ChainCommand>,
    rules: Vec<ChainCommand>,
    fail_flush: bool,
    fail_matches: HashSet<String>,
    append_delay: Duration,
    flush_delay: Duration,
}

/// In-memory stand-in for iptables
///
/// Records every command issued and models the chain contents: appends push
/// a rule, flushes clear it. A command's effect lands as soon as it is
/// issued; the configured delay only postpones its completion, the way a
/// real process may exit some time after the kernel applied the change.
///
/// Clones share state, so keep one handle for assertions and move the other
/// into the synchronizer.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command issued so far, failed ones included.
    pub fn commands(&self) -> Vec<ChainCommand> {
        self.state().issued.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| matches!(c, ChainCommand::Flush { .. }))
            .count()
    }

    /// Sources of every `-s` append issued, in issue order.
    pub fn appended_sources(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                ChainCommand::Append { source, .. } => Some(source),
                _ => None,
            })
            .collect()
    }

    /// Rules currently in the modelled chain, as iptables arguments.
    pub fn chain_rules(&self) -> Vec<String> {
        self.state().rules.iter().map(ToString::to_string).collect()
    }

    /// Sources with an `-s` rule in the modelled chain, sorted.
    pub fn chain_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .state()
            .rules
            .iter()
            .filter_map(|c| match c {
                ChainCommand::Append { source, .. } => Some(source.clone()),
                _ => None,
            })
            .collect();
        sources.sort();
        sources
    }

    /// Forgets the command history but keeps the modelled chain.
    pub fn clear_history(&self) {
        self.state().issued.clear();
    }

    pub fn fail_flush(&self, fail: bool) {
        self.state().fail_flush = fail;
    }

    /// Makes appends for this source address or interface fail.
    pub fn fail_on(&self, key: &str) {
        self.state().fail_matches.insert(key.to_string());
    }

    pub fn set_delays(&self, append: Duration, flush: Duration) {
        let mut state = self.state();
        state.append_delay = append;
        state.flush_delay = flush;
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &ChainCommand) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.issued.push(command.clone());

            let fails = match command {
                ChainCommand::Flush { .. } => state.fail_flush,
                ChainCommand::Append { source, .. } => state.fail_matches.contains(source),
                ChainCommand::AppendInterface { interface, .. } => {
                    state.fail_matches.contains(interface)
                }
            };
            if fails {
                return Err(Error::Iptables {
                    message: format!("mock failure: {command}"),
                    stderr: Some("iptables: Bad argument".to_string()),
                    exit_code: Some(2),
                });
            }

            if let ChainCommand::Flush { .. } = command {
                state.rules.clear();
                state.flush_delay
            } else {
                state.rules.push(command.clone());
                state.append_delay
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}
