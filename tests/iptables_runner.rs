//! Integration tests for the iptables runner and chain synchronizer
//!
//! These run the real process-spawning runner against `tests/mock_iptables.sh`,
//! copied into a temporary directory per test so each one gets its own
//! invocation log. No privileges are required.

#![cfg(unix)]

use chainward::core::error::IptablesErrorPattern;
use chainward::elevation::ElevationMethod;
use chainward::{ChainCommand, ChainSync, CommandRunner, Error, IptablesRunner, SyncSettings};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

struct MockIptables {
    dir: TempDir,
    binary: PathBuf,
}

impl MockIptables {
    fn install() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("iptables");
        let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/mock_iptables.sh");
        std::fs::copy(&source, &binary).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir, binary }
    }

    fn runner(&self) -> IptablesRunner {
        IptablesRunner::new(&self.binary, ElevationMethod::None)
    }

    fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }
}

#[tokio::test]
async fn test_commands_reach_the_binary() {
    let mock = MockIptables::install();
    let runner = mock.runner();

    runner
        .run(&ChainCommand::append("EDGE", "10.0.0.1", "ACCEPT"))
        .await
        .unwrap();
    runner
        .run(&ChainCommand::append_interface("EDGE", "wg0", "ACCEPT"))
        .await
        .unwrap();
    runner.run(&ChainCommand::flush("EDGE")).await.unwrap();

    assert_eq!(
        mock.invocations(),
        [
            "-A EDGE -s 10.0.0.1 -j ACCEPT",
            "-A EDGE -i wg0 -j ACCEPT",
            "-F EDGE"
        ]
    );
}

#[tokio::test]
async fn test_nonzero_exit_carries_stderr() {
    let mock = MockIptables::install();
    let err = mock
        .runner()
        .run(&ChainCommand::append("EDGE", "203.0.113.66", "ACCEPT"))
        .await
        .unwrap_err();

    match err {
        Error::Iptables {
            message,
            stderr,
            exit_code,
        } => {
            assert_eq!(exit_code, Some(2));
            assert!(stderr.unwrap().contains("Bad argument"));
            let translation = IptablesErrorPattern::match_error(&message);
            assert!(translation.user_message.contains("rejected"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_chain_is_translated() {
    let mock = MockIptables::install();
    let err = mock
        .runner()
        .run(&ChainCommand::flush("MISSING"))
        .await
        .unwrap_err();

    let Error::Iptables { message, .. } = err else {
        panic!("expected an iptables error");
    };
    let translation = IptablesErrorPattern::match_error(&message);
    assert!(translation.suggestions.iter().any(|s| s.contains("-N")));
}

#[tokio::test]
async fn test_missing_binary() {
    let dir = tempfile::tempdir().unwrap();
    let runner = IptablesRunner::new(dir.path().join("iptables"), ElevationMethod::None);

    let err = runner
        .run(&ChainCommand::flush("EDGE"))
        .await
        .unwrap_err();

    let Error::Iptables {
        message, exit_code, ..
    } = err
    else {
        panic!("expected an iptables error");
    };
    assert_eq!(exit_code, None);
    assert!(
        IptablesErrorPattern::match_error(&message)
            .user_message
            .contains("not installed")
    );
}

#[tokio::test]
async fn test_sync_rebuilds_through_the_binary() {
    let mock = MockIptables::install();
    let sync = ChainSync::new(
        SyncSettings::new("EDGE").with_ttl(Duration::from_secs(60)),
        mock.runner(),
    )
    .unwrap();

    assert!(sync.add("10.0.0.1").await.unwrap());
    assert!(sync.add("10.0.0.2").await.unwrap());
    assert!(!sync.add("10.0.0.2").await.unwrap());
    assert!(sync.remove("10.0.0.1").await.unwrap());

    assert_eq!(
        mock.invocations(),
        [
            "-A EDGE -s 10.0.0.1 -j ACCEPT",
            "-A EDGE -s 10.0.0.2 -j ACCEPT",
            "-F EDGE",
            "-A EDGE -s 10.0.0.2 -j ACCEPT"
        ]
    );
    assert_eq!(sync.list().keys().collect::<Vec<_>>(), ["10.0.0.2"]);
}

#[tokio::test]
async fn test_sync_does_not_track_failed_admission() {
    let mock = MockIptables::install();
    let sync = ChainSync::new(SyncSettings::new("EDGE"), mock.runner()).unwrap();

    assert!(sync.add("203.0.113.66").await.is_err());
    assert!(!sync.exists("203.0.113.66"));

    // Nothing to rebuild, so no flush is issued
    assert!(!sync.remove("203.0.113.66").await.unwrap());
    assert_eq!(mock.invocations(), ["-A EDGE -s 203.0.113.66 -j ACCEPT"]);
}
