//! SSH command channel and SCP tests
//!
//! Basic tests (no SSH server required):
//! ```bash
//! cargo test --test ssh_channel_test
//! ```
//!
//! Live tests need a reachable SSH server and these variables:
//! `SKYRUN_TEST_SSH_HOST`, `SKYRUN_TEST_SSH_USER`, `SKYRUN_TEST_SSH_KEY`
//! ```bash
//! cargo test --test ssh_channel_test -- --ignored
//! ```

use skyrun::remote::{
    read_declared, Connector, RemoteSession, SshAuth, SshConnector, SshSession, SshTarget,
};
use skyrun::RemoteError;
use std::io::Cursor;

fn live_target() -> Option<SshTarget> {
    let host = std::env::var("SKYRUN_TEST_SSH_HOST").ok()?;
    let user = std::env::var("SKYRUN_TEST_SSH_USER").ok()?;
    let key = std::env::var("SKYRUN_TEST_SSH_KEY").ok()?;
    Some(SshTarget::with_key(host, user, key).with_timeout(10))
}

#[test]
fn test_short_pull_is_transfer_error() {
    let mut stream = Cursor::new(vec![7u8; 100]);
    let err = read_declared(&mut stream, 128, "/tmp/values.bin").unwrap_err();
    assert!(matches!(err, RemoteError::Transfer { .. }));
    assert!(err.is_retriable());
}

#[test]
fn test_session_without_connect_refuses_work() {
    let mut session = SshSession::new(SshTarget::new("localhost", "nobody", SshAuth::Agent));
    assert!(session.pull("/etc/hostname").is_err());
    assert!(session.push(b"x", "/tmp", "x").is_err());
    session.close();
    assert!(!session.is_live());
}

#[test]
fn test_refused_port_is_connect_error() {
    // Port 1 on loopback is closed on any sane test host.
    let target = SshTarget::with_key("127.0.0.1", "nobody", "/nonexistent")
        .with_port(1)
        .with_timeout(2);
    match SshConnector.open(&target) {
        Err(RemoteError::Connect { host, .. }) => assert_eq!(host, "127.0.0.1"),
        Err(other) => panic!("expected connect error, got {:?}", other),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[test]
#[ignore = "requires SSH server"]
fn test_live_execute_merges_output_in_order() {
    let Some(target) = live_target() else { return };
    let mut session = SshConnector.open(&target).unwrap();

    let mut chunks = Vec::new();
    let mut observer = |chunk: &str| chunks.push(chunk.to_string());
    let output = session
        .execute("echo first; echo second 1>&2; echo SUCCESS: done", Some(&mut observer))
        .unwrap();

    assert_eq!(output.text, "first\nsecond\nSUCCESS: done\n");
    assert_eq!(chunks.concat(), output.text);
    assert_eq!(output.exit_status, Some(0));
    assert!(session.is_live());
}

#[test]
#[ignore = "requires SSH server"]
fn test_live_push_pull_roundtrip() {
    let Some(target) = live_target() else { return };
    let mut session = SshConnector.open(&target).unwrap();

    let name = format!("skyrun_test_{}.bin", std::process::id());
    let data: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    session.push(&data, "/tmp", &name).unwrap();

    let path = format!("/tmp/{}", name);
    assert_eq!(session.pull(&path).unwrap(), data);

    session.execute(&format!("rm -f {}", path), None).unwrap();
    assert!(session.pull(&path).unwrap_err().is_not_found());
}
