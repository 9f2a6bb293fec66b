//! Drive the full procedure from captured session transcripts, without
//! hardware.

use std::{fs, process::Command, time::Duration};

use apflash::{
    Connection, ConnectionError, Error, NullObserver, Recovery, RecoveryStage, ReplayPort,
    SessionConfig, Timeouts, Transcript, DEFAULT_ENABLE_PASSWORD,
};
use assert_cmd::prelude::*;
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> Vec<u8> {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    fs::read(path).expect("fixture should exist")
}

fn fixture_path(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn session_config() -> SessionConfig {
    SessionConfig {
        ip_addr: "10.0.0.1".parse().unwrap(),
        netmask: "255.255.255.0".parse().unwrap(),
        gateway: "10.0.0.254".parse().unwrap(),
        server: "10.0.0.2".parse().unwrap(),
        filename: "ap3g2-k9w7-tar.153-3.JF15.tar".into(),
        enable_password: DEFAULT_ENABLE_PASSWORD.into(),
        timeouts: Timeouts::uniform(Duration::from_millis(100)),
    }
}

fn replay(capture: Vec<u8>) -> Recovery {
    let connection = Connection::new(Box::new(ReplayPort::new(capture)), Transcript::in_memory());
    Recovery::new(connection, session_config())
}

#[test]
fn replayed_capture_reaches_done() {
    let mut recovery = replay(fixture("good_run.log"));
    recovery.run(&mut NullObserver).unwrap();

    assert_eq!(recovery.stage(), RecoveryStage::Done);
    assert_eq!(recovery.session().halted_at(), None);
}

#[test]
fn bad_mzip_warning_during_reboot_is_not_fatal() {
    // The capture contains `magic number mismatch: bad mzip file` between
    // `boot` and the login prompt; the run must still complete.
    let capture = fixture("good_run.log");
    assert!(String::from_utf8_lossy(&capture).contains("magic number mismatch: bad mzip file"));

    let mut recovery = replay(capture);
    recovery.run(&mut NullObserver).unwrap();
    assert_eq!(recovery.stage(), RecoveryStage::Done);
}

#[test]
fn capture_without_rommon_prompt_times_out_at_init() {
    let mut recovery = replay(fixture("missing_prompt.log"));
    let err = recovery.run(&mut NullObserver).unwrap_err();

    assert!(matches!(
        err,
        Error::Connection(ConnectionError::Timeout(_))
    ));
    assert_eq!(recovery.stage(), RecoveryStage::Failed);
    assert_eq!(recovery.session().halted_at(), Some(RecoveryStage::Init));
}

#[test]
fn chunked_delivery_still_reaches_done() {
    // Deliver the capture a few bytes per read so stage boundaries land
    // mid-line and mid-chunk.
    let port = ReplayPort::new(fixture("good_run.log")).with_chunk_size(7);
    let connection = Connection::new(Box::new(port), Transcript::in_memory());
    let mut recovery = Recovery::new(connection, session_config());

    recovery.run(&mut NullObserver).unwrap();
    assert_eq!(recovery.stage(), RecoveryStage::Done);
}

#[test]
fn replay_subcommand_succeeds_on_a_good_capture() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("apflash")?;
    cmd.arg("replay").arg(fixture_path("good_run.log"));
    cmd.assert().success();

    Ok(())
}

#[test]
fn replay_subcommand_fails_on_an_incomplete_capture() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("apflash")?;
    cmd.arg("replay").arg(fixture_path("missing_prompt.log"));
    cmd.assert().failure();

    Ok(())
}

#[test]
fn completions_subcommand_prints_a_script() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("apflash")?;
    cmd.arg("completions").arg("bash");
    cmd.assert().success();

    Ok(())
}
