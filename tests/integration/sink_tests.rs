//! Child output redirection.

use std::fs;
use std::time::Duration;

use cgmemstat::launcher;
use cgmemstat::AppError;

use super::test_helpers::{test_request, SharedBuf, StubAccounting, StubOptions};

#[tokio::test]
async fn child_output_goes_to_sink_files() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.log");
    let err = dir.path().join("err.log");
    fs::write(&out, "previous run\n").unwrap();

    let mut request = test_request(&["sh", "-c", "echo hello; echo oops >&2"]);
    request.cmd_out = Some(out.clone());
    request.cmd_err = Some(err.clone());
    let accounting = StubAccounting::new(StubOptions::default());

    tokio::time::timeout(
        Duration::from_secs(20),
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    let err_text = fs::read_to_string(&err).unwrap();
    assert!(err_text.ends_with("oops\n"), "unexpected stderr {err_text:?}");
}

#[tokio::test]
async fn unopenable_sink_fails_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let mut request = test_request(&["true"]);
    request.cmd_out = Some(dir.path().join("missing/out.log"));
    let accounting = StubAccounting::new(StubOptions::default());

    let err = launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Sink(_)));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(accounting.creates(), 0);
}
