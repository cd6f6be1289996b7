//! End-to-end runs of the launcher: real child runner, recording accounting.

use std::path::PathBuf;
use std::time::Duration;

use cgmemstat::arbiter::{ExitReport, Outcome};
use cgmemstat::launcher;
use cgmemstat::sample::StatsLayout;
use cgmemstat::AppError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::test_helpers::{
    kill_children_with_arg, test_request, Event, SharedBuf, StubAccounting, StubOptions,
};

const DEADLINE: Duration = Duration::from_secs(20);

#[tokio::test]
async fn child_is_stopped_when_applied_and_exits_normally() {
    let accounting = StubAccounting::new(StubOptions::default());
    let request = test_request(&["true"]);

    let outcome = tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .expect("run completes")
    .expect("run succeeds");

    let Outcome::Exited(report) = outcome else {
        panic!("expected natural exit, got {outcome:?}");
    };
    assert_eq!(report.code, Some(0));
    assert_eq!(accounting.creates(), 1);
    assert_eq!(accounting.state_at_apply(), Some('T'));
    assert_eq!(accounting.destroys(), 1);
}

#[tokio::test]
async fn child_exit_code_is_reported() {
    let accounting = StubAccounting::new(StubOptions::default());
    let request = test_request(&["sh", "-c", "exit 7"]);

    let outcome = tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        outcome,
        Outcome::Exited(ExitReport {
            code: Some(7),
            signal: None,
        })
    );
}

#[tokio::test]
async fn shutdown_interrupts_child_and_cleans_up() {
    let accounting = StubAccounting::new(StubOptions::default());
    let request = test_request(&["sleep", "30"]);
    let table = SharedBuf::default();

    let outcome = tokio::time::timeout(
        DEADLINE,
        launcher::run(
            &request,
            &accounting,
            async { tokio::time::sleep(Duration::from_millis(300)).await },
            table.clone(),
        ),
    )
    .await
    .expect("shutdown does not hang")
    .expect("run succeeds");

    let Outcome::Shutdown(report) = outcome else {
        panic!("expected shutdown, got {outcome:?}");
    };
    assert_eq!(report.signal, Some(2));
    assert_eq!(accounting.destroys(), 1);

    let lines = table.lines();
    assert_eq!(lines[0], StatsLayout::Unified.header());
    assert!(lines.len() > 1, "expected sample rows in {lines:?}");
}

#[tokio::test]
async fn unresolvable_program_exits_early_without_accounting() {
    let accounting = StubAccounting::new(StubOptions::default());
    let request = test_request(&["cgmemstat-test-no-such-program"]);

    let err = tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, AppError::ExitedEarly(121)), "got {err:?}");
    assert_eq!(err.exit_code(), 6);
    assert_eq!(accounting.creates(), 0);
    assert!(accounting.events().is_empty());
}

#[tokio::test]
async fn failed_apply_still_destroys_group() {
    let accounting = StubAccounting::new(StubOptions {
        fail_apply: true,
        ..StubOptions::default()
    });
    let request = test_request(&["true"]);

    let err = tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, AppError::Accounting(_)));
    assert_eq!(accounting.destroys(), 1);

    // The runner stays frozen when the run aborts before resume.
    let pid = accounting.applied_pid().expect("apply was attempted");
    let _ = kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL);
}

#[tokio::test]
async fn stale_group_is_destroyed_before_apply() {
    let accounting = StubAccounting::new(StubOptions {
        stale: true,
        ..StubOptions::default()
    });
    let request = test_request(&["true"]);

    tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap();

    let events = accounting.events();
    assert_eq!(events.len(), 3, "unexpected events {events:?}");
    assert_eq!(events[0], Event::Destroy);
    assert!(matches!(events[1], Event::Apply(_)));
    assert_eq!(events[2], Event::Destroy);
}

#[tokio::test]
async fn failed_stale_destroy_aborts_before_apply() {
    let accounting = StubAccounting::new(StubOptions {
        stale: true,
        fail_destroy: true,
        ..StubOptions::default()
    });
    let marker = "stale-group-busy";
    let request = test_request(&["true", marker]);

    let err = tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, AppError::Accounting(_)));
    assert_eq!(err.exit_code(), 8);
    assert_eq!(accounting.applied_pid(), None, "child must never be applied");
    // The stale attempt, then the teardown of the guarded group.
    assert_eq!(accounting.events(), vec![Event::Destroy, Event::Destroy]);

    assert_eq!(kill_children_with_arg(marker), 1, "runner stays frozen");
}

#[tokio::test]
async fn failed_final_destroy_fails_the_run() {
    let accounting = StubAccounting::new(StubOptions {
        fail_destroy: true,
        ..StubOptions::default()
    });
    let request = test_request(&["true"]);

    let err = tokio::time::timeout(
        DEADLINE,
        launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default()),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, AppError::Accounting(_)));
    assert_eq!(accounting.destroys(), 1);
}

#[tokio::test]
async fn missing_runner_binary_is_spawn_error() {
    let accounting = StubAccounting::new(StubOptions::default());
    let mut request = test_request(&["true"]);
    request.runner_exe = PathBuf::from("/nonexistent/cgmemstat");

    let err = launcher::run(&request, &accounting, std::future::pending(), SharedBuf::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Spawn(_)));
    assert_eq!(accounting.creates(), 0);
}
