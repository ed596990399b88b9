//! Syncing a project file into a running controller with the command
//! reconciler. Needs `sh` on the PATH.

#![cfg(unix)]

use std::sync::Arc;

use resctl::reconciler::command::{COMMAND_KIND, CommandState};
use resctl::reconciler::{CommandReconciler, Reconciler, ReconcilerRegistry};
use resctl::sync_declared;
use resctl::types::ResourceName;
use resctl_test_utils::builders::{ProjectFileBuilder, ResourceConfigBuilder, TestController};
use resctl_test_utils::{init_tracing, with_timeout};

fn command_registry() -> ReconcilerRegistry {
    let mut registry = ReconcilerRegistry::new();
    registry
        .register(COMMAND_KIND, |_| {
            Arc::new(CommandReconciler::new()) as Arc<dyn Reconciler>
        })
        .unwrap();
    registry
}

fn cn(name: &str) -> ResourceName {
    ResourceName::new(COMMAND_KIND, name)
}

#[tokio::test]
async fn sync_creates_runs_and_prunes_declared_commands() {
    init_tracing();
    let tc = TestController::start(command_registry()).await;
    let c = &tc.controller;

    let project = ProjectFileBuilder::new()
        .with_resource("ok", ResourceConfigBuilder::new("true").build())
        .with_resource(
            "bad",
            ResourceConfigBuilder::new("exit 3").refs("ok").build(),
        )
        .build();

    with_timeout(sync_declared(c, &project)).await.unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    let ok = c.get(&cn("ok")).await.unwrap();
    assert_eq!(ok.meta.reconcile_error, None);
    let state: CommandState = serde_json::from_value(ok.state.clone()).unwrap();
    assert_eq!(state.exit_code, 0);

    let bad = c.get(&cn("bad")).await.unwrap();
    assert_eq!(bad.meta.refs, vec![cn("ok")]);
    assert!(
        bad.meta
            .reconcile_error
            .as_deref()
            .is_some_and(|e| e.contains("command exited with code 3")),
        "unexpected error: {:?}",
        bad.meta.reconcile_error
    );
    let state: CommandState = serde_json::from_value(bad.state.clone()).unwrap();
    assert_eq!(state.exit_code, 3);

    // Syncing the same project again changes nothing.
    let spec_version = bad.meta.spec_version;
    with_timeout(sync_declared(c, &project)).await.unwrap();
    assert_eq!(c.get(&cn("bad")).await.unwrap().meta.spec_version, spec_version);

    let fixed = ProjectFileBuilder::new()
        .with_resource("ok", ResourceConfigBuilder::new("true").build())
        .build();
    with_timeout(sync_declared(c, &fixed)).await.unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert!(c.get(&cn("bad")).await.unwrap_err().is_not_found());
    assert_eq!(c.list(Some(COMMAND_KIND)).await.unwrap().len(), 1);

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn changed_command_is_rerun() {
    init_tracing();
    let tc = TestController::start(command_registry()).await;
    let c = &tc.controller;

    let failing = ProjectFileBuilder::new()
        .with_resource("step", ResourceConfigBuilder::new("exit 1").build())
        .build();
    with_timeout(sync_declared(c, &failing)).await.unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();
    assert!(c.get(&cn("step")).await.unwrap().meta.reconcile_error.is_some());

    let passing = ProjectFileBuilder::new()
        .with_resource("step", ResourceConfigBuilder::new("exit 0").build())
        .build();
    with_timeout(sync_declared(c, &passing)).await.unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    let step = c.get(&cn("step")).await.unwrap();
    assert_eq!(step.meta.reconcile_error, None);
    assert_eq!(step.spec["cmd"], "exit 0");

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn long_running_command_is_killed_on_shutdown() {
    init_tracing();
    let tc = TestController::start(command_registry()).await;
    let c = &tc.controller;

    let project = ProjectFileBuilder::new()
        .with_resource("sleepy", ResourceConfigBuilder::new("sleep 30").build())
        .build();
    with_timeout(sync_declared(c, &project)).await.unwrap();
    resctl_test_utils::wait_for("sleepy to start", || async {
        c.get(&cn("sleepy"))
            .await
            .is_ok_and(|r| r.meta.reconcile_status == resctl::types::ReconcileStatus::Running)
    })
    .await;

    with_timeout(tc.stop()).await.unwrap();
}
