use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use resctl::errors::ControllerError;
use resctl::reconciler::ReconcileResult;
use resctl::types::MetaUpdate;
use resctl_test_utils::builders::{TEST_KIND, TestController, rn};
use resctl_test_utils::scripted_reconciler::{LogEvent, ScriptedReconciler, Step};
use resctl_test_utils::{init_tracing, wait_for, with_timeout};

async fn start() -> (ScriptedReconciler, TestController) {
    init_tracing();
    let reconciler = ScriptedReconciler::new();
    let tc = TestController::start(reconciler.registry(TEST_KIND)).await;
    (reconciler, tc)
}

#[tokio::test]
async fn create_over_pending_delete_cancels_and_reschedules() {
    let (rec, tc) = start().await;
    let c = &tc.controller;

    c.create(&rn("a"), MetaUpdate::default(), false, json!({ "v": 1 }))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    rec.script(&rn("a"), [Step::WaitForCancel]);
    c.delete(&rn("a")).await.unwrap();
    wait_for("deleting run", || async { rec.start_count(&rn("a")) == 2 }).await;
    assert_eq!(
        rec.starts_of(&rn("a"))[1],
        LogEvent::Started {
            deleted: true,
            renamed_from: None
        }
    );
    assert!(c.get(&rn("a")).await.unwrap_err().is_not_found());

    c.create(&rn("a"), MetaUpdate::default(), false, json!({ "v": 2 }))
        .await
        .unwrap();
    wait_for("rerun of a", || async { rec.start_count(&rn("a")) == 3 }).await;
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert_eq!(
        rec.starts_of(&rn("a"))[2],
        LogEvent::Started {
            deleted: false,
            renamed_from: None
        }
    );
    let a = c.get(&rn("a")).await.unwrap();
    assert!(!a.is_deleted());
    assert_eq!(a.spec, json!({ "v": 2 }));

    let err = c
        .create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::ResourceAlreadyExists(_)));

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn delete_removes_resource_after_deleting_run() {
    let (rec, tc) = start().await;
    let c = &tc.controller;

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    c.create(&rn("b"), MetaUpdate::with_refs([rn("a")]), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    c.delete(&rn("a")).await.unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert!(c.get(&rn("a")).await.unwrap_err().is_not_found());
    assert!(c.list(None).await.unwrap().iter().all(|r| r.name() != &rn("a")));
    // The child is reconciled again against its missing parent.
    assert_eq!(rec.start_count(&rn("b")), 2);

    let store = tc.store.clone();
    tc.stop().await.unwrap();
    assert!(store.get(&rn("a")).is_none());
}

#[tokio::test]
async fn deletes_run_before_other_work() {
    let (rec, tc) = start().await;
    let c = &tc.controller;

    c.create(&rn("x"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    c.create(&rn("d"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    let gate = Arc::new(Notify::new());
    rec.script(&rn("d"), [Step::Gate(gate.clone())]);
    c.delete(&rn("d")).await.unwrap();
    wait_for("deleting run of d", || async { rec.start_count(&rn("d")) == 2 }).await;

    c.reconcile(&rn("x")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rec.start_count(&rn("x")), 1, "x ran while a delete was pending");

    gate.notify_one();
    wait_for("x to run", || async { rec.start_count(&rn("x")) == 2 }).await;
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert!(rec.position(&rn("x"), true, 1).unwrap() > rec.position(&rn("d"), false, 1).unwrap());
    assert!(c.get(&rn("d")).await.unwrap_err().is_not_found());

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn rename_onto_name_left_by_inflight_rename_becomes_delete_and_create() {
    let (rec, tc) = start().await;
    let c = &tc.controller;

    c.create(&rn("a"), MetaUpdate::default(), false, json!({ "was": "a" }))
        .await
        .unwrap();
    c.create(&rn("b"), MetaUpdate::default(), false, json!({ "was": "b" }))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    let gate = Arc::new(Notify::new());
    rec.script(&rn("c"), [Step::Gate(gate.clone())]);

    c.update_name(&rn("b"), &rn("c"), None, vec![]).await.unwrap();
    wait_for("rename run of c", || async { rec.start_count(&rn("c")) == 1 }).await;
    assert_eq!(
        rec.starts_of(&rn("c"))[0],
        LogEvent::Started {
            deleted: false,
            renamed_from: Some(rn("b"))
        }
    );

    c.update_name(&rn("a"), &rn("b"), None, vec![]).await.unwrap();
    // `a` is deleted rather than moved.
    wait_for("deleting run of a", || async { rec.start_count(&rn("a")) == 2 }).await;

    gate.notify_one();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert_eq!(
        rec.starts_of(&rn("a"))[1],
        LogEvent::Started {
            deleted: true,
            renamed_from: None
        }
    );
    assert_eq!(
        rec.starts_of(&rn("b")).last().cloned(),
        Some(LogEvent::Started {
            deleted: false,
            renamed_from: None
        })
    );

    assert!(c.get(&rn("a")).await.unwrap_err().is_not_found());
    let b = c.get(&rn("b")).await.unwrap();
    assert_eq!(b.spec, json!({ "was": "a" }));
    assert_eq!(b.meta.renamed_from, None);
    let cc = c.get(&rn("c")).await.unwrap();
    assert_eq!(cc.spec, json!({ "was": "b" }));
    assert_eq!(cc.meta.renamed_from, None);
    assert_eq!(c.list(Some(TEST_KIND)).await.unwrap().len(), 2);

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn changing_resource_mid_rename_turns_rename_into_delete() {
    let (rec, tc) = start().await;
    let c = &tc.controller;

    c.create(&rn("a"), MetaUpdate::default(), false, json!({ "v": 1 }))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    rec.script(&rn("b"), [Step::WaitForCancel]);
    c.update_name(&rn("a"), &rn("b"), None, vec![]).await.unwrap();
    wait_for("rename run of b", || async { rec.start_count(&rn("b")) == 1 }).await;

    c.update_spec(&rn("b"), json!({ "v": 2 })).await.unwrap();
    wait_for("b to rerun", || async { rec.start_count(&rn("b")) == 2 }).await;
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    // The old name got a deleting run.
    assert!(rec.starts_of(&rn("a")).contains(&LogEvent::Started {
        deleted: true,
        renamed_from: None
    }));
    assert_eq!(
        rec.starts_of(&rn("b"))[1],
        LogEvent::Started {
            deleted: false,
            renamed_from: None
        }
    );
    assert!(c.get(&rn("a")).await.unwrap_err().is_not_found());
    assert_eq!(c.get(&rn("b")).await.unwrap().spec, json!({ "v": 2 }));

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn rename_reenqueues_children_and_clears_origin_when_done() {
    let (rec, tc) = start().await;
    let c = &tc.controller;

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    c.create(&rn("child"), MetaUpdate::with_refs([rn("a")]), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    c.update_name(&rn("a"), &rn("a2"), None, vec!["a2.toml".into()])
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert_eq!(
        rec.starts_of(&rn("a2")),
        vec![LogEvent::Started {
            deleted: false,
            renamed_from: Some(rn("a"))
        }]
    );
    assert_eq!(rec.start_count(&rn("child")), 2);
    let a2 = c.get(&rn("a2")).await.unwrap();
    assert_eq!(a2.meta.renamed_from, None);
    assert_eq!(a2.meta.file_paths, vec!["a2.toml".to_string()]);

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn state_is_only_writable_by_own_reconciler() {
    let (rec, tc) = start().await;
    let c = &tc.controller;
    rec.script(
        &rn("a"),
        [Step::custom(|ctx, _| async move {
            match ctx.update_state(json!({ "observed": true })).await {
                Ok(()) => ReconcileResult::ok(),
                Err(e) => ReconcileResult::failed(e),
            }
        })],
    );

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    let a = c.get(&rn("a")).await.unwrap();
    assert_eq!(a.meta.reconcile_error, None);
    assert_eq!(a.state, json!({ "observed": true }));

    let err = c
        .update_state(&rn("a"), json!({ "observed": false }))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::StateUpdateOutsideReconciler));

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn self_delete_removes_resource_immediately() {
    let (rec, tc) = start().await;
    let c = &tc.controller;
    rec.script(
        &rn("a"),
        [Step::custom(|ctx, name| async move {
            match ctx.delete(&name).await {
                Ok(()) => ReconcileResult::ok(),
                Err(e) => ReconcileResult::failed(e),
            }
        })],
    );

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert!(c.get(&rn("a")).await.unwrap_err().is_not_found());
    assert_eq!(rec.start_count(&rn("a")), 1);

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn lock_misuse_is_reported() {
    let (rec, tc) = start().await;
    let c = &tc.controller;
    let outcomes: Arc<Mutex<Vec<String>>> = Arc::default();

    let recorded = outcomes.clone();
    rec.script(
        &rn("a"),
        [Step::custom(move |ctx, name| {
            let recorded = recorded.clone();
            async move {
                let push = |s: String| recorded.lock().unwrap().push(s);
                push(format!("lock: {:?}", ctx.lock().await.is_ok()));
                push(format!("relock: {:?}", ctx.lock().await.err().map(|e| e.to_string())));
                push(format!("get while locked: {:?}", ctx.get(&name).await.is_ok()));
                push(format!("unlock: {:?}", ctx.unlock().is_ok()));
                push(format!("unlock again: {:?}", ctx.unlock().err().map(|e| e.to_string())));
                ReconcileResult::ok()
            }
        })],
    );

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![
            "lock: true".to_string(),
            "relock: Some(\"lock called by invocation that already holds the lock\")".to_string(),
            "get while locked: true".to_string(),
            "unlock: true".to_string(),
            "unlock again: Some(\"unlock called by invocation that does not hold the lock\")"
                .to_string(),
        ]
    );

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn calls_while_holding_lock_reuse_it() {
    let (rec, tc) = start().await;
    let c = &tc.controller;
    let outcomes: Arc<Mutex<Vec<String>>> = Arc::default();

    c.create(&rn("other"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    let recorded = outcomes.clone();
    rec.script(
        &rn("a"),
        [Step::custom(move |ctx, name| {
            let recorded = recorded.clone();
            async move {
                ctx.lock().await.unwrap();
                let calls = async {
                    ctx.get(&name).await?;
                    ctx.list(None).await?;
                    ctx.update_error(&rn("other"), Some("flagged".into())).await?;
                    ctx.create(&rn("made"), MetaUpdate::default(), false, json!({}))
                        .await
                };
                let outcome = match tokio::time::timeout(Duration::from_secs(1), calls).await {
                    Ok(Ok(())) => "ok".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "timed out".to_string(),
                };
                recorded.lock().unwrap().push(outcome);
                ctx.unlock().unwrap();
                ReconcileResult::ok()
            }
        })],
    );

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    wait_for("made to run", || async { rec.start_count(&rn("made")) == 1 }).await;
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert_eq!(*outcomes.lock().unwrap(), vec!["ok".to_string()]);
    assert_eq!(
        c.get(&rn("other")).await.unwrap().meta.reconcile_error.as_deref(),
        Some("flagged")
    );

    tc.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_lock_calls_let_only_one_through() {
    let (rec, tc) = start().await;
    let c = &tc.controller;
    let outcomes: Arc<Mutex<Vec<String>>> = Arc::default();

    let recorded = outcomes.clone();
    rec.script(
        &rn("a"),
        [Step::custom(move |ctx, _| {
            let recorded = recorded.clone();
            async move {
                let twin = ctx.clone();
                let both = async { tokio::join!(ctx.lock(), twin.lock()) };
                let mut results = match tokio::time::timeout(Duration::from_secs(1), both).await {
                    Ok((first, second)) => vec![first, second]
                        .into_iter()
                        .map(|r| match r {
                            Ok(()) => "locked".to_string(),
                            Err(e) => e.to_string(),
                        })
                        .collect(),
                    Err(_) => vec!["timed out".to_string()],
                };
                results.sort();
                results.push(format!("unlock: {}", ctx.unlock().is_ok()));
                // Free again after unlocking.
                results.push(format!("relock: {}", ctx.lock().await.is_ok()));
                results.push(format!("unlock: {}", ctx.unlock().is_ok()));
                recorded.lock().unwrap().extend(results);
                ReconcileResult::ok()
            }
        })],
    );

    c.create(&rn("a"), MetaUpdate::default(), false, json!({}))
        .await
        .unwrap();
    with_timeout(c.wait_until_idle(false)).await.unwrap();

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![
            "lock called by invocation that already holds the lock".to_string(),
            "locked".to_string(),
            "unlock: true".to_string(),
            "relock: true".to_string(),
            "unlock: true".to_string(),
        ]
    );

    tc.stop().await.unwrap();
}
