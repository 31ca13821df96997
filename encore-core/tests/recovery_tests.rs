//! Restart, recovery and replay-order tests over prepopulated logs

mod common;

use common::*;
use encore_core::prelude::*;
use futures::FutureExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

fn run_started(run_id: &str, replayable_id: &str, args: Value, offset: i64) -> ReplayEvent {
    ReplayEvent::RunStarted {
        run_id: run_id.to_string(),
        timestamp: at(offset),
        replayable_id: replayable_id.to_string(),
        args,
        source: None,
    }
}

fn run_paused(run_id: &str, offset: i64) -> ReplayEvent {
    ReplayEvent::RunPaused {
        run_id: run_id.to_string(),
        timestamp: at(offset),
    }
}

fn step_started(run_id: &str, step: u32, offset: i64) -> ReplayEvent {
    ReplayEvent::StepStarted {
        run_id: run_id.to_string(),
        step,
        timestamp: at(offset),
    }
}

fn step_completed(run_id: &str, step: u32, result: Value, offset: i64) -> ReplayEvent {
    ReplayEvent::StepCompleted {
        run_id: run_id.to_string(),
        step,
        timestamp: at(offset),
        result,
    }
}

fn hook_bound(run_id: &str, hook_id: &str, offset: i64) -> ReplayEvent {
    ReplayEvent::HookBound {
        hook_id: hook_id.to_string(),
        token: hook_token(hook_id),
        run_id: run_id.to_string(),
        timestamp: at(offset),
    }
}

fn hook_triggered(hook_id: &str, value: Value, offset: i64) -> ReplayEvent {
    ReplayEvent::HookTriggered {
        token: hook_token(hook_id),
        timestamp: at(offset),
        value,
    }
}

fn engine_over(events: Vec<ReplayEvent>) -> Engine {
    Engine::builder()
        .log(Arc::new(MemoryLog::with_events(events)))
        .retry_policy(quick_retry(3))
        .build()
}

/// Replayable racing two steps; each bumps `calls` if it actually runs
fn register_pick(engine: &Engine, calls: Arc<AtomicU32>) -> Replayable<(), String> {
    engine.replayable("pick", move |ctx: RunContext, _: ()| {
        let calls = calls.clone();
        async move {
            let (for_a, for_b) = (calls.clone(), calls.clone());
            let a = ctx.step(move || {
                let calls = for_a.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("a".to_string())
                }
            });
            let b = ctx.step(move || {
                let calls = for_b.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("b".to_string())
                }
            });
            let winner: String = race(vec![a.boxed(), b.boxed()]).await?;
            Ok(winner)
        }
    })
}

#[tokio::test]
async fn test_race_replays_recorded_winner() {
    for (first, expected) in [(2, "b"), (1, "a")] {
        let second = 3 - first;
        let engine = engine_over(vec![
            run_started("r1", "pick", json!(null), 1),
            step_started("r1", 1, 2),
            step_started("r1", 2, 3),
            step_completed("r1", first, json!(if first == 1 { "a" } else { "b" }), 4),
            step_completed("r1", second, json!(if second == 1 { "a" } else { "b" }), 5),
            run_paused("r1", 6),
        ]);
        let calls = Arc::new(AtomicU32::new(0));
        let pick = register_pick(&engine, calls.clone());

        let handle = pick.resume("r1").await.unwrap();
        assert_eq!(settle(handle).await.unwrap(), expected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_race_replays_hook_trigger_against_cached_step() {
    for (trigger_at, complete_at, expected) in [(4, 5, "hook"), (5, 4, "step")] {
        let engine = engine_over(vec![
            run_started("r1", "confirm", json!(null), 1),
            hook_bound("r1", "confirm", 2),
            step_started("r1", 1, 3),
            hook_triggered("confirm", json!("hook"), trigger_at),
            step_completed("r1", 1, json!("step"), complete_at),
            run_paused("r1", 6),
        ]);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let confirm = engine.replayable("confirm", move |ctx: RunContext, _: ()| {
            let counter = counter.clone();
            async move {
                let confirmed = ctx.hook::<String>(Some("confirm"));
                let fallback = ctx.step(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok("fresh".to_string())
                    }
                });
                let winner: String =
                    race(vec![confirmed.once().boxed(), fallback.boxed()]).await?;
                Ok(winner)
            }
        });

        let handle = confirm.resume("r1").await.unwrap();
        assert_eq!(settle(handle).await.unwrap(), expected);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_created_operation_may_be_awaited_later() {
    // The hook settled first, but the body awaits the step before it
    let engine = engine_over(vec![
        run_started("r1", "later", json!(null), 1),
        hook_bound("r1", "x", 2),
        step_started("r1", 1, 3),
        hook_triggered("x", json!(10), 4),
        step_completed("r1", 1, json!(5), 5),
        run_paused("r1", 6),
    ]);
    let later = engine.replayable("later", |ctx: RunContext, _: ()| async move {
        let confirmed = ctx.hook::<i64>(Some("x")).once();
        let step: i64 = ctx.step(|| async { Ok(0) }).await?;
        let value = confirmed.await?;
        Ok(step + value)
    });

    let handle = later.resume("r1").await.unwrap();
    assert_eq!(settle(handle).await.unwrap(), 15);
    wait_until(|| {
        let engine = engine.clone();
        async move { !engine.is_active("r1") }
    })
    .await;
    let state = engine.run_state("r1").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_recover_interrupted_run() {
    let engine = engine_over(vec![
        run_started("r1", "double", json!(7), 1),
        step_started("r1", 1, 2),
    ]);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    engine.replayable("double", move |ctx: RunContext, n: i64| {
        let counter = counter.clone();
        async move {
            let doubled: i64 = ctx
                .step(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(n * 2)
                    }
                })
                .await?;
            Ok(doubled)
        }
    });

    assert_eq!(engine.recover().await.unwrap(), vec!["r1".to_string()]);
    let handle = engine.resume("r1", None).await.unwrap();
    assert_eq!(settle(handle).await.unwrap(), json!(14));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let types = event_types(&engine, "r1").await;
    for expected in [
        "run:interrupted",
        "step:interrupted",
        "run:recovered",
        "step:recovered",
        "run:completed",
    ] {
        assert!(types.contains(&expected), "missing {} in {:?}", expected, types);
    }
    assert_eq!(count(&types, "step:started"), 1);
}

#[tokio::test]
async fn test_recover_paused_run_with_orphaned_step() {
    let engine = engine_over(vec![
        run_started("r1", "double", json!(4), 1),
        step_started("r1", 1, 2),
        run_paused("r1", 3),
    ]);
    engine.replayable("double", |ctx: RunContext, n: i64| async move {
        let doubled: i64 = ctx.step(move || async move { Ok(n * 2) }).await?;
        Ok(doubled)
    });

    assert_eq!(engine.recover().await.unwrap(), vec!["r1".to_string()]);
    let handle = engine.resume("r1", None).await.unwrap();
    assert_eq!(settle(handle).await.unwrap(), json!(8));

    let types = event_types(&engine, "r1").await;
    assert_eq!(count(&types, "step:interrupted"), 1);
    assert_eq!(count(&types, "step:recovered"), 1);
    assert_eq!(count(&types, "run:interrupted"), 0);
    assert_eq!(count(&types, "run:recovered"), 0);
    assert!(count(&types, "run:resumed") >= 1);
}

#[tokio::test]
async fn test_recover_skips_waiting_and_unregistered_runs() {
    let engine = engine_over(vec![
        // Paused on a hook, nothing in flight
        run_started("waiting", "double", json!(1), 1),
        step_started("waiting", 1, 2),
        step_completed("waiting", 1, json!(2), 3),
        run_paused("waiting", 4),
        // Interrupted run nobody can play
        run_started("ghost", "ghost", json!(null), 5),
    ]);
    engine.replayable("double", |_ctx: RunContext, n: i64| async move { Ok(n * 2) });
    let before = engine.log().events().await.unwrap().len();

    assert!(engine.recover().await.unwrap().is_empty());
    assert_eq!(engine.log().events().await.unwrap().len(), before);
}

#[tokio::test]
async fn test_resume_unregistered_replayable_leaves_run_alone() {
    let engine = engine_over(vec![
        run_started("r1", "ghost", json!(null), 1),
        run_paused("r1", 2),
    ]);
    let before = engine.log().events().await.unwrap().len();

    let err = engine.resume("r1", None).await.unwrap_err();
    assert!(matches!(err, EncoreError::UnregisteredReplayable(name) if name == "ghost"));
    assert!(!engine.is_active("r1"));
    assert_eq!(engine.log().events().await.unwrap().len(), before);

    let state = engine.run_state("r1").await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Paused);
}

/// Charges once, then waits for approval
fn register_approval(engine: &Engine, charges: Arc<AtomicU32>) -> Replayable<u32, String> {
    engine.replayable("approval", move |ctx: RunContext, amount: u32| {
        let charges = charges.clone();
        async move {
            let receipt: String = ctx
                .step(move || {
                    let charges = charges.clone();
                    async move {
                        charges.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("charged {}", amount))
                    }
                })
                .await?;
            let approved: bool = ctx.hook::<bool>(Some("approve")).once().await?;
            Ok(if approved { receipt } else { "refunded".to_string() })
        }
    })
}

#[tokio::test]
async fn test_run_survives_restart_on_file_log() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runs").join("events.jsonl");
    let charges = Arc::new(AtomicU32::new(0));

    let run_id = {
        let engine = Engine::builder()
            .log(Arc::new(FileLog::open(&path).unwrap()))
            .retry_policy(quick_retry(3))
            .build();
        let approval = register_approval(&engine, charges.clone());

        let handle = approval.start(5).unwrap();
        let run_id = handle.run_id().to_string();
        wait_until(|| {
            let engine = engine.clone();
            let run_id = run_id.clone();
            async move {
                let bound = engine
                    .log()
                    .is_hook_bound(&hook_token("approve"), &run_id)
                    .await
                    .unwrap();
                let state = engine.run_state(&run_id).await.unwrap();
                bound
                    && !engine.is_active(&run_id)
                    && state.is_some_and(|s| s.status == RunStatus::Paused)
            }
        })
        .await;
        run_id
    };

    let config = ConfigBuilder::new()
        .log_path(&path)
        .retry(quick_retry(3))
        .build();
    let engine = Engine::from_config(&config).unwrap();
    let approval = register_approval(&engine, charges.clone());

    let state = engine.run_state(&run_id).await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.args, json!(5));

    engine
        .trigger(HookIdentifier::id("approve"), true)
        .await
        .unwrap();
    let handle = approval.resume(&run_id).await.unwrap();
    assert_eq!(settle(handle).await.unwrap(), "charged 5");
    assert_eq!(charges.load(Ordering::SeqCst), 1);

    let reloaded = FileLog::read_events(&path).unwrap();
    assert!(
        reloaded
            .iter()
            .any(|e| e.type_name() == "run:completed" && e.run_id() == Some(run_id.as_str()))
    );
}
