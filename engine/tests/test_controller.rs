//! Deployment controller tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fleetpipe::deploy::fsm::DeploymentStatus;
use fleetpipe::errors::PipelineError;
use fleetpipe::models::artifact::ArtifactReference;
use fleetpipe::models::deployment::{
    HaltPolicy, HookFault, HookScriptRef, HostState, Phase, EXIT_TIMEOUT, EXIT_UNREACHABLE,
};
use fleetpipe::models::hook::{HookScript, HookStage};
use fleetpipe::models::host::HostSpec;
use fleetpipe::storage::store::MemoryDeploymentStore;

fn stage_names(results: &[fleetpipe::models::deployment::StageResult]) -> Vec<&str> {
    results.iter().map(|r| r.stage_name.as_str()).collect()
}

#[tokio::test]
async fn test_all_hosts_succeed() {
    let runner = ScriptedRunner::new();
    let controller = controller(runner.clone(), &["a", "b", "c"]);

    let id = controller
        .submit(request(&["a", "b", "c"], HaltPolicy::PerHost))
        .await
        .unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Succeeded);
    assert!(deployment.finished_at.is_some());
    assert!(deployment.rollback.is_none());
    for outcome in deployment.per_host_status.values() {
        assert_eq!(outcome.outcome, HostState::Succeeded);
        assert_eq!(
            stage_names(&outcome.stage_results),
            vec!["install", "start", "validate"]
        );
        assert_eq!(outcome.current_stage.as_deref(), Some("validate"));
        assert!(outcome.rollback_results.is_empty());
    }
    assert_eq!(runner.started("restore"), 0);
}

#[tokio::test]
async fn test_per_host_failure_keeps_others_going() {
    let runner = ScriptedRunner::new();
    runner.fail("b", "start", 3);
    let controller = controller(runner.clone(), &["a", "b", "c"]);

    let id = controller
        .submit(request(&["a", "b", "c"], HaltPolicy::PerHost))
        .await
        .unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Succeeded);

    let b = deployment.outcome("b").unwrap();
    assert_eq!(b.outcome, HostState::Failed);
    assert_eq!(stage_names(&b.stage_results), vec!["install", "start"]);
    assert_eq!(b.stage_results[1].exit_code, 3);
    assert_eq!(b.stage_results[1].fault, Some(HookFault::ScriptFailure));

    for host in ["a", "c"] {
        let outcome = deployment.outcome(host).unwrap();
        assert_eq!(outcome.outcome, HostState::Succeeded);
        assert_eq!(outcome.stage_results.len(), 3);
    }

    assert_eq!(runner.runs("b", "validate"), 0);
    assert_eq!(runner.runs("a", "validate"), 1);
    assert_eq!(runner.started("restore"), 0);
}

#[tokio::test]
async fn test_all_or_nothing_halts_and_rolls_back() {
    let runner = ScriptedRunner::new();
    runner.fail("b", "start", 1);
    let controller = controller(runner.clone(), &["a", "b", "c"]);

    let id = controller
        .submit(request(&["a", "b", "c"], HaltPolicy::AllOrNothing))
        .await
        .unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    // every hook of the failing barrier finished before the halt
    for host in ["a", "b", "c"] {
        let outcome = deployment.outcome(host).unwrap();
        assert_eq!(stage_names(&outcome.stage_results), vec!["install", "start"]);
    }
    assert_eq!(deployment.outcome("b").unwrap().outcome, HostState::Failed);
    assert_eq!(deployment.outcome("a").unwrap().outcome, HostState::Halted);
    assert_eq!(deployment.outcome("c").unwrap().outcome, HostState::Halted);
    assert_eq!(runner.started("validate"), 0);

    let rollback = deployment.rollback.as_ref().unwrap();
    assert_eq!(rollback.targets.len(), 3);
    assert_eq!(rollback.succeeded, Some(true));
    assert!(rollback.finished_at.is_some());
    for host in ["a", "b", "c"] {
        assert_eq!(runner.runs(host, "restore"), 1);
        let outcome = deployment.outcome(host).unwrap();
        assert_eq!(stage_names(&outcome.rollback_results), vec!["restore"]);
    }

    assert_eq!(deployment.status(), DeploymentStatus::RolledBack);
    assert!(deployment.lifecycle.error().unwrap().contains('b'));
}

#[tokio::test]
async fn test_failed_rollback_leaves_deployment_failed() {
    let runner = ScriptedRunner::new();
    runner.fail("a", "install", 2);
    runner.fail("b", "install", 2);
    runner.fail("a", "restore", 1);
    let controller = controller(runner.clone(), &["a", "b"]);

    let id = controller
        .submit(request(&["a", "b"], HaltPolicy::PerHost))
        .await
        .unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    let rollback = deployment.rollback.as_ref().unwrap();
    assert_eq!(rollback.succeeded, Some(false));
    // a failed rollback hook does not stop the others
    assert_eq!(runner.runs("b", "restore"), 1);
    assert_eq!(deployment.outcome("a").unwrap().rollback_results[0].exit_code, 1);
}

#[tokio::test]
async fn test_no_rollback_stages_stays_failed() {
    let runner = ScriptedRunner::new();
    runner.fail("a", "install", 1);
    let controller = controller(runner.clone(), &["a"]);

    let mut req = request(&["a"], HaltPolicy::PerHost);
    req.hook_script = HookScriptRef::Inline(HookScript::new(
        "bare",
        vec![HookStage::new("install", "true")],
    ));
    let id = controller.submit(req).await.unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    assert_eq!(deployment.status(), DeploymentStatus::Failed);
    assert!(deployment.rollback.is_none());
}

#[tokio::test]
async fn test_barrier_orders_stages() {
    let runner = ScriptedRunner::new();
    runner.slow("a", "install", Duration::from_millis(200));
    runner.slow("c", "start", Duration::from_millis(100));
    let controller = controller(runner.clone(), &["a", "b", "c"]);

    let id = controller
        .submit(request(&["a", "b", "c"], HaltPolicy::PerHost))
        .await
        .unwrap();
    controller.wait(&id).await.unwrap();

    let events = runner.events();
    let last_finish = |stage: &str| {
        events
            .iter()
            .filter(|e| e.finished && e.stage == stage)
            .map(|e| e.seq)
            .max()
            .unwrap()
    };
    let first_start = |stage: &str| {
        events
            .iter()
            .filter(|e| !e.finished && e.stage == stage)
            .map(|e| e.seq)
            .min()
            .unwrap()
    };

    assert!(last_finish("install") < first_start("start"));
    assert!(last_finish("start") < first_start("validate"));
}

#[tokio::test]
async fn test_hook_environment() {
    let runner = ScriptedRunner::new();
    let controller = controller(runner.clone(), &["a"]);

    let id = controller
        .submit(request(&["a"], HaltPolicy::PerHost))
        .await
        .unwrap();
    controller.wait(&id).await.unwrap();

    let events = runner.events();
    let validate = events
        .iter()
        .find(|e| !e.finished && e.stage == "validate")
        .unwrap();
    assert_eq!(validate.phase, Phase::Deploy);
    assert_eq!(validate.env["FLEETPIPE_DEPLOYMENT_ID"], id);
    assert_eq!(validate.env["FLEETPIPE_HOST_ID"], "a");
    assert_eq!(validate.env["FLEETPIPE_STAGE"], "validate");
    assert_eq!(validate.env["FLEETPIPE_STAGE_POSITION"], "2");
    assert_eq!(validate.env["FLEETPIPE_ARTIFACT_VERSION"], "2.4.0");
    assert_eq!(validate.env["FLEETPIPE_OUTPUT_INSTALL"], "install on a");
    assert_eq!(validate.env["FLEETPIPE_OUTPUT_START"], "start on a");
}

#[tokio::test]
async fn test_stage_timeout_is_a_host_failure() {
    let runner = ScriptedRunner::new();
    runner.slow("b", "install", Duration::from_secs(5));
    let controller = controller(runner.clone(), &["a", "b"]);

    let mut req = request(&["a", "b"], HaltPolicy::PerHost);
    req.hook_script = HookScriptRef::Inline(HookScript::new(
        "quick",
        vec![HookStage::new("install", "true").with_timeout(Duration::from_millis(100))],
    ));
    let id = controller.submit(req).await.unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    let b = deployment.outcome("b").unwrap();
    assert_eq!(b.outcome, HostState::Failed);
    assert_eq!(b.stage_results[0].exit_code, EXIT_TIMEOUT);
    assert_eq!(b.stage_results[0].fault, Some(HookFault::Timeout));
    assert_eq!(deployment.outcome("a").unwrap().outcome, HostState::Succeeded);
    assert_eq!(deployment.status(), DeploymentStatus::Succeeded);
}

#[tokio::test]
async fn test_unreachable_host_is_recorded_and_skipped_by_rollback() {
    let runner = ScriptedRunner::new();
    let mut hosts = local_hosts(&["a"]);
    hosts.push(HostSpec::ssh("dead", "127.0.0.1", 1));
    let controller = controller_with(runner.clone(), hosts, Arc::new(MemoryDeploymentStore::new()));

    let id = controller
        .submit(request(&["a", "dead"], HaltPolicy::AllOrNothing))
        .await
        .unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    let dead = deployment.outcome("dead").unwrap();
    assert_eq!(dead.outcome, HostState::Failed);
    assert_eq!(dead.stage_results.len(), 1);
    assert_eq!(dead.stage_results[0].exit_code, EXIT_UNREACHABLE);
    assert_eq!(dead.stage_results[0].fault, Some(HookFault::Unreachable));
    assert_eq!(runner.runs("dead", "install"), 0);

    let rollback = deployment.rollback.as_ref().unwrap();
    assert!(rollback.targets.contains("a"));
    assert!(!rollback.targets.contains("dead"));
    assert_eq!(deployment.status(), DeploymentStatus::RolledBack);
}

#[tokio::test]
async fn test_abort_stops_dispatch_and_rolls_back() {
    let runner = ScriptedRunner::new();
    runner.slow("a", "install", Duration::from_millis(300));
    runner.slow("b", "install", Duration::from_millis(300));
    let controller = controller(runner.clone(), &["a", "b"]);

    let id = controller
        .submit(request(&["a", "b"], HaltPolicy::PerHost))
        .await
        .unwrap();

    let probe = runner.clone();
    eventually(move || probe.started("install") == 2).await;
    controller.abort(&id).await.unwrap();

    let deployment = controller.wait(&id).await.unwrap();

    // in-flight hooks completed, nothing after them was dispatched
    for host in ["a", "b"] {
        let outcome = deployment.outcome(host).unwrap();
        assert_eq!(stage_names(&outcome.stage_results), vec!["install"]);
        assert_eq!(outcome.outcome, HostState::Halted);
    }
    assert_eq!(runner.started("start"), 0);
    assert!(deployment.abort_requested);
    assert_eq!(deployment.lifecycle.error(), Some("aborted"));
    assert_eq!(runner.started("restore"), 2);
    assert_eq!(deployment.status(), DeploymentStatus::RolledBack);
}

#[tokio::test]
async fn test_abort_right_after_submit() {
    let runner = ScriptedRunner::new();
    runner.slow("a", "install", Duration::from_millis(200));
    let controller = controller(runner.clone(), &["a"]);

    let id = controller
        .submit(request(&["a"], HaltPolicy::PerHost))
        .await
        .unwrap();
    controller.abort(&id).await.unwrap();

    let deployment = controller.wait(&id).await.unwrap();
    assert_ne!(deployment.status(), DeploymentStatus::Succeeded);
    assert_eq!(deployment.lifecycle.error(), Some("aborted"));
    assert_eq!(runner.started("start"), 0);
}

#[tokio::test]
async fn test_abort_terminal_deployment_is_rejected() {
    let runner = ScriptedRunner::new();
    let controller = controller(runner, &["a"]);

    let id = controller
        .submit(request(&["a"], HaltPolicy::PerHost))
        .await
        .unwrap();
    controller.wait(&id).await.unwrap();

    assert!(matches!(
        controller.abort(&id).await,
        Err(PipelineError::InvalidTransition(_))
    ));
    assert!(matches!(
        controller.abort("missing").await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let runner = ScriptedRunner::new();
    runner.fail("a", "validate", 4);
    let controller = controller(runner, &["a", "b"]);

    let id = controller
        .submit(request(&["a", "b"], HaltPolicy::PerHost))
        .await
        .unwrap();
    controller.wait(&id).await.unwrap();

    let first = controller.status(&id).await.unwrap();
    let second = controller.status(&id).await.unwrap();
    assert_eq!(first, second);
    assert!(matches!(
        controller.status("nope").await,
        Err(PipelineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_named_hook_script() {
    let runner = ScriptedRunner::new();
    let controller = controller(runner.clone(), &["a"]);

    let mut req = request(&["a"], HaltPolicy::PerHost);
    req.hook_script = HookScriptRef::Named("web".to_string());
    let id = controller.submit(req).await.unwrap();
    let deployment = controller.wait(&id).await.unwrap();

    assert_eq!(deployment.hook_script.name, "web");
    assert_eq!(deployment.status(), DeploymentStatus::Succeeded);
}

#[tokio::test]
async fn test_concurrent_deployments() {
    let runner = ScriptedRunner::new();
    runner.slow("a", "install", Duration::from_millis(100));
    let controller = controller(runner.clone(), &["a", "b"]);

    let first = controller
        .submit(request(&["a"], HaltPolicy::PerHost))
        .await
        .unwrap();
    let second = controller
        .submit(request(&["b"], HaltPolicy::PerHost))
        .await
        .unwrap();
    assert_ne!(first, second);

    assert_eq!(
        controller.wait(&first).await.unwrap().status(),
        DeploymentStatus::Succeeded
    );
    assert_eq!(
        controller.wait(&second).await.unwrap().status(),
        DeploymentStatus::Succeeded
    );
    assert_eq!(controller.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rejected_requests_are_not_recorded() {
    let runner = ScriptedRunner::new();
    let controller = controller(runner.clone(), &["a"]);

    let empty = request(&[], HaltPolicy::PerHost);
    let unknown_host = request(&["a", "ghost"], HaltPolicy::PerHost);

    let mut unknown_script = request(&["a"], HaltPolicy::PerHost);
    unknown_script.hook_script = HookScriptRef::Named("db".to_string());

    let mut no_stages = request(&["a"], HaltPolicy::PerHost);
    no_stages.hook_script = HookScriptRef::Inline(HookScript::new("empty", vec![]));

    let mut bad_artifact = request(&["a"], HaltPolicy::PerHost);
    bad_artifact.artifact = ArtifactReference::new("not a url", "1.0", DIGEST);

    for req in [empty, unknown_host, unknown_script, no_stages, bad_artifact] {
        assert!(matches!(
            controller.submit(req).await,
            Err(PipelineError::ValidationError(_))
        ));
    }

    assert!(controller.list().await.unwrap().is_empty());
    assert!(runner.events().is_empty());
}
