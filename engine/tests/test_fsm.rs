//! FSM tests

use fleetpipe::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
use fleetpipe::errors::PipelineError;
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_fsm_initial_state() {
    let fsm = DeploymentFsm::new();
    assert_eq!(fsm.state(), DeploymentStatus::Pending);
    assert!(fsm.error().is_none());
    assert!(!fsm.is_terminal());
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = DeploymentFsm::new();

    fsm.process(DeploymentEvent::Accept).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::InProgress);
    assert!(!fsm.is_terminal());

    fsm.process(DeploymentEvent::Complete).unwrap();
    assert_eq!(fsm.state(), DeploymentStatus::Succeeded);
    assert!(fsm.is_terminal());
}

#[test]
fn test_fsm_abort_flow() {
    let mut fsm = DeploymentFsm::new();

    assert_ok!(fsm.process(DeploymentEvent::Accept));
    assert_ok!(fsm.process(DeploymentEvent::Abort));
    assert_eq!(fsm.state(), DeploymentStatus::Failed);
    assert_eq!(fsm.error(), Some("aborted"));

    // a second abort is not a transition
    assert_err!(fsm.process(DeploymentEvent::Abort));

    assert_ok!(fsm.process(DeploymentEvent::RollbackSucceeded));
    assert_eq!(fsm.state(), DeploymentStatus::RolledBack);
}

#[test]
fn test_fsm_rejects_invalid_transitions() {
    let invalid = |fsm: &mut DeploymentFsm, event: DeploymentEvent| {
        matches!(fsm.process(event), Err(PipelineError::InvalidTransition(_)))
    };

    let mut pending = DeploymentFsm::new();
    assert!(invalid(&mut pending, DeploymentEvent::Complete));
    assert!(invalid(&mut pending, DeploymentEvent::Abort));
    assert!(invalid(&mut pending, DeploymentEvent::RollbackSucceeded));
    assert_eq!(pending.state(), DeploymentStatus::Pending);

    let mut succeeded = DeploymentFsm::new();
    succeeded.process(DeploymentEvent::Accept).unwrap();
    succeeded.process(DeploymentEvent::Complete).unwrap();
    assert!(invalid(&mut succeeded, DeploymentEvent::Fail("late".to_string())));
    assert!(invalid(&mut succeeded, DeploymentEvent::RollbackSucceeded));
    assert!(invalid(&mut succeeded, DeploymentEvent::Abort));
    assert_eq!(succeeded.state(), DeploymentStatus::Succeeded);
    assert!(succeeded.error().is_none());

    let mut rolled_back = DeploymentFsm::new();
    rolled_back.process(DeploymentEvent::Accept).unwrap();
    rolled_back.process(DeploymentEvent::Fail("x".to_string())).unwrap();
    rolled_back.process(DeploymentEvent::RollbackSucceeded).unwrap();
    assert!(invalid(&mut rolled_back, DeploymentEvent::Accept));
    assert!(invalid(&mut rolled_back, DeploymentEvent::RollbackSucceeded));
}

#[test]
fn test_fsm_persisted_shape() {
    let mut fsm = DeploymentFsm::new();
    fsm.process(DeploymentEvent::Accept).unwrap();
    fsm.process(DeploymentEvent::Fail("host b failed start".to_string()))
        .unwrap();

    let json = serde_json::to_value(&fsm).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["error"], "host b failed start");

    let back: DeploymentFsm = serde_json::from_value(json).unwrap();
    assert_eq!(back, fsm);
}
