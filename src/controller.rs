//! Control loops: the operator drives [`Coordinator`](crate::coordinator::Coordinator)
//! passes per `Upgrade`, the proxy drives its node's
//! [`Forwarder`](crate::forwarder::Forwarder).

pub mod operator;
pub mod proxy;

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::coordinator::PassOutcome;
use crate::error::NodeupError;
use crate::forwarder::ForwardOutcome;

/// Recheck interval once every node reports the target versions.
pub const STEADY_REQUEUE: Duration = Duration::from_secs(300);
/// Requeue delay after a pass that made progress.
pub const ADVANCE_REQUEUE: Duration = Duration::from_millis(100);
/// Retry interval after a selected node missed its deadline.
pub const STALLED_REQUEUE: Duration = Duration::from_secs(60);
/// Recheck interval after a request was handed to the agent.
pub const PUSHED_REQUEUE: Duration = Duration::from_secs(30);
pub const TRANSIENT_ERROR_REQUEUE: Duration = Duration::from_secs(10);
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

pub fn action_for_pass(outcome: &PassOutcome) -> Action {
    match outcome {
        PassOutcome::NoTarget => Action::await_change(),
        PassOutcome::Steady => Action::requeue(STEADY_REQUEUE),
        PassOutcome::Advanced { .. } => Action::requeue(ADVANCE_REQUEUE),
        PassOutcome::Stalled { .. } => Action::requeue(STALLED_REQUEUE),
    }
}

pub fn action_for_forward(outcome: &ForwardOutcome) -> Action {
    match outcome {
        ForwardOutcome::Pushed => Action::requeue(PUSHED_REQUEUE),
        ForwardOutcome::Idle
        | ForwardOutcome::Waiting
        | ForwardOutcome::Cleared
        | ForwardOutcome::Released => Action::await_change(),
    }
}

pub fn action_for_error(err: &NodeupError) -> Action {
    if err.is_transient() {
        Action::requeue(TRANSIENT_ERROR_REQUEUE)
    } else {
        Action::requeue(ERROR_REQUEUE)
    }
}

/// Value of the `result` label on `nodeup_reconcile`.
pub const fn outcome_label(outcome: &PassOutcome) -> &'static str {
    match outcome {
        PassOutcome::NoTarget => "no_target",
        PassOutcome::Steady => "steady",
        PassOutcome::Advanced { .. } => "advanced",
        PassOutcome::Stalled { .. } => "stalled",
    }
}
