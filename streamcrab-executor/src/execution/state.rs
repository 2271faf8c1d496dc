use std::fmt;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::types::ExecutionAttemptId;

/// Lifecycle of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Deploying,
    Running,
    Finished,
    Canceling,
    Canceled,
    Failed,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 7] = [
        Self::Created,
        Self::Deploying,
        Self::Running,
        Self::Finished,
        Self::Canceling,
        Self::Canceled,
        Self::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed)
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Created, Deploying | Canceled | Failed)
                | (Deploying, Running | Canceling | Canceled | Failed)
                | (Running, Finished | Canceling | Failed)
                | (Canceling, Canceled | Failed)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "CREATED",
            Self::Deploying => "DEPLOYING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        })
    }
}

/// Emitted to listeners after every successful transition, in transition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStateUpdate {
    pub attempt_id: ExecutionAttemptId,
    pub previous: ExecutionState,
    pub state: ExecutionState,
    /// Rendered failure cause, set only for transitions into FAILED.
    pub failure_cause: Option<String>,
}

struct StateInner {
    state: ExecutionState,
    failure_cause: Option<Arc<anyhow::Error>>,
    listeners: Vec<Sender<ExecutionStateUpdate>>,
}

/// Owns the execution state of one attempt.
///
/// Every change is a compare-and-set under one lock, so concurrent cancel and
/// completion requests can never both win. Terminal states absorb everything.
pub struct ExecutionStateMachine {
    attempt_id: ExecutionAttemptId,
    task_name: String,
    inner: Mutex<StateInner>,
}

impl ExecutionStateMachine {
    pub fn new(attempt_id: ExecutionAttemptId, task_name: impl Into<String>) -> Self {
        Self {
            attempt_id,
            task_name: task_name.into(),
            inner: Mutex::new(StateInner {
                state: ExecutionState::Created,
                failure_cause: None,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn attempt_id(&self) -> ExecutionAttemptId {
        self.attempt_id
    }

    pub fn current(&self) -> ExecutionState {
        self.inner.lock().expect("execution state poisoned").state
    }

    pub fn failure_cause(&self) -> Option<Arc<anyhow::Error>> {
        self.inner
            .lock()
            .expect("execution state poisoned")
            .failure_cause
            .clone()
    }

    /// Register a listener; it sees every transition made after this call.
    pub fn subscribe(&self) -> Receiver<ExecutionStateUpdate> {
        let (tx, rx) = unbounded();
        self.add_listener(tx);
        rx
    }

    pub fn add_listener(&self, listener: Sender<ExecutionStateUpdate>) {
        self.inner
            .lock()
            .expect("execution state poisoned")
            .listeners
            .push(listener);
    }

    /// Move from `expected` to `next`. Returns false when the current state is
    /// not `expected` or the edge is not allowed.
    pub fn transition(&self, expected: ExecutionState, next: ExecutionState) -> bool {
        let mut inner = self.inner.lock().expect("execution state poisoned");
        if inner.state != expected {
            return false;
        }
        if !expected.can_transition_to(next) {
            tracing::error!(
                "task {} ({}) refused illegal transition from {} to {}",
                self.task_name,
                self.attempt_id,
                expected,
                next
            );
            return false;
        }
        self.apply(&mut inner, next, None);
        true
    }

    /// Move any non-terminal state to FAILED and record `cause`.
    /// Returns false if the attempt already reached a terminal state.
    pub fn fail(&self, cause: anyhow::Error) -> bool {
        let mut inner = self.inner.lock().expect("execution state poisoned");
        if inner.state.is_terminal() {
            tracing::debug!(
                "task {} ({}) already {}, ignoring failure: {:#}",
                self.task_name,
                self.attempt_id,
                inner.state,
                cause
            );
            return false;
        }
        self.apply(&mut inner, ExecutionState::Failed, Some(cause));
        true
    }

    /// Run `f` while holding the state lock, only if the state is `expected`.
    ///
    /// Used to report checkpoint results: nothing can move the attempt out of
    /// `expected` until `f` returns, so `f` must not call back into this machine.
    pub fn with_state<R>(&self, expected: ExecutionState, f: impl FnOnce() -> R) -> Option<R> {
        let inner = self.inner.lock().expect("execution state poisoned");
        if inner.state != expected {
            return None;
        }
        Some(f())
    }

    fn apply(&self, inner: &mut StateInner, next: ExecutionState, cause: Option<anyhow::Error>) {
        let previous = inner.state;
        inner.state = next;

        let rendered = cause.as_ref().map(|err| format!("{err:#}"));
        match &rendered {
            Some(cause) => tracing::warn!(
                "task {} ({}) switched from {} to {}: {}",
                self.task_name,
                self.attempt_id,
                previous,
                next,
                cause
            ),
            None => tracing::info!(
                "task {} ({}) switched from {} to {}",
                self.task_name,
                self.attempt_id,
                previous,
                next
            ),
        }
        if let Some(cause) = cause {
            inner.failure_cause = Some(Arc::new(cause));
        }

        let update = ExecutionStateUpdate {
            attempt_id: self.attempt_id,
            previous,
            state: next,
            failure_cause: rendered,
        };
        // Delivered under the lock so listeners observe transitions in order.
        inner.listeners.retain(|listener| {
            if listener.send(update.clone()).is_err() {
                tracing::warn!(
                    "dropping disconnected state listener of task {} ({})",
                    self.task_name,
                    self.attempt_id
                );
                return false;
            }
            true
        });
    }
}

impl fmt::Debug for ExecutionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStateMachine")
            .field("attempt_id", &self.attempt_id)
            .field("task_name", &self.task_name)
            .field("state", &self.current())
            .finish()
    }
}
