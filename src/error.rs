use std::time::Duration;

use thiserror::Error;

use crate::messaging::BusError;
use crate::store::StoreError;
use crate::sync::LockError;

/// Failure raised by a worker capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker does not implement the requested capability.
    #[error("worker does not support {capability}")]
    Unsupported { capability: &'static str },
    #[error("{0}")]
    Failed(String),
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A route reference that could not be resolved at dispatch time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("malformed route expression `{0}`")]
    Malformed(String),
    #[error("no state recorded for machine {0}")]
    UnknownMachine(String),
    #[error("state read for machine {machine} failed: {message}")]
    StateRead { machine: String, message: String },
    #[error("workspace key {0} has no value")]
    MissingWorkspaceKey(String),
    #[error("config key {0} is not set")]
    MissingConfig(String),
    #[error("workspace read for {key} failed: {message}")]
    Workspace { key: String, message: String },
}

/// Failure of one entry/exit/recovery action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("worker {worker} is not bound to a plugin")]
    Unbound { worker: String },
    #[error("plugin {0} could not be resolved")]
    PluginNotFound(String),
    #[error("worker {worker} failed at route {route}: {source}")]
    Worker {
        worker: String,
        route: String,
        #[source]
        source: WorkerError,
    },
}

/// Malformed or incomplete workflow definition. Fatal to instance creation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template document is not valid: {0}")]
    Parse(String),
    #[error("template {0} binds no plugins")]
    NoPlugins(String),
    #[error("template {0} declares no state machines")]
    NoStateMachines(String),
    #[error("state machine name must not be empty")]
    EmptyMachineName,
    #[error("state machine {0} is declared twice")]
    DuplicateMachine(String),
    #[error("state machine {machine} has a state with an empty name")]
    EmptyStateName { machine: String },
    #[error("state {state} is declared twice in machine {machine}")]
    DuplicateState { machine: String, state: String },
    #[error("state {state} in machine {machine} names a reserved suffix or trigger")]
    ReservedName { machine: String, state: String },
    #[error("state {state} in machine {machine} has unknown parent {parent}")]
    UnknownParent {
        machine: String,
        state: String,
        parent: String,
    },
    #[error("state {state} in machine {machine} is its own ancestor")]
    ParentCycle { machine: String, state: String },
    #[error("machine {machine} starts in unknown state {state}")]
    UnknownInitialState { machine: String, state: String },
    #[error("transition {trigger} from {state} in machine {machine} targets unknown state {target}")]
    UnknownTarget {
        machine: String,
        state: String,
        trigger: String,
        target: String,
    },
    #[error("entry action in {machine}.{state} names unknown source state {from}")]
    UnknownFromState {
        machine: String,
        state: String,
        from: String,
    },
    #[error("retry on {machine}.{state} fails over to unknown state {fail_state}")]
    UnknownFailState {
        machine: String,
        state: String,
        fail_state: String,
    },
    #[error("retry on {machine}.{state} is invalid: {reason}")]
    InvalidRetry {
        machine: String,
        state: String,
        reason: String,
    },
    #[error("fallthrough names unknown machine {0}")]
    UnknownFallthrough(String),
    #[error("workspace input key must not be empty")]
    EmptyInputKey,
    #[error("worker {worker} is not bound in plugins")]
    UnboundWorker { worker: String },
    #[error("worker {worker} is bound to plugin {plugin}, which is not registered")]
    UnresolvablePlugin { worker: String, plugin: String },
    #[error("worker {worker} does not support route {route}")]
    UnsupportedRoute { worker: String, route: String },
    #[error("route `{route}` is malformed: {reason}")]
    MalformedRoute { route: String, reason: String },
}

/// Top-level error for workflow hosting operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("instance {instance_id} is locked elsewhere; gave up after {waited:?}")]
    LockTimeout { instance_id: String, waited: Duration },
    #[error("workflow plugin not found: {0}")]
    PluginNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("missing required workspace inputs: {}", .0.join(", "))]
    MissingInput(Vec<String>),
    #[error("no workflow instance {0}")]
    NoInstance(String),
    #[error("unknown state machine {machine} in instance {instance_id}")]
    UnknownMachine { instance_id: String, machine: String },
    #[error("codec: {0}")]
    Codec(String),
    #[error("host is not running")]
    NotRunning,
}

impl WorkflowError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(_) | Self::LockTimeout { .. } | Self::Bus(_) => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        let timeout = WorkflowError::LockTimeout {
            instance_id: "i".into(),
            waited: Duration::from_secs(300),
        };
        assert!(timeout.is_retryable());
        assert!(!WorkflowError::PluginNotFound("p".into()).is_retryable());
        assert!(WorkflowError::Store(StoreError::retryable("load", "busy")).is_retryable());
        assert!(!WorkflowError::Store(StoreError::permanent("load", "corrupt")).is_retryable());
    }

    #[test]
    fn missing_input_lists_keys() {
        let e = WorkflowError::MissingInput(vec!["a".into(), "b".into()]);
        assert_eq!(e.to_string(), "missing required workspace inputs: a, b");
    }
}
