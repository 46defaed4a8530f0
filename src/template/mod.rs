//! Declarative workflow templates.
//!
//! A template is a JSON document naming the worker plugins it uses, its state
//! machines and their states, and the workspace inputs an instance needs.
//! Templates are immutable once parsed; [`specify_using_template`] is the
//! only way a host turns a document into a template it will run.

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

pub mod route;
mod validate;

pub use route::{RouteContext, RouteEvaluation, RouteExpr, RouteSegment};
pub use validate::{specify_using_template, validate_structure, validate_workers};

/// Reserved trigger moving a retrying state into (and out of) its retry state.
pub const RETRY_TRIGGER: &str = "sys.retry";
/// Reserved trigger moving a retrying state to its fail state.
pub const FAIL_TRIGGER: &str = "sys.fail";
/// Transition target that swallows the trigger.
pub const IGNORE_TARGET: &str = "sys.ignore";
/// Suffix of the implicit retry state of a state with a retry policy.
pub const RETRY_STATE_SUFFIX: &str = "_retry";

pub fn retry_state_name(state: &str) -> String {
    format!("{state}{RETRY_STATE_SUFFIX}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplate {
    pub name: String,
    pub version: Version,
    /// Worker route id → registered plugin name.
    #[serde(default)]
    pub plugins: Vec<PluginBinding>,
    #[serde(default)]
    pub state_machines: Vec<StateMachineTemplate>,
    /// Machine receiving triggers no other machine handles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallthrough: Option<String>,
    /// Idle seconds after which a hosted instance naps itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_sleep_seconds: Option<u64>,
    #[serde(default)]
    pub workspace: WorkspaceTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginBinding {
    pub route_id: String,
    pub plugin: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceTemplate {
    #[serde(default)]
    pub key_aliases: Vec<KeyAlias>,
    #[serde(default)]
    pub inputs: Vec<WorkspaceInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAlias {
    pub alias: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInput {
    pub key: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineTemplate {
    pub name: String,
    pub initial_state: String,
    /// Trigger fired on this machine whenever the instance wakes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_trigger: Option<String>,
    #[serde(default)]
    pub states: Vec<StateTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_actions: Vec<ActionTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit_actions: Vec<ActionTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTemplate {
    /// Worker route id, bound to a plugin in [`WorkflowTemplate::plugins`].
    pub worker: String,
    pub route: RouteExpr,
    /// Entry actions only: run only when arriving from this state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Trigger fired on the same machine after the action succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_trigger: Option<String>,
    /// Trigger fired on the same machine when the action fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_trigger: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionTemplate {
    pub trigger: String,
    /// Target state; the state's own name means re-entry, `sys.ignore` swallows.
    /// Either of those wins over `dynamic_next`; any other value is unused
    /// when `dynamic_next` is set.
    #[serde(default)]
    pub next: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<WorkerCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_next: Option<WorkerCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCall {
    pub worker: String,
    pub route: RouteExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryTemplate {
    pub fail_state: String,
    pub count: u32,
    pub minimum_minutes: u32,
    pub maximum_minutes: u32,
    pub delta_minutes: u32,
    #[serde(default)]
    pub sleep_on_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<ActionTemplate>,
}

impl WorkflowTemplate {
    pub fn from_document(document: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(document).map_err(|e| TemplateError::Parse(e.to_string()))
    }

    pub fn to_document(&self) -> Result<String, TemplateError> {
        serde_json::to_string_pretty(self).map_err(|e| TemplateError::Parse(e.to_string()))
    }

    pub fn machine(&self, name: &str) -> Option<&StateMachineTemplate> {
        self.state_machines.iter().find(|m| m.name == name)
    }

    /// Plugin bound to a worker route id.
    pub fn plugin_for(&self, worker: &str) -> Option<&str> {
        self.plugins
            .iter()
            .find(|p| p.route_id == worker)
            .map(|p| p.plugin.as_str())
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.workspace
            .inputs
            .iter()
            .filter(|i| !i.optional)
            .map(|i| i.key.as_str())
    }

    pub fn has_activation_trigger(&self) -> bool {
        self.state_machines.iter().any(|m| m.activation_trigger.is_some())
    }

    /// Every worker call in the template with where it appears.
    pub(crate) fn worker_calls(&self) -> Vec<(&str, &RouteExpr)> {
        let mut calls = Vec::new();
        for machine in &self.state_machines {
            for state in &machine.states {
                for action in state.entry_actions.iter().chain(&state.exit_actions) {
                    calls.push((action.worker.as_str(), &action.route));
                }
                for transition in &state.transitions {
                    for call in transition.guard.iter().chain(&transition.dynamic_next) {
                        calls.push((call.worker.as_str(), &call.route));
                    }
                }
                if let Some(recovery) = state.retry.as_ref().and_then(|r| r.recovery.as_ref()) {
                    calls.push((recovery.worker.as_str(), &recovery.route));
                }
            }
        }
        calls
    }
}

impl StateMachineTemplate {
    pub fn state(&self, name: &str) -> Option<&StateTemplate> {
        self.states.iter().find(|s| s.name == name)
    }
}
