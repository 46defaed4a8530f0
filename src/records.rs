//! Persistent workflow records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Filter, Record};
use crate::template::WorkflowTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Sleeping,
    Complete,
    NoInstance,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Sleeping => "sleeping",
            Self::Complete => "complete",
            Self::NoInstance => "no_instance",
        }
    }
}

/// One workflow instance. The template travels with the instance so a host
/// can resume it without the original creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceInfo {
    pub id: String,
    pub template_name: String,
    pub template: WorkflowTemplate,
    pub status: InstanceStatus,
    pub last_activity: DateTime<Utc>,
    /// `None` means the instance only wakes on an explicit trigger.
    pub next_activation_time: Option<DateTime<Utc>>,
}

impl WorkflowInstanceInfo {
    pub fn new(id: impl Into<String>, template: WorkflowTemplate) -> Self {
        Self {
            id: id.into(),
            template_name: template.name.clone(),
            template,
            status: InstanceStatus::Active,
            last_activity: Utc::now(),
            next_activation_time: None,
        }
    }

    pub fn by_status(status: InstanceStatus) -> Filter {
        Filter::new().eq("status", status.as_str())
    }
}

impl Record for WorkflowInstanceInfo {
    const KIND: &'static str = "workflow_instance";

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Current state of one state machine of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMachineState {
    pub id: String,
    pub parent: String,
    pub state_machine: String,
    pub state: String,
    pub last_state_changed: DateTime<Utc>,
}

impl WorkflowMachineState {
    pub fn record_id_for(instance_id: &str, machine: &str) -> String {
        format!("{instance_id}:{machine}")
    }

    pub fn new(instance_id: &str, machine: &str, state: &str) -> Self {
        Self {
            id: Self::record_id_for(instance_id, machine),
            parent: instance_id.to_string(),
            state_machine: machine.to_string(),
            state: state.to_string(),
            last_state_changed: Utc::now(),
        }
    }

    pub fn for_instance(instance_id: &str) -> Filter {
        Filter::new().eq("parent", instance_id)
    }
}

impl Record for WorkflowMachineState {
    const KIND: &'static str = "workflow_machine_state";

    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// What the owning agent does with a trigger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRoute {
    Fire,
    Nap,
    End,
}

impl TriggerRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fire => "fire",
            Self::Nap => "nap",
            Self::End => "end",
        }
    }
}

/// A queued command for one instance, deleted once applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub id: String,
    pub instance_target: String,
    pub machine_context: String,
    pub trigger_name: String,
    pub route: TriggerRoute,
    pub created: DateTime<Utc>,
}

impl WorkflowTrigger {
    pub fn new(
        instance_target: impl Into<String>,
        machine_context: impl Into<String>,
        trigger_name: impl Into<String>,
        route: TriggerRoute,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_target: instance_target.into(),
            machine_context: machine_context.into(),
            trigger_name: trigger_name.into(),
            route,
            created: Utc::now(),
        }
    }

    pub fn fire(instance: &str, machine: &str, trigger: &str) -> Self {
        Self::new(instance, machine, trigger, TriggerRoute::Fire)
    }

    pub fn nap(instance: &str) -> Self {
        Self::new(instance, "", "", TriggerRoute::Nap)
    }

    pub fn end(instance: &str) -> Self {
        Self::new(instance, "", "", TriggerRoute::End)
    }

    pub fn for_instance(instance_id: &str) -> Filter {
        Filter::new().eq("instance_target", instance_id)
    }
}

impl Record for WorkflowTrigger {
    const KIND: &'static str = "workflow_trigger";

    fn record_id(&self) -> String {
        self.id.clone()
    }
}
