//! Messages hosts exchange on the direct and broadcast exchanges.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::messaging::BusMessage;
use crate::records::TriggerRoute;

/// Scheduled wake of a sleeping instance. Routed to the host parking its lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeJob {
    pub instance_id: String,
}

impl BusMessage for WakeJob {
    const TYPE_TAG: &'static str = "flowhost.wake";
}

/// Request to create an instance from a template document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInstance {
    pub instance_id: String,
    pub template_document: String,
    #[serde(default)]
    pub initial_data: Map<String, Value>,
}

impl BusMessage for CreateInstance {
    const TYPE_TAG: &'static str = "flowhost.create";
}

/// Scheduled retry of a state that entered its retry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryJob {
    pub instance_id: String,
    pub machine: String,
    pub trigger: String,
}

impl BusMessage for RetryJob {
    const TYPE_TAG: &'static str = "flowhost.retry";
}

/// Generic trigger delivered as a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerJob {
    pub instance_id: String,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub trigger: String,
    pub route: TriggerRoute,
}

impl BusMessage for TriggerJob {
    const TYPE_TAG: &'static str = "flowhost.trigger-job";
}

/// Broadcast: a trigger is persisted for an instance the sender does not host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerNotice {
    pub instance_id: String,
}

impl BusMessage for TriggerNotice {
    const TYPE_TAG: &'static str = "flowhost.trigger";
}
