//! Per-instance runtime context.
//!
//! A [`WorkflowContext`] is what the state machines of one agent share: the
//! instance's template, its workspace, the persisted machine states and the
//! host collaborators (workers, scheduler, alerts). Machine state lives only
//! in [`WorkflowMachineState`] records; the machines themselves are pure
//! graph definitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::alerts::{AlertSink, Severity, TracingAlerts};
use crate::error::{ActionError, RouteError, WorkflowError};
use crate::host::messages::{RetryJob, WakeJob};
use crate::messaging::MessageBus;
use crate::options::HostOptions;
use crate::records::WorkflowMachineState;
use crate::scheduler::{JobRoute, JobScheduler, ScheduledJob};
use crate::store::{RecordStore, Repository};
use crate::sync::LockProvider;
use crate::template::{RouteContext, RouteExpr, WorkflowTemplate};
use crate::workers::{Worker, WorkerRegistry};
use crate::workspace::{Workspace, WorkspaceStore};

/// Collaborators a host (and every agent it runs) works with.
#[derive(Clone)]
pub struct HostServices {
    pub store: Arc<dyn RecordStore>,
    pub locks: Arc<dyn LockProvider>,
    pub bus: Arc<dyn MessageBus>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub workers: WorkerRegistry,
    pub alerts: Arc<dyn AlertSink>,
}

impl HostServices {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn LockProvider>,
        bus: Arc<dyn MessageBus>,
        scheduler: Arc<dyn JobScheduler>,
        workers: WorkerRegistry,
    ) -> Self {
        Self {
            store,
            locks,
            bus,
            scheduler,
            workers,
            alerts: Arc::new(TracingAlerts),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }
}

/// Identity carried by the `workflow_*` logging macros.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    instance_id: &'a str,
    machine: &'a str,
}

impl<'a> ActionContext<'a> {
    pub fn new(instance_id: &'a str, machine: &'a str) -> Self {
        Self { instance_id, machine }
    }

    pub fn instance_id(&self) -> &str {
        self.instance_id
    }

    pub fn machine_name(&self) -> &str {
        self.machine
    }
}

#[derive(Clone)]
pub struct WorkflowContext {
    instance_id: String,
    template: Arc<WorkflowTemplate>,
    states: Repository<WorkflowMachineState>,
    workspace: Workspace,
    workers: WorkerRegistry,
    scheduler: Arc<dyn JobScheduler>,
    alerts: Arc<dyn AlertSink>,
    options: Arc<HostOptions>,
}

impl WorkflowContext {
    /// Context for `instance_id`. The template's key aliases are registered on
    /// the workspace here.
    pub fn new(
        instance_id: impl Into<String>,
        template: Arc<WorkflowTemplate>,
        services: &HostServices,
        options: Arc<HostOptions>,
    ) -> Self {
        let instance_id = instance_id.into();
        let workspace = WorkspaceStore::new(Arc::clone(&services.store)).open(&instance_id);
        workspace.register_key_overloads(
            template
                .workspace
                .key_aliases
                .iter()
                .map(|a| (a.alias.clone(), a.key.clone())),
        );
        Self {
            instance_id,
            template,
            states: Repository::new(Arc::clone(&services.store)),
            workspace,
            workers: services.workers.clone(),
            scheduler: Arc::clone(&services.scheduler),
            alerts: Arc::clone(&services.alerts),
            options,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn template(&self) -> &Arc<WorkflowTemplate> {
        &self.template
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    pub fn alert(&self, severity: Severity, message: &str) {
        self.alerts.alert(severity, message);
    }

    /// Current state of `machine`, created in the machine's initial state on first access.
    pub async fn access_state(&self, machine: &str) -> Result<WorkflowMachineState, WorkflowError> {
        let id = WorkflowMachineState::record_id_for(&self.instance_id, machine);
        if let Some(state) = self.states.load(&id).await? {
            return Ok(state);
        }
        let definition = self
            .template
            .machine(machine)
            .ok_or_else(|| WorkflowError::UnknownMachine {
                instance_id: self.instance_id.clone(),
                machine: machine.to_string(),
            })?;
        let state = WorkflowMachineState::new(&self.instance_id, machine, &definition.initial_state);
        self.states.store(&state).await?;
        tracing::debug!(
            target: "flowhost::workflow",
            instance_id = %self.instance_id,
            machine = %machine,
            state = %state.state,
            "machine state initialised"
        );
        Ok(state)
    }

    /// Persist `state` as the current state of `machine`, stamping the change time.
    pub async fn change_state(&self, machine: &str, state: &str) -> Result<WorkflowMachineState, WorkflowError> {
        let record = WorkflowMachineState::new(&self.instance_id, machine, state);
        self.states.store(&record).await?;
        Ok(record)
    }

    pub async fn machine_states(&self) -> Result<Vec<WorkflowMachineState>, WorkflowError> {
        let filter = WorkflowMachineState::for_instance(&self.instance_id);
        Ok(self.states.query_all(&filter, self.options.trigger_page_size).await?)
    }

    /// Worker bound to a template worker id.
    pub fn worker_for(&self, worker: &str) -> Result<Arc<dyn Worker>, ActionError> {
        let plugin = self.template.plugin_for(worker).ok_or_else(|| ActionError::Unbound {
            worker: worker.to_string(),
        })?;
        self.workers
            .resolve(plugin)
            .ok_or_else(|| ActionError::PluginNotFound(plugin.to_string()))
    }

    /// Expand a route for dispatch. Unresolved references are logged and
    /// alerted; they expand to nothing.
    pub async fn resolve_route(&self, machine: &str, route: &RouteExpr) -> String {
        let evaluation = route.evaluate(self).await;
        for error in &evaluation.errors {
            let action = ActionContext::new(&self.instance_id, machine);
            crate::workflow_warn!(action, route = %route, error = %error, "route reference unresolved");
            self.alerts.alert(
                Severity::Warning,
                &format!("instance {} route {route}: {error}", self.instance_id),
            );
        }
        evaluation.route
    }

    /// Schedule `trigger` to be fired on `machine` at `when`.
    pub async fn schedule_retry(
        &self,
        machine: &str,
        trigger: &str,
        when: DateTime<Utc>,
    ) -> Result<String, WorkflowError> {
        let job = ScheduledJob::new(&RetryJob {
            instance_id: self.instance_id.clone(),
            machine: machine.to_string(),
            trigger: trigger.to_string(),
        })?;
        Ok(self.scheduler.schedule_job(job, when, None, self.host_route()).await?)
    }

    /// Schedule a wake of this instance, delivered to this host.
    pub async fn schedule_wake(&self, when: DateTime<Utc>) -> Result<String, WorkflowError> {
        let job = ScheduledJob::new(&WakeJob {
            instance_id: self.instance_id.clone(),
        })?;
        Ok(self.scheduler.schedule_job(job, when, None, self.host_route()).await?)
    }

    fn host_route(&self) -> JobRoute {
        JobRoute::new(&self.options.direct_exchange, &self.options.host_id)
    }
}

#[async_trait::async_trait]
impl RouteContext for WorkflowContext {
    async fn machine_state(&self, machine: &str) -> Result<String, RouteError> {
        if self.template.machine(machine).is_none() {
            return Err(RouteError::UnknownMachine(machine.to_string()));
        }
        self.access_state(machine)
            .await
            .map(|s| s.state)
            .map_err(|e| RouteError::StateRead {
                machine: machine.to_string(),
                message: e.to_string(),
            })
    }

    async fn workspace_value(&self, key: &str) -> Result<String, RouteError> {
        match self.workspace.get_value(key).await {
            Ok(Some(Value::String(text))) => Ok(text),
            Ok(Some(value)) => Ok(value.to_string()),
            Ok(None) => Err(RouteError::MissingWorkspaceKey(key.to_string())),
            Err(e) => Err(RouteError::Workspace {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn config_value(&self, key: &str) -> Result<String, RouteError> {
        self.options
            .setting(key)
            .ok_or_else(|| RouteError::MissingConfig(key.to_string()))
    }
}
