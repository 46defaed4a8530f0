use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::WorkflowError;
use crate::host::messages::{CreateInstance, TriggerNotice};
use crate::messaging::{publish, Exchange, ExchangeType, MessageBus};
use crate::options::HostOptions;
use crate::records::{InstanceStatus, WorkflowInstanceInfo, WorkflowMachineState, WorkflowTrigger};
use crate::store::{RecordStore, Repository};
use crate::template::WorkflowTemplate;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Thin client for control-plane operations.
///
/// Enqueue-only: it talks to hosts through the shared record store and the
/// hosts' exchanges, never to an agent directly. Template documents are only
/// parsed here; the host that picks up the creation request validates them
/// against its worker registry.
pub struct WorkflowClient {
    bus: Arc<dyn MessageBus>,
    instances: Repository<WorkflowInstanceInfo>,
    states: Repository<WorkflowMachineState>,
    triggers: Repository<WorkflowTrigger>,
    direct_exchange: String,
    broadcast_exchange: String,
    any_host_route: String,
}

impl WorkflowClient {
    /// Create a client addressing the exchanges named in `options`.
    pub fn new(store: Arc<dyn RecordStore>, bus: Arc<dyn MessageBus>, options: &HostOptions) -> Self {
        Self {
            bus,
            instances: Repository::new(Arc::clone(&store)),
            states: Repository::new(Arc::clone(&store)),
            triggers: Repository::new(store),
            direct_exchange: options.direct_exchange.clone(),
            broadcast_exchange: options.broadcast_exchange.clone(),
            any_host_route: options.any_host_route.clone(),
        }
    }

    /// Ask any host to create an instance. Returns the new instance id.
    pub async fn create_instance(&self, template_document: &str, initial_data: Map<String, Value>) -> Result<String, WorkflowError> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        self.create_instance_with_id(&instance_id, template_document, initial_data)
            .await?;
        Ok(instance_id)
    }

    pub async fn create_instance_with_id(
        &self,
        instance_id: &str,
        template_document: &str,
        initial_data: Map<String, Value>,
    ) -> Result<(), WorkflowError> {
        WorkflowTemplate::from_document(template_document)?;
        let request = CreateInstance {
            instance_id: instance_id.to_string(),
            template_document: template_document.to_string(),
            initial_data,
        };
        let exchange = self.exchange(&self.direct_exchange, ExchangeType::Direct).await?;
        let delivered = publish(exchange.as_ref(), &request, &self.any_host_route).await?;
        if delivered.is_empty() {
            tracing::warn!(
                target: "flowhost::host",
                instance_id = %instance_id,
                "no host is listening for creation requests"
            );
        }
        Ok(())
    }

    /// Create with initial data from any serializable struct or map.
    pub async fn create_instance_typed<D: Serialize>(
        &self,
        instance_id: &str,
        template_document: &str,
        initial_data: &D,
    ) -> Result<(), WorkflowError> {
        let data = match serde_json::to_value(initial_data)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(WorkflowError::Codec(format!(
                    "initial data must serialize to an object, got {other}"
                )))
            }
        };
        self.create_instance_with_id(instance_id, template_document, data)
            .await
    }

    /// Queue a trigger on one state machine of an instance.
    pub async fn fire_trigger(&self, instance_id: &str, machine: &str, trigger: &str) -> Result<(), WorkflowError> {
        self.enqueue(WorkflowTrigger::fire(instance_id, machine, trigger))
            .await
    }

    /// Ask the instance to go to sleep.
    pub async fn nap_instance(&self, instance_id: &str) -> Result<(), WorkflowError> {
        self.enqueue(WorkflowTrigger::nap(instance_id)).await
    }

    /// Ask the instance to complete.
    pub async fn end_instance(&self, instance_id: &str) -> Result<(), WorkflowError> {
        self.enqueue(WorkflowTrigger::end(instance_id)).await
    }

    pub async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus, WorkflowError> {
        Ok(self
            .instances
            .load(instance_id)
            .await?
            .map_or(InstanceStatus::NoInstance, |info| info.status))
    }

    /// Current state of `machine`, if the instance has entered it yet.
    pub async fn machine_state(&self, instance_id: &str, machine: &str) -> Result<Option<String>, WorkflowError> {
        let id = WorkflowMachineState::record_id_for(instance_id, machine);
        Ok(self.states.load(&id).await?.map(|s| s.state))
    }

    /// Poll until the instance reports `status`. Returns the last status seen.
    pub async fn wait_for_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        timeout: Duration,
    ) -> Result<InstanceStatus, WorkflowError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.instance_status(instance_id).await?;
            if current == status || tokio::time::Instant::now() >= deadline {
                return Ok(current);
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    async fn enqueue(&self, trigger: WorkflowTrigger) -> Result<(), WorkflowError> {
        let notice = TriggerNotice {
            instance_id: trigger.instance_target.clone(),
        };
        self.triggers.store(&trigger).await?;
        let exchange = self
            .exchange(&self.broadcast_exchange, ExchangeType::Fanout)
            .await?;
        publish(exchange.as_ref(), &notice, "").await?;
        Ok(())
    }

    async fn exchange(&self, name: &str, exchange_type: ExchangeType) -> Result<Arc<dyn Exchange>, WorkflowError> {
        Ok(self.bus.declare_exchange(name, exchange_type).await?)
    }
}
