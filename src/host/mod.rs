//! Workflow host.
//!
//! A host runs the agents of the instances it has acquired and cooperates with
//! peer hosts through two exchanges: a direct exchange for jobs addressed to a
//! host (or to any host, load-balanced) and a fanout exchange announcing
//! triggers for instances the sender does not run. At most one agent per
//! instance exists across all hosts; the instance lease is the only guard.
//!
//! When an agent sleeps, its lease stays parked in the host that ran it, so a
//! wake job routed to that host resumes the instance without contention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentOwner, WorkflowAgent};
use crate::context::HostServices;
use crate::error::WorkflowError;
use crate::messaging::{publish, Acknowledger, BusMessage, Exchange, ExchangeType, Listener, TypeRoutes};
use crate::options::HostOptions;
use crate::records::{InstanceStatus, WorkflowInstanceInfo, WorkflowTrigger};
use crate::store::Repository;
use crate::sync::{instance_lock_name, Lease};
use crate::template::specify_using_template;

mod groom;
pub mod messages;

pub use groom::GroomReport;
use messages::{CreateInstance, RetryJob, TriggerJob, TriggerNotice, WakeJob};

/// Delay before a message that failed with a retryable error is put back.
const ABANDON_DELAY: Duration = Duration::from_secs(1);

/// Cloneable handle on a host.
#[derive(Clone)]
pub struct WorkflowHost {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    me: Weak<HostInner>,
    services: HostServices,
    options: Arc<HostOptions>,
    agents: Mutex<HashMap<String, Arc<WorkflowAgent>>>,
    parked: Mutex<HashMap<String, Lease>>,
    instances: Repository<WorkflowInstanceInfo>,
    triggers: Repository<WorkflowTrigger>,
    direct: RwLock<Option<Arc<dyn Exchange>>>,
    broadcast: RwLock<Option<Arc<dyn Exchange>>>,
    listeners: tokio::sync::Mutex<Vec<Listener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl WorkflowHost {
    pub fn new(services: HostServices, options: HostOptions) -> Self {
        let instances = Repository::new(Arc::clone(&services.store));
        let triggers = Repository::new(Arc::clone(&services.store));
        Self {
            inner: Arc::new_cyclic(|me| HostInner {
                me: me.clone(),
                services,
                options: Arc::new(options),
                agents: Mutex::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
                instances,
                triggers,
                direct: RwLock::new(None),
                broadcast: RwLock::new(None),
                listeners: tokio::sync::Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.inner.options.host_id
    }

    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Declare exchanges and this host's queues, start listening, then start
    /// reconciliation and grooming in the background.
    pub async fn on_start(&self) -> Result<(), WorkflowError> {
        if self.inner.cancel.is_cancelled() {
            return Err(WorkflowError::NotRunning);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.inner.attach().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let reconcile = tokio::spawn(Arc::clone(&self.inner).reconcile(self.inner.cancel.clone()));
        let groom = tokio::spawn(Arc::clone(&self.inner).protected_run(self.inner.cancel.clone()));
        self.inner.tasks().extend([reconcile, groom]);

        tracing::info!(
            target: "flowhost::host",
            host_id = %self.host_id(),
            direct = %self.inner.options.direct_exchange,
            broadcast = %self.inner.options.broadcast_exchange,
            "host started"
        );
        Ok(())
    }

    /// Stop listeners and background tasks, stop every hosted agent, release
    /// parked leases and remove this host's queues. A stopped host cannot be
    /// started again.
    pub async fn on_stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let listeners: Vec<Listener> = self.inner.listeners.lock().await.drain(..).collect();
        for listener in listeners {
            listener.dispose().await;
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let agents: Vec<Arc<WorkflowAgent>> = self.inner.agents().drain().map(|(_, a)| a).collect();
        for agent in &agents {
            agent.stop().await;
        }
        let parked = std::mem::take(&mut *self.inner.parked());
        drop(parked);

        let host_id = &self.inner.options.host_id;
        let exchanges = [
            (self.inner.direct_exchange(), direct_queue_name(host_id)),
            (self.inner.broadcast_exchange(), broadcast_queue_name(host_id)),
        ];
        for (exchange, queue) in exchanges {
            if let Some(exchange) = exchange {
                if let Err(e) = exchange.delete_queue(&queue).await {
                    tracing::warn!(target: "flowhost::host", queue = %queue, error = %e, "queue cleanup failed");
                }
            }
        }
        tracing::info!(target: "flowhost::host", host_id = %host_id, stopped_agents = agents.len(), "host stopped");
    }

    /// Host the instance if its lease can be taken without waiting.
    ///
    /// Returns `true` when the instance is (now) hosted here. A lease held
    /// elsewhere is not an error.
    pub async fn try_acquire_workflow(&self, instance_id: &str) -> Result<bool, WorkflowError> {
        self.inner.try_acquire(instance_id).await
    }

    /// Validate `template_document`, create an instance with a fresh id and host it.
    pub async fn create_workflow_instance(
        &self,
        template_document: &str,
        initial_data: Map<String, Value>,
    ) -> Result<String, WorkflowError> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        self.inner
            .create_instance(&instance_id, template_document, initial_data)
            .await?;
        Ok(instance_id)
    }

    pub async fn create_workflow_instance_with_id(
        &self,
        instance_id: &str,
        template_document: &str,
        initial_data: Map<String, Value>,
    ) -> Result<(), WorkflowError> {
        self.inner
            .create_instance(instance_id, template_document, initial_data)
            .await
    }

    /// Persist a fire trigger, then bump the local agent or announce it to peers.
    pub async fn fire_on_hosted_workflow(&self, instance_id: &str, machine: &str, trigger: &str) -> Result<(), WorkflowError> {
        self.inner
            .enqueue(WorkflowTrigger::fire(instance_id, machine, trigger))
            .await
    }

    pub async fn nap_workflow(&self, instance_id: &str) -> Result<(), WorkflowError> {
        self.inner.enqueue(WorkflowTrigger::nap(instance_id)).await
    }

    pub async fn end_workflow(&self, instance_id: &str) -> Result<(), WorkflowError> {
        self.inner.enqueue(WorkflowTrigger::end(instance_id)).await
    }

    /// Ids of the instances with a live agent on this host, sorted.
    pub fn hosted_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.agents().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_hosted(&self, instance_id: &str) -> bool {
        self.inner.agents().contains_key(instance_id)
    }

    /// Ids of the sleeping instances whose lease this host keeps.
    pub fn parked_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.parked().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn instance(&self, instance_id: &str) -> Result<Option<WorkflowInstanceInfo>, WorkflowError> {
        Ok(self.inner.instances.load(instance_id).await?)
    }

    /// One grooming pass.
    pub async fn groom_once(&self) -> GroomReport {
        self.inner.groom_once().await
    }
}

pub fn direct_queue_name(host_id: &str) -> String {
    format!("{host_id}.direct")
}

pub fn broadcast_queue_name(host_id: &str) -> String {
    format!("{host_id}.broadcast")
}

impl HostInner {
    fn agents(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<WorkflowAgent>>> {
        self.agents.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn parked(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.parked.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn direct_exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.direct.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn broadcast_exchange(&self) -> Option<Arc<dyn Exchange>> {
        self.broadcast.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn hosted(&self, instance_id: &str) -> Option<Arc<WorkflowAgent>> {
        self.agents().get(instance_id).cloned()
    }

    async fn attach(self: &Arc<Self>) -> Result<(), WorkflowError> {
        let options = &self.options;
        let bus = &self.services.bus;

        let direct = bus
            .declare_exchange(&options.direct_exchange, ExchangeType::Direct)
            .await?;
        let direct_queue = direct_queue_name(&options.host_id);
        direct
            .declare_queue(&direct_queue, &[options.host_id.as_str(), options.any_host_route.as_str()])
            .await?;

        let broadcast = bus
            .declare_exchange(&options.broadcast_exchange, ExchangeType::Fanout)
            .await?;
        let broadcast_queue = broadcast_queue_name(&options.host_id);
        broadcast.declare_queue(&broadcast_queue, &[]).await?;

        *self.direct.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&direct));
        *self.broadcast.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&broadcast));

        let poll = options.listener_poll_timeout.unwrap_or_else(|| bus.poll_timeout());
        let mut direct_listener = Listener::new(direct.open_inbox(&direct_queue).await?, poll);
        direct_listener.listen(self.direct_routes()).await;
        let mut broadcast_listener = Listener::new(broadcast.open_inbox(&broadcast_queue).await?, poll);
        broadcast_listener.listen(self.broadcast_routes()).await;

        self.listeners.lock().await.extend([direct_listener, broadcast_listener]);
        Ok(())
    }

    fn direct_routes(self: &Arc<Self>) -> TypeRoutes {
        let (wake, create, retry, job) = (Arc::clone(self), Arc::clone(self), Arc::clone(self), Arc::clone(self));
        TypeRoutes::new()
            .route::<WakeJob, _, _>(move |msg, _cancel, ack| {
                let host = Arc::clone(&wake);
                async move {
                    let result = host.wake_or_announce(&msg.instance_id).await;
                    host.settle(ack, WakeJob::TYPE_TAG, &msg.instance_id, result).await;
                }
            })
            .route::<CreateInstance, _, _>(move |msg, _cancel, ack| {
                let host = Arc::clone(&create);
                async move {
                    let result = host
                        .create_instance(&msg.instance_id, &msg.template_document, msg.initial_data.clone())
                        .await;
                    host.settle(ack, CreateInstance::TYPE_TAG, &msg.instance_id, result).await;
                }
            })
            .route::<RetryJob, _, _>(move |msg, _cancel, ack| {
                let host = Arc::clone(&retry);
                async move {
                    let trigger = WorkflowTrigger::fire(&msg.instance_id, &msg.machine, &msg.trigger);
                    let result = host.enqueue_and_claim(trigger).await;
                    host.settle(ack, RetryJob::TYPE_TAG, &msg.instance_id, result).await;
                }
            })
            .route::<TriggerJob, _, _>(move |msg, _cancel, ack| {
                let host = Arc::clone(&job);
                async move {
                    let trigger = WorkflowTrigger::new(&msg.instance_id, &msg.machine, &msg.trigger, msg.route);
                    let result = host.enqueue_and_claim(trigger).await;
                    host.settle(ack, TriggerJob::TYPE_TAG, &msg.instance_id, result).await;
                }
            })
    }

    fn broadcast_routes(self: &Arc<Self>) -> TypeRoutes {
        let host = Arc::clone(self);
        TypeRoutes::new().route::<TriggerNotice, _, _>(move |msg, _cancel, ack| {
            let host = Arc::clone(&host);
            async move {
                let result = host.claim(&msg.instance_id).await.map(|_| ());
                host.settle(ack, TriggerNotice::TYPE_TAG, &msg.instance_id, result).await;
            }
        })
    }

    async fn settle(&self, ack: Acknowledger, type_tag: &str, instance_id: &str, result: Result<(), WorkflowError>) {
        let settled = match result {
            Ok(()) => ack.acknowledged().await,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    target: "flowhost::host",
                    type_tag = %type_tag,
                    instance_id = %instance_id,
                    error = %e,
                    "message handling failed; will be redelivered"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(ABANDON_DELAY) => {}
                }
                ack.abandoned().await
            }
            Err(e) => {
                tracing::error!(
                    target: "flowhost::host",
                    type_tag = %type_tag,
                    instance_id = %instance_id,
                    error = %e,
                    "message rejected"
                );
                ack.rejected(e.to_string()).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(target: "flowhost::host", type_tag = %type_tag, error = %e, "settlement failed");
        }
    }

    pub(crate) async fn try_acquire(self: &Arc<Self>, instance_id: &str) -> Result<bool, WorkflowError> {
        if let Some(agent) = self.hosted(instance_id) {
            agent.bump();
            return Ok(true);
        }

        let parked = self.parked().remove(instance_id);
        let lease = match parked {
            Some(lease) => lease,
            None => match self.services.locks.try_acquire(&instance_lock_name(instance_id)).await? {
                Some(lease) => lease,
                None => {
                    tracing::debug!(
                        target: "flowhost::host",
                        host_id = %self.options.host_id,
                        instance_id = %instance_id,
                        "instance is held elsewhere"
                    );
                    return Ok(false);
                }
            },
        };

        // from here on every early return drops (releases) the lease
        let info = self
            .instances
            .load(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NoInstance(instance_id.to_string()))?;
        if info.status == InstanceStatus::Complete {
            return Ok(false);
        }

        let owner: Weak<dyn AgentOwner> = self.me.clone();
        let agent = WorkflowAgent::resume(&self.services, &self.options, info, lease, owner).await?;
        self.agents().insert(instance_id.to_string(), Arc::clone(&agent));
        agent.start();
        tracing::info!(
            target: "flowhost::host",
            host_id = %self.options.host_id,
            instance_id = %instance_id,
            "instance acquired"
        );
        Ok(true)
    }

    async fn create_instance(
        self: &Arc<Self>,
        instance_id: &str,
        template_document: &str,
        initial_data: Map<String, Value>,
    ) -> Result<(), WorkflowError> {
        let template = specify_using_template(template_document, &self.services.workers)?;
        WorkflowAgent::create_instance(&self.services, &self.options, instance_id, template, initial_data).await?;
        if !self.try_acquire(instance_id).await? {
            self.announce(instance_id).await?;
        }
        Ok(())
    }

    /// Persist a trigger, then bump the local agent or announce it to peers.
    async fn enqueue(&self, trigger: WorkflowTrigger) -> Result<(), WorkflowError> {
        let instance_id = trigger.instance_target.clone();
        self.triggers.store(&trigger).await?;
        tracing::debug!(
            target: "flowhost::host",
            instance_id = %instance_id,
            machine = %trigger.machine_context,
            trigger = %trigger.trigger_name,
            route = trigger.route.as_str(),
            "trigger stored"
        );
        match self.hosted(&instance_id) {
            Some(agent) => agent.bump(),
            None => self.announce(&instance_id).await?,
        }
        Ok(())
    }

    /// Persist a trigger delivered as a job, then try to run it here before
    /// asking peers.
    async fn enqueue_and_claim(self: &Arc<Self>, trigger: WorkflowTrigger) -> Result<(), WorkflowError> {
        let instance_id = trigger.instance_target.clone();
        self.triggers.store(&trigger).await?;
        if !self.claim(&instance_id).await? {
            self.announce(&instance_id).await?;
        }
        Ok(())
    }

    /// Bump a hosted agent or acquire the instance. Complete or unknown
    /// instances are left alone.
    async fn claim(self: &Arc<Self>, instance_id: &str) -> Result<bool, WorkflowError> {
        match self.try_acquire(instance_id).await {
            Err(WorkflowError::NoInstance(_)) => {
                tracing::debug!(target: "flowhost::host", instance_id = %instance_id, "trigger for unknown instance");
                Ok(false)
            }
            other => other,
        }
    }

    /// Acquire a parked or unowned instance that has triggers waiting.
    async fn claim_pending(self: &Arc<Self>, instance_id: &str) -> Result<bool, WorkflowError> {
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        if self.triggers.exists(&WorkflowTrigger::for_instance(instance_id)).await? {
            return self.claim(instance_id).await;
        }
        Ok(false)
    }

    /// Fire every activation trigger of a sleeping instance, then acquire it.
    pub(crate) async fn wake(self: &Arc<Self>, instance_id: &str) -> Result<bool, WorkflowError> {
        let Some(info) = self.instances.load(instance_id).await? else {
            return Ok(false);
        };
        if info.status == InstanceStatus::Complete {
            return Ok(false);
        }
        for machine in &info.template.state_machines {
            if let Some(trigger) = &machine.activation_trigger {
                self.triggers
                    .store(&WorkflowTrigger::fire(instance_id, &machine.name, trigger))
                    .await?;
            }
        }
        self.claim(instance_id).await
    }

    async fn wake_or_announce(self: &Arc<Self>, instance_id: &str) -> Result<(), WorkflowError> {
        if !self.wake(instance_id).await? {
            self.announce(instance_id).await?;
        }
        Ok(())
    }

    /// Tell every host that `instance_id` has pending triggers.
    async fn announce(&self, instance_id: &str) -> Result<(), WorkflowError> {
        let Some(exchange) = self.broadcast_exchange() else {
            tracing::debug!(
                target: "flowhost::host",
                instance_id = %instance_id,
                "host not started; trigger left for grooming"
            );
            return Ok(());
        };
        let notice = TriggerNotice {
            instance_id: instance_id.to_string(),
        };
        publish(exchange.as_ref(), &notice, "").await?;
        Ok(())
    }
}

impl AgentOwner for HostInner {
    fn agent_sleeping(&self, instance_id: &str, lease: Lease, wake_at: Option<DateTime<Utc>>) {
        self.agents().remove(instance_id);
        self.parked().insert(instance_id.to_string(), lease);
        tracing::debug!(
            target: "flowhost::host",
            host_id = %self.options.host_id,
            instance_id = %instance_id,
            wake_at = ?wake_at,
            "instance dehosted; lease parked"
        );

        // triggers stored while the agent was winding down have no one to bump
        if let Some(host) = self.me.upgrade() {
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = host.claim_pending(&instance_id).await {
                    tracing::warn!(target: "flowhost::host", instance_id = %instance_id, error = %e, "pending trigger check failed");
                }
            });
        }
    }

    fn agent_completed(&self, instance_id: &str) {
        self.agents().remove(instance_id);
        self.parked().remove(instance_id);
        tracing::debug!(
            target: "flowhost::host",
            host_id = %self.options.host_id,
            instance_id = %instance_id,
            "instance dehosted"
        );
    }
}
