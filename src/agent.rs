//! Workflow agent: the runtime of one hosted instance.
//!
//! An agent owns exactly one instance while it holds that instance's lease.
//! Its loop applies persisted [`WorkflowTrigger`]s in retrieval order, then
//! either waits for a bump, puts the instance to sleep (handing the lease back
//! to its owner) or completes it (releasing the lease).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::alerts::{AlertSink, RateLimitedAlerts, Severity};
use crate::context::{ActionContext, HostServices, WorkflowContext};
use crate::error::WorkflowError;
use crate::machine::{FireOutcome, StateMachine};
use crate::options::HostOptions;
use crate::records::{InstanceStatus, TriggerRoute, WorkflowInstanceInfo, WorkflowTrigger};
use crate::store::Repository;
use crate::sync::{instance_lock_name, Lease};
use crate::template::WorkflowTemplate;
use crate::workflow_error;

/// Pause after a failed loop iteration before the next attempt.
const ITERATION_BACKOFF: Duration = Duration::from_secs(1);

/// Receives an agent when its loop ends by sleep or completion.
pub trait AgentOwner: Send + Sync {
    /// The instance went to sleep; the lease is handed back for parking.
    fn agent_sleeping(&self, instance_id: &str, lease: Lease, wake_at: Option<DateTime<Utc>>);

    /// The instance completed; its lease has been released.
    fn agent_completed(&self, instance_id: &str);
}

enum Step {
    /// Triggers were applied; look again immediately.
    Continue,
    /// Nothing pending.
    Idle,
    /// The instance slept or completed.
    Exit,
}

pub struct WorkflowAgent {
    instance_id: String,
    ctx: WorkflowContext,
    machines: Vec<StateMachine>,
    instances: Repository<WorkflowInstanceInfo>,
    triggers: Repository<WorkflowTrigger>,
    lease: Mutex<Option<Lease>>,
    owner: Weak<dyn AgentOwner>,
    loop_alerts: RateLimitedAlerts,
    bump: Notify,
    cancel: CancellationToken,
    running: AtomicBool,
    last_activity: Mutex<Instant>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowAgent {
    /// Create a brand-new instance: check required inputs, write the initial
    /// workspace under the instance lock, persist it `Active`.
    ///
    /// The lock is released before returning; a host acquires the instance
    /// separately. Creating an id that already exists returns the stored
    /// instance unchanged.
    pub async fn create_instance(
        services: &HostServices,
        options: &Arc<HostOptions>,
        instance_id: &str,
        template: WorkflowTemplate,
        initial_data: Map<String, Value>,
    ) -> Result<WorkflowInstanceInfo, WorkflowError> {
        let missing = missing_inputs(&template, &initial_data);
        if !missing.is_empty() {
            return Err(WorkflowError::MissingInput(missing));
        }

        let lock = instance_lock_name(instance_id);
        let lease = services
            .locks
            .wait(&lock, options.new_instance_lock_timeout)
            .await?
            .ok_or_else(|| WorkflowError::LockTimeout {
                instance_id: instance_id.to_string(),
                waited: options.new_instance_lock_timeout,
            })?;

        let instances: Repository<WorkflowInstanceInfo> = Repository::new(Arc::clone(&services.store));
        if let Some(existing) = instances.load(instance_id).await? {
            tracing::info!(
                target: "flowhost::agent",
                instance_id = %instance_id,
                status = existing.status.as_str(),
                "instance already exists"
            );
            lease.release();
            return Ok(existing);
        }

        let template = Arc::new(template);
        let ctx = WorkflowContext::new(instance_id, Arc::clone(&template), services, Arc::clone(options));
        ctx.workspace()
            .batch(|data| {
                for (key, value) in initial_data {
                    data.put_value(&key, value);
                }
                Ok(())
            })
            .await?;

        let info = WorkflowInstanceInfo::new(instance_id, template.as_ref().clone());
        instances.store(&info).await?;
        lease.release();
        tracing::info!(
            target: "flowhost::agent",
            instance_id = %instance_id,
            template = %info.template_name,
            "instance created"
        );
        Ok(info)
    }

    /// Agent for an instance whose lease the caller holds. Fails with
    /// [`WorkflowError::PluginNotFound`] when a bound plugin is not registered.
    pub async fn resume(
        services: &HostServices,
        options: &Arc<HostOptions>,
        mut info: WorkflowInstanceInfo,
        lease: Lease,
        owner: Weak<dyn AgentOwner>,
    ) -> Result<Arc<Self>, WorkflowError> {
        for binding in &info.template.plugins {
            if !services.workers.has(&binding.plugin) {
                return Err(WorkflowError::PluginNotFound(binding.plugin.clone()));
            }
        }
        let machines = info
            .template
            .state_machines
            .iter()
            .map(StateMachine::from_template)
            .collect::<Result<Vec<_>, _>>()?;

        let instances: Repository<WorkflowInstanceInfo> = Repository::new(Arc::clone(&services.store));
        info.status = InstanceStatus::Active;
        info.next_activation_time = None;
        info.last_activity = Utc::now();
        instances.store(&info).await?;

        let template = Arc::new(info.template.clone());
        let ctx = WorkflowContext::new(info.id.clone(), template, services, Arc::clone(options));
        Ok(Arc::new(Self {
            instance_id: info.id.clone(),
            ctx,
            machines,
            instances,
            triggers: Repository::new(Arc::clone(&services.store)),
            lease: Mutex::new(Some(lease)),
            owner,
            loop_alerts: RateLimitedAlerts::new(Arc::clone(&services.alerts), options.alert_interval),
            bump: Notify::new(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            task: Mutex::new(None),
        }))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the loop. Calling it on a running agent does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move { agent.run_agent().await });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Wake the loop to look for new triggers.
    pub fn bump(&self) {
        self.bump.notify_one();
    }

    /// Stop the loop and release the lease. The instance stays as persisted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(target: "flowhost::agent", instance_id = %self.instance_id, "agent loop panicked");
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(lease) = self.take_lease() {
            lease.release();
        }
    }

    async fn run_agent(self: Arc<Self>) {
        tracing::debug!(target: "flowhost::agent", instance_id = %self.instance_id, "agent loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.iterate().await {
                Ok(Step::Continue) => {}
                Ok(Step::Exit) => break,
                Ok(Step::Idle) => {
                    if self.auto_sleep_due() {
                        match self.nap().await {
                            Ok(()) => break,
                            Err(e) => self.report_iteration_failure(&e),
                        }
                        continue;
                    }
                    let wait = self.idle_wait();
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.bump.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => {
                    self.report_iteration_failure(&e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(ITERATION_BACKOFF) => {}
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(target: "flowhost::agent", instance_id = %self.instance_id, "agent loop stopped");
    }

    /// One pass over the pending triggers.
    async fn iterate(&self) -> Result<Step, WorkflowError> {
        let filter = WorkflowTrigger::for_instance(&self.instance_id);
        let pending = self
            .triggers
            .query_all(&filter, self.ctx.options().trigger_page_size)
            .await?;
        if pending.is_empty() {
            return Ok(Step::Idle);
        }
        self.touch();

        let mut sleep_until: Option<DateTime<Utc>> = None;
        let mut ends = Vec::new();
        let mut naps = Vec::new();
        for trigger in pending {
            match trigger.route {
                TriggerRoute::Fire => {
                    match self.fire(&trigger.machine_context, &trigger.trigger_name).await {
                        Ok(until) => {
                            if let Some(t) = until {
                                sleep_until = Some(sleep_until.map_or(t, |s| s.max(t)));
                            }
                        }
                        Err(e) => {
                            let log = ActionContext::new(&self.instance_id, &trigger.machine_context);
                            workflow_error!(log, trigger = %trigger.trigger_name, error = %e, "trigger failed");
                        }
                    }
                    self.triggers.delete(&trigger.id).await?;
                }
                TriggerRoute::End => ends.push(trigger.id),
                TriggerRoute::Nap => naps.push(trigger.id),
            }
        }

        if !ends.is_empty() {
            self.complete_workflow().await?;
            return Ok(Step::Exit);
        }
        if !naps.is_empty() {
            self.triggers.delete_batch(&naps).await?;
            self.nap().await?;
            return Ok(Step::Exit);
        }
        if let Some(until) = sleep_until {
            // the scheduled retry is the wake-up
            self.sleep(Some(until), false).await?;
            return Ok(Step::Exit);
        }
        Ok(Step::Continue)
    }

    /// Fire `trigger` on `machine`, forwarding what it leaves unhandled to the
    /// fallthrough machine. Returns the wake time a retry asked for.
    pub async fn fire(&self, machine: &str, trigger: &str) -> Result<Option<DateTime<Utc>>, WorkflowError> {
        let target = self
            .machines
            .iter()
            .find(|m| m.name() == machine)
            .ok_or_else(|| WorkflowError::UnknownMachine {
                instance_id: self.instance_id.clone(),
                machine: machine.to_string(),
            })?;
        let FireOutcome {
            unhandled,
            sleep_until,
            ..
        } = target.fire(&self.ctx, trigger).await?;

        let mut wake = sleep_until;
        if unhandled.is_empty() {
            return Ok(wake);
        }
        let fallthrough = self
            .ctx
            .template()
            .fallthrough
            .as_deref()
            .filter(|f| *f != machine)
            .and_then(|f| self.machines.iter().find(|m| m.name() == f));
        let Some(fallthrough) = fallthrough else {
            let log = ActionContext::new(&self.instance_id, machine);
            for t in unhandled {
                workflow_error!(log, trigger = %t, "unhandled trigger dropped");
            }
            return Ok(wake);
        };
        for t in unhandled {
            let outcome = fallthrough.fire(&self.ctx, &t).await?;
            if let Some(until) = outcome.sleep_until {
                wake = Some(wake.map_or(until, |w| w.max(until)));
            }
            let log = ActionContext::new(&self.instance_id, fallthrough.name());
            for dropped in outcome.unhandled {
                workflow_error!(log, trigger = %dropped, "unhandled trigger dropped");
            }
        }
        Ok(wake)
    }

    /// Sleep as for a nap: wake after the nap delay when any machine has an
    /// activation trigger, otherwise only on an explicit trigger.
    async fn nap(&self) -> Result<(), WorkflowError> {
        let wake = if self.machines.iter().any(|m| m.activation_trigger().is_some()) {
            let delay = chrono::Duration::from_std(self.ctx.options().nap_wake_delay)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
            Some(Utc::now() + delay)
        } else {
            None
        };
        self.sleep(wake, true).await
    }

    /// Persist `Sleeping`, optionally schedule the wake job and hand the
    /// lease to the owner.
    pub async fn sleep(&self, until: Option<DateTime<Utc>>, schedule_wake: bool) -> Result<(), WorkflowError> {
        let mut info = self.load_info().await?;
        info.status = InstanceStatus::Sleeping;
        info.next_activation_time = until;
        info.last_activity = Utc::now();
        self.instances.store(&info).await?;

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(
            target: "flowhost::agent",
            instance_id = %self.instance_id,
            wake_at = ?until,
            "instance sleeping"
        );

        if let Some(lease) = self.take_lease() {
            match self.owner.upgrade() {
                Some(owner) => owner.agent_sleeping(&self.instance_id, lease, until),
                None => lease.release(),
            }
        }

        // the lease must be parked before the wake job can be delivered
        if let (true, Some(when)) = (schedule_wake, until) {
            if let Err(e) = self.ctx.schedule_wake(when).await {
                tracing::warn!(
                    target: "flowhost::agent",
                    instance_id = %self.instance_id,
                    error = %e,
                    "wake job not scheduled; grooming will wake the instance"
                );
            }
        }
        Ok(())
    }

    /// Persist `Complete`, drop every pending trigger, dehost and release the lease.
    pub async fn complete_workflow(&self) -> Result<(), WorkflowError> {
        let mut info = self.load_info().await?;
        info.status = InstanceStatus::Complete;
        info.next_activation_time = None;
        info.last_activity = Utc::now();
        self.instances.store(&info).await?;

        let filter = WorkflowTrigger::for_instance(&self.instance_id);
        let ids: Vec<String> = self
            .triggers
            .query_all(&filter, self.ctx.options().trigger_page_size)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        self.triggers.delete_batch(&ids).await?;

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(target: "flowhost::agent", instance_id = %self.instance_id, "instance complete");
        if let Some(owner) = self.owner.upgrade() {
            owner.agent_completed(&self.instance_id);
        }
        if let Some(lease) = self.take_lease() {
            lease.release();
        }
        Ok(())
    }

    async fn load_info(&self) -> Result<WorkflowInstanceInfo, WorkflowError> {
        self.instances
            .load(&self.instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NoInstance(self.instance_id.clone()))
    }

    fn take_lease(&self) -> Option<Lease> {
        self.lease.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }

    fn auto_sleep_after(&self) -> Option<Duration> {
        self.ctx.template().auto_sleep_seconds.map(Duration::from_secs)
    }

    fn auto_sleep_due(&self) -> bool {
        self.auto_sleep_after().is_some_and(|limit| self.idle_for() >= limit)
    }

    fn idle_wait(&self) -> Duration {
        let bump_wait = self.ctx.options().bump_wait;
        match self.auto_sleep_after() {
            Some(limit) => bump_wait.min(limit.saturating_sub(self.idle_for())).max(Duration::from_millis(10)),
            None => bump_wait,
        }
    }

    fn report_iteration_failure(&self, error: &WorkflowError) {
        tracing::error!(
            target: "flowhost::agent",
            instance_id = %self.instance_id,
            error = %error,
            retryable = error.is_retryable(),
            "agent iteration failed"
        );
        self.loop_alerts.alert(
            Severity::Error,
            &format!("workflow instance {} loop failed: {error}", self.instance_id),
        );
    }
}

/// Required inputs absent from `data`, by canonical key. Supplying a value
/// under a key alias counts.
fn missing_inputs(template: &WorkflowTemplate, data: &Map<String, Value>) -> Vec<String> {
    let supplied: HashSet<&str> = data
        .keys()
        .map(|k| {
            template
                .workspace
                .key_aliases
                .iter()
                .find(|a| a.alias == *k)
                .map(|a| a.key.as_str())
                .unwrap_or(k.as_str())
        })
        .collect();
    template
        .required_inputs()
        .filter(|k| !supplied.contains(k))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::testing::RecordingAlerts;
    use crate::context::testing::RecordingScheduler;
    use crate::messaging::{BusRegistry, MemoryBus};
    use crate::store::memory::MemoryRecordStore;
    use crate::store::Record;
    use crate::sync::{LockProvider, MemoryLockProvider};
    use crate::workers::WorkerRegistry;

    const TWO_STATE: &str = r#"{
        "name": "two-state",
        "version": "1.0.0",
        "plugins": [{ "routeId": "w", "plugin": "noop" }],
        "workspace": {
            "keyAliases": [{ "alias": "cid", "key": "customer.id" }],
            "inputs": [{ "key": "customer.id" }]
        },
        "stateMachines": [{
            "name": "main",
            "initialState": "Start",
            "states": [
                { "name": "Start", "transitions": [{ "trigger": "go", "next": "Running" }] },
                { "name": "Running", "entryActions": [{ "worker": "w", "route": "run" }] }
            ]
        }]
    }"#;

    #[derive(Default)]
    struct Owner {
        slept: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
        completed: Mutex<Vec<String>>,
        parked: Mutex<Vec<Lease>>,
    }

    impl AgentOwner for Owner {
        fn agent_sleeping(&self, instance_id: &str, lease: Lease, wake_at: Option<DateTime<Utc>>) {
            self.slept.lock().unwrap().push((instance_id.to_string(), wake_at));
            self.parked.lock().unwrap().push(lease);
        }

        fn agent_completed(&self, instance_id: &str) {
            self.completed.lock().unwrap().push(instance_id.to_string());
        }
    }

    struct Harness {
        services: HostServices,
        options: Arc<HostOptions>,
        locks: MemoryLockProvider,
        store: Arc<MemoryRecordStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let locks = MemoryLockProvider::new();
        let workers = WorkerRegistry::builder()
            .register_fn("noop", &["*"], |_, _| async { Ok(()) })
            .build();
        let services = HostServices::new(
            store.clone(),
            Arc::new(locks.clone()),
            Arc::new(MemoryBus::new(BusRegistry::new())),
            Arc::new(RecordingScheduler::default()),
            workers,
        )
        .with_alerts(Arc::new(RecordingAlerts::default()));
        let options = Arc::new(
            HostOptions::default()
                .with_bump_wait(Duration::from_millis(50))
                .with_new_instance_lock_timeout(Duration::from_millis(200)),
        );
        Harness {
            services,
            options,
            locks,
            store,
        }
    }

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::from_document(TWO_STATE).unwrap()
    }

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    async fn hosted(h: &Harness, id: &str, owner: &Arc<Owner>) -> Arc<WorkflowAgent> {
        let info = Repository::<WorkflowInstanceInfo>::new(h.store.clone())
            .load(id)
            .await
            .unwrap()
            .unwrap();
        let lease = h.locks.try_acquire(&instance_lock_name(id)).await.unwrap().unwrap();
        let weak: Weak<dyn AgentOwner> = Arc::downgrade(&(owner.clone() as Arc<dyn AgentOwner>));
        WorkflowAgent::resume(&h.services, &h.options, info, lease, weak).await.unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(f: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !f() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn create_requires_inputs_and_accepts_aliases() {
        let h = harness();
        let err = WorkflowAgent::create_instance(&h.services, &h.options, "i1", template(), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::MissingInput(ref keys) if keys == &vec!["customer.id".to_string()]));

        let info = WorkflowAgent::create_instance(
            &h.services,
            &h.options,
            "i1",
            template(),
            data(&[("cid", Value::from("c-1"))]),
        )
        .await
        .unwrap();
        assert_eq!(info.status, InstanceStatus::Active);
        assert!(!h.locks.is_held(&instance_lock_name("i1")));

        let again = WorkflowAgent::create_instance(
            &h.services,
            &h.options,
            "i1",
            template(),
            data(&[("customer.id", Value::from("other"))]),
        )
        .await
        .unwrap();
        assert_eq!(again.id, "i1");
    }

    #[tokio::test]
    async fn create_times_out_when_the_instance_is_locked() {
        let h = harness();
        let _held = h.locks.try_acquire(&instance_lock_name("i1")).await.unwrap().unwrap();
        let err = WorkflowAgent::create_instance(
            &h.services,
            &h.options,
            "i1",
            template(),
            data(&[("customer.id", Value::from(1))]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkflowError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn fire_trigger_moves_state_and_end_completes() {
        let h = harness();
        WorkflowAgent::create_instance(&h.services, &h.options, "i1", template(), data(&[("cid", Value::from(7))]))
            .await
            .unwrap();
        let owner = Arc::new(Owner::default());
        let agent = hosted(&h, "i1", &owner).await;
        agent.start();

        let triggers: Repository<WorkflowTrigger> = Repository::new(h.store.clone());
        triggers.store(&WorkflowTrigger::fire("i1", "main", "go")).await.unwrap();
        agent.bump();

        let ctx = agent.context().clone();
        let mut state = String::new();
        for _ in 0..300 {
            state = ctx.access_state("main").await.unwrap().state;
            if state == "Running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, "Running");

        triggers.store(&WorkflowTrigger::end("i1")).await.unwrap();
        agent.bump();
        wait_until(|| !owner.completed.lock().unwrap().is_empty()).await;

        let info = Repository::<WorkflowInstanceInfo>::new(h.store.clone())
            .load("i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.status, InstanceStatus::Complete);
        assert!(!h.locks.is_held(&instance_lock_name("i1")));
        assert_eq!(h.store.count(WorkflowTrigger::KIND).await, 0);
        agent.stop().await;
    }

    #[tokio::test]
    async fn nap_hands_the_lease_to_the_owner() {
        let h = harness();
        WorkflowAgent::create_instance(&h.services, &h.options, "i1", template(), data(&[("cid", Value::from(7))]))
            .await
            .unwrap();
        let owner = Arc::new(Owner::default());
        let agent = hosted(&h, "i1", &owner).await;
        agent.start();

        Repository::<WorkflowTrigger>::new(h.store.clone())
            .store(&WorkflowTrigger::nap("i1"))
            .await
            .unwrap();
        agent.bump();
        wait_until(|| !owner.slept.lock().unwrap().is_empty()).await;

        let slept = owner.slept.lock().unwrap().clone();
        assert_eq!(slept, vec![("i1".to_string(), None)]);
        assert!(h.locks.is_held(&instance_lock_name("i1")));
        let info = Repository::<WorkflowInstanceInfo>::new(h.store.clone())
            .load("i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.status, InstanceStatus::Sleeping);
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn missing_plugin_is_fatal_to_hosting() {
        let h = harness();
        let mut t = template();
        t.plugins[0].plugin = "absent".into();
        WorkflowAgent::create_instance(&h.services, &h.options, "i1", t, data(&[("cid", Value::from(7))]))
            .await
            .unwrap();
        let info = Repository::<WorkflowInstanceInfo>::new(h.store.clone())
            .load("i1")
            .await
            .unwrap()
            .unwrap();
        let lease = h.locks.try_acquire(&instance_lock_name("i1")).await.unwrap().unwrap();
        let owner: Arc<dyn AgentOwner> = Arc::new(Owner::default());
        let result = WorkflowAgent::resume(&h.services, &h.options, info, lease, Arc::downgrade(&owner)).await;
        assert!(matches!(result, Err(WorkflowError::PluginNotFound(p)) if p == "absent"));
        assert!(!h.locks.is_held(&instance_lock_name("i1")));
    }

    struct LevelRecorder {
        events: Arc<Mutex<Vec<(tracing::Level, String)>>>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelRecorder {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let meta = event.metadata();
            self.events.lock().unwrap().push((*meta.level(), meta.target().to_string()));
        }
    }

    #[tokio::test]
    async fn unhandled_trigger_without_fallthrough_is_logged_as_error() {
        use tracing_subscriber::prelude::*;

        let h = harness();
        WorkflowAgent::create_instance(&h.services, &h.options, "i1", template(), data(&[("cid", Value::from(7))]))
            .await
            .unwrap();
        let owner = Arc::new(Owner::default());
        let agent = hosted(&h, "i1", &owner).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(LevelRecorder {
            events: Arc::clone(&events),
        });
        let guard = tracing::dispatcher::set_default(&tracing::Dispatch::new(subscriber));
        agent.fire("main", "bogus").await.unwrap();
        drop(guard);

        let events = events.lock().unwrap().clone();
        assert!(events
            .iter()
            .any(|(level, target)| *level == tracing::Level::ERROR && target == "flowhost::workflow"));
        assert_eq!(agent.context().access_state("main").await.unwrap().state, "Start");
    }

    #[test]
    fn missing_inputs_respect_optional_keys() {
        let mut t = template();
        t.workspace.inputs.push(crate::template::WorkspaceInput {
            key: "note".into(),
            optional: true,
        });
        assert!(missing_inputs(&t, &data(&[("customer.id", Value::Null)])).is_empty());
        assert_eq!(missing_inputs(&t, &data(&[("note", Value::Null)])), vec!["customer.id"]);
    }
}
