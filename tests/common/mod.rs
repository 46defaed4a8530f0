// Helpers shared by the integration tests; not every test file uses all of them.
#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flowhost::messaging::{BusError, BusRegistry, MemoryBus, MessageBus};
use flowhost::scheduler::{JobRoute, JobScheduler, ScheduledJob};
use flowhost::store::memory::MemoryRecordStore;
use flowhost::store::RecordStore;
use flowhost::sync::{LockProvider, MemoryLockProvider};
use flowhost::{HostOptions, HostServices, Worker, WorkerError, WorkerRegistry, WorkflowHost};

/// `Start` → `Running` on `go`; `Running` records `run` on entry.
pub const TWO_STATE: &str = r#"{
    "name": "two-state",
    "version": "1.0.0",
    "plugins": [{ "routeId": "w", "plugin": "recorder" }],
    "stateMachines": [{
        "name": "main",
        "initialState": "Start",
        "states": [
            { "name": "Start", "transitions": [{ "trigger": "go", "next": "Running" }] },
            { "name": "Running", "entryActions": [{ "worker": "w", "route": "run" }] }
        ]
    }]
}"#;

/// `Sending` fails over to its retry state until `Broken`.
pub const RETRYING: &str = r#"{
    "name": "retrying",
    "version": "1.0.0",
    "plugins": [{ "routeId": "w", "plugin": "recorder" }],
    "stateMachines": [{
        "name": "main",
        "initialState": "Idle",
        "states": [
            { "name": "Idle", "transitions": [{ "trigger": "send", "next": "Sending" }] },
            {
                "name": "Sending",
                "entryActions": [{ "worker": "w", "route": "send", "exceptionTrigger": "sys.retry" }],
                "transitions": [{ "trigger": "sent", "next": "Done" }],
                "retry": {
                    "failState": "Broken",
                    "count": 3,
                    "minimumMinutes": 1,
                    "maximumMinutes": 10,
                    "deltaMinutes": 1
                }
            },
            { "name": "Done" },
            { "name": "Broken" }
        ]
    }]
}"#;

/// A machine with an activation trigger, for wake tests.
pub const WAKEFUL: &str = r#"{
    "name": "wakeful",
    "version": "1.0.0",
    "plugins": [{ "routeId": "w", "plugin": "recorder" }],
    "stateMachines": [{
        "name": "main",
        "initialState": "Dozing",
        "activationTrigger": "wake",
        "states": [
            {
                "name": "Dozing",
                "transitions": [{ "trigger": "wake", "next": "Dozing" }],
                "entryActions": [{ "worker": "w", "route": "doze" }]
            }
        ]
    }]
}"#;

/// Worker recording every `(instance, route)` it is asked to run.
#[derive(Default)]
pub struct RecordingWorker {
    calls: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingWorker {
    pub fn fail(&self, route: &str) {
        self.failing.lock().unwrap().insert(route.to_string());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, instance_id: &str, route: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, r)| i == instance_id && r == route)
            .count()
    }
}

#[async_trait::async_trait]
impl Worker for RecordingWorker {
    async fn invoke(&self, instance_id: &str, route: &str) -> Result<(), WorkerError> {
        self.calls
            .lock()
            .unwrap()
            .push((instance_id.to_string(), route.to_string()));
        if self.failing.lock().unwrap().contains(route) {
            return Err(WorkerError::failed(format!("{route} failed")));
        }
        Ok(())
    }

    fn supports_route(&self, _pattern: &str) -> bool {
        true
    }
}

/// Scheduler publishing every job immediately, ignoring its due time.
pub struct ImmediateScheduler {
    bus: Arc<dyn MessageBus>,
    pub scheduled: Mutex<Vec<(DateTime<Utc>, JobRoute)>>,
}

impl ImmediateScheduler {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            scheduled: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl JobScheduler for ImmediateScheduler {
    async fn schedule_job(
        &self,
        job: ScheduledJob,
        when: DateTime<Utc>,
        _recurrence: Option<Duration>,
        route: JobRoute,
    ) -> Result<String, BusError> {
        self.scheduled.lock().unwrap().push((when, route.clone()));
        if let Some(exchange) = self.bus.specify_exchange(&route.exchange).await? {
            exchange.send(job.envelope, &route.route_key).await?;
        }
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn cancel_job(&self, _job_id: &str) -> Result<(), BusError> {
        Ok(())
    }
}

/// Shared collaborators for any number of in-process hosts.
pub struct Cluster {
    pub registry: BusRegistry,
    pub locks: MemoryLockProvider,
    pub store: Arc<MemoryRecordStore>,
    pub worker: Arc<RecordingWorker>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            registry: BusRegistry::new(),
            locks: MemoryLockProvider::new(),
            store: Arc::new(MemoryRecordStore::new()),
            worker: Arc::new(RecordingWorker::default()),
        }
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::new(MemoryBus::new(self.registry.clone()))
    }

    pub fn services(&self) -> HostServices {
        let bus = self.bus();
        HostServices::new(
            self.store.clone() as Arc<dyn RecordStore>,
            Arc::new(self.locks.clone()) as Arc<dyn LockProvider>,
            Arc::clone(&bus),
            Arc::new(ImmediateScheduler::new(bus)),
            workers(&self.worker),
        )
    }

    pub fn host(&self, host_id: &str) -> WorkflowHost {
        WorkflowHost::new(self.services(), fast_options(host_id))
    }

    pub async fn started_host(&self, host_id: &str) -> WorkflowHost {
        let host = self.host(host_id);
        host.on_start().await.unwrap();
        host
    }
}

pub fn workers(worker: &Arc<RecordingWorker>) -> WorkerRegistry {
    WorkerRegistry::builder()
        .register("recorder", Arc::clone(worker) as Arc<dyn Worker>)
        .build()
}

/// Options with test-scale waits. Grooming is left to explicit `groom_once` calls.
pub fn fast_options(host_id: &str) -> HostOptions {
    HostOptions::default()
        .with_host_id(host_id)
        .with_bump_wait(Duration::from_millis(50))
        .with_listener_poll_timeout(Duration::from_millis(20))
        .with_reconcile_delay(Duration::from_millis(1), Duration::from_millis(5))
        .with_groom_interval(Duration::from_secs(3600), Duration::from_secs(7200))
        .with_new_instance_lock_timeout(Duration::from_secs(1))
}

/// Poll `check` until it returns `true` or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn data(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}
