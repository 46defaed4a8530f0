//! Deferred delivery of bus messages.
//!
//! The host uses the scheduler for retry and wake jobs: a job is an envelope
//! published onto a named exchange with a route key at (or after) its due
//! time. [`TimerJobScheduler`] keeps jobs in process memory; sleeping
//! instances whose wake job was lost with a process are recovered by the
//! host's grooming pass from their persisted activation time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::messaging::{BusError, BusMessage, Envelope, MessageBus};

/// Payload of a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub envelope: Envelope,
}

impl ScheduledJob {
    pub fn new<M: BusMessage>(message: &M) -> Result<Self, BusError> {
        Ok(Self {
            envelope: Envelope::wrap(message)?,
        })
    }
}

/// Where a due job is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRoute {
    pub exchange: String,
    pub route_key: String,
}

impl JobRoute {
    pub fn new(exchange: impl Into<String>, route_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            route_key: route_key.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait JobScheduler: Send + Sync {
    /// Publish `job` on `route` at `when`, then every `recurrence` if given.
    /// Returns the job id.
    async fn schedule_job(
        &self,
        job: ScheduledJob,
        when: DateTime<Utc>,
        recurrence: Option<Duration>,
        route: JobRoute,
    ) -> Result<String, BusError>;

    /// Forget a pending job. Unknown ids are ignored.
    async fn cancel_job(&self, job_id: &str) -> Result<(), BusError>;
}

enum Command {
    Schedule(PendingJob),
    Cancel(String),
}

struct PendingJob {
    id: String,
    job: ScheduledJob,
    fire_at_ms: i64,
    recurrence: Option<Duration>,
    route: JobRoute,
}

/// In-process scheduler: one background task with a min-heap of due times.
pub struct TimerJobScheduler {
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TimerJobScheduler {
    pub fn start(bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut service = TimerService {
            bus,
            rx,
            jobs: HashMap::new(),
            min_heap: BinaryHeap::new(),
            seq: 0,
        };
        let token = cancel.clone();
        let task = tokio::spawn(async move { service.run(token).await });
        Arc::new(Self {
            tx,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    /// Stop the background task. Pending jobs are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), BusError> {
        self.tx.send(command).map_err(|_| {
            BusError::io(
                "job scheduler",
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "scheduler stopped"),
            )
        })
    }
}

impl Drop for TimerJobScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl JobScheduler for TimerJobScheduler {
    async fn schedule_job(
        &self,
        job: ScheduledJob,
        when: DateTime<Utc>,
        recurrence: Option<Duration>,
        route: JobRoute,
    ) -> Result<String, BusError> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            target: "flowhost::scheduler",
            job_id = %id,
            type_tag = %job.envelope.type_tag,
            due = %when,
            exchange = %route.exchange,
            route_key = %route.route_key,
            "job scheduled"
        );
        self.send(Command::Schedule(PendingJob {
            id: id.clone(),
            job,
            fire_at_ms: when.timestamp_millis(),
            recurrence,
            route,
        }))?;
        Ok(id)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), BusError> {
        self.send(Command::Cancel(job_id.to_string()))
    }
}

struct TimerService {
    bus: Arc<dyn MessageBus>,
    rx: mpsc::UnboundedReceiver<Command>,
    jobs: HashMap<String, PendingJob>,
    // (fire_at_ms, seq, job id); seq keeps equal due times in schedule order
    min_heap: BinaryHeap<Reverse<(i64, u64, String)>>,
    seq: u64,
}

impl TimerService {
    async fn run(&mut self, cancel: CancellationToken) {
        loop {
            while let Ok(command) = self.rx.try_recv() {
                self.apply(command);
            }

            let now = Utc::now().timestamp_millis();
            let mut due = Vec::new();
            while let Some(Reverse((ts, _, _))) = self.min_heap.peek() {
                if *ts > now {
                    break;
                }
                if let Some(Reverse((_, _, id))) = self.min_heap.pop() {
                    if let Some(job) = self.jobs.remove(&id) {
                        due.push(job);
                    }
                }
            }
            for job in due {
                self.fire(job).await;
            }

            let wait = self
                .min_heap
                .peek()
                .map(|Reverse((ts, _, _))| Duration::from_millis(ts.saturating_sub(Utc::now().timestamp_millis()).max(1) as u64));
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = self.rx.recv() => match maybe {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = sleep_or_forever(wait) => {}
            }
        }
        tracing::debug!(target: "flowhost::scheduler", pending = self.jobs.len(), "job scheduler stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Schedule(job) => self.insert(job),
            Command::Cancel(id) => {
                // heap entry is skipped when it surfaces
                self.jobs.remove(&id);
            }
        }
    }

    fn insert(&mut self, job: PendingJob) {
        self.seq += 1;
        self.min_heap.push(Reverse((job.fire_at_ms, self.seq, job.id.clone())));
        self.jobs.insert(job.id.clone(), job);
    }

    async fn fire(&mut self, mut job: PendingJob) {
        if let Err(e) = self.publish(&job).await {
            tracing::warn!(
                target: "flowhost::scheduler",
                job_id = %job.id,
                exchange = %job.route.exchange,
                error = %e,
                "scheduled job could not be published"
            );
        }
        if let Some(every) = job.recurrence {
            job.fire_at_ms += every.as_millis().max(1) as i64;
            self.insert(job);
        }
    }

    async fn publish(&self, job: &PendingJob) -> Result<(), BusError> {
        let exchange = self
            .bus
            .specify_exchange(&job.route.exchange)
            .await?
            .ok_or_else(|| BusError::ExchangeNotFound(job.route.exchange.clone()))?;
        let receivers = exchange.send(job.job.envelope.fork(), &job.route.route_key).await?;
        tracing::debug!(
            target: "flowhost::scheduler",
            job_id = %job.id,
            receivers = receivers.len(),
            "scheduled job published"
        );
        Ok(())
    }
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{BusRegistry, ExchangeType, MemoryBus};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl BusMessage for Tick {
        const TYPE_TAG: &'static str = "test.tick";
    }

    async fn drain_ticks(inbox: &Arc<dyn crate::messaging::Inbox>, want: usize) -> Vec<u32> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while seen.len() < want && tokio::time::Instant::now() < deadline {
            for d in inbox.wait_for_messages(Duration::from_millis(50)).await.unwrap() {
                seen.push(d.envelope.open::<Tick>().unwrap().n);
                d.ack.acknowledged().await.unwrap();
            }
        }
        seen
    }

    #[tokio::test]
    async fn fires_due_jobs_in_order() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new(BusRegistry::new()));
        let ex = bus.declare_exchange("jobs", ExchangeType::Direct).await.unwrap();
        ex.declare_queue("q", &["host-1"]).await.unwrap();
        let inbox = ex.open_inbox("q").await.unwrap();

        let scheduler = TimerJobScheduler::start(Arc::clone(&bus));
        let now = Utc::now();
        let route = JobRoute::new("jobs", "host-1");
        for (n, offset_ms) in [(1, 0), (2, 60), (3, 30)] {
            scheduler
                .schedule_job(
                    ScheduledJob::new(&Tick { n }).unwrap(),
                    now + chrono::Duration::milliseconds(offset_ms),
                    None,
                    route.clone(),
                )
                .await
                .unwrap();
        }

        assert_eq!(drain_ticks(&inbox, 3).await, vec![1, 3, 2]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_job_never_fires_and_recurring_repeats() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new(BusRegistry::new()));
        let ex = bus.declare_exchange("jobs", ExchangeType::Fanout).await.unwrap();
        ex.declare_queue("q", &[]).await.unwrap();
        let inbox = ex.open_inbox("q").await.unwrap();
        let scheduler = TimerJobScheduler::start(Arc::clone(&bus));

        let later = Utc::now() + chrono::Duration::milliseconds(100);
        let id = scheduler
            .schedule_job(ScheduledJob::new(&Tick { n: 9 }).unwrap(), later, None, JobRoute::new("jobs", ""))
            .await
            .unwrap();
        scheduler.cancel_job(&id).await.unwrap();

        scheduler
            .schedule_job(
                ScheduledJob::new(&Tick { n: 5 }).unwrap(),
                Utc::now(),
                Some(Duration::from_millis(40)),
                JobRoute::new("jobs", ""),
            )
            .await
            .unwrap();

        let ticks = drain_ticks(&inbox, 3).await;
        assert_eq!(ticks, vec![5, 5, 5]);
        scheduler.shutdown().await;
    }
}
