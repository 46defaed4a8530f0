//! Background upkeep: startup reconciliation and periodic grooming.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::HostInner;
use crate::error::WorkflowError;
use crate::options::random_between;
use crate::records::{InstanceStatus, WorkflowInstanceInfo, WorkflowMachineState, WorkflowTrigger};
use crate::store::Repository;
use crate::sync::instance_lock_name;
use crate::workspace::WorkspaceStore;

/// Instances groomed concurrently.
const GROOM_CONCURRENCY: usize = 8;

/// What one grooming pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroomReport {
    pub woken: usize,
    pub purged: usize,
    pub failed: usize,
}

enum Outcome {
    Woken,
    Purged,
    Skipped,
    Failed,
}

impl HostInner {
    /// Pick up instances left `Active` by a host that went away.
    ///
    /// The first pass samples every third candidate from a random offset so
    /// hosts starting together spread the work; later passes take everything
    /// still unowned. Stops once a full pass acquires nothing.
    pub(super) async fn reconcile(self: Arc<Self>, cancel: CancellationToken) {
        let mut sampled = true;
        loop {
            let candidates = match self.reconcile_candidates().await {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!(target: "flowhost::host", error = %e, "reconciliation query failed");
                    return;
                }
            };
            if candidates.is_empty() {
                break;
            }

            let picked: Vec<WorkflowInstanceInfo> = if sampled {
                let offset = rand::thread_rng().gen_range(0..3);
                candidates.into_iter().skip(offset).step_by(3).collect()
            } else {
                candidates
            };

            let mut acquired = 0usize;
            for info in picked {
                let (min, max) = self.options.reconcile_delay;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(random_between(min, max)) => {}
                }
                let result = match info.status {
                    InstanceStatus::Sleeping => self.wake(&info.id).await,
                    _ => self.try_acquire(&info.id).await,
                };
                match result {
                    Ok(true) => acquired += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        target: "flowhost::host",
                        instance_id = %info.id,
                        error = %e,
                        "reconciliation acquire failed"
                    ),
                }
            }

            tracing::debug!(
                target: "flowhost::host",
                host_id = %self.options.host_id,
                sampled,
                acquired,
                "reconciliation pass"
            );
            if !sampled && acquired == 0 {
                break;
            }
            sampled = false;
        }
        tracing::info!(target: "flowhost::host", host_id = %self.options.host_id, "reconciliation finished");
    }

    /// Active instances not hosted here, plus sleeping ones whose activation
    /// time has passed.
    async fn reconcile_candidates(&self) -> Result<Vec<WorkflowInstanceInfo>, WorkflowError> {
        let page = self.options.trigger_page_size;
        let now = Utc::now();
        let mut candidates = self
            .instances
            .query_all(&WorkflowInstanceInfo::by_status(InstanceStatus::Active), page)
            .await?;
        let due = self
            .instances
            .query_all(&WorkflowInstanceInfo::by_status(InstanceStatus::Sleeping), page)
            .await?
            .into_iter()
            .filter(|info| info.next_activation_time.is_some_and(|at| at <= now));
        candidates.extend(due);
        candidates.retain(|info| self.hosted(&info.id).is_none());
        Ok(candidates)
    }

    /// Groom at random intervals until cancelled.
    pub(super) async fn protected_run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let (min, max) = self.options.groom_interval;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(random_between(min, max)) => {}
            }
            let report = self.groom_once().await;
            if report != GroomReport::default() {
                tracing::info!(
                    target: "flowhost::host",
                    host_id = %self.options.host_id,
                    woken = report.woken,
                    purged = report.purged,
                    failed = report.failed,
                    "grooming pass"
                );
            }
        }
    }

    /// Wake sleeping instances that have work, then purge completed ones.
    /// A failure on one instance never stops the pass.
    pub(super) async fn groom_once(self: &Arc<Self>) -> GroomReport {
        let mut report = GroomReport::default();
        let page = self.options.trigger_page_size;

        match self
            .instances
            .query_all(&WorkflowInstanceInfo::by_status(InstanceStatus::Sleeping), page)
            .await
        {
            Ok(sleeping) => {
                let outcomes: Vec<Outcome> = stream::iter(sleeping)
                    .map(|info| {
                        let host = Arc::clone(self);
                        async move { host.groom_sleeping(info).await }
                    })
                    .buffer_unordered(GROOM_CONCURRENCY)
                    .collect()
                    .await;
                tally(&mut report, outcomes);
            }
            Err(e) => {
                tracing::warn!(target: "flowhost::host", error = %e, "grooming query for sleeping instances failed");
                report.failed += 1;
            }
        }

        match self
            .instances
            .query_all(&WorkflowInstanceInfo::by_status(InstanceStatus::Complete), page)
            .await
        {
            Ok(complete) => {
                let outcomes: Vec<Outcome> = stream::iter(complete)
                    .map(|info| {
                        let host = Arc::clone(self);
                        async move { host.groom_complete(info).await }
                    })
                    .buffer_unordered(GROOM_CONCURRENCY)
                    .collect()
                    .await;
                tally(&mut report, outcomes);
            }
            Err(e) => {
                tracing::warn!(target: "flowhost::host", error = %e, "grooming query for complete instances failed");
                report.failed += 1;
            }
        }
        report
    }

    async fn groom_sleeping(self: &Arc<Self>, info: WorkflowInstanceInfo) -> Outcome {
        if self.hosted(&info.id).is_some() {
            return Outcome::Skipped;
        }
        let result = self.wake_if_pending(&info).await;
        match result {
            Ok(true) => Outcome::Woken,
            Ok(false) => Outcome::Skipped,
            Err(e) => {
                tracing::warn!(target: "flowhost::host", instance_id = %info.id, error = %e, "grooming wake failed");
                Outcome::Failed
            }
        }
    }

    async fn wake_if_pending(self: &Arc<Self>, info: &WorkflowInstanceInfo) -> Result<bool, WorkflowError> {
        if self.triggers.exists(&WorkflowTrigger::for_instance(&info.id)).await? {
            return self.try_acquire(&info.id).await;
        }
        match info.next_activation_time {
            Some(at) if at <= Utc::now() => self.wake(&info.id).await,
            _ => Ok(false),
        }
    }

    async fn groom_complete(&self, info: WorkflowInstanceInfo) -> Outcome {
        match self.purge(&info.id).await {
            Ok(true) => Outcome::Purged,
            Ok(false) => Outcome::Skipped,
            Err(e) => {
                tracing::warn!(target: "flowhost::host", instance_id = %info.id, error = %e, "purge failed");
                Outcome::Failed
            }
        }
    }

    /// Delete everything stored for a completed instance.
    async fn purge(&self, instance_id: &str) -> Result<bool, WorkflowError> {
        let Some(lease) = self.services.locks.try_acquire(&instance_lock_name(instance_id)).await? else {
            return Ok(false);
        };
        let store = Arc::clone(&self.services.store);

        WorkspaceStore::new(Arc::clone(&store)).open(instance_id).delete_workspace().await?;

        let states: Repository<WorkflowMachineState> = Repository::new(Arc::clone(&store));
        let state_ids: Vec<String> = states
            .query_all(&WorkflowMachineState::for_instance(instance_id), self.options.trigger_page_size)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        states.delete_batch(&state_ids).await?;

        let trigger_ids: Vec<String> = self
            .triggers
            .query_all(&WorkflowTrigger::for_instance(instance_id), self.options.trigger_page_size)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        self.triggers.delete_batch(&trigger_ids).await?;

        self.instances.delete(instance_id).await?;
        lease.release();
        tracing::debug!(target: "flowhost::host", instance_id = %instance_id, "instance purged");
        Ok(true)
    }
}

fn tally(report: &mut GroomReport, outcomes: Vec<Outcome>) {
    for outcome in outcomes {
        match outcome {
            Outcome::Woken => report.woken += 1,
            Outcome::Purged => report.purged += 1,
            Outcome::Skipped => {}
            Outcome::Failed => report.failed += 1,
        }
    }
}
