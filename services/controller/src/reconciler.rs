//! Fleet reconciliation loop.
//!
//! Each pass:
//! 1. Lists the pool and keeps the members on the target node inside the
//!    managed id range
//! 2. Applies every member's lifecycle transition, one at a time
//! 3. Creates runners for the remaining deficit, reserving ids in a
//!    pass-local snapshot so no two slots pick the same id
//!
//! Passes never overlap. Remote failures are logged and retried on the next
//! pass.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runnerpool_reconcile::{deficit, FleetSnapshot, ReconcileError, VmId};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::ControllerResult;
use crate::hypervisor::Hypervisor;
use crate::lifecycle::LifecycleEngine;

/// What to do when stopping or deleting a member fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemberFailurePolicy {
    /// Log it and move on to the next member. The member still counts
    /// towards the fleet.
    #[default]
    Isolate,

    /// Abandon the rest of the pass, creation included.
    AbortPass,
}

impl FromStr for MemberFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "abort-pass" => Ok(Self::AbortPass),
            other => Err(format!("expected `isolate` or `abort-pass`, got `{other}`")),
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Members on the target node inside the managed range.
    pub members_seen: usize,
    pub stopped: usize,
    pub deleted: usize,
    pub created: usize,
    pub creation_failures: usize,
    pub member_failures: usize,

    /// Creation stopped early because the id range is full.
    pub exhausted: bool,
}

impl PassReport {
    fn is_noop(&self) -> bool {
        self.stopped == 0
            && self.deleted == 0
            && self.created == 0
            && self.creation_failures == 0
            && self.member_failures == 0
            && !self.exhausted
    }
}

/// Fleet sizing and pass behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub pool: String,
    pub min_vmid: VmId,
    pub max_vmid: VmId,
    pub minimum_runners: usize,
    pub member_failure_policy: MemberFailurePolicy,
    pub interval: Duration,
}

/// Keeps the pool at its minimum size.
pub struct Reconciler {
    hypervisor: Arc<dyn Hypervisor>,
    lifecycle: LifecycleEngine,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        lifecycle: LifecycleEngine,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            hypervisor,
            lifecycle,
            settings,
        }
    }

    /// Run passes until shutdown is signaled, sleeping the configured
    /// interval after each one. The first pass starts immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            minimum_runners = self.settings.minimum_runners,
            "Starting reconciliation worker"
        );

        while !*shutdown.borrow() {
            self.run_pass().await;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation worker shutting down");
    }

    async fn run_pass(&self) {
        match self.reconcile_once(Utc::now().timestamp()).await {
            Ok(report) if report.is_noop() => {}
            Ok(report) => info!(
                members_seen = report.members_seen,
                stopped = report.stopped,
                deleted = report.deleted,
                created = report.created,
                creation_failures = report.creation_failures,
                member_failures = report.member_failures,
                exhausted = report.exhausted,
                "Reconciliation pass complete"
            ),
            Err(e) => error!(error = %e, "Reconciliation pass failed"),
        }
    }

    /// Run one pass as of `now` (epoch seconds).
    pub async fn reconcile_once(&self, now: i64) -> ControllerResult<PassReport> {
        let node = self.lifecycle.clone_settings().node.as_str();
        let mut snapshot = FleetSnapshot::new(self.settings.min_vmid, self.settings.max_vmid)?;

        let members: Vec<_> = self
            .hypervisor
            .list_pool_members(&self.settings.pool)
            .await?
            .into_iter()
            .filter(|member| member.node == node && snapshot.in_range(member.vmid))
            .collect();

        for member in &members {
            snapshot.occupy(member.vmid);
        }

        let mut report = PassReport {
            members_seen: members.len(),
            ..PassReport::default()
        };

        for member in &members {
            match self.lifecycle.evaluate_member(member, now).await {
                Ok(action) => {
                    if action.stops() {
                        report.stopped += 1;
                    }
                    if action.deletes() {
                        report.deleted += 1;
                        snapshot.release(member.vmid);
                    }
                }
                Err(e) => {
                    report.member_failures += 1;
                    error!(
                        node = %member.node,
                        vmid = member.vmid,
                        error = %e,
                        "Failed to apply lifecycle transition"
                    );
                    if self.settings.member_failure_policy == MemberFailurePolicy::AbortPass {
                        return Err(e.into());
                    }
                }
            }
        }

        let missing = deficit(self.settings.minimum_runners, members.len() - report.deleted);
        for _ in 0..missing {
            let vmid = match snapshot.reserve_next() {
                Ok(vmid) => vmid,
                Err(ReconcileError::Exhausted { min, max }) => {
                    warn!(min, max, "No free vmid left, skipping creation");
                    report.exhausted = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            match self.lifecycle.create_runner(vmid).await {
                Ok(_) => report.created += 1,
                Err(e) => {
                    report.creation_failures += 1;
                    error!(node = %node, vmid, error = %e, "Failed to create runner");
                }
            }
        }

        Ok(report)
    }
}
