//! Reconciliation primitives for the runner pool.
//!
//! This library holds the deterministic half of the controller: everything
//! that can be decided without talking to a remote backend. Key concepts:
//!
//! - **Snapshot**: the set of VM ids currently occupied inside the managed
//!   range, rebuilt from the hypervisor on every pass.
//! - **Allocation**: picking the lowest free id, reserving it in the
//!   snapshot so later slots of the same pass cannot pick it again.
//! - **Member planning**: deciding whether a fleet member should be left
//!   alone, stopped, deleted, or both, given its age.
//!
//! # Invariants
//!
//! - Allocated ids are always inside `[min, max]`
//! - An id is never handed out twice while it is occupied in the snapshot
//! - Decisions are deterministic given the same inputs

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub mod property;

pub use property::PropertyList;

/// Proxmox VM identifier.
pub type VmId = u32;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Every id of the managed range is occupied.
    #[error("no free vmid in range {min}..={max}")]
    Exhausted { min: VmId, max: VmId },

    /// The configured range is empty.
    #[error("invalid vmid range: min {min} is greater than max {max}")]
    InvalidRange { min: VmId, max: VmId },
}

/// Power status of a fleet member as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    /// Any other state (paused, prelaunch, ...). Counted but never acted on.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmStatus::Running => write!(f, "running"),
            VmStatus::Stopped => write!(f, "stopped"),
            VmStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Occupied ids of the managed range for a single reconciliation pass.
///
/// Placeholders for VMs being created in the current pass live in the same
/// set as observed members; reserving goes through [`FleetSnapshot::reserve_next`]
/// so allocation and reservation cannot be separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSnapshot {
    min: VmId,
    max: VmId,
    occupied: BTreeSet<VmId>,
}

impl FleetSnapshot {
    /// Create an empty snapshot for `[min, max]`.
    pub fn new(min: VmId, max: VmId) -> Result<Self, ReconcileError> {
        if min > max {
            return Err(ReconcileError::InvalidRange { min, max });
        }

        Ok(Self {
            min,
            max,
            occupied: BTreeSet::new(),
        })
    }

    /// Whether `id` lies inside the managed range.
    pub fn in_range(&self, id: VmId) -> bool {
        (self.min..=self.max).contains(&id)
    }

    /// Mark an observed id as occupied. Ids outside the range are ignored.
    ///
    /// Returns true if the id was newly inserted.
    pub fn occupy(&mut self, id: VmId) -> bool {
        self.in_range(id) && self.occupied.insert(id)
    }

    /// Free an id after its VM has been deleted.
    pub fn release(&mut self, id: VmId) -> bool {
        self.occupied.remove(&id)
    }

    /// Whether `id` is currently occupied.
    pub fn is_occupied(&self, id: VmId) -> bool {
        self.occupied.contains(&id)
    }

    /// Number of occupied ids, placeholders included.
    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    /// Lowest free id without reserving it.
    pub fn next_free(&self) -> Option<VmId> {
        allocate_vmid(&self.occupied, self.min, self.max)
    }

    /// Allocate the lowest free id and reserve it as a placeholder.
    pub fn reserve_next(&mut self) -> Result<VmId, ReconcileError> {
        let id = self.next_free().ok_or(ReconcileError::Exhausted {
            min: self.min,
            max: self.max,
        })?;
        self.occupied.insert(id);
        Ok(id)
    }
}

/// Return the smallest id in `[min, max]` that is not in `occupied`.
///
/// Scans ascending; the first gap wins.
pub fn allocate_vmid(occupied: &BTreeSet<VmId>, min: VmId, max: VmId) -> Option<VmId> {
    if min > max {
        return None;
    }

    let mut candidate = min;
    for &id in occupied.range(min..=max) {
        if id != candidate {
            return Some(candidate);
        }
        // `id == max` means the range is full.
        candidate = id.checked_add(1)?;
    }

    (candidate <= max).then_some(candidate)
}

/// Age thresholds applied to every fleet member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Running members at least this old are stopped. `None` disables age-out.
    pub max_age: Option<Duration>,

    /// Stopped members at least this old are deleted.
    pub stop_grace: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            max_age: Some(DEFAULT_MAX_AGE),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Action to take for one member in the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    /// Leave the member untouched.
    Keep,

    /// Stop it; it stays around until the grace period elapses.
    Stop,

    /// Delete an already stopped member.
    Delete,

    /// Stop, then delete within the same pass.
    StopAndDelete,
}

impl MemberAction {
    pub fn stops(&self) -> bool {
        matches!(self, Self::Stop | Self::StopAndDelete)
    }

    pub fn deletes(&self) -> bool {
        matches!(self, Self::Delete | Self::StopAndDelete)
    }
}

/// Compute a member's age from its creation timestamp.
///
/// A missing timestamp counts as the epoch so malformed members get
/// reclaimed rather than leaked. Timestamps in the future yield zero.
pub fn member_age(now_epoch_secs: i64, ctime_epoch_secs: Option<i64>) -> Duration {
    let created = ctime_epoch_secs.unwrap_or(0);
    let secs = now_epoch_secs.saturating_sub(created).max(0);
    Duration::from_secs(secs.unsigned_abs())
}

/// Decide what to do with a member of the given status and age.
pub fn plan_member(status: VmStatus, age: Duration, policy: &LifecyclePolicy) -> MemberAction {
    let aged_out = status == VmStatus::Running
        && policy
            .max_age
            .is_some_and(|max_age| !max_age.is_zero() && age >= max_age);

    let stopped = status == VmStatus::Stopped || aged_out;
    let reclaim = stopped && age >= policy.stop_grace;

    match (aged_out, reclaim) {
        (true, true) => MemberAction::StopAndDelete,
        (true, false) => MemberAction::Stop,
        (false, true) => MemberAction::Delete,
        (false, false) => MemberAction::Keep,
    }
}

/// Number of members to create so that `current` reaches `desired`.
pub fn deficit(desired: usize, current: usize) -> usize {
    desired.saturating_sub(current)
}

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Default age after which running members are stopped.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(20 * 60);

/// Default delay before a stopped member is deleted.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);
