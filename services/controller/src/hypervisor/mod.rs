//! Hypervisor interface.
//!
//! The controller only needs a handful of VM operations: list the pool,
//! read and patch a VM's config, clone, power on/off, delete, and follow the
//! asynchronous task each mutating call returns. [`ProxmoxClient`] talks to
//! the Proxmox VE API; [`MockHypervisor`] keeps everything in memory.

pub mod mock;
pub mod proxmox;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use runnerpool_reconcile::{PropertyList, VmId, VmStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use mock::MockHypervisor;
pub use proxmox::ProxmoxClient;

/// Errors from hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("task {upid} failed: {exit_status}")]
    TaskFailed { upid: Upid, exit_status: String },

    #[error("task {upid} did not finish within {timeout:?}")]
    DeadlineExceeded { upid: Upid, timeout: Duration },
}

/// Proxmox task identifier returned by every asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Upid(String);

impl Upid {
    pub fn new(upid: impl Into<String>) -> Self {
        Self(upid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Upid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One VM of the pool as listed by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    pub vmid: VmId,
    pub node: String,
    pub status: VmStatus,
}

/// Raw VM configuration (`GET /nodes/{node}/qemu/{vmid}/config`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct VmConfig(BTreeMap<String, serde_json::Value>);

impl VmConfig {
    /// String value of a config key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.as_str())
    }

    /// Parse a config key holding a property string. Missing keys yield an
    /// empty list.
    pub fn property_list(&self, key: &str) -> PropertyList {
        self.get(key).map(PropertyList::parse).unwrap_or_default()
    }

    /// Creation timestamp from the `meta` property (`ctime=<epoch secs>`).
    pub fn creation_time(&self) -> Option<i64> {
        self.property_list("meta").get_i64("ctime")
    }
}

impl<K, V> FromIterator<(K, V)> for VmConfig
where
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Power action for `POST /status/{action}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
        }
    }
}

impl std::fmt::Display for PowerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for cloning the template VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOptions {
    pub name: String,
    pub pool: Option<String>,
    pub full: bool,
}

/// State of an asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
}

/// Task status (`GET /nodes/{node}/tasks/{upid}/status`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    pub fn running() -> Self {
        Self {
            status: TaskState::Running,
            exitstatus: None,
        }
    }

    pub fn ok() -> Self {
        Self {
            status: TaskState::Stopped,
            exitstatus: Some("OK".to_string()),
        }
    }

    pub fn failed(exit_status: impl Into<String>) -> Self {
        Self {
            status: TaskState::Stopped,
            exitstatus: Some(exit_status.into()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == TaskState::Stopped
    }

    /// Whether a finished task succeeded. Proxmox reports `OK`, or
    /// `WARNINGS: n` for tasks that completed with warnings.
    pub fn succeeded(&self) -> bool {
        self.exitstatus
            .as_deref()
            .is_some_and(|exit| exit == "OK" || exit.starts_with("WARNINGS"))
    }
}

/// VM operations used by the controller.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// List the VMs of a resource pool.
    async fn list_pool_members(&self, pool: &str) -> Result<Vec<PoolMember>, HypervisorError>;

    /// Read a VM's configuration.
    async fn vm_config(&self, node: &str, vmid: VmId) -> Result<VmConfig, HypervisorError>;

    /// Set the given config keys, leaving all others untouched.
    async fn update_vm_config(
        &self,
        node: &str,
        vmid: VmId,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), HypervisorError>;

    /// Start or stop a VM.
    async fn set_status(
        &self,
        node: &str,
        vmid: VmId,
        action: PowerAction,
    ) -> Result<Upid, HypervisorError>;

    /// Clone `vmid` into `newid`.
    async fn clone_vm(
        &self,
        node: &str,
        vmid: VmId,
        newid: VmId,
        options: &CloneOptions,
    ) -> Result<Upid, HypervisorError>;

    /// Destroy a VM together with its disks.
    async fn delete_vm(&self, node: &str, vmid: VmId) -> Result<Upid, HypervisorError>;

    /// Current status of a task.
    async fn task_status(&self, node: &str, upid: &Upid) -> Result<TaskStatus, HypervisorError>;
}

/// Bounds for waiting on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWait {
    /// Give up after this long.
    pub timeout: Duration,

    /// Delay between two status polls.
    pub poll_interval: Duration,
}

impl Default for TaskWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Poll a task until it stops, failing with `DeadlineExceeded` once
/// `wait.timeout` has elapsed and with `TaskFailed` if it did not exit OK.
pub async fn wait_task<H>(
    hypervisor: &H,
    node: &str,
    upid: &Upid,
    wait: &TaskWait,
) -> Result<(), HypervisorError>
where
    H: Hypervisor + ?Sized,
{
    let poll = async {
        loop {
            let status = hypervisor.task_status(node, upid).await?;
            if status.is_finished() {
                return Ok::<_, HypervisorError>(status);
            }
            debug!(node = %node, upid = %upid, "Task still running");
            tokio::time::sleep(wait.poll_interval).await;
        }
    };

    let status = tokio::time::timeout(wait.timeout, poll)
        .await
        .map_err(|_| HypervisorError::DeadlineExceeded {
            upid: upid.clone(),
            timeout: wait.timeout,
        })??;

    if status.succeeded() {
        Ok(())
    } else {
        Err(HypervisorError::TaskFailed {
            upid: upid.clone(),
            exit_status: status.exitstatus.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}
