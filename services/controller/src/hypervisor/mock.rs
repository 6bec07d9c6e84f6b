//! In-memory hypervisor for testing and development.
//!
//! Operations take effect immediately and every task reports `OK` unless the
//! mock is told to stall or fail them. All calls are recorded so tests can
//! assert on the exact sequence the controller issued.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use runnerpool_reconcile::{VmId, VmStatus};
use tracing::debug;

use super::{
    CloneOptions, Hypervisor, HypervisorError, PoolMember, PowerAction, TaskStatus, Upid, VmConfig,
};

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Config,
    UpdateConfig,
    Start,
    Stop,
    Clone,
    Delete,
}

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    ListPool(String),
    Config(VmId),
    UpdateConfig(VmId, BTreeMap<String, String>),
    SetStatus(VmId, PowerAction),
    Clone {
        source: VmId,
        newid: VmId,
        options: CloneOptions,
    },
    Delete(VmId),
}

/// A VM held by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockVm {
    pub node: String,
    pub status: VmStatus,
    pub in_pool: bool,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MockState {
    vms: BTreeMap<VmId, MockVm>,
    calls: Vec<HypervisorCall>,
    failing: HashSet<(MockOperation, VmId)>,
    pool_unavailable: bool,
    stall_tasks: bool,
    task_failure: Option<String>,
    now: Option<i64>,
}

/// In-memory [`Hypervisor`].
pub struct MockHypervisor {
    node: String,
    task_counter: AtomicU64,
    state: Mutex<MockState>,
}

impl MockHypervisor {
    /// Create an empty mock whose helpers place VMs on `node`.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            task_counter: AtomicU64::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a pool member on the default node.
    pub fn add_vm(&self, vmid: VmId, status: VmStatus, ctime: Option<i64>) {
        let node = self.node.clone();
        self.add_vm_on(&node, vmid, status, ctime);
    }

    /// Add a pool member on an arbitrary node.
    pub fn add_vm_on(&self, node: &str, vmid: VmId, status: VmStatus, ctime: Option<i64>) {
        let mut config = BTreeMap::new();
        if let Some(ctime) = ctime {
            config.insert("meta".to_string(), format!("creation-qemu=8.1.2,ctime={ctime}"));
        }
        self.state().vms.insert(
            vmid,
            MockVm {
                node: node.to_string(),
                status,
                in_pool: true,
                config,
            },
        );
    }

    /// Add a VM outside the pool to clone from.
    pub fn add_template(&self, vmid: VmId, config: BTreeMap<String, String>) {
        self.state().vms.insert(
            vmid,
            MockVm {
                node: self.node.clone(),
                status: VmStatus::Stopped,
                in_pool: false,
                config,
            },
        );
    }

    /// Make `operation` on `vmid` fail with an API error.
    pub fn fail_operation(&self, operation: MockOperation, vmid: VmId) {
        self.state().failing.insert((operation, vmid));
    }

    /// Make pool listing fail.
    pub fn fail_pool_listing(&self, fail: bool) {
        self.state().pool_unavailable = fail;
    }

    /// Keep every task in the running state.
    pub fn stall_tasks(&self, stall: bool) {
        self.state().stall_tasks = stall;
    }

    /// Report every task as finished with the given exit status.
    pub fn fail_tasks_with(&self, exit_status: Option<&str>) {
        self.state().task_failure = exit_status.map(str::to_string);
    }

    /// Timestamp written into the `meta` of cloned VMs.
    pub fn set_now(&self, epoch_secs: i64) {
        self.state().now = Some(epoch_secs);
    }

    /// Copy of a VM.
    pub fn vm(&self, vmid: VmId) -> Option<MockVm> {
        self.state().vms.get(&vmid).cloned()
    }

    /// Ids of all pool members.
    pub fn pool_vmids(&self) -> Vec<VmId> {
        self.state()
            .vms
            .iter()
            .filter(|(_, vm)| vm.in_pool)
            .map(|(vmid, _)| *vmid)
            .collect()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.state().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn next_upid(&self, node: &str, kind: &str, vmid: VmId) -> Upid {
        let counter = self.task_counter.fetch_add(1, Ordering::SeqCst);
        Upid::new(format!("UPID:{node}:{counter:08X}:{kind}:{vmid}:mock@pve:"))
    }

    fn check(
        state: &MockState,
        operation: MockOperation,
        vmid: VmId,
    ) -> Result<(), HypervisorError> {
        if state.failing.contains(&(operation, vmid)) {
            return Err(HypervisorError::Api {
                status: 500,
                message: format!("injected {operation:?} failure for VM {vmid}"),
            });
        }
        Ok(())
    }

    fn vm_mut<'a>(
        state: &'a mut MockState,
        node: &str,
        vmid: VmId,
    ) -> Result<&'a mut MockVm, HypervisorError> {
        state
            .vms
            .get_mut(&vmid)
            .filter(|vm| vm.node == node)
            .ok_or_else(|| not_found(node, vmid))
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new("pve")
    }
}

fn not_found(node: &str, vmid: VmId) -> HypervisorError {
    HypervisorError::Api {
        status: 500,
        message: format!(
            "Configuration file 'nodes/{node}/qemu-server/{vmid}.conf' does not exist"
        ),
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list_pool_members(&self, pool: &str) -> Result<Vec<PoolMember>, HypervisorError> {
        let mut state = self.state();
        state.calls.push(HypervisorCall::ListPool(pool.to_string()));
        if state.pool_unavailable {
            return Err(HypervisorError::PoolNotFound(pool.to_string()));
        }

        Ok(state
            .vms
            .iter()
            .filter(|(_, vm)| vm.in_pool)
            .map(|(vmid, vm)| PoolMember {
                vmid: *vmid,
                node: vm.node.clone(),
                status: vm.status,
            })
            .collect())
    }

    async fn vm_config(&self, node: &str, vmid: VmId) -> Result<VmConfig, HypervisorError> {
        let mut state = self.state();
        state.calls.push(HypervisorCall::Config(vmid));
        Self::check(&state, MockOperation::Config, vmid)?;

        let vm = Self::vm_mut(&mut state, node, vmid)?;
        Ok(vm.config.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: VmId,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), HypervisorError> {
        let mut state = self.state();
        state
            .calls
            .push(HypervisorCall::UpdateConfig(vmid, changes.clone()));
        Self::check(&state, MockOperation::UpdateConfig, vmid)?;

        let vm = Self::vm_mut(&mut state, node, vmid)?;
        vm.config
            .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn set_status(
        &self,
        node: &str,
        vmid: VmId,
        action: PowerAction,
    ) -> Result<Upid, HypervisorError> {
        let mut state = self.state();
        state.calls.push(HypervisorCall::SetStatus(vmid, action));
        let operation = match action {
            PowerAction::Start => MockOperation::Start,
            PowerAction::Stop => MockOperation::Stop,
        };
        Self::check(&state, operation, vmid)?;

        let vm = Self::vm_mut(&mut state, node, vmid)?;
        vm.status = match action {
            PowerAction::Start => VmStatus::Running,
            PowerAction::Stop => VmStatus::Stopped,
        };
        debug!(node = %node, vmid, action = %action, "[MOCK] Power action");

        let kind = match action {
            PowerAction::Start => "qmstart",
            PowerAction::Stop => "qmstop",
        };
        Ok(self.next_upid(node, kind, vmid))
    }

    async fn clone_vm(
        &self,
        node: &str,
        vmid: VmId,
        newid: VmId,
        options: &CloneOptions,
    ) -> Result<Upid, HypervisorError> {
        let mut state = self.state();
        state.calls.push(HypervisorCall::Clone {
            source: vmid,
            newid,
            options: options.clone(),
        });
        Self::check(&state, MockOperation::Clone, newid)?;

        if state.vms.contains_key(&newid) {
            return Err(HypervisorError::Api {
                status: 500,
                message: format!("unable to create VM {newid}: config file already exists"),
            });
        }

        let now = state.now.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let source = Self::vm_mut(&mut state, node, vmid)?;
        let mut config = source.config.clone();
        config.insert("name".to_string(), options.name.clone());
        config.insert("meta".to_string(), format!("creation-qemu=8.1.2,ctime={now}"));

        state.vms.insert(
            newid,
            MockVm {
                node: node.to_string(),
                status: VmStatus::Stopped,
                in_pool: options.pool.is_some(),
                config,
            },
        );
        debug!(node = %node, vmid, newid, "[MOCK] Cloned VM");

        Ok(self.next_upid(node, "qmclone", vmid))
    }

    async fn delete_vm(&self, node: &str, vmid: VmId) -> Result<Upid, HypervisorError> {
        let mut state = self.state();
        state.calls.push(HypervisorCall::Delete(vmid));
        Self::check(&state, MockOperation::Delete, vmid)?;

        Self::vm_mut(&mut state, node, vmid)?;
        state.vms.remove(&vmid);
        debug!(node = %node, vmid, "[MOCK] Deleted VM");

        Ok(self.next_upid(node, "qmdestroy", vmid))
    }

    async fn task_status(&self, _node: &str, _upid: &Upid) -> Result<TaskStatus, HypervisorError> {
        let state = self.state();
        if state.stall_tasks {
            return Ok(TaskStatus::running());
        }
        Ok(match &state.task_failure {
            Some(exit_status) => TaskStatus::failed(exit_status.clone()),
            None => TaskStatus::ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clone_options(name: &str) -> CloneOptions {
        CloneOptions {
            name: name.to_string(),
            pool: Some("runners".to_string()),
            full: false,
        }
    }

    #[tokio::test]
    async fn test_clone_copies_template_config() {
        let mock = MockHypervisor::new("n1");
        mock.add_template(
            9000,
            BTreeMap::from([("smbios1".to_string(), "uuid=abc".to_string())]),
        );
        mock.set_now(1_700_000_000);

        mock.clone_vm("n1", 9000, 100, &clone_options("gha-runner-100"))
            .await
            .unwrap();

        let vm = mock.vm(100).unwrap();
        assert!(vm.in_pool);
        assert_eq!(vm.status, VmStatus::Stopped);
        assert_eq!(vm.config["smbios1"], "uuid=abc");
        assert_eq!(vm.config["name"], "gha-runner-100");
        assert_eq!(mock.pool_vmids(), vec![100]);

        let config = mock.vm_config("n1", 100).await.unwrap();
        assert_eq!(config.creation_time(), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_clone_rejects_existing_id() {
        let mock = MockHypervisor::new("n1");
        mock.add_template(9000, BTreeMap::new());
        mock.add_vm(100, VmStatus::Running, Some(0));

        let result = mock.clone_vm("n1", 9000, 100, &clone_options("x")).await;
        assert!(matches!(result, Err(HypervisorError::Api { .. })));
    }

    #[tokio::test]
    async fn test_wrong_node_is_not_found() {
        let mock = MockHypervisor::new("n1");
        mock.add_vm_on("n2", 100, VmStatus::Running, Some(0));

        assert!(mock.vm_config("n1", 100).await.is_err());
        assert!(mock.vm_config("n2", 100).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_and_calls() {
        let mock = MockHypervisor::new("n1");
        mock.add_vm(100, VmStatus::Running, Some(0));
        mock.fail_operation(MockOperation::Stop, 100);

        assert!(mock.set_status("n1", 100, PowerAction::Stop).await.is_err());
        assert_eq!(mock.vm(100).unwrap().status, VmStatus::Running);
        assert_eq!(
            mock.calls(),
            vec![HypervisorCall::SetStatus(100, PowerAction::Stop)]
        );
    }
}
