//! Per-member lifecycle and runner creation.
//!
//! [`plan_member`] decides; this module carries the decision out against the
//! hypervisor, awaiting every task it issues except the final start of a new
//! runner.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use runnerpool_reconcile::{
    member_age, plan_member, LifecyclePolicy, MemberAction, PropertyList, VmId,
};
use tracing::{debug, info, instrument};

use crate::error::ControllerResult;
use crate::hypervisor::{
    wait_task, CloneOptions, Hypervisor, HypervisorError, PoolMember, PowerAction, TaskWait,
};
use crate::token::ProvisioningTokens;

/// Where and how new runners are cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSettings {
    pub node: String,
    pub pool: String,
    pub template_vmid: VmId,
    pub full_clone: bool,
    pub name_prefix: String,
}

impl CloneSettings {
    /// VM and runner name for `vmid`.
    pub fn runner_name(&self, vmid: VmId) -> String {
        format!("{}-{}", self.name_prefix, vmid)
    }
}

/// NoCloud datasource locator pointing at the provisioning endpoint, base64
/// encoded for the `smbios1` serial.
pub fn boot_serial(public_url: &str, token: &str) -> String {
    let locator = format!(
        "ds=nocloud;s={}/cloud-init/{}/",
        public_url.trim_end_matches('/'),
        token
    );
    BASE64.encode(locator)
}

/// Executes lifecycle transitions and creates runners.
pub struct LifecycleEngine {
    hypervisor: Arc<dyn Hypervisor>,
    tokens: ProvisioningTokens,
    clone: CloneSettings,
    public_url: String,
    policy: LifecyclePolicy,
    task_wait: TaskWait,
}

impl LifecycleEngine {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        tokens: ProvisioningTokens,
        clone: CloneSettings,
        public_url: impl Into<String>,
        policy: LifecyclePolicy,
        task_wait: TaskWait,
    ) -> Self {
        Self {
            hypervisor,
            tokens,
            clone,
            public_url: public_url.into(),
            policy,
            task_wait,
        }
    }

    pub fn clone_settings(&self) -> &CloneSettings {
        &self.clone
    }

    /// Read a member's age and apply its lifecycle transition.
    ///
    /// Returns the action that was carried out. A member is gone once the
    /// returned action [deletes](MemberAction::deletes).
    #[instrument(skip(self, member), fields(node = %member.node, vmid = member.vmid))]
    pub async fn evaluate_member(
        &self,
        member: &PoolMember,
        now: i64,
    ) -> Result<MemberAction, HypervisorError> {
        let config = self.hypervisor.vm_config(&member.node, member.vmid).await?;
        let age = member_age(now, config.creation_time());
        let action = plan_member(member.status, age, &self.policy);
        debug!(
            status = %member.status,
            age_secs = age.as_secs(),
            action = ?action,
            "Evaluated member"
        );

        if action.stops() {
            info!(age_secs = age.as_secs(), "Stopping aged-out runner");
            let upid = self
                .hypervisor
                .set_status(&member.node, member.vmid, PowerAction::Stop)
                .await?;
            wait_task(self.hypervisor.as_ref(), &member.node, &upid, &self.task_wait).await?;
        }

        if action.deletes() {
            info!(age_secs = age.as_secs(), "Deleting stopped runner");
            let upid = self.hypervisor.delete_vm(&member.node, member.vmid).await?;
            wait_task(self.hypervisor.as_ref(), &member.node, &upid, &self.task_wait).await?;
        }

        Ok(action)
    }

    /// Clone, point at the provisioning endpoint, and boot a runner as `vmid`.
    ///
    /// Nothing is rolled back on failure; a half-created VM is stopped and
    /// is reclaimed once its grace period elapses.
    #[instrument(skip(self), fields(node = %self.clone.node))]
    pub async fn create_runner(&self, vmid: VmId) -> ControllerResult<String> {
        let node = self.clone.node.as_str();
        let name = self.clone.runner_name(vmid);

        info!(name = %name, template = self.clone.template_vmid, "Cloning runner");
        let options = CloneOptions {
            name: name.clone(),
            pool: Some(self.clone.pool.clone()),
            full: self.clone.full_clone,
        };
        let upid = self
            .hypervisor
            .clone_vm(node, self.clone.template_vmid, vmid, &options)
            .await?;
        wait_task(self.hypervisor.as_ref(), node, &upid, &self.task_wait).await?;

        let token = self.tokens.mint(&name)?;
        let boot: PropertyList = [
            ("base64", "1".to_string()),
            ("serial", boot_serial(&self.public_url, &token)),
        ]
        .into_iter()
        .collect();
        let mut smbios = self
            .hypervisor
            .vm_config(node, vmid)
            .await?
            .property_list("smbios1");
        smbios.merge(&boot);

        let changes = BTreeMap::from([("smbios1".to_string(), smbios.to_string())]);
        self.hypervisor.update_vm_config(node, vmid, &changes).await?;

        let upid = self.hypervisor.set_status(node, vmid, PowerAction::Start).await?;
        info!(name = %name, upid = %upid, "Started runner");

        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use runnerpool_reconcile::VmStatus;

    use super::*;
    use crate::error::ControllerError;
    use crate::hypervisor::mock::{HypervisorCall, MockOperation};
    use crate::hypervisor::MockHypervisor;

    const NOW: i64 = 1_700_000_000;

    fn settings() -> CloneSettings {
        CloneSettings {
            node: "n1".to_string(),
            pool: "runners".to_string(),
            template_vmid: 9000,
            full_clone: false,
            name_prefix: "gha-runner".to_string(),
        }
    }

    fn engine(hypervisor: Arc<MockHypervisor>) -> LifecycleEngine {
        LifecycleEngine::new(
            hypervisor,
            ProvisioningTokens::new("s3cret".to_string().into(), Duration::from_secs(300)),
            settings(),
            "https://runners.example.com/",
            LifecyclePolicy {
                max_age: Some(Duration::from_secs(1200)),
                stop_grace: Duration::from_secs(30),
            },
            TaskWait::default(),
        )
    }

    fn member(vmid: VmId, status: VmStatus) -> PoolMember {
        PoolMember {
            vmid,
            node: "n1".to_string(),
            status,
        }
    }

    #[test]
    fn test_boot_serial() {
        let serial = boot_serial("https://runners.example.com/", "tok");
        let decoded = String::from_utf8(BASE64.decode(serial).unwrap()).unwrap();
        assert_eq!(decoded, "ds=nocloud;s=https://runners.example.com/cloud-init/tok/");
    }

    #[tokio::test]
    async fn test_young_running_member_is_kept() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_vm(100, VmStatus::Running, Some(NOW - 60));

        let action = engine(hypervisor.clone())
            .evaluate_member(&member(100, VmStatus::Running), NOW)
            .await
            .unwrap();

        assert_eq!(action, MemberAction::Keep);
        assert_eq!(hypervisor.calls(), vec![HypervisorCall::Config(100)]);
    }

    #[tokio::test]
    async fn test_aged_out_member_is_stopped_then_deleted() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_vm(100, VmStatus::Running, Some(NOW - 1200));

        let action = engine(hypervisor.clone())
            .evaluate_member(&member(100, VmStatus::Running), NOW)
            .await
            .unwrap();

        assert_eq!(action, MemberAction::StopAndDelete);
        assert_eq!(
            hypervisor.calls(),
            vec![
                HypervisorCall::Config(100),
                HypervisorCall::SetStatus(100, PowerAction::Stop),
                HypervisorCall::Delete(100),
            ]
        );
        assert!(hypervisor.vm(100).is_none());
    }

    #[tokio::test]
    async fn test_stopped_member_within_grace_is_kept() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_vm(100, VmStatus::Stopped, Some(NOW - 29));

        let action = engine(hypervisor.clone())
            .evaluate_member(&member(100, VmStatus::Stopped), NOW)
            .await
            .unwrap();

        assert_eq!(action, MemberAction::Keep);
        assert!(hypervisor.vm(100).is_some());
    }

    #[tokio::test]
    async fn test_member_without_ctime_is_reclaimed() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_vm(100, VmStatus::Stopped, None);

        let action = engine(hypervisor.clone())
            .evaluate_member(&member(100, VmStatus::Stopped), NOW)
            .await
            .unwrap();

        assert_eq!(action, MemberAction::Delete);
    }

    #[tokio::test]
    async fn test_stop_failure_skips_delete() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_vm(100, VmStatus::Running, Some(0));
        hypervisor.fail_operation(MockOperation::Stop, 100);

        let result = engine(hypervisor.clone())
            .evaluate_member(&member(100, VmStatus::Running), NOW)
            .await;

        assert!(result.is_err());
        assert!(!hypervisor.calls().contains(&HypervisorCall::Delete(100)));
    }

    #[tokio::test]
    async fn test_create_runner() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_template(
            9000,
            BTreeMap::from([("smbios1".to_string(), "uuid=5c1a,manufacturer=cHZl".to_string())]),
        );

        let name = engine(hypervisor.clone()).create_runner(100).await.unwrap();
        assert_eq!(name, "gha-runner-100");

        let vm = hypervisor.vm(100).unwrap();
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.config["name"], "gha-runner-100");

        let smbios = PropertyList::parse(&vm.config["smbios1"]);
        assert_eq!(smbios.get("uuid"), Some("5c1a"));
        assert_eq!(smbios.get("manufacturer"), Some("cHZl"));
        assert_eq!(smbios.get("base64"), Some("1"));

        let serial = BASE64.decode(smbios.get("serial").unwrap()).unwrap();
        let locator = String::from_utf8(serial).unwrap();
        let token = locator
            .strip_prefix("ds=nocloud;s=https://runners.example.com/cloud-init/")
            .and_then(|rest| rest.strip_suffix('/'))
            .unwrap();
        let tokens = ProvisioningTokens::new("s3cret".to_string().into(), Duration::from_secs(300));
        assert_eq!(tokens.verify(token).unwrap(), "gha-runner-100");

        let calls = hypervisor.calls();
        assert!(matches!(
            &calls[0],
            HypervisorCall::Clone { source: 9000, newid: 100, options }
                if options.pool.as_deref() == Some("runners") && !options.full
        ));
        assert_eq!(calls.last(), Some(&HypervisorCall::SetStatus(100, PowerAction::Start)));
    }

    #[tokio::test]
    async fn test_create_runner_replaces_inherited_serial() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_template(
            9000,
            BTreeMap::from([(
                "smbios1".to_string(),
                "uuid=5c1a,serial=c3RhbGU=,base64=0".to_string(),
            )]),
        );

        engine(hypervisor.clone()).create_runner(100).await.unwrap();

        let vm = hypervisor.vm(100).unwrap();
        let smbios = PropertyList::parse(&vm.config["smbios1"]);
        assert_eq!(smbios.len(), 3);
        assert_eq!(smbios.get("base64"), Some("1"));
        assert_ne!(smbios.get("serial"), Some("c3RhbGU="));
        assert!(vm.config["smbios1"].starts_with("uuid=5c1a,serial="));
    }

    #[tokio::test]
    async fn test_create_runner_clone_failure() {
        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_template(9000, BTreeMap::new());
        hypervisor.fail_operation(MockOperation::Clone, 100);

        let result = engine(hypervisor.clone()).create_runner(100).await;

        assert!(matches!(result, Err(ControllerError::Hypervisor(_))));
        assert!(hypervisor.vm(100).is_none());
    }
}
