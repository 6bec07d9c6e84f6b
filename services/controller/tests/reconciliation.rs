//! Reconciliation pass integration tests.
//!
//! Drive full passes against the in-memory hypervisor and check the calls
//! the controller issued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use runnerpool_controller::{
    hypervisor::{
        mock::{HypervisorCall, MockOperation},
        MockHypervisor, PowerAction, TaskWait,
    },
    lifecycle::{CloneSettings, LifecycleEngine},
    reconciler::{MemberFailurePolicy, PassReport, Reconciler, ReconcilerSettings},
    token::ProvisioningTokens,
};
use runnerpool_reconcile::{LifecyclePolicy, PropertyList, VmId, VmStatus};

const NOW: i64 = 1_760_000_000;

struct Harness {
    hypervisor: Arc<MockHypervisor>,
    reconciler: Reconciler,
}

impl Harness {
    fn new(
        min_vmid: VmId,
        max_vmid: VmId,
        minimum_runners: usize,
        policy: LifecyclePolicy,
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,runnerpool_controller=debug".into()),
            )
            .with_test_writer()
            .try_init();

        let hypervisor = Arc::new(MockHypervisor::new("n1"));
        hypervisor.add_template(
            9000,
            BTreeMap::from([("smbios1".to_string(), "uuid=0c2b3d4e".to_string())]),
        );
        hypervisor.set_now(NOW);

        let lifecycle = LifecycleEngine::new(
            hypervisor.clone(),
            ProvisioningTokens::new("integration".to_string().into(), Duration::from_secs(300)),
            CloneSettings {
                node: "n1".to_string(),
                pool: "ci".to_string(),
                template_vmid: 9000,
                full_clone: false,
                name_prefix: "gha-runner".to_string(),
            },
            "http://controller.test:8080",
            policy,
            TaskWait {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
            },
        );

        let reconciler = Reconciler::new(
            hypervisor.clone(),
            lifecycle,
            ReconcilerSettings {
                pool: "ci".to_string(),
                min_vmid,
                max_vmid,
                minimum_runners,
                member_failure_policy: MemberFailurePolicy::Isolate,
                interval: Duration::from_secs(5),
            },
        );

        Self {
            hypervisor,
            reconciler,
        }
    }

    async fn pass(&self) -> PassReport {
        self.reconciler.reconcile_once(NOW).await.unwrap()
    }
}

fn grace(secs: u64) -> LifecyclePolicy {
    LifecyclePolicy {
        max_age: Some(Duration::from_secs(1200)),
        stop_grace: Duration::from_secs(secs),
    }
}

#[tokio::test]
async fn test_stale_member_is_replaced_by_lowest_free_id() {
    let harness = Harness::new(100, 110, 1, grace(120));
    harness.hypervisor.add_vm(105, VmStatus::Stopped, Some(0));

    let report = harness.pass().await;

    assert_eq!(
        report,
        PassReport {
            members_seen: 1,
            deleted: 1,
            created: 1,
            ..PassReport::default()
        }
    );

    let calls = harness.hypervisor.calls();
    let delete = calls
        .iter()
        .position(|call| *call == HypervisorCall::Delete(105))
        .unwrap();
    let clone = calls
        .iter()
        .position(|call| matches!(call, HypervisorCall::Clone { newid: 100, .. }))
        .unwrap();
    assert!(delete < clone);
    assert_eq!(
        calls.last(),
        Some(&HypervisorCall::SetStatus(100, PowerAction::Start))
    );

    let vm = harness.hypervisor.vm(100).unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.config["name"], "gha-runner-100");

    let smbios = PropertyList::parse(&vm.config["smbios1"]);
    assert_eq!(smbios.get("uuid"), Some("0c2b3d4e"));
    assert_eq!(smbios.get("base64"), Some("1"));
    assert!(smbios.get("serial").is_some());

    assert_eq!(harness.hypervisor.pool_vmids(), vec![100]);
}

#[tokio::test]
async fn test_satisfied_fleet_issues_no_clones() {
    let harness = Harness::new(100, 110, 2, grace(120));
    harness.hypervisor.add_vm(100, VmStatus::Running, Some(NOW - 60));
    harness.hypervisor.add_vm(104, VmStatus::Running, Some(NOW - 60));

    let report = harness.pass().await;

    assert_eq!(report.members_seen, 2);
    assert_eq!(report.created, 0);
    assert!(!harness
        .hypervisor
        .calls()
        .iter()
        .any(|call| matches!(call, HypervisorCall::Clone { .. })));
}

#[tokio::test]
async fn test_fleet_converges_over_passes() {
    let harness = Harness::new(100, 110, 2, grace(30));
    harness.hypervisor.add_vm(100, VmStatus::Running, Some(NOW - 1300));
    harness.hypervisor.add_vm(101, VmStatus::Stopped, Some(NOW - 10));

    // 100 aged out and is deleted in the same pass; 101 is within its grace
    // period and still counts.
    let first = harness.pass().await;
    assert_eq!(first.stopped, 1);
    assert_eq!(first.deleted, 1);
    assert_eq!(first.created, 1);
    assert_eq!(harness.hypervisor.pool_vmids(), vec![100, 101]);

    harness.hypervisor.clear_calls();
    let second = harness.pass().await;
    assert_eq!(second.created, 0);
    assert_eq!(second.deleted, 0);
}

#[tokio::test]
async fn test_failed_clone_keeps_slot_reserved_for_the_pass() {
    let harness = Harness::new(100, 101, 2, grace(120));
    harness.hypervisor.fail_operation(MockOperation::Clone, 100);

    let report = harness.pass().await;

    assert_eq!(report.creation_failures, 1);
    assert_eq!(report.created, 1);
    assert!(!report.exhausted);
    assert_eq!(harness.hypervisor.pool_vmids(), vec![101]);
}

#[tokio::test]
async fn test_stalled_task_is_reported_as_member_failure() {
    let harness = Harness::new(100, 110, 1, grace(30));
    harness.hypervisor.add_vm(100, VmStatus::Stopped, Some(0));
    harness.hypervisor.stall_tasks(true);

    let report = tokio::time::timeout(Duration::from_secs(30), harness.pass())
        .await
        .unwrap();

    assert_eq!(report.member_failures, 1);
    assert_eq!(report.deleted, 0);
    // 100 still counts towards the fleet.
    assert_eq!(report.created, 0);
}
