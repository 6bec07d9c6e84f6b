//! Runner registration with conflict recovery.
//!
//! A VM that reboots, or whose first boot was retried, asks for a
//! registration under a name GitHub may still hold. Issuance then fails with
//! a conflict. If exactly one registration carries that name it is stale:
//! delete it and issue once more. Anything else is left for a human.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::registry::{JitConfig, RegistryError, RunnerRegistry};

/// Errors from [`register_runner`].
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A conflict was reported but the name does not resolve to a single
    /// registration, so nothing was deleted.
    #[error("cannot recover conflict for {name}: {found} registrations match")]
    ConflictRecoveryAmbiguous { name: String, found: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Issue a JIT config for `name`, reclaiming a single stale registration on
/// conflict.
pub async fn register_runner<R>(
    registry: &R,
    name: &str,
    labels: &[String],
    runner_group_id: u64,
) -> Result<JitConfig, RegistrationError>
where
    R: RunnerRegistry + ?Sized,
{
    match registry.generate_jitconfig(name, labels, runner_group_id).await {
        Err(e) if e.is_conflict() => {}
        other => return other.map_err(Into::into),
    }

    // The list endpoint filters by prefix.
    let stale: Vec<_> = registry
        .list_runners(name)
        .await?
        .into_iter()
        .filter(|runner| runner.name == name)
        .collect();

    let [runner] = stale.as_slice() else {
        warn!(name = %name, found = stale.len(), "Conflicting registrations are ambiguous");
        return Err(RegistrationError::ConflictRecoveryAmbiguous {
            name: name.to_string(),
            found: stale.len(),
        });
    };

    info!(name = %name, runner_id = runner.id, "Deleting stale runner registration");
    registry.delete_runner(runner.id).await?;

    Ok(registry
        .generate_jitconfig(name, labels, runner_group_id)
        .await?)
}

/// Registration settings bundled with the registry they apply to.
#[derive(Clone)]
pub struct Registrar {
    registry: Arc<dyn RunnerRegistry>,
    labels: Vec<String>,
    runner_group_id: u64,
}

impl Registrar {
    /// `labels` are sent verbatim, so they should already include
    /// `self-hosted`.
    pub fn new(
        registry: Arc<dyn RunnerRegistry>,
        labels: Vec<String>,
        runner_group_id: u64,
    ) -> Self {
        Self {
            registry,
            labels,
            runner_group_id,
        }
    }

    pub async fn register(&self, name: &str) -> Result<JitConfig, RegistrationError> {
        register_runner(self.registry.as_ref(), name, &self.labels, self.runner_group_id).await
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;
    use crate::registry::mock::RegistryCall;
    use crate::registry::MockRegistry;

    const NAME: &str = "gha-runner-107";

    fn issued(calls: &[RegistryCall]) -> usize {
        calls
            .iter()
            .filter(|call| matches!(call, RegistryCall::Generate { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_fresh_name_issues_once() {
        let registry = MockRegistry::new();
        let labels = vec!["self-hosted".to_string(), "linux".to_string()];

        register_runner(&registry, NAME, &labels, 4).await.unwrap();

        assert_eq!(
            registry.calls(),
            vec![RegistryCall::Generate {
                name: NAME.to_string(),
                labels,
                runner_group_id: 4,
            }]
        );
    }

    #[tokio::test]
    async fn test_single_stale_registration_is_replaced() {
        let registry = MockRegistry::new();
        let stale = registry.add_runner(NAME);
        registry.add_runner("gha-runner-1070");

        let jit = register_runner(&registry, NAME, &[], 1).await.unwrap();

        let calls = registry.calls();
        assert_eq!(issued(&calls), 2);
        assert_eq!(calls[1], RegistryCall::List(NAME.to_string()));
        assert_eq!(calls[2], RegistryCall::Delete(stale));
        assert_ne!(jit.runner_id, stale);
        assert!(jit.encoded.expose_secret().starts_with("jit-gha-runner-107"));
    }

    #[tokio::test]
    async fn test_no_match_after_conflict_fails_without_delete() {
        let registry = MockRegistry::new();
        registry.force_conflicts(true);
        registry.add_runner("gha-runner-1070");

        let result = register_runner(&registry, NAME, &[], 1).await;

        assert!(matches!(
            result,
            Err(RegistrationError::ConflictRecoveryAmbiguous { found: 0, .. })
        ));
        let calls = registry.calls();
        assert_eq!(issued(&calls), 1);
        assert!(!calls.iter().any(|c| matches!(c, RegistryCall::Delete(_))));
    }

    #[tokio::test]
    async fn test_duplicate_matches_fail_without_delete() {
        let registry = MockRegistry::new();
        registry.add_runner(NAME);
        registry.add_runner(NAME);

        let result = register_runner(&registry, NAME, &[], 1).await;

        assert!(matches!(
            result,
            Err(RegistrationError::ConflictRecoveryAmbiguous { found: 2, .. })
        ));
        assert!(!registry
            .calls()
            .iter()
            .any(|c| matches!(c, RegistryCall::Delete(_))));
        assert_eq!(registry.runners().len(), 2);
    }

    #[tokio::test]
    async fn test_second_conflict_propagates() {
        let registry = MockRegistry::new();
        registry.add_runner(NAME);
        registry.force_conflicts(true);

        let result = register_runner(&registry, NAME, &[], 1).await;

        assert!(matches!(
            result,
            Err(RegistrationError::Registry(RegistryError::Conflict { .. }))
        ));
        assert_eq!(issued(&registry.calls()), 2);
    }

    #[tokio::test]
    async fn test_other_failures_skip_recovery() {
        let registry = MockRegistry::new();
        registry.set_unavailable(true);

        let result = register_runner(&registry, NAME, &[], 1).await;

        assert!(matches!(
            result,
            Err(RegistrationError::Registry(RegistryError::Api { status: 503, .. }))
        ));
        assert_eq!(registry.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_registrar_sends_configured_labels() {
        let registry = Arc::new(MockRegistry::new());
        let registrar = Registrar::new(
            registry.clone(),
            vec!["self-hosted".to_string(), "gpu".to_string()],
            9,
        );

        registrar.register(NAME).await.unwrap();

        assert!(matches!(
            &registry.calls()[0],
            RegistryCall::Generate { labels, runner_group_id: 9, .. }
                if labels == &["self-hosted", "gpu"]
        ));
    }
}
