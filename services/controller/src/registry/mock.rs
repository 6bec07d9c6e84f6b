//! In-memory runner registry for testing and development.
//!
//! Issuing a configuration for a name that is already registered fails with
//! a conflict, the same way GitHub answers 409.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::debug;

use super::{JitConfig, RegisteredRunner, RegistryError, RunnerRegistry};

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Generate {
        name: String,
        labels: Vec<String>,
        runner_group_id: u64,
    },
    List(String),
    Delete(u64),
}

#[derive(Debug, Default)]
struct MockState {
    runners: Vec<RegisteredRunner>,
    calls: Vec<RegistryCall>,
    next_id: u64,
    always_conflict: bool,
    unavailable: bool,
}

/// In-memory [`RunnerRegistry`].
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<MockState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a runner directly, bypassing issuance. Duplicate names are
    /// allowed. Returns the new runner id.
    pub fn add_runner(&self, name: &str) -> u64 {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state.runners.push(RegisteredRunner {
            id,
            name: name.to_string(),
            status: Some("offline".to_string()),
            busy: false,
        });
        id
    }

    /// Reject every issuance with a conflict.
    pub fn force_conflicts(&self, conflict: bool) {
        self.state().always_conflict = conflict;
    }

    /// Fail every call with a server error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Registered runners.
    pub fn runners(&self) -> Vec<RegisteredRunner> {
        self.state().runners.clone()
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state().calls.clone()
    }

    fn check_available(state: &MockState) -> Result<(), RegistryError> {
        if state.unavailable {
            return Err(RegistryError::Api {
                status: 503,
                message: "registry unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerRegistry for MockRegistry {
    async fn generate_jitconfig(
        &self,
        name: &str,
        labels: &[String],
        runner_group_id: u64,
    ) -> Result<JitConfig, RegistryError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::Generate {
            name: name.to_string(),
            labels: labels.to_vec(),
            runner_group_id,
        });
        Self::check_available(&state)?;

        if state.always_conflict || state.runners.iter().any(|r| r.name == name) {
            return Err(RegistryError::Conflict {
                name: name.to_string(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.runners.push(RegisteredRunner {
            id,
            name: name.to_string(),
            status: Some("offline".to_string()),
            busy: false,
        });
        debug!(name = %name, runner_id = id, "[MOCK] Issued JIT config");

        Ok(JitConfig {
            runner_id: id,
            encoded: SecretString::from(format!("jit-{name}-{id}")),
        })
    }

    async fn list_runners(&self, name: &str) -> Result<Vec<RegisteredRunner>, RegistryError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::List(name.to_string()));
        Self::check_available(&state)?;

        // Name filtering on the real API is a prefix match.
        Ok(state
            .runners
            .iter()
            .filter(|r| r.name.starts_with(name))
            .cloned()
            .collect())
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<(), RegistryError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::Delete(runner_id));
        Self::check_available(&state)?;

        let before = state.runners.len();
        state.runners.retain(|r| r.id != runner_id);
        if state.runners.len() == before {
            return Err(RegistryError::Api {
                status: 404,
                message: "Not Found".to_string(),
            });
        }
        Ok(())
    }
}
