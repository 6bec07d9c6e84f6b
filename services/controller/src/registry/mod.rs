//! Runner registration backend.
//!
//! A runner registration is issued as a just-in-time (JIT) configuration: an
//! opaque, single-use blob the runner binary consumes to join the org. The
//! registry also allows listing and deleting registrations by name, which
//! the conflict recovery in [`crate::registration`] relies on.

pub mod github;
pub mod mock;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

pub use github::GitHubClient;
pub use mock::MockRegistry;

/// Errors from the registration backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A runner with this name is already registered.
    #[error("runner {name} is already registered")]
    Conflict { name: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RegistryError {
    /// Whether issuance was rejected because the name is taken.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::Conflict { .. })
    }
}

/// Freshly issued one-time runner configuration.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Id of the runner record created alongside the configuration.
    pub runner_id: u64,

    /// Encoded configuration passed to `run.sh --jitconfig`.
    pub encoded: SecretString,
}

/// A registered self-hosted runner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredRunner {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub busy: bool,
}

/// Runner registration operations.
#[async_trait]
pub trait RunnerRegistry: Send + Sync {
    /// Issue a JIT configuration for a new runner named `name`.
    ///
    /// Fails with [`RegistryError::Conflict`] if the name is taken.
    async fn generate_jitconfig(
        &self,
        name: &str,
        labels: &[String],
        runner_group_id: u64,
    ) -> Result<JitConfig, RegistryError>;

    /// List registered runners matching `name`.
    async fn list_runners(&self, name: &str) -> Result<Vec<RegisteredRunner>, RegistryError>;

    /// Remove a runner registration.
    async fn delete_runner(&self, runner_id: u64) -> Result<(), RegistryError>;
}
