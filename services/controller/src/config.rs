//! Controller configuration loaded from environment variables.
//!
//! Every variable is validated up front; a bad value aborts startup before
//! the HTTP listener or the reconciliation loop are started.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use runnerpool_reconcile::{LifecyclePolicy, VmId, DEFAULT_RECONCILE_INTERVAL, DEFAULT_STOP_GRACE};
use secrecy::SecretString;
use thiserror::Error;

use crate::hypervisor::TaskWait;
use crate::reconciler::MemberFailurePolicy;
use crate::registry::github::GitHubAuth;

/// Lowest VM id Proxmox accepts for guests.
pub const MIN_PROXMOX_VMID: VmId = 100;

const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_RUNNER_NAME_PREFIX: &str = "gha-runner";
const DEFAULT_MAX_AGE_SECS: u64 = 20 * 60;
const DEFAULT_TOKEN_TTL_SECS: u64 = 5 * 60;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the provisioning endpoint binds to.
    pub host: String,

    /// Port the provisioning endpoint binds to.
    pub port: u16,

    /// Base URL under which booting VMs reach the provisioning endpoint.
    pub public_url: String,

    /// Shared HS256 secret for provisioning tokens.
    pub jwt_secret: SecretString,

    /// Lifetime of a provisioning token.
    pub token_ttl: Duration,

    pub github: GitHubConfig,
    pub proxmox: ProxmoxConfig,

    /// Extra runner labels; `self-hosted` is always added.
    pub labels: Vec<String>,

    /// Desired minimum number of VMs in the pool.
    pub minimum_runners: usize,

    /// VM and runner names are `{prefix}-{vmid}`.
    pub runner_name_prefix: String,

    pub lifecycle: LifecyclePolicy,
    pub reconcile_interval: Duration,
    pub task_wait: TaskWait,
    pub member_failure_policy: MemberFailurePolicy,

    /// Optional user-data template file; the built-in one is used otherwise.
    pub cloud_init_template: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// GitHub registration settings.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub organization: String,
    pub runner_group_id: u64,
    pub auth: GitHubAuthConfig,
}

/// How the controller authenticates to GitHub.
#[derive(Debug, Clone)]
pub enum GitHubAuthConfig {
    /// GitHub App installation; the private key is read from a PEM file.
    App {
        client_id: String,
        installation_id: u64,
        private_key_path: PathBuf,
    },

    /// Pre-issued token with `admin:org` scope.
    Token(SecretString),
}

impl GitHubAuthConfig {
    /// Resolve file references into usable credentials.
    pub fn load(&self) -> Result<GitHubAuth, ConfigError> {
        match self {
            GitHubAuthConfig::App {
                client_id,
                installation_id,
                private_key_path,
            } => {
                let pem = std::fs::read_to_string(private_key_path).map_err(|source| {
                    ConfigError::ReadFile {
                        path: private_key_path.clone(),
                        source,
                    }
                })?;
                Ok(GitHubAuth::App {
                    client_id: client_id.clone(),
                    installation_id: *installation_id,
                    private_key: SecretString::from(pem),
                })
            }
            GitHubAuthConfig::Token(token) => Ok(GitHubAuth::Token(token.clone())),
        }
    }
}

/// Proxmox VE settings.
#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// API base, e.g. `https://pve.example.com:8006/api2/json`.
    pub url: String,

    /// API token in `USER@REALM!TOKENID=SECRET` form.
    pub token: SecretString,

    pub insecure_tls: bool,
    pub node: String,
    pub pool: String,

    /// VM cloned for every new runner.
    pub template_vmid: VmId,

    pub full_clone: bool,
    pub min_vmid: VmId,
    pub max_vmid: VmId,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let host = env.optional("HOST").unwrap_or_else(|| "::".to_string());
        let port = env.parse_required::<u16>("PORT")?;

        let public_url = env.required("PUBLIC_URL")?.trim_end_matches('/').to_string();

        let jwt_secret = env.required("JWT_SECRET")?;
        let token_ttl = Duration::from_secs(
            env.parse_optional("PROVISIONING_TOKEN_TTL_SECS")?
                .unwrap_or(DEFAULT_TOKEN_TTL_SECS),
        );
        if token_ttl.is_zero() {
            return Err(invalid("PROVISIONING_TOKEN_TTL_SECS", "must be greater than zero"));
        }

        let github = GitHubConfig {
            api_url: env
                .optional("GITHUB_API_URL")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            organization: env.required("GITHUB_ORGANIZATION")?,
            runner_group_id: env.parse_required("GITHUB_RUNNER_GROUP_ID")?,
            auth: github_auth(&env)?,
        };

        let labels = parse_labels(&env.required("LABELS")?)?;

        let proxmox = ProxmoxConfig {
            url: env.required("PROXMOX_URL")?.trim_end_matches('/').to_string(),
            token: SecretString::from(env.required("PROXMOX_TOKEN")?),
            insecure_tls: env.parse_bool("PROXMOX_INSECURE_TLS")?,
            node: env.required("PROXMOX_NODE")?,
            pool: env.required("PROXMOX_POOL")?,
            template_vmid: env.parse_vmid("PROXMOX_VMID")?,
            full_clone: env.parse_bool("PROXMOX_FULL_CLONE")?,
            min_vmid: env.parse_vmid("PROXMOX_MIN_VMID")?,
            max_vmid: env.parse_vmid("PROXMOX_MAX_VMID")?,
        };
        if proxmox.min_vmid > proxmox.max_vmid {
            return Err(invalid(
                "PROXMOX_MIN_VMID",
                format!(
                    "{} is greater than PROXMOX_MAX_VMID {}",
                    proxmox.min_vmid, proxmox.max_vmid
                ),
            ));
        }

        let minimum_runners = env.parse_required("MINIMUM_RUNNERS")?;

        let runner_name_prefix = env
            .optional("RUNNER_NAME_PREFIX")
            .unwrap_or_else(|| DEFAULT_RUNNER_NAME_PREFIX.to_string());
        if runner_name_prefix.is_empty() {
            return Err(invalid("RUNNER_NAME_PREFIX", "must not be empty"));
        }

        let max_age_secs = env
            .parse_optional::<u64>("RUNNER_MAX_AGE_SECS")?
            .unwrap_or(DEFAULT_MAX_AGE_SECS);
        let lifecycle = LifecyclePolicy {
            max_age: (max_age_secs > 0).then(|| Duration::from_secs(max_age_secs)),
            stop_grace: env
                .parse_optional("STOP_GRACE_PERIOD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STOP_GRACE),
        };

        let reconcile_interval = env
            .parse_optional("RECONCILE_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL);
        if reconcile_interval.is_zero() {
            return Err(invalid("RECONCILE_INTERVAL_SECS", "must be greater than zero"));
        }

        let defaults = TaskWait::default();
        let task_wait = TaskWait {
            timeout: env
                .parse_optional("TASK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            poll_interval: env
                .parse_optional("TASK_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        };
        if task_wait.timeout.is_zero() {
            return Err(invalid("TASK_TIMEOUT_SECS", "must be greater than zero"));
        }

        let member_failure_policy = match env.optional("MEMBER_FAILURE_POLICY") {
            Some(value) => value
                .parse()
                .map_err(|reason: String| invalid("MEMBER_FAILURE_POLICY", reason))?,
            None => MemberFailurePolicy::default(),
        };

        let cloud_init_template = env.optional("CLOUD_INIT_TEMPLATE").map(PathBuf::from);

        let log_level = env.optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            host,
            port,
            public_url,
            jwt_secret: SecretString::from(jwt_secret),
            token_ttl,
            github,
            proxmox,
            labels,
            minimum_runners,
            runner_name_prefix,
            lifecycle,
            reconcile_interval,
            task_wait,
            member_failure_policy,
            cloud_init_template,
            log_level,
        })
    }

    /// Labels sent to GitHub for every runner.
    pub fn runner_labels(&self) -> Vec<String> {
        std::iter::once("self-hosted".to_string())
            .chain(self.labels.iter().cloned())
            .collect()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `var`, if set.
    fn optional(&self, var: &'static str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing(var))
    }

    fn parse_optional<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.optional(var)
            .map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|e: T::Err| invalid(var, e.to_string()))
            })
            .transpose()
    }

    fn parse_required<T>(&self, var: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parse_optional(var)?.ok_or(ConfigError::Missing(var))
    }

    fn parse_vmid(&self, var: &'static str) -> Result<VmId, ConfigError> {
        let vmid: VmId = self.parse_required(var)?;
        if vmid < MIN_PROXMOX_VMID {
            return Err(invalid(var, format!("must be at least {MIN_PROXMOX_VMID}")));
        }
        Ok(vmid)
    }

    fn parse_bool(&self, var: &'static str) -> Result<bool, ConfigError> {
        let Some(value) = (self.lookup)(var) else {
            return Ok(false);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "" | "0" | "false" | "no" => Ok(false),
            other => Err(invalid(var, format!("expected a boolean, got {other:?}"))),
        }
    }
}

fn github_auth<F>(env: &Env<F>) -> Result<GitHubAuthConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = env.optional("GITHUB_TOKEN") {
        return Ok(GitHubAuthConfig::Token(SecretString::from(token)));
    }

    Ok(GitHubAuthConfig::App {
        client_id: env.required("GITHUB_CLIENT_ID")?,
        installation_id: env.parse_required("GITHUB_INSTALLATION_ID")?,
        private_key_path: PathBuf::from(env.required("GITHUB_PRIVATE_KEY")?),
    })
}

/// Validate a comma separated label list (`[a-z0-9_-]+`, case-insensitive).
fn parse_labels(value: &str) -> Result<Vec<String>, ConfigError> {
    let labels: Vec<String> = value.split(',').map(|label| label.trim().to_string()).collect();

    for label in &labels {
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(invalid("LABELS", format!("invalid label {label:?}")));
        }
    }

    Ok(labels)
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}
