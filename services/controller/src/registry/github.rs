//! GitHub Actions self-hosted runner API.
//!
//! Runners are registered at the organization level. Requests authenticate
//! either with a static token or as a GitHub App installation, in which case
//! a short-lived installation token is minted from an RS256 app JWT and
//! cached until shortly before it expires.
//!
//! Reference: https://docs.github.com/en/rest/actions/self-hosted-runners

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{JitConfig, RegisteredRunner, RegistryError, RunnerRegistry};
use crate::config::GitHubConfig;

const USER_AGENT: &str = concat!("runnerpool-controller/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";

/// Installation tokens are refreshed this many seconds before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Credentials used to call the GitHub API.
#[derive(Debug, Clone)]
pub enum GitHubAuth {
    App {
        client_id: String,
        installation_id: u64,
        private_key: SecretString,
    },
    Token(SecretString),
}

struct InstallationToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// GitHub REST client scoped to one organization.
pub struct GitHubClient {
    http_client: reqwest::Client,
    api_base_url: String,
    organization: String,
    auth: GitHubAuth,
    installation_token: Mutex<Option<InstallationToken>>,
}

impl GitHubClient {
    /// Create a client for the configured organization.
    pub fn new(config: &GitHubConfig, auth: GitHubAuth) -> Result<Self, RegistryError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http_client,
            api_base_url: config.api_url.trim_end_matches('/').to_string(),
            organization: config.organization.clone(),
            auth,
            installation_token: Mutex::new(None),
        })
    }

    fn org_url(&self, path: &str) -> String {
        format!("{}/orgs/{}{}", self.api_base_url, self.organization, path)
    }

    fn generate_app_jwt(
        client_id: &str,
        private_key: &SecretString,
        now: i64,
    ) -> Result<String, RegistryError> {
        #[derive(Debug, Serialize)]
        struct Claims<'a> {
            iat: i64,
            exp: i64,
            iss: &'a str,
        }

        // Backdated to tolerate clock drift; GitHub caps `exp` at ten minutes.
        let claims = Claims {
            iat: now - 60,
            exp: now + 540,
            iss: client_id,
        };
        let key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|e| RegistryError::Auth(format!("invalid app private key: {e}")))?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| RegistryError::Auth(format!("failed to sign app JWT: {e}")))
    }

    /// Bearer token for the next request.
    async fn access_token(&self) -> Result<SecretString, RegistryError> {
        let (client_id, installation_id, private_key) = match &self.auth {
            GitHubAuth::Token(token) => return Ok(token.clone()),
            GitHubAuth::App {
                client_id,
                installation_id,
                private_key,
            } => (client_id, *installation_id, private_key),
        };

        let mut cached = self.installation_token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now {
                return Ok(token.token.clone());
            }
        }

        #[derive(Debug, Deserialize)]
        struct InstallationTokenResponse {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let jwt = Self::generate_app_jwt(client_id, private_key, now.timestamp())?;
        let response = self
            .http_client
            .post(format!(
                "{}/app/installations/{}/access_tokens",
                self.api_base_url, installation_id
            ))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(jwt)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to mint installation token");
            return Err(RegistryError::Auth(format!(
                "installation token request failed with {status}"
            )));
        }

        let payload: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        debug!(expires_at = %payload.expires_at, "Minted installation token");

        let token = SecretString::from(payload.token);
        *cached = Some(InstallationToken {
            token: token.clone(),
            expires_at: payload.expires_at,
        });
        Ok(token)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> Result<reqwest::RequestBuilder, RegistryError> {
        let token = self.access_token().await?;
        Ok(self
            .http_client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(token.expose_secret()))
    }
}

async fn api_error(response: reqwest::Response, action: &str) -> RegistryError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    error!(status = %status, body = %message, "Failed to {action}");
    RegistryError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl RunnerRegistry for GitHubClient {
    async fn generate_jitconfig(
        &self,
        name: &str,
        labels: &[String],
        runner_group_id: u64,
    ) -> Result<JitConfig, RegistryError> {
        #[derive(Debug, Serialize)]
        struct JitConfigRequest<'a> {
            name: &'a str,
            runner_group_id: u64,
            labels: &'a [String],
            work_folder: &'a str,
        }

        #[derive(Debug, Deserialize)]
        struct JitConfigResponse {
            runner: RegisteredRunner,
            encoded_jit_config: String,
        }

        debug!(name = %name, "Generating runner JIT config");
        let response = self
            .request(
                reqwest::Method::POST,
                self.org_url("/actions/runners/generate-jitconfig"),
            )
            .await?
            .json(&JitConfigRequest {
                name,
                runner_group_id,
                labels,
                work_folder: "_work",
            })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(RegistryError::Conflict {
                name: name.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(api_error(response, "generate JIT config").await);
        }

        let payload: JitConfigResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        info!(name = %name, runner_id = payload.runner.id, "Issued runner JIT config");

        Ok(JitConfig {
            runner_id: payload.runner.id,
            encoded: SecretString::from(payload.encoded_jit_config),
        })
    }

    async fn list_runners(&self, name: &str) -> Result<Vec<RegisteredRunner>, RegistryError> {
        #[derive(Debug, Deserialize)]
        struct ListRunnersResponse {
            runners: Vec<RegisteredRunner>,
        }

        let response = self
            .request(reqwest::Method::GET, self.org_url("/actions/runners"))
            .await?
            .query(&[("name", name), ("per_page", "100")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "list runners").await);
        }

        let payload: ListRunnersResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        Ok(payload.runners)
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<(), RegistryError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                self.org_url(&format!("/actions/runners/{runner_id}")),
            )
            .await?
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response, "delete runner").await);
        }

        info!(runner_id, "Deleted runner registration");
        Ok(())
    }
}
