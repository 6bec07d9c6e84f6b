//! Proxmox VE API client.
//!
//! Every response is wrapped in a `{"data": ...}` envelope; mutating VM
//! operations return the UPID of the task doing the actual work.
//!
//! Reference: https://pve.proxmox.com/pve-docs/api-viewer/

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use runnerpool_reconcile::{VmId, VmStatus};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{
    CloneOptions, Hypervisor, HypervisorError, PoolMember, PowerAction, TaskStatus, Upid, VmConfig,
};
use crate::config::ProxmoxConfig;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct PoolEntry {
    #[serde(default)]
    members: Vec<RawPoolMember>,
}

#[derive(Debug, Deserialize)]
struct RawPoolMember {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    vmid: Option<VmId>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    status: Option<VmStatus>,
}

/// Proxmox VE API client.
pub struct ProxmoxClient {
    client: reqwest::Client,
    base_url: String,
}

impl ProxmoxClient {
    /// Create a client authenticating with an API token.
    pub fn new(config: &ProxmoxConfig) -> Result<Self, HypervisorError> {
        let mut auth = HeaderValue::from_str(&format!(
            "PVEAPIToken={}",
            config.token.expose_secret()
        ))
        .map_err(|e| HypervisorError::Decode(format!("invalid API token: {e}")))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure_tls)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and unwrap the `data` envelope.
    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, HypervisorError> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let reason = response
                .headers()
                .get("x-pve-status")
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            let message = match reason {
                Some(reason) if body.is_empty() => reason,
                Some(reason) => format!("{reason}: {body}"),
                None => body,
            };
            error!(status = %status, message = %message, "Proxmox API request failed");
            return Err(HypervisorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| HypervisorError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn list_pool_members(&self, pool: &str) -> Result<Vec<PoolMember>, HypervisorError> {
        debug!(pool = %pool, "Listing pool members");
        let entries: Vec<PoolEntry> = self
            .send(
                self.client
                    .get(self.url("/pools"))
                    .query(&[("poolid", pool), ("type", "qemu")]),
            )
            .await?;

        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| HypervisorError::PoolNotFound(pool.to_string()))?;

        Ok(entry
            .members
            .into_iter()
            .filter(|member| member.kind == "qemu")
            .filter_map(|member| {
                Some(PoolMember {
                    vmid: member.vmid?,
                    node: member.node?,
                    status: member.status.unwrap_or(VmStatus::Unknown),
                })
            })
            .collect())
    }

    async fn vm_config(&self, node: &str, vmid: VmId) -> Result<VmConfig, HypervisorError> {
        self.send(
            self.client
                .get(self.url(&format!("/nodes/{node}/qemu/{vmid}/config"))),
        )
        .await
    }

    async fn update_vm_config(
        &self,
        node: &str,
        vmid: VmId,
        changes: &BTreeMap<String, String>,
    ) -> Result<(), HypervisorError> {
        debug!(
            node = %node,
            vmid,
            keys = ?changes.keys().collect::<Vec<_>>(),
            "Updating VM config"
        );
        let _: serde_json::Value = self
            .send(
                self.client
                    .put(self.url(&format!("/nodes/{node}/qemu/{vmid}/config")))
                    .json(changes),
            )
            .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        node: &str,
        vmid: VmId,
        action: PowerAction,
    ) -> Result<Upid, HypervisorError> {
        debug!(node = %node, vmid, action = %action, "Changing VM power state");
        self.send(self.client.post(self.url(&format!(
            "/nodes/{node}/qemu/{vmid}/status/{}",
            action.as_str()
        ))))
        .await
    }

    async fn clone_vm(
        &self,
        node: &str,
        vmid: VmId,
        newid: VmId,
        options: &CloneOptions,
    ) -> Result<Upid, HypervisorError> {
        #[derive(Serialize)]
        struct CloneRequest<'a> {
            newid: VmId,
            name: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            pool: Option<&'a str>,
            full: u8,
        }

        debug!(node = %node, vmid, newid, name = %options.name, "Cloning VM");
        let request = CloneRequest {
            newid,
            name: &options.name,
            pool: options.pool.as_deref(),
            full: u8::from(options.full),
        };
        self.send(
            self.client
                .post(self.url(&format!("/nodes/{node}/qemu/{vmid}/clone")))
                .json(&request),
        )
        .await
    }

    async fn delete_vm(&self, node: &str, vmid: VmId) -> Result<Upid, HypervisorError> {
        debug!(node = %node, vmid, "Deleting VM");
        self.send(
            self.client
                .delete(self.url(&format!("/nodes/{node}/qemu/{vmid}")))
                .query(&[("purge", "1"), ("destroy-unreferenced-disks", "1")]),
        )
        .await
    }

    async fn task_status(&self, node: &str, upid: &Upid) -> Result<TaskStatus, HypervisorError> {
        self.send(
            self.client
                .get(self.url(&format!("/nodes/{node}/tasks/{upid}/status"))),
        )
        .await
    }
}
