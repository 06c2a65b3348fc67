//! DigitalOcean backend: droplets and block-storage volumes over the v2
//! REST API.
//!
//! Labels travel as droplet tags (`key` or `key:value`). The boot volume
//! is the droplet's own root disk, sized by the droplet size slug. Agent
//! settings and the SSH key are delivered through cloud-init user data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nbgrid_core::BlockStorage;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Provider, ProviderContext, SharedProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::machine::{CLOUD_TAG, ExecutionMachine, MachineInstance};

pub const FACTORY_ID: &str = "digitalocean";

const API_URL: &str = "https://api.digitalocean.com/v2";
const PAGE_SIZE: usize = 200;
const ACTIVE_POLL: Duration = Duration::from_secs(3);
const ACTIVE_ATTEMPTS: usize = 20;

pub(super) fn factory(ctx: &ProviderContext) -> ProviderResult<SharedProvider> {
    let token = ctx
        .do_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProviderError::Config("NB_DO_TOKEN is not set".to_string()))?;
    Ok(Arc::new(DigitalOceanProvider::new(API_URL, &token)?))
}

// ── Wire types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub volume_ids: Vec<String>,
    pub region: Region,
    #[serde(default)]
    pub networks: Networks,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub slug: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub droplet_ids: Vec<u64>,
    pub region: Region,
}

#[derive(Debug, Deserialize)]
struct DropletsPage {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct DropletBody {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct VolumesPage {
    volumes: Vec<Volume>,
}

#[derive(Debug, Serialize)]
pub struct CreateDroplet {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub tags: Vec<String>,
    pub user_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_uuid: Option<String>,
    pub monitoring: bool,
}

// ── Pure helpers ────────────────────────────────────────────────

/// Inverse of `tags_from_labels`: `key:value` splits on the first colon,
/// a bare tag becomes a label with an empty value.
pub fn labels_from_tags(tags: &[String]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|tag| match tag.split_once(':') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (tag.clone(), String::new()),
        })
        .collect()
}

/// Droplets count as running until powered off or archived.
pub fn is_running(droplet: &Droplet) -> bool {
    !matches!(droplet.status.as_str(), "off" | "archive")
}

pub fn to_instance(droplet: &Droplet, volume_names: &BTreeMap<String, String>) -> MachineInstance {
    let ips = |kind: &str| {
        droplet
            .networks
            .v4
            .iter()
            .filter(|n| n.kind == kind)
            .map(|n| n.ip_address.clone())
            .collect::<Vec<_>>()
    };
    MachineInstance {
        machine_id: droplet.id.to_string(),
        machine_name: droplet.name.clone(),
        location: droplet.region.slug.clone(),
        private_ips: ips("private"),
        public_ips: ips("public"),
        labels: labels_from_tags(&droplet.tags),
        volumes: droplet
            .volume_ids
            .iter()
            .map(|id| volume_names.get(id).cloned().unwrap_or_else(|| id.clone()))
            .collect(),
        provider: FACTORY_ID.to_string(),
        created_at: droplet.created_at,
    }
}

/// Cloud-init user data: the SSH key and the agent environment file.
pub fn cloud_init(machine: &ExecutionMachine) -> String {
    let mut out = String::from("#cloud-config\n");
    if let Some(key) = &machine.ssh_public_key {
        out.push_str("ssh_authorized_keys:\n");
        out.push_str(&format!("  - {key}\n"));
    }
    out.push_str("write_files:\n");
    out.push_str("  - path: /etc/nbgrid/agent.env\n");
    out.push_str("    permissions: '0600'\n");
    out.push_str("    content: |\n");
    for (k, v) in &machine.agent_env {
        out.push_str(&format!("      {k}={v}\n"));
    }
    out
}

pub fn create_request(machine: &ExecutionMachine) -> CreateDroplet {
    CreateDroplet {
        name: machine.machine_name.clone(),
        region: machine.location.clone(),
        size: machine.size.clone(),
        image: machine.image.clone(),
        tags: machine.tags(),
        user_data: cloud_init(machine),
        vpc_uuid: machine.network.clone(),
        monitoring: true,
    }
}

// ── Provider ────────────────────────────────────────────────────

pub struct DigitalOceanProvider {
    client: Client,
    base_url: String,
}

impl DigitalOceanProvider {
    pub fn new(base_url: &str, token: &str) -> ProviderResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ProviderError::Config(format!("invalid token: {e}")))?;
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn send(&self, request: RequestBuilder) -> ProviderResult<Response> {
        request.send().map_err(|e| ProviderError::Api(e.to_string()))
    }

    fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ProviderResult<T> {
        let response = check(self.send(request)?)?;
        response
            .json()
            .map_err(|e| ProviderError::Api(format!("decode: {e}")))
    }

    fn droplets(&self, tag: Option<&str>) -> ProviderResult<Vec<Droplet>> {
        let mut request = self
            .client
            .get(self.url("/droplets"))
            .query(&[("per_page", PAGE_SIZE.to_string())]);
        if let Some(tag) = tag {
            request = request.query(&[("tag_name", tag)]);
        }
        Ok(self.json::<DropletsPage>(request)?.droplets)
    }

    fn droplet_by_name(&self, name: &str) -> ProviderResult<Option<Droplet>> {
        Ok(self
            .droplets(Some(CLOUD_TAG))?
            .into_iter()
            .find(|d| d.name == name))
    }

    fn volumes(&self, name: Option<&str>) -> ProviderResult<Vec<Volume>> {
        let mut request = self
            .client
            .get(self.url("/volumes"))
            .query(&[("per_page", PAGE_SIZE.to_string())]);
        if let Some(name) = name {
            request = request.query(&[("name", name)]);
        }
        Ok(self.json::<VolumesPage>(request)?.volumes)
    }

    fn volume_by_name(&self, name: &str) -> ProviderResult<Option<Volume>> {
        Ok(self.volumes(Some(name))?.into_iter().next())
    }

    fn volume_names(&self) -> ProviderResult<BTreeMap<String, String>> {
        Ok(self
            .volumes(None)?
            .into_iter()
            .map(|v| (v.id, v.name))
            .collect())
    }

    fn wait_active(&self, id: u64) -> ProviderResult<Droplet> {
        for _ in 0..ACTIVE_ATTEMPTS {
            let body: DropletBody = self.json(self.client.get(self.url(&format!("/droplets/{id}"))))?;
            if body.droplet.status == "active" {
                return Ok(body.droplet);
            }
            std::thread::sleep(ACTIVE_POLL);
        }
        Err(ProviderError::Api(format!("droplet {id} did not become active")))
    }

    fn volume_action(&self, action: &str, node: &str, disk: &str) -> ProviderResult<bool> {
        let Some(droplet) = self.droplet_by_name(node)? else {
            return Err(ProviderError::Api(format!("droplet {node} not found")));
        };
        let Some(volume) = self.volume_by_name(disk)? else {
            return Err(ProviderError::Api(format!("volume {disk} not found")));
        };
        let attached = volume.droplet_ids.contains(&droplet.id);
        if (action == "attach") == attached {
            return Ok(false);
        }
        let body = json!({
            "type": action,
            "volume_name": disk,
            "droplet_id": droplet.id,
            "region": droplet.region.slug,
        });
        check(self.send(self.client.post(self.url("/volumes/actions")).json(&body))?)?;
        debug!(%action, droplet = %node, volume = %disk, "volume action submitted");
        Ok(true)
    }
}

impl Provider for DigitalOceanProvider {
    fn kind(&self) -> &'static str {
        FACTORY_ID
    }

    fn create_machine(&self, machine: &ExecutionMachine) -> ProviderResult<MachineInstance> {
        if let Some(existing) = self.droplet_by_name(&machine.machine_name)? {
            let instance = to_instance(&existing, &self.volume_names()?);
            if instance.labels == machine.labels {
                return Ok(instance);
            }
            return Err(ProviderError::NameInUse(machine.machine_name.clone()));
        }

        let body: DropletBody = self.json(
            self.client
                .post(self.url("/droplets"))
                .json(&create_request(machine)),
        )?;
        info!(machine = %machine.machine_name, droplet_id = body.droplet.id, "droplet created");

        let mut droplet = body.droplet;
        if !machine.volumes.is_empty() {
            droplet = self.wait_active(droplet.id)?;
            for volume in &machine.volumes {
                self.create_volume(&volume.name, &volume.spec)?;
                self.attach_volume(&machine.machine_name, &volume.name)?;
            }
        }
        let mut instance = to_instance(&droplet, &BTreeMap::new());
        instance.volumes = machine.volumes.iter().map(|v| v.name.clone()).collect();
        Ok(instance)
    }

    fn destroy_machine(&self, name: &str) -> ProviderResult<()> {
        let Some(droplet) = self.droplet_by_name(name)? else {
            return Ok(());
        };
        let response = self.send(
            self.client
                .delete(self.url(&format!("/droplets/{}", droplet.id))),
        )?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response)?;
        info!(machine = %name, droplet_id = droplet.id, "droplet destroyed");
        Ok(())
    }

    fn list_machines(
        &self,
        location: Option<&str>,
        tags: &[String],
    ) -> ProviderResult<Vec<MachineInstance>> {
        let droplets = self.droplets(tags.first().map(String::as_str))?;
        let names = self.volume_names()?;
        Ok(droplets
            .iter()
            .filter(|d| is_running(d))
            .filter(|d| location.is_none_or(|l| d.region.slug == l))
            .map(|d| to_instance(d, &names))
            .filter(|i| i.has_tags(tags))
            .collect())
    }

    fn create_volume(&self, name: &str, spec: &BlockStorage) -> ProviderResult<()> {
        if self.volume_by_name(name)?.is_some() {
            return Ok(());
        }
        let body = json!({
            "name": name,
            "size_gigabytes": spec.size_gb,
            "region": spec.location,
            "filesystem_type": "ext4",
            "description": spec.description.clone().unwrap_or_default(),
            "tags": [CLOUD_TAG],
        });
        check(self.send(self.client.post(self.url("/volumes")).json(&body))?)?;
        info!(volume = %name, size_gb = spec.size_gb, "volume created");
        Ok(())
    }

    fn destroy_volume(&self, name: &str) -> ProviderResult<()> {
        let Some(volume) = self.volume_by_name(name)? else {
            return Ok(());
        };
        if !volume.droplet_ids.is_empty() {
            warn!(volume = %name, "destroying an attached volume");
        }
        let response = self.send(
            self.client
                .delete(self.url(&format!("/volumes/{}", volume.id))),
        )?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response)?;
        Ok(())
    }

    fn attach_volume(&self, node: &str, disk: &str) -> ProviderResult<()> {
        self.volume_action("attach", node, disk).map(|_| ())
    }

    fn detach_volume(&self, node: &str, disk: &str) -> ProviderResult<()> {
        self.volume_action("detach", node, disk).map(|_| ())
    }
}

fn check(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    if status == StatusCode::UNPROCESSABLE_ENTITY && body.contains("already") {
        return Err(ProviderError::NameInUse(body));
    }
    Err(ProviderError::Api(format!("{status}: {body}")))
}
