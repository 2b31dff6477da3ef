use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::{firewalls_api, servers_api, ssh_keys_api, volumes_api};
use hcloud::models;
use tracing::{info, warn};

use crate::id::ServerId;
use crate::pipeline::{Teardown, step};
use crate::poll::{BOOT_TIMEOUT, PollStatus, Poller, RESOURCE_TIMEOUT};
use crate::ports::{FirewallPort, Protocol, derive_firewall_ports};
use crate::tags::{self, TagSet};
use crate::template::{
    BootScriptRenderer, CloudInitRenderer, RenderArgs, ScriptFormat, variant_for,
};
use crate::types::{ServerArgs, ServerInfo};
use crate::{Automation, Error, ProviderName, Result};

const IMAGE: &str = "ubuntu-22.04";
const PAGE_SIZE: i64 = 50;

/// Hetzner Cloud backend using the `hcloud` crate.
///
/// Servers sit on the shared public network; each gets its own firewall,
/// SSH key and optional volume, all named after the server.
pub struct HetznerProvider {
    config: Configuration,
    location: String,
    renderer: Arc<dyn BootScriptRenderer>,
    boot: Poller,
    teardown: Poller,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_LOCATION` (default: `"fsn1"`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        let location = std::env::var("HETZNER_LOCATION").unwrap_or_else(|_| "fsn1".into());

        Ok(Self::with_config(config, location))
    }

    pub fn with_config(config: Configuration, location: impl Into<String>) -> Self {
        Self {
            config,
            location: location.into(),
            renderer: Arc::new(CloudInitRenderer),
            boot: Poller::new(Duration::from_secs(2), BOOT_TIMEOUT),
            teardown: Poller::new(Duration::from_secs(2), RESOURCE_TIMEOUT),
        }
    }

    pub fn with_pollers(mut self, boot: Poller, teardown: Poller) -> Self {
        self.boot = boot;
        self.teardown = teardown;
        self
    }

    fn parse_id(id: &ServerId) -> Result<i64> {
        id.primary()
            .parse::<i64>()
            .map_err(|_| Error::InvalidId(id.to_string()))
    }

    fn labels(tags: &TagSet) -> HashMap<String, String> {
        tags.to_map()
    }

    /// One inbound rule per port, open to every address.
    fn firewall_rules(ports: &[FirewallPort]) -> Vec<models::Rule> {
        ports
            .iter()
            .map(|p| {
                let protocol = match p.protocol {
                    Protocol::Tcp => models::rule::Protocol::Tcp,
                    Protocol::Udp => models::rule::Protocol::Udp,
                };
                let mut rule = models::Rule::new(models::rule::Direction::In, protocol);
                rule.port = Some(p.port.to_string());
                rule.source_ips = Some(vec!["0.0.0.0/0".into(), "::/0".into()]);
                rule
            })
            .collect()
    }

    fn public_ip(server: &models::Server) -> Option<String> {
        server.public_net.ipv4.as_ref().map(|v4| v4.ip.clone())
    }

    fn info(&self, server: &models::Server) -> Result<ServerInfo> {
        Ok(ServerInfo {
            id: ServerId::new(server.id.to_string())?,
            name: server.name.clone(),
            region: self.location.clone(),
            public_ip: Self::public_ip(server),
            tags: tags::flatten(&server.labels),
        })
    }

    async fn fetch(&self, id: i64) -> Result<models::Server> {
        let resp = servers_api::get_server(&self.config, servers_api::GetServerParams { id })
            .await
            .map_err(|e| api_error("get server", e))?;

        resp.server
            .map(|s| *s)
            .ok_or_else(|| Error::NotFound(format!("server {id}")))
    }

    async fn wait_for_running(&self, id: i64, args: &ServerArgs) -> Result<models::Server> {
        let waited = self
            .boot
            .with_deadline(args.deadline)
            .until("server running", move || async move {
                let server = self.fetch(id).await?;
                let status = server.status.clone();
                Ok(match status {
                    models::server::Status::Running if Self::public_ip(&server).is_some() => {
                        PollStatus::Ready(server)
                    }
                    models::server::Status::Deleting => PollStatus::Failed("deleting".into()),
                    _ => PollStatus::Pending,
                })
            })
            .await;

        match waited {
            Err(e) if e.is_timeout() => match self.fetch(id).await {
                Ok(server) if server.status == models::server::Status::Running => {
                    Err(Error::NoPublicAddress(server.name))
                }
                _ => Err(e),
            },
            other => other,
        }
    }

    async fn wait_for_deletion(&self, id: i64, args: &ServerArgs) -> Result<()> {
        self.teardown
            .with_deadline(args.deadline)
            .until("server deletion", move || async move {
                match self.fetch(id).await {
                    Ok(_) => Ok(PollStatus::Pending),
                    Err(e) if e.is_not_found() => Ok(PollStatus::Ready(())),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    async fn find_firewalls(&self, name: &str) -> Result<Vec<i64>> {
        let resp = firewalls_api::list_firewalls(
            &self.config,
            firewalls_api::ListFirewallsParams {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| api_error("list firewalls", e))?;
        Ok(resp.firewalls.iter().map(|f| f.id).collect())
    }

    async fn find_volumes(&self, name: &str) -> Result<Vec<i64>> {
        let resp = volumes_api::list_volumes(
            &self.config,
            volumes_api::ListVolumesParams {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| api_error("list volumes", e))?;
        Ok(resp.volumes.iter().map(|v| v.id).collect())
    }

    async fn find_ssh_keys(&self, name: &str) -> Result<Vec<i64>> {
        let resp = ssh_keys_api::list_ssh_keys(
            &self.config,
            ssh_keys_api::ListSshKeysParams {
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| api_error("list ssh keys", e))?;
        Ok(resp.ssh_keys.iter().map(|k| k.id).collect())
    }
}

/// Map an hcloud failure; a 404 response becomes [`Error::NotFound`].
fn api_error<T>(what: &str, err: hcloud::apis::Error<T>) -> Error {
    let not_found = matches!(
        &err,
        hcloud::apis::Error::ResponseError(r) if r.status.as_u16() == 404
    );
    let msg = format!("{what}: {err}");
    if not_found {
        Error::NotFound(msg)
    } else {
        Error::Provider(msg)
    }
}

#[async_trait]
impl Automation for HetznerProvider {
    async fn create_server(&self, args: &ServerArgs) -> Result<ServerInfo> {
        let d = &args.descriptor;
        let labels = Self::labels(&TagSet::managed(d));

        let public_key = step("load ssh key", d.ssh.load_public_key()).await?;
        let key_name = d.resource_name(tags::SSH_KEY_SUFFIX);
        step("create ssh key", async {
            let mut req = models::CreateSshKeyRequest::new(key_name.clone(), public_key);
            req.labels = Some(labels.clone());
            ssh_keys_api::create_ssh_key(
                &self.config,
                ssh_keys_api::CreateSshKeyParams {
                    create_ssh_key_request: req,
                },
            )
            .await
            .map_err(|e| api_error("create ssh key", e))
        })
        .await?;

        let firewall_id = step("create firewall", async {
            let mut req = models::CreateFirewallRequest::new(d.resource_name(tags::FIREWALL_SUFFIX));
            req.labels = Some(labels.clone());
            req.rules = Some(Self::firewall_rules(&derive_firewall_ports(d)));
            let resp = firewalls_api::create_firewall(
                &self.config,
                firewalls_api::CreateFirewallParams {
                    create_firewall_request: req,
                },
            )
            .await
            .map_err(|e| api_error("create firewall", e))?;
            resp.firewall
                .map(|f| f.id)
                .ok_or_else(|| Error::Provider("create firewall: no firewall in response".into()))
        })
        .await?;

        let volume = if d.volume_size_gb > 0 {
            let volume = step("create volume", async {
                let mut req = models::CreateVolumeRequest::new(
                    d.resource_name(tags::VOLUME_SUFFIX),
                    d.volume_size_gb as _,
                );
                req.labels = Some(labels.clone());
                req.location = Some(self.location.clone());
                let resp = volumes_api::create_volume(
                    &self.config,
                    volumes_api::CreateVolumeParams {
                        create_volume_request: req,
                    },
                )
                .await
                .map_err(|e| api_error("create volume", e))?;
                Ok::<_, Error>(*resp.volume)
            })
            .await?;
            Some(volume)
        } else {
            None
        };

        let user_data = self.renderer.render(
            d,
            &RenderArgs {
                mount: volume.as_ref().map(|v| v.linux_device.as_str()),
                ssh_public_key: None,
                variant: variant_for(d, ScriptFormat::CloudConfig),
            },
        )?;

        let created = step("create server", async {
            let resp = servers_api::create_server(
                &self.config,
                servers_api::CreateServerParams {
                    create_server_request: models::CreateServerRequest {
                        name: d.name.clone(),
                        server_type: d.size.clone(),
                        image: IMAGE.into(),
                        location: Some(self.location.clone()),
                        user_data: Some(user_data),
                        networks: None,
                        firewalls: Some(vec![models::CreateServerRequestFirewalls {
                            firewall: firewall_id,
                        }]),
                        ssh_keys: Some(vec![key_name.clone()]),
                        volumes: volume.as_ref().map(|v| vec![v.id]),
                        start_after_create: Some(true),
                        automount: None,
                        datacenter: None,
                        labels: Some(labels.clone()),
                        placement_group: None,
                        public_net: None,
                    },
                },
            )
            .await
            .map_err(|e| api_error("create server", e))?;
            Ok::<_, Error>(*resp.server)
        })
        .await?;

        info!(server_id = created.id, "hetzner: server created");

        let server = step(
            "wait for server",
            self.wait_for_running(created.id, args),
        )
        .await?;

        info!(
            server_id = server.id,
            public_ip = %Self::public_ip(&server).unwrap_or_default(),
            "hetzner: server running"
        );
        self.info(&server)
    }

    async fn get_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<ServerInfo> {
        let server = self.fetch(Self::parse_id(id)?).await?;
        if !tags::is_managed(&server.labels) {
            return Err(Error::NotFound(format!("server {id} is not managed")));
        }
        self.info(&server)
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let mut servers = Vec::new();
        let mut page = 1;

        loop {
            let resp = servers_api::list_servers(
                &self.config,
                servers_api::ListServersParams {
                    label_selector: Some(tags::marker_selector()),
                    page: Some(page),
                    per_page: Some(PAGE_SIZE),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| api_error("list servers", e))?;

            let count = resp.servers.len();
            for server in &resp.servers {
                servers.push(self.info(server)?);
            }

            if (count as i64) < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        Ok(servers)
    }

    async fn delete_server(&self, id: &ServerId, args: &ServerArgs) -> Result<()> {
        let d = &args.descriptor;
        let server_id = Self::parse_id(id)?;
        let mut td = Teardown::new(&d.name);

        let deleted = td
            .step("delete server", async {
                servers_api::delete_server(
                    &self.config,
                    servers_api::DeleteServerParams { id: server_id },
                )
                .await
                .map_err(|e| api_error("delete server", e))
            })
            .await?;
        if deleted.is_some() {
            td.step(
                "wait for server deletion",
                self.wait_for_deletion(server_id, args),
            )
            .await?;
        } else {
            warn!(server_id = %id, "hetzner: server already destroyed");
        }

        let firewalls = td
            .step(
                "find firewall",
                self.find_firewalls(&d.resource_name(tags::FIREWALL_SUFFIX)),
            )
            .await?
            .unwrap_or_default();
        for fw in firewalls {
            td.step("delete firewall", async {
                firewalls_api::delete_firewall(
                    &self.config,
                    firewalls_api::DeleteFirewallParams { id: fw },
                )
                .await
                .map_err(|e| api_error("delete firewall", e))
            })
            .await?;
        }

        let volumes = td
            .step(
                "find volume",
                self.find_volumes(&d.resource_name(tags::VOLUME_SUFFIX)),
            )
            .await?
            .unwrap_or_default();
        for volume in volumes {
            td.step("delete volume", async {
                volumes_api::delete_volume(
                    &self.config,
                    volumes_api::DeleteVolumeParams { id: volume },
                )
                .await
                .map_err(|e| api_error("delete volume", e))
            })
            .await?;
        }

        let keys = td
            .step(
                "find ssh key",
                self.find_ssh_keys(&d.resource_name(tags::SSH_KEY_SUFFIX)),
            )
            .await?
            .unwrap_or_default();
        for key in keys {
            td.step("delete ssh key", async {
                ssh_keys_api::delete_ssh_key(
                    &self.config,
                    ssh_keys_api::DeleteSshKeyParams { id: key },
                )
                .await
                .map_err(|e| api_error("delete ssh key", e))
            })
            .await?;
        }

        info!(server_id = %id, "hetzner: server destroyed");
        td.finish()
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }

    fn ssh_user(&self) -> &str {
        "root"
    }

    fn renderer(&self) -> &dyn BootScriptRenderer {
        self.renderer.as_ref()
    }
}
