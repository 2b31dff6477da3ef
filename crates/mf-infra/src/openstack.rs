use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use openstack_api::{
    AuthOptions, CreateFloatingIpRequest, CreateNetworkRequest, CreateRouterRequest,
    CreateSecurityGroupRequest, CreateSecurityGroupRuleRequest, CreateServerRequest,
    CreateSubnetRequest, ExternalGateway, NamedRef, NetworkRef, OpenStackClient, Server,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::id::ServerId;
use crate::pipeline::{Teardown, step};
use crate::poll::{BOOT_TIMEOUT, PollStatus, Poller, RESOURCE_TIMEOUT};
use crate::ports::derive_firewall_ports;
use crate::tags::{self, TagSet};
use crate::template::{
    BootScriptRenderer, CloudInitRenderer, RenderArgs, ScriptFormat, variant_for,
};
use crate::types::{ServerArgs, ServerInfo};
use crate::{Automation, Error, ProviderName, Result};

const SUBNET_CIDR: &str = "10.1.10.0/24";
const DNS_SERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];
/// Re-authenticate when the token has less than this left.
const TOKEN_REFRESH_MARGIN: chrono::TimeDelta = chrono::TimeDelta::minutes(5);

/// Settings that distinguish one OpenStack-based cloud from another.
#[derive(Debug, Clone)]
pub struct OpenStackProfile {
    pub provider: ProviderName,
    /// Prefix of the credential env vars, e.g. `OS` for `OS_AUTH_URL`.
    pub env_prefix: &'static str,
    /// Boot images are picked by name substring.
    pub image_name: String,
    /// External network floating IPs and router gateways come from.
    pub public_network: String,
}

impl OpenStackProfile {
    pub fn openstack() -> Self {
        Self {
            provider: ProviderName::OpenStack,
            env_prefix: "OS",
            image_name: "Ubuntu 22.04".into(),
            public_network: "public".into(),
        }
    }

    pub fn fuga() -> Self {
        Self {
            provider: ProviderName::Fuga,
            env_prefix: "FUGA",
            image_name: "Ubuntu 22.04 LTS".into(),
            public_network: "public".into(),
        }
    }

    pub fn vexxhost() -> Self {
        Self {
            provider: ProviderName::Vexxhost,
            env_prefix: "VEXXHOST",
            image_name: "Ubuntu 22.04 LTS (Jammy Jellyfish) [2022-04-21]".into(),
            public_network: "public".into(),
        }
    }
}

/// Backend for OpenStack clouds (Nova, Neutron, Glance).
///
/// One instance per profile; Fuga and VEXXHOST are this backend with their
/// own profile.
pub struct OpenStackProvider {
    profile: OpenStackProfile,
    auth: Option<AuthOptions>,
    client: RwLock<OpenStackClient>,
    region: String,
    renderer: Arc<dyn BootScriptRenderer>,
    boot: Poller,
    teardown: Poller,
}

impl OpenStackProvider {
    /// Authenticate with the profile's env vars:
    ///
    /// - `<PREFIX>_AUTH_URL` (required, Keystone v3 endpoint)
    /// - `<PREFIX>_USERNAME`, `<PREFIX>_PASSWORD`, `<PREFIX>_PROJECT_ID` (required)
    /// - `<PREFIX>_USER_DOMAIN_NAME` (default: `"Default"`)
    /// - `<PREFIX>_REGION_NAME` (optional)
    /// - `<PREFIX>_IMAGE_NAME`, `<PREFIX>_PUBLIC_NETWORK` (override the profile)
    pub async fn from_env(mut profile: OpenStackProfile) -> Result<Self> {
        dotenvy::dotenv().ok();

        let prefix = profile.env_prefix;
        let var = |key: &str| {
            let name = format!("{prefix}_{key}");
            std::env::var(&name).map_err(|_| Error::MissingEnv(name))
        };

        let auth = AuthOptions {
            auth_url: var("AUTH_URL")?,
            username: var("USERNAME")?,
            password: var("PASSWORD")?,
            project_id: var("PROJECT_ID")?,
            user_domain_name: var("USER_DOMAIN_NAME").unwrap_or_else(|_| "Default".into()),
            region: var("REGION_NAME").ok(),
        };
        if let Ok(image) = var("IMAGE_NAME") {
            profile.image_name = image;
        }
        if let Ok(network) = var("PUBLIC_NETWORK") {
            profile.public_network = network;
        }

        let client = OpenStackClient::authenticate(&auth).await?;
        let region = auth.region.clone().unwrap_or_else(|| "default".into());

        Ok(Self {
            auth: Some(auth),
            ..Self::with_client(profile, client, region)
        })
    }

    /// Use an already authenticated client. The token is never refreshed.
    pub fn with_client(
        profile: OpenStackProfile,
        client: OpenStackClient,
        region: impl Into<String>,
    ) -> Self {
        Self {
            profile,
            auth: None,
            client: RwLock::new(client),
            region: region.into(),
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

    pub fn with_renderer(mut self, renderer: Arc<dyn BootScriptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    async fn client(&self) -> Result<OpenStackClient> {
        let current = self.client.read().await.clone();
        let (Some(auth), Some(expires_at)) = (&self.auth, current.expires_at()) else {
            return Ok(current);
        };
        if expires_at - TOKEN_REFRESH_MARGIN > Utc::now() {
            return Ok(current);
        }

        debug!(provider = %self.profile.provider, "openstack: token expiring, re-authenticating");
        let fresh = OpenStackClient::authenticate(auth).await?;
        *self.client.write().await = fresh.clone();
        Ok(fresh)
    }

    fn info(&self, server: &Server) -> Result<ServerInfo> {
        Ok(ServerInfo {
            id: ServerId::new(&server.id)?,
            name: server.name.clone(),
            region: server
                .availability_zone
                .clone()
                .unwrap_or_else(|| self.region.clone()),
            public_ip: server.floating_ip().map(str::to_owned),
            tags: tags::flatten(&server.metadata),
        })
    }

    /// Newest active image whose name contains the profile's image name.
    async fn find_image(&self, client: &OpenStackClient) -> Result<String> {
        let mut best: Option<openstack_api::Image> = None;
        let mut marker: Option<String> = None;

        loop {
            let page = client.list_images(marker.as_deref()).await?;
            marker = page.images.last().map(|i| i.id.clone());

            for image in page.images {
                let name = image.name.as_deref().unwrap_or_default();
                if !name.contains(&self.profile.image_name) || name.contains("vGPU") {
                    continue;
                }
                if best
                    .as_ref()
                    .is_none_or(|b| image.created_at > b.created_at)
                {
                    best = Some(image);
                }
            }

            if page.next.is_none() || marker.is_none() {
                break;
            }
        }

        best.map(|i| i.id).ok_or_else(|| {
            Error::NotFound(format!("image matching {:?}", self.profile.image_name))
        })
    }

    async fn find_flavor(client: &OpenStackClient, size: &str) -> Result<String> {
        client
            .list_flavors()
            .await?
            .into_iter()
            .find(|f| f.name == size)
            .map(|f| f.id)
            .ok_or_else(|| Error::Validation(format!("unknown flavor {size:?}")))
    }

    async fn public_network_id(&self, client: &OpenStackClient) -> Result<String> {
        client
            .find_networks(&self.profile.public_network)
            .await?
            .into_iter()
            .next()
            .map(|n| n.id)
            .ok_or_else(|| {
                Error::NotFound(format!("external network {:?}", self.profile.public_network))
            })
    }

    async fn wait_for_active(&self, client: &OpenStackClient, id: &str, args: &ServerArgs) -> Result<Server> {
        self.boot
            .with_deadline(args.deadline)
            .until("server active", move || async move {
                match client.get_server(id).await {
                    Ok(s) if s.status == "ACTIVE" => Ok(PollStatus::Ready(s)),
                    Ok(s) if s.status == "ERROR" => Ok(PollStatus::Failed(s.status)),
                    Ok(s) => {
                        debug!(server_id = id, status = %s.status, "openstack: waiting for server");
                        Ok(PollStatus::Pending)
                    }
                    Err(e) if e.is_not_found() => Ok(PollStatus::Pending),
                    Err(e) => Err(Error::from(e)),
                }
            })
            .await
    }

    async fn wait_for_deletion(&self, client: &OpenStackClient, id: &str, args: &ServerArgs) -> Result<()> {
        self.teardown
            .with_deadline(args.deadline)
            .until("server deletion", move || async move {
                match client.get_server(id).await {
                    Ok(s) if s.status == "DELETED" => Ok(PollStatus::Ready(())),
                    Ok(s) if s.status == "ERROR" => Ok(PollStatus::Failed(s.status)),
                    Ok(_) => Ok(PollStatus::Pending),
                    Err(e) if e.is_not_found() => Ok(PollStatus::Ready(())),
                    Err(e) => Err(Error::from(e)),
                }
            })
            .await
    }
}

#[async_trait]
impl Automation for OpenStackProvider {
    async fn create_server(&self, args: &ServerArgs) -> Result<ServerInfo> {
        let d = &args.descriptor;
        let client = self.client().await?;
        let tags = TagSet::managed(d);

        if d.spot {
            warn!(provider = %self.profile.provider, "openstack: spot instances unsupported, creating on-demand");
        }
        if d.volume_size_gb > 0 {
            warn!(provider = %self.profile.provider, "openstack: data volumes unsupported, using the root disk");
        }

        let public_key = step("load ssh key", d.ssh.load_public_key()).await?;
        let key_name = d.resource_name(tags::SSH_KEY_SUFFIX);
        step(
            "import ssh key",
            client_call(client.create_keypair(&key_name, &public_key)),
        )
        .await?;

        let image_id = step("resolve image", self.find_image(&client)).await?;
        let flavor_id = step("resolve flavor", Self::find_flavor(&client, &d.size)).await?;

        let sg_name = d.resource_name(tags::SECURITY_GROUP_SUFFIX);
        let group = step(
            "create security group",
            client_call(client.create_security_group(&CreateSecurityGroupRequest {
                name: sg_name.clone(),
                description: format!("{} game server", d.name),
            })),
        )
        .await?;
        for port in derive_firewall_ports(d) {
            let rule = CreateSecurityGroupRuleRequest {
                security_group_id: group.id.clone(),
                direction: "ingress".into(),
                ethertype: "IPv4".into(),
                protocol: port.protocol.as_str().into(),
                port_range_min: port.port,
                port_range_max: port.port,
                remote_ip_prefix: "0.0.0.0/0".into(),
            };
            step(
                "create security group rule",
                client_call(client.create_security_group_rule(&rule)),
            )
            .await?;
        }

        let network = step(
            "create network",
            client_call(client.create_network(&CreateNetworkRequest {
                name: d.resource_name(tags::NETWORK_SUFFIX),
                admin_state_up: true,
            })),
        )
        .await?;
        let subnet = step(
            "create subnet",
            client_call(client.create_subnet(&CreateSubnetRequest {
                name: d.resource_name(tags::SUBNET_SUFFIX),
                network_id: network.id.clone(),
                cidr: SUBNET_CIDR.into(),
                ip_version: 4,
                dns_nameservers: DNS_SERVERS.iter().map(|s| s.to_string()).collect(),
            })),
        )
        .await?;

        let public_net = step("resolve public network", self.public_network_id(&client)).await?;
        let router = step(
            "create router",
            client_call(client.create_router(&CreateRouterRequest {
                name: d.resource_name(tags::ROUTER_SUFFIX),
                admin_state_up: true,
                external_gateway_info: Some(ExternalGateway {
                    network_id: public_net.clone(),
                }),
            })),
        )
        .await?;
        step(
            "attach router interface",
            client_call(client.add_router_interface(&router.id, &subnet.id)),
        )
        .await?;

        let user_data = self.renderer.render(
            d,
            &RenderArgs {
                mount: None,
                ssh_public_key: None,
                variant: variant_for(d, ScriptFormat::CloudConfig),
            },
        )?;

        let created = step(
            "create server",
            client_call(client.create_server(&CreateServerRequest {
                name: d.name.clone(),
                image_ref: image_id,
                flavor_ref: flavor_id,
                key_name: key_name.clone(),
                user_data: Some(BASE64.encode(user_data.as_bytes())),
                metadata: tags.to_map(),
                security_groups: vec![NamedRef {
                    name: sg_name.clone(),
                }],
                networks: vec![NetworkRef {
                    uuid: network.id.clone(),
                }],
            })),
        )
        .await?;
        info!(provider = %self.profile.provider, server_id = %created.id, "openstack: server created");

        let server = step(
            "wait for server",
            self.wait_for_active(&client, &created.id, args),
        )
        .await?;

        let port = step("resolve server port", async {
            client
                .list_ports(&server.id)
                .await
                .map_err(Error::from)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::NoPublicAddress(d.name.clone()))
        })
        .await?;
        let floating = step(
            "allocate floating ip",
            client_call(client.create_floating_ip(&CreateFloatingIpRequest {
                floating_network_id: public_net.clone(),
                port_id: port.id.clone(),
            })),
        )
        .await?;

        info!(
            provider = %self.profile.provider,
            server_id = %server.id,
            public_ip = %floating.floating_ip_address,
            "openstack: server running"
        );

        Ok(ServerInfo {
            public_ip: Some(floating.floating_ip_address),
            ..self.info(&server)?
        })
    }

    async fn get_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<ServerInfo> {
        let client = self.client().await?;
        let server = client.get_server(id.primary()).await?;
        if !tags::is_managed(&server.metadata) {
            return Err(Error::NotFound(format!("server {id} is not managed")));
        }
        self.info(&server)
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let client = self.client().await?;
        let mut servers = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = client.list_servers(marker.as_deref()).await?;
            marker = page.servers.last().map(|s| s.id.clone());

            for server in &page.servers {
                if tags::is_managed(&server.metadata) {
                    servers.push(self.info(server)?);
                }
            }

            if !page.has_more || marker.is_none() {
                break;
            }
        }

        Ok(servers)
    }

    async fn delete_server(&self, id: &ServerId, args: &ServerArgs) -> Result<()> {
        let d = &args.descriptor;
        let client = self.client().await?;
        let mut td = Teardown::new(&d.name);

        let ports = td
            .step("find server ports", client_call(client.list_ports(id.primary())))
            .await?
            .unwrap_or_default();
        for port in &ports {
            let ips = td
                .step("find floating ips", client_call(client.list_floating_ips(&port.id)))
                .await?
                .unwrap_or_default();
            for ip in ips {
                td.step("release floating ip", client_call(client.delete_floating_ip(&ip.id)))
                    .await?;
            }
        }

        if td
            .step("delete server", client_call(client.delete_server(id.primary())))
            .await?
            .is_some()
        {
            td.step(
                "wait for server deletion",
                self.wait_for_deletion(&client, id.primary(), args),
            )
            .await?;
        }

        let groups = td
            .step(
                "find security groups",
                client_call(client.find_security_groups(&d.resource_name(tags::SECURITY_GROUP_SUFFIX))),
            )
            .await?
            .unwrap_or_default();
        for group in groups {
            td.step("delete security group", client_call(client.delete_security_group(&group.id)))
                .await?;
        }

        let subnets = td
            .step(
                "find subnets",
                client_call(client.find_subnets(&d.resource_name(tags::SUBNET_SUFFIX))),
            )
            .await?
            .unwrap_or_default();
        let routers = td
            .step(
                "find routers",
                client_call(client.find_routers(&d.resource_name(tags::ROUTER_SUFFIX))),
            )
            .await?
            .unwrap_or_default();
        for router in &routers {
            for subnet in &subnets {
                td.step(
                    "detach router interface",
                    client_call(client.remove_router_interface(&router.id, &subnet.id)),
                )
                .await?;
            }
            td.step("delete router", client_call(client.delete_router(&router.id)))
                .await?;
        }
        for subnet in &subnets {
            td.step("delete subnet", client_call(client.delete_subnet(&subnet.id)))
                .await?;
        }

        let networks = td
            .step(
                "find networks",
                client_call(client.find_networks(&d.resource_name(tags::NETWORK_SUFFIX))),
            )
            .await?
            .unwrap_or_default();
        for network in networks {
            td.step("delete network", client_call(client.delete_network(&network.id)))
                .await?;
        }

        td.step(
            "delete ssh key",
            client_call(client.delete_keypair(&d.resource_name(tags::SSH_KEY_SUFFIX))),
        )
        .await?;

        info!(provider = %self.profile.provider, server_id = %id, "openstack: server deleted");
        td.finish()
    }

    fn name(&self) -> ProviderName {
        self.profile.provider
    }

    fn ssh_user(&self) -> &str {
        "ubuntu"
    }

    fn renderer(&self) -> &dyn BootScriptRenderer {
        self.renderer.as_ref()
    }
}

/// Lift a client call into the crate error type.
async fn client_call<T>(fut: impl Future<Output = openstack_api::Result<T>>) -> Result<T> {
    Ok(fut.await?)
}
