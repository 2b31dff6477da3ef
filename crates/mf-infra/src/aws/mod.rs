//! AWS EC2 backend.
//!
//! Every server gets its own VPC, subnet, internet gateway and route table,
//! plus one security group per opened port. Spot servers carry the spot
//! request id as the secondary part of their [`ServerId`].

mod ec2;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info, warn};

use crate::id::ServerId;
use crate::pipeline::{Teardown, step};
use crate::poll::{BOOT_TIMEOUT, PollStatus, Poller, RESOURCE_TIMEOUT};
use crate::ports::{FirewallPort, derive_firewall_ports};
use crate::tags::{self, TagSet};
use crate::template::{
    BootScriptRenderer, CloudInitRenderer, RenderArgs, ScriptFormat, variant_for,
};
use crate::types::{ServerArgs, ServerInfo};
use crate::{Automation, Error, ProviderName, Result};

use ec2::SdkEc2;

const VPC_CIDR: &str = "172.16.0.0/16";
const SUBNET_CIDR: &str = "172.16.10.0/24";

// ── EC2 seam ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Other(String),
}

impl InstanceState {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub vpc_id: Option<String>,
    pub spot_request_id: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl Instance {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SpotRequest {
    pub state: String,
    pub instance_id: Option<String>,
}

/// Everything needed to launch one instance, on-demand or spot.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    /// Base64 encoded.
    pub user_data: String,
    /// Root volume size in GB; 0 keeps the image default.
    pub volume_size_gb: u32,
    pub tags: TagSet,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// The EC2 calls the backend makes. Missing resources surface as
/// [`Error::NotFound`].
#[async_trait]
pub(crate) trait Ec2Api: Send + Sync {
    /// Newest Ubuntu 22.04 minimal image for the architecture.
    async fn lookup_image(&self, arch: &str) -> Result<String>;
    async fn import_key_pair(&self, name: &str, public_key: &str, tags: &TagSet) -> Result<()>;
    async fn delete_key_pair(&self, name: &str) -> Result<()>;

    async fn create_vpc(&self, cidr: &str, tags: &TagSet) -> Result<String>;
    async fn create_subnet(&self, vpc_id: &str, cidr: &str, tags: &TagSet) -> Result<String>;
    /// Create a gateway and attach it to the VPC.
    async fn create_internet_gateway(&self, vpc_id: &str, tags: &TagSet) -> Result<String>;
    /// Create a route table with a default route through the gateway and
    /// associate it with the subnet.
    async fn create_route_table(
        &self,
        vpc_id: &str,
        subnet_id: &str,
        gateway_id: &str,
        tags: &TagSet,
    ) -> Result<String>;
    /// Create a group that admits one port from anywhere.
    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        port: FirewallPort,
        tags: &TagSet,
    ) -> Result<String>;

    async fn run_instance(&self, spec: &LaunchSpec) -> Result<String>;
    /// Returns the spot request id.
    async fn request_spot_instance(&self, spec: &LaunchSpec) -> Result<String>;
    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequest>;
    async fn cancel_spot_request(&self, request_id: &str) -> Result<()>;
    async fn tag_resource(&self, resource_id: &str, tags: &TagSet) -> Result<()>;

    async fn describe_instance(&self, id: &str) -> Result<Instance>;
    /// One page of instances carrying the marker tag.
    async fn list_instances(&self, next_token: Option<&str>) -> Result<Page<Instance>>;
    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Managed VPCs whose `Name` tag is `name`.
    async fn find_vpcs(&self, name: &str) -> Result<Vec<String>>;
    /// Non-default security groups of the VPC.
    async fn list_security_groups(&self, vpc_id: &str) -> Result<Vec<String>>;
    async fn delete_security_group(&self, id: &str) -> Result<()>;
    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<String>>;
    async fn delete_subnet(&self, id: &str) -> Result<()>;
    async fn list_internet_gateways(&self, vpc_id: &str) -> Result<Vec<String>>;
    /// Detach from the VPC, then delete.
    async fn delete_internet_gateway(&self, id: &str, vpc_id: &str) -> Result<()>;
    /// Route tables of the VPC other than the main one.
    async fn list_route_tables(&self, vpc_id: &str) -> Result<Vec<String>>;
    async fn delete_route_table(&self, id: &str) -> Result<()>;
    async fn delete_vpc(&self, id: &str) -> Result<()>;
}

// ── Provider ────────────────────────────────────────────────────────

pub struct AwsProvider {
    ec2: Arc<dyn Ec2Api>,
    region: String,
    renderer: Arc<dyn BootScriptRenderer>,
    boot: Poller,
    resource: Poller,
}

impl AwsProvider {
    /// Build from the environment:
    ///
    /// - `AWS_REGION` (required)
    /// - credentials from the standard AWS provider chain
    pub async fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let region = std::env::var("AWS_REGION")
            .map_err(|_| Error::MissingEnv("AWS_REGION".into()))?;

        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_types::region::Region::new(region.clone()))
            .load()
            .await;
        let client = aws_sdk_ec2::Client::new(&config);

        Ok(Self::with_api(Arc::new(SdkEc2::new(client)), region))
    }

    pub(crate) fn with_api(ec2: Arc<dyn Ec2Api>, region: impl Into<String>) -> Self {
        Self {
            ec2,
            region: region.into(),
            renderer: Arc::new(CloudInitRenderer),
            boot: Poller::new(Duration::from_secs(10), BOOT_TIMEOUT),
            resource: Poller::new(Duration::from_secs(2), RESOURCE_TIMEOUT),
        }
    }

    pub fn with_pollers(mut self, boot: Poller, resource: Poller) -> Self {
        self.boot = boot;
        self.resource = resource;
        self
    }

    fn info(&self, id: ServerId, instance: &Instance) -> ServerInfo {
        ServerInfo {
            id,
            name: instance.tag(tags::NAME_TAG).unwrap_or_default().to_string(),
            region: self.region.clone(),
            public_ip: instance.public_ip.clone(),
            tags: tags::flatten(instance.tags.iter().map(|(k, v)| (k, v))),
        }
    }

    fn is_managed(instance: &Instance) -> bool {
        tags::is_managed(instance.tags.iter().map(|(k, v)| (k, v)))
    }

    /// Request a spot instance and tag it once the request is fulfilled.
    async fn launch_spot(&self, spec: &LaunchSpec, args: &ServerArgs) -> Result<ServerId> {
        let ec2 = self.ec2.as_ref();

        let request_id = step("request spot instance", ec2.request_spot_instance(spec)).await?;
        info!(request_id = %request_id, "aws: spot instance requested");

        let request = request_id.as_str();
        let instance_id = step(
            "wait for spot fulfilment",
            self.resource
                .with_deadline(args.deadline)
                .until("spot request fulfilled", move || async move {
                    // A fresh request id can lag behind in DescribeSpotInstanceRequests.
                    let req = match ec2.describe_spot_request(request).await {
                        Ok(req) => req,
                        Err(e) if e.is_not_found() => {
                            debug!(request_id = request, "aws: spot request not yet visible");
                            return Ok(PollStatus::Pending);
                        }
                        Err(e) => return Err(e),
                    };
                    Ok(match req.instance_id {
                        Some(id) => PollStatus::Ready(id),
                        None if matches!(req.state.as_str(), "cancelled" | "failed" | "closed") => {
                            PollStatus::Failed(req.state)
                        }
                        None => PollStatus::Pending,
                    })
                }),
        )
        .await?;

        // Spot requests do not propagate their tags to the instance, and
        // the new instance id is not taggable until EC2 has registered it.
        let (instance, tags) = (instance_id.as_str(), &spec.tags);
        step(
            "tag spot instance",
            self.resource
                .with_deadline(args.deadline)
                .until("spot instance tagged", move || async move {
                    match ec2.tag_resource(instance, tags).await {
                        Ok(()) => Ok(PollStatus::Ready(())),
                        Err(e) if e.is_not_found() => {
                            debug!(instance_id = instance, "aws: instance not yet taggable");
                            Ok(PollStatus::Pending)
                        }
                        Err(e) => Err(e),
                    }
                }),
        )
        .await?;

        ServerId::compound(instance_id, request_id)
    }

    /// Wait until the instance runs with a public address.
    async fn wait_for_running(&self, instance_id: &str, args: &ServerArgs) -> Result<Instance> {
        let ec2 = self.ec2.as_ref();
        let waited = self
            .boot
            .with_deadline(args.deadline)
            .until("instance running", move || async move {
                match ec2.describe_instance(instance_id).await {
                    Ok(i) if i.state == InstanceState::Running && i.public_ip.is_some() => {
                        Ok(PollStatus::Ready(i))
                    }
                    Ok(i) if matches!(
                        i.state,
                        InstanceState::ShuttingDown | InstanceState::Terminated
                    ) =>
                    {
                        Ok(PollStatus::Failed(i.state.as_str().to_string()))
                    }
                    Ok(_) => Ok(PollStatus::Pending),
                    Err(e) if e.is_not_found() => Ok(PollStatus::Pending),
                    Err(e) => Err(e),
                }
            })
            .await;

        match waited {
            Err(e) if e.is_timeout() => match ec2.describe_instance(instance_id).await {
                Ok(i) if i.state == InstanceState::Running => {
                    Err(Error::NoPublicAddress(instance_id.to_string()))
                }
                _ => Err(e),
            },
            other => other,
        }
    }

    async fn wait_for_termination(&self, instance_id: &str, args: &ServerArgs) -> Result<()> {
        let ec2 = self.ec2.as_ref();
        self.resource
            .with_deadline(args.deadline)
            .until("instance terminated", move || async move {
                match ec2.describe_instance(instance_id).await {
                    Ok(i) if i.state == InstanceState::Terminated => Ok(PollStatus::Ready(())),
                    Ok(_) => Ok(PollStatus::Pending),
                    Err(e) if e.is_not_found() => Ok(PollStatus::Ready(())),
                    Err(e) => Err(e),
                }
            })
            .await
    }
}

#[async_trait]
impl Automation for AwsProvider {
    async fn create_server(&self, args: &ServerArgs) -> Result<ServerInfo> {
        let d = &args.descriptor;
        let ec2 = self.ec2.as_ref();
        let tags = TagSet::for_server(d);

        let public_key = step("load ssh key", d.ssh.load_public_key()).await?;
        let key_name = d.resource_name(tags::SSH_KEY_SUFFIX);
        step(
            "import ssh key",
            ec2.import_key_pair(&key_name, &public_key, &tags),
        )
        .await?;

        let arch = if d.arm { "arm64" } else { "x86_64" };
        let image_id = step("lookup image", ec2.lookup_image(arch)).await?;

        let vpc_id = step("create vpc", ec2.create_vpc(VPC_CIDR, &tags)).await?;
        let subnet_id = step(
            "create subnet",
            ec2.create_subnet(&vpc_id, SUBNET_CIDR, &tags),
        )
        .await?;
        let gateway_id = step(
            "create internet gateway",
            ec2.create_internet_gateway(&vpc_id, &tags),
        )
        .await?;
        step(
            "create route table",
            ec2.create_route_table(&vpc_id, &subnet_id, &gateway_id, &tags),
        )
        .await?;

        let mut security_group_ids = Vec::new();
        for port in derive_firewall_ports(d) {
            let name = format!("{}-{}", tags::MARKER_TAG, uuid::Uuid::new_v4());
            let id = step(
                "create security group",
                ec2.create_security_group(&vpc_id, &name, port, &tags),
            )
            .await?;
            debug!(group_id = %id, port = %port, "aws: security group created");
            security_group_ids.push(id);
        }

        let user_data = self.renderer.render(
            d,
            &RenderArgs {
                mount: None,
                ssh_public_key: None,
                variant: variant_for(d, ScriptFormat::CloudConfig),
            },
        )?;

        let spec = LaunchSpec {
            image_id,
            instance_type: d.size.clone(),
            key_name,
            subnet_id,
            security_group_ids,
            user_data: BASE64.encode(user_data.as_bytes()),
            volume_size_gb: d.volume_size_gb,
            tags: tags.clone(),
        };

        let id = if d.spot {
            self.launch_spot(&spec, args).await?
        } else {
            ServerId::new(step("run instance", ec2.run_instance(&spec)).await?)?
        };
        info!(server_id = %id, "aws: instance launched");

        let instance = step(
            "wait for instance",
            self.wait_for_running(id.primary(), args),
        )
        .await?;

        info!(
            server_id = %id,
            public_ip = instance.public_ip.as_deref().unwrap_or_default(),
            "aws: instance running"
        );

        Ok(ServerInfo {
            id,
            name: d.name.clone(),
            region: self.region.clone(),
            public_ip: instance.public_ip,
            tags: tags.flatten(),
        })
    }

    async fn get_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<ServerInfo> {
        let instance = self.ec2.describe_instance(id.primary()).await?;
        if !Self::is_managed(&instance) {
            return Err(Error::NotFound(format!("instance {id} is not managed")));
        }
        if instance.state == InstanceState::Terminated {
            return Err(Error::NotFound(format!("instance {id} is terminated")));
        }
        Ok(self.info(id.clone(), &instance))
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
        let mut servers = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self.ec2.list_instances(next_token.as_deref()).await?;

            for instance in &page.items {
                if instance.state == InstanceState::Terminated || !Self::is_managed(instance) {
                    continue;
                }
                let id = match &instance.spot_request_id {
                    Some(request) => ServerId::compound(&instance.id, request)?,
                    None => ServerId::new(&instance.id)?,
                };
                servers.push(self.info(id, instance));
            }

            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        Ok(servers)
    }

    async fn delete_server(&self, id: &ServerId, args: &ServerArgs) -> Result<()> {
        let d = &args.descriptor;
        let ec2 = self.ec2.as_ref();
        let mut td = Teardown::new(&d.name);

        if let Some(request_id) = id.secondary() {
            td.step("cancel spot request", ec2.cancel_spot_request(request_id))
                .await?;
        }

        let instance = td
            .step("describe instance", ec2.describe_instance(id.primary()))
            .await?;
        if let Some(instance) = &instance {
            if instance.state != InstanceState::Terminated {
                td.step("terminate instance", ec2.terminate_instance(id.primary()))
                    .await?;
            }
            td.step(
                "wait for termination",
                self.wait_for_termination(id.primary(), args),
            )
            .await?;
        }

        let mut vpcs = td
            .step("find vpcs", ec2.find_vpcs(&d.name))
            .await?
            .unwrap_or_default();
        if let Some(vpc) = instance.and_then(|i| i.vpc_id) {
            if !vpcs.contains(&vpc) {
                vpcs.push(vpc);
            }
        }

        for vpc in &vpcs {
            let groups = td
                .step("find security groups", ec2.list_security_groups(vpc))
                .await?
                .unwrap_or_default();
            for group in groups {
                td.step("delete security group", ec2.delete_security_group(&group))
                    .await?;
            }

            let subnets = td
                .step("find subnets", ec2.list_subnets(vpc))
                .await?
                .unwrap_or_default();
            for subnet in subnets {
                td.step("delete subnet", ec2.delete_subnet(&subnet)).await?;
            }

            let gateways = td
                .step("find internet gateways", ec2.list_internet_gateways(vpc))
                .await?
                .unwrap_or_default();
            for gateway in gateways {
                td.step(
                    "delete internet gateway",
                    ec2.delete_internet_gateway(&gateway, vpc),
                )
                .await?;
            }

            let tables = td
                .step("find route tables", ec2.list_route_tables(vpc))
                .await?
                .unwrap_or_default();
            for table in tables {
                td.step("delete route table", ec2.delete_route_table(&table))
                    .await?;
            }

            td.step("delete vpc", ec2.delete_vpc(vpc)).await?;
        }

        if vpcs.is_empty() {
            warn!(server = %d.name, "aws: no vpc found for server");
        }

        td.step(
            "delete ssh key",
            ec2.delete_key_pair(&d.resource_name(tags::SSH_KEY_SUFFIX)),
        )
        .await?;

        info!(server_id = %id, "aws: server deleted");
        td.finish()
    }

    fn name(&self) -> ProviderName {
        ProviderName::Aws
    }

    fn ssh_user(&self) -> &str {
        "ubuntu"
    }

    fn renderer(&self) -> &dyn BootScriptRenderer {
        self.renderer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::types::Edition;
    use crate::types::fixtures::args;

    /// In-memory EC2 that records every call in order.
    #[derive(Default)]
    struct FakeEc2 {
        calls: Mutex<Vec<String>>,
        instances: Mutex<HashMap<String, Instance>>,
        vpcs: Mutex<Vec<String>>,
        /// Address given to launched instances.
        public_ip: Option<String>,
        /// Tag attempts to reject before the instance becomes taggable.
        untaggable: Mutex<u32>,
        /// Spot request lookups to answer with NotFound before the request shows up.
        unknown_spot_requests: Mutex<u32>,
        launched: Mutex<Option<LaunchSpec>>,
    }

    impl FakeEc2 {
        fn with_ip(ip: &str) -> Self {
            Self {
                public_ip: Some(ip.into()),
                ..Self::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn position(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .position(|c| c.starts_with(prefix))
                .unwrap_or_else(|| panic!("no call starting with {prefix:?}"))
        }

        fn launch(&self, spec: &LaunchSpec, spot_request: Option<&str>) -> String {
            let tagged = spot_request.is_none();
            let instance = Instance {
                id: "i-1".into(),
                state: InstanceState::Running,
                public_ip: self.public_ip.clone(),
                vpc_id: Some("vpc-1".into()),
                spot_request_id: spot_request.map(str::to_owned),
                tags: if tagged {
                    spec.tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
                } else {
                    Vec::new()
                },
            };
            *self.launched.lock().unwrap() = Some(spec.clone());
            self.instances.lock().unwrap().insert("i-1".into(), instance);
            "i-1".into()
        }
    }

    #[async_trait]
    impl Ec2Api for FakeEc2 {
        async fn lookup_image(&self, arch: &str) -> Result<String> {
            self.record(format!("lookup image {arch}"));
            Ok(format!("ami-{arch}"))
        }

        async fn import_key_pair(&self, name: &str, _public_key: &str, _tags: &TagSet) -> Result<()> {
            self.record(format!("import key {name}"));
            Ok(())
        }

        async fn delete_key_pair(&self, name: &str) -> Result<()> {
            self.record(format!("delete key {name}"));
            Ok(())
        }

        async fn create_vpc(&self, cidr: &str, _tags: &TagSet) -> Result<String> {
            self.record(format!("create vpc {cidr}"));
            self.vpcs.lock().unwrap().push("vpc-1".into());
            Ok("vpc-1".into())
        }

        async fn create_subnet(&self, vpc_id: &str, cidr: &str, _tags: &TagSet) -> Result<String> {
            self.record(format!("create subnet {vpc_id} {cidr}"));
            Ok("subnet-1".into())
        }

        async fn create_internet_gateway(&self, vpc_id: &str, _tags: &TagSet) -> Result<String> {
            self.record(format!("create gateway {vpc_id}"));
            Ok("igw-1".into())
        }

        async fn create_route_table(
            &self,
            vpc_id: &str,
            subnet_id: &str,
            gateway_id: &str,
            _tags: &TagSet,
        ) -> Result<String> {
            self.record(format!("create route table {vpc_id} {subnet_id} {gateway_id}"));
            Ok("rtb-1".into())
        }

        async fn create_security_group(
            &self,
            _vpc_id: &str,
            name: &str,
            port: FirewallPort,
            _tags: &TagSet,
        ) -> Result<String> {
            assert!(name.starts_with("mcfleet-"));
            self.record(format!("create security group {port}"));
            Ok(format!("sg-{}", port.port))
        }

        async fn run_instance(&self, spec: &LaunchSpec) -> Result<String> {
            self.record(format!("run instance {}", spec.instance_type));
            Ok(self.launch(spec, None))
        }

        async fn request_spot_instance(&self, spec: &LaunchSpec) -> Result<String> {
            self.record(format!("request spot {}", spec.instance_type));
            self.launch(spec, Some("sir-1"));
            Ok("sir-1".into())
        }

        async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequest> {
            self.record(format!("describe spot {request_id}"));
            let mut unknown = self.unknown_spot_requests.lock().unwrap();
            if *unknown > 0 {
                *unknown -= 1;
                return Err(Error::NotFound(format!("spot request {request_id}")));
            }
            Ok(SpotRequest {
                state: "active".into(),
                instance_id: Some("i-1".into()),
            })
        }

        async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
            self.record(format!("cancel spot {request_id}"));
            Ok(())
        }

        async fn tag_resource(&self, resource_id: &str, tags: &TagSet) -> Result<()> {
            self.record(format!("tag {resource_id}"));
            let mut untaggable = self.untaggable.lock().unwrap();
            if *untaggable > 0 {
                *untaggable -= 1;
                return Err(Error::NotFound(format!("instance {resource_id}")));
            }
            if let Some(i) = self.instances.lock().unwrap().get_mut(resource_id) {
                i.tags = tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            }
            Ok(())
        }

        async fn describe_instance(&self, id: &str) -> Result<Instance> {
            self.instances
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))
        }

        async fn list_instances(&self, next_token: Option<&str>) -> Result<Page<Instance>> {
            self.record(format!("list instances {}", next_token.unwrap_or("-")));
            let all: Vec<Instance> = self.instances.lock().unwrap().values().cloned().collect();
            Ok(match next_token {
                None => Page {
                    items: all.iter().take(1).cloned().collect(),
                    next_token: (all.len() > 1).then(|| "page-2".into()),
                },
                Some(_) => Page {
                    items: all.into_iter().skip(1).collect(),
                    next_token: None,
                },
            })
        }

        async fn terminate_instance(&self, id: &str) -> Result<()> {
            self.record(format!("terminate {id}"));
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
            instance.state = InstanceState::Terminated;
            Ok(())
        }

        async fn find_vpcs(&self, _name: &str) -> Result<Vec<String>> {
            Ok(self.vpcs.lock().unwrap().clone())
        }

        async fn list_security_groups(&self, vpc_id: &str) -> Result<Vec<String>> {
            Ok(self.vpc_children(vpc_id, &["sg-22", "sg-25565"]))
        }

        async fn delete_security_group(&self, id: &str) -> Result<()> {
            self.record(format!("delete security group {id}"));
            Ok(())
        }

        async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<String>> {
            Ok(self.vpc_children(vpc_id, &["subnet-1"]))
        }

        async fn delete_subnet(&self, id: &str) -> Result<()> {
            self.record(format!("delete subnet {id}"));
            Ok(())
        }

        async fn list_internet_gateways(&self, vpc_id: &str) -> Result<Vec<String>> {
            Ok(self.vpc_children(vpc_id, &["igw-1"]))
        }

        async fn delete_internet_gateway(&self, id: &str, vpc_id: &str) -> Result<()> {
            self.record(format!("delete gateway {id} {vpc_id}"));
            Ok(())
        }

        async fn list_route_tables(&self, vpc_id: &str) -> Result<Vec<String>> {
            Ok(self.vpc_children(vpc_id, &["rtb-1"]))
        }

        async fn delete_route_table(&self, id: &str) -> Result<()> {
            self.record(format!("delete route table {id}"));
            Ok(())
        }

        async fn delete_vpc(&self, id: &str) -> Result<()> {
            let mut vpcs = self.vpcs.lock().unwrap();
            if !vpcs.iter().any(|v| v == id) {
                return Err(Error::NotFound(format!("vpc {id}")));
            }
            self.record(format!("delete vpc {id}"));
            vpcs.retain(|v| v != id);
            Ok(())
        }
    }

    impl FakeEc2 {
        fn vpc_children(&self, vpc_id: &str, ids: &[&str]) -> Vec<String> {
            if self.vpcs.lock().unwrap().iter().any(|v| v == vpc_id) {
                ids.iter().map(|s| s.to_string()).collect()
            } else {
                Vec::new()
            }
        }
    }

    fn provider(fake: Arc<FakeEc2>) -> AwsProvider {
        let fast = Poller::new(Duration::from_millis(1), Duration::from_secs(5));
        AwsProvider::with_api(fake, "eu-central-1").with_pollers(fast, fast)
    }

    #[tokio::test]
    async fn creates_network_groups_and_instance() {
        let fake = Arc::new(FakeEc2::with_ip("198.51.100.7"));
        let mut a = args("lobby", Edition::Java);
        a.descriptor.rcon.enabled = true;
        a.descriptor.rcon.password = "hunter2".into();
        a.descriptor.monitoring = true;
        a.descriptor.volume_size_gb = 40;

        let info = provider(fake.clone()).create_server(&a).await.unwrap();

        assert_eq!(info.id.to_string(), "i-1");
        assert_eq!(info.public_ip.as_deref(), Some("198.51.100.7"));
        assert_eq!(info.tags, "Name=lobby,java=true,mcfleet=true");

        let groups: Vec<String> = fake
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("create security group"))
            .collect();
        assert_eq!(
            groups,
            [
                "create security group 22/tcp",
                "create security group 25565/tcp",
                "create security group 25575/tcp",
                "create security group 9090/tcp",
            ]
        );
        assert!(fake.position("create route table") < fake.position("run instance"));

        let spec = fake.launched.lock().unwrap().clone().unwrap();
        assert_eq!(spec.image_id, "ami-x86_64");
        assert_eq!(spec.volume_size_gb, 40);
        assert_eq!(spec.security_group_ids.len(), 4);
        let script = String::from_utf8(BASE64.decode(&spec.user_data).unwrap()).unwrap();
        assert!(script.starts_with("#cloud-config"));
    }

    #[tokio::test]
    async fn arm_servers_use_arm_images() {
        let fake = Arc::new(FakeEc2::with_ip("198.51.100.7"));
        let mut a = args("lobby", Edition::Bedrock);
        a.descriptor.arm = true;

        provider(fake.clone()).create_server(&a).await.unwrap();
        assert!(fake.calls().contains(&"lookup image arm64".to_string()));
    }

    #[tokio::test]
    async fn spot_servers_get_compound_ids_and_late_tags() {
        let fake = Arc::new(FakeEc2::with_ip("198.51.100.7"));
        *fake.untaggable.lock().unwrap() = 2;
        let mut a = args("lobby", Edition::Papermc);
        a.descriptor.spot = true;

        let info = provider(fake.clone()).create_server(&a).await.unwrap();

        assert_eq!(info.id.to_string(), "i-1#sir-1");
        let tag_attempts = fake.calls().iter().filter(|c| *c == "tag i-1").count();
        assert_eq!(tag_attempts, 3);
        assert!(!fake.calls().iter().any(|c| c.starts_with("run instance")));

        let listed = provider(fake.clone()).list_servers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, info.id);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_requests_not_yet_visible_are_waited_for() {
        let fake = Arc::new(FakeEc2::with_ip("198.51.100.7"));
        *fake.unknown_spot_requests.lock().unwrap() = 2;
        let mut a = args("lobby", Edition::Papermc);
        a.descriptor.spot = true;

        let info = provider(fake.clone()).create_server(&a).await.unwrap();

        assert_eq!(info.id.to_string(), "i-1#sir-1");
        let lookups = fake.calls().iter().filter(|c| *c == "describe spot sir-1").count();
        assert_eq!(lookups, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_public_address_is_reported() {
        let fake = Arc::new(FakeEc2::default());
        let err = provider(fake)
            .create_server(&args("lobby", Edition::Java))
            .await
            .unwrap_err();

        assert_eq!(err.step(), Some("wait for instance"));
        assert!(matches!(err.root(), Error::NoPublicAddress(_)));
    }

    #[tokio::test]
    async fn spot_teardown_cancels_before_terminating() {
        let fake = Arc::new(FakeEc2::with_ip("198.51.100.7"));
        let mut a = args("lobby", Edition::Java);
        a.descriptor.spot = true;
        let p = provider(fake.clone());
        let info = p.create_server(&a).await.unwrap();

        p.delete_server(&info.id, &a).await.unwrap();

        assert!(fake.position("cancel spot sir-1") < fake.position("terminate i-1"));
        assert!(fake.position("terminate i-1") < fake.position("delete security group"));
        assert!(fake.position("delete subnet") < fake.position("delete gateway"));
        assert!(fake.position("delete route table") < fake.position("delete vpc"));
        assert!(fake.position("delete vpc") < fake.position("delete key lobby-ssh"));
    }

    #[tokio::test]
    async fn teardown_can_be_repeated() {
        let fake = Arc::new(FakeEc2::with_ip("198.51.100.7"));
        let a = args("lobby", Edition::Java);
        let p = provider(fake.clone());
        let info = p.create_server(&a).await.unwrap();

        p.delete_server(&info.id, &a).await.unwrap();
        let err = p.get_server(&info.id, &a).await.unwrap_err();
        assert!(err.is_not_found());
        p.delete_server(&info.id, &a).await.unwrap();

        let terminations = fake.calls().iter().filter(|c| c.starts_with("terminate")).count();
        let vpc_deletions = fake.calls().iter().filter(|c| c.starts_with("delete vpc")).count();
        assert_eq!(terminations, 1);
        assert_eq!(vpc_deletions, 1);
    }

    #[tokio::test]
    async fn unmanaged_instances_are_invisible() {
        let fake = Arc::new(FakeEc2::default());
        fake.instances.lock().unwrap().insert(
            "i-9".into(),
            Instance {
                id: "i-9".into(),
                state: InstanceState::Running,
                public_ip: None,
                vpc_id: None,
                spot_request_id: None,
                tags: vec![("Name".into(), "lobby".into())],
            },
        );
        let p = provider(fake);

        let err = p
            .get_server(&ServerId::new("i-9").unwrap(), &args("lobby", Edition::Java))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(p.list_servers().await.unwrap().is_empty());
    }
}
