use async_trait::async_trait;
use aws_sdk_ec2 as ec2;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::primitives::Blob;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, Filter, InstanceNetworkInterfaceSpecification,
    InstanceType, RequestSpotLaunchSpecification, ResourceType, Tag, TagSpecification,
};
use chrono::DateTime;
use tracing::debug;

use super::{Ec2Api, Instance, InstanceState, LaunchSpec, Page, SpotRequest};
use crate::ports::FirewallPort;
use crate::tags::{self, TagSet};
use crate::{Error, Result};

/// Canonical's account, owner of the official Ubuntu images.
const CANONICAL_OWNER: &str = "099720109477";
const UBUNTU_IMAGE_PATTERN: &str = "ubuntu-minimal/images/hvm-ssd/ubuntu-jammy-22.04*";
const ROOT_DEVICE: &str = "/dev/sda1";

/// [`Ec2Api`] over the AWS SDK client.
pub struct SdkEc2 {
    client: ec2::Client,
}

impl SdkEc2 {
    pub fn new(client: ec2::Client) -> Self {
        Self { client }
    }
}

/// Map an SDK failure, turning `*.NotFound` error codes into [`Error::NotFound`].
fn sdk_error<E, R>(what: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{what}: {}", DisplayErrorContext(&err));
    match err.code() {
        Some(code) if code.ends_with(".NotFound") => Error::NotFound(message),
        _ => Error::Provider(message),
    }
}

fn missing(what: &str) -> Error {
    Error::Provider(format!("{what}: response carried no id"))
}

fn sdk_tags(tags: &TagSet) -> Vec<Tag> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect()
}

fn tag_spec(resource: ResourceType, tags: &TagSet) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(sdk_tags(tags)))
        .build()
}

fn filter(name: &str, value: impl Into<String>) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn marker_filter() -> Filter {
    filter(&format!("tag:{}", tags::MARKER_TAG), tags::MARKER_VALUE)
}

fn network_interface(spec: &LaunchSpec) -> InstanceNetworkInterfaceSpecification {
    InstanceNetworkInterfaceSpecification::builder()
        .device_index(0)
        .associate_public_ip_address(true)
        .delete_on_termination(true)
        .subnet_id(&spec.subnet_id)
        .set_groups(Some(spec.security_group_ids.clone()))
        .build()
}

/// Root volume override, only when a size was requested.
fn block_devices(volume_size_gb: u32) -> Option<Vec<BlockDeviceMapping>> {
    (volume_size_gb > 0).then(|| {
        vec![
            BlockDeviceMapping::builder()
                .device_name(ROOT_DEVICE)
                .ebs(
                    EbsBlockDevice::builder()
                        .volume_size(volume_size_gb as i32)
                        .delete_on_termination(true)
                        .build(),
                )
                .build(),
        ]
    })
}

fn convert_instance(i: &ec2::types::Instance) -> Option<Instance> {
    Some(Instance {
        id: i.instance_id()?.to_string(),
        state: i
            .state()
            .and_then(|s| s.name())
            .map(|n| InstanceState::parse(n.as_str()))
            .unwrap_or(InstanceState::Pending),
        public_ip: i.public_ip_address().map(str::to_owned),
        vpc_id: i.vpc_id().map(str::to_owned),
        spot_request_id: i.spot_instance_request_id().map(str::to_owned),
        tags: i
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string())))
            .collect(),
    })
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn lookup_image(&self, arch: &str) -> Result<String> {
        let out = self
            .client
            .describe_images()
            .owners(CANONICAL_OWNER)
            .filters(filter("name", UBUNTU_IMAGE_PATTERN))
            .filters(filter("architecture", arch))
            .send()
            .await
            .map_err(|e| sdk_error("describe images", e))?;

        out.images()
            .iter()
            .filter_map(|img| {
                let created = DateTime::parse_from_rfc3339(img.creation_date()?).ok()?;
                Some((created, img.image_id()?))
            })
            .max_by_key(|(created, _)| *created)
            .map(|(_, id)| id.to_string())
            .ok_or_else(|| Error::NotFound(format!("ubuntu 22.04 image for {arch}")))
    }

    async fn import_key_pair(&self, name: &str, public_key: &str, tags: &TagSet) -> Result<()> {
        self.client
            .import_key_pair()
            .key_name(name)
            .public_key_material(Blob::new(public_key.as_bytes()))
            .tag_specifications(tag_spec(ResourceType::KeyPair, tags))
            .send()
            .await
            .map_err(|e| sdk_error("import key pair", e))?;
        Ok(())
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        self.client
            .delete_key_pair()
            .key_name(name)
            .send()
            .await
            .map_err(|e| sdk_error("delete key pair", e))?;
        Ok(())
    }

    async fn create_vpc(&self, cidr: &str, tags: &TagSet) -> Result<String> {
        let out = self
            .client
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(tag_spec(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(|e| sdk_error("create vpc", e))?;

        out.vpc()
            .and_then(|v| v.vpc_id())
            .map(str::to_owned)
            .ok_or_else(|| missing("create vpc"))
    }

    async fn create_subnet(&self, vpc_id: &str, cidr: &str, tags: &TagSet) -> Result<String> {
        let out = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr)
            .tag_specifications(tag_spec(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(|e| sdk_error("create subnet", e))?;

        out.subnet()
            .and_then(|s| s.subnet_id())
            .map(str::to_owned)
            .ok_or_else(|| missing("create subnet"))
    }

    async fn create_internet_gateway(&self, vpc_id: &str, tags: &TagSet) -> Result<String> {
        let out = self
            .client
            .create_internet_gateway()
            .tag_specifications(tag_spec(ResourceType::InternetGateway, tags))
            .send()
            .await
            .map_err(|e| sdk_error("create internet gateway", e))?;
        let gateway_id = out
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .map(str::to_owned)
            .ok_or_else(|| missing("create internet gateway"))?;

        self.client
            .attach_internet_gateway()
            .internet_gateway_id(&gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(|e| sdk_error("attach internet gateway", e))?;

        Ok(gateway_id)
    }

    async fn create_route_table(
        &self,
        vpc_id: &str,
        subnet_id: &str,
        gateway_id: &str,
        tags: &TagSet,
    ) -> Result<String> {
        let out = self
            .client
            .create_route_table()
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::RouteTable, tags))
            .send()
            .await
            .map_err(|e| sdk_error("create route table", e))?;
        let table_id = out
            .route_table()
            .and_then(|t| t.route_table_id())
            .map(str::to_owned)
            .ok_or_else(|| missing("create route table"))?;

        self.client
            .create_route()
            .route_table_id(&table_id)
            .destination_cidr_block("0.0.0.0/0")
            .gateway_id(gateway_id)
            .send()
            .await
            .map_err(|e| sdk_error("create route", e))?;

        self.client
            .associate_route_table()
            .route_table_id(&table_id)
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(|e| sdk_error("associate route table", e))?;

        Ok(table_id)
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        port: FirewallPort,
        tags: &TagSet,
    ) -> Result<String> {
        let out = self
            .client
            .create_security_group()
            .group_name(name)
            .description(format!("allow {port}"))
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(|e| sdk_error("create security group", e))?;
        let group_id = out
            .group_id()
            .map(str::to_owned)
            .ok_or_else(|| missing("create security group"))?;

        self.client
            .authorize_security_group_ingress()
            .group_id(&group_id)
            .ip_protocol(port.protocol.as_str())
            .from_port(i32::from(port.port))
            .to_port(i32::from(port.port))
            .cidr_ip("0.0.0.0/0")
            .send()
            .await
            .map_err(|e| sdk_error("authorize ingress", e))?;

        Ok(group_id)
    }

    async fn run_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let out = self
            .client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .key_name(&spec.key_name)
            .user_data(&spec.user_data)
            .network_interfaces(network_interface(spec))
            .set_block_device_mappings(block_devices(spec.volume_size_gb))
            .tag_specifications(tag_spec(ResourceType::Instance, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("run instances", e))?;

        out.instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_owned)
            .ok_or_else(|| missing("run instances"))
    }

    async fn request_spot_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let launch = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .key_name(&spec.key_name)
            .user_data(&spec.user_data)
            .network_interfaces(network_interface(spec))
            .set_block_device_mappings(block_devices(spec.volume_size_gb))
            .build();

        let out = self
            .client
            .request_spot_instances()
            .instance_count(1)
            .launch_specification(launch)
            .tag_specifications(tag_spec(ResourceType::SpotInstancesRequest, &spec.tags))
            .send()
            .await
            .map_err(|e| sdk_error("request spot instances", e))?;

        out.spot_instance_requests()
            .first()
            .and_then(|r| r.spot_instance_request_id())
            .map(str::to_owned)
            .ok_or_else(|| missing("request spot instances"))
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequest> {
        let out = self
            .client
            .describe_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .map_err(|e| sdk_error("describe spot request", e))?;

        let req = out
            .spot_instance_requests()
            .first()
            .ok_or_else(|| Error::NotFound(format!("spot request {request_id}")))?;
        Ok(SpotRequest {
            state: req.state().map(|s| s.as_str()).unwrap_or("open").to_string(),
            instance_id: req.instance_id().map(str::to_owned),
        })
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
        self.client
            .cancel_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .map_err(|e| sdk_error("cancel spot request", e))?;
        Ok(())
    }

    async fn tag_resource(&self, resource_id: &str, tags: &TagSet) -> Result<()> {
        self.client
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(sdk_tags(tags)))
            .send()
            .await
            .map_err(|e| sdk_error("create tags", e))?;
        Ok(())
    }

    async fn describe_instance(&self, id: &str) -> Result<Instance> {
        let out = self
            .client
            .describe_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| sdk_error("describe instance", e))?;

        out.reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(convert_instance)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))
    }

    async fn list_instances(&self, next_token: Option<&str>) -> Result<Page<Instance>> {
        let out = self
            .client
            .describe_instances()
            .filters(marker_filter())
            .set_next_token(next_token.map(str::to_owned))
            .send()
            .await
            .map_err(|e| sdk_error("describe instances", e))?;

        let items: Vec<Instance> = out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .filter_map(convert_instance)
            .collect();
        debug!(count = items.len(), "aws: listed instance page");

        Ok(Page {
            items,
            next_token: out.next_token().map(str::to_owned),
        })
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(id)
            .send()
            .await
            .map_err(|e| sdk_error("terminate instance", e))?;
        Ok(())
    }

    async fn find_vpcs(&self, name: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .describe_vpcs()
            .filters(filter(&format!("tag:{}", tags::NAME_TAG), name))
            .filters(marker_filter())
            .send()
            .await
            .map_err(|e| sdk_error("describe vpcs", e))?;

        Ok(out
            .vpcs()
            .iter()
            .filter_map(|v| v.vpc_id().map(str::to_owned))
            .collect())
    }

    async fn list_security_groups(&self, vpc_id: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .describe_security_groups()
            .filters(filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(|e| sdk_error("describe security groups", e))?;

        Ok(out
            .security_groups()
            .iter()
            .filter(|g| g.group_name() != Some("default"))
            .filter_map(|g| g.group_id().map(str::to_owned))
            .collect())
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        self.client
            .delete_security_group()
            .group_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("delete security group", e))?;
        Ok(())
    }

    async fn list_subnets(&self, vpc_id: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .describe_subnets()
            .filters(filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(|e| sdk_error("describe subnets", e))?;

        Ok(out
            .subnets()
            .iter()
            .filter_map(|s| s.subnet_id().map(str::to_owned))
            .collect())
    }

    async fn delete_subnet(&self, id: &str) -> Result<()> {
        self.client
            .delete_subnet()
            .subnet_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("delete subnet", e))?;
        Ok(())
    }

    async fn list_internet_gateways(&self, vpc_id: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .describe_internet_gateways()
            .filters(filter("attachment.vpc-id", vpc_id))
            .send()
            .await
            .map_err(|e| sdk_error("describe internet gateways", e))?;

        Ok(out
            .internet_gateways()
            .iter()
            .filter_map(|g| g.internet_gateway_id().map(str::to_owned))
            .collect())
    }

    async fn delete_internet_gateway(&self, id: &str, vpc_id: &str) -> Result<()> {
        let detached = self
            .client
            .detach_internet_gateway()
            .internet_gateway_id(id)
            .vpc_id(vpc_id)
            .send()
            .await;
        if let Err(e) = detached {
            if e.code() != Some("Gateway.NotAttached") {
                return Err(sdk_error("detach internet gateway", e));
            }
        }

        self.client
            .delete_internet_gateway()
            .internet_gateway_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("delete internet gateway", e))?;
        Ok(())
    }

    async fn list_route_tables(&self, vpc_id: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .describe_route_tables()
            .filters(filter("vpc-id", vpc_id))
            .send()
            .await
            .map_err(|e| sdk_error("describe route tables", e))?;

        Ok(out
            .route_tables()
            .iter()
            .filter(|t| !t.associations().iter().any(|a| a.main() == Some(true)))
            .filter_map(|t| t.route_table_id().map(str::to_owned))
            .collect())
    }

    async fn delete_route_table(&self, id: &str) -> Result<()> {
        self.client
            .delete_route_table()
            .route_table_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("delete route table", e))?;
        Ok(())
    }

    async fn delete_vpc(&self, id: &str) -> Result<()> {
        self.client
            .delete_vpc()
            .vpc_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("delete vpc", e))?;
        Ok(())
    }
}
