use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identity ────────────────────────────────────────────────────────

/// Keystone v3 password credentials scoped to one project.
#[derive(Debug, Clone)]
pub struct AuthOptions {
    /// Identity endpoint including the version, e.g. `https://keystone.example/v3`.
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_id: String,
    pub user_domain_name: String,
    /// Restricts catalog endpoints to one region when set.
    pub region: Option<String>,
}

/// Service base URLs resolved from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub compute: String,
    pub network: String,
    pub image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub name: String,
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

// ── Compute ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Keypair {
    pub name: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vcpus: u32,
    /// Memory in MB.
    #[serde(default)]
    pub ram: u64,
    /// Root disk in GB.
    #[serde(default)]
    pub disk: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    pub key_name: String,
    /// Base64 encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    pub metadata: HashMap<String, String>,
    pub security_groups: Vec<NamedRef>,
    pub networks: Vec<NetworkRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkRef {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    /// `BUILD`, `ACTIVE`, `ERROR`, `DELETED`, ...
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub addresses: HashMap<String, Vec<Address>>,
    #[serde(rename = "OS-EXT-AZ:availability_zone", default)]
    pub availability_zone: Option<String>,
}

impl Server {
    /// First floating address attached to any network.
    pub fn floating_ip(&self) -> Option<&str> {
        self.addresses
            .values()
            .flatten()
            .find(|a| a.kind.as_deref() == Some("floating"))
            .map(|a| a.addr.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Address {
    pub addr: String,
    #[serde(default)]
    pub version: u8,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Clone)]
pub struct ServerPage {
    pub servers: Vec<Server>,
    pub has_more: bool,
}

// ── Image ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImagePage {
    pub images: Vec<Image>,
    #[serde(default)]
    pub next: Option<String>,
}

// ── Network ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(rename = "router:external", default)]
    pub external: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub admin_state_up: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub cidr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSubnetRequest {
    pub name: String,
    pub network_id: String,
    pub cidr: String,
    pub ip_version: u8,
    pub dns_nameservers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Router {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRouterRequest {
    pub name: String,
    pub admin_state_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_gateway_info: Option<ExternalGateway>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalGateway {
    pub network_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSecurityGroupRequest {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub security_group_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSecurityGroupRuleRequest {
    pub security_group_id: String,
    /// `ingress` or `egress`.
    pub direction: String,
    pub ethertype: String,
    pub protocol: String,
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub remote_ip_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Port {
    pub id: String,
    pub device_id: String,
    pub network_id: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixedIp {
    pub ip_address: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    #[serde(default)]
    pub port_id: Option<String>,
    pub floating_network_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFloatingIpRequest {
    pub floating_network_id: String,
    pub port_id: String,
}
