//! Typed Rust client for the OpenStack REST APIs.
//!
//! Covers Keystone v3 password authentication and the subset of Nova
//! (keypairs, flavors, servers), Glance (images) and Neutron (networks,
//! subnets, routers, security groups, ports, floating IPs) needed to run a
//! single VM in its own network.

mod types;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

pub use types::*;

const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("openstack api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("openstack api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("openstack api {endpoint} returned an unexpected body: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },

    #[error("service catalog has no public {0} endpoint")]
    MissingEndpoint(&'static str),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status, .. } if status.as_u16() == 404)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Deserialize)]
struct ServersResponse {
    servers: Vec<Server>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

/// Client for one authenticated project.
#[derive(Clone)]
pub struct OpenStackClient {
    token: String,
    expires_at: Option<DateTime<Utc>>,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl OpenStackClient {
    /// Build a client from an existing token and resolved endpoints.
    pub fn new(token: impl Into<String>, endpoints: Endpoints) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            endpoints,
            http: reqwest::Client::new(),
        }
    }

    /// Exchange password credentials for a project-scoped token and resolve
    /// the compute, network and image endpoints from the returned catalog.
    pub async fn authenticate(opts: &AuthOptions) -> Result<Self> {
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": opts.username,
                            "domain": { "name": opts.user_domain_name },
                            "password": opts.password,
                        }
                    }
                },
                "scope": { "project": { "id": opts.project_id } }
            }
        });

        let http = reqwest::Client::new();
        let resp = http
            .post(format!("{}/auth/tokens", opts.auth_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp, "authenticate").await?;

        let token = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(Error::Decode {
                endpoint: "authenticate",
                message: format!("missing {SUBJECT_TOKEN_HEADER} header"),
            })?;
        let TokenResponse { token: details } = resp.json().await?;

        let region = opts.region.as_deref();
        let endpoints = Endpoints {
            compute: Self::catalog_url(&details.catalog, "compute", region)?,
            network: Self::catalog_url(&details.catalog, "network", region)?,
            image: Self::catalog_url(&details.catalog, "image", region)?,
        };

        Ok(Self {
            token,
            expires_at: details.expires_at,
            endpoints,
            http,
        })
    }

    fn catalog_url(
        catalog: &[CatalogEntry],
        service_type: &'static str,
        region: Option<&str>,
    ) -> Result<String> {
        catalog
            .iter()
            .filter(|entry| entry.service_type == service_type)
            .flat_map(|entry| &entry.endpoints)
            .find(|ep| {
                ep.interface == "public"
                    && region.is_none_or(|r| ep.region.as_deref() == Some(r))
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or(Error::MissingEndpoint(service_type))
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// When the token stops being accepted, if Keystone said so.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    fn compute_url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoints.compute)
    }

    fn network_url(&self, path: &str) -> String {
        format!("{}/v2.0{path}", self.endpoints.network)
    }

    fn image_url(&self, path: &str) -> String {
        format!("{}/v2{path}", self.endpoints.image)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Check the response and pull one top-level key out of the JSON body.
    async fn field<T: DeserializeOwned>(
        resp: reqwest::Response,
        endpoint: &'static str,
        key: &'static str,
    ) -> Result<T> {
        let mut body: serde_json::Value = Self::check(resp, endpoint).await?.json().await?;
        let value = body
            .get_mut(key)
            .map(serde_json::Value::take)
            .ok_or_else(|| Error::Decode {
                endpoint,
                message: format!("missing `{key}`"),
            })?;
        serde_json::from_value(value).map_err(|e| Error::Decode {
            endpoint,
            message: e.to_string(),
        })
    }

    // ── Keypairs ────────────────────────────────────────────────────

    pub async fn create_keypair(&self, name: &str, public_key: &str) -> Result<Keypair> {
        let resp = self
            .http
            .post(self.compute_url("/os-keypairs"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "keypair": { "name": name, "public_key": public_key } }))
            .send()
            .await?;

        Self::field(resp, "create keypair", "keypair").await
    }

    pub async fn delete_keypair(&self, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.compute_url(&format!("/os-keypairs/{name}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete keypair").await?;
        Ok(())
    }

    // ── Flavors ─────────────────────────────────────────────────────

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        let resp = self
            .http
            .get(self.compute_url("/flavors/detail"))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::field(resp, "list flavors", "flavors").await
    }

    // ── Images ──────────────────────────────────────────────────────

    /// One page of active images. Pass the last image id of the previous
    /// page as `marker` while [`ImagePage::next`] is set.
    pub async fn list_images(&self, marker: Option<&str>) -> Result<ImagePage> {
        let mut query: Vec<(&str, String)> = vec![
            ("status", "active".into()),
            ("limit", PAGE_SIZE.to_string()),
        ];
        if let Some(m) = marker {
            query.push(("marker", m.to_string()));
        }

        let resp = self
            .http
            .get(self.image_url("/images"))
            .header(TOKEN_HEADER, &self.token)
            .query(&query)
            .send()
            .await?;

        Self::check(resp, "list images")
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Servers ─────────────────────────────────────────────────────

    pub async fn create_server(&self, req: &CreateServerRequest) -> Result<ServerRef> {
        let resp = self
            .http
            .post(self.compute_url("/servers"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "server": req }))
            .send()
            .await?;

        Self::field(resp, "create server", "server").await
    }

    pub async fn get_server(&self, id: &str) -> Result<Server> {
        let resp = self
            .http
            .get(self.compute_url(&format!("/servers/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::field(resp, "get server", "server").await
    }

    /// One page of servers with details. Pass the last server id of the
    /// previous page as `marker` while [`ServerPage::has_more`] is set.
    pub async fn list_servers(&self, marker: Option<&str>) -> Result<ServerPage> {
        let mut query: Vec<(&str, String)> = vec![("limit", PAGE_SIZE.to_string())];
        if let Some(m) = marker {
            query.push(("marker", m.to_string()));
        }

        let resp = self
            .http
            .get(self.compute_url("/servers/detail"))
            .header(TOKEN_HEADER, &self.token)
            .query(&query)
            .send()
            .await?;

        let page: ServersResponse = Self::check(resp, "list servers").await?.json().await?;
        Ok(ServerPage {
            has_more: page.servers_links.iter().any(|l| l.rel == "next"),
            servers: page.servers,
        })
    }

    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.compute_url(&format!("/servers/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete server").await?;
        Ok(())
    }

    // ── Networks ────────────────────────────────────────────────────

    pub async fn create_network(&self, req: &CreateNetworkRequest) -> Result<Network> {
        let resp = self
            .http
            .post(self.network_url("/networks"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "network": req }))
            .send()
            .await?;

        Self::field(resp, "create network", "network").await
    }

    pub async fn find_networks(&self, name: &str) -> Result<Vec<Network>> {
        let resp = self
            .http
            .get(self.network_url("/networks"))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("name", name)])
            .send()
            .await?;

        Self::field(resp, "find networks", "networks").await
    }

    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.network_url(&format!("/networks/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete network").await?;
        Ok(())
    }

    // ── Subnets ─────────────────────────────────────────────────────

    pub async fn create_subnet(&self, req: &CreateSubnetRequest) -> Result<Subnet> {
        let resp = self
            .http
            .post(self.network_url("/subnets"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "subnet": req }))
            .send()
            .await?;

        Self::field(resp, "create subnet", "subnet").await
    }

    pub async fn find_subnets(&self, name: &str) -> Result<Vec<Subnet>> {
        let resp = self
            .http
            .get(self.network_url("/subnets"))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("name", name)])
            .send()
            .await?;

        Self::field(resp, "find subnets", "subnets").await
    }

    pub async fn delete_subnet(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.network_url(&format!("/subnets/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete subnet").await?;
        Ok(())
    }

    // ── Routers ─────────────────────────────────────────────────────

    pub async fn create_router(&self, req: &CreateRouterRequest) -> Result<Router> {
        let resp = self
            .http
            .post(self.network_url("/routers"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "router": req }))
            .send()
            .await?;

        Self::field(resp, "create router", "router").await
    }

    pub async fn find_routers(&self, name: &str) -> Result<Vec<Router>> {
        let resp = self
            .http
            .get(self.network_url("/routers"))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("name", name)])
            .send()
            .await?;

        Self::field(resp, "find routers", "routers").await
    }

    pub async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let resp = self
            .http
            .put(self.network_url(&format!("/routers/{router_id}/add_router_interface")))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "subnet_id": subnet_id }))
            .send()
            .await?;

        Self::check(resp, "add router interface").await?;
        Ok(())
    }

    pub async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let resp = self
            .http
            .put(self.network_url(&format!("/routers/{router_id}/remove_router_interface")))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "subnet_id": subnet_id }))
            .send()
            .await?;

        Self::check(resp, "remove router interface").await?;
        Ok(())
    }

    pub async fn delete_router(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.network_url(&format!("/routers/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete router").await?;
        Ok(())
    }

    // ── Security groups ─────────────────────────────────────────────

    pub async fn create_security_group(
        &self,
        req: &CreateSecurityGroupRequest,
    ) -> Result<SecurityGroup> {
        let resp = self
            .http
            .post(self.network_url("/security-groups"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "security_group": req }))
            .send()
            .await?;

        Self::field(resp, "create security group", "security_group").await
    }

    pub async fn create_security_group_rule(
        &self,
        req: &CreateSecurityGroupRuleRequest,
    ) -> Result<SecurityGroupRule> {
        let resp = self
            .http
            .post(self.network_url("/security-group-rules"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "security_group_rule": req }))
            .send()
            .await?;

        Self::field(resp, "create security group rule", "security_group_rule").await
    }

    pub async fn find_security_groups(&self, name: &str) -> Result<Vec<SecurityGroup>> {
        let resp = self
            .http
            .get(self.network_url("/security-groups"))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("name", name)])
            .send()
            .await?;

        Self::field(resp, "find security groups", "security_groups").await
    }

    pub async fn delete_security_group(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.network_url(&format!("/security-groups/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete security group").await?;
        Ok(())
    }

    // ── Ports and floating IPs ──────────────────────────────────────

    pub async fn list_ports(&self, device_id: &str) -> Result<Vec<Port>> {
        let resp = self
            .http
            .get(self.network_url("/ports"))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("device_id", device_id)])
            .send()
            .await?;

        Self::field(resp, "list ports", "ports").await
    }

    pub async fn create_floating_ip(&self, req: &CreateFloatingIpRequest) -> Result<FloatingIp> {
        let resp = self
            .http
            .post(self.network_url("/floatingips"))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "floatingip": req }))
            .send()
            .await?;

        Self::field(resp, "create floating ip", "floatingip").await
    }

    pub async fn list_floating_ips(&self, port_id: &str) -> Result<Vec<FloatingIp>> {
        let resp = self
            .http
            .get(self.network_url("/floatingips"))
            .header(TOKEN_HEADER, &self.token)
            .query(&[("port_id", port_id)])
            .send()
            .await?;

        Self::field(resp, "list floating ips", "floatingips").await
    }

    pub async fn delete_floating_ip(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.network_url(&format!("/floatingips/{id}")))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        Self::check(resp, "delete floating ip").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    fn client(server: &mockito::Server) -> OpenStackClient {
        OpenStackClient::new(
            "gAAAAB-token",
            Endpoints {
                compute: format!("{}/compute/v2.1", server.url()),
                network: format!("{}/network", server.url()),
                image: format!("{}/image", server.url()),
            },
        )
    }

    #[tokio::test]
    async fn authenticate_reads_token_and_catalog() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let catalog = json!({
            "token": {
                "expires_at": "2030-01-01T00:00:00.000000Z",
                "catalog": [
                    { "type": "compute", "name": "nova", "endpoints": [
                        { "interface": "internal", "region": "ams2", "url": "http://10.0.0.1:8774/v2.1" },
                        { "interface": "public", "region": "ams2", "url": format!("{base}/compute/v2.1/") }
                    ]},
                    { "type": "network", "name": "neutron", "endpoints": [
                        { "interface": "public", "region": "ams2", "url": format!("{base}/network") }
                    ]},
                    { "type": "image", "name": "glance", "endpoints": [
                        { "interface": "public", "region": "ams2", "url": format!("{base}/image") }
                    ]}
                ]
            }
        });
        let mock = server
            .mock("POST", "/identity/v3/auth/tokens")
            .match_body(Matcher::PartialJson(json!({
                "auth": { "scope": { "project": { "id": "proj-1" } } }
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_header("X-Subject-Token", "gAAAAB-token")
            .with_body(catalog.to_string())
            .create_async()
            .await;

        let client = OpenStackClient::authenticate(&AuthOptions {
            auth_url: format!("{base}/identity/v3"),
            username: "admin".into(),
            password: "secret".into(),
            project_id: "proj-1".into(),
            user_domain_name: "Default".into(),
            region: Some("ams2".into()),
        })
        .await
        .unwrap();

        mock.assert_async().await;
        assert!(client.expires_at().is_some());
        assert_eq!(client.endpoints().compute, format!("{base}/compute/v2.1"));
        assert_eq!(client.endpoints().network, format!("{base}/network"));
    }

    #[tokio::test]
    async fn missing_catalog_entry_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v3/auth/tokens")
            .with_status(201)
            .with_header("X-Subject-Token", "tok")
            .with_body(r#"{"token":{"catalog":[]}}"#)
            .create_async()
            .await;

        let err = OpenStackClient::authenticate(&AuthOptions {
            auth_url: format!("{}/v3", server.url()),
            username: "u".into(),
            password: "p".into(),
            project_id: "p".into(),
            user_domain_name: "Default".into(),
            region: None,
        })
        .await
        .err()
        .unwrap();

        assert!(matches!(err, Error::MissingEndpoint("compute")));
    }

    #[tokio::test]
    async fn missing_server_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/compute/v2.1/servers/gone")
            .match_header("X-Auth-Token", "gAAAAB-token")
            .with_status(404)
            .with_body(r#"{"itemNotFound":{"code":404}}"#)
            .create_async()
            .await;

        let err = client(&server).get_server("gone").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn server_addresses_expose_floating_ip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/compute/v2.1/servers/vm-1")
            .with_status(200)
            .with_body(
                json!({ "server": {
                    "id": "vm-1",
                    "name": "lobby",
                    "status": "ACTIVE",
                    "metadata": { "mcfleet": "true" },
                    "addresses": { "lobby-net": [
                        { "addr": "10.1.10.5", "version": 4, "OS-EXT-IPS:type": "fixed" },
                        { "addr": "185.0.0.9", "version": 4, "OS-EXT-IPS:type": "floating" }
                    ]}
                }})
                .to_string(),
            )
            .create_async()
            .await;

        let got = client(&server).get_server("vm-1").await.unwrap();
        assert_eq!(got.status, "ACTIVE");
        assert_eq!(got.floating_ip(), Some("185.0.0.9"));
    }

    #[tokio::test]
    async fn server_listing_reports_more_pages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/compute/v2.1/servers/detail")
            .match_query(Matcher::UrlEncoded("marker".into(), "vm-1".into()))
            .with_status(200)
            .with_body(r#"{"servers":[{"id":"vm-2","name":"b","status":"ACTIVE"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/compute/v2.1/servers/detail")
            .match_query(Matcher::Exact("limit=100".into()))
            .with_status(200)
            .with_body(
                r#"{"servers":[{"id":"vm-1","name":"a","status":"ACTIVE"}],
                    "servers_links":[{"rel":"next","href":"http://x/servers/detail?marker=vm-1"}]}"#,
            )
            .create_async()
            .await;

        let client = client(&server);
        let first = client.list_servers(None).await.unwrap();
        assert!(first.has_more);
        assert_eq!(first.servers[0].id, "vm-1");

        let second = client.list_servers(Some("vm-1")).await.unwrap();
        assert!(!second.has_more);
        assert_eq!(second.servers[0].id, "vm-2");
    }

    #[tokio::test]
    async fn neutron_filters_by_name() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/network/v2.0/security-groups")
            .match_query(Matcher::UrlEncoded("name".into(), "lobby-sg".into()))
            .with_status(200)
            .with_body(r#"{"security_groups":[{"id":"sg-1","name":"lobby-sg"}]}"#)
            .create_async()
            .await;

        let groups = client(&server)
            .find_security_groups("lobby-sg")
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "sg-1");
    }

    #[tokio::test]
    async fn delete_surfaces_missing_resources() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/network/v2.0/routers/r-1")
            .with_status(404)
            .create_async()
            .await;

        let err = client(&server).delete_router("r-1").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
