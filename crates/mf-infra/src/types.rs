use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::id::ServerId;
use crate::{Error, Result};

static NAME_REGEX: OnceLock<Regex> = OnceLock::new();

fn name_regex() -> &'static Regex {
    NAME_REGEX.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").unwrap())
}

// ── Editions ──

/// Game-server software flavour installed on the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Java,
    Craftbukkit,
    Spigot,
    Fabric,
    Forge,
    Papermc,
    Purpur,
    Bedrock,
    Nukkit,
    Powernukkit,
    Bungeecord,
    Waterfall,
    Velocity,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Craftbukkit => "craftbukkit",
            Self::Spigot => "spigot",
            Self::Fabric => "fabric",
            Self::Forge => "forge",
            Self::Papermc => "papermc",
            Self::Purpur => "purpur",
            Self::Bedrock => "bedrock",
            Self::Nukkit => "nukkit",
            Self::Powernukkit => "powernukkit",
            Self::Bungeecord => "bungeecord",
            Self::Waterfall => "waterfall",
            Self::Velocity => "velocity",
        }
    }

    /// Editions speaking the Bedrock protocol, which runs over UDP.
    pub fn is_bedrock_family(&self) -> bool {
        matches!(self, Self::Bedrock | Self::Nukkit | Self::Powernukkit)
    }

    /// Proxy editions front other servers and get the proxy boot script.
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Bungeecord | Self::Waterfall | Self::Velocity)
    }

    /// Whether the edition runs on a JVM.
    pub fn needs_jdk(&self) -> bool {
        !matches!(self, Self::Bedrock)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Bedrock | Self::Nukkit | Self::Powernukkit => 19132,
            Self::Bungeecord | Self::Waterfall => 25577,
            _ => 25565,
        }
    }
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Edition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "java" => Self::Java,
            "craftbukkit" => Self::Craftbukkit,
            "spigot" => Self::Spigot,
            "fabric" => Self::Fabric,
            "forge" => Self::Forge,
            "papermc" => Self::Papermc,
            "purpur" => Self::Purpur,
            "bedrock" => Self::Bedrock,
            "nukkit" => Self::Nukkit,
            "powernukkit" => Self::Powernukkit,
            "bungeecord" => Self::Bungeecord,
            "waterfall" => Self::Waterfall,
            "velocity" => Self::Velocity,
            other => return Err(Error::Validation(format!("unknown edition {other:?}"))),
        })
    }
}

// ── Descriptor ──

/// Remote console settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rcon {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rcon_port")]
    pub port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub broadcast: bool,
}

impl Default for Rcon {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_rcon_port(),
            password: String::new(),
            broadcast: false,
        }
    }
}

fn default_rcon_port() -> u16 {
    25575
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Path to an OpenSSH public key; must end in `.pub`.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
    /// Inline public key material, used when no file is given.
    #[serde(default)]
    pub public_key: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            public_key_file: None,
            public_key: None,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

impl SshConfig {
    fn check_key_file(path: &Path) -> Result<()> {
        if path.extension().and_then(|e| e.to_str()) != Some("pub") {
            return Err(Error::Validation(format!(
                "ssh public key file {} must end in .pub",
                path.display()
            )));
        }
        Ok(())
    }

    /// Read the public key material, trimmed of surrounding whitespace.
    pub async fn load_public_key(&self) -> Result<String> {
        if let Some(path) = &self.public_key_file {
            Self::check_key_file(path)?;
            let raw = tokio::fs::read_to_string(path).await?;
            return Ok(raw.trim().to_string());
        }
        match &self.public_key {
            Some(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(Error::Validation("no ssh public key configured".into())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaConfig {
    #[serde(default = "default_jdk")]
    pub jdk_version: u8,
    #[serde(default = "default_heap")]
    pub xmx: String,
    #[serde(default = "default_heap")]
    pub xms: String,
    /// Extra JVM flags appended to the launch command.
    #[serde(default)]
    pub options: String,
}

impl Default for JavaConfig {
    fn default() -> Self {
        Self {
            jdk_version: default_jdk(),
            xmx: default_heap(),
            xms: default_heap(),
            options: String::new(),
        }
    }
}

fn default_jdk() -> u8 {
    21
}

fn default_heap() -> String {
    "2G".into()
}

/// Everything a backend needs to know to build one game server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub edition: Edition,
    /// Provider machine size (instance type, flavor, or server type).
    pub size: String,
    pub region: String,
    /// Extra data volume in GB; 0 means none.
    #[serde(default)]
    pub volume_size_gb: u32,
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub arm: bool,
    /// Game port; the edition's default when absent.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub rcon: Rcon,
    #[serde(default)]
    pub monitoring: bool,
    #[serde(default)]
    pub ssh: SshConfig,
    /// Software version; empty means latest.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub java: JavaConfig,
    /// Raw `server.properties` lines written before the managed keys.
    #[serde(default)]
    pub properties: String,
}

impl ServerDescriptor {
    pub fn game_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.edition.default_port())
    }

    /// Name of a resource provisioned for this server, e.g. `<name>-net`.
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if !name_regex().is_match(&self.name) {
            return Err(Error::Validation(format!(
                "server name {:?} must only contain lowercase letters, digits and dashes",
                self.name
            )));
        }
        if self.size.trim().is_empty() {
            return Err(Error::Validation("size must not be empty".into()));
        }
        if self.rcon.enabled && self.rcon.password.is_empty() {
            return Err(Error::Validation("rcon requires a password".into()));
        }
        if let Some(path) = &self.ssh.public_key_file {
            SshConfig::check_key_file(path)?;
        }
        Ok(())
    }
}

// ── Arguments and results ──

/// Per-call input to every lifecycle operation.
#[derive(Debug, Clone)]
pub struct ServerArgs {
    pub descriptor: ServerDescriptor,
    pub ssh_private_key_path: PathBuf,
    /// Caller-supplied bound on every wait inside the call.
    pub deadline: Option<Instant>,
}

impl ServerArgs {
    pub fn new(descriptor: ServerDescriptor, ssh_private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            ssh_private_key_path: ssh_private_key_path.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Provider-neutral view of one running server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    pub region: String,
    pub public_ip: Option<String>,
    /// Sorted `key=value` pairs joined by commas.
    pub tags: String,
}

impl ServerInfo {
    pub fn require_public_ip(&self) -> Result<&str> {
        self.public_ip
            .as_deref()
            .ok_or_else(|| Error::NoPublicAddress(self.name.clone()))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn descriptor(name: &str, edition: Edition) -> ServerDescriptor {
        ServerDescriptor {
            name: name.into(),
            edition,
            size: "t3.medium".into(),
            region: "eu-central-1".into(),
            volume_size_gb: 0,
            spot: false,
            arm: false,
            port: None,
            rcon: Rcon::default(),
            monitoring: false,
            ssh: SshConfig {
                public_key: Some("ssh-ed25519 AAAAC3Nz test@host".into()),
                ..SshConfig::default()
            },
            version: "1.20.4".into(),
            java: JavaConfig::default(),
            properties: String::new(),
        }
    }

    pub fn args(name: &str, edition: Edition) -> ServerArgs {
        ServerArgs::new(descriptor(name, edition), "/tmp/id_ed25519")
    }
}
