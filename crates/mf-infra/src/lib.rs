pub mod aws;
pub mod hetzner;
pub mod id;
pub mod openstack;
pub mod orchestrator;
pub mod pipeline;
pub mod poll;
pub mod ports;
pub mod remote;
pub mod tags;
pub mod template;
pub mod types;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use id::ServerId;
use orchestrator::Phase;
use remote::{RemoteChannel, SshChannel};
use template::BootScriptRenderer;
use types::{ServerArgs, ServerInfo};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid server descriptor: {0}")]
    Validation(String),

    #[error("provider api error: {0}")]
    Provider(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("{what} ended in failure state {status}")]
    ProvisioningFailed { what: String, status: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server {0} is running but has no public address")]
    NoPublicAddress(String),

    #[error("teardown stopped at {step} (already removed: {completed:?}): {source}")]
    PartialTeardown {
        step: &'static str,
        completed: Vec<&'static str>,
        source: Box<Error>,
    },

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("remote command failed: {0}")]
    Remote(String),

    #[error("boot script rendering failed: {0}")]
    Render(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{step}: {source}")]
    InStep {
        step: &'static str,
        source: Box<Error>,
    },

    #[error("{phase} failed: {source}")]
    InPhase { phase: Phase, source: Box<Error> },
}

impl Error {
    /// Annotate with the pipeline step that produced the failure.
    pub fn in_step(self, step: &'static str) -> Self {
        Self::InStep {
            step,
            source: Box::new(self),
        }
    }

    /// Annotate with the lifecycle phase that produced the failure.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            already @ Self::InPhase { .. } => already,
            other => Self::InPhase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The underlying failure with step and phase annotations stripped.
    pub fn root(&self) -> &Error {
        match self {
            Self::InStep { source, .. } | Self::InPhase { source, .. } => source.root(),
            other => other,
        }
    }

    /// The innermost pipeline step recorded on this error, if any.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            Self::InPhase { source, .. } => source.step(),
            Self::InStep { step, source } => source.step().or(Some(*step)),
            Self::PartialTeardown { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::InPhase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }
}

impl From<openstack_api::Error> for Error {
    fn from(err: openstack_api::Error) -> Self {
        if err.is_not_found() {
            Self::NotFound(err.to_string())
        } else {
            Self::Provider(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known infrastructure backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Aws,
    OpenStack,
    Fuga,
    Vexxhost,
    Hetzner,
}

impl ProviderName {
    pub const ALL: [ProviderName; 5] = [
        Self::Aws,
        Self::OpenStack,
        Self::Fuga,
        Self::Vexxhost,
        Self::Hetzner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::OpenStack => "openstack",
            Self::Fuga => "fuga",
            Self::Vexxhost => "vexxhost",
            Self::Hetzner => "hetzner",
        }
    }

    /// Human readable provider name.
    pub fn full_name(&self) -> &'static str {
        match self {
            Self::Aws => "Amazon Web Services",
            Self::OpenStack => "OpenStack",
            Self::Fuga => "Fuga Cloud",
            Self::Vexxhost => "VEXXHOST",
            Self::Hetzner => "Hetzner Cloud",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aws" => Ok(Self::Aws),
            "openstack" => Ok(Self::OpenStack),
            "fuga" => Ok(Self::Fuga),
            "vexxhost" => Ok(Self::Vexxhost),
            "hetzner" => Ok(Self::Hetzner),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Backend-agnostic lifecycle contract for game-server VMs.
///
/// Each backend owns its configuration, loaded from environment variables at
/// construction. Update and upload are shared flows over a remote shell and
/// only need the backend to resolve the server's public address.
#[async_trait]
pub trait Automation: Send + Sync + 'static {
    /// Provision every supporting resource and boot a VM for the descriptor.
    async fn create_server(&self, args: &ServerArgs) -> Result<ServerInfo>;

    /// Describe one server. Fails with [`Error::NotFound`] for unknown ids.
    async fn get_server(&self, id: &ServerId, args: &ServerArgs) -> Result<ServerInfo>;

    /// Every server carrying the marker tag, across all result pages.
    async fn list_servers(&self) -> Result<Vec<ServerInfo>>;

    /// Remove the VM and everything provisioned for it. Re-running after a
    /// partial or complete teardown is safe.
    async fn delete_server(&self, id: &ServerId, args: &ServerArgs) -> Result<()>;

    /// Provider identifier.
    fn name(&self) -> ProviderName;

    /// Login user on the images this backend boots.
    fn ssh_user(&self) -> &str;

    /// Renders boot and update scripts for this backend.
    fn renderer(&self) -> &dyn BootScriptRenderer;

    fn remote_channel(&self, args: &ServerArgs) -> Box<dyn RemoteChannel> {
        Box::new(SshChannel::new(&args.ssh_private_key_path))
    }

    /// Replace the server software in place with the descriptor's version.
    async fn update_server(&self, id: &ServerId, args: &ServerArgs) -> Result<()> {
        let server = self.get_server(id, args).await?;
        let host = server.require_public_ip()?;
        let channel = self.remote_channel(args);

        remote::update_server(
            channel.as_ref(),
            self.renderer(),
            host,
            self.ssh_user(),
            &args.descriptor,
        )
        .await?;

        tracing::info!(provider = %self.name(), server = %server.name, "server software updated");
        Ok(())
    }

    /// Copy a plugin file into `destination` on the server and restart the service.
    async fn upload_plugin(
        &self,
        id: &ServerId,
        args: &ServerArgs,
        plugin: &Path,
        destination: &str,
    ) -> Result<()> {
        let server = self.get_server(id, args).await?;
        let host = server.require_public_ip()?;
        let channel = self.remote_channel(args);

        remote::upload_plugin(
            channel.as_ref(),
            host,
            self.ssh_user(),
            args.descriptor.ssh.port,
            plugin,
            destination,
        )
        .await?;

        tracing::info!(provider = %self.name(), server = %server.name, "plugin uploaded");
        Ok(())
    }
}

/// Registry of all configured backends.
///
/// Each backend is constructed from environment variables at startup.
/// Backends whose required env vars are missing are skipped.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn Automation>>,
}

impl ProviderRegistry {
    pub fn from_providers(providers: impl IntoIterator<Item = Arc<dyn Automation>>) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.name(), p)).collect(),
        }
    }

    /// Look up a backend by name.
    pub fn get(&self, name: ProviderName) -> Option<&Arc<dyn Automation>> {
        self.providers.get(&name)
    }

    /// Names of all available backends, in catalogue order.
    pub fn available(&self) -> Vec<ProviderName> {
        ProviderName::ALL
            .into_iter()
            .filter(|name| self.providers.contains_key(name))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn register(&mut self, provider: Arc<dyn Automation>) {
        tracing::info!("registered {} backend", provider.name().full_name());
        self.providers.insert(provider.name(), provider);
    }
}

/// Whether a backend was skipped only because its env vars are unset.
fn unconfigured(err: &Error) -> bool {
    matches!(err.root(), Error::MissingEnv(_))
}

fn log_skipped(backend: &str, err: &Error) {
    if unconfigured(err) {
        tracing::debug!(backend, "skipping backend: {err}");
    } else {
        tracing::warn!(backend, error = %err, "backend configured but failed to start");
    }
}

/// Build all backends whose required env vars are present.
///
/// Returns an error only if no backend could be constructed at all.
pub async fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry::default();

    match aws::AwsProvider::from_env().await {
        Ok(p) => registry.register(Arc::new(p)),
        Err(e) => log_skipped("AWS", &e),
    }

    for profile in [
        openstack::OpenStackProfile::openstack(),
        openstack::OpenStackProfile::fuga(),
        openstack::OpenStackProfile::vexxhost(),
    ] {
        let name = profile.provider;
        match openstack::OpenStackProvider::from_env(profile).await {
            Ok(p) => registry.register(Arc::new(p)),
            Err(e) => log_skipped(name.full_name(), &e),
        }
    }

    match hetzner::HetznerProvider::from_env() {
        Ok(p) => registry.register(Arc::new(p)),
        Err(e) => log_skipped("Hetzner", &e),
    }

    if registry.is_empty() {
        return Err(Error::MissingEnv(
            "no backends configured (set AWS_REGION, OS_AUTH_URL, FUGA_AUTH_URL, VEXXHOST_AUTH_URL and/or HETZNER_API_TOKEN)".into(),
        ));
    }

    Ok(registry)
}
