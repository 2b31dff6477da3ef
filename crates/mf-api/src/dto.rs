use std::path::PathBuf;
use std::time::Duration;

use mf_infra::ProviderName;
use mf_infra::types::{ServerArgs, ServerDescriptor};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// ── Requests ───────────────────────────────────────────────────────

/// Body shared by every per-server call.
#[derive(Debug, Deserialize)]
pub struct ServerRequest {
    pub descriptor: ServerDescriptor,
    pub ssh_private_key_path: PathBuf,
    /// Upper bound on every wait inside the call.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ServerRequest {
    /// `timeout_secs` wins over the server-wide default.
    pub fn into_args(self, default_timeout: Option<Duration>) -> ServerArgs {
        let args = ServerArgs::new(self.descriptor, self.ssh_private_key_path);
        match self.timeout_secs.map(Duration::from_secs).or(default_timeout) {
            Some(timeout) => args.with_deadline(Instant::now() + timeout),
            None => args,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadPluginRequest {
    #[serde(flatten)]
    pub server: ServerRequest,
    pub plugin_path: PathBuf,
    pub destination: String,
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProviderResponse {
    pub name: ProviderName,
    pub full_name: &'static str,
}

impl From<ProviderName> for ProviderResponse {
    fn from(name: ProviderName) -> Self {
        Self {
            name,
            full_name: name.full_name(),
        }
    }
}
