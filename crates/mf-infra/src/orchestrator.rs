use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{Instrument, info, info_span};

use crate::id::ServerId;
use crate::types::{ServerArgs, ServerInfo};
use crate::{Automation, Error, ProviderName, Result};

/// Lifecycle operation an error surfaced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Create,
    Get,
    List,
    Update,
    Upload,
    Delete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::List => "list",
            Self::Update => "update",
            Self::Upload => "upload",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing entry point over one backend.
///
/// Validates inputs before any provider call, parses caller-supplied ids,
/// and tags every failure with the lifecycle phase it came from.
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn Automation>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Automation>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> ProviderName {
        self.provider.name()
    }

    fn span(&self, phase: Phase) -> tracing::Span {
        info_span!("lifecycle", provider = %self.provider.name(), phase = %phase)
    }

    pub async fn create(&self, args: &ServerArgs) -> Result<ServerInfo> {
        let run = async {
            args.descriptor.validate()?;
            let info = self.provider.create_server(args).await?;
            info!(server_id = %info.id, name = %info.name, "server created");
            Ok::<_, Error>(info)
        };
        run.instrument(self.span(Phase::Create))
            .await
            .map_err(|e| e.in_phase(Phase::Create))
    }

    pub async fn get(&self, id: &str, args: &ServerArgs) -> Result<ServerInfo> {
        let run = async {
            let id = ServerId::parse(id)?;
            self.provider.get_server(&id, args).await
        };
        run.instrument(self.span(Phase::Get))
            .await
            .map_err(|e| e.in_phase(Phase::Get))
    }

    pub async fn list(&self) -> Result<Vec<ServerInfo>> {
        self.provider
            .list_servers()
            .instrument(self.span(Phase::List))
            .await
            .map_err(|e| e.in_phase(Phase::List))
    }

    pub async fn update(&self, id: &str, args: &ServerArgs) -> Result<()> {
        let run = async {
            args.descriptor.validate()?;
            let id = ServerId::parse(id)?;
            self.provider.update_server(&id, args).await
        };
        run.instrument(self.span(Phase::Update))
            .await
            .map_err(|e| e.in_phase(Phase::Update))
    }

    pub async fn upload(
        &self,
        id: &str,
        args: &ServerArgs,
        plugin: &Path,
        destination: &str,
    ) -> Result<()> {
        let run = async {
            let id = ServerId::parse(id)?;
            self.provider
                .upload_plugin(&id, args, plugin, destination)
                .await
        };
        run.instrument(self.span(Phase::Upload))
            .await
            .map_err(|e| e.in_phase(Phase::Upload))
    }

    pub async fn delete(&self, id: &str, args: &ServerArgs) -> Result<()> {
        let run = async {
            let id = ServerId::parse(id)?;
            self.provider.delete_server(&id, args).await?;
            info!(server_id = %id, "server deleted");
            Ok::<_, Error>(())
        };
        run.instrument(self.span(Phase::Delete))
            .await
            .map_err(|e| e.in_phase(Phase::Delete))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::remote::RemoteChannel;
    use crate::remote::fake::RecordingChannel;
    use crate::tags::TagSet;
    use crate::template::{BootScriptRenderer, CloudInitRenderer};

    /// In-memory backend keyed by server id.
    pub struct FakeAutomation {
        pub servers: Mutex<HashMap<String, ServerInfo>>,
        pub channel: Arc<RecordingChannel>,
        pub next_id: Mutex<u32>,
    }

    impl Default for FakeAutomation {
        fn default() -> Self {
            Self {
                servers: Mutex::new(HashMap::new()),
                channel: Arc::new(RecordingChannel::default()),
                next_id: Mutex::new(1),
            }
        }
    }

    struct SharedChannel(Arc<RecordingChannel>);

    #[async_trait]
    impl RemoteChannel for SharedChannel {
        async fn run_command(&self, host: &str, user: &str, port: u16, command: &str) -> Result<String> {
            self.0.run_command(host, user, port, command).await
        }

        async fn upload_file(
            &self,
            host: &str,
            user: &str,
            port: u16,
            local: &Path,
            remote: &str,
        ) -> Result<()> {
            self.0.upload_file(host, user, port, local, remote).await
        }
    }

    #[async_trait]
    impl Automation for FakeAutomation {
        async fn create_server(&self, args: &ServerArgs) -> Result<ServerInfo> {
            let mut next = self.next_id.lock().unwrap();
            let info = ServerInfo {
                id: ServerId::new(format!("vm-{}", *next))?,
                name: args.descriptor.name.clone(),
                region: args.descriptor.region.clone(),
                public_ip: Some(format!("192.0.2.{}", *next)),
                tags: TagSet::for_server(&args.descriptor).flatten(),
            };
            *next += 1;
            self.servers
                .lock()
                .unwrap()
                .insert(info.id.to_string(), info.clone());
            Ok(info)
        }

        async fn get_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<ServerInfo> {
            self.servers
                .lock()
                .unwrap()
                .get(&id.to_string())
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("server {id}")))
        }

        async fn list_servers(&self) -> Result<Vec<ServerInfo>> {
            let mut all: Vec<ServerInfo> = self.servers.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(all)
        }

        async fn delete_server(&self, id: &ServerId, _args: &ServerArgs) -> Result<()> {
            self.servers.lock().unwrap().remove(&id.to_string());
            Ok(())
        }

        fn name(&self) -> ProviderName {
            ProviderName::Hetzner
        }

        fn ssh_user(&self) -> &str {
            "root"
        }

        fn renderer(&self) -> &dyn BootScriptRenderer {
            &CloudInitRenderer
        }

        fn remote_channel(&self, _args: &ServerArgs) -> Box<dyn RemoteChannel> {
            Box::new(SharedChannel(self.channel.clone()))
        }
    }
}
