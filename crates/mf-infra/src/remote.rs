//! Post-boot remote operations over SSH.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::template::{BootScriptRenderer, DATA_DIR, RenderArgs, SERVICE_NAME, TemplateVariant};
use crate::types::ServerDescriptor;
use crate::{Error, Result};

/// Bound on a single remote command, including connection setup.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Run commands on and copy files to a host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn run_command(&self, host: &str, user: &str, port: u16, command: &str)
    -> Result<String>;

    async fn upload_file(
        &self,
        host: &str,
        user: &str,
        port: u16,
        local: &Path,
        remote: &str,
    ) -> Result<()>;
}

/// [`RemoteChannel`] backed by the system `ssh` and `scp` binaries.
///
/// Host keys are not verified: every server is freshly booted and its key
/// is unknown in advance.
#[derive(Debug, Clone)]
pub struct SshChannel {
    private_key: PathBuf,
}

impl SshChannel {
    pub fn new(private_key: impl Into<PathBuf>) -> Self {
        Self {
            private_key: private_key.into(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["-i".to_string(), self.private_key.display().to_string()];
        for option in [
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "ConnectTimeout=10",
            "BatchMode=yes",
        ] {
            args.push("-o".into());
            args.push(option.into());
        }
        args
    }

    async fn exec(what: &str, host: &str, cmd: &mut Command) -> Result<String> {
        let output: Output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Remote(format!("{what} on {host} timed out")))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            debug!(host, what, stdout_lines = stdout.lines().count(), "remote call done");
            return Ok(stdout);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(host, what, exit_code, stderr = %stderr, "remote call failed");
        Err(Error::Remote(format!(
            "{what} on {host} exited with code {exit_code}: {}",
            stderr.trim()
        )))
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn run_command(
        &self,
        host: &str,
        user: &str,
        port: u16,
        command: &str,
    ) -> Result<String> {
        let (port, target) = (port.to_string(), format!("{user}@{host}"));
        let mut cmd = Command::new("ssh");
        cmd.args(self.common_args())
            .args(["-p", port.as_str(), target.as_str(), command]);
        Self::exec("ssh", host, &mut cmd).await
    }

    async fn upload_file(
        &self,
        host: &str,
        user: &str,
        port: u16,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.args(self.common_args())
            .arg("-P")
            .arg(port.to_string())
            .arg(local)
            .arg(format!("{user}@{host}:{remote}"));
        Self::exec("scp", host, &mut cmd).await.map(|_| ())
    }
}

// ── Shared flows ──

fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Stop the service, replace the binary, refresh the JDK, start again.
pub fn update_command(descriptor: &ServerDescriptor, update_script: &str) -> String {
    let mut script = update_script.trim_end().to_string();
    if descriptor.edition.needs_jdk() {
        script.push_str(&format!(
            "\napt-get update\napt-get install -y openjdk-{}-jre-headless",
            descriptor.java.jdk_version
        ));
    }
    format!(
        "sudo systemctl stop {SERVICE_NAME} && sudo bash -c {} && sudo systemctl start {SERVICE_NAME}",
        single_quote(&script)
    )
}

pub async fn update_server(
    channel: &dyn RemoteChannel,
    renderer: &dyn BootScriptRenderer,
    host: &str,
    user: &str,
    descriptor: &ServerDescriptor,
) -> Result<()> {
    let script = renderer.render(
        descriptor,
        &RenderArgs {
            mount: None,
            ssh_public_key: None,
            variant: TemplateVariant::Update,
        },
    )?;

    info!(host, edition = %descriptor.edition, version = %descriptor.version, "updating server software");
    channel
        .run_command(host, user, descriptor.ssh.port, &update_command(descriptor, &script))
        .await?;
    Ok(())
}

/// Stage the file in `/tmp`, move it into place, restart the service.
pub async fn upload_plugin(
    channel: &dyn RemoteChannel,
    host: &str,
    user: &str,
    port: u16,
    plugin: &Path,
    destination: &str,
) -> Result<()> {
    let file_name = plugin
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("{} is not a file path", plugin.display())))?;
    if !tokio::fs::try_exists(plugin).await? {
        return Err(Error::Validation(format!("{} does not exist", plugin.display())));
    }

    let destination = match destination.trim_end_matches('/') {
        "" => DATA_DIR,
        dir => dir,
    };
    let staged = format!("/tmp/{file_name}");

    channel.upload_file(host, user, port, plugin, &staged).await?;
    channel
        .run_command(
            host,
            user,
            port,
            &format!(
                "sudo mv {staged} {destination}/{file_name} && sudo systemctl restart {SERVICE_NAME}"
            ),
        )
        .await?;

    info!(host, plugin = file_name, destination, "plugin installed");
    Ok(())
}
