//! Boot and update scripts.
//!
//! Backends hand the descriptor to a [`BootScriptRenderer`] and pass the
//! result to the VM as user data. The built-in [`CloudInitRenderer`] installs
//! the edition's runtime, writes `server.properties`, and runs the server as
//! the `minecraft.service` systemd unit.

use std::fmt::Write as _;

use crate::Result;
use crate::ports::MONITORING_PORT;
use crate::types::{Edition, ServerDescriptor};

/// Systemd unit every boot script installs.
pub const SERVICE_NAME: &str = "minecraft.service";
/// Game data lives here, on the data volume when one is attached.
pub const DATA_DIR: &str = "/minecraft";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateVariant {
    CloudConfig,
    ProxyCloudConfig,
    Bash,
    ProxyBash,
    /// Download-and-replace script run over the remote channel.
    Update,
}

/// Which user-data format the backend's images accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFormat {
    CloudConfig,
    Bash,
}

/// Pick the proxy or regular boot variant for a descriptor.
pub fn variant_for(descriptor: &ServerDescriptor, format: ScriptFormat) -> TemplateVariant {
    match (format, descriptor.edition.is_proxy()) {
        (ScriptFormat::CloudConfig, false) => TemplateVariant::CloudConfig,
        (ScriptFormat::CloudConfig, true) => TemplateVariant::ProxyCloudConfig,
        (ScriptFormat::Bash, false) => TemplateVariant::Bash,
        (ScriptFormat::Bash, true) => TemplateVariant::ProxyBash,
    }
}

#[derive(Debug, Clone)]
pub struct RenderArgs<'a> {
    /// Block device holding the data volume: a bare name under `/dev`
    /// (`sdb`) or an absolute path (`/dev/disk/by-id/...`).
    pub mount: Option<&'a str>,
    /// Authorized for the default user when the backend cannot inject keys.
    pub ssh_public_key: Option<&'a str>,
    pub variant: TemplateVariant,
}

pub trait BootScriptRenderer: Send + Sync {
    fn render(&self, descriptor: &ServerDescriptor, args: &RenderArgs<'_>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloudInitRenderer;

impl BootScriptRenderer for CloudInitRenderer {
    fn render(&self, descriptor: &ServerDescriptor, args: &RenderArgs<'_>) -> Result<String> {
        let script = match args.variant {
            TemplateVariant::Update => return Ok(update_script(descriptor)),
            TemplateVariant::CloudConfig | TemplateVariant::Bash => {
                install_script(descriptor, args.mount, false)
            }
            TemplateVariant::ProxyCloudConfig | TemplateVariant::ProxyBash => {
                install_script(descriptor, args.mount, true)
            }
        };

        Ok(match args.variant {
            TemplateVariant::CloudConfig | TemplateVariant::ProxyCloudConfig => {
                cloud_config(&script, args.ssh_public_key)
            }
            _ => bash(&script, args.ssh_public_key),
        })
    }
}

// ── Wrappers ──

fn cloud_config(script: &str, ssh_public_key: Option<&str>) -> String {
    let mut out = String::from("#cloud-config\n");
    if let Some(key) = ssh_public_key {
        let _ = writeln!(out, "ssh_authorized_keys:\n  - {key}");
    }
    out.push_str("package_update: true\n");
    out.push_str("packages:\n  - curl\n  - jq\n  - unzip\n");
    out.push_str("write_files:\n  - path: /usr/local/bin/mcfleet-install.sh\n");
    out.push_str("    permissions: '0755'\n    content: |\n");
    out.push_str("      #!/bin/bash\n      set -euo pipefail\n");
    for line in script.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            let _ = writeln!(out, "      {line}");
        }
    }
    out.push_str("runcmd:\n  - /usr/local/bin/mcfleet-install.sh\n");
    out
}

fn bash(script: &str, ssh_public_key: Option<&str>) -> String {
    let mut out = String::from("#!/bin/bash\nset -euo pipefail\n\n");
    if let Some(key) = ssh_public_key {
        let _ = writeln!(
            out,
            "mkdir -p /root/.ssh\necho '{key}' >> /root/.ssh/authorized_keys\n"
        );
    }
    out.push_str("apt-get update\napt-get install -y curl jq unzip\n\n");
    out.push_str(script);
    out
}

// ── Install ──

fn install_script(d: &ServerDescriptor, mount: Option<&str>, proxy: bool) -> String {
    let mut s = String::new();

    match mount.map(device_path) {
        Some(device) => {
            let _ = writeln!(s, "mkfs.ext4 -F {device}");
            let _ = writeln!(s, "mkdir -p {DATA_DIR}");
            let _ = writeln!(s, "mount {device} {DATA_DIR}");
            let _ = writeln!(
                s,
                "echo '{device} {DATA_DIR} ext4 defaults,nofail 0 2' >> /etc/fstab"
            );
        }
        None => {
            let _ = writeln!(s, "mkdir -p {DATA_DIR}");
        }
    }
    s.push('\n');

    if d.edition.needs_jdk() {
        let _ = writeln!(s, "{}\n", jdk_install(d));
    }

    let _ = writeln!(s, "cd {DATA_DIR}");
    s.push_str(&download(d));
    s.push('\n');

    if !proxy {
        let _ = writeln!(s, "echo 'eula=true' > {DATA_DIR}/eula.txt");
        let _ = writeln!(s, "cat > {DATA_DIR}/server.properties <<'MCFLEET_EOF'");
        s.push_str(&server_properties(d));
        s.push_str("MCFLEET_EOF\n\n");
    }

    s.push_str(&systemd_unit(d));

    if d.monitoring {
        s.push('\n');
        s.push_str(&monitoring());
    }

    s
}

fn device_path(mount: &str) -> String {
    if mount.starts_with('/') {
        mount.to_string()
    } else {
        format!("/dev/{mount}")
    }
}

fn jdk_install(d: &ServerDescriptor) -> String {
    format!(
        "apt-get install -y openjdk-{}-jre-headless",
        d.java.jdk_version
    )
}

fn server_properties(d: &ServerDescriptor) -> String {
    let mut p = String::new();
    for line in d.properties.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let _ = writeln!(p, "{line}");
    }
    if d.edition.is_bedrock_family() {
        let _ = writeln!(p, "server-port={}", d.game_port());
        let _ = writeln!(p, "server-portv6={}", d.game_port() + 1);
    } else {
        let _ = writeln!(p, "server-port={}", d.game_port());
        let _ = writeln!(p, "enable-rcon={}", d.rcon.enabled);
        if d.rcon.enabled {
            let _ = writeln!(p, "rcon.port={}", d.rcon.port);
            let _ = writeln!(p, "rcon.password={}", d.rcon.password);
            let _ = writeln!(p, "broadcast-rcon-to-ops={}", d.rcon.broadcast);
        }
    }
    p
}

fn exec_start(d: &ServerDescriptor) -> String {
    if d.edition == Edition::Bedrock {
        return format!("/bin/sh -c 'LD_LIBRARY_PATH={DATA_DIR} {DATA_DIR}/bedrock_server'");
    }
    let mut cmd = format!(
        "/usr/bin/java -Xmx{} -Xms{}",
        d.java.xmx, d.java.xms
    );
    if !d.java.options.trim().is_empty() {
        cmd.push(' ');
        cmd.push_str(d.java.options.trim());
    }
    let _ = write!(cmd, " -jar {DATA_DIR}/server.jar");
    if !d.edition.is_bedrock_family() && !d.edition.is_proxy() {
        cmd.push_str(" nogui");
    }
    cmd
}

fn systemd_unit(d: &ServerDescriptor) -> String {
    format!(
        "cat > /etc/systemd/system/{SERVICE_NAME} <<'MCFLEET_EOF'
[Unit]
Description={edition} server
After=network-online.target
Wants=network-online.target

[Service]
WorkingDirectory={DATA_DIR}
ExecStart={exec}
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
MCFLEET_EOF
systemctl daemon-reload
systemctl enable --now {SERVICE_NAME}
",
        edition = d.edition,
        exec = exec_start(d),
    )
}

fn monitoring() -> String {
    format!(
        "apt-get install -y prometheus prometheus-node-exporter
sed -i 's/^ARGS=.*/ARGS=\"--web.listen-address=:{MONITORING_PORT}\"/' /etc/default/prometheus
systemctl enable --now prometheus-node-exporter
systemctl restart prometheus
"
    )
}

// ── Downloads ──

fn papermc_download(project: &str, version: &str) -> String {
    let api = format!("https://api.papermc.io/v2/projects/{project}");
    let version = if version.is_empty() {
        format!("$(curl -s {api} | jq -r '.versions[-1]')")
    } else {
        version.to_string()
    };
    format!(
        "VERSION={version}
BUILD=$(curl -s {api}/versions/$VERSION/builds | jq -r '.builds[-1].build')
curl -sLo server.jar {api}/versions/$VERSION/builds/$BUILD/downloads/{project}-$VERSION-$BUILD.jar
"
    )
}

/// Shell that fetches the edition's server binary into the working directory.
fn download(d: &ServerDescriptor) -> String {
    let v = d.version.as_str();
    match d.edition {
        Edition::Java => {
            let select = if v.is_empty() {
                ".latest.release as $v | .versions[] | select(.id == $v) | .url".to_string()
            } else {
                format!(".versions[] | select(.id == \"{v}\") | .url")
            };
            format!(
                "META=$(curl -s https://launchermeta.mojang.com/mc/game/version_manifest.json | jq -r '{select}')
curl -sLo server.jar \"$(curl -s \"$META\" | jq -r '.downloads.server.url')\"
"
            )
        }
        Edition::Craftbukkit | Edition::Spigot => {
            let rev = if v.is_empty() { "latest" } else { v };
            let compile = if d.edition == Edition::Craftbukkit {
                " --compile craftbukkit"
            } else {
                ""
            };
            format!(
                "curl -sLo BuildTools.jar https://hub.spigotmc.org/jenkins/job/BuildTools/lastSuccessfulBuild/artifact/target/BuildTools.jar
java -jar BuildTools.jar --rev {rev}{compile}
mv {name}-*.jar server.jar
",
                name = d.edition.as_str(),
            )
        }
        Edition::Fabric => {
            format!(
                "curl -sLo fabric-installer.jar https://maven.fabricmc.net/net/fabricmc/fabric-installer/1.0.1/fabric-installer-1.0.1.jar
java -jar fabric-installer.jar server {version} -downloadMinecraft
mv fabric-server-launch.jar server.jar
",
                version = if v.is_empty() { String::new() } else { format!("-mcversion {v}") },
            )
        }
        Edition::Forge => format!(
            "curl -sLo forge-installer.jar https://maven.minecraftforge.net/net/minecraftforge/forge/{v}/forge-{v}-installer.jar
java -jar forge-installer.jar --installServer
ln -sf $(ls forge-*.jar | grep -v installer | head -n1) server.jar
"
        ),
        Edition::Papermc => papermc_download("paper", v),
        Edition::Waterfall => papermc_download("waterfall", v),
        Edition::Velocity => papermc_download("velocity", v),
        Edition::Purpur => {
            let v = if v.is_empty() { "latest" } else { v };
            format!("curl -sLo server.jar https://api.purpurmc.org/v2/purpur/{v}/latest/download\n")
        }
        Edition::Bedrock => format!(
            "curl -sLo bedrock-server.zip https://minecraft.azureedge.net/bin-linux/bedrock-server-{v}.zip
unzip -o bedrock-server.zip
chmod +x bedrock_server
"
        ),
        Edition::Nukkit => "curl -sLo server.jar https://ci.opencollab.dev/job/NukkitX/job/Nukkit/job/master/lastSuccessfulBuild/artifact/target/nukkit-1.0-SNAPSHOT.jar\n".to_string(),
        Edition::Powernukkit => format!(
            "curl -sLo server.jar https://github.com/PowerNukkit/PowerNukkit/releases/download/v{v}/powernukkit-{v}-shaded.jar\n"
        ),
        Edition::Bungeecord => "curl -sLo server.jar https://ci.md-5.net/job/BungeeCord/lastSuccessfulBuild/artifact/bootstrap/target/BungeeCord.jar\n".to_string(),
    }
}

/// Replace the installed binary with the descriptor's version.
fn update_script(d: &ServerDescriptor) -> String {
    let mut s = format!("cd {DATA_DIR}\n");
    if d.edition == Edition::Fabric {
        s.push_str("rm -f server.jar fabric-server-launch.jar\n");
    }
    s.push_str(&download(d));
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::descriptor;

    fn render(d: &ServerDescriptor, variant: TemplateVariant, mount: Option<&str>) -> String {
        CloudInitRenderer
            .render(
                d,
                &RenderArgs {
                    mount,
                    ssh_public_key: None,
                    variant,
                },
            )
            .unwrap()
    }

    #[test]
    fn proxy_editions_get_proxy_variants() {
        let lobby = descriptor("lobby", Edition::Papermc);
        let proxy = descriptor("edge", Edition::Velocity);

        assert_eq!(
            variant_for(&lobby, ScriptFormat::CloudConfig),
            TemplateVariant::CloudConfig
        );
        assert_eq!(
            variant_for(&proxy, ScriptFormat::CloudConfig),
            TemplateVariant::ProxyCloudConfig
        );
        assert_eq!(
            variant_for(&proxy, ScriptFormat::Bash),
            TemplateVariant::ProxyBash
        );
    }

    #[test]
    fn cloud_config_installs_jdk_service_and_properties() {
        let mut d = descriptor("lobby", Edition::Papermc);
        d.rcon.enabled = true;
        d.rcon.password = "hunter2".into();
        d.properties = "motd=hello\n\ndifficulty=hard".into();

        let out = render(&d, TemplateVariant::CloudConfig, None);

        assert!(out.starts_with("#cloud-config\n"));
        assert!(out.contains("openjdk-21-jre-headless"));
        assert!(out.contains("motd=hello\n      difficulty=hard\n      server-port=25565"));
        assert!(out.contains("rcon.password=hunter2"));
        assert!(out.contains(&format!("/etc/systemd/system/{SERVICE_NAME}")));
        assert!(out.contains("-jar /minecraft/server.jar nogui"));
        assert!(!out.contains("mkfs.ext4"));
        assert!(!out.contains("prometheus"));
    }

    #[test]
    fn bedrock_bash_mounts_volume_and_skips_jdk() {
        let mut d = descriptor("pe", Edition::Bedrock);
        d.monitoring = true;

        let out = render(&d, TemplateVariant::Bash, Some("sdb"));

        assert!(out.starts_with("#!/bin/bash\n"));
        assert!(out.contains("mkfs.ext4 -F /dev/sdb"));
        assert!(out.contains("bedrock-server-1.20.4.zip"));
        assert!(out.contains("bedrock_server"));
        assert!(!out.contains("openjdk"));
        assert!(!out.contains("enable-rcon"));
        assert!(out.contains("--web.listen-address=:9090"));
    }

    #[test]
    fn absolute_device_paths_are_used_as_given() {
        let d = descriptor("lobby", Edition::Papermc);
        let out = render(
            &d,
            TemplateVariant::CloudConfig,
            Some("/dev/disk/by-id/scsi-0HC_Volume_4711"),
        );

        assert!(out.contains("mkfs.ext4 -F /dev/disk/by-id/scsi-0HC_Volume_4711\n"));
        assert!(out.contains("mount /dev/disk/by-id/scsi-0HC_Volume_4711 /minecraft"));
        assert!(!out.contains("/dev//dev"));
    }

    #[test]
    fn proxies_skip_eula_and_properties() {
        let d = descriptor("edge", Edition::Waterfall);
        let out = render(&d, TemplateVariant::ProxyBash, None);
        assert!(!out.contains("eula.txt"));
        assert!(out.contains("projects/waterfall"));
        assert!(!out.contains("nogui"));
    }

    #[test]
    fn update_script_only_replaces_the_binary() {
        let d = descriptor("mods", Edition::Fabric);
        let out = render(&d, TemplateVariant::Update, None);
        assert!(out.starts_with("cd /minecraft\nrm -f server.jar"));
        assert!(out.contains("-mcversion 1.20.4"));
        assert!(!out.contains("systemctl"));
    }

    #[test]
    fn inline_key_is_authorized() {
        let d = descriptor("lobby", Edition::Java);
        let out = CloudInitRenderer
            .render(
                &d,
                &RenderArgs {
                    mount: None,
                    ssh_public_key: Some("ssh-ed25519 AAAA me"),
                    variant: TemplateVariant::CloudConfig,
                },
            )
            .unwrap();
        assert!(out.contains("ssh_authorized_keys:\n  - ssh-ed25519 AAAA me"));
    }
}
