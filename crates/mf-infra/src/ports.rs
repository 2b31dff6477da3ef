use std::fmt;

use serde::Serialize;

use crate::types::ServerDescriptor;

/// Prometheus listens here when monitoring is enabled.
pub const MONITORING_PORT: u16 = 9090;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// One inbound rule, open to the whole internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FirewallPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl FirewallPort {
    pub const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub const fn udp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Udp,
        }
    }
}

impl fmt::Display for FirewallPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

/// Inbound ports a server needs, in rule-creation order.
///
/// SSH always comes first. Bedrock-family editions are reached over UDP and
/// have no RCON; everything else is TCP. Duplicates collapse to the first
/// occurrence.
pub fn derive_firewall_ports(descriptor: &ServerDescriptor) -> Vec<FirewallPort> {
    let mut ports = vec![FirewallPort::tcp(descriptor.ssh.port)];

    if descriptor.edition.is_bedrock_family() {
        ports.push(FirewallPort::udp(descriptor.game_port()));
    } else {
        ports.push(FirewallPort::tcp(descriptor.game_port()));
        if descriptor.rcon.enabled {
            ports.push(FirewallPort::tcp(descriptor.rcon.port));
        }
    }

    if descriptor.monitoring {
        ports.push(FirewallPort::tcp(MONITORING_PORT));
    }

    let mut seen = Vec::with_capacity(ports.len());
    ports.retain(|p| {
        if seen.contains(p) {
            false
        } else {
            seen.push(*p);
            true
        }
    });
    ports
}
