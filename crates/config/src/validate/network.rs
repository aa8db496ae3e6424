//! Listener port validation

use super::ConfigError;
use crate::server::ListenerPorts;

/// Listener a port belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Dns,
    Http,
    Https,
    Smtp,
    Smtps,
}

/// Reject two TCP listeners sharing a port.
///
/// DNS is UDP, so it may share a number with a TCP listener. Port 0
/// (ephemeral) never conflicts.
pub fn validate_ports(ports: &ListenerPorts) -> Result<(), ConfigError> {
    let tcp = [
        (PortRole::Http, ports.http),
        (PortRole::Https, ports.https),
        (PortRole::Smtp, ports.smtp),
        (PortRole::Smtps, ports.smtps),
    ];

    for (i, (first, port)) in tcp.iter().enumerate() {
        if *port == 0 {
            continue;
        }
        if let Some((second, _)) = tcp[i + 1..].iter().find(|(_, p)| p == port) {
            return Err(ConfigError::PortConflict {
                first: *first,
                second: *second,
                port: *port,
            });
        }
    }

    Ok(())
}
