use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// QoS traffic class of the socket towards the server.
///
/// The class is a platform-independent request; it is translated into a
/// DSCP codepoint and applied to the socket after bind and before connect.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QosKind {
    #[default]
    BestEffort,
    Voice,
    Video,
    Control,
    Signalling,
}

impl QosKind {
    /// The DSCP codepoint conventionally used for the class.
    pub fn dscp(&self) -> u8 {
        match self {
            Self::BestEffort => 0,
            // EF
            Self::Voice => 46,
            // AF41
            Self::Video => 34,
            // CS6
            Self::Control => 48,
            // CS3
            Self::Signalling => 24,
        }
    }
}

/// Low-level overrides for the traffic class.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub struct QosParams {
    ///
    /// Raw DSCP codepoint, takes precedence over the value implied by the
    /// traffic class.
    ///
    #[serde(default)]
    pub dscp: Option<u8>,
    ///
    /// Socket priority (802.1p class), applied where the platform supports
    /// it.
    ///
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TurnConfig {
    ///
    /// Read buffer size.
    ///
    /// A single TURN message on the socket never exceeds this, framed
    /// messages larger than it are treated as a protocol error. Should not
    /// be set below 1500.
    ///
    #[serde(default = "TurnConfig::max_pkt_size")]
    pub max_pkt_size: usize,
    ///
    /// Source interface/port hint.
    ///
    /// When absent the socket binds the wildcard address of the client's
    /// address family with an ephemeral port.
    ///
    #[serde(default)]
    pub bound_addr: Option<SocketAddr>,
    ///
    /// Count of sequential ports to try from the bound address port.
    ///
    /// Binding starts at the configured port and walks forward one port at
    /// a time, capped at 100 attempts.
    ///
    #[serde(default)]
    pub port_range: u16,
    ///
    /// QoS traffic class for the server socket.
    ///
    #[serde(default)]
    pub qos: QosKind,
    #[serde(default)]
    pub qos_params: Option<QosParams>,
    ///
    /// If set, a failure to apply the QoS settings does not abort socket
    /// creation.
    ///
    #[serde(default = "TurnConfig::qos_ignore_error")]
    pub qos_ignore_error: bool,
}

impl TurnConfig {
    /// The effective DSCP codepoint for the socket.
    pub fn dscp(&self) -> u8 {
        self.qos_params
            .and_then(|it| it.dscp)
            .unwrap_or_else(|| self.qos.dscp())
    }
}

impl TurnConfig {
    fn max_pkt_size() -> usize {
        3000
    }

    fn qos_ignore_error() -> bool {
        true
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_pkt_size: Self::max_pkt_size(),
            qos_ignore_error: Self::qos_ignore_error(),
            bound_addr: None,
            port_range: 0,
            qos: QosKind::default(),
            qos_params: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnConfig::default();

        assert_eq!(config.max_pkt_size, 3000);
        assert_eq!(config.port_range, 0);
        assert!(config.qos_ignore_error);
        assert_eq!(config.dscp(), 0);
    }

    #[test]
    fn test_dscp_override() {
        let mut config = TurnConfig {
            qos: QosKind::Voice,
            ..Default::default()
        };

        assert_eq!(config.dscp(), 46);

        config.qos_params = Some(QosParams {
            dscp: Some(12),
            priority: None,
        });

        assert_eq!(config.dscp(), 12);
    }
}
