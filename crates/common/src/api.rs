//! Wire vocabulary shared by the controller and devices.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Header attached to every device protocol response.
pub const CONTROLLER_HEADER: &str = "x-devconf-controller";

/// Configuration lifecycle status (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    /// Desired configuration differs from what the device last applied.
    Modified,
    /// The device applied the current configuration.
    Applied,
    /// The device failed to apply the configuration.
    Error,
    /// The configuration was cleared and waits for the device to confirm.
    Deactivating,
    /// The device confirmed the cleared configuration.
    Deactivated,
}

impl ConfigStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [ConfigStatus; 5] = [
        ConfigStatus::Modified,
        ConfigStatus::Applied,
        ConfigStatus::Error,
        ConfigStatus::Deactivating,
        ConfigStatus::Deactivated,
    ];

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigStatus::Modified => "modified",
            ConfigStatus::Applied => "applied",
            ConfigStatus::Error => "error",
            ConfigStatus::Deactivating => "deactivating",
            ConfigStatus::Deactivated => "deactivated",
        }
    }

    /// Parses a status reported by a device, accepting the legacy
    /// `running` alias for `applied`.
    pub fn from_report(raw: &str) -> Result<Self, UnknownValue> {
        match raw.trim() {
            "running" => Ok(ConfigStatus::Applied),
            other => other.parse(),
        }
    }

    /// `deactivating` and `deactivated` are only left through explicit
    /// lifecycle operations.
    pub fn is_deactivation(&self) -> bool {
        matches!(self, ConfigStatus::Deactivating | ConfigStatus::Deactivated)
    }
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownValue::new("status", s))
    }
}

/// Template kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateType {
    /// Plain configuration fragment.
    #[default]
    Generic,
    /// Fragment bound to a VPN server; attaching it provisions a VPN client.
    Vpn,
}

impl TemplateType {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateType::Generic => "generic",
            TemplateType::Vpn => "vpn",
        }
    }
}

impl FromStr for TemplateType {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" => Ok(TemplateType::Generic),
            "vpn" => Ok(TemplateType::Vpn),
            other => Err(UnknownValue::new("template type", other)),
        }
    }
}

/// VPN server implementation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VpnBackend {
    /// OpenVPN server with x509 client certificates and DH parameters.
    OpenVpn,
    /// WireGuard tunnel; every client gets a key pair and an address.
    WireGuard,
    /// VXLAN over WireGuard; clients also get a VXLAN network identifier.
    Vxlan,
    /// Any other tunnel; no certificates or DH parameters are managed.
    Generic,
}

impl VpnBackend {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnBackend::OpenVpn => "openvpn",
            VpnBackend::WireGuard => "wireguard",
            VpnBackend::Vxlan => "vxlan",
            VpnBackend::Generic => "generic",
        }
    }

    /// Servers and clients carry an X25519 key pair.
    pub fn uses_wireguard_keys(&self) -> bool {
        matches!(self, VpnBackend::WireGuard | VpnBackend::Vxlan)
    }

    /// Tunnel addressing comes from a VPN subnet, which is then mandatory.
    pub fn requires_subnet(&self) -> bool {
        self.uses_wireguard_keys()
    }
}

impl FromStr for VpnBackend {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openvpn" => Ok(VpnBackend::OpenVpn),
            "wireguard" => Ok(VpnBackend::WireGuard),
            "vxlan" => Ok(VpnBackend::Vxlan),
            "generic" => Ok(VpnBackend::Generic),
            other => Err(UnknownValue::new("vpn backend", other)),
        }
    }
}

macro_rules! impl_try_from_string {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = UnknownValue;

                fn try_from(value: String) -> Result<Self, UnknownValue> {
                    value.parse()
                }
            }
        )*
    };
}

impl_try_from_string!(ConfigStatus, TemplateType, VpnBackend);

/// Returned when a wire string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownValue {
    /// What was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl UnknownValue {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_is_reported_as_applied() {
        assert_eq!(
            ConfigStatus::from_report("running").unwrap(),
            ConfigStatus::Applied
        );
        assert_eq!(
            ConfigStatus::from_report(" error ").unwrap(),
            ConfigStatus::Error
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = ConfigStatus::from_report("exploded").unwrap_err();
        assert_eq!(err.kind, "status");
        assert_eq!(err.to_string(), "unknown status: \"exploded\"");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ConfigStatus::Deactivating).unwrap();
        assert_eq!(json, "\"deactivating\"");
        let parsed: ConfigStatus = serde_json::from_str("\"deactivated\"").unwrap();
        assert!(parsed.is_deactivation());
    }

    #[test]
    fn template_and_vpn_kinds_round_trip_their_names() {
        assert_eq!("vpn".parse::<TemplateType>().unwrap(), TemplateType::Vpn);
        assert_eq!(TemplateType::default().as_str(), "generic");
        assert_eq!(
            "openvpn".parse::<VpnBackend>().unwrap(),
            VpnBackend::OpenVpn
        );
        assert!("ipsec".parse::<VpnBackend>().is_err());
        let wireguard: VpnBackend = serde_json::from_str("\"wireguard\"").unwrap();
        assert_eq!(wireguard, VpnBackend::WireGuard);
        assert!(VpnBackend::Vxlan.requires_subnet());
        assert!(!VpnBackend::OpenVpn.uses_wireguard_keys());
    }

    #[test]
    fn stored_strings_convert_back_into_statuses() {
        assert_eq!(
            ConfigStatus::try_from("error".to_string()).unwrap(),
            ConfigStatus::Error
        );
        assert!(ConfigStatus::try_from("bogus".to_string()).is_err());
    }
}
