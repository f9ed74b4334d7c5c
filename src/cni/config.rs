use crate::cni::args::parse_cni_args;
use crate::cni::types::{Dns, ProvisionResult};
use crate::network::error::{NetworkError, NetworkResult};
use serde::Deserialize;

pub const DEFAULT_BRIDGE: &str = "cni0";
const MAX_VLAN_ID: i32 = 4094;

/// Network configuration read from stdin once per request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub is_gateway: bool,
    #[serde(default)]
    pub is_default_gateway: bool,
    #[serde(default)]
    pub force_address: bool,
    #[serde(default)]
    pub ip_masq: bool,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub hairpin_mode: bool,
    #[serde(default)]
    pub promisc_mode: bool,
    #[serde(default)]
    pub vlan: i32,
    #[serde(default)]
    pub macvlan: Option<MacvlanConfig>,
    #[serde(default)]
    pub ipam: IpamConfig,
    #[serde(default)]
    pub dns: Dns,
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    #[serde(default)]
    pub prev_result: Option<ProvisionResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MacvlanConfig {
    /// Parent link; empty falls back to the host default
    #[serde(default)]
    pub master: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub mtu: i32,
    #[serde(default)]
    pub mac: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConfig {
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub socket: String,
    /// Plugin-specific keys passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mac: String,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

impl NetworkConfig {
    /// Decode and validate stdin config. `isDefaultGateway` switches on
    /// `isGateway`. `cni_args` is the raw `CNI_ARGS` value; its `MAC=` key
    /// and `runtimeConfig.mac` override the macvlan MAC.
    pub fn parse(data: &[u8], cni_args: &str) -> NetworkResult<Self> {
        let mut conf: NetworkConfig = serde_json::from_slice(data)?;
        if conf.bridge.is_empty() {
            conf.bridge = default_bridge();
        }
        if conf.is_default_gateway {
            conf.is_gateway = true;
        }
        conf.validate()?;
        conf.apply_mac_overrides(cni_args);
        Ok(conf)
    }

    pub fn validate(&self) -> NetworkResult<()> {
        if !(0..=MAX_VLAN_ID).contains(&self.vlan) {
            return Err(NetworkError::Config(format!(
                "invalid VLAN ID {} (must be between 0 and {})",
                self.vlan, MAX_VLAN_ID
            )));
        }
        if self.hairpin_mode && self.promisc_mode {
            return Err(NetworkError::Config(
                "cannot set hairpin mode and promiscuous mode at the same time".to_string(),
            ));
        }
        if let Some(mv) = &self.macvlan {
            match mv.mode.as_str() {
                "" | "bridge" | "private" | "vepa" | "passthru" => {}
                other => {
                    return Err(NetworkError::Config(format!(
                        "unknown macvlan mode: {}",
                        other
                    )))
                }
            }
            if mv.mtu < 0 {
                return Err(NetworkError::Config(format!(
                    "invalid macvlan MTU {}",
                    mv.mtu
                )));
            }
        }
        Ok(())
    }

    fn apply_mac_overrides(&mut self, cni_args: &str) {
        let Some(mv) = self.macvlan.as_mut() else {
            return;
        };
        if let Some((_, mac)) = parse_cni_args(cni_args)
            .into_iter()
            .find(|(key, value)| key.eq_ignore_ascii_case("MAC") && !value.is_empty())
        {
            mv.mac = mac;
        }
        if !self.runtime_config.mac.is_empty() {
            mv.mac = self.runtime_config.mac.clone();
        }
    }

    /// Layer-3 mode: an IPAM plugin assigns addresses
    pub fn is_layer3(&self) -> bool {
        !self.ipam.plugin_type.is_empty()
    }

    /// Configured VLAN id, `None` for untagged
    pub fn vlan_id(&self) -> Option<u16> {
        u16::try_from(self.vlan).ok().filter(|id| *id > 0)
    }
}
