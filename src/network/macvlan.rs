// Macvlan device management
// Creates a macvlan on a host master directly inside the container namespace.

use crate::cni::config::MacvlanConfig;
use crate::cni::types::Interface;
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::namespace::NetNs;
use crate::network::naming::NameGen;
use crate::network::netlink::{parse_mac, LinkInfo, NetlinkHandle};
use crate::network::veth::HostNet;

/// Host default for an unset `master`
pub const PARENT_INTERFACE_ENV: &str = "MACVLAN_PARENT_INTERFACE";
const TMP_PREFIX: &str = "mvtmp";

// IFLA_MACVLAN_MODE values
const MODE_PRIVATE: u32 = 1;
const MODE_VEPA: u32 = 2;
const MODE_BRIDGE: u32 = 4;
const MODE_PASSTHRU: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacvlanMode {
    Bridge,
    Private,
    Vepa,
    Passthru,
}

impl MacvlanMode {
    /// Config spelling; empty means bridge
    pub fn parse(mode: &str) -> NetworkResult<Self> {
        match mode {
            "" | "bridge" => Ok(MacvlanMode::Bridge),
            "private" => Ok(MacvlanMode::Private),
            "vepa" => Ok(MacvlanMode::Vepa),
            "passthru" => Ok(MacvlanMode::Passthru),
            other => Err(NetworkError::Config(format!(
                "unknown macvlan mode: {:?}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MacvlanMode::Bridge => "bridge",
            MacvlanMode::Private => "private",
            MacvlanMode::Vepa => "vepa",
            MacvlanMode::Passthru => "passthru",
        }
    }

    pub fn to_kernel(self) -> u32 {
        match self {
            MacvlanMode::Bridge => MODE_BRIDGE,
            MacvlanMode::Private => MODE_PRIVATE,
            MacvlanMode::Vepa => MODE_VEPA,
            MacvlanMode::Passthru => MODE_PASSTHRU,
        }
    }

    pub fn from_kernel(mode: u32) -> Option<Self> {
        match mode {
            MODE_BRIDGE => Some(MacvlanMode::Bridge),
            MODE_PRIVATE => Some(MacvlanMode::Private),
            MODE_VEPA => Some(MacvlanMode::Vepa),
            MODE_PASSTHRU => Some(MacvlanMode::Passthru),
            _ => None,
        }
    }
}

/// Configured master, else the host default from the environment.
/// `None` means fall back to the default-route interface.
pub fn configured_master(conf: &MacvlanConfig, env_default: Option<String>) -> Option<String> {
    if !conf.master.is_empty() {
        return Some(conf.master.clone());
    }
    env_default.filter(|name| !name.is_empty())
}

/// Look up the master link and check the requested MTU fits under it.
pub async fn resolve_master(nl: &NetlinkHandle, conf: &MacvlanConfig) -> NetworkResult<LinkInfo> {
    let name = match configured_master(conf, std::env::var(PARENT_INTERFACE_ENV).ok()) {
        Some(name) => name,
        None => nl.default_route_link().await?,
    };

    let master = nl.link_by_name(&name).await.map_err(|e| {
        NetworkError::Config(format!("failed to lookup master {:?}: {}", name, e))
    })?;
    check_mtu(conf.mtu, &master)?;
    Ok(master)
}

fn check_mtu(mtu: i32, master: &LinkInfo) -> NetworkResult<()> {
    if mtu < 0 || mtu as u32 > master.mtu {
        return Err(NetworkError::Config(format!(
            "invalid MTU {}, must be [0, master MTU({})]",
            mtu, master.mtu
        )));
    }
    Ok(())
}

/// Create the macvlan inside `netns` and name it `if_name` there.
///
/// The device is created under a temporary name so it cannot collide with a
/// host link while it is being moved. Any failure after creation deletes it.
pub async fn create_macvlan(
    host: &HostNet<'_>,
    names: &mut NameGen,
    conf: &MacvlanConfig,
    if_name: &str,
    netns: &NetNs,
) -> NetworkResult<Interface> {
    let mode = MacvlanMode::parse(&conf.mode)?;
    let master = resolve_master(host.nl, conf).await?;
    let mac = if conf.mac.is_empty() {
        None
    } else {
        Some(parse_mac(&conf.mac)?)
    };

    let tmp_name = names.next(TMP_PREFIX);
    host.nl
        .add_macvlan(
            &tmp_name,
            master.index,
            mode.to_kernel(),
            conf.mtu as u32,
            mac,
            netns.fd(),
        )
        .await
        .map_err(|e| NetworkError::Config(format!("failed to create macvlan: {}", e)))?;

    let sysctl = host.sysctl;
    let tmp_ref = tmp_name.as_str();
    let configured = netns
        .run(|nl| async move {
            let tmp = nl.link_by_name(tmp_ref).await?;

            if let Err(e) = sysctl.enable_proxy_arp(tmp_ref) {
                discard(&nl, tmp.index).await;
                return Err(NetworkError::Config(format!(
                    "failed to set proxy_arp on newly added interface {:?}: {}",
                    tmp_ref, e
                )));
            }

            if let Err(e) = nl.set_link_name(tmp.index, if_name).await {
                discard(&nl, tmp.index).await;
                return Err(NetworkError::Config(format!(
                    "failed to rename macvlan to {:?}: {}",
                    if_name, e
                )));
            }

            // renaming keeps the ifindex
            match nl.link_by_index(tmp.index).await {
                Ok(link) => Ok(link),
                Err(e) => {
                    discard(&nl, tmp.index).await;
                    Err(e)
                }
            }
        })
        .await;

    let link = match configured {
        Ok(link) => link,
        Err(e) => {
            // the namespace may never have been entered
            discard_by_name(netns, tmp_ref).await;
            return Err(e);
        }
    };

    tracing::info!(
        "Macvlan {} ({}) on {} created in {}",
        if_name,
        mode.as_str(),
        master.name,
        netns.path().display()
    );

    Ok(Interface {
        name: link.name,
        mac: link.mac,
        sandbox: netns.path().display().to_string(),
    })
}

async fn discard_by_name(netns: &NetNs, name: &str) {
    let outcome = netns
        .run(|nl| async move { nl.delete_link(name).await })
        .await;
    if let Err(e) = outcome {
        tracing::warn!("Failed to remove half-configured macvlan {}: {}", name, e);
    }
}

async fn discard(nl: &NetlinkHandle, index: u32) {
    if let Err(e) = nl.delete_link_index(index).await {
        tracing::warn!("Failed to remove half-configured macvlan {}: {}", index, e);
    }
}

/// The container record of a previous result against the link found in
/// the namespace.
pub fn validate_container_interface(
    intf: &Interface,
    link: Option<&LinkInfo>,
    expected: MacvlanMode,
) -> NetworkResult<()> {
    if intf.name.is_empty() {
        return Err(NetworkError::mismatch(
            "macvlan",
            "container interface name missing in prevResult",
        ));
    }
    let link = link.ok_or_else(|| {
        NetworkError::NotFound(format!("container interface {}", intf.name))
    })?;
    if intf.sandbox.is_empty() {
        return Err(NetworkError::mismatch(
            "macvlan",
            format!("container interface {} should not be in host namespace", intf.name),
        ));
    }
    if !link.is_macvlan() {
        return Err(NetworkError::mismatch(
            "macvlan",
            format!("container interface {} not of type macvlan", intf.name),
        ));
    }

    let live = link.macvlan_mode.and_then(MacvlanMode::from_kernel);
    if live != Some(expected) {
        return Err(NetworkError::mismatch(
            "macvlan",
            format!(
                "container macvlan mode {} does not match expected value: {}",
                live.map_or("unknown", MacvlanMode::as_str),
                expected.as_str()
            ),
        ));
    }

    if !intf.mac.is_empty() && !intf.mac.eq_ignore_ascii_case(&link.mac) {
        return Err(NetworkError::mismatch(
            "macvlan",
            format!(
                "interface {} MAC {} doesn't match container MAC: {}",
                intf.name, intf.mac, link.mac
            ),
        ));
    }
    Ok(())
}
