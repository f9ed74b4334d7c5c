// Virtual Ethernet (veth) pair management module
// Creates a pair inside the container namespace, moves the host end out and
// plugs it into the bridge.

use crate::cni::types::Interface;
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::namespace::NetNs;
use crate::network::naming::NameGen;
use crate::network::netlink::{LinkInfo, NetlinkHandle};
use crate::network::sysctl::Sysctl;

pub const VETH_PREFIX: &str = "veth";
const MAX_NAME_ATTEMPTS: usize = 10;

/// Container-side parameters of a veth pair.
#[derive(Debug, Clone, Copy)]
pub struct VethConfig<'a> {
    pub if_name: &'a str,
    /// 0 keeps the kernel default
    pub mtu: u32,
    pub hairpin: bool,
    pub vlan: Option<u16>,
}

/// Host-side collaborators shared by every pair set up in one request.
pub struct HostNet<'a> {
    pub nl: &'a NetlinkHandle,
    pub sysctl: &'a Sysctl,
}

/// Create a veth pair crossing into `netns` and attach its host end to `bridge`.
/// Returns the host and container interface records.
pub async fn setup_veth(
    host: &HostNet<'_>,
    names: &mut NameGen,
    netns: &NetNs,
    bridge: &LinkInfo,
    conf: VethConfig<'_>,
) -> NetworkResult<(Interface, Interface)> {
    let host_ns = NetNs::current()?;

    let (host_name, container) = netns
        .run(|nl| async move {
            let host_name = create_pair(&nl, names, conf.if_name).await?;

            let host_end = nl.link_by_name(&host_name).await?;
            let container = nl.link_by_name(conf.if_name).await?;
            if conf.mtu > 0 {
                nl.set_mtu(host_end.index, conf.mtu).await?;
                nl.set_mtu(container.index, conf.mtu).await?;
            }
            nl.set_link_up(container.index).await?;
            nl.set_link_netns(host_end.index, host_ns.fd()).await?;

            Ok((host_name, container))
        })
        .await?;

    // index changes when the link moves namespaces
    let host_veth = host.nl.link_by_name(&host_name).await?;
    host.nl.set_link_up(host_veth.index).await?;
    host.nl
        .set_link_master(host_veth.index, bridge.index)
        .await
        .map_err(|e| {
            NetworkError::Config(format!(
                "failed to connect {:?} to bridge {}: {}",
                host_name, bridge.name, e
            ))
        })?;
    host.sysctl.set_hairpin(&host_name, conf.hairpin)?;

    if let Some(vid) = conf.vlan {
        add_port_vlan(&host_name, vid).await?;
    }

    tracing::debug!(
        "Veth pair {} <-> {} attached to {}",
        host_name,
        conf.if_name,
        bridge.name
    );

    Ok((
        Interface {
            name: host_name,
            mac: host_veth.mac,
            sandbox: String::new(),
        },
        Interface {
            name: container.name,
            mac: container.mac,
            sandbox: netns.path().display().to_string(),
        },
    ))
}

/// Create `if_name` with a random peer name, retrying peer name collisions.
async fn create_pair(
    nl: &NetlinkHandle,
    names: &mut NameGen,
    if_name: &str,
) -> NetworkResult<String> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let peer = names.next(VETH_PREFIX);
        match nl.add_veth(if_name, &peer).await {
            Ok(()) => return Ok(peer),
            Err(NetworkError::AlreadyExists(_)) => {
                if nl.find_link(if_name).await?.is_some() {
                    return Err(NetworkError::Conflict(format!(
                        "container veth name provided ({}) already exists",
                        if_name
                    )));
                }
                tracing::debug!("Peer name {} taken, retrying", peer);
            }
            Err(e) => return Err(e),
        }
    }
    Err(NetworkError::Conflict(format!(
        "failed to find a free peer name for {} after {} attempts",
        if_name, MAX_NAME_ATTEMPTS
    )))
}

/// Make `vid` the port's PVID with untagged egress
pub async fn add_port_vlan(port: &str, vid: u16) -> NetworkResult<()> {
    let args = port_vlan_args(port, vid);
    let output = tokio::process::Command::new("bridge")
        .args(&args)
        .output()
        .await
        .map_err(NetworkError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Command {
            cmd: format!("bridge {}", args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(())
}

fn port_vlan_args(port: &str, vid: u16) -> Vec<String> {
    vec![
        "vlan".to_string(),
        "add".to_string(),
        "dev".to_string(),
        port.to_string(),
        "vid".to_string(),
        vid.to_string(),
        "pvid".to_string(),
        "untagged".to_string(),
        "master".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_command_line() {
        assert_eq!(
            port_vlan_args("veth0a1b2c3d", 100).join(" "),
            "vlan add dev veth0a1b2c3d vid 100 pvid untagged master"
        );
    }
}
