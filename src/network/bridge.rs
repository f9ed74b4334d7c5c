// Bridge management module
// Host bridge lifecycle, gateway addresses on it, and read-back validation
// of the bridge side of an attachment.

use crate::cni::types::Interface;
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::namespace::NetNs;
use crate::network::naming::NameGen;
use crate::network::netlink::{Family, LinkInfo, NetlinkHandle};
use crate::network::veth::{setup_veth, HostNet, VethConfig};
use ipnet::IpNet;

/// Create the bridge if needed and make sure it is usable.
///
/// An existing link with the same name is accepted only if it is a bridge.
pub async fn ensure_bridge(
    host: &HostNet<'_>,
    name: &str,
    mtu: u32,
    promiscuous: bool,
    vlan_filtering: bool,
) -> NetworkResult<LinkInfo> {
    match host.nl.add_bridge(name, mtu).await {
        Ok(()) => tracing::info!("Created bridge {}", name),
        Err(NetworkError::AlreadyExists(_)) => {
            tracing::debug!("Bridge {} already exists", name)
        }
        Err(e) => {
            return Err(NetworkError::Config(format!(
                "could not add {:?}: {}",
                name, e
            )))
        }
    }

    // re-fetch: if it already existed it must really be a bridge
    let br = bridge_by_name(host.nl, name).await?;

    if vlan_filtering {
        host.sysctl.enable_vlan_filtering(name)?;
    }
    if promiscuous {
        host.nl.set_promiscuous(br.index).await?;
    }

    // we own the routes on this interface
    if let Err(e) = host.sysctl.disable_accept_ra(name) {
        tracing::debug!("accept_ra not disabled on {}: {}", name, e);
    }

    host.nl.set_link_up(br.index).await?;
    Ok(br)
}

pub async fn bridge_by_name(nl: &NetlinkHandle, name: &str) -> NetworkResult<LinkInfo> {
    let link = nl.link_by_name(name).await?;
    if !link.is_bridge() {
        return Err(NetworkError::WrongKind {
            name: name.to_string(),
            expected: "bridge",
        });
    }
    Ok(link)
}

/// What `ensure_addr` has to do for one wanted address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrPlan {
    /// Identical address already assigned
    Present,
    /// Remove `remove` (only with force) then add
    Add { remove: Vec<IpNet> },
}

/// Decide how to put `wanted` on a link that currently holds `existing`
/// (same family only). Any other IPv4 address conflicts; IPv6 addresses
/// conflict only when the subnets overlap.
pub fn plan_addr(
    link_name: &str,
    existing: &[IpNet],
    wanted: IpNet,
    force: bool,
) -> NetworkResult<AddrPlan> {
    if existing.contains(&wanted) {
        return Ok(AddrPlan::Present);
    }

    let mut remove = Vec::new();
    for addr in existing {
        let conflicting = match wanted {
            IpNet::V4(_) => true,
            IpNet::V6(_) => addr.contains(&wanted.addr()) || wanted.contains(&addr.addr()),
        };
        if !conflicting {
            continue;
        }
        if !force {
            return Err(NetworkError::Conflict(format!(
                "{:?} already has an IP address different from {}",
                link_name, wanted
            )));
        }
        remove.push(*addr);
    }
    Ok(AddrPlan::Add { remove })
}

/// Put `subnet` on `link`, replacing conflicting addresses when `force`.
pub async fn ensure_addr(
    nl: &NetlinkHandle,
    link: &LinkInfo,
    family: Family,
    subnet: IpNet,
    force: bool,
) -> NetworkResult<()> {
    let existing = nl.addresses(link.index, Some(family)).await?;
    let remove = match plan_addr(&link.name, &existing, subnet, force)? {
        AddrPlan::Present => return Ok(()),
        AddrPlan::Add { remove } => remove,
    };

    for addr in remove {
        tracing::info!("Replacing {} on {} with {}", addr, link.name, subnet);
        nl.del_address(link.index, addr).await?;
    }
    nl.add_address(link.index, subnet).await?;

    // pin the MAC: otherwise the bridge takes the lowest port MAC and
    // changes as ports come and go
    nl.set_hardware_addr(link.index, &link.mac).await?;
    Ok(())
}

/// Read-only variant of `ensure_addr` for every gateway: fails with the
/// same conflict error without touching the kernel. A missing link has no
/// conflicts.
pub async fn check_addr_conflict(
    nl: &NetlinkHandle,
    link_name: &str,
    gateways: &[IpNet],
    force: bool,
) -> NetworkResult<()> {
    if force || gateways.is_empty() {
        return Ok(());
    }
    let Some(link) = nl.find_link(link_name).await? else {
        return Ok(());
    };
    for gw in gateways {
        let family = Family::of(&gw.addr());
        let existing = nl.addresses(link.index, Some(family)).await?;
        plan_addr(link_name, &existing, *gw, false)?;
    }
    Ok(())
}

pub fn vlan_interface_name(bridge: &str, vlan: u16) -> String {
    format!("{}.{}", bridge, vlan)
}

/// Gateway-side interface for a VLAN: one end of a veth pair in the host
/// namespace, its peer a tagged port of the bridge.
pub async fn ensure_vlan_interface(
    host: &HostNet<'_>,
    names: &mut NameGen,
    bridge: &LinkInfo,
    vlan: u16,
) -> NetworkResult<LinkInfo> {
    let name = vlan_interface_name(&bridge.name, vlan);
    if let Some(link) = host.nl.find_link(&name).await? {
        return Ok(link);
    }

    let host_ns = NetNs::current()?;
    let conf = VethConfig {
        if_name: &name,
        mtu: bridge.mtu,
        hairpin: false,
        vlan: Some(vlan),
    };
    setup_veth(host, names, &host_ns, bridge, conf)
        .await
        .map_err(|e| {
            NetworkError::Config(format!("failed to create vlan gateway {:?}: {}", name, e))
        })?;

    tracing::info!("Created VLAN gateway interface {}", name);
    host.nl.link_by_name(&name).await
}

// ── Check ─────────────────────────────────────────────────────────────

/// Live kernel view of one interface of a previous result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveInterfaceRecord {
    pub name: String,
    pub ifindex: u32,
    pub peer_index: u32,
    pub master_index: u32,
    pub found: bool,
}

impl LiveInterfaceRecord {
    fn from_link(link: &LinkInfo) -> Self {
        Self {
            name: link.name.clone(),
            ifindex: link.index,
            peer_index: link.peer_index.unwrap_or(0),
            master_index: link.master_index.unwrap_or(0),
            found: true,
        }
    }
}

fn lookup<'a>(intf: &Interface, link: Option<&'a LinkInfo>) -> NetworkResult<&'a LinkInfo> {
    if intf.name.is_empty() {
        return Err(NetworkError::mismatch("interface", "name missing"));
    }
    link.ok_or_else(|| NetworkError::NotFound(format!("interface {}", intf.name)))
}

fn check_mac(subject: &'static str, intf: &Interface, link: &LinkInfo) -> NetworkResult<()> {
    if !intf.mac.is_empty() && !intf.mac.eq_ignore_ascii_case(&link.mac) {
        return Err(NetworkError::mismatch(
            subject,
            format!(
                "interface {} MAC {} doesn't match live MAC {}",
                intf.name, intf.mac, link.mac
            ),
        ));
    }
    Ok(())
}

/// The bridge record against its host link
pub fn validate_bridge(
    intf: &Interface,
    link: Option<&LinkInfo>,
    promiscuous: bool,
) -> NetworkResult<LiveInterfaceRecord> {
    let link = lookup(intf, link)?;
    if !intf.sandbox.is_empty() {
        return Err(NetworkError::mismatch(
            "bridge",
            format!("interface {} should not be in a sandbox", intf.name),
        ));
    }
    if !link.is_bridge() {
        return Err(NetworkError::mismatch(
            "bridge",
            format!("interface {} does not have link type of bridge", intf.name),
        ));
    }
    check_mac("bridge", intf, link)?;
    if link.promisc != promiscuous {
        return Err(NetworkError::mismatch(
            "bridge",
            format!(
                "interface {} promiscuous mode is {}, configured {}",
                intf.name, link.promisc, promiscuous
            ),
        ));
    }
    Ok(LiveInterfaceRecord::from_link(link))
}

/// The container record against the link found inside the namespace
pub fn validate_container_veth(
    intf: &Interface,
    link: Option<&LinkInfo>,
) -> NetworkResult<LiveInterfaceRecord> {
    let link = lookup(intf, link)?;
    if intf.sandbox.is_empty() {
        return Err(NetworkError::mismatch(
            "container",
            format!("interface {} is expected to be in a sandbox", intf.name),
        ));
    }
    if !link.is_veth() {
        return Err(NetworkError::mismatch(
            "container",
            format!("interface {} not of type veth", intf.name),
        ));
    }
    if link.peer_index.is_none() {
        return Err(NetworkError::mismatch(
            "container",
            format!("unable to obtain veth peer index for {}", intf.name),
        ));
    }
    check_mac("container", intf, link)?;
    Ok(LiveInterfaceRecord::from_link(link))
}

/// Whether `candidate` is the host end paired with `container` and enslaved
/// to `bridge`.
pub fn match_host_veth(
    candidate: &LinkInfo,
    bridge: &LiveInterfaceRecord,
    container: &LiveInterfaceRecord,
) -> bool {
    candidate.is_veth()
        && candidate.index == container.peer_index
        && candidate.peer_index == Some(container.ifindex)
        && candidate.master_index == Some(bridge.ifindex)
}

/// Walk the remaining records in order looking for the host veth. The first
/// match wins; records that are not veths or not paired are skipped.
/// Each record comes with its host link, `None` if it is gone.
pub fn find_host_veth(
    records: &[(&Interface, Option<&LinkInfo>)],
    bridge: &LiveInterfaceRecord,
    container: &LiveInterfaceRecord,
) -> NetworkResult<LiveInterfaceRecord> {
    for (intf, link) in records {
        let link = lookup(intf, *link)?;
        if !intf.sandbox.is_empty() {
            return Err(NetworkError::mismatch(
                "veth",
                format!("interface {} should not be in a sandbox", intf.name),
            ));
        }
        if !match_host_veth(link, bridge, container) {
            continue;
        }
        check_mac("veth", intf, link)?;
        return Ok(LiveInterfaceRecord::from_link(link));
    }
    Err(NetworkError::mismatch(
        "veth",
        format!("veth created for bridge {} was not found", bridge.name),
    ))
}
