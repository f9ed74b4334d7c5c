// Gateway and default-route derivation from an address assignment
// Pure: works on the result only, never touches the kernel.

use crate::cni::types::{ProvisionResult, Route};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::Family;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Index of the container interface in the bridge result
/// (`[bridge, host veth, container]`).
pub const CONTAINER_IFACE_INDEX: usize = 2;

/// Gateways collected for one address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub family: Family,
    /// Gateway address with the prefix of the IP it serves
    pub gws: Vec<IpNet>,
    pub default_route_found: bool,
}

impl GatewayInfo {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            gws: Vec::new(),
            default_route_found: false,
        }
    }
}

/// Walk the assigned IPs: point each at the container interface, fill in
/// missing gateways in gateway mode, add at most one default route per
/// family, and collect the gateway networks.
pub fn calc_gateways(
    result: &mut ProvisionResult,
    is_gateway: bool,
    is_default_gateway: bool,
) -> NetworkResult<(GatewayInfo, GatewayInfo)> {
    let mut v4 = GatewayInfo::new(Family::V4);
    let mut v6 = GatewayInfo::new(Family::V6);

    let ProvisionResult { ips, routes, .. } = result;
    for ipc in ips.iter_mut() {
        let family = Family::of(&ipc.address.addr());
        check_version(ipc.version.as_deref(), family, &ipc.address)?;
        let gws = match family {
            Family::V4 => &mut v4,
            Family::V6 => &mut v6,
        };

        ipc.interface = Some(CONTAINER_IFACE_INDEX);

        if ipc.gateway.is_none() && is_gateway {
            ipc.gateway = Some(calc_gateway_ip(&ipc.address));
        }

        if is_default_gateway && !gws.default_route_found {
            let default_net = family.default_net();
            gws.default_route_found = routes
                .iter()
                .any(|route| route.gw.is_some() && route.dst == default_net);
            if !gws.default_route_found {
                routes.push(Route {
                    dst: default_net,
                    gw: ipc.gateway,
                });
                gws.default_route_found = true;
            }
        }

        if is_gateway {
            if let Some(gw) = ipc.gateway {
                let net = IpNet::new(gw, ipc.address.prefix_len()).map_err(|_| {
                    NetworkError::Config(format!(
                        "gateway {} does not match address {}",
                        gw, ipc.address
                    ))
                })?;
                gws.gws.push(net);
            }
        }
    }

    Ok((v4, v6))
}

fn check_version(version: Option<&str>, family: Family, address: &IpNet) -> NetworkResult<()> {
    match (version, family) {
        (None, _) | (Some(""), _) | (Some("4"), Family::V4) | (Some("6"), Family::V6) => Ok(()),
        (Some(v), _) => Err(NetworkError::Config(format!(
            "unknown IP object: version {:?} for address {}",
            v, address
        ))),
    }
}

/// Gateway for an address: its network address plus one.
pub fn calc_gateway_ip(address: &IpNet) -> IpAddr {
    next_ip(address.network())
}

pub fn next_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(1))),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6).wrapping_add(1))),
    }
}
