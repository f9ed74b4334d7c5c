use crate::cni::types::{ProvisionResult, Route};
use crate::network::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::{Info, InfoData, InfoKind, InfoMacVlan, Nla as LinkNla, State};
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_packet_route::{AddressMessage, LinkMessage, RouteMessage};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;

const MAIN_TABLE: u8 = 254;

/// Address family of an IP, used to pick netlink filters and sysctl paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// The family's zero network, used as the default route destination.
    pub fn default_net(self) -> IpNet {
        match self {
            Family::V4 => IpNet::V4(Ipv4Net::default()),
            Family::V6 => IpNet::V6(Ipv6Net::default()),
        }
    }

    fn af(self) -> u8 {
        match self {
            Family::V4 => libc::AF_INET as u8,
            Family::V6 => libc::AF_INET6 as u8,
        }
    }

    fn ip_version(self) -> rtnetlink::IpVersion {
        match self {
            Family::V4 => rtnetlink::IpVersion::V4,
            Family::V6 => rtnetlink::IpVersion::V6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    MacVlan,
    Other(String),
    /// Plain device without IFLA_INFO_KIND (physical NICs, loopback)
    Device,
}

/// Attributes of one live kernel link, decoded from an RTM_NEWLINK message.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    pub mac: String,
    pub mtu: u32,
    pub master_index: Option<u32>,
    /// IFLA_LINK; for a veth this is the peer's ifindex
    pub peer_index: Option<u32>,
    pub promisc: bool,
    pub oper_up: bool,
    pub macvlan_mode: Option<u32>,
}

impl LinkInfo {
    pub fn from_message(msg: &LinkMessage) -> Self {
        let mut info = LinkInfo {
            index: msg.header.index,
            name: String::new(),
            kind: LinkKind::Device,
            mac: String::new(),
            mtu: 0,
            master_index: None,
            peer_index: None,
            promisc: msg.header.flags & libc::IFF_PROMISC as u32 != 0,
            oper_up: false,
            macvlan_mode: None,
        };

        for nla in &msg.nlas {
            match nla {
                LinkNla::IfName(name) => info.name = name.clone(),
                LinkNla::Address(bytes) => info.mac = format_mac(bytes),
                LinkNla::Mtu(mtu) => info.mtu = *mtu,
                LinkNla::Master(idx) => info.master_index = Some(*idx),
                LinkNla::Link(idx) => info.peer_index = Some(*idx),
                LinkNla::OperState(state) => info.oper_up = matches!(state, State::Up),
                LinkNla::Info(infos) => {
                    for item in infos {
                        match item {
                            Info::Kind(kind) => info.kind = link_kind(kind),
                            Info::Data(InfoData::MacVlan(attrs)) => {
                                for attr in attrs {
                                    if let InfoMacVlan::Mode(mode) = attr {
                                        info.macvlan_mode = Some(*mode);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        info
    }

    pub fn is_bridge(&self) -> bool {
        self.kind == LinkKind::Bridge
    }

    pub fn is_veth(&self) -> bool {
        self.kind == LinkKind::Veth
    }

    pub fn is_macvlan(&self) -> bool {
        self.kind == LinkKind::MacVlan
    }
}

fn link_kind(kind: &InfoKind) -> LinkKind {
    match kind {
        InfoKind::Bridge => LinkKind::Bridge,
        InfoKind::Veth => LinkKind::Veth,
        InfoKind::MacVlan => LinkKind::MacVlan,
        InfoKind::Other(name) => LinkKind::Other(name.clone()),
        other => LinkKind::Other(format!("{:?}", other).to_lowercase()),
    }
}

/// A route read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub dst: IpNet,
    pub gw: Option<IpAddr>,
    pub oif: Option<u32>,
}

impl RouteEntry {
    fn from_message(msg: &RouteMessage, family: Family) -> Option<Self> {
        let mut dst = None;
        let mut gw = None;
        let mut oif = None;
        for nla in &msg.nlas {
            match nla {
                RouteNla::Destination(bytes) => dst = ip_from_bytes(bytes),
                RouteNla::Gateway(bytes) => gw = ip_from_bytes(bytes),
                RouteNla::Oif(idx) => oif = Some(*idx),
                _ => {}
            }
        }
        let dst = match dst {
            Some(ip) => IpNet::new(ip, msg.header.destination_prefix_length).ok()?,
            None => family.default_net(),
        };
        Some(RouteEntry { dst, gw, oif })
    }
}

/// Netlink handle wrapping rtnetlink for all bridge/veth/macvlan/address/route
/// operations. The socket is bound to the network namespace that was active
/// on the calling thread when the handle was created.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    conn_task: tokio::task::JoinHandle<()>,
}

impl Drop for NetlinkHandle {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

impl NetlinkHandle {
    /// Open a netlink connection in the current thread's network namespace
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self { handle, conn_task })
    }

    // ── Link lookups ──────────────────────────────────────────────────

    /// Look up a link by name. Returns NotFound if the link doesn't exist.
    pub async fn link_by_name(&self, name: &str) -> NetworkResult<LinkInfo> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(LinkInfo::from_message(&msg)),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) if is_no_device(&e) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn link_by_index(&self, index: u32) -> NetworkResult<LinkInfo> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(LinkInfo::from_message(&msg)),
            Ok(None) => Err(NetworkError::NotFound(format!("link index {}", index))),
            Err(e) if is_no_device(&e) => {
                Err(NetworkError::NotFound(format!("link index {}", index)))
            }
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Like `link_by_name` but maps a missing link to `None`.
    pub async fn find_link(&self, name: &str) -> NetworkResult<Option<LinkInfo>> {
        match self.link_by_name(name).await {
            Ok(link) => Ok(Some(link)),
            Err(NetworkError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Name of the link carrying the first default route, any family.
    pub async fn default_route_link(&self) -> NetworkResult<String> {
        for family in [Family::V4, Family::V6] {
            for route in self.routes(family).await? {
                if route.dst.prefix_len() == 0 {
                    if let Some(oif) = route.oif {
                        return Ok(self.link_by_index(oif).await?.name);
                    }
                }
            }
        }
        Err(NetworkError::NotFound(
            "no default route interface found".to_string(),
        ))
    }

    // ── Link creation ─────────────────────────────────────────────────

    /// Create a bridge. Returns AlreadyExists if the name is taken.
    pub async fn add_bridge(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let mut req = self.handle.link().add().bridge(name.to_string());
        if mtu > 0 {
            req.message_mut().nlas.push(LinkNla::Mtu(mtu));
        }
        req.execute().await.map_err(|e| exists_or(e, name))
    }

    /// Create a veth pair in the current namespace.
    pub async fn add_veth(&self, name: &str, peer: &str) -> NetworkResult<()> {
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|e| exists_or(e, name))
    }

    /// Create a macvlan on `parent`, placed directly into the namespace behind `netns_fd`.
    pub async fn add_macvlan(
        &self,
        name: &str,
        parent: u32,
        mode: u32,
        mtu: u32,
        mac: Option<[u8; 6]>,
        netns_fd: RawFd,
    ) -> NetworkResult<()> {
        let mut req = self
            .handle
            .link()
            .add()
            .macvlan(name.to_string(), parent, mode);
        let nlas = &mut req.message_mut().nlas;
        if mtu > 0 {
            nlas.push(LinkNla::Mtu(mtu));
        }
        if let Some(mac) = mac {
            nlas.push(LinkNla::Address(mac.to_vec()));
        }
        nlas.push(LinkNla::NetNsFd(netns_fd));
        req.execute().await.map_err(|e| exists_or(e, name))
    }

    // ── Link attributes ───────────────────────────────────────────────

    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_promiscuous(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .promiscuous(true)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Set a link's master (attach to bridge)
    pub async fn set_link_master(&self, index: u32, master_index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_name(&self, index: u32, name: &str) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .name(name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_hardware_addr(&self, index: u32, mac: &str) -> NetworkResult<()> {
        let mac = parse_mac(mac)?;
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Move a link to the namespace behind `netns_fd`
    pub async fn set_link_netns(&self, index: u32, netns_fd: RawFd) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns_fd)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    // ── Link removal ──────────────────────────────────────────────────

    /// Delete a link by name. Idempotent - returns Ok if link doesn't exist.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.link_by_name(name).await {
            Ok(link) => link.index,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.delete_link_index(index).await
    }

    pub async fn delete_link_index(&self, index: u32) -> NetworkResult<()> {
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_no_device(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Delete a link by name and return the addresses it carried.
    /// NotFound is returned unchanged so callers can decide whether absence is fine.
    pub async fn delete_link_with_addrs(&self, name: &str) -> NetworkResult<Vec<IpNet>> {
        let link = self.link_by_name(name).await?;
        let addrs = self.addresses(link.index, None).await?;
        self.delete_link_index(link.index).await?;
        Ok(addrs)
    }

    // ── Addresses ─────────────────────────────────────────────────────

    async fn address_messages(&self, index: u32) -> NetworkResult<Vec<AddressMessage>> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut messages = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.index == index {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    /// List addresses on a link, optionally restricted to one family
    pub async fn addresses(&self, index: u32, family: Option<Family>) -> NetworkResult<Vec<IpNet>> {
        let messages = self.address_messages(index).await?;
        Ok(messages
            .iter()
            .filter(|msg| family.map_or(true, |f| msg.header.family == f.af()))
            .filter_map(address_of)
            .collect())
    }

    /// Add an address with prefix to a link; an already-assigned address is fine
    pub async fn add_address(&self, index: u32, addr: IpNet) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(index, addr.addr(), addr.prefix_len())
            .execute()
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn del_address(&self, index: u32, addr: IpNet) -> NetworkResult<()> {
        for msg in self.address_messages(index).await? {
            if address_of(&msg) == Some(addr) {
                return self
                    .handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(NetworkError::Netlink);
            }
        }
        Err(NetworkError::NotFound(format!("address {} on link {}", addr, index)))
    }

    // ── Routes ────────────────────────────────────────────────────────

    /// Main-table routes of a family
    pub async fn routes(&self, family: Family) -> NetworkResult<Vec<RouteEntry>> {
        let mut stream = self.handle.route().get(family.ip_version()).execute();
        let mut routes = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.table != MAIN_TABLE {
                continue;
            }
            if let Some(route) = RouteEntry::from_message(&msg, family) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    /// Add a route out of `oif`, optionally via a gateway. Idempotent.
    pub async fn add_route(&self, dst: IpNet, gw: Option<IpAddr>, oif: u32) -> NetworkResult<()> {
        let result = match (dst, gw) {
            (IpNet::V4(net), gw) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.addr(), net.prefix_len())
                    .output_interface(oif);
                match gw {
                    Some(IpAddr::V4(gw)) => req = req.gateway(gw),
                    Some(IpAddr::V6(gw)) => {
                        return Err(NetworkError::Config(format!(
                            "route {} has IPv6 gateway {}",
                            net, gw
                        )))
                    }
                    None => {}
                }
                req.execute().await
            }
            (IpNet::V6(net), gw) => {
                let mut req = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.addr(), net.prefix_len())
                    .output_interface(oif);
                match gw {
                    Some(IpAddr::V6(gw)) => req = req.gateway(gw),
                    Some(IpAddr::V4(gw)) => {
                        return Err(NetworkError::Config(format!(
                            "route {} has IPv4 gateway {}",
                            net, gw
                        )))
                    }
                    None => {}
                }
                req.execute().await
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    // ── Interface configuration from a result ─────────────────────────

    /// Bring `if_name` up and apply the result's addresses and routes to it.
    /// IPs bound to another interface index are rejected; unbound IPs are skipped.
    pub async fn configure_iface(&self, if_name: &str, result: &ProvisionResult) -> NetworkResult<()> {
        let link = self.link_by_name(if_name).await?;
        self.set_link_up(link.index).await?;

        let mut gw_v4 = None;
        let mut gw_v6 = None;
        for ipc in &result.ips {
            let Some(idx) = ipc.interface else { continue };
            match result.interfaces.get(idx) {
                Some(intf) if intf.name == if_name => {}
                _ => {
                    return Err(NetworkError::Config(format!(
                        "failed to add IP addr {} to {:?}: invalid interface index",
                        ipc.address, if_name
                    )))
                }
            }

            self.add_address(link.index, ipc.address).await?;

            match (ipc.address, ipc.gateway) {
                (IpNet::V4(_), Some(gw)) if gw_v4.is_none() => gw_v4 = Some(gw),
                (IpNet::V6(_), Some(gw)) if gw_v6.is_none() => gw_v6 = Some(gw),
                _ => {}
            }
        }

        for route in &result.routes {
            let gw = route.gw.or(match route.dst {
                IpNet::V4(_) => gw_v4,
                IpNet::V6(_) => gw_v6,
            });
            self.add_route(route.dst, gw, link.index).await?;
        }

        tracing::debug!(
            "Configured {} with {} addresses and {} routes",
            if_name,
            result.ips.len(),
            result.routes.len()
        );
        Ok(())
    }

    /// Every IP of `result` owned by `if_name` must be present on it. IPs
    /// without an interface index are taken to belong to `if_name`.
    pub async fn validate_expected_ips(&self, if_name: &str, result: &ProvisionResult) -> NetworkResult<()> {
        let link = self.link_by_name(if_name).await?;
        let live = self.addresses(link.index, None).await?;
        let owned = result.ips.iter().filter(|ipc| match ipc.interface {
            None => true,
            Some(idx) => result
                .interfaces
                .get(idx)
                .map_or(false, |intf| intf.name == if_name),
        });
        for ipc in owned {
            if !live.contains(&ipc.address) {
                return Err(NetworkError::mismatch(
                    "address",
                    format!("ip {} not found on interface {}", ipc.address, if_name),
                ));
            }
        }
        Ok(())
    }

    /// Every route in `routes` must be present in the main table
    pub async fn validate_expected_routes(&self, routes: &[Route]) -> NetworkResult<()> {
        let mut v4 = None;
        let mut v6 = None;
        for expected in routes {
            let live = match expected.dst {
                IpNet::V4(_) => {
                    if v4.is_none() {
                        v4 = Some(self.routes(Family::V4).await?);
                    }
                    v4.as_deref().unwrap_or_default()
                }
                IpNet::V6(_) => {
                    if v6.is_none() {
                        v6 = Some(self.routes(Family::V6).await?);
                    }
                    v6.as_deref().unwrap_or_default()
                }
            };
            if !route_present(live, expected) {
                return Err(NetworkError::mismatch(
                    "route",
                    format!(
                        "route {} via {} not found",
                        expected.dst,
                        expected
                            .gw
                            .map(|gw| gw.to_string())
                            .unwrap_or_else(|| "<none>".to_string())
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Whether a live route matches an expected one: same destination and, when
/// the expectation names a gateway, the same gateway.
pub fn route_present(live: &[RouteEntry], expected: &Route) -> bool {
    live.iter().any(|route| {
        route.dst.trunc() == expected.dst.trunc()
            && (expected.gw.is_none() || route.gw == expected.gw)
    })
}

fn address_of(msg: &AddressMessage) -> Option<IpNet> {
    let mut address = None;
    let mut local = None;
    for nla in &msg.nlas {
        match nla {
            AddressNla::Address(bytes) => address = ip_from_bytes(bytes),
            AddressNla::Local(bytes) => local = ip_from_bytes(bytes),
            _ => {}
        }
    }
    let ip = local.or(address)?;
    IpNet::new(ip, msg.header.prefix_len).ok()
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(mac: &str) -> NetworkResult<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(NetworkError::Config(format!("invalid MAC address {:?}", mac)));
    }
    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)
            .map_err(|_| NetworkError::Config(format!("invalid MAC address {:?}", mac)))?;
    }
    Ok(out)
}

// rtnetlink surfaces errno only through the message text
fn is_exists(e: &rtnetlink::Error) -> bool {
    e.to_string().contains("File exists")
}

fn is_no_device(e: &rtnetlink::Error) -> bool {
    let msg = e.to_string();
    msg.contains("No such device") || msg.contains("Cannot find device")
}

fn exists_or(e: rtnetlink::Error, name: &str) -> NetworkError {
    if is_exists(&e) {
        NetworkError::AlreadyExists(name.to_string())
    } else {
        NetworkError::Netlink(e)
    }
}
