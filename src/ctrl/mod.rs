// Attachment controllers
// One controller per attachment flavor; each owns a host netlink handle and
// runs its container-side work inside the target namespace.

pub mod bridge;
pub mod macvlan;

pub use bridge::BridgeCtrl;
pub use macvlan::MacvlanCtrl;

use crate::cni::args::CniArgs;
use crate::cni::types::ProvisionResult;
use crate::network::arp::send_garp;
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::namespace::NetNs;
use crate::network::netlink::{parse_mac, NetlinkHandle};
use ipnet::IpNet;
use std::net::IpAddr;

/// Add, remove, or verify one attachment of a container.
#[allow(async_fn_in_trait)]
pub trait IfCtrl {
    /// Attach, optionally applying an address assignment, and report what
    /// was created.
    async fn add(&mut self, assignment: Option<ProvisionResult>) -> NetworkResult<ProvisionResult>;

    /// Detach. Succeeds when there is nothing left to remove.
    async fn del(&mut self) -> NetworkResult<()>;

    /// Compare the live kernel state with the previous result.
    async fn check(&mut self) -> NetworkResult<()>;
}

/// Which container and interface a controller works on.
#[derive(Debug, Clone, Default)]
pub struct Attachment {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
}

impl Attachment {
    pub fn from_args(args: &CniArgs) -> Self {
        Self {
            container_id: args.container_id.clone(),
            netns: args.netns.clone(),
            if_name: args.if_name.clone(),
        }
    }

    /// Same container and namespace, another interface name
    pub fn with_if_name(&self, if_name: &str) -> Self {
        Self {
            if_name: if_name.to_string(),
            ..self.clone()
        }
    }

    pub fn open_netns(&self) -> NetworkResult<NetNs> {
        NetNs::open(&self.netns).map_err(|e| match e {
            NetworkError::NotFound(_) => {
                NetworkError::Namespace(format!("failed to open netns {:?}: {}", self.netns, e))
            }
            other => other,
        })
    }
}

/// Delete `if_name` inside the namespace and hand back the addresses it had.
/// A missing namespace or link counts as already deleted.
pub(crate) async fn remove_container_link(att: &Attachment) -> NetworkResult<Vec<IpNet>> {
    if att.netns.is_empty() {
        return Ok(Vec::new());
    }
    let netns = match NetNs::open(&att.netns) {
        Ok(netns) => netns,
        Err(e) if e.is_not_found() => {
            tracing::debug!("Netns {} already gone", att.netns);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    let if_name = att.if_name.as_str();
    netns
        .run(|nl| async move {
            match nl.delete_link_with_addrs(if_name).await {
                Ok(addrs) => {
                    tracing::info!("Removed {} from {}", if_name, att.netns);
                    Ok(addrs)
                }
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
}

/// Best-effort rollback of a container link created earlier in this request.
pub(crate) async fn discard_container_link(netns: &NetNs, if_name: &str) {
    let outcome = netns
        .run(|nl| async move { nl.delete_link(if_name).await })
        .await;
    if let Err(e) = outcome {
        tracing::warn!("Failed to roll back {} in {}: {}", if_name, netns.path().display(), e);
    }
}

/// Announce every IPv4 address of `result` on `if_name`. Must be called from
/// inside the namespace holding the interface. Failures are only logged.
pub(crate) async fn announce(nl: &NetlinkHandle, if_name: &str, result: &ProvisionResult) {
    let link = match nl.link_by_name(if_name).await {
        Ok(link) => link,
        Err(e) => {
            tracing::warn!("Skipping gratuitous ARP on {}: {}", if_name, e);
            return;
        }
    };
    let mac = match parse_mac(&link.mac) {
        Ok(mac) => mac,
        Err(e) => {
            tracing::warn!("Skipping gratuitous ARP on {}: {}", if_name, e);
            return;
        }
    };

    for ipc in &result.ips {
        if let IpAddr::V4(ip) = ipc.address.addr() {
            if let Err(e) = send_garp(link.index, mac, ip) {
                tracing::warn!("Gratuitous ARP for {} on {} failed: {}", ip, if_name, e);
            }
        }
    }
}
