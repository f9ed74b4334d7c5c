// Macvlan attachment: a second container interface parented to a host link.

use super::{announce, discard_container_link, remove_container_link, Attachment, IfCtrl};
use crate::cni::config::{MacvlanConfig, NetworkConfig};
use crate::cni::types::ProvisionResult;
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::macvlan::{create_macvlan, resolve_master, validate_container_interface, MacvlanMode};
use crate::network::namespace::NetNs;
use crate::network::naming::NameGen;
use crate::network::netlink::NetlinkHandle;
use crate::network::sysctl::Sysctl;
use crate::network::veth::HostNet;

/// Container-side name of the macvlan interface
pub const MACVLAN_IF_NAME: &str = "mv0";

pub struct MacvlanCtrl<'a> {
    conf: &'a NetworkConfig,
    att: Attachment,
    nl: NetlinkHandle,
    sysctl: Sysctl,
    names: NameGen,
}

impl<'a> MacvlanCtrl<'a> {
    /// `att` names the container; the interface is always `mv0`.
    pub fn new(conf: &'a NetworkConfig, att: &Attachment, names: NameGen) -> NetworkResult<Self> {
        Ok(Self {
            conf,
            att: att.with_if_name(MACVLAN_IF_NAME),
            nl: NetlinkHandle::new()?,
            sysctl: Sysctl::default(),
            names,
        })
    }

    fn macvlan(&self) -> NetworkResult<&'a MacvlanConfig> {
        self.conf
            .macvlan
            .as_ref()
            .ok_or_else(|| NetworkError::Config("macvlan is not configured".to_string()))
    }

    async fn configure(
        &self,
        netns: &NetNs,
        mut result: ProvisionResult,
        assignment: Option<ProvisionResult>,
    ) -> NetworkResult<ProvisionResult> {
        let if_name = self.att.if_name.as_str();

        match assignment {
            Some(assigned) => {
                if assigned.ips.is_empty() {
                    return Err(NetworkError::Config(
                        "IPAM plugin returned missing IP config".to_string(),
                    ));
                }
                result.ips = assigned.ips;
                for ipc in result.ips.iter_mut() {
                    ipc.interface = Some(0);
                }
                result.routes = assigned.routes;

                let configured = &result;
                netns
                    .run(|nl| async move {
                        nl.configure_iface(if_name, configured).await?;
                        announce(&nl, if_name, configured).await;
                        Ok(())
                    })
                    .await?;
            }
            None => {
                netns
                    .run(|nl| async move {
                        let link = nl.link_by_name(if_name).await?;
                        nl.set_link_up(link.index).await
                    })
                    .await?;
            }
        }

        result.dns = self.conf.dns.clone();
        Ok(result)
    }
}

impl IfCtrl for MacvlanCtrl<'_> {
    async fn add(&mut self, assignment: Option<ProvisionResult>) -> NetworkResult<ProvisionResult> {
        let mv_conf = self.macvlan()?;
        let netns = self.att.open_netns()?;

        let host = HostNet {
            nl: &self.nl,
            sysctl: &self.sysctl,
        };
        let intf = create_macvlan(&host, &mut self.names, mv_conf, &self.att.if_name, &netns).await?;

        let result = ProvisionResult {
            cni_version: self.conf.cni_version.clone(),
            interfaces: vec![intf],
            ..Default::default()
        };

        match self.configure(&netns, result, assignment).await {
            Ok(result) => Ok(result),
            Err(e) => {
                discard_container_link(&netns, &self.att.if_name).await;
                Err(e)
            }
        }
    }

    async fn del(&mut self) -> NetworkResult<()> {
        remove_container_link(&self.att).await.map(|_| ())
    }

    async fn check(&mut self) -> NetworkResult<()> {
        let mv_conf = self.macvlan()?;
        let prev = self
            .conf
            .prev_result
            .as_ref()
            .ok_or_else(|| NetworkError::Config("required prevResult missing".to_string()))?;
        let mode = MacvlanMode::parse(&mv_conf.mode)?;
        let netns = self.att.open_netns()?;

        // the master must still be there even though nothing links back to it
        resolve_master(&self.nl, mv_conf).await?;

        let idx = prev
            .find_interface(&self.att.if_name, Some(&self.att.netns))
            .ok_or_else(|| {
                NetworkError::mismatch(
                    "macvlan",
                    format!(
                        "interface {} with sandbox {} not found in prevResult",
                        self.att.if_name, self.att.netns
                    ),
                )
            })?;
        let intf = &prev.interfaces[idx];
        let if_name = self.att.if_name.as_str();

        netns
            .run(|nl| async move {
                let link = nl.find_link(&intf.name).await?;
                validate_container_interface(intf, link.as_ref(), mode)?;
                nl.validate_expected_ips(if_name, prev).await?;
                nl.validate_expected_routes(&prev.routes).await
            })
            .await
    }
}
