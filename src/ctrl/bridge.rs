// Bridge attachment: veth pair between the container and a host bridge,
// optional gateway addresses on the bridge and masquerade for the container.

use super::{announce, discard_container_link, remove_container_link, Attachment, IfCtrl};
use crate::cni::config::NetworkConfig;
use crate::cni::types::{Interface, ProvisionResult};
use crate::network::bridge::{
    bridge_by_name, check_addr_conflict, ensure_addr, ensure_bridge, ensure_vlan_interface,
    find_host_veth, validate_bridge, validate_container_veth, vlan_interface_name,
};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::firewall::Masquerade;
use crate::network::gateway::{calc_gateways, GatewayInfo};
use crate::network::namespace::NetNs;
use crate::network::naming::NameGen;
use crate::network::netlink::{LinkInfo, NetlinkHandle};
use crate::network::sysctl::Sysctl;
use crate::network::veth::{setup_veth, HostNet, VethConfig};
use ipnet::IpNet;
use std::time::Duration;

/// Delays between reads of the host veth operational state
const OPER_UP_BACKOFF_MS: [u64; 5] = [0, 50, 500, 1000, 1000];

pub struct BridgeCtrl<'a> {
    conf: &'a NetworkConfig,
    att: Attachment,
    nl: NetlinkHandle,
    sysctl: Sysctl,
    names: NameGen,
}

impl<'a> BridgeCtrl<'a> {
    pub fn new(conf: &'a NetworkConfig, att: Attachment, names: NameGen) -> NetworkResult<Self> {
        Ok(Self {
            conf,
            att,
            nl: NetlinkHandle::new()?,
            sysctl: Sysctl::default(),
            names,
        })
    }

    /// Interface that carries the gateway addresses
    fn gateway_link_name(&self) -> String {
        match self.conf.vlan_id() {
            Some(vid) => vlan_interface_name(&self.conf.bridge, vid),
            None => self.conf.bridge.clone(),
        }
    }

    /// Everything after the veth pair exists. The caller removes the
    /// container end when this fails.
    async fn attach(
        &mut self,
        netns: &NetNs,
        br: &LinkInfo,
        mut result: ProvisionResult,
        gateways: Option<(GatewayInfo, GatewayInfo)>,
    ) -> NetworkResult<ProvisionResult> {
        let conf = self.conf;
        let host_veth = result.interfaces[1].name.clone();

        if let Some((v4, v6)) = gateways {
            let if_name = self.att.if_name.as_str();
            let sysctl = &self.sysctl;
            let has_v6 = result.ips.iter().any(|ipc| matches!(ipc.address, IpNet::V6(_)));
            let disable_dad = (conf.hairpin_mode || conf.promisc_mode) && has_v6;
            let assigned = &result;

            netns
                .run(|nl| async move {
                    // the hairpin reflects our own neighbor solicitations back
                    if disable_dad {
                        sysctl.disable_dad(if_name)?;
                    }
                    nl.configure_iface(if_name, assigned).await
                })
                .await?;

            wait_oper_up(&self.nl, &host_veth).await?;

            netns
                .run(|nl| async move {
                    announce(&nl, if_name, assigned).await;
                    Ok(())
                })
                .await?;

            if conf.is_gateway && !(v4.gws.is_empty() && v6.gws.is_empty()) {
                let host = HostNet {
                    nl: &self.nl,
                    sysctl: &self.sysctl,
                };
                let target = match conf.vlan_id() {
                    Some(vid) => {
                        let link = ensure_vlan_interface(&host, &mut self.names, br, vid).await?;
                        result.interfaces.push(Interface {
                            name: link.name.clone(),
                            mac: link.mac.clone(),
                            sandbox: String::new(),
                        });
                        link
                    }
                    None => br.clone(),
                };

                for info in [&v4, &v6] {
                    for gw in &info.gws {
                        ensure_addr(&self.nl, &target, info.family, *gw, conf.force_address)
                            .await
                            .map_err(|e| match e {
                                NetworkError::Conflict(_) => e,
                                other => NetworkError::Config(format!(
                                    "failed to set bridge addr: {}",
                                    other
                                )),
                            })?;
                    }
                    if !info.gws.is_empty() {
                        self.sysctl.enable_forwarding(info.family)?;
                    }
                }
            }

            if conf.ip_masq {
                let masq = Masquerade::new(&conf.name, &self.att.container_id);
                for ipc in &result.ips {
                    masq.setup(&ipc.address).await?;
                }
            }
        }

        // ports joining can change the bridge MAC
        let br = bridge_by_name(&self.nl, &conf.bridge).await?;
        result.interfaces[0].mac = br.mac;
        result.dns = conf.dns.clone();

        Ok(result)
    }
}

impl IfCtrl for BridgeCtrl<'_> {
    async fn add(&mut self, assignment: Option<ProvisionResult>) -> NetworkResult<ProvisionResult> {
        let conf = self.conf;
        conf.validate()?;

        let mut result = ProvisionResult {
            cni_version: conf.cni_version.clone(),
            ..Default::default()
        };

        let gateways = match assignment {
            Some(assigned) => {
                if assigned.ips.is_empty() {
                    return Err(NetworkError::Config(
                        "IPAM plugin returned missing IP config".to_string(),
                    ));
                }
                result.ips = assigned.ips;
                result.routes = assigned.routes;
                let (v4, v6) = calc_gateways(&mut result, conf.is_gateway, conf.is_default_gateway)?;

                if conf.is_gateway {
                    let wanted: Vec<IpNet> = v4.gws.iter().chain(&v6.gws).copied().collect();
                    check_addr_conflict(&self.nl, &self.gateway_link_name(), &wanted, conf.force_address)
                        .await?;
                }
                Some((v4, v6))
            }
            None => None,
        };

        let netns = self.att.open_netns()?;

        let host = HostNet {
            nl: &self.nl,
            sysctl: &self.sysctl,
        };
        let br = ensure_bridge(
            &host,
            &conf.bridge,
            conf.mtu,
            conf.promisc_mode,
            conf.vlan_id().is_some(),
        )
        .await?;

        let veth = VethConfig {
            if_name: &self.att.if_name,
            mtu: conf.mtu,
            hairpin: conf.hairpin_mode,
            vlan: conf.vlan_id(),
        };
        let (host_intf, container_intf) =
            setup_veth(&host, &mut self.names, &netns, &br, veth).await?;

        result.interfaces = vec![
            Interface {
                name: br.name.clone(),
                mac: br.mac.clone(),
                sandbox: String::new(),
            },
            host_intf,
            container_intf,
        ];

        match self.attach(&netns, &br, result, gateways).await {
            Ok(result) => {
                tracing::info!(
                    "Attached {} in {} to bridge {}",
                    self.att.if_name,
                    self.att.netns,
                    conf.bridge
                );
                Ok(result)
            }
            Err(e) => {
                discard_container_link(&netns, &self.att.if_name).await;
                Err(e)
            }
        }
    }

    async fn del(&mut self) -> NetworkResult<()> {
        let addrs = remove_container_link(&self.att).await?;

        if self.conf.is_layer3() && self.conf.ip_masq {
            let masq = Masquerade::new(&self.conf.name, &self.att.container_id);
            for addr in &addrs {
                masq.teardown(addr).await;
            }
        }
        Ok(())
    }

    async fn check(&mut self) -> NetworkResult<()> {
        let conf = self.conf;
        let prev = conf
            .prev_result
            .as_ref()
            .ok_or_else(|| NetworkError::Config("required prevResult missing".to_string()))?;
        let netns = self.att.open_netns()?;

        let br_idx = prev.find_interface(&conf.bridge, None).ok_or_else(|| {
            NetworkError::mismatch(
                "bridge",
                format!("bridge {} not found in prevResult", conf.bridge),
            )
        })?;
        let cont_idx = prev
            .find_interface(&self.att.if_name, Some(&self.att.netns))
            .ok_or_else(|| {
                NetworkError::mismatch(
                    "container",
                    format!(
                        "interface {} with sandbox {} not found in prevResult",
                        self.att.if_name, self.att.netns
                    ),
                )
            })?;

        let br_intf = &prev.interfaces[br_idx];
        let br_link = self.nl.find_link(&br_intf.name).await?;
        let bridge = validate_bridge(br_intf, br_link.as_ref(), conf.promisc_mode)?;

        let cont_intf = &prev.interfaces[cont_idx];
        let container = netns
            .run(|nl| async move {
                let link = nl.find_link(&cont_intf.name).await?;
                validate_container_veth(cont_intf, link.as_ref())
            })
            .await?;

        let mut candidates = Vec::new();
        for (idx, intf) in prev.interfaces.iter().enumerate() {
            if idx == br_idx || idx == cont_idx {
                continue;
            }
            let link = if intf.name.is_empty() {
                None
            } else {
                self.nl.find_link(&intf.name).await?
            };
            candidates.push((intf, link));
        }
        let records: Vec<_> = candidates
            .iter()
            .map(|(intf, link)| (*intf, link.as_ref()))
            .collect();
        let host_veth = find_host_veth(&records, &bridge, &container)?;
        tracing::debug!("Host veth {} paired with {}", host_veth.name, container.name);

        let if_name = self.att.if_name.as_str();
        netns
            .run(|nl| async move {
                nl.validate_expected_ips(if_name, prev).await?;
                nl.validate_expected_routes(&prev.routes).await
            })
            .await
    }
}

/// Poll the host end of the pair until the kernel reports it up.
async fn wait_oper_up(nl: &NetlinkHandle, name: &str) -> NetworkResult<()> {
    for delay in OPER_UP_BACKOFF_MS {
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if nl.link_by_name(name).await?.oper_up {
            return Ok(());
        }
        tracing::debug!("{} not operationally up yet", name);
    }
    Err(NetworkError::NotReady(format!(
        "bridge port {} in error state",
        name
    )))
}
