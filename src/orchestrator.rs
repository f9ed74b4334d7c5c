// Per-request coordination of IPAM and the attachment controllers

use crate::cni::config::NetworkConfig;
use crate::cni::ipam::Ipam;
use crate::cni::types::{Interface, ProvisionResult};
use crate::ctrl::IfCtrl;
use crate::network::error::{NetworkError, NetworkResult};

/// Interfaces whose name starts with this belong to the macvlan side
pub const MACVLAN_TAG: &str = "mv";

/// Split of an IPAM result between the two controllers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Non-macvlan IPs plus every route and the DNS settings
    pub bridge: ProvisionResult,
    pub macvlan: ProvisionResult,
}

/// Route each IP to the controller owning its interface. Interfaces are
/// deduplicated by name and IP indices rewritten to point into their own
/// sub-result. IPs without a valid interface go to the bridge.
pub fn partition(assigned: ProvisionResult, cni_version: &str) -> Partition {
    let mut bridge = ProvisionResult {
        cni_version: cni_version.to_string(),
        routes: assigned.routes,
        dns: assigned.dns,
        ..Default::default()
    };
    let mut macvlan = ProvisionResult {
        cni_version: cni_version.to_string(),
        ..Default::default()
    };

    for mut ipc in assigned.ips {
        let owner = ipc.interface.and_then(|idx| assigned.interfaces.get(idx));
        let Some(owner) = owner else {
            ipc.interface = None;
            bridge.ips.push(ipc);
            continue;
        };
        let side = if owner.name.starts_with(MACVLAN_TAG) {
            &mut macvlan
        } else {
            &mut bridge
        };
        ipc.interface = Some(intern(&mut side.interfaces, owner));
        side.ips.push(ipc);
    }

    Partition { bridge, macvlan }
}

fn intern(interfaces: &mut Vec<Interface>, intf: &Interface) -> usize {
    match interfaces.iter().position(|known| known.name == intf.name) {
        Some(idx) => idx,
        None => {
            interfaces.push(intf.clone());
            interfaces.len() - 1
        }
    }
}

/// Append the macvlan interfaces and IPs to the bridge result, shifting the
/// macvlan IP indices past the bridge interfaces.
pub fn merge(mut bridge: ProvisionResult, macvlan: ProvisionResult) -> ProvisionResult {
    let offset = bridge.interfaces.len();
    bridge.interfaces.extend(macvlan.interfaces);
    bridge.ips.extend(macvlan.ips.into_iter().map(|mut ipc| {
        ipc.interface = ipc.interface.map(|idx| idx + offset);
        ipc
    }));
    bridge.routes.extend(macvlan.routes);
    bridge
}

/// Whether `prev` holds a macvlan-tagged interface inside `sandbox`
pub fn has_macvlan_record(prev: Option<&ProvisionResult>, sandbox: &str) -> bool {
    prev.map_or(false, |prev| {
        prev.interfaces
            .iter()
            .any(|intf| intf.name.starts_with(MACVLAN_TAG) && intf.sandbox == sandbox)
    })
}

/// Undo step registered once the matching forward step succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    ReleaseIpam,
    DetachBridge,
}

/// Ordered compensations for a partially applied ADD.
#[derive(Debug, Default)]
pub struct Rollback {
    steps: Vec<Compensation>,
    committed: bool,
}

impl Rollback {
    pub fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Steps still to run, newest first; nothing once committed.
    pub fn pending(self) -> Vec<Compensation> {
        if self.committed {
            return Vec::new();
        }
        let mut steps = self.steps;
        steps.reverse();
        steps
    }
}

/// One CNI request: address management plus the bridge attachment and, when
/// configured, the macvlan attachment.
pub struct Village<'a, I, B, M> {
    conf: &'a NetworkConfig,
    stdin: &'a [u8],
    /// Container netns path the attachment lives in
    sandbox: &'a str,
    ipam: I,
    bridge: B,
    macvlan: Option<M>,
}

impl<'a, I, B, M> Village<'a, I, B, M>
where
    I: Ipam,
    B: IfCtrl,
    M: IfCtrl,
{
    pub fn new(
        conf: &'a NetworkConfig,
        stdin: &'a [u8],
        sandbox: &'a str,
        ipam: I,
        bridge: B,
        macvlan: Option<M>,
    ) -> Self {
        Self {
            conf,
            stdin,
            sandbox,
            ipam,
            bridge,
            macvlan,
        }
    }

    fn ipam_type(&self) -> &'a str {
        &self.conf.ipam.plugin_type
    }

    pub async fn add(&mut self) -> NetworkResult<ProvisionResult> {
        if !self.conf.is_layer3() {
            tracing::debug!("No IPAM configured, layer 2 attachment only");
            return self.bridge.add(None).await;
        }

        let mut rollback = Rollback::default();
        let outcome = self.add_layer3(&mut rollback).await;
        for step in rollback.pending() {
            self.compensate(step).await;
        }
        outcome
    }

    async fn add_layer3(&mut self, rollback: &mut Rollback) -> NetworkResult<ProvisionResult> {
        let assigned = self.ipam.exec_add(self.ipam_type(), self.stdin).await?;
        rollback.push(Compensation::ReleaseIpam);
        tracing::debug!(
            "IPAM assigned {} addresses over {} interfaces",
            assigned.ips.len(),
            assigned.interfaces.len()
        );

        let parts = partition(assigned, &self.conf.cni_version);

        let mut result = self.bridge.add(Some(parts.bridge)).await?;
        rollback.push(Compensation::DetachBridge);

        if let Some(macvlan) = self.macvlan.as_mut() {
            if !parts.macvlan.interfaces.is_empty() {
                let mv_result = macvlan.add(Some(parts.macvlan)).await?;
                result = merge(result, mv_result);
            }
        }

        rollback.commit();
        Ok(result)
    }

    async fn compensate(&mut self, step: Compensation) {
        let outcome = match step {
            Compensation::DetachBridge => self.bridge.del().await,
            Compensation::ReleaseIpam => self.ipam.exec_del(self.ipam_type(), self.stdin).await,
        };
        match outcome {
            Ok(()) => tracing::info!("Rolled back {:?}", step),
            Err(e) => tracing::warn!("Rollback step {:?} failed: {}", step, e),
        }
    }

    pub async fn del(&mut self) -> NetworkResult<()> {
        if self.conf.is_layer3() {
            self.ipam.exec_del(self.ipam_type(), self.stdin).await?;
        }

        if let Some(macvlan) = self.macvlan.as_mut() {
            if let Err(e) = macvlan.del().await {
                tracing::warn!("Macvlan removal failed: {}", e);
            }
        }

        self.bridge.del().await
    }

    /// Bridge and macvlan are both checked; every failure is reported,
    /// the bridge's first. The macvlan is only checked when the previous
    /// result recorded one in this sandbox, as ADD may have skipped it.
    pub async fn check(&mut self) -> NetworkResult<()> {
        if self.conf.is_layer3() {
            self.ipam.exec_check(self.ipam_type(), self.stdin).await?;
        }

        let mut errors = Vec::new();
        if let Err(e) = self.bridge.check().await {
            errors.push(e);
        }
        let recorded = has_macvlan_record(self.conf.prev_result.as_ref(), self.sandbox);
        if let Some(macvlan) = self.macvlan.as_mut().filter(|_| recorded) {
            if let Err(e) = macvlan.check().await {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(NetworkError::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::types::IpConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<String>>>;

    fn intf(name: &str) -> Interface {
        Interface {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn ip(addr: &str, interface: Option<usize>) -> IpConfig {
        IpConfig {
            version: None,
            interface,
            address: addr.parse().unwrap(),
            gateway: None,
        }
    }

    fn conf(json: &str) -> NetworkConfig {
        NetworkConfig::parse(json.as_bytes(), "").unwrap()
    }

    fn assignment() -> ProvisionResult {
        ProvisionResult {
            cni_version: "0.4.0".to_string(),
            interfaces: vec![intf("eth0"), intf("mv0")],
            ips: vec![ip("10.1.2.5/24", Some(0)), ip("192.168.9.7/24", Some(1))],
            ..Default::default()
        }
    }

    struct FakeIpam {
        journal: Journal,
        fail_add: bool,
    }

    impl Ipam for FakeIpam {
        async fn exec_add(&self, plugin: &str, _stdin: &[u8]) -> NetworkResult<ProvisionResult> {
            self.journal.borrow_mut().push(format!("ipam add {}", plugin));
            if self.fail_add {
                return Err(NetworkError::Ipam {
                    plugin: plugin.to_string(),
                    msg: "pool exhausted".to_string(),
                });
            }
            Ok(assignment())
        }

        async fn exec_del(&self, plugin: &str, _stdin: &[u8]) -> NetworkResult<()> {
            self.journal.borrow_mut().push(format!("ipam del {}", plugin));
            Ok(())
        }

        async fn exec_check(&self, plugin: &str, _stdin: &[u8]) -> NetworkResult<()> {
            self.journal.borrow_mut().push(format!("ipam check {}", plugin));
            Ok(())
        }
    }

    struct FakeCtrl {
        name: &'static str,
        journal: Journal,
        fail_add: bool,
        fail_del: bool,
        fail_check: bool,
    }

    impl FakeCtrl {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                journal: journal.clone(),
                fail_add: false,
                fail_del: false,
                fail_check: false,
            }
        }
    }

    impl IfCtrl for FakeCtrl {
        async fn add(&mut self, assignment: Option<ProvisionResult>) -> NetworkResult<ProvisionResult> {
            let ips = assignment.as_ref().map_or(0, |a| a.ips.len());
            self.journal
                .borrow_mut()
                .push(format!("{} add {}", self.name, ips));
            if self.fail_add {
                return Err(NetworkError::Config(format!("{} broke", self.name)));
            }
            let mut result = assignment.unwrap_or_default();
            result.interfaces = vec![intf(self.name)];
            Ok(result)
        }

        async fn del(&mut self) -> NetworkResult<()> {
            self.journal.borrow_mut().push(format!("{} del", self.name));
            if self.fail_del {
                return Err(NetworkError::NotReady(self.name.to_string()));
            }
            Ok(())
        }

        async fn check(&mut self) -> NetworkResult<()> {
            self.journal.borrow_mut().push(format!("{} check", self.name));
            if self.fail_check {
                return Err(NetworkError::mismatch("veth", format!("{} drifted", self.name)));
            }
            Ok(())
        }
    }

    const NETNS: &str = "/var/run/netns/c1";

    const L3: &str = r#"{"cniVersion":"0.4.0","name":"village","type":"village",
        "ipam":{"type":"village-ipam"},"macvlan":{"master":"eth1"}}"#;

    /// Config whose prevResult holds `interfaces`, each `(name, sandbox)`
    fn conf_with_prev(raw: &str, interfaces: &[(&str, &str)]) -> NetworkConfig {
        let mut conf = conf(raw);
        conf.prev_result = Some(ProvisionResult {
            cni_version: "0.4.0".to_string(),
            interfaces: interfaces
                .iter()
                .map(|(name, sandbox)| Interface {
                    name: name.to_string(),
                    mac: String::new(),
                    sandbox: sandbox.to_string(),
                })
                .collect(),
            ..Default::default()
        });
        conf
    }

    fn journal() -> Journal {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn partition_splits_by_owner_prefix() {
        let mut assigned = assignment();
        assigned.interfaces.push(intf("mv0"));
        assigned.ips.push(ip("192.168.9.8/24", Some(2)));
        assigned.ips.push(ip("fd00::5/64", None));
        assigned.routes = vec![crate::cni::types::Route {
            dst: "0.0.0.0/0".parse().unwrap(),
            gw: None,
        }];

        let parts = partition(assigned, "1.0.0");

        assert_eq!(parts.bridge.interfaces, vec![intf("eth0")]);
        assert_eq!(parts.bridge.ips.len(), 2);
        assert_eq!(parts.bridge.ips[0].interface, Some(0));
        assert_eq!(parts.bridge.ips[1].interface, None);
        assert_eq!(parts.bridge.routes.len(), 1);
        assert_eq!(parts.bridge.cni_version, "1.0.0");

        // two records named mv0 collapse into one
        assert_eq!(parts.macvlan.interfaces, vec![intf("mv0")]);
        assert_eq!(parts.macvlan.ips.len(), 2);
        assert!(parts.macvlan.ips.iter().all(|ipc| ipc.interface == Some(0)));
        assert!(parts.macvlan.routes.is_empty());
    }

    #[test]
    fn partition_out_of_range_index_goes_to_bridge() {
        let assigned = ProvisionResult {
            ips: vec![ip("10.1.2.5/24", Some(7))],
            ..Default::default()
        };
        let parts = partition(assigned, "0.4.0");
        assert_eq!(parts.bridge.ips[0].interface, None);
        assert!(parts.macvlan.ips.is_empty());
    }

    #[test]
    fn merge_shifts_macvlan_indices() {
        let bridge = ProvisionResult {
            interfaces: vec![intf("cni0"), intf("veth1"), intf("eth0")],
            ips: vec![ip("10.1.2.5/24", Some(2))],
            ..Default::default()
        };
        let macvlan = ProvisionResult {
            interfaces: vec![intf("mv0")],
            ips: vec![ip("192.168.9.7/24", Some(0))],
            ..Default::default()
        };

        let merged = merge(bridge, macvlan);
        assert_eq!(merged.interfaces.len(), 4);
        assert_eq!(merged.interfaces[3].name, "mv0");
        assert_eq!(merged.ips[0].interface, Some(2));
        assert_eq!(merged.ips[1].interface, Some(3));
    }

    #[test]
    fn rollback_unwinds_newest_first() {
        let mut rollback = Rollback::default();
        rollback.push(Compensation::ReleaseIpam);
        rollback.push(Compensation::DetachBridge);
        assert_eq!(
            rollback.pending(),
            vec![Compensation::DetachBridge, Compensation::ReleaseIpam]
        );

        let mut rollback = Rollback::default();
        rollback.push(Compensation::ReleaseIpam);
        rollback.commit();
        assert!(rollback.pending().is_empty());
    }

    #[tokio::test]
    async fn layer2_skips_ipam() {
        let conf = conf(r#"{"cniVersion":"0.4.0","name":"village","type":"village"}"#);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut village = Village::new(
            &conf,
            b"{}",
            NETNS,
            ipam,
            FakeCtrl::new("bridge", &log),
            None::<FakeCtrl>,
        );

        let result = village.add().await.unwrap();
        assert_eq!(result.interfaces, vec![intf("bridge")]);
        assert_eq!(*log.borrow(), vec!["bridge add 0"]);
    }

    #[tokio::test]
    async fn layer3_runs_bridge_then_macvlan() {
        let conf = conf(L3);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut village = Village::new(
            &conf,
            b"{}",
            NETNS,
            ipam,
            FakeCtrl::new("bridge", &log),
            Some(FakeCtrl::new("macvlan", &log)),
        );

        let result = village.add().await.unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["ipam add village-ipam", "bridge add 1", "macvlan add 1"]
        );
        assert_eq!(result.interfaces, vec![intf("bridge"), intf("macvlan")]);
        assert_eq!(result.ips[1].interface, Some(1));
    }

    #[tokio::test]
    async fn macvlan_failure_unwinds_bridge_then_ipam() {
        let conf = conf(L3);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut macvlan = FakeCtrl::new("macvlan", &log);
        macvlan.fail_add = true;
        let mut village = Village::new(&conf, b"{}", NETNS, ipam, FakeCtrl::new("bridge", &log), Some(macvlan));

        let err = village.add().await.unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: macvlan broke");
        assert_eq!(
            *log.borrow(),
            vec![
                "ipam add village-ipam",
                "bridge add 1",
                "macvlan add 1",
                "bridge del",
                "ipam del village-ipam",
            ]
        );
    }

    #[tokio::test]
    async fn bridge_failure_releases_ipam_only() {
        let conf = conf(L3);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut bridge = FakeCtrl::new("bridge", &log);
        bridge.fail_add = true;
        let mut village = Village::new(&conf, b"{}", NETNS, ipam, bridge, Some(FakeCtrl::new("macvlan", &log)));

        assert!(village.add().await.is_err());
        assert_eq!(
            *log.borrow(),
            vec!["ipam add village-ipam", "bridge add 1", "ipam del village-ipam"]
        );
    }

    #[tokio::test]
    async fn ipam_failure_compensates_nothing() {
        let conf = conf(L3);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: true };
        let mut village = Village::new(
            &conf,
            b"{}",
            NETNS,
            ipam,
            FakeCtrl::new("bridge", &log),
            Some(FakeCtrl::new("macvlan", &log)),
        );

        let err = village.add().await.unwrap_err();
        assert_eq!(err.to_string(), "ipam village-ipam failed: pool exhausted");
        assert_eq!(*log.borrow(), vec!["ipam add village-ipam"]);
    }

    #[tokio::test]
    async fn del_tolerates_macvlan_failure() {
        let conf = conf(L3);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut macvlan = FakeCtrl::new("macvlan", &log);
        macvlan.fail_del = true;
        let mut village = Village::new(&conf, b"{}", NETNS, ipam, FakeCtrl::new("bridge", &log), Some(macvlan));

        village.del().await.unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["ipam del village-ipam", "macvlan del", "bridge del"]
        );
    }

    #[tokio::test]
    async fn check_reports_every_failure() {
        let conf = conf_with_prev(L3, &[("cni0", ""), ("eth0", NETNS), ("mv0", NETNS)]);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut bridge = FakeCtrl::new("bridge", &log);
        bridge.fail_check = true;
        let mut macvlan = FakeCtrl::new("macvlan", &log);
        macvlan.fail_check = true;
        let mut village = Village::new(&conf, b"{}", NETNS, ipam, bridge, Some(macvlan));

        let err = village.check().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "veth check failed: bridge drifted; veth check failed: macvlan drifted"
        );
        assert_eq!(
            *log.borrow(),
            vec!["ipam check village-ipam", "bridge check", "macvlan check"]
        );
    }

    #[test]
    fn macvlan_record_must_sit_in_sandbox() {
        let prev = conf_with_prev(L3, &[("cni0", ""), ("eth0", NETNS), ("mv0", NETNS)]);
        assert!(has_macvlan_record(prev.prev_result.as_ref(), NETNS));
        assert!(!has_macvlan_record(prev.prev_result.as_ref(), "/var/run/netns/c2"));

        let host_side = conf_with_prev(L3, &[("mv0", "")]);
        assert!(!has_macvlan_record(host_side.prev_result.as_ref(), NETNS));
        assert!(!has_macvlan_record(None, NETNS));
    }

    #[tokio::test]
    async fn layer2_check_skips_macvlan_never_created() {
        let conf = conf_with_prev(
            r#"{"cniVersion":"0.4.0","name":"village","type":"village","macvlan":{"master":"lo"}}"#,
            &[("cni0", ""), ("veth0a1b2c3d", ""), ("eth0", NETNS)],
        );
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut macvlan = FakeCtrl::new("macvlan", &log);
        macvlan.fail_check = true;
        let mut village = Village::new(&conf, b"{}", NETNS, ipam, FakeCtrl::new("bridge", &log), Some(macvlan));

        village.check().await.unwrap();
        assert_eq!(*log.borrow(), vec!["bridge check"]);
    }

    #[tokio::test]
    async fn layer3_check_skips_macvlan_without_tagged_interface() {
        let conf = conf_with_prev(L3, &[("cni0", ""), ("veth0a1b2c3d", ""), ("eth0", NETNS)]);
        let log = journal();
        let ipam = FakeIpam { journal: log.clone(), fail_add: false };
        let mut macvlan = FakeCtrl::new("macvlan", &log);
        macvlan.fail_check = true;
        let mut village = Village::new(&conf, b"{}", NETNS, ipam, FakeCtrl::new("bridge", &log), Some(macvlan));

        village.check().await.unwrap();
        assert_eq!(*log.borrow(), vec!["ipam check village-ipam", "bridge check"]);
    }
}
