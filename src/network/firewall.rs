use crate::network::error::{NetworkError, NetworkResult};
use crate::network::naming::{chain_comment, chain_name};
use crate::network::netlink::Family;
use ipnet::IpNet;

const NAT: &str = "nat";
const POSTROUTING: &str = "POSTROUTING";
const MULTICAST_V4: &str = "224.0.0.0/4";
const MULTICAST_V6: &str = "ff00::/8";

/// Per-attachment source NAT in the iptables `nat` table.
///
/// Layout for each container address:
/// - `POSTROUTING -s <ip> -j CNI-<hash>`
/// - `CNI-<hash> -d <subnet> -j ACCEPT` (traffic staying on the bridge network)
/// - `CNI-<hash> ! -d <multicast> -j MASQUERADE`
///
/// Every rule carries the owner comment so it can be traced back.
pub struct Masquerade {
    chain: String,
    comment: String,
}

impl Masquerade {
    pub fn new(network: &str, container_id: &str) -> Self {
        Self {
            chain: chain_name(network, container_id),
            comment: chain_comment(network, container_id),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Install the chain and its rules for one address. Idempotent.
    pub async fn setup(&self, addr: &IpNet) -> NetworkResult<()> {
        let tool = tool(addr);

        if let Err(e) = run_iptables(tool, &["-t", NAT, "-N", &self.chain]).await {
            if !is_chain_exists(&e) {
                return Err(e);
            }
        }

        for rule in self.chain_rules(addr) {
            self.append_unique(tool, &self.chain, &rule).await?;
        }
        self.append_unique(tool, POSTROUTING, &self.jump_rule(addr))
            .await?;

        tracing::info!(
            "Masquerade configured for {} via chain {}",
            addr.addr(),
            self.chain
        );
        Ok(())
    }

    /// Remove everything `setup` installed for `addr`. Errors are logged.
    pub async fn teardown(&self, addr: &IpNet) {
        let tool = tool(addr);

        let mut delete = vec!["-t", NAT, "-D", POSTROUTING];
        let jump = self.jump_rule(addr);
        delete.extend(jump.iter().map(String::as_str));
        if let Err(e) = run_iptables(tool, &delete).await {
            tracing::debug!("Masquerade jump rule for {} not removed: {}", addr, e);
        }

        for action in ["-F", "-X"] {
            if let Err(e) = run_iptables(tool, &["-t", NAT, action, &self.chain]).await {
                tracing::debug!("iptables {} {} skipped: {}", action, self.chain, e);
            }
        }

        tracing::info!("Masquerade removed for {}", addr.addr());
    }

    /// Rules inside the per-container chain
    pub fn chain_rules(&self, addr: &IpNet) -> Vec<Vec<String>> {
        let multicast = match Family::of(&addr.addr()) {
            Family::V4 => MULTICAST_V4,
            Family::V6 => MULTICAST_V6,
        };
        vec![
            self.with_comment(vec![
                "-d".to_string(),
                addr.trunc().to_string(),
                "-j".to_string(),
                "ACCEPT".to_string(),
            ]),
            self.with_comment(vec![
                "!".to_string(),
                "-d".to_string(),
                multicast.to_string(),
                "-j".to_string(),
                "MASQUERADE".to_string(),
            ]),
        ]
    }

    /// POSTROUTING rule sending the container's traffic to its chain
    pub fn jump_rule(&self, addr: &IpNet) -> Vec<String> {
        self.with_comment(vec![
            "-s".to_string(),
            addr.addr().to_string(),
            "-j".to_string(),
            self.chain.clone(),
        ])
    }

    fn with_comment(&self, mut rule: Vec<String>) -> Vec<String> {
        rule.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.comment.clone(),
        ]);
        rule
    }

    async fn append_unique(&self, tool: &str, chain: &str, rule: &[String]) -> NetworkResult<()> {
        let rule: Vec<&str> = rule.iter().map(String::as_str).collect();

        let mut check = vec!["-t", NAT, "-C", chain];
        check.extend(&rule);
        if run_iptables(tool, &check).await.is_ok() {
            return Ok(());
        }

        let mut append = vec!["-t", NAT, "-A", chain];
        append.extend(&rule);
        run_iptables(tool, &append).await
    }
}

fn tool(addr: &IpNet) -> &'static str {
    match addr {
        IpNet::V4(_) => "iptables",
        IpNet::V6(_) => "ip6tables",
    }
}

fn is_chain_exists(e: &NetworkError) -> bool {
    matches!(e, NetworkError::Command { stderr, .. } if stderr.contains("already exists"))
}

async fn run_iptables(tool: &str, args: &[&str]) -> NetworkResult<()> {
    let output = tokio::process::Command::new(tool)
        .arg("--wait")
        .args(args)
        .output()
        .await
        .map_err(NetworkError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Command {
            cmd: format!("{} {}", tool, args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn v4_rules() {
        let masq = Masquerade::new("village", "c1");
        let comment = "name: \"village\" id: \"c1\"";

        let rules = masq.chain_rules(&net("10.1.2.5/24"));
        assert_eq!(
            rules[0],
            vec!["-d", "10.1.2.0/24", "-j", "ACCEPT", "-m", "comment", "--comment", comment]
        );
        assert_eq!(
            rules[1],
            vec!["!", "-d", "224.0.0.0/4", "-j", "MASQUERADE", "-m", "comment", "--comment", comment]
        );

        let jump = masq.jump_rule(&net("10.1.2.5/24"));
        assert_eq!(&jump[..4], &["-s", "10.1.2.5", "-j", masq.chain()]);
    }

    #[test]
    fn v6_uses_ip6tables_and_v6_multicast() {
        let masq = Masquerade::new("village", "c1");
        let addr = net("fd00::5/64");
        assert_eq!(tool(&addr), "ip6tables");
        assert_eq!(masq.chain_rules(&addr)[1][2], "ff00::/8");
        assert_eq!(masq.chain_rules(&addr)[0][1], "fd00::/64");
    }

    #[test]
    fn chain_exists_detection() {
        let exists = NetworkError::Command {
            cmd: "iptables -t nat -N CNI-x".to_string(),
            stderr: "iptables: Chain already exists.".to_string(),
        };
        assert!(is_chain_exists(&exists));
        assert!(!is_chain_exists(&NetworkError::Config("x".to_string())));
    }
}
