// CNI invocation arguments
// The runtime passes everything through environment variables; clap reads them.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    #[value(name = "ADD")]
    Add,
    #[value(name = "DEL")]
    Del,
    #[value(name = "CHECK")]
    Check,
    #[value(name = "VERSION")]
    Version,
}

/// village - attach containers to a host bridge and optional macvlan
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "CNI plugin: bridge + veth + macvlan attachment")]
pub struct CniArgs {
    /// Operation requested by the runtime
    #[clap(long, env = "CNI_COMMAND", value_enum)]
    pub command: Command,

    /// Container ID
    #[clap(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the container's network namespace
    #[clap(long, env = "CNI_NETNS", default_value = "")]
    pub netns: String,

    /// Interface name to create inside the container
    #[clap(long, env = "CNI_IFNAME", default_value = "")]
    pub if_name: String,

    /// Extra `KEY=VALUE;...` arguments
    #[clap(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Colon-separated plugin search path
    #[clap(long, env = "CNI_PATH", default_value = "")]
    pub path: String,

    /// Network configuration read from stdin
    #[clap(skip)]
    pub stdin_data: Vec<u8>,
}

impl CniArgs {
    /// Directories on `CNI_PATH`, in order
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        std::env::split_paths(&self.path)
            .filter(|p| !p.as_os_str().is_empty())
            .collect()
    }

    /// Check that the variables a command needs are present.
    pub fn missing_env(&self) -> Option<&'static str> {
        match self.command {
            Command::Version => None,
            Command::Add | Command::Check => {
                if self.container_id.is_empty() {
                    Some("CNI_CONTAINERID")
                } else if self.netns.is_empty() {
                    Some("CNI_NETNS")
                } else if self.if_name.is_empty() {
                    Some("CNI_IFNAME")
                } else {
                    None
                }
            }
            Command::Del => {
                if self.container_id.is_empty() {
                    Some("CNI_CONTAINERID")
                } else if self.if_name.is_empty() {
                    Some("CNI_IFNAME")
                } else {
                    None
                }
            }
        }
    }
}

/// Split `CNI_ARGS` into key/value pairs. Malformed entries are skipped.
pub fn parse_cni_args(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: Command) -> CniArgs {
        CniArgs {
            command,
            container_id: "c1".to_string(),
            netns: "/var/run/netns/c1".to_string(),
            if_name: "eth0".to_string(),
            args: String::new(),
            path: "/opt/cni/bin::/usr/libexec/cni".to_string(),
            stdin_data: Vec::new(),
        }
    }

    #[test]
    fn splits_cni_args() {
        let pairs = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAME=web;MAC=0a:00:00:00:00:02;junk");
        assert_eq!(
            pairs,
            vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAME".to_string(), "web".to_string()),
                ("MAC".to_string(), "0a:00:00:00:00:02".to_string()),
            ]
        );
        assert!(parse_cni_args("").is_empty());
    }

    #[test]
    fn plugin_dirs_skip_empty_entries() {
        let dirs = args(Command::Add).plugin_dirs();
        assert_eq!(
            dirs,
            vec![PathBuf::from("/opt/cni/bin"), PathBuf::from("/usr/libexec/cni")]
        );
    }

    #[test]
    fn del_does_not_need_netns() {
        let mut a = args(Command::Del);
        a.netns.clear();
        assert_eq!(a.missing_env(), None);

        let mut a = args(Command::Add);
        a.netns.clear();
        assert_eq!(a.missing_env(), Some("CNI_NETNS"));
    }

    #[test]
    fn parses_command_names() {
        let parsed = CniArgs::try_parse_from(["village", "--command", "CHECK"]).unwrap();
        assert_eq!(parsed.command, Command::Check);
        assert!(CniArgs::try_parse_from(["village", "--command", "add"]).is_err());
    }
}
