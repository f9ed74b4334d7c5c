use crate::network::error::NetworkResult;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;

/// CNI result envelope returned by ADD and carried as `prevResult` into CHECK.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    /// Namespace path; empty for host-side interfaces
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// "4" or "6"; pre-1.0 results carry it, 1.0 results may omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Index into `interfaces` of the owning interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_empty()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

impl ProvisionResult {
    /// Write the result as JSON indented with four spaces.
    pub fn print_to<W: Write>(&self, writer: W) -> NetworkResult<()> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
        self.serialize(&mut ser)?;
        Ok(())
    }

    /// Index of the first interface with this name and, when given, sandbox.
    pub fn find_interface(&self, name: &str, sandbox: Option<&str>) -> Option<usize> {
        self.interfaces
            .iter()
            .position(|intf| intf.name == name && sandbox.map_or(true, |s| intf.sandbox == s))
    }
}

/// CNI error object written to stdout when a command fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorObject {
    pub fn print_to<W: Write>(&self, writer: W) -> NetworkResult<()> {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(writer, formatter);
        self.serialize(&mut ser)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProvisionResult {
        ProvisionResult {
            cni_version: "0.4.0".to_string(),
            interfaces: vec![
                Interface {
                    name: "cni0".to_string(),
                    mac: "0a:58:0a:01:02:01".to_string(),
                    sandbox: String::new(),
                },
                Interface {
                    name: "eth0".to_string(),
                    mac: String::new(),
                    sandbox: "/var/run/netns/c1".to_string(),
                },
            ],
            ips: vec![IpConfig {
                version: Some("4".to_string()),
                interface: Some(1),
                address: "10.1.2.5/24".parse().unwrap(),
                gateway: Some("10.1.2.1".parse().unwrap()),
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".parse().unwrap(),
                gw: None,
            }],
            dns: Dns::default(),
        }
    }

    #[test]
    fn prints_with_four_space_indent() {
        let mut out = Vec::new();
        sample().print_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("{\n    \"cniVersion\": \"0.4.0\""));
        assert!(text.contains("\n        {\n            \"name\": \"cni0\""));
        assert!(!text.contains("\"dns\""));
        assert!(!text.contains("\"gw\""));
    }

    #[test]
    fn parses_prev_result_without_optional_fields() {
        let raw = r#"{
            "cniVersion": "1.0.0",
            "interfaces": [{"name": "eth0", "sandbox": "/proc/1/ns/net"}],
            "ips": [{"address": "fd00::5/64", "interface": 0}]
        }"#;
        let result: ProvisionResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.interfaces[0].mac, "");
        assert_eq!(result.ips[0].version, None);
        assert_eq!(result.ips[0].gateway, None);
        assert!(result.routes.is_empty());
        assert!(result.dns.is_empty());
    }

    #[test]
    fn finds_interface_by_name_and_sandbox() {
        let result = sample();
        assert_eq!(result.find_interface("cni0", None), Some(0));
        assert_eq!(result.find_interface("eth0", Some("/var/run/netns/c1")), Some(1));
        assert_eq!(result.find_interface("eth0", Some("/other")), None);
    }

    #[test]
    fn error_object_omits_empty_details() {
        let err = ErrorObject {
            cni_version: "0.4.0".to_string(),
            code: 7,
            msg: "invalid configuration: vlan".to_string(),
            details: String::new(),
        };
        let mut out = Vec::new();
        err.print_to(&mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["code"], 7);
        assert!(parsed.get("details").is_none());
    }
}
