use crate::cni::args::CniArgs;
use crate::cni::types::{ErrorObject, ProvisionResult};
use crate::network::error::{NetworkError, NetworkResult};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Client seam to the address allocator.
#[allow(async_fn_in_trait)]
pub trait Ipam {
    async fn exec_add(&self, plugin: &str, stdin: &[u8]) -> NetworkResult<ProvisionResult>;
    async fn exec_del(&self, plugin: &str, stdin: &[u8]) -> NetworkResult<()>;
    async fn exec_check(&self, plugin: &str, stdin: &[u8]) -> NetworkResult<()>;
}

/// Runs the IPAM plugin binary found on `CNI_PATH`, passing the request's
/// CNI environment with `CNI_COMMAND` replaced.
pub struct ExecIpam {
    args: CniArgs,
}

impl ExecIpam {
    pub fn new(args: CniArgs) -> Self {
        Self { args }
    }

    fn find_plugin(&self, plugin: &str) -> NetworkResult<PathBuf> {
        if plugin.contains('/') {
            return Err(NetworkError::Config(format!(
                "invalid IPAM plugin name {:?}",
                plugin
            )));
        }
        self.args
            .plugin_dirs()
            .into_iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                NetworkError::NotFound(format!(
                    "failed to find plugin {:?} in path {:?}",
                    plugin, self.args.path
                ))
            })
    }

    async fn exec(&self, command: &str, plugin: &str, stdin: &[u8]) -> NetworkResult<Vec<u8>> {
        let binary = self.find_plugin(plugin)?;
        tracing::debug!("Executing IPAM {} {}", binary.display(), command);

        let mut child = tokio::process::Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &self.args.container_id)
            .env("CNI_NETNS", &self.args.netns)
            .env("CNI_IFNAME", &self.args.if_name)
            .env("CNI_ARGS", &self.args.args)
            .env("CNI_PATH", &self.args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(NetworkError::Io)?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin).await.map_err(NetworkError::Io)?;
        }

        let output = child.wait_with_output().await.map_err(NetworkError::Io)?;
        if !output.status.success() {
            return Err(plugin_error(plugin, &output.stdout, &output.stderr));
        }
        Ok(output.stdout)
    }
}

impl Ipam for ExecIpam {
    async fn exec_add(&self, plugin: &str, stdin: &[u8]) -> NetworkResult<ProvisionResult> {
        let stdout = self.exec("ADD", plugin, stdin).await?;
        parse_add_output(plugin, &stdout)
    }

    async fn exec_del(&self, plugin: &str, stdin: &[u8]) -> NetworkResult<()> {
        self.exec("DEL", plugin, stdin).await.map(|_| ())
    }

    async fn exec_check(&self, plugin: &str, stdin: &[u8]) -> NetworkResult<()> {
        self.exec("CHECK", plugin, stdin).await.map(|_| ())
    }
}

/// Decode a successful ADD reply. A plugin may still answer with an error
/// object on exit status 0.
fn parse_add_output(plugin: &str, stdout: &[u8]) -> NetworkResult<ProvisionResult> {
    if let Ok(err) = serde_json::from_slice::<ErrorObject>(stdout) {
        if err.code != 0 {
            return Err(ipam_error(plugin, &err));
        }
    }
    Ok(serde_json::from_slice(stdout)?)
}

fn plugin_error(plugin: &str, stdout: &[u8], stderr: &[u8]) -> NetworkError {
    match serde_json::from_slice::<ErrorObject>(stdout) {
        Ok(err) => ipam_error(plugin, &err),
        Err(_) => NetworkError::Ipam {
            plugin: plugin.to_string(),
            msg: String::from_utf8_lossy(stderr).trim().to_string(),
        },
    }
}

fn ipam_error(plugin: &str, err: &ErrorObject) -> NetworkError {
    let msg = if err.details.is_empty() {
        err.msg.clone()
    } else {
        format!("{}; {}", err.msg, err.details)
    };
    NetworkError::Ipam {
        plugin: plugin.to_string(),
        msg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cni::args::Command;

    fn args_with_path(path: &str) -> CniArgs {
        CniArgs {
            command: Command::Add,
            container_id: "c1".to_string(),
            netns: "/var/run/netns/c1".to_string(),
            if_name: "eth0".to_string(),
            args: String::new(),
            path: path.to_string(),
            stdin_data: Vec::new(),
        }
    }

    #[test]
    fn decodes_result() {
        let raw = br#"{"cniVersion": "0.4.0", "ips": [{"version": "4", "address": "10.1.2.5/24"}]}"#;
        let result = parse_add_output("village-ipam", raw).unwrap();
        assert_eq!(result.ips.len(), 1);
    }

    #[test]
    fn decodes_error_object() {
        let raw = br#"{"code": 11, "msg": "pool exhausted", "details": "10.1.2.0/24"}"#;
        let err = parse_add_output("village-ipam", raw).unwrap_err();
        assert_eq!(
            err.to_string(),
            "ipam village-ipam failed: pool exhausted; 10.1.2.0/24"
        );
    }

    #[test]
    fn failure_without_json_uses_stderr() {
        let err = plugin_error("village-ipam", b"", b"dial unix: no such file\n");
        assert_eq!(
            err.to_string(),
            "ipam village-ipam failed: dial unix: no such file"
        );
    }

    #[test]
    fn finds_plugin_on_path() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("village-ipam"), b"").unwrap();
        let path = format!("{}:{}", first.path().display(), second.path().display());

        let ipam = ExecIpam::new(args_with_path(&path));
        assert_eq!(
            ipam.find_plugin("village-ipam").unwrap(),
            second.path().join("village-ipam")
        );
        assert!(ipam.find_plugin("host-local").unwrap_err().is_not_found());
        assert!(ipam.find_plugin("../evil").is_err());
    }

    #[tokio::test]
    async fn runs_plugin_with_command_env() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo-ipam");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat >/dev/null\nprintf '{\"cniVersion\":\"0.4.0\",\"dns\":{\"domain\":\"%s\"}}' \"$CNI_COMMAND\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ipam = ExecIpam::new(args_with_path(&dir.path().display().to_string()));
        let result = ipam.exec_add("echo-ipam", b"{}").await.unwrap();
        assert_eq!(result.dns.domain, "ADD");
        ipam.exec_del("echo-ipam", b"{}").await.unwrap();
    }
}
