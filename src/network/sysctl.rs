use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::Family;
use std::path::{Path, PathBuf};

/// Kernel knobs under `/proc/sys` and `/sys/class/net`.
///
/// `/proc/sys/net` resolves against the calling thread's network namespace,
/// so writes made while a `NetNsGuard` is held land in the container.
/// `/sys/class/net` follows the namespace sysfs was mounted in (the host).
#[derive(Debug, Clone)]
pub struct Sysctl {
    proc_root: PathBuf,
    sysfs_root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::with_root("/proc/sys", "/sys/class/net")
    }
}

impl Sysctl {
    pub fn with_root(proc_root: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sysfs_root: sysfs_root.into(),
        }
    }

    /// Read a sysctl; `key` is slash separated (`net/ipv4/ip_forward`)
    pub fn get(&self, key: &str) -> NetworkResult<String> {
        read(&self.proc_root.join(key))
    }

    pub fn set(&self, key: &str, value: &str) -> NetworkResult<()> {
        write(&self.proc_root.join(key), value)
    }

    // ── /proc/sys/net ─────────────────────────────────────────────────

    pub fn enable_forwarding(&self, family: Family) -> NetworkResult<()> {
        let key = match family {
            Family::V4 => "net/ipv4/ip_forward",
            Family::V6 => "net/ipv6/conf/all/forwarding",
        };
        self.set(key, "1")?;
        tracing::debug!("Enabled {:?} forwarding", family);
        Ok(())
    }

    pub fn disable_accept_ra(&self, if_name: &str) -> NetworkResult<()> {
        self.set(&format!("net/ipv6/conf/{}/accept_ra", if_name), "0")
    }

    pub fn enable_proxy_arp(&self, if_name: &str) -> NetworkResult<()> {
        self.set(&format!("net/ipv4/conf/{}/proxy_arp", if_name), "1")
    }

    /// Turn off duplicate address detection on `if_name` unless the kernel
    /// already runs enhanced DAD there, which tolerates looped-back probes.
    pub fn disable_dad(&self, if_name: &str) -> NetworkResult<()> {
        let enhanced = format!("net/ipv6/conf/{}/enhanced_dad", if_name);
        if matches!(self.get(&enhanced), Ok(v) if v == "1\n") {
            return Ok(());
        }
        self.set(&format!("net/ipv6/conf/{}/accept_dad", if_name), "0")
    }

    // ── /sys/class/net ────────────────────────────────────────────────

    pub fn set_hairpin(&self, port: &str, on: bool) -> NetworkResult<()> {
        write(
            &self.sysfs_root.join(port).join("brport/hairpin_mode"),
            if on { "1" } else { "0" },
        )
    }

    pub fn enable_vlan_filtering(&self, bridge: &str) -> NetworkResult<()> {
        write(&self.sysfs_root.join(bridge).join("bridge/vlan_filtering"), "1")
    }
}

fn read(path: &Path) -> NetworkResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        NetworkError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read {}: {}", path.display(), e),
        ))
    })
}

fn write(path: &Path, value: &str) -> NetworkResult<()> {
    std::fs::write(path, value).map_err(|e| {
        NetworkError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to set {} to {}: {}", path.display(), value, e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_roots(files: &[&str]) -> (TempDir, Sysctl) {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            let path = dir.path().join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "0\n").unwrap();
        }
        let sysctl = Sysctl::with_root(dir.path().join("proc"), dir.path().join("sys"));
        (dir, sysctl)
    }

    fn contents(dir: &TempDir, file: &str) -> String {
        std::fs::read_to_string(dir.path().join(file)).unwrap()
    }

    #[test]
    fn forwarding_per_family() {
        let (dir, sysctl) = fake_roots(&[
            "proc/net/ipv4/ip_forward",
            "proc/net/ipv6/conf/all/forwarding",
        ]);
        sysctl.enable_forwarding(Family::V4).unwrap();
        assert_eq!(contents(&dir, "proc/net/ipv4/ip_forward"), "1");
        assert_eq!(contents(&dir, "proc/net/ipv6/conf/all/forwarding"), "0\n");
        sysctl.enable_forwarding(Family::V6).unwrap();
        assert_eq!(contents(&dir, "proc/net/ipv6/conf/all/forwarding"), "1");
    }

    #[test]
    fn dad_disabled_without_enhanced_dad() {
        let (dir, sysctl) = fake_roots(&[
            "proc/net/ipv6/conf/eth0/enhanced_dad",
            "proc/net/ipv6/conf/eth0/accept_dad",
        ]);
        sysctl.disable_dad("eth0").unwrap();
        assert_eq!(contents(&dir, "proc/net/ipv6/conf/eth0/accept_dad"), "0");
    }

    #[test]
    fn dad_left_alone_with_enhanced_dad() {
        let (dir, sysctl) = fake_roots(&["proc/net/ipv6/conf/eth0/accept_dad"]);
        std::fs::write(dir.path().join("proc/net/ipv6/conf/eth0/enhanced_dad"), "1\n").unwrap();
        std::fs::write(dir.path().join("proc/net/ipv6/conf/eth0/accept_dad"), "1\n").unwrap();
        sysctl.disable_dad("eth0").unwrap();
        assert_eq!(contents(&dir, "proc/net/ipv6/conf/eth0/accept_dad"), "1\n");
    }

    #[test]
    fn bridge_port_knobs() {
        let (dir, sysctl) = fake_roots(&[
            "sys/veth0a1b2c3d/brport/hairpin_mode",
            "sys/cni0/bridge/vlan_filtering",
        ]);
        sysctl.set_hairpin("veth0a1b2c3d", true).unwrap();
        sysctl.enable_vlan_filtering("cni0").unwrap();
        assert_eq!(contents(&dir, "sys/veth0a1b2c3d/brport/hairpin_mode"), "1");
        assert_eq!(contents(&dir, "sys/cni0/bridge/vlan_filtering"), "1");
    }

    #[test]
    fn missing_knob_names_the_path() {
        let (_dir, sysctl) = fake_roots(&[]);
        let err = sysctl.enable_proxy_arp("mv0tmp").unwrap_err();
        assert!(err.to_string().contains("net/ipv4/conf/mv0tmp/proxy_arp"), "{}", err);
    }
}
