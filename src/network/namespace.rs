use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::NetlinkHandle;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::future::Future;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

const NSFS_MAGIC: i64 = 0x6e73_6673;
const PROC_SUPER_MAGIC: i64 = 0x9fa0;
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open handle on a network namespace file (`/proc/<pid>/ns/net` or a
/// bind mount under `/var/run/netns`). The fd is released on drop.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    /// Open a namespace by path. A missing file is `NotFound`; a file that is
    /// not a namespace is rejected.
    pub fn open(path: impl AsRef<Path>) -> NetworkResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NetworkError::NotFound(format!("netns {}", path.display()))
            } else {
                NetworkError::Namespace(format!("failed to open {}: {}", path.display(), e))
            }
        })?;

        let fs_type = nix::sys::statfs::fstatfs(&file)?.filesystem_type().0 as i64;
        if fs_type != NSFS_MAGIC && fs_type != PROC_SUPER_MAGIC {
            return Err(NetworkError::Namespace(format!(
                "unknown FS magic on {}: {:x}",
                path.display(),
                fs_type
            )));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The namespace the calling thread is in right now
    pub fn current() -> NetworkResult<Self> {
        Self::open(THREAD_NETNS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Switch the calling thread into this namespace until the guard is
    /// dropped or `exit`ed.
    pub fn enter(&self) -> NetworkResult<NetNsGuard> {
        let saved = Self::current()?;
        setns(self.fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            NetworkError::Namespace(format!("setns into {} failed: {}", self.path.display(), e))
        })?;
        Ok(NetNsGuard {
            saved,
            restored: false,
            _not_send: PhantomData,
        })
    }

    /// Run `f` inside this namespace with a netlink handle bound to it.
    ///
    /// The calling thread stays inside the namespace for the whole await, so
    /// this must be driven by a current-thread runtime.
    pub async fn run<F, Fut, T>(&self, f: F) -> NetworkResult<T>
    where
        F: FnOnce(NetlinkHandle) -> Fut,
        Fut: Future<Output = NetworkResult<T>>,
    {
        let guard = self.enter()?;
        let result = match NetlinkHandle::new() {
            Ok(nl) => f(nl).await,
            Err(e) => Err(e),
        };
        let restored = guard.exit();
        let value = result?;
        restored?;
        Ok(value)
    }
}

/// Restores the thread's original network namespace when dropped.
/// Not `Send`: the namespace belongs to the OS thread that entered it.
pub struct NetNsGuard {
    saved: NetNs,
    restored: bool,
    _not_send: PhantomData<*const ()>,
}

impl NetNsGuard {
    /// Restore now and surface a failed `setns`.
    pub fn exit(mut self) -> NetworkResult<()> {
        self.restore()
    }

    fn restore(&mut self) -> NetworkResult<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        setns(self.saved.fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            NetworkError::Namespace(format!(
                "failed to switch back to {}: {}",
                self.saved.path.display(),
                e
            ))
        })
    }
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_own_namespace() {
        let ns = NetNs::current().unwrap();
        assert_eq!(ns.path(), Path::new(THREAD_NETNS));
        assert!(ns.fd() >= 0);
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = NetNs::open("/var/run/netns/does-not-exist-village").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn regular_file_is_not_a_namespace() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = NetNs::open(file.path()).unwrap_err();
        assert!(matches!(err, NetworkError::Namespace(_)), "{}", err);
    }
}
