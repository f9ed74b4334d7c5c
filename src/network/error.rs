use thiserror::Error;

/// Network-specific error type for all attachment operations
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Netlink operation failed
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),
    /// System I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Syscall failed (setns, socket, ...)
    #[error("system call error: {0}")]
    Sys(#[from] nix::Error),
    /// Result or config could not be (de)serialized
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// External command execution failed
    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },
    /// Network configuration is invalid; detected before any kernel mutation
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Requested state conflicts with what the kernel already holds
    #[error("conflict: {0}")]
    Conflict(String),
    /// A link exists under the requested name but is of another kind
    #[error("{name:?} already exists but is not a {expected}")]
    WrongKind { name: String, expected: &'static str },
    /// A link with this name already exists
    #[error("{0:?} already exists")]
    AlreadyExists(String),
    /// Resource not found (interface, namespace, address)
    #[error("not found: {0}")]
    NotFound(String),
    /// A link never reached the operational state we waited for
    #[error("not ready: {0}")]
    NotReady(String),
    /// Namespace operation failed
    #[error("namespace error: {0}")]
    Namespace(String),
    /// Live kernel state does not match a previously returned result
    #[error("{subject} check failed: {detail}")]
    Mismatch { subject: &'static str, detail: String },
    /// External IPAM plugin reported an error
    #[error("ipam {plugin} failed: {msg}")]
    Ipam { plugin: String, msg: String },
    /// Several independent checks failed, in the order they ran
    #[error("{}", join_errors(.0))]
    Multiple(Vec<NetworkError>),
}

fn join_errors(errors: &[NetworkError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl NetworkError {
    pub fn mismatch(subject: &'static str, detail: impl Into<String>) -> Self {
        NetworkError::Mismatch {
            subject,
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NetworkError::NotFound(_))
    }

    /// Error code for the CNI error object written on failure.
    pub fn cni_code(&self) -> u32 {
        match self {
            NetworkError::Json(_) => 6,
            NetworkError::Config(_) => 7,
            NetworkError::NotReady(_) => 11,
            NetworkError::Multiple(errors) => errors.first().map_or(100, Self::cni_code),
            _ => 100,
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_names_subject() {
        let err = NetworkError::mismatch("bridge", "promiscuous mode is on, expected off");
        assert_eq!(
            err.to_string(),
            "bridge check failed: promiscuous mode is on, expected off"
        );
    }

    #[test]
    fn wrong_kind_message() {
        let err = NetworkError::WrongKind {
            name: "cni0".to_string(),
            expected: "bridge",
        };
        assert_eq!(err.to_string(), "\"cni0\" already exists but is not a bridge");
    }

    #[test]
    fn codes() {
        assert_eq!(NetworkError::Config("x".into()).cni_code(), 7);
        assert_eq!(NetworkError::NotReady("x".into()).cni_code(), 11);
        assert_eq!(NetworkError::Conflict("x".into()).cni_code(), 100);
    }

    #[test]
    fn multiple_joins_in_order() {
        let err = NetworkError::Multiple(vec![
            NetworkError::mismatch("veth", "veth created for bridge cni0 was not found"),
            NetworkError::Config("macvlan is not configured".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "veth check failed: veth created for bridge cni0 was not found; \
             invalid configuration: macvlan is not configured"
        );
        assert_eq!(err.cni_code(), 100);
    }
}
