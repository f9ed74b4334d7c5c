// Network management module - kernel side of an attachment
// Netlink link/address/route operations, namespaces, sysctls, iptables masquerade.

pub mod arp;
pub mod bridge;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod macvlan;
pub mod namespace;
pub mod naming;
pub mod netlink;
pub mod sysctl;
pub mod veth;

pub use error::{NetworkError, NetworkResult};
pub use namespace::NetNs;
pub use netlink::NetlinkHandle;
