// CNI surface: invocation arguments, stdin config, result types and the IPAM client

pub mod args;
pub mod config;
pub mod ipam;
pub mod types;

/// Result versions this plugin can emit and accept as `prevResult`
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];
