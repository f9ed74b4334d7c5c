// village CNI plugin binary
// Reads the request from the CNI environment and stdin, prints the result
// or a CNI error object on stdout.

use clap::Parser;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use village::cni::args::{CniArgs, Command};
use village::cni::config::NetworkConfig;
use village::cni::ipam::ExecIpam;
use village::cni::types::{ErrorObject, ProvisionResult};
use village::cni::SUPPORTED_VERSIONS;
use village::ctrl::{Attachment, BridgeCtrl, MacvlanCtrl};
use village::network::naming::NameGen;
use village::network::{NetworkError, NetworkResult};
use village::orchestrator::Village;

const LOG_ENV: &str = "VILLAGE_LOG";
const LOG_FILE_ENV: &str = "VILLAGE_LOG_FILE";
const LATEST_VERSION: &str = "1.0.0";
/// CNI error code for missing or invalid environment variables
const INVALID_ENV_CODE: u32 = 4;

// Namespace switches are per OS thread: everything runs on this one.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();

    let mut args = match CniArgs::try_parse() {
        Ok(args) => args,
        Err(e) => fail(String::new(), INVALID_ENV_CODE, e.to_string(), String::new()),
    };

    if args.command == Command::Version {
        print_version();
        return;
    }

    if let Some(var) = args.missing_env() {
        fail(
            String::new(),
            INVALID_ENV_CODE,
            format!("required env variable {} missing", var),
            String::new(),
        );
    }

    if let Err(e) = io::stdin().read_to_end(&mut args.stdin_data) {
        fail(String::new(), 100, "error reading from stdin".to_string(), e.to_string());
    }
    let cni_version = requested_version(&args.stdin_data);

    tracing::info!(
        "{:?} container={} netns={} ifname={}",
        args.command,
        args.container_id,
        args.netns,
        args.if_name
    );

    match run(&args).await {
        Ok(Some(result)) => {
            if let Err(e) = result.print_to(io::stdout().lock()) {
                fail(cni_version, e.cni_code(), "failed to print result".to_string(), e.to_string());
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("{:?} failed: {}", args.command, e);
            fail(cni_version, e.cni_code(), e.to_string(), String::new());
        }
    }
}

async fn run(args: &CniArgs) -> NetworkResult<Option<ProvisionResult>> {
    let conf = NetworkConfig::parse(&args.stdin_data, &args.args)?;
    let att = Attachment::from_args(args);

    let bridge = BridgeCtrl::new(&conf, att.clone(), NameGen::from_entropy())?;
    let macvlan = match conf.macvlan {
        Some(_) => Some(MacvlanCtrl::new(&conf, &att, NameGen::from_entropy())?),
        None => None,
    };
    let ipam = ExecIpam::new(args.clone());
    let mut village = Village::new(&conf, &args.stdin_data, &args.netns, ipam, bridge, macvlan);

    match args.command {
        Command::Add => village.add().await.map(Some),
        Command::Del => village.del().await.map(|()| None),
        Command::Check => village.check().await.map(|()| None),
        Command::Version => Err(NetworkError::Config(
            "VERSION takes no network configuration".to_string(),
        )),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // stdout belongs to the runtime
    let log_file = std::env::var(LOG_FILE_ENV).ok().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    match log_file {
        Some(file) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        None => builder.with_writer(io::stderr).init(),
    }
}

/// `cniVersion` of the request, empty when it cannot be read
fn requested_version(stdin: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(stdin)
        .ok()
        .and_then(|conf| conf.get("cniVersion")?.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn print_version() {
    let info = serde_json::json!({
        "cniVersion": LATEST_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    });
    println!("{}", info);
}

fn fail(cni_version: String, code: u32, msg: String, details: String) -> ! {
    let err = ErrorObject {
        cni_version,
        code,
        msg,
        details,
    };
    if let Err(e) = err.print_to(io::stdout().lock()) {
        eprintln!("failed to print error: {}", e);
    }
    std::process::exit(1);
}
