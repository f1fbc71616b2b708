//! Interchain E2E CLI

use clap::{Arg, ArgAction, Command};
use interchain_e2e::{
    config::Config,
    node::rpc::RpcNode,
    platform::docker::Docker,
    suite::{self, Context, Flags},
    Error,
};
use std::path::PathBuf;
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

const CONFIG_FLAG: &str = "config";
const SKIP_IBC_FLAG: &str = "skip-ibc";
const SKIP_UPGRADE_FLAG: &str = "skip-upgrade";
const SKIP_STATE_SYNC_FLAG: &str = "skip-state-sync";
const SKIP_CLEANUP_FLAG: &str = "skip-cleanup";

/// Builds the run from the command line and the environment, then runs the suite.
async fn execute(config: Option<&PathBuf>, flags: Flags) -> Result<(), Error> {
    let config = match config {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            Config::load(path)?
        }
        None => Config::default(),
    };
    let docker = Docker::connect()?;
    let node = RpcNode::new(docker.clone(), config.node.clone(), config.timeouts.exec())?;
    suite::run(Context::new(docker, node, config, flags)).await
}

/// Entrypoint for the Interchain E2E CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("e2e")
        .version(crate_version())
        .about("Run end-to-end relay, upgrade, and state sync scenarios across two chains.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(CONFIG_FLAG)
                .long(CONFIG_FLAG)
                .required(false)
                .help("Path to YAML config file (defaults to the two-chain reference setup)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(SKIP_IBC_FLAG)
                .long(SKIP_IBC_FLAG)
                .help("Run a single chain without a relayer (requires --skip-upgrade)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(SKIP_UPGRADE_FLAG)
                .long(SKIP_UPGRADE_FLAG)
                .help("Skip transfers and the software upgrade")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(SKIP_STATE_SYNC_FLAG)
                .long(SKIP_STATE_SYNC_FLAG)
                .help("Skip state syncing the validators of the first chain")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(SKIP_CLEANUP_FLAG)
                .long(SKIP_CLEANUP_FLAG)
                .help("Leave every container and directory in place after the run")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Command line flags add to the environment
    let mut flags = match Flags::from_env() {
        Ok(flags) => flags,
        Err(e) => {
            error!(error=?e, "invalid environment");
            return std::process::ExitCode::FAILURE;
        }
    };
    flags.skip_ibc |= matches.get_flag(SKIP_IBC_FLAG);
    flags.skip_upgrade |= matches.get_flag(SKIP_UPGRADE_FLAG);
    flags.skip_state_sync |= matches.get_flag(SKIP_STATE_SYNC_FLAG);
    flags.skip_cleanup |= matches.get_flag(SKIP_CLEANUP_FLAG);

    let config = matches.get_one::<PathBuf>(CONFIG_FLAG);
    if let Err(e) = execute(config, flags).await {
        error!(error=?e, "e2e suite failed");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}
