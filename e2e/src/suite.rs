//! Suite driver: phase sequencing and teardown.
//!
//! A run is a straight line of phases over a single [Context]:
//!
//! 1. create the virtual network,
//! 2. configure every chain and start its validators,
//! 3. connect every pair of chains with a relayer,
//! 4. transfer tokens, upgrade every chain, and transfer again,
//! 5. bootstrap the validators of the first chain with state sync.
//!
//! Any error stops the run. Teardown always follows and reclaims everything recorded in the
//! [Registry], unless cleanup is skipped.

use crate::{
    bootstrap::{configure_chain, run_validators, wait_until_height},
    chain::Network,
    config::{ChainConfig, Config, Images},
    node::ChainNode,
    platform::ContainerPlatform,
    poll::Poller,
    registry::Registry,
    relay::run_relayers,
    state_sync::configure_state_sync,
    transfer::check_transfers,
    upgrade::upgrade,
    Error,
};
use std::{io::ErrorKind, path::PathBuf, time::Duration};
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

/// Height every chain must reach before the run proceeds past startup.
pub const STARTUP_HEIGHT: u64 = 3;

/// Environment variable that disables the relay phase (requires [SKIP_UPGRADE_ENV]).
pub const SKIP_IBC_ENV: &str = "E2E_SKIP_IBC";

/// Environment variable that disables the upgrade phase.
pub const SKIP_UPGRADE_ENV: &str = "E2E_SKIP_UPGRADE";

/// Environment variable that disables the state sync phase.
pub const SKIP_STATE_SYNC_ENV: &str = "E2E_SKIP_STATE_SYNC";

/// Environment variable that leaves every container and directory in place after the run.
pub const SKIP_CLEANUP_ENV: &str = "E2E_SKIP_CLEANUP";

/// Phases to skip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub skip_ibc: bool,
    pub skip_upgrade: bool,
    pub skip_state_sync: bool,
    pub skip_cleanup: bool,
}

/// Parses a boolean the way the suite's environment has always accepted them.
fn parse_bool(name: &'static str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(Error::InvalidFlag {
            name,
            value: value.to_string(),
        }),
    }
}

impl Flags {
    /// Reads flags from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads flags through `lookup`. Unset and empty variables are false.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let read = |name: &'static str| -> Result<bool, Error> {
            match lookup(name) {
                Some(value) if !value.is_empty() => parse_bool(name, &value),
                _ => Ok(false),
            }
        };
        Ok(Self {
            skip_ibc: read(SKIP_IBC_ENV)?,
            skip_upgrade: read(SKIP_UPGRADE_ENV)?,
            skip_state_sync: read(SKIP_STATE_SYNC_ENV)?,
            skip_cleanup: read(SKIP_CLEANUP_ENV)?,
        })
    }

    /// The upgrade is verified over the relayer, so it cannot run without it.
    pub fn validate(&self) -> Result<(), Error> {
        if self.skip_ibc && !self.skip_upgrade {
            return Err(Error::InvalidFlags("skipping ibc requires skipping the upgrade"));
        }
        Ok(())
    }
}

/// Everything a run owns.
pub struct Context<P: ContainerPlatform, N: ChainNode> {
    pub platform: P,
    pub node: N,
    pub config: Config,
    pub flags: Flags,
    /// Images in effect (switched to the upgrade build mid-run).
    pub images: Images,
    pub registry: Registry,
    /// Configured chains, in configuration order.
    pub networks: Vec<Network>,
    tmp_dirs: Vec<TempDir>,
}

impl<P: ContainerPlatform, N: ChainNode> Context<P, N> {
    pub fn new(platform: P, node: N, config: Config, flags: Flags) -> Self {
        let images = Images::new(&config.images, !flags.skip_upgrade);
        Self {
            platform,
            node,
            config,
            flags,
            images,
            registry: Registry::new(),
            networks: Vec::new(),
            tmp_dirs: Vec::new(),
        }
    }

    /// Poller with the configured interval and the given timeout.
    pub fn poller(&self, timeout: Duration) -> Poller {
        Poller::timeout(self.config.timeouts.poll_interval(), timeout)
    }

    pub fn network(&self, index: usize) -> Result<&Network, Error> {
        self.networks.get(index).ok_or(Error::UnknownNetwork(index))
    }

    /// Creates a temporary directory that lives until teardown.
    pub fn temp_dir(&mut self, prefix: &str) -> Result<PathBuf, Error> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        self.tmp_dirs.push(dir);
        Ok(path)
    }

    /// Chains the run configures (only the first one when relaying is skipped).
    fn chains(&self) -> Vec<ChainConfig> {
        let count = if self.flags.skip_ibc { 1 } else { usize::MAX };
        self.config.chains.iter().take(count).cloned().collect()
    }

    /// Reclaims every resource acquired by the run.
    ///
    /// Containers and the network are removed before directories. Every resource is attempted
    /// even if an earlier one fails; the first failure is returned.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        if self.flags.skip_cleanup {
            for dir in self.tmp_dirs.drain(..) {
                let path = dir.keep();
                info!(path = %path.display(), "retained directory");
            }
            info!("skipping cleanup");
            return Ok(());
        }

        info!("tearing down");
        let mut first = self.registry.drain(&self.platform).await.err();
        for network in &self.networks {
            let data_dir = &network.chain.data_dir;
            match std::fs::remove_dir_all(data_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %data_dir.display(), error = %err, "failed to remove data dir");
                    first.get_or_insert(err.into());
                }
            }
        }
        for dir in self.tmp_dirs.drain(..) {
            let path = dir.path().to_path_buf();
            if let Err(err) = dir.close() {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove temp dir");
                    first.get_or_insert(err.into());
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Runs every phase not disabled by the flags.
async fn setup<P: ContainerPlatform, N: ChainNode>(ctx: &mut Context<P, N>) -> Result<(), Error> {
    ctx.flags.validate()?;
    info!(flags = ?ctx.flags, "setting up e2e suite");

    let network = ctx
        .platform
        .create_network(&format!("e2e-{}", Uuid::new_v4()))
        .await?;
    ctx.registry.set_network(network);

    for chain in ctx.chains() {
        configure_chain(ctx, &chain).await?;
    }
    let startup = ctx.config.timeouts.startup();
    for index in 0..ctx.networks.len() {
        run_validators(ctx, index).await?;
        wait_until_height(ctx, index, STARTUP_HEIGHT, startup).await?;
    }

    if !ctx.flags.skip_ibc {
        run_relayers(ctx).await?;
    }
    if !ctx.flags.skip_upgrade {
        check_transfers(ctx).await?;
        upgrade(ctx).await?;
        check_transfers(ctx).await?;
    }
    if !ctx.flags.skip_state_sync {
        configure_state_sync(ctx, 0).await?;
    }
    info!("e2e suite passed");
    Ok(())
}

/// Runs the suite, then tears it down.
///
/// If setup failed, its error is returned even if teardown also failed.
pub async fn run<P: ContainerPlatform, N: ChainNode>(mut ctx: Context<P, N>) -> Result<(), Error> {
    let result = setup(&mut ctx).await;
    if let Err(err) = &result {
        warn!(error = %err, "setup failed");
    }
    let teardown = ctx.teardown().await;
    result.and(teardown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_flags_default_to_false() {
        let flags = Flags::from_lookup(lookup(&[(SKIP_IBC_ENV, "")])).unwrap();
        assert_eq!(flags, Flags::default());
        flags.validate().unwrap();
    }

    #[test]
    fn test_flags_parse() {
        let flags = Flags::from_lookup(lookup(&[
            (SKIP_IBC_ENV, "true"),
            (SKIP_UPGRADE_ENV, "1"),
            (SKIP_STATE_SYNC_ENV, "F"),
            (SKIP_CLEANUP_ENV, "TRUE"),
        ]))
        .unwrap();
        assert!(flags.skip_ibc);
        assert!(flags.skip_upgrade);
        assert!(!flags.skip_state_sync);
        assert!(flags.skip_cleanup);
        flags.validate().unwrap();
    }

    #[test]
    fn test_flags_reject_garbage() {
        let err = Flags::from_lookup(lookup(&[(SKIP_UPGRADE_ENV, "yes")])).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidFlag {
                name: SKIP_UPGRADE_ENV,
                ..
            }
        ));
    }

    #[test]
    fn test_skip_ibc_requires_skip_upgrade() {
        let flags = Flags {
            skip_ibc: true,
            ..Default::default()
        };
        assert!(matches!(flags.validate(), Err(Error::InvalidFlags(_))));
    }
}
