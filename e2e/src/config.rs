//! Run configuration.
//!
//! A run is described by a YAML file. Every section is optional: [Config::default] reproduces
//! the reference two-chain setup, and a file only needs to list what it changes.

use crate::{chain::ValidatorConfig, node::Coin, platform::Image, Error};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, time::Duration};

/// Identifier of the first chain.
pub const CHAIN_A_ID: &str = "ledger-test-a";

/// Identifier of the second chain.
pub const CHAIN_B_ID: &str = "ledger-test-b";

/// Full description of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub images: ImageConfig,
    pub node: NodeConfig,
    /// Tokens sent across chains before and after the upgrade.
    pub transfers: Vec<Coin>,
    pub state_sync: StateSyncConfig,
    pub timeouts: Timeouts,
}

impl Config {
    /// Loads a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chains: vec![
                ChainConfig {
                    id: CHAIN_A_ID.to_string(),
                    validators: vec![
                        ValidatorConfig::new("default", 0, 0, 20, 2),
                        ValidatorConfig::new("nothing", 0, 0, 30, 1),
                        ValidatorConfig::new("custom", 10000, 13, 15, 3),
                        ValidatorConfig::new("everything", 0, 0, 0, 0),
                    ],
                },
                ChainConfig {
                    id: CHAIN_B_ID.to_string(),
                    validators: vec![
                        ValidatorConfig::new("default", 0, 0, 1500, 2),
                        ValidatorConfig::new("nothing", 0, 0, 1500, 2),
                        ValidatorConfig::new("custom", 10000, 13, 1500, 2),
                    ],
                },
            ],
            images: ImageConfig::default(),
            node: NodeConfig::default(),
            transfers: vec![Coin::new(2_000_000, "uledger"), Coin::new(2_000_000, "stake")],
            state_sync: StateSyncConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

/// One chain and the validators it is initialized with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: String,
    pub validators: Vec<ValidatorConfig>,
}

/// Init and validator images of one release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub init: Image,
    pub validator: Image,
}

/// Images used by a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Release built from the code under test.
    pub current: Release,
    /// Release the upgrade starts from.
    pub previous: Release,
    pub relayer: Image,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            current: Release {
                init: Image::new("ledger-e2e-init", "debug"),
                validator: Image::new("ledger", "debug"),
            },
            previous: Release {
                init: Image::new("ledger-e2e-init", "v8.0.0"),
                validator: Image::new("ledger", "v8.0.0"),
            },
            relayer: Image::new("informalsystems/hermes", "0.13.0"),
        }
    }
}

/// Images currently in effect.
///
/// Runs that exercise the upgrade start from the previous release and switch validators to the
/// current release once the chains halt. Other runs use the current release throughout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    pub init: Image,
    pub validator: Image,
    pub relayer: Image,
    upgrade: Option<Image>,
}

impl Images {
    pub fn new(config: &ImageConfig, upgrade: bool) -> Self {
        if upgrade {
            Self {
                init: config.previous.init.clone(),
                validator: config.previous.validator.clone(),
                relayer: config.relayer.clone(),
                upgrade: Some(config.current.validator.clone()),
            }
        } else {
            Self {
                init: config.current.init.clone(),
                validator: config.current.validator.clone(),
                relayer: config.relayer.clone(),
                upgrade: None,
            }
        }
    }

    /// Switches validators to the upgraded image.
    ///
    /// Returns false if there is no upgrade to switch to (or it already happened).
    pub fn switch_to_upgrade(&mut self) -> bool {
        match self.upgrade.take() {
            Some(image) => {
                self.validator = image;
                true
            }
            None => false,
        }
    }
}

/// How the suite talks to the chain's CLI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name of the node daemon binary.
    pub daemon: String,
    /// Home directory of the daemon inside a validator container.
    pub home: String,
    /// Name of the validator key in the keyring.
    pub key: String,
    pub keyring_backend: String,
    pub fees: String,
    /// Deposit that activates the voting period of a proposal.
    pub deposit: String,
    /// Name of the software upgrade (the handler compiled into the upgraded binary).
    pub upgrade_name: String,
    /// Transfer port and channel connecting the two chains.
    pub port: String,
    pub channel: String,
    /// Name of the relayer binary inside the relayer container.
    pub relayer: String,
    /// User containers run as.
    pub user: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            daemon: "ledgerd".to_string(),
            home: "/root/.ledgerd".to_string(),
            key: "val".to_string(),
            keyring_backend: "test".to_string(),
            fees: "0uledger".to_string(),
            deposit: "10000000stake".to_string(),
            upgrade_name: "v9".to_string(),
            port: "transfer".to_string(),
            channel: "channel-0".to_string(),
            relayer: "hermes".to_string(),
            user: "root:root".to_string(),
        }
    }
}

/// State sync options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSyncConfig {
    /// Index of the validator that stays stopped (defaults to the last validator).
    pub held_back: Option<usize>,
}

/// Polling intervals and phase timeouts, in seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub poll_interval_secs: u64,
    /// Maximum number of attempts to read the topology written by the init container.
    pub topology_attempts: usize,
    /// Time for a freshly started chain to produce its first blocks.
    pub startup_secs: u64,
    pub relayer_secs: u64,
    /// Pause after the relayer is healthy, before channels are created.
    pub relayer_settle_secs: u64,
    pub halt_secs: u64,
    pub resume_secs: u64,
    pub state_sync_secs: u64,
    pub transfer_secs: u64,
    /// Bound on a single command run inside a container and on a one-shot container's exit.
    pub exec_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            topology_attempts: 60,
            startup_secs: 300,
            relayer_secs: 300,
            relayer_settle_secs: 10,
            halt_secs: 300,
            resume_secs: 300,
            state_sync_secs: 300,
            transfer_secs: 120,
            exec_secs: 300,
        }
    }
}

impl Timeouts {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn relayer(&self) -> Duration {
        Duration::from_secs(self.relayer_secs)
    }

    pub fn relayer_settle(&self) -> Duration {
        Duration::from_secs(self.relayer_settle_secs)
    }

    pub fn halt(&self) -> Duration {
        Duration::from_secs(self.halt_secs)
    }

    pub fn resume(&self) -> Duration {
        Duration::from_secs(self.resume_secs)
    }

    pub fn state_sync(&self) -> Duration {
        Duration::from_secs(self.state_sync_secs)
    }

    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }

    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_secs)
    }
}
