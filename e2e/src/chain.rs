//! Chains, their validators, and the per-chain state used across phases.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Estimated number of blocks it takes to deposit for a proposal.
pub const DEPOSIT_BLOCKS: f32 = 10.0;

/// Estimated number of blocks it takes a single validator to vote for a proposal.
pub const VOTE_BLOCKS: f32 = 1.2;

/// Number of blocks added to the voting period as a safety margin.
pub const BUFFER_BLOCKS: f32 = 5.0;

/// Estimated number of blocks it takes to submit a proposal.
pub const PROPOSAL_SUBMIT_BLOCKS: u64 = 10;

/// Pruning and snapshot configuration of a single validator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Pruning strategy (`default`, `nothing`, `everything`, or `custom`).
    pub pruning: String,
    pub pruning_keep_recent: u64,
    pub pruning_interval: u64,
    /// Blocks between state sync snapshots (0 disables snapshots).
    pub snapshot_interval: u64,
    pub snapshot_keep_recent: u32,
}

impl ValidatorConfig {
    pub fn new(
        pruning: &str,
        keep_recent: u64,
        interval: u64,
        snapshot_interval: u64,
        snapshot_keep_recent: u32,
    ) -> Self {
        Self {
            pruning: pruning.to_string(),
            pruning_keep_recent: keep_recent,
            pruning_interval: interval,
            snapshot_interval,
            snapshot_keep_recent,
        }
    }
}

/// Validator config in the form the init image expects.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ValidatorConfigArg<'a> {
    pruning: &'a str,
    pruning_keep_recent: String,
    pruning_interval: String,
    snapshot_interval: u64,
    snapshot_keep_recent: u32,
}

/// Encodes validator configs as the JSON argument of the init container.
pub fn encode_validator_configs(configs: &[ValidatorConfig]) -> Result<String, Error> {
    let args: Vec<_> = configs
        .iter()
        .map(|c| ValidatorConfigArg {
            pruning: &c.pruning,
            pruning_keep_recent: c.pruning_keep_recent.to_string(),
            pruning_interval: c.pruning_interval.to_string(),
            snapshot_interval: c.snapshot_interval,
            snapshot_keep_recent: c.snapshot_keep_recent,
        })
        .collect();
    Ok(serde_json::to_string(&args)?)
}

/// Part a validator plays in the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Reference node: queried for chain height, submits proposals, and serves the relayer.
    Seed,
    Peer,
}

/// A validator of a chain.
#[derive(Clone, Debug)]
pub struct Validator {
    pub index: usize,
    pub role: Role,
    pub name: String,
    pub mnemonic: String,
    pub public_address: String,
    pub config_dir: PathBuf,
    pub config: ValidatorConfig,
}

/// A chain under test.
#[derive(Clone, Debug)]
pub struct Chain {
    pub id: String,
    pub data_dir: PathBuf,
    pub validators: Vec<Validator>,
}

impl Chain {
    /// Returns the seed validator.
    pub fn seed(&self) -> Result<&Validator, Error> {
        self.validators
            .iter()
            .find(|v| v.role == Role::Seed)
            .ok_or_else(|| Error::MissingSeed(self.id.clone()))
    }

    /// Largest snapshot interval configured on any validator.
    pub fn max_snapshot_interval(&self) -> u64 {
        self.validators
            .iter()
            .map(|v| v.config.snapshot_interval)
            .max()
            .unwrap_or(0)
    }
}

/// Chain metadata written by the init container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainMeta {
    pub data_dir: String,
    pub id: String,
}

/// Validator record written by the init container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
    pub name: String,
    pub config_dir: String,
    pub index: usize,
    pub mnemonic: String,
    pub public_address: String,
    #[serde(default)]
    pub public_key: String,
}

/// Serialized topology produced by the init container (`<data-dir>/<chain-id>-encode`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub chain_meta: ChainMeta,
    pub validators: Vec<ValidatorRecord>,
}

impl Topology {
    /// Path of the serialized topology for `chain_id` in `data_dir`.
    pub fn path(data_dir: &std::path::Path, chain_id: &str) -> PathBuf {
        data_dir.join(format!("{chain_id}-encode"))
    }

    /// Builds a [Chain] from the topology and the configs that were passed to the init container.
    ///
    /// The validator with the lowest index becomes the seed.
    pub fn into_chain(self, configs: &[ValidatorConfig]) -> Result<Chain, Error> {
        if self.validators.len() != configs.len() {
            return Err(Error::TopologyMismatch {
                chain: self.chain_meta.id,
                expected: configs.len(),
                found: self.validators.len(),
            });
        }
        let mut records = self.validators;
        records.sort_by_key(|r| r.index);
        let mut indices: Vec<usize> = records.iter().map(|r| r.index).collect();
        indices.dedup();
        if indices.len() != records.len() {
            return Err(Error::TopologyMismatch {
                chain: self.chain_meta.id,
                expected: configs.len(),
                found: indices.len(),
            });
        }
        let mut validators = Vec::with_capacity(records.len());
        for (position, record) in records.into_iter().enumerate() {
            let Some(config) = configs.get(record.index) else {
                return Err(Error::TopologyMismatch {
                    chain: self.chain_meta.id,
                    expected: configs.len(),
                    found: record.index + 1,
                });
            };
            validators.push(Validator {
                index: record.index,
                role: if position == 0 { Role::Seed } else { Role::Peer },
                name: record.name,
                mnemonic: record.mnemonic,
                public_address: record.public_address,
                config_dir: PathBuf::from(record.config_dir),
                config: config.clone(),
            });
        }
        Ok(Chain {
            id: self.chain_meta.id,
            data_dir: PathBuf::from(self.chain_meta.data_dir),
            validators,
        })
    }
}

/// Number of blocks the voting period must last for `validators` voters.
pub fn voting_period_blocks(validators: usize) -> u64 {
    (DEPOSIT_BLOCKS + validators as f32 * VOTE_BLOCKS + BUFFER_BLOCKS) as u64
}

/// Height at which an upgrade proposal submitted at `current` can safely take effect.
pub fn proposal_height(current: u64, voting_period: u64) -> u64 {
    current + voting_period + PROPOSAL_SUBMIT_BLOCKS
}

/// One chain and the state the suite keeps about it for the whole run.
#[derive(Debug)]
pub struct Network {
    /// Position of the network in the run (chain A is 0).
    pub index: usize,
    pub chain: Chain,
    /// Length of the governance voting period in blocks.
    pub voting_period: u64,
    proposal_height: Option<u64>,
}

impl Network {
    pub fn new(index: usize, chain: Chain, voting_period: u64) -> Self {
        Self {
            index,
            chain,
            voting_period,
            proposal_height: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.chain.id
    }

    /// Computes the proposal height from a live `current` height and freezes it.
    pub fn set_proposal_height(&mut self, current: u64) -> Result<u64, Error> {
        if let Some(height) = self.proposal_height {
            return Err(Error::ProposalHeightAlreadySet {
                chain: self.chain.id.clone(),
                height,
            });
        }
        let height = proposal_height(current, self.voting_period);
        self.proposal_height = Some(height);
        Ok(height)
    }

    pub fn proposal_height(&self) -> Result<u64, Error> {
        self.proposal_height
            .ok_or_else(|| Error::ProposalHeightMissing(self.chain.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs(n: usize) -> Vec<ValidatorConfig> {
        (0..n)
            .map(|i| ValidatorConfig::new("default", 0, 0, 10 * (i as u64 + 1), 2))
            .collect()
    }

    fn topology(chain: &str, n: usize) -> Topology {
        Topology {
            chain_meta: ChainMeta {
                data_dir: format!("/tmp/{chain}"),
                id: chain.to_string(),
            },
            validators: (0..n)
                .rev()
                .map(|i| ValidatorRecord {
                    name: format!("{chain}-val-{i}"),
                    config_dir: format!("/tmp/{chain}/val-{i}"),
                    index: i,
                    mnemonic: format!("mnemonic {i}"),
                    public_address: format!("addr{i}"),
                    public_key: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_validator_config_wire_format() {
        let config = ValidatorConfig::new("custom", 10000, 13, 15, 3);
        let encoded = encode_validator_configs(&[config]).unwrap();
        assert_eq!(
            encoded,
            r#"[{"Pruning":"custom","PruningKeepRecent":"10000","PruningInterval":"13","SnapshotInterval":15,"SnapshotKeepRecent":3}]"#
        );
    }

    #[test]
    fn test_topology_decodes_init_output() {
        let raw = r#"{
            "chainMeta": {"dataDir": "/tmp/e2e-a", "id": "chain-a"},
            "validators": [
                {"name": "chain-a-val-0", "configDir": "/tmp/e2e-a/val-0", "index": 0,
                 "mnemonic": "word word", "publicAddress": "addr0", "publicKey": "pk0"},
                {"name": "chain-a-val-1", "configDir": "/tmp/e2e-a/val-1", "index": 1,
                 "mnemonic": "word word", "publicAddress": "addr1"}
            ]
        }"#;
        let topology: Topology = serde_json::from_str(raw).unwrap();
        let chain = topology.into_chain(&configs(2)).unwrap();
        assert_eq!(chain.id, "chain-a");
        assert_eq!(chain.validators.len(), 2);
        assert_eq!(chain.seed().unwrap().name, "chain-a-val-0");
        assert_eq!(chain.validators[1].role, Role::Peer);
        assert_eq!(chain.validators[1].config_dir, PathBuf::from("/tmp/e2e-a/val-1"));
    }

    #[test]
    fn test_validator_count_matches_configs() {
        for n in 1..=4 {
            let chain = topology("chain-a", n).into_chain(&configs(n)).unwrap();
            assert_eq!(chain.validators.len(), n);
            // Records arrive out of order but roles follow index
            assert_eq!(chain.seed().unwrap().index, 0);
            for (i, validator) in chain.validators.iter().enumerate() {
                assert_eq!(validator.index, i);
                assert_eq!(validator.config, configs(n)[i]);
            }
        }
    }

    #[test]
    fn test_topology_mismatch() {
        let err = topology("chain-a", 2).into_chain(&configs(3)).unwrap_err();
        assert!(matches!(
            err,
            Error::TopologyMismatch {
                expected: 3,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_index_rejected() {
        // Two records claim index 0 and index 1 is never assigned
        let mut duplicated = topology("chain-a", 3);
        duplicated.validators[1].index = 0;
        let err = duplicated.into_chain(&configs(3)).unwrap_err();
        assert!(matches!(
            err,
            Error::TopologyMismatch {
                expected: 3,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_max_snapshot_interval() {
        let chain = topology("chain-a", 3).into_chain(&configs(3)).unwrap();
        assert_eq!(chain.max_snapshot_interval(), 30);
    }

    #[test]
    fn test_voting_period() {
        assert_eq!(voting_period_blocks(2), 17);
        assert_eq!(voting_period_blocks(3), 18);
        assert_eq!(voting_period_blocks(4), 19);
    }

    #[test]
    fn test_proposal_height_margin() {
        for validators in 1..8 {
            let voting_period = voting_period_blocks(validators);
            for current in [0u64, 1, 3, 250, 10_000] {
                let height = proposal_height(current, voting_period);
                assert!(height > current + voting_period);
            }
        }
    }

    #[test]
    fn test_proposal_height_is_immutable() {
        let chain = topology("chain-a", 2).into_chain(&configs(2)).unwrap();
        let mut network = Network::new(0, chain, voting_period_blocks(2));
        assert!(network.proposal_height().is_err());
        let height = network.set_proposal_height(100).unwrap();
        assert_eq!(height, 127);
        let err = network.set_proposal_height(500).unwrap_err();
        assert!(matches!(
            err,
            Error::ProposalHeightAlreadySet { height: 127, .. }
        ));
        assert_eq!(network.proposal_height().unwrap(), 127);
    }
}
