//! Interface to the ledger under test.
//!
//! The suite observes chains (height, block hash, sync status) and drives them (governance,
//! transfers, relayer control) only through [ChainNode]. Every method addresses a specific
//! container so that observations are attributed to the validator that produced them.

use crate::{platform::Container, Error};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, future::Future};

pub mod rpc;

/// Port of the Tendermint RPC server inside a validator container.
pub const RPC_PORT: u16 = 26657;

/// Port of the REST API inside a validator container.
pub const API_PORT: u16 = 1317;

/// Port of the gRPC server inside a validator container.
pub const GRPC_PORT: u16 = 9090;

/// Port of the relayer's REST status server inside its container.
pub const RELAYER_STATUS_PORT: u16 = 3031;

/// Sync status reported by a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncInfo {
    pub latest_block_height: u64,
    pub catching_up: bool,
}

/// An amount of a single denomination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

impl Coin {
    pub fn new(amount: u128, denom: &str) -> Self {
        Self {
            denom: denom.to_string(),
            amount,
        }
    }
}

impl std::fmt::Display for Coin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Balances of an account, by denomination.
pub type Balances = BTreeMap<String, u128>;

/// RPC and CLI surface of a chain node.
pub trait ChainNode: Clone + Send + Sync + 'static {
    /// Latest block height observed by `validator`.
    fn latest_height(&self, validator: &Container)
        -> impl Future<Output = Result<u64, Error>> + Send;

    /// Sync status of `validator`.
    fn sync_info(&self, validator: &Container)
        -> impl Future<Output = Result<SyncInfo, Error>> + Send;

    /// Hash of the block at `height`, as seen by `validator`.
    fn block_hash(
        &self,
        validator: &Container,
        height: u64,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    /// Submits a software-upgrade proposal taking effect at `height` and returns its id.
    fn submit_upgrade_proposal(
        &self,
        chain: &str,
        validator: &Container,
        height: u64,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Deposits enough stake on `proposal` to start its voting period.
    fn deposit(
        &self,
        chain: &str,
        validator: &Container,
        proposal: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Votes yes on `proposal` with the key of `validator`.
    fn vote_yes(
        &self,
        chain: &str,
        validator: &Container,
        proposal: u64,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Raw body of the relayer's `/state` endpoint.
    fn relayer_state(&self, relayer: &Container)
        -> impl Future<Output = Result<String, Error>> + Send;

    /// Creates a client, connection, and transfer channel between chains `a` and `b`.
    fn connect_chains(
        &self,
        relayer: &Container,
        a: &str,
        b: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Sends `coin` from `validator`'s account on `chain` to `recipient` on the counterparty.
    fn transfer(
        &self,
        chain: &str,
        validator: &Container,
        recipient: &str,
        coin: &Coin,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Balances of `address`, as seen by `validator`.
    fn balances(
        &self,
        validator: &Container,
        address: &str,
    ) -> impl Future<Output = Result<Balances, Error>> + Send;
}
