//! Drive end-to-end relay, upgrade, and state sync scenarios across two containerized chains.
//!
//! # Overview
//!
//! A run configures each chain with a one-shot init container, starts its validators, connects
//! every pair of chains with a relayer, executes a governance-gated software upgrade, and finally
//! bootstraps validators from a trusted height with state sync. Each phase is gated on conditions
//! observed by polling the chains (height, sync status, relayer health) with a bounded timeout.
//!
//! Everything the suite acquires is recorded in a [registry::Registry] owned by the
//! [suite::Context] and reclaimed exactly once at teardown, even when setup failed halfway.
//!
//! # Collaborators
//!
//! The suite never talks to Docker or a chain directly. It drives a [platform::ContainerPlatform]
//! (see [platform::docker::Docker]) and a [node::ChainNode] (see [node::rpc::RpcNode]). The
//! [mocks] module provides a simulated implementation of both that runs on the tokio clock.

use std::fmt;
use thiserror::Error;

pub mod bootstrap;
pub mod chain;
pub mod config;
pub mod mocks;
pub mod node;
pub mod platform;
pub mod poll;
pub mod registry;
pub mod relay;
pub mod state_sync;
pub mod suite;
pub mod transfer;
pub mod upgrade;

/// A validator that did not finish state sync in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Straggler {
    pub chain: String,
    pub validator: String,
    pub reason: String,
}

impl fmt::Display for Straggler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.chain, self.validator, self.reason)
    }
}

/// Errors that can abort a run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("container platform error: {0}")]
    Platform(#[from] bollard::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("command `{command}` failed in {container} (exit code {exit_code}): {output}")]
    ExecFailed {
        container: String,
        command: String,
        exit_code: i64,
        output: String,
    },
    #[error("unexpected response from {endpoint}: {reason}")]
    UnexpectedResponse { endpoint: String, reason: String },
    #[error("topology for {chain} unavailable after {attempts} attempts: {reason}")]
    TopologyUnavailable {
        chain: String,
        attempts: usize,
        reason: String,
    },
    #[error("topology for {chain} has {found} validators, expected {expected}")]
    TopologyMismatch {
        chain: String,
        expected: usize,
        found: usize,
    },
    #[error("chain already configured: {0}")]
    DuplicateChain(String),
    #[error("unknown network: {0}")]
    UnknownNetwork(usize),
    #[error("chain {chain} has no validator {index}")]
    UnknownValidator { chain: String, index: usize },
    #[error("container slot already occupied: {chain}/{index}")]
    SlotOccupied { chain: String, index: usize },
    #[error("no running container for {chain}/{index}")]
    MissingContainer { chain: String, index: usize },
    #[error("container {container} does not expose port {port}")]
    MissingPort { container: String, port: u16 },
    #[error("chain {0} has no seed validator")]
    MissingSeed(String),
    #[error("proposal height already set for {chain} ({height})")]
    ProposalHeightAlreadySet { chain: String, height: u64 },
    #[error("proposal height not set for {0}")]
    ProposalHeightMissing(String),
    #[error("invalid flags: {0}")]
    InvalidFlags(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidFlag { name: &'static str, value: String },
    #[error("timeout waiting for {condition} (last observed: {last})")]
    Timeout { condition: String, last: String },
    #[error("protocol violation while waiting for {condition}: expected {expected}, observed {observed}")]
    ProtocolViolation {
        condition: String,
        expected: u64,
        observed: u64,
    },
    #[error("validators failed to state sync: {}", format_stragglers(.0))]
    Stragglers(Vec<Straggler>),
}

fn format_stragglers(stragglers: &[Straggler]) -> String {
    stragglers
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Returns true if the error means observed state exceeded an expected bound.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation { .. })
    }

    /// Returns true if the error is a bounded poll that was never satisfied.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
