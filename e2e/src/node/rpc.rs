//! [ChainNode] backed by Tendermint RPC and the node daemon's CLI.
//!
//! Reads go to the RPC server published by each validator container. Transactions are built and
//! broadcast by the daemon inside the validator container (through [ContainerPlatform::exec]) so
//! that the keyring written by the init image is used as-is.

use super::{Balances, ChainNode, Coin, SyncInfo, RELAYER_STATUS_PORT, RPC_PORT};
use crate::{
    config::NodeConfig,
    platform::{bounded, Container, ContainerPlatform, ExecOutput},
    Error,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Timeout of a single RPC request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct StatusResult {
    sync_info: RawSyncInfo,
}

#[derive(Deserialize)]
struct RawSyncInfo {
    latest_block_height: String,
    catching_up: bool,
}

#[derive(Deserialize)]
struct BlockResult {
    block_id: BlockId,
}

#[derive(Deserialize)]
struct BlockId {
    hash: String,
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    txhash: String,
}

#[derive(Deserialize)]
struct Proposals {
    #[serde(default)]
    proposals: Vec<Proposal>,
}

#[derive(Deserialize)]
struct Proposal {
    #[serde(alias = "id")]
    proposal_id: String,
}

#[derive(Deserialize)]
struct BalancesResponse {
    #[serde(default)]
    balances: Vec<RawCoin>,
}

#[derive(Deserialize)]
struct RawCoin {
    denom: String,
    amount: String,
}

fn unexpected(endpoint: &str, reason: impl ToString) -> Error {
    Error::UnexpectedResponse {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses the body of `GET /status`.
pub fn parse_sync_info(body: &str) -> Result<SyncInfo, Error> {
    let response: RpcResponse<StatusResult> = serde_json::from_str(body)?;
    let raw = response.result.sync_info;
    let latest_block_height = raw
        .latest_block_height
        .parse()
        .map_err(|err| unexpected("/status", format!("invalid height: {err}")))?;
    Ok(SyncInfo {
        latest_block_height,
        catching_up: raw.catching_up,
    })
}

/// Parses the body of `GET /block?height=H` into the block hash.
pub fn parse_block_hash(body: &str) -> Result<String, Error> {
    let response: RpcResponse<BlockResult> = serde_json::from_str(body)?;
    let hash = response.result.block_id.hash;
    if hash.is_empty() {
        return Err(unexpected("/block", "empty block hash"));
    }
    Ok(hash)
}

/// Returns the JSON document printed by a CLI command.
///
/// The daemon may print a gas estimate or warnings before the document, so everything before
/// the first `{` is skipped.
fn json_document(output: &str) -> &str {
    output.find('{').map_or(output, |start| &output[start..])
}

/// Parses the output of a broadcast transaction, rejecting transactions with a non-zero code.
pub fn parse_tx(output: &str) -> Result<String, Error> {
    let tx: TxResponse = serde_json::from_str(json_document(output))?;
    if tx.code != 0 {
        return Err(unexpected(
            "tx",
            format!("transaction {} failed with code {}: {}", tx.txhash, tx.code, tx.raw_log),
        ));
    }
    Ok(tx.txhash)
}

/// Parses the output of `query gov proposals` into the id of the most recent proposal.
pub fn parse_latest_proposal(output: &str) -> Result<u64, Error> {
    let proposals: Proposals = serde_json::from_str(json_document(output))?;
    let mut latest = None;
    for proposal in proposals.proposals {
        let id: u64 = proposal
            .proposal_id
            .parse()
            .map_err(|err| unexpected("gov proposals", format!("invalid proposal id: {err}")))?;
        latest = latest.max(Some(id));
    }
    latest.ok_or_else(|| unexpected("gov proposals", "no proposals found"))
}

/// Parses the output of `query bank balances`.
pub fn parse_balances(output: &str) -> Result<Balances, Error> {
    let response: BalancesResponse = serde_json::from_str(json_document(output))?;
    let mut balances = Balances::new();
    for coin in response.balances {
        let amount = coin
            .amount
            .parse()
            .map_err(|err| unexpected("bank balances", format!("invalid amount: {err}")))?;
        balances.insert(coin.denom, amount);
    }
    Ok(balances)
}

/// Chain node reached over HTTP (reads) and container exec (transactions).
#[derive(Clone)]
pub struct RpcNode<P: ContainerPlatform> {
    http: reqwest::Client,
    platform: P,
    config: NodeConfig,
    exec_timeout: Duration,
}

impl<P: ContainerPlatform> RpcNode<P> {
    /// Creates a node client. Commands run inside containers fail after `exec_timeout`.
    pub fn new(platform: P, config: NodeConfig, exec_timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            platform,
            config,
            exec_timeout,
        })
    }

    /// Runs `cmd` inside `container` and fails if it does not exit successfully in time.
    async fn exec(&self, container: &Container, cmd: Vec<String>) -> Result<ExecOutput, Error> {
        let condition = format!("`{}` in {}", cmd.join(" "), container.name);
        bounded(
            &condition,
            self.exec_timeout,
            self.platform.exec(container, cmd.clone()),
        )
        .await?
        .check(container, &cmd)
    }

    async fn get(&self, container: &Container, port: u16, path: &str) -> Result<String, Error> {
        let url = format!("http://{}{}", container.host_addr(port)?, path);
        let body = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    /// Runs the daemon inside `container` and returns its stdout.
    async fn cli(&self, container: &Container, args: Vec<String>) -> Result<String, Error> {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(self.config.daemon.clone());
        cmd.extend(args);
        Ok(self.exec(container, cmd).await?.stdout)
    }

    /// Flags shared by every transaction signed with the validator key.
    fn tx_flags(&self, chain: &str) -> Vec<String> {
        vec![
            format!("--chain-id={chain}"),
            format!("--from={}", self.config.key),
            format!("--keyring-backend={}", self.config.keyring_backend),
            format!("--home={}", self.config.home),
            format!("--fees={}", self.config.fees),
            "-b".to_string(),
            "block".to_string(),
            "--yes".to_string(),
            "--output=json".to_string(),
        ]
    }

    async fn broadcast(
        &self,
        chain: &str,
        container: &Container,
        mut args: Vec<String>,
    ) -> Result<(), Error> {
        args.extend(self.tx_flags(chain));
        let output = self.cli(container, args).await?;
        let txhash = parse_tx(&output)?;
        debug!(
            chain,
            container = container.name.as_str(),
            txhash = txhash.as_str(),
            "transaction included"
        );
        Ok(())
    }
}

impl<P: ContainerPlatform> ChainNode for RpcNode<P> {
    async fn latest_height(&self, validator: &Container) -> Result<u64, Error> {
        Ok(self.sync_info(validator).await?.latest_block_height)
    }

    async fn sync_info(&self, validator: &Container) -> Result<SyncInfo, Error> {
        let body = self.get(validator, RPC_PORT, "/status").await?;
        parse_sync_info(&body)
    }

    async fn block_hash(&self, validator: &Container, height: u64) -> Result<String, Error> {
        let body = self
            .get(validator, RPC_PORT, &format!("/block?height={height}"))
            .await?;
        parse_block_hash(&body)
    }

    async fn submit_upgrade_proposal(
        &self,
        chain: &str,
        validator: &Container,
        height: u64,
    ) -> Result<u64, Error> {
        let name = &self.config.upgrade_name;
        let args = vec![
            "tx".to_string(),
            "gov".to_string(),
            "submit-proposal".to_string(),
            "software-upgrade".to_string(),
            name.clone(),
            format!("--title=upgrade {name}"),
            format!("--description=upgrade to {name}"),
            format!("--upgrade-height={height}"),
            "--upgrade-info=".to_string(),
        ];
        self.broadcast(chain, validator, args).await?;

        let output = self
            .cli(
                validator,
                vec![
                    "query".to_string(),
                    "gov".to_string(),
                    "proposals".to_string(),
                    format!("--home={}", self.config.home),
                    "--output=json".to_string(),
                ],
            )
            .await?;
        let proposal = parse_latest_proposal(&output)?;
        info!(chain, proposal, height, "submitted upgrade proposal");
        Ok(proposal)
    }

    async fn deposit(&self, chain: &str, validator: &Container, proposal: u64) -> Result<(), Error> {
        let args = vec![
            "tx".to_string(),
            "gov".to_string(),
            "deposit".to_string(),
            proposal.to_string(),
            self.config.deposit.clone(),
        ];
        self.broadcast(chain, validator, args).await
    }

    async fn vote_yes(&self, chain: &str, validator: &Container, proposal: u64) -> Result<(), Error> {
        let args = vec![
            "tx".to_string(),
            "gov".to_string(),
            "vote".to_string(),
            proposal.to_string(),
            "yes".to_string(),
        ];
        self.broadcast(chain, validator, args).await
    }

    async fn relayer_state(&self, relayer: &Container) -> Result<String, Error> {
        self.get(relayer, RELAYER_STATUS_PORT, "/state").await
    }

    async fn connect_chains(&self, relayer: &Container, a: &str, b: &str) -> Result<(), Error> {
        let cmd = vec![
            self.config.relayer.clone(),
            "create".to_string(),
            "channel".to_string(),
            a.to_string(),
            b.to_string(),
            format!("--port-a={}", self.config.port),
            format!("--port-b={}", self.config.port),
        ];
        self.exec(relayer, cmd).await?;
        info!(a, b, "created transfer channel");
        Ok(())
    }

    async fn transfer(
        &self,
        chain: &str,
        validator: &Container,
        recipient: &str,
        coin: &Coin,
    ) -> Result<(), Error> {
        let args = vec![
            "tx".to_string(),
            "ibc-transfer".to_string(),
            "transfer".to_string(),
            self.config.port.clone(),
            self.config.channel.clone(),
            recipient.to_string(),
            coin.to_string(),
        ];
        self.broadcast(chain, validator, args).await
    }

    async fn balances(&self, validator: &Container, address: &str) -> Result<Balances, Error> {
        let output = self
            .cli(
                validator,
                vec![
                    "query".to_string(),
                    "bank".to_string(),
                    "balances".to_string(),
                    address.to_string(),
                    format!("--home={}", self.config.home),
                    "--output=json".to_string(),
                ],
            )
            .await?;
        parse_balances(&output)
    }
}
