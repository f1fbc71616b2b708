//! Chain configuration and validator startup.

use crate::{
    chain::{encode_validator_configs, voting_period_blocks, Network, Role, Topology, Validator},
    config::{ChainConfig, NodeConfig},
    node::{ChainNode, API_PORT, GRPC_PORT, RPC_PORT},
    platform::{
        ContainerPlatform, ContainerSpec, Image, Kind, NetworkHandle, CHAIN_LABEL, INDEX_LABEL,
    },
    poll::Poller,
    registry::{start_validator, with_oneshot},
    suite::Context,
    Error,
};
use std::{path::Path, time::Duration};
use tracing::info;

/// Interval between attempts to read the topology written by the init container.
pub const DECODE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Reads the topology written by the init container, retrying until it parses.
async fn read_topology(path: &Path, chain: &str, attempts: usize) -> Result<Topology, Error> {
    let poller = Poller::attempts(DECODE_RETRY_INTERVAL, attempts);
    let result = poller
        .wait_for(
            &format!("topology of {chain}"),
            || async move {
                let raw = tokio::fs::read(path).await?;
                Ok::<_, Error>(serde_json::from_slice::<Topology>(&raw)?)
            },
            |topology| Ok(Some(topology)),
        )
        .await;
    match result {
        Err(Error::Timeout { last, .. }) => Err(Error::TopologyUnavailable {
            chain: chain.to_string(),
            attempts,
            reason: last,
        }),
        other => other,
    }
}

/// Initializes a chain with a one-shot init container and records it as a new [Network].
///
/// Returns the index of the new network.
pub async fn configure_chain<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
    chain: &ChainConfig,
) -> Result<usize, Error> {
    if ctx.networks.iter().any(|n| n.id() == chain.id) {
        return Err(Error::DuplicateChain(chain.id.clone()));
    }
    info!(chain = chain.id.as_str(), validators = chain.validators.len(), "configuring chain");
    let data_dir = ctx.temp_dir("e2e-testnet-")?;
    let dir = data_dir.display().to_string();
    let voting_period = voting_period_blocks(chain.validators.len());

    let spec = ContainerSpec::new(format!("{}-init", chain.id), ctx.images.init.clone(), Kind::Init)
        .cmd([
            format!("--data-dir={dir}"),
            format!("--chain-id={}", chain.id),
            format!("--config={}", encode_validator_configs(&chain.validators)?),
            format!("--voting-period={voting_period}s"),
        ])
        .user(&ctx.config.node.user)
        .mount(&dir, &dir)
        .label(CHAIN_LABEL, &chain.id)
        .network(ctx.registry.network());

    let path = Topology::path(&data_dir, &chain.id);
    let attempts = ctx.config.timeouts.topology_attempts;
    let topology = with_oneshot(&ctx.platform, &mut ctx.registry, spec, |_| {
        read_topology(&path, &chain.id, attempts)
    })
    .await?;

    let configured = topology.into_chain(&chain.validators)?;
    let index = ctx.networks.len();
    info!(
        chain = configured.id.as_str(),
        index,
        voting_period,
        data_dir = %configured.data_dir.display(),
        "configured chain"
    );
    ctx.networks.push(Network::new(index, configured, voting_period));
    Ok(index)
}

/// Container spec of a validator.
///
/// Every validator publishes its RPC port. The seed also publishes the API and gRPC ports.
pub fn validator_spec(
    node: &NodeConfig,
    image: &Image,
    network: Option<&NetworkHandle>,
    chain: &str,
    validator: &Validator,
) -> ContainerSpec {
    let config_dir = validator.config_dir.display().to_string();
    let mut spec = ContainerSpec::new(
        format!("{chain}-{}", validator.name),
        image.clone(),
        Kind::Validator,
    )
    .cmd(["start"])
    .user(&node.user)
    .mount(&config_dir, &node.home)
    .port(RPC_PORT, None)
    .label(CHAIN_LABEL, chain)
    .label(INDEX_LABEL, &validator.index.to_string())
    .network(network);
    if validator.role == Role::Seed {
        spec = spec.port(API_PORT, None).port(GRPC_PORT, None);
    }
    spec
}

/// Starts validator `validator` of network `network` with the current validator image.
pub async fn run_validator<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
    network: usize,
    validator: usize,
) -> Result<(), Error> {
    let target = ctx.networks.get(network).ok_or(Error::UnknownNetwork(network))?;
    let chain = target.id().to_string();
    let record = target
        .chain
        .validators
        .iter()
        .find(|v| v.index == validator)
        .ok_or_else(|| Error::UnknownValidator {
            chain: chain.clone(),
            index: validator,
        })?;
    let spec = validator_spec(
        &ctx.config.node,
        &ctx.images.validator,
        ctx.registry.network(),
        &chain,
        record,
    );
    start_validator(&ctx.platform, &mut ctx.registry, &chain, validator, spec).await
}

/// Starts every validator of network `network`.
pub async fn run_validators<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
    network: usize,
) -> Result<(), Error> {
    let target = ctx.network(network)?;
    let indices: Vec<usize> = target.chain.validators.iter().map(|v| v.index).collect();
    info!(
        chain = target.id(),
        validators = indices.len(),
        image = ctx.images.validator.reference().as_str(),
        "starting validators"
    );
    for index in indices {
        run_validator(ctx, network, index).await?;
    }
    Ok(())
}

/// Waits until the seed of network `network` reports at least `height`.
///
/// Returns the height observed.
pub async fn wait_until_height<P: ContainerPlatform, N: ChainNode>(
    ctx: &Context<P, N>,
    network: usize,
    height: u64,
    timeout: Duration,
) -> Result<u64, Error> {
    let target = ctx.network(network)?;
    let seed = target.chain.seed()?;
    let container = ctx.registry.require_validator(target.id(), seed.index)?;
    let reached = ctx
        .poller(timeout)
        .wait_for(
            &format!("{} to reach height {height}", target.id()),
            || ctx.node.latest_height(container),
            |current| Ok((current >= height).then_some(current)),
        )
        .await?;
    info!(chain = target.id(), height = reached, "reached height");
    Ok(reached)
}
