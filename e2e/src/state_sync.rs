//! State sync of validators from a trusted height.
//!
//! Every validator of a network is stopped, reconfigured by a one-shot container to state sync
//! from a trusted height and hash, and restarted. One validator is held back (left stopped) so
//! the run also covers a chain that keeps producing blocks with a validator missing.

use crate::{
    bootstrap::run_validator,
    node::ChainNode,
    platform::{bounded, ContainerPlatform, ContainerSpec, Kind, CHAIN_LABEL},
    registry::{remove_validator, with_oneshot},
    suite::Context,
    Error, Straggler,
};
use tracing::{info, warn};

/// Returns true once a validator synced past the newest snapshot any peer could have served.
///
/// Snapshots are only taken every `max_snapshot_interval` blocks, so a validator that restored
/// one has to move at least that far past the trust height to prove it is making progress.
pub fn synced(
    latest_height: u64,
    catching_up: bool,
    trust_height: u64,
    max_snapshot_interval: u64,
) -> bool {
    !catching_up && latest_height > trust_height + max_snapshot_interval + 1
}

/// Reconfigures every validator of network `network` to state sync and waits for the restarted
/// validators to catch up.
///
/// All restarted validators are checked, and every one that did not catch up in time is
/// reported in [Error::Stragglers].
pub async fn configure_state_sync<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
    network: usize,
) -> Result<(), Error> {
    let target = ctx.network(network)?;
    let chain = target.id().to_string();
    let max_snapshot_interval = target.chain.max_snapshot_interval();
    let validators: Vec<(usize, String, String)> = target
        .chain
        .validators
        .iter()
        .map(|v| (v.index, v.name.clone(), v.config_dir.display().to_string()))
        .collect();
    let held_back = match ctx.config.state_sync.held_back {
        Some(index) if validators.iter().any(|(i, _, _)| *i == index) => Some(index),
        Some(index) => return Err(Error::UnknownValidator { chain, index }),
        None => validators.last().map(|(index, _, _)| *index),
    };

    let seed = target.chain.seed()?;
    let container = ctx.registry.require_validator(&chain, seed.index)?;
    let trust_height = ctx.node.latest_height(container).await?;
    let trust_hash = ctx.node.block_hash(container, trust_height).await?;
    info!(
        chain = chain.as_str(),
        trust_height,
        trust_hash = trust_hash.as_str(),
        held_back,
        "configuring state sync"
    );

    for (index, name, config_dir) in &validators {
        remove_validator(&ctx.platform, &mut ctx.registry, &chain, *index).await?;

        let spec = ContainerSpec::new(
            format!("state-sync-{chain}-{name}"),
            ctx.images.init.clone(),
            Kind::StateSync,
        )
        .cmd([
            format!("--config-dir={config_dir}"),
            format!("--trust-height={trust_height}"),
            format!("--trust-hash={trust_hash}"),
        ])
        .user(&ctx.config.node.user)
        .mount(config_dir, config_dir)
        .label(CHAIN_LABEL, &chain)
        .network(ctx.registry.network());
        let platform = &ctx.platform;
        let limit = ctx.config.timeouts.exec();
        with_oneshot(platform, &mut ctx.registry, spec, |oneshot| async move {
            let condition = format!("{} to exit", oneshot.name);
            let code = bounded(&condition, limit, platform.wait(&oneshot)).await?;
            if code != 0 {
                return Err(Error::ExecFailed {
                    container: oneshot.name,
                    command: "state sync configuration".to_string(),
                    exit_code: code,
                    output: String::new(),
                });
            }
            Ok(())
        })
        .await?;

        if Some(*index) == held_back {
            info!(chain = chain.as_str(), validator = name.as_str(), "holding back validator");
            continue;
        }
        run_validator(ctx, network, *index).await?;
    }

    let poller = ctx.poller(ctx.config.timeouts.state_sync());
    let mut stragglers = Vec::new();
    for (index, name, _) in &validators {
        if Some(*index) == held_back {
            continue;
        }
        let container = match ctx.registry.require_validator(&chain, *index) {
            Ok(container) => container,
            Err(err) => {
                stragglers.push(Straggler {
                    chain: chain.clone(),
                    validator: name.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
        };
        let result = poller
            .wait_for(
                &format!("{} to state sync", container.name),
                || ctx.node.sync_info(container),
                |info| {
                    Ok(synced(
                        info.latest_block_height,
                        info.catching_up,
                        trust_height,
                        max_snapshot_interval,
                    )
                    .then_some(info.latest_block_height))
                },
            )
            .await;
        match result {
            Ok(height) => {
                info!(chain = chain.as_str(), validator = name.as_str(), height, "validator synced");
            }
            Err(err) => {
                warn!(chain = chain.as_str(), validator = name.as_str(), error = %err, "validator did not sync");
                stragglers.push(Straggler {
                    chain: chain.clone(),
                    validator: name.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    if !stragglers.is_empty() {
        return Err(Error::Stragglers(stragglers));
    }
    info!(chain = chain.as_str(), "state sync complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bootstrap::{configure_chain, run_validators, wait_until_height},
        chain::ValidatorConfig,
        config::{ChainConfig, Config},
        mocks::World,
        suite::Flags,
    };
    use std::time::Duration;

    #[test]
    fn test_synced_boundary() {
        // Trust height 100 with snapshots every 30 blocks requires height 132
        assert!(!synced(131, false, 100, 30));
        assert!(synced(132, false, 100, 30));
        assert!(!synced(500, true, 100, 30));
        // Snapshots disabled everywhere still requires progress past the trust height
        assert!(!synced(101, false, 100, 0));
        assert!(synced(102, false, 100, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_configuration_times_out() {
        let world = World::default();
        world.hang("state-sync-chain-a-val-0");
        let mut ctx = Context::new(
            world.platform(),
            world.node(),
            Config::default(),
            Flags::default(),
        );
        ctx.config.timeouts.exec_secs = 30;
        let chain = ChainConfig {
            id: "chain-a".to_string(),
            validators: vec![ValidatorConfig::new("default", 0, 0, 10, 2); 3],
        };
        configure_chain(&mut ctx, &chain).await.unwrap();
        run_validators(&mut ctx, 0).await.unwrap();
        wait_until_height(&ctx, 0, 3, Duration::from_secs(60))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let err = configure_state_sync(&mut ctx, 0).await.unwrap_err();
        match err {
            Error::Timeout { condition, .. } => {
                assert_eq!(condition, "state-sync-chain-a-val-0 to exit");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_secs(30));
        // The one-shot container is reclaimed even though it never exited
        assert!(world.purged().contains(&"state-sync-chain-a-val-0".to_string()));
        assert!(ctx.registry.oneshots().is_empty());

        ctx.teardown().await.unwrap();
        assert!(world.running().is_empty());
    }
}
