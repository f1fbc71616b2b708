//! Relayer startup between pairs of chains.
//!
//! The relayer image is configured at startup by a bundled script that writes its config for
//! the two chains, restores both seed keys, and starts relaying. The relayer is considered
//! healthy once its REST server reports both chains.

use crate::{
    node::{ChainNode, RELAYER_STATUS_PORT},
    platform::{ContainerPlatform, ContainerSpec, Kind},
    suite::Context,
    Error,
};
use serde::Deserialize;
use tracing::info;

/// Script that configures and starts the relayer.
pub const BOOTSTRAP_SCRIPT: &str = include_str!("../scripts/relayer_bootstrap.sh");

/// Name of the bootstrap script inside the mounted directory.
const SCRIPT_NAME: &str = "relayer_bootstrap.sh";

/// Directory the bootstrap script is mounted at inside the relayer container.
const MOUNT_DIR: &str = "/root/hermes";

#[derive(Deserialize)]
struct RelayerState {
    status: String,
    result: RelayerResult,
}

#[derive(Deserialize)]
struct RelayerResult {
    chains: Vec<serde_json::Value>,
}

/// Returns true if `body` (the relayer's `/state` response) reports `expected` chains.
///
/// Malformed and partial responses are not healthy.
pub fn relayer_healthy(body: &str, expected: usize) -> bool {
    match serde_json::from_str::<RelayerState>(body) {
        Ok(state) => state.status == "success" && state.result.chains.len() == expected,
        Err(_) => false,
    }
}

/// Starts a relayer between networks `a` and `b`, waits until it is healthy, and opens a
/// transfer channel between them.
pub async fn run_relayer<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
    a: usize,
    b: usize,
) -> Result<(), Error> {
    let dir = ctx.temp_dir("e2e-relayer-")?.join("relayer");
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(SCRIPT_NAME), BOOTSTRAP_SCRIPT).await?;

    let (chain_a, chain_b) = (ctx.network(a)?, ctx.network(b)?);
    let (seed_a, seed_b) = (chain_a.chain.seed()?, chain_b.chain.seed()?);
    let host_a = ctx.registry.require_validator(chain_a.id(), seed_a.index)?;
    let host_b = ctx.registry.require_validator(chain_b.id(), seed_b.index)?;
    let spec = ContainerSpec::new(
        format!("{}-{}-relayer", chain_a.id(), chain_b.id()),
        ctx.images.relayer.clone(),
        Kind::Relayer,
    )
    .cmd(["start"])
    .entrypoint([
        "sh".to_string(),
        "-c".to_string(),
        format!("chmod +x {MOUNT_DIR}/{SCRIPT_NAME} && {MOUNT_DIR}/{SCRIPT_NAME}"),
    ])
    .user(&ctx.config.node.user)
    .mount(&dir.display().to_string(), MOUNT_DIR)
    .port(RELAYER_STATUS_PORT, None)
    .env("CHAIN_A_ID", chain_a.id())
    .env("CHAIN_B_ID", chain_b.id())
    .env("CHAIN_A_VAL_MNEMONIC", &seed_a.mnemonic)
    .env("CHAIN_B_VAL_MNEMONIC", &seed_b.mnemonic)
    .env("CHAIN_A_VAL_HOST", &host_a.name)
    .env("CHAIN_B_VAL_HOST", &host_b.name)
    .network(ctx.registry.network());
    let (id_a, id_b) = (chain_a.id().to_string(), chain_b.id().to_string());

    let relayer = ctx.platform.start(spec).await?;
    ctx.registry.add_relayer(relayer.clone());
    info!(
        name = relayer.name.as_str(),
        a = id_a.as_str(),
        b = id_b.as_str(),
        "started relayer"
    );

    ctx.poller(ctx.config.timeouts.relayer())
        .wait_for(
            &format!("relayer {} to be healthy", relayer.name),
            || ctx.node.relayer_state(&relayer),
            |body| Ok(relayer_healthy(&body, 2).then_some(())),
        )
        .await?;
    info!(name = relayer.name.as_str(), "relayer healthy");

    // Both chains need time to serve the relayer's queries
    tokio::time::sleep(ctx.config.timeouts.relayer_settle()).await;
    ctx.node.connect_chains(&relayer, &id_a, &id_b).await
}

/// Starts a relayer between every pair of networks.
pub async fn run_relayers<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
) -> Result<(), Error> {
    let count = ctx.networks.len();
    for a in 0..count {
        for b in a + 1..count {
            run_relayer(ctx, a, b).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bootstrap::{configure_chain, run_validators},
        config::Config,
        mocks::{MockNode, MockPlatform, World},
        suite::Flags,
    };

    #[test]
    fn test_relayer_healthy() {
        let both = r#"{"status":"success","result":{"chains":["chain-a","chain-b"]}}"#;
        assert!(relayer_healthy(both, 2));

        let partial = r#"{"status":"success","result":{"chains":["chain-a"]}}"#;
        assert!(!relayer_healthy(partial, 2));

        let failed = r#"{"status":"error","result":{"chains":["chain-a","chain-b"]}}"#;
        assert!(!relayer_healthy(failed, 2));

        assert!(!relayer_healthy(r#"{"status":"success"}"#, 2));
        assert!(!relayer_healthy("502 Bad Gateway", 2));
        assert!(!relayer_healthy("", 2));
    }

    #[test]
    fn test_bootstrap_script_reads_environment() {
        for var in [
            "CHAIN_A_ID",
            "CHAIN_B_ID",
            "CHAIN_A_VAL_MNEMONIC",
            "CHAIN_B_VAL_MNEMONIC",
            "CHAIN_A_VAL_HOST",
            "CHAIN_B_VAL_HOST",
        ] {
            assert!(BOOTSTRAP_SCRIPT.contains(&format!("${var}")), "{var} unused");
        }
    }

    async fn two_chains(world: &World) -> Context<MockPlatform, MockNode> {
        let mut ctx = Context::new(
            world.platform(),
            world.node(),
            Config::default(),
            Flags::default(),
        );
        for chain in ctx.config.chains.clone() {
            let index = configure_chain(&mut ctx, &chain).await.unwrap();
            run_validators(&mut ctx, index).await.unwrap();
        }
        ctx
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayer_connects_chains() {
        let world = World::default();
        let mut ctx = two_chains(&world).await;
        run_relayers(&mut ctx).await.unwrap();

        assert_eq!(ctx.registry.relayers().len(), 1);
        assert_eq!(ctx.registry.relayers()[0].name, "ledger-test-a-ledger-test-b-relayer");
        assert_eq!(
            world.channels(),
            vec![("ledger-test-a".to_string(), "ledger-test-b".to_string())]
        );

        // The bootstrap script is mounted from a directory removed at teardown
        let mounts = world.mounts("ledger-test-a-ledger-test-b-relayer");
        assert_eq!(mounts.len(), 1);
        let (host, target) = mounts[0].split_once(':').unwrap();
        assert_eq!(target, MOUNT_DIR);
        let script = std::path::Path::new(host).join(SCRIPT_NAME);
        assert_eq!(std::fs::read_to_string(&script).unwrap(), BOOTSTRAP_SCRIPT);

        ctx.teardown().await.unwrap();
        assert!(world.running().is_empty());
        assert!(!script.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_relayer_times_out() {
        let world = World::default();
        world.partial_relayer();
        let mut ctx = two_chains(&world).await;
        ctx.config.timeouts.relayer_secs = 30;

        let err = run_relayers(&mut ctx).await.unwrap_err();
        match err {
            Error::Timeout { last, .. } => assert!(last.contains("ledger-test-a")),
            other => panic!("unexpected error: {other:?}"),
        }
        // No channel is opened by an unhealthy relayer, but it is still reclaimed
        assert!(world.channels().is_empty());
        assert_eq!(ctx.registry.relayers().len(), 1);
        ctx.teardown().await.unwrap();
        assert!(world.running().is_empty());
    }
}
