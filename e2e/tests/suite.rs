use interchain_e2e::{
    bootstrap::{configure_chain, run_validators, wait_until_height},
    config::{Config, CHAIN_A_ID, CHAIN_B_ID},
    mocks::{ibc_denom, MockNode, MockPlatform, World},
    platform::ContainerPlatform,
    relay::run_relayers,
    suite::{run, Context, Flags, STARTUP_HEIGHT},
    upgrade::upgrade,
    Error,
};
use std::time::Duration;

fn context(world: &World, flags: Flags) -> Context<MockPlatform, MockNode> {
    Context::new(world.platform(), world.node(), Config::default(), flags)
}

/// Starts both chains and the relayer between them, stopping right before the upgrade.
async fn relayed(world: &World) -> Context<MockPlatform, MockNode> {
    let mut ctx = context(world, Flags::default());
    let network = ctx.platform.create_network("e2e-test").await.unwrap();
    ctx.registry.set_network(network);
    for chain in ctx.config.chains.clone() {
        let index = configure_chain(&mut ctx, &chain).await.unwrap();
        run_validators(&mut ctx, index).await.unwrap();
        wait_until_height(&ctx, index, STARTUP_HEIGHT, Duration::from_secs(60))
            .await
            .unwrap();
    }
    run_relayers(&mut ctx).await.unwrap();
    ctx
}

#[tokio::test(start_paused = true)]
async fn test_full_run() {
    let world = World::default();
    run(context(&world, Flags::default())).await.unwrap();

    // Everything acquired was reclaimed
    assert!(world.running().is_empty());
    assert!(world.networks().is_empty());

    assert_eq!(
        world.channels(),
        vec![(CHAIN_A_ID.to_string(), CHAIN_B_ID.to_string())]
    );
    // Each seed received every coin before and after the upgrade
    for address in [format!("{CHAIN_A_ID}-addr-0"), format!("{CHAIN_B_ID}-addr-0")] {
        let balances = world.balances(&address);
        assert_eq!(balances[&ibc_denom("uledger")], 4_000_000);
        assert_eq!(balances[&ibc_denom("stake")], 4_000_000);
    }

    // Every validator of the first chain was reconfigured from the same trusted block
    let syncs = world.state_syncs();
    assert_eq!(syncs.len(), 4);
    let trust: Vec<&String> = syncs.iter().map(|cmd| &cmd[1]).collect();
    assert!(trust.iter().all(|t| *t == trust[0]));
    assert!(trust[0].starts_with("--trust-height="));

    // The held-back validator was only started at startup and after the upgrade
    let starts = world
        .log()
        .iter()
        .filter(|e| *e == &format!("start {CHAIN_A_ID}-val-3"))
        .count();
    assert_eq!(starts, 2);
    let restarts = world
        .log()
        .iter()
        .filter(|e| *e == &format!("start {CHAIN_A_ID}-val-0"))
        .count();
    assert_eq!(restarts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_chain() {
    let world = World::default();
    let flags = Flags {
        skip_ibc: true,
        skip_upgrade: true,
        ..Default::default()
    };
    run(context(&world, flags)).await.unwrap();

    assert!(world.channels().is_empty());
    assert_eq!(world.state_syncs().len(), 4);
    assert!(world.log().iter().all(|e| !e.contains(CHAIN_B_ID)));
    assert!(world.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_flags() {
    let world = World::default();
    let flags = Flags {
        skip_ibc: true,
        ..Default::default()
    };
    let err = run(context(&world, flags)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidFlags(_)));
    // Nothing was acquired
    assert!(world.log().is_empty());
    assert!(world.networks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overshoot_aborts_upgrade() {
    let world = World::default();
    world.ignore_upgrade(CHAIN_B_ID);
    let mut ctx = relayed(&world).await;

    let err = upgrade(&mut ctx).await.unwrap_err();
    assert!(err.is_protocol_violation());
    let target = ctx.network(1).unwrap().proposal_height().unwrap();
    match err {
        Error::ProtocolViolation {
            expected, observed, ..
        } => {
            assert_eq!(expected, target);
            assert!(observed > target);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(world.height(CHAIN_B_ID).unwrap() > target);

    // No validator was stopped and the images were not switched
    assert!(world.log().iter().all(|e| !e.starts_with("remove")));
    assert_eq!(ctx.registry.validators(CHAIN_A_ID).len(), 4);
    assert_eq!(ctx.registry.validators(CHAIN_B_ID).len(), 3);
    assert_eq!(ctx.images.validator.tag, "v8.0.0");

    ctx.teardown().await.unwrap();
    assert!(world.running().is_empty());
    assert!(world.networks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_validator_aborts_halt() {
    let world = World::default();
    let images = Config::default().images;
    world.crash_on(&format!("{CHAIN_A_ID}-val-1"), &images.previous.validator);
    let mut ctx = relayed(&world).await;

    let start = tokio::time::Instant::now();
    let err = upgrade(&mut ctx).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse { .. }), "{err:?}");
    // The first failed read ends the wait, long before the halt timeout
    assert!(start.elapsed() < ctx.config.timeouts.halt() / 2);
    assert!(world.log().iter().all(|e| !e.starts_with("remove")));

    ctx.teardown().await.unwrap();
    assert!(world.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_every_validator_must_resume() {
    let world = World::default();
    let images = Config::default().images;
    world.crash_on(&format!("{CHAIN_A_ID}-val-1"), &images.current.validator);
    let mut ctx = relayed(&world).await;
    ctx.config.timeouts.resume_secs = 60;

    let err = upgrade(&mut ctx).await.unwrap_err();
    let target = ctx.network(0).unwrap().proposal_height().unwrap();
    match err {
        Error::Timeout { condition, .. } => {
            assert_eq!(condition, format!("{CHAIN_A_ID}-val-1 to pass height {target}"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The seed resumed under the upgrade image, so only the peer is at fault
    assert_eq!(ctx.images.validator, images.current.validator);
    assert!(world.height(CHAIN_A_ID).unwrap() > target);

    ctx.teardown().await.unwrap();
    assert!(world.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overshoot_tears_down() {
    let world = World::default();
    world.ignore_upgrade(CHAIN_A_ID);
    let err = run(context(&world, Flags::default())).await.unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(world.running().is_empty());
    assert!(world.networks().is_empty());
    assert!(world.state_syncs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partial_relayer() {
    let world = World::default();
    world.partial_relayer();
    let mut ctx = context(&world, Flags::default());
    ctx.config.timeouts.relayer_secs = 60;

    let err = run(ctx).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(world.channels().is_empty());
    assert!(world.running().is_empty());
    assert!(world.networks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stragglers_are_aggregated() {
    let world = World::default();
    world.stall(&format!("{CHAIN_A_ID}-val-1"));
    world.stall(&format!("{CHAIN_A_ID}-val-2"));
    let flags = Flags {
        skip_ibc: true,
        skip_upgrade: true,
        ..Default::default()
    };
    let mut ctx = context(&world, flags);
    ctx.config.timeouts.state_sync_secs = 60;

    let err = run(ctx).await.unwrap_err();
    match err {
        Error::Stragglers(stragglers) => {
            let names: Vec<&str> = stragglers.iter().map(|s| s.validator.as_str()).collect();
            assert_eq!(names, vec!["val-1", "val-2"]);
            assert!(stragglers.iter().all(|s| s.chain == CHAIN_A_ID));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(world.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_skip_cleanup_keeps_containers() {
    let world = World::default();
    let flags = Flags {
        skip_ibc: true,
        skip_upgrade: true,
        skip_state_sync: true,
        skip_cleanup: true,
    };
    run(context(&world, flags)).await.unwrap();

    let running = world.running();
    assert_eq!(running.len(), 4);
    assert!(running.contains(&format!("{CHAIN_A_ID}-val-0")));
    assert_eq!(world.networks().len(), 1);
    assert!(world.log().iter().all(|e| !e.starts_with("remove")));
}
