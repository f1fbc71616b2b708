//! Token transfers over the relayer.

use crate::{
    node::{Balances, ChainNode, Coin},
    platform::ContainerPlatform,
    suite::Context,
    Error,
};
use tracing::info;

/// Prefix of denominations that arrived over a transfer channel.
const IBC_DENOM_PREFIX: &str = "ibc/";

/// Returns the voucher denomination that was credited `amount` between two balance snapshots.
///
/// Exactly one voucher denomination must have grown, and by exactly `amount`.
pub fn received(before: &Balances, after: &Balances, amount: u128) -> Option<String> {
    let mut grown = after.iter().filter_map(|(denom, balance)| {
        if !denom.starts_with(IBC_DENOM_PREFIX) {
            return None;
        }
        let previous = before.get(denom).copied().unwrap_or(0);
        (*balance > previous).then(|| (denom.clone(), *balance - previous))
    });
    match (grown.next(), grown.next()) {
        (Some((denom, delta)), None) if delta == amount => Some(denom),
        _ => None,
    }
}

/// Sends `coin` from the seed of network `from` to the seed of network `to` and waits until
/// it is credited.
async fn send<P: ContainerPlatform, N: ChainNode>(
    ctx: &Context<P, N>,
    from: usize,
    to: usize,
    coin: &Coin,
) -> Result<String, Error> {
    let (source, destination) = (ctx.network(from)?, ctx.network(to)?);
    let sender = ctx
        .registry
        .require_validator(source.id(), source.chain.seed()?.index)?;
    let recipient = destination.chain.seed()?;
    let observer = ctx
        .registry
        .require_validator(destination.id(), recipient.index)?;
    let address = recipient.public_address.as_str();

    let before = ctx.node.balances(observer, address).await?;
    ctx.node.transfer(source.id(), sender, address, coin).await?;
    info!(
        from = source.id(),
        to = destination.id(),
        coin = %coin,
        recipient = address,
        "sent transfer"
    );
    ctx.poller(ctx.config.timeouts.transfer())
        .wait_for(
            &format!("{coin} from {} to reach {address}", source.id()),
            || ctx.node.balances(observer, address),
            |after| Ok(received(&before, &after, coin.amount)),
        )
        .await
}

/// Sends every configured coin in both directions between the first two networks.
///
/// Skipped when fewer than two networks are configured.
pub async fn check_transfers<P: ContainerPlatform, N: ChainNode>(
    ctx: &Context<P, N>,
) -> Result<(), Error> {
    if ctx.networks.len() < 2 {
        info!(networks = ctx.networks.len(), "skipping transfers");
        return Ok(());
    }
    for coin in &ctx.config.transfers {
        for (from, to) in [(0, 1), (1, 0)] {
            let denom = send(ctx, from, to, coin).await?;
            info!(coin = %coin, denom = denom.as_str(), "transfer credited");
        }
    }
    Ok(())
}
