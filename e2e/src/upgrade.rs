//! Governance-gated software upgrade.
//!
//! Every chain votes on a software-upgrade proposal that takes effect at a height computed from
//! its live height. Once every validator of every chain is observed halted at that height, all
//! validators are stopped, the images are switched to the upgrade build, and the validators are
//! restarted. The upgrade succeeds when every validator of every chain reports a height past the
//! upgrade height.

use crate::{
    bootstrap::run_validators,
    node::ChainNode,
    platform::ContainerPlatform,
    poll::Debounce,
    registry::remove_validator,
    suite::Context,
    Error,
};
use tracing::{debug, info};

/// Consecutive observations at the upgrade height required to consider a validator halted.
pub const HALT_CONFIRMATIONS: usize = 3;

/// Decides, from successive height observations, whether a validator halted at `target`.
///
/// A height below the target resets the streak. A height above the target means the chain did
/// not halt and is reported immediately, even after the validator was considered halted.
#[derive(Clone, Debug)]
pub struct HaltDetector {
    condition: String,
    target: u64,
    debounce: Debounce,
    halted: bool,
}

impl HaltDetector {
    pub fn new(condition: impl Into<String>, target: u64) -> Self {
        Self {
            condition: condition.into(),
            target,
            debounce: Debounce::new(HALT_CONFIRMATIONS),
            halted: false,
        }
    }

    /// Records an observed height and returns true once the validator is halted.
    pub fn observe(&mut self, height: u64) -> Result<bool, Error> {
        if height > self.target {
            return Err(Error::ProtocolViolation {
                condition: self.condition.clone(),
                expected: self.target,
                observed: height,
            });
        }
        if self.halted {
            return Ok(true);
        }
        self.halted = self.debounce.observe(height == self.target);
        Ok(self.halted)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}

/// Submits, funds, and votes for the upgrade proposal of network `network`.
async fn propose<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
    network: usize,
) -> Result<u64, Error> {
    let target = ctx
        .networks
        .get_mut(network)
        .ok_or(Error::UnknownNetwork(network))?;
    let chain = target.id().to_string();
    let seed = target.chain.seed()?.index;
    let seed = ctx.registry.require_validator(&chain, seed)?;

    let current = ctx.node.latest_height(seed).await?;
    let height = target.set_proposal_height(current)?;
    info!(chain = chain.as_str(), current, height, "proposing upgrade");

    let proposal = ctx
        .node
        .submit_upgrade_proposal(&chain, seed, height)
        .await?;
    ctx.node.deposit(&chain, seed, proposal).await?;
    for validator in &target.chain.validators {
        let container = ctx.registry.require_validator(&chain, validator.index)?;
        ctx.node.vote_yes(&chain, container, proposal).await?;
        debug!(
            chain = chain.as_str(),
            validator = validator.name.as_str(),
            proposal,
            "voted"
        );
    }
    info!(chain = chain.as_str(), proposal, height, "upgrade proposal voted");
    Ok(height)
}

/// Waits until every validator of network `network` halted at its proposal height.
///
/// Validators are running when this is called, so a failed read aborts the wait.
async fn wait_for_halt<P: ContainerPlatform, N: ChainNode>(
    ctx: &Context<P, N>,
    network: usize,
) -> Result<(), Error> {
    let target = ctx.network(network)?;
    let height = target.proposal_height()?;
    let poller = ctx.poller(ctx.config.timeouts.halt()).strict();
    for validator in &target.chain.validators {
        let container = ctx.registry.require_validator(target.id(), validator.index)?;
        let condition = format!("{} to halt at height {height}", container.name);
        let mut detector = HaltDetector::new(condition.clone(), height);
        poller
            .wait_for(
                &condition,
                || ctx.node.latest_height(container),
                |current| Ok(detector.observe(current)?.then_some(())),
            )
            .await?;
        info!(
            chain = target.id(),
            validator = container.name.as_str(),
            height,
            "validator halted"
        );
    }
    Ok(())
}

/// Waits until every validator of network `network` reports a height past its proposal height.
async fn wait_for_resume<P: ContainerPlatform, N: ChainNode>(
    ctx: &Context<P, N>,
    network: usize,
) -> Result<(), Error> {
    let target = ctx.network(network)?;
    let height = target.proposal_height()?;
    let poller = ctx.poller(ctx.config.timeouts.resume());
    for validator in &target.chain.validators {
        let container = ctx.registry.require_validator(target.id(), validator.index)?;
        let reached = poller
            .wait_for(
                &format!("{} to pass height {height}", container.name),
                || ctx.node.latest_height(container),
                |current| Ok((current > height).then_some(current)),
            )
            .await?;
        debug!(
            chain = target.id(),
            validator = container.name.as_str(),
            height = reached,
            "validator resumed"
        );
    }
    info!(chain = target.id(), height, "chain resumed");
    Ok(())
}

/// Upgrades every network.
///
/// No validator is stopped before every validator of every network halted. Any error aborts
/// the upgrade without retrying.
pub async fn upgrade<P: ContainerPlatform, N: ChainNode>(
    ctx: &mut Context<P, N>,
) -> Result<(), Error> {
    let count = ctx.networks.len();
    for network in 0..count {
        propose(ctx, network).await?;
    }
    for network in 0..count {
        wait_for_halt(ctx, network).await?;
    }

    for network in 0..count {
        let target = ctx.network(network)?;
        let chain = target.id().to_string();
        let indices: Vec<usize> = target.chain.validators.iter().map(|v| v.index).collect();
        for index in indices {
            remove_validator(&ctx.platform, &mut ctx.registry, &chain, index).await?;
        }
        info!(chain = chain.as_str(), "stopped validators for upgrade");
    }

    if ctx.images.switch_to_upgrade() {
        info!(
            image = ctx.images.validator.reference().as_str(),
            "switched to upgrade image"
        );
    }
    for network in 0..count {
        run_validators(ctx, network).await?;
        wait_for_resume(ctx, network).await?;
    }
    info!(networks = count, "upgrade complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_requires_consecutive_observations() {
        let mut detector = HaltDetector::new("halt", 100);
        assert!(!detector.observe(98).unwrap());
        assert!(!detector.observe(100).unwrap());
        assert!(!detector.observe(100).unwrap());
        // A stale read resets the streak
        assert!(!detector.observe(99).unwrap());
        assert!(!detector.observe(100).unwrap());
        assert!(!detector.observe(100).unwrap());
        assert!(detector.observe(100).unwrap());
        assert!(detector.is_halted());
    }

    #[test]
    fn test_halt_latches() {
        let mut detector = HaltDetector::new("halt", 10);
        for _ in 0..HALT_CONFIRMATIONS {
            detector.observe(10).unwrap();
        }
        assert!(detector.is_halted());
        // Later reads at or below the target do not undo the halt
        assert!(detector.observe(10).unwrap());
        assert!(detector.observe(9).unwrap());
    }

    #[test]
    fn test_overshoot_is_a_violation() {
        let mut detector = HaltDetector::new("chain-a-val-0 to halt", 50);
        assert!(!detector.observe(50).unwrap());
        let err = detector.observe(51).unwrap_err();
        assert!(err.is_protocol_violation());
        match err {
            Error::ProtocolViolation {
                condition,
                expected,
                observed,
            } => {
                assert_eq!(condition, "chain-a-val-0 to halt");
                assert_eq!(expected, 50);
                assert_eq!(observed, 51);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let mut halted = HaltDetector::new("halt", 50);
        for _ in 0..HALT_CONFIRMATIONS {
            halted.observe(50).unwrap();
        }
        assert!(halted.observe(52).is_err());
    }
}
