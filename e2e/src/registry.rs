//! Record of every resource acquired during a run.
//!
//! Validator containers are kept in an arena keyed by chain id and validator index. A slot holds
//! at most one container: replacing it is an explicit [Registry::take_validator] followed by
//! [Registry::insert_validator], so a container can never be orphaned by a restart.

use crate::{
    platform::{Container, ContainerPlatform, ContainerSpec, NetworkHandle},
    Error,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Resources recorded by a run.
#[derive(Debug, Default)]
pub struct Registry {
    network: Option<NetworkHandle>,
    validators: BTreeMap<String, BTreeMap<usize, Container>>,
    relayers: Vec<Container>,
    oneshots: Vec<Container>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_network(&mut self, network: NetworkHandle) {
        self.network = Some(network);
    }

    pub fn network(&self) -> Option<&NetworkHandle> {
        self.network.as_ref()
    }

    /// Records the running container of validator `index` on `chain`.
    pub fn insert_validator(
        &mut self,
        chain: &str,
        index: usize,
        container: Container,
    ) -> Result<(), Error> {
        let slots = self.validators.entry(chain.to_string()).or_default();
        if slots.contains_key(&index) {
            return Err(Error::SlotOccupied {
                chain: chain.to_string(),
                index,
            });
        }
        slots.insert(index, container);
        Ok(())
    }

    /// Running container of validator `index` on `chain`, if any.
    pub fn validator(&self, chain: &str, index: usize) -> Option<&Container> {
        self.validators.get(chain).and_then(|slots| slots.get(&index))
    }

    /// Like [Registry::validator] but fails if the validator is not running.
    pub fn require_validator(&self, chain: &str, index: usize) -> Result<&Container, Error> {
        self.validator(chain, index)
            .ok_or_else(|| Error::MissingContainer {
                chain: chain.to_string(),
                index,
            })
    }

    /// Empties the slot of validator `index` on `chain`.
    pub fn take_validator(&mut self, chain: &str, index: usize) -> Option<Container> {
        self.validators
            .get_mut(chain)
            .and_then(|slots| slots.remove(&index))
    }

    /// Running validator containers of `chain`, ordered by index.
    pub fn validators(&self, chain: &str) -> Vec<&Container> {
        self.validators
            .get(chain)
            .map(|slots| slots.values().collect())
            .unwrap_or_default()
    }

    pub fn add_relayer(&mut self, container: Container) {
        self.relayers.push(container);
    }

    pub fn relayers(&self) -> &[Container] {
        &self.relayers
    }

    /// Records a short-lived container until it is purged.
    pub fn track_oneshot(&mut self, container: Container) {
        self.oneshots.push(container);
    }

    /// Forgets a short-lived container that has been purged.
    pub fn release_oneshot(&mut self, id: &str) {
        self.oneshots.retain(|c| c.id != id);
    }

    pub fn oneshots(&self) -> &[Container] {
        &self.oneshots
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.network.is_none()
            && self.validators.values().all(|slots| slots.is_empty())
            && self.relayers.is_empty()
            && self.oneshots.is_empty()
    }

    /// Removes every recorded resource.
    ///
    /// Containers are purged before the network they are attached to. Every resource is
    /// attempted even if an earlier one fails; the first failure is returned. Draining an
    /// empty registry is a no-op, so this is safe after a partial setup.
    pub async fn drain<P: ContainerPlatform>(&mut self, platform: &P) -> Result<(), Error> {
        let mut containers: Vec<Container> = Vec::new();
        containers.append(&mut self.oneshots);
        containers.append(&mut self.relayers);
        for (_, slots) in std::mem::take(&mut self.validators) {
            containers.extend(slots.into_values());
        }

        let results =
            futures::future::join_all(containers.iter().map(|c| platform.purge(c))).await;
        let mut first = None;
        for (container, result) in containers.iter().zip(results) {
            if let Err(err) = result {
                warn!(name = container.name.as_str(), error = %err, "failed to purge container");
                first.get_or_insert(err);
            }
        }

        if let Some(network) = self.network.take() {
            if let Err(err) = platform.remove_network(&network).await {
                warn!(network = network.name.as_str(), error = %err, "failed to remove network");
                first.get_or_insert(err);
            }
        }
        info!(containers = containers.len(), "drained registry");
        first.map_or(Ok(()), Err)
    }
}

/// Starts a validator container and records it in its slot.
///
/// Fails without starting anything if the slot is occupied.
pub async fn start_validator<P: ContainerPlatform>(
    platform: &P,
    registry: &mut Registry,
    chain: &str,
    index: usize,
    spec: ContainerSpec,
) -> Result<(), Error> {
    if registry.validator(chain, index).is_some() {
        return Err(Error::SlotOccupied {
            chain: chain.to_string(),
            index,
        });
    }
    let container = platform.start(spec).await?;
    registry.insert_validator(chain, index, container)
}

/// Stops validator `index` on `chain` and empties its slot.
///
/// Does nothing if the validator is not running.
pub async fn remove_validator<P: ContainerPlatform>(
    platform: &P,
    registry: &mut Registry,
    chain: &str,
    index: usize,
) -> Result<(), Error> {
    let Some(container) = registry.validator(chain, index).cloned() else {
        return Ok(());
    };
    platform.remove(&container).await?;
    registry.take_validator(chain, index);
    Ok(())
}

/// Runs a one-shot container to completion of `body`, then purges it.
///
/// The container is purged whether or not `body` succeeds. If both fail, the error of `body`
/// is returned.
pub async fn with_oneshot<P, F, Fut, T>(
    platform: &P,
    registry: &mut Registry,
    spec: ContainerSpec,
    body: F,
) -> Result<T, Error>
where
    P: ContainerPlatform,
    F: FnOnce(Container) -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let container = platform.start(spec).await?;
    registry.track_oneshot(container.clone());
    let result = body(container.clone()).await;
    let purged = platform.purge(&container).await;
    if purged.is_ok() {
        registry.release_oneshot(&container.id);
    }
    match (result, purged) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(err), _) | (Ok(_), Err(err)) => Err(err),
    }
}
