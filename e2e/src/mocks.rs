//! Simulated container platform and ledger.
//!
//! [World] keeps containers in memory and advances chain heights on the tokio clock, so an entire
//! run completes instantly under `#[tokio::test(start_paused = true)]`. The simulation follows
//! the behavior the suite depends on:
//!
//! * the init container writes a topology for the validator configs it was given,
//! * a chain produces one block per second while any of its validators runs,
//! * a chain with a passed upgrade proposal halts at the upgrade height until every running
//!   validator runs an image other than the one the chain started with,
//! * restarted validators report `catching_up` for a few seconds,
//! * the relayer reports a partial state while it warms up,
//! * transfers over an open channel are credited to the recipient after a short delay.
//!
//! Faults can be injected to exercise failure paths (see [World::ignore_upgrade],
//! [World::partial_relayer], [World::stall], [World::hang], [World::crash_on], and
//! [World::init_never_writes]).

use crate::{
    chain::{ChainMeta, Topology, ValidatorRecord},
    node::{Balances, ChainNode, Coin, SyncInfo},
    platform::{
        Container, ContainerPlatform, ContainerSpec, ExecOutput, Image, Kind, NetworkHandle,
        CHAIN_LABEL,
    },
    Error,
};
use serde_json::json;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::warn;

/// Time between two blocks of a simulated chain.
pub const BLOCK_TIME: Duration = Duration::from_secs(1);

/// How long a freshly started validator reports that it is catching up.
pub const CATCH_UP: Duration = Duration::from_secs(5);

/// How long the relayer refuses connections after it starts.
pub const RELAYER_BOOT: Duration = Duration::from_secs(2);

/// How long the relayer reports a partial state after it starts.
pub const RELAYER_WARMUP: Duration = Duration::from_secs(8);

/// Default time the init container takes to write the topology.
pub const INIT_DELAY: Duration = Duration::from_secs(2);

/// Time a transfer takes to reach the counterparty.
pub const TRANSFER_DELAY: Duration = Duration::from_secs(3);

/// Denomination of `denom` after it crossed the transfer channel.
pub fn ibc_denom(denom: &str) -> String {
    let trace = format!("transfer/channel-0/{denom}");
    let hash: String = trace.bytes().map(|b| format!("{b:02X}")).collect();
    format!("ibc/{hash}")
}

fn unreachable_node(endpoint: &str, name: &str) -> Error {
    Error::UnexpectedResponse {
        endpoint: endpoint.to_string(),
        reason: format!("connection refused by {name}"),
    }
}

fn arg<'a>(cmd: &'a [String], flag: &str) -> Option<&'a str> {
    let prefix = format!("--{flag}=");
    cmd.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

fn env<'a>(spec: &'a ContainerSpec, key: &str) -> Option<&'a str> {
    let prefix = format!("{key}=");
    spec.env.iter().find_map(|e| e.strip_prefix(prefix.as_str()))
}

struct SimContainer {
    spec: ContainerSpec,
    started: Instant,
}

impl SimContainer {
    fn chain(&self) -> Option<&str> {
        self.spec.labels.get(CHAIN_LABEL).map(String::as_str)
    }
}

struct SimProposal {
    id: u64,
    height: u64,
    deposited: bool,
    votes: BTreeSet<String>,
}

struct SimChain {
    validators: usize,
    height: u64,
    last_tick: Instant,
    genesis: Option<Image>,
    proposals: Vec<SimProposal>,
}

impl SimChain {
    fn new(validators: usize) -> Self {
        Self {
            validators,
            height: 0,
            last_tick: Instant::now(),
            genesis: None,
            proposals: Vec::new(),
        }
    }

    /// Height of the first proposal that collected its deposit and a vote from every validator.
    fn upgrade_height(&self) -> Option<u64> {
        self.proposals
            .iter()
            .find(|p| p.deposited && p.votes.len() >= self.validators)
            .map(|p| p.height)
    }

    fn advance(&mut self, now: Instant, producing: bool, exempt: bool) {
        if !producing {
            self.last_tick = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_tick);
        let blocks = (elapsed.as_millis() / BLOCK_TIME.as_millis()) as u64;
        if blocks == 0 {
            return;
        }
        self.last_tick += BLOCK_TIME * blocks as u32;
        let mut height = self.height + blocks;
        if let Some(halt) = self.upgrade_height() {
            if !exempt && self.height <= halt {
                height = height.min(halt);
            }
        }
        self.height = height;
    }

    fn proposal(&mut self, id: u64) -> Result<&mut SimProposal, Error> {
        self.proposals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::UnexpectedResponse {
                endpoint: "gov".to_string(),
                reason: format!("unknown proposal {id}"),
            })
    }
}

struct InFlight {
    arrival: Instant,
    recipient: String,
    denom: String,
    amount: u128,
}

#[derive(Default)]
struct Faults {
    ignore_upgrade: BTreeSet<String>,
    partial_relayer: bool,
    init_never_writes: bool,
    init_delay: Option<Duration>,
    stalled: BTreeSet<String>,
    hung: BTreeSet<String>,
    crashed: BTreeSet<(String, String)>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    containers: BTreeMap<String, SimContainer>,
    networks: BTreeMap<String, String>,
    chains: BTreeMap<String, SimChain>,
    channels: Vec<(String, String)>,
    balances: BTreeMap<String, Balances>,
    in_flight: Vec<InFlight>,
    state_syncs: Vec<Vec<String>>,
    purged: Vec<String>,
    log: Vec<String>,
    faults: Faults,
}

impl Inner {
    /// Brings every chain and pending transfer up to the current time.
    ///
    /// Must run before any change to the set of running containers, since block production
    /// between two ticks is computed from the containers running at the end of the interval.
    fn tick(&mut self) {
        let now = Instant::now();
        let ids: Vec<String> = self.chains.keys().cloned().collect();
        for id in ids {
            let (producing, upgraded) = self.chain_status(&id);
            let exempt = upgraded || self.faults.ignore_upgrade.contains(&id);
            if let Some(chain) = self.chains.get_mut(&id) {
                chain.advance(now, producing, exempt);
            }
        }

        let (arrived, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|t| t.arrival <= now);
        self.in_flight = pending;
        for transfer in arrived {
            *self
                .balances
                .entry(transfer.recipient)
                .or_default()
                .entry(transfer.denom)
                .or_default() += transfer.amount;
        }
    }

    fn validators_of(&self, chain: &str) -> Vec<&SimContainer> {
        self.containers
            .values()
            .filter(|c| c.spec.kind == Kind::Validator && c.chain() == Some(chain))
            .collect()
    }

    /// Returns whether `chain` is producing blocks and whether all its validators upgraded.
    fn chain_status(&self, chain: &str) -> (bool, bool) {
        let genesis = self.chains.get(chain).and_then(|c| c.genesis.as_ref());
        let validators = self.validators_of(chain);
        let producing = !validators.is_empty();
        let upgraded = producing && validators.iter().all(|c| Some(&c.spec.image) != genesis);
        (producing, upgraded)
    }

    fn running(&self, container: &Container, endpoint: &str) -> Result<&SimContainer, Error> {
        self.containers
            .get(&container.id)
            .ok_or_else(|| unreachable_node(endpoint, &container.name))
    }

    /// Chain a running validator container belongs to.
    fn chain_of(&mut self, container: &Container, endpoint: &str) -> Result<&mut SimChain, Error> {
        let chain = self
            .running(container, endpoint)?
            .chain()
            .map(str::to_string)
            .ok_or_else(|| unreachable_node(endpoint, &container.name))?;
        self.chains
            .get_mut(&chain)
            .ok_or_else(|| unreachable_node(endpoint, &container.name))
    }

    fn start_init(&mut self, spec: &ContainerSpec) -> Result<(), Error> {
        let invalid = |reason: &str| Error::UnexpectedResponse {
            endpoint: "init".to_string(),
            reason: reason.to_string(),
        };
        let data_dir = arg(&spec.cmd, "data-dir").ok_or_else(|| invalid("missing --data-dir"))?;
        let chain_id = arg(&spec.cmd, "chain-id").ok_or_else(|| invalid("missing --chain-id"))?;
        let config = arg(&spec.cmd, "config").ok_or_else(|| invalid("missing --config"))?;
        let configs: Vec<serde_json::Value> = serde_json::from_str(config)?;

        let validators = (0..configs.len())
            .map(|index| ValidatorRecord {
                name: format!("val-{index}"),
                config_dir: format!("{data_dir}/{chain_id}/val-{index}"),
                index,
                mnemonic: format!("{chain_id} mnemonic {index}"),
                public_address: format!("{chain_id}-addr-{index}"),
                public_key: format!("{chain_id}-pk-{index}"),
            })
            .collect::<Vec<_>>();
        let dirs: Vec<PathBuf> = validators
            .iter()
            .map(|v| PathBuf::from(&v.config_dir))
            .collect();
        let topology = Topology {
            chain_meta: ChainMeta {
                data_dir: data_dir.to_string(),
                id: chain_id.to_string(),
            },
            validators,
        };
        let encoded = serde_json::to_vec(&topology)?;
        let path = Topology::path(data_dir.as_ref(), chain_id);
        self.chains
            .insert(chain_id.to_string(), SimChain::new(configs.len()));

        if self.faults.init_never_writes {
            return Ok(());
        }
        let delay = self.faults.init_delay.unwrap_or(INIT_DELAY);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for dir in dirs {
                if let Err(err) = std::fs::create_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %err, "failed to create config dir");
                }
            }
            if let Err(err) = std::fs::write(&path, encoded) {
                warn!(path = %path.display(), error = %err, "failed to write topology");
            }
        });
        Ok(())
    }
}

/// Shared state of the simulation.
#[derive(Clone, Default)]
pub struct World {
    inner: Arc<Mutex<Inner>>,
}

impl World {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn platform(&self) -> MockPlatform {
        MockPlatform {
            world: self.clone(),
        }
    }

    pub fn node(&self) -> MockNode {
        MockNode {
            world: self.clone(),
        }
    }

    /// Names of the containers that exist, in start order.
    pub fn running(&self) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .map(|c| c.spec.name.clone())
            .collect()
    }

    /// Names of the containers that were purged, in order.
    pub fn purged(&self) -> Vec<String> {
        self.lock().purged.clone()
    }

    /// Bind mounts of the running container named `name`.
    pub fn mounts(&self, name: &str) -> Vec<String> {
        self.lock()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .map(|c| c.spec.mounts.clone())
            .unwrap_or_default()
    }

    /// Names of the networks that exist.
    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.values().cloned().collect()
    }

    /// Current height of `chain`.
    pub fn height(&self, chain: &str) -> Option<u64> {
        let mut inner = self.lock();
        inner.tick();
        inner.chains.get(chain).map(|c| c.height)
    }

    /// Channels created by relayers.
    pub fn channels(&self) -> Vec<(String, String)> {
        self.lock().channels.clone()
    }

    /// Arguments of every state sync container, in start order.
    pub fn state_syncs(&self) -> Vec<Vec<String>> {
        self.lock().state_syncs.clone()
    }

    /// Balances credited to `address` so far.
    pub fn balances(&self, address: &str) -> Balances {
        let mut inner = self.lock();
        inner.tick();
        inner.balances.get(address).cloned().unwrap_or_default()
    }

    /// Lifecycle events (`start <name>`, `remove <name>`, `purge <name>`), in order.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Makes `chain` keep producing blocks past its upgrade height.
    pub fn ignore_upgrade(&self, chain: &str) {
        self.lock().faults.ignore_upgrade.insert(chain.to_string());
    }

    /// Makes the relayer only ever report one chain.
    pub fn partial_relayer(&self) {
        self.lock().faults.partial_relayer = true;
    }

    /// Makes the container named `name` report that it is catching up forever.
    pub fn stall(&self, name: &str) {
        self.lock().faults.stalled.insert(name.to_string());
    }

    /// Makes waits on, and commands executed in, the container named `name` never complete.
    pub fn hang(&self, name: &str) {
        self.lock().faults.hung.insert(name.to_string());
    }

    /// Makes the container named `name` unreachable whenever it runs `image`.
    pub fn crash_on(&self, name: &str, image: &Image) {
        self.lock()
            .faults
            .crashed
            .insert((name.to_string(), image.reference()));
    }

    /// Makes init containers exit without writing a topology.
    pub fn init_never_writes(&self) {
        self.lock().faults.init_never_writes = true;
    }

    /// Sets how long init containers take to write the topology.
    pub fn init_delay(&self, delay: Duration) {
        self.lock().faults.init_delay = Some(delay);
    }
}

/// [ContainerPlatform] over a [World].
#[derive(Clone)]
pub struct MockPlatform {
    world: World,
}

impl ContainerPlatform for MockPlatform {
    async fn create_network(&self, name: &str) -> Result<NetworkHandle, Error> {
        let mut inner = self.world.lock();
        inner.next_id += 1;
        let id = format!("net-{:08x}", inner.next_id);
        inner.networks.insert(id.clone(), name.to_string());
        Ok(NetworkHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), Error> {
        let mut inner = self.world.lock();
        let attached = inner
            .containers
            .values()
            .filter(|c| c.spec.network.as_deref() == Some(network.id.as_str()))
            .count();
        if attached > 0 {
            return Err(Error::UnexpectedResponse {
                endpoint: "networks/remove".to_string(),
                reason: format!("{} has {attached} active endpoints", network.name),
            });
        }
        inner.networks.remove(&network.id);
        Ok(())
    }

    async fn start(&self, spec: ContainerSpec) -> Result<Container, Error> {
        let mut inner = self.world.lock();
        inner.tick();
        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(Error::UnexpectedResponse {
                endpoint: "containers/create".to_string(),
                reason: format!("name {} is already in use", spec.name),
            });
        }
        if let Some(network) = &spec.network {
            if !inner.networks.contains_key(network) {
                return Err(Error::UnexpectedResponse {
                    endpoint: "containers/create".to_string(),
                    reason: format!("network {network} not found"),
                });
            }
        }

        match spec.kind {
            Kind::Init => inner.start_init(&spec)?,
            Kind::Validator => {
                // The first image a chain runs is the one its genesis was written for
                if let Some(chain) = spec
                    .labels
                    .get(CHAIN_LABEL)
                    .and_then(|id| inner.chains.get_mut(id))
                {
                    chain.genesis.get_or_insert_with(|| spec.image.clone());
                }
            }
            Kind::StateSync => inner.state_syncs.push(spec.cmd.clone()),
            Kind::Relayer => {}
        }

        inner.next_id += 1;
        let seq = inner.next_id;
        let id = format!("{seq:012x}");
        let ports = spec
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| {
                let host = port
                    .host
                    .map_or(30_000 + (seq % 3_000) * 10 + i as u64, u64::from);
                (port.container, format!("127.0.0.1:{host}"))
            })
            .collect();
        let container = Container {
            id: id.clone(),
            name: spec.name.clone(),
            ports,
        };
        inner.log.push(format!("start {}", spec.name));
        inner.containers.insert(
            id,
            SimContainer {
                spec,
                started: Instant::now(),
            },
        );
        Ok(container)
    }

    async fn remove(&self, container: &Container) -> Result<(), Error> {
        let mut inner = self.world.lock();
        inner.tick();
        if inner.containers.remove(&container.id).is_none() {
            return Err(Error::UnexpectedResponse {
                endpoint: "containers/stop".to_string(),
                reason: format!("no such container: {}", container.name),
            });
        }
        inner.log.push(format!("remove {}", container.name));
        Ok(())
    }

    async fn purge(&self, container: &Container) -> Result<(), Error> {
        let mut inner = self.world.lock();
        inner.tick();
        if inner.containers.remove(&container.id).is_some() {
            inner.log.push(format!("purge {}", container.name));
        }
        inner.purged.push(container.name.clone());
        Ok(())
    }

    async fn wait(&self, container: &Container) -> Result<i64, Error> {
        // One-shot containers finish as soon as they start
        let hung = {
            let inner = self.world.lock();
            inner.running(container, "containers/wait")?;
            inner.faults.hung.contains(&container.name)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        Ok(0)
    }

    async fn exec(&self, container: &Container, cmd: Vec<String>) -> Result<ExecOutput, Error> {
        let hung = {
            let mut inner = self.world.lock();
            inner.running(container, "exec")?;
            inner
                .log
                .push(format!("exec {} {}", container.name, cmd.join(" ")));
            inner.faults.hung.contains(&container.name)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        Ok(ExecOutput::default())
    }
}

/// [ChainNode] over a [World].
#[derive(Clone)]
pub struct MockNode {
    world: World,
}

impl ChainNode for MockNode {
    async fn latest_height(&self, validator: &Container) -> Result<u64, Error> {
        Ok(self.sync_info(validator).await?.latest_block_height)
    }

    async fn sync_info(&self, validator: &Container) -> Result<SyncInfo, Error> {
        let mut inner = self.world.lock();
        inner.tick();
        let stalled = inner.faults.stalled.contains(&validator.name);
        let running = inner.running(validator, "/status")?;
        let started = running.started;
        let key = (validator.name.clone(), running.spec.image.reference());
        if inner.faults.crashed.contains(&key) {
            return Err(unreachable_node("/status", &validator.name));
        }
        let latest_block_height = inner.chain_of(validator, "/status")?.height;
        Ok(SyncInfo {
            latest_block_height,
            catching_up: stalled || started.elapsed() < CATCH_UP,
        })
    }

    async fn block_hash(&self, validator: &Container, height: u64) -> Result<String, Error> {
        let mut inner = self.world.lock();
        inner.tick();
        let current = inner.chain_of(validator, "/block")?.height;
        if height == 0 || height > current {
            return Err(Error::UnexpectedResponse {
                endpoint: "/block".to_string(),
                reason: format!("height {height} is not available (latest {current})"),
            });
        }
        Ok(format!("{height:064X}"))
    }

    async fn submit_upgrade_proposal(
        &self,
        _chain: &str,
        validator: &Container,
        height: u64,
    ) -> Result<u64, Error> {
        let mut inner = self.world.lock();
        inner.tick();
        let chain = inner.chain_of(validator, "gov")?;
        if height <= chain.height {
            return Err(Error::UnexpectedResponse {
                endpoint: "gov".to_string(),
                reason: format!("upgrade height {height} is in the past"),
            });
        }
        let id = chain.proposals.len() as u64 + 1;
        chain.proposals.push(SimProposal {
            id,
            height,
            deposited: false,
            votes: BTreeSet::new(),
        });
        Ok(id)
    }

    async fn deposit(&self, _chain: &str, validator: &Container, proposal: u64) -> Result<(), Error> {
        let mut inner = self.world.lock();
        inner.tick();
        inner.chain_of(validator, "gov")?.proposal(proposal)?.deposited = true;
        Ok(())
    }

    async fn vote_yes(&self, _chain: &str, validator: &Container, proposal: u64) -> Result<(), Error> {
        let mut inner = self.world.lock();
        inner.tick();
        let proposal = inner.chain_of(validator, "gov")?.proposal(proposal)?;
        if !proposal.deposited {
            return Err(Error::UnexpectedResponse {
                endpoint: "gov".to_string(),
                reason: format!("proposal {} is not in its voting period", proposal.id),
            });
        }
        proposal.votes.insert(validator.name.clone());
        Ok(())
    }

    async fn relayer_state(&self, relayer: &Container) -> Result<String, Error> {
        let inner = self.world.lock();
        let container = inner.running(relayer, "/state")?;
        let elapsed = container.started.elapsed();
        if elapsed < RELAYER_BOOT {
            return Err(unreachable_node("/state", &relayer.name));
        }
        let mut chains: Vec<&str> = env(&container.spec, "CHAIN_A_ID").into_iter().collect();
        if elapsed >= RELAYER_WARMUP && !inner.faults.partial_relayer {
            chains.extend(env(&container.spec, "CHAIN_B_ID"));
        }
        Ok(json!({"status": "success", "result": {"chains": chains}}).to_string())
    }

    async fn connect_chains(&self, relayer: &Container, a: &str, b: &str) -> Result<(), Error> {
        let mut inner = self.world.lock();
        inner.running(relayer, "exec")?;
        inner.channels.push((a.to_string(), b.to_string()));
        Ok(())
    }

    async fn transfer(
        &self,
        chain: &str,
        validator: &Container,
        recipient: &str,
        coin: &Coin,
    ) -> Result<(), Error> {
        let mut inner = self.world.lock();
        inner.tick();
        inner.running(validator, "tx")?;
        if !inner.channels.iter().any(|(a, b)| a == chain || b == chain) {
            return Err(Error::UnexpectedResponse {
                endpoint: "tx".to_string(),
                reason: format!("no transfer channel on {chain}"),
            });
        }
        let relaying = inner
            .containers
            .values()
            .any(|c| c.spec.kind == Kind::Relayer);
        if relaying {
            inner.in_flight.push(InFlight {
                arrival: Instant::now() + TRANSFER_DELAY,
                recipient: recipient.to_string(),
                denom: ibc_denom(&coin.denom),
                amount: coin.amount,
            });
        }
        Ok(())
    }

    async fn balances(&self, validator: &Container, address: &str) -> Result<Balances, Error> {
        let mut inner = self.world.lock();
        inner.tick();
        inner.running(validator, "bank")?;
        Ok(inner.balances.get(address).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{encode_validator_configs, ValidatorConfig};
    use tokio::time::sleep;

    async fn init_chain(world: &World, dir: &std::path::Path, chain: &str, n: usize) {
        let configs = vec![ValidatorConfig::new("default", 0, 0, 10, 2); n];
        let spec = ContainerSpec::new(format!("{chain}-init"), Image::new("init", "v1"), Kind::Init)
            .cmd([
                format!("--data-dir={}", dir.display()),
                format!("--chain-id={chain}"),
                format!("--config={}", encode_validator_configs(&configs).unwrap()),
            ]);
        let init = world.platform().start(spec).await.unwrap();
        // The writer wakes at INIT_DELAY, so wait past it
        sleep(INIT_DELAY + BLOCK_TIME).await;
        world.platform().purge(&init).await.unwrap();
    }

    fn validator(chain: &str, index: usize, tag: &str) -> ContainerSpec {
        ContainerSpec::new(
            format!("{chain}-val-{index}"),
            Image::new("ledger", tag),
            Kind::Validator,
        )
        .label(CHAIN_LABEL, chain)
        .port(26657, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_writes_topology() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::default();
        init_chain(&world, dir.path(), "chain-a", 3).await;

        let raw = std::fs::read(Topology::path(dir.path(), "chain-a")).unwrap();
        let topology: Topology = serde_json::from_slice(&raw).unwrap();
        assert_eq!(topology.chain_meta.id, "chain-a");
        assert_eq!(topology.validators.len(), 3);
        assert!(world.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_halts_until_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::default();
        let platform = world.platform();
        let node = world.node();
        init_chain(&world, dir.path(), "chain-a", 1).await;

        let val = platform.start(validator("chain-a", 0, "v1")).await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(node.latest_height(&val).await.unwrap(), 5);

        let id = node.submit_upgrade_proposal("chain-a", &val, 10).await.unwrap();
        node.deposit("chain-a", &val, id).await.unwrap();
        node.vote_yes("chain-a", &val, id).await.unwrap();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(node.latest_height(&val).await.unwrap(), 10);
        assert_eq!(world.height("chain-a"), Some(10));

        platform.remove(&val).await.unwrap();
        assert!(node.latest_height(&val).await.is_err());
        sleep(Duration::from_secs(30)).await;
        let val = platform.start(validator("chain-a", 0, "v2")).await.unwrap();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(node.latest_height(&val).await.unwrap(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_upgrade_overshoots() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::default();
        world.ignore_upgrade("chain-a");
        let platform = world.platform();
        let node = world.node();
        init_chain(&world, dir.path(), "chain-a", 1).await;

        let val = platform.start(validator("chain-a", 0, "v1")).await.unwrap();
        let id = node.submit_upgrade_proposal("chain-a", &val, 4).await.unwrap();
        node.deposit("chain-a", &val, id).await.unwrap();
        node.vote_yes("chain-a", &val, id).await.unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(node.latest_height(&val).await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_on_image() {
        let dir = tempfile::tempdir().unwrap();
        let world = World::default();
        world.crash_on("chain-a-val-0", &Image::new("ledger", "v2"));
        let platform = world.platform();
        let node = world.node();
        init_chain(&world, dir.path(), "chain-a", 1).await;

        let val = platform.start(validator("chain-a", 0, "v1")).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        assert!(node.latest_height(&val).await.is_ok());

        platform.remove(&val).await.unwrap();
        let val = platform.start(validator("chain-a", 0, "v2")).await.unwrap();
        assert!(node.latest_height(&val).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_container_never_exits() {
        let world = World::default();
        world.hang("sync");
        let platform = world.platform();
        let sync = platform
            .start(ContainerSpec::new("sync", Image::new("init", "v1"), Kind::StateSync))
            .await
            .unwrap();
        let waited = tokio::time::timeout(Duration::from_secs(3600), platform.wait(&sync)).await;
        assert!(waited.is_err());
        let exec = tokio::time::timeout(
            Duration::from_secs(3600),
            platform.exec(&sync, vec!["true".to_string()]),
        )
        .await;
        assert!(exec.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayer_warms_up() {
        let world = World::default();
        let relayer = world
            .platform()
            .start(
                ContainerSpec::new("relayer", Image::new("hermes", "v1"), Kind::Relayer)
                    .env("CHAIN_A_ID", "chain-a")
                    .env("CHAIN_B_ID", "chain-b")
                    .port(3031, None),
            )
            .await
            .unwrap();
        let node = world.node();
        assert!(node.relayer_state(&relayer).await.is_err());

        sleep(RELAYER_BOOT).await;
        let partial = node.relayer_state(&relayer).await.unwrap();
        assert!(partial.contains("chain-a") && !partial.contains("chain-b"));

        sleep(RELAYER_WARMUP).await;
        let full = node.relayer_state(&relayer).await.unwrap();
        assert!(full.contains("chain-a") && full.contains("chain-b"));
    }
}
