//! Churn simulator for the exchange protocol.
//!
//! Starts an in-process cluster, then alternates crashes and joins. Crashed
//! nodes are found by a heartbeat failure detector, and after every step the
//! simulator waits until all live nodes hold the same ready version,
//! membership and assignment digest.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use meridian_core::hash::mix64;
use meridian_core::{short_id, NodeId, TopologyVersion};
use meridian_server::cluster::{
    ClusterConfig, CoordinatorDeps, CoordinatorHandle, DeadlineFailureDetector, ExchangeService,
    FailureDetector, HeartbeatMonitor, InMemoryNetwork, InMemoryPartitionState,
    MemoryTopologyStore, MembershipEvent, NullRebalanceScheduler, PhiAccrualConfig,
    PhiAccrualFailureDetector, TopologyStore,
};
use meridian_server::telemetry::{init_tracing, LogFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Detector {
    /// Phi accrual over heartbeat inter-arrival times.
    Phi,
    /// Fixed silence deadline.
    Deadline,
}

#[derive(Parser, Debug)]
#[command(name = "meridian-sim")]
#[command(about = "Simulate membership churn against the topology exchange protocol", long_about = None)]
struct Cli {
    /// Initial number of nodes
    #[arg(long, env = "MERIDIAN_SIM_NODES", default_value_t = 5)]
    nodes: usize,

    /// Number of churn steps
    #[arg(long, env = "MERIDIAN_SIM_ROUNDS", default_value_t = 10)]
    rounds: usize,

    /// Seed for node ids and the churn schedule
    #[arg(long, env = "MERIDIAN_SIM_SEED", default_value_t = 1)]
    seed: u64,

    /// JSON cluster configuration; flags below override it
    #[arg(long, env = "MERIDIAN_SIM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    partitions: Option<u32>,

    #[arg(long)]
    backups: Option<u32>,

    #[arg(long)]
    exchange_timeout_ms: Option<u64>,

    #[arg(long, default_value_t = 100)]
    heartbeat_interval_ms: u64,

    #[arg(long, value_enum, default_value_t = Detector::Phi)]
    detector: Detector,

    /// Deliver every protocol message twice
    #[arg(long)]
    duplicate_delivery: bool,

    /// Persist each node's ready topology under this directory
    #[arg(long, env = "MERIDIAN_SIM_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Log output format (compact or json)
    #[arg(long, env = "MERIDIAN_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    rounds: usize,
    crashes: usize,
    joins: usize,
    version: String,
    members: Vec<String>,
    digest: String,
    elapsed_ms: u64,
}

struct SimNode {
    service: ExchangeService,
    handle: CoordinatorHandle,
}

struct Simulation {
    config: ClusterConfig,
    network: InMemoryNetwork,
    monitor: HeartbeatMonitor,
    nodes: BTreeMap<NodeId, SimNode>,
    store_dir: Option<PathBuf>,
    started: Instant,
    rng: StdRng,
    seed: u64,
    next_index: u64,
}

impl Simulation {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn next_node_id(&mut self) -> NodeId {
        self.next_index += 1;
        Uuid::from_u64_pair(mix64(self.seed), self.next_index)
    }

    fn store_for(&self, node_id: NodeId) -> Result<Arc<dyn TopologyStore>> {
        let Some(dir) = &self.store_dir else {
            return Ok(Arc::new(MemoryTopologyStore::new()));
        };
        #[cfg(feature = "redb")]
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating store directory {}", dir.display()))?;
            let path = dir.join(format!("node-{}.redb", short_id(&node_id)));
            Ok(Arc::new(meridian_server::cluster::RedbTopologyStore::open(path)?))
        }
        #[cfg(not(feature = "redb"))]
        {
            warn!(dir = %dir.display(), node = %short_id(&node_id), "built without redb; using memory store");
            Ok(Arc::new(MemoryTopologyStore::new()))
        }
    }

    async fn start_node(&mut self) -> Result<NodeId> {
        let node_id = self.next_node_id();
        let (transport, inbox) = self.network.register(node_id);
        let partitions = Arc::new(InMemoryPartitionState::new());
        let deps = CoordinatorDeps {
            transport: Arc::new(transport),
            partitions: partitions.clone(),
            durability: partitions,
            store: self.store_for(node_id)?,
            rebalance: Arc::new(NullRebalanceScheduler),
        };
        let service = ExchangeService::start(node_id, self.config.clone(), deps, Some(inbox))
            .await
            .with_context(|| format!("starting node {}", short_id(&node_id)))?;
        let handle = service.handle();
        self.monitor.watch(node_id, self.now_ms());
        self.nodes.insert(node_id, SimNode { service, handle });
        info!(node = %short_id(&node_id), "node started");
        Ok(node_id)
    }

    async fn crash_random(&mut self) -> Result<NodeId> {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        if ids.is_empty() {
            bail!("no live node to crash");
        }
        let index = self.rng.random_range(0..ids.len());
        let node_id = ids[index];
        if let Some(node) = self.nodes.remove(&node_id) {
            self.network.unregister(&node_id);
            node.service.stop().await;
        }
        info!(node = %short_id(&node_id), "node crashed");
        Ok(node_id)
    }

    async fn broadcast(&self, event: &MembershipEvent) -> Result<()> {
        for node in self.nodes.values() {
            node.handle.notify(event.clone()).await?;
        }
        Ok(())
    }

    /// Heartbeats every live node and feeds detector verdicts to them.
    async fn heartbeat_round(&self) -> Result<()> {
        let now = self.now_ms();
        for node_id in self.nodes.keys() {
            self.monitor.heartbeat(node_id, now);
        }
        for event in self.monitor.check(now) {
            self.monitor.unwatch(&event.node_id);
            self.broadcast(&event).await?;
        }
        Ok(())
    }

    /// Agreed (version, digest) if every live node holds the same ready
    /// topology over exactly the live members.
    fn agreement(&self) -> Option<(TopologyVersion, String)> {
        let live: Vec<NodeId> = self.nodes.keys().copied().collect();
        let mut agreed: Option<(TopologyVersion, String)> = None;
        for node in self.nodes.values() {
            let state = node.handle.state();
            if state.in_flight().is_some() || state.halted().is_some() {
                return None;
            }
            let ready = state.ready();
            if ready.members.node_ids() != live {
                return None;
            }
            let digest = ready.assignment.digest();
            match &agreed {
                Some((version, agreed_digest)) => {
                    if *version != ready.version || *agreed_digest != digest {
                        return None;
                    }
                }
                None => agreed = Some((ready.version, digest)),
            }
        }
        agreed
    }

    async fn await_agreement(&self, limit: Duration) -> Result<(TopologyVersion, String)> {
        let deadline = Instant::now() + limit;
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        loop {
            self.heartbeat_round().await?;
            if let Some(agreed) = self.agreement() {
                return Ok(agreed);
            }
            if Instant::now() >= deadline {
                for (node_id, node) in &self.nodes {
                    let state = node.handle.state();
                    warn!(
                        node = %short_id(node_id),
                        version = %state.current_version(),
                        in_flight = ?state.in_flight(),
                        halted = ?state.halted(),
                        "node did not converge"
                    );
                }
                bail!("cluster did not converge within {limit:?}");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ClusterConfig::from_json_str(&json)?
        }
        None => ClusterConfig {
            exchange_timeout_ms: 1000,
            tick_interval_ms: 50,
            ..ClusterConfig::default()
        },
    };
    if let Some(partitions) = cli.partitions {
        config.partition_count = partitions;
    }
    if let Some(backups) = cli.backups {
        config.backup_count = backups;
    }
    if let Some(timeout) = cli.exchange_timeout_ms {
        config.exchange_timeout_ms = timeout;
    }
    config.heartbeat_interval_ms = cli.heartbeat_interval_ms;
    config.min_std_dev_ms = config.min_std_dev_ms.min(cli.heartbeat_interval_ms);
    config.max_no_heartbeat_ms = config.max_no_heartbeat_ms.min(cli.heartbeat_interval_ms * 10);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level)?;

    let config = load_config(&cli)?;
    if cli.nodes == 0 {
        bail!("--nodes must be positive");
    }
    let detector: Arc<dyn FailureDetector> = match cli.detector {
        Detector::Phi => Arc::new(PhiAccrualFailureDetector::new(PhiAccrualConfig::from(&config))),
        Detector::Deadline => Arc::new(DeadlineFailureDetector::new(config.max_no_heartbeat_ms)),
    };
    let network = InMemoryNetwork::new();
    network.set_duplicate_delivery(cli.duplicate_delivery);

    let mut sim = Simulation {
        config,
        network,
        monitor: HeartbeatMonitor::new(detector),
        nodes: BTreeMap::new(),
        store_dir: cli.store_dir.clone(),
        started: Instant::now(),
        rng: StdRng::seed_from_u64(cli.seed),
        seed: cli.seed,
        next_index: 0,
    };
    let limit = Duration::from_millis(
        sim.config.exchange_timeout_ms * 10 + sim.config.max_no_heartbeat_ms * 2,
    );

    let mut initial = Vec::with_capacity(cli.nodes);
    for _ in 0..cli.nodes {
        initial.push(sim.start_node().await?);
    }
    for node_id in &initial {
        sim.broadcast(&MembershipEvent::joined(*node_id)).await?;
    }
    let (version, digest) = sim.await_agreement(limit).await?;
    info!(%version, %digest, nodes = sim.nodes.len(), "cluster formed");

    let min_live = sim.config.backup_count as usize + 2;
    let (mut crashes, mut joins) = (0, 0);
    let mut last = (version, digest);
    for round in 1..=cli.rounds {
        let crash = sim.nodes.len() > min_live && sim.rng.random_bool(0.5);
        if crash {
            sim.crash_random().await?;
            crashes += 1;
        } else {
            let node_id = sim.start_node().await?;
            sim.broadcast(&MembershipEvent::joined(node_id)).await?;
            joins += 1;
        }

        let agreed = sim.await_agreement(limit).await?;
        if agreed.0 <= last.0 {
            bail!("round {round}: version did not advance past {}", last.0);
        }
        info!(round, version = %agreed.0, digest = %agreed.1, nodes = sim.nodes.len(), "round converged");
        last = agreed;
    }

    let summary = Summary {
        rounds: cli.rounds,
        crashes,
        joins,
        version: last.0.to_string(),
        members: sim.nodes.keys().map(short_id).collect(),
        digest: last.1,
        elapsed_ms: sim.now_ms(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for (_, node) in std::mem::take(&mut sim.nodes) {
        node.service.stop().await;
    }
    Ok(())
}
