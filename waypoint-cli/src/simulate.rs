use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::collections::{BTreeMap, HashMap};
use std::fs::read_to_string;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use waypoint_balancer::balancer_metrics::MetricsListener;
use waypoint_balancer::{
    BalancerError, Endpoint, ErrorType, HealthProbe, LoadBalancerState, ProbeOutcome, Route,
    StateExecutor,
};
use waypoint_discovery::{Announcer, DiscoveryService, StoreKey};
use waypoint_metadata_store::{MemoryStore, MetadataStore};

use crate::config::{EndpointProfile, LoadConfiguration, SimulationConfig};

#[derive(Debug, Parser)]
#[command(after_help = EXAMPLES_TEXT)]
pub struct Simulate {
    #[arg(long, short = 'c', help = "Path to the simulation YAML file")]
    pub config_file: String,

    #[arg(
        long,
        short = 'n',
        default_value_t = 10,
        help = "Number of intervals to simulate"
    )]
    pub intervals: usize,
}

const EXAMPLES_TEXT: &str = r#"
EXAMPLES:
    # Run the bundled topology for 20 intervals
    waypoint simulate --config-file waypoint-cli/config/sim.yaml --intervals 20

    # Same, with debug logs of the state and the store bridge
    RUST_LOG=waypoint_balancer=debug,waypoint_discovery=debug \
        waypoint simulate -c waypoint-cli/config/sim.yaml
"#;

/// Outcome of the calls a service issued during one interval
#[derive(Debug, Default)]
struct Tally {
    selected: BTreeMap<String, usize>,
    dropped: usize,
    unavailable: usize,
}

/// Answers quarantine probes the way the probed host behaves in the current interval.
#[derive(Debug)]
struct SimulatedProbe {
    profiles: HashMap<String, EndpointProfile>,
    interval: AtomicUsize,
}

impl SimulatedProbe {
    fn new(endpoints: &[EndpointProfile]) -> Self {
        SimulatedProbe {
            profiles: endpoints
                .iter()
                .map(|endpoint| (endpoint.uri.clone(), endpoint.clone()))
                .collect(),
            interval: AtomicUsize::new(1),
        }
    }
}

#[async_trait]
impl HealthProbe for SimulatedProbe {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let Some(profile) = self.profiles.get(endpoint.uri()) else {
            return ProbeOutcome::Unknown;
        };
        let (latency, error_rate) = profile.behavior(self.interval.load(Ordering::Relaxed));
        if rand::random::<f64>() < error_rate {
            ProbeOutcome::Unhealthy
        } else {
            ProbeOutcome::Healthy { latency }
        }
    }
}

pub async fn handle_simulate(args: Simulate) -> Result<()> {
    let content = read_to_string(Path::new(&args.config_file))
        .context(format!("Failed to read {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&content)?;
    let config: SimulationConfig = load_config.try_into()?;

    let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new().await?);
    publish_topology(store.as_ref(), &config).await?;

    let probe = Arc::new(SimulatedProbe::new(&config.endpoints));
    let state = LoadBalancerState::with_probe(config.state.clone(), probe.clone())?;
    state.subscribe(Arc::new(MetricsListener));
    let (executor, _executor_task) = StateExecutor::start(state.clone());
    let discovery =
        DiscoveryService::start(Arc::clone(&store), executor, config.discovery.clone()).await?;

    let mut announcers = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        let announcer = Announcer::announce(
            Arc::clone(&store),
            &endpoint.cluster,
            &endpoint.node,
            endpoint.announcement(),
            &config.discovery,
        )
        .await?;
        announcers.push(announcer);
    }
    wait_for_endpoints(&state, &config).await;

    let profiles: HashMap<&str, &EndpointProfile> = config
        .endpoints
        .iter()
        .map(|endpoint| (endpoint.uri.as_str(), endpoint))
        .collect();

    info!(
        intervals = args.intervals,
        interval_ms = config.interval.as_millis() as u64,
        services = config.services.len(),
        endpoints = config.endpoints.len(),
        "simulation started"
    );
    for interval in 1..=args.intervals {
        probe.interval.store(interval, Ordering::Relaxed);
        let mut tallies = BTreeMap::new();
        for service in &config.services {
            let tally = drive_calls(
                &state,
                &service.service_name,
                &profiles,
                interval,
                config.calls_per_interval,
            )?;
            tallies.insert(service.service_name.clone(), tally);
        }
        sleep(config.interval).await;
        print_interval(&state, interval, config.calls_per_interval, &tallies)?;
    }

    for announcer in announcers {
        announcer.withdraw().await?;
    }
    discovery.stop();
    state.shutdown().await;
    info!(version = state.version(), "simulation finished");
    Ok(())
}

async fn publish_topology(store: &dyn MetadataStore, config: &SimulationConfig) -> Result<()> {
    for cluster in &config.clusters {
        let path = StoreKey::Cluster(cluster.cluster_name.clone()).path();
        store
            .put(&path, serde_json::to_value(cluster)?)
            .await?;
    }
    for service in &config.services {
        let path = StoreKey::Service(service.service_name.clone()).path();
        store
            .put(&path, serde_json::to_value(service)?)
            .await?;
    }
    Ok(())
}

/// Gives the bridge a moment to pick up every announcement before traffic starts.
async fn wait_for_endpoints(state: &LoadBalancerState, config: &SimulationConfig) {
    let expected = |cluster: &str| {
        config
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.cluster == cluster)
            .count()
    };
    for _ in 0..100 {
        let ready = config
            .clusters
            .iter()
            .all(|c| state.endpoints(&c.cluster_name).len() >= expected(&c.cluster_name));
        if ready {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    warn!("not every announced endpoint reached the state, starting anyway");
}

fn drive_calls(
    state: &LoadBalancerState,
    service: &str,
    profiles: &HashMap<&str, &EndpointProfile>,
    interval: usize,
    calls: usize,
) -> Result<Tally> {
    let mut tally = Tally::default();
    for _ in 0..calls {
        let key = format!("key-{}", rand::random::<u32>());
        let endpoint = match state.get_endpoint(service, Route::Key(&key), None) {
            Ok(endpoint) => endpoint,
            Err(BalancerError::CallDropped { .. }) => {
                tally.dropped += 1;
                continue;
            }
            Err(e) if e.is_routing_outcome() => {
                tally.unavailable += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        *tally.selected.entry(endpoint.uri().to_string()).or_default() += 1;
        if let Some(profile) = profiles.get(endpoint.uri()) {
            let (latency, error_rate) = profile.behavior(interval);
            let outcome = if rand::random::<f64>() < error_rate {
                Err(ErrorType::ServerError)
            } else {
                Ok(())
            };
            endpoint.tracker().record(latency, outcome);
        }
    }
    Ok(tally)
}

fn print_interval(
    state: &LoadBalancerState,
    interval: usize,
    calls: usize,
    tallies: &BTreeMap<String, Tally>,
) -> Result<()> {
    println!("== interval {} (state version {}) ==", interval, state.version());
    for (service, tally) in tallies {
        println!(
            "service {}: {} calls, {} dropped, {} without endpoint",
            service, calls, tally.dropped, tally.unavailable
        );
        for partition_id in state.partition_ids(service)? {
            let Some(partition) = state.get_partition_state(service, partition_id)? else {
                continue;
            };
            println!(
                "  partition {} override drop rate {:.2}",
                partition_id,
                partition.override_drop_rate()
            );
            println!(
                "  {:<32} {:>7} {:>7} {:>6} {:<12}",
                "endpoint", "share", "points", "score", "status"
            );
            for (uri, health) in partition.health() {
                let selected = tally.selected.get(uri).copied().unwrap_or(0);
                let share = if calls == 0 {
                    0.0
                } else {
                    selected as f64 * 100.0 / calls as f64
                };
                println!(
                    "  {:<32} {:>6.1}% {:>7} {:>6.2} {:<12}",
                    uri, share, health.points, health.score, health.status.to_string()
                );
            }
        }
    }
    Ok(())
}
