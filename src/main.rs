//! Park Analytics Demo
//!
//! Runs a simulated park against the local channel, then a three-participant
//! replicated session, and checks that the replicas agree.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use park_analytics::{
    actions::{ActionExecuteEvent, HookRegistry, LocalActionChannel, Participant, Sequencer, LOAD_OR_QUIT_ACTION},
    analytics::{
        event::{EventContext, NetworkMode, ScenarioInfo},
        metadata::{HostMetadata, HostState, SimulatedHost, StaticMetadata},
        Analytics, InitOptions, TrackProps,
    },
    core::hash::short_hex,
    storage::{JsonFileStore, KeyValueStore, MemoryStore},
    AnalyticsConfig, VERSION,
};

/// Plugin name reported by the demo.
const DEMO_PLUGIN: &str = "park-analytics-demo";

/// Days simulated in the local demo.
const DEMO_DAYS: u64 = 60;

/// Ticks per in-game day.
const TICKS_PER_DAY: u64 = 400;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AnalyticsConfig::from_env();

    let level = if config.enable_debug_logging || cfg!(feature = "debug-tracing") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    info!("Park Analytics v{}", VERSION);
    info!(
        "Actions: {} / {}",
        config.analytics_event_enqueue_key, config.analytics_flush_and_save_key
    );
    info!("Flush threshold: {}", config.flush_threshold);

    demo_park(&config)?;
    demo_replicated_session(&config).await?;
    Ok(())
}

/// Single player park on the local channel.
fn demo_park(config: &AnalyticsConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Park ===");

    let shared: Arc<dyn KeyValueStore> = match &config.store_path {
        Some(path) => {
            info!("Shared store: {}", path.display());
            Arc::new(JsonFileStore::new(path))
        }
        None => Arc::new(MemoryStore::new()),
    };
    let park_storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let host = Arc::new(SimulatedHost::new(HostState::default()));
    host.load_scenario(ScenarioInfo {
        file_name: "Forest Frontiers.SC6".to_string(),
        scenario_name: "Forest Frontiers".to_string(),
        name: "Demo Park".to_string(),
    });

    let metadata = HostMetadata::new(
        host.clone(),
        park_storage,
        config.park_id_key.clone(),
        config.plugin_version.clone(),
    );
    let hooks = HookRegistry::new();
    let analytics = Analytics::new(config, Arc::new(LocalActionChannel::new()), Arc::new(metadata), shared)?;
    analytics.init(
        &hooks,
        InitOptions::new(DEMO_PLUGIN)
            .with_debug_logging(config.enable_debug_logging)
            .with_track_callback(|event| debug!("Stored {} ({})", event.name(), event.message_id)),
    )?;

    let mut guests: u32 = 0;
    for day in 0..DEMO_DAYS {
        host.advance_ticks(TICKS_PER_DAY);
        guests += (day as u32 * 7) % 23;

        if day % 5 == 0 {
            analytics.track(
                TrackProps::named("ride_built")
                    .with("ride", format!("coaster_{}", day / 5))
                    .with("cost", 1200 + day * 150),
            );
        }
        if day % 3 == 0 {
            analytics.track(TrackProps::named("guest_count").with("guests", guests));
        }
        if day % 11 == 0 {
            analytics.track("park_rating_checked");
        }
    }

    info!("Queued before quit: {} ({:?})", analytics.queue_len(), analytics.state());
    hooks.emit(&ActionExecuteEvent::new(LOAD_OR_QUIT_ACTION));

    info!("=== Park Results ===");
    for (name, events) in analytics.store().load()? {
        info!("{}: {} events", name, events.len());
    }
    info!("Total stored: {}", analytics.store().total_events()?);
    info!("Queue after quit: {}", analytics.queue_len());
    info!("Store digest: {}", short_hex(&analytics.store().digest()?));

    Ok(())
}

/// Three participants tracking concurrently through one sequencer.
async fn demo_replicated_session(config: &AnalyticsConfig) -> anyhow::Result<()> {
    info!("=== Starting Replicated Session ===");

    let sequencer = Sequencer::new();
    let shutdown = sequencer.shutdown_handle();
    let participants: Vec<Participant> = (0..3).map(|id| sequencer.join(id)).collect();
    let hooks = HookRegistry::new();

    let mut replicas = Vec::with_capacity(participants.len());
    for participant in &participants {
        let mut context = EventContext::default();
        context.network.network_mode = if participant.id() == 0 {
            NetworkMode::Server
        } else {
            NetworkMode::Client
        };

        let analytics = Analytics::new(
            config,
            Arc::new(participant.clone()),
            Arc::new(StaticMetadata::new(context)),
            Arc::new(MemoryStore::new()),
        )?;
        analytics.init(&hooks, InitOptions::new(DEMO_PLUGIN).with_flush_threshold(8.0))?;
        replicas.push(analytics);
    }

    let sequencer_loop = tokio::spawn(sequencer.run());
    let replica_loops: Vec<_> = participants
        .iter()
        .map(|p| tokio::spawn(p.clone().run(shutdown.subscribe())))
        .collect();

    for i in 0..45u32 {
        let who = (i as usize * 7) % replicas.len();
        replicas[who].track(
            TrackProps::named(format!("action_{}", i % 4)).with("participant", who as u64),
        );
        if i % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }
    hooks.emit(&ActionExecuteEvent::new(LOAD_OR_QUIT_ACTION));

    tokio::time::timeout(Duration::from_secs(10), settle(&participants))
        .await
        .context("Replicas did not settle")?;

    shutdown.send(()).context("Shutdown signal not delivered")?;
    sequencer_loop.await??;
    for handle in replica_loops {
        handle.await??;
    }

    info!("=== Verifying Replicas ===");
    let queue_digest = replicas[0].digest();
    let store_digest = replicas[0].store().digest()?;
    for (participant, replica) in participants.iter().zip(&replicas) {
        info!(
            "Participant {}: seq {}, queue {} [{}], stored {} [{}]",
            participant.id(),
            participant.applied_seq(),
            replica.queue_len(),
            short_hex(&replica.digest()),
            replica.store().total_events()?,
            short_hex(&replica.store().digest()?),
        );
    }

    let mut consistent = true;
    for replica in &replicas[1..] {
        consistent &= replica.digest() == queue_digest && replica.store().digest()? == store_digest;
    }

    if consistent {
        info!("REPLICAS CONSISTENT: digests match!");
        Ok(())
    } else {
        bail!("REPLICA DIVERGENCE: digests differ")
    }
}

/// Wait until every submission has been applied everywhere.
async fn settle(participants: &[Participant]) {
    loop {
        let idle = participants.iter().all(|p| p.pending_results() == 0);
        let seq = participants[0].applied_seq();
        let aligned = participants.iter().all(|p| p.applied_seq() == seq);
        if idle && aligned {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
