//! Soak test for slot change notification.
//!
//! A producer thread sends change messages for random slots of a demo source while the main task flushes every channel
//! on a timer. At the end of the run, the number of slots that transitioned from clean to dirty must match the number
//! of slots delivered to listeners, for every sender and channel.
#![deny(warnings)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering::Acquire, Ordering::Release},
        Arc,
    },
    thread,
    time::Instant,
};

use anyhow::{anyhow, bail, ensure, Context as _};
use rand::{rngs::SmallRng, Rng as _, SeedableRng as _};
use slotcast_app::prelude::*;
use slotcast_config::{ConfigurationLoader, GenericConfiguration};
use slotcast_dispatch::{DispatchRoot, DispatchSelector, DispatchType, DispatchTypeContainer, GenericError, HashedPath};
use tokio::{pin, select};
use tracing::{debug, error, info, warn};

mod config;
use self::config::SoakConfiguration;

mod source;
use self::source::{totals, DeliveryCounter, DemoSource, SOURCE_ID};

#[tokio::main]
async fn main() {
    let configuration = match load_configuration() {
        Ok(configuration) => configuration,
        Err(e) => {
            fatal_and_exit(format!("failed to load configuration: {}", e));
            return;
        }
    };

    let logging_config = match LoggingConfiguration::from_configuration(&configuration) {
        Ok(logging_config) => logging_config,
        Err(e) => {
            fatal_and_exit(format!("failed to load logging configuration: {:#}", e));
            return;
        }
    };

    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(&configuration).await {
        Ok(()) => info!("Soak run passed."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration() -> Result<GenericConfiguration, GenericError> {
    let configuration = ConfigurationLoader::default()
        .try_from_yaml("./slotcast.yaml")
        .from_environment("SLOTCAST")?
        .into_generic();

    Ok(configuration)
}

async fn run(configuration: &GenericConfiguration) -> Result<(), GenericError> {
    let config: SoakConfiguration = configuration
        .as_typed()
        .context("Failed to load soak configuration.")?;
    ensure!(config.num_slots > 0, "Number of slots must be greater than zero.");

    let root = DispatchRoot::new();
    let source = Arc::new(DemoSource::new(&root, config.num_slots));
    let counter = Arc::new(DeliveryCounter::new(source.senders().len(), config.num_slots));
    for sender in source.senders() {
        for channel in DispatchType::ALL {
            sender.listener_queue(channel).add(&counter);
        }
    }

    for sender in source.senders() {
        let path = HashedPath::new(SOURCE_ID, sender.id().clone(), DispatchSelector::Any);
        let routed = source
            .route(&path)
            .with_context(|| format!("No sender found for path '{}'.", path))?;
        debug!(%path, sender_index = routed.index(), "Routed path to sender.");
    }

    info!(
        num_slots = config.num_slots,
        senders = source.senders().len(),
        duration_secs = config.duration().as_secs(),
        seed = config.seed,
        "Starting soak run."
    );

    let started = Instant::now();
    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let source = Arc::clone(&source);
        let config = config.clone();
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("slotcast-producer".to_string())
            .spawn(move || run_producer(&source, &config, &stop))
            .context("Failed to spawn producer thread.")?
    };

    let mut flush_interval = tokio::time::interval(config.flush_interval());
    let deadline = tokio::time::sleep(config.duration());
    pin!(deadline);

    let mut flushes = 0u64;
    loop {
        select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                warn!("Shutdown signal received. Stopping early...");
                break;
            }
            _ = flush_interval.tick() => {
                if source.flush_all() {
                    flushes += 1;
                }
            }
        }
    }

    stop.store(true, Release);
    let marked = tokio::task::spawn_blocking(move || producer.join())
        .await
        .context("Failed to wait for producer thread.")?
        .map_err(|_| anyhow!("Producer thread panicked."))?;

    // Whatever the producer sent after our last tick is still pending.
    source.flush_all();
    let delivered = counter.snapshot();
    source.shutdown();

    let mut mismatches = 0;
    for (sender, (marked, delivered)) in source.senders().iter().zip(marked.iter().zip(&delivered)) {
        for ((channel, marked), (_, delivered)) in totals(marked).into_iter().zip(totals(delivered)) {
            if marked == delivered {
                debug!(sender_id = %sender.id(), channel = channel.as_str(), marked, "Sender channel verified.");
            } else {
                error!(
                    sender_id = %sender.id(),
                    channel = channel.as_str(),
                    marked,
                    delivered,
                    "Delivered slot count does not match marked slot count."
                );
                mismatches += 1;
            }
        }
    }

    info!(
        elapsed_ms = started.elapsed().as_millis(),
        flushes,
        marked = marked.iter().flat_map(totals).map(|(_, count)| count).sum::<u64>(),
        "Soak run finished."
    );

    if mismatches > 0 {
        bail!("{} sender channel(s) lost or duplicated slot changes.", mismatches);
    }

    Ok(())
}

fn run_producer(source: &DemoSource, config: &SoakConfiguration, stop: &AtomicBool) -> Vec<DispatchTypeContainer<u64>> {
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let mut marked = vec![DispatchTypeContainer::<u64>::default(); source.senders().len()];
    let interval = config.producer_interval();

    while !stop.load(Acquire) {
        let sender_index = rng.random_range(0..source.senders().len());
        let slot_index = rng.random_range(0..config.num_slots);
        let channel = if rng.random_bool(0.5) {
            DispatchType::Immediate
        } else {
            DispatchType::Deferred
        };

        if source.senders()[sender_index].send_change_message(slot_index, channel) {
            *marked[sender_index].get_mut(channel) += 1;
        }

        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    marked
}
