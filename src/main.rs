use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use admission::AdmissionCoordinator;
use api::ApiState;
use config::Config;
use store::RouteStore;
use topic::{bootstrap, consumer::TopicConsumer, mirror::MirrorNodeClient, ConsensusLog};

mod admission;
mod api;
mod config;
mod crypto;
mod metrics;
mod routes;
mod store;
mod topic;

/// How long in-flight admission may keep running after a stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse_from_cli()?;
    let store = Arc::new(RouteStore::open(&config.store_path)?);

    let log: Arc<dyn ConsensusLog> = Arc::new(MirrorNodeClient::new(
        &config.mirror_url,
        config.submit_url.as_ref(),
    )?);

    // Without a provable first message (the public key) the relay must not
    // start consuming, so every bootstrap failure is fatal.
    let topic = match bootstrap::ensure_topic(log.as_ref(), &store, config.topic_id.clone()).await {
        Ok(topic) => topic,
        Err(err) => {
            tracing::error!(%err, "topic bootstrap failed");
            std::process::exit(1);
        }
    };

    metrics::run_metrics_server(config.metrics_port)?;

    let api_state = ApiState {
        store: store.clone(),
        network: config.network.clone(),
        account_id: config.account_id.clone(),
        topic_id: topic.clone(),
        client_initialized: true,
    };
    tokio::spawn(api::serve(api_state, config.status_port));

    let admission = Arc::new(AdmissionCoordinator::new(store.clone())?);
    let consumer = TopicConsumer::new(log, store, admission, topic, config.poll_interval);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut consumer_task = tokio::spawn(consumer.run(stop_rx));

    tokio::select! {
        result = &mut consumer_task => {
            // the consumer only returns early on a fatal store failure
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(%err, "topic consumer failed");
                    std::process::exit(1);
                }
                Err(err) => {
                    tracing::error!(%err, "topic consumer panicked");
                    std::process::exit(1);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, draining in-flight admission");
            let _ = stop_tx.send(true);
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut consumer_task).await {
                Ok(_) => tracing::info!("consumer drained"),
                Err(_) => {
                    // abandoned admission is re-run after restart; commits
                    // are pure overwrites so that is safe
                    tracing::warn!("drain window elapsed, abandoning in-flight admission");
                    consumer_task.abort();
                }
            }
        }
    }

    Ok(())
}
