//! Worker lifecycle: registration, heartbeat, graceful shutdown
//!
//! The worker is the authoritative source of truth for its own
//! registration: a heartbeat answered with not-found means the broker lost
//! its state (restart), and the worker simply registers again. Registration
//! failures at startup are logged but not fatal; the RPC surface reports
//! errors naturally on use.

use crate::config::WorkerConfig;
use crate::domain_types::AgentId;
use crate::worker::client::{BrokerClient, ClientError};
use crate::worker::processor::Processor;
use crate::worker::sampling::SamplingProvider;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A running worker: heartbeat ticker plus optional autonomous loop
pub struct WorkerRuntime {
    config: WorkerConfig,
    client: BrokerClient,
    processor: Arc<Processor>,
    shutdown: CancellationToken,
    heartbeat_task: JoinHandle<()>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerRuntime {
    /// Registers with the broker and starts the background tickers.
    pub async fn start(config: WorkerConfig, sampler: Arc<dyn SamplingProvider>) -> Self {
        let client = BrokerClient::new(config.broker_url.clone(), config.fetch_timeout);

        match register_once(&client, &config).await {
            Ok(total) => info!(agent = %config.agent_id, total, "registered with broker"),
            Err(err) => warn!(error = %err, "initial registration failed, continuing"),
        }

        let shutdown = CancellationToken::new();
        let processor = Arc::new(Processor::new(
            client.clone(),
            config.agent_id.clone(),
            sampler,
        ));
        let heartbeat_task = spawn_heartbeat(client.clone(), config.clone(), shutdown.clone());
        let poll_task = if config.auto_process {
            Some(
                processor
                    .clone()
                    .spawn(config.poll_interval.as_duration(), shutdown.clone()),
            )
        } else {
            None
        };

        Self {
            config,
            client,
            processor,
            shutdown,
            heartbeat_task,
            poll_task: Mutex::new(poll_task),
        }
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.config.agent_id
    }

    /// Toggles autonomous processing; the tool surface calls this.
    ///
    /// Enabling restarts the poll ticker if it is not running (for example
    /// after a capability-driven self-disable).
    pub fn set_autonomous(&self, enabled: bool) {
        if enabled {
            self.processor.enable();
            let mut poll = self.poll_task.lock().expect("poll task lock poisoned");
            let running = poll.as_ref().is_some_and(|task| !task.is_finished());
            if !running {
                *poll = Some(
                    self.processor
                        .clone()
                        .spawn(self.config.poll_interval.as_duration(), self.shutdown.clone()),
                );
            }
        } else {
            self.processor.disable("autonomous mode disabled by the host");
        }
    }

    /// Graceful shutdown: stop tickers, drain in-flight processing, mark
    /// the agent offline, deregister. Every broker call is best-effort.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        drain_processing(&self.processor, self.config.shutdown_drain).await;

        let status_key = format!("{}-status", self.config.agent_id);
        if let Err(err) = self
            .client
            .set_context(
                &status_key,
                serde_json::Value::String("offline".to_string()),
                self.config.agent_id.as_str(),
            )
            .await
        {
            warn!(error = %err, "offline status update failed");
        }

        if let Err(err) = self
            .client
            .deregister(&self.config.agent_id, self.config.deregister_timeout)
            .await
        {
            warn!(error = %err, "deregister failed");
        }

        let _ = self.heartbeat_task.await;
        if let Some(task) = self.poll_task.lock().expect("poll task lock poisoned").take() {
            let _ = task.await;
        }
        info!(agent = %self.config.agent_id, "worker stopped");
    }
}

/// Waits up to `limit` for an in-flight processing pass to finish.
async fn drain_processing(processor: &Processor, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while processor.is_processing() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if processor.is_processing() {
        warn!("shutdown drain expired with processing still in flight");
    }
}

async fn register_once(client: &BrokerClient, config: &WorkerConfig) -> Result<usize, ClientError> {
    client
        .register(
            &config.agent_id,
            config.agent_name.as_str(),
            &config.project,
            &config.path,
        )
        .await
        .map(|ack| ack.total_agents)
}

/// One heartbeat, re-registering when the broker reports us unknown.
pub async fn heartbeat_once(client: &BrokerClient, config: &WorkerConfig) {
    match client.heartbeat(&config.agent_id).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            warn!(agent = %config.agent_id, "broker lost our registration, re-registering");
            if let Err(err) = register_once(client, config).await {
                warn!(error = %err, "re-registration failed");
            }
        }
        Err(err) => warn!(error = %err, "heartbeat failed"),
    }
}

fn spawn_heartbeat(
    client: BrokerClient,
    config: WorkerConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.heartbeat_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Registration just happened; skip the interval's immediate tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => heartbeat_once(&client, &config).await,
            }
        }
    })
}
