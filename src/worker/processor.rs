//! Autonomous message processing loop
//!
//! Polls the worker's queue, delegates each unread message to the host's
//! sampling capability, replies to the sender, and acknowledges the message.
//! Three rules keep the loop safe:
//!
//! - single-flight: the `processing` flag is claimed atomically at tick
//!   entry, before the first await, so overlapping ticks bail immediately;
//! - poison protection: a message is acknowledged after every processing
//!   attempt, successful or not, so a message whose processing always fails
//!   cannot block the queue forever;
//! - capability loss is the only self-disablement trigger: when the host
//!   reports sampling as unsupported the loop stops mid-batch, without
//!   acking or answering the in-flight message.

use crate::broker::state::Message;
use crate::domain_types::{AgentId, MessageType};
use crate::worker::client::BrokerClient;
use crate::worker::sampling::{SampleReply, SampleRequest, SamplingProvider};
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many unread messages one tick processes at most.
const POLL_BATCH_LIMIT: usize = 10;

/// Status value written between tasks and after a RESET.
const IDLE_STATUS: &str = "idle";

/// Reply sent for a RESET command.
const RESET_ACK_REPLY: &str = "RESET ACK | nenhuma tarefa ativa no momento";

/// Reason recorded when the capability probe comes back negative.
const NO_CAPABILITY_REASON: &str = "client did not advertise sampling capability";

/// Introspection snapshot for the autonomous-mode toggle tool
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
    pub enabled: bool,
    pub processing: bool,
    pub disable_reason: Option<String>,
}

/// The worker's autonomous processor
pub struct Processor {
    client: BrokerClient,
    sampler: Arc<dyn SamplingProvider>,
    agent_id: AgentId,
    enabled: AtomicBool,
    processing: AtomicBool,
    disable_reason: Mutex<Option<String>>,
    ticker_stop: Mutex<CancellationToken>,
}

impl Processor {
    pub fn new(client: BrokerClient, agent_id: AgentId, sampler: Arc<dyn SamplingProvider>) -> Self {
        Self {
            client,
            sampler,
            agent_id,
            enabled: AtomicBool::new(true),
            processing: AtomicBool::new(false),
            disable_reason: Mutex::new(None),
            ticker_stop: Mutex::new(CancellationToken::new()),
        }
    }

    /// Spawns the poll ticker. Cancelling `shutdown` or disabling the
    /// processor stops it.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let stop = CancellationToken::new();
        *self
            .ticker_stop
            .lock()
            .expect("processor ticker lock poisoned") = stop.clone();

        let processor = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => processor.tick().await,
                }
            }
            debug!("autonomous poll ticker stopped");
        })
    }

    /// One poll pass. Safe to call concurrently: only one pass runs at a
    /// time, extra callers return immediately.
    pub async fn tick(&self) {
        // Claim the single-flight guard before the first suspension point;
        // an overlapping tick must observe it already set.
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.process_batch().await;
        self.processing.store(false, Ordering::SeqCst);
    }

    async fn process_batch(&self) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        if !self.sampler.supports_sampling().await {
            self.disable(NO_CAPABILITY_REASON);
            return;
        }

        let batch = match self.client.read(&self.agent_id, true, POLL_BATCH_LIMIT).await {
            Ok(batch) => batch,
            Err(err) => {
                // Broker unreachable or queue gone; the next tick retries.
                warn!(error = %err, "message poll failed");
                return;
            }
        };

        for message in batch.messages {
            if is_reset(&message.content) {
                self.handle_reset(&message).await;
                continue;
            }

            self.set_status(&busy_status(&message.content)).await;
            let outcome = self.sampler.sample(SampleRequest::for_message(&message)).await;
            match outcome {
                Ok(SampleReply::Text(text)) => {
                    self.reply(&message, &text, message.kind.reply_type()).await;
                }
                Ok(SampleReply::Other { kind }) => {
                    let stub =
                        format!("Resposta gerada com tipo de conteúdo não suportado: {kind}");
                    self.reply(&message, &stub, MessageType::Text).await;
                }
                Err(err) if err.is_capability_missing() => {
                    // The capability is gone: a reply would also fail, and
                    // the message stays unread for a re-enabled loop.
                    self.disable(err.message);
                    break;
                }
                Err(err) => {
                    self.reply(&message, &format!("ERROR: {}", err.message), MessageType::Text)
                        .await;
                }
            }
            self.set_status(IDLE_STATUS).await;
            self.ack(&message).await;
        }
    }

    async fn handle_reset(&self, message: &Message) {
        info!(from = %message.from, "reset requested");
        self.set_status(IDLE_STATUS).await;
        if message.repliable_by(&self.agent_id) {
            self.reply(message, RESET_ACK_REPLY, MessageType::Text).await;
        }
        self.ack(message).await;
    }

    async fn reply(&self, message: &Message, content: &str, kind: MessageType) {
        if !message.repliable_by(&self.agent_id) {
            return;
        }
        if let Err(err) = self
            .client
            .send(self.agent_id.as_str(), &message.from, content, kind)
            .await
        {
            warn!(to = %message.from, error = %err, "reply failed");
        }
    }

    async fn ack(&self, message: &Message) {
        if let Err(err) = self
            .client
            .ack(&self.agent_id, std::slice::from_ref(&message.id))
            .await
        {
            warn!(message = %message.id, error = %err, "ack failed");
        }
    }

    async fn set_status(&self, status: &str) {
        let key = format!("{}-status", self.agent_id);
        if let Err(err) = self
            .client
            .set_context(
                &key,
                serde_json::Value::String(status.to_string()),
                self.agent_id.as_str(),
            )
            .await
        {
            debug!(error = %err, "status update failed");
        }
    }

    /// Re-arms the processor after a manual disable. The caller is
    /// responsible for restarting the poll ticker.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        *self
            .disable_reason
            .lock()
            .expect("processor reason lock poisoned") = None;
    }

    /// Disables autonomous processing and stops the poll ticker.
    pub fn disable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.enabled.store(false, Ordering::SeqCst);
        *self
            .disable_reason
            .lock()
            .expect("processor reason lock poisoned") = Some(reason.clone());
        self.ticker_stop
            .lock()
            .expect("processor ticker lock poisoned")
            .cancel();
        warn!(reason = %reason, "autonomous mode disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus {
            enabled: self.is_enabled(),
            processing: self.is_processing(),
            disable_reason: self
                .disable_reason
                .lock()
                .expect("processor reason lock poisoned")
                .clone(),
        }
    }
}

/// Matches the RESET command: `RESET` followed by whitespace or a colon.
fn is_reset(content: &str) -> bool {
    content
        .strip_prefix("RESET")
        .is_some_and(|rest| rest.chars().next().is_some_and(|c| c.is_whitespace() || c == ':'))
}

/// Builds the busy status line for the task being processed.
fn busy_status(content: &str) -> String {
    let summary: String = content.chars().take(60).collect();
    format!(
        "busy | task: {} | início: {}",
        summary,
        Local::now().format("%H:%M:%S")
    )
}
