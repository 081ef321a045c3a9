//! Frame dispatch and the submission pipeline.
//!
//! All inbound frames funnel through one channel into `handle_frame`,
//! processed by a single task. That serializes the rate-limit check,
//! the quota-checked append, the trim, and the fan-out for each
//! submission, so two frames from the same identity can never
//! interleave inside the pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use relay_core::{ChatMessage, ClientCommand, RejectKind, RelayLimits, ServerEvent, SubmitError};
use relay_store::{AppendOutcome, MessageRepo, VoteRepo};
use relay_telemetry::MetricsRecorder;

use crate::client::{ClientId, ClientRegistry};
use crate::limiter::CooldownTracker;

pub struct Coordinator {
    registry: Arc<ClientRegistry>,
    messages: MessageRepo,
    votes: VoteRepo,
    cooldowns: CooldownTracker,
    limits: RelayLimits,
    metrics: Arc<MetricsRecorder>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<ClientRegistry>,
        messages: MessageRepo,
        votes: VoteRepo,
        limits: RelayLimits,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            registry,
            messages,
            votes,
            cooldowns: CooldownTracker::new(limits.cooldown),
            limits,
            metrics,
        }
    }

    pub fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    /// Admit a freshly registered connection: queue its history snapshot,
    /// then open it up for broadcasts. Ordering matters; a client made
    /// ready first could see a broadcast duplicated by its snapshot.
    pub fn admit(&self, client_id: &ClientId) {
        self.send_snapshot(client_id);
        self.registry.mark_ready(client_id);
        self.metrics.gauge_add("connections.active", &[], 1);
        info!(client_id = %client_id, "client admitted");
    }

    /// Tear down a connection. The identity's cooldown survives as long
    /// as it still has another live connection.
    pub fn handle_disconnect(&self, client_id: &ClientId) {
        let Some(identity) = self.registry.identity_of(client_id) else {
            return;
        };
        self.registry.unregister(client_id);
        self.metrics.gauge_add("connections.active", &[], -1);
        if self.registry.identity_connections(&identity) == 0 {
            self.cooldowns.forget(&identity);
        }
        info!(client_id = %client_id, identity, "client disconnected");
    }

    /// Disconnect clients that stopped answering pings. Goes through the
    /// normal teardown path, so the connection gauge and cooldown state
    /// track sweep removals the same as clean closes.
    pub fn sweep_dead_clients(&self, timeout: Duration) -> usize {
        let stale = self.registry.stale_clients(timeout);
        for client_id in &stale {
            info!(client_id = %client_id, "removing unresponsive client");
            self.handle_disconnect(client_id);
        }
        stale.len()
    }

    /// Dispatch one inbound frame from an admitted connection.
    #[instrument(skip(self, raw), fields(client_id = %client_id))]
    pub fn handle_frame(&self, client_id: &ClientId, raw: &str) {
        let Some(identity) = self.registry.identity_of(client_id) else {
            // Raced with a disconnect; nothing to reply to.
            return;
        };

        let command: ClientCommand = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "unparseable frame");
                self.send_error(
                    client_id,
                    ServerEvent::error(RejectKind::InvalidFrame, "unrecognized frame"),
                );
                return;
            }
        };

        match command {
            ClientCommand::Hello { .. } => {
                self.send_error(
                    client_id,
                    ServerEvent::error(RejectKind::InvalidFrame, "connection already admitted"),
                );
            }
            ClientCommand::SubmitMessage { text } => {
                match self.submit(&identity, &text) {
                    Ok(message) => {
                        let delivered = self
                            .registry
                            .broadcast(&ServerEvent::MessageBroadcast { message }.to_json());
                        self.metrics.counter_inc("messages.accepted", &[], 1);
                        self.metrics
                            .counter_inc("broadcast.deliveries", &[], delivered as u64);
                    }
                    Err(err) => {
                        self.metrics.counter_inc(
                            "messages.rejected",
                            &[("reason", err.error_kind())],
                            1,
                        );
                        debug!(identity, reason = err.error_kind(), "submission rejected");
                        self.send_error(
                            client_id,
                            ServerEvent::SubmissionError {
                                kind: err.reject_kind(),
                                detail: err.to_string(),
                                retry_in_ms: err.retry_in_ms(),
                            },
                        );
                    }
                }
            }
            ClientCommand::RequestHistory => self.send_snapshot(client_id),
            ClientCommand::Vote { message_id, kind } => {
                self.cast_vote(client_id, &identity, message_id, kind);
            }
        }
    }

    /// The submission pipeline: validate, rate-limit, quota-checked
    /// append, trim. Broadcasting is the caller's job so rejected
    /// submissions never reach other clients.
    pub fn submit(&self, identity: &str, text: &str) -> Result<ChatMessage, SubmitError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::Empty);
        }

        let remaining = self.cooldowns.remaining(identity);
        if remaining > Duration::ZERO {
            return Err(SubmitError::Cooldown { remaining });
        }

        let outcome = self
            .messages
            .append_with_quota(identity, text, &self.limits)
            .map_err(|err| SubmitError::Persistence(err.to_string()))?;

        let message = match outcome {
            AppendOutcome::Appended(message) => message,
            AppendOutcome::QuotaExceeded { count } => {
                return Err(SubmitError::QuotaExceeded { count })
            }
        };

        // Cooldown starts only on acceptance; a rejected attempt must
        // not push the identity's window out.
        self.cooldowns.record(identity);

        // The append succeeded and is being announced either way; a trim
        // failure leaves the log temporarily over-bound, which the next
        // successful trim repairs.
        if let Err(err) = self.messages.trim_to_total(self.limits.max_total_messages) {
            warn!(error = %err, "history trim failed");
        }

        Ok(message)
    }

    fn cast_vote(
        &self,
        client_id: &ClientId,
        identity: &str,
        message_id: i64,
        kind: relay_core::VoteKind,
    ) {
        match self.votes.cast(message_id, identity, kind) {
            Ok(counts) => {
                self.metrics.counter_inc("votes.cast", &[], 1);
                self.registry.broadcast(
                    &ServerEvent::VoteCountsUpdated {
                        message_id: counts.message_id,
                        approve_count: counts.approve_count,
                        disapprove_count: counts.disapprove_count,
                    }
                    .to_json(),
                );
            }
            Err(relay_store::StoreError::NotFound(_)) => {
                self.send_error(
                    client_id,
                    ServerEvent::error(
                        RejectKind::InvalidFrame,
                        format!("no message with id {message_id}"),
                    ),
                );
            }
            Err(err) => {
                warn!(error = %err, message_id, "vote failed");
                self.send_error(
                    client_id,
                    ServerEvent::error(RejectKind::InternalError, "vote not recorded"),
                );
            }
        }
    }

    fn send_snapshot(&self, client_id: &ClientId) {
        let messages = match self.messages.read_recent(self.limits.max_total_messages) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "history read failed");
                self.send_error(
                    client_id,
                    ServerEvent::error(RejectKind::InternalError, "history unavailable"),
                );
                return;
            }
        };
        self.registry
            .send_to(client_id, ServerEvent::HistorySnapshot { messages }.to_json());
    }

    fn send_error(&self, client_id: &ClientId, event: ServerEvent) {
        self.registry.send_to(client_id, event.to_json());
    }
}
