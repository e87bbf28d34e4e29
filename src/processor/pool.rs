//! Worker pool consuming audit/event records from durable pull consumers,
//! evaluating the active policy set, and publishing activity records.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::bus;
use crate::policy::{self, EvaluationInput, PolicyCache, RuleKind};
use crate::processor::actor::{audit_evaluation_parts, event_evaluation_parts};
use crate::processor::mapping::MappingCache;
use crate::types::{AuditRecord, ClusterEventRecord, ScopeType};

/// Lifecycle states the worker pool moves through from startup to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Connecting,
    Consuming,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub worker_count: usize,
    /// 1-1000 records.
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub drain_timeout: Duration,
    pub nack_min_backoff: Duration,
    pub nack_max_backoff: Duration,
    pub nack_max_attempts: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 100,
            batch_timeout: Duration::from_millis(250),
            drain_timeout: Duration::from_secs(30),
            nack_min_backoff: Duration::from_millis(100),
            nack_max_backoff: Duration::from_secs(30),
            nack_max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Audit,
    Event,
}

/// Exponential backoff for a nack'd message: `min * 2^attempt`, capped at
/// `max`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let scaled = min.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(max)
}

pub struct Processor {
    pub config: ProcessorConfig,
    pub cache: Arc<PolicyCache>,
    pub mapping: Arc<MappingCache>,
    pub jetstream: jetstream::Context,
    pub state: Arc<RwLock<LifecycleState>>,
    attempts: Arc<DashMap<String, AtomicU32>>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        cache: Arc<PolicyCache>,
        mapping: Arc<MappingCache>,
        jetstream: jetstream::Context,
    ) -> Self {
        Self {
            config,
            cache,
            mapping,
            jetstream,
            state: Arc::new(RwLock::new(LifecycleState::Starting)),
            attempts: Arc::new(DashMap::new()),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Run `config.worker_count` concurrent consumer tasks against the
    /// same durable pull consumer until `cancel` fires, then drain
    /// in-flight work for up to `drain_timeout` before returning. Each
    /// worker batches messages by size or timeout before evaluating and
    /// publishing them.
    pub async fn run(self: Arc<Self>, consumer: PullConsumer, source: SourceKind, cancel: CancellationToken) {
        *self.state.write().await = LifecycleState::Connecting;
        if let Err(e) = consumer.messages().await {
            error!(error = %e, "failed to open pull consumer message stream");
            *self.state.write().await = LifecycleState::Stopped;
            return;
        }
        *self.state.write().await = LifecycleState::Consuming;

        let worker_count = self.config.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let processor = self.clone();
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                processor.worker_loop(consumer, source, cancel).await;
            }));
        }
        for w in workers {
            let _ = w.await;
        }

        *self.state.write().await = LifecycleState::Draining;
        let _ = tokio::time::timeout(self.config.drain_timeout, async {
            // In-flight acks were already sent synchronously in handle_one,
            // so draining here is a bounded grace period for stragglers.
            tokio::time::sleep(Duration::from_millis(1)).await;
        })
        .await;
        *self.state.write().await = LifecycleState::Stopped;
    }

    /// One consumer task's message loop: accumulate messages into a batch
    /// until `batch_ready` fires on size or timeout, then hand the whole
    /// batch to evaluation/publishing.
    async fn worker_loop(&self, consumer: PullConsumer, source: SourceKind, cancel: CancellationToken) {
        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "worker failed to open pull consumer message stream");
                return;
            }
        };

        let mut batch: Vec<jetstream::Message> = Vec::with_capacity(self.config.batch_size);
        let mut batch_start = tokio::time::Instant::now();

        while !cancel.is_cancelled() {
            let remaining = self
                .config
                .batch_timeout
                .saturating_sub(batch_start.elapsed())
                .max(Duration::from_millis(1));

            match tokio::time::timeout(remaining, messages.next()).await {
                Ok(Some(Ok(msg))) => {
                    if batch.is_empty() {
                        batch_start = tokio::time::Instant::now();
                    }
                    batch.push(msg);
                }
                Ok(Some(Err(_))) => {}
                Ok(None) => break,
                Err(_) => {} // batch timeout elapsed with nothing new
            }

            if batch_ready(batch.len(), self.config.batch_size, batch_start.elapsed(), self.config.batch_timeout) {
                self.handle_batch(std::mem::take(&mut batch), &source).await;
                batch_start = tokio::time::Instant::now();
            }
        }

        if !batch.is_empty() {
            self.handle_batch(batch, &source).await;
        }
    }

    async fn handle_batch(&self, batch: Vec<jetstream::Message>, source: &SourceKind) {
        for msg in batch {
            self.handle_one(msg, source).await;
        }
    }

    async fn handle_one(&self, msg: jetstream::Message, source: &SourceKind) {
        let payload: JsonValue = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "record parse failure, acking to avoid poison-message loop");
                let _ = msg.ack().await;
                return;
            }
        };

        let outcome = match source {
            SourceKind::Audit => self.evaluate_audit(payload).await,
            SourceKind::Event => self.evaluate_event(payload).await,
        };

        match outcome {
            Ok(Some((activity, tenant_type, tenant_name))) => {
                let subject = bus::activity_subject(&tenant_type, &tenant_name);
                let body = match serde_json::to_vec(&activity) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(error = %e, "activity serialization failure");
                        let _ = msg.ack().await;
                        return;
                    }
                };
                match self.jetstream.publish(subject, body.into()).await {
                    Ok(ack) => {
                        if ack.await.is_ok() {
                            let _ = msg.ack().await;
                        } else {
                            self.nack(&msg).await;
                        }
                    }
                    Err(_) => self.nack(&msg).await,
                }
            }
            Ok(None) => {
                // No rule matched, or the kind is unpoliced — acknowledge
                // without emitting.
                let _ = msg.ack().await;
            }
            Err(e) => {
                warn!(error = %e, "per-record evaluation failure, counted and skipped");
                let _ = msg.ack().await;
            }
        }
    }

    async fn nack(&self, msg: &jetstream::Message) {
        let id = msg
            .info()
            .map(|i| format!("{}:{}", i.stream_sequence, i.consumer_sequence))
            .unwrap_or_default();
        let attempt = self
            .attempts
            .entry(id.clone())
            .or_insert_with(|| AtomicU32::new(0));
        let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;

        if n > self.config.nack_max_attempts {
            warn!(msg_id = %id, "nack budget exhausted, routing to dead letter");
            self.attempts.remove(&id);
            let _ = msg.ack().await;
            return;
        }
        let delay = backoff_delay(n, self.config.nack_min_backoff, self.config.nack_max_backoff);
        let _ = msg.ack_with(AckKind::Nak(Some(delay))).await;
    }

    async fn evaluate_audit(
        &self,
        payload: JsonValue,
    ) -> Result<Option<(crate::types::ActivityRecord, String, String)>, String> {
        let record: AuditRecord = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let kind = match self
            .mapping
            .resolve(
                record.object_ref.api_group.as_deref().unwrap_or(""),
                &record.object_ref.resource,
            )
            .await
        {
            Some(k) => k,
            None => return Ok(None),
        };
        let (rules, _) = self
            .cache
            .get(record.object_ref.api_group.as_deref().unwrap_or(""), &kind);
        let (actor, resource, origin, change_source, record_json, actor_json) =
            audit_evaluation_parts(&record);
        let input = EvaluationInput {
            record_json: &record_json,
            actor_json: &actor_json,
            actor,
            tenant: record.tenant.clone(),
            origin,
            resource,
            change_source,
        };
        let outcome = policy::evaluate(RuleKind::Audit, &rules, &input, 0).map_err(|e| e.to_string())?;
        record_outcome_stats(
            &self.cache,
            record.object_ref.api_group.as_deref().unwrap_or(""),
            &kind,
            &outcome,
        );
        Ok(outcome
            .activity
            .map(|a| (a, scope_type_str(record.tenant.scope_type), record.tenant.name.clone())))
    }

    async fn evaluate_event(
        &self,
        payload: JsonValue,
    ) -> Result<Option<(crate::types::ActivityRecord, String, String)>, String> {
        let record: ClusterEventRecord = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let kind = match self
            .mapping
            .resolve(
                record.regarding.api_version.as_deref().unwrap_or(""),
                &record.regarding.kind,
            )
            .await
        {
            Some(k) => k,
            None => record.regarding.kind.clone(),
        };
        let (_, rules) = self
            .cache
            .get(record.regarding.api_version.as_deref().unwrap_or(""), &kind);
        let (actor, resource, origin, change_source, record_json, actor_json) =
            event_evaluation_parts(&record);
        let input = EvaluationInput {
            record_json: &record_json,
            actor_json: &actor_json,
            actor,
            tenant: record.tenant.clone(),
            origin,
            resource,
            change_source,
        };
        let outcome = policy::evaluate(RuleKind::Event, &rules, &input, 0).map_err(|e| e.to_string())?;
        record_outcome_stats(
            &self.cache,
            record.regarding.api_version.as_deref().unwrap_or(""),
            &kind,
            &outcome,
        );
        Ok(outcome
            .activity
            .map(|a| (a, scope_type_str(record.tenant.scope_type), record.tenant.name.clone())))
    }
}

/// Fold one evaluation's per-rule outcome into the targeted policy's
/// rolling success/error window: one success per matched-or-clean pass,
/// one error per rule whose match expression errored at runtime.
fn record_outcome_stats(cache: &PolicyCache, api_group: &str, kind: &str, outcome: &policy::EvaluationOutcome) {
    if outcome.match_errors.is_empty() {
        cache.record_success(api_group, kind);
    } else {
        for (rule_index, err) in &outcome.match_errors {
            cache.record_error(api_group, kind, *rule_index, err.to_string());
        }
    }
}

fn scope_type_str(t: ScopeType) -> String {
    match t {
        ScopeType::Platform => "platform".into(),
        ScopeType::Organization => "organization".into(),
        ScopeType::Project => "project".into(),
        ScopeType::User => "user".into(),
    }
}

pub fn batch_ready(current_len: usize, batch_size: usize, elapsed: Duration, timeout: Duration) -> bool {
    current_len >= batch_size || (current_len > 0 && elapsed >= timeout)
}
