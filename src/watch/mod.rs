//! Live, replayable watch layer over the cluster-event bus subject space.

use std::collections::{HashMap, VecDeque};

use async_nats::jetstream::{self, consumer::DeliverPolicy};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::types::ClusterEventRecord;

/// Whitelisted field-selector keys.
pub const ALLOWED_FIELDS: &[&str] = &[
    "metadata.name",
    "metadata.namespace",
    "involvedObject.kind",
    "involvedObject.namespace",
    "involvedObject.name",
    "involvedObject.uid",
    "reason",
    "type",
    "source.component",
    "source.host",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldSelectorError {
    #[error("unknown field selector key '{0}'")]
    UnknownField(String),
    #[error("malformed field selector term '{0}'")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorTerm {
    pub field: String,
    pub op: SelectorOp,
    pub value: String,
}

/// Parse a Kubernetes-style field selector `k1=v1,k2!=v2`.
pub fn parse_field_selector(selector: &str) -> Result<Vec<SelectorTerm>, FieldSelectorError> {
    if selector.trim().is_empty() {
        return Ok(Vec::new());
    }
    selector
        .split(',')
        .map(|term| {
            let term = term.trim();
            let (field, op, value) = if let Some((f, v)) = term.split_once("!=") {
                (f, SelectorOp::Ne, v)
            } else if let Some((f, v)) = term.split_once('=') {
                (f, SelectorOp::Eq, v)
            } else {
                return Err(FieldSelectorError::Malformed(term.to_string()));
            };
            let field = field.trim();
            if !ALLOWED_FIELDS.contains(&field) {
                return Err(FieldSelectorError::UnknownField(field.to_string()));
            }
            Ok(SelectorTerm {
                field: field.to_string(),
                op,
                value: value.trim().to_string(),
            })
        })
        .collect()
}

fn field_value(event: &ClusterEventRecord, field: &str) -> Option<String> {
    match field {
        "metadata.name" => Some(event.regarding.name.clone()),
        "metadata.namespace" => event.regarding.namespace.clone(),
        "involvedObject.kind" => Some(event.regarding.kind.clone()),
        "involvedObject.namespace" => event.regarding.namespace.clone(),
        "involvedObject.name" => Some(event.regarding.name.clone()),
        "involvedObject.uid" => event.regarding.uid.clone(),
        "reason" => Some(event.reason.clone()),
        "type" => Some(match event.event_type {
            crate::types::EventType::Normal => "Normal".to_string(),
            crate::types::EventType::Warning => "Warning".to_string(),
        }),
        "source.component" => event.reporting_controller.clone(),
        "source.host" => None,
        _ => None,
    }
}

pub fn matches_selector(event: &ClusterEventRecord, terms: &[SelectorTerm]) -> bool {
    terms.iter().all(|t| {
        let actual = field_value(event, &t.field).unwrap_or_default();
        match t.op {
            SelectorOp::Eq => actual == t.value,
            SelectorOp::Ne => actual != t.value,
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub resource_version: u64,
    pub object: ClusterEventRecord,
}

const BUFFER_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum WatchOpenError {
    #[error("failed to open event stream: {0}")]
    Stream(String),
    #[error("failed to create watch consumer: {0}")]
    Consumer(String),
}

/// Open a replayable watch. `resource_version` resumes from that bus
/// sequence number; 0 starts from the current tail.
pub async fn watch(
    jetstream: jetstream::Context,
    stream_name: &str,
    resource_version: u64,
    selector: Vec<SelectorTerm>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<WatchEvent>, WatchOpenError> {
    let stream = jetstream
        .get_stream(stream_name)
        .await
        .map_err(|e| WatchOpenError::Stream(e.to_string()))?;

    let deliver_policy = if resource_version > 0 {
        DeliverPolicy::ByStartSequence {
            start_sequence: resource_version,
        }
    } else {
        DeliverPolicy::New
    };

    let consumer = stream
        .create_consumer(jetstream::consumer::pull::Config {
            deliver_policy,
            ..Default::default()
        })
        .await
        .map_err(|e| WatchOpenError::Consumer(e.to_string()))?;

    let (tx, rx) = mpsc::channel(BUFFER_SIZE);

    tokio::spawn(async move {
        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "watch consumer failed to open message stream");
                return;
            }
        };

        // Ring buffer so a slow consumer loses the oldest events first, not
        // the newest: `tx` alone can only refuse the newest arrival.
        let mut buffer: VecDeque<WatchEvent> = VecDeque::with_capacity(BUFFER_SIZE);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_msg = messages.next() => {
                    let Some(Ok(msg)) = maybe_msg else { break };
                    let Ok(event) = serde_json::from_slice::<ClusterEventRecord>(&msg.payload) else {
                        let _ = msg.ack().await;
                        continue;
                    };
                    if !matches_selector(&event, &selector) {
                        let _ = msg.ack().await;
                        continue;
                    }
                    let seq = msg.info().map(|i| i.stream_sequence).unwrap_or(0);
                    let watch_event = WatchEvent {
                        event_type: WatchEventType::Added,
                        resource_version: seq,
                        object: event,
                    };

                    if buffer.len() >= BUFFER_SIZE {
                        buffer.pop_front();
                        warn!("watch buffer full, dropping oldest event");
                    }
                    buffer.push_back(watch_event);

                    while let Some(ev) = buffer.pop_front() {
                        match tx.try_send(ev) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(ev)) => {
                                buffer.push_front(ev);
                                break;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }

                    let _ = msg.ack().await;
                }
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equality_and_inequality_terms() {
        let terms = parse_field_selector("reason=Scaled,type!=Warning").unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].op, SelectorOp::Eq);
        assert_eq!(terms[1].op, SelectorOp::Ne);
    }

    #[test]
    fn rejects_unknown_field() {
        let err = parse_field_selector("bogus=1").unwrap_err();
        assert_eq!(err, FieldSelectorError::UnknownField("bogus".into()));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let terms = parse_field_selector("").unwrap();
        assert!(terms.is_empty());
    }

    #[test]
    fn matches_selector_applies_all_terms() {
        use crate::types::{EventObjectRef, EventType, ScopeType, TenantRef};
        let event = ClusterEventRecord {
            uid: "u1".into(),
            event_time: chrono::Utc::now(),
            series_count: None,
            regarding: EventObjectRef {
                kind: "Pod".into(),
                name: "p1".into(),
                ..Default::default()
            },
            reason: "Scaled".into(),
            event_type: EventType::Normal,
            note: "".into(),
            reporting_controller: None,
            tenant: TenantRef {
                scope_type: ScopeType::Project,
                name: "p1".into(),
            },
        };
        let terms = parse_field_selector("reason=Scaled").unwrap();
        assert!(matches_selector(&event, &terms));
        let terms2 = parse_field_selector("reason=Other").unwrap();
        assert!(!matches_selector(&event, &terms2));
    }
}
