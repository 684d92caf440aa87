//! Acknowledgement parsing and per-correlation aggregation.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, hash_map::Entry},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::{
    error::{ClientError, ErrorCategory},
    protocol::Envelope,
};

/// Status used for labels still missing when collection times out.
pub const REQUEST_TIMEOUT_STATUS: u16 = 408;
/// Combined status of a mixed set of acknowledgements.
pub const FAILED_DEPENDENCY_STATUS: u16 = 424;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Acknowledgement {
    pub label: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Acknowledgement {
    pub fn new(label: impl Into<String>, status: u16, payload: Option<Value>) -> Self {
        Self {
            label: label.into(),
            status,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Every acknowledgement collected for one correlation id, ordered by label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Acknowledgements {
    pub correlation_id: String,
    pub entries: Vec<Acknowledgement>,
}

impl Acknowledgements {
    pub fn new(correlation_id: impl Into<String>, mut entries: Vec<Acknowledgement>) -> Self {
        entries.sort_by(|a, b| a.label.cmp(&b.label));
        Self {
            correlation_id: correlation_id.into(),
            entries,
        }
    }

    pub fn is_success(&self) -> bool {
        self.entries.iter().all(Acknowledgement::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Acknowledgement> {
        self.entries.iter().filter(|ack| !ack.is_success())
    }

    pub fn get(&self, label: &str) -> Option<&Acknowledgement> {
        self.entries.iter().find(|ack| ack.label == label)
    }

    /// Shared status when every entry agrees, 424 otherwise.
    pub fn combined_status(&self) -> Option<u16> {
        let first = self.entries.first()?.status;
        if self.entries.iter().all(|ack| ack.status == first) {
            Some(first)
        } else {
            Some(FAILED_DEPENDENCY_STATUS)
        }
    }
}

/// Acknowledgements carried by an `.../acks/{label}` or batched `.../acks`
/// envelope. `None` for any other envelope.
pub fn acknowledgements_from_envelope(envelope: &Envelope) -> Option<Vec<Acknowledgement>> {
    if !envelope.is_acknowledgement() {
        return None;
    }
    match envelope.topic.split('/').nth(5).filter(|label| !label.is_empty()) {
        Some(label) => Some(vec![Acknowledgement::new(
            label,
            envelope.status.unwrap_or(200),
            envelope.value.clone(),
        )]),
        None => {
            let entries = envelope
                .value
                .as_ref()
                .and_then(Value::as_object)
                .map(|labels| {
                    labels
                        .iter()
                        .map(|(label, body)| {
                            let status = body
                                .get("status")
                                .and_then(Value::as_u64)
                                .and_then(|status| u16::try_from(status).ok())
                                .unwrap_or(200);
                            Acknowledgement::new(label.clone(), status, body.get("payload").cloned())
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(entries)
        }
    }
}

pub type AckHandler = Arc<dyn Fn(Acknowledgement) + Send + Sync>;

pub type AckCompletion = oneshot::Receiver<Result<Acknowledgements, ClientError>>;

/// One acknowledgement owed to a per-label handler.
pub struct AckDelivery {
    correlation_id: String,
    handler: AckHandler,
    ack: Acknowledgement,
}

impl AckDelivery {
    pub fn label(&self) -> &str {
        &self.ack.label
    }

    /// Call the handler. Panics are logged, not propagated.
    pub fn run(self) {
        let Self {
            correlation_id,
            handler,
            ack,
        } = self;
        if catch_unwind(AssertUnwindSafe(|| handler(ack))).is_err() {
            error!(correlation_id = %correlation_id, "acknowledgement handler panicked");
        }
    }
}

enum PendingAcks {
    Aggregate {
        expected: BTreeSet<String>,
        received: BTreeMap<String, Acknowledgement>,
        completion: oneshot::Sender<Result<Acknowledgements, ClientError>>,
    },
    PerLabel {
        expected: BTreeSet<String>,
        delivered: BTreeSet<String>,
        handler: AckHandler,
    },
}

/// Collects acknowledgements per correlation id. Each correlation id is
/// registered in exactly one mode.
#[derive(Default)]
pub struct AcknowledgementAggregator {
    pending: Mutex<HashMap<String, PendingAcks>>,
}

impl AcknowledgementAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate mode: the completion resolves once every label arrived.
    pub fn expect_all<I, S>(
        &self,
        correlation_id: &str,
        labels: I,
    ) -> Result<AckCompletion, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected = expected_labels(labels)?;
        let (tx, rx) = oneshot::channel();
        self.insert(
            correlation_id,
            PendingAcks::Aggregate {
                expected,
                received: BTreeMap::new(),
                completion: tx,
            },
        )?;
        Ok(rx)
    }

    /// Per-label mode: `handler` sees each expected label at most once.
    pub fn expect_each<I, S>(
        &self,
        correlation_id: &str,
        labels: I,
        handler: AckHandler,
    ) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected = expected_labels(labels)?;
        self.insert(
            correlation_id,
            PendingAcks::PerLabel {
                expected,
                delivered: BTreeSet::new(),
                handler,
            },
        )
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Feed received acknowledgements. Returns `None` when the correlation id
    /// is not tracked here, otherwise the per-label handler calls still owed,
    /// which the caller runs.
    pub fn accept(
        &self,
        correlation_id: &str,
        acks: Vec<Acknowledgement>,
    ) -> Option<Vec<AckDelivery>> {
        let (settled, deliveries) = {
            let mut pending = self.lock();
            let set = pending.get_mut(correlation_id)?;
            let (complete, deliveries) = match set {
                PendingAcks::Aggregate {
                    expected, received, ..
                } => {
                    for ack in acks {
                        if !expected.contains(&ack.label) {
                            debug!(correlation_id, label = %ack.label, "ignoring unrequested acknowledgement");
                            continue;
                        }
                        received.entry(ack.label.clone()).or_insert(ack);
                    }
                    let complete = expected.iter().all(|label| received.contains_key(label));
                    (complete, Vec::new())
                }
                PendingAcks::PerLabel {
                    expected,
                    delivered,
                    handler,
                } => {
                    let fresh: Vec<_> = acks
                        .into_iter()
                        .filter(|ack| {
                            expected.contains(&ack.label) && delivered.insert(ack.label.clone())
                        })
                        .map(|ack| AckDelivery {
                            correlation_id: correlation_id.to_owned(),
                            handler: Arc::clone(handler),
                            ack,
                        })
                        .collect();
                    (delivered.len() == expected.len(), fresh)
                }
            };
            let settled = if complete {
                pending.remove(correlation_id)
            } else {
                None
            };
            (settled, deliveries)
        };

        if let Some(PendingAcks::Aggregate {
            received,
            completion,
            ..
        }) = settled
        {
            let collected = Acknowledgements::new(correlation_id, received.into_values().collect());
            let outcome = if collected.is_success() {
                Ok(collected)
            } else {
                Err(ClientError::acknowledgements_failed(collected))
            };
            let _ = completion.send(outcome);
        }
        Some(deliveries)
    }

    /// Give up waiting. Aggregate sets are completed with 408 entries for
    /// every missing label. Returns whether anything was still pending.
    pub fn expire(&self, correlation_id: &str, waited: Duration) -> bool {
        let Some(removed) = self.lock().remove(correlation_id) else {
            return false;
        };
        match removed {
            PendingAcks::Aggregate {
                expected,
                mut received,
                completion,
            } => {
                for label in &expected {
                    received.entry(label.clone()).or_insert_with(|| {
                        Acknowledgement::new(label.clone(), REQUEST_TIMEOUT_STATUS, None)
                    });
                }
                warn!(correlation_id, "acknowledgements timed out");
                let collected = Acknowledgements::new(correlation_id, received.into_values().collect());
                let _ = completion.send(Err(ClientError::acknowledgement_timeout(collected, waited)));
            }
            PendingAcks::PerLabel {
                expected, delivered, ..
            } => {
                let missing: Vec<_> = expected.difference(&delivered).cloned().collect();
                warn!(correlation_id, ?missing, "per-label acknowledgements timed out");
            }
        }
        true
    }

    /// Resolve an aggregate set with `err`, e.g. when the backend rejected the
    /// command itself. Per-label sets are dropped.
    pub fn fail(&self, correlation_id: &str, err: ClientError) -> bool {
        let Some(removed) = self.lock().remove(correlation_id) else {
            return false;
        };
        if let PendingAcks::Aggregate { completion, .. } = removed {
            let _ = completion.send(Err(err));
        }
        true
    }

    /// Drop a set without resolving it, e.g. when transmission failed.
    pub fn discard(&self, correlation_id: &str) -> bool {
        self.lock().remove(correlation_id).is_some()
    }

    /// Fail every aggregate set with `reason`.
    pub fn abandon_all(&self, reason: &ClientError) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (correlation_id, pending) in drained {
            trace!(correlation_id = %correlation_id, "abandoning acknowledgements");
            if let PendingAcks::Aggregate { completion, .. } = pending {
                let _ = completion.send(Err(reason.clone()));
            }
        }
    }

    fn insert(&self, correlation_id: &str, set: PendingAcks) -> Result<(), ClientError> {
        match self.lock().entry(correlation_id.to_owned()) {
            Entry::Occupied(_) => Err(ClientError::duplicate_registration(correlation_id)),
            Entry::Vacant(slot) => {
                slot.insert(set);
                Ok(())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingAcks>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn expected_labels<I, S>(labels: I) -> Result<BTreeSet<String>, ClientError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let expected: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
    if expected.is_empty() {
        return Err(ClientError::new(
            ErrorCategory::Config,
            "no_requested_acknowledgements",
            "at least one acknowledgement label must be requested",
        ));
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;
    use crate::error::{ACKNOWLEDGEMENT_TIMEOUT, ACKNOWLEDGEMENTS_FAILED, DUPLICATE_REGISTRATION};

    fn ack(label: &str, status: u16) -> Acknowledgement {
        Acknowledgement::new(label, status, None)
    }

    #[tokio::test]
    async fn mixed_statuses_fail_with_every_entry() {
        let aggregator = AcknowledgementAggregator::new();
        let completion = aggregator
            .expect_all("c-1", ["A", "B"])
            .expect("registration should work");

        assert!(aggregator.accept("c-1", vec![ack("B", 403)]).is_some());
        assert!(aggregator.is_pending("c-1"));
        assert!(aggregator.accept("c-1", vec![ack("A", 200)]).is_some());

        let err = completion
            .await
            .expect("completion should resolve")
            .expect_err("forbidden label should fail the set");
        assert_eq!(err.code, ACKNOWLEDGEMENTS_FAILED);
        assert_eq!(err.status, Some(FAILED_DEPENDENCY_STATUS));
        let acks = err.acknowledgements.expect("aggregate carries entries");
        assert_eq!(acks.entries, vec![ack("A", 200), ack("B", 403)]);
        assert!(!aggregator.is_pending("c-1"));
    }

    #[tokio::test]
    async fn all_successful_statuses_complete_with_success() {
        let aggregator = AcknowledgementAggregator::new();
        let completion = aggregator
            .expect_all("c-2", ["A", "B"])
            .expect("registration should work");

        aggregator.accept("c-2", vec![ack("A", 200), ack("B", 204)]);

        let acks = completion
            .await
            .expect("completion should resolve")
            .expect("set should succeed");
        assert!(acks.is_success());
        assert_eq!(acks.entries.len(), 2);
    }

    #[tokio::test]
    async fn first_acknowledgement_per_label_wins() {
        let aggregator = AcknowledgementAggregator::new();
        let completion = aggregator
            .expect_all("c-3", ["A", "B"])
            .expect("registration should work");

        aggregator.accept("c-3", vec![ack("A", 200), ack("A", 500), ack("X", 500)]);
        aggregator.accept("c-3", vec![ack("B", 201)]);

        let acks = completion
            .await
            .expect("completion should resolve")
            .expect("set should succeed");
        assert_eq!(acks.get("A"), Some(&ack("A", 200)));
        assert_eq!(acks.get("X"), None);
    }

    #[tokio::test]
    async fn timeout_fills_missing_labels_with_408() {
        let aggregator = AcknowledgementAggregator::new();
        let completion = aggregator
            .expect_all("c-4", ["A", "B"])
            .expect("registration should work");
        aggregator.accept("c-4", vec![ack("A", 200)]);

        assert!(aggregator.expire("c-4", Duration::from_secs(10)));
        assert!(!aggregator.expire("c-4", Duration::from_secs(10)));

        let err = completion
            .await
            .expect("completion should resolve")
            .expect_err("timeout should fail the set");
        assert_eq!(err.code, ACKNOWLEDGEMENT_TIMEOUT);
        let acks = err.acknowledgements.expect("timeout carries entries");
        assert_eq!(acks.entries, vec![ack("A", 200), ack("B", REQUEST_TIMEOUT_STATUS)]);
    }

    #[test]
    fn per_label_mode_delivers_each_label_once() {
        let aggregator = AcknowledgementAggregator::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        aggregator
            .expect_each(
                "c-5",
                ["A", "B"],
                Arc::new(move |ack: Acknowledgement| {
                    sink.lock().expect("lock").push(ack.label);
                }),
            )
            .expect("registration should work");

        let first = aggregator
            .accept("c-5", vec![ack("A", 200), ack("A", 200)])
            .expect("c-5 is tracked");
        assert_eq!(first.len(), 1);
        assert!(seen.lock().expect("lock").is_empty(), "accept never calls handlers");

        let second = aggregator
            .accept("c-5", vec![ack("B", 500)])
            .expect("c-5 is tracked");
        assert!(aggregator.accept("c-5", vec![ack("B", 500)]).is_none());

        for delivery in first.into_iter().chain(second) {
            delivery.run();
        }
        assert_eq!(*seen.lock().expect("lock"), ["A", "B"]);
    }

    #[test]
    fn rejects_second_registration_for_same_correlation() {
        let aggregator = AcknowledgementAggregator::new();
        let _completion = aggregator
            .expect_all("c-6", ["A"])
            .expect("registration should work");

        let err = aggregator
            .expect_each("c-6", ["A"], Arc::new(|_: Acknowledgement| {}))
            .expect_err("one mode per correlation id");
        assert_eq!(err.code, DUPLICATE_REGISTRATION);
    }

    #[test]
    fn rejects_empty_label_sets() {
        let aggregator = AcknowledgementAggregator::new();
        let labels: [&str; 0] = [];
        assert!(aggregator.expect_all("c-7", labels).is_err());
    }

    #[test]
    fn unknown_correlation_ids_are_not_claimed() {
        let aggregator = AcknowledgementAggregator::new();
        assert!(aggregator.accept("nobody", vec![ack("A", 200)]).is_none());
    }

    #[test]
    fn parses_single_and_batched_envelopes() {
        let single = Envelope::new("org.acme/lamp/things/twin/acks/custom", "/")
            .with_status(409)
            .with_value(json!({"reason": "conflict"}));
        assert_eq!(
            acknowledgements_from_envelope(&single),
            Some(vec![Acknowledgement::new(
                "custom",
                409,
                Some(json!({"reason": "conflict"}))
            )])
        );

        let batch = Envelope::new("org.acme/lamp/things/twin/acks", "/").with_value(json!({
            "twin-persisted": {"status": 204},
            "custom": {"status": 400, "payload": "bad"}
        }));
        let mut parsed = acknowledgements_from_envelope(&batch).expect("batch should parse");
        parsed.sort_by(|a, b| a.label.cmp(&b.label));
        assert_eq!(
            parsed,
            vec![
                Acknowledgement::new("custom", 400, Some(json!("bad"))),
                Acknowledgement::new("twin-persisted", 204, None),
            ]
        );

        let event = Envelope::new("org.acme/lamp/things/twin/events/modified", "/");
        assert_eq!(acknowledgements_from_envelope(&event), None);
    }

    #[tokio::test]
    async fn abandon_fails_every_aggregate() {
        let aggregator = AcknowledgementAggregator::new();
        let completion = aggregator
            .expect_all("c-8", ["A"])
            .expect("registration should work");

        aggregator.abandon_all(&ClientError::session_closed());

        let err = completion
            .await
            .expect("completion should resolve")
            .expect_err("abandoned set fails");
        assert_eq!(err.code, crate::error::SESSION_CLOSED);
        assert_eq!(aggregator.pending_count(), 0);
    }
}
