//! The correlation gate: per-request state machine deciding whether a status
//! change may be applied now or has to wait.
//!
//! ```text
//!                 creation delivery
//!  Uncorrelated ─────────────────────▶ Correlated ──┐ duplicate delivery
//!   │  ▲                                  ▲         │ (preserve or refresh)
//!   │  │ status change: defer             └─────────┘
//!   └──┘
//! ```
//!
//! A status change for a correlated request is still deferred while the
//! request has a backlog, so it cannot overtake earlier deferred changes.
//! The exception is a replayed copy whose queue position is ahead of the
//! current head: it left the queue before everything still in it, so it is
//! applied.
//!
//! Every transition holds the request's lock from the first read to the last
//! write, including the replay that follows correlation.

use crate::config::CorrelationPolicy;
use crate::error::{FailSafeError, Result};
use crate::key_lock::KeyedLocks;
use crate::metrics::{GateMetrics, ReplayMetrics};
use crate::replay::{ReplayReport, ReplayScheduler};
use failsafe_core::message::{DeferredEvent, StatusChangeMessage};
use failsafe_core::pending::{
    NewPendingEvent, Ordinal, PendingEvent, PendingEventKey, PendingEventStore,
};
use failsafe_core::registry::RequestRegistry;
use failsafe_core::request::{CorrelationId, GateState, Request, RequestId, RequestStatus};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a creation/retry delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// The id was unseen: the request was created already correlated.
    Registered,
    /// A known, uncorrelated request was correlated and its queue replayed.
    Correlated {
        /// What the replay did.
        replay: ReplayReport,
    },
    /// The request was already correlated; nothing changed.
    Duplicate,
    /// The request was already correlated and its id was replaced.
    Refreshed,
}

/// Result of a status-change delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusChangeOutcome {
    /// The status was written.
    Applied {
        /// Status before the change.
        previous: RequestStatus,
        /// Status after the change.
        current: RequestStatus,
    },
    /// The change was parked at the back of the request's queue.
    Deferred {
        /// Position it was given.
        ordinal: Ordinal,
    },
    /// A replayed copy of a change that is still queued; the queued one wins.
    AlreadyQueued {
        /// Position of the queued original.
        ordinal: Ordinal,
    },
}

/// What to do with one status change.
enum Admission {
    Apply,
    Defer,
    AlreadyQueued(Ordinal),
}

/// Serializes and decides every transition of every request.
pub struct CorrelationGate {
    registry: Arc<dyn RequestRegistry>,
    pending: Arc<dyn PendingEventStore>,
    replay: ReplayScheduler,
    locks: KeyedLocks<RequestId>,
    policy: CorrelationPolicy,
    status_change_topic: String,
}

impl CorrelationGate {
    /// Create a gate.
    #[must_use]
    pub fn new(
        registry: Arc<dyn RequestRegistry>,
        pending: Arc<dyn PendingEventStore>,
        replay: ReplayScheduler,
        policy: CorrelationPolicy,
        status_change_topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pending,
            replay,
            locks: KeyedLocks::new(),
            policy,
            status_change_topic: status_change_topic.into(),
        }
    }

    /// Handle a "request created or retried" delivery carrying a correlation id.
    ///
    /// # Errors
    ///
    /// Returns `FailSafeError::Persistence` if the registry or the pending
    /// store fails. A failed replay publish is not an error; see
    /// [`ReplayReport::halted`].
    pub async fn on_request_created_or_retried(
        &self,
        id: RequestId,
        correlation_id: CorrelationId,
    ) -> Result<CorrelationOutcome> {
        let _guard = self.locks.lock(id).await;

        let upserted = self.registry.upsert_on_create_or_retry(id).await?;
        if upserted.inserted {
            self.registry.set_correlation(id, correlation_id.clone()).await?;
            GateMetrics::record_created();
            GateMetrics::record_correlated();
            info!(request_id = %id, correlation_id = %correlation_id, "Registered correlated request");
            return Ok(CorrelationOutcome::Registered);
        }

        match upserted.request.correlation_id {
            None => {
                self.registry.set_correlation(id, correlation_id.clone()).await?;
                GateMetrics::record_correlated();
                info!(request_id = %id, correlation_id = %correlation_id, "Gate opened");

                let replay = self.replay.replay(id).await?;
                Ok(CorrelationOutcome::Correlated { replay })
            },
            Some(current) => {
                if self.policy == CorrelationPolicy::OverwriteLatest && current != correlation_id {
                    self.registry.set_correlation(id, correlation_id.clone()).await?;
                    info!(
                        request_id = %id,
                        previous = %current,
                        correlation_id = %correlation_id,
                        "Correlation id refreshed"
                    );
                    return Ok(CorrelationOutcome::Refreshed);
                }
                debug!(request_id = %id, correlation_id = %current, "Duplicate creation delivery");
                Ok(CorrelationOutcome::Duplicate)
            },
        }
    }

    /// Record a request as seen without correlating it.
    ///
    /// Returns `true` if this call created the row. Another instance sharing
    /// the registry may have created it first, in which case `false`.
    ///
    /// # Errors
    ///
    /// Returns `FailSafeError::Persistence` if the registry fails.
    pub async fn register_uncorrelated(&self, id: RequestId) -> Result<bool> {
        let _guard = self.locks.lock(id).await;

        if !self.registry.upsert_on_create_or_retry(id).await?.inserted {
            return Ok(false);
        }
        GateMetrics::record_created();
        info!(request_id = %id, "Registered uncorrelated request");
        Ok(true)
    }

    /// Handle a "status change requested" delivery.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: the id was never created; nothing is written
    /// - `Deserialization`: the change could not be encoded for the queue
    /// - `OrdinalCollision` / `Persistence`: the storage layer failed
    pub async fn on_status_change_requested(
        &self,
        change: StatusChangeMessage,
    ) -> Result<StatusChangeOutcome> {
        let id = change.id;
        let _guard = self.locks.lock(id).await;

        let request = self
            .registry
            .get(id)
            .await?
            .ok_or(FailSafeError::UnknownRequest(id))?;

        match self.admit(&request, change.replayed_from).await? {
            Admission::Apply => {},
            Admission::AlreadyQueued(ordinal) => {
                info!(
                    request_id = %id,
                    ordinal = %ordinal,
                    "Replayed copy dropped, the original is still queued"
                );
                return Ok(StatusChangeOutcome::AlreadyQueued { ordinal });
            },
            Admission::Defer => {
                let new_status = change.new_status;
                let deferred = DeferredEvent::StatusChange(StatusChangeMessage {
                    replayed_from: None,
                    ..change
                });
                let parked = self
                    .pending
                    .enqueue(NewPendingEvent::from_deferred(
                        &deferred,
                        self.status_change_topic.as_str(),
                    )?)
                    .await?;
                GateMetrics::record_deferred();
                info!(
                    request_id = %id,
                    ordinal = %parked.ordinal,
                    new_status = %new_status,
                    gate = ?request.gate_state(),
                    "Status change deferred"
                );
                return Ok(StatusChangeOutcome::Deferred {
                    ordinal: parked.ordinal,
                });
            },
        }

        self.registry.set_status(id, change.new_status).await?;
        GateMetrics::record_applied();
        info!(
            request_id = %id,
            previous = %request.status,
            current = %change.new_status,
            "Status change applied"
        );
        Ok(StatusChangeOutcome::Applied {
            previous: request.status,
            current: change.new_status,
        })
    }

    /// Decide a status change against the request's gate and queue.
    ///
    /// Must run under the request's lock.
    async fn admit(&self, request: &Request, replayed_from: Option<Ordinal>) -> Result<Admission> {
        if request.gate_state() == GateState::Uncorrelated {
            return Ok(Admission::Defer);
        }

        let Some(origin) = replayed_from else {
            return Ok(if self.pending.has_pending(request.id).await? {
                Admission::Defer
            } else {
                Admission::Apply
            });
        };

        let queue = self.pending.list_ordered(request.id).await?;
        Ok(match queue.first() {
            None => Admission::Apply,
            Some(head) if origin < head.ordinal => Admission::Apply,
            Some(_) if queue.iter().any(|event| event.ordinal == origin) => {
                Admission::AlreadyQueued(origin)
            },
            Some(_) => Admission::Defer,
        })
    }

    /// Number of requests whose lock is held or awaited right now.
    #[must_use]
    pub fn requests_in_progress(&self) -> usize {
        self.locks.active_keys()
    }

    /// Replay a correlated request's leftover queue.
    ///
    /// Returns `None` when the request is unknown, uncorrelated, or has nothing
    /// queued.
    ///
    /// # Errors
    ///
    /// Returns `FailSafeError::Persistence` if the storage layer fails.
    pub async fn replay_pending(&self, id: RequestId) -> Result<Option<ReplayReport>> {
        let _guard = self.locks.lock(id).await;

        let Some(request) = self.registry.get(id).await? else {
            return Ok(None);
        };
        if request.gate_state() == GateState::Uncorrelated || !self.pending.has_pending(id).await? {
            return Ok(None);
        }
        self.replay.replay(id).await.map(Some)
    }

    /// Remove one pending event on an operator's request.
    ///
    /// Returns the removed event, or `None` if it was not queued.
    ///
    /// # Errors
    ///
    /// Returns `FailSafeError::Persistence` if the storage layer fails.
    pub async fn discard(&self, key: PendingEventKey) -> Result<Option<PendingEvent>> {
        let _guard = self.locks.lock(key.request_id).await;

        let found = self
            .pending
            .list_ordered(key.request_id)
            .await?
            .into_iter()
            .find(|event| event.ordinal == key.ordinal);
        if found.is_some() {
            self.pending.remove(key).await?;
            ReplayMetrics::record_discarded();
            info!(request_id = %key.request_id, ordinal = %key.ordinal, "Pending event discarded");
        }
        Ok(found)
    }
}
