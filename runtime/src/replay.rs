//! Replay of a request's pending queue.
//!
//! Events are republished in ascending ordinal order, each with a delay of
//! `ordinal * replay_interval`, and removed only once the bus accepted them.
//! The staggered delays are what rebuild the original order downstream: every
//! publish happens in one loop, but delivery is spread out in time.
//!
//! The drain stops at the first event it cannot republish. Later events stay
//! queued behind it so that nothing overtakes it; the next replay of the same
//! request picks up from there.
//!
//! Each republished copy carries the ordinal it left the queue at
//! ([`StatusChangeMessage::replayed_from`]). When a drain stopped halfway, the
//! copies already on their way arrive while the request still has a backlog;
//! the gate uses that ordinal to apply them instead of queueing them behind
//! the changes they preceded.
//!
//! [`StatusChangeMessage::replayed_from`]: failsafe_core::message::StatusChangeMessage::replayed_from

use crate::error::Result;
use crate::metrics::ReplayMetrics;
use failsafe_core::event::{EventError, SerializedEvent};
use failsafe_core::event_bus::{EventBus, EventBusError};
use failsafe_core::pending::{Ordinal, PendingEvent, PendingEventStore};
use failsafe_core::request::RequestId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why a drain stopped early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayHaltReason {
    /// The bus rejected the publish. Retried on the next replay.
    PublishFailed(EventBusError),
    /// The stored payload no longer decodes. Needs an operator.
    Undecodable(EventError),
}

/// The event a drain stopped at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayHalt {
    /// Ordinal of the event left at the head of the queue.
    pub ordinal: Ordinal,
    /// What went wrong with it.
    pub reason: ReplayHaltReason,
}

/// Outcome of one [`ReplayScheduler::replay`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayReport {
    /// Request whose queue was drained.
    pub request_id: RequestId,
    /// Events republished and removed.
    pub replayed: usize,
    /// Events still queued afterwards.
    pub remaining: usize,
    /// Set when the drain stopped before the end of the queue.
    pub halted: Option<ReplayHalt>,
}

impl ReplayReport {
    /// Report for a queue that had nothing in it.
    #[must_use]
    pub const fn empty(request_id: RequestId) -> Self {
        Self {
            request_id,
            replayed: 0,
            remaining: 0,
            halted: None,
        }
    }

    /// Whether the whole queue was drained.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.halted.is_none() && self.remaining == 0
    }
}

/// Drains pending queues back onto the bus.
///
/// Callers must hold the request's lock for the duration of [`replay`](Self::replay).
#[derive(Clone)]
pub struct ReplayScheduler {
    pending: Arc<dyn PendingEventStore>,
    event_bus: Arc<dyn EventBus>,
    replay_interval: Duration,
}

impl ReplayScheduler {
    /// Create a scheduler spacing replayed events `replay_interval` apart.
    #[must_use]
    pub fn new(
        pending: Arc<dyn PendingEventStore>,
        event_bus: Arc<dyn EventBus>,
        replay_interval: Duration,
    ) -> Self {
        Self {
            pending,
            event_bus,
            replay_interval,
        }
    }

    /// Delay applied to the event at `ordinal`.
    #[must_use]
    pub fn delay_for(&self, ordinal: Ordinal) -> Duration {
        let factor = u32::try_from(ordinal.value()).unwrap_or(u32::MAX);
        self.replay_interval.saturating_mul(factor)
    }

    /// Republish and remove every pending event of `request_id`, in order.
    ///
    /// Publish and decode failures do not fail the call; they stop the drain
    /// and are reported in [`ReplayReport::halted`].
    ///
    /// # Errors
    ///
    /// Returns `FailSafeError::Persistence` if the store cannot be read or an
    /// accepted event cannot be removed.
    pub async fn replay(&self, request_id: RequestId) -> Result<ReplayReport> {
        let started = Instant::now();
        let queue = self.pending.list_ordered(request_id).await?;
        if queue.is_empty() {
            debug!(request_id = %request_id, "Nothing to replay");
            return Ok(ReplayReport::empty(request_id));
        }

        let total = queue.len();
        let mut replayed = 0;
        let mut halted = None;

        for event in queue {
            match self.republish(&event).await {
                Ok(()) => {
                    self.pending.remove(event.key()).await?;
                    replayed += 1;
                },
                Err(reason) => {
                    halted = Some(ReplayHalt {
                        ordinal: event.ordinal,
                        reason,
                    });
                    break;
                },
            }
        }

        ReplayMetrics::record_replay(replayed, started.elapsed());
        let report = ReplayReport {
            request_id,
            replayed,
            remaining: total - replayed,
            halted,
        };
        info!(
            request_id = %request_id,
            replayed = report.replayed,
            remaining = report.remaining,
            "Replayed pending events"
        );
        Ok(report)
    }

    async fn republish(&self, event: &PendingEvent) -> std::result::Result<(), ReplayHaltReason> {
        let (event_type, payload) = event
            .decode()
            .and_then(|deferred| {
                let replayed = deferred.into_replay(event.ordinal);
                replayed.encode().map(|payload| (replayed.event_type(), payload))
            })
            .map_err(|e| {
                ReplayMetrics::record_undecodable();
                error!(
                    request_id = %event.related_request_id,
                    ordinal = %event.ordinal,
                    payload_kind = %event.payload_kind,
                    error = %e,
                    "Pending event cannot be decoded and needs manual intervention"
                );
                ReplayHaltReason::Undecodable(e)
            })?;

        let envelope = SerializedEvent::new(
            event_type.to_string(),
            event.related_request_id.to_string(),
            payload,
        );
        let delay = self.delay_for(event.ordinal);

        self.event_bus
            .publish_delayed(&event.destination_topic, &envelope, delay)
            .await
            .map_err(|e| {
                ReplayMetrics::record_publish_failure();
                warn!(
                    request_id = %event.related_request_id,
                    ordinal = %event.ordinal,
                    topic = %event.destination_topic,
                    error = %e,
                    "Replay publish failed, event stays queued"
                );
                ReplayHaltReason::PublishFailed(e)
            })?;

        debug!(
            request_id = %event.related_request_id,
            ordinal = %event.ordinal,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Republished pending event"
        );
        Ok(())
    }
}
