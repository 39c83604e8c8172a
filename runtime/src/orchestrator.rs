//! Public entry points of the engine.
//!
//! Outbound operations ([`create_request`](FailSafeOrchestrator::create_request),
//! [`request_status_change`](FailSafeOrchestrator::request_status_change))
//! only publish. State changes happen when the published messages come back
//! through the inbound handlers and pass the [`CorrelationGate`].

use crate::config::FailSafeConfig;
use crate::error::{FailSafeError, Result};
use crate::gate::{CorrelationGate, CorrelationOutcome, StatusChangeOutcome};
use crate::health::{HealthCheck, HealthReport};
use crate::metrics::ReplayMetrics;
use crate::replay::{ReplayReport, ReplayScheduler};
use failsafe_core::environment::{CorrelationIdGenerator, UuidCorrelationIds};
use failsafe_core::event::SerializedEvent;
use failsafe_core::event_bus::EventBus;
use failsafe_core::message::{RequestMessage, StatusChangeMessage};
use failsafe_core::pending::{PendingEvent, PendingEventKey, PendingEventStore};
use failsafe_core::registry::RequestRegistry;
use failsafe_core::request::{Request, RequestId, RequestStatus};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Operator switch for the request processor.
///
/// While disabled, creation deliveries register the request but leave it
/// uncorrelated and report [`FailSafeError::ProcessingDisabled`] so the
/// delivery is retried later.
#[derive(Clone, Debug)]
pub struct ProcessingMode {
    enabled: Arc<AtomicBool>,
}

impl ProcessingMode {
    /// A switch starting in the given position.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    /// Whether creation deliveries are processed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the switch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Default for ProcessingMode {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Totals from one [`sweep`](FailSafeOrchestrator::sweep).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Requests whose queue was replayed.
    pub requests: usize,
    /// Events republished across those requests.
    pub replayed: usize,
    /// Requests whose drain stopped early.
    pub halted: usize,
}

/// Composes the gate, the replay scheduler and the transport.
pub struct FailSafeOrchestrator {
    config: FailSafeConfig,
    registry: Arc<dyn RequestRegistry>,
    pending: Arc<dyn PendingEventStore>,
    event_bus: Arc<dyn EventBus>,
    gate: CorrelationGate,
    correlation_ids: Arc<dyn CorrelationIdGenerator>,
    processing: ProcessingMode,
    last_id: Mutex<Option<RequestId>>,
}

impl FailSafeOrchestrator {
    /// Wire an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        config: FailSafeConfig,
        registry: Arc<dyn RequestRegistry>,
        pending: Arc<dyn PendingEventStore>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        let replay = ReplayScheduler::new(
            Arc::clone(&pending),
            Arc::clone(&event_bus),
            config.replay_interval,
        );
        let gate = CorrelationGate::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            replay,
            config.correlation_policy,
            config.status_change_topic.clone(),
        );

        Self {
            config,
            registry,
            pending,
            event_bus,
            gate,
            correlation_ids: Arc::new(UuidCorrelationIds),
            processing: ProcessingMode::default(),
            last_id: Mutex::new(None),
        }
    }

    /// Use `generator` for requests that arrive without a correlation id.
    #[must_use]
    pub fn with_correlation_ids(mut self, generator: Arc<dyn CorrelationIdGenerator>) -> Self {
        self.correlation_ids = generator;
        self
    }

    /// Share an existing processing switch.
    #[must_use]
    pub fn with_processing_mode(mut self, processing: ProcessingMode) -> Self {
        self.processing = processing;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &FailSafeConfig {
        &self.config
    }

    /// Allocate an id, register the request and publish its creation.
    ///
    /// The request is registered (uncorrelated, `New`) before the message is
    /// published, so status changes can be requested for it immediately.
    ///
    /// # Errors
    ///
    /// - `Persistence`: the registry failed
    /// - `Publish`: the creation message was rejected; the row stays
    ///   uncorrelated until a creation delivery for it arrives
    pub async fn create_request(&self) -> Result<Request> {
        let id = {
            let mut last_id = self.last_id.lock().await;
            let previous = match *last_id {
                Some(id) => Some(id),
                None => self.registry.max_id().await?,
            };
            let mut id = previous.map_or(RequestId::FIRST, RequestId::next);
            // Skip ids another instance registered since we last looked.
            while !self.gate.register_uncorrelated(id).await? {
                id = id.next();
            }
            *last_id = Some(id);
            id
        };

        let message = RequestMessage::created(id);
        let envelope = SerializedEvent::from_event(&message)?;
        self.event_bus
            .publish(&self.config.new_request_topic, &envelope)
            .await?;

        info!(request_id = %id, topic = %self.config.new_request_topic, "Request created");
        Ok(Request::new(id))
    }

    /// Ask for a status change on an existing request.
    ///
    /// Publishes only; the change is applied or deferred when the message is
    /// delivered back to [`handle_status_change_requested`](Self::handle_status_change_requested).
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: `id` was never created; nothing is published
    /// - `Publish`: the transport rejected the message
    pub async fn request_status_change(&self, id: RequestId, status: RequestStatus) -> Result<()> {
        if self.registry.get(id).await?.is_none() {
            warn!(request_id = %id, "Status change requested for unknown request");
            return Err(FailSafeError::UnknownRequest(id));
        }

        let envelope = SerializedEvent::from_event(&StatusChangeMessage::new(id, status))?;
        self.event_bus
            .publish(&self.config.status_change_topic, &envelope)
            .await?;

        info!(request_id = %id, new_status = %status, "Status change requested");
        Ok(())
    }

    /// Inbound "request created or retried".
    ///
    /// # Errors
    ///
    /// - `ProcessingDisabled`: the processor is switched off; the request was
    ///   registered uncorrelated and the delivery should be retried
    /// - `Persistence`: the storage layer failed
    pub async fn handle_request_created_or_retried(
        &self,
        message: RequestMessage,
    ) -> Result<CorrelationOutcome> {
        if !self.processing.is_enabled() {
            self.gate.register_uncorrelated(message.id).await?;
            warn!(request_id = %message.id, "Request processing disabled, delivery will be retried");
            return Err(FailSafeError::ProcessingDisabled);
        }

        let correlation_id = message
            .correlation_id
            .filter(|id| !id.as_str().is_empty())
            .unwrap_or_else(|| self.correlation_ids.next_correlation_id());

        self.gate
            .on_request_created_or_retried(message.id, correlation_id)
            .await
    }

    /// Inbound "status change requested".
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: the id was never created; nothing is written
    /// - `Persistence` / `OrdinalCollision`: the storage layer failed
    pub async fn handle_status_change_requested(
        &self,
        message: StatusChangeMessage,
    ) -> Result<StatusChangeOutcome> {
        self.gate.on_status_change_requested(message).await
    }

    /// Snapshot of every request.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the registry fails.
    pub async fn list_requests(&self) -> Result<Vec<Request>> {
        Ok(self.registry.list_all().await?)
    }

    /// Snapshot of every pending event.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store fails.
    pub async fn list_pending_events(&self) -> Result<Vec<PendingEvent>> {
        Ok(self.pending.list_all().await?)
    }

    /// Drop a pending event that can never be replayed.
    ///
    /// Returns the removed event, or `None` if nothing was queued under `key`.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the store fails.
    pub async fn discard_pending_event(&self, key: PendingEventKey) -> Result<Option<PendingEvent>> {
        self.gate.discard(key).await
    }

    /// Replay what is left in one correlated request's queue.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the storage layer fails.
    pub async fn replay_pending(&self, id: RequestId) -> Result<Option<ReplayReport>> {
        self.gate.replay_pending(id).await
    }

    /// Replay every correlated request that still has a backlog.
    ///
    /// A failure on one request is logged and does not stop the sweep.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the pending store cannot be listed.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let backlog = self.pending.list_all().await?;
        ReplayMetrics::record_backlog(backlog.len());

        let request_ids: BTreeSet<RequestId> =
            backlog.iter().map(|event| event.related_request_id).collect();

        let mut report = SweepReport::default();
        for id in request_ids {
            match self.gate.replay_pending(id).await {
                Ok(Some(replay)) => {
                    report.requests += 1;
                    report.replayed += replay.replayed;
                    if replay.halted.is_some() {
                        report.halted += 1;
                    }
                },
                Ok(None) => {},
                Err(e) => {
                    warn!(request_id = %id, error = %e, "Sweep replay failed");
                },
            }
        }
        Ok(report)
    }

    /// Turn the request processor on or off.
    pub fn set_processing_enabled(&self, enabled: bool) {
        self.processing.set_enabled(enabled);
        info!(enabled, "Request processing mode changed");
    }

    /// Whether the request processor is on.
    #[must_use]
    pub fn processing_enabled(&self) -> bool {
        self.processing.is_enabled()
    }

    /// Readiness: storage reachable, processor mode, backlog size.
    pub async fn health(&self) -> HealthReport {
        let processing = if self.processing.is_enabled() {
            HealthCheck::healthy("processing")
        } else {
            HealthCheck::degraded("processing", "request processing disabled by operator")
        }
        .with_detail("requests_in_progress", self.gate.requests_in_progress());

        let registry = match self.registry.max_id().await {
            Ok(max_id) => HealthCheck::healthy("registry").with_detail(
                "max_id",
                max_id.map_or_else(|| "none".to_string(), |id| id.to_string()),
            ),
            Err(e) => HealthCheck::unhealthy("registry", e.to_string()),
        };

        let pending = match self.pending.list_all().await {
            Ok(events) => HealthCheck::healthy("pending_store").with_detail("backlog", events.len()),
            Err(e) => HealthCheck::unhealthy("pending_store", e.to_string()),
        };

        HealthReport::new(vec![processing, registry, pending])
    }
}
