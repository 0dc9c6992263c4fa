//! Flow Manager
//!
//! This module provides centralized flow management including:
//! - Flow limiting via semaphore-based admission
//! - Graceful shutdown with cancellation and draining
//! - Statistics collection from flow outcomes

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{FlowContext, FlowHandler};
use super::state::FlowState;
use super::stats::{FlowStats, StatsSnapshot};
use super::types::{FlowMeta, FlowOutcome, InboundFlow};
use crate::config::FlowConfig;
use crate::error::FlowError;

/// Handle to an admitted flow
#[derive(Debug)]
pub struct FlowHandle {
    id: u64,
    state: watch::Receiver<FlowState>,
    cancel: CancellationToken,
    task: JoinHandle<FlowOutcome>,
}

impl FlowHandle {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Observe the flow's state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<FlowState> {
        self.state.clone()
    }

    /// Cancel this flow only
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the flow to finish. `None` if the task panicked.
    pub async fn join(self) -> Option<FlowOutcome> {
        self.task.await.ok()
    }
}

/// Flow manager for handling concurrent flows
pub struct FlowManager {
    ctx: Arc<FlowContext>,

    /// Semaphore for flow limiting
    semaphore: Arc<Semaphore>,

    /// Maximum flows allowed
    max_flows: usize,

    /// Flow statistics
    stats: Arc<FlowStats>,

    next_id: AtomicU64,

    /// Parent of every flow's cancellation token
    cancel: CancellationToken,

    /// Drain timeout for graceful shutdown
    drain_timeout: Duration,

    /// Whether shutdown has been initiated
    shutting_down: AtomicBool,
}

impl FlowManager {
    /// Create a new flow manager
    pub fn new(ctx: Arc<FlowContext>, config: &FlowConfig) -> Self {
        Self::with_limits(ctx, config.max_flows, config.drain_timeout())
    }

    /// Create a manager with explicit limits
    pub fn with_limits(ctx: Arc<FlowContext>, max_flows: usize, drain_timeout: Duration) -> Self {
        Self {
            ctx,
            semaphore: Arc::new(Semaphore::new(max_flows)),
            max_flows,
            stats: Arc::new(FlowStats::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            drain_timeout,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Admit a flow and start it on its own task.
    ///
    /// The flow holds its permit until its completion has fired.
    ///
    /// # Errors
    ///
    /// - `FlowError::ShuttingDown` once [`shutdown`](Self::shutdown) started
    /// - `FlowError::LimitReached` if no permit is available
    pub fn admit(&self, mut meta: FlowMeta, inbound: InboundFlow) -> Result<FlowHandle, FlowError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            self.stats.record_rejected();
            return Err(FlowError::ShuttingDown);
        }

        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            self.stats.record_rejected();
            let current = self.active_flows();
            warn!(
                "Flow limit reached ({}/{}), rejecting flow from {:?}",
                current, self.max_flows, meta.source
            );
            return Err(FlowError::limit_reached(current, self.max_flows));
        };

        meta.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.record_accepted();

        debug!(
            "Admitted {} flow {} from {:?} (active: {}/{})",
            meta.protocol,
            meta.id,
            meta.source,
            self.stats.active(),
            self.max_flows
        );

        let id = meta.id;
        let cancel = self.cancel.child_token();
        let stats = Arc::clone(&self.stats);
        let handler = FlowHandler::new(meta, inbound, Arc::clone(&self.ctx), cancel.clone())
            .on_complete(move |outcome| stats.record_outcome(&outcome));
        let state = handler.state();

        let task = tokio::spawn(async move {
            let outcome = handler.run().await;
            drop(permit);
            outcome
        });

        Ok(FlowHandle {
            id,
            state,
            cancel,
            task,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<FlowContext> {
        &self.ctx
    }

    #[must_use]
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Flows currently holding a permit
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.max_flows - self.semaphore.available_permits()
    }

    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[must_use]
    pub const fn max_flows(&self) -> usize {
        self.max_flows
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Fires when shutdown begins
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Initiate graceful shutdown
    ///
    /// Stops admitting flows, cancels every live flow and waits for them to
    /// finish (up to the drain timeout). Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!("Initiating flow manager shutdown");
        self.cancel.cancel();

        let drain_start = tokio::time::Instant::now();
        let check_interval = Duration::from_millis(50);

        while drain_start.elapsed() < self.drain_timeout {
            let active = self.active_flows();
            if active == 0 {
                info!("All flows drained");
                return;
            }

            debug!(
                "Waiting for {} flows to drain ({:.1}s remaining)",
                active,
                (self.drain_timeout.saturating_sub(drain_start.elapsed())).as_secs_f64()
            );

            tokio::time::sleep(check_interval).await;
        }

        let remaining = self.active_flows();
        if remaining > 0 {
            warn!("Drain timeout reached with {} flows still active", remaining);
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("max_flows", &self.max_flows)
            .field("active", &self.active_flows())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
