use crate::{
    core::{compare, ChangeClass, Configuration, EnvelopeKind},
    grpc::{ApplyError, Distributor, DistributorError, Reload},
    index::{build, BuildError, SharedIndex, Snapshot},
};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

/// Drives configurations from the index to the distributor.
///
/// Each pass rebuilds the complete configuration from an index snapshot and compares it with the
/// last configuration the distributor accepted. Passes run when the index changes and
/// periodically, one at a time.
pub struct Reconciler {
    index: SharedIndex,
    changes: watch::Receiver<u64>,
    distributor: Distributor,
    errors: mpsc::UnboundedReceiver<DistributorError>,
    reload: Arc<dyn Reload>,
    metrics: ReconcileMetrics,
    period: Duration,
    reset_cool_down: Duration,

    applied: Arc<Configuration>,
    reset_at: Option<Instant>,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    passes: Family<PassLabels, Counter>,
    excluded: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PassLabels {
    change: &'static str,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        index: SharedIndex,
        changes: watch::Receiver<u64>,
        distributor: Distributor,
        errors: mpsc::UnboundedReceiver<DistributorError>,
        reload: Arc<dyn Reload>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            index,
            changes,
            distributor,
            errors,
            reload,
            metrics,
            period: Duration::from_secs(10),
            reset_cool_down: Duration::from_secs(30),
            applied: Arc::default(),
            reset_at: None,
        }
    }

    /// Sets the interval of unconditional passes.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Sets how long the distributor stays closed after a terminal error.
    pub fn with_reset_cool_down(mut self, cool_down: Duration) -> Self {
        self.reset_cool_down = cool_down;
        self
    }

    pub async fn run(mut self, shutdown: drain::Watch) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Reconciler shutting down");
                    return;
                }

                error = self.errors.recv() => {
                    match error {
                        Some(error) => self.handle_error(error).await,
                        None => return,
                    }
                    continue;
                }

                () = reset(self.reset_at) => {
                    self.reset_at = None;
                    info!("Resetting distributor");
                    if let Err(error) = self.distributor.reset().await {
                        warn!(%error, "Failed to reset distributor");
                    }
                }

                res = self.changes.changed() => {
                    if res.is_err() {
                        return;
                    }
                }

                _ = interval.tick() => {}
            }

            self.reconcile().await;
        }
    }

    /// Runs a single pass.
    pub async fn reconcile(&mut self) {
        let (snapshot, registry) = {
            let index = self.index.read();
            (index.snapshot(), index.registry().clone())
        };
        let Snapshot {
            resources,
            defaults,
        } = snapshot;

        let (config, errors) = build(&resources, &registry, &defaults);
        let excluded = errors
            .iter()
            .filter(|e| matches!(e, BuildError::Excluded { .. }))
            .count();
        self.metrics.excluded(excluded);
        if let Some(error) = errors.iter().find(|e| matches!(e, BuildError::Model(_))) {
            error!(%error, "Keeping the last applied configuration");
            return;
        }

        let next = Arc::new(config);
        let change = compare(&self.applied, &next);
        self.metrics.pass(change);
        if change == ChangeClass::NoChange {
            return;
        }

        match self.distributor.apply(change, next.clone()).await {
            Ok(status) => {
                debug!(change = change.as_str(), ?status, excluded, "Applied configuration");
                self.applied = next;
            }
            Err(ApplyError::Closed) => {
                debug!("Distributor is closed; the configuration is applied after a reset");
            }
            Err(error) => warn!(%error, "Failed to apply configuration"),
        }
    }

    pub fn applied(&self) -> &Arc<Configuration> {
        &self.applied
    }

    async fn handle_error(&mut self, error: DistributorError) {
        match error {
            DistributorError::Stale(elapsed) => {
                warn!(?elapsed, "Data plane is stale; reloading locally");
                if let Err(error) = self.reload.reload(self.applied.clone()).await {
                    error!(%error, "Local reload failed");
                }
            }

            DistributorError::RejectedByPeer {
                kind: EnvelopeKind::FullConfig,
                ..
            } => {
                error!(%error, "Data plane cannot represent the configuration");
            }

            DistributorError::Closed => debug!("Distributor closed"),

            error if error.is_terminal() => {
                warn!(
                    %error,
                    cool_down = ?self.reset_cool_down,
                    "Distributor closed; resetting after cool-down"
                );
                self.reset_at = Some(Instant::now() + self.reset_cool_down);
            }

            error => debug!(%error, "Distributor error"),
        }
    }
}

async fn reset(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let passes = Family::<PassLabels, Counter>::default();
        reg.register(
            "passes",
            "Total number of reconciliation passes by change class",
            passes.clone(),
        );

        let excluded = Gauge::default();
        reg.register(
            "excluded_ingresses",
            "Number of ingresses excluded from the last built configuration",
            excluded.clone(),
        );

        Self { passes, excluded }
    }

    fn pass(&self, change: ChangeClass) {
        self.passes
            .get_or_create(&PassLabels {
                change: change.as_str(),
            })
            .inc();
    }

    fn excluded(&self, count: usize) {
        self.excluded.set(i64::try_from(count).unwrap_or(i64::MAX));
    }
}
