//! Pool monitor (spec §4.7): a closed-loop controller comparing the IPAM
//! service's available/assigned/pending-release counts against the NNC's
//! configured thresholds, growing or shrinking the requested IP count.

use std::sync::Arc;

use crds::{NodeNetworkConfig, Scaler};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::PoolError;
use crate::state::AllocationMap;

/// The computed change the monitor wants to make to the NNC spec, or `None`
/// if the observed state already satisfies the thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolDecision {
    Grow { requested_ip_count: i64 },
    Shrink { requested_ip_count: i64, ips_not_in_use: Vec<String> },
    NoOp,
}

/// Pure threshold arithmetic, kept separate from I/O so it's trivially
/// testable against the scenarios in spec §8.
pub fn decide(scaler: &Scaler, requested_ip_count: i64, available: i64, pending_release: i64) -> PoolDecision {
    let minimum_free = scaler.batch_size * scaler.request_threshold_percent / 100;
    let maximum_free = scaler.batch_size * scaler.release_threshold_percent / 100;
    let free = available - pending_release;

    if free < minimum_free && requested_ip_count + scaler.batch_size <= scaler.max_ip_count {
        return PoolDecision::Grow {
            requested_ip_count: requested_ip_count + scaler.batch_size,
        };
    }

    if free > maximum_free {
        // Exactly one batch moves from available to pending-release per tick
        // (spec §4.7 step 3), regardless of how far over maximumFree we are.
        return PoolDecision::Shrink {
            requested_ip_count: (requested_ip_count - scaler.batch_size).max(0),
            ips_not_in_use: Vec::new(),
        };
    }

    PoolDecision::NoOp
}

pub struct PoolMonitor {
    pub api: Api<NodeNetworkConfig>,
    pub allocations: Arc<AllocationMap>,
    pub nnc_name: String,
    /// At-most-one in-flight PATCH, to avoid oscillation.
    patch_in_flight: Mutex<()>,
}

impl PoolMonitor {
    pub fn new(api: Api<NodeNetworkConfig>, allocations: Arc<AllocationMap>, nnc_name: String) -> Self {
        Self {
            api,
            allocations,
            nnc_name,
            patch_in_flight: Mutex::new(()),
        }
    }

    /// Runs one tick, driven either by the scheduled cadence or by a change
    /// event from the NNC reconciler.
    pub async fn tick(&self, scaler: Scaler, requested_ip_count: i64) -> Result<PoolDecision, PoolError> {
        let guard = self.patch_in_flight.try_lock().map_err(|_| PoolError::PatchInFlight)?;
        let counts = self.allocations.counts().await;
        let decision = decide(&scaler, requested_ip_count, i64::from(counts.available), i64::from(counts.pending_release));

        match &decision {
            PoolDecision::Grow { requested_ip_count } => {
                info!(requested_ip_count, "pool monitor growing requested IP count");
                self.patch_requested_count(*requested_ip_count, &[]).await?;
            }
            PoolDecision::Shrink { requested_ip_count, .. } => {
                let batch = usize::try_from(scaler.batch_size.max(0)).unwrap_or(0);
                let released_ids = self.allocations.mark_pending_release(batch).await;
                info!(requested_ip_count, released = released_ids.len(), "pool monitor shrinking requested IP count");
                self.patch_requested_count(*requested_ip_count, &released_ids).await?;
            }
            PoolDecision::NoOp => {}
        }

        drop(guard);
        Ok(decision)
    }

    async fn patch_requested_count(&self, requested_ip_count: i64, ips_not_in_use: &[String]) -> Result<(), PoolError> {
        let patch = json!({
            "spec": {
                "requestedIPCount": requested_ip_count,
                "ipSNotInUse": ips_not_in_use,
            }
        });
        self.api
            .patch(&self.nnc_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Drives the monitor from either a timer or the NNC reconciler's
    /// "observed" notification, per spec §4.7 "driven either by a scheduled
    /// cadence or by a change event".
    pub async fn run(self: Arc<Self>, mut observed: watch::Receiver<Option<Scaler>>, mut ticker: tokio::time::Interval, requested_ip_count: Arc<Mutex<i64>>, stop: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    let maybe_scaler = observed.borrow().clone();
                    if let Some(scaler) = maybe_scaler {
                        self.run_tick(scaler, &requested_ip_count).await;
                    }
                }
                changed = observed.changed() => {
                    if changed.is_err() { return; }
                    let maybe_scaler = observed.borrow_and_update().clone();
                    if let Some(scaler) = maybe_scaler {
                        self.run_tick(scaler, &requested_ip_count).await;
                    }
                }
            }
        }
    }

    async fn run_tick(&self, scaler: Scaler, requested_ip_count: &Mutex<i64>) {
        let current = *requested_ip_count.lock().await;
        match self.tick(scaler, current).await {
            Ok(PoolDecision::Grow { requested_ip_count: new_count } | PoolDecision::Shrink { requested_ip_count: new_count, .. }) => {
                *requested_ip_count.lock().await = new_count;
            }
            Ok(PoolDecision::NoOp) => {}
            Err(err) => warn!("pool monitor tick failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler(batch_size: i64, request_pct: i64, release_pct: i64, max: i64) -> Scaler {
        Scaler {
            batch_size,
            release_threshold_percent: release_pct,
            request_threshold_percent: request_pct,
            max_ip_count: max,
        }
    }

    #[test]
    fn pool_grow_scenario() {
        // spec §8 scenario 4: batch 10, request 50%, release 150%, available 4,
        // assigned 6, max 250, requested 10 -> bump to 20.
        let decision = decide(&scaler(10, 50, 150, 250), 10, 4, 0);
        assert_eq!(decision, PoolDecision::Grow { requested_ip_count: 20 });
    }

    #[test]
    fn pool_shrink_scenario() {
        // spec §8 scenario 5: same config, available 20, assigned 0, requested 20
        // -> requested drops to 10, one batch of ids queued for release.
        let decision = decide(&scaler(10, 50, 150, 250), 20, 20, 0);
        assert_eq!(decision, PoolDecision::Shrink { requested_ip_count: 10, ips_not_in_use: Vec::new() });
    }

    #[test]
    fn requested_count_never_exceeds_max() {
        let decision = decide(&scaler(10, 50, 150, 100), 95, 0, 0);
        assert_eq!(decision, PoolDecision::NoOp);
    }

    #[test]
    fn within_thresholds_is_a_noop() {
        let decision = decide(&scaler(10, 50, 150, 250), 10, 8, 0);
        assert_eq!(decision, PoolDecision::NoOp);
    }
}
