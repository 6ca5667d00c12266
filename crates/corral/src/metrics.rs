use prometheus::{IntGauge, Opts, Registry};

/// Cluster-level prometheus metrics.
pub struct ClusterMetrics {
    /// Number of known runners.
    pub runners: IntGauge,
    /// Number of healthy runners.
    pub runners_healthy: IntGauge,
    /// Number of shards owned by this runner.
    pub shards: IntGauge,
    /// Number of requests currently waiting on storage replay.
    pub replay_pending: IntGauge,
}

impl ClusterMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let runners = IntGauge::with_opts(Opts::new("cluster_runners", "Number of known runners"))?;
        let runners_healthy = IntGauge::with_opts(Opts::new(
            "cluster_runners_healthy",
            "Number of healthy runners",
        ))?;
        let shards = IntGauge::with_opts(Opts::new(
            "cluster_shards",
            "Number of shards owned by this runner",
        ))?;
        let replay_pending = IntGauge::with_opts(Opts::new(
            "cluster_replay_pending",
            "Number of requests currently waiting on storage replay",
        ))?;

        registry.register(Box::new(runners.clone()))?;
        registry.register(Box::new(runners_healthy.clone()))?;
        registry.register(Box::new(shards.clone()))?;
        registry.register(Box::new(replay_pending.clone()))?;

        Ok(Self {
            runners,
            runners_healthy,
            shards,
            replay_pending,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            runners: IntGauge::new("cluster_runners", "runners").expect("valid metric name"),
            runners_healthy: IntGauge::new("cluster_runners_healthy", "healthy")
                .expect("valid metric name"),
            shards: IntGauge::new("cluster_shards", "shards").expect("valid metric name"),
            replay_pending: IntGauge::new("cluster_replay_pending", "replay pending")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ClusterMetrics::unregistered();
        m.replay_pending.set(5);
        assert_eq!(m.replay_pending.get(), 5);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = ClusterMetrics::new(&r).unwrap();
        m.shards.set(10);
        assert_eq!(m.shards.get(), 10);
    }
}
