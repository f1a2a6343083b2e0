//! Background liveness probing and stale-state reaping

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use tether_core::{LivenessConfig, LivenessMode};

use crate::router::SignalRouter;

/// Periodic maintenance for one router
pub struct Reaper {
    router: SignalRouter,
    config: LivenessConfig,
}

impl Reaper {
    pub fn new(router: SignalRouter, config: LivenessConfig) -> Self {
        Self { router, config }
    }

    /// Start the background loops. The probe loop only runs in probe mode.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if self.config.mode == LivenessMode::Probe {
            let router = self.router.clone();
            let period = self.config.probe_interval();
            handles.push(tokio::spawn(probe_loop(router, period)));
        }

        handles.push(tokio::spawn(self.run_loop()));
        handles
    }

    /// Sweep expired negotiations (and, in heartbeat mode, silent devices)
    /// every reaper interval
    pub async fn run_loop(self) {
        let period = self.config.reaper_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            self.sweep();
        }
    }

    fn sweep(&self) {
        let stats = self
            .router
            .reap(self.config.mode, self.config.stale_timeout());

        if stats.negotiations > 0 || stats.devices > 0 {
            info!(
                "Reaped {} negotiations and {} devices",
                stats.negotiations, stats.devices
            );
        } else {
            debug!(
                "Reaper sweep: {} devices, {} negotiations in flight",
                self.router.device_count(),
                self.router.negotiation_count()
            );
        }
    }
}

async fn probe_loop(router: SignalRouter, period: Duration) {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let dropped = router.probe_liveness();
        if dropped > 0 {
            info!("Liveness probe dropped {} devices", dropped);
        }
    }
}
