use crate::backup::ParallelismGate;
use crate::utils::config::ConfigHandle;
use std::time::Instant;
use sysinfo::Networks;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Source of the current network load.
pub trait LoadProbe: Send {
    /// Bytes per second (received + transmitted) since the previous sample.
    fn bytes_per_sec(&mut self) -> u64;
}

/// Sums every interface's counters via `sysinfo`.
pub struct NetworkProbe {
    networks: Networks,
    last: Instant,
}

impl NetworkProbe {
    pub fn new() -> Self {
        let networks = Networks::new_with_refreshed_list();
        info!("Network monitor watching {} interfaces", networks.iter().count());
        Self {
            networks,
            last: Instant::now(),
        }
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for NetworkProbe {
    fn bytes_per_sec(&mut self) -> u64 {
        self.networks.refresh();
        let elapsed = self.last.elapsed().as_secs_f64().max(0.001);
        self.last = Instant::now();

        let bytes: u64 = self
            .networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        (bytes as f64 / elapsed) as u64
    }
}

/// Resizes the parallel-job gate when network load crosses the configured
/// threshold.
pub struct NetworkMonitor {
    probe: Box<dyn LoadProbe>,
    gate: ParallelismGate,
    config: ConfigHandle,
    congested: bool,
}

impl NetworkMonitor {
    pub fn new(probe: Box<dyn LoadProbe>, gate: ParallelismGate, config: ConfigHandle) -> Self {
        Self {
            probe,
            gate,
            config,
            congested: false,
        }
    }

    /// Samples once and applies the resulting capacity. Returns it.
    pub fn sample_once(&mut self) -> usize {
        let config = self.config.config();
        let full = config.parallel_jobs();
        let reduced = config.reduced_parallel_jobs.clamp(1, full);
        let threshold = config.network_threshold_bytes_per_sec;

        let load = self.probe.bytes_per_sec();
        let congested = threshold > 0 && load > threshold;
        if congested != self.congested {
            info!(
                load_bytes_per_sec = load,
                threshold,
                "Network {}",
                if congested { "busy, reducing parallel jobs" } else { "idle, restoring parallel jobs" }
            );
            self.congested = congested;
        } else {
            debug!(load_bytes_per_sec = load, "network sample");
        }

        let capacity = if congested { reduced } else { full };
        self.gate.resize(capacity);
        capacity
    }

    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let every = self.config.config().network_sample_every();
                tokio::time::sleep(every).await;
                self.sample_once();
            }
        })
    }
}
