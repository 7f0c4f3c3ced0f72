use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
#[error("process enumeration failed: {0}")]
pub struct ProbeError(pub String);

/// Source of the names of currently running OS processes.
pub trait ProcessProbe: Send + Sync {
    fn running_processes(&self) -> Result<Vec<String>, ProbeError>;
}

/// `sysinfo` backed probe.
pub struct SystemProcessProbe {
    system: Mutex<System>,
}

impl SystemProcessProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProcessProbe {
    fn running_processes(&self) -> Result<Vec<String>, ProbeError> {
        let mut system = self.system.lock();
        system.refresh_processes();
        let names: Vec<String> = system
            .processes()
            .values()
            .map(|process| process.name().to_string())
            .collect();
        if names.is_empty() {
            return Err(ProbeError("no processes visible".to_string()));
        }
        Ok(names)
    }
}

/// Edge-triggered change of the blocked state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    Blocked { processes: Vec<String> },
    Unblocked,
}

/// Lower-case and drop a trailing `.exe`.
pub fn normalize_process_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Watches for blocked processes across all registered jobs.
pub struct AdmissionMonitor {
    probe: Arc<dyn ProcessProbe>,
    interval: Duration,
    /// Lower-cased job name -> that job's blocked process names.
    registered: RwLock<HashMap<String, Vec<String>>>,
    blocked: Mutex<bool>,
    events: mpsc::Sender<AdmissionEvent>,
}

impl AdmissionMonitor {
    pub fn new(
        probe: Arc<dyn ProcessProbe>,
        interval: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<AdmissionEvent>) {
        let (events, rx) = mpsc::channel(16);
        let monitor = Arc::new(Self {
            probe,
            interval,
            registered: RwLock::new(HashMap::new()),
            blocked: Mutex::new(false),
            events,
        });
        (monitor, rx)
    }

    pub fn register(&self, job_name: &str, blocked_processes: &[String]) {
        self.registered
            .write()
            .insert(job_name.to_lowercase(), blocked_processes.to_vec());
        debug!("Admission: watching {} for {:?}", job_name, blocked_processes);
    }

    pub fn unregister(&self, job_name: &str) {
        self.registered.write().remove(&job_name.to_lowercase());
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.registered.read().contains_key(&job_name.to_lowercase())
    }

    pub fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }

    /// The subset of `names` currently running, sorted. If the process list
    /// cannot be read every name is reported as running. The OS query runs
    /// on the blocking pool.
    pub async fn blocking_processes(&self, names: &[String]) -> Vec<String> {
        if names.is_empty() {
            return Vec::new();
        }
        let probe = self.probe.clone();
        let lookup = tokio::task::spawn_blocking(move || probe.running_processes()).await;
        let mut hits: Vec<String> = match lookup {
            Ok(Ok(running)) => {
                let running: BTreeSet<String> =
                    running.iter().map(|n| normalize_process_name(n)).collect();
                names
                    .iter()
                    .filter(|name| running.contains(&normalize_process_name(name)))
                    .cloned()
                    .collect()
            }
            Ok(Err(e)) => {
                warn!("{}; treating as blocked", e);
                names.to_vec()
            }
            Err(e) => {
                warn!("process probe task failed: {}; treating as blocked", e);
                names.to_vec()
            }
        };
        hits.sort();
        hits.dedup();
        hits
    }

    fn watched_processes(&self) -> Option<Vec<String>> {
        let registered = self.registered.read();
        if registered.is_empty() {
            return None;
        }
        let union: BTreeSet<String> = registered.values().flatten().cloned().collect();
        Some(union.into_iter().collect())
    }

    /// One evaluation. Emits (and returns) an event only when the blocked
    /// state flips. Skipped while no job is registered.
    pub async fn poll_once(&self) -> Option<AdmissionEvent> {
        let watched = self.watched_processes()?;
        let running = self.blocking_processes(&watched).await;

        let now_blocked = !running.is_empty();
        let event = {
            let mut blocked = self.blocked.lock();
            if *blocked == now_blocked {
                return None;
            }
            *blocked = now_blocked;
            if now_blocked {
                AdmissionEvent::Blocked { processes: running }
            } else {
                AdmissionEvent::Unblocked
            }
        };

        info!("Admission state changed: {:?}", event);
        if self.events.send(event.clone()).await.is_err() {
            debug!("Admission event receiver is gone");
        }
        Some(event)
    }

    pub fn start_polling(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }
}
