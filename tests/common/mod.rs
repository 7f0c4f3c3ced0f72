#![allow(dead_code)]

use backup_jobs::backup::admission::ProbeError;
use backup_jobs::backup::{AdmissionMonitor, BackupManager, JobState, ProcessProbe};
use backup_jobs::crypto::{EncryptError, Encryptor, StreamCipher};
use backup_jobs::storage::Storage;
use backup_jobs::utils::config::{Config, ConfigHandle};
use backup_jobs::utils::log_buffer::LogBuffer;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::time::Duration;

pub const KEY: &str = "integration-key";

#[derive(Default)]
pub struct FakeProcesses {
    running: Mutex<Vec<String>>,
}

impl FakeProcesses {
    pub fn set(&self, names: &[&str]) {
        *self.running.lock() = names.iter().map(|n| n.to_string()).collect();
    }
}

impl ProcessProbe for FakeProcesses {
    fn running_processes(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self.running.lock().clone())
    }
}

/// Blocks every encryption until opened.
#[derive(Default)]
pub struct Latch {
    open: StdMutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

pub struct LatchedCipher(pub Arc<Latch>);

impl Encryptor for LatchedCipher {
    fn encrypt(&self, source: &Path, dest: &Path, key: &str) -> Result<Duration, EncryptError> {
        self.0.wait();
        StreamCipher.encrypt(source, dest, key)
    }
}

pub struct Service {
    pub manager: BackupManager,
    pub processes: Arc<FakeProcesses>,
    pub admission: Arc<AdmissionMonitor>,
    pub log: LogBuffer,
}

pub fn config() -> ConfigHandle {
    ConfigHandle::new(Config {
        max_parallel_jobs: 4,
        encryption_key: KEY.to_string(),
        broadcast_interval: "50ms".to_string(),
        admission_poll_interval: "20ms".to_string(),
        ..Config::default()
    })
}

pub fn service(storage: Option<Storage>, encryptor: Arc<dyn Encryptor>) -> Service {
    let processes = Arc::new(FakeProcesses::default());
    let config = config();
    let (admission, rx) =
        AdmissionMonitor::new(processes.clone(), config.config().poll_interval());
    let log = LogBuffer::new(1024);
    let manager = BackupManager::new(
        config,
        storage,
        Arc::new(log.clone()),
        encryptor,
        admission.clone(),
        rx,
    );
    Service {
        manager,
        processes,
        admission,
        log,
    }
}

pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (name, content) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

pub async fn wait_for_state(manager: &BackupManager, name: &str, state: JobState) {
    for _ in 0..500 {
        if manager.get(name).map(|job| job.state()) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{} never reached {} (now {:?})",
        name,
        state,
        manager.get(name).map(|job| job.snapshot())
    );
}
