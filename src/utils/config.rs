use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Raw TCP remote-control port
    pub tcp_port: u16,

    /// WebSocket / HTTP API port
    pub ws_port: u16,

    /// Database URL
    pub database_url: String,

    /// Files larger than this are transferred one at a time system-wide
    pub bandwidth_limit_bytes: u64,

    /// Maximum number of concurrently executing jobs (0 = auto based on CPU)
    pub max_parallel_jobs: usize,

    /// Extensions copied first, in priority order
    pub priority_extensions: Vec<String>,

    /// Passphrase handed to the encryptor
    pub encryption_key: String,

    /// How often the blocked-process monitor polls, e.g. "1s"
    pub admission_poll_interval: String,

    /// How often the job status is broadcast to remote clients
    pub broadcast_interval: String,

    /// How often network load is sampled
    pub network_sample_interval: String,

    /// Network load above which parallelism is reduced (0 = disabled)
    pub network_threshold_bytes_per_sec: u64,

    /// Parallel job slots while the network is busy
    pub reduced_parallel_jobs: usize,
}

/// The part of the configuration the scheduler and throttle read per run.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub bandwidth_limit_bytes: u64,
    pub max_parallel_jobs: usize,
    pub priority_extensions: Vec<String>,
    pub encryption_key: String,
}

impl Default for Config {
    fn default() -> Self {
        let database_url = dirs::data_local_dir()
            .map(|dir| dir.join("backup-jobs").join("backup_jobs.db"))
            .map(|path| format!("sqlite://{}", path.display()))
            .unwrap_or_else(|| "sqlite://backup_jobs.db".to_string());

        Self {
            tcp_port: 9000,
            ws_port: 9001,
            database_url,
            bandwidth_limit_bytes: 100 * 1024 * 1024,
            max_parallel_jobs: 0, // Auto-detect
            priority_extensions: Vec::new(),
            encryption_key: String::new(),
            admission_poll_interval: "1s".to_string(),
            broadcast_interval: "1s".to_string(),
            network_sample_interval: "5s".to_string(),
            network_threshold_bytes_per_sec: 0,
            reduced_parallel_jobs: 1,
        }
    }
}

impl Config {
    /// Load config from defaults, an optional file and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("BACKUP_CONFIG").unwrap_or_else(|_| "backup".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?)
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("BACKUP")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("priority_extensions"),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?;

        let mut config: Config = settings.try_deserialize()?;

        // Auto-detect parallelism if not set
        if config.max_parallel_jobs == 0 {
            config.max_parallel_jobs = num_cpus::get();
        }
        config.reduced_parallel_jobs = config.reduced_parallel_jobs.clamp(1, config.max_parallel_jobs);
        config.priority_extensions = crate::backup::normalize_extensions(&config.priority_extensions);

        Ok(config)
    }

    pub fn global(&self) -> GlobalConfig {
        GlobalConfig {
            bandwidth_limit_bytes: self.bandwidth_limit_bytes,
            max_parallel_jobs: self.parallel_jobs(),
            priority_extensions: self.priority_extensions.clone(),
            encryption_key: self.encryption_key.clone(),
        }
    }

    /// `max_parallel_jobs`, with 0 meaning one slot per CPU.
    pub fn parallel_jobs(&self) -> usize {
        match self.max_parallel_jobs {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        parse_interval(&self.admission_poll_interval, Duration::from_secs(1))
    }

    pub fn broadcast_every(&self) -> Duration {
        parse_interval(&self.broadcast_interval, Duration::from_secs(1))
    }

    pub fn network_sample_every(&self) -> Duration {
        parse_interval(&self.network_sample_interval, Duration::from_secs(5))
    }
}

fn parse_interval(value: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(value.trim()) {
        Ok(duration) if !duration.is_zero() => duration,
        _ => {
            tracing::warn!("invalid interval {:?}, using {:?}", value, fallback);
            fallback
        }
    }
}

/// Shared, hot-reloadable configuration. Readers take snapshots.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Config>>,
    source: Option<String>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(config)),
            source: None,
        }
    }

    pub fn from_source(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self {
            current: Arc::new(RwLock::new(config)),
            source: Some(path),
        })
    }

    pub fn snapshot(&self) -> GlobalConfig {
        self.current.read().global()
    }

    pub fn config(&self) -> Config {
        self.current.read().clone()
    }

    pub fn replace(&self, config: Config) {
        *self.current.write() = config;
    }

    /// Re-read the configuration source; the old value is kept on error.
    pub fn reload(&self) -> Result<()> {
        let config = match &self.source {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };
        self.replace(config);
        Ok(())
    }
}
