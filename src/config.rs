//! Configuration for the orchestrator.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (REEF_HOME, REEF_TASK_FILE, REEF_MODE)
//! 2. Config file (.reef/config.yaml)
//! 3. Defaults (~/.reef)
//!
//! Config file discovery:
//! - Searches current directory and parents for .reef/config.yaml
//! - Paths in config file are relative to the .reef/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<Settings, String>> = OnceLock::new();

/// Scan bound assumed when sizing the critical-section limit
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(40 * 60);

/// Slack added on top of load + scan + unload for the critical-section limit
pub const SECTION_MARGIN: Duration = Duration::from_secs(60);

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub services: Option<ServicesConfig>,
    #[serde(default)]
    pub timeouts: Option<TimeoutsConfig>,
    #[serde(default)]
    pub health: Option<HealthConfig>,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .reef/)
    pub home: Option<String>,
    /// Task file (relative to .reef/)
    pub task_file: Option<String>,
    /// Log directory (relative to .reef/)
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub mode: Option<ServiceMode>,
    pub local_url: Option<String>,
    pub cloud_url: Option<String>,
    pub workspace: Option<String>,
    /// Environment variable holding the access token
    pub token_env: Option<String>,
    pub incubator_id: Option<String>,
    pub arm_id: Option<String>,
    #[serde(default)]
    pub microscopes: Vec<MicroscopeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroscopeConfig {
    pub id: String,
    /// Arm station number serving this microscope
    pub arm_station: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    pub load_seconds: Option<f64>,
    pub unload_seconds: Option<f64>,
    pub ping_seconds: Option<f64>,
    pub call_seconds: Option<f64>,
    pub scan_poll_seconds: Option<f64>,
    pub scan_status_call_seconds: Option<f64>,
    pub max_section_seconds: Option<f64>,
    pub shutdown_grace_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub interval_seconds: Option<f64>,
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_seconds: Option<f64>,
    pub cleanup_unload_on_imaging_failure: Option<bool>,
    pub status_interval_seconds: Option<f64>,
    pub watch_task_file: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub max_bytes: Option<u64>,
    pub backups: Option<usize>,
    pub file_name: Option<String>,
}

/// Where the hardware services are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// Service server on the lab network
    Local,
    /// Hosted service server
    Cloud,
}

/// Resolved configuration with absolute paths and concrete durations
#[derive(Debug, Clone)]
pub struct Settings {
    /// Orchestrator state directory
    pub home: PathBuf,
    /// Task document (tasks + slots)
    pub task_file: PathBuf,
    pub log_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub services: ServiceSettings,
    pub timeouts: Timeouts,
    pub health: HealthSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LogSettings,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub mode: ServiceMode,
    pub local_url: String,
    pub cloud_url: String,
    pub workspace: String,
    pub token_env: String,
    pub incubator_id: String,
    pub arm_id: String,
    pub microscopes: Vec<MicroscopeConfig>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Local,
            local_url: "http://reef.dyn.scilifelab.se:9527".to_string(),
            cloud_url: "https://hypha.aicell.io".to_string(),
            workspace: "reef-imaging".to_string(),
            token_env: "REEF_TOKEN".to_string(),
            incubator_id: "incubator-control".to_string(),
            arm_id: "robotic-arm-control".to_string(),
            microscopes: vec![MicroscopeConfig {
                id: "microscope-control-squid-1".to_string(),
                arm_station: 1,
            }],
        }
    }
}

impl ServiceSettings {
    /// Server URL for the active mode
    pub fn server_url(&self) -> &str {
        match self.mode {
            ServiceMode::Local => &self.local_url,
            ServiceMode::Cloud => &self.cloud_url,
        }
    }

    /// Arm station serving `microscope`
    pub fn arm_station(&self, microscope: &str) -> Option<u8> {
        self.microscopes
            .iter()
            .find(|m| m.id == microscope)
            .map(|m| m.arm_station)
    }

    /// Access token from the configured environment variable
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

/// Hard bounds on hardware calls
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub load: Duration,
    pub unload: Duration,
    pub ping: Duration,
    /// Any single remote call
    pub call: Duration,
    /// Delay between scan status polls
    pub scan_poll: Duration,
    /// Bound on one `scan_get_status` call
    pub scan_status_call: Duration,
    /// Longest a critical section may stay open during shutdown
    pub max_section: Duration,
    /// How long shutdown waits for actors to finish
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let load = Duration::from_secs(120);
        let unload = Duration::from_secs(120);
        Self {
            load,
            unload,
            ping: Duration::from_secs(5),
            call: Duration::from_secs(30),
            scan_poll: Duration::from_secs(10),
            scan_status_call: Duration::from_secs(15),
            max_section: load + unload + DEFAULT_SCAN_TIMEOUT + SECTION_MARGIN,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Consecutive failed pings before a service is marked unreachable
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Longest sleep between ticks
    pub poll_interval: Duration,
    /// Return the plate to its slot after an imaging failure
    pub cleanup_unload_on_imaging_failure: bool,
    /// How often status.json is rewritten
    pub status_interval: Duration,
    /// Reload the task file when it changes on disk
    pub watch_task_file: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            cleanup_unload_on_imaging_failure: true,
            status_interval: Duration::from_secs(10),
            watch_task_file: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Rotate the log file once it reaches this size
    pub max_bytes: u64,
    /// Rotated files to keep
    pub backups: usize,
    pub file_name: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            backups: 5,
            file_name: "orchestrator.log".to_string(),
        }
    }
}

impl Settings {
    /// Default settings rooted at `home`
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            task_file: home.join("tasks.json"),
            log_dir: home.join("logs"),
            home,
            config_file: None,
            services: ServiceSettings::default(),
            timeouts: Timeouts::default(),
            health: HealthSettings::default(),
            scheduler: SchedulerSettings::default(),
            logging: LogSettings::default(),
        }
    }

    /// Status snapshot written by the running orchestrator
    pub fn status_file(&self) -> PathBuf {
        self.home.join("status.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(&self.logging.file_name)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".reef").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn seconds(value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(s) => Duration::try_from_secs_f64(s)
            .with_context(|| format!("Invalid duration in config: {} seconds", s)),
    }
}

/// Merge config file values and environment overrides over the defaults
fn resolve(
    file: Option<(&ConfigFile, &Path)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<Settings> {
    let empty = ConfigFile::default();
    let (config, config_dir) = match file {
        Some((config, path)) => (config, path.parent().map(Path::to_path_buf)),
        None => (&empty, None),
    };
    let relative = |value: &Option<String>| -> Option<PathBuf> {
        let value = value.as_deref()?;
        Some(match config_dir {
            Some(ref dir) => resolve_path(dir, value),
            None => PathBuf::from(value),
        })
    };

    let home = env("REEF_HOME")
        .map(PathBuf::from)
        .or_else(|| relative(&config.paths.home))
        .unwrap_or(default_home);

    let mut settings = Settings::for_home(home);
    settings.config_file = file.map(|(_, path)| path.to_path_buf());

    if let Some(task_file) = env("REEF_TASK_FILE")
        .map(PathBuf::from)
        .or_else(|| relative(&config.paths.task_file))
    {
        settings.task_file = task_file;
    }
    if let Some(log_dir) = relative(&config.paths.log_dir) {
        settings.log_dir = log_dir;
    }

    if let Some(ref s) = config.services {
        let services = &mut settings.services;
        if let Some(mode) = s.mode {
            services.mode = mode;
        }
        for (target, value) in [
            (&mut services.local_url, &s.local_url),
            (&mut services.cloud_url, &s.cloud_url),
            (&mut services.workspace, &s.workspace),
            (&mut services.token_env, &s.token_env),
            (&mut services.incubator_id, &s.incubator_id),
            (&mut services.arm_id, &s.arm_id),
        ] {
            if let Some(v) = value {
                *target = v.clone();
            }
        }
        if !s.microscopes.is_empty() {
            services.microscopes = s.microscopes.clone();
        }
    }

    if let Some(mode) = env("REEF_MODE") {
        settings.services.mode = match mode.to_ascii_lowercase().as_str() {
            "local" => ServiceMode::Local,
            "cloud" => ServiceMode::Cloud,
            other => anyhow::bail!("REEF_MODE must be 'local' or 'cloud', got '{}'", other),
        };
    }

    if let Some(ref t) = config.timeouts {
        let d = Timeouts::default();
        let load = seconds(t.load_seconds, d.load)?;
        let unload = seconds(t.unload_seconds, d.unload)?;
        settings.timeouts = Timeouts {
            load,
            unload,
            ping: seconds(t.ping_seconds, d.ping)?,
            call: seconds(t.call_seconds, d.call)?,
            scan_poll: seconds(t.scan_poll_seconds, d.scan_poll)?,
            scan_status_call: seconds(t.scan_status_call_seconds, d.scan_status_call)?,
            max_section: seconds(
                t.max_section_seconds,
                load + unload + DEFAULT_SCAN_TIMEOUT + SECTION_MARGIN,
            )?,
            shutdown_grace: seconds(t.shutdown_grace_seconds, d.shutdown_grace)?,
        };
    }

    if let Some(ref h) = config.health {
        settings.health.interval = seconds(h.interval_seconds, settings.health.interval)?;
        if let Some(threshold) = h.failure_threshold {
            anyhow::ensure!(threshold > 0, "health.failure_threshold must be at least 1");
            settings.health.failure_threshold = threshold;
        }
    }

    if let Some(ref s) = config.scheduler {
        let sched = &mut settings.scheduler;
        sched.poll_interval = seconds(s.poll_interval_seconds, sched.poll_interval)?;
        sched.status_interval = seconds(s.status_interval_seconds, sched.status_interval)?;
        if let Some(cleanup) = s.cleanup_unload_on_imaging_failure {
            sched.cleanup_unload_on_imaging_failure = cleanup;
        }
        if let Some(watch) = s.watch_task_file {
            sched.watch_task_file = watch;
        }
    }

    if let Some(ref l) = config.logging {
        if let Some(max_bytes) = l.max_bytes {
            settings.logging.max_bytes = max_bytes;
        }
        if let Some(backups) = l.backups {
            settings.logging.backups = backups;
        }
        if let Some(ref name) = l.file_name {
            settings.logging.file_name = name.clone();
        }
    }

    Ok(settings)
}

/// Load configuration from all sources
fn load_config() -> Result<Settings> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".reef");

    let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

    match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            resolve(Some((&config, &path)), env, default_home)
        }
        None => resolve(None, env, default_home),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static Settings> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<Settings> {
    load_config()
}
