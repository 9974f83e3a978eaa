use crate::fm::config::InstancesConfig;
use crate::fm::fsutil::write_atomic;
use crate::fm::logfile;
use crate::fm::pidfile::PidFile;
use crate::fm::probe::{self, Identity};
use crate::fm::process::{self, LaunchSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STOP_WAIT: Duration = Duration::from_secs(3);
const PID_FILE_NAME: &str = "instance.pid";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    GracefulStop,
    Panic,
    TpOnly,
    /// Also absorbs values this manager does not translate into a flag.
    #[default]
    #[serde(other)]
    Normal,
}

impl PositionMode {
    fn flag_value(&self) -> Option<&'static str> {
        match self {
            PositionMode::Normal => None,
            PositionMode::GracefulStop => Some("gs"),
            PositionMode::Panic => Some("p"),
            PositionMode::TpOnly => Some("t"),
        }
    }
}

/// Desired state of one bot instance, as written by the dashboard.
///
/// Field names carry the dashboard's leading underscore; plain names are accepted too. Any other
/// keys in the file are ignored here and preserved when we rewrite `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    #[serde(rename = "_user", alias = "user")]
    pub user: String,
    #[serde(rename = "_symbol", alias = "symbol")]
    pub symbol: String,
    #[serde(rename = "_enabled", alias = "enabled", default)]
    pub enabled: bool,
    #[serde(rename = "_long_mode", alias = "long_mode", default)]
    pub long_mode: PositionMode,
    #[serde(rename = "_short_mode", alias = "short_mode", default)]
    pub short_mode: PositionMode,
    #[serde(rename = "_market_type", alias = "market_type", default = "default_market_type")]
    pub market_type: String,
    #[serde(rename = "_ohlcv", alias = "ohlcv", default = "default_ohlcv")]
    pub ohlcv: bool,
    #[serde(rename = "_co", alias = "co", default = "default_co")]
    pub co: i64,
    #[serde(rename = "_leverage", alias = "leverage", default = "default_leverage")]
    pub leverage: f64,
    #[serde(rename = "_assigned_balance", alias = "assigned_balance", default)]
    pub assigned_balance: f64,
    #[serde(
        rename = "_price_distance_threshold",
        alias = "price_distance_threshold",
        default = "default_price_distance_threshold"
    )]
    pub price_distance_threshold: f64,
    #[serde(rename = "_price_precision", alias = "price_precision", default)]
    pub price_precision: f64,
    #[serde(rename = "_price_step", alias = "price_step", default)]
    pub price_step: f64,
}

fn default_market_type() -> String {
    "swap".to_string()
}
fn default_ohlcv() -> bool {
    true
}
fn default_co() -> i64 {
    -1
}
fn default_leverage() -> f64 {
    7.0
}
fn default_price_distance_threshold() -> f64 {
    0.5
}

impl InstanceDescriptor {
    pub fn new(user: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            symbol: symbol.into(),
            enabled: true,
            long_mode: PositionMode::Normal,
            short_mode: PositionMode::Normal,
            market_type: default_market_type(),
            ohlcv: default_ohlcv(),
            co: default_co(),
            leverage: default_leverage(),
            assigned_balance: 0.0,
            price_distance_threshold: default_price_distance_threshold(),
            price_precision: 0.0,
            price_step: 0.0,
        }
    }

    pub fn parse(raw: &str, source: &Path) -> anyhow::Result<Self> {
        let d: InstanceDescriptor = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("failed to parse instance descriptor {}: {e}", source.display()))?;
        anyhow::ensure!(
            !d.user.trim().is_empty() && !d.symbol.trim().is_empty(),
            "instance descriptor {}: user and symbol must not be empty",
            source.display()
        );
        Ok(d)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read instance descriptor {}: {e}", path.display()))?;
        Self::parse(&raw, path)
    }

    /// Bot flags for every field that differs from the bot's own default, in a fixed order.
    pub fn parameters(&self) -> Vec<String> {
        let mut out: Vec<String> = vec![];
        let mut push = |flag: &str, value: String| {
            out.push(flag.to_string());
            out.push(value);
        };
        if let Some(v) = self.long_mode.flag_value() {
            push("-lm", v.to_string());
        }
        if let Some(v) = self.short_mode.flag_value() {
            push("-sm", v.to_string());
        }
        if self.market_type != "swap" {
            push("-m", "spot".to_string());
        }
        if !self.ohlcv {
            push("-oh", "n".to_string());
        }
        if self.co != -1 {
            push("-co", self.co.to_string());
        }
        if self.leverage != 7.0 {
            push("-lev", self.leverage.to_string());
        }
        if self.assigned_balance != 0.0 {
            push("-ab", self.assigned_balance.to_string());
        }
        if self.price_distance_threshold != 0.5 {
            push("-pt", self.price_distance_threshold.to_string());
        }
        if self.price_precision != 0.0 {
            push("-pp", self.price_precision.to_string());
        }
        if self.price_step != 0.0 {
            push("-ps", self.price_step.to_string());
        }
        out
    }
}

/// Rewrite only the `enabled` flag of a descriptor file, keeping every other key as-is.
pub fn set_enabled_in_descriptor(path: &Path, enabled: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let mut v: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
    let obj = v
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("{} is not a JSON object", path.display()))?;
    // Normalise to the dashboard's key; drop a plain alias so the two can't disagree.
    obj.remove("enabled");
    obj.insert("_enabled".to_string(), serde_json::Value::Bool(enabled));
    let out = serde_json::to_vec_pretty(&v)?;
    write_atomic(path, &out)
}

/// In-memory, per-load view of one enabled instance.
#[derive(Debug, Clone)]
pub struct RunInstance {
    pub user: String,
    pub symbol: String,
    pub parameters: Vec<String>,
    /// Instance directory: holds the descriptor, bot config, log and PID file.
    pub path: PathBuf,
    pid: Option<i32>,
}

impl RunInstance {
    pub fn from_descriptor(path: &Path, d: &InstanceDescriptor) -> Self {
        let mut ri = Self {
            user: d.user.clone(),
            symbol: d.symbol.clone(),
            parameters: d.parameters(),
            path: path.to_path_buf(),
            pid: None,
        };
        ri.pid = ri.pid_file().load();
        ri
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.user, self.symbol)
    }

    pub fn descriptor_path(&self, cfg: &InstancesConfig) -> PathBuf {
        self.path.join(&cfg.descriptor_file)
    }

    pub fn log_path(&self, cfg: &InstancesConfig) -> PathBuf {
        self.path.join(&cfg.log_file)
    }

    pub fn pid_file(&self) -> PidFile {
        PidFile::new(self.path.join(PID_FILE_NAME))
    }

    pub fn identity(&self, cfg: &InstancesConfig) -> Identity {
        Identity::new()
            .substring(cfg.identity_marker.as_str())
            .arg(self.user.as_str())
            .arg(self.symbol.as_str())
    }

    pub fn launch_spec(&self, cfg: &InstancesConfig) -> LaunchSpec {
        let mut argv = cfg.command.clone();
        argv.extend(self.parameters.iter().cloned());
        argv.push(self.user.clone());
        argv.push(self.symbol.clone());
        argv.push(self.path.join(&cfg.config_file).display().to_string());
        LaunchSpec {
            argv,
            working_directory: self.path.clone(),
            log_path: self.log_path(cfg),
            truncate_log: false,
        }
    }

    /// Live PID of this instance's bot, refreshing the cached one.
    pub fn pid(&mut self, cfg: &InstancesConfig) -> Option<i32> {
        self.pid = probe::find(&self.identity(cfg), self.pid);
        self.pid
    }

    pub fn is_running(&mut self, cfg: &InstancesConfig) -> bool {
        self.pid(cfg).is_some()
    }

    /// Spawn the bot unless one is already alive. Returns whether a process was spawned.
    pub fn start(&mut self, cfg: &InstancesConfig) -> anyhow::Result<bool> {
        if self.is_running(cfg) {
            return Ok(false);
        }
        let pid = process::spawn_detached(&self.launch_spec(cfg))?;
        self.pid = Some(pid);
        self.pid_file().save(pid)?;
        Ok(true)
    }

    /// Kill the bot if alive. Returns whether a process was signalled.
    pub fn stop(&mut self, cfg: &InstancesConfig) -> anyhow::Result<bool> {
        let Some(pid) = self.pid(cfg) else {
            return Ok(false);
        };
        process::kill_pid(pid)?;
        process::wait_gone(pid, STOP_WAIT);
        self.pid = None;
        self.pid_file().remove()?;
        Ok(true)
    }

    /// Crash recovery: start again if the process is gone. Returns whether it was (re)started.
    pub fn watch(&mut self, cfg: &InstancesConfig) -> anyhow::Result<bool> {
        self.start(cfg)
    }

    /// Re-read the descriptor from disk (identity and flags may have changed).
    pub fn reload(&mut self, cfg: &InstancesConfig) -> anyhow::Result<InstanceDescriptor> {
        let d = InstanceDescriptor::load(&self.descriptor_path(cfg))?;
        self.user = d.user.clone();
        self.symbol = d.symbol.clone();
        self.parameters = d.parameters();
        Ok(d)
    }

    pub fn rotate_log(&self, cfg: &InstancesConfig) -> anyhow::Result<bool> {
        logfile::rotate_if_oversized(&self.log_path(cfg), cfg.log_rotation_bytes)
    }
}
