use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Path of the YAML file this config was read from (if any). Passed to detached role launches.
    #[serde(skip)]
    pub source_file: Option<PathBuf>,

    pub data_directory: PathBuf,
    /// Where `restart.cmd` / `update.cmd` are published.
    pub command_directory: PathBuf,
    pub pid_directory: PathBuf,
    /// Logs of the manager roles themselves (supervisor.log, queue-runner.log).
    pub log_directory: PathBuf,
    /// Process-wide settings store holding the queue's `autostart` / `cpu`.
    pub settings_file: PathBuf,
    /// Size threshold for the manager's own log before it is moved to `.old`.
    pub daemon_log_max_bytes: u64,

    pub instances: InstancesConfig,
    pub backtest: BacktestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesConfig {
    /// One sub-directory per instance, each holding a descriptor file.
    pub directory: PathBuf,
    pub descriptor_file: String,
    pub config_file: String,
    pub log_file: String,
    /// Bot executable argv prefix. Empty means "not configured"; every start attempt then fails.
    pub command: Vec<String>,
    /// Substring that must appear in some argv element of a live bot process.
    pub identity_marker: String,
    pub log_rotation_bytes: u64,
    pub watch_interval_ms: u64,
    /// Rotate instance logs every Nth watch tick.
    pub log_maintenance_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub queue_directory: PathBuf,
    /// Backtest executable argv prefix; the job's config path is appended.
    pub command: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub identity_marker: String,
    pub log_tail_kib: u64,
    pub tick_interval_ms: u64,
    pub gate_poll_interval_ms: u64,
    /// When true, at most one job may be in its data-preparation phase at a time.
    pub exclusive_preparation: bool,
    pub markers: MarkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MarkersConfig {
    /// Printed by the backtest once data preparation is done and the compute phase starts.
    #[serde(default = "default_compute_started_marker")]
    pub compute_started: String,
    /// Printed only by a backtest that ran to completion.
    #[serde(default = "default_complete_marker")]
    pub complete: String,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            compute_started: default_compute_started_marker(),
            complete: default_complete_marker(),
        }
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    global: Option<GlobalConfigFile>,
    #[serde(default)]
    instances: Option<InstancesConfigFile>,
    #[serde(default)]
    backtest: Option<BacktestConfigFile>,
    #[serde(default)]
    daemon_log: Option<DaemonLogConfigFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    #[serde(default)]
    data_directory: Option<PathBuf>,
    #[serde(default)]
    command_directory: Option<PathBuf>,
    #[serde(default)]
    pid_directory: Option<PathBuf>,
    #[serde(default)]
    log_directory: Option<PathBuf>,
    #[serde(default)]
    settings_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstancesConfigFile {
    #[serde(default)]
    directory: Option<PathBuf>,
    #[serde(default)]
    descriptor_file: Option<String>,
    #[serde(default)]
    config_file: Option<String>,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    identity_marker: Option<String>,
    #[serde(default)]
    log_rotation_size: Option<String>,
    #[serde(default)]
    watch_interval_ms: Option<u64>,
    #[serde(default)]
    log_maintenance_every: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BacktestConfigFile {
    #[serde(default)]
    queue_directory: Option<PathBuf>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    working_directory: Option<PathBuf>,
    #[serde(default)]
    identity_marker: Option<String>,
    #[serde(default)]
    log_tail_kib: Option<u64>,
    #[serde(default)]
    tick_interval_ms: Option<u64>,
    #[serde(default)]
    gate_poll_interval_ms: Option<u64>,
    #[serde(default)]
    exclusive_preparation: Option<bool>,
    #[serde(default)]
    markers: Option<MarkersConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonLogConfigFile {
    #[serde(default)]
    max_size: Option<String>,
}

fn default_data_directory() -> PathBuf {
    "data".into()
}
fn default_descriptor_file() -> String {
    "instance.cfg".to_string()
}
fn default_instance_config_file() -> String {
    "config.json".to_string()
}
fn default_instance_log_file() -> String {
    "bot.log".to_string()
}
fn default_instance_rotation_size() -> String {
    "10MiB".to_string()
}
fn default_daemon_log_size() -> String {
    "1MiB".to_string()
}
fn default_watch_interval_ms() -> u64 {
    5_000
}
fn default_log_maintenance_every() -> u64 {
    2
}
fn default_log_tail_kib() -> u64 {
    50
}
fn default_tick_interval_ms() -> u64 {
    60_000
}
fn default_gate_poll_interval_ms() -> u64 {
    5_000
}
fn default_compute_started_marker() -> String {
    "Starting backtest...".to_string()
}
fn default_complete_marker() -> String {
    "Plotting fills".to_string()
}

/// Basename of the last argv element, e.g. `/opt/pb/passivbot.py` -> `passivbot.py`.
fn marker_from_command(command: &[String]) -> String {
    command
        .last()
        .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
        .unwrap_or_default()
}

pub(crate) fn parse_size_spec_bytes(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    if t.is_empty() {
        anyhow::bail!("empty size");
    }
    if t.chars().all(|c| c.is_ascii_digit()) {
        return Ok(t.parse()?);
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(0);
    if idx == 0 {
        anyhow::bail!("invalid size: {s}");
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s.parse()?;
    // k/m/g (base10) or ki/mi/gi (base2), case-insensitive, optional trailing b.
    let mut unit = unit_s.trim().to_ascii_lowercase();
    if unit.ends_with('b') {
        unit.pop();
    }
    let mult: f64 = match unit.as_str() {
        "" => 1.0,
        "k" => 1000.0,
        "m" => 1000.0_f64.powi(2),
        "g" => 1000.0_f64.powi(3),
        "ki" => 1024.0,
        "mi" => 1024.0_f64.powi(2),
        "gi" => 1024.0_f64.powi(3),
        _ => anyhow::bail!("unknown size unit: {unit_s} (try k/m/g or ki/mi/gi, optional b)"),
    };
    Ok((num * mult).round() as u64)
}

/// Load the master config. A missing file yields defaults (nothing launchable) so that
/// controller subcommands still work on a host without a config.
pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile = match std::fs::read_to_string(config_path) {
        Ok(raw) => serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MasterConfigFile::default(),
        Err(e) => anyhow::bail!("failed to read config {}: {e}", config_path.display()),
    };
    let source_file = config_path.exists().then(|| config_path.to_path_buf());
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    build_master_config(file_cfg, base, source_file)
}

pub fn parse_master_config_yaml(raw: &str, base: &Path) -> anyhow::Result<MasterConfig> {
    let file_cfg: MasterConfigFile =
        serde_yaml::from_str(raw).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
    build_master_config(file_cfg, base, None)
}

fn build_master_config(
    file_cfg: MasterConfigFile,
    base: &Path,
    source_file: Option<PathBuf>,
) -> anyhow::Result<MasterConfig> {
    let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

    let gl = file_cfg.global.unwrap_or_default();
    let data_directory = resolve(gl.data_directory.unwrap_or_else(default_data_directory));
    let under_data = |p: Option<PathBuf>, name: &str| match p {
        Some(p) => resolve(p),
        None => data_directory.join(name),
    };
    let command_directory = under_data(gl.command_directory, "cmd");
    let pid_directory = under_data(gl.pid_directory, "pid");
    let log_directory = under_data(gl.log_directory, "logs");
    let settings_file = under_data(gl.settings_file, "settings.yaml");

    let dl = file_cfg.daemon_log.unwrap_or_default();
    let daemon_log_size = dl.max_size.unwrap_or_else(default_daemon_log_size);
    let daemon_log_max_bytes = parse_size_spec_bytes(&daemon_log_size)
        .map_err(|e| anyhow::anyhow!("invalid daemon_log.max_size {daemon_log_size:?}: {e}"))?;

    let inst = file_cfg.instances.unwrap_or_default();
    let rotation = inst.log_rotation_size.unwrap_or_else(default_instance_rotation_size);
    let log_rotation_bytes = parse_size_spec_bytes(&rotation)
        .map_err(|e| anyhow::anyhow!("invalid instances.log_rotation_size {rotation:?}: {e}"))?;
    let watch_interval_ms = inst.watch_interval_ms.unwrap_or_else(default_watch_interval_ms);
    anyhow::ensure!(watch_interval_ms > 0, "instances.watch_interval_ms must be > 0");
    let log_maintenance_every = inst.log_maintenance_every.unwrap_or_else(default_log_maintenance_every);
    anyhow::ensure!(log_maintenance_every > 0, "instances.log_maintenance_every must be > 0");
    let descriptor_file = inst.descriptor_file.unwrap_or_else(default_descriptor_file);
    anyhow::ensure!(
        !descriptor_file.trim().is_empty() && !descriptor_file.contains('/'),
        "instances.descriptor_file must be a plain file name"
    );
    let instances = InstancesConfig {
        directory: under_data(inst.directory, "instances"),
        descriptor_file,
        config_file: inst.config_file.unwrap_or_else(default_instance_config_file),
        log_file: inst.log_file.unwrap_or_else(default_instance_log_file),
        identity_marker: inst
            .identity_marker
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| marker_from_command(&inst.command)),
        command: inst.command,
        log_rotation_bytes,
        watch_interval_ms,
        log_maintenance_every,
    };

    let bt = file_cfg.backtest.unwrap_or_default();
    let tick_interval_ms = bt.tick_interval_ms.unwrap_or_else(default_tick_interval_ms);
    let gate_poll_interval_ms = bt.gate_poll_interval_ms.unwrap_or_else(default_gate_poll_interval_ms);
    anyhow::ensure!(
        tick_interval_ms > 0 && gate_poll_interval_ms > 0,
        "backtest.tick_interval_ms and backtest.gate_poll_interval_ms must be > 0"
    );
    let markers = bt.markers.unwrap_or_default();
    anyhow::ensure!(
        !markers.complete.is_empty() && !markers.compute_started.is_empty(),
        "backtest.markers must not be empty strings"
    );
    let backtest = BacktestConfig {
        queue_directory: under_data(bt.queue_directory, "bt_queue"),
        identity_marker: bt
            .identity_marker
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| marker_from_command(&bt.command)),
        command: bt.command,
        working_directory: bt.working_directory.map(resolve),
        log_tail_kib: bt.log_tail_kib.unwrap_or_else(default_log_tail_kib).max(1),
        tick_interval_ms,
        gate_poll_interval_ms,
        exclusive_preparation: bt.exclusive_preparation.unwrap_or(true),
        markers,
    };

    Ok(MasterConfig {
        source_file,
        data_directory,
        command_directory,
        pid_directory,
        log_directory,
        settings_file,
        daemon_log_max_bytes,
        instances,
        backtest,
    })
}
