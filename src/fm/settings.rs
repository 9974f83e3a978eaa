use crate::fm::fsutil::{read_to_string_opt, write_atomic};
use crate::fm::probe::logical_cpu_count;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

const SECTION: &str = "backtest";

/// Queue-wide knobs as seen at the start of one tick. Never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub autostart: bool,
    /// Already clamped to `[1, logical CPUs]`.
    pub max_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            autostart: false,
            max_concurrency: 1,
        }
    }
}

/// Requested worker count, clamped down to what the host has (and up to 1).
pub fn clamp_cpu(requested: i64, available: usize) -> usize {
    let available = available.max(1);
    if requested < 1 {
        return 1;
    }
    (requested as u64).min(available as u64) as usize
}

/// Owner of the persisted `backtest: {autostart, cpu}` section of the shared settings document.
///
/// Other top-level keys belong to other tools and are written back untouched.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_doc(&self) -> anyhow::Result<Value> {
        let Some(raw) = read_to_string_opt(&self.path)? else {
            return Ok(Value::Mapping(Mapping::new()));
        };
        if raw.trim().is_empty() {
            return Ok(Value::Mapping(Mapping::new()));
        }
        let doc: Value = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse settings {}: {e}", self.path.display()))?;
        anyhow::ensure!(
            doc.is_mapping(),
            "settings {} must be a YAML mapping at the top level",
            self.path.display()
        );
        Ok(doc)
    }

    /// Snapshot with `cpu` clamped against the CPUs online right now.
    pub fn load(&self) -> anyhow::Result<QueueConfig> {
        let doc = self.read_doc()?;
        let section = doc.get(SECTION);
        let autostart = section
            .and_then(|s| s.get("autostart"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let cpu = section.and_then(|s| s.get("cpu")).and_then(Value::as_i64).unwrap_or(1);
        Ok(QueueConfig {
            autostart,
            max_concurrency: clamp_cpu(cpu, logical_cpu_count()),
        })
    }

    pub fn set_autostart(&self, on: bool) -> anyhow::Result<QueueConfig> {
        self.update(|m| {
            m.insert(Value::from("autostart"), Value::from(on));
        })?;
        self.load()
    }

    /// Persist the requested value as given; clamping happens on read.
    pub fn set_cpu(&self, cpu: i64) -> anyhow::Result<QueueConfig> {
        anyhow::ensure!(cpu >= 1, "cpu must be >= 1 (got {cpu})");
        self.update(|m| {
            m.insert(Value::from("cpu"), Value::from(cpu));
        })?;
        self.load()
    }

    fn update(&self, f: impl FnOnce(&mut Mapping)) -> anyhow::Result<()> {
        let mut doc = self.read_doc()?;
        let root = doc
            .as_mapping_mut()
            .ok_or_else(|| anyhow::anyhow!("settings {} is not a mapping", self.path.display()))?;
        let key = Value::from(SECTION);
        if !root.get(&key).is_some_and(Value::is_mapping) {
            let mut fresh = Mapping::new();
            fresh.insert(Value::from("autostart"), Value::from(false));
            fresh.insert(Value::from("cpu"), Value::from(1));
            root.insert(key.clone(), Value::Mapping(fresh));
        }
        if let Some(Value::Mapping(section)) = root.get_mut(&key) {
            f(section);
        }
        let out = serde_yaml::to_string(&doc)?;
        write_atomic(&self.path, out.as_bytes())
    }
}
