//! Controller-side operations: edit desired state on disk, publish commands, and report status.
//! Nothing here talks to a running role directly.

use crate::fm::config::MasterConfig;
use crate::fm::daemon::{Role, RoleHandle};
use crate::fm::instance::{set_enabled_in_descriptor, InstanceDescriptor, RunInstance};
use crate::fm::mailbox::{Command, CommandMailbox};
use crate::fm::queue::JobQueue;
use crate::fm::settings::{QueueConfig, SettingsStore};
use crate::fm::status::{infer_instance_status, InstanceStatus};
use crate::fm::supervisor::instance_dirs;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Resolve an instance by directory name (under `instances.directory`) or by path.
pub fn instance_dir(cfg: &MasterConfig, name: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(name);
    let dir = if p.is_absolute() || name.contains('/') {
        p.to_path_buf()
    } else {
        cfg.instances.directory.join(name)
    };
    let descriptor = dir.join(&cfg.instances.descriptor_file);
    anyhow::ensure!(
        descriptor.is_file(),
        "no instance {name:?}: {} does not exist",
        descriptor.display()
    );
    Ok(dir)
}

/// Flip `enabled` on disk only. A running supervisor drops a disabled instance on its next tick
/// but only picks up a newly enabled one on reload or restart.
pub fn enable_instance(cfg: &MasterConfig, name: &str) -> anyhow::Result<String> {
    let dir = instance_dir(cfg, name)?;
    set_enabled_in_descriptor(&dir.join(&cfg.instances.descriptor_file), true)?;
    Ok(format!("{name} enabled"))
}

pub fn disable_instance(cfg: &MasterConfig, name: &str) -> anyhow::Result<String> {
    let dir = instance_dir(cfg, name)?;
    set_enabled_in_descriptor(&dir.join(&cfg.instances.descriptor_file), false)?;
    Ok(format!("{name} disabled"))
}

/// Enable and ask the supervisor to pick the instance up now.
pub fn start_instance(cfg: &MasterConfig, name: &str) -> anyhow::Result<String> {
    set_and_publish(cfg, name, true)?;
    Ok(format!("{name} start requested"))
}

/// Disable and ask the supervisor to stop and drop the instance now.
pub fn stop_instance(cfg: &MasterConfig, name: &str) -> anyhow::Result<String> {
    set_and_publish(cfg, name, false)?;
    Ok(format!("{name} stop requested"))
}

fn set_and_publish(cfg: &MasterConfig, name: &str, enabled: bool) -> anyhow::Result<()> {
    let dir = instance_dir(cfg, name)?;
    set_enabled_in_descriptor(&dir.join(&cfg.instances.descriptor_file), enabled)?;
    CommandMailbox::new(&cfg.command_directory).publish(&Command::update(dir, enabled))
}

pub fn restart_instance(cfg: &MasterConfig, user: &str, symbol: &str) -> anyhow::Result<String> {
    CommandMailbox::new(&cfg.command_directory).publish(&Command::restart(user, symbol))?;
    Ok(format!("restart requested for {user}/{symbol}"))
}

/// Publish a raw update command, exactly as a dashboard would.
pub fn publish_update(cfg: &MasterConfig, path: &Path, enabled: bool) -> anyhow::Result<String> {
    CommandMailbox::new(&cfg.command_directory).publish(&Command::update(path, enabled))?;
    Ok(format!("update published path={} enabled={enabled}", path.display()))
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRow {
    pub name: String,
    pub user: String,
    pub symbol: String,
    pub enabled: bool,
    pub status: InstanceStatus,
    pub pid: Option<i32>,
    pub parameters: String,
    pub path: PathBuf,
}

/// Every descriptor under the instances directory with its liveness. Unreadable ones are
/// reported as errors in the second list instead of failing the whole listing.
pub fn instance_status(cfg: &MasterConfig) -> anyhow::Result<(Vec<InstanceRow>, Vec<String>)> {
    let mut rows = vec![];
    let mut problems = vec![];
    for dir in instance_dirs(&cfg.instances.directory)? {
        let d = match InstanceDescriptor::load(&dir.join(&cfg.instances.descriptor_file)) {
            Ok(d) => d,
            Err(e) => {
                problems.push(format!("{e:#}"));
                continue;
            }
        };
        let mut ri = RunInstance::from_descriptor(&dir, &d);
        let pid = ri.pid(&cfg.instances);
        rows.push(InstanceRow {
            name: dir
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            user: d.user.clone(),
            symbol: d.symbol.clone(),
            enabled: d.enabled,
            status: infer_instance_status(pid.is_some(), d.enabled),
            pid,
            parameters: ri.parameters.join(" "),
            path: dir,
        });
    }
    Ok((rows, problems))
}

/// Persist autostart and start or stop the runner to match.
pub fn set_queue_autostart(cfg: &MasterConfig, on: bool) -> anyhow::Result<String> {
    let qc = SettingsStore::new(&cfg.settings_file).set_autostart(on)?;
    let runner = RoleHandle::new(cfg, Role::QueueRunner)?;
    if on {
        let pid = runner.launch_and_wait()?;
        Ok(format!("autostart on; queue-runner running pid={pid} max_concurrency={}", qc.max_concurrency))
    } else {
        let stopped = runner.stop()?;
        Ok(format!(
            "autostart off; queue-runner {}",
            if stopped { "stopped" } else { "was not running" }
        ))
    }
}

pub fn set_queue_cpu(cfg: &MasterConfig, cpu: i64) -> anyhow::Result<String> {
    let qc = SettingsStore::new(&cfg.settings_file).set_cpu(cpu)?;
    Ok(if (cpu as u64) > qc.max_concurrency as u64 {
        format!("cpu={cpu} saved; clamped to {} on this host", qc.max_concurrency)
    } else {
        format!("cpu={cpu} saved")
    })
}

/// Drop complete jobs (or everything, with `all`). A full flush stops the runner first; when
/// autostart is still on the runner is started again afterwards, even for an empty queue.
pub fn clean_queue(cfg: &MasterConfig, all: bool) -> anyhow::Result<String> {
    let runner = RoleHandle::new(cfg, Role::QueueRunner)?;
    clean_queue_with(cfg, &runner, all)
}

pub fn clean_queue_with(cfg: &MasterConfig, runner: &RoleHandle, all: bool) -> anyhow::Result<String> {
    if all {
        runner.stop()?;
    }
    let mut queue = JobQueue::new(&cfg.backtest);
    queue.load()?;
    let removed = queue.remove_finished(all)?;
    let mut msg = format!("removed {removed} job(s), {} left", queue.len());
    if SettingsStore::new(&cfg.settings_file).load()?.autostart {
        let pid = runner.launch()?;
        msg.push_str(&format!("; queue-runner pid={pid}"));
    }
    Ok(msg)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerState {
    pub running: bool,
    pub pid: Option<i32>,
    pub autostart: bool,
    pub max_concurrency: usize,
}

pub fn runner_state(cfg: &MasterConfig) -> anyhow::Result<RunnerState> {
    let QueueConfig {
        autostart,
        max_concurrency,
    } = SettingsStore::new(&cfg.settings_file).load()?;
    let pid = RoleHandle::new(cfg, Role::QueueRunner)?.pid();
    Ok(RunnerState {
        running: pid.is_some(),
        pid,
        autostart,
        max_concurrency,
    })
}
