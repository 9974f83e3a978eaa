//! The two long-lived roles (instance supervisor, backtest queue runner) and the handle
//! controllers use to find, launch and kill them.

use crate::fm::build_info;
use crate::fm::config::MasterConfig;
use crate::fm::event::{fm_event, install_role_log};
use crate::fm::pidfile::{LockError, PidFile, PidLock};
use crate::fm::probe::{self, Identity};
use crate::fm::process::{self, LaunchSpec};
use crate::fm::queue::{Gate, JobQueue, TickOutcome};
use crate::fm::settings::SettingsStore;
use crate::fm::supervisor::InstanceSupervisor;
use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time as tokio_time;

const LAUNCH_POLL: Duration = Duration::from_secs(1);
const LAUNCH_ATTEMPTS: u32 = 5;
const STOP_WAIT: Duration = Duration::from_secs(3);
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    QueueRunner,
}

impl Role {
    /// CLI subcommand that runs this role in the foreground.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Role::Supervisor => "supervise",
            Role::QueueRunner => "queue-runner",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Supervisor => "supervisor",
            Role::QueueRunner => "queue-runner",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn role_pid_file(cfg: &MasterConfig, role: Role) -> PidFile {
    PidFile::new(cfg.pid_directory.join(format!("{}.pid", role.as_str())))
}

pub fn role_log_path(cfg: &MasterConfig, role: Role) -> PathBuf {
    cfg.log_directory.join(format!("{}.log", role.as_str()))
}

/// Controller-side view of a role process.
#[derive(Debug, Clone)]
pub struct RoleHandle {
    role: Role,
    exe: PathBuf,
    config_file: Option<PathBuf>,
    pid_file: PidFile,
    log_path: PathBuf,
}

impl RoleHandle {
    pub fn new(cfg: &MasterConfig, role: Role) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        Ok(Self::with_exe(cfg, role, exe))
    }

    pub fn with_exe(cfg: &MasterConfig, role: Role, exe: PathBuf) -> Self {
        Self {
            role,
            exe,
            config_file: cfg.source_file.clone(),
            pid_file: role_pid_file(cfg, role),
            log_path: role_log_path(cfg, role),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identity(&self) -> Identity {
        let exe_name = self
            .exe
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Identity::new().substring(exe_name).arg(self.role.subcommand())
    }

    pub fn launch_spec(&self) -> anyhow::Result<LaunchSpec> {
        let mut argv = vec![self.exe.display().to_string()];
        if let Some(c) = &self.config_file {
            argv.push("-c".to_string());
            argv.push(c.display().to_string());
        }
        argv.push(self.role.subcommand().to_string());
        Ok(LaunchSpec {
            argv,
            working_directory: std::env::current_dir().context("resolve current directory")?,
            log_path: self.log_path.clone(),
            truncate_log: false,
        })
    }

    pub fn pid(&self) -> Option<i32> {
        probe::find(&self.identity(), self.pid_file.load())
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// Start the role detached unless it already runs. Returns the spawned (or existing) PID.
    pub fn launch(&self) -> anyhow::Result<i32> {
        if let Some(pid) = self.pid() {
            return Ok(pid);
        }
        let pid = process::spawn_detached(&self.launch_spec()?)?;
        fm_event(self.role.as_str(), None, format!("launched pid={pid}"));
        Ok(pid)
    }

    /// Launch, then poll once a second until the role is seen alive.
    pub fn launch_and_wait(&self) -> anyhow::Result<i32> {
        self.launch()?;
        for _ in 0..LAUNCH_ATTEMPTS {
            std::thread::sleep(LAUNCH_POLL);
            process::reap_children();
            if let Some(pid) = self.pid() {
                return Ok(pid);
            }
        }
        anyhow::bail!(
            "{} did not come up after {} attempts; see {}",
            self.role,
            LAUNCH_ATTEMPTS,
            self.log_path.display()
        )
    }

    /// SIGKILL the role. Returns whether a process was found.
    pub fn stop(&self) -> anyhow::Result<bool> {
        let Some(pid) = self.pid() else {
            return Ok(false);
        };
        process::kill_pid(pid)?;
        process::wait_gone(pid, STOP_WAIT);
        self.pid_file.remove()?;
        fm_event(self.role.as_str(), None, format!("stopped pid={pid}"));
        Ok(true)
    }

    pub fn restart(&self) -> anyhow::Result<i32> {
        self.stop()?;
        self.launch_and_wait()
    }
}

fn acquire_role_lock(cfg: &MasterConfig, role: Role) -> anyhow::Result<PidLock> {
    match role_pid_file(cfg, role).acquire() {
        Ok(lock) => Ok(lock),
        Err(e @ LockError::Held { .. }) => anyhow::bail!("{role} {e}; refusing to start a second one"),
        Err(LockError::Io(e)) => Err(e.context(format!("{role} singleton lock"))),
    }
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn boot(cfg: &MasterConfig, role: Role) -> anyhow::Result<PidLock> {
    let lock = acquire_role_lock(cfg, role)?;
    install_role_log(&role_log_path(cfg, role), cfg.daemon_log_max_bytes)?;
    fm_event(
        "boot",
        None,
        format!(
            "{} role={role} pid={} config={}",
            build_info::banner(),
            std::process::id(),
            cfg.source_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string())
        ),
    );
    Ok(lock)
}

/// Run the instance supervisor in the foreground until SIGTERM/SIGINT.
pub fn run_supervisor(cfg: &MasterConfig) -> anyhow::Result<()> {
    let _lock = boot(cfg, Role::Supervisor)?;
    build_runtime()?.block_on(run_supervisor_async(cfg.clone()))
}

/// Run the queue runner in the foreground until autostart is turned off or a signal arrives.
pub fn run_queue_runner(cfg: &MasterConfig) -> anyhow::Result<()> {
    let _lock = boot(cfg, Role::QueueRunner)?;
    build_runtime()?.block_on(run_queue_runner_async(cfg.clone()))
}

async fn run_supervisor_async(cfg: MasterConfig) -> anyhow::Result<()> {
    let shutting_down = Arc::new(AtomicBool::new(false));
    start_signal_listener_async(Arc::clone(&shutting_down))?;

    let mut sup = InstanceSupervisor::new(&cfg);
    match sup.load_all() {
        Ok(n) => fm_event(
            "supervisor",
            None,
            format!("loaded enabled={n} dir={}", cfg.instances.directory.display()),
        ),
        Err(e) => fm_event("supervisor", None, format!("load_failed err={e:#}")),
    }
    if cfg.instances.command.is_empty() {
        fm_event("supervisor", None, "instances.command is not configured; nothing can be started");
    }

    let interval = Duration::from_millis(cfg.instances.watch_interval_ms);
    while !shutting_down.load(Ordering::Relaxed) {
        let (back, report) = tokio::task::spawn_blocking(move || {
            let report = sup.tick();
            (sup, report)
        })
        .await
        .context("supervisor tick task")?;
        sup = back;
        if report.commands > 0 || !report.started.is_empty() {
            fm_event(
                "supervisor",
                None,
                format!(
                    "tick commands={} started={} tracked={}",
                    report.commands,
                    report.started.len(),
                    sup.instances().len()
                ),
            );
        }
        sleep_unless_shutdown(interval, &shutting_down).await;
    }
    fm_event("shutdown", None, "signal received; instances keep running detached");
    Ok(())
}

async fn run_queue_runner_async(cfg: MasterConfig) -> anyhow::Result<()> {
    let shutting_down = Arc::new(AtomicBool::new(false));
    start_signal_listener_async(Arc::clone(&shutting_down))?;

    let store = SettingsStore::new(&cfg.settings_file);
    let mut queue = JobQueue::new(&cfg.backtest);
    let tick_interval = Duration::from_millis(cfg.backtest.tick_interval_ms);
    let gate_poll = Duration::from_millis(cfg.backtest.gate_poll_interval_ms);
    let mut last_gate: Option<Gate> = None;

    while !shutting_down.load(Ordering::Relaxed) {
        // One settings snapshot per tick.
        let qc = match store.load() {
            Ok(qc) => qc,
            Err(e) => {
                fm_event("queue", None, format!("settings_unreadable err={e:#}"));
                sleep_unless_shutdown(gate_poll, &shutting_down).await;
                continue;
            }
        };
        let (back, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = queue.tick(&qc);
            (queue, outcome)
        })
        .await
        .context("queue tick task")?;
        queue = back;

        let wait = match outcome {
            Ok(TickOutcome::AutostartOff) => {
                fm_event("queue", None, "autostart is off; exiting");
                return Ok(());
            }
            Ok(TickOutcome::Idle) => {
                last_gate = None;
                tick_interval
            }
            Ok(TickOutcome::Admitted(n)) => {
                last_gate = None;
                fm_event("queue", None, format!("admitted={n} max_concurrency={}", qc.max_concurrency));
                gate_poll
            }
            Ok(TickOutcome::Blocked(gate)) => {
                if last_gate != Some(gate) {
                    fm_event("queue", None, format!("waiting gate={gate}"));
                    last_gate = Some(gate);
                }
                gate_poll
            }
            Err(e) => {
                fm_event("queue", None, format!("tick_failed err={e:#}"));
                tick_interval
            }
        };
        sleep_unless_shutdown(wait, &shutting_down).await;
    }
    fm_event("shutdown", None, "signal received; running jobs keep running detached");
    Ok(())
}

fn start_signal_listener_async(flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        flag.store(true, Ordering::Relaxed);
    });
    Ok(())
}

/// Sleep `total`, waking periodically so a shutdown request is seen promptly.
async fn sleep_unless_shutdown(total: Duration, flag: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && !flag.load(Ordering::Relaxed) {
        let step = left.min(SHUTDOWN_POLL);
        tokio_time::sleep(step).await;
        left = left.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fm::config::parse_master_config_yaml;

    #[test]
    fn role_paths_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = parse_master_config_yaml("{}", dir.path()).unwrap();
        let h = RoleHandle::with_exe(&cfg, Role::QueueRunner, PathBuf::from("/usr/local/bin/fleetmaster"));
        assert_eq!(h.pid_file.path(), dir.path().join("data/pid/queue-runner.pid"));
        assert_eq!(h.log_path, dir.path().join("data/logs/queue-runner.log"));

        let id = h.identity();
        let argv = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(id.matches(&argv(&["/usr/local/bin/fleetmaster", "-c", "/etc/fm.yaml", "queue-runner"])));
        assert!(!id.matches(&argv(&["/usr/local/bin/fleetmaster", "queue", "list"])));
        assert!(!id.matches(&argv(&["/usr/local/bin/fleetmaster", "supervise"])));
    }

    #[test]
    fn launch_spec_reexecs_with_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = parse_master_config_yaml("{}", dir.path()).unwrap();
        cfg.source_file = Some(dir.path().join("fleetmaster.yaml"));
        let h = RoleHandle::with_exe(&cfg, Role::Supervisor, PathBuf::from("/opt/fm/fleetmaster"));
        let spec = h.launch_spec().unwrap();
        assert_eq!(
            spec.argv,
            vec![
                "/opt/fm/fleetmaster".to_string(),
                "-c".to_string(),
                dir.path().join("fleetmaster.yaml").display().to_string(),
                "supervise".to_string(),
            ]
        );
        assert_eq!(spec.log_path, dir.path().join("data/logs/supervisor.log"));
        assert!(!spec.truncate_log);
    }

    #[test]
    fn stopping_an_absent_role_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = parse_master_config_yaml("{}", dir.path()).unwrap();
        let h = RoleHandle::with_exe(&cfg, Role::Supervisor, PathBuf::from("/nonexistent/fleetmaster-test"));
        assert!(!h.is_running());
        assert!(!h.stop().unwrap());
    }

    #[test]
    fn second_role_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = parse_master_config_yaml("{}", dir.path()).unwrap();
        let _held = acquire_role_lock(&cfg, Role::QueueRunner).unwrap();
        let err = acquire_role_lock(&cfg, Role::QueueRunner).unwrap_err();
        assert!(err.to_string().contains("already running"));
        // The other role has its own lock.
        assert!(acquire_role_lock(&cfg, Role::Supervisor).is_ok());
    }

    #[tokio::test]
    async fn shutdown_flag_cuts_sleep_short() {
        let flag = AtomicBool::new(true);
        let started = std::time::Instant::now();
        sleep_unless_shutdown(Duration::from_secs(30), &flag).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
