//! Backtest job queue: descriptors in a directory, admitted in arrival order under two gates
//! (worker limit, and optionally one job at a time in data preparation).

use crate::fm::config::BacktestConfig;
use crate::fm::event::fm_event;
use crate::fm::fsutil::{remove_file_opt, write_atomic};
use crate::fm::logfile;
use crate::fm::pidfile::PidFile;
use crate::fm::probe::{self, Identity};
use crate::fm::process::{self, LaunchSpec};
use crate::fm::settings::QueueConfig;
use crate::fm::status::{infer_job_status, JobStatus};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const STOP_WAIT: Duration = Duration::from_secs(3);

/// On-disk queue entry (`<queue_dir>/<filename>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    /// Unique id; also the stem of the descriptor, log and PID files.
    pub filename: String,
    /// Backtest config handed to the executable.
    pub json: PathBuf,
    #[serde(default)]
    pub exchange: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BacktestJob {
    pub descriptor: JobDescriptor,
    dir: PathBuf,
    queued_at: Option<SystemTime>,
    pid: Option<i32>,
    /// Worker already seen in the compute phase; its marker may since have left the tail window.
    computing: Option<i32>,
}

impl BacktestJob {
    pub fn new(dir: &Path, descriptor: JobDescriptor, queued_at: Option<SystemTime>) -> Self {
        Self {
            descriptor,
            dir: dir.to_path_buf(),
            queued_at,
            pid: None,
            computing: None,
        }
    }

    pub fn filename(&self) -> &str {
        &self.descriptor.filename
    }

    pub fn queued_at(&self) -> Option<SystemTime> {
        self.queued_at
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.descriptor.filename))
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.descriptor.filename))
    }

    pub fn pid_file(&self) -> PidFile {
        PidFile::new(self.dir.join(format!("{}.pid", self.descriptor.filename)))
    }

    pub fn identity(&self, cfg: &BacktestConfig) -> Identity {
        Identity::new()
            .substring(cfg.identity_marker.as_str())
            .arg(self.descriptor.json.display().to_string())
    }

    pub fn launch_spec(&self, cfg: &BacktestConfig) -> LaunchSpec {
        let mut argv = cfg.command.clone();
        argv.push(self.descriptor.json.display().to_string());
        LaunchSpec {
            argv,
            working_directory: cfg.working_directory.clone().unwrap_or_else(|| self.dir.clone()),
            log_path: self.log_path(),
            truncate_log: true,
        }
    }

    /// PID of the live worker. Only the recorded PID is probed: several queue entries may point at
    /// the same config file, so a table scan could attribute another job's worker to this one.
    ///
    /// A cached PID that is gone is re-read from the PID file, which another controller may have
    /// rewritten after starting the job itself.
    pub fn pid(&mut self, cfg: &BacktestConfig) -> Option<i32> {
        let identity = self.identity(cfg);
        if let Some(pid) = self.pid {
            if probe::probe_pid(&identity, pid) {
                return Some(pid);
            }
        }
        let recorded = self.pid_file().load()?;
        if Some(recorded) != self.pid {
            self.pid = Some(recorded);
            if probe::probe_pid(&identity, recorded) {
                return Some(recorded);
            }
        }
        None
    }

    pub fn is_running(&mut self, cfg: &BacktestConfig) -> bool {
        self.pid(cfg).is_some()
    }

    pub fn log_tail(&self, kib: u64) -> Option<String> {
        match logfile::read_tail(&self.log_path(), kib) {
            Ok(t) => t,
            Err(e) => {
                fm_event("queue", Some(self.filename()), format!("log_unreadable err={e:#}"));
                None
            }
        }
    }

    pub fn status(&mut self, cfg: &BacktestConfig) -> JobStatus {
        let pid = self.pid(cfg);
        let tail = self.log_tail(cfg.log_tail_kib);
        let status = infer_job_status(pid.is_some(), tail.as_deref(), &cfg.markers);
        match (pid, status) {
            (Some(p), JobStatus::Running) => {
                self.computing = Some(p);
                status
            }
            (Some(p), JobStatus::Preparing) if self.computing == Some(p) => JobStatus::Running,
            _ => status,
        }
    }

    /// Start the worker with a fresh log. No-op (returns `None`) if it is alive or already complete.
    pub fn run(&mut self, cfg: &BacktestConfig) -> anyhow::Result<Option<i32>> {
        match self.status(cfg) {
            JobStatus::Complete | JobStatus::Preparing | JobStatus::Running => return Ok(None),
            JobStatus::NotStarted | JobStatus::Error => {}
        }
        let pid = process::spawn_detached(&self.launch_spec(cfg))?;
        self.pid = Some(pid);
        self.pid_file().save(pid)?;
        Ok(Some(pid))
    }

    pub fn stop(&mut self, cfg: &BacktestConfig) -> anyhow::Result<bool> {
        let Some(pid) = self.pid(cfg) else {
            return Ok(false);
        };
        process::kill_pid(pid)?;
        process::wait_gone(pid, STOP_WAIT);
        Ok(true)
    }

    /// Stop, then delete descriptor, log and PID file.
    pub fn remove(&mut self, cfg: &BacktestConfig) -> anyhow::Result<()> {
        self.stop(cfg)?;
        remove_file_opt(&self.descriptor_path())?;
        remove_file_opt(&self.log_path())?;
        self.pid_file().remove()?;
        self.pid = None;
        Ok(())
    }
}

/// Why a tick stopped admitting jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    WorkerLimit { active: usize, limit: usize },
    Preparing,
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gate::WorkerLimit { active, limit } => write!(f, "worker_limit active={active} limit={limit}"),
            Gate::Preparing => f.write_str("preparing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Autostart is off; the runner should exit.
    AutostartOff,
    /// Nothing waiting to be admitted.
    Idle,
    /// Jobs started this tick; more may be waiting.
    Admitted(usize),
    /// A job is waiting but a gate is closed.
    Blocked(Gate),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRow {
    pub name: String,
    pub filename: String,
    pub status: JobStatus,
    pub pid: Option<i32>,
    pub queued_at: Option<String>,
    pub exchange: Vec<String>,
}

#[derive(Debug)]
pub struct JobQueue {
    cfg: BacktestConfig,
    jobs: Vec<BacktestJob>,
}

impl JobQueue {
    pub fn new(cfg: &BacktestConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            jobs: vec![],
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.cfg
    }

    pub fn dir(&self) -> &Path {
        &self.cfg.queue_directory
    }

    pub fn jobs(&self) -> &[BacktestJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Re-read the queue directory. Unreadable descriptors are logged and skipped.
    /// Cached PIDs of jobs that are still queued survive the reload.
    pub fn load(&mut self) -> anyhow::Result<()> {
        let dir = self.cfg.queue_directory.clone();
        let rd = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.jobs.clear();
                return Ok(());
            }
            Err(e) => anyhow::bail!("failed to read queue directory {}: {e}", dir.display()),
        };
        let mut found: Vec<BacktestJob> = vec![];
        for ent in rd.flatten() {
            let path = ent.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(s) => s,
                Err(e) => {
                    fm_event("queue", None, format!("skip_descriptor path={} err={e}", path.display()));
                    continue;
                }
            };
            let d: JobDescriptor = match serde_json::from_str(&raw) {
                Ok(d) => d,
                Err(e) => {
                    fm_event("queue", None, format!("skip_descriptor path={} err={e}", path.display()));
                    continue;
                }
            };
            if d.filename.trim().is_empty() || d.filename.contains('/') {
                fm_event(
                    "queue",
                    None,
                    format!("skip_descriptor path={} err=invalid filename {:?}", path.display(), d.filename),
                );
                continue;
            }
            let queued_at = ent.metadata().ok().and_then(|m| m.modified().ok());
            found.push(BacktestJob::new(&dir, d, queued_at));
        }
        found.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.descriptor.filename.cmp(&b.descriptor.filename))
        });

        let previous = std::mem::take(&mut self.jobs);
        for mut job in found {
            if let Some(old) = previous.iter().find(|o| o.filename() == job.filename()) {
                job.pid = old.pid;
                job.computing = old.computing;
            }
            self.add(job);
        }
        Ok(())
    }

    /// Append `job` unless one with the same filename is already queued. Returns whether it was added.
    pub fn add(&mut self, job: BacktestJob) -> bool {
        if self.jobs.iter().any(|j| j.filename() == job.filename()) {
            return false;
        }
        self.jobs.push(job);
        true
    }

    /// Write a new descriptor with a fresh id and queue it.
    pub fn enqueue(&mut self, name: &str, json: &Path, exchange: Vec<String>) -> anyhow::Result<JobDescriptor> {
        anyhow::ensure!(!name.trim().is_empty(), "job name must not be empty");
        let d = JobDescriptor {
            name: name.to_string(),
            filename: uuid::Uuid::new_v4().to_string(),
            json: json.to_path_buf(),
            exchange,
        };
        let job = BacktestJob::new(&self.cfg.queue_directory, d.clone(), Some(SystemTime::now()));
        write_atomic(&job.descriptor_path(), &serde_json::to_vec_pretty(&d)?)?;
        fm_event("queue", Some(&d.filename), format!("enqueued name={} json={}", d.name, d.json.display()));
        self.add(job);
        Ok(d)
    }

    fn position(&self, filename: &str) -> anyhow::Result<usize> {
        self.jobs
            .iter()
            .position(|j| j.filename() == filename)
            .ok_or_else(|| anyhow::anyhow!("no queued job with filename {filename:?}"))
    }

    pub fn status_of(&mut self, filename: &str) -> anyhow::Result<JobStatus> {
        let i = self.position(filename)?;
        Ok(self.jobs[i].status(&self.cfg))
    }

    /// Start one job by hand, regardless of the gates. Returns the new PID, if one was spawned.
    pub fn run_job(&mut self, filename: &str) -> anyhow::Result<Option<i32>> {
        let i = self.position(filename)?;
        let pid = self.jobs[i].run(&self.cfg)?;
        if let Some(pid) = pid {
            fm_event("queue", Some(filename), format!("started pid={pid} (manual)"));
        }
        Ok(pid)
    }

    pub fn stop_job(&mut self, filename: &str) -> anyhow::Result<bool> {
        let i = self.position(filename)?;
        self.jobs[i].stop(&self.cfg)
    }

    pub fn remove(&mut self, filename: &str) -> anyhow::Result<()> {
        let i = self.position(filename)?;
        self.jobs[i].remove(&self.cfg)?;
        self.jobs.remove(i);
        fm_event("queue", Some(filename), "removed");
        Ok(())
    }

    /// Drop complete jobs; with `all`, also stop and drop everything else. Returns how many went.
    pub fn remove_finished(&mut self, all: bool) -> anyhow::Result<usize> {
        let mut removed = 0;
        let mut kept: Vec<BacktestJob> = vec![];
        for mut job in std::mem::take(&mut self.jobs) {
            let done = job.status(&self.cfg) == JobStatus::Complete;
            if !(done || all) {
                kept.push(job);
                continue;
            }
            if let Err(e) = job.remove(&self.cfg) {
                fm_event("queue", Some(job.filename()), format!("remove_failed err={e:#}"));
                kept.push(job);
                continue;
            }
            fm_event("queue", Some(job.filename()), if done { "removed complete" } else { "removed" });
            removed += 1;
        }
        self.jobs = kept;
        Ok(removed)
    }

    pub fn active_count(&mut self) -> usize {
        let cfg = &self.cfg;
        self.jobs
            .iter_mut()
            .map(|j| j.status(cfg))
            .filter(JobStatus::is_active)
            .count()
    }

    pub fn any_preparing(&mut self) -> bool {
        let cfg = &self.cfg;
        self.jobs.iter_mut().any(|j| j.status(cfg) == JobStatus::Preparing)
    }

    fn closed_gate(&mut self, qc: &QueueConfig) -> Option<Gate> {
        let active = self.active_count();
        if active >= qc.max_concurrency {
            return Some(Gate::WorkerLimit {
                active,
                limit: qc.max_concurrency,
            });
        }
        if self.cfg.exclusive_preparation && self.any_preparing() {
            return Some(Gate::Preparing);
        }
        None
    }

    /// One admission pass over the queue in arrival order.
    ///
    /// Only `not started` jobs are admitted; a job that ended in `error` stays put until it is
    /// rerun or removed by hand. Spawn failures are logged and retried on a later tick.
    pub fn tick(&mut self, qc: &QueueConfig) -> anyhow::Result<TickOutcome> {
        if !qc.autostart {
            return Ok(TickOutcome::AutostartOff);
        }
        process::reap_children();
        self.load()?;
        let mut admitted = 0usize;
        for i in 0..self.jobs.len() {
            if self.jobs[i].status(&self.cfg) != JobStatus::NotStarted {
                continue;
            }
            if let Some(gate) = self.closed_gate(qc) {
                return Ok(if admitted > 0 {
                    TickOutcome::Admitted(admitted)
                } else {
                    TickOutcome::Blocked(gate)
                });
            }
            let cfg = &self.cfg;
            let job = &mut self.jobs[i];
            match job.run(cfg) {
                Ok(Some(pid)) => {
                    fm_event(
                        "queue",
                        Some(job.filename()),
                        format!("started pid={pid} name={}", job.descriptor.name),
                    );
                    admitted += 1;
                }
                Ok(None) => {}
                Err(e) => fm_event("queue", Some(job.filename()), format!("start_failed err={e:#}")),
            }
        }
        Ok(if admitted > 0 {
            TickOutcome::Admitted(admitted)
        } else {
            TickOutcome::Idle
        })
    }

    /// Tail of a job's log for display, newest line first when `reverse`.
    pub fn job_log(&self, filename: &str, kib: u64, reverse: bool) -> anyhow::Result<Option<String>> {
        let i = self.position(filename)?;
        let tail = logfile::read_tail(&self.jobs[i].log_path(), kib)?;
        Ok(tail.map(|t| if reverse { logfile::reverse_lines(&t) } else { t }))
    }

    pub fn status_rows(&mut self) -> Vec<JobRow> {
        let cfg = &self.cfg;
        self.jobs
            .iter_mut()
            .map(|j| {
                let status = j.status(cfg);
                JobRow {
                    name: j.descriptor.name.clone(),
                    filename: j.descriptor.filename.clone(),
                    status,
                    pid: j.pid(cfg),
                    queued_at: j
                        .queued_at
                        .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string()),
                    exchange: j.descriptor.exchange.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fm::config::parse_master_config_yaml;
    use std::time::Instant;

    /// Stand-in backtest: `$1` is the job config. It prints the compute marker once `$1.compute`
    /// exists (immediately if `fast`), then finishes once `$1.go` exists. Bounded to ~30s.
    const FAKE_BACKTEST: &str = r#"
i=0
while [ ! -f "$1.compute" ] && [ "$FM_FAST" != 1 ] && [ $i -lt 300 ]; do sleep 0.1; i=$((i+1)); done
echo 'Starting backtest...'
while [ ! -f "$1.go" ] && [ $i -lt 600 ]; do sleep 0.1; i=$((i+1)); done
echo 'Plotting fills'
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        queue: JobQueue,
    }

    impl Fixture {
        fn new(fast: bool, exclusive: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let marker = format!("fm-bt-{}-{}", std::process::id(), dir.path().display());
            let script = if fast {
                format!("FM_FAST=1\n{FAKE_BACKTEST}")
            } else {
                FAKE_BACKTEST.to_string()
            };
            let yaml = format!(
                "backtest:\n  command: [sh, -c, {script:?}, {marker:?}]\n  identity_marker: {marker:?}\n  exclusive_preparation: {exclusive}\n"
            );
            let cfg = parse_master_config_yaml(&yaml, dir.path()).unwrap();
            let queue = JobQueue::new(&cfg.backtest);
            Self { dir, queue }
        }

        fn config_path(&self, n: usize) -> PathBuf {
            self.dir.path().join(format!("bt{n}.json"))
        }

        fn enqueue(&mut self, n: usize) -> String {
            let p = self.config_path(n);
            std::fs::write(&p, "{}").unwrap();
            let d = self.queue.enqueue(&format!("job{n}"), &p, vec!["binance".into()]).unwrap();
            // Distinct arrival times regardless of filesystem timestamp granularity.
            let f = std::fs::File::options()
                .write(true)
                .open(self.queue.dir().join(format!("{}.json", d.filename)))
                .unwrap();
            f.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 + n as u64)).unwrap();
            d.filename
        }

        fn touch(&self, n: usize, suffix: &str) {
            std::fs::write(format!("{}.{suffix}", self.config_path(n).display()), "").unwrap();
        }

        fn statuses(&mut self) -> Vec<JobStatus> {
            self.queue.status_rows().into_iter().map(|r| r.status).collect()
        }

        fn wait_for(&mut self, what: &str, mut cond: impl FnMut(&mut Self) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !cond(self) {
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
                process::reap_children();
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.queue.remove_finished(true);
        }
    }

    fn qc(max: usize) -> QueueConfig {
        QueueConfig {
            autostart: true,
            max_concurrency: max,
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut fx = Fixture::new(true, true);
        let id = fx.enqueue(1);
        let job = fx.queue.jobs()[0].clone();
        assert!(!fx.queue.add(job));
        assert_eq!(fx.queue.len(), 1);
        fx.queue.load().unwrap();
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.queue.jobs()[0].filename(), id);
    }

    #[test]
    fn load_orders_by_arrival_and_skips_corrupt() {
        let mut fx = Fixture::new(true, true);
        let third = fx.enqueue(3);
        let first = fx.enqueue(1);
        let second = fx.enqueue(2);
        std::fs::write(fx.queue.dir().join("broken.json"), "{oops").unwrap();
        std::fs::write(fx.queue.dir().join("notes.txt"), "ignored").unwrap();

        let mut fresh = JobQueue::new(fx.queue.config());
        fresh.load().unwrap();
        let order: Vec<&str> = fresh.jobs().iter().map(|j| j.filename()).collect();
        assert_eq!(order, vec![first.as_str(), second.as_str(), third.as_str()]);
    }

    #[test]
    fn autostart_off_stops_the_runner() {
        let mut fx = Fixture::new(true, true);
        fx.enqueue(1);
        let outcome = fx.queue.tick(&QueueConfig::default()).unwrap();
        assert_eq!(outcome, TickOutcome::AutostartOff);
        assert_eq!(fx.statuses(), vec![JobStatus::NotStarted]);
    }

    #[test]
    fn three_jobs_one_worker() {
        let mut fx = Fixture::new(true, true);
        fx.enqueue(1);
        fx.enqueue(2);
        fx.enqueue(3);

        assert_eq!(fx.queue.tick(&qc(1)).unwrap(), TickOutcome::Admitted(1));
        fx.wait_for("first job to reach compute", |f| f.statuses()[0] == JobStatus::Running);
        assert_eq!(
            fx.statuses(),
            vec![JobStatus::Running, JobStatus::NotStarted, JobStatus::NotStarted]
        );
        assert_eq!(
            fx.queue.tick(&qc(1)).unwrap(),
            TickOutcome::Blocked(Gate::WorkerLimit { active: 1, limit: 1 })
        );

        fx.touch(1, "go");
        fx.wait_for("first job to finish", |f| f.statuses()[0] == JobStatus::Complete);

        assert_eq!(fx.queue.tick(&qc(1)).unwrap(), TickOutcome::Admitted(1));
        let st = fx.statuses();
        assert_eq!(st[0], JobStatus::Complete);
        assert!(st[1].is_active());
        assert_eq!(st[2], JobStatus::NotStarted);
    }

    #[test]
    fn active_jobs_never_exceed_the_limit() {
        let mut fx = Fixture::new(true, false);
        for n in 1..=5 {
            fx.enqueue(n);
        }
        for _ in 0..4 {
            fx.queue.tick(&qc(2)).unwrap();
            assert!(fx.queue.active_count() <= 2);
            std::thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(fx.queue.active_count(), 2);
    }

    #[test]
    fn only_one_job_prepares_at_a_time() {
        let mut fx = Fixture::new(false, true);
        for n in 1..=3 {
            fx.enqueue(n);
        }
        assert_eq!(fx.queue.tick(&qc(3)).unwrap(), TickOutcome::Admitted(1));
        assert_eq!(fx.queue.tick(&qc(3)).unwrap(), TickOutcome::Blocked(Gate::Preparing));
        let preparing = fx.statuses().iter().filter(|s| **s == JobStatus::Preparing).count();
        assert_eq!(preparing, 1);

        fx.touch(1, "compute");
        fx.wait_for("first job to leave preparation", |f| f.statuses()[0] == JobStatus::Running);
        assert_eq!(fx.queue.tick(&qc(3)).unwrap(), TickOutcome::Admitted(1));
        let st = fx.statuses();
        assert_eq!(st.iter().filter(|s| **s == JobStatus::Preparing).count(), 1);
        assert_eq!(st[2], JobStatus::NotStarted);
    }

    #[test]
    fn preparation_gate_can_be_disabled() {
        let mut fx = Fixture::new(false, false);
        for n in 1..=2 {
            fx.enqueue(n);
        }
        assert_eq!(fx.queue.tick(&qc(2)).unwrap(), TickOutcome::Admitted(2));
    }

    #[test]
    fn missing_executable_leaves_job_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = parse_master_config_yaml("{}", dir.path()).unwrap();
        let mut q = JobQueue::new(&cfg.backtest);
        let cfg_file = dir.path().join("bt.json");
        let d = q.enqueue("job", &cfg_file, vec![]).unwrap();
        assert_eq!(q.tick(&qc(1)).unwrap(), TickOutcome::Idle);
        assert_eq!(q.status_of(&d.filename).unwrap(), JobStatus::NotStarted);
    }

    #[test]
    fn remove_deletes_every_artifact() {
        let mut fx = Fixture::new(false, true);
        let id = fx.enqueue(1);
        let pid = fx.queue.run_job(&id).unwrap().unwrap();
        assert_eq!(fx.queue.run_job(&id).unwrap(), None);
        let job = fx.queue.jobs()[0].clone();

        fx.queue.remove(&id).unwrap();
        assert!(fx.queue.is_empty());
        assert!(process::wait_gone(pid, Duration::from_secs(5)));
        assert!(!job.descriptor_path().exists());
        assert!(!job.log_path().exists());
        assert!(!job.pid_file().path().exists());
        assert!(fx.queue.remove(&id).is_err());
    }

    #[test]
    fn clean_keeps_unfinished_unless_all() {
        let mut fx = Fixture::new(true, false);
        let done = fx.enqueue(1);
        let waiting = fx.enqueue(2);
        fx.queue.run_job(&done).unwrap();
        fx.touch(1, "go");
        fx.wait_for("job to complete", |f| f.queue.status_of(&done).unwrap() == JobStatus::Complete);
        // A complete job is never rerun.
        assert_eq!(fx.queue.run_job(&done).unwrap(), None);

        assert_eq!(fx.queue.remove_finished(false).unwrap(), 1);
        assert_eq!(fx.queue.jobs()[0].filename(), waiting);
        assert_eq!(fx.queue.remove_finished(true).unwrap(), 1);
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn job_log_is_fresh_per_run_and_reversible() {
        let mut fx = Fixture::new(true, false);
        let id = fx.enqueue(1);
        let log = fx.queue.jobs()[0].log_path();
        std::fs::write(&log, "stale output from an earlier run\n").unwrap();
        fx.queue.run_job(&id).unwrap();
        fx.touch(1, "go");
        fx.wait_for("job to complete", |f| f.queue.status_of(&id).unwrap() == JobStatus::Complete);

        let text = fx.queue.job_log(&id, 50, false).unwrap().unwrap();
        assert!(!text.contains("stale"));
        assert_eq!(text, "Starting backtest...\nPlotting fills\n");
        let rev = fx.queue.job_log(&id, 50, true).unwrap().unwrap();
        assert_eq!(rev, "\nPlotting fills\nStarting backtest...");
    }

    #[test]
    fn job_restarted_by_another_controller_is_not_admitted_twice() {
        let mut fx = Fixture::new(false, true);
        let id = fx.enqueue(1);
        assert_eq!(fx.queue.tick(&qc(2)).unwrap(), TickOutcome::Admitted(1));
        assert!(fx.queue.stop_job(&id).unwrap());
        process::reap_children();
        assert_eq!(fx.queue.status_of(&id).unwrap(), JobStatus::NotStarted);

        let mut other = JobQueue::new(fx.queue.config());
        other.load().unwrap();
        let pid = other.run_job(&id).unwrap().unwrap();

        assert_eq!(fx.queue.status_of(&id).unwrap(), JobStatus::Preparing);
        assert_eq!(fx.queue.tick(&qc(2)).unwrap(), TickOutcome::Idle);
        assert_eq!(fx.queue.status_rows()[0].pid, Some(pid));
    }

    #[test]
    fn compute_phase_outlives_the_tail_window() {
        let dir = tempfile::tempdir().unwrap();
        let marker = format!("fm-bt-{}-{}", std::process::id(), dir.path().display());
        let script = r#"
echo 'Starting backtest...'
i=0
while [ ! -f "$1.noise" ] && [ $i -lt 300 ]; do sleep 0.1; i=$((i+1)); done
j=0
while [ $j -lt 80 ]; do echo 'progress progress progress progress progress progress progress'; j=$((j+1)); done
while [ $i -lt 300 ]; do sleep 0.1; i=$((i+1)); done
"#;
        let yaml = format!(
            "backtest:\n  command: [sh, -c, {script:?}, {marker:?}]\n  identity_marker: {marker:?}\n  log_tail_kib: 1\n"
        );
        let cfg = parse_master_config_yaml(&yaml, dir.path()).unwrap();
        let mut q = JobQueue::new(&cfg.backtest);
        let cfg_file = dir.path().join("bt.json");
        std::fs::write(&cfg_file, "{}").unwrap();
        let id = q.enqueue("long", &cfg_file, vec![]).unwrap().filename;
        q.run_job(&id).unwrap().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while q.status_of(&id).unwrap() != JobStatus::Running {
            assert!(Instant::now() < deadline, "timed out waiting for compute phase");
            std::thread::sleep(Duration::from_millis(50));
        }
        std::fs::write(format!("{}.noise", cfg_file.display()), "").unwrap();
        let log = q.jobs()[0].log_path();
        while std::fs::metadata(&log).map(|m| m.len()).unwrap_or(0) < 4096 {
            assert!(Instant::now() < deadline, "timed out waiting for log output");
            std::thread::sleep(Duration::from_millis(50));
        }
        let tail = q.job_log(&id, 1, false).unwrap().unwrap();
        assert!(!tail.contains("Starting backtest..."));

        q.load().unwrap();
        assert_eq!(q.status_of(&id).unwrap(), JobStatus::Running);
        q.remove_finished(true).unwrap();
    }
}
