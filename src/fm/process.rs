use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{setsid, Pid};
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Everything needed to start one supervised child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub working_directory: PathBuf,
    /// stdout and stderr both go here.
    pub log_path: PathBuf,
    /// Start the log from empty instead of appending.
    pub truncate_log: bool,
}

/// Spawn `spec.argv` in its own session so it outlives the manager, returning its PID.
///
/// The `Child` handle is dropped on purpose: the process is never waited on by handle, only by
/// [`reap_children`] and by PID probing.
pub fn spawn_detached(spec: &LaunchSpec) -> anyhow::Result<i32> {
    anyhow::ensure!(!spec.argv.is_empty(), "launch command is empty (not configured)");
    anyhow::ensure!(
        spec.working_directory.is_dir(),
        "working directory {} does not exist",
        spec.working_directory.display()
    );

    if let Some(parent) = spec.log_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    let mut opts = OpenOptions::new();
    opts.create(true);
    if spec.truncate_log {
        opts.write(true).truncate(true);
    } else {
        opts.append(true);
    }
    let log = opts
        .open(&spec.log_path)
        .with_context(|| format!("open log {}", spec.log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("dup log fd {}", spec.log_path.display()))?;

    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..])
        .current_dir(&spec.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    // Detach from our controlling terminal / session so the manager can exit independently.
    unsafe {
        cmd.pre_exec(|| {
            let _ = setsid();
            Ok(())
        });
    }

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => anyhow::bail!(
            "spawn cwd={} argv={} failed: kind={:?} os_error={:?} err={}",
            spec.working_directory.display(),
            spec.argv.join(" "),
            e.kind(),
            e.raw_os_error(),
            e
        ),
    };
    Ok(child.id() as i32)
}

/// SIGKILL `pid`. A process that is already gone is not an error.
pub fn kill_pid(pid: i32) -> anyhow::Result<()> {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("kill pid={pid} failed: {e}")),
    }
}

/// Collect every exited child without blocking so dead bots do not linger as zombies.
pub fn reap_children() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

/// Wait up to `timeout` for `pid` to disappear (reaping it if it is our child).
pub fn wait_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
        if crate::fm::probe::read_cmdline(pid).is_none() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            argv: vec![],
            working_directory: dir.path().to_path_buf(),
            log_path: dir.path().join("x.log"),
            truncate_log: false,
        };
        let err = spawn_detached(&spec).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn missing_executable_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            argv: vec!["/nonexistent/fleetmaster-test-binary".to_string()],
            working_directory: dir.path().to_path_buf(),
            log_path: dir.path().join("x.log"),
            truncate_log: false,
        };
        assert!(spawn_detached(&spec).is_err());
    }

    #[test]
    fn child_output_lands_in_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out").join("child.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "previous\n").unwrap();
        let spec = LaunchSpec {
            argv: vec!["sh".into(), "-c".into(), "echo hello; echo oops >&2".into()],
            working_directory: dir.path().to_path_buf(),
            log_path: log.clone(),
            truncate_log: false,
        };
        let pid = spawn_detached(&spec).unwrap();
        assert!(wait_gone(pid, Duration::from_secs(5)));
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.starts_with("previous\n"));
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[test]
    fn killing_a_dead_pid_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            argv: vec!["sh".into(), "-c".into(), "exit 0".into()],
            working_directory: dir.path().to_path_buf(),
            log_path: dir.path().join("x.log"),
            truncate_log: true,
        };
        let pid = spawn_detached(&spec).unwrap();
        assert!(wait_gone(pid, Duration::from_secs(5)));
        kill_pid(pid).unwrap();
    }
}
