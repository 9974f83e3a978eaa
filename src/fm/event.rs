use chrono::Local;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

const EARLY_LOG_MAX_LINES: usize = 5000;

struct RoleLog {
    path: PathBuf,
    file: File,
    bytes_written: u64,
    max_bytes: u64,
}

static ROLE_LOG: OnceLock<Mutex<RoleLog>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string()
}

/// Emit one manager event line: `<ts> [component] id=<subject> message`.
///
/// Before [`install_role_log`] runs, lines go to stderr and into a bounded buffer. Afterwards they
/// go to the role log, and to stderr only when it is a terminal: a detached role has its stderr
/// pointed at the role log already.
pub fn fm_event(component: &str, subject: Option<&str>, msg: impl AsRef<str>) {
    let line = match subject {
        Some(s) => format!("{} [{component}] id={s} {}", timestamp(), msg.as_ref()),
        None => format!("{} [{component}] {}", timestamp(), msg.as_ref()),
    };
    match ROLE_LOG.get() {
        Some(log) => {
            if std::io::stderr().is_terminal() {
                eprintln!("{line}");
            }
            let mut g = log.lock().unwrap_or_else(|p| p.into_inner());
            g.write_line(&line);
        }
        None => {
            eprintln!("{line}");
            let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
            let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
            g.push_back(line);
            while g.len() > EARLY_LOG_MAX_LINES {
                g.pop_front();
            }
        }
    }
}

/// Route subsequent events into `path` as well, rotating it to `<path>.old` past `max_bytes`.
pub fn install_role_log(path: &Path, max_bytes: u64) -> anyhow::Result<()> {
    let file = open_append(path)?;
    let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mut log = RoleLog {
        path: path.to_path_buf(),
        file,
        bytes_written,
        max_bytes,
    };
    // Without a terminal, stderr is captured elsewhere (role log or journal) and already has them.
    if let Some(q) = EARLY_LOG.get().filter(|_| std::io::stderr().is_terminal()) {
        let drained: Vec<String> = {
            let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
            g.drain(..).collect()
        };
        for line in drained {
            log.write_line(&line);
        }
    }
    if ROLE_LOG.set(Mutex::new(log)).is_err() {
        anyhow::bail!("role log already installed");
    }
    fm_event(
        "log",
        None,
        format!("role_log path={} rotate_at_bytes={max_bytes}", path.display()),
    );
    Ok(())
}

pub(crate) fn open_append(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow::anyhow!("create_dir_all {}: {e}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("open log {}: {e}", path.display()))
}

impl RoleLog {
    fn write_line(&mut self, line: &str) {
        if self.max_bytes > 0 && self.bytes_written >= self.max_bytes {
            self.rotate();
        }
        let mut s = line.to_string();
        if !s.ends_with('\n') {
            s.push('\n');
        }
        if self.file.write_all(s.as_bytes()).is_ok() {
            self.bytes_written = self.bytes_written.saturating_add(s.len() as u64);
        }
    }

    /// Move the current log aside to `.old` (replacing any previous one) and reopen.
    fn rotate(&mut self) {
        let _ = self.file.flush();
        let old = PathBuf::from(format!("{}.old", self.path.display()));
        if fs::rename(&self.path, &old).is_err() {
            return;
        }
        if let Ok(f) = open_append(&self.path) {
            self.file = f;
            self.bytes_written = 0;
        }
    }
}
