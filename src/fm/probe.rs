//! Liveness checks by PID + command line.
//!
//! A supervised unit is "alive" only if a process exists *and* its argv still carries the unit's
//! identity tokens. The second check guards against PID reuse between polls; the window between
//! reading `/proc/<pid>/cmdline` and acting on the answer is not closed (single-host, advisory).

use std::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Some argv element must equal this string.
    Arg(String),
    /// Some argv element must contain this substring.
    Substring(String),
}

/// The set of argv requirements that distinguishes one supervised process from every other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    tokens: Vec<Token>,
}

impl Identity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, exact: impl Into<String>) -> Self {
        self.tokens.push(Token::Arg(exact.into()));
        self
    }

    pub fn substring(mut self, needle: impl Into<String>) -> Self {
        self.tokens.push(Token::Substring(needle.into()));
        self
    }

    /// An identity without tokens never matches: it would match every process on the host.
    pub fn matches(&self, argv: &[String]) -> bool {
        if self.tokens.is_empty() || argv.is_empty() {
            return false;
        }
        self.tokens.iter().all(|t| match t {
            Token::Arg(s) => argv.iter().any(|a| a == s),
            Token::Substring(s) => !s.is_empty() && argv.iter().any(|a| a.contains(s.as_str())),
        })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::Arg(s) => format!("arg:{s}"),
                Token::Substring(s) => format!("sub:{s}"),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Argv of `pid`, or `None` if the process is gone, inaccessible, a zombie or a kernel thread.
pub fn read_cmdline(pid: i32) -> Option<Vec<String>> {
    if pid <= 0 {
        return None;
    }
    // NotFound / PermissionDenied both mean "not this process" here.
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    let argv: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    (!argv.is_empty()).then_some(argv)
}

/// Check only the cached PID.
pub fn probe_pid(identity: &Identity, pid: i32) -> bool {
    read_cmdline(pid).is_some_and(|argv| identity.matches(&argv))
}

/// Walk the process table for the first process matching `identity` (never our own process).
pub fn scan(identity: &Identity) -> Option<i32> {
    let me = std::process::id() as i32;
    let rd = fs::read_dir("/proc").ok()?;
    let mut pids: Vec<i32> = rd
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .filter(|pid| *pid != me)
        .collect();
    pids.sort_unstable();
    pids.into_iter().find(|pid| probe_pid(identity, *pid))
}

/// Resolve the live PID for `identity`: the cached PID if it still matches, else a table scan.
pub fn find(identity: &Identity, cached: Option<i32>) -> Option<i32> {
    if let Some(pid) = cached {
        if probe_pid(identity, pid) {
            return Some(pid);
        }
    }
    scan(identity)
}

pub fn is_alive(identity: &Identity, cached: Option<i32>) -> bool {
    find(identity, cached).is_some()
}

/// Logical CPUs currently online (at least 1).
pub fn logical_cpu_count() -> usize {
    let v = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if v <= 0 {
        1
    } else {
        v as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fm::process::{kill_pid, spawn_detached, LaunchSpec};

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identity_requires_every_token() {
        let id = Identity::new().arg("alice").arg("BTCUSDT").substring("passivbot.py");
        assert!(id.matches(&argv(&["python3", "-u", "/opt/pb/passivbot.py", "alice", "BTCUSDT", "cfg.json"])));
        assert!(!id.matches(&argv(&["python3", "/opt/pb/passivbot.py", "alice", "ETHUSDT"])));
        assert!(!id.matches(&argv(&["python3", "other.py", "alice", "BTCUSDT"])));
    }

    #[test]
    fn exact_args_do_not_match_prefixes() {
        let id = Identity::new().arg("BTCUSDT").substring("bot");
        assert!(!id.matches(&argv(&["bot", "BTCUSDT2"])));
    }

    #[test]
    fn empty_identity_matches_nothing() {
        assert!(!Identity::new().matches(&argv(&["anything"])));
        assert!(!Identity::new().substring("").matches(&argv(&["anything"])));
    }

    #[test]
    fn own_cmdline_is_readable() {
        let me = std::process::id() as i32;
        assert!(read_cmdline(me).is_some());
        assert!(read_cmdline(0).is_none());
        assert!(read_cmdline(-5).is_none());
    }

    #[test]
    fn live_child_is_found_by_scan_and_cached_pid() {
        let dir = tempfile::tempdir().unwrap();
        let token = format!("fm-probe-{}", std::process::id());
        let spec = LaunchSpec {
            argv: argv(&["sh", "-c", "sleep 30; exit 0", &token, "probe-arg"]),
            working_directory: dir.path().to_path_buf(),
            log_path: dir.path().join("child.log"),
            truncate_log: true,
        };
        let pid = spawn_detached(&spec).unwrap();
        let id = Identity::new().substring(token.as_str()).arg("probe-arg");

        assert!(probe_pid(&id, pid));
        assert_eq!(find(&id, None), Some(pid));
        assert_eq!(find(&id, Some(pid)), Some(pid));
        // A stale cached PID falls back to the scan.
        assert_eq!(find(&id, Some(i32::MAX - 1)), Some(pid));
        assert!(!probe_pid(&Identity::new().substring("no-such-token-xyz"), pid));

        kill_pid(pid).unwrap();
        crate::fm::process::wait_gone(pid, std::time::Duration::from_secs(5));
        assert!(!is_alive(&id, Some(pid)));
    }

    #[test]
    fn at_least_one_cpu() {
        assert!(logical_cpu_count() >= 1);
    }
}
