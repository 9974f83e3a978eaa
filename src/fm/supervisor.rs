//! Keeps every enabled bot instance running, applying mailbox commands between watch passes.

use crate::fm::config::{InstancesConfig, MasterConfig};
use crate::fm::event::fm_event;
use crate::fm::instance::{InstanceDescriptor, RunInstance};
use crate::fm::mailbox::{Command, CommandKind, CommandMailbox};
use crate::fm::process;
use std::path::{Path, PathBuf};

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub commands: usize,
    /// Instances (re)started by the watch pass, by `user/symbol`.
    pub started: Vec<String>,
    pub rotated: Vec<String>,
}

#[derive(Debug)]
pub struct InstanceSupervisor {
    cfg: InstancesConfig,
    mailbox: CommandMailbox,
    instances: Vec<RunInstance>,
    ticks: u64,
}

impl InstanceSupervisor {
    pub fn new(cfg: &MasterConfig) -> Self {
        Self {
            cfg: cfg.instances.clone(),
            mailbox: CommandMailbox::new(&cfg.command_directory),
            instances: vec![],
            ticks: 0,
        }
    }

    pub fn instances(&self) -> &[RunInstance] {
        &self.instances
    }

    pub fn mailbox(&self) -> &CommandMailbox {
        &self.mailbox
    }

    /// Track every enabled instance under the instances directory. Returns how many are tracked.
    pub fn load_all(&mut self) -> anyhow::Result<usize> {
        for dir in instance_dirs(&self.cfg.directory)? {
            if let Err(e) = self.load(&dir) {
                fm_event("supervisor", None, format!("skip_instance path={} err={e:#}", dir.display()));
            }
        }
        Ok(self.instances.len())
    }

    /// (Re)load the descriptor in `dir`. Tracked iff enabled; an existing entry for the same
    /// directory is replaced so a reload never duplicates it. Returns whether it is tracked.
    ///
    /// If the reload changes user or symbol, the process running under the old identity is
    /// stopped first; nothing could find it afterwards.
    pub fn load(&mut self, dir: &Path) -> anyhow::Result<bool> {
        let d = InstanceDescriptor::load(&dir.join(&self.cfg.descriptor_file))?;
        if !d.enabled {
            return Ok(false);
        }
        let fresh = RunInstance::from_descriptor(dir, &d);
        match self.instances.iter_mut().find(|ri| ri.path == dir) {
            Some(existing) if existing.user != fresh.user || existing.symbol != fresh.symbol => {
                if existing.stop(&self.cfg)? {
                    fm_event(
                        "supervisor",
                        Some(&existing.name()),
                        format!("stopped: identity changed to {}", fresh.name()),
                    );
                }
                fm_event("supervisor", Some(&fresh.name()), format!("tracked path={}", dir.display()));
                *existing = fresh;
            }
            Some(existing) => {
                existing.parameters = fresh.parameters;
            }
            None => {
                fm_event("supervisor", Some(&fresh.name()), format!("tracked path={}", dir.display()));
                self.instances.push(fresh);
            }
        }
        Ok(true)
    }

    /// Stop and forget the instance living in `dir`, if tracked.
    pub fn unload(&mut self, dir: &Path) -> anyhow::Result<bool> {
        let Some(i) = self.instances.iter().position(|ri| ri.path == dir) else {
            return Ok(false);
        };
        let mut ri = self.instances.remove(i);
        if ri.stop(&self.cfg)? {
            fm_event("supervisor", Some(&ri.name()), "stopped");
        }
        fm_event("supervisor", Some(&ri.name()), "untracked");
        Ok(true)
    }

    pub fn apply(&mut self, cmd: &Command) -> anyhow::Result<()> {
        match cmd {
            Command::Restart(r) => {
                let cfg = &self.cfg;
                let Some(ri) = self
                    .instances
                    .iter_mut()
                    .find(|ri| ri.user == r.user && ri.symbol == r.symbol)
                else {
                    fm_event(
                        "supervisor",
                        Some(&format!("{}/{}", r.user, r.symbol)),
                        "restart ignored: not tracked",
                    );
                    return Ok(());
                };
                ri.stop(cfg)?;
                ri.reload(cfg)?;
                ri.start(cfg)?;
                fm_event("supervisor", Some(&ri.name()), format!("restarted params={:?}", ri.parameters.join(" ")));
            }
            Command::Update(u) if u.enabled => {
                if self.load(&u.path)? {
                    fm_event("supervisor", None, format!("update applied path={} enabled=true", u.path.display()));
                }
            }
            Command::Update(u) => {
                self.unload(&u.path)?;
            }
        }
        Ok(())
    }

    /// Drain both mailbox slots and apply what was pending. Returns how many commands were applied.
    pub fn apply_pending_commands(&mut self) -> usize {
        let mut applied = 0;
        for kind in CommandKind::ALL {
            match self.mailbox.drain(kind) {
                Ok(Some(cmd)) => {
                    fm_event("mailbox", None, format!("received {cmd:?}"));
                    match self.apply(&cmd) {
                        Ok(()) => applied += 1,
                        Err(e) => fm_event("mailbox", None, format!("apply_failed {cmd:?} err={e:#}")),
                    }
                }
                Ok(None) => {}
                Err(e) => fm_event("mailbox", None, format!("drain_failed kind={kind:?} err={e:#}")),
            }
        }
        applied
    }

    /// Drop tracked instances whose descriptor was deleted or now says disabled. An unreadable
    /// descriptor keeps the instance as it is. Returns the directories that were dropped.
    pub fn unload_withdrawn(&mut self) -> Vec<PathBuf> {
        let withdrawn: Vec<PathBuf> = self
            .instances
            .iter()
            .filter(|ri| {
                let path = ri.descriptor_path(&self.cfg);
                if !path.exists() {
                    fm_event("supervisor", Some(&ri.name()), "descriptor deleted");
                    return true;
                }
                match InstanceDescriptor::load(&path) {
                    Ok(d) => !d.enabled,
                    Err(e) => {
                        fm_event("supervisor", Some(&ri.name()), format!("descriptor_unreadable err={e:#}"));
                        false
                    }
                }
            })
            .map(|ri| ri.path.clone())
            .collect();
        for dir in &withdrawn {
            if let Err(e) = self.unload(dir) {
                fm_event("supervisor", None, format!("unload_failed path={} err={e:#}", dir.display()));
            }
        }
        withdrawn
    }

    /// Reap, apply commands, drop withdrawn instances, restart anything down, and every Nth tick
    /// rotate oversized logs.
    pub fn tick(&mut self) -> TickReport {
        process::reap_children();
        let mut report = TickReport {
            commands: self.apply_pending_commands(),
            ..TickReport::default()
        };
        self.unload_withdrawn();

        let cfg = &self.cfg;
        for ri in self.instances.iter_mut() {
            match ri.watch(cfg) {
                Ok(true) => {
                    fm_event("supervisor", Some(&ri.name()), "started");
                    report.started.push(ri.name());
                }
                Ok(false) => {}
                Err(e) => fm_event("supervisor", Some(&ri.name()), format!("start_failed err={e:#}")),
            }
        }

        self.ticks += 1;
        if self.ticks % self.cfg.log_maintenance_every == 0 {
            for ri in &self.instances {
                match ri.rotate_log(&self.cfg) {
                    Ok(true) => {
                        fm_event("supervisor", Some(&ri.name()), "log rotated");
                        report.rotated.push(ri.name());
                    }
                    Ok(false) => {}
                    Err(e) => fm_event("supervisor", Some(&ri.name()), format!("log_rotate_failed err={e:#}")),
                }
            }
        }
        report
    }
}

/// Sub-directories of the instances root, sorted. A missing root means no instances.
pub fn instance_dirs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let rd = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => anyhow::bail!("failed to read instances directory {}: {e}", root.display()),
    };
    let mut dirs: Vec<PathBuf> = rd.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
    dirs.sort();
    Ok(dirs)
}
