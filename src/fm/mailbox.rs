//! Single-slot, file-backed command channel between a controller and the supervisor.
//!
//! One file per command kind. Publishing replaces whatever is pending for that kind
//! (last write wins); draining reads then unlinks. A crash between read and unlink redelivers
//! the command, so every command must be safe to apply twice.

use crate::fm::fsutil::{read_to_string_opt, remove_file_opt, write_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Restart,
    Update,
}

impl CommandKind {
    pub const ALL: [CommandKind; 2] = [CommandKind::Restart, CommandKind::Update];

    pub fn file_name(&self) -> &'static str {
        match self {
            CommandKind::Restart => "restart.cmd",
            CommandKind::Update => "update.cmd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartCommand {
    pub user: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCommand {
    /// Instance directory the command refers to.
    pub path: PathBuf,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Restart(RestartCommand),
    Update(UpdateCommand),
}

impl Command {
    pub fn restart(user: impl Into<String>, symbol: impl Into<String>) -> Self {
        Command::Restart(RestartCommand {
            user: user.into(),
            symbol: symbol.into(),
        })
    }

    pub fn update(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Command::Update(UpdateCommand {
            path: path.into(),
            enabled,
        })
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Restart(_) => CommandKind::Restart,
            Command::Update(_) => CommandKind::Update,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandMailbox {
    dir: PathBuf,
}

impl CommandMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn slot_path(&self, kind: CommandKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Write `cmd` into its kind's slot, replacing any unconsumed command of the same kind.
    pub fn publish(&self, cmd: &Command) -> anyhow::Result<()> {
        let body = match cmd {
            Command::Restart(c) => serde_json::to_vec(c)?,
            Command::Update(c) => serde_json::to_vec(c)?,
        };
        write_atomic(&self.slot_path(cmd.kind()), &body)
    }

    pub fn pending(&self, kind: CommandKind) -> bool {
        self.slot_path(kind).exists()
    }

    /// Take the pending command of `kind`, if any.
    ///
    /// An unparsable slot is removed as well (so it is not retried every tick) and reported as an
    /// error carrying its path.
    pub fn drain(&self, kind: CommandKind) -> anyhow::Result<Option<Command>> {
        let path = self.slot_path(kind);
        let Some(raw) = read_to_string_opt(&path)? else {
            return Ok(None);
        };
        let parsed = parse_command(kind, &raw, &path);
        remove_file_opt(&path)?;
        parsed.map(Some)
    }
}

fn parse_command(kind: CommandKind, raw: &str, path: &Path) -> anyhow::Result<Command> {
    let cmd = match kind {
        CommandKind::Restart => serde_json::from_str::<RestartCommand>(raw).map(Command::Restart),
        CommandKind::Update => serde_json::from_str::<UpdateCommand>(raw).map(Command::Update),
    };
    cmd.map_err(|e| anyhow::anyhow!("invalid command file {}: {e}", path.display()))
}
