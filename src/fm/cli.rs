use crate::fm::{build_info, config, control, daemon};
use crate::fm::daemon::{Role, RoleHandle};
use crate::fm::queue::JobQueue;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "fleetmaster", version, about = "bot instance supervisor and backtest queue")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "fleetmaster.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the instance supervisor in the foreground (default when no subcommand is given)
    Supervise,
    /// Run the backtest queue runner in the foreground
    QueueRunner,
    /// Print build information
    Version,
    /// Control the detached instance supervisor
    Supervisor {
        #[command(subcommand)]
        action: RoleAction,
    },
    /// Enable an instance (edits its descriptor only)
    Enable { name: String },
    /// Disable an instance (edits its descriptor only)
    Disable { name: String },
    /// Enable an instance and tell the supervisor to start it
    Start { name: String },
    /// Disable an instance and tell the supervisor to stop it
    Stop { name: String },
    /// Tell the supervisor to kill, reload and start one instance
    Restart { user: String, symbol: String },
    /// Publish a raw update command for an instance directory
    Update {
        path: PathBuf,
        #[arg(long = "enabled", conflicts_with = "disabled", required_unless_present = "disabled")]
        enabled: bool,
        #[arg(long = "disabled")]
        disabled: bool,
    },
    /// Show every instance with its liveness
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Backtest queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum RoleAction {
    Start,
    Stop,
    Restart,
    Status,
}

#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// Queue a backtest for the given config file
    Add {
        name: String,
        json: PathBuf,
        /// Exchange(s) the config trades on (repeatable)
        #[arg(short = 'e', long = "exchange")]
        exchange: Vec<String>,
    },
    /// List queued jobs with their status
    List {
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the tail of a job's log
    Log {
        filename: String,
        /// How much of the log to show, in KiB
        #[arg(short = 'k', long = "kib", default_value_t = 50)]
        kib: u64,
        /// Newest line first
        #[arg(short = 'r', long = "reverse")]
        reverse: bool,
    },
    /// Start one job now, ignoring the queue gates
    Run { filename: String },
    /// Kill a running job (it then shows as error)
    Kill { filename: String },
    /// Stop and delete a job with its log
    Remove { filename: String },
    /// Delete complete jobs; with --all, stop and delete everything
    Clean {
        #[arg(long = "all")]
        all: bool,
    },
    /// Turn the queue runner on or off
    Autostart { state: Toggle },
    /// Set how many backtests may run at once (clamped to the host's CPUs)
    Cpu { n: i64 },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

fn print_message(msg: &str) {
    if !msg.trim().is_empty() {
        println!("{}", msg.trim_end());
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load_master_config(&args.config)?;

    match args.cmd {
        None | Some(Cmd::Supervise) => daemon::run_supervisor(&cfg),
        Some(Cmd::QueueRunner) => daemon::run_queue_runner(&cfg),
        Some(Cmd::Version) => {
            println!("{}", build_info::banner());
            Ok(())
        }
        Some(Cmd::Supervisor { action }) => {
            let h = RoleHandle::new(&cfg, Role::Supervisor)?;
            let msg = match action {
                RoleAction::Start => format!("supervisor running pid={}", h.launch_and_wait()?),
                RoleAction::Stop => {
                    if h.stop()? {
                        "supervisor stopped".to_string()
                    } else {
                        "supervisor was not running".to_string()
                    }
                }
                RoleAction::Restart => format!("supervisor restarted pid={}", h.restart()?),
                RoleAction::Status => match h.pid() {
                    Some(pid) => format!("supervisor running pid={pid}"),
                    None => "supervisor not running".to_string(),
                },
            };
            print_message(&msg);
            Ok(())
        }
        Some(Cmd::Enable { name }) => {
            print_message(&control::enable_instance(&cfg, &name)?);
            Ok(())
        }
        Some(Cmd::Disable { name }) => {
            print_message(&control::disable_instance(&cfg, &name)?);
            Ok(())
        }
        Some(Cmd::Start { name }) => {
            print_message(&control::start_instance(&cfg, &name)?);
            Ok(())
        }
        Some(Cmd::Stop { name }) => {
            print_message(&control::stop_instance(&cfg, &name)?);
            Ok(())
        }
        Some(Cmd::Restart { user, symbol }) => {
            print_message(&control::restart_instance(&cfg, &user, &symbol)?);
            Ok(())
        }
        Some(Cmd::Update { path, enabled, disabled }) => {
            let enabled = enabled && !disabled;
            print_message(&control::publish_update(&cfg, &path, enabled)?);
            Ok(())
        }
        Some(Cmd::Status { format }) => {
            let (rows, problems) = control::instance_status(&cfg)?;
            match format {
                OutputFormat::Text => {
                    println!("{:<24} {:<12} {:<14} {:<9} {:<8} params", "name", "user", "symbol", "status", "pid");
                    for r in &rows {
                        println!(
                            "{:<24} {:<12} {:<14} {:<9} {:<8} {}",
                            r.name,
                            r.user,
                            r.symbol,
                            r.status,
                            r.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                            r.parameters
                        );
                    }
                    for p in &problems {
                        eprintln!("warning: {p}");
                    }
                }
                OutputFormat::Json => {
                    let v = serde_json::json!({ "instances": rows, "errors": problems });
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
            Ok(())
        }
        Some(Cmd::Queue { action }) => run_queue(&cfg, action),
    }
}

fn run_queue(cfg: &config::MasterConfig, action: QueueAction) -> anyhow::Result<()> {
    let mut queue = JobQueue::new(&cfg.backtest);
    match action {
        QueueAction::Add { name, json, exchange } => {
            let d = queue.enqueue(&name, &json, exchange)?;
            print_message(&format!("queued {} as {}", d.name, d.filename));
        }
        QueueAction::List { format } => {
            queue.load()?;
            let rows = queue.status_rows();
            let runner = control::runner_state(cfg)?;
            match format {
                OutputFormat::Text => {
                    println!(
                        "runner: {} autostart={} max_concurrency={}",
                        runner
                            .pid
                            .map(|p| format!("running pid={p}"))
                            .unwrap_or_else(|| "stopped".to_string()),
                        if runner.autostart { "on" } else { "off" },
                        runner.max_concurrency
                    );
                    println!("{:<36} {:<12} {:<19} name", "filename", "status", "queued");
                    for r in &rows {
                        println!(
                            "{:<36} {:<12} {:<19} {}",
                            r.filename,
                            r.status,
                            r.queued_at.as_deref().unwrap_or("-"),
                            r.name
                        );
                    }
                }
                OutputFormat::Json => {
                    let v = serde_json::json!({ "runner": runner, "jobs": rows });
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
        }
        QueueAction::Log { filename, kib, reverse } => {
            queue.load()?;
            match queue.job_log(&filename, kib, reverse)? {
                Some(text) => print!("{text}"),
                None => eprintln!("no log yet for {filename}"),
            }
        }
        QueueAction::Run { filename } => {
            queue.load()?;
            match queue.run_job(&filename)? {
                Some(pid) => print_message(&format!("{filename} started pid={pid}")),
                None => print_message(&format!("{filename} is already running or complete")),
            }
        }
        QueueAction::Kill { filename } => {
            queue.load()?;
            let msg = if queue.stop_job(&filename)? {
                format!("{filename} killed")
            } else {
                format!("{filename} was not running")
            };
            print_message(&msg);
        }
        QueueAction::Remove { filename } => {
            queue.load()?;
            queue.remove(&filename)?;
            print_message(&format!("{filename} removed"));
        }
        QueueAction::Clean { all } => print_message(&control::clean_queue(cfg, all)?),
        QueueAction::Autostart { state } => {
            print_message(&control::set_queue_autostart(cfg, matches!(state, Toggle::On))?)
        }
        QueueAction::Cpu { n } => print_message(&control::set_queue_cpu(cfg, n)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn bare_invocation_runs_the_supervisor() {
        let a = Args::try_parse_from(["fleetmaster"]).unwrap();
        assert!(a.cmd.is_none());
        assert_eq!(a.config, PathBuf::from("fleetmaster.yaml"));
    }

    #[test]
    fn update_needs_exactly_one_state() {
        let a = Args::try_parse_from(["fleetmaster", "update", "/i/a", "--disabled"]).unwrap();
        assert!(matches!(a.cmd, Some(Cmd::Update { enabled: false, disabled: true, .. })));
        assert!(Args::try_parse_from(["fleetmaster", "update", "/i/a"]).is_err());
        assert!(Args::try_parse_from(["fleetmaster", "update", "/i/a", "--enabled", "--disabled"]).is_err());
    }

    #[test]
    fn queue_subcommands_parse() {
        let a = Args::try_parse_from(["fleetmaster", "-c", "/etc/fm.yaml", "queue", "log", "abc", "-k", "100", "-r"])
            .unwrap();
        assert_eq!(a.config, PathBuf::from("/etc/fm.yaml"));
        assert!(matches!(
            a.cmd,
            Some(Cmd::Queue {
                action: QueueAction::Log { kib: 100, reverse: true, .. }
            })
        ));
        let a = Args::try_parse_from(["fleetmaster", "queue", "autostart", "off"]).unwrap();
        assert!(matches!(
            a.cmd,
            Some(Cmd::Queue {
                action: QueueAction::Autostart { state: Toggle::Off }
            })
        ));
    }
}
