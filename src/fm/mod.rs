pub mod build_info;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod event;
pub mod fsutil;
pub mod instance;
pub mod logfile;
pub mod mailbox;
pub mod pidfile;
pub mod probe;
pub mod process;
pub mod queue;
pub mod settings;
pub mod status;
pub mod supervisor;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
