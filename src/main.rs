//! pipevisor binary
//!
//! Loads the configuration, starts the pipeline and runs until SIGTERM,
//! SIGINT or SIGQUIT.

use clap::error::ErrorKind;
use clap::Parser;
use pipevisor::daemon::config::ConfigBundle;
use pipevisor::daemon::supervisor::Supervisor;
use pipevisor::error::{PipevisorError, EXIT_OK, EXIT_USAGE};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(name = "pipevisor", version, about = "Supervise a monitoring-data pipeline")]
struct Cli {
    /// Configuration file [default: pipevisor.yaml next to the executable]
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    let path = cli.config.unwrap_or_else(ConfigBundle::default_path);
    if let Err(e) = run(&path) {
        eprintln!("{}", e.to_text());
        process::exit(e.exit_code());
    }
}

fn run(path: &std::path::Path) -> Result<(), PipevisorError> {
    let supervisor = Supervisor::from_path(path)?;
    supervisor.run()
}
