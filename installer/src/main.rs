//! Fleet installer CLI.
//!
//! Reads the inventory (`inventory/hosts` by default) and drives each host of
//! the selected section through its install workflow over SSH, one host at a
//! time. Host failures are reported at the end; the exit code is non-zero
//! only when the command itself could not run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use installer::core::inventory::Inventory;
use installer::core::privilege::Privilege;
use installer::core::report::{HostOutcome, RunReport};
use installer::exit_codes;
use installer::io::config::{DEFAULT_CONFIG_PATH, load_config};
use installer::io::console::{ConsoleObserver, ConsoleSink};
use installer::io::executor::RemoteExecutor;
use installer::io::probe::TcpProbe;
use installer::io::ssh::SshTransport;
use installer::io::templates::Templates;
use installer::io::transfer::TransferManager;
use installer::logging;
use installer::orchestrator::{Orchestrator, WorkflowSettings};

#[derive(Parser)]
#[command(
    name = "installer",
    version,
    about = "Install the agent/controller pair across an inventory over SSH"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Login user on the managed hosts; anything but root escalates with sudo.
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Password fed to `sudo -S` when escalating.
    #[arg(long, global = true)]
    escalation_password: Option<String>,

    /// Console admin password for controller installs.
    #[arg(long, global = true)]
    console_password: Option<String>,

    /// Git URL of the control repository with environment code.
    #[arg(long, global = true)]
    control_repo: Option<String>,

    /// Controller hostname agents bootstrap from.
    #[arg(long, global = true)]
    controller: Option<String>,

    /// Challenge password embedded in certificate requests.
    #[arg(long, global = true)]
    challenge_password: Option<String>,

    /// Inventory file (overrides `inventory_path` from the config).
    #[arg(short, long, global = true)]
    inventory: Option<PathBuf>,

    /// Config file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Install agents on every host in the `agents` section.
    Agents,
    /// Install controllers from the local release tarball.
    Controllers,
    /// Show the agent status of every host in the inventory.
    Status,
    /// Configure and run environment code sync on every controller.
    CodeSync,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let inventory_path = cli
        .inventory
        .clone()
        .unwrap_or_else(|| config.inventory_path.clone());
    let inventory = Inventory::load(&inventory_path)?;
    let templates = Templates::load(config.templates_dir.as_deref())?;

    let session = config.ssh.session_options(cli.user.as_deref());
    let settings = WorkflowSettings {
        privilege: Privilege::for_login(&session.user, cli.escalation_password),
        controller: cli.controller,
        console_password: cli.console_password,
        control_repo: cli.control_repo,
        challenge_password: cli.challenge_password,
        artifact_dir: config.artifact_dir.clone(),
        artifact_pattern: config.artifact_regex()?,
        remote: config.remote.clone(),
    };

    let transport = SshTransport::new(&config.ssh.program, &config.ssh.host_key_checking);
    let probe = TcpProbe::new(config.ssh.port, config.ssh.probe_timeout());
    let sink = ConsoleSink;
    let executor = RemoteExecutor::new(&transport, &probe, &sink, session);
    let transfers = TransferManager::new(&executor, Arc::new(ConsoleObserver::default()));
    let orchestrator = Orchestrator::new(&inventory, &executor, &transfers, &templates, &settings);

    let report = match cli.command {
        Command::Agents => orchestrator.run("agents")?,
        Command::Controllers => orchestrator.run("controllers")?,
        Command::Status => orchestrator.status()?,
        Command::CodeSync => orchestrator.setup_code_sync()?,
    };
    print_summary(&report);
    Ok(())
}

fn print_summary(report: &RunReport) {
    if report.hosts.is_empty() {
        return;
    }
    for host in &report.hosts {
        match &host.outcome {
            HostOutcome::Success => {}
            HostOutcome::Skipped(reason) => println!("skipped {}: {}", host.host, reason),
            HostOutcome::Failed(reason) => println!("failed {}: {}", host.host, reason),
        }
    }
    println!("{}", report.summary());
}
