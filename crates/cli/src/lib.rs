pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "arbiter",
    about = "Arbiter operator CLI",
    long_about = "Run ghost-run simulations, validate policy documents, and check runtime readiness.",
    after_help = "Examples:\n  arbiter simulate --graph workflow.toml --policy policy.toml\n  arbiter policy --path policy.toml\n  arbiter doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Replay a workflow graph through the decision engine without real effects")]
    Simulate {
        #[arg(long, help = "Workflow graph TOML file")]
        graph: PathBuf,
        #[arg(long, help = "Policy TOML file (defaults to the configured policy path)")]
        policy: Option<PathBuf>,
        #[arg(long, help = "Simulation budget cap in USD", default_value_t = 10.0)]
        budget_cap: f64,
        #[arg(long, help = "Simulation requests-per-minute limit", default_value_t = 60)]
        rpm: u32,
        #[arg(long, help = "Stop at the first conflict")]
        fail_on_conflict: bool,
        #[arg(long, help = "Walk at most this many steps", default_value_t = 100)]
        max_steps: usize,
        #[arg(long, help = "Charge denied and held steps too")]
        charge_all: bool,
        #[arg(long, help = "Emit the structured JSON report instead of text")]
        json: bool,
    },
    #[command(about = "Validate a policy document and summarize its rules")]
    Policy {
        #[arg(long, help = "Policy TOML file (defaults to the configured policy path)")]
        path: Option<PathBuf>,
    },
    #[command(about = "Validate config, policy, and database connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Simulate {
            graph,
            policy,
            budget_cap,
            rpm,
            fail_on_conflict,
            max_steps,
            charge_all,
            json,
        } => commands::simulate::run(commands::simulate::SimulateArgs {
            graph,
            policy,
            budget_cap,
            rpm,
            fail_on_conflict,
            max_steps,
            charge_all,
            json,
        }),
        Command::Policy { path } => commands::policy::run(path),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
