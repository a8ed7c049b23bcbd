pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use crate::commands::sla_check::SlaCheckOptions;

#[derive(Debug, Parser)]
#[command(
    name = "esgflow",
    about = "esgflow operator CLI",
    long_about = "Operate the esgflow approval workflow: migrations, config inspection, readiness checks, and SLA sweeps.",
    after_help = "Examples:\n  esgflow doctor --json\n  esgflow config\n  esgflow sla-check --tenant pc-acme --critical-only"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity, and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Report overdue approval requests for one portfolio company")]
    SlaCheck {
        #[arg(long, help = "Portfolio company id to check")]
        tenant: String,
        #[arg(long, help = "Only report alerts for this module (e.g. esg_metrics)")]
        module: Option<String>,
        #[arg(long, help = "Only report critical alerts")]
        critical_only: bool,
        #[arg(long, help = "Exit with status 1 when any critical alert is found")]
        fail_on_critical: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::SlaCheck { tenant, module, critical_only, fail_on_critical } => {
            commands::sla_check::run(SlaCheckOptions {
                tenant,
                module,
                critical_only,
                fail_on_critical,
            })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
