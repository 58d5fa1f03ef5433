pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa operator CLI",
    long_about = "Prepare the expense store, load demo data, and inspect runtime configuration.",
    after_help = "Examples:\n  expensa migrate\n  expensa seed --reset\n  expensa doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo company, users, approval rules, and expenses")]
    Seed {
        #[arg(long, help = "Remove previously seeded rows before loading")]
        reset: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, currency settings, and expense store connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed { reset } => commands::seed::run(reset),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            let (healthy, output) = commands::doctor::run(json);
            commands::CommandResult { exit_code: if healthy { 0 } else { 1 }, output }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
