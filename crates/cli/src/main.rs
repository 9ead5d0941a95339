// statesync CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_code;
mod output;

#[derive(Parser)]
#[command(name = "statesync", about = "Follow live project state from a statesync server")]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

fn main() {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.command.json_flag();
    if let Err(error) = commands::run(cli.command) {
        output::print_anyhow_error(output::OutputFormat::detect(json), &error);
        exit_code::ExitCode::from_error(&error).exit();
    }
}
