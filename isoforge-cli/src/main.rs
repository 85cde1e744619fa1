mod commands;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use commands::build::BuildArgs;
use commands::check_user_data::CheckUserDataArgs;
use commands::serve::ServeArgs;

#[derive(Parser)]
#[command(
    name = "isoforge",
    version,
    about = "Build unattended-install Ubuntu Server images"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP build API
    Serve(ServeArgs),
    /// Build one image in-process and stream its progress
    Build(BuildArgs),
    /// Check an autoinstall user-data file
    CheckUserData(CheckUserDataArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Commands::Serve(args) => commands::serve::execute(args).await,
        Commands::Build(args) => commands::build::execute(args).await,
        Commands::CheckUserData(args) => commands::check_user_data::execute(args),
    }
}
