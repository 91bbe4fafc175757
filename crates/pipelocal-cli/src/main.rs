//! pipelocal CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pipelocal")]
#[command(about = "Run Bitbucket pipelines locally", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "PIPELOCAL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
        /// Pipeline to run, e.g. `default` or `custom/deploy`
        #[arg(short, long, default_value = "default")]
        name: String,
        /// File of KEY=VALUE secrets
        #[arg(short, long)]
        secrets: Option<PathBuf>,
        /// Branch that pull-request change-sets compare against
        #[arg(short, long, default_value = "main")]
        target_branch: String,
        /// Pipeline file, defaults to the one in the project directory
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// List the pipelines of a project
    List {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
    },
    /// Validate a pipeline file
    Validate {
        /// Path to the pipeline file
        #[arg(default_value = pipelocal_config::document::DOCUMENT_FILE)]
        path: PathBuf,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    init_tracing(verbose, cli.log_json);

    match cli.command {
        Commands::Run {
            project,
            name,
            secrets,
            target_branch,
            file,
            verbose: _,
        } => {
            commands::run::run(commands::run::RunArgs {
                project,
                name,
                secrets,
                target_branch,
                file,
            })
            .await?;
        }
        Commands::List { project } => {
            commands::list(&project)?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
