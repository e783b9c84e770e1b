//! pkgmatrix CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use pkgmatrix_config::DEFAULT_CONFIG_FILE;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pkgmatrix")]
#[command(about = "Build matrix configurator for Conan packages", long_about = None)]
struct Cli {
    /// Matrix definition; the built-in definition is used if the file does not exist
    #[arg(long, env = "PKGMATRIX_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the matrix and run every entry
    Run {
        /// Where builds run
        #[arg(long, value_enum, default_value_t = ExecutorKind::Local)]
        executor: ExecutorKind,
        /// Leave build containers in place after they finish (docker only)
        #[arg(long)]
        keep_containers: bool,
        /// Stop after the first failed build
        #[arg(long)]
        fail_fast: bool,
        /// Page to build (1-based); defaults to CONAN_CURRENT_PAGE
        #[arg(long, requires = "total_pages")]
        page: Option<usize>,
        /// Number of pages; defaults to CONAN_TOTAL_PAGES
        #[arg(long, requires = "page")]
        total_pages: Option<usize>,
        /// Per-build timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the conan commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the finalized matrix
    Show {
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
        /// Page to print (1-based); defaults to CONAN_CURRENT_PAGE
        #[arg(long, requires = "total_pages")]
        page: Option<usize>,
        /// Number of pages; defaults to CONAN_TOTAL_PAGES
        #[arg(long, requires = "page")]
        total_pages: Option<usize>,
    },
    /// Validate the matrix definition
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ExecutorKind {
    Local,
    Docker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            executor,
            keep_containers,
            fail_fast,
            page,
            total_pages,
            timeout,
            dry_run,
        } => {
            let options = commands::run::RunOptions {
                docker: executor == ExecutorKind::Docker,
                keep_containers,
                fail_fast,
                page: page.zip(total_pages),
                timeout: timeout.map(std::time::Duration::from_secs),
                dry_run,
            };
            commands::run::run(&cli.config, options).await?;
        }
        Commands::Show {
            json,
            page,
            total_pages,
        } => {
            commands::show(&cli.config, json, page.zip(total_pages))?;
        }
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
    }

    Ok(())
}
