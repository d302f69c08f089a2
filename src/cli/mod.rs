pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration profile to use instead of the default configuration
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also append logs to a file; without a path the data directory is used
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,
}

impl Cli {
    /// File the logs are appended to, if requested
    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(crate::utils::default_log_file))
    }
}

/// Overrides of the job options for a new clone
#[derive(clap::Args, Debug, Default)]
pub struct CloneArgs {
    /// JSON file with the full job options
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Maximum link depth from the start page
    #[arg(short, long)]
    pub depth: Option<u32>,

    /// Maximum number of pages to clone
    #[arg(short, long)]
    pub limit: Option<u32>,

    /// Concurrent page fetches
    #[arg(short, long)]
    pub concurrency: Option<u32>,

    /// Directory to write the mirror into
    #[arg(short, long)]
    pub output: Option<String>,

    /// Reuse cached pages and assets of earlier clones
    #[arg(long)]
    pub incremental: bool,

    /// Fetch pages on remote workers through the task queue
    #[arg(long)]
    pub distributed: bool,

    /// Route requests through the configured proxies
    #[arg(long)]
    pub proxy: bool,

    /// Store assets exactly as downloaded
    #[arg(long)]
    pub no_optimize: bool,

    /// Load mirrored pages in a browser and count script errors
    #[arg(long)]
    pub javascript_check: bool,

    /// Only submit the job; run it later with `resume`
    #[arg(long)]
    pub detach: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a website into an offline mirror
    Clone {
        /// Start page of the site
        #[arg(required = true)]
        url: String,

        #[command(flatten)]
        args: CloneArgs,
    },

    /// Continue a paused or interrupted job
    Resume {
        #[arg(required = true)]
        job_id: String,
    },

    /// Show one job, or list all jobs
    Status {
        job_id: Option<String>,
    },

    /// Cancel a job
    Cancel {
        #[arg(required = true)]
        job_id: String,
    },

    /// Run a fetch worker for distributed jobs
    Worker {
        /// Name reported with every outcome
        #[arg(long)]
        id: Option<String>,

        /// Concurrent fetches
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Show proxy health, optionally probing every proxy first
    Proxies {
        #[arg(long)]
        check: bool,
    },

    /// Drop expired entries from the content cache
    PurgeCache,

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        name: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let profile = cli.profile.as_deref();

    match cli.command {
        Commands::Clone { url, args } => {
            info!("Cloning {}", url);
            commands::clone(profile, url, args).await
        }
        Commands::Resume { job_id } => {
            info!("Resuming job {}", job_id);
            commands::resume(profile, job_id).await
        }
        Commands::Status { job_id } => commands::status(profile, job_id).await,
        Commands::Cancel { job_id } => {
            info!("Cancelling job {}", job_id);
            commands::cancel(profile, job_id).await
        }
        Commands::Worker { id, concurrency } => commands::worker(profile, id, concurrency).await,
        Commands::Proxies { check } => commands::proxies(profile, check).await,
        Commands::PurgeCache => commands::purge_cache(profile).await,
        Commands::Config { name, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(name) = name {
                info!("Managing configuration profile: {}", name);
                commands::manage_profile(&name)
            } else {
                commands::show_config(profile)
            }
        }
    }
}
