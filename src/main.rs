use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use eraser::config::EraserConfig;
use eraser::controller::{self, CleanupRequest, RequestOverrides, RequestPhase};
use eraser::pipeline::{ImageSelector, ALL_IMAGES};
use eraser::storage::{FileStore, StatusStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

/// Extra time `submit --wait` allows beyond the request deadline
const WAIT_SLACK: Duration = Duration::from_secs(60);
const WAIT_POLL: Duration = Duration::from_secs(1);

/// Remove unused container images from every node of a cluster
#[derive(Parser)]
#[command(name = "eraser", version)]
#[command(about = "Remove unused container images from cluster nodes", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a cleanup request and print its id
    #[command(group(ArgGroup::new("selector").required(true).args(["image", "all"])))]
    Submit {
        /// Image reference to remove (repeatable)
        #[arg(short, long)]
        image: Vec<String>,

        /// Remove every image no container is using
        #[arg(long)]
        all: bool,

        /// Failed nodes tolerated before the request is aborted
        #[arg(long)]
        failure_tolerance: Option<usize>,

        /// Deadline for the whole request (e.g. "30s", "10m")
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        deadline: Option<Duration>,

        /// Target control-plane nodes as well
        #[arg(long)]
        include_control_plane: bool,

        /// Block until the request reaches a terminal phase
        #[arg(long)]
        wait: bool,
    },
    /// Show one request
    Status {
        id: String,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// List all requests, oldest first
    List,
    /// Run the job controller
    Run {
        /// Exit once no request is left in progress
        #[arg(long)]
        once: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

fn init_tracing(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2) // Show target module for -vv and above
        .with_thread_ids(verbose >= 3) // Show thread IDs for -vvv
        .with_line_number(verbose >= 3) // Show line numbers for -vvv
        .init();

    debug!("Eraser started with verbosity level: {}", verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run_command(cli).await;
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Returns the process exit code
async fn run_command(cli: Cli) -> anyhow::Result<i32> {
    let config = eraser::config::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Submit {
            image,
            all,
            failure_tolerance,
            deadline,
            include_control_plane,
            wait,
        } => {
            let selector = if all {
                ImageSelector::from_list([ALL_IMAGES])
            } else {
                ImageSelector::from_list(image)
            };
            let overrides = RequestOverrides {
                failure_tolerance,
                deadline,
                include_control_plane: include_control_plane.then_some(true),
            };
            submit(&config, selector, overrides, wait).await
        }
        Commands::Status { id, format } => {
            let store = eraser::app::open_store(&config).await?;
            let request = store
                .get_request(&id)
                .await
                .with_context(|| format!("Failed to read request {id}"))?;
            print_request(&request, format)?;
            Ok(0)
        }
        Commands::List => {
            let store = eraser::app::open_store(&config).await?;
            list(store.as_ref()).await?;
            Ok(0)
        }
        Commands::Run { once } => {
            run_controller(&config, once).await?;
            Ok(0)
        }
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(0)
        }
    }
}

async fn submit(
    config: &EraserConfig,
    selector: ImageSelector,
    overrides: RequestOverrides,
    wait: bool,
) -> anyhow::Result<i32> {
    let store = eraser::app::open_store(config).await?;
    let id = controller::submit::submit(store.as_ref(), &config.controller, selector, overrides)
        .await
        .context("Failed to submit cleanup request")?;
    println!("{id}");

    if !wait {
        return Ok(0);
    }

    let request = store.get_request(&id).await?;
    let timeout = request.options.deadline.saturating_add(WAIT_SLACK);
    let request = controller::wait_for_terminal(store.as_ref(), &id, timeout, WAIT_POLL)
        .await
        .with_context(|| format!("Request {id} did not finish"))?;
    print_request(&request, OutputFormat::Text)?;
    Ok(if request.phase == RequestPhase::Succeeded { 0 } else { 1 })
}

async fn list(store: &FileStore) -> anyhow::Result<()> {
    let requests = store.list_requests().await?;
    if requests.is_empty() {
        println!("No cleanup requests found.");
        return Ok(());
    }

    println!("{:<18} {:<10} {:<6} CREATED", "ID", "PHASE", "NODES");
    for request in requests {
        println!(
            "{:<18} {:<10} {:<6} {}",
            request.id,
            request.phase.to_string(),
            request.per_node_status.len(),
            request.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn run_controller(config: &EraserConfig, once: bool) -> anyhow::Result<()> {
    let controller = eraser::app::build_controller(config)
        .await
        .context("Failed to start controller")?;

    if once {
        controller.run_until_idle().await?;
        return Ok(());
    }

    controller
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

fn print_request(request: &CleanupRequest, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(request)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(request)?),
        OutputFormat::Text => {
            println!("Request:  {}", request.id);
            println!("Selector: {}", request.image_selector);
            println!("Phase:    {}", request.phase);
            if let Some(message) = &request.message {
                println!("Message:  {message}");
            }
            if request.per_node_status.is_empty() {
                return Ok(());
            }

            println!();
            println!("{:<24} {:<12} {:<8} {:<8} FAILED", "NODE", "PHASE", "ATTEMPT", "REMOVED");
            for (node, status) in &request.per_node_status {
                println!(
                    "{:<24} {:<12} {:<8} {:<8} {}",
                    node,
                    status.phase.to_string(),
                    status.attempt,
                    status.counts.removed,
                    status.counts.remove_failed + status.counts.scan_failed
                );
                for (image, reason) in &status.failed_images {
                    println!("  {image}: {reason}");
                }
            }
        }
    }
    Ok(())
}
