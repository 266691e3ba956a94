//! autobuilder-ec2: operate latent EC2 build workers from the command line
//!
//! Loads a farm configuration and drives a single worker through the same
//! code paths the build master uses: validation, spot bid computation,
//! substantiation and teardown.

use anyhow::{Context, Result};
use autobuilder_ec2::aws::{AwsContext, Ec2Client, classify_anyhow_error};
use autobuilder_ec2::config::{FarmConfig, find_worker};
use autobuilder_ec2::worker::{
    InstanceSizing, LatentWorkerController, LatentWorkerSpec, ProvisionRequest,
    SpotInstanceProvisioner, Worker, provisioner::resolve_image,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "autobuilder-ec2")]
#[command(about = "Latent EC2 worker management for the autobuilder build farm")]
#[command(version)]
struct Args {
    /// Farm configuration file
    #[arg(short, long, global = true, env = "AUTOBUILDER_CONFIG", default_value = "farm.json")]
    config: PathBuf,

    /// AWS profile to use (overrides the config file and AWS_PROFILE)
    #[arg(long, global = true)]
    aws_profile: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then list the workers
    Validate,

    /// Show the spot bids a worker would place, cheapest first
    Bids {
        /// Worker name
        #[arg(short, long)]
        worker: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Start an instance for a latent worker and print its details as JSON
    Substantiate {
        /// Worker name
        #[arg(short, long)]
        worker: String,
    },

    /// Tear down a worker's instance
    Stop {
        /// Worker name
        #[arg(short, long)]
        worker: String,

        /// Instance to terminate
        #[arg(long)]
        instance_id: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();

    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if let Some(hint) = classify_anyhow_error(e).suggestion() {
        let _ = writeln!(stderr, "\n  \x1b[36mHint:\x1b[0m {hint}");
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.into())
                // Reduce noise from the AWS SDK
                .add_directive("aws_config=warn".parse()?)
                .add_directive("aws_smithy_runtime=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = FarmConfig::load(&args.config)?;
    let region = config.region.clone();
    let profile = args.aws_profile.or_else(|| config.aws_profile.clone());
    let workers = config.into_workers()?;

    if let Some(profile) = &profile {
        info!(profile = %profile, "Using AWS profile");
    }

    match args.command {
        Command::Validate => {
            handle_validate(&workers);
            Ok(())
        }
        Command::Bids { worker, format } => {
            let spec = latent_spec(&workers, &worker)?;
            let aws = AwsContext::new(&region, profile.as_deref()).await;
            handle_bids(Arc::new(Ec2Client::from_context(&aws)), &worker, spec, format).await
        }
        Command::Substantiate { worker } => {
            let spec = latent_spec(&workers, &worker)?;
            let aws = AwsContext::new(&region, profile.as_deref()).await;
            let controller = LatentWorkerController::new(
                worker,
                Arc::new(spec.clone()),
                Arc::new(Ec2Client::from_context(&aws)),
            );
            let handle = controller.substantiate().await?;
            println!("{}", serde_json::to_string_pretty(&handle)?);
            Ok(())
        }
        Command::Stop {
            worker,
            instance_id,
        } => {
            let spec = latent_spec(&workers, &worker)?;
            let aws = AwsContext::new(&region, profile.as_deref()).await;
            let controller = LatentWorkerController::new(
                worker,
                Arc::new(spec.clone()),
                Arc::new(Ec2Client::from_context(&aws)),
            );
            controller
                .stop_instance(&instance_id)
                .await
                .with_context(|| format!("Failed to stop instance {instance_id}"))?;
            info!(instance_id = %instance_id, "Instance terminated");
            Ok(())
        }
    }
}

fn latent_spec<'a>(workers: &'a [Worker], name: &str) -> Result<&'a LatentWorkerSpec> {
    find_worker(workers, name)?
        .latent_spec()
        .with_context(|| format!("Worker {name} is not an EC2 worker"))
}

/// Handle the validate command
fn handle_validate(workers: &[Worker]) {
    println!(
        "{:<20} {:<8} {:<6} {:<30}",
        "NAME", "KIND", "BUILDS", "INSTANCE TYPES"
    );
    println!("{}", "-".repeat(66));
    for w in workers {
        let (kind, types) = match w.latent_spec().map(|s| &s.sizing) {
            None => ("fixed", String::from("-")),
            Some(InstanceSizing::Fixed { instance_type, .. }) => {
                ("ec2", instance_type.clone())
            }
            Some(InstanceSizing::Spot { instance_types, .. }) => {
                ("spot", instance_types.join(","))
            }
        };
        println!("{:<20} {:<8} {:<6} {:<30}", w.name, kind, w.max_builds, types);
    }
    println!("\nTotal: {} workers", workers.len());
}

/// Handle the bids command
async fn handle_bids(
    ec2: Arc<Ec2Client>,
    worker: &str,
    spec: &LatentWorkerSpec,
    format: OutputFormat,
) -> Result<()> {
    if !spec.sizing.is_spot() {
        anyhow::bail!("Worker {worker} does not use spot instances");
    }

    let image_id = resolve_image(ec2.as_ref(), worker, &spec.image).await?;
    let provisioner = SpotInstanceProvisioner::new(ec2);
    let offer = provisioner
        .offer(ProvisionRequest {
            worker,
            spec,
            image_id: &image_id,
        })
        .await?;
    let table = provisioner.bidder().bid_table(&offer).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("{:<20} {:<16} {:>10}", "INSTANCE TYPE", "ZONE", "BID");
    println!("{}", "-".repeat(48));
    for bid in &table.bids {
        println!(
            "{:<20} {:<16} {:>10.6}",
            bid.pair.instance_type, bid.pair.zone, bid.price
        );
    }
    if !table.skipped.is_empty() {
        println!("\nSkipped (no recent price history):");
        for pair in &table.skipped {
            println!("  {pair}");
        }
    }

    Ok(())
}
