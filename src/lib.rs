//! availai: push and pull computer-vision datasets.
//!
//! A local directory is described as a dataset with a [`DatasetHandle`],
//! then uploaded to or downloaded from an artifact registry, or fetched
//! from a dataset hosting service.
//!
//! # Modules
//!
//! - [`dataset`]: The dataset handle and its operations
//! - [`registry`]: Artifact registry interface and the offline registry
//! - [`hosting`]: Dataset hosting interface and the Roboflow client
//! - [`credential`]: API key resolution
//! - [`metadata`]: Artifact metadata helpers
//! - [`config`]: Settings file
//! - [`error`]: Error types for availai operations

pub mod config;
pub mod credential;
pub mod dataset;
pub mod error;
pub mod hosting;
pub mod metadata;
pub mod registry;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use credential::{resolve_credential, Credential};
pub use dataset::{DatasetHandle, DatasetOptions, HostedDownload, OpenMode};
pub use error::AvailaiError;
pub use registry::{ArtifactRef, ArtifactRegistry, Connection, OfflineRegistry};

use config::Settings;
use metadata::parse_metadata;

/// The availai CLI application.
#[derive(Parser)]
#[command(name = "availai")]
#[command(version, author, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// YAML settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the offline artifact registry (overrides the settings file).
    #[arg(long, global = true)]
    registry_root: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a dataset directory as a new artifact version.
    Upload(UploadArgs),
    /// Download an artifact version into a directory.
    #[command(disable_version_flag = true)]
    Download(DownloadArgs),
    /// Download a dataset export from Roboflow.
    Roboflow(RoboflowArgs),
    /// Upload a dataset with preprocessing steps recorded in its metadata.
    Preprocess(PreprocessArgs),
    /// Log the demonstration table to the dataset's project.
    LogTable(RegistryArgs),
    /// List stored versions of a dataset.
    List(RegistryArgs),
}

/// Dataset location and naming shared by all subcommands.
#[derive(clap::Args)]
struct DatasetArgs {
    /// Dataset directory.
    path: PathBuf,

    /// Dataset name (defaults to the directory name).
    #[arg(long)]
    name: Option<String>,

    /// Project the dataset belongs to (defaults to the dataset name).
    #[arg(long)]
    project: Option<String>,
}

/// Dataset plus registry login.
#[derive(clap::Args)]
struct RegistryArgs {
    #[command(flatten)]
    dataset: DatasetArgs,

    /// Registry API key, or a file containing it.
    #[arg(long, env = "WANDB_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(clap::Args)]
struct UploadArgs {
    #[command(flatten)]
    registry: RegistryArgs,

    /// Metadata to attach, as a JSON object.
    #[arg(long)]
    metadata: Option<String>,
}

#[derive(clap::Args)]
struct DownloadArgs {
    #[command(flatten)]
    registry: RegistryArgs,

    /// Artifact to fetch (defaults to the dataset name). May include ':version'.
    #[arg(long)]
    artifact: Option<String>,

    /// Artifact version or alias.
    #[arg(long, default_value = "latest")]
    version: String,
}

#[derive(clap::Args)]
struct RoboflowArgs {
    #[command(flatten)]
    dataset: DatasetArgs,

    /// Export format, e.g. 'yolov8' or 'coco'.
    #[arg(long)]
    format: String,

    /// Roboflow workspace.
    #[arg(long)]
    workspace: String,

    /// Roboflow project (defaults to --project).
    #[arg(long = "rf-project")]
    rf_project: Option<String>,

    /// Roboflow dataset version.
    #[arg(long = "rf-version")]
    rf_version: Option<u32>,

    /// Roboflow API key, or a file containing it.
    #[arg(long, env = "ROBOFLOW_API_KEY", hide_env_values = true)]
    roboflow_api_key: Option<String>,
}

#[derive(clap::Args)]
struct PreprocessArgs {
    #[command(flatten)]
    registry: RegistryArgs,

    /// What the preprocessing aimed at (e.g. 'resize').
    #[arg(long)]
    target: String,

    /// Preprocessing steps, as JSON.
    #[arg(long)]
    steps: String,

    /// Extra metadata, as a JSON object.
    #[arg(long)]
    metadata: Option<String>,
}

/// Run the availai CLI.
///
/// This is the main entry point for the CLI, called from `main.rs`.
pub fn run() -> Result<(), AvailaiError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(root) = cli.registry_root {
        settings.registry.root = Some(root);
    }

    match cli.command {
        Some(Commands::Upload(args)) => run_upload(&settings, args),
        Some(Commands::Download(args)) => run_download(&settings, args),
        Some(Commands::Roboflow(args)) => run_roboflow(&settings, args),
        Some(Commands::Preprocess(args)) => run_preprocess(&settings, args),
        Some(Commands::LogTable(args)) => run_log_table(&settings, args),
        Some(Commands::List(args)) => run_list(&settings, args),
        None => {
            println!("availai {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Push and pull computer-vision datasets.");
            println!();
            println!("Run 'availai --help' for usage information.");
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "availai=debug"
    } else {
        "availai=info"
    };
    // A subscriber may already be installed when embedded; keep that one.
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn offline_registry(settings: &Settings) -> OfflineRegistry {
    OfflineRegistry::new(settings.registry_root()).with_api_key_env(settings.api_key_env())
}

fn open_dataset(args: DatasetArgs, mode: OpenMode) -> Result<DatasetHandle, AvailaiError> {
    DatasetHandle::open(
        args.path,
        DatasetOptions {
            name: args.name,
            project: args.project,
            mode,
        },
    )
}

fn run_upload(settings: &Settings, args: UploadArgs) -> Result<(), AvailaiError> {
    let metadata = args.metadata.as_deref().map(parse_metadata).transpose()?;
    let registry = offline_registry(settings);
    let dataset = open_dataset(args.registry.dataset, OpenMode::Upload)?;
    let connection = dataset.connect(&registry, args.registry.api_key.as_deref())?;

    let reference = dataset.upload_artifact(&connection, metadata)?;
    println!("{reference}");
    Ok(())
}

fn run_download(settings: &Settings, args: DownloadArgs) -> Result<(), AvailaiError> {
    let registry = offline_registry(settings);
    let dataset = open_dataset(args.registry.dataset, OpenMode::Download)?;
    let connection = dataset.connect(&registry, args.registry.api_key.as_deref())?;

    let directory = dataset.download_artifact(
        &connection,
        args.artifact.as_deref().unwrap_or_default(),
        &args.version,
    )?;
    println!("{}", directory.display());
    Ok(())
}

#[cfg(feature = "roboflow")]
fn run_roboflow(settings: &Settings, args: RoboflowArgs) -> Result<(), AvailaiError> {
    use hosting::roboflow::RoboflowClient;

    let client = RoboflowClient::with_base_url(settings.roboflow.api_url.clone())
        .with_timeout(std::time::Duration::from_secs(settings.roboflow.timeout_secs));
    let dataset = open_dataset(args.dataset, OpenMode::Download)?;

    let request = HostedDownload {
        format: &args.format,
        secret: args.roboflow_api_key.as_deref().unwrap_or_default(),
        workspace: &args.workspace,
        project: args.rf_project.as_deref(),
        version: args.rf_version,
    };
    let directory = dataset.download_from_secondary_backend(&client, &request)?;
    println!("{}", directory.display());
    Ok(())
}

#[cfg(not(feature = "roboflow"))]
fn run_roboflow(_settings: &Settings, _args: RoboflowArgs) -> Result<(), AvailaiError> {
    Err(AvailaiError::Validation(
        "this build of availai was compiled without the 'roboflow' feature".to_string(),
    ))
}

fn run_preprocess(settings: &Settings, args: PreprocessArgs) -> Result<(), AvailaiError> {
    let steps: serde_json::Value =
        serde_json::from_str(&args.steps).map_err(|source| AvailaiError::MetadataParse {
            input: args.steps.clone(),
            source,
        })?;
    let metadata = args.metadata.as_deref().map(parse_metadata).transpose()?;
    let registry = offline_registry(settings);
    let dataset = open_dataset(args.registry.dataset, OpenMode::Upload)?;
    let connection = dataset.connect(&registry, args.registry.api_key.as_deref())?;

    let reference = dataset.preprocess(&connection, &args.target, steps, metadata)?;
    println!("{reference}");
    Ok(())
}

fn run_log_table(settings: &Settings, args: RegistryArgs) -> Result<(), AvailaiError> {
    let registry = offline_registry(settings);
    let dataset = open_dataset(args.dataset, OpenMode::Download)?;
    let connection = dataset.connect(&registry, args.api_key.as_deref())?;

    dataset.log_sample_table(&connection)?;
    println!("{}", crate::registry::SAMPLE_TABLE_LABEL);
    Ok(())
}

fn run_list(settings: &Settings, args: RegistryArgs) -> Result<(), AvailaiError> {
    let registry = offline_registry(settings);
    let dataset = open_dataset(args.dataset, OpenMode::Download)?;
    let connection = dataset.connect(&registry, args.api_key.as_deref())?;

    for reference in dataset.list_artifacts(&connection)? {
        println!("{reference}");
    }
    Ok(())
}
