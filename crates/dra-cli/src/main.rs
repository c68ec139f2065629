use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dra_core::DraConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "dractl",
    about = "dractl — dynamic resource allocation control",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Configuration file (default: ./dra.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override [store].path from the configuration
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a dra.toml scaffold
    Init {
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Node allocations default to
        #[arg(long)]
        node_name: Option<String>,
    },
    /// Validate an object file without storing it
    Validate {
        #[arg(short, long, value_enum)]
        kind: commands::objects::Kind,
        file: PathBuf,
    },
    /// Publish and list resource slices
    Slice {
        #[command(subcommand)]
        action: SliceAction,
    },
    /// Manage device classes
    Class {
        #[command(subcommand)]
        action: ClassAction,
    },
    /// Drive claims through allocation, reservation and release
    Claim {
        #[command(subcommand)]
        action: ClaimAction,
    },
    /// Show eviction plans for reserved claims, optionally carrying them out
    Evictions {
        /// Remove consumers whose deadline passed
        #[arg(long)]
        sweep: bool,
        /// Evaluate at this Unix time instead of now
        #[arg(long)]
        now: Option<u64>,
    },
    /// Run the eviction sweep until Ctrl-C, then print metrics
    Run {
        /// Sweep interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
}

#[derive(Subcommand)]
enum SliceAction {
    /// Publish (create or replace) a slice from a JSON file
    Publish { file: PathBuf },
    /// List slices, optionally filtered
    List {
        /// Only slices for this node
        #[arg(long)]
        node: Option<String>,
        /// Only slices of this driver
        #[arg(long)]
        driver: Option<String>,
        /// Field selector, e.g. spec.nodeName=node-1,spec.driver=gpu.example.com
        #[arg(long, conflicts_with_all = ["node", "driver"])]
        selector: Option<String>,
        /// Print pool completeness instead of slices
        #[arg(long)]
        pools: bool,
    },
    /// Delete a slice
    Delete { name: String },
}

#[derive(Subcommand)]
enum ClassAction {
    /// Create or replace a class from a JSON file
    Apply { file: PathBuf },
    List,
}

#[derive(Subcommand)]
enum ClaimAction {
    /// Create a claim from a JSON file
    Create { file: PathBuf },
    /// Create a claim from a stored template
    FromTemplate {
        /// Template key (namespace/name)
        template: String,
        /// Name of the new claim
        name: String,
    },
    /// Store a claim template from a JSON file
    Template { file: PathBuf },
    Show { key: String },
    List,
    Allocate {
        key: String,
        /// Node the consumer runs on
        #[arg(long)]
        node: Option<String>,
        /// Node labels, key=value
        #[arg(long = "label", value_parser = commands::claim::parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Check binding conditions
    Bind { key: String },
    Reserve {
        key: String,
        #[arg(long, default_value = "pods")]
        resource: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        uid: String,
    },
    Unreserve {
        key: String,
        #[arg(long)]
        uid: String,
    },
    Deallocate { key: String },
    Delete { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = commands::load_config(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.path = store;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.filter))?,
        )
        .init();

    run(cli.command, config).await
}

async fn run(command: Commands, config: DraConfig) -> anyhow::Result<()> {
    match command {
        Commands::Init { path, node_name } => commands::init::init(&path, &config, node_name.as_deref()),
        Commands::Validate { kind, file } => commands::objects::validate(kind, &file),
        Commands::Slice { action } => {
            let store = commands::open_store(&config)?;
            match action {
                SliceAction::Publish { file } => commands::objects::publish_slice(&store, &file),
                SliceAction::List {
                    node,
                    driver,
                    selector,
                    pools,
                } => commands::objects::list_slices(&store, node, driver, selector.as_deref(), pools),
                SliceAction::Delete { name } => commands::objects::delete_slice(&store, &name),
            }
        }
        Commands::Class { action } => {
            let store = commands::open_store(&config)?;
            match action {
                ClassAction::Apply { file } => commands::objects::apply_class(&store, &file),
                ClassAction::List => commands::objects::list_classes(&store),
            }
        }
        Commands::Claim { action } => {
            let store = commands::open_store(&config)?;
            match action {
                ClaimAction::Create { file } => commands::objects::create_claim(&store, &file),
                ClaimAction::FromTemplate { template, name } => {
                    commands::objects::claim_from_template(&store, &template, &name)
                }
                ClaimAction::Template { file } => commands::objects::put_template(&store, &file),
                ClaimAction::Show { key } => commands::objects::show_claim(&store, &key),
                ClaimAction::List => commands::objects::list_claims(&store),
                ClaimAction::Delete { key } => commands::objects::delete_claim(&store, &key),
                ClaimAction::Allocate { key, node, labels } => {
                    let controller = commands::controller(store, &config)?;
                    commands::claim::allocate(&controller, &key, node, labels).await
                }
                ClaimAction::Bind { key } => {
                    let controller = commands::controller(store, &config)?;
                    commands::claim::bind(&controller, &key).await
                }
                ClaimAction::Reserve {
                    key,
                    resource,
                    name,
                    uid,
                } => {
                    let controller = commands::controller(store, &config)?;
                    commands::claim::reserve(&controller, &key, &resource, &name, &uid).await
                }
                ClaimAction::Unreserve { key, uid } => {
                    let controller = commands::controller(store, &config)?;
                    commands::claim::unreserve(&controller, &key, &uid).await
                }
                ClaimAction::Deallocate { key } => {
                    let controller = commands::controller(store, &config)?;
                    commands::claim::deallocate(&controller, &key).await
                }
            }
        }
        Commands::Evictions { sweep, now } => {
            let controller = commands::controller(commands::open_store(&config)?, &config)?;
            commands::evict::evictions(&controller, sweep, now).await
        }
        Commands::Run { interval_ms } => {
            let controller = commands::controller(commands::open_store(&config)?, &config)?;
            commands::evict::run(controller, interval_ms).await
        }
    }
}
