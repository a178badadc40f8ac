use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use geopublish::collab::Collaborators;
use geopublish::project::ProjectSnapshot;
use geopublish::publish::{MetadataPolicy, PublishOrchestrator, PublishRequest, RunOutcome};
use geopublish::servers::{ServerInstance, ServerRegistry};

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    #[clap(short, long, global = true)]
    log_level: Option<String>,
    /// Server registry file
    #[clap(long, global = true, default_value = "servers.json")]
    registry: PathBuf,
    /// Scratch directory for exported artifacts
    #[clap(long, global = true, default_value = ".geopublish-work")]
    work_dir: PathBuf,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish the layers of a project to configured targets
    Publish {
        /// Project snapshot document (YAML)
        #[clap(short, long)]
        project: PathBuf,
        /// Data catalog target name
        #[clap(short, long)]
        data: Option<String>,
        /// Metadata catalog target name
        #[clap(short, long)]
        metadata: Option<String>,
        /// Layer ids to publish (default: all)
        #[clap(short = 'L', long = "layer")]
        layers: Vec<String>,
        /// Publish styles only, leave data and metadata untouched
        #[clap(long)]
        only_symbology: bool,
        /// How to treat layers with incomplete metadata
        #[clap(long, default_value = "allow")]
        metadata_policy: String,
    },
    /// Manage configured target servers
    Servers {
        #[clap(subcommand)]
        command: ServerCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ServerCommands {
    /// List configured servers
    List,
    /// Test connectivity of one server (or all)
    Test { name: Option<String> },
    /// Remove a server from the registry
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(&args.log_level);

    let collab = Collaborators::with_defaults(args.work_dir.clone());
    let mut registry = ServerRegistry::load(&args.registry, collab.clone())
        .with_context(|| format!("failed to load registry {}", args.registry.display()))?;

    match args.command {
        Commands::Publish {
            project,
            data,
            metadata,
            layers,
            only_symbology,
            metadata_policy,
        } => {
            let policy: MetadataPolicy = metadata_policy.parse().map_err(|e: String| anyhow!(e))?;
            let snapshot = ProjectSnapshot::load(&project)
                .with_context(|| format!("failed to load project {}", project.display()))?;

            let data_instance = match &data {
                Some(name) => Some(
                    registry
                        .get(name)
                        .cloned()
                        .ok_or_else(|| anyhow!("no server named '{name}' is configured"))?,
                ),
                None => None,
            };
            let meta_instance = match &metadata {
                Some(name) => Some(
                    registry
                        .get(name)
                        .cloned()
                        .ok_or_else(|| anyhow!("no server named '{name}' is configured"))?,
                ),
                None => None,
            };
            if data_instance.is_none() && meta_instance.is_none() {
                return Err(anyhow!("nothing to do: no data or metadata target given"));
            }

            let request = PublishRequest {
                project: snapshot,
                layer_ids: layers,
                only_symbology,
                policy,
            };

            // GeoServer targets work per project: derive the workspace from
            // the project name and hand them the shared-container planner.
            if let Some(ServerInstance::Geoserver(gs)) = &data_instance {
                if !gs.has_workspace() {
                    gs.force_workspace(&request.project.name)
                        .map_err(|e| anyhow!(e.to_string()))?;
                }
                gs.attach_consolidator(PublishOrchestrator::consolidator_for(&request, &collab))
                    .await;
            }

            let orchestrator =
                PublishOrchestrator::for_targets(data_instance.as_ref(), meta_instance.as_ref())
                    .map_err(|e| anyhow!(e))?;
            info!("publishing {} layer(s)", request.project.layers.len());
            let report = orchestrator.start(request).wait().await;

            for (layer, result) in &report.results {
                let status = if result.is_clean() { "ok" } else { "failed" };
                println!("{layer}: {status}");
                for warning in &result.warnings {
                    println!("  warning: {warning}");
                }
                for error in &result.errors {
                    println!("  error: {error}");
                }
            }
            match &report.outcome {
                RunOutcome::Completed => {}
                RunOutcome::Cancelled => println!("run was cancelled"),
                RunOutcome::Failed(message) => println!("run failed: {message}"),
            }
            if report.has_errors() {
                std::process::exit(1);
            }
        }
        Commands::Servers { command } => match command {
            ServerCommands::List => {
                if registry.is_empty() {
                    println!("no servers configured");
                }
                for (name, instance) in registry.iter() {
                    println!("{name}\t{}", instance.server().type_label());
                }
            }
            ServerCommands::Test { name } => {
                let targets: Vec<Arc<str>> = match name {
                    Some(name) => vec![name.into()],
                    None => registry.names().map(Arc::from).collect(),
                };
                let mut failed = false;
                for name in targets {
                    let instance = registry
                        .get(&name)
                        .ok_or_else(|| anyhow!("no server named '{name}' is configured"))?;
                    let mut errors = BTreeSet::new();
                    if instance.server().test_connection(&mut errors).await {
                        println!("{name}: ok");
                    } else {
                        failed = true;
                        println!("{name}: failed");
                        for error in errors {
                            println!("  {error}");
                        }
                    }
                }
                if failed {
                    std::process::exit(1);
                }
            }
            ServerCommands::Remove { name } => {
                registry.remove(&name)?;
                println!("removed '{name}'");
            }
        },
    }

    Ok(())
}

fn setup_logging(log_level: &Option<String>) {
    let log_level = match log_level
        .as_ref()
        .unwrap_or(&"info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("reqwest=warn,{}", log_level)))
        .without_time()
        .init();
}
