use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use workflow_engine::{
    config::Config,
    services::Services,
    store::WorkflowDefinition,
    workflow::GraphDefinition,
};

#[derive(Parser)]
#[command(name = "workflow", about = "Graph-based workflow engine with approval gates")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one pass of deadline escalations and scheduled transitions
    Process {
        /// Only report how many instances are still open
        #[arg(short = 'd', long)]
        dry_run: bool,
    },
    /// Create or update a definition from a JSON or YAML file and save it as a draft
    Import {
        file: PathBuf,
        #[arg(long)]
        publish: bool,
    },
    /// Serve the HTTP surface with the resume worker and the periodic deadline scanner
    Serve,
    /// Print the JSON Schema of the workflow graph format
    Schema,
}

/// Definition metadata plus its graph.
#[derive(Debug, Deserialize)]
struct DefinitionFile {
    name: String,
    slug: String,
    #[serde(default)]
    description: Option<String>,
    entity_type: String,
    #[serde(default)]
    plugin_name: Option<String>,
    #[serde(alias = "definition")]
    graph: Value,
    #[serde(default)]
    change_notes: Option<String>,
}

fn read_definition_file(path: &Path) -> anyhow::Result<DefinitionFile> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let file = if is_yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {} as YAML", path.display()))?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {} as JSON", path.display()))?
    };
    Ok(file)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Command::Schema = cli.command {
        let schema = schemars::schema_for!(GraphDefinition);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = Config::load().context("loading configuration")?;
    let mut services = Services::build(&config)
        .await
        .context("initializing services")?;

    match cli.command {
        Command::Process { dry_run } => {
            if dry_run {
                let open = services.store.count_incomplete_instances().await?;
                println!("{} instance(s) not completed", open);
                return Ok(());
            }
            services.spawn_resume_worker();
            let report = services.scanner().scan(Utc::now()).await;
            if services.queue.outstanding() > 0 {
                info!("Waiting for {} queued resume job(s)", services.queue.outstanding());
            }
            services.queue.wait_idle().await;
            println!("processed: {}", report.processed);
            println!("errors: {}", report.errors.len());
            for failure in &report.errors {
                println!("  {}", failure.message);
            }
        }
        Command::Import { file, publish } => {
            let file = read_definition_file(&file)?;
            let mut definition = match services.store.get_definition_by_slug(&file.slug).await? {
                Some(existing) => existing,
                None => WorkflowDefinition::new(&file.name, &file.slug, &file.entity_type),
            };
            if definition.entity_type != file.entity_type {
                bail!(
                    "definition {} exists for entity type {}",
                    file.slug,
                    definition.entity_type
                );
            }
            definition.name = file.name;
            definition.description = file.description;
            definition.plugin_name = file.plugin_name;
            definition.updated_at = Utc::now();
            services.store.save_definition(&definition).await?;

            let version = services
                .versions
                .create_draft(definition.id, file.graph, file.change_notes)
                .await?;
            println!("saved {} version {} as draft", definition.slug, version.version_number);
            if publish {
                services.versions.publish(version.id, None).await?;
                println!("published {} version {}", definition.slug, version.version_number);
            }
        }
        Command::Serve => {
            services.spawn_resume_worker();
            let scanner = services.scanner().spawn();
            info!("Starting server on {}", config.server.addr);
            let result = services.server().start(&config.server.addr).await;
            scanner.abort();
            result?;
        }
        Command::Schema => {}
    }

    Ok(())
}
