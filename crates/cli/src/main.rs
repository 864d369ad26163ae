use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use guideline_core::{AppConfig, GuidelineStore, Ingestor, LlmClient, Workflow};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "guideline", version = VERSION, about = "Vectorless clinical guideline retrieval")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides GUIDELINE_DB and the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a question from the stored guidelines.
    Query {
        question: String,
        #[arg(long)]
        document: Option<String>,
        /// Print the final workflow state and visited stages as well.
        #[arg(long, action = ArgAction::SetTrue)]
        trace: bool,
    },
    /// Load a text file, or every .txt file in a directory.
    Ingest { path: PathBuf },
    Search {
        query: String,
        #[arg(long = "top-k", default_value_t = 3)]
        top_k: usize,
        #[arg(long)]
        document: Option<String>,
    },
    Document { id: String },
    Health,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.settings.db_path = db;
    }
    let store = open_store(&config.settings.db_path)?;

    match cli.command {
        Commands::Query {
            question,
            document,
            trace,
        } => {
            let oracle = build_oracle(&config)?;
            let workflow = Workflow::with_config(&store, &oracle, config.workflow);
            let outcome = workflow.run_traced(&question, document.as_deref());
            if trace {
                print_json(&outcome)?;
            } else {
                print_json(&outcome.response)?;
            }
        }
        Commands::Ingest { path } => {
            if !path.exists() {
                return Err(anyhow!("{} does not exist", path.display()));
            }
            let oracle = build_oracle(&config)?;
            let report = Ingestor::new(&store, &oracle).ingest_path(&path)?;
            info!(
                documents = report.documents.len(),
                failures = report.failures.len(),
                "ingest complete"
            );
            print_json(&report)?;
        }
        Commands::Search {
            query,
            top_k,
            document,
        } => {
            let results = store.search_chunks(&query, top_k, document.as_deref())?;
            print_json(&json!({ "query": query, "results": results }))?;
        }
        Commands::Document { id } => {
            let document = store
                .get_document(&id)?
                .ok_or_else(|| anyhow!("document {id} not found"))?;
            print_json(&document)?;
        }
        Commands::Health => {
            print_json(&health_report(&config, &store))?;
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn open_store(path: &Path) -> Result<GuidelineStore> {
    GuidelineStore::open(path).with_context(|| format!("failed to open store {}", path.display()))
}

fn build_oracle(config: &AppConfig) -> Result<LlmClient> {
    let oracle = config.settings.build_oracle().with_context(|| {
        format!(
            "llm provider {} is not configured (set GUIDELINE_PROVIDER=local to run offline)",
            config.settings.provider.as_str()
        )
    })?;
    debug!(provider = oracle.provider().as_str(), model = oracle.model(), "llm provider ready");
    Ok(oracle)
}

fn health_report(config: &AppConfig, store: &GuidelineStore) -> serde_json::Value {
    let env = if config.settings.has_api_key() {
        "ok"
    } else {
        "missing_or_invalid"
    };
    let store = if store.ping() { "ok" } else { "failed" };
    let status = if env == "ok" && store == "ok" {
        "ok"
    } else {
        "error"
    };
    json!({
        "status": status,
        "env": config.settings.env,
        "checks": { "env": env, "store": store },
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
