//! Tastevin CLI.
//!
//! Entry points for document ingestion, querying, recommendation runs, and
//! graph maintenance. Exit codes: 0 success, 1 configuration or input
//! error, 2 storage failure after retries, 3 model backend failure after
//! retries.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tastevin::Fabric;
use tastevin::config::{AppConfig, Cli as ConfigCli};
use tastevin::domain::IngestPayload;
use tastevin::embedding::{BatchedEmbedder, EmbeddingClient};
use tastevin::embedding::fastembed::FastembedClient;
use tastevin::embedding::remote::RemoteEmbeddingClient;
use tastevin::error::{FabricError, Result};
use tastevin::llm::LlmClient;
use tastevin::llm::chat::{ChatCompletionsClient, ChatSettings};
use tastevin::prompts::PromptRegistry;
use tastevin::query::{QueryMode, QueryParams};
use tastevin::storage::memory::{MemoryGraphStore, MemoryKvStore, MemoryVectorStore};
use tastevin::storage::surreal::{
    SurrealGraphStore, SurrealKvStore, SurrealSession, SurrealVectorStore,
};
use tastevin::storage::{EdgeTypeTable, GraphStore, KvStore, NS_LLM_CACHE, VectorStore};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Restaurant-recommendation knowledge fabric")]
struct Args {
    #[command(flatten)]
    config: ConfigCli,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one or more JSON payloads (file, or stdin when no path given)
    Ingest {
        /// Path to a JSON object or array of objects
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Ask the fabric a question
    Query {
        question: String,
        /// naive | local | global | hybrid
        #[arg(short, long, default_value = "hybrid")]
        mode: String,
        /// Entity names restricting the candidate set
        #[arg(long = "filter")]
        vdb_filter: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Produce RECO edges for a user
    Recommend {
        custom_id: String,
    },
    /// Collapse duplicate user nodes sharing a custom id
    MergeUsers,
    /// Drop the cached LLM responses
    DropLlmCache,
}

#[tokio::main]
async fn main() {
    tastevin::telemetry::init();
    let _ = dotenv();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(name: "cli.failed", error = %e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(&args.config)?;
    let fabric = build_fabric(&config).await?;

    match args.command {
        Command::Ingest { file } => {
            let raw = read_input(file)?;
            let parsed: Value = serde_json::from_str(&raw)
                .map_err(|e| FabricError::UserInput(format!("payload is not JSON: {e}")))?;
            let payloads = match parsed {
                Value::Array(items) => items,
                other => vec![other],
            };
            for raw_payload in &payloads {
                let payload = IngestPayload::from_json(raw_payload)?;
                let report = fabric.ingest.ingest(payload).await?;
                info!(
                    name: "cli.ingest.done",
                    doc_id = %report.doc_id,
                    skipped = report.skipped,
                    chunks = report.chunks,
                    entities = report.entities,
                    "payload processed"
                );
            }
            println!("{}", serde_json::json!({"status": "success", "ingested": payloads.len()}));
        }
        Command::Query { question, mode, vdb_filter, top_k, user_id } => {
            let mode = QueryMode::from_str(&mode)?;
            let mut params = QueryParams::new(question, mode);
            params.vdb_filter = vdb_filter;
            params.top_k = top_k;
            params.user_id = user_id;
            let response = fabric.query.query(params).await?;
            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
        }
        Command::Recommend { custom_id } => {
            let outcome = fabric.reco.recommend(&custom_id).await?;
            println!(
                "{}",
                serde_json::json!({
                    "created": outcome.created,
                    "verified": outcome.verified,
                })
            );
        }
        Command::MergeUsers => {
            let removed = fabric.graph.merge_duplicate_users().await?;
            println!("{}", serde_json::json!({"status": "success", "merged": removed}));
        }
        Command::DropLlmCache => {
            fabric.kv.drop_namespace(NS_LLM_CACHE).await?;
            println!("{}", serde_json::json!({"status": "success"}));
        }
    }
    Ok(())
}

fn read_input(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|e| FabricError::UserInput(format!("cannot read {}: {e}", path.display()))),
        None => {
            use std::io::Read;
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| FabricError::UserInput(format!("cannot read stdin: {e}")))?;
            Ok(buffer)
        }
    }
}

async fn build_fabric(config: &AppConfig) -> Result<Fabric> {
    let embedder = build_embedder(config)?;
    let llm: Arc<dyn LlmClient> = Arc::new(ChatCompletionsClient::new(ChatSettings {
        base_url: config.llm.base_url.clone(),
        api_key: config.llm.api_key.clone(),
        model: config.llm.model.clone(),
    }));

    let (kv, vectors, graph): (Arc<dyn KvStore>, Arc<dyn VectorStore>, Arc<dyn GraphStore>) =
        match config.storage.backend.as_str() {
            "memory" => (
                Arc::new(MemoryKvStore::new()),
                Arc::new(MemoryVectorStore::new(Arc::clone(&embedder))),
                Arc::new(MemoryGraphStore::new(EdgeTypeTable::default())),
            ),
            "surreal" => {
                let session = SurrealSession::connect(
                    &config.storage.surreal_url,
                    &config.storage.surreal_namespace,
                    &config.storage.surreal_database,
                )
                .await?;
                (
                    Arc::new(SurrealKvStore::new(session.clone())),
                    Arc::new(SurrealVectorStore::new(session.clone(), Arc::clone(&embedder))),
                    Arc::new(SurrealGraphStore::new(session, EdgeTypeTable::default())),
                )
            }
            other => {
                return Err(FabricError::Configuration(format!(
                    "unknown storage backend: {other}"
                )));
            }
        };

    Fabric::assemble(config, kv, vectors, graph, llm, PromptRegistry::new())
}

fn build_embedder(config: &AppConfig) -> Result<Arc<dyn EmbeddingClient>> {
    let inner: Arc<dyn EmbeddingClient> = match config.embedding.provider.as_str() {
        "fastembed" => Arc::new(FastembedClient::new(config.embedding.dim)?),
        "remote" => Arc::new(RemoteEmbeddingClient::new(
            config.embedding.base_url.clone().unwrap_or_default(),
            config.embedding.api_key.clone(),
            config.embedding.model.clone(),
            config.embedding.dim,
        )),
        other => {
            return Err(FabricError::Configuration(format!(
                "unknown embedding provider: {other}"
            )));
        }
    };
    Ok(Arc::new(BatchedEmbedder::new(
        inner,
        config.embedding.batch_num,
        config.embedding.max_async,
    )))
}
