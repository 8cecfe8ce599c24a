//! PeerDB binary — thin CLI shell over the [`peerdb_server`] library crate.

use clap::{Parser, Subcommand};
use peerdb_server::api::{self, AppContext};
use peerdb_server::engine::HttpSearchEngine;
use peerdb_server::errors::{Error, Result};
use peerdb_server::ingest;
use peerdb_server::llm::{HttpChatModel, LlmConfig};
use peerdb_server::service::SearchService;
use peerdb_server::store;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_ELASTIC_URL: &str = "http://127.0.0.1:9200";
const DEFAULT_ELASTIC_INDEX: &str = "docs";
const DEFAULT_CACHE_DIR: &str = ".cache";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_TITLE: &str = "PeerDB Search";

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Knowledge-graph search service over typed property/value claims.
#[derive(Parser)]
#[command(name = "peerdb", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// PostgreSQL URL of the external document store
    #[arg(long, global = true)]
    postgres_url: Option<String>,

    /// Search-engine base URL
    #[arg(long, global = true, default_value = DEFAULT_ELASTIC_URL)]
    elastic_url: String,

    /// Search-engine index name
    #[arg(long, global = true, default_value = DEFAULT_ELASTIC_INDEX)]
    elastic_index: String,

    /// Directory for cached dataset downloads
    #[arg(long = "cache", global = true, default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// Dataset URL or local path for `import`
    #[arg(long = "data", global = true)]
    data_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the search service.
    Serve {
        /// Address to listen on
        #[arg(long, default_value = DEFAULT_LISTEN)]
        listen: String,

        /// Site title reported by the health endpoint
        #[arg(long, default_value = DEFAULT_TITLE)]
        title: String,

        /// Upstream the front layer proxies unknown paths to
        #[arg(long)]
        proxy_to: Option<String>,
    },
    /// Create the index and seed the core property documents.
    Populate,
    /// Import newline-delimited document JSON from `--data`.
    Import {
        /// Directory of supplemental ingredient datasets
        #[arg(long = "ingredients")]
        ingredients_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Acquisition order: store, engine, model, service. Teardown runs in
    // reverse when the scopes drop at the end of each command.
    let cancel = CancellationToken::new();
    let store = store::open(cli.postgres_url.as_deref())?;
    let engine: Arc<dyn peerdb_server::engine::SearchEngine> =
        Arc::new(HttpSearchEngine::new(&cli.elastic_url, cancel.child_token())?);

    match cli.command {
        Commands::Serve { listen, title, proxy_to } => {
            if proxy_to.is_some() {
                warn!("--proxy-to is handled by the front layer; this process serves the API only");
            }
            // The model runs on a detached token: in-flight prompt parses
            // are not aborted by request or shutdown cancellation.
            let llm = match LlmConfig::from_env() {
                Some(config) => {
                    info!(model = %config.model, "prompt parsing enabled");
                    Some(Arc::new(HttpChatModel::new(config, CancellationToken::new())?)
                        as Arc<dyn peerdb_server::llm::ChatModel>)
                }
                None => {
                    warn!("no model endpoint configured; prompts fall back to text search");
                    None
                }
            };
            let service = Arc::new(SearchService::new(engine, store, llm, &cli.elastic_index));
            let ctx = AppContext { service, start_time: Instant::now() };

            let app = api::router(ctx)
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new());

            let listener = tokio::net::TcpListener::bind(&listen)
                .await
                .map_err(|e| Error::fatal(format!("binding {listen}: {e}")))?;
            info!(%listen, %title, index = %cli.elastic_index, "serving");

            let shutdown = cancel.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutting down");
                    shutdown.cancel();
                })
                .await
                .map_err(|e| Error::fatal(format!("server error: {e}")))?;
            Ok(())
        }
        Commands::Populate => {
            let count = ingest::populate(&engine, &store, &cli.elastic_index).await?;
            info!(count, index = %cli.elastic_index, "populated");
            Ok(())
        }
        Commands::Import { ingredients_dir } => {
            let data = cli
                .data_url
                .as_deref()
                .ok_or_else(|| Error::invalid("import requires --data"))?;
            if let Some(dir) = &ingredients_dir {
                info!(dir = %dir.display(), "ingredient datasets noted for the ingesters");
            }
            let report = ingest::run_import(
                Arc::clone(&engine),
                Arc::clone(&store),
                &cli.elastic_index,
                data,
                &cli.cache_dir,
                cancel.child_token(),
            )
            .await?;
            info!(
                stored = report.stored,
                indexed = report.indexed,
                failed = report.failed,
                "import finished"
            );
            Ok(())
        }
    }
}
