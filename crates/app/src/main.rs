mod server;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use storechat_core::{
    default_scopes, run_clean_stage, run_chunk_stage, run_crawl, run_embed_stage, CrawlClient,
    CrawlConfig, EmbeddingSplitter, OpenAiEmbedder, RetryPolicy, DEFAULT_CHAT_MODEL,
    DEFAULT_EMBEDDING_MODEL,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "storechat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory for pipeline artifacts (raw, cleaned, chunks, index).
    #[arg(long, env = "STORECHAT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Base URL for OpenAI-compatible embedding/chat endpoints.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// API key for the embedding/chat provider.
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,

    /// Embedding model identifier.
    #[arg(long, env = "OPENAI_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Chat model identifier.
    #[arg(long, env = "OPENAI_CHAT_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    chat_model: String,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl the storefront and write raw page shards.
    Crawl {
        /// Crawl provider API key.
        #[arg(long, env = "FIRECRAWL_API_KEY", hide_env_values = true)]
        firecrawl_api_key: String,

        /// Crawl provider base URL.
        #[arg(long, env = "FIRECRAWL_BASE_URL", default_value = "https://api.firecrawl.dev/v1")]
        firecrawl_base_url: String,

        /// Storefront root URL to crawl.
        #[arg(long, env = "STORECHAT_SITE_URL", default_value = "https://cellavenuestore.com")]
        site_url: String,

        /// Optional scope names to run (e.g. products_en pages_ar).
        #[arg(long, num_args = 0..)]
        scopes: Vec<String>,
    },
    /// Strip boilerplate from raw shards into cleaned shards.
    Clean,
    /// Split cleaned shards into semantic chunks.
    Chunk,
    /// Embed chunks into the on-disk vector index.
    Embed,
    /// Serve the conversational API over HTTP.
    Serve {
        /// Address to bind (host:port).
        #[arg(long, env = "STORECHAT_BIND", default_value = "127.0.0.1:8000")]
        bind: String,
    },
}

struct Paths {
    raw_dir: PathBuf,
    clean_dir: PathBuf,
    chunks_file: PathBuf,
    chunk_resume: PathBuf,
    index_file: PathBuf,
    crawl_manifest: PathBuf,
    clean_manifest: PathBuf,
    chunk_manifest: PathBuf,
    embed_manifest: PathBuf,
}

impl Paths {
    fn new(data_dir: &PathBuf) -> Self {
        let manifests = data_dir.join("manifests");
        Self {
            raw_dir: data_dir.join("raw"),
            clean_dir: data_dir.join("cleaned"),
            chunks_file: data_dir.join("chunks/semantic_chunks.jsonl"),
            chunk_resume: data_dir.join("chunks/chunk_resume.json"),
            index_file: data_dir.join("vectorstore/index.db"),
            crawl_manifest: manifests.join("raw_load_manifest.json"),
            clean_manifest: manifests.join("clean_manifest.json"),
            chunk_manifest: manifests.join("chunk_manifest.json"),
            embed_manifest: manifests.join("embed_manifest.json"),
        }
    }
}

fn require_openai_key(cli: &Cli) -> anyhow::Result<&str> {
    if cli.openai_api_key.trim().is_empty() {
        anyhow::bail!("OPENAI_API_KEY is not set");
    }
    Ok(&cli.openai_api_key)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let paths = Paths::new(&cli.data_dir);

    match &cli.command {
        Command::Crawl {
            firecrawl_api_key,
            firecrawl_base_url,
            site_url,
            scopes,
        } => {
            let client = CrawlClient::new(firecrawl_api_key, firecrawl_base_url, RetryPolicy::default())
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let all_scopes = default_scopes();
            let selected = if scopes.is_empty() {
                all_scopes
            } else {
                all_scopes
                    .into_iter()
                    .filter(|scope| scopes.contains(&scope.name))
                    .collect()
            };
            let config = CrawlConfig {
                site_url: site_url.clone(),
                raw_dir: paths.raw_dir.clone(),
                manifest_path: paths.crawl_manifest.clone(),
                scopes: selected,
            };

            let manifest = run_crawl(&client, &config)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let saved: usize = manifest
                .scopes
                .iter()
                .filter_map(|scope| scope.saved_rows)
                .sum();
            println!(
                "{} records saved across {} scopes (manifest: {})",
                saved,
                manifest.scopes.len(),
                paths.crawl_manifest.display()
            );
        }
        Command::Clean => {
            let manifest = run_clean_stage(&paths.raw_dir, &paths.clean_dir, &paths.clean_manifest)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!(
                "cleaned {}/{} records, chars {} -> {}",
                manifest.totals.written_records,
                manifest.totals.read_records,
                manifest.totals.raw_chars,
                manifest.totals.clean_chars
            );
        }
        Command::Chunk => {
            let api_key = require_openai_key(&cli)?;
            let embedder = OpenAiEmbedder::new(api_key, &cli.openai_base_url, &cli.embedding_model)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            info!(model = %cli.embedding_model, "splitting with embedding-based boundaries");
            let splitter = EmbeddingSplitter::new(embedder);

            let manifest = run_chunk_stage(
                &paths.clean_dir,
                &paths.chunks_file,
                &paths.chunk_resume,
                &paths.chunk_manifest,
                &splitter,
            )
            .await
            .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!(
                "{} records -> {} chunks (avg {:.0} chars) in {:.1}s",
                manifest.totals.records,
                manifest.totals.chunks,
                manifest.totals.avg_chunk_chars,
                manifest.totals.elapsed_seconds
            );
        }
        Command::Embed => {
            let api_key = require_openai_key(&cli)?;
            let embedder = OpenAiEmbedder::new(api_key, &cli.openai_base_url, &cli.embedding_model)
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            let manifest = run_embed_stage(
                &paths.chunks_file,
                &paths.index_file,
                &paths.embed_manifest,
                &embedder,
            )
            .await
            .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!(
                "{} chunks embedded into {} in {:.1}s",
                manifest.total_chunks_indexed,
                paths.index_file.display(),
                manifest.elapsed_seconds
            );
        }
        Command::Serve { bind } => {
            let api_key = require_openai_key(&cli)?.to_string();
            let options = server::ServeOptions {
                bind: bind.clone(),
                index_file: paths.index_file.clone(),
                embed_manifest: paths.embed_manifest.clone(),
                openai_api_key: api_key,
                openai_base_url: cli.openai_base_url.clone(),
                embedding_model: cli.embedding_model.clone(),
                chat_model: cli.chat_model.clone(),
            };
            server::run(options).await.context("server shutdown")?;
        }
    }

    Ok(())
}
