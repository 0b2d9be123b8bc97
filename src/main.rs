mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use repomem_index::RetryPolicy;
use repomem_index::explore::{ExploreState, Explorer};
use repomem_index::indexer::{IndexReport, RepoIndexer, repo_status};
use repomem_index::retriever::{HybridRetriever, LexicalMode, SearchQuery, format_as_context};
use repomem_index::source::{FsSource, RepoSource};
use repomem_index::synth::Synthesizer;
use repomem_index::watcher::IndexWatcher;
use repomem_llm::any::AnyProvider;
use repomem_llm::ollama::OllamaProvider;
use repomem_store::{ChunkKind, ChunkStore, SqliteChunkStore};
use tokio::sync::watch;

use crate::config::{Config, ProviderKind};

#[derive(Parser)]
#[command(
    name = "repomem",
    about = "Incremental semantic index and hybrid search over source repositories"
)]
#[command(version, propagate_version = true)]
struct Cli {
    /// Configuration file (defaults to $REPOMEM_CONFIG, then config/default.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring the index of a repository up to date
    Index {
        /// Repository working tree
        path: PathBuf,
        /// Repository id (defaults to the directory name)
        #[arg(long)]
        repo_id: Option<String>,
    },

    /// Search indexed chunks
    Search {
        text: String,
        /// Restrict to one chunk kind
        #[arg(long, value_parser = parse_kind)]
        kind: Option<ChunkKind>,
        /// Number of results
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        repo_id: Option<String>,
        /// Rank by vector similarity plus a lexical bonus instead of filtering on the text
        #[arg(long)]
        boost: bool,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index health for a repository
    Status {
        #[arg(long)]
        repo_id: Option<String>,
    },

    /// Migrate stored chunks to the current schema version
    Backfill {
        #[arg(long)]
        repo_id: String,
    },

    /// Index a repository, then keep it current as files change
    Watch {
        path: PathBuf,
        #[arg(long)]
        repo_id: Option<String>,
    },

    /// Answer a question by letting the model search and read the repository
    Ask {
        question: String,
        #[arg(long)]
        repo_id: String,
        /// Repository working tree used for `fetch_file`
        #[arg(long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config, std::env::var("REPOMEM_CONFIG").ok());
    let config = Config::load(&config_path)?;
    config.validate()?;
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let provider = Arc::new(create_provider(&config)?);
    let store = open_store(&config).await?;

    match cli.command {
        Command::Index { path, repo_id } => {
            let (repo_id, root) = repo_root(&path, repo_id)?;
            let indexer = build_indexer(&config, &store, &provider, &repo_id, root);
            let report = indexer.index_repo(&repo_id, shutdown_signal()).await?;
            print_report(&repo_id, &report);
        }
        Command::Search {
            text,
            kind,
            k,
            repo_id,
            boost,
            json,
        } => {
            let retriever = build_retriever(&config, &store, &provider);
            let mut query = SearchQuery::text(text, k.unwrap_or(config.retrieval.default_k));
            if let Some(kind) = kind {
                query = query.with_kind(kind);
            }
            if let Some(repo_id) = repo_id {
                query = query.in_repo(repo_id);
            }
            if boost {
                query = query.with_lexical(LexicalMode::Boost);
            }
            let results = retriever.search(query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("no results");
            } else {
                println!("{}", format_as_context(&results));
            }
        }
        Command::Status { repo_id } => {
            let repo_id = match repo_id {
                Some(id) => id,
                None => default_repo_id(&std::env::current_dir()?)?,
            };
            let status = repo_status(store.as_ref(), &repo_id).await?;
            println!("repository {repo_id}: {} files", status.files);
            for (kind, n) in &status.chunks_by_kind {
                println!("  {kind}: {n}");
            }
            println!("  llm summarized: {}", status.llm_summarized);
            println!("  underchunked: {}", status.underchunked);
            println!("  outdated schema: {}", status.outdated_schema);
            println!("  commits: {}", status.commits.len());
        }
        Command::Backfill { repo_id } => {
            let indexer = build_indexer(&config, &store, &provider, &repo_id, PathBuf::new());
            let report = indexer.backfill(&repo_id).await?;
            println!(
                "backfill {repo_id}: {} of {} keys rewritten, {} chunks migrated, {} re-embedded",
                report.keys_rewritten,
                report.keys_scanned,
                report.chunks_migrated,
                report.chunks_reembedded
            );
            for error in &report.errors {
                eprintln!("  error: {error}");
            }
        }
        Command::Watch { path, repo_id } => {
            let (repo_id, root) = repo_root(&path, repo_id)?;
            let indexer = build_indexer(&config, &store, &provider, &repo_id, root.clone());
            let shutdown = shutdown_signal();
            let report = indexer.index_repo(&repo_id, shutdown.clone()).await?;
            print_report(&repo_id, &report);

            let _watcher = IndexWatcher::start(
                &root,
                repo_id.clone(),
                Arc::clone(&indexer),
                Duration::from_secs(1),
            )?;
            tracing::info!(repo = %repo_id, root = %root.display(), "watching for changes");
            wait_for_shutdown(shutdown).await;
        }
        Command::Ask {
            question,
            repo_id,
            path,
        } => {
            let root = std::fs::canonicalize(&path)
                .with_context(|| format!("cannot open {}", path.display()))?;
            let retriever = Arc::new(build_retriever(&config, &store, &provider));
            let source: Arc<dyn RepoSource> = Arc::new(FsSource::single(repo_id.clone(), root));
            let explorer = Explorer::new(
                Arc::clone(&provider),
                retriever,
                source,
                repo_id,
                config.explore.clone(),
            );
            let run = explorer.run(&question).await?;
            match run.state {
                ExploreState::Done(answer) => println!("{answer}"),
                ExploreState::Failed(reason) => bail!("no answer: {reason}"),
                ExploreState::AwaitingDecision | ExploreState::ExecutingTool(_) => {
                    bail!("exploration stopped before finishing");
                }
            }
        }
    }
    Ok(())
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn resolve_config_path(flag: Option<PathBuf>, env: Option<String>) -> PathBuf {
    flag.or_else(|| env.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/default.toml"))
}

fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    match config.llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &config.llm.base_url,
            config.llm.model.clone(),
            config.llm.embedding_model.clone(),
        ))),
        #[cfg(feature = "mock")]
        ProviderKind::Mock => Ok(AnyProvider::Mock(repomem_llm::mock::MockProvider::default())),
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn ChunkStore>> {
    let path = &config.store.sqlite_path;
    if path != ":memory:"
        && let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let store = SqliteChunkStore::new(path)
        .await
        .with_context(|| format!("cannot open chunk store at {path}"))?;
    Ok(Arc::new(store))
}

fn build_indexer(
    config: &Config,
    store: &Arc<dyn ChunkStore>,
    provider: &Arc<AnyProvider>,
    repo_id: &str,
    root: PathBuf,
) -> Arc<RepoIndexer<AnyProvider>> {
    let source: Arc<dyn RepoSource> = Arc::new(FsSource::single(repo_id, root));
    Arc::new(RepoIndexer::new(
        Arc::clone(store),
        source,
        Arc::clone(provider),
        config.pipeline(),
    ))
}

fn build_retriever(
    config: &Config,
    store: &Arc<dyn ChunkStore>,
    provider: &Arc<AnyProvider>,
) -> HybridRetriever<AnyProvider> {
    let synth = Synthesizer::new(
        Arc::clone(provider),
        RetryPolicy {
            max_attempts: config.indexer.embed_max_attempts,
            backoff_ms: config.indexer.embed_backoff_ms,
        },
        config.indexer.max_embed_chars,
    );
    HybridRetriever::new(Arc::clone(store), config.retrieval.clone()).with_synthesizer(synth)
}

/// Canonical root of a working tree and the repository id to index it under.
fn repo_root(path: &Path, repo_id: Option<String>) -> anyhow::Result<(String, PathBuf)> {
    let root =
        std::fs::canonicalize(path).with_context(|| format!("cannot open {}", path.display()))?;
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let repo_id = match repo_id {
        Some(id) => id,
        None => default_repo_id(&root)?,
    };
    Ok((repo_id, root))
}

fn default_repo_id(root: &Path) -> anyhow::Result<String> {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .with_context(|| format!("cannot derive a repository id from {}", root.display()))
}

fn parse_kind(raw: &str) -> Result<ChunkKind, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|_| {
        let names: Vec<&str> = ChunkKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown chunk kind `{raw}` (expected one of {})", names.join(", "))
    })
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

fn print_report(repo_id: &str, report: &IndexReport) {
    println!(
        "{repo_id}: {} indexed, {} unchanged, {} skipped, {} underchunked, \
         {} failed (stale), {} removed in {} ms",
        report.indexed,
        report.unchanged,
        report.skipped,
        report.underchunked,
        report.failed_stale,
        report.removed,
        report.duration_ms
    );
    if report.cancelled > 0 {
        println!("  cancelled before {} files", report.cancelled);
    }
    println!(
        "  chunks: {} written, {} reused; summaries: {}",
        report.chunks_written, report.chunks_reused, report.summaries_written
    );
    for error in &report.errors {
        eprintln!("  error: {error}");
    }
}
