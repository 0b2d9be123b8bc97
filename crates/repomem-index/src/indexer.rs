//! Repository indexing orchestrator: plan → extract → enrich → embed → swap.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use repomem_llm::LlmProvider;
use repomem_store::{
    Chunk, ChunkFilter, ChunkKind, ChunkStore, EnrichmentLevel, EnrichmentRecord, IndexState,
    SchemaVersion, chunk_id,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::chunker::{Candidate, ChunkerConfig, Extracted, SkipReason, extract};
use crate::enrichment::{EnrichmentConfig, Enricher, decide};
use crate::error::{IndexError, Result};
use crate::fingerprint::{estimate_tokens, fingerprint};
use crate::planner::{Plan, plan_changes};
use crate::retry::RetryPolicy;
use crate::schema::{Migrated, migrate};
use crate::source::RepoSource;
use crate::summary::build_summaries;
use crate::synth::Synthesizer;
use crate::updater::FileUpdater;

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Files processed in parallel.
    pub concurrency: usize,
    pub embed_max_attempts: u32,
    pub embed_backoff_ms: u64,
    pub write_max_attempts: u32,
    pub write_backoff_ms: u64,
    /// Bound on the text passed to the embedding function.
    pub max_embed_chars: usize,
    /// Rebuild repository and module summaries after a run that changed anything.
    pub summaries: bool,
    pub summary_token_budget: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            embed_max_attempts: 3,
            embed_backoff_ms: 200,
            write_max_attempts: 3,
            write_backoff_ms: 100,
            max_embed_chars: 2000,
            summaries: true,
            summary_token_budget: 512,
        }
    }
}

impl IndexerConfig {
    #[must_use]
    pub fn embed_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.embed_max_attempts,
            backoff_ms: self.embed_backoff_ms,
        }
    }

    #[must_use]
    pub fn write_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.write_max_attempts,
            backoff_ms: self.write_backoff_ms,
        }
    }
}

/// Everything the indexing pipeline is configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub indexer: IndexerConfig,
    pub chunker: ChunkerConfig,
    pub enrichment: EnrichmentConfig,
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub files_planned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Indexed files with at least one underchunked chunk.
    pub underchunked: usize,
    /// Files whose update failed; they stay stale for the next run.
    pub failed_stale: usize,
    pub removed: usize,
    /// Files not started because the run was cancelled.
    pub cancelled: usize,
    pub chunks_written: usize,
    pub chunks_reused: usize,
    pub summaries_written: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Result of indexing a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed {
        written: usize,
        reused: usize,
        underchunked: bool,
    },
    /// Index state already matches the file.
    Unchanged,
    Skipped(SkipReason),
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub keys_scanned: usize,
    pub keys_rewritten: usize,
    pub chunks_migrated: usize,
    pub chunks_reembedded: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStatus {
    pub files: usize,
    pub chunks_by_kind: BTreeMap<ChunkKind, usize>,
    pub llm_summarized: usize,
    pub underchunked: usize,
    /// Chunks still on an older schema version.
    pub outdated_schema: usize,
    pub commits: BTreeSet<String>,
}

/// Indexes repositories from a [`RepoSource`] into a [`ChunkStore`].
pub struct RepoIndexer<P> {
    store: Arc<dyn ChunkStore>,
    source: Arc<dyn RepoSource>,
    updater: FileUpdater<dyn ChunkStore>,
    enricher: Enricher<P>,
    synth: Synthesizer<P>,
    config: PipelineConfig,
}

impl<P: LlmProvider + 'static> RepoIndexer<P> {
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        source: Arc<dyn RepoSource>,
        provider: Arc<P>,
        config: PipelineConfig,
    ) -> Self {
        let updater = FileUpdater::new(Arc::clone(&store), config.indexer.write_policy());
        let enricher = Enricher::new(Arc::clone(&provider), config.enrichment.clone());
        let synth = Synthesizer::new(
            provider,
            config.indexer.embed_policy(),
            config.indexer.max_embed_chars,
        );
        Self {
            store,
            source,
            updater,
            enricher,
            synth,
            config,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn RepoSource> {
        &self.source
    }

    /// The synthesizer chunks are embedded with; queries must use the same one.
    #[must_use]
    pub fn synthesizer(&self) -> &Synthesizer<P> {
        &self.synth
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Compare the repository tree with recorded index state.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Planning`] if the head commit or file list
    /// cannot be read, or a store error if index state cannot be loaded.
    pub async fn plan(&self, repo_id: &str) -> Result<Plan> {
        let source = Arc::clone(&self.source);
        let repo = repo_id.to_string();
        let scanned = tokio::task::spawn_blocking(move || -> Result<_> {
            let commit = source.head_commit(&repo)?;
            let files: Vec<_> = source
                .list_files(&repo)?
                .into_iter()
                .map(|path| {
                    let fp = source
                        .read_file(&repo, &path, &commit)
                        .ok()
                        .map(|bytes| fingerprint(&bytes));
                    (path, fp)
                })
                .collect();
            Ok((commit, files))
        })
        .await?;

        let (commit, files) = scanned.map_err(|e| match e {
            IndexError::Planning { .. } => e,
            other => IndexError::Planning {
                repo_id: repo_id.to_string(),
                message: other.to_string(),
            },
        })?;
        let states = self.store.index_states(repo_id).await?;
        Ok(plan_changes(repo_id, &commit, files, states))
    }

    /// Bring the index of one repository up to date.
    ///
    /// Files run in parallel up to `concurrency`. Setting `shutdown` stops new
    /// files from starting; files already in flight finish their swap.
    ///
    /// # Errors
    ///
    /// Only planning failures are returned; per-file failures are counted in
    /// the report and leave the file stale.
    pub async fn index_repo(
        self: &Arc<Self>,
        repo_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<IndexReport> {
        let start = std::time::Instant::now();
        let plan = self.plan(repo_id).await?;
        let to_index: Vec<String> = plan.to_index().map(|f| f.file_path.clone()).collect();
        let to_remove: Vec<String> = plan.to_remove().map(|f| f.file_path.clone()).collect();

        let mut report = IndexReport {
            files_planned: plan.files.len(),
            unchanged: plan.unchanged(),
            ..IndexReport::default()
        };
        tracing::info!(
            repo = %repo_id,
            commit = %plan.commit,
            index = to_index.len(),
            remove = to_remove.len(),
            unchanged = report.unchanged,
            "indexing started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.indexer.concurrency.max(1)));
        let mut workers = JoinSet::new();
        let mut started = 0usize;

        for file_path in &to_index {
            if *shutdown.borrow() {
                break;
            }
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| IndexError::Other(e.to_string()))?;
            if *shutdown.borrow() {
                break;
            }

            let this = Arc::clone(self);
            let repo = repo_id.to_string();
            let commit = plan.commit.clone();
            let path = file_path.clone();
            workers.spawn(async move {
                let _permit = permit;
                let outcome = this.update_file(&repo, &path, &commit).await;
                (path, outcome)
            });
            started += 1;
        }
        report.cancelled = to_index.len() - started;

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((path, Ok(outcome))) => tally(&mut report, &path, outcome),
                Ok((path, Err(e))) => {
                    tracing::warn!(repo = %repo_id, file = %path, "file left stale: {e}");
                    report.failed_stale += 1;
                    report.errors.push(format!("{path}: {e}"));
                }
                Err(e) => {
                    report.failed_stale += 1;
                    report.errors.push(format!("worker: {e}"));
                }
            }
        }

        if report.cancelled > 0 {
            tracing::info!(repo = %repo_id, remaining = report.cancelled, "indexing cancelled");
        } else {
            for path in &to_remove {
                match self.updater.remove(repo_id, path).await {
                    Ok(_) => report.removed += 1,
                    Err(e) => report.errors.push(format!("remove {path}: {e}")),
                }
            }

            let changed = report.indexed + report.skipped + report.removed > 0;
            if self.config.indexer.summaries && (changed || !self.has_repo_summary(repo_id).await) {
                match self.refresh_summaries(repo_id, &plan.commit).await {
                    Ok(n) => report.summaries_written = n,
                    Err(e) => report.errors.push(format!("summaries: {e}")),
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            repo = %repo_id,
            indexed = report.indexed,
            skipped = report.skipped,
            underchunked = report.underchunked,
            failed_stale = report.failed_stale,
            removed = report.removed,
            duration_ms = report.duration_ms,
            "indexing finished"
        );
        Ok(report)
    }

    /// Re-index one file at the current head, removing it if it is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the head commit cannot be read or the update fails.
    pub async fn reindex_file(&self, repo_id: &str, file_path: &str) -> Result<FileOutcome> {
        let source = Arc::clone(&self.source);
        let repo = repo_id.to_string();
        let commit = tokio::task::spawn_blocking(move || source.head_commit(&repo)).await??;
        self.update_file(repo_id, file_path, &commit).await
    }

    /// Drop a file's chunks and index state, e.g. once it becomes ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the removal.
    pub async fn remove_file(&self, repo_id: &str, file_path: &str) -> Result<FileOutcome> {
        self.updater.remove(repo_id, file_path).await?;
        Ok(FileOutcome::Removed)
    }

    async fn update_file(
        &self,
        repo_id: &str,
        file_path: &str,
        commit: &str,
    ) -> Result<FileOutcome> {
        match self.index_file(repo_id, file_path, commit).await {
            Err(IndexError::FileNotFound(_)) => self.remove_file(repo_id, file_path).await,
            other => other,
        }
    }

    async fn index_file(
        &self,
        repo_id: &str,
        file_path: &str,
        commit: &str,
    ) -> Result<FileOutcome> {
        let bytes = {
            let source = Arc::clone(&self.source);
            let (repo, path, rev) = (
                repo_id.to_string(),
                file_path.to_string(),
                commit.to_string(),
            );
            tokio::task::spawn_blocking(move || source.read_file(&repo, &path, &rev)).await??
        };

        let state = IndexState {
            repo_id: repo_id.to_string(),
            file_path: file_path.to_string(),
            last_indexed_commit: commit.to_string(),
            content_hash: fingerprint(&bytes).content_hash,
            schema_version: SchemaVersion::CURRENT,
        };
        if self.store.index_state(repo_id, file_path).await?.as_ref() == Some(&state) {
            return Ok(FileOutcome::Unchanged);
        }

        let candidates = match extract(file_path, &bytes, &self.config.chunker) {
            Extracted::Chunks { candidates, .. } => candidates,
            Extracted::Skipped(reason) => {
                tracing::debug!(file = %file_path, %reason, "file skipped");
                self.updater.swap(Vec::new(), state).await?;
                return Ok(FileOutcome::Skipped(reason));
            }
        };
        let text = String::from_utf8_lossy(&bytes);

        let mut previous: HashMap<String, Migrated> = self
            .store
            .file_chunks(repo_id, file_path)
            .await?
            .into_iter()
            .map(|c| migrate(c, self.config.chunker.preview_chars))
            .map(|m| (m.chunk.chunk_id.clone(), m))
            .collect();

        let mut chunks = Vec::with_capacity(candidates.len());
        let mut reused = 0usize;
        for candidate in &candidates {
            let id = chunk_id(
                repo_id,
                file_path,
                candidate.symbol_path.as_deref(),
                SchemaVersion::CURRENT,
            );

            if let Some(prev) = previous.remove(&id)
                && self.reusable(&prev.chunk, candidate)
            {
                let mut chunk = prev.chunk;
                if chunk.line_range != candidate.line_range {
                    chunk.line_range = candidate.line_range;
                    chunk.commit_sha = commit.to_string();
                }
                if prev.reembed {
                    chunk.embedding =
                        self.synth.synthesize(&chunk.summary_text, &chunk.preview).await?;
                }
                chunks.push(chunk);
                reused += 1;
                continue;
            }

            let span = candidate.span_text(&text);
            let enriched = self.enricher.enrich(file_path, candidate, &span).await;
            let embedding = self
                .synth
                .synthesize(&enriched.summary_text, &candidate.preview)
                .await?;
            chunks.push(Chunk {
                chunk_id: id,
                kind: candidate.kind,
                repo_id: repo_id.to_string(),
                file_path: file_path.to_string(),
                symbol_path: candidate.symbol_path.clone(),
                commit_sha: commit.to_string(),
                line_range: candidate.line_range,
                content_hash: candidate.content_hash.clone(),
                summary_text: enriched.summary_text,
                preview: candidate.preview.clone(),
                embedding,
                enrichment: enriched.record,
            });
        }

        let underchunked = chunks.iter().any(|c| c.enrichment.underchunked);
        let written = chunks.len();
        self.updater.swap(chunks, state).await?;
        tracing::debug!(file = %file_path, written, reused, "file indexed");

        Ok(FileOutcome::Indexed {
            written,
            reused,
            underchunked,
        })
    }

    /// A previous chunk is kept verbatim when its content and preview are
    /// unchanged and it is not waiting for a model summary it could now get.
    fn reusable(&self, prev: &Chunk, candidate: &Candidate) -> bool {
        if prev.content_hash != candidate.content_hash
            || prev.preview != candidate.preview
            || prev.embedding.is_empty()
        {
            return false;
        }
        let wanted = decide(candidate, self.enricher.config()).level;
        !(prev.enrichment.enrichment_level == EnrichmentLevel::Mechanical
            && wanted == EnrichmentLevel::LlmSummarized)
    }

    async fn has_repo_summary(&self, repo_id: &str) -> bool {
        self.store
            .file_chunks(repo_id, crate::summary::REPO_KEY)
            .await
            .is_ok_and(|c| !c.is_empty())
    }

    /// Rebuild repository and module summaries from the stored file chunks.
    /// Returns the number of summary chunks written or deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read, or embedding or writing
    /// a summary fails.
    pub async fn refresh_summaries(&self, repo_id: &str, commit: &str) -> Result<usize> {
        let all = self.store.query(ChunkFilter::repo(repo_id)).await?;
        let (file_chunks, summaries): (Vec<Chunk>, Vec<Chunk>) =
            all.into_iter().partition(|c| c.kind.is_file_scoped());
        let mut existing: HashMap<String, Chunk> = summaries
            .into_iter()
            .map(|c| (c.file_path.clone(), c))
            .collect();

        let drafts = build_summaries(
            repo_id,
            &file_chunks,
            self.config.indexer.summary_token_budget,
        );
        let mut touched = 0usize;
        for draft in drafts {
            if let Some(prev) = existing.remove(&draft.key)
                && prev.content_hash == draft.content_hash
                && prev.kind == draft.kind
            {
                continue;
            }
            let embedding = self.synth.synthesize(&draft.summary_text, "").await?;
            let cost = u32::try_from(estimate_tokens(&draft.summary_text)).unwrap_or(u32::MAX);
            let chunk = Chunk {
                chunk_id: chunk_id(repo_id, &draft.key, None, SchemaVersion::CURRENT),
                kind: draft.kind,
                repo_id: repo_id.to_string(),
                file_path: draft.key.clone(),
                symbol_path: None,
                commit_sha: commit.to_string(),
                line_range: None,
                content_hash: draft.content_hash,
                summary_text: draft.summary_text,
                preview: String::new(),
                embedding,
                enrichment: EnrichmentRecord {
                    schema_version: SchemaVersion::CURRENT,
                    enrichment_level: EnrichmentLevel::Mechanical,
                    cost_estimate: cost,
                    underchunked: false,
                },
            };
            self.updater.swap_chunks(repo_id, &draft.key, vec![chunk]).await?;
            touched += 1;
        }

        for key in existing.into_keys() {
            self.updater.swap_chunks(repo_id, &key, Vec::new()).await?;
            touched += 1;
        }
        tracing::debug!(repo = %repo_id, touched, "summaries refreshed");
        Ok(touched)
    }

    /// Eagerly migrate every stored chunk of a repository to the current
    /// schema, re-embedding where the embedding input changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read. Per-key failures are
    /// collected in the report.
    pub async fn backfill(&self, repo_id: &str) -> Result<BackfillReport> {
        let mut by_key: BTreeMap<String, Vec<Chunk>> = BTreeMap::new();
        for chunk in self.store.query(ChunkFilter::repo(repo_id)).await? {
            by_key.entry(chunk.file_path.clone()).or_default().push(chunk);
        }

        let mut report = BackfillReport {
            keys_scanned: by_key.len(),
            ..BackfillReport::default()
        };
        for (key, chunks) in by_key {
            match self.backfill_key(repo_id, &key, chunks).await {
                Ok(None) => {}
                Ok(Some((migrated, reembedded))) => {
                    report.keys_rewritten += 1;
                    report.chunks_migrated += migrated;
                    report.chunks_reembedded += reembedded;
                }
                Err(e) => {
                    tracing::warn!(repo = %repo_id, key = %key, "backfill failed: {e}");
                    report.errors.push(format!("{key}: {e}"));
                }
            }
        }
        tracing::info!(
            repo = %repo_id,
            rewritten = report.keys_rewritten,
            migrated = report.chunks_migrated,
            "backfill finished"
        );
        Ok(report)
    }

    async fn backfill_key(
        &self,
        repo_id: &str,
        key: &str,
        chunks: Vec<Chunk>,
    ) -> Result<Option<(usize, usize)>> {
        let state = self.store.index_state(repo_id, key).await?;
        let migrated: Vec<Migrated> = chunks
            .into_iter()
            .map(|c| migrate(c, self.config.chunker.preview_chars))
            .collect();
        let state_outdated = state
            .as_ref()
            .is_some_and(|s| s.schema_version != SchemaVersion::CURRENT);
        if !state_outdated && !migrated.iter().any(|m| m.changed) {
            return Ok(None);
        }

        let mut changed = 0usize;
        let mut reembedded = 0usize;
        let mut out = Vec::with_capacity(migrated.len());
        for m in migrated {
            let mut chunk = m.chunk;
            if m.reembed {
                chunk.embedding = self.synth.synthesize(&chunk.summary_text, &chunk.preview).await?;
                reembedded += 1;
            }
            if m.changed {
                changed += 1;
            }
            out.push(chunk);
        }

        match state {
            Some(mut state) => {
                state.schema_version = SchemaVersion::CURRENT;
                self.updater.swap(out, state).await?;
            }
            None => self.updater.swap_chunks(repo_id, key, out).await?,
        }
        Ok(Some((changed, reembedded)))
    }
}

fn tally(report: &mut IndexReport, path: &str, outcome: FileOutcome) {
    match outcome {
        FileOutcome::Indexed {
            written,
            reused,
            underchunked,
        } => {
            report.indexed += 1;
            report.chunks_written += written;
            report.chunks_reused += reused;
            if underchunked {
                report.underchunked += 1;
            }
        }
        FileOutcome::Unchanged => report.unchanged += 1,
        FileOutcome::Skipped(reason) => {
            tracing::info!(file = %path, %reason, "skipped");
            report.skipped += 1;
        }
        FileOutcome::Removed => report.removed += 1,
    }
}

/// Aggregate index health for one repository.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn repo_status(store: &dyn ChunkStore, repo_id: &str) -> Result<RepoStatus> {
    let chunks = store.query(ChunkFilter::repo(repo_id)).await?;
    let mut status = RepoStatus {
        files: store.index_states(repo_id).await?.len(),
        ..RepoStatus::default()
    };
    for chunk in &chunks {
        *status.chunks_by_kind.entry(chunk.kind).or_default() += 1;
        if chunk.enrichment.enrichment_level == EnrichmentLevel::LlmSummarized {
            status.llm_summarized += 1;
        }
        if chunk.enrichment.underchunked {
            status.underchunked += 1;
        }
        if !chunk.enrichment.schema_version.is_current() {
            status.outdated_schema += 1;
        }
        status.commits.insert(chunk.commit_sha.clone());
    }
    Ok(status)
}
