use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use repomem_index::enrichment::EnrichmentConfig;
use repomem_index::indexer::{FileOutcome, IndexerConfig, PipelineConfig, RepoIndexer};
use repomem_index::retriever::{HybridRetriever, RetrievalConfig, SearchQuery};
use repomem_index::source::{MemorySource, RepoSource};
use repomem_llm::mock::MockProvider;
use repomem_store::{ChunkFilter, ChunkKind, ChunkStore, EnrichmentLevel, InMemoryChunkStore};
use tokio::sync::watch;

const REPO: &str = "r";

struct Harness {
    indexer: Arc<RepoIndexer<MockProvider>>,
    store: Arc<InMemoryChunkStore>,
    source: Arc<MemorySource>,
    provider: Arc<MockProvider>,
}

impl Harness {
    fn new(provider: MockProvider, config: PipelineConfig) -> Self {
        let store = Arc::new(InMemoryChunkStore::new());
        let source = Arc::new(MemorySource::new());
        source.set_commit(REPO, "c1");
        let provider = Arc::new(provider);
        let indexer = Arc::new(RepoIndexer::new(
            Arc::clone(&store) as Arc<dyn ChunkStore>,
            Arc::clone(&source) as Arc<dyn RepoSource>,
            Arc::clone(&provider),
            config,
        ));
        Self {
            indexer,
            store,
            source,
            provider,
        }
    }

    fn retriever(&self) -> HybridRetriever<MockProvider> {
        HybridRetriever::new(
            Arc::clone(&self.store) as Arc<dyn ChunkStore>,
            RetrievalConfig::default(),
        )
        .with_synthesizer(self.indexer.synthesizer().clone())
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        indexer: IndexerConfig {
            embed_backoff_ms: 1,
            write_backoff_ms: 1,
            ..IndexerConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn idle() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Three functions of 66 lines each plus separators: 200 lines in total.
fn three_symbols(edit_second: bool) -> String {
    let mut src = String::new();
    for (n, name) in ["load_config(path)", "bump_counter(counter)", "render_report(rows)"]
        .iter()
        .enumerate()
    {
        let _ = writeln!(src, "def {name}:");
        for i in 0..64 {
            if edit_second && n == 1 && i == 30 {
                let _ = writeln!(src, "    step_{i} = {i} * 3");
            } else {
                let _ = writeln!(src, "    step_{i} = {i} * 2");
            }
        }
        let _ = writeln!(src, "    return step_63");
        if n < 2 {
            src.push('\n');
        }
    }
    src
}

async fn symbol_chunks(store: &InMemoryChunkStore, path: &str) -> Vec<repomem_store::Chunk> {
    let mut chunks: Vec<_> = store
        .file_chunks(REPO, path)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.kind == ChunkKind::SymbolIndex)
        .collect();
    chunks.sort_by_key(|c| c.line_range);
    chunks
}

#[tokio::test]
async fn edit_one_symbol_then_delete_the_file() {
    let h = Harness::new(MockProvider::default(), config());
    let source = three_symbols(false);
    assert_eq!(source.lines().count(), 200);
    h.source.set_file(REPO, "a.py", source);

    let report = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.indexed, 1);
    let chunks = h.store.file_chunks(REPO, "a.py").await.unwrap();
    assert_eq!(chunks.iter().filter(|c| c.kind == ChunkKind::FileIndex).count(), 1);
    assert_eq!(chunks.iter().filter(|c| c.kind == ChunkKind::SymbolIndex).count(), 3);
    let state = h.store.index_state(REPO, "a.py").await.unwrap().unwrap();
    assert_eq!(state.last_indexed_commit, "c1");
    let before = symbol_chunks(&h.store, "a.py").await;

    h.source.set_file(REPO, "a.py", three_symbols(true));
    h.source.set_commit(REPO, "c2");
    let report = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.chunks_reused, report.chunks_written - 1);

    let after = symbol_chunks(&h.store, "a.py").await;
    assert_eq!(after.len(), 3);
    assert_eq!(after[0], before[0]);
    assert_eq!(after[2], before[2]);
    assert_eq!(after[0].commit_sha, "c1");
    assert_ne!(after[1].content_hash, before[1].content_hash);
    assert_eq!(after[1].commit_sha, "c2");
    assert_eq!(after[1].chunk_id, before[1].chunk_id);
    let state = h.store.index_state(REPO, "a.py").await.unwrap().unwrap();
    assert_eq!(state.last_indexed_commit, "c2");

    h.source.remove_file(REPO, "a.py");
    h.source.set_commit(REPO, "c3");
    let report = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(h.store.file_chunks(REPO, "a.py").await.unwrap().is_empty());
    assert!(h.store.index_state(REPO, "a.py").await.unwrap().is_none());
}

#[tokio::test]
async fn inserting_lines_repins_shifted_symbols() {
    let h = Harness::new(MockProvider::default(), config());
    h.source.set_file(REPO, "a.py", three_symbols(false));
    h.indexer.index_repo(REPO, idle()).await.unwrap();
    let before = symbol_chunks(&h.store, "a.py").await;

    let shifted =
        three_symbols(false).replacen("    return step_63\n", "    return step_63\n\n\n", 1);
    h.source.set_file(REPO, "a.py", shifted);
    h.source.set_commit(REPO, "c2");
    h.indexer.index_repo(REPO, idle()).await.unwrap();
    let after = symbol_chunks(&h.store, "a.py").await;

    assert_eq!(after[0].commit_sha, "c1");
    assert_eq!(after[0].line_range, before[0].line_range);
    for i in 1..3 {
        assert_eq!(after[i].content_hash, before[i].content_hash);
        assert_eq!(after[i].summary_text, before[i].summary_text);
        assert_eq!(after[i].commit_sha, "c2");
        let (bs, be) = before[i].line_range.unwrap();
        assert_eq!(after[i].line_range, Some((bs + 2, be + 2)));
    }
}

#[tokio::test]
async fn type_and_text_filters_restrict_results() {
    let h = Harness::new(MockProvider::default(), config());
    h.source.set_file(REPO, "a.py", three_symbols(false));
    h.source.set_file(
        REPO,
        "b.py",
        "def reset_counter(counter):\n    return 0\n\n\ndef parse(tokens):\n    return tokens\n",
    );
    h.indexer.index_repo(REPO, idle()).await.unwrap();

    let hits = h
        .retriever()
        .search(
            SearchQuery::text("counter", 10)
                .with_kind(ChunkKind::SymbolIndex)
                .in_repo(REPO),
        )
        .await
        .unwrap();
    let symbols: BTreeSet<_> = hits.iter().filter_map(|r| r.symbol_path.clone()).collect();
    assert_eq!(
        symbols,
        BTreeSet::from(["bump_counter".to_string(), "reset_counter".to_string()])
    );
    assert!(hits.iter().all(|r| r.kind == ChunkKind::SymbolIndex));
    assert!(hits.iter().all(|r| r.summary_text.to_lowercase().contains("counter")));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

    let other_repo = h
        .retriever()
        .search(SearchQuery::text("counter", 10).in_repo("elsewhere"))
        .await
        .unwrap();
    assert!(other_repo.is_empty());
}

#[tokio::test]
async fn reindexing_unchanged_repo_is_idempotent() {
    let config = PipelineConfig {
        enrichment: EnrichmentConfig {
            enabled: true,
            llm_min_chars: 0,
            ..EnrichmentConfig::default()
        },
        ..config()
    };
    let h = Harness::new(MockProvider::default(), config);
    h.source.set_file(REPO, "a.py", three_symbols(false));
    h.indexer.index_repo(REPO, idle()).await.unwrap();
    let snapshot = h.store.query(ChunkFilter::repo(REPO)).await.unwrap();
    let (chats, embeds) = (h.provider.chat_calls(), h.provider.embed_calls());
    assert!(chats > 0);

    h.source.set_commit(REPO, "c2");
    match h.indexer.reindex_file(REPO, "a.py").await.unwrap() {
        FileOutcome::Indexed { written, reused, .. } => assert_eq!(written, reused),
        other => panic!("expected a state refresh, got {other:?}"),
    }
    assert_eq!(
        h.indexer.reindex_file(REPO, "a.py").await.unwrap(),
        FileOutcome::Unchanged
    );
    assert_eq!(h.provider.chat_calls(), chats);
    assert_eq!(h.provider.embed_calls(), embeds);

    let project = |chunks: Vec<repomem_store::Chunk>| {
        let mut rows: Vec<_> = chunks
            .into_iter()
            .filter(|c| c.file_path == "a.py")
            .map(|c| (c.chunk_id, c.enrichment.enrichment_level, c.content_hash, c.commit_sha))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    };
    let now = h.store.query(ChunkFilter::repo(REPO)).await.unwrap();
    assert_eq!(project(now), project(snapshot));
}

#[tokio::test]
async fn every_symbol_is_covered_once() {
    let h = Harness::new(MockProvider::default(), config());
    let source = "class Store:\n    pass\n\n\ndef open_store(path):\n    return Store()\n\n\nasync def sync_store(store):\n    pass\n";
    h.source.set_file(REPO, "s.py", source);
    h.indexer.index_repo(REPO, idle()).await.unwrap();

    let symbols = symbol_chunks(&h.store, "s.py").await;
    let names: Vec<_> = symbols.iter().filter_map(|c| c.symbol_path.as_deref()).collect();
    assert_eq!(names, vec!["Store", "open_store", "sync_store"]);
    let lines = source.lines().count();
    for pair in symbols.windows(2) {
        let (_, end) = pair[0].line_range.unwrap();
        let (start, _) = pair[1].line_range.unwrap();
        assert!(end < start);
    }
    assert!(symbols.iter().all(|c| {
        let (s, e) = c.line_range.unwrap();
        s >= 1 && s <= e && e <= lines
    }));
}

#[tokio::test]
async fn persisted_text_never_contains_code_bodies() {
    let h = Harness::new(MockProvider::default(), config());
    let mut source = three_symbols(false);
    source.push_str("\n\ndef leaky_secret():\n    marker = \"SECRET_BODY_MARKER\"\n    return marker\n");
    h.source.set_file(REPO, "a.py", source.clone());
    h.source.set_file(REPO, "notes.txt", "SECRET_BODY_MARKER\n".repeat(200));
    h.indexer.index_repo(REPO, idle()).await.unwrap();

    let preview_bound = h.indexer.config().chunker.preview_chars;
    for chunk in h.store.query(ChunkFilter::repo(REPO)).await.unwrap() {
        assert!(chunk.preview.chars().count() <= preview_bound);
        if chunk.file_path == "a.py" {
            assert!(!chunk.summary_text.contains("SECRET_BODY_MARKER"));
            assert!(!chunk.preview.contains("SECRET_BODY_MARKER"));
        }
        assert!(chunk.summary_text.len() + chunk.preview.len() < source.len());
    }
}

#[tokio::test]
async fn unavailable_model_degrades_to_mechanical() {
    let config = PipelineConfig {
        enrichment: EnrichmentConfig {
            enabled: true,
            llm_min_chars: 0,
            ..EnrichmentConfig::default()
        },
        ..config()
    };
    let h = Harness::new(MockProvider::chat_unavailable(), config);
    h.source.set_file(REPO, "a.py", three_symbols(false));

    let report = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.underchunked, 1);
    assert_eq!(report.failed_stale, 0);
    let chunks = h.store.file_chunks(REPO, "a.py").await.unwrap();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| {
        c.enrichment.enrichment_level == EnrichmentLevel::Mechanical && c.enrichment.underchunked
    }));
}

#[tokio::test]
async fn transient_embed_failures_are_retried() {
    let h = Harness::new(MockProvider::default().with_embed_failures(2), config());
    h.source.set_file(REPO, "b.py", "def f():\n    return 1\n");

    let report = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failed_stale, 0);
}

#[tokio::test]
async fn exhausted_embedding_leaves_file_stale_with_old_chunks() {
    let h = Harness::new(MockProvider::default(), config());
    h.source.set_file(REPO, "b.py", "def f():\n    return 1\n");
    h.indexer.index_repo(REPO, idle()).await.unwrap();
    let old = h.store.file_chunks(REPO, "b.py").await.unwrap();

    let failing = {
        let mut p = MockProvider::default();
        p.fail_embed = true;
        p
    };
    let broken = Arc::new(RepoIndexer::new(
        Arc::clone(&h.store) as Arc<dyn ChunkStore>,
        Arc::clone(&h.source) as Arc<dyn RepoSource>,
        Arc::new(failing),
        config(),
    ));
    h.source.set_file(REPO, "b.py", "def g():\n    return 2\n");
    h.source.set_commit(REPO, "c2");

    let report = broken.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.failed_stale, 1);
    assert_eq!(report.indexed, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(h.store.file_chunks(REPO, "b.py").await.unwrap(), old);
    let state = h.store.index_state(REPO, "b.py").await.unwrap().unwrap();
    assert_eq!(state.last_indexed_commit, "c1");

    let report = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(report.indexed, 1);
    let symbols = symbol_chunks(&h.store, "b.py").await;
    assert_eq!(symbols[0].symbol_path.as_deref(), Some("g"));
}

#[tokio::test]
async fn store_outage_keeps_previous_generation() {
    let h = Harness::new(MockProvider::default(), config());
    h.source.set_file(REPO, "b.py", "def f():\n    return 1\n");
    h.indexer.index_repo(REPO, idle()).await.unwrap();
    let old = h.store.file_chunks(REPO, "b.py").await.unwrap();

    h.source.set_file(REPO, "b.py", "def g():\n    return 2\n");
    h.store.set_available(false);
    assert!(h.indexer.reindex_file(REPO, "b.py").await.is_err());
    h.store.set_available(true);

    assert_eq!(h.store.file_chunks(REPO, "b.py").await.unwrap(), old);
    let plan = h.indexer.plan(REPO).await.unwrap();
    assert_eq!(plan.to_index().count(), 1);
}

#[tokio::test]
async fn planning_failure_does_not_touch_other_repos() {
    let h = Harness::new(MockProvider::default(), config());
    h.source.set_file(REPO, "b.py", "def f():\n    return 1\n");
    h.indexer.index_repo(REPO, idle()).await.unwrap();

    assert!(h.indexer.index_repo("missing", idle()).await.is_err());
    assert_eq!(h.store.file_chunks(REPO, "b.py").await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_search_never_sees_mixed_generations() {
    let h = Harness::new(MockProvider::default().with_delay(1), config());
    let gen_a = "def alpha_one():\n    pass\n\n\ndef alpha_two():\n    pass\n";
    let gen_b = "def beta_one():\n    pass\n\n\ndef beta_two():\n    pass\n\n\ndef beta_three():\n    pass\n";
    h.source.set_file(REPO, "m.py", gen_a);
    h.indexer.index_repo(REPO, idle()).await.unwrap();

    let names_a: BTreeSet<String> = ["alpha_one", "alpha_two"].map(String::from).into();
    let names_b: BTreeSet<String> = ["beta_one", "beta_two", "beta_three"].map(String::from).into();

    let writer = {
        let indexer = Arc::clone(&h.indexer);
        let source = Arc::clone(&h.source);
        tokio::spawn(async move {
            for i in 0..20 {
                source.set_file(REPO, "m.py", if i % 2 == 0 { gen_b } else { gen_a });
                indexer.reindex_file(REPO, "m.py").await.unwrap();
            }
        })
    };

    let store = Arc::clone(&h.store);
    let reader = tokio::spawn(async move {
        let mut observed = 0usize;
        for _ in 0..500 {
            let names: BTreeSet<String> = store
                .query(ChunkFilter::repo(REPO).with_kind(ChunkKind::SymbolIndex))
                .await
                .unwrap()
                .into_iter()
                .filter_map(|c| c.symbol_path)
                .collect();
            assert!(names == names_a || names == names_b, "mixed generation: {names:?}");
            observed += 1;
            tokio::task::yield_now().await;
        }
        observed
    });

    writer.await.unwrap();
    assert_eq!(reader.await.unwrap(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_leaves_only_complete_files() {
    let config = PipelineConfig {
        indexer: IndexerConfig {
            concurrency: 1,
            ..config().indexer
        },
        ..config()
    };
    let h = Harness::new(MockProvider::default().with_delay(5), config);
    for i in 0..12 {
        h.source
            .set_file(REPO, &format!("f{i:02}.py"), format!("def f{i}():\n    return {i}\n"));
    }

    let (tx, rx) = watch::channel(false);
    let run = {
        let indexer = Arc::clone(&h.indexer);
        tokio::spawn(async move { indexer.index_repo(REPO, rx).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.indexed + report.cancelled + report.failed_stale, 12);
    for i in 0..12 {
        let path = format!("f{i:02}.py");
        let state = h.store.index_state(REPO, &path).await.unwrap();
        let chunks = h.store.file_chunks(REPO, &path).await.unwrap();
        match state {
            Some(_) => assert_eq!(chunks.len(), 2, "{path}"),
            None => assert!(chunks.is_empty(), "{path}"),
        }
    }

    let resumed = h.indexer.index_repo(REPO, idle()).await.unwrap();
    assert_eq!(resumed.indexed, report.cancelled + report.failed_stale);
    assert_eq!(resumed.unchanged, report.indexed);
}
