//! End-to-end pipeline tests against a temporary SQLite database with
//! deterministic in-process providers.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use knowledge_harness::chunk::Chunker;
use knowledge_harness::config::{
    ChunkingConfig, EmbeddingConfig, GraphConfig, IngestionConfig, RetrievalConfig,
};
use knowledge_harness::db;
use knowledge_harness::embedding::{Embedder, EmbeddingProvider};
use knowledge_harness::error::{PipelineError, ProviderError};
use knowledge_harness::graph::{
    DisabledGraphService, Episode, EpisodeRef, Fact, GraphService, GraphSubmitter,
};
use knowledge_harness::ingest::{CancellationFlag, Pipeline};
use knowledge_harness::migrate;
use knowledge_harness::models::{DocumentStatus, ScanAction, SectionStatus, TenantId};
use knowledge_harness::retry::RetryPolicy;
use knowledge_harness::scan::fingerprint;
use knowledge_harness::search::{RetrievalEngine, SearchMode};
use knowledge_harness::store::{document_id, KnowledgeStore, NewSection};

const DIMS: usize = 16;
const FAIL_MARKER: &str = "FAIL_MARKER";
const SLOW_MARKER: &str = "SLOW_MARKER";
const CANCEL_MARKER: &str = "CANCEL_MARKER";

/// Bag-of-words hashing embedder. Texts containing [`FAIL_MARKER`] fail
/// while `failing` is set; texts containing [`SLOW_MARKER`] never answer
/// in time; texts containing [`CANCEL_MARKER`] trip `cancel_on` once
/// embedded.
#[derive(Default)]
struct HashEmbedder {
    failing: AtomicBool,
    wrong_dims: AtomicBool,
    pausing: AtomicBool,
    cancel_on: Mutex<Option<CancellationFlag>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HashEmbedder {
    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            let digest = Sha256::digest(word.as_bytes());
            v[digest[0] as usize % DIMS] += 1.0;
        }
        v
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn clear_seen(&self) {
        self.seen.lock().unwrap().clear();
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.seen.lock().unwrap().extend(texts.iter().cloned());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak.fetch_max(current, Ordering::SeqCst);
        if self.pausing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        if texts.iter().any(|t| t.contains(CANCEL_MARKER)) {
            let flag = self.cancel_on.lock().unwrap().clone();
            if let Some(flag) = flag {
                flag.cancel();
            }
        }
        if texts.iter().any(|t| t.contains(SLOW_MARKER)) {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        if self.failing.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains(FAIL_MARKER)) {
            return Err(ProviderError::Unavailable("503 service unavailable".to_string()));
        }
        let dims = if self.wrong_dims.load(Ordering::SeqCst) {
            DIMS + 1
        } else {
            DIMS
        };
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = Self::vector(t);
                v.resize(dims, 0.0);
                v
            })
            .collect())
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        timeout: Duration::from_millis(100),
        backoff: Duration::from_millis(1),
    }
}

/// Graph service that is always down.
struct DownGraph;

#[async_trait]
impl GraphService for DownGraph {
    async fn add_episode(
        &self,
        _tenant: &TenantId,
        _episode: &Episode,
    ) -> Result<EpisodeRef, ProviderError> {
        Err(ProviderError::Unavailable("graph service down".to_string()))
    }

    async fn search(
        &self,
        _tenant: &TenantId,
        _query: &str,
        _max_facts: usize,
    ) -> Result<Vec<Fact>, ProviderError> {
        Err(ProviderError::Unavailable("graph service down".to_string()))
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    store: KnowledgeStore,
    provider: Arc<HashEmbedder>,
    embedder: Arc<Embedder>,
    chunker: Arc<Chunker>,
    graph: Arc<GraphSubmitter>,
    pipeline: Pipeline,
    engine: RetrievalEngine,
    cancel: CancellationFlag,
}

impl Harness {
    /// A second pipeline over the same store and providers, with its own
    /// cancellation flag and ingestion settings.
    fn pipeline_with(&self, ingestion: IngestionConfig) -> Pipeline {
        Pipeline::new(
            self.store.clone(),
            self.embedder.clone(),
            self.chunker.clone(),
            self.graph.clone(),
            ingestion,
        )
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(DisabledGraphService)).await
}

async fn harness_with(graph_service: Arc<dyn GraphService>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("docs");
    fs::create_dir_all(&root).unwrap();

    let pool = db::connect_path(&dir.path().join("data/kh.sqlite"))
        .await
        .unwrap();
    migrate::migrate(&pool).await.unwrap();
    let store = KnowledgeStore::new(pool);

    let provider = Arc::new(HashEmbedder::default());
    let embedding = EmbeddingConfig {
        provider: "test".to_string(),
        model: Some("hash-bow".to_string()),
        dims: Some(DIMS),
        cache_capacity: 0,
        ..EmbeddingConfig::default()
    };
    let embedder = Arc::new(Embedder::with_policy(
        provider.clone(),
        &embedding,
        fast_policy(),
    ));
    let chunker = Arc::new(Chunker::new(
        ChunkingConfig::default(),
        None,
        fast_policy(),
    ));
    let graph = Arc::new(GraphSubmitter::with_policy(
        graph_service,
        &GraphConfig::default(),
        fast_policy(),
    ));

    let cancel = CancellationFlag::new();
    let pipeline = Pipeline::new(
        store.clone(),
        embedder.clone(),
        chunker.clone(),
        graph.clone(),
        IngestionConfig::default(),
    )
    .with_cancellation(cancel.clone());
    let engine = RetrievalEngine::new(
        store.clone(),
        embedder.clone(),
        graph.clone(),
        RetrievalConfig::default(),
        10,
    );

    Harness {
        _dir: dir,
        root,
        store,
        provider,
        embedder,
        chunker,
        graph,
        pipeline,
        engine,
        cancel,
    }
}

fn tenant(name: &str) -> TenantId {
    TenantId::parse(name).unwrap()
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

#[tokio::test]
async fn unchanged_files_are_skipped_on_rerun() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "policies/leave.txt", "Annual leave is 25 days.\n\nCarry-over is capped at five days.");
    write(&h.root, "handbook.md", "# Welcome\n\nThe office opens at nine.");

    let first = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(first.ingested, 2);
    assert_eq!(first.completed, 2);
    let chunks_before = h.store.count_chunks(&acme).await.unwrap();
    let statuses_before = h.pipeline.list_statuses(&acme).await.unwrap();
    assert!(chunks_before > 0);

    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert!(plan.values().all(|a| *a == ScanAction::Skip), "{plan:?}");

    h.provider.clear_seen();
    let second = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(second.ingested + second.reingested + second.recovered, 0);
    assert!(h.provider.seen().is_empty(), "skipped files must not be re-embedded");
    assert_eq!(h.store.count_chunks(&acme).await.unwrap(), chunks_before);

    let statuses_after = h.pipeline.list_statuses(&acme).await.unwrap();
    let ids = |s: &[knowledge_harness::models::IngestionStatus]| {
        s.iter().map(|s| s.id.clone()).collect::<BTreeSet<_>>()
    };
    assert_eq!(ids(&statuses_before), ids(&statuses_after));
}

#[tokio::test]
async fn changed_file_is_reingested_without_orphans() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "notes.txt", "The retired codename was bluefinch.");
    h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(h.engine.lexical_search(&acme, "bluefinch", 10).await.unwrap().len(), 1);

    write(&h.root, "notes.txt", "The current codename is greenheron.\n\nIt ships in spring.");
    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("notes.txt"), Some(&ScanAction::Reingest));

    let summary = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.reingested, 1);
    assert_eq!(summary.completed, 1);

    assert!(h.engine.lexical_search(&acme, "bluefinch", 10).await.unwrap().is_empty());
    let doc = document_id(&acme, "notes.txt");
    let chunks = h.pipeline.get_chunks(&acme, &doc).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| !c.text.contains("bluefinch")));
    assert_eq!(h.store.count_chunks(&acme).await.unwrap(), 2);
}

#[tokio::test]
async fn failed_section_is_retried_alone() {
    let h = harness().await;
    let acme = tenant("acme");
    write(
        &h.root,
        "report.txt",
        "Section one text.\n\nSection two text.\n\nSection three FAIL_MARKER text.\n\nSection four text.",
    );
    h.provider.failing.store(true, Ordering::SeqCst);

    let status = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("report.txt"))
        .await
        .unwrap();
    assert_eq!(status.status, DocumentStatus::Partial);
    assert_eq!(status.chunks_created, 3);

    let sections = h.store.list_sections(&acme, &status.id).await.unwrap();
    let states: Vec<(i64, SectionStatus)> = sections.iter().map(|s| (s.position, s.status)).collect();
    assert_eq!(
        states,
        vec![
            (1, SectionStatus::Completed),
            (2, SectionStatus::Completed),
            (3, SectionStatus::Failed),
            (4, SectionStatus::Completed),
        ]
    );

    let report = h.pipeline.recovery_report(&acme).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].position, 3);
    assert_eq!(report[0].ingestion_status_id, status.id);
    assert!(report[0].preview.contains(FAIL_MARKER));

    assert_eq!(
        h.pipeline.cleanup_failed_sections(&acme, &status.id).await.unwrap(),
        1
    );
    let sections = h.store.list_sections(&acme, &status.id).await.unwrap();
    assert_eq!(sections[2].status, SectionStatus::Pending);

    h.provider.failing.store(false, Ordering::SeqCst);
    h.provider.clear_seen();
    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("report.txt"), Some(&ScanAction::CleanupAndReingest));

    let status = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("report.txt"))
        .await
        .unwrap();
    assert_eq!(status.status, DocumentStatus::Completed);
    assert_eq!(status.chunks_created, 4);

    let seen = h.provider.seen();
    assert!(!seen.is_empty());
    assert!(
        seen.iter().all(|t| t.contains(FAIL_MARKER)),
        "only the failed section is re-embedded: {seen:?}"
    );

    let doc = document_id(&acme, "report.txt");
    let positions: Vec<i64> = h
        .pipeline
        .get_chunks(&acme, &doc)
        .await
        .unwrap()
        .iter()
        .map(|c| c.section_position)
        .collect();
    assert_eq!(positions, vec![1, 2, 3, 4]);
    assert!(h.pipeline.recovery_report(&acme).await.unwrap().is_empty());
}

#[tokio::test]
async fn timed_out_section_leaves_document_partial() {
    let h = harness().await;
    let acme = tenant("acme");
    write(
        &h.root,
        "three.txt",
        "Intro paragraph.\n\nThe SLOW_MARKER paragraph.\n\nClosing paragraph.",
    );

    let status = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("three.txt"))
        .await
        .unwrap();
    assert_eq!(status.status, DocumentStatus::Partial);
    assert_eq!(status.chunks_created, 2);

    let doc = document_id(&acme, "three.txt");
    let positions: BTreeSet<i64> = h
        .pipeline
        .get_chunks(&acme, &doc)
        .await
        .unwrap()
        .iter()
        .map(|c| c.section_position)
        .collect();
    assert_eq!(positions, BTreeSet::from([1, 3]));

    let report = h.pipeline.recovery_report(&acme).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].position, 2);
    assert_eq!(report[0].status, SectionStatus::Failed);
    let message = report[0].error_message.as_deref().unwrap_or_default();
    assert!(message.contains("timed out"), "{message}");
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let h = harness().await;
    let a = tenant("tenant-a");
    let b = tenant("tenant-b");
    write(&h.root, "shared.txt", "Vendor code UNIQUE_MARKER_42 appears here.");

    let status_a = h
        .pipeline
        .ingest_document(&a, &h.root, Path::new("shared.txt"))
        .await
        .unwrap();
    h.pipeline
        .ingest_document(&b, &h.root, Path::new("shared.txt"))
        .await
        .unwrap();

    let doc_a = document_id(&a, "shared.txt");
    let doc_b = document_id(&b, "shared.txt");
    assert_ne!(doc_a, doc_b);

    let query_vectors = [
        HashEmbedder::vector("UNIQUE_MARKER_42"),
        HashEmbedder::vector("completely unrelated words"),
        vec![0.0; DIMS],
    ];
    for embedding in &query_vectors {
        for weight in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let hits = h
                .engine
                .hybrid_search(&a, Some(embedding), "UNIQUE_MARKER_42", 10, weight)
                .await
                .unwrap();
            assert!(!hits.is_empty());
            for hit in &hits {
                assert_eq!(hit.chunk.tenant_id, a);
                assert_eq!(hit.chunk.document_id, doc_a);
            }
        }
    }

    assert!(matches!(
        h.pipeline.cleanup_failed_sections(&b, &status_a.id).await,
        Err(PipelineError::TenantIsolation(_))
    ));
    assert!(matches!(
        h.pipeline.get_chunks(&b, &doc_a).await,
        Err(PipelineError::TenantIsolation(_))
    ));
    assert!(h.pipeline.list_statuses(&b).await.unwrap().iter().all(|s| s.id != status_a.id));
}

#[tokio::test]
async fn hybrid_weight_bounds_match_single_channels() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "a.txt", "kubernetes cluster upgrade runbook");
    write(&h.root, "b.txt", "quarterly revenue forecast spreadsheet");
    write(&h.root, "c.txt", "cluster autoscaling and revenue impact");
    h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();

    let query = "kubernetes cluster";
    let embedding = HashEmbedder::vector(query);

    let similarity = h.engine.similarity_search(&acme, &embedding, 3).await.unwrap();
    let hybrid = h
        .engine
        .hybrid_search(&acme, Some(&embedding), query, 3, 0.0)
        .await
        .unwrap();
    let ids = |hits: &[knowledge_harness::search::SearchHit]| {
        hits.iter().map(|h| h.chunk.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&hybrid), ids(&similarity));

    let lexical_only = h
        .engine
        .hybrid_search(&acme, Some(&embedding), query, 3, 1.0)
        .await
        .unwrap();
    for pair in lexical_only.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for hit in &lexical_only {
        assert_eq!(hit.score, hit.lexical);
    }
    assert_eq!(
        lexical_only[0].chunk.document_id,
        document_id(&acme, "a.txt")
    );

    assert!(matches!(
        h.engine.hybrid_search(&acme, Some(&embedding), query, 3, 1.5).await,
        Err(PipelineError::Configuration(_))
    ));
}

#[tokio::test]
async fn query_degrades_to_lexical_without_embedding() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "faq.txt", "Passwords rotate every ninety days.");
    h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();

    h.provider.failing.store(true, Ordering::SeqCst);
    let result = h
        .engine
        .query(&acme, "passwords FAIL_MARKER", None, SearchMode::Hybrid, Some(5), None)
        .await
        .unwrap();
    assert_eq!(result.degraded, vec!["similarity".to_string()]);
    assert_eq!(result.hits.len(), 1);
    assert!(result.hits[0].chunk.text.contains("Passwords"));
}

#[tokio::test]
async fn unreadable_file_fails_alone() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "broken.docx", "this is not a zip archive");
    write(&h.root, "fine.txt", "Readable content.");

    let summary = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].path, "broken.docx");

    let statuses = h.pipeline.list_statuses(&acme).await.unwrap();
    let broken = statuses.iter().find(|s| s.path == "broken.docx").unwrap();
    assert_eq!(broken.status, DocumentStatus::Failed);
    assert!(h.store.list_sections(&acme, &broken.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn dimension_mismatch_aborts_loudly() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "doc.txt", "Some text.");
    h.provider.wrong_dims.store(true, Ordering::SeqCst);

    let result = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("doc.txt"))
        .await;
    assert!(matches!(result, Err(PipelineError::Configuration(_))));
    assert_eq!(h.store.count_chunks(&acme).await.unwrap(), 0);
}

#[tokio::test]
async fn cancelled_run_does_no_work() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "doc.txt", "Some text.");
    h.cancel.cancel();

    let result = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("doc.txt"))
        .await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(h.pipeline.list_statuses(&acme).await.unwrap().is_empty());
}

fn docx(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;

    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
        body
    );
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

#[tokio::test]
async fn interrupted_reingest_is_retried_as_reingest() {
    let h = harness().await;
    let acme = tenant("acme");
    write(&h.root, "notes.txt", "The retired codename was bluefinch.");
    h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    let chunks_before = h.store.count_chunks(&acme).await.unwrap();

    // New version on disk; the run dies right after opening the status
    // row and flagging it as processing.
    write(&h.root, "notes.txt", "The current codename is greenheron.");
    let fp = fingerprint(&h.root.join("notes.txt")).unwrap();
    let status = h
        .store
        .open_status(&acme, "notes.txt", &fp.hash, fp.size, fp.modified_at)
        .await
        .unwrap();
    h.store
        .set_document_status(&acme, &status.id, DocumentStatus::Processing, None, None)
        .await
        .unwrap();

    let status = h.store.get_status(&acme, &status.id).await.unwrap();
    assert_ne!(status.file_hash, fp.hash);
    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("notes.txt"), Some(&ScanAction::Reingest));
    assert_eq!(h.store.count_chunks(&acme).await.unwrap(), chunks_before);
    assert_eq!(h.engine.lexical_search(&acme, "bluefinch", 10).await.unwrap().len(), 1);

    let summary = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.reingested, 1);
    assert_eq!(summary.completed, 1);
    assert!(h.engine.lexical_search(&acme, "bluefinch", 10).await.unwrap().is_empty());
    assert_eq!(h.engine.lexical_search(&acme, "greenheron", 10).await.unwrap().len(), 1);

    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("notes.txt"), Some(&ScanAction::Skip));
}

#[tokio::test]
async fn corrupt_reupload_keeps_previous_version() {
    let h = harness().await;
    let acme = tenant("acme");
    fs::write(
        h.root.join("policy.docx"),
        docx(&["Travel policy", "Book flights through the osprey portal."]),
    )
    .unwrap();
    h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    let doc = document_id(&acme, "policy.docx");
    let chunks_before = h.pipeline.get_chunks(&acme, &doc).await.unwrap();
    assert!(!chunks_before.is_empty());

    fs::write(h.root.join("policy.docx"), b"truncated upload, not a zip").unwrap();
    let summary = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.reingested, 1);
    assert_eq!(summary.failed.len(), 1);

    let chunks_after = h.pipeline.get_chunks(&acme, &doc).await.unwrap();
    assert_eq!(
        chunks_after.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        chunks_before.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
    );
    assert_eq!(h.engine.lexical_search(&acme, "osprey", 10).await.unwrap().len(), 1);

    let status = h.pipeline.list_statuses(&acme).await.unwrap().remove(0);
    assert_eq!(status.status, DocumentStatus::Failed);
    let document = h.store.get_document(&acme, &doc).await.unwrap();
    assert_eq!(document.content_hash, status.file_hash);

    // Still pending replacement: the next run tries again.
    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("policy.docx"), Some(&ScanAction::Reingest));

    fs::write(
        h.root.join("policy.docx"),
        docx(&["Travel policy", "Book flights through the kestrel portal."]),
    )
    .unwrap();
    let summary = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert!(h.engine.lexical_search(&acme, "osprey", 10).await.unwrap().is_empty());
    assert_eq!(h.engine.lexical_search(&acme, "kestrel", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lexical_scores_ignore_other_tenants() {
    let h = harness().await;
    let a = tenant("tenant-a");
    let b = tenant("tenant-b");
    let a_root = h.root.join("a");
    let b_root = h.root.join("b");
    write(&a_root, "alpha.txt", "alpha release checklist for the billing service");
    write(&a_root, "beta.txt", "beta notes about onboarding");
    write(&a_root, "gamma.txt", "gamma rollout plan for the search cluster");
    write(&a_root, "delta.txt", "delta migration runbook");
    h.pipeline.ingest_tree(&a, &a_root).await.unwrap();

    let before = h.engine.lexical_search(&a, "alpha", 10).await.unwrap();
    assert_eq!(before.len(), 1);
    assert!(before[0].score > 0.0);

    for i in 0..6 {
        write(
            &b_root,
            &format!("doc{i}.txt"),
            "alpha alpha alpha everywhere in tenant b",
        );
    }
    h.pipeline.ingest_tree(&b, &b_root).await.unwrap();
    assert_eq!(h.engine.lexical_search(&b, "alpha", 10).await.unwrap().len(), 6);

    let after = h.engine.lexical_search(&a, "alpha", 10).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].chunk.id, before[0].chunk.id);
    assert_eq!(after[0].score, before[0].score);

    let unknown = tenant("tenant-c");
    assert!(h.engine.lexical_search(&unknown, "alpha", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_mid_document_stops_between_sections() {
    let h = harness().await;
    let acme = tenant("acme");
    write(
        &h.root,
        "long.txt",
        "First section.\n\nSecond section CANCEL_MARKER.\n\nThird section.\n\nFourth section.",
    );
    *h.provider.cancel_on.lock().unwrap() = Some(h.cancel.clone());

    let result = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("long.txt"))
        .await;
    assert!(matches!(result, Err(PipelineError::Cancelled)));

    let status = h.pipeline.list_statuses(&acme).await.unwrap().remove(0);
    assert_eq!(status.status, DocumentStatus::Partial);
    let states: Vec<SectionStatus> = h
        .store
        .list_sections(&acme, &status.id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.status)
        .collect();
    // The in-flight section finishes; nothing is left processing.
    assert_eq!(
        states,
        vec![
            SectionStatus::Completed,
            SectionStatus::Completed,
            SectionStatus::Pending,
            SectionStatus::Pending,
        ]
    );

    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("long.txt"), Some(&ScanAction::CleanupAndReingest));

    *h.provider.cancel_on.lock().unwrap() = None;
    h.provider.clear_seen();
    let resumed = h
        .pipeline_with(IngestionConfig::default())
        .ingest_document(&acme, &h.root, Path::new("long.txt"))
        .await
        .unwrap();
    assert_eq!(resumed.status, DocumentStatus::Completed);
    assert_eq!(resumed.chunks_created, 4);
    let seen = h.provider.seen();
    assert_eq!(seen.len(), 2, "{seen:?}");
    assert!(seen[0].contains("Third") && seen[1].contains("Fourth"), "{seen:?}");
}

#[tokio::test]
async fn aborted_sections_are_reported_and_reset() {
    let h = harness().await;
    let acme = tenant("acme");
    h.store.ensure_tenant(&acme).await.unwrap();
    let status = h
        .store
        .open_status(&acme, "doc.txt", "hash", 10, 0)
        .await
        .unwrap();
    let section_id = h
        .store
        .record_section(
            &acme,
            &status.id,
            &NewSection {
                position: 1,
                kind: knowledge_harness::models::SectionKind::Paragraph,
                content_hash: "h1".to_string(),
                content_length: 10,
                preview: "in flight".to_string(),
            },
        )
        .await
        .unwrap();
    h.store
        .transition_section(&acme, &section_id, SectionStatus::Processing, None)
        .await
        .unwrap();

    assert_eq!(
        h.store
            .fail_processing_sections(&acme, &status.id, "aborted")
            .await
            .unwrap(),
        1
    );
    let report = h.pipeline.recovery_report(&acme).await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].status, SectionStatus::Failed);
    assert_eq!(report[0].error_message.as_deref(), Some("aborted"));

    assert_eq!(
        h.pipeline.cleanup_failed_sections(&acme, &status.id).await.unwrap(),
        1
    );
    assert_eq!(
        h.store.get_section(&acme, &section_id).await.unwrap().status,
        SectionStatus::Pending
    );
}

#[tokio::test]
async fn interrupted_sections_are_recovered_on_rerun() {
    let h = harness().await;
    let acme = tenant("acme");
    write(
        &h.root,
        "report.txt",
        "Section one text.\n\nSection two FAIL_MARKER text.\n\nSection three text.",
    );
    h.provider.failing.store(true, Ordering::SeqCst);
    let status = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("report.txt"))
        .await
        .unwrap();
    assert_eq!(status.status, DocumentStatus::Partial);

    // A retry run dies while section two is processing.
    h.store.cleanup_failed_sections(&acme, &status.id).await.unwrap();
    let second = h.store.list_sections(&acme, &status.id).await.unwrap().remove(1);
    h.store
        .transition_section(&acme, &second.id, SectionStatus::Processing, None)
        .await
        .unwrap();
    h.store
        .set_document_status(&acme, &status.id, DocumentStatus::Processing, None, None)
        .await
        .unwrap();

    let plan = h.pipeline.scan_and_classify(&acme, &h.root).await.unwrap();
    assert_eq!(plan.get("report.txt"), Some(&ScanAction::CleanupAndReingest));

    h.provider.failing.store(false, Ordering::SeqCst);
    h.provider.clear_seen();
    let summary = h.pipeline.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.recovered, 1);
    assert_eq!(summary.completed, 1);

    let seen = h.provider.seen();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains(FAIL_MARKER));

    let sections = h.store.list_sections(&acme, &status.id).await.unwrap();
    assert!(sections.iter().all(|s| s.status == SectionStatus::Completed));
    assert_eq!(h.store.count_chunks(&acme).await.unwrap(), 3);
}

#[tokio::test]
async fn graph_failure_keeps_section_searchable() {
    let h = harness_with(Arc::new(DownGraph)).await;
    let acme = tenant("acme");
    write(&h.root, "vendors.txt", "Northwind supplies the pelican sensors.");

    let status = h
        .pipeline
        .ingest_document(&acme, &h.root, Path::new("vendors.txt"))
        .await
        .unwrap();
    assert_eq!(status.status, DocumentStatus::Completed);
    assert_eq!(status.episodes_created, 0);

    let sections = h.store.list_sections(&acme, &status.id).await.unwrap();
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0].status, SectionStatus::Completed);
    assert_eq!(sections[0].chunks_created, 1);
    let graph_error = sections[0].graph_error.as_deref().unwrap_or_default();
    assert!(graph_error.contains("graph service down"), "{graph_error}");

    let result = h
        .engine
        .query(&acme, "pelican", None, SearchMode::Graph, Some(5), None)
        .await
        .unwrap();
    assert_eq!(result.hits.len(), 1);
    assert!(result.facts.is_empty());
    assert!(result.degraded.contains(&"graph".to_string()));
}

#[tokio::test]
async fn tree_ingestion_respects_document_limit() {
    let h = harness().await;
    let acme = tenant("acme");
    for i in 0..6 {
        write(&h.root, &format!("doc{i}.txt"), &format!("Document number {i} body."));
    }
    h.provider.pausing.store(true, Ordering::SeqCst);

    let serial = h.pipeline_with(IngestionConfig {
        max_concurrent_documents: 1,
        ..IngestionConfig::default()
    });
    let summary = serial.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.completed, 6);
    assert_eq!(h.provider.peak.load(Ordering::SeqCst), 1);

    for i in 0..6 {
        write(&h.root, &format!("doc{i}.txt"), &format!("Document number {i} revised."));
    }
    h.provider.peak.store(0, Ordering::SeqCst);
    let paired = h.pipeline_with(IngestionConfig {
        max_concurrent_documents: 2,
        ..IngestionConfig::default()
    });
    let summary = paired.ingest_tree(&acme, &h.root).await.unwrap();
    assert_eq!(summary.reingested, 6);
    assert_eq!(summary.completed, 6);
    let peak = h.provider.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
}
