//! End-to-end pipeline tests against in-memory service stubs.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;

use pagedex::config::Config;
use pagedex::imaging::EncodedImage;
use pagedex::pdf::{DecodeError, PageDecoder};
use pagedex::pipeline::{
    CancelFlag, IngestOptions, PipelineError, PipelineServices, StageKind, StreamingPipeline,
};
use pagedex::services::embedder::{EmbeddingClient, ImageDims, ImageEmbedding, ModelInfo, PatchGrid};
use pagedex::services::object_store::ObjectStore;
use pagedex::services::ocr::{OcrBoundingBox, OcrClient, OcrResponse};
use pagedex::services::vector_store::{PointRecord, VectorStore};

const DIM: usize = 64;

/// Synthetic page decoder. Optionally cancels a job after N decode calls
/// and checks the admission bound from inside the decode path.
struct StubDecoder {
    pages: u32,
    decode_calls: AtomicU32,
    cancel_after_calls: Option<(u32, CancelFlag)>,
    /// (completed batches counter fed by the progress callback, allowed
    /// in-flight batches, violation flag)
    admission_gauge: Option<(Arc<AtomicU32>, u32, Arc<AtomicBool>)>,
}

impl StubDecoder {
    fn new(pages: u32) -> Self {
        Self {
            pages,
            decode_calls: AtomicU32::new(0),
            cancel_after_calls: None,
            admission_gauge: None,
        }
    }

    fn cancel_after(mut self, calls: u32, cancel: CancelFlag) -> Self {
        self.cancel_after_calls = Some((calls, cancel));
        self
    }

    fn with_admission_gauge(
        mut self,
        completed: Arc<AtomicU32>,
        max_in_flight: u32,
        violation: Arc<AtomicBool>,
    ) -> Self {
        self.admission_gauge = Some((completed, max_in_flight, violation));
        self
    }
}

#[async_trait]
impl PageDecoder for StubDecoder {
    async fn page_count(&self, _path: &Path) -> Result<u32, DecodeError> {
        Ok(self.pages)
    }

    async fn decode_range(
        &self,
        _path: &Path,
        first_page: u32,
        last_page: u32,
    ) -> Result<Vec<DynamicImage>, DecodeError> {
        let call = self.decode_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((completed, max_in_flight, violation)) = &self.admission_gauge {
            // This decode was admitted, so all but `max_in_flight` of the
            // earlier batches must have completed. Give the completion
            // callback a moment to catch up with the permit release.
            let required = call.saturating_sub(*max_in_flight);
            let mut waited = Duration::ZERO;
            while completed.load(Ordering::SeqCst) < required {
                if waited >= Duration::from_secs(1) {
                    violation.store(true, Ordering::SeqCst);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                waited += Duration::from_millis(10);
            }
        }

        let images = (first_page..=last_page)
            .map(|_| DynamicImage::new_rgb8(64, 80))
            .collect();

        if let Some((after, cancel)) = &self.cancel_after_calls {
            if call >= *after {
                cancel.cancel();
            }
        }

        Ok(images)
    }
}

/// Deterministic embedder: 10 tokens of dimension 64 per page, with a
/// 2x4 patch grid starting at token 1.
struct StubEmbedder;

#[async_trait]
impl EmbeddingClient for StubEmbedder {
    async fn embed_images(&self, images: &[DynamicImage]) -> Result<Vec<ImageEmbedding>> {
        Ok(images
            .iter()
            .map(|_| ImageEmbedding {
                embedding: vec![vec![0.5; DIM]; 10],
                image_patch_start: 1,
                image_patch_len: 8,
            })
            .collect())
    }

    async fn patch_grids(&self, dims: &[ImageDims]) -> Result<Vec<PatchGrid>> {
        Ok(dims
            .iter()
            .map(|_| PatchGrid {
                n_patches_x: 2,
                n_patches_y: 4,
            })
            .collect())
    }

    async fn model_info(&self) -> Result<ModelInfo> {
        Ok(ModelInfo {
            dim: DIM,
            model_name: Some("stub".to_string()),
        })
    }
}

/// OCR stub keyed by the page number embedded in the request filename.
struct StubOcr {
    fail_page: Option<u32>,
    delay: Option<Duration>,
}

impl StubOcr {
    fn new() -> Self {
        Self {
            fail_page: None,
            delay: None,
        }
    }

    fn fail_on_page(mut self, page: u32) -> Self {
        self.fail_page = Some(page);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

fn page_number_from_filename(filename: &str) -> u32 {
    // Filenames look like "{document}/page_{n}.{ext}".
    filename
        .rsplit("page_")
        .next()
        .and_then(|rest| rest.split('.').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl OcrClient for StubOcr {
    async fn ocr_page(&self, _image: &EncodedImage, filename: &str) -> Result<OcrResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let page = page_number_from_filename(filename);
        if self.fail_page == Some(page) {
            anyhow::bail!("stub OCR refused page {}", page);
        }

        Ok(OcrResponse {
            text: format!("page-{}", page),
            markdown: format!("# page-{}", page),
            raw: format!("page-{}", page),
            bounding_boxes: vec![OcrBoundingBox {
                x1: 0,
                y1: 0,
                x2: 100,
                y2: 20,
                label: Some("text".to_string()),
            }],
            crops: vec![],
        })
    }
}

/// In-memory object store returning `memory://` URLs.
struct MemoryStore {
    fail: bool,
    delay: Option<Duration>,
    objects: Mutex<Vec<String>>,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            fail: false,
            delay: None,
            objects: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            delay: None,
            objects: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("stub object store is down");
        }
        self.objects.lock().unwrap().push(key.to_string());
        Ok(format!("memory://{}", key))
    }
}

/// Captures upserted points instead of writing anywhere.
struct MemoryVectors {
    points: Mutex<Vec<PointRecord>>,
}

impl MemoryVectors {
    fn new() -> Self {
        Self {
            points: Mutex::new(Vec::new()),
        }
    }

    fn points(&self) -> Vec<PointRecord> {
        self.points.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorStore for MemoryVectors {
    async fn upsert(&self, _collection: &str, points: Vec<PointRecord>) -> Result<()> {
        self.points.lock().unwrap().extend(points);
        Ok(())
    }

    async fn collection_dim(&self, _collection: &str) -> Result<usize> {
        Ok(DIM)
    }
}

struct Harness {
    pipeline: StreamingPipeline,
    vectors: Arc<MemoryVectors>,
    progress: Arc<Mutex<Vec<u32>>>,
    progress_fn: Arc<dyn Fn(u32) + Send + Sync>,
}

fn harness(config: Config, decoder: StubDecoder, ocr: Option<Arc<dyn OcrClient>>) -> Harness {
    harness_with_store(config, decoder, ocr, Arc::new(MemoryStore::new()))
}

fn harness_with_store(
    config: Config,
    decoder: StubDecoder,
    ocr: Option<Arc<dyn OcrClient>>,
    store: Arc<MemoryStore>,
) -> Harness {
    let vectors = Arc::new(MemoryVectors::new());
    let services = PipelineServices {
        decoder: Arc::new(decoder),
        embedder: Arc::new(StubEmbedder),
        ocr,
        object_store: store,
        vector_store: Arc::clone(&vectors) as Arc<dyn VectorStore>,
    };
    let pipeline = StreamingPipeline::new(services, config).unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = Arc::clone(&progress);
    let progress_fn: Arc<dyn Fn(u32) + Send + Sync> = Arc::new(move |pages| {
        progress_sink.lock().unwrap().push(pages);
    });

    Harness {
        pipeline,
        vectors,
        progress,
        progress_fn,
    }
}

fn test_config(batch_size: usize, max_in_flight: usize, ocr_enabled: bool) -> Config {
    let mut config = Config::default();
    config.ingestion.batch_size = batch_size;
    config.ingestion.max_in_flight_batches = max_in_flight;
    config.ocr.enabled = ocr_enabled;
    config
}

/// The stub decoder never reads the file, but the rasterizer stats it
/// for the document's size.
fn stub_pdf() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"%PDF-1.4 stub").unwrap();
    file
}

async fn run_ingest(
    harness: &Harness,
    cancel: CancelFlag,
) -> Result<pagedex::IngestReport, PipelineError> {
    let pdf = stub_pdf();
    harness
        .pipeline
        .ingest(
            pdf.path(),
            "test.pdf",
            "doc-under-test",
            IngestOptions {
                job_id: Some("job-under-test".to_string()),
                cancel,
                progress: Some(Arc::clone(&harness.progress_fn)),
                ..Default::default()
            },
        )
        .await
}

fn assert_monotonic(progress: &[u32]) {
    for pair in progress.windows(2) {
        assert!(pair[0] < pair[1], "progress not monotonic: {:?}", progress);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_three_pages_with_ocr() {
    let ocr: Arc<dyn OcrClient> = Arc::new(StubOcr::new());
    let h = harness(test_config(2, 2, true), StubDecoder::new(3), Some(ocr));

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 3);
    assert_eq!(report.total_batches, 2);
    assert_eq!(report.job_id, "job-under-test");

    let mut points = h.vectors.points();
    assert_eq!(points.len(), 3);
    points.sort_by_key(|p| p.payload["page_number"].as_u64().unwrap());

    for (idx, point) in points.iter().enumerate() {
        let page = idx as u64 + 1;
        assert_eq!(point.payload["page_number"], page);
        assert_eq!(point.payload["total_pages"], 3);
        assert_eq!(point.payload["filename"], "test.pdf");
        assert_eq!(point.payload["job_id"], "job-under-test");
        assert_eq!(point.payload["ocr"]["text"], format!("page-{}", page));
        assert_eq!(point.payload["ocr"]["markdown"], format!("# page-{}", page));
        let regions = point.payload["ocr"]["regions"].as_array().unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0]["label"], "text");
        assert_eq!(regions[0]["bbox"], serde_json::json!([0, 0, 100, 20]));
        assert!(point.payload["image_url"]
            .as_str()
            .unwrap()
            .starts_with("memory://doc-under-test/"));
        // Pooled prefetch vectors are on by default.
        assert!(point.vectors.mean_pooling_rows.is_some());
        assert!(point.vectors.mean_pooling_columns.is_some());
    }

    // Every page keyed by a distinct freshly generated ID.
    let mut ids: Vec<&str> = points.iter().map(|p| p.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    let progress = h.progress.lock().unwrap().clone();
    assert_monotonic(&progress);
    assert_eq!(*progress.last().unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_page_document() {
    let ocr: Arc<dyn OcrClient> = Arc::new(StubOcr::new());
    let h = harness(test_config(4, 1, true), StubDecoder::new(1), Some(ocr));

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 1);
    assert_eq!(report.total_batches, 1);
    assert_eq!(h.vectors.points().len(), 1);
    assert_eq!(*h.progress.lock().unwrap(), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ocr_failure_stops_the_pipeline() {
    let ocr: Arc<dyn OcrClient> = Arc::new(StubOcr::new().fail_on_page(2));
    let h = harness(test_config(2, 1, true), StubDecoder::new(2), Some(ocr));

    let err = run_ingest(&h, CancelFlag::new()).await.unwrap_err();
    match err {
        PipelineError::Stage {
            stage: StageKind::Ocr,
            batch_id,
            page_start,
            page_end,
            ..
        } => {
            assert_eq!(batch_id, 0);
            assert_eq!(page_start, 1);
            assert_eq!(page_end, 2);
        }
        other => panic!("expected OCR stage failure, got {:?}", other),
    }

    // Nothing must reach the vector store.
    assert!(h.vectors.points().is_empty());
    assert!(h.progress.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_mid_document() {
    let cancel = CancelFlag::new();
    let decoder = StubDecoder::new(10).cancel_after(2, cancel.clone());
    let ocr: Arc<dyn OcrClient> = Arc::new(StubOcr::new());
    let h = harness(test_config(2, 2, true), decoder, Some(ocr));

    let err = run_ingest(&h, cancel).await.unwrap_err();
    assert!(err.is_cancelled(), "expected Cancelled, got {:?}", err);

    // At most the two decoded batches (4 pages) can have reached upsert.
    let points = h.vectors.points();
    assert!(points.len() <= 4, "too many records: {}", points.len());

    let progress = h.progress.lock().unwrap().clone();
    assert_monotonic(&progress);
    assert!(progress.last().copied().unwrap_or(0) <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ocr_disabled_emits_no_ocr_fields() {
    let h = harness(test_config(2, 1, false), StubDecoder::new(2), None);

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 2);

    let points = h.vectors.points();
    assert_eq!(points.len(), 2);
    for point in &points {
        assert!(point.payload.get("ocr").is_none());
        assert!(point.payload["image_url"].as_str().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ocr_enabled_without_client_uses_placeholders() {
    // OCR is configured on but no backend is wired up: the stage publishes
    // placeholders, stays terminal, and records carry no OCR fields.
    let h = harness(test_config(2, 1, true), StubDecoder::new(3), None);

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 3);

    let points = h.vectors.points();
    assert_eq!(points.len(), 3);
    for point in &points {
        assert!(point.payload.get("ocr").is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_failure_falls_back_to_unstored_records() {
    let mut config = test_config(2, 1, false);
    config.ingestion.max_join_wait_seconds = 0.3;
    config.object_store.retries = 0;

    let h = harness_with_store(
        config,
        StubDecoder::new(2),
        None,
        Arc::new(MemoryStore::failing()),
    );

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 2);

    let points = h.vectors.points();
    assert_eq!(points.len(), 2);
    for point in &points {
        assert_eq!(point.payload["image_url"], serde_json::Value::Null);
        assert_eq!(point.payload["image_storage"], "none");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_ocr_join_times_out_but_pipeline_completes() {
    let mut config = test_config(2, 1, true);
    config.ingestion.max_join_wait_seconds = 0.4;

    let ocr: Arc<dyn OcrClient> =
        Arc::new(StubOcr::new().with_delay(Duration::from_millis(1500)));
    let h = harness(config, StubDecoder::new(2), Some(ocr));

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 2);

    // Upsert gave up waiting for OCR; records carry no OCR fields.
    let points = h.vectors.points();
    assert_eq!(points.len(), 2);
    for point in &points {
        assert!(point.payload.get("ocr").is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_bound_holds_with_one_in_flight_batch() {
    let completed = Arc::new(AtomicU32::new(0));
    let violation = Arc::new(AtomicBool::new(false));
    let decoder = StubDecoder::new(4)
        .with_admission_gauge(Arc::clone(&completed), 1, Arc::clone(&violation));

    let vectors = Arc::new(MemoryVectors::new());
    let services = PipelineServices {
        decoder: Arc::new(decoder),
        embedder: Arc::new(StubEmbedder),
        ocr: None,
        object_store: Arc::new(MemoryStore::new()),
        vector_store: Arc::clone(&vectors) as Arc<dyn VectorStore>,
    };
    let pipeline =
        StreamingPipeline::new(services, test_config(1, 1, false)).unwrap();

    let completed_cb = Arc::clone(&completed);
    let pdf = stub_pdf();
    let report = pipeline
        .ingest(
            pdf.path(),
            "test.pdf",
            "doc-under-test",
            IngestOptions {
                progress: Some(Arc::new(move |_| {
                    completed_cb.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.total_pages, 4);
    assert_eq!(vectors.points().len(), 4);
    assert!(
        !violation.load(Ordering::SeqCst),
        "a batch was decoded while the previous one was still in flight"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_storage_bounds_wall_time_by_batches_not_pages() {
    // Storage sleeps 200ms per upload while embedding is instant. Pages
    // within a batch upload concurrently, so the run is storage-bound at
    // roughly one delay per batch, well under one delay per page.
    let delay = Duration::from_millis(200);
    let mut config = test_config(2, 2, false);
    config.image.thumbnail_width = None;

    let store = Arc::new(MemoryStore::new().with_delay(delay));
    let h = harness_with_store(config, StubDecoder::new(4), None, store);

    let started = std::time::Instant::now();
    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.total_pages, 4);
    assert_eq!(h.vectors.points().len(), 4);
    // Two batches processed back to back by the storage worker.
    assert!(elapsed >= delay * 2, "finished too fast: {:?}", elapsed);
    // Four serial page uploads would take at least 4 delays.
    assert!(elapsed < delay * 4, "storage ran page-serially: {:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeat_ingestion_yields_identical_payloads_with_fresh_ids() {
    let ocr: Arc<dyn OcrClient> = Arc::new(StubOcr::new());
    let h = harness(test_config(2, 2, true), StubDecoder::new(3), Some(ocr));

    run_ingest(&h, CancelFlag::new()).await.unwrap();
    let first = h.vectors.points();
    assert_eq!(first.len(), 3);

    run_ingest(&h, CancelFlag::new()).await.unwrap();
    let all = h.vectors.points();
    let second = all[first.len()..].to_vec();
    assert_eq!(second.len(), 3);

    // Payloads match page for page once the per-run values are stripped:
    // the indexing timestamp, and region ids (which embed the page id).
    let by_page = |points: &[PointRecord]| -> BTreeMap<u64, serde_json::Value> {
        points
            .iter()
            .map(|p| {
                let mut payload = p.payload.clone();
                payload.as_object_mut().unwrap().remove("indexed_at");
                if let Some(regions) = payload
                    .pointer_mut("/ocr/regions")
                    .and_then(|r| r.as_array_mut())
                {
                    for region in regions {
                        region.as_object_mut().unwrap().remove("id");
                    }
                }
                (payload["page_number"].as_u64().unwrap(), payload)
            })
            .collect()
    };
    assert_eq!(by_page(&first), by_page(&second));

    let first_ids: HashSet<&str> = first.iter().map(|p| p.id.as_str()).collect();
    assert!(
        second.iter().all(|p| !first_ids.contains(p.id.as_str())),
        "page ids must be regenerated on every run"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exact_multiple_of_batch_size() {
    let ocr: Arc<dyn OcrClient> = Arc::new(StubOcr::new());
    let h = harness(test_config(2, 2, true), StubDecoder::new(4), Some(ocr));

    let report = run_ingest(&h, CancelFlag::new()).await.unwrap();
    assert_eq!(report.total_pages, 4);
    assert_eq!(report.total_batches, 2);
    assert_eq!(h.vectors.points().len(), 4);
    assert_eq!(*h.progress.lock().unwrap().last().unwrap(), 4);
}
