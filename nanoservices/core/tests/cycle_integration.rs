use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use url::Url;

use transitflow_core::aggregate::{Aggregation, MetricRow};
use transitflow_core::builder::PipelineBuilder;
use transitflow_core::config::parse_pipeline;
use transitflow_core::config::types::FieldType;
use transitflow_core::events::trigger::Trigger;
use transitflow_core::failures::ErrorClass;
use transitflow_core::landing::{FileLanding, RawLanding};
use transitflow_core::pipeline::{CycleStatus, Pipeline};
use transitflow_core::sources::{FetchError, PageRequest, PageResponse, Upstream};
use transitflow_utils::error::Error;
use transitflow_utils::{RowMap, TransitFlowResult};

type Handler = dyn Fn(&Url) -> Result<PageResponse, FetchError> + Send + Sync;

/// Upstream answering from a closure, counting calls.
struct Scripted {
    handler: Box<Handler>,
    calls: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(handler: impl Fn(&Url) -> Result<PageResponse, FetchError> + Send + Sync + 'static) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (Self { handler: Box::new(handler), calls: calls.clone() }, calls)
    }
}

#[async_trait::async_trait]
impl Upstream for Scripted {
    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(&request.url)
    }
}

fn ok(body: Value) -> Result<PageResponse, FetchError> {
    Ok(PageResponse { status: 200, body: body.to_string().into_bytes() })
}

fn arrival(line: &str, stop: &str, ts: &str, delay: i64) -> Value {
    json!({ "line": line, "stop": stop, "ts": ts, "delay": delay })
}

fn build(yaml: &str, upstream: Scripted, landing: &std::path::Path) -> Pipeline {
    PipelineBuilder::new(parse_pipeline(yaml).unwrap())
        .upstream(upstream)
        .landing(FileLanding::new(landing))
        .build()
        .unwrap()
}

const ARRIVALS: &str = r#"
pipeline: arrivals_test
units:
  arrivals:
    endpoint: "https://api.example.test/arrivals"
curation:
  arrivals:
    line: line
    stop: stop
    timestamp: ts
    fields:
      - { name: delay, type: int }
"#;

#[tokio::test]
async fn permanent_failure_in_one_unit_leaves_the_other_intact() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
pipeline: partial
units:
  broken:
    endpoint: "https://api.example.test/broken"
  arrivals:
    endpoint: "https://api.example.test/arrivals"
curation:
  arrivals:
    line: line
    stop: stop
    timestamp: ts
    fields:
      - { name: delay, type: int }
"#;
    let (upstream, _) = Scripted::new(|url| match url.path() {
        "/broken" => Err(FetchError::from_status(404, "no such endpoint")),
        _ => ok(json!([
            arrival("L1", "S1", "2024-05-01T08:00:00Z", 30),
            arrival("L1", "S2", "2024-05-01T08:05:00Z", 45),
            { "line": "L1", "ts": "2024-05-01T08:10:00Z", "delay": 5 },
            arrival("L1", "S3", "2999-01-01T00:00:00Z", 0),
        ])),
    });
    let pipeline = build(yaml, upstream, dir.path());

    let summary = pipeline.run_cycle("run-partial").await.unwrap();
    assert_eq!(summary.status, CycleStatus::Partial);
    assert_eq!(summary.ingestion.tasks_succeeded, 1);
    assert_eq!(summary.ingestion.tasks_failed, 1);
    assert_eq!(summary.rows_merged(), 2);
    assert_eq!(summary.rows_rejected().get("missing_stop"), Some(&1));
    assert_eq!(summary.rows_rejected().get("future_timestamp"), Some(&1));

    let warehouse = pipeline.warehouse();
    let failures = warehouse.failures_for("run-partial").unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "broken");
    assert_eq!(failures[0].2, "permanent");
    assert_eq!(warehouse.curated_row_count("arrivals").unwrap(), 2);

    let runs = warehouse.recent_runs(5).unwrap();
    assert_eq!(runs[0].status, "partial");
    assert!(runs[0].summary.as_deref().unwrap().contains("\"tasks_failed\":1"));
}

#[tokio::test]
async fn pagination_stops_at_the_first_empty_page() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
pipeline: paged
units:
  stops:
    endpoint: "https://api.example.test/stops"
    items_path: data
    pagination: { type: page_number, param: page }
"#;
    let (upstream, calls) = Scripted::new(|url| {
        let page: u64 = url
            .query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(1);
        let items = if page <= 3 { json!([{ "stop_id": format!("S{page}") }]) } else { json!([]) };
        ok(json!({ "data": items }))
    });
    let pipeline = build(yaml, upstream, dir.path());

    let summary = pipeline.run_cycle("run-paged").await.unwrap();
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.ingestion.pages_landed, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let landing = FileLanding::new(dir.path());
    assert_eq!(landing.list("stops").await.unwrap().len(), 3);
    assert_eq!(pipeline.warehouse().raw_row_count("stops").unwrap(), 3);
}

#[tokio::test]
async fn transient_failures_stop_at_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
pipeline: flaky
units:
  vehicles:
    endpoint: "https://api.example.test/vehicles"
    retry: { max_attempts: 3, base_delay: 1ms, max_delay: 5ms }
"#;
    let (upstream, calls) = Scripted::new(|_| Err(FetchError::from_status(503, "overloaded")));
    let pipeline = build(yaml, upstream, dir.path());

    let summary = pipeline.run_cycle("run-flaky").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.ingestion.failures.len(), 1);
    assert_eq!(summary.ingestion.failures[0].attempts, 3);
    assert_eq!(summary.ingestion.failures[0].class, ErrorClass::Permanent);

    let warehouse = pipeline.warehouse();
    let attempts = warehouse.attempts_for("run-flaky").unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome == "transient" && a.http_status == Some(503)));
    assert_eq!(warehouse.failures_for("run-flaky").unwrap().len(), 1);
}

#[tokio::test]
async fn later_cycle_supersedes_earlier_value_for_the_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let body = Arc::new(Mutex::new(json!([arrival("L1", "S1", "2024-05-01T08:00:00Z", 30)])));
    let served = body.clone();
    let (upstream, _) = Scripted::new(move |_| ok(served.lock().unwrap().clone()));
    let pipeline = build(ARRIVALS, upstream, dir.path());

    pipeline.run_cycle("c1").await.unwrap();
    *body.lock().unwrap() = json!([arrival("L1", "S1", "2024-05-01T08:00:00Z", 90)]);
    let second = pipeline.run_cycle("c2").await.unwrap();
    assert_eq!(second.merge_for("arrivals").unwrap().updated, 1);

    let warehouse = pipeline.warehouse();
    assert_eq!(warehouse.curated_row_count("arrivals").unwrap(), 1);
    let keys = warehouse.curated_key_set("arrivals").unwrap();
    let rows = warehouse.curated_rows("arrivals", &keys, &[("delay".to_string(), FieldType::Int)]).unwrap();
    assert_eq!(rows[0].values["delay"], json!(90));
    assert_eq!(rows[0].values["run_id"], json!("c2"));
}

#[tokio::test]
async fn replaying_the_same_payload_converges() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, _) = Scripted::new(|_| {
        ok(json!([
            arrival("L1", "S1", "2024-05-01T08:00:00Z", 30),
            arrival("L1", "S1", "2024-05-01T08:00:00Z", 30),
            arrival("L2", "S4", "2024-05-01T08:02:00Z", 12),
        ]))
    });
    let pipeline = build(ARRIVALS, upstream, dir.path());

    let first = pipeline.run_cycle("r1").await.unwrap();
    let merge = first.merge_for("arrivals").unwrap();
    assert_eq!((merge.inserted, merge.rows_collapsed), (2, 1));

    let second = pipeline.run_cycle("r2").await.unwrap();
    let merge = second.merge_for("arrivals").unwrap();
    assert_eq!((merge.inserted, merge.updated), (0, 2));

    // Retrying a run id restarts its history row instead of adding one.
    pipeline.run_cycle("r2").await.unwrap();

    let warehouse = pipeline.warehouse();
    assert_eq!(warehouse.curated_row_count("arrivals").unwrap(), 2);
    let keys = warehouse.curated_key_set("arrivals").unwrap();
    let delays: Vec<Value> = warehouse
        .curated_rows("arrivals", &keys, &[("delay".to_string(), FieldType::Int)])
        .unwrap()
        .into_iter()
        .map(|r| r.values["delay"].clone())
        .collect();
    assert_eq!(delays, vec![json!(30), json!(12)]);
    assert_eq!(warehouse.recent_runs(10).unwrap().len(), 2);
}

#[tokio::test]
async fn new_payload_field_becomes_a_nullable_column() {
    let dir = tempfile::tempdir().unwrap();
    let body = Arc::new(Mutex::new(json!([arrival("L1", "S1", "2024-05-01T08:00:00Z", 30)])));
    let served = body.clone();
    let (upstream, _) = Scripted::new(move |_| ok(served.lock().unwrap().clone()));
    let pipeline = build(ARRIVALS, upstream, dir.path());

    pipeline.run_cycle("s1").await.unwrap();
    *body.lock().unwrap() = json!([{ "line": "L1", "stop": "S2", "ts": "2024-05-01T09:00:00Z", "delay": 5, "platform": "3" }]);
    let second = pipeline.run_cycle("s2").await.unwrap();
    assert_eq!(second.raw[0].columns_added, vec!["platform"]);

    let warehouse = pipeline.warehouse();
    assert!(warehouse.raw_schema("arrivals").unwrap().iter().any(|(name, _)| name == "platform"));
    let rows = warehouse.raw_rows_after("arrivals", 0, 100).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].values["delay"], json!(30));
    assert!(matches!(rows[0].values.get("platform"), None | Some(Value::Null)));
    assert_eq!(rows[1].values["platform"], json!("3"));
}

#[tokio::test]
async fn incompatible_type_halts_only_that_table() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
pipeline: structural
units:
  arrivals:
    endpoint: "https://api.example.test/arrivals"
  departures:
    endpoint: "https://api.example.test/departures"
curation:
  arrivals:
    line: line
    stop: stop
    timestamp: ts
    fields:
      - { name: delay, type: int }
  departures:
    line: line
    stop: stop
    timestamp: ts
    fields:
      - { name: delay, type: int }
"#;
    let broken = Arc::new(Mutex::new(false));
    let flag = broken.clone();
    let (upstream, _) = Scripted::new(move |url| {
        let delay = if url.path() == "/arrivals" && *flag.lock().unwrap() { json!("late") } else { json!(30) };
        ok(json!([{ "line": "L1", "stop": "S1", "ts": "2024-05-01T08:00:00Z", "delay": delay }]))
    });
    let pipeline = build(yaml, upstream, dir.path());

    let first = pipeline.run_cycle("t1").await.unwrap();
    assert_eq!(first.status, CycleStatus::Completed);

    *broken.lock().unwrap() = true;
    let second = pipeline.run_cycle("t2").await.unwrap();
    assert_eq!(second.status, CycleStatus::Partial);
    assert!(second.halted.contains_key("arrivals"));
    assert!(second.merge_for("arrivals").is_none());
    assert_eq!(second.merge_for("departures").unwrap().updated, 1);

    // The bad file stays unconsumed, so the table stays halted.
    let third = pipeline.run_cycle("t3").await.unwrap();
    assert!(third.halted.contains_key("arrivals"));
    assert_eq!(pipeline.warehouse().raw_row_count("arrivals").unwrap(), 1);
}

#[tokio::test]
async fn enrichment_keeps_unmatched_events_and_feeds_aggregations() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
pipeline: enriched
units:
  arrivals:
    endpoint: "https://api.example.test/arrivals"
curation:
  arrivals:
    line: line
    stop: stop
    timestamp: ts
    fields:
      - { name: delay, type: int }
references:
  stops: { key: stop_id }
enrichment:
  arrivals:
    - { reference: stops, on: stop_id, fields: [name, region] }
aggregations:
  - { type: count_by, name: arrivals_per_region, unit: arrivals, dimension: stops_region }
"#;
    let (upstream, _) = Scripted::new(|_| {
        ok(json!([
            arrival("L1", "S1", "2024-05-01T08:00:00Z", 30),
            arrival("L1", "S9", "2024-05-01T08:05:00Z", 10),
        ]))
    });
    let pipeline = build(yaml, upstream, dir.path());
    pipeline
        .warehouse()
        .replace_reference("stops", "stop_id", &[json!({ "stop_id": "S1", "name": "Central", "region": "north" })])
        .unwrap();

    let summary = pipeline.run_cycle("e1").await.unwrap();
    assert_eq!(summary.enrichment[0].rows_enriched, 2);
    assert_eq!(summary.enrichment[0].rows_unmatched, 1);

    let rows = pipeline.warehouse().enriched_rows("arrivals").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        pipeline.warehouse().metric_rows("arrivals_per_region").unwrap(),
        vec![
            MetricRow { dimension: None, value: 1.0 },
            MetricRow { dimension: Some("north".into()), value: 1.0 },
        ]
    );

    // A reference reload followed by a refresh fills the gap.
    pipeline
        .warehouse()
        .replace_reference(
            "stops",
            "stop_id",
            &[
                json!({ "stop_id": "S1", "name": "Central", "region": "north" }),
                json!({ "stop_id": "S9", "name": "Harbour", "region": "south" }),
            ],
        )
        .unwrap();
    let refreshed = pipeline.refresh_enrichment().await.unwrap();
    assert_eq!(refreshed[0].rows_unmatched, 0);
}

#[tokio::test]
async fn cancelled_cycle_is_aborted_before_any_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, calls) = Scripted::new(|_| ok(json!([])));
    let pipeline = build(ARRIVALS, upstream, dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = pipeline.run_cycle_with_cancel("x1", &Trigger::Manual, cancel).await.unwrap();
    assert_eq!(summary.status, CycleStatus::Aborted);
    assert_eq!(summary.ingestion.failures[0].class, ErrorClass::Cancelled);
    assert!(summary.merges.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(pipeline.warehouse().recent_runs(1).unwrap()[0].status, "aborted");
}

/// Aggregation whose computation always fails.
struct Unbalanced;

impl Aggregation for Unbalanced {
    fn name(&self) -> &str {
        "delay_ratio"
    }

    fn unit(&self) -> &str {
        "arrivals"
    }

    fn compute(&self, _rows: &[RowMap]) -> TransitFlowResult<Vec<MetricRow>> {
        Err(Error::Config("ratio denominator is zero".into()))
    }
}

#[tokio::test]
async fn failing_aggregation_is_recorded_and_the_cycle_still_reports() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!("{ARRIVALS}aggregations:\n  - {{ type: count_by, name: arrivals_per_line, unit: arrivals, dimension: line_id }}\n");
    let (upstream, _) = Scripted::new(|_| ok(json!([arrival("L1", "S1", "2024-05-01T08:00:00Z", 30)])));
    let pipeline = PipelineBuilder::new(parse_pipeline(&yaml).unwrap())
        .upstream(upstream)
        .landing(FileLanding::new(dir.path()))
        .aggregation(Unbalanced)
        .build()
        .unwrap();

    let summary = pipeline.run_cycle("agg-1").await.unwrap();
    assert_eq!(summary.status, CycleStatus::Partial);
    assert_eq!(summary.rows_merged(), 1);
    assert!(summary.aggregations.failed["delay_ratio"].contains("denominator"));
    assert_eq!(
        pipeline.warehouse().metric_rows("arrivals_per_line").unwrap(),
        vec![MetricRow { dimension: Some("L1".into()), value: 1.0 }]
    );

    let runs = pipeline.warehouse().recent_runs(1).unwrap();
    assert_eq!(runs[0].status, "partial");
}
