use incidentllm::ingest::UploadKind;
use incidentllm::server::AppState;
use incidentllm::sse::TagFilter;
use incidentllm::store::{DocQuery, PROMPTS_CONTAINER};
use std::io::Write;

fn targz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, *path, *content).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// Run an upload and return every event it published, terminal last.
async fn run_upload(
    state: &AppState,
    kind: UploadKind,
    override_name: Option<&str>,
    archive: Vec<u8>,
) -> Vec<incidentllm::sse::EventRecord> {
    let source = format!("upload:test:{}", kind.as_str());
    let mut sub = state.bus.subscribe(TagFilter::only(&source));
    state
        .ingest
        .run_upload(kind, override_name.map(str::to_string), archive, &source)
        .await;
    let mut events = Vec::new();
    while let Some(event) = sub.try_next() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn telemetry_upload_coerces_numeric_columns() {
    let state = AppState::demo();
    let archive = targz(&[
        (
            "manifest.json",
            br#"{"name": "telco-noc", "containers": [
                {"name": "interface_counters", "file": "counters.csv",
                 "numeric_columns": ["errors_in", "errors_out"]}
            ]}"# as &[u8],
        ),
        (
            "counters.csv",
            b"device,errors_in,errors_out\nRTR-SYD-01,0,48231\nRTR-MEL-01,51022,3\n",
        ),
    ]);

    let events = run_upload(&state, UploadKind::Telemetry, None, archive).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, "complete");
    assert_eq!(last.payload["counts"]["interface_counters"], 2);

    // Rows landed in the scenario-prefixed container with real numbers.
    let rows = state
        .store
        .query("telco-noc-interface_counters", &DocQuery::all())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let syd = rows
        .iter()
        .find(|r| r["device"] == "RTR-SYD-01")
        .unwrap();
    assert_eq!(syd["errors_out"], 48231.0);
    assert!(syd["errors_out"].is_number());
}

#[tokio::test]
async fn prompts_upload_uses_versioned_double_underscore_ids() {
    let state = AppState::demo();
    let archive = targz(&[
        ("orchestrator.md", b"Coordinate the team." as &[u8]),
        ("graph-explorer/core.md", b"Explore the graph."),
        ("graph-explorer/extra.md", b"Prefer anchored traversals."),
    ]);

    let events = run_upload(&state, UploadKind::Prompts, Some("telco-noc"), archive).await;
    assert_eq!(events.last().unwrap().kind, "complete");
    assert_eq!(events.last().unwrap().payload["counts"]["prompts"], 2);

    let doc = state
        .store
        .get(PROMPTS_CONTAINER, "telco-noc__orchestrator__v1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc["agent"], "orchestrator");
    assert_eq!(doc["version"], 1);

    // Fragments for one agent concatenate in path order.
    let explorer = state
        .store
        .get(PROMPTS_CONTAINER, "telco-noc__graph-explorer__v1")
        .await
        .unwrap()
        .unwrap();
    let content = explorer["content"].as_str().unwrap();
    let core_at = content.find("Explore the graph").unwrap();
    let extra_at = content.find("anchored traversals").unwrap();
    assert!(core_at < extra_at);
}

#[tokio::test]
async fn runbooks_upload_builds_index_over_container() {
    let state = AppState::demo();
    let archive = targz(&[
        ("noc-114.md", b"Fibre link down procedure" as &[u8]),
        ("noc-115.md", b"BGP flap procedure"),
    ]);

    let events = run_upload(&state, UploadKind::Runbooks, Some("telco-noc"), archive).await;
    assert_eq!(events.last().unwrap().kind, "complete");
    assert_eq!(events.last().unwrap().payload["counts"]["documents"], 2);

    let docs = state.search.list_documents("telco-noc-runbooks").await.unwrap();
    assert_eq!(docs.len(), 2);
}

#[tokio::test]
async fn missing_manifest_fails_before_touching_resources() {
    let state = AppState::demo();
    let archive = targz(&[("routers.csv", b"id,city\nr1,Sydney\n" as &[u8])]);

    let events = run_upload(&state, UploadKind::Graph, Some("early-fail"), archive).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, "error");
    assert!(last.payload["error"]
        .as_str()
        .unwrap()
        .contains("manifest.json"));

    // Nothing was created for the scenario.
    assert!(state
        .store
        .query("early-fail-interface_counters", &DocQuery::all())
        .await
        .is_err());
}

#[tokio::test]
async fn missing_declared_column_fails_validation() {
    let state = AppState::demo();
    let archive = targz(&[
        (
            "manifest.json",
            br#"{"vertices": [{"label": "Router", "file": "routers.csv",
                "columns": ["id", "city", "region"]}], "edges": []}"# as &[u8],
        ),
        ("routers.csv", b"id,city\nr1,Sydney\n"),
    ]);

    let events = run_upload(&state, UploadKind::Graph, Some("colcheck"), archive).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, "error");
    assert!(last.payload["error"].as_str().unwrap().contains("region"));
}

#[tokio::test]
async fn missing_referenced_file_fails_validation() {
    let state = AppState::demo();
    let archive = targz(&[(
        "manifest.json",
        br#"{"vertices": [{"label": "Router", "file": "absent.csv", "columns": ["id"]}],
             "edges": []}"# as &[u8],
    )]);

    let events = run_upload(&state, UploadKind::Graph, Some("filecheck"), archive).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, "error");
    assert!(last.payload["error"].as_str().unwrap().contains("absent.csv"));
}

#[tokio::test]
async fn upload_without_any_name_is_rejected() {
    let state = AppState::demo();
    let archive = targz(&[("doc.md", b"a runbook" as &[u8])]);

    let events = run_upload(&state, UploadKind::Runbooks, None, archive).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, "error");
    assert_eq!(last.payload["kind"], "validation");
}

#[tokio::test]
async fn upload_records_status_on_scenario() {
    let state = AppState::demo();
    let archive = targz(&[
        ("noc-114.md", b"Fibre link down procedure" as &[u8]),
    ]);
    run_upload(&state, UploadKind::Runbooks, Some("statuscheck"), archive).await;

    let record = state
        .scenarios
        .get("statuscheck")
        .await
        .unwrap()
        .expect("upload creates a minimal scenario record");
    assert_eq!(record.upload_status["runbooks"].status, "complete");
    assert_eq!(record.upload_status["runbooks"].counts["documents"], 1);
}
