//! Property test: concurrent `/upload` and `/error` callbacks.
//!
//! Whatever the interleaving, each source accepts exactly one callback and
//! the request settles on the status derived from its sources.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use common::{create_body, sources_of, TestApp};
use domain::models::aggregate_status;
use persistence::ExportStore;
use proptest::prelude::*;
use uuid::Uuid;

/// `(source index, is upload)` per callback, in dispatch order.
fn callbacks() -> impl Strategy<Value = (usize, Vec<(usize, bool)>)> {
    (1usize..5).prop_flat_map(|sources| {
        prop::collection::vec(prop::collection::vec(any::<bool>(), 1..4), sources)
            .prop_map(|per_source| {
                per_source
                    .into_iter()
                    .enumerate()
                    .flat_map(|(index, kinds)| kinds.into_iter().map(move |upload| (index, upload)))
                    .collect::<Vec<_>>()
            })
            .prop_shuffle()
            .prop_map(move |calls| (sources, calls))
    })
}

async fn run_interleaving(source_count: usize, calls: Vec<(usize, bool)>) {
    let app = Arc::new(TestApp::new());
    let apps: Vec<(String, String)> = (0..source_count)
        .map(|i| (format!("app{}", i), format!("res{}", i)))
        .collect();
    let pairs: Vec<(&str, &str)> = apps.iter().map(|(a, r)| (a.as_str(), r.as_str())).collect();

    let (status, created) = app.create_export(create_body("json", &pairs)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = created["id"].as_str().unwrap().to_string();
    let sources = sources_of(&created);

    let handles: Vec<_> = calls
        .into_iter()
        .map(|(index, upload)| {
            let app = app.clone();
            let id = id.clone();
            let (application, source_id) = sources[index].clone();
            tokio::spawn(async move {
                let (status, _) = if upload {
                    app.upload(&id, &application, &source_id, "{}").await
                } else {
                    app.report_error(&id, &application, &source_id, "failed", 5)
                        .await
                };
                (index, status)
            })
        })
        .collect();

    let mut accepted = vec![0usize; source_count];
    for handle in handles {
        let (index, status) = handle.await.unwrap();
        match status {
            StatusCode::ACCEPTED => accepted[index] += 1,
            StatusCode::GONE => {}
            other => panic!("unexpected callback status {}", other),
        }
    }
    app.settle().await;

    assert!(accepted.iter().all(|&n| n == 1), "accepted per source: {:?}", accepted);

    let request = app.store.get(Uuid::parse_str(&id).unwrap()).await.unwrap();
    assert!(request.sources.iter().all(|s| s.status.is_terminal()));
    assert_eq!(
        request.status,
        aggregate_status(request.sources.iter().map(|s| s.status))
    );
    assert_eq!(request.archive_key.is_some(), request.status.has_archive());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_final_status_matches_sources((source_count, calls) in callbacks()) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_interleaving(source_count, calls));
    }
}
