//! Common test utilities for integration tests.
//!
//! The app is wired over the in-memory store, object store and message bus,
//! so no PostgreSQL, S3 or Kafka is needed.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use export_service_api::app::{internal_router, public_router, AppState};
use export_service_api::config::Config;
use export_service_api::middleware::PSK_HEADER;
use fake::faker::lorem::en::Words;
use fake::Fake;
use export_service_api::services::{
    LifecycleController, MemoryMessageBus, MemoryObjectStore, OutboundMessage, Publisher,
    PublisherTask,
};
use persistence::MemoryExportStore;
use serde_json::{json, Value};
use shared::identity::{encode_identity, IDENTITY_HEADER};
use tower::ServiceExt;

pub const PUBLIC_BASE: &str = "/api/export/v1";
pub const PRIVATE_BASE: &str = "/app/export/v1";
pub const TEST_PSK: &str = "testing-a-psk";

pub struct TestApp {
    pub public: Router,
    pub internal: Router,
    pub store: Arc<MemoryExportStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub bus: Arc<MemoryMessageBus>,
    pub controller: LifecycleController,
    pub publisher: PublisherTask,
    pub topic: String,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_store(MemoryExportStore::new())
    }

    pub fn with_store(store: MemoryExportStore) -> Self {
        let config = Config::load_for_test(&[]).expect("test config");
        let store = Arc::new(store);
        let objects = Arc::new(MemoryObjectStore::new());
        let bus = Arc::new(MemoryMessageBus::new());

        let (publisher, worker) = Publisher::new(bus.clone(), &config.kafka);
        let controller = LifecycleController::new(
            store.clone(),
            objects.clone(),
            publisher,
            config.exports.default_expiry_days,
        );

        let state = AppState {
            store: store.clone(),
            controller: controller.clone(),
            config: Arc::new(config.clone()),
        };

        Self {
            public: public_router(state.clone()),
            internal: internal_router(state),
            store,
            objects,
            bus,
            controller,
            publisher: worker.spawn(),
            topic: config.kafka.announce_topic,
        }
    }

    /// Waits for every accepted upload, error and assembly to finish.
    pub async fn settle(&self) {
        self.controller.wait_idle().await;
    }

    /// Waits until `count` announce messages reached the bus.
    pub async fn wait_for_messages(&self, count: usize) -> Vec<OutboundMessage> {
        for _ in 0..200 {
            let delivered = self.bus.delivered_to(&self.topic);
            if delivered.len() >= count {
                return delivered;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} messages, got {}",
            count,
            self.bus.delivered_to(&self.topic).len()
        );
    }

    pub async fn public_request(
        &self,
        method: Method,
        path: &str,
        identity: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", PUBLIC_BASE, path));
        if let Some(identity) = identity {
            builder = builder.header(IDENTITY_HEADER, identity);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .public
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec(), headers)
    }

    /// GET on a route mounted outside the public base path.
    pub async fn root_get(&self, path: &str) -> StatusCode {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.public.clone().oneshot(request).await.unwrap().status()
    }

    pub async fn public_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let (status, bytes, _) = self
            .public_request(method, path, Some(&identity()), body)
            .await;
        (status, parse_json(&bytes))
    }

    pub async fn create_export(&self, body: Value) -> (StatusCode, Value) {
        self.public_json(Method::POST, "/exports", Some(body)).await
    }

    pub async fn status_of(&self, id: &str) -> Value {
        let (status, json) = self
            .public_json(Method::GET, &format!("/exports/{}/status", id), None)
            .await;
        assert_eq!(status, StatusCode::OK, "status body: {}", json);
        json
    }

    pub async fn internal_request(
        &self,
        path: &str,
        psk: Option<&str>,
        body: Body,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", PRIVATE_BASE, path));
        if let Some(psk) = psk {
            builder = builder.header(PSK_HEADER, psk);
        }

        let response = self
            .internal
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, parse_json(&bytes))
    }

    pub async fn upload(
        &self,
        request_id: &str,
        application: &str,
        source_id: &str,
        payload: &str,
    ) -> (StatusCode, Value) {
        self.internal_request(
            &format!("/{}/{}/{}/upload", request_id, application, source_id),
            Some(TEST_PSK),
            Body::from(payload.to_string()),
        )
        .await
    }

    pub async fn report_error(
        &self,
        request_id: &str,
        application: &str,
        source_id: &str,
        message: &str,
        code: i32,
    ) -> (StatusCode, Value) {
        self.internal_request(
            &format!("/{}/{}/{}/error", request_id, application, source_id),
            Some(TEST_PSK),
            Body::from(json!({"message": message, "code": code}).to_string()),
        )
        .await
    }
}

/// Identity header of the default test user.
pub fn identity() -> String {
    encode_identity("10001", "org-1", "jdoe")
}

pub fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }
}

/// Create body with one json source per `(application, resource)`.
pub fn create_body(format: &str, sources: &[(&str, &str)]) -> Value {
    let words: Vec<String> = Words(2..4).fake();
    json!({
        "name": words.join(" "),
        "format": format,
        "sources": sources
            .iter()
            .map(|(application, resource)| json!({
                "application": application,
                "resource": resource,
                "filters": {"status": "active"}
            }))
            .collect::<Vec<_>>(),
    })
}

/// `(application, source_id)` of every source in a create/status response.
pub fn sources_of(response: &Value) -> Vec<(String, String)> {
    response["sources"]
        .as_array()
        .expect("sources array")
        .iter()
        .map(|s| {
            (
                s["application"].as_str().unwrap().to_string(),
                s["id"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

/// Sorted entry names of a ZIP archive.
pub fn zip_entries(data: &[u8]) -> Vec<String> {
    let archive = zip::ZipArchive::new(std::io::Cursor::new(data)).expect("valid zip");
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

pub fn zip_file(data: &[u8], name: &str) -> String {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data)).expect("valid zip");
    let mut out = String::new();
    archive
        .by_name(name)
        .expect("entry present")
        .read_to_string(&mut out)
        .unwrap();
    out
}
