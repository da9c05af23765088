//! # Embedding 批量缓存协调器测试

mod common;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use common::{config_from_yaml, request_with_peer, response_body, FakeStorage};
use httpmock::prelude::*;
use llm_proxy::proxy::embedding_cache::{
    EmbeddingCacheCoordinator, EmbeddingCacheMetadata, EmbeddingInputMeta, EmbeddingPreOutcome,
};
use llm_proxy::proxy::{ProxyHandler, EMBEDDING_CACHE_BYPASS_HEADER, EMBEDDING_CACHE_HEADER};
use llm_proxy::storage::{CacheStorage, EmbeddingRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

fn coordinator_with(storage: Arc<FakeStorage>) -> EmbeddingCacheCoordinator {
    EmbeddingCacheCoordinator::new(storage as Arc<dyn CacheStorage>)
}

fn metadata(
    model: &str,
    total: usize,
    hits: HashMap<usize, EmbeddingRecord>,
    misses: Vec<EmbeddingInputMeta>,
) -> EmbeddingCacheMetadata {
    EmbeddingCacheMetadata {
        model: model.to_string(),
        dimensions: None,
        total,
        hits,
        misses,
        original_was_array: true,
        start_time: chrono::Utc::now().naive_utc(),
        request_id: "req-123".to_string(),
    }
}

fn hit_record(embedding: Vec<f64>, token_count: Option<i32>) -> EmbeddingRecord {
    EmbeddingRecord {
        embedding,
        token_count,
        ..Default::default()
    }
}

#[tokio::test]
async fn applies_only_to_post_embedding_paths_without_bypass() {
    let coordinator = coordinator_with(Arc::new(FakeStorage::new()));

    let empty = HeaderMap::new();
    assert!(coordinator.applies(&Method::POST, "/v1/embeddings", &empty));
    assert!(coordinator.applies(&Method::POST, "/api/v1/models/text-embedding-ada-002/embeddings", &empty));
    assert!(!coordinator.applies(&Method::GET, "/v1/embeddings", &empty));
    assert!(!coordinator.applies(&Method::POST, "/v1/chat/completions", &empty));

    let mut bypass = HeaderMap::new();
    bypass.insert(
        EMBEDDING_CACHE_BYPASS_HEADER,
        HeaderValue::from_static("1"),
    );
    assert!(!coordinator.applies(&Method::POST, "/v1/embeddings", &bypass));
}

#[tokio::test]
async fn pre_proxy_single_hit_terminates_request() {
    let storage = Arc::new(FakeStorage::new());
    storage.seed_embedding("hello", "text-embedding", vec![0.1, 0.2], None);
    let coordinator = coordinator_with(storage);

    let body = Bytes::from_static(br#"{"model":"text-embedding","input":"hello"}"#);
    match coordinator.pre_proxy("req-1", &body).await {
        EmbeddingPreOutcome::Terminal(response) => {
            assert_eq!(
                response.headers().get(EMBEDDING_CACHE_HEADER).unwrap(),
                "HIT"
            );
            let bytes = response_body(*response).await;
            let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(payload["data"].as_array().unwrap().len(), 1);
        }
        _ => panic!("expected terminal all-hit"),
    }
}

#[tokio::test]
async fn pre_proxy_all_hits_synthesize_ordered_response() {
    let storage = Arc::new(FakeStorage::new());
    storage.seed_embedding("hello", "text-embedding", vec![0.1, 0.2], Some(5));
    storage.seed_embedding("world", "text-embedding", vec![0.3, 0.4], Some(6));
    storage.seed_embedding("test", "text-embedding", vec![0.5, 0.6], Some(4));
    let coordinator = coordinator_with(storage);

    let body =
        Bytes::from_static(br#"{"model":"text-embedding","input":["hello","world","test"]}"#);
    match coordinator.pre_proxy("req-1", &body).await {
        EmbeddingPreOutcome::Terminal(response) => {
            let bytes = response_body(*response).await;
            let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(payload["object"], "list");
            let data = payload["data"].as_array().unwrap();
            assert_eq!(data.len(), 3);
            assert_eq!(data[0]["index"], 0);
            assert_eq!(data[0]["embedding"], serde_json::json!([0.1, 0.2]));
            assert_eq!(data[1]["index"], 1);
            assert_eq!(data[1]["embedding"], serde_json::json!([0.3, 0.4]));
            assert_eq!(data[2]["index"], 2);
            assert_eq!(data[2]["embedding"], serde_json::json!([0.5, 0.6]));
            assert_eq!(payload["usage"]["total_tokens"], 15);
            assert_eq!(payload["usage"]["prompt_tokens"], 15);
        }
        _ => panic!("expected terminal all-hit"),
    }
}

#[tokio::test]
async fn pre_proxy_all_miss_keeps_all_inputs() {
    let coordinator = coordinator_with(Arc::new(FakeStorage::new()));

    let body = Bytes::from_static(br#"{"model":"text-embedding","input":["foo","bar","baz"]}"#);
    match coordinator.pre_proxy("req-1", &body).await {
        EmbeddingPreOutcome::Rewritten { body, meta } => {
            assert_eq!(meta.total, 3);
            assert!(meta.hits.is_empty());
            assert_eq!(meta.misses.len(), 3);
            assert_eq!(meta.model, "text-embedding");

            let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(payload["input"], serde_json::json!(["foo", "bar", "baz"]));
        }
        _ => panic!("expected rewritten request"),
    }
}

#[tokio::test]
async fn pre_proxy_single_input_miss_keeps_string_shape() {
    let coordinator = coordinator_with(Arc::new(FakeStorage::new()));

    let body = Bytes::from_static(br#"{"model":"text-embedding","input":"new-text"}"#);
    match coordinator.pre_proxy("req-1", &body).await {
        EmbeddingPreOutcome::Rewritten { body, meta } => {
            assert_eq!(meta.total, 1);
            assert_eq!(meta.misses.len(), 1);
            assert_eq!(meta.misses[0].value, "new-text");

            let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(payload["input"], "new-text");
        }
        _ => panic!("expected rewritten request"),
    }
}

#[tokio::test]
async fn pre_proxy_partial_sends_only_misses() {
    let storage = Arc::new(FakeStorage::new());
    storage.seed_embedding("foo", "text-embedding", vec![0.1, 0.2], None);
    let coordinator = coordinator_with(storage);

    let body = Bytes::from_static(br#"{"model":"text-embedding","input":["foo","bar"]}"#);
    match coordinator.pre_proxy("req-1", &body).await {
        EmbeddingPreOutcome::Rewritten { body, meta } => {
            assert_eq!(meta.total, 2);
            assert_eq!(meta.hits.len(), 1);
            assert_eq!(meta.misses.len(), 1);
            assert_eq!(meta.misses[0].index, 1);
            assert_eq!(meta.misses[0].value, "bar");

            let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(payload["model"], "text-embedding");
            assert_eq!(payload["input"], serde_json::json!(["bar"]));
        }
        _ => panic!("expected rewritten request"),
    }
}

#[tokio::test]
async fn pre_proxy_storage_error_bypasses_cache() {
    let storage = Arc::new(FakeStorage::new());
    storage.fail_gets();
    let coordinator = coordinator_with(storage);

    let body = Bytes::from_static(br#"{"model":"text-embedding","input":"hello"}"#);
    assert!(matches!(
        coordinator.pre_proxy("req-1", &body).await,
        EmbeddingPreOutcome::Bypass
    ));
}

#[tokio::test]
async fn pre_proxy_skips_invalid_inputs() {
    let coordinator = coordinator_with(Arc::new(FakeStorage::new()));

    for body in [
        &b""[..],
        br#"{"input":"hello"}"#,
        br#"{"model":"text-embedding"}"#,
        br#"{"model":"text-embedding","input":123}"#,
        br#"{"model":"text-embedding","input":["ok",123]}"#,
        br#"{"model":"text-embedding","input":[]}"#,
        b"{invalid",
    ] {
        assert!(
            matches!(
                coordinator.pre_proxy("req-1", &Bytes::from(body.to_vec())).await,
                EmbeddingPreOutcome::Skip
            ),
            "body: {}",
            String::from_utf8_lossy(body)
        );
    }
}

#[tokio::test]
async fn post_proxy_partial_merges_and_persists() {
    let storage = Arc::new(FakeStorage::new());
    let coordinator = coordinator_with(Arc::clone(&storage));

    let mut hits = HashMap::new();
    hits.insert(0, hit_record(vec![0.1, 0.2], None));
    let meta = metadata(
        "text-embedding",
        2,
        hits,
        vec![EmbeddingInputMeta {
            index: 1,
            value: "bar".to_string(),
        }],
    );

    let upstream = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.3,0.4]}],"model":"text-embedding","usage":{"total_tokens":10}}"#;
    let mut headers = HeaderMap::new();
    let merged = coordinator
        .post_proxy(
            &meta,
            StatusCode::OK,
            &mut headers,
            Bytes::from_static(upstream.as_bytes()),
        )
        .await;

    assert_eq!(headers.get(EMBEDDING_CACHE_HEADER).unwrap(), "PARTIAL");

    let persisted = storage.upserted_embeddings();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].input_text, "bar");
    assert_eq!(persisted[0].embedding, vec![0.3, 0.4]);

    let payload: serde_json::Value = serde_json::from_slice(&merged).unwrap();
    let data = payload["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["index"], 0);
    assert_eq!(data[0]["embedding"], serde_json::json!([0.1, 0.2]));
    assert_eq!(data[1]["index"], 1);
    assert_eq!(data[1]["embedding"], serde_json::json!([0.3, 0.4]));
    assert_eq!(payload["usage"]["total_tokens"], 10);

    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
        merged.len().to_string()
    );
}

#[tokio::test]
async fn post_proxy_all_miss_persists_every_datum() {
    let storage = Arc::new(FakeStorage::new());
    let coordinator = coordinator_with(Arc::clone(&storage));

    let meta = metadata(
        "text-embedding",
        3,
        HashMap::new(),
        vec![
            EmbeddingInputMeta {
                index: 0,
                value: "foo".to_string(),
            },
            EmbeddingInputMeta {
                index: 1,
                value: "bar".to_string(),
            },
            EmbeddingInputMeta {
                index: 2,
                value: "baz".to_string(),
            },
        ],
    );

    let upstream = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.1,0.2]},{"object":"embedding","index":1,"embedding":[0.3,0.4]},{"object":"embedding","index":2,"embedding":[0.5,0.6]}],"model":"text-embedding","usage":{"total_tokens":15}}"#;
    let mut headers = HeaderMap::new();
    let merged = coordinator
        .post_proxy(
            &meta,
            StatusCode::OK,
            &mut headers,
            Bytes::from_static(upstream.as_bytes()),
        )
        .await;

    assert_eq!(headers.get(EMBEDDING_CACHE_HEADER).unwrap(), "MISS");
    assert_eq!(storage.upserted_embeddings().len(), 3);

    let payload: serde_json::Value = serde_json::from_slice(&merged).unwrap();
    let data = payload["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    for (index, embedding) in [
        serde_json::json!([0.1, 0.2]),
        serde_json::json!([0.3, 0.4]),
        serde_json::json!([0.5, 0.6]),
    ]
    .iter()
    .enumerate()
    {
        assert_eq!(data[index]["index"], index);
        assert_eq!(&data[index]["embedding"], embedding);
    }
}

#[tokio::test]
async fn post_proxy_all_hit_edge_case_reports_hit() {
    let storage = Arc::new(FakeStorage::new());
    let coordinator = coordinator_with(Arc::clone(&storage));

    let mut hits = HashMap::new();
    hits.insert(0, hit_record(vec![0.1, 0.2], Some(5)));
    hits.insert(1, hit_record(vec![0.3, 0.4], Some(6)));
    let meta = metadata("text-embedding", 2, hits, Vec::new());

    let upstream = r#"{"object":"list","data":[],"model":"text-embedding","usage":{"total_tokens":0}}"#;
    let mut headers = HeaderMap::new();
    let merged = coordinator
        .post_proxy(
            &meta,
            StatusCode::OK,
            &mut headers,
            Bytes::from_static(upstream.as_bytes()),
        )
        .await;

    assert_eq!(headers.get(EMBEDDING_CACHE_HEADER).unwrap(), "HIT");

    let payload: serde_json::Value = serde_json::from_slice(&merged).unwrap();
    let data = payload["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(payload["usage"]["total_tokens"], 11);
}

#[tokio::test]
async fn post_proxy_non_ok_forwards_verbatim_with_miss() {
    let storage = Arc::new(FakeStorage::new());
    let coordinator = coordinator_with(Arc::clone(&storage));

    let meta = metadata(
        "text-embedding",
        1,
        HashMap::new(),
        vec![EmbeddingInputMeta {
            index: 0,
            value: "foo".to_string(),
        }],
    );

    let upstream_body = Bytes::from_static(br#"{"error":{"message":"upstream broke"}}"#);
    let mut headers = HeaderMap::new();
    let body = coordinator
        .post_proxy(
            &meta,
            StatusCode::INTERNAL_SERVER_ERROR,
            &mut headers,
            upstream_body.clone(),
        )
        .await;

    assert_eq!(headers.get(EMBEDDING_CACHE_HEADER).unwrap(), "MISS");
    assert_eq!(body, upstream_body);
    assert!(storage.upserted_embeddings().is_empty());
}

#[tokio::test]
async fn post_proxy_decompresses_gzip_upstream() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let storage = Arc::new(FakeStorage::new());
    let coordinator = coordinator_with(Arc::clone(&storage));

    let meta = metadata(
        "text-embedding",
        1,
        HashMap::new(),
        vec![EmbeddingInputMeta {
            index: 0,
            value: "foo".to_string(),
        }],
    );

    let upstream = r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.9]}],"model":"text-embedding"}"#;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(upstream.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));

    let merged = coordinator
        .post_proxy(&meta, StatusCode::OK, &mut headers, Bytes::from(compressed))
        .await;

    // 合并响应以明文回包
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    let payload: serde_json::Value = serde_json::from_slice(&merged).unwrap();
    assert_eq!(payload["data"][0]["embedding"], serde_json::json!([0.9]));
    assert_eq!(storage.upserted_embeddings().len(), 1);
}

#[tokio::test]
async fn end_to_end_all_hit_never_calls_upstream() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200).body("{}");
    });

    let config = config_from_yaml(&format!(
        r#"
port: 8080
target_map:
  "/v1/embeddings": "{}"
"#,
        upstream.base_url()
    ));

    let storage = Arc::new(FakeStorage::new());
    storage.seed_embedding("hello", "text-emb-a", vec![0.1, 0.2], Some(2));
    storage.seed_embedding("world", "text-emb-a", vec![0.3, 0.4], Some(3));

    let handler = ProxyHandler::new(
        Arc::new(config),
        Some(Arc::clone(&storage) as Arc<dyn CacheStorage>),
    )
    .unwrap();
    let router = handler.router();

    let response = router
        .oneshot(request_with_peer(
            "POST",
            "/v1/embeddings",
            Body::from(r#"{"model":"text-emb-a","input":["hello","world"]}"#),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(EMBEDDING_CACHE_HEADER).unwrap(),
        "HIT"
    );

    let bytes = response_body(response).await;
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["object"], "list");
    assert_eq!(payload["model"], "text-emb-a");
    let data = payload["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["object"], "embedding");
    assert_eq!(data[0]["index"], 0);
    assert_eq!(data[0]["embedding"], serde_json::json!([0.1, 0.2]));
    assert_eq!(data[1]["index"], 1);
    assert_eq!(data[1]["embedding"], serde_json::json!([0.3, 0.4]));

    assert_eq!(mock.hits(), 0);
}

#[tokio::test]
async fn end_to_end_partial_splits_and_merges() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/embeddings")
            .json_body(serde_json::json!({"model": "text-emb-a", "input": ["world"]}));
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.3,0.4]}],"model":"text-emb-a","usage":{"total_tokens":5}}"#);
    });

    let config = config_from_yaml(&format!(
        r#"
port: 8080
target_map:
  "/v1/embeddings": "{}"
"#,
        upstream.base_url()
    ));

    let storage = Arc::new(FakeStorage::new());
    storage.seed_embedding("hello", "text-emb-a", vec![0.1, 0.2], None);

    let handler = ProxyHandler::new(
        Arc::new(config),
        Some(Arc::clone(&storage) as Arc<dyn CacheStorage>),
    )
    .unwrap();
    let router = handler.router();

    let response = router
        .oneshot(request_with_peer(
            "POST",
            "/v1/embeddings",
            Body::from(r#"{"model":"text-emb-a","input":["hello","world"]}"#),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(EMBEDDING_CACHE_HEADER).unwrap(),
        "PARTIAL"
    );
    assert_eq!(mock.hits(), 1);

    let bytes = response_body(response).await;
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let data = payload["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["index"], 0);
    assert_eq!(data[0]["embedding"], serde_json::json!([0.1, 0.2]));
    assert_eq!(data[1]["index"], 1);
    assert_eq!(data[1]["embedding"], serde_json::json!([0.3, 0.4]));
    assert_eq!(payload["usage"]["total_tokens"], 5);

    // 新向量已持久化
    let persisted = storage.upserted_embeddings();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].input_text, "world");
    assert_eq!(persisted[0].model_name, "text-emb-a");
}

#[tokio::test]
async fn end_to_end_storage_error_marks_bypass() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST).path("/v1/embeddings");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"object":"list","data":[{"object":"embedding","index":0,"embedding":[0.5]}],"model":"text-emb-a"}"#);
    });

    let config = config_from_yaml(&format!(
        r#"
port: 8080
target_map:
  "/v1/embeddings": "{}"
"#,
        upstream.base_url()
    ));

    let storage = Arc::new(FakeStorage::new());
    storage.fail_gets();

    let handler = ProxyHandler::new(
        Arc::new(config),
        Some(Arc::clone(&storage) as Arc<dyn CacheStorage>),
    )
    .unwrap();
    let router = handler.router();

    let response = router
        .oneshot(request_with_peer(
            "POST",
            "/v1/embeddings",
            Body::from(r#"{"model":"text-emb-a","input":"hello"}"#),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(EMBEDDING_CACHE_HEADER).unwrap(),
        "BYPASS"
    );
    assert_eq!(mock.hits(), 1);
}
