// crates/memvault-gateway/tests/gateway.rs
// End-to-end tests: a real vault listener on a temp socket, an in-memory store

#![cfg(unix)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use memvault_gateway::api::{self, AppState};
use memvault_gateway::auth::{Caller, Principal, TokenValidator};
use memvault_gateway::db::DatabasePool;
use memvault_gateway::embeddings::HashEmbedder;
use memvault_gateway::vault_client::{VaultClient, VaultClientConfig, VaultClientError};
use memvault_gateway::{GatewayError, MemoryService};
use memvault_types::{
    MemoryFilter, RotateKeyResponse, SearchMemoriesRequest, StoreMemoryRequest,
};
use memvault_vault::ipc::{VaultState, run_listener};
use memvault_vault::keystore::{KeyStore, MemoryKeyStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tower::ServiceExt;

const DIMS: usize = 4;

struct Vault {
    _dir: tempfile::TempDir,
    path: PathBuf,
    store: Arc<MemoryKeyStore>,
    stop: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Vault {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.sock");
        let store = Arc::new(MemoryKeyStore::new());
        let (stop, handle) = listen(&path, store.clone()).await;
        Self {
            _dir: dir,
            path,
            store,
            stop: Some(stop),
            handle,
        }
    }

    async fn restart(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.handle).await.unwrap().unwrap();
        let (stop, handle) = listen(&self.path, self.store.clone()).await;
        self.stop = Some(stop);
        self.handle = handle;
    }
}

async fn listen(
    path: &Path,
    store: Arc<MemoryKeyStore>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let state = VaultState::new(store, Duration::from_secs(5));
    let (stop, stopped) = oneshot::channel::<()>();
    let listen_path = path.to_path_buf();
    let handle = tokio::spawn(async move {
        run_listener(state, &listen_path, 8, async {
            let _ = stopped.await;
        })
        .await
    });

    for _ in 0..200 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    (stop, handle)
}

fn fast_client_config() -> VaultClientConfig {
    VaultClientConfig {
        io_timeout: Duration::from_millis(500),
        call_timeout: Duration::from_secs(3),
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

struct Harness {
    vault: Vault,
    pool: Arc<DatabasePool>,
    service: Arc<MemoryService>,
}

async fn harness() -> Harness {
    let vault = Vault::start().await;
    let pool = Arc::new(DatabasePool::open_in_memory(DIMS).await.unwrap());
    let client = Arc::new(VaultClient::new(&vault.path, fast_client_config()));
    let service = Arc::new(MemoryService::new(
        pool.clone(),
        client,
        Arc::new(HashEmbedder::new(DIMS)),
        Default::default(),
    ));
    Harness {
        vault,
        pool,
        service,
    }
}

fn store_req(content: &str, embedding: Vec<f32>, user: &str) -> StoreMemoryRequest {
    StoreMemoryRequest {
        content: content.into(),
        metadata: HashMap::from([("user_id".to_string(), user.to_string())]),
        tags: vec![],
        embedding: Some(embedding),
    }
}

fn search_req(embedding: Vec<f32>, limit: usize, threshold: f32) -> SearchMemoriesRequest {
    SearchMemoriesRequest {
        query_embedding: embedding,
        limit: Some(limit),
        similarity_threshold: Some(threshold),
        filters: MemoryFilter::default(),
    }
}

fn user(subject: &str) -> Caller {
    Caller(Some(Principal {
        subject: subject.into(),
        role: Some("authenticated".into()),
        admin: false,
    }))
}

// ═══════════════════════════════════════
// Service pipeline
// ═══════════════════════════════════════

#[tokio::test]
async fn store_then_search_decrypts_and_stores_ciphertext_only() {
    let h = harness().await;
    let anon = Caller(None);
    let embedding = vec![0.1, 0.2, 0.3, 0.4];

    let stored = h
        .service
        .store(&anon, store_req("hello world", embedding.clone(), "u1"))
        .await
        .unwrap();
    assert!(stored.success);

    let resp = h
        .service
        .search(&anon, search_req(embedding, 5, 0.7))
        .await
        .unwrap();
    assert_eq!(resp.matches.len(), 1);
    let hit = &resp.matches[0];
    assert_eq!(hit.memory.id, stored.memory_id);
    assert_eq!(hit.memory.content, "hello world");
    assert_eq!(hit.memory.metadata.get("user_id").map(String::as_str), Some("u1"));
    assert!(hit.similarity_score > 0.999);

    let id = stored.memory_id.clone();
    let (ciphertext, key_id): (Vec<u8>, String) = h
        .pool
        .run(move |conn| {
            conn.query_row(
                "SELECT ciphertext, key_id FROM memories WHERE id = ?1",
                [&id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })
        .await
        .unwrap();
    assert!(!ciphertext.windows(11).any(|w| w == b"hello world"));
    assert_eq!(key_id, "memvault.u1.v1");
    assert!(h.vault.store.exists(&key_id));
}

#[tokio::test]
async fn search_ranks_filters_by_threshold_and_limits() {
    let h = harness().await;
    let anon = Caller(None);
    for (content, e) in [
        ("exact", vec![1.0, 0.0, 0.0, 0.0]),
        ("close", vec![0.8, 0.6, 0.0, 0.0]),
        ("orthogonal", vec![0.0, 1.0, 0.0, 0.0]),
    ] {
        h.service.store(&anon, store_req(content, e, "u1")).await.unwrap();
    }
    let query = vec![1.0, 0.0, 0.0, 0.0];

    let resp = h.service.search(&anon, search_req(query.clone(), 10, 0.5)).await.unwrap();
    let contents: Vec<_> = resp.matches.iter().map(|m| m.memory.content.as_str()).collect();
    assert_eq!(contents, ["exact", "close"]);
    assert!(resp.matches[0].similarity_score >= resp.matches[1].similarity_score);

    let resp = h.service.search(&anon, search_req(query.clone(), 1, 0.5)).await.unwrap();
    assert_eq!(resp.matches.len(), 1);
    assert_eq!(resp.matches[0].memory.content, "exact");

    let diagonal = vec![1.0, 1.0, 0.0, 0.0];
    let resp = h.service.search(&anon, search_req(diagonal, 10, 0.5)).await.unwrap();
    let contents: Vec<_> = resp.matches.iter().map(|m| m.memory.content.as_str()).collect();
    assert_eq!(contents.len(), 3);
    assert_eq!(contents[0], "close");

    let err = h.service.search(&anon, search_req(query, 10, 1.5)).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[tokio::test]
async fn invalid_inputs_rejected() {
    let h = harness().await;
    let anon = Caller(None);

    let err = h.service.store(&anon, store_req("   ", vec![1.0; DIMS], "u1")).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));

    let err = h.service.store(&anon, store_req("x", vec![1.0; DIMS + 1], "u1")).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));

    let err = h.service.store(&anon, store_req("x", vec![0.0; DIMS], "u1")).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));

    let mut bad_filter = search_req(vec![1.0; DIMS], 10, 0.5);
    bad_filter.filters.metadata.insert("a\"b".into(), "x".into());
    let err = h.service.search(&anon, bad_filter).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));

    let err = h.service.recent(&anon, Some(0)).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidArgument(_)));
}

#[tokio::test]
async fn computed_embedding_used_when_absent() {
    let h = harness().await;
    let anon = Caller(None);
    let mut req = store_req("the cat sat", vec![], "u1");
    req.embedding = None;
    req.tags = vec!["test".into()];
    let id = h.service.store(&anon, req).await.unwrap().memory_id;

    let memory = h.service.get(&anon, &id).await.unwrap();
    assert_eq!(memory.content, "the cat sat");
    assert_eq!(memory.tags, ["test"]);

    let query = HashEmbedder::new(DIMS).embed_sync("the cat sat");
    let resp = h.service.search(&anon, search_req(query, 5, 0.9)).await.unwrap();
    assert_eq!(resp.matches.len(), 1);
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let h = harness().await;
    let anon = Caller(None);

    let err = h.service.delete(&anon, "no-such-id").await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)));

    let id = h
        .service
        .store(&anon, store_req("to forget", vec![1.0, 0.0, 0.0, 0.0], "u1"))
        .await
        .unwrap()
        .memory_id;
    assert!(h.service.delete(&anon, &id).await.unwrap().success);
    assert!(matches!(
        h.service.get(&anon, &id).await.unwrap_err(),
        GatewayError::NotFound(_)
    ));
    assert!(matches!(
        h.service.delete(&anon, &id).await.unwrap_err(),
        GatewayError::NotFound(_)
    ));
}

#[tokio::test]
async fn recent_and_query_newest_first() {
    let h = harness().await;
    let anon = Caller(None);
    for (i, content) in ["first", "second", "third"].into_iter().enumerate() {
        let mut req = store_req(content, vec![1.0, i as f32, 0.0, 0.0], "u1");
        req.tags = if i == 1 { vec!["keep".into()] } else { vec![] };
        h.service.store(&anon, req).await.unwrap();
    }

    let recent = h.service.recent(&anon, Some(2)).await.unwrap();
    assert_eq!(recent.total_count, 2);
    assert_eq!(recent.memories[0].content, "third");

    let tagged = h
        .service
        .query(
            &anon,
            MemoryFilter {
                tags: vec!["keep".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(tagged.total_count, 1);
    assert_eq!(tagged.memories[0].content, "second");
}

#[tokio::test]
async fn principals_only_see_their_own_records() {
    let h = harness().await;
    let alice = user("alice");
    let bob = user("bob");

    let id = h
        .service
        .store(&alice, store_req("alice's note", vec![1.0, 0.0, 0.0, 0.0], "ignored"))
        .await
        .unwrap()
        .memory_id;

    assert_eq!(h.service.get(&alice, &id).await.unwrap().content, "alice's note");
    assert!(matches!(
        h.service.get(&bob, &id).await.unwrap_err(),
        GatewayError::NotFound(_)
    ));
    assert!(matches!(
        h.service.delete(&bob, &id).await.unwrap_err(),
        GatewayError::NotFound(_)
    ));
    let found = h
        .service
        .search(&bob, search_req(vec![1.0, 0.0, 0.0, 0.0], 10, 0.0))
        .await
        .unwrap();
    assert!(found.matches.is_empty());

    // Authenticated subject wins over user_id metadata for the key scope
    let keys = h.service.keys().list(Some("alice")).await.unwrap();
    assert_eq!(keys.len(), 1);

    let err = h.service.rotate(&alice, "alice", false).await.unwrap_err();
    assert!(matches!(err, GatewayError::PermissionDenied(_)));
}

#[tokio::test]
async fn rotation_keeps_old_records_readable_and_reencrypts() {
    let h = harness().await;
    let anon = Caller(None);
    let id = h
        .service
        .store(&anon, store_req("before rotation", vec![1.0, 0.0, 0.0, 0.0], "u1"))
        .await
        .unwrap()
        .memory_id;

    let RotateKeyResponse {
        key_id,
        version,
        retired_key_id,
        reencrypted,
        ..
    } = h.service.rotate(&anon, "u1", false).await.unwrap();
    assert_eq!(key_id, "memvault.u1.v2");
    assert_eq!(version, 2);
    assert_eq!(retired_key_id.as_deref(), Some("memvault.u1.v1"));
    assert_eq!(reencrypted, 0);

    // Retired key stays in the vault, so the old record still opens
    assert!(h.vault.store.exists("memvault.u1.v1"));
    assert_eq!(h.service.get(&anon, &id).await.unwrap().content, "before rotation");

    // New writes use the new key
    let newer = h
        .service
        .store(&anon, store_req("after rotation", vec![0.0, 1.0, 0.0, 0.0], "u1"))
        .await
        .unwrap()
        .memory_id;

    assert_eq!(h.service.reencrypt(&anon, "u1").await.unwrap(), 1);
    assert_eq!(h.service.reencrypt(&anon, "u1").await.unwrap(), 0);

    let key_ids: Vec<String> = h
        .pool
        .run(|conn| {
            let mut stmt = conn.prepare("SELECT key_id FROM memories ORDER BY seq")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })
        .await
        .unwrap();
    assert_eq!(key_ids, ["memvault.u1.v2", "memvault.u1.v2"]);
    assert_eq!(h.service.get(&anon, &id).await.unwrap().content, "before rotation");
    assert_eq!(h.service.get(&anon, &newer).await.unwrap().content, "after rotation");

    let keys = h.service.keys().list(Some("u1")).await.unwrap();
    assert_eq!(keys.iter().filter(|k| k.active).count(), 1);
}

#[tokio::test]
async fn reencryption_does_not_stall_other_requests() {
    let h = harness().await;
    let anon = Caller(None);
    let big = "m".repeat(2 * 1024 * 1024);
    for i in 0..6 {
        let e = vec![1.0, i as f32, 0.0, 0.0];
        h.service.store(&anon, store_req(&big, e, "u1")).await.unwrap();
    }
    h.service.rotate(&anon, "u1", false).await.unwrap();

    let (moved, health) = tokio::join!(
        h.service.reencrypt(&anon, "u1"),
        tokio::time::timeout(Duration::from_secs(2), h.service.health()),
    );
    assert_eq!(moved.unwrap(), 6);
    let health = health.expect("health stalled behind re-encryption");
    assert!(health.vault);
}

#[tokio::test]
async fn missing_vault_key_is_internal_error() {
    let h = harness().await;
    let anon = Caller(None);
    let id = h
        .service
        .store(&anon, store_req("orphaned", vec![1.0, 0.0, 0.0, 0.0], "u1"))
        .await
        .unwrap()
        .memory_id;
    h.vault.store.delete("memvault.u1.v1").unwrap();

    let err = h.service.get(&anon, &id).await.unwrap_err();
    assert!(matches!(err, GatewayError::Internal(_)));
}

#[tokio::test]
async fn patch_replaces_tags_and_keeps_content() {
    let h = harness().await;
    let anon = Caller(None);
    let id = h
        .service
        .store(&anon, store_req("patched", vec![1.0, 0.0, 0.0, 0.0], "u1"))
        .await
        .unwrap()
        .memory_id;

    let updated = h
        .service
        .patch(
            &anon,
            &id,
            memvault_types::PatchMemoryRequest {
                metadata: None,
                tags: Some(vec!["a".into(), "b".into(), "a".into()]),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.content, "patched");
    assert_eq!(updated.tags, ["a", "b"]);
    assert_eq!(updated.metadata.get("user_id").map(String::as_str), Some("u1"));
}

#[tokio::test]
async fn health_reports_vault_state() {
    let h = harness().await;
    let health = h.service.health().await;
    assert!(health.vault);
    assert_eq!(health.status, "ok");

    let missing = h.vault.path.with_file_name("missing.sock");
    let detached = MemoryService::new(
        h.pool.clone(),
        Arc::new(VaultClient::new(missing, fast_client_config())),
        Arc::new(HashEmbedder::new(DIMS)),
        Default::default(),
    );
    let health = detached.health().await;
    assert!(!health.vault);
    assert_eq!(health.status, "degraded");
}

// ═══════════════════════════════════════
// Vault client transport
// ═══════════════════════════════════════

#[tokio::test]
async fn client_reconnects_after_daemon_restart() {
    let mut vault = Vault::start().await;
    let client = VaultClient::new(&vault.path, fast_client_config());
    client.ping().await.unwrap();

    vault.restart().await;
    client.ping().await.unwrap();
    assert!(client.list_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_daemon_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stalled.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let client = VaultClient::new(
        &path,
        VaultClientConfig {
            io_timeout: Duration::from_millis(50),
            call_timeout: Duration::from_millis(400),
            max_retries: 1,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
    );
    let started = std::time::Instant::now();
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, VaultClientError::Timeout(_)));
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ═══════════════════════════════════════
// HTTP surface
// ═══════════════════════════════════════

struct StubValidator;

#[async_trait]
impl TokenValidator for StubValidator {
    async fn validate(&self, token: &str) -> memvault_gateway::Result<Principal> {
        match token {
            "user-token" => Ok(Principal {
                subject: "u1".into(),
                role: Some("authenticated".into()),
                admin: false,
            }),
            "admin-token" => Ok(Principal {
                subject: "root".into(),
                role: Some("admin".into()),
                admin: true,
            }),
            _ => Err(GatewayError::Unauthenticated("unknown token".into())),
        }
    }
}

fn app(h: &Harness) -> axum::Router {
    api::router(Arc::new(AppState {
        service: h.service.clone(),
        validator: Some(Arc::new(StubValidator)),
        default_timeout: Duration::from_secs(10),
        max_timeout: Duration::from_secs(30),
    }))
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn http_requires_bearer_token() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(&app, request("GET", "/v1/memories/recent", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");
    assert_eq!(body["error"]["retryable"], false);

    let (status, _) = send(&app, request("GET", "/v1/memories/recent", Some("forged"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["vault"], true);
}

#[tokio::test]
async fn http_store_get_and_delete() {
    let h = harness().await;
    let app = app(&h);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/v1/memories",
            Some("user-token"),
            Some(serde_json::json!({
                "content": "remember the milk",
                "tags": ["errand"],
                "embedding": [0.5, 0.5, 0.5, 0.5]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["memory_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, request("GET", &format!("/v1/memories/{id}"), Some("user-token"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "remember the milk");

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/v1/memories/search",
            Some("user-token"),
            Some(serde_json::json!({ "query_embedding": [0.5, 0.5, 0.5, 0.5] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matches"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, request("DELETE", &format!("/v1/memories/{id}"), Some("user-token"), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request("DELETE", &format!("/v1/memories/{id}"), Some("user-token"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn http_rejects_malformed_body() {
    let h = harness().await;
    let app = app(&h);
    let req = Request::builder()
        .method("POST")
        .uri("/v1/memories")
        .header(header::AUTHORIZATION, "Bearer user-token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_argument");
}

#[tokio::test]
async fn http_rotation_is_admin_only() {
    let h = harness().await;
    let app = app(&h);
    let body = serde_json::json!({ "scope": "u1" });

    let (status, resp) = send(&app, request("POST", "/v1/admin/keys/rotate", Some("user-token"), Some(body.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(resp["error"]["code"], "permission_denied");

    let (status, resp) = send(&app, request("POST", "/v1/admin/keys/rotate", Some("admin-token"), Some(body))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["key_id"], "memvault.u1.v1");
    assert_eq!(resp["version"], 1);
}

#[tokio::test]
async fn http_vault_down_is_unavailable() {
    let mut h = harness().await;
    let app = app(&h);
    if let Some(stop) = h.vault.stop.take() {
        let _ = stop.send(());
    }
    (&mut h.vault.handle).await.unwrap().unwrap();

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/v1/memories",
            Some("user-token"),
            Some(serde_json::json!({ "content": "x", "embedding": [1.0, 0.0, 0.0, 0.0] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "connection_failure");
    assert_eq!(body["error"]["retryable"], true);
}
