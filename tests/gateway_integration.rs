//! End-to-end tests: upstream server → prefetch pool → store → REST
//! surface, served through the draining listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;

use content_gateway::config::{PoolConfig, ShutdownConfig, UpstreamConfig};
use content_gateway::http::{AppState, routes};
use content_gateway::net::{ConnectionRegistry, StreamTimeouts};
use content_gateway::prefetch::{DataPrefetcher, HttpDataSource};
use content_gateway::shutdown::{ShutdownController, ShutdownState};
use content_gateway::store::{KvBufferStore, LibSqlKvStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream that serves `data:<id>` and counts hits.
async fn start_upstream() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/raw/{id}",
        get(move |Path(id): Path<String>| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if id.starts_with("gone") {
                    Err(StatusCode::NOT_FOUND)
                } else {
                    Ok(format!("data:{id}"))
                }
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

struct Gateway {
    addr: SocketAddr,
    controller: ShutdownController,
    prefetcher: DataPrefetcher,
    store: Arc<dyn KvBufferStore>,
    upstream_hits: Arc<AtomicUsize>,
}

async fn start_gateway() -> Gateway {
    let (base_url, upstream_hits) = start_upstream().await;

    let store: Arc<dyn KvBufferStore> = Arc::new(LibSqlKvStore::new_memory().await.unwrap());
    let source = Arc::new(HttpDataSource::new(&UpstreamConfig {
        base_url,
        request_timeout: Duration::from_secs(5),
    }));
    let prefetcher = DataPrefetcher::new(
        PoolConfig {
            worker_count: 2,
            tasks_per_worker: 2,
            shutdown_timeout: Duration::from_secs(2),
        },
        source,
        Arc::clone(&store),
    );

    let controller = ShutdownController::new(
        ShutdownConfig {
            timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(20),
            ..ShutdownConfig::default()
        },
        StreamTimeouts {
            keep_alive: Duration::from_secs(60),
            headers: Duration::from_secs(60),
        },
        ConnectionRegistry::new(),
    );
    let addr = controller
        .bind("127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();

    let app = routes(AppState {
        store: Arc::clone(&store),
        prefetcher: prefetcher.clone(),
        shutdown: controller.clone(),
        started_at: Instant::now(),
    });
    let serving = controller.clone();
    tokio::spawn(async move { serving.serve(app).await });

    Gateway {
        addr,
        controller,
        prefetcher,
        store,
        upstream_hits,
    }
}

// ── Data path ───────────────────────────────────────────────────────

#[tokio::test]
async fn raw_miss_then_hit() {
    timeout(TEST_TIMEOUT, async {
        let gw = start_gateway().await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/raw/item-1", gw.addr);

        let first = client.get(&url).send().await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert_eq!(first.text().await.unwrap(), "data:item-1");

        let second = client.get(&url).send().await.unwrap();
        assert_eq!(second.headers()["x-cache"], "HIT");
        assert_eq!(second.text().await.unwrap(), "data:item-1");

        assert_eq!(gw.upstream_hits.load(Ordering::SeqCst), 1);
        gw.controller.shutdown("test").await;
        gw.prefetcher.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn upstream_404_is_bad_gateway() {
    timeout(TEST_TIMEOUT, async {
        let gw = start_gateway().await;
        let resp = reqwest::get(format!("http://{}/raw/gone-1", gw.addr))
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        let json: Value = resp.json().await.unwrap();
        assert!(json["error"].as_str().unwrap().contains("404"));
        assert!(!gw.store.has("gone-1").await.unwrap());
        gw.controller.shutdown("test").await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn queued_prefetches_are_stored() {
    timeout(TEST_TIMEOUT, async {
        let gw = start_gateway().await;
        let client = reqwest::Client::new();

        for i in 0..6 {
            let resp = client
                .post(format!("http://{}/prefetch/batch-{i}", gw.addr))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 202);
        }

        for i in 0..6 {
            let key = format!("batch-{i}");
            while !gw.store.has(&key).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(
                gw.store.get(&key).await.unwrap(),
                Some(format!("data:{key}").into_bytes())
            );
        }
        gw.controller.shutdown("test").await;
    })
    .await
    .expect("test timed out");
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn healthcheck_tracks_shutdown_state() {
    timeout(TEST_TIMEOUT, async {
        let gw = start_gateway().await;

        let json: Value = reqwest::get(format!("http://{}/healthcheck", gw.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["shutdown"], "running");
        assert!(json["connections"].as_u64().unwrap() >= 1);

        gw.controller.shutdown("test").await;
        assert_eq!(gw.controller.state(), ShutdownState::Closed);
        assert!(
            reqwest::get(format!("http://{}/healthcheck", gw.addr))
                .await
                .is_err()
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn prefetch_rejected_once_pool_is_closed() {
    timeout(TEST_TIMEOUT, async {
        let gw = start_gateway().await;
        gw.prefetcher.shutdown().await;

        let resp = reqwest::get(format!("http://{}/raw/late-1", gw.addr))
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(gw.upstream_hits.load(Ordering::SeqCst), 0);
        gw.controller.shutdown("test").await;
    })
    .await
    .expect("test timed out");
}
