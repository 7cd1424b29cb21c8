//! Engine integration tests over the in-memory transport pair
//!
//! Exercises the full engine-to-engine path: correlation, built-ins,
//! progress routing, cancellation, timeouts, capability gating, the
//! initialization handshake, and close semantics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tether_mcp::engine::{EngineError, EngineOptions, ProtocolEngine, RequestOptions, ServerIdentity};
use tether_mcp::protocol::{
    ClientCapabilities, Implementation, McpError, ServerCapabilities, ToolsCapability,
};
use tether_mcp::transport::in_memory::InMemoryTransport;

type InMemoryEngine = ProtocolEngine<InMemoryTransport>;

/// Connect two engines over a fresh in-memory pair
async fn connected_pair(
    server_builder: tether_mcp::engine::EngineBuilder,
) -> (InMemoryEngine, InMemoryEngine) {
    let (client_end, server_end) = InMemoryTransport::pair();
    let server = server_builder
        .connect(server_end, EngineOptions::default())
        .await
        .expect("server engine connects");
    let client = InMemoryEngine::builder()
        .connect(client_end, EngineOptions::default())
        .await
        .expect("client engine connects");
    (client, server)
}

#[tokio::test]
async fn request_resolves_with_the_handler_result() {
    let (client, server) = connected_pair(InMemoryEngine::builder().request_handler_fn(
        "echo",
        |request, _cx| async move { Ok(request.params.unwrap_or(Value::Null)) },
    ))
    .await;

    let reply = client
        .request("echo", Some(json!({"text": "hi"})), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, json!({"text": "hi"}));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let (client, server) = connected_pair(InMemoryEngine::builder()).await;

    let error = client
        .request("no/such/method", None, RequestOptions::default())
        .await
        .unwrap_err();
    match error {
        EngineError::Protocol(mcp) => assert_eq!(mcp.code, -32601),
        other => panic!("expected protocol error, got {other}"),
    }

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn ping_is_answered_without_any_registered_handler() {
    let (client, server) = connected_pair(InMemoryEngine::builder()).await;

    let reply = client
        .request("ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, json!({}));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn handler_errors_become_error_responses_with_their_code() {
    let (client, server) =
        connected_pair(InMemoryEngine::builder().request_handler_fn(
            "fails",
            |_request, _cx| async move {
                Err::<Value, _>(McpError::new(-32042, "deliberate failure", None))
            },
        ))
        .await;

    let error = client
        .request("fails", None, RequestOptions::default())
        .await
        .unwrap_err();
    match error {
        EngineError::Protocol(mcp) => {
            assert_eq!(mcp.code, -32042);
            assert_eq!(mcp.message, "deliberate failure");
        }
        other => panic!("expected protocol error, got {other}"),
    }

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn progress_notifications_reach_the_callback_before_the_result() {
    // The handler needs an engine handle to emit progress; it is filled in
    // after connect.
    static SERVER_ENGINE: OnceLock<InMemoryEngine> = OnceLock::new();

    let (client, server) = connected_pair(InMemoryEngine::builder().request_handler_fn(
        "tools/call",
        |request, cx| async move {
            let engine = SERVER_ENGINE.get().expect("engine installed");
            let token = request
                .progress_token()
                .cloned()
                .expect("progress token attached");
            for step in 1..=3 {
                engine
                    .notify_progress(
                        token.clone(),
                        step as f64,
                        Some(3.0),
                        cx.request_id.clone(),
                    )
                    .await
                    .unwrap();
            }
            Ok(json!({"done": true}))
        },
    ))
    .await;
    let _ = SERVER_ENGINE.set(server.clone());

    let progress_seen = Arc::new(Mutex::new(Vec::new()));
    let progress_record = Arc::clone(&progress_seen);
    let options = RequestOptions::default().on_progress(move |params| {
        progress_record.lock().unwrap().push(params.progress);
    });

    let reply = client
        .request(
            "tools/call",
            Some(json!({"name": "run-notifications"})),
            options,
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"done": true}));
    assert_eq!(progress_seen.lock().unwrap().clone(), vec![1.0, 2.0, 3.0]);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn cancellation_aborts_the_server_handler_and_rejects_locally() {
    let handler_started = Arc::new(AtomicBool::new(false));
    let handler_finished = Arc::new(AtomicBool::new(false));
    let started = Arc::clone(&handler_started);
    let finished = Arc::clone(&handler_finished);

    let (client, server) = connected_pair(InMemoryEngine::builder().request_handler_fn(
        "slow",
        move |_request, _cx| {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            async move {
                started.store(true, Ordering::Release);
                tokio::time::sleep(Duration::from_secs(30)).await;
                finished.store(true, Ordering::Release);
                Ok(json!({}))
            }
        },
    ))
    .await;

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let error = client
        .request(
            "slow",
            None,
            RequestOptions::default().cancellation(token, Some("user".to_string())),
        )
        .await
        .unwrap_err();
    match error {
        EngineError::Cancelled { reason } => assert_eq!(reason.as_deref(), Some("user")),
        other => panic!("expected cancellation, got {other}"),
    }

    // Give the cancellation notification time to abort the handler.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handler_started.load(Ordering::Acquire));
    assert!(
        !handler_finished.load(Ordering::Acquire),
        "handler must be aborted, not run to completion"
    );

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn timeout_rejects_the_waiter() {
    let (client, server) = connected_pair(InMemoryEngine::builder().request_handler_fn(
        "slow",
        |_request, _cx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        },
    ))
    .await;

    let error = client
        .request(
            "slow",
            None,
            RequestOptions::default().timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::RequestTimeout { .. }));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn progress_resets_the_timeout_but_never_past_the_total_cap() {
    static SERVER_ENGINE: OnceLock<InMemoryEngine> = OnceLock::new();

    let (client, server) = connected_pair(InMemoryEngine::builder().request_handler_fn(
        "steady",
        |request, cx| async move {
            let engine = SERVER_ENGINE.get().expect("engine installed");
            let token = request.progress_token().cloned().expect("token");
            // Five ticks 40 ms apart: total 200 ms, each gap well under
            // the 100 ms per-tick timeout.
            for step in 1..=5 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                engine
                    .notify_progress(token.clone(), step as f64, None, cx.request_id.clone())
                    .await
                    .unwrap();
            }
            Ok(json!({"finished": true}))
        },
    ))
    .await;
    let _ = SERVER_ENGINE.set(server.clone());

    // Without resets this request would time out at 100 ms.
    let reply = client
        .request(
            "steady",
            None,
            RequestOptions::default()
                .timeout(Duration::from_millis(100))
                .reset_timeout_on_progress(true),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"finished": true}));

    // With a max total timeout the resets stop helping.
    let error = client
        .request(
            "steady",
            None,
            RequestOptions::default()
                .timeout(Duration::from_millis(100))
                .reset_timeout_on_progress(true)
                .max_total_timeout(Duration::from_millis(120)),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::RequestTimeout { .. }));

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn close_rejects_in_flight_requests_with_connection_closed() {
    let (client, server) = connected_pair(InMemoryEngine::builder().request_handler_fn(
        "never",
        |_request, _cx| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Value::Null)
        },
    ))
    .await;

    let request_task = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request("never", None, RequestOptions::default().no_timeout())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Closing the server closes both ends of the in-memory pair.
    server.close().await.unwrap();

    let outcome = request_task.await.unwrap();
    assert!(matches!(outcome, Err(EngineError::ConnectionClosed)));
    assert!(!client.is_connected());

    // Requests after close fail fast.
    let error = client
        .request("never", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::NotConnected));
}

#[tokio::test]
async fn strict_capability_gating_blocks_unadvertised_methods() {
    let (client_end, server_end) = InMemoryTransport::pair();
    let server = InMemoryEngine::builder()
        .connect(server_end, EngineOptions::default())
        .await
        .unwrap();
    let client = InMemoryEngine::builder()
        .connect(
            client_end,
            EngineOptions {
                strict_capabilities: true,
            },
        )
        .await
        .unwrap();

    client.set_peer_capabilities(json!({"resources": {}}));

    let error = client
        .request("tools/list", None, RequestOptions::default())
        .await
        .unwrap_err();
    match error {
        EngineError::Protocol(mcp) => assert_eq!(mcp.code, -32600),
        other => panic!("expected capability rejection, got {other}"),
    }

    // An advertised capability passes the gate (and then fails with
    // method-not-found, which proves the request actually went out).
    client.set_peer_capabilities(json!({"tools": {}}));
    let error = client
        .request("tools/list", None, RequestOptions::default())
        .await
        .unwrap_err();
    match error {
        EngineError::Protocol(mcp) => assert_eq!(mcp.code, -32601),
        other => panic!("expected method-not-found, got {other}"),
    }

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn handshake_negotiates_version_and_exchanges_capabilities() {
    let initialized_seen = Arc::new(AtomicUsize::new(0));
    let initialized_count = Arc::clone(&initialized_seen);

    let (client, server) = connected_pair(
        InMemoryEngine::builder()
            .server_identity(
                ServerIdentity::new("test-server", "0.1.0").capabilities(ServerCapabilities {
                    tools: Some(ToolsCapability {
                        list_changed: Some(false),
                    }),
                    ..Default::default()
                }),
            )
            .notification_handler_fn("notifications/initialized", move |_n, _cx| {
                let count = Arc::clone(&initialized_count);
                async move {
                    count.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
            }),
    )
    .await;

    let result = client
        .initialize(Implementation::new("t", "1"), ClientCapabilities::default())
        .await
        .unwrap();

    assert!(result.protocol_version.is_supported());
    assert_eq!(result.server_info.name, "test-server");
    assert!(client.peer_capabilities().unwrap()["tools"].is_object());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(initialized_seen.load(Ordering::Acquire), 1);
    // The server records the client's capabilities from the request.
    assert!(server.peer_capabilities().is_some());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn notifications_dispatch_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);

    let (client, server) = connected_pair(InMemoryEngine::builder().notification_handler_fn(
        "notifications/message",
        move |notification, _cx| {
            let record = Arc::clone(&record);
            async move {
                let label = notification
                    .params
                    .and_then(|p| p.get("label").cloned())
                    .and_then(|l| l.as_str().map(str::to_string))
                    .unwrap_or_default();
                record.lock().unwrap().push(label);
                Ok(())
            }
        },
    ))
    .await;

    for label in ["a", "b", "c", "d"] {
        client
            .notify("notifications/message", Some(json!({"label": label})))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        seen.lock().unwrap().clone(),
        vec!["a", "b", "c", "d"],
        "notification dispatch must preserve arrival order"
    );

    client.close().await.unwrap();
    server.close().await.unwrap();
}
