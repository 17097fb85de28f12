use meshsync_cli::{build_router, StatusResponse};
use meshsync_node::{MemoryNetwork, MeshConfig, MeshNode};
use std::sync::Arc;
use std::time::Duration;

fn node(network: &MemoryNetwork) -> MeshNode {
    MeshNode::new(Arc::new(network.transport()), MeshConfig::default())
}

/// Spin up the HTTP server on an OS-assigned port, returning the base URL.
async fn spawn_test_server(node: MeshNode) -> String {
    let app = build_router(node);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}", port)
}

async fn fetch_status(base: &str) -> StatusResponse {
    reqwest::get(format!("{}/api/v1/status", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn status_of_closed_node() {
    let network = MemoryNetwork::new();
    let base = spawn_test_server(node(&network)).await;

    let status = fetch_status(&base).await;
    assert!(!status.open);
    assert_eq!(status.identity, None);
    assert!(status.links.is_empty());
    assert!(status.vars.is_empty());
    assert_eq!(status.last_event, None);
}

#[tokio::test]
async fn status_reports_links_vars_and_events() {
    let network = MemoryNetwork::new();
    let alice = node(&network);
    let bob = node(&network);
    alice.open("alice").await.unwrap();
    bob.open("bob").await.unwrap();
    alice.connect("bob").await.unwrap();
    alice.set_var("score", "10").await.unwrap();
    alice.dispatch_event("move", "left").await.unwrap();

    let base = spawn_test_server(alice.clone()).await;
    let status = fetch_status(&base).await;

    assert!(status.open);
    assert_eq!(status.identity.as_deref(), Some("alice"));
    assert_eq!(status.links.len(), 1);
    assert_eq!(status.links[0].remote, "bob");
    assert_eq!(status.links[0].role, "initiator");
    assert_eq!(status.links[0].state, "open");
    assert_eq!(status.vars.get("score").map(String::as_str), Some("10"));

    let event = status.last_event.unwrap();
    assert_eq!(event.sender, "alice");
    assert_eq!(event.event_type, "move");
    assert_eq!(event.payload, "left");
}

#[tokio::test]
async fn status_follows_remote_changes() {
    let network = MemoryNetwork::new();
    let alice = node(&network);
    let bob = node(&network);
    alice.open("alice").await.unwrap();
    bob.open("bob").await.unwrap();
    bob.connect("alice").await.unwrap();

    let base = spawn_test_server(alice).await;
    bob.set_var("color", "blue").await.unwrap();

    let mut seen = false;
    for _ in 0..100 {
        let status = fetch_status(&base).await;
        if status.vars.get("color").map(String::as_str) == Some("blue") {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen);
}

#[tokio::test]
async fn status_content_type_is_json() {
    let network = MemoryNetwork::new();
    let base = spawn_test_server(node(&network)).await;
    let resp = reqwest::get(format!("{}/api/v1/status", base))
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.contains("application/json"));
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let network = MemoryNetwork::new();
    let base = spawn_test_server(node(&network)).await;
    let resp = reqwest::get(format!("{}/api/v1/nonexistent", base))
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
}
