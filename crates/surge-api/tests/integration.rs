use axum::Router;
use surge_api::app;
use surge_common::config::SurgeConfig;

async fn spawn_server() -> String {
    // Point upstream at a port nothing listens on so chat routes fail fast.
    let config = SurgeConfig { ollama_url: "http://127.0.0.1:1".into(), ..SurgeConfig::default() };
    let app: Router = app(config).unwrap();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}:{}", addr.ip(), addr.port())
}

#[tokio::test]
async fn health_and_metrics() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let r = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(r.status().is_success());
    assert_eq!(r.text().await.unwrap(), "ok");

    let r = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{base}/")).send().await.unwrap();
    let body: serde_json::Value = r.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("running"));
}

#[tokio::test]
async fn chat_without_upstream_is_service_unavailable() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({"concurrency": 1, "message": "hi"});
    let r = client.post(format!("{base}/chat")).json(&body).send().await.unwrap();
    assert_eq!(r.status().as_u16(), 503);
    let detail: serde_json::Value = r.json().await.unwrap();
    assert!(detail["detail"].as_str().unwrap().contains("Ollama"));
}

#[tokio::test]
async fn stream_reports_upstream_errors_in_band() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({"concurrency": 1, "message": "hi"});
    let r = client.post(format!("{base}/chat/stream")).json(&body).send().await.unwrap();
    // SSE responses are 200 even when the run fails; the error rides in-band.
    assert!(r.status().is_success());
    let text = r.text().await.unwrap();
    assert!(text.contains("\"type\":\"status\""));
    assert!(text.contains("\"type\":\"error\""));
}
