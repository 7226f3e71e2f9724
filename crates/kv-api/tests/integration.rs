use axum::Router;
use kv_api::app;

#[tokio::test]
async fn metrics_generate_and_sse_roundtrip() {
    // No real model directory is needed for the mock backend; point
    // `model_dir` at one that's guaranteed to exist so config validation
    // (which requires it) doesn't fail the test on account of a directory
    // this repo's non-goals don't ask it to load anything from.
    std::env::set_var("KV_MODEL_DIR", ".");
    let app: Router = app();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = tokio::spawn(async move { axum::serve(listener, app).await.unwrap(); });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();

    let r = client.get(format!("{}/metrics", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let r = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert!(r.status().is_success());

    let body = serde_json::json!({"prompt": "hi", "max_tokens": 4});
    let r = client.post(format!("{}/generate", base)).json(&body).send().await.unwrap();
    assert!(r.status().is_success());
    let parsed: serde_json::Value = r.json().await.unwrap();
    assert_eq!(parsed["completion_tokens"], 4);

    let r = client.get(format!("{}/sse/generate", base)).json(&body).send().await.unwrap();
    assert!(r.status().is_success());

    srv.abort();
}
