// End-to-end upload pipeline tests: buffer → ServerClient → mock server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gateway::store::UploadBuffer;
use gateway::sync::{drain_once, UploadTracker};
use server_api::{ServerClient, TokenManager};

async fn setup() -> (MockServer, ServerClient) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok",
            "token_type": "Bearer",
            "expires_in": 300
        })))
        .mount(&server)
        .await;
    let auth = TokenManager::new(
        format!("{}/token", server.uri()),
        "api-client".to_string(),
        "offline-refresh-token".to_string(),
    )
    .with_backoff(Duration::from_millis(10));
    let client = ServerClient::new(server.uri(), Arc::new(auth));
    (server, client)
}

fn buffer_with_samples(count: usize) -> Arc<UploadBuffer> {
    let buffer = Arc::new(UploadBuffer::new(1000, HashMap::new()));
    for i in 0..count {
        buffer.append(
            &HashMap::from([((3, "temperature".to_string()), 20.0 + i as f64)]),
            Utc::now(),
        );
    }
    buffer
}

#[tokio::test]
async fn outage_holds_samples_until_the_server_recovers() {
    let (server, client) = setup().await;

    // First upload attempt fails; the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/api/v1/timeseries/values"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/timeseries/values"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let buffer = buffer_with_samples(5);
    let tracker = UploadTracker::new();

    assert_eq!(drain_once(&client, &buffer, &tracker).await, 0);
    assert_eq!(buffer.len(), 5, "failed batch goes back into the buffer");

    assert_eq!(drain_once(&client, &buffer, &tracker).await, 5);
    assert!(buffer.is_empty());

    // Every sample arrived exactly once, in order, on the second attempt.
    let requests = server.received_requests().await.unwrap();
    let uploads: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/v1/timeseries/values")
        .collect();
    assert_eq!(uploads.len(), 2);
    let body: serde_json::Value = serde_json::from_slice(&uploads[1].body).unwrap();
    let values = body["timeseries"][0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 5);
    let sent: Vec<&str> = values.iter().map(|v| v["value"].as_str().unwrap()).collect();
    assert_eq!(sent, ["20.00", "21.00", "22.00", "23.00", "24.00"]);
}

#[tokio::test]
async fn empty_buffer_sends_nothing() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/timeseries/values"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(0)
        .mount(&server)
        .await;

    let buffer = Arc::new(UploadBuffer::new(1000, HashMap::new()));
    let tracker = UploadTracker::new();
    assert_eq!(drain_once(&client, &buffer, &tracker).await, 0);
}

#[tokio::test]
async fn rejected_streams_are_dropped_not_retried() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/timeseries/values"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "failures": [{"deviceId": 3, "timeseriesName": "temperature"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let buffer = buffer_with_samples(2);
    let tracker = UploadTracker::new();

    // The upload as a whole succeeded; the rejected stream is not held for
    // a retry that would fail identically.
    assert_eq!(drain_once(&client, &buffer, &tracker).await, 2);
    assert!(buffer.is_empty());
    assert!(tracker.since_last_success() < Duration::from_secs(1));
}
