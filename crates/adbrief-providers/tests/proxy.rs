mod fixtures;

use adbrief_providers::proxy::{AuthProxy, ProxyConfig};
use serde_json::Value;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn target(server: &MockServer) -> Url {
    Url::parse(&server.uri()).unwrap()
}

#[tokio::test]
async fn translates_key_header_and_passes_429_through() {
    let upstream = MockServer::start().await;
    let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("authorization", "Bearer sk-123"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = AuthProxy::new(ProxyConfig::default());
    let local = proxy.start(target(&upstream)).await.unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{local}v1/messages"))
        .header("x-api-key", "sk-123")
        .body(r#"{"model":"m"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 429);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "7");
    assert_eq!(resp.text().await.unwrap(), body);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].headers.get("x-api-key").is_none());
    assert_eq!(received[0].body, br#"{"model":"m"}"#);

    proxy.shutdown().await;
}

#[tokio::test]
async fn streams_sse_body_unchanged() {
    let upstream = MockServer::start().await;
    let sse = fixtures::multi_chunk_text_sse(&["Hello", " world"]);
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(fixtures::sse_response(&sse))
        .mount(&upstream)
        .await;

    let proxy = AuthProxy::new(ProxyConfig::default());
    let local = proxy.start(target(&upstream)).await.unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{local}v1/messages"))
        .header("x-api-key", "sk-1")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.text().await.unwrap(), sse);
}

#[tokio::test]
async fn unreachable_upstream_yields_502_json() {
    // Bind then drop a listener to get a port nobody is serving.
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = AuthProxy::new(ProxyConfig::default());
    let local = proxy
        .start(Url::parse(&format!("http://{closed}")).unwrap())
        .await
        .unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{local}v1/messages"))
        .header("x-api-key", "sk-1")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "proxy_upstream_error");
}

#[tokio::test]
async fn update_target_redirects_next_request() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for (server, name) in [(&first, "first"), (&second, "second")] {
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string(name))
            .expect(1)
            .mount(server)
            .await;
    }

    let proxy = AuthProxy::new(ProxyConfig::default());
    let local = proxy.start(target(&first)).await.unwrap();
    let client = reqwest::Client::new();

    let body = client
        .get(format!("{local}ping"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "first");

    proxy.update_target(target(&second));
    let body = client
        .get(format!("{local}ping"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "second");
    assert_eq!(proxy.local_url().await, Some(local));
}

#[tokio::test]
async fn configured_key_used_when_request_has_none() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .and(header("authorization", "Token sk-config"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = AuthProxy::new(ProxyConfig {
        auth_scheme: "Token".to_string(),
        fallback_api_key: Some("sk-config".to_string()),
        ..ProxyConfig::default()
    });
    let local = proxy.start(target(&upstream)).await.unwrap();

    let resp = reqwest::get(format!("{local}v1/models")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}
