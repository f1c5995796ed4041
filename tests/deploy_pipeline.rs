// Integration tests for the deploy pipeline against a mocked platform API

use base64::Engine;
use sandbox_edge::config::EdgeConfig;
use sandbox_edge::deploy::{run_deploy, DeployConfig, DeployOutcome, DeployRequest};
use sandbox_edge::error::DeployError;
use sandbox_edge::manifest::hash_asset;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACCOUNT: &str = "acct";
const SESSION_PATH: &str = "/accounts/acct/workers/scripts/site/assets-upload-session";
const UPLOAD_PATH: &str = "/accounts/acct/workers/assets/upload";
const SCRIPT_PATH: &str = "/accounts/acct/workers/scripts/site";

fn envelope(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "errors": [],
        "messages": [],
        "result": result
    }))
}

fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn two_file_request() -> (DeployRequest, String, String) {
    let index = b"<html>hi</html>".as_slice();
    let css = b"body { color: red }".as_slice();
    let index_hash = hash_asset(index);
    let css_hash = hash_asset(css);

    let request: DeployRequest = serde_json::from_value(json!({
        "wranglerConfig": {
            "name": "site",
            "compatibility_date": "2025-01-01",
            "assets": { "directory": "dist", "binding": "ASSETS" }
        },
        "workerContent": "export default { fetch() { return new Response('ok') } }",
        "assetsManifest": {
            "/index.html": { "hash": index_hash, "size": index.len() },
            "/style.css": { "hash": css_hash, "size": css.len() }
        },
        "files": {
            "/index.html": encode(index),
            "/style.css": encode(css)
        },
        "accountId": ACCOUNT,
        "apiToken": "api-token"
    }))
    .unwrap();
    (request, index_hash, css_hash)
}

async fn deploy(server: &MockServer, request: DeployRequest) -> Result<DeployOutcome, DeployError> {
    let deploy = DeployConfig::from_request(request, &EdgeConfig::default())?;
    run_deploy(&reqwest::Client::new(), &server.uri(), deploy).await
}

#[tokio::test]
async fn test_single_bucket_deploy_uses_completion_token() {
    let server = MockServer::start().await;
    let (request, index_hash, css_hash) = two_file_request();

    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .and(header("Authorization", "Bearer api-token"))
        .respond_with(envelope(json!({
            "jwt": "session-jwt",
            "buckets": [[index_hash.clone(), css_hash.clone()]]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .and(query_param("base64", "true"))
        .and(header("Authorization", "Bearer session-jwt"))
        .respond_with(envelope(json!({ "jwt": "completion-token" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SCRIPT_PATH))
        .and(header("Authorization", "Bearer api-token"))
        .respond_with(envelope(json!({ "id": "site" })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = deploy(&server, request).await.unwrap();
    assert!(outcome.assets_uploaded);
    assert_eq!(outcome.asset_files, 2);

    let requests = server.received_requests().await.unwrap();
    let calls: Vec<(String, String)> = requests
        .iter()
        .map(|r| (r.method.to_string(), r.url.path().to_string()))
        .collect();
    assert_eq!(
        calls,
        vec![
            ("POST".to_string(), SESSION_PATH.to_string()),
            ("POST".to_string(), UPLOAD_PATH.to_string()),
            ("PUT".to_string(), SCRIPT_PATH.to_string()),
        ]
    );

    let session: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(session["manifest"]["/index.html"]["hash"], index_hash);

    let batch = String::from_utf8_lossy(&requests[1].body);
    assert!(batch.contains(&index_hash));
    assert!(batch.contains(&css_hash));
    assert!(batch.contains(&encode(b"<html>hi</html>")));
    assert!(batch.contains("text/html"));

    let finalize = String::from_utf8_lossy(&requests[2].body);
    assert!(finalize.contains(r#""jwt":"completion-token""#));
    assert!(!finalize.contains("session-jwt"));
    assert!(finalize.contains(r#""main_module":"index.js""#));
    assert!(finalize.contains(r#""type":"assets""#));
}

#[tokio::test]
async fn test_nothing_missing_finalizes_with_session_token() {
    let server = MockServer::start().await;
    let (request, _, _) = two_file_request();

    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(envelope(json!({ "jwt": "session-jwt", "buckets": [] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .respond_with(envelope(json!({ "jwt": "unexpected" })))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SCRIPT_PATH))
        .respond_with(envelope(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    deploy(&server, request).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let finalize = String::from_utf8_lossy(&requests.last().unwrap().body);
    assert!(finalize.contains(r#""jwt":"session-jwt""#));
}

#[tokio::test]
async fn test_rejected_batch_aborts_before_finalize() {
    let server = MockServer::start().await;
    let (request, index_hash, css_hash) = two_file_request();

    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(envelope(json!({
            "jwt": "session-jwt",
            "buckets": [[index_hash], [css_hash]]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "success": false,
            "errors": [{ "code": 10001, "message": "session expired" }],
            "messages": [],
            "result": null
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SCRIPT_PATH))
        .respond_with(envelope(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let err = deploy(&server, request).await.unwrap_err();
    assert!(matches!(err, DeployError::Platform { .. }));
    assert!(err.to_string().contains("session expired (10001)"));
}

#[tokio::test]
async fn test_rotated_tokens_chain_across_batches() {
    let server = MockServer::start().await;
    let (request, index_hash, css_hash) = two_file_request();

    Mock::given(method("POST"))
        .and(path(SESSION_PATH))
        .respond_with(envelope(json!({
            "jwt": "session-jwt",
            "buckets": [[index_hash], [css_hash]]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .and(header("Authorization", "Bearer session-jwt"))
        .respond_with(envelope(json!({ "jwt": "rotated-jwt" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .and(header("Authorization", "Bearer rotated-jwt"))
        .respond_with(envelope(json!({ "jwt": "completion-token" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(SCRIPT_PATH))
        .respond_with(envelope(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    deploy(&server, request).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let finalize = String::from_utf8_lossy(&requests.last().unwrap().body);
    assert!(finalize.contains(r#""jwt":"completion-token""#));
}

#[tokio::test]
async fn test_worker_without_assets_skips_upload_session() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/accounts/acct/workers/dispatch/namespaces/published/scripts/api"))
        .respond_with(envelope(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let request: DeployRequest = serde_json::from_value(json!({
        "wranglerConfig": {
            "name": "api",
            "compatibility_date": "2025-01-01",
            "vars": { "MODE": "production" }
        },
        "workerContent": "export default {}",
        "dispatchNamespace": "published",
        "accountId": ACCOUNT,
        "apiToken": "api-token"
    }))
    .unwrap();
    let outcome = deploy(&server, request).await.unwrap();
    assert!(!outcome.assets_uploaded);
    assert_eq!(outcome.dispatch_namespace.as_deref(), Some("published"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let finalize = String::from_utf8_lossy(&requests[0].body);
    assert!(finalize.contains(r#""type":"plain_text""#));
    assert!(!finalize.contains(r#""assets""#));
}
