//! HTTP tests against a running cloudigrade server.
//!
//! Set TEST_BASE_URL and the credentials of an existing superuser
//! (created with `cloudigrade create-superuser`):
//! ```sh
//! export TEST_BASE_URL="http://127.0.0.1:8080"
//! export TEST_ADMIN_USERNAME=admin TEST_ADMIN_PASSWORD=admin123
//! cargo test --test integration_tests -- --ignored
//! ```

use std::env;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    token: String,
    client: Client,
}

impl TestServer {
    fn new() -> Self {
        Self {
            base_url: env::var("TEST_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into()),
            token: String::new(),
            client: Client::new(),
        }
    }

    async fn login(mut self) -> Self {
        let resp = self
            .client
            .post(self.url("/api/v1/auth/token/create/"))
            .json(&json!({
                "username": env::var("TEST_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into()),
                "password": env::var("TEST_ADMIN_PASSWORD").unwrap_or_else(|_| "admin123".into()),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        self.token = body["auth_token"].as_str().unwrap().to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_health_check() {
    let server = TestServer::new();
    let resp = server.client.get(server.url("/healthz/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["checks"]["database"]["status"], "healthy");
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_invalid_credentials() {
    let server = TestServer::new();
    let resp = server
        .client
        .post(server.url("/api/v1/auth/token/create/"))
        .json(&json!({"username": "nobody", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_requires_token() {
    let server = TestServer::new();
    let resp = server.get("/api/v1/account/").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_account_list_shape() {
    let server = TestServer::new().login().await;
    let resp = server.get("/api/v1/account/?limit=5").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["count"].is_number());
    assert!(body["results"].is_array());
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_register_invalid_arn() {
    let server = TestServer::new().login().await;
    let resp = server
        .client
        .post(server.url("/api/v1/account/"))
        .header("Authorization", format!("Token {}", server.token))
        .json(&json!({"account_arn": "not-an-arn", "resourcetype": "AwsAccount"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].as_str().unwrap().contains("account_arn"));
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_report_inverted_period() {
    let server = TestServer::new().login().await;
    let resp = server
        .get("/api/v1/report/instances/?start=2018-02-01T00:00:00Z&end=2018-01-01T00:00:00Z")
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_superuser_lists_users() {
    let server = TestServer::new().login().await;
    let resp = server.get("/api/v1/user/").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert!(body["count"].as_i64().unwrap() >= 1);
}

#[tokio::test]
#[ignore = "requires running HTTP server"]
async fn test_openapi_document() {
    let server = TestServer::new();
    let resp = server
        .client
        .get(server.url("/api/v1/openapi.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["info"]["title"], "cloudigrade API");
}
