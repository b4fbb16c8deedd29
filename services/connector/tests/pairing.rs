//! Pairing handshake tests against a mock control plane.

use self_host_connector::pairing::{self, PairError, PairOptions};
use self_host_connector::{AgentInfo, Configuration, Paths};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn options(server: &MockServer, replace: bool) -> PairOptions {
    PairOptions {
        base_url: format!("{}/", server.uri()),
        pairing_token: "pair-once".to_string(),
        name: Some("lab-mac".to_string()),
        replace,
    }
}

fn paths(dir: &TempDir) -> Paths {
    Paths::new(dir.path().join("connector").join("config.json"))
}

async fn mount_success(server: &MockServer, connector_id: &str) {
    Mock::given(method("POST"))
        .and(path("/self-host/pair"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connector_id": connector_id,
            "connector_token": format!("token-{connector_id}"),
            "poll_interval_seconds": 15
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_pair_saves_configuration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/self-host/pair"))
        .and(body_partial_json(json!({
            "pairing_token": "pair-once",
            "connector_info": {
                "name": "lab-mac",
                "version": "1.0.0",
                "capabilities": {"multipass": true}
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connector_id": "conn_1",
            "connector_token": "secret",
            "poll_interval_seconds": 15
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths(&dir);
    let config = pairing::pair(&paths, &options(&server, false), &AgentInfo::new("1.0.0"))
        .await
        .unwrap();

    assert_eq!(config.connector_id, "conn_1");
    assert_eq!(config.base_url, server.uri());

    let saved = Configuration::load_paired(paths.config()).unwrap();
    assert_eq!(saved.connector_token, "secret");
    assert_eq!(saved.poll_interval_seconds, 15);
    assert_eq!(saved.name, "lab-mac");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(paths.config()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_rejected_token_is_invalid_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/self-host/pair"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token already used"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths(&dir);
    let err = pairing::pair(&paths, &options(&server, false), &AgentInfo::new("1.0.0"))
        .await
        .unwrap_err();

    assert!(matches!(err, PairError::InvalidCredentials(_)));
    assert!(err.to_string().contains("token already used"));
    assert!(!paths.config().exists());
}

#[tokio::test]
async fn test_server_error_is_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/self-host/pair"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = pairing::pair(&paths(&dir), &options(&server, false), &AgentInfo::new("1.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, PairError::Network(_)));
}

#[tokio::test]
async fn test_garbled_response_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/self-host/pair"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths(&dir);
    let err = pairing::pair(&paths, &options(&server, false), &AgentInfo::new("1.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, PairError::Protocol(_)));
    assert!(!paths.config().exists());
}

#[tokio::test]
async fn test_existing_config_requires_replace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/self-host/pair"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths(&dir);
    let existing = Configuration {
        base_url: "https://old.example".to_string(),
        connector_id: "conn_old".to_string(),
        connector_token: "old".to_string(),
        ..Default::default()
    };
    existing.save(paths.config()).unwrap();

    let err = pairing::pair(&paths, &options(&server, false), &AgentInfo::new("1.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, PairError::AlreadyPaired { .. }));
    assert!(err.to_string().contains("pair --replace"));

    let kept = Configuration::load(paths.config()).unwrap();
    assert_eq!(kept.connector_id, "conn_old");
}

#[tokio::test]
async fn test_replace_overwrites_config() {
    let server = MockServer::start().await;
    mount_success(&server, "conn_new").await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths(&dir);
    Configuration {
        base_url: "https://old.example".to_string(),
        connector_id: "conn_old".to_string(),
        connector_token: "old".to_string(),
        ..Default::default()
    }
    .save(paths.config())
    .unwrap();

    let mut opts = options(&server, true);
    opts.name = Some("   ".to_string());
    pairing::pair(&paths, &opts, &AgentInfo::new("1.0.0"))
        .await
        .unwrap();

    let saved = Configuration::load_paired(paths.config()).unwrap();
    assert_eq!(saved.connector_id, "conn_new");
    assert_eq!(saved.connector_token, "token-conn_new");
    assert!(saved.name.is_empty());
}
