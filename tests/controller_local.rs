use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use vault_controller::config::Settings;
use vault_controller::daemon::Controller;
use vault_controller::reconciler::{LeaderState, SealState};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn local_settings(server: &MockServer, store_dir: &Path) -> Settings {
    let mut settings = Settings::new(None).expect("default settings");
    settings.discovery.instances = vec!["127.0.0.1".to_string()];
    settings.vault.scheme = "http".to_string();
    settings.vault.port = server.address().port();
    settings.vault.init_wait_secs = 0;
    settings.init.shares = 1;
    settings.init.threshold = 1;
    settings.store.local_dir = store_dir.to_path_buf();
    settings
}

async fn mount_fresh_instance(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "initialized": false })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .and(body_json(json!({ "secret_shares": 1, "secret_threshold": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["k1"],
            "keys_base64": ["b1"],
            "root_token": "s.root"
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": true,
            "t": 1,
            "n": 1,
            "progress": 0
        })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .and(body_json(json!({ "key": "k1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": false,
            "t": 1,
            "n": 1,
            "progress": 0
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/leader"))
        .and(header("X-Vault-Token", "s.root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ha_enabled": false,
            "is_self": false,
            "leader_address": ""
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn oneshot_initialises_unseals_and_stores_material_on_disk() {
    let server = MockServer::start().await;
    mount_fresh_instance(&server).await;
    let store_dir = tempfile::tempdir().expect("tempdir");
    let controller = Controller::new(Arc::new(local_settings(&server, store_dir.path())))
        .await
        .expect("controller");

    controller.run_oneshot().await;

    let snapshot = controller.health().snapshot().await;
    assert_eq!(snapshot.instances.len(), 1);
    let report = &snapshot.instances[0];
    assert_eq!(report.name, "127.0.0.1");
    assert!(report.initialized_now);
    assert_eq!(report.seal, Some(SealState::Unsealed));
    assert_eq!(report.leader, Some(LeaderState::Leader));
    assert_eq!(report.condition, None);
    assert_eq!(snapshot.initializations, 1);
    assert!(controller.health().is_ready().await);

    let base = store_dir.path().join("kube-system");
    let keys = std::fs::read_to_string(base.join("vault-unseal-keys").join("unseal-keys"))
        .expect("unseal keys on disk");
    let root = std::fs::read_to_string(base.join("vault-tokens").join("root-token"))
        .expect("root token on disk");
    assert_eq!(keys, "k1");
    assert_eq!(root, "s.root");
}

#[tokio::test]
async fn stored_keys_prevent_second_initialise() {
    let server = MockServer::start().await;
    mount_fresh_instance(&server).await;
    let store_dir = tempfile::tempdir().expect("tempdir");
    let controller = Controller::new(Arc::new(local_settings(&server, store_dir.path())))
        .await
        .expect("controller");

    controller.run_oneshot().await;
    // the mock keeps reporting an uninitialised instance
    controller.run_oneshot().await;

    let snapshot = controller.health().snapshot().await;
    assert_eq!(snapshot.ticks, 2);
    assert_eq!(snapshot.initializations, 1);
    assert!(
        snapshot.instances[0]
            .condition
            .as_deref()
            .is_some_and(|c| c.contains("already initialised"))
    );
    // PUT sys/init `.expect(1)` is verified when the server drops
}
