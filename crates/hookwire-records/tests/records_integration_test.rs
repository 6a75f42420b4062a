//! Records service served over a real socket.

use hookwire_records::{RecordStore, RecordsService, SERVICE_TOKEN_ARG};
use hookwire_types::config::{ClientConfig, ServerConfig};
use hookwire_types::error::RpcError;
use hookwire_types::protocol::EncryptionProtocol;
use hookwire_wire::{Call, RpcClient, RpcServer, ServerHandle};
use serde_json::json;
use std::path::Path;

async fn serve(path: &Path, tokens: Vec<String>) -> (RecordsService, ServerHandle) {
    let store = RecordStore::open(path).unwrap();
    let service = RecordsService::new(store, tokens);
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        rsa_bits: 1024,
        ..ServerConfig::default()
    };
    let handle = RpcServer::new(config, service.registry())
        .unwrap()
        .start()
        .await
        .unwrap();
    (service, handle)
}

#[tokio::test]
async fn test_results_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("students.json");
    {
        let mut store = RecordStore::open(&path).unwrap();
        store.add_user("carol", "s3cret-pw").unwrap();
        store.save().unwrap();
    }

    let (_service, handle) = serve(&path, vec![]).await;
    let client = RpcClient::connect(ClientConfig::new(handle.local_addr().to_string()))
        .await
        .unwrap();
    assert_eq!(client.protocol(), EncryptionProtocol::Hybrid);

    let ok: bool = client
        .call_as(Call::new("check_credentials").arg("carol").arg("s3cret-pw").confidential())
        .await
        .unwrap();
    assert!(ok);

    let results = json!([["MATH1001", 77], ["PHYS1001", 49.5]]);
    client
        .send(Call::new("set_results").arg("carol").arg(results.clone()))
        .await
        .unwrap();
    handle.shutdown();
    handle.stopped().await;

    // A fresh server over the same file sees the update.
    let (service, handle) = serve(&path, vec![]).await;
    assert_eq!(service.user_count(), 1);
    let client = RpcClient::connect(ClientConfig::new(handle.local_addr().to_string()))
        .await
        .unwrap();
    let got = client.send(Call::new("get_results").arg("carol")).await.unwrap();
    assert_eq!(got, results);
    handle.shutdown();
}

#[tokio::test]
async fn test_service_token_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("students.json");
    {
        let mut store = RecordStore::open(&path).unwrap();
        store.add_user("carol", "s3cret-pw").unwrap();
        store.save().unwrap();
    }

    let (_service, handle) = serve(&path, vec!["evaluator-1".to_string()]).await;
    let client = RpcClient::connect(ClientConfig::new(handle.local_addr().to_string()))
        .await
        .unwrap();

    let err = client.send(Call::new("get_results").arg("carol")).await.unwrap_err();
    assert!(matches!(err, RpcError::Procedure(ref trace) if trace.contains("unauthorized")));

    let got = client
        .send(
            Call::new("get_results")
                .arg("carol")
                .named(SERVICE_TOKEN_ARG, "evaluator-1"),
        )
        .await
        .unwrap();
    assert_eq!(got, json!([]));
    handle.shutdown();
}
