use fleet_core::{BundleStore, ConfigBundle, Node, NodeDescriptor, NodeRegistryStore, NodeRole};
use fleet_infrastructure::{JsonBundleStore, JsonNodeRegistryStore};

fn node(id: &str, role: NodeRole) -> Node {
    Node::new(NodeDescriptor::new(
        id,
        &format!("http://{id}:8080"),
        role,
        ["light_requests"],
    ))
}

#[tokio::test]
async fn test_node_registry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let store = JsonNodeRegistryStore::in_dir(dir.path());
    assert!(store.load_nodes().await.unwrap().is_empty());

    let nodes = vec![node("a", NodeRole::Full), node("b", NodeRole::Client)];
    store.save_nodes(&nodes).await.unwrap();

    let reopened = JsonNodeRegistryStore::in_dir(dir.path());
    let loaded = reopened.load_nodes().await.unwrap();
    assert_eq!(loaded, nodes);
    assert!(!dir.path().join("nodes.json.tmp").exists());
}

#[tokio::test]
async fn test_bundle_store_overwrites_previous_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonBundleStore::in_dir(dir.path().join("nested"));

    assert!(store.load_bundle().await.unwrap().is_none());

    let v1 = ConfigBundle::new("v1", b"first".to_vec(), "node-a");
    let v2 = ConfigBundle::new("v2", b"second".to_vec(), "node-a");
    store.save_bundle(&v1).await.unwrap();
    store.save_bundle(&v2).await.unwrap();

    let loaded = store.load_bundle().await.unwrap().unwrap();
    assert_eq!(loaded, v2);
    assert!(loaded.verify_checksum().is_ok());
}
