//! Inventory sync
//!
//! Pulls the GitOps working tree, parses `cluster.toml` and the container
//! spec files it references, and publishes a freshly indexed inventory into
//! the shared state container. A sync is a no-op while HEAD hasn't moved.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use serde::Deserialize;
use tokio::process::Command;

use recompose_core::api::{ContainerSpec, NodeInventory};
use recompose_core::StateContainer;
use recompose_rpc::Authorizer;

use crate::store::NodeMetadataStore;

pub type InventoryContainer = StateContainer<Arc<IndexedInventory>>;

/// The coordinator's live view of the cluster at one git SHA.
///
/// Replaced atomically as a whole; readers always observe a fully populated
/// snapshot.
#[derive(Debug, Default)]
pub struct IndexedInventory {
    pub git_sha: String,
    pub nodes_by_fingerprint: HashMap<String, Arc<NodeInventory>>,
    pub clients_by_fingerprint: HashSet<String>,
}

/// Schema of `cluster.toml`.
#[derive(Debug, Default, Deserialize)]
struct ClusterSpec {
    #[serde(default, rename = "node")]
    nodes: Vec<NodeSpec>,

    #[serde(default, rename = "client")]
    clients: Vec<ClientSpec>,
}

#[derive(Debug, Deserialize)]
struct NodeSpec {
    #[serde(default)]
    fingerprint: String,

    #[serde(default)]
    containers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSpec {
    #[serde(default)]
    fingerprint: String,
}

/// Pulls `dir` and swaps a new inventory in when HEAD advanced. Also prunes
/// node metadata entries for fingerprints no longer declared.
pub async fn sync_inventory(
    dir: &Path,
    state: &InventoryContainer,
    nodes: &NodeMetadataStore,
) -> Result<()> {
    let sha = git_pull(dir).await.context("pulling git repo")?;

    if let Some(current) = state.get() {
        if current.git_sha == sha {
            return Ok(()); // already in sync
        }
    }
    tracing::info!("pulled git SHA: {sha}");

    let mut inv = IndexedInventory {
        git_sha: sha,
        ..Default::default()
    };
    read_inventory(dir, &mut inv).context("reading inventory")?;

    nodes.retain(|fingerprint| inv.nodes_by_fingerprint.contains_key(fingerprint));

    state.swap(Arc::new(inv));
    Ok(())
}

async fn git_pull(dir: &Path) -> Result<String> {
    let start = Instant::now();
    let output = Command::new("git")
        .arg("pull")
        .current_dir(dir)
        .output()
        .await
        .context("running git pull")?;
    if !output.status.success() {
        bail!("git error: {}", combined_output(&output));
    }
    tracing::info!("pulled git repo in {:?}", start.elapsed());

    let output = Command::new("git")
        .args(["rev-parse", "--verify", "HEAD"])
        .current_dir(dir)
        .output()
        .await
        .context("running git rev-parse")?;
    if !output.status.success() {
        bail!("git error: {}", combined_output(&output));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn combined_output(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

/// Populates `inv` from `cluster.toml` in `dir`. A missing cluster file
/// yields an empty inventory; an unreadable container file is logged and
/// excluded from its node rather than failing the whole sync.
pub fn read_inventory(dir: &Path, inv: &mut IndexedInventory) -> Result<()> {
    let cluster_file = dir.join("cluster.toml");
    let text = match std::fs::read_to_string(&cluster_file) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()), // no inventory
        Err(err) => return Err(err).context("reading cluster.toml"),
    };

    let cluster: ClusterSpec = toml::from_str(&text).context("parsing cluster.toml")?;

    // Spec files shared by several nodes are read and hashed once per sync.
    let mut container_index: HashMap<String, ContainerSpec> = HashMap::new();

    for node in &cluster.nodes {
        if node.fingerprint.is_empty() {
            continue;
        }

        let mut node_inv = NodeInventory {
            git_sha: inv.git_sha.clone(),
            containers: Vec::new(),
        };
        for path in &node.containers {
            if let Some(container) = container_index.get(path) {
                node_inv.containers.push(container.clone());
                continue;
            }

            match read_container_spec(&dir.join(path)) {
                Ok(container) => {
                    container_index.insert(path.clone(), container.clone());
                    node_inv.containers.push(container);
                }
                Err(err) => {
                    tracing::warn!(
                        "error while reading container file {path:?} referenced by node {:?}: {err:#}",
                        node.fingerprint
                    );
                }
            }
        }

        inv.nodes_by_fingerprint
            .insert(node.fingerprint.clone(), Arc::new(node_inv));
    }

    for client in &cluster.clients {
        if !client.fingerprint.is_empty() {
            inv.clients_by_fingerprint.insert(client.fingerprint.clone());
        }
    }

    Ok(())
}

/// Reads one container spec file: the hash is the MD5 of the raw bytes and
/// the name is the file name stem, so editing a file changes its identity.
pub fn read_container_spec(file: &Path) -> Result<ContainerSpec> {
    let bytes = std::fs::read(file).context("opening file")?;

    let text = std::str::from_utf8(&bytes).context("decoding file")?;
    let mut spec: ContainerSpec = toml::from_str(text).context("parsing spec")?;

    spec.name = file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    spec.hash = hex::encode(Md5::digest(&bytes));

    Ok(spec)
}

/// Trusts agents: fingerprints declared as nodes in the current inventory.
pub struct AgentAuthorizer(pub InventoryContainer);

impl Authorizer for AgentAuthorizer {
    fn trusts_cert(&self, fingerprint: &str) -> bool {
        self.0
            .get()
            .map(|inv| inv.nodes_by_fingerprint.contains_key(fingerprint))
            .unwrap_or(false)
    }
}

/// Trusts admins: fingerprints declared as clients in the current inventory.
pub struct ClientAuthorizer(pub InventoryContainer);

impl Authorizer for ClientAuthorizer {
    fn trusts_cert(&self, fingerprint: &str) -> bool {
        self.0
            .get()
            .map(|inv| inv.clients_by_fingerprint.contains(fingerprint))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeMetadata;

    fn write_cluster(dir: &Path) {
        std::fs::write(
            dir.join("cluster.toml"),
            r#"
                [[ node ]]
                fingerprint = "test-fingerprint"
                containers = ["web.toml", "specs/worker.toml"]

                [[ node ]]
                fingerprint = "other-fingerprint"
                containers = ["web.toml"]

                [[ client ]]
                fingerprint = "client-fingerprint"
            "#,
        )
        .unwrap();
        std::fs::write(dir.join("web.toml"), "image = \"nginx\"\n").unwrap();
        std::fs::create_dir(dir.join("specs")).unwrap();
        std::fs::write(
            dir.join("specs/worker.toml"),
            "image = \"worker\"\ncommand = [\"run\"]\n",
        )
        .unwrap();
    }

    #[test]
    fn test_read_inventory_indexes_nodes_and_clients() {
        let dir = tempfile::tempdir().unwrap();
        write_cluster(dir.path());

        let mut inv = IndexedInventory {
            git_sha: "test-sha".into(),
            ..Default::default()
        };
        read_inventory(dir.path(), &mut inv).unwrap();

        let node = &inv.nodes_by_fingerprint["test-fingerprint"];
        assert_eq!(node.git_sha, "test-sha");
        assert_eq!(node.containers.len(), 2);
        assert_eq!(node.containers[0].name, "web");
        assert_eq!(node.containers[1].name, "worker");
        assert!(inv.clients_by_fingerprint.contains("client-fingerprint"));

        // Both nodes share the same web.toml spec, including its hash.
        let other = &inv.nodes_by_fingerprint["other-fingerprint"];
        assert_eq!(other.containers[0].hash, node.containers[0].hash);
    }

    #[test]
    fn test_missing_cluster_file_yields_empty_inventory() {
        let dir = tempfile::tempdir().unwrap();

        let mut inv = IndexedInventory::default();
        read_inventory(dir.path(), &mut inv).unwrap();

        assert!(inv.nodes_by_fingerprint.is_empty());
        assert!(inv.clients_by_fingerprint.is_empty());
    }

    #[test]
    fn test_unreadable_container_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("cluster.toml"),
            r#"
                [[ node ]]
                fingerprint = "test-fingerprint"
                containers = ["good.toml", "missing.toml"]
            "#,
        )
        .unwrap();
        std::fs::write(dir.path().join("good.toml"), "image = \"nginx\"\n").unwrap();

        let mut inv = IndexedInventory::default();
        read_inventory(dir.path(), &mut inv).unwrap();

        let node = &inv.nodes_by_fingerprint["test-fingerprint"];
        assert_eq!(node.containers.len(), 1);
        assert_eq!(node.containers[0].name, "good");
    }

    #[test]
    fn test_container_spec_hash_tracks_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("web.toml");

        std::fs::write(&file, "image = \"nginx\"\n").unwrap();
        let first = read_container_spec(&file).unwrap();
        let again = read_container_spec(&file).unwrap();
        assert_eq!(first.hash, again.hash, "identical bytes, identical hash");
        assert_eq!(first.hash, hex::encode(Md5::digest("image = \"nginx\"\n")));
        assert_eq!(first.name, "web");

        std::fs::write(&file, "image = \"nginx:1.25\"\n").unwrap();
        let changed = read_container_spec(&file).unwrap();
        assert_ne!(first.hash, changed.hash, "any byte change changes the hash");
    }

    #[test]
    fn test_metadata_is_pruned_for_undeclared_nodes() {
        let dir = tempfile::tempdir().unwrap();
        write_cluster(dir.path());

        let store = NodeMetadataStore::new();
        store.set("not-a-node".into(), NodeMetadata::default());
        store.set("test-fingerprint".into(), NodeMetadata::default());

        let mut inv = IndexedInventory::default();
        read_inventory(dir.path(), &mut inv).unwrap();
        store.retain(|fingerprint| inv.nodes_by_fingerprint.contains_key(fingerprint));

        assert!(store.get("not-a-node").is_none());
        assert!(store.get("test-fingerprint").is_some());
    }

    #[test]
    fn test_authorizers_split_nodes_and_clients() {
        let state: InventoryContainer = StateContainer::new();

        let agents = AgentAuthorizer(state.clone());
        let clients = ClientAuthorizer(state.clone());
        assert!(!agents.trusts_cert("node-fp"), "no inventory, no trust");

        let mut inv = IndexedInventory::default();
        inv.nodes_by_fingerprint
            .insert("node-fp".into(), Arc::new(NodeInventory::default()));
        inv.clients_by_fingerprint.insert("client-fp".into());
        state.swap(Arc::new(inv));

        assert!(agents.trusts_cert("node-fp"));
        assert!(!agents.trusts_cert("client-fp"));
        assert!(clients.trusts_cert("client-fp"));
        assert!(!clients.trusts_cert("node-fp"));
    }
}
