//! Wire types shared across the recompose components
//!
//! Inventory documents travel as TOML, cluster status as JSON. Field renames
//! pin the wire names so the Rust-side naming can stay idiomatic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything one node should be running at a given git SHA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInventory {
    #[serde(default, rename = "gitSHA")]
    pub git_sha: String,

    #[serde(default, rename = "container")]
    pub containers: Vec<ContainerSpec>,
}

/// A single declarative container, read from one TOML file.
///
/// `name` is derived from the file name stem and `hash` from the file bytes;
/// neither appears in the source document. The hash is the reconciler's diff
/// key: identical bytes produce identical hashes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub hash: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    /// Free-form runtime flags. Values are scalars or arrays of scalars;
    /// arrays emit the flag once per element.
    #[serde(default)]
    pub flags: BTreeMap<String, toml::Value>,

    #[serde(default, rename = "secret")]
    pub secrets: Vec<Secret>,

    #[serde(default, rename = "file")]
    pub files: Vec<FileMount>,
}

/// An encrypted environment variable. Only the coordinator can decrypt it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default, rename = "envvar")]
    pub env_var: String,

    #[serde(default)]
    pub ciphertext: String,
}

/// A file materialized on the node and bind-mounted into the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMount {
    /// Mount target inside the container.
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub content: String,
}

/// Observed state of the whole cluster, merged from every reachable agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub containers: Vec<ContainerState>,
}

/// Observed state of one managed container on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub name: String,
    pub node_fingerprint: String,
    pub created: DateTime<Utc>,
    pub last_restart: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_decodes_full_document() {
        let doc = r#"
            image = "nginx"
            command = ["serve", "--quiet"]

            [flags]
            publish = ["8080:80", "8443:443"]
            memory = "256m"

            [[secret]]
            envvar = "API_KEY"
            ciphertext = "age-ciphertext"

            [[file]]
            path = "/etc/nginx/nginx.conf"
            content = "worker_processes 1;"
        "#;

        let spec: ContainerSpec = toml::from_str(doc).unwrap();
        assert_eq!(spec.image, "nginx");
        assert_eq!(spec.command, vec!["serve", "--quiet"]);
        assert_eq!(spec.secrets.len(), 1);
        assert_eq!(spec.secrets[0].env_var, "API_KEY");
        assert_eq!(spec.files.len(), 1);
        assert_eq!(spec.files[0].path, "/etc/nginx/nginx.conf");
        assert!(spec.flags["publish"].is_array());

        // Derived fields are absent from the document.
        assert_eq!(spec.name, "");
        assert_eq!(spec.hash, "");
    }

    #[test]
    fn test_node_inventory_round_trip() {
        let inv = NodeInventory {
            git_sha: "a".repeat(40),
            containers: vec![ContainerSpec {
                name: "web".into(),
                hash: "deadbeef".into(),
                image: "nginx".into(),
                ..Default::default()
            }],
        };

        let encoded = toml::to_string(&inv).unwrap();
        assert!(encoded.contains("gitSHA"));
        assert!(encoded.contains("[[container]]"));

        let decoded: NodeInventory = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded, inv);
    }

    #[test]
    fn test_empty_body_decodes_as_empty_inventory() {
        let decoded: NodeInventory = toml::from_str("").unwrap();
        assert_eq!(decoded, NodeInventory::default());
    }

    #[test]
    fn test_container_state_uses_camel_case_wire_names() {
        let state = ContainerState {
            name: "web".into(),
            node_fingerprint: "abc123".into(),
            created: DateTime::from_timestamp(234, 0).unwrap(),
            last_restart: Some(DateTime::from_timestamp(123, 0).unwrap()),
        };

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"nodeFingerprint\":\"abc123\""));
        assert!(json.contains("\"lastRestart\""));
    }
}
