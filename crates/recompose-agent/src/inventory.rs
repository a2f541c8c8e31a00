//! Inventory client
//!
//! Long-polls the coordinator for this node's inventory and mirrors every
//! response verbatim to `inventory.toml`, so the agent keeps converging on
//! its last known inventory across restarts even while the coordinator is
//! down.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use recompose_core::api::NodeInventory;
use recompose_core::StateContainer;
use recompose_rpc::{read_body, RpcError};
use tokio_util::sync::CancellationToken;

use crate::CoordClient;

pub type InventoryContainer = StateContainer<Arc<NodeInventory>>;

/// One long-poll round trip: seed state from disk if empty, ask for
/// anything after the SHA we have, persist and publish the response.
pub async fn sync_inventory(
    client: &CoordClient,
    file: &Path,
    state: &InventoryContainer,
) -> Result<()> {
    let current = match state.get() {
        Some(current) => current,
        None => {
            let initial = Arc::new(load_initial(file));
            state.swap(Arc::clone(&initial));
            initial
        }
    };

    let cancel = CancellationToken::new();
    let url = format!(
        "{}/nodeinventory?after={}",
        client.base_url, current.git_sha
    );
    let response = match client.client.get(&cancel, &url).await {
        Ok(response) => response,
        Err(RpcError::UntrustedClient { .. }) => {
            bail!("the coordinator does not trust your cert - add it to cluster.toml")
        }
        Err(err) => return Err(err).context("requesting inventory from coordinator"),
    };

    let body = read_body(response)
        .await
        .context("downloading inventory from coordinator")?;

    std::fs::write(file, &body).context("writing inventory file")?;

    let text = std::str::from_utf8(&body).context("decoding inventory")?;
    let inventory: NodeInventory = toml::from_str(text).context("decoding inventory")?;

    tracing::info!(
        "got inventory from coordinator at git SHA: {}",
        inventory.git_sha
    );
    state.swap(Arc::new(inventory));
    Ok(())
}

/// Reads the last inventory mirrored to disk. Failures only cost us the
/// `after` optimization, so they are logged and swallowed.
fn load_initial(file: &Path) -> NodeInventory {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!("failed to read the last seen inventory from disk: {err}");
            return NodeInventory::default();
        }
    };

    match toml::from_str(&text) {
        Ok(inventory) => inventory,
        Err(err) => {
            tracing::warn!("failed to parse the last seen inventory from disk: {err}");
            NodeInventory::default()
        }
    }
}
