//! Container logs command

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use http_body_util::BodyExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use recompose_core::api::ClusterState;

use crate::{status, AppContext};

pub async fn logs_cmd(app: &AppContext, name: &str, since: Option<u64>) -> Result<()> {
    let cluster = status::get_cluster_status(app).await?;
    let (container, node_fingerprint) = resolve_container_name(&cluster, name)?;

    let mut query = format!("container={container}");
    if let Some(since) = since {
        let start = Utc::now() - chrono::Duration::seconds(since as i64);
        query.push_str(&format!("&since={}", start.timestamp()));
    }

    let cancel = CancellationToken::new();
    let response = app
        .client
        .get(
            &cancel,
            &format!("{}/nodes/{node_fingerprint}/logs?{query}", app.base_url),
        )
        .await?;

    let mut body = response.into_body();
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = body.frame().await {
        let frame = frame.context("streaming logs")?;
        if let Some(data) = frame.data_ref() {
            stdout.write_all(data).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

/// Resolves `<name>` or `<name>@<fingerprint prefix>` to a unique container
/// and its node. Ambiguous references are an error so logs never silently
/// come from the wrong node.
fn resolve_container_name(cluster: &ClusterState, reference: &str) -> Result<(String, String)> {
    let (name, prefix) = match reference.split_once('@') {
        Some((name, prefix)) => (name, Some(prefix)),
        None => (reference, None),
    };

    let mut candidate: Option<(String, String)> = None;
    for container in &cluster.containers {
        if container.name != name {
            continue;
        }
        if let Some(prefix) = prefix {
            if !container.node_fingerprint.starts_with(prefix) {
                continue;
            }
        }
        if candidate.is_some() {
            bail!(
                "multiple containers have this name - reference a specific one using: \
                 <container name>@<node fingerprint prefix>"
            );
        }
        candidate = Some((container.name.clone(), container.node_fingerprint.clone()));
    }

    candidate.ok_or_else(|| anyhow!("container not found"))
}
