//! Cluster status command

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;

use recompose_core::api::{ClusterState, ContainerState};
use recompose_rpc::read_body;

use crate::AppContext;

pub async fn status_cmd(app: &AppContext) -> Result<()> {
    let cluster = get_cluster_status(app).await?;

    let mut containers = cluster.containers;
    containers.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{}", format_cluster_status(&containers, Utc::now()));
    Ok(())
}

/// Fetches `/status`, warning on a partial (206) result.
pub async fn get_cluster_status(app: &AppContext) -> Result<ClusterState> {
    let cancel = CancellationToken::new();
    let response = app
        .client
        .get(&cancel, &format!("{}/status", app.base_url))
        .await?;

    if response.status().as_u16() == 206 {
        eprintln!(
            "warning: partial results returned from server because one or more agents could not be reached"
        );
    }

    let body = read_body(response).await?;
    serde_json::from_slice(&body).context("decoding cluster status")
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "NAME")]
    name: String,

    #[tabled(rename = "NODE")]
    node: String,

    #[tabled(rename = "CREATED")]
    created: String,

    #[tabled(rename = "RESTARTED")]
    restarted: String,
}

fn format_cluster_status(containers: &[ContainerState], now: DateTime<Utc>) -> String {
    let rows: Vec<ContainerRow> = containers
        .iter()
        .map(|container| ContainerRow {
            name: container.name.clone(),
            node: container.node_fingerprint.chars().take(6).collect(),
            created: duration_to_string(now.signed_duration_since(container.created)),
            restarted: container
                .last_restart
                .map(|at| duration_to_string(now.signed_duration_since(at)))
                .unwrap_or_default(),
        })
        .collect();

    Table::new(rows).with(Style::blank()).to_string()
}

/// Renders an age as its most significant unit, like `2d` or `45s`.
pub fn duration_to_string(duration: Duration) -> String {
    let hours = duration.num_seconds() as f64 / 3600.0;
    if hours > 24.0 {
        return format!("{}d", (hours / 24.0) as i64);
    }
    if hours > 1.0 {
        return format!("{}h", hours as i64);
    }

    let minutes = duration.num_seconds() as f64 / 60.0;
    if minutes > 1.0 {
        return format!("{}m", minutes as i64);
    }

    format!("{}s", duration.num_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_to_string_picks_largest_unit() {
        assert_eq!(duration_to_string(Duration::seconds(2)), "2s");
        assert_eq!(duration_to_string(Duration::seconds(90)), "1m");
        assert_eq!(duration_to_string(Duration::minutes(2)), "2m");
        assert_eq!(duration_to_string(Duration::hours(2)), "2h");
        assert_eq!(duration_to_string(Duration::hours(48)), "2d");
    }

    #[test]
    fn test_format_cluster_status_truncates_node_fingerprint() {
        let now = Utc::now();
        let containers = vec![ContainerState {
            name: "test-name-1".into(),
            node_fingerprint: "111111111111111111111".into(),
            created: now - Duration::seconds(2),
            last_restart: Some(now - Duration::minutes(2)),
        }];

        let rendered = format_cluster_status(&containers, now);
        assert!(rendered.contains("test-name-1"));
        assert!(rendered.contains("111111"));
        assert!(!rendered.contains("1111111"), "node column is a 6-char prefix");
        assert!(rendered.contains("2s"));
        assert!(rendered.contains("2m"));
    }

    #[test]
    fn test_format_cluster_status_blank_restart_column() {
        let now = Utc::now();
        let containers = vec![ContainerState {
            name: "web".into(),
            node_fingerprint: "abcdef0123".into(),
            created: now,
            last_restart: None,
        }];

        let rendered = format_cluster_status(&containers, now);
        let data_line = rendered
            .lines()
            .find(|line| line.contains("web"))
            .unwrap()
            .trim_end();
        assert!(data_line.ends_with("0s"), "restart column stays empty: {data_line:?}");
    }
}
