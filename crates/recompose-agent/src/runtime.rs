//! Container runtime driver and reconciler
//!
//! The runtime is addressed purely as a subprocess (`podman`). Managed
//! containers are tagged `createdBy=recompose` and carry their spec hash in
//! the `recomposeHash` label, which is the reconciler's diff key.
//!
//! Each reconciler pass performs at most one external mutation and then
//! requests another pass through the state container, so failure recovery is
//! always "retry the same pass".

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Deserializer};
use tokio::process::Command;
use uuid::Uuid;

use recompose_core::api::ContainerSpec;

use crate::inventory::InventoryContainer;
use crate::CoordClient;

/// Directory holding bind-mount source files, keyed by random id. Only the
/// reconciler writes here; only the runtime reads.
pub const MOUNTS_DIR: &str = "mounts";

const PS_ARGS: [&str; 4] = [
    "ps",
    "--all",
    "--format=json",
    "--filter=label=createdBy=recompose",
];

/// One entry of `podman ps --format=json`, reduced to the fields the
/// reconciler needs. The raw output is forwarded untouched by `/ps`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PsEntry {
    #[serde(default, rename = "Names")]
    pub names: Vec<String>,

    #[serde(default, rename = "Labels", deserialize_with = "null_as_empty_map")]
    pub labels: HashMap<String, String>,

    #[serde(default, rename = "Exited")]
    pub exited: bool,
}

impl PsEntry {
    fn name(&self) -> String {
        self.names.first().cloned().unwrap_or_default()
    }

    fn hash(&self) -> &str {
        self.labels.get("recomposeHash").map(String::as_str).unwrap_or("")
    }
}

/// The runtime reports absent label maps as JSON null.
fn null_as_empty_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Converges the runtime one step toward the latest inventory.
///
/// Order matters: orphans are removed before anything starts, and mount
/// files are only cleaned after listing, from this single task.
pub async fn reconcile(client: &CoordClient, state: &InventoryContainer) -> Result<()> {
    let Some(current) = state.get() else {
        return Ok(()); // nothing to do yet
    };

    let goal: HashMap<&str, &ContainerSpec> = current
        .containers
        .iter()
        .map(|container| (container.hash.as_str(), container))
        .collect();

    let observed = ps().await.context("getting current runtime state")?;

    // Remove one orphaned container per pass. Selection is randomized so a
    // removal that keeps failing cannot starve the other orphans.
    if let Some(orphan) = pick_orphan(&goal, &observed) {
        let name = orphan.name();
        tracing::info!("removing container {name:?}...");
        rm(&name)
            .await
            .with_context(|| format!("removing container {name:?}"))?;

        tracing::info!("removed container {name:?}");
        state.re_enter();
        return Ok(());
    }

    clean_mounts(&in_use_mount_ids(&observed)).context("cleaning up mount files")?;

    let observed_index: HashMap<&str, &PsEntry> = observed
        .iter()
        .map(|entry| (entry.hash(), entry))
        .collect();

    match next_startup(&goal, &observed_index) {
        Some(Startup::Start(spec)) => {
            tracing::info!("starting container {:?}...", spec.name);
            start_container(client, spec)
                .await
                .with_context(|| format!("starting container {:?}", spec.name))?;

            tracing::info!("started container {:?}", spec.name);
            state.re_enter();
        }
        Some(Startup::Kickstart(name)) => {
            tracing::info!("kickstarting exited container {name:?}...");
            kickstart(&name)
                .await
                .with_context(|| format!("kickstarting container {name:?}"))?;

            tracing::info!("kickstarted exited container {name:?}");
            state.re_enter();
        }
        None => {} // converged
    }

    Ok(())
}

/// Picks a random observed container whose hash has left the goal set.
fn pick_orphan<'a>(
    goal: &HashMap<&str, &ContainerSpec>,
    observed: &'a [PsEntry],
) -> Option<&'a PsEntry> {
    let orphans: Vec<&PsEntry> = observed
        .iter()
        .filter(|entry| {
            let hash = entry.hash();
            hash.is_empty() || !goal.contains_key(hash)
        })
        .collect();

    orphans.choose(&mut rand::thread_rng()).copied()
}

/// Mount-file ids referenced by at least one observed container.
fn in_use_mount_ids(observed: &[PsEntry]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for entry in observed {
        if let Some(mounts) = entry.labels.get("recomposeMounts") {
            ids.extend(mounts.split(',').filter(|id| !id.is_empty()).map(String::from));
        }
    }
    ids
}

/// Deletes every mount file no observed container references.
fn clean_mounts(in_use: &HashSet<String>) -> Result<()> {
    for file in std::fs::read_dir(MOUNTS_DIR).context("listing mount files")? {
        let file = file.context("listing mount files")?;
        let name = file.file_name().to_string_lossy().into_owned();
        if in_use.contains(&name) {
            continue; // still in use
        }

        std::fs::remove_file(file.path()).context("removing mount file")?;
        tracing::info!("cleaned up mount file {name:?}");
    }
    Ok(())
}

enum Startup<'a> {
    Start(&'a ContainerSpec),
    Kickstart(String),
}

/// Decides the next creation or restart, if any. Exited containers carrying
/// `kickstart=false` are left alone.
fn next_startup<'a>(
    goal: &HashMap<&str, &'a ContainerSpec>,
    observed_index: &HashMap<&str, &PsEntry>,
) -> Option<Startup<'a>> {
    let mut specs: Vec<&ContainerSpec> = goal.values().copied().collect();
    specs.shuffle(&mut rand::thread_rng());

    for spec in specs {
        match observed_index.get(spec.hash.as_str()) {
            None => return Some(Startup::Start(spec)),
            Some(entry) => {
                if !entry.exited {
                    continue; // already running
                }
                if entry.labels.get("kickstart").map(String::as_str) == Some("false") {
                    continue; // restart suppressed at creation time
                }
                return Some(Startup::Kickstart(spec.name.clone()));
            }
        }
    }

    None
}

/// Lists managed containers as raw JSON, exactly as the runtime printed it.
pub async fn ps_raw() -> Result<Vec<u8>> {
    let output = Command::new("podman")
        .args(PS_ARGS)
        .output()
        .await
        .context("starting 'ps' command")?;
    if !output.status.success() {
        bail!(
            "running 'ps' command: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

async fn ps() -> Result<Vec<PsEntry>> {
    let raw = ps_raw().await?;
    serde_json::from_slice(&raw).context("decoding 'ps' command's output")
}

async fn rm(name: &str) -> Result<()> {
    let output = Command::new("podman")
        .args(["rm", "--force", name])
        .output()
        .await
        .context("starting 'rm' command")?;
    if !output.status.success() {
        bail!("{}", combined_output(&output));
    }
    Ok(())
}

async fn kickstart(name: &str) -> Result<()> {
    let output = Command::new("podman")
        .args(["start", name])
        .output()
        .await
        .context("starting 'start' command")?;
    if !output.status.success() {
        bail!("{}", combined_output(&output));
    }
    Ok(())
}

/// Materializes a spec: secrets decrypted by the coordinator, mount files
/// written under `mounts/`, then one `podman run`.
async fn start_container(client: &CoordClient, spec: &ContainerSpec) -> Result<()> {
    let mut decrypted = Vec::with_capacity(spec.secrets.len());
    for secret in &spec.secrets {
        let plaintext = client
            .decrypt(&secret.ciphertext)
            .await
            .with_context(|| format!("decrypting secret for env var {:?}", secret.env_var))?;
        decrypted.push(plaintext);
    }

    let mut mounts = Vec::with_capacity(spec.files.len());
    let mut mount_ids = Vec::with_capacity(spec.files.len());
    for file in &spec.files {
        let id = Uuid::new_v4().to_string();
        let dest = Path::new(MOUNTS_DIR).join(&id);

        tokio::fs::write(&dest, &file.content)
            .await
            .with_context(|| format!("writing file for mount {:?}", file.path))?;
        set_world_readable(&dest)
            .await
            .with_context(|| format!("setting permissions for mount {:?}", file.path))?;

        let absolute = tokio::fs::canonicalize(&dest)
            .await
            .with_context(|| format!("getting abspath for mount {:?}", file.path))?;
        mounts.push(absolute.to_string_lossy().into_owned());
        mount_ids.push(id.clone());
        tracing::info!("wrote mount file {id:?}");
    }

    let args = build_run_args(spec, &decrypted, &mounts, &mount_ids);
    let output = Command::new("podman")
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("starting 'run' command")?;
    if !output.status.success() {
        bail!("{}", combined_output(&output));
    }

    Ok(())
}

async fn set_world_readable(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Builds the `podman run` argv for a spec.
///
/// A string `restart` policy other than `always`/`unless-stopped` also tags
/// the container `kickstart=false`, which suppresses restarts of the exited
/// container in later reconciler passes.
fn build_run_args(
    spec: &ContainerSpec,
    decrypted: &[String],
    mounts: &[String],
    mount_ids: &[String],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--label=createdBy=recompose".to_string(),
        format!("--label=recomposeHash={}", spec.hash),
    ];

    for (key, value) in &spec.flags {
        match value {
            toml::Value::Array(items) => {
                for item in items {
                    args.push(format!("--{key}={}", flag_value(item)));
                }
            }
            value => {
                if key == "restart" {
                    if let toml::Value::String(policy) = value {
                        if policy != "always" && policy != "unless-stopped" {
                            args.push("--label=kickstart=false".to_string());
                        }
                    }
                }
                args.push(format!("--{key}={}", flag_value(value)));
            }
        }
    }

    for (secret, plaintext) in spec.secrets.iter().zip(decrypted) {
        args.push(format!("--env={}={}", secret.env_var, plaintext));
    }

    for (file, source) in spec.files.iter().zip(mounts) {
        args.push(format!(
            "--mount=type=bind,source={source},target={},readonly",
            file.path
        ));
    }
    if !mount_ids.is_empty() {
        args.push(format!("--label=recomposeMounts={}", mount_ids.join(",")));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Renders one scalar flag value. Array elements go through this too, so
/// mixed-type arrays stringify per element.
fn flag_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        toml::Value::Integer(number) => number.to_string(),
        toml::Value::Boolean(flag) => flag.to_string(),
        toml::Value::Float(number) => number.to_string(),
        other => other.to_string(),
    }
}

fn combined_output(output: &std::process::Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, exited: bool, extra_labels: &[(&str, &str)]) -> PsEntry {
        let mut labels = HashMap::from([
            ("createdBy".to_string(), "recompose".to_string()),
            ("recomposeHash".to_string(), hash.to_string()),
        ]);
        for (key, value) in extra_labels {
            labels.insert(key.to_string(), value.to_string());
        }
        PsEntry {
            names: vec![format!("container-{hash}")],
            labels,
            exited,
        }
    }

    fn spec(name: &str, hash: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            hash: hash.into(),
            image: "test-image".into(),
            ..Default::default()
        }
    }

    fn goal_index(specs: &[ContainerSpec]) -> HashMap<&str, &ContainerSpec> {
        specs.iter().map(|s| (s.hash.as_str(), s)).collect()
    }

    #[test]
    fn test_build_run_args_full_spec() {
        let doc = r#"
            image = "test-image"
            command = ["foo", "bar"]

            [ flags ]
            strarray = ["bar", "baz"]
            intarray = [1, 2]

            booltrue = true
            boolfalse = false

            str = "foo"
            int = 123

            [[ secret ]]
            envvar = "test-env"
            ciphertext = "encrypted-value"

            [[ file ]]
            path = "/testpath"
            content = "test-content"
        "#;

        let mut spec: ContainerSpec = toml::from_str(doc).unwrap();
        spec.name = "test-name".into();

        let mut actual = build_run_args(
            &spec,
            &["decrypted-value".to_string()],
            &["full-mount-path".to_string()],
            &["mount-id".to_string()],
        );
        actual.sort();

        let expected = vec![
            "--boolfalse=false",
            "--booltrue=true",
            "--env=test-env=decrypted-value",
            "--int=123",
            "--intarray=1",
            "--intarray=2",
            "--label=createdBy=recompose",
            "--label=recomposeHash=",
            "--label=recomposeMounts=mount-id",
            "--mount=type=bind,source=full-mount-path,target=/testpath,readonly",
            "--name",
            "--str=foo",
            "--strarray=bar",
            "--strarray=baz",
            "-d",
            "bar",
            "foo",
            "run",
            "test-image",
            "test-name",
        ];
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_restart_policy_gates_kickstart_label() {
        let mut restart_no = spec("web", "h1");
        restart_no
            .flags
            .insert("restart".into(), toml::Value::String("no".into()));
        let args = build_run_args(&restart_no, &[], &[], &[]);
        assert!(args.contains(&"--label=kickstart=false".to_string()));
        assert!(args.contains(&"--restart=no".to_string()));

        let mut restart_always = spec("web", "h1");
        restart_always
            .flags
            .insert("restart".into(), toml::Value::String("always".into()));
        let args = build_run_args(&restart_always, &[], &[], &[]);
        assert!(!args.contains(&"--label=kickstart=false".to_string()));

        let mut restart_unless = spec("web", "h1");
        restart_unless.flags.insert(
            "restart".into(),
            toml::Value::String("unless-stopped".into()),
        );
        let args = build_run_args(&restart_unless, &[], &[], &[]);
        assert!(!args.contains(&"--label=kickstart=false".to_string()));
    }

    #[test]
    fn test_pick_orphan_ignores_goal_containers() {
        let specs = vec![spec("web", "h1")];
        let goal = goal_index(&specs);

        let observed = vec![entry("h1", false, &[])];
        assert!(pick_orphan(&goal, &observed).is_none());

        let observed = vec![entry("h1", false, &[]), entry("h2", false, &[])];
        let orphan = pick_orphan(&goal, &observed).unwrap();
        assert_eq!(orphan.hash(), "h2");
    }

    #[test]
    fn test_pick_orphan_treats_missing_hash_as_orphan() {
        let goal = HashMap::new();
        let mut unlabeled = PsEntry {
            names: vec!["stray".into()],
            ..Default::default()
        };
        unlabeled
            .labels
            .insert("createdBy".into(), "recompose".into());

        let observed = vec![unlabeled];
        assert!(pick_orphan(&goal, &observed).is_some());
    }

    #[test]
    fn test_in_use_mount_ids_splits_label() {
        let observed = vec![
            entry("h1", false, &[("recomposeMounts", "a,b")]),
            entry("h2", false, &[("recomposeMounts", "c")]),
            entry("h3", false, &[]),
        ];

        let ids = in_use_mount_ids(&observed);
        assert_eq!(
            ids,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_next_startup_converged_is_noop() {
        let specs = vec![spec("web", "h1"), spec("worker", "h2")];
        let goal = goal_index(&specs);

        let observed = vec![entry("h1", false, &[]), entry("h2", false, &[])];
        let observed_index: HashMap<&str, &PsEntry> =
            observed.iter().map(|e| (e.hash(), e)).collect();

        assert!(next_startup(&goal, &observed_index).is_none());
        assert!(pick_orphan(&goal, &observed).is_none());
    }

    #[test]
    fn test_next_startup_starts_missing_container() {
        let specs = vec![spec("web", "h1")];
        let goal = goal_index(&specs);

        let observed_index = HashMap::new();
        match next_startup(&goal, &observed_index) {
            Some(Startup::Start(started)) => assert_eq!(started.name, "web"),
            _ => panic!("expected a start action"),
        }
    }

    #[test]
    fn test_next_startup_kickstarts_exited_container() {
        let specs = vec![spec("web", "h1")];
        let goal = goal_index(&specs);

        let observed = vec![entry("h1", true, &[])];
        let observed_index: HashMap<&str, &PsEntry> =
            observed.iter().map(|e| (e.hash(), e)).collect();

        match next_startup(&goal, &observed_index) {
            Some(Startup::Kickstart(name)) => assert_eq!(name, "web"),
            _ => panic!("expected a kickstart action"),
        }
    }

    #[test]
    fn test_next_startup_honors_kickstart_false() {
        let specs = vec![spec("web", "h1")];
        let goal = goal_index(&specs);

        let observed = vec![entry("h1", true, &[("kickstart", "false")])];
        let observed_index: HashMap<&str, &PsEntry> =
            observed.iter().map(|e| (e.hash(), e)).collect();

        assert!(next_startup(&goal, &observed_index).is_none());
    }

    #[test]
    fn test_ps_entry_tolerates_null_labels() {
        let parsed: Vec<PsEntry> =
            serde_json::from_str(r#"[{"Names": ["a"], "Labels": null, "Exited": true}]"#).unwrap();
        assert!(parsed[0].labels.is_empty());
        assert!(parsed[0].exited);
    }
}
