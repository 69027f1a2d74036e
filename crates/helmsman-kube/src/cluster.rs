//! Cluster and environment preparation run before any release work
//!
//! Selecting the kube context, checking the helm toolchain, registering
//! repositories and preparing namespaces.

use std::collections::BTreeMap;

use helmsman_core::{Namespace, RunFlags, State};
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::command::{Command, CommandRunner};
use crate::error::{KubeError, Result};

/// What the local helm installation supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelmEnvironment {
    pub version: String,
    pub diff_plugin: bool,
    pub secrets_plugin: bool,
}

/// Check helm is v3 and detect the diff and secrets plugins
pub async fn check_environment(runner: &dyn CommandRunner, state: &State) -> Result<HelmEnvironment> {
    let version = runner
        .run(&Command::helm().args(["version", "--short"]).describe("Checking helm version"))
        .await;
    if !version.success() {
        return Err(KubeError::Environment(format!(
            "helm is not installed or not working: {}",
            version.stderr.trim()
        )));
    }
    let version = version.stdout.trim().to_string();
    if !version.starts_with("v3.") {
        return Err(KubeError::Environment(format!(
            "helm v3 is required, found '{}'",
            version
        )));
    }

    let kubectl = runner
        .run(&Command::kubectl().args(["version", "--client"]).describe("Checking kubectl"))
        .await;
    if !kubectl.success() {
        return Err(KubeError::Environment(format!(
            "kubectl is not installed or not working: {}",
            kubectl.stderr.trim()
        )));
    }

    let plugins = runner
        .run(&Command::helm().args(["plugin", "list"]).describe("Listing helm plugins"))
        .await;
    let installed: Vec<&str> = plugins
        .stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    let env = HelmEnvironment {
        version,
        diff_plugin: installed.contains(&"diff"),
        secrets_plugin: installed.contains(&"secrets"),
    };

    if !env.diff_plugin {
        warn!("helm diff plugin is not installed, falling back to kubectl diff");
    }
    let needs_secrets = state
        .selected_apps()
        .any(|(_, r)| r.is_enabled() && !r.all_secrets_files().is_empty());
    if needs_secrets && !state.settings.eyaml() && !env.secrets_plugin {
        return Err(KubeError::Environment(
            "helm secrets plugin is required to decrypt secrets files".to_string(),
        ));
    }
    debug!("helm environment: {:?}", env);
    Ok(env)
}

/// Select (or create) the kube context named in settings
pub async fn set_kube_context(runner: &dyn CommandRunner, state: &State) -> Result<()> {
    let settings = &state.settings;
    if settings.kube_context.is_empty() {
        warn!("settings.kubeContext is not set, using the current kube context");
        return Ok(());
    }

    let use_context = Command::kubectl()
        .args(["config", "use-context", settings.kube_context.as_str()])
        .describe(format!("Setting kube context to [ {} ]", settings.kube_context));
    let out = runner.run(&use_context).await;
    if out.success() {
        return Ok(());
    }
    if settings.cluster_uri.is_empty() {
        return Err(KubeError::Environment(format!(
            "kube context [ {} ] does not exist and no clusterURI is set to create it",
            settings.kube_context
        )));
    }

    info!("Creating kube context [ {} ]", settings.kube_context);
    let user = if settings.username.is_empty() {
        settings.kube_context.clone()
    } else {
        settings.username.clone()
    };

    let mut credentials = Command::kubectl()
        .args(["config", "set-credentials", user.as_str()])
        .describe(format!("Setting credentials for user [ {} ]", user));
    if settings.uses_bearer_token() {
        let token = read_bearer_token(&settings.bearer_token_path).await?;
        credentials = credentials.arg(format!("--token={}", token));
    } else {
        credentials = credentials.arg(format!("--password={}", settings.password));
        if let Some(key) = state.certificates.get("caKey") {
            credentials = credentials.arg(format!("--client-key={}", key));
        }
        if let Some(cert) = state.certificates.get("caClient") {
            credentials = credentials.arg(format!("--client-certificate={}", cert));
        }
    }
    runner.run_checked(&credentials).await?;

    let mut cluster = Command::kubectl()
        .args(["config", "set-cluster", settings.kube_context.as_str()])
        .arg(format!("--server={}", settings.cluster_uri))
        .describe(format!("Setting cluster [ {} ]", settings.kube_context));
    if let Some(ca) = state.certificates.get("caCrt") {
        cluster = cluster.arg(format!("--certificate-authority={}", ca));
    }
    runner.run_checked(&cluster).await?;

    let context = Command::kubectl()
        .args(["config", "set-context", settings.kube_context.as_str()])
        .arg(format!("--cluster={}", settings.kube_context))
        .arg(format!("--user={}", user))
        .describe(format!("Creating kube context [ {} ]", settings.kube_context));
    runner.run_checked(&context).await?;
    runner.run_checked(&use_context).await?;
    Ok(())
}

async fn read_bearer_token(path: &str) -> Result<String> {
    let path = if path.is_empty() {
        "/var/run/secrets/kubernetes.io/serviceaccount/token"
    } else {
        path
    };
    Ok(tokio::fs::read_to_string(path).await?.trim().to_string())
}

/// Repository URL with credentials split out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RepoSpec {
    /// Strip `user:pass@` from the URL
    pub fn parse(raw: &str) -> Self {
        let Ok(mut url) = Url::parse(raw) else {
            return Self {
                url: raw.to_string(),
                username: None,
                password: None,
            };
        };
        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(str::to_string);
        if username.is_some() || password.is_some() {
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }
        Self {
            url: url.to_string().trim_end_matches('/').to_string(),
            username,
            password,
        }
    }

    pub fn is_oci(&self) -> bool {
        self.url.starts_with("oci://")
    }
}

/// Register declared helm repositories and refresh their indexes
pub async fn add_helm_repos(runner: &dyn CommandRunner, state: &State, flags: &RunFlags) -> Result<()> {
    let mut added = 0;
    for (name, raw) in &state.helm_repos {
        if state.preconfigured_helm_repos.iter().any(|r| r == name) {
            continue;
        }
        let repo = RepoSpec::parse(raw);
        if repo.is_oci() {
            if let (Some(user), Some(pass)) = (&repo.username, &repo.password) {
                let host = repo.url.trim_start_matches("oci://");
                let host = host.split('/').next().unwrap_or(host);
                let login = Command::helm()
                    .args(["registry", "login", host, "--username", user.as_str(), "--password-stdin"])
                    .with_stdin(pass.clone())
                    .describe(format!("Logging in to registry [ {} ]", host));
                runner.run_checked(&login).await?;
            }
            continue;
        }

        let mut cmd = Command::helm()
            .args(["repo", "add", name.as_str(), repo.url.as_str(), "--force-update"]);
        if let Some(user) = &repo.username {
            cmd = cmd.args(["--username", user.as_str()]);
        }
        if let Some(pass) = &repo.password {
            cmd = cmd.args(["--password", pass.as_str()]);
        }
        let cmd = cmd.describe(format!("Adding helm repository [ {} ]", name));
        runner.run_checked(&cmd).await?;
        added += 1;
    }

    if added > 0 && !flags.no_update {
        let update = Command::helm()
            .args(["repo", "update"])
            .describe("Updating helm repositories");
        runner.run_checked(&update).await?;
    }
    Ok(())
}

/// Create namespaces and apply their labels, annotations, limits and quotas
pub async fn prepare_namespaces(runner: &dyn CommandRunner, state: &State, flags: &RunFlags) -> Result<()> {
    let targets: BTreeMap<String, Namespace> = match &flags.ns_override {
        Some(ns) => BTreeMap::from([(
            ns.clone(),
            state.namespaces.get(ns).cloned().unwrap_or_default(),
        )]),
        None => state
            .active_namespaces()
            .into_iter()
            .filter_map(|name| state.namespaces.get(&name).map(|ns| (name, ns.clone())))
            .collect(),
    };

    for (name, ns) in &targets {
        let exists = runner
            .run(&Command::kubectl().args(["get", "namespace", name.as_str()]))
            .await;
        if !exists.success() {
            let create = Command::kubectl()
                .args(["create", "namespace", name.as_str()])
                .describe(format!("Creating namespace [ {} ]", name));
            // may have been created concurrently
            if !runner.run(&create).await.success() {
                runner
                    .run_checked(&Command::kubectl().args(["get", "namespace", name.as_str()]))
                    .await?;
            }
        }
        for cmd in namespace_commands(name, ns)
            .into_iter()
            .chain(namespace_object_commands(name, ns)?)
        {
            runner.run_checked(&cmd).await?;
        }
    }
    Ok(())
}

/// Label and annotate commands for a namespace
fn namespace_commands(name: &str, ns: &Namespace) -> Vec<Command> {
    let mut cmds = Vec::new();
    for (verb, pairs) in [("label", &ns.labels), ("annotate", &ns.annotations)] {
        if pairs.is_empty() {
            continue;
        }
        cmds.push(
            Command::kubectl()
                .args([verb, "--overwrite", "namespace", name])
                .args(pairs.iter().map(|(k, v)| format!("{}={}", k, v)))
                .describe(format!("Applying {}s to namespace [ {} ]", verb, name)),
        );
    }
    cmds
}

/// LimitRange and ResourceQuota objects, applied from stdin
fn namespace_object_commands(name: &str, ns: &Namespace) -> Result<Vec<Command>> {
    let mut cmds = Vec::new();
    if !ns.limits.is_empty() {
        let limit_range = json!({
            "apiVersion": "v1",
            "kind": "LimitRange",
            "metadata": {"name": "limit-range", "namespace": name},
            "spec": {"limits": ns.limits},
        });
        cmds.push(
            Command::kubectl()
                .args(["apply", "-n", name, "-f", "-"])
                .with_stdin(serde_json::to_string(&limit_range)?)
                .describe(format!("Applying limit range to namespace [ {} ]", name)),
        );
    }
    if let Some(quotas) = &ns.quotas {
        let hard = quotas.hard();
        if !hard.is_empty() {
            let quota = json!({
                "apiVersion": "v1",
                "kind": "ResourceQuota",
                "metadata": {"name": "resource-quota", "namespace": name},
                "spec": {"hard": hard},
            });
            cmds.push(
                Command::kubectl()
                    .args(["apply", "-n", name, "-f", "-"])
                    .with_stdin(serde_json::to_string(&quota)?)
                    .describe(format!("Applying resource quota to namespace [ {} ]", name)),
            );
        }
    }
    Ok(cmds)
}
