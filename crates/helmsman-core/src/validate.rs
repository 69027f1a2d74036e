//! Structural validation of a merged desired state

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, error};

use crate::error::{CoreError, Result};
use crate::flags::RunFlags;
use crate::hooks::{resolve_executable, HookKind};
use crate::loader::is_blob_uri;
use crate::release::{Release, ReleaseKey};
use crate::state::{State, KUBE_SYSTEM};

/// Maximum edit distance for "did you mean" hints
const MAX_SUGGESTION_DISTANCE: usize = 3;

const VALUES_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const REPO_SCHEMES: &[&str] = &["http", "https", "oci", "s3", "gs", "az", "file"];

/// Validate `state` for this run
///
/// In destroy mode or with `skip_validation` only release uniqueness is checked.
/// Every section is checked; all violations are logged and the first one is returned.
pub fn validate(state: &State, flags: &RunFlags) -> Result<()> {
    let violations = if flags.destroy || flags.skip_validation {
        debug!("Skipping desired state validation");
        check_uniqueness(state)
    } else {
        collect_violations(state, flags)
    };

    let mut violations = violations.into_iter();
    let Some(first) = violations.next() else {
        return Ok(());
    };
    for other in violations {
        error!("{}", other);
    }
    Err(first)
}

/// Every violation found, section by section
pub fn collect_violations(state: &State, flags: &RunFlags) -> Vec<CoreError> {
    let mut out = Vec::new();
    check_settings(state, &mut out);
    check_certificates(state, &mut out);
    check_namespaces(state, &mut out);
    check_repos(state, &mut out);
    for (label, release) in &state.apps {
        check_release(state, flags, label, release, &mut out);
    }
    out.extend(check_uniqueness(state));
    out
}

fn check_settings(state: &State, out: &mut Vec<CoreError>) {
    let settings = &state.settings;
    if settings.storage().is_none() {
        out.push(CoreError::validation(
            "settings.storageBackend",
            format!("unknown backend '{}', expected secret or configmap", settings.storage_backend),
        ));
    }

    if !settings.cluster_uri.is_empty() {
        if settings.kube_context.is_empty() {
            out.push(CoreError::validation(
                "settings.kubeContext",
                "a context name is required when clusterURI is set",
            ));
        }
        if let Err(e) = url::Url::parse(&settings.cluster_uri) {
            out.push(CoreError::validation(
                "settings.clusterURI",
                format!("'{}' is not a valid URL: {}", settings.cluster_uri, e),
            ));
        }
        if settings.uses_bearer_token() {
            if !settings.bearer_token_path.is_empty()
                && !Path::new(&settings.bearer_token_path).is_file()
            {
                out.push(CoreError::validation(
                    "settings.bearerTokenPath",
                    format!("'{}' is not a readable file", settings.bearer_token_path),
                ));
            }
        } else if settings.username.is_empty() || settings.password.is_empty() {
            out.push(CoreError::validation(
                "settings",
                "username and password are required when clusterURI is set without bearerToken",
            ));
        }
    }

    if !settings.slack_webhook.is_empty() && url::Url::parse(&settings.slack_webhook).is_err() {
        out.push(CoreError::validation(
            "settings.slackWebhook",
            "not a valid URL",
        ));
    }

    if settings.eyaml() {
        for (field, path) in [
            ("settings.eyamlPrivateKeyPath", &settings.eyaml_private_key_path),
            ("settings.eyamlPublicKeyPath", &settings.eyaml_public_key_path),
        ] {
            if !path.is_empty() && !Path::new(path).is_file() {
                out.push(CoreError::validation(
                    field,
                    format!("'{}' is not a readable file", path),
                ));
            }
        }
        if settings.eyaml_private_key_path.is_empty() != settings.eyaml_public_key_path.is_empty() {
            out.push(CoreError::validation(
                "settings",
                "eyamlPrivateKeyPath and eyamlPublicKeyPath must be set together",
            ));
        }
    }

    for (kind, action) in settings.global_hooks.actions() {
        if let Err(message) = action.check() {
            out.push(CoreError::validation(
                format!("settings.globalHooks.{}", kind),
                message,
            ));
        }
    }
}

fn check_certificates(state: &State, out: &mut Vec<CoreError>) {
    let settings = &state.settings;
    if !settings.cluster_uri.is_empty() {
        let mut required = vec!["caCrt"];
        if !settings.uses_bearer_token() {
            required.push("caKey");
        }
        for key in required {
            if !state.certificates.contains_key(key) {
                out.push(CoreError::validation(
                    "certificates",
                    format!("'{}' is required when clusterURI is set", key),
                ));
            }
        }
    }

    for (name, location) in &state.certificates {
        if is_blob_uri(location) {
            out.push(CoreError::validation(
                format!("certificates.{}", name),
                format!("'{}' was not downloaded", location),
            ));
        } else if !Path::new(location).is_file() {
            out.push(CoreError::validation(
                format!("certificates.{}", name),
                format!("'{}' is not a readable file", location),
            ));
        }
    }
}

fn check_namespaces(state: &State, out: &mut Vec<CoreError>) {
    for (name, ns) in &state.namespaces {
        if !is_dns_label(name) {
            out.push(CoreError::validation(
                format!("namespaces.{}", name),
                "namespace names must be lowercase alphanumerics or '-'",
            ));
        }
        if let Some(quotas) = &ns.quotas {
            for custom in &quotas.custom_quotas {
                if custom.name.is_empty() || custom.value.is_empty() {
                    out.push(CoreError::validation(
                        format!("namespaces.{}.quotas.customQuotas", name),
                        "name and value are required",
                    ));
                }
            }
        }
    }
}

fn check_repos(state: &State, out: &mut Vec<CoreError>) {
    for (name, raw) in &state.helm_repos {
        let entity = format!("helmRepos.{}", name);
        match url::Url::parse(raw) {
            Ok(parsed) if REPO_SCHEMES.contains(&parsed.scheme()) => {}
            Ok(parsed) => out.push(CoreError::validation(
                entity,
                format!("unsupported repository scheme '{}'", parsed.scheme()),
            )),
            Err(e) => out.push(CoreError::validation(
                entity,
                format!("'{}' is not a valid URL: {}", raw, e),
            )),
        }
    }
}

fn check_release(
    state: &State,
    flags: &RunFlags,
    label: &str,
    release: &Release,
    out: &mut Vec<CoreError>,
) {
    let entity = |field: &str| {
        if field.is_empty() {
            format!("apps.{}", label)
        } else {
            format!("apps.{}.{}", label, field)
        }
    };

    if release.name.is_empty() {
        out.push(CoreError::validation(entity("name"), "release name is required"));
    }

    check_release_namespace(state, flags, release, &entity("namespace"), out);

    if release.chart.is_empty() {
        out.push(CoreError::validation(entity("chart"), "chart is required"));
    } else if release.is_local_chart() {
        if !Path::new(&release.chart).is_dir() {
            out.push(CoreError::validation(
                entity("chart"),
                format!("local chart '{}' is not a directory", release.chart),
            ));
        }
    } else if !release.is_oci_chart() {
        match release.chart_repo() {
            Some(repo) if state.has_repo(repo) => {}
            Some(repo) => {
                let candidates: Vec<&str> = state
                    .helm_repos
                    .keys()
                    .map(String::as_str)
                    .chain(state.preconfigured_helm_repos.iter().map(String::as_str))
                    .collect();
                out.push(CoreError::validation(
                    entity("chart"),
                    with_suggestion(
                        format!("repository '{}' is neither declared in helmRepos nor preconfigured", repo),
                        repo,
                        &candidates,
                    ),
                ));
            }
            None => out.push(CoreError::validation(
                entity("chart"),
                format!("'{}' is neither repo/name nor an existing local chart", release.chart),
            )),
        }
    }

    if release.version.is_empty() {
        out.push(CoreError::validation(entity("version"), "version is required"));
    }

    if release.priority() > 0 {
        out.push(CoreError::validation(
            entity("priority"),
            format!("priority must be <= 0, got {}", release.priority()),
        ));
    }

    check_files(
        &entity("valuesFile"),
        &release.values_file,
        &release.values_files,
        out,
    );
    check_files(
        &entity("secretsFile"),
        &release.secrets_file,
        &release.secrets_files,
        out,
    );

    for (key, file) in &release.set_file {
        if !Path::new(file).is_file() {
            out.push(CoreError::validation(
                entity("setFile"),
                format!("'{}' for key '{}' is not a readable file", file, key),
            ));
        }
    }

    if !release.post_renderer.is_empty() && resolve_executable(&release.post_renderer).is_none() {
        out.push(CoreError::validation(
            entity("postRenderer"),
            format!("'{}' is not an executable", release.post_renderer),
        ));
    }

    for kind in HookKind::ALL {
        let Some(action) = release.hooks.action(kind) else {
            continue;
        };
        if let Err(message) = action.check() {
            out.push(CoreError::validation(
                format!("apps.{}.hooks.{}", label, kind),
                message,
            ));
        }
    }
}

fn check_release_namespace(
    state: &State,
    flags: &RunFlags,
    release: &Release,
    entity: &str,
    out: &mut Vec<CoreError>,
) {
    let ns = release.namespace.as_str();
    if ns.is_empty() {
        out.push(CoreError::validation(entity, "namespace is required"));
        return;
    }
    let declared = ns == KUBE_SYSTEM
        || state.namespaces.contains_key(ns)
        || flags.ns_override.as_deref() == Some(ns);
    if !declared {
        let candidates: Vec<&str> = state.namespaces.keys().map(String::as_str).collect();
        out.push(CoreError::validation(
            entity,
            with_suggestion(
                format!("namespace '{}' is not declared in namespaces", ns),
                ns,
                &candidates,
            ),
        ));
    }
}

fn check_files(entity: &str, single: &str, plural: &[String], out: &mut Vec<CoreError>) {
    if !single.is_empty() && !plural.is_empty() {
        out.push(CoreError::validation(
            entity,
            "the singular and plural forms cannot be combined",
        ));
    }
    for file in std::iter::once(single)
        .filter(|f| !f.is_empty())
        .chain(plural.iter().map(String::as_str))
    {
        let path = Path::new(file);
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| VALUES_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !ext_ok {
            out.push(CoreError::validation(
                entity,
                format!("'{}' must have a .yaml, .yml or .json extension", file),
            ));
        } else if !path.is_file() {
            out.push(CoreError::validation(
                entity,
                format!("'{}' is not a readable file", file),
            ));
        }
    }
}

/// (name, namespace) pairs must be unique across apps
fn check_uniqueness(state: &State) -> Vec<CoreError> {
    let mut seen: BTreeMap<ReleaseKey, &str> = BTreeMap::new();
    let mut out = Vec::new();
    for (label, release) in &state.apps {
        if let Some(first) = seen.insert(release.key(), label) {
            out.push(CoreError::validation(
                format!("apps.{}", label),
                format!(
                    "release '{}' in namespace '{}' is also defined by apps.{}",
                    release.name, release.namespace, first
                ),
            ));
        }
    }
    out
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

fn with_suggestion(message: String, input: &str, candidates: &[&str]) -> String {
    let best = candidates
        .iter()
        .map(|c| (strsim::levenshtein(input, c), *c))
        .filter(|(d, _)| *d > 0 && *d <= MAX_SUGGESTION_DISTANCE)
        .min_by_key(|(d, _)| *d);
    match best {
        Some((_, candidate)) => format!("{} (did you mean '{}'?)", message, candidate),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Namespace;
    use std::fs;

    fn base_state() -> State {
        let mut state = State::default();
        state.namespaces.insert("staging".to_string(), Namespace::default());
        state
            .helm_repos
            .insert("stable".to_string(), "https://charts.helm.sh/stable".to_string());
        state.apps.insert(
            "jenkins".to_string(),
            Release {
                name: "jenkins".to_string(),
                namespace: "staging".to_string(),
                chart: "stable/jenkins".to_string(),
                version: "0.9.0".to_string(),
                enabled: Some(true),
                ..Default::default()
            },
        );
        state
    }

    fn first_message(state: &State, flags: &RunFlags) -> String {
        validate(state, flags).unwrap_err().to_string()
    }

    #[test]
    fn test_valid_state() {
        assert!(validate(&base_state(), &RunFlags::default()).is_ok());
    }

    #[test]
    fn test_undeclared_namespace_suggests() {
        let mut state = base_state();
        state.apps.get_mut("jenkins").unwrap().namespace = "stagin".to_string();
        let msg = first_message(&state, &RunFlags::default());
        assert!(msg.contains("apps.jenkins.namespace"), "{msg}");
        assert!(msg.contains("did you mean 'staging'"), "{msg}");
    }

    #[test]
    fn test_ns_override_and_kube_system_allowed() {
        let mut state = base_state();
        state.apps.get_mut("jenkins").unwrap().namespace = KUBE_SYSTEM.to_string();
        assert!(validate(&state, &RunFlags::default()).is_ok());

        state.apps.get_mut("jenkins").unwrap().namespace = "sandbox".to_string();
        let flags = RunFlags {
            ns_override: Some("sandbox".to_string()),
            ..Default::default()
        };
        assert!(validate(&state, &flags).is_ok());
    }

    #[test]
    fn test_unknown_repo() {
        let mut state = base_state();
        state.apps.get_mut("jenkins").unwrap().chart = "stabel/jenkins".to_string();
        let msg = first_message(&state, &RunFlags::default());
        assert!(msg.contains("did you mean 'stable'"), "{msg}");

        state.preconfigured_helm_repos.push("stabel".to_string());
        assert!(validate(&state, &RunFlags::default()).is_ok());
    }

    #[test]
    fn test_positive_priority_rejected() {
        let mut state = base_state();
        state.apps.get_mut("jenkins").unwrap().priority = Some(3);
        assert!(first_message(&state, &RunFlags::default()).contains("priority"));
    }

    #[test]
    fn test_values_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("values.yaml");
        let bad_ext = dir.path().join("values.txt");
        fs::write(&good, "a: 1").unwrap();
        fs::write(&bad_ext, "a: 1").unwrap();

        let mut state = base_state();
        let app = state.apps.get_mut("jenkins").unwrap();
        app.values_file = good.display().to_string();
        assert!(validate(&state, &RunFlags::default()).is_ok());

        let app = state.apps.get_mut("jenkins").unwrap();
        app.values_files = vec![good.display().to_string()];
        assert!(first_message(&state, &RunFlags::default()).contains("cannot be combined"));

        let app = state.apps.get_mut("jenkins").unwrap();
        app.values_files.clear();
        app.values_file = bad_ext.display().to_string();
        assert!(first_message(&state, &RunFlags::default()).contains("extension"));
    }

    #[test]
    fn test_duplicate_release_checked_even_when_skipping() {
        let mut state = base_state();
        let mut dup = state.apps["jenkins"].clone();
        dup.chart = "missing/jenkins".to_string();
        state.apps.insert("jenkins-copy".to_string(), dup);

        let flags = RunFlags {
            skip_validation: true,
            ..Default::default()
        };
        let msg = first_message(&state, &flags);
        assert!(msg.contains("also defined by apps.jenkins"), "{msg}");

        // Distinct namespaces may share a name
        state.namespaces.insert("prod".to_string(), Namespace::default());
        state.apps.get_mut("jenkins-copy").unwrap().namespace = "prod".to_string();
        assert!(validate(&state, &flags).is_ok());
    }

    #[test]
    fn test_cluster_settings() {
        let mut state = base_state();
        state.settings.cluster_uri = "https://k8s.example.com".to_string();
        let violations = collect_violations(&state, &RunFlags::default());
        let text: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
        assert!(text.iter().any(|m| m.contains("kubeContext")), "{text:?}");
        assert!(text.iter().any(|m| m.contains("username and password")), "{text:?}");
        assert!(text.iter().any(|m| m.contains("'caCrt' is required")), "{text:?}");
    }
}
