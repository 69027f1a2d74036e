//! Release operation builders
//!
//! Pure functions from a release and the run configuration to [`Command`]s.
//! Nothing here runs anything; the plan owns execution.

use helmsman_core::hooks::{HookAction, HookControl};
use helmsman_core::{Release, RunFlags, Settings, StorageBackend};

use crate::command::Command;
use crate::current::{CONTEXT_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, NAMESPACE_LABEL};

/// A hook step and whether its failure may be ignored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookStep {
    pub command: Command,
    pub best_effort: bool,
}

/// Builds helm and kubectl commands for releases
#[derive(Debug, Clone, Copy)]
pub struct ReleaseOps<'a> {
    flags: &'a RunFlags,
    settings: &'a Settings,
    context: &'a str,
}

impl<'a> ReleaseOps<'a> {
    pub fn new(flags: &'a RunFlags, settings: &'a Settings, context: &'a str) -> Self {
        Self {
            flags,
            settings,
            context,
        }
    }

    pub fn backend(&self) -> StorageBackend {
        self.settings.storage_or_default()
    }

    /// `helm install`; `secrets` are the decrypted secrets files
    pub fn install(&self, r: &Release, secrets: &[String]) -> Command {
        let cmd = Command::helm()
            .args(["install", r.name.as_str(), r.chart.as_str()])
            .args(self.chart_args(r))
            .args(value_args(r, secrets))
            .args(self.behaviour_args(r))
            .args(self.global_args())
            .args(r.helm_flags.iter().cloned())
            .args(self.dry_run_args());
        cmd.describe(format!(
            "Installing release [ {} ] version [ {} ] in namespace [ {} ]",
            r.name, r.version, r.namespace
        ))
    }

    /// `helm upgrade`, with `--history-max` and `--force` as configured
    pub fn upgrade(&self, r: &Release, secrets: &[String]) -> Command {
        let mut cmd = Command::helm()
            .args(["upgrade", r.name.as_str(), r.chart.as_str()])
            .args(self.chart_args(r))
            .args(value_args(r, secrets))
            .args(self.behaviour_args(r));
        if let Some(max) = r.max_history.or(self.settings.global_max_history) {
            cmd = cmd.args(["--history-max".to_string(), max.to_string()]);
        }
        if self.flags.force_upgrades {
            cmd = cmd.arg("--force");
        }
        cmd.args(self.global_args())
            .args(r.helm_flags.iter().cloned())
            .args(self.dry_run_args())
            .describe(format!(
                "Upgrading release [ {} ] to version [ {} ] in namespace [ {} ]",
                r.name, r.version, r.namespace
            ))
    }

    pub fn uninstall(&self, name: &str, namespace: &str) -> Command {
        Command::helm()
            .args(["uninstall", name, "--namespace", namespace])
            .args(self.global_args())
            .args(self.dry_run_args())
            .describe(format!(
                "Deleting release [ {} ] in namespace [ {} ]",
                name, namespace
            ))
    }

    pub fn rollback(&self, r: &Release, revision: u32) -> Command {
        Command::helm()
            .args(["rollback", r.name.as_str()])
            .arg(revision.to_string())
            .args(["--namespace", r.namespace.as_str()])
            .args(self.global_args())
            .args(self.dry_run_args())
            .describe(format!(
                "Rolling back release [ {} ] in namespace [ {} ]",
                r.name, r.namespace
            ))
    }

    pub fn test(&self, r: &Release) -> Command {
        Command::helm()
            .args(["test", r.name.as_str(), "--namespace", r.namespace.as_str()])
            .args(self.global_args())
            .describe(format!(
                "Running tests for release [ {} ] in namespace [ {} ]",
                r.name, r.namespace
            ))
    }

    /// `helm diff upgrade` against the desired chart and values
    pub fn diff(&self, r: &Release, secrets: &[String]) -> Command {
        let mut cmd = Command::helm()
            .args(["diff", "upgrade", r.name.as_str(), r.chart.as_str()])
            .args(self.chart_args(r))
            .args(value_args(r, secrets));
        if !self.flags.show_secrets {
            cmd = cmd.arg("--suppress-secrets");
        }
        if let Some(lines) = self.flags.diff_context {
            cmd = cmd.args(["--context".to_string(), lines.to_string()]);
        }
        cmd.args(self.global_args())
            .args(r.helm_diff_flags.iter().cloned())
            .describe(format!(
                "Diffing release [ {} ] in namespace [ {} ]",
                r.name, r.namespace
            ))
    }

    /// `helm template`, rendered for the kubectl diff driver
    pub fn template(&self, r: &Release, secrets: &[String]) -> Command {
        Command::helm()
            .args(["template", r.name.as_str(), r.chart.as_str()])
            .args(self.chart_args(r))
            .args(value_args(r, secrets))
            .args(self.global_args())
            .describe(format!("Rendering release [ {} ]", r.name))
    }

    /// `kubectl diff` reading a rendered manifest from stdin
    pub fn kubectl_diff(&self, r: &Release, manifest: String) -> Command {
        Command::kubectl()
            .args(["diff", "-n", r.namespace.as_str(), "-f", "-"])
            .with_stdin(manifest)
            .describe(format!(
                "Diffing release [ {} ] in namespace [ {} ] with kubectl",
                r.name, r.namespace
            ))
    }

    pub fn dependency_update(&self, chart_dir: &str) -> Command {
        Command::helm()
            .args(["dependency", "update", chart_dir])
            .describe(format!("Updating dependencies for local chart [ {} ]", chart_dir))
    }

    /// Stamp ownership labels on the release's storage objects
    pub fn label(&self, name: &str, namespace: &str) -> Command {
        Command::kubectl()
            .args(["label", self.backend().kind(), "-n", namespace, "-l"])
            .arg(format!("owner=helm,name={}", name))
            .arg(format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE))
            .arg(format!("{}={}", NAMESPACE_LABEL, namespace))
            .arg(format!("{}={}", CONTEXT_LABEL, self.context))
            .arg("--overwrite")
            .describe(format!(
                "Applying labels to release [ {} ] in namespace [ {} ]",
                name, namespace
            ))
    }

    /// Commands implementing one hook action
    pub fn hook(&self, r: &Release, hook: &str, action: &HookAction, control: &HookControl) -> Vec<HookStep> {
        let Some(source) = action.manifest_source() else {
            return match action {
                HookAction::Exec(argv) => vec![HookStep {
                    command: Command::from_argv(argv).describe(format!(
                        "Running {} hook for release [ {} ]",
                        hook, r.name
                    )),
                    best_effort: false,
                }],
                _ => Vec::new(),
            };
        };

        let ns = r.namespace.as_str();
        let mut apply = Command::kubectl().args(["apply", "-n", ns, "-f", source.as_str()]);
        if self.flags.dry_run {
            apply = apply.arg("--dry-run=client");
        }
        let mut steps = vec![HookStep {
            command: apply.describe(format!(
                "Applying {} hook [ {} ] for release [ {} ]",
                hook, source, r.name
            )),
            best_effort: false,
        }];
        if self.flags.dry_run {
            return steps;
        }

        if let Some(condition) = &control.success_condition {
            steps.push(HookStep {
                command: Command::kubectl()
                    .args(["wait", "-n", ns, "-f", source.as_str()])
                    .arg(format!("--for=condition={}", condition))
                    .arg(format!("--timeout={}", control.success_timeout))
                    .describe(format!(
                        "Waiting for {} hook [ {} ] of release [ {} ] to reach {}",
                        hook, source, r.name, condition
                    )),
                best_effort: false,
            });
        }
        if control.delete_on_success {
            steps.push(HookStep {
                command: Command::kubectl()
                    .args(["delete", "-n", ns, "-f", source.as_str()])
                    .describe(format!(
                        "Deleting {} hook [ {} ] of release [ {} ]",
                        hook, source, r.name
                    )),
                best_effort: true,
            });
        }
        steps
    }

    /// `--namespace` and `--version`
    fn chart_args(&self, r: &Release) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), r.namespace.clone()];
        if !r.version.is_empty() {
            args.push("--version".to_string());
            args.push(r.version.clone());
        }
        args
    }

    fn behaviour_args(&self, r: &Release) -> Vec<String> {
        let mut args = Vec::new();
        if !r.description.is_empty() {
            args.push("--description".to_string());
            args.push(r.description.clone());
        }
        if r.wait.unwrap_or(false) {
            args.push("--wait".to_string());
        }
        if let Some(timeout) = r.timeout {
            args.push("--timeout".to_string());
            args.push(format!("{}s", timeout));
        }
        if r.no_hooks.unwrap_or(false) {
            args.push("--no-hooks".to_string());
        }
        if !r.post_renderer.is_empty() {
            args.push("--post-renderer".to_string());
            args.push(r.post_renderer.clone());
        }
        args
    }

    fn global_args(&self) -> Vec<String> {
        self.settings.global_helm_flags.clone()
    }

    fn dry_run_args(&self) -> Vec<String> {
        if self.flags.dry_run {
            vec!["--dry-run".to_string(), "--debug".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// `-f` values then secrets, followed by `--set`, `--set-string` and `--set-file`
fn value_args(r: &Release, secrets: &[String]) -> Vec<String> {
    let mut args = Vec::new();
    for file in r.all_values_files().into_iter().chain(secrets.iter().map(String::as_str)) {
        args.push("-f".to_string());
        args.push(file.to_string());
    }
    for (flag, pairs) in [
        ("--set", &r.set),
        ("--set-string", &r.set_string),
        ("--set-file", &r.set_file),
    ] {
        for (key, value) in pairs {
            args.push(flag.to_string());
            args.push(format!("{}={}", key, value));
        }
    }
    args
}
