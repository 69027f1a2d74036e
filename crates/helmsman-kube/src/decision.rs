//! The decision maker: compares desired releases with observed ones and fills a [`Plan`]
//!
//! Each app is decided independently (up to `parallel` at a time) into an
//! [`Outcome`]; outcomes are appended to the plan in app order so the plan is
//! deterministic whatever the pool size.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use helmsman_core::hooks::HookKind;
use helmsman_core::{ChartInfo, Release, ReleaseKey, RunFlags, State};
use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::current::{CurrentState, HelmRelease, Observer, ReleaseStatus};
use crate::error::{KubeError, Result};
use crate::ops::ReleaseOps;
use crate::plan::{Decision, DecisionType, Plan, PlannedCommand};
use crate::resolver::ChartCache;
use crate::secrets::SecretDecryptor;

/// Priority of untracked release removal; runs before any user work
pub const UNTRACKED_PRIORITY: i32 = -800;

/// Delay between status polls of a pending release
pub const PENDING_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How "are there changes?" is answered for an unchanged chart version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffDriver {
    /// `helm diff upgrade`
    Helm,
    /// `helm template | kubectl diff -f -`
    Kubectl,
}

/// Decisions and commands for one app
#[derive(Debug, Default)]
pub struct Outcome {
    pub decisions: Vec<Decision>,
    pub commands: Vec<PlannedCommand>,
    /// Observed keys this app takes over (namespace moves)
    pub claimed: Vec<ReleaseKey>,
}

impl Outcome {
    fn decide(&mut self, description: impl Into<String>, priority: i32, kind: DecisionType) {
        let description = description.into();
        match kind {
            DecisionType::Noop | DecisionType::Ignored => info!("{}", description),
            _ => info!("{} [{}]", description, kind),
        }
        self.decisions.push(Decision {
            description,
            priority,
            kind,
        });
    }

    fn push(&mut self, command: PlannedCommand) {
        self.commands.push(command);
    }
}

/// Builds the plan for one run
pub struct DecisionMaker<'a> {
    state: &'a State,
    current: &'a CurrentState,
    charts: &'a ChartCache,
    flags: &'a RunFlags,
    runner: &'a dyn CommandRunner,
    ops: ReleaseOps<'a>,
    observer: Observer<'a>,
    decryptor: Option<&'a dyn SecretDecryptor>,
    diff_driver: DiffDriver,
    pending_interval: Duration,
}

impl<'a> DecisionMaker<'a> {
    pub fn new(
        state: &'a State,
        current: &'a CurrentState,
        charts: &'a ChartCache,
        flags: &'a RunFlags,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            state,
            current,
            charts,
            flags,
            runner,
            ops: ReleaseOps::new(flags, &state.settings, state.context()),
            observer: Observer::new(runner, state.settings.storage_or_default(), state.context()),
            decryptor: None,
            diff_driver: if flags.kubectl_diff {
                DiffDriver::Kubectl
            } else {
                DiffDriver::Helm
            },
            pending_interval: PENDING_POLL_INTERVAL,
        }
    }

    pub fn with_decryptor(mut self, decryptor: &'a dyn SecretDecryptor) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    pub fn with_diff_driver(mut self, driver: DiffDriver) -> Self {
        self.diff_driver = driver;
        self
    }

    pub fn with_pending_interval(mut self, interval: Duration) -> Self {
        self.pending_interval = interval;
        self
    }

    /// Decide every app, then sweep untracked releases
    pub async fn build_plan(&self) -> Result<Plan> {
        let plan = Plan::new();
        let outcomes: Vec<Result<Outcome>> = stream::iter(self.state.apps.iter())
            .map(|(label, release)| self.decide(label, release))
            .buffered(self.flags.workers())
            .collect()
            .await;

        let mut claimed = BTreeSet::new();
        for outcome in outcomes {
            let outcome = outcome?;
            claimed.extend(outcome.claimed);
            plan.extend(outcome.decisions, outcome.commands);
        }

        if let Some(sweep) = self.untracked_sweep(&claimed).await {
            plan.extend(sweep.decisions, sweep.commands);
        }

        plan.sort();
        Ok(plan)
    }

    /// Decide a single app
    pub async fn decide(&self, label: &str, r: &Release) -> Result<Outcome> {
        let mut out = Outcome::default();
        let prio = r.priority();
        let key = r.key();

        if r.ignored {
            if !self.flags.skip_ignored {
                out.decide(format!("Release [ {} ] ignored", r.name), prio, DecisionType::Ignored);
            }
            return Ok(out);
        }

        if let Some(foreign) = self.current.foreign(&key) {
            if r.is_enabled() && !self.flags.destroy {
                return Err(KubeError::Conflict {
                    release: r.name.clone(),
                    namespace: r.namespace.clone(),
                    current: self.current.context().to_string(),
                    owner: foreign.context.clone(),
                });
            }
            debug!(
                "Release [ {} ] is managed by context [ {} ], leaving it alone",
                key, foreign.context
            );
        }

        let observed = self.current.find(&key);
        let status = match observed {
            Some(obs) if obs.status.is_pending() => match self.wait_pending(r, obs).await? {
                Some(status) => Some(status),
                None => {
                    out.decide(
                        format!(
                            "Release [ {} ] in namespace [ {} ] is in status [ {} ] and will be skipped",
                            r.name, r.namespace, obs.status
                        ),
                        prio,
                        DecisionType::Ignored,
                    );
                    return Ok(out);
                }
            },
            Some(obs) => Some(obs.status.clone()),
            None => None,
        };

        if self.flags.destroy {
            match (observed, &status) {
                (Some(_), Some(status)) if *status != ReleaseStatus::Uninstalled => {
                    self.delete(&mut out, r)
                }
                _ => out.decide(
                    format!(
                        "Release [ {} ] in namespace [ {} ] is not installed, nothing to destroy",
                        r.name, r.namespace
                    ),
                    prio,
                    DecisionType::Noop,
                ),
            }
            return Ok(out);
        }

        if !r.is_enabled() {
            match &status {
                Some(status) if *status != ReleaseStatus::Uninstalled => self.delete(&mut out, r),
                Some(_) => out.decide(
                    format!(
                        "Release [ {} ] in namespace [ {} ] is disabled and already deleted",
                        r.name, r.namespace
                    ),
                    prio,
                    DecisionType::Noop,
                ),
                None => out.decide(format!("Release [ {} ] disabled", r.name), prio, DecisionType::Noop),
            }
            return Ok(out);
        }

        let secrets = self.decrypt_secrets(r).await?;
        match (observed, status) {
            (None, _) => match self.move_source(r) {
                Some(old) => self.move_namespace(&mut out, r, &old, &secrets),
                None => self.install(&mut out, r, &secrets, format!(
                    "Release [ {} ] version [ {} ] will be installed in namespace [ {} ]",
                    r.name, r.version, r.namespace
                )),
            },
            (Some(obs), Some(ReleaseStatus::Uninstalled)) => self.rollback(&mut out, r, obs),
            (Some(_), Some(ReleaseStatus::Failed)) => {
                warn!(
                    "Release [ {} ] in namespace [ {} ] is in a failed state",
                    r.name, r.namespace
                );
                if let Some(reason) = self.protection(r) {
                    out.decide(
                        format!(
                            "WARNING: Release [ {} ] in namespace [ {} ] is in a failed state and PROTECTED ({}); it will not be upgraded",
                            r.name, r.namespace, reason
                        ),
                        prio,
                        DecisionType::Noop,
                    );
                } else {
                    self.upgrade(&mut out, r, &secrets, format!(
                        "WARNING: Release [ {} ] in namespace [ {} ] is in a failed state and will be upgraded",
                        r.name, r.namespace
                    ));
                }
            }
            (Some(obs), _) => self.inspect_upgrade(&mut out, label, r, obs, &secrets).await?,
        }
        Ok(out)
    }

    /// Poll a pending release; `None` means skip it
    async fn wait_pending(&self, r: &Release, obs: &HelmRelease) -> Result<Option<ReleaseStatus>> {
        if self.flags.skip_pending {
            return Ok(None);
        }
        let key = r.key();
        let mut status = obs.status.clone();
        for attempt in 1..=self.flags.pending_max_retries {
            info!(
                "Release [ {} ] is [ {} ], waiting {:?} (attempt {}/{})",
                key, status, self.pending_interval, attempt, self.flags.pending_max_retries
            );
            tokio::time::sleep(self.pending_interval).await;
            status = self.observer.status(&key).await?;
            if !status.is_pending() {
                return Ok(Some(status));
            }
        }
        Err(KubeError::PendingRelease {
            name: r.name.clone(),
            namespace: r.namespace.clone(),
            status: status.to_string(),
        })
    }

    /// Why mutations are forbidden, if they are
    fn protection(&self, r: &Release) -> Option<String> {
        if r.is_protected() {
            return Some("release".to_string());
        }
        let ns_protected = self
            .state
            .namespace(&r.namespace)
            .is_some_and(|ns| ns.is_protected());
        if ns_protected && self.flags.ns_override.is_none() {
            return Some(format!("namespace [ {} ]", r.namespace));
        }
        None
    }

    fn protected(&self, out: &mut Outcome, r: &Release, reason: &str) {
        out.decide(
            format!(
                "Release [ {} ] in namespace [ {} ] is PROTECTED ({}). Operations are not allowed on this release until you remove its protection.",
                r.name, r.namespace, reason
            ),
            r.priority(),
            DecisionType::Noop,
        );
    }

    fn delete(&self, out: &mut Outcome, r: &Release) {
        if let Some(reason) = self.protection(r) {
            self.protected(out, r, &reason);
            return;
        }
        let prio = self.delete_priority(r.priority());
        out.decide(
            format!("Release [ {} ] in namespace [ {} ] will be deleted", r.name, r.namespace),
            prio,
            DecisionType::Delete,
        );
        let main = PlannedCommand::new(self.ops.uninstall(&r.name, &r.namespace), prio);
        self.with_hooks(out, r, prio, HookKind::PreDelete, main, HookKind::PostDelete, false);
    }

    fn delete_priority(&self, priority: i32) -> i32 {
        if self.state.settings.reverse_delete.unwrap_or(false) {
            -priority
        } else {
            priority
        }
    }

    fn install(&self, out: &mut Outcome, r: &Release, secrets: &[String], description: String) {
        let prio = r.priority();
        out.decide(description, prio, DecisionType::Create);
        let main = self.labelled(PlannedCommand::new(self.ops.install(r, secrets), prio), r);
        self.with_hooks(out, r, prio, HookKind::PreInstall, main, HookKind::PostInstall, true);
    }

    fn upgrade(&self, out: &mut Outcome, r: &Release, secrets: &[String], description: String) {
        let prio = r.priority();
        out.decide(description, prio, DecisionType::Change);
        let main = self.labelled(PlannedCommand::new(self.ops.upgrade(r, secrets), prio), r);
        self.with_hooks(out, r, prio, HookKind::PreUpgrade, main, HookKind::PostUpgrade, true);
    }

    fn rollback(&self, out: &mut Outcome, r: &Release, obs: &HelmRelease) {
        if let Some(reason) = self.protection(r) {
            self.protected(out, r, &reason);
            return;
        }
        let prio = r.priority();
        out.decide(
            format!(
                "Release [ {} ] was deleted and will be rolled back in namespace [ {} ]",
                r.name, r.namespace
            ),
            prio,
            DecisionType::Create,
        );
        let main = self.labelled(PlannedCommand::new(self.ops.rollback(r, obs.revision), prio), r);
        self.with_hooks(out, r, prio, HookKind::PreUpgrade, main, HookKind::PostUpgrade, true);
    }

    /// Uninstall `old`, then install `r`, as one chain on the new key
    ///
    /// With `keep_history` the old revisions survive and the install reuses the name.
    fn reinstall(
        &self,
        out: &mut Outcome,
        r: &Release,
        old: &HelmRelease,
        secrets: &[String],
        keep_history: bool,
        description: String,
    ) {
        let prio = r.priority();
        out.decide(description, prio, DecisionType::Change);
        if old.status != ReleaseStatus::Uninstalled {
            let mut uninstall = self.ops.uninstall(&old.name, &old.namespace);
            if keep_history {
                uninstall = uninstall.arg("--keep-history");
            }
            let main = PlannedCommand::new(uninstall, prio);
            self.with_hooks(out, r, prio, HookKind::PreDelete, main, HookKind::PostDelete, false);
        }
        let mut install = self.ops.install(r, secrets);
        if keep_history {
            install = install.arg("--replace");
        }
        let main = self.labelled(PlannedCommand::new(install, prio), r);
        self.with_hooks(out, r, prio, HookKind::PreInstall, main, HookKind::PostInstall, true);
    }

    /// The single observation of this release name in another, undeclared namespace
    fn move_source(&self, r: &Release) -> Option<HelmRelease> {
        let declared: BTreeSet<ReleaseKey> = self.state.apps.values().map(Release::key).collect();
        let mut candidates = self
            .current
            .same_name_elsewhere(&r.name, &r.namespace)
            .filter(|obs| !declared.contains(&obs.key()));
        let first = candidates.next()?;
        match candidates.next() {
            Some(_) => None,
            None => Some(first.clone()),
        }
    }

    fn move_namespace(&self, out: &mut Outcome, r: &Release, old: &HelmRelease, secrets: &[String]) {
        out.claimed.push(old.key());
        if r.is_protected() {
            self.protected(out, r, "release");
            return;
        }
        let old_ns_protected = self
            .state
            .namespace(&old.namespace)
            .is_some_and(|ns| ns.is_protected());
        if old_ns_protected && self.flags.ns_override.is_none() {
            self.protected(out, r, &format!("namespace [ {} ]", old.namespace));
            return;
        }
        out.decide(
            format!(
                "Release [ {} ] is moving from namespace [ {} ] to [ {} ]. Persistent volumes and claims are not migrated across namespaces; back up and restore their data manually.",
                r.name, old.namespace, r.namespace
            ),
            r.priority(),
            DecisionType::Change,
        );
        self.reinstall(out, r, old, secrets, false, format!(
            "Release [ {} ] will be reinstalled in namespace [ {} ] (previously in [ {} ])",
            r.name, r.namespace, old.namespace
        ));
    }

    /// Deployed in the current context and namespace: reinstall, upgrade or noop
    async fn inspect_upgrade(
        &self,
        out: &mut Outcome,
        label: &str,
        r: &Release,
        obs: &HelmRelease,
        secrets: &[String],
    ) -> Result<()> {
        if let Some(reason) = self.protection(r) {
            self.protected(out, r, &reason);
            return Ok(());
        }

        let desired = self.charts.get(label).cloned().unwrap_or_else(|| ChartInfo {
            name: r.chart_name().to_string(),
            version: r.version.clone(),
        });
        let current = obs.chart_info();

        if desired.name != current.name {
            self.reinstall(out, r, obs, secrets, self.flags.replace_on_rename, format!(
                "Release [ {} ] in namespace [ {} ] will be reinstalled: chart changed from [ {} ] to [ {} ]",
                r.name, r.namespace, current.name, desired.name
            ));
            return Ok(());
        }

        if !current.version.is_empty() && !same_version(&current.version, &desired.version) {
            if self.diff_driver == DiffDriver::Helm {
                let mut diff = PlannedCommand::new(self.ops.diff(r, secrets), r.priority())
                    .target(r.key())
                    .best_effort();
                if self.flags.show_diff {
                    diff = diff.show_output();
                }
                out.push(diff);
            }
            self.upgrade(out, r, secrets, format!(
                "Release [ {} ] in namespace [ {} ] will be updated from version [ {} ] to [ {} ]",
                r.name, r.namespace, current.version, desired.version
            ));
            return Ok(());
        }

        let changed = self.has_diff(r, secrets).await?;
        if changed || self.flags.always_upgrade {
            self.upgrade(out, r, secrets, format!(
                "Release [ {} ] in namespace [ {} ] will be updated",
                r.name, r.namespace
            ));
        } else {
            out.decide(
                format!(
                    "Release [ {} ] in namespace [ {} ] is desired state. No changes.",
                    r.name, r.namespace
                ),
                r.priority(),
                DecisionType::Noop,
            );
        }
        Ok(())
    }

    /// Run the diff driver now; true when it reports changes
    async fn has_diff(&self, r: &Release, secrets: &[String]) -> Result<bool> {
        let diff = match self.diff_driver {
            DiffDriver::Helm => {
                let out = self.runner.run_checked(&self.ops.diff(r, secrets)).await?;
                out.stdout
            }
            DiffDriver::Kubectl => {
                let rendered = self.runner.run_checked(&self.ops.template(r, secrets)).await?;
                let cmd = self.ops.kubectl_diff(r, rendered.stdout);
                let out = self.runner.run(&cmd).await;
                match out.code {
                    0 => String::new(),
                    1 => out.stdout,
                    _ => {
                        out.check(&cmd)?;
                        String::new()
                    }
                }
            }
        };
        let changed = !diff.trim().is_empty();
        if changed && self.flags.show_diff {
            println!("{}", diff);
        }
        Ok(changed)
    }

    async fn decrypt_secrets(&self, r: &Release) -> Result<Vec<String>> {
        let files = r.all_secrets_files();
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let decryptor = self.decryptor.ok_or_else(|| {
            KubeError::Environment(format!(
                "release [ {} ] uses secrets files but no decryptor is configured",
                r.name
            ))
        })?;
        let mut decrypted = Vec::with_capacity(files.len());
        for file in files {
            decrypted.push(decryptor.decrypt(file).await?);
        }
        Ok(decrypted)
    }

    /// Stamp ownership labels after a successful install/upgrade/rollback
    fn labelled(&self, cmd: PlannedCommand, r: &Release) -> PlannedCommand {
        if self.flags.dry_run {
            cmd
        } else {
            cmd.follow_up(self.ops.label(&r.name, &r.namespace))
        }
    }

    /// Queue `pre`, the main command, `post`, then tests when `run_tests`
    ///
    /// `helm test` needs a release that really exists, so dry runs skip it.
    #[allow(clippy::too_many_arguments)]
    fn with_hooks(
        &self,
        out: &mut Outcome,
        r: &Release,
        prio: i32,
        pre: HookKind,
        main: PlannedCommand,
        post: HookKind,
        run_tests: bool,
    ) {
        let key = r.key();
        self.push_hook(out, r, prio, pre);
        out.push(main.target(key.clone()));
        self.push_hook(out, r, prio, post);
        if run_tests {
            if r.test.unwrap_or(false) && !self.flags.dry_run {
                out.push(PlannedCommand::new(self.ops.test(r), prio).target(key));
            }
            self.push_hook(out, r, prio, HookKind::Test);
        }
    }

    fn push_hook(&self, out: &mut Outcome, r: &Release, prio: i32, kind: HookKind) {
        let Some(action) = r.hooks.action(kind) else {
            return;
        };
        if self.flags.dry_run && action.manifest_source().is_none() {
            info!("Skipping {} hook of release [ {} ] in dry-run mode", kind, r.name);
            return;
        }
        let control = r.hooks.control();
        for step in self.ops.hook(r, kind.key(), &action, &control) {
            let mut planned = PlannedCommand::new(step.command, prio).target(r.key());
            if step.best_effort {
                planned = planned.best_effort();
            }
            out.push(planned);
        }
    }

    /// Delete releases owned by this context that no app declares
    async fn untracked_sweep(&self, claimed: &BTreeSet<ReleaseKey>) -> Option<Outcome> {
        if self.flags.keep_untracked_releases || self.flags.destroy || !self.state.selection.is_empty() {
            debug!("Skipping untracked releases cleanup");
            return None;
        }
        let managed = match self.observer.managed_release_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Could not list untracked releases, skipping cleanup: {}", e);
                return None;
            }
        };
        let desired: BTreeSet<ReleaseKey> = self.state.apps.values().map(Release::key).collect();

        let mut out = Outcome::default();
        for key in managed.difference(&desired).filter(|k| !claimed.contains(*k)) {
            let ns_protected = self
                .state
                .namespace(&key.namespace)
                .is_some_and(|ns| ns.is_protected());
            if ns_protected {
                out.decide(
                    format!(
                        "Untracked release [ {} ] in namespace [ {} ] is PROTECTED by its namespace and will not be deleted",
                        key.name, key.namespace
                    ),
                    UNTRACKED_PRIORITY,
                    DecisionType::Noop,
                );
                continue;
            }
            out.decide(
                format!(
                    "Untracked release [ {} ] in namespace [ {} ] will be deleted",
                    key.name, key.namespace
                ),
                UNTRACKED_PRIORITY,
                DecisionType::Delete,
            );
            out.push(
                PlannedCommand::new(self.ops.uninstall(&key.name, &key.namespace), UNTRACKED_PRIORITY)
                    .target(key.clone()),
            );
        }
        Some(out)
    }
}

fn same_version(a: &str, b: &str) -> bool {
    a.trim_start_matches('v') == b.trim_start_matches('v')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockRunner};
    use helmsman_core::{Namespace, Selection};

    fn state() -> State {
        let mut state = State::default();
        state.namespaces.insert("staging".to_string(), Namespace::default());
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

    fn observed(status: &str, chart: &str, context: &str) -> HelmRelease {
        HelmRelease {
            name: "jenkins".to_string(),
            namespace: "staging".to_string(),
            revision: 2,
            updated: String::new(),
            status: ReleaseStatus::parse(status),
            chart: chart.to_string(),
            app_version: String::new(),
            context: context.to_string(),
        }
    }

    async fn plan_for(state: &State, current: &CurrentState, flags: &RunFlags, mock: &MockRunner) -> Result<Plan> {
        let charts = ChartCache::new();
        DecisionMaker::new(state, current, &charts, flags, mock)
            .with_pending_interval(Duration::ZERO)
            .build_plan()
            .await
    }

    fn lines(plan: &Plan) -> Vec<String> {
        plan.commands().iter().map(|c| c.command.to_string()).collect()
    }

    #[tokio::test]
    async fn test_unchanged_release_is_noop() {
        let mock = MockRunner::new();
        let current = CurrentState::new("default", [observed("deployed", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state(), &current, &flags, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Noop);
        assert!(plan.commands().is_empty());
        assert_eq!(mock.commands_matching("helm diff upgrade jenkins").len(), 1);
    }

    #[tokio::test]
    async fn test_diff_output_triggers_upgrade() {
        let mock = MockRunner::new();
        mock.on("helm diff", CommandOutput::ok("staging, jenkins, Deployment has changed"));
        let current = CurrentState::new("default", [observed("deployed", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state(), &current, &flags, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Change);
        assert_eq!(
            lines(&plan),
            vec!["helm upgrade jenkins stable/jenkins --namespace staging --version 0.9.0"]
        );
        assert!(plan.commands()[0].follow_up.is_some());
    }

    #[tokio::test]
    async fn test_deleted_release_rolled_back() {
        let mock = MockRunner::new();
        let current = CurrentState::new("default", [observed("uninstalled", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state(), &current, &flags, &mock).await.unwrap();
        assert_eq!(lines(&plan), vec!["helm rollback jenkins 2 --namespace staging"]);
    }

    #[tokio::test]
    async fn test_disabled_release_deleted_unless_protected() {
        let mock = MockRunner::new();
        let mut state = state();
        state.apps.get_mut("jenkins").unwrap().enabled = Some(false);
        let current = CurrentState::new("default", [observed("deployed", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };

        let plan = plan_for(&state, &current, &flags, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Delete);
        assert_eq!(lines(&plan), vec!["helm uninstall jenkins --namespace staging"]);

        state.namespaces.get_mut("staging").unwrap().protected = Some(true);
        let plan = plan_for(&state, &current, &flags, &mock).await.unwrap();
        assert!(plan.decisions()[0].description.contains("PROTECTED"));
        assert!(plan.commands().is_empty());

        // ns-override lifts namespace protection only
        let overridden = RunFlags {
            ns_override: Some("staging".to_string()),
            ..flags.clone()
        };
        let plan = plan_for(&state, &current, &overridden, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Delete);
    }

    #[tokio::test]
    async fn test_failed_release_upgraded() {
        let mock = MockRunner::new();
        let current = CurrentState::new("default", [observed("failed", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state(), &current, &flags, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Change);
        assert!(plan.decisions()[0].description.starts_with("WARNING: Release [ jenkins ]"));
        assert!(plan.render().contains("failed state"));
        assert!(lines(&plan)[0].starts_with("helm upgrade jenkins"));
    }

    #[tokio::test]
    async fn test_pending_release() {
        let current = CurrentState::new("default", [observed("pending-upgrade", "jenkins-0.9.0", "default")]);

        let mock = MockRunner::new();
        let skip = RunFlags {
            skip_pending: true,
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state(), &current, &skip, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Ignored);

        let retry = RunFlags {
            pending_max_retries: 2,
            keep_untracked_releases: true,
            ..Default::default()
        };
        mock.on("helm status", CommandOutput::ok(r#"{"info":{"status":"pending-upgrade"}}"#));
        let err = plan_for(&state(), &current, &retry, &mock).await.unwrap_err();
        assert!(matches!(err, KubeError::PendingRelease { .. }));
        assert_eq!(mock.commands_matching("helm status").len(), 2);

        mock.on_times("helm status", CommandOutput::ok(r#"{"info":{"status":"deployed"}}"#), 1);
        let plan = plan_for(&state(), &current, &retry, &mock).await.unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Noop);
    }

    #[tokio::test]
    async fn test_destroy_uninstalls_everything_installed() {
        let mock = MockRunner::new();
        let mut state = state();
        state.apps.insert(
            "grafana".to_string(),
            Release {
                name: "grafana".to_string(),
                namespace: "staging".to_string(),
                chart: "stable/grafana".to_string(),
                version: "1.0.0".to_string(),
                enabled: Some(true),
                ..Default::default()
            },
        );
        let current = CurrentState::new("default", [observed("deployed", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            destroy: true,
            ..Default::default()
        };
        let plan = plan_for(&state, &current, &flags, &mock).await.unwrap();
        assert_eq!(lines(&plan), vec!["helm uninstall jenkins --namespace staging"]);
        // No sweep in destroy mode
        assert!(mock.commands_matching("kubectl get secret --all-namespaces").is_empty());
    }

    #[tokio::test]
    async fn test_hooks_surround_action() {
        let dir = tempfile::tempdir().unwrap();
        let job = dir.path().join("job.yaml");
        std::fs::write(&job, "kind: Job").unwrap();

        let mut state = state();
        let app = state.apps.get_mut("jenkins").unwrap();
        app.hooks.pre_install = Some(job.display().to_string());
        app.hooks.post_install = Some("echo done".to_string());
        app.test = Some(true);

        let mock = MockRunner::new();
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state, &CurrentState::new("default", []), &flags, &mock)
            .await
            .unwrap();
        assert_eq!(
            lines(&plan),
            vec![
                format!("kubectl apply -n staging -f {}", job.display()),
                "helm install jenkins stable/jenkins --namespace staging --version 0.9.0".to_string(),
                "echo done".to_string(),
                "helm test jenkins --namespace staging".to_string(),
            ]
        );
        assert!(
            plan.commands()
                .iter()
                .all(|c| c.target == Some(ReleaseKey::new("jenkins", "staging")))
        );
    }

    #[tokio::test]
    async fn test_namespace_move() {
        let mock = MockRunner::new();
        let mut moved = observed("deployed", "jenkins-0.9.0", "default");
        moved.namespace = "legacy".to_string();
        let current = CurrentState::new("default", [moved]);
        mock.on(
            "kubectl get secret --all-namespaces",
            CommandOutput::ok(r#"{"items":[{"metadata":{"namespace":"legacy","labels":{"name":"jenkins"}}}]}"#),
        );

        let plan = plan_for(&state(), &current, &RunFlags::default(), &mock).await.unwrap();
        let decisions = plan.decisions();
        assert!(decisions[0].description.contains("moving from namespace [ legacy ]"));
        assert_eq!(
            lines(&plan),
            vec![
                "helm uninstall jenkins --namespace legacy",
                "helm install jenkins stable/jenkins --namespace staging --version 0.9.0",
            ]
        );
        // The old key was claimed, so the sweep leaves it alone
        assert!(decisions.iter().all(|d| d.kind != DecisionType::Delete));
    }

    #[tokio::test]
    async fn test_selection_skips_sweep_and_marks_ignored() {
        let mock = MockRunner::new();
        let mut state = state();
        state.apply_selection(Selection {
            targets: ["other".to_string()].into(),
            ..Default::default()
        });
        let plan = plan_for(&state, &CurrentState::new("default", []), &RunFlags::default(), &mock)
            .await
            .unwrap();
        assert_eq!(plan.decisions()[0].kind, DecisionType::Ignored);
        assert_eq!(plan.decisions()[0].description, "Release [ jenkins ] ignored");
        assert!(mock.history().is_empty());

        let skip = RunFlags {
            skip_ignored: true,
            ..Default::default()
        };
        let plan = plan_for(&state, &CurrentState::new("default", []), &skip, &mock)
            .await
            .unwrap();
        assert!(plan.decisions().is_empty());
    }

    #[tokio::test]
    async fn test_reverse_delete_priority() {
        let mock = MockRunner::new();
        let mut state = state();
        state.settings.reverse_delete = Some(true);
        let app = state.apps.get_mut("jenkins").unwrap();
        app.enabled = Some(false);
        app.priority = Some(-3);
        let current = CurrentState::new("default", [observed("deployed", "jenkins-0.9.0", "default")]);
        let flags = RunFlags {
            keep_untracked_releases: true,
            ..Default::default()
        };
        let plan = plan_for(&state, &current, &flags, &mock).await.unwrap();
        assert_eq!(plan.commands()[0].priority, 3);
    }
}
