//! One reconciliation run, from DSF loading to execution

use std::path::Path;

use helmsman_core::{Loader, RunFlags, State, StateFile, read_spec_file, validate};
use helmsman_kube::{
    ChartResolver, CommandDecryptor, DecisionMaker, DecryptTool, DiffDriver, Notifier, Observer,
    ShellRunner, SlackNotifier, add_helm_repos, check_environment, prepare_namespaces,
    set_kube_context,
};
use tracing::{debug, info, warn};

use crate::Cli;
use crate::display::PlanPrinter;
use crate::error::{CliError, Result};
use crate::exit_codes;
use crate::external::{ShellBlobFetcher, SsmParameterStore};

/// Run the whole pipeline; the temporary directory is removed before returning
pub async fn run(cli: &Cli) -> Result<i32> {
    let work_dir = tempfile::Builder::new().prefix("helmsman-").tempdir()?;
    debug!("Using temporary directory {}", work_dir.path().display());

    let flags = cli.run_flags();
    let state = load(cli, &flags, work_dir.path())?;

    let notifier = slack_notifier(&state);
    let result = reconcile(cli, &flags, state, work_dir.path(), notifier.as_ref()).await;
    if let (Err(err), Some(notifier)) = (&result, &notifier) {
        notifier.notify(&format!("*Helmsman run failed:* {}", err), true).await;
    }
    result
}

fn state_files(cli: &Cli) -> Result<Vec<StateFile>> {
    let mut files = match &cli.spec {
        Some(spec) => read_spec_file(spec)?,
        None => Vec::new(),
    };
    let offset = files.len() as i32;
    files.extend(
        cli.files
            .iter()
            .enumerate()
            .map(|(idx, path)| StateFile::new(path, offset + idx as i32)),
    );
    if files.is_empty() {
        return Err(CliError::config_with_help(
            "no desired state file given",
            "Pass at least one -f <file> or --spec <file>",
        ));
    }
    Ok(files)
}

fn load(cli: &Cli, flags: &RunFlags, work_dir: &Path) -> Result<State> {
    let files = state_files(cli)?;
    let fetcher = ShellBlobFetcher;
    let ssm = SsmParameterStore;
    let state = Loader::new(flags, work_dir)
        .with_selection(cli.selection())
        .with_blob_fetcher(&fetcher)
        .with_parameter_store(&ssm)
        .load(&files)?;
    validate(&state, flags)?;
    info!(
        "Loaded {} apps from {} desired state file(s) for context [ {} ]",
        state.apps.len(),
        files.len(),
        state.context()
    );
    Ok(state)
}

fn slack_notifier(state: &State) -> Option<SlackNotifier> {
    let webhook = state.settings.slack_webhook.trim();
    if webhook.is_empty() {
        return None;
    }
    match SlackNotifier::new(webhook) {
        Ok(notifier) => Some(notifier),
        Err(e) => {
            warn!("Slack notifications disabled: {}", e);
            None
        }
    }
}

async fn reconcile(
    cli: &Cli,
    flags: &RunFlags,
    mut state: State,
    work_dir: &Path,
    notifier: Option<&SlackNotifier>,
) -> Result<i32> {
    let runner = ShellRunner;

    set_kube_context(&runner, &state).await?;
    let env = check_environment(&runner, &state).await?;
    add_helm_repos(&runner, &state, flags).await?;
    if flags.apply && !flags.destroy {
        prepare_namespaces(&runner, &state, flags).await?;
    }

    let mut resolver = ChartResolver::new(&runner, flags);
    if flags.download_charts {
        resolver = resolver.with_download_dir(work_dir);
    }
    let charts = resolver.resolve(&mut state).await?;

    let current = Observer::new(&runner, state.settings.storage_or_default(), state.context())
        .build_state()
        .await?;

    let decryptor = CommandDecryptor::new(&runner, DecryptTool::from_settings(&state.settings), work_dir);
    let driver = if flags.kubectl_diff || !env.diff_plugin {
        DiffDriver::Kubectl
    } else {
        DiffDriver::Helm
    };
    let plan = DecisionMaker::new(&state, &current, &charts, flags, &runner)
        .with_decryptor(&decryptor)
        .with_diff_driver(driver)
        .build_plan()
        .await?;

    let mut printer = PlanPrinter::new();
    printer.plan(&plan)?;
    if cli.verbose {
        printer.commands(&plan)?;
    }
    if let Some(notifier) = notifier {
        notifier.notify(&plan.slack_text(), false).await;
    }

    if flags.apply || flags.dry_run {
        let report = plan.exec(&runner, flags.workers()).await;
        printer.report(&report)?;
        if let Some(notifier) = notifier {
            notifier.notify(&report.summary(), !report.succeeded()).await;
        }
        if let Some(failure) = report.failure {
            return Err(failure.into());
        }
    } else {
        info!("Plan not applied; rerun with --apply to execute it");
    }

    if flags.detailed_exit_code && plan.has_changes() {
        Ok(exit_codes::CHANGES)
    } else {
        Ok(exit_codes::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_spec_files_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dir.path().join("spec.yaml");
        std::fs::write(&spec, "stateFiles:\n  - path: base.yaml\n  - path: prod.yaml\n").unwrap();
        let spec_arg = spec.display().to_string();
        let cli = Cli::parse_from(["helmsman", "--spec", spec_arg.as_str(), "-f", "override.yaml"]);

        let files = state_files(&cli).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].path.ends_with("base.yaml"));
        assert!(files[2].path.ends_with("override.yaml"));
        assert_eq!(files[2].priority, 2);
    }

    #[test]
    fn test_no_state_files() {
        let cli = Cli::parse_from(["helmsman", "--apply"]);
        let err = state_files(&cli).unwrap_err();
        assert!(matches!(err, CliError::Config { .. }));
    }
}
