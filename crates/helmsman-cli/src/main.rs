//! Helmsman - declarative reconciliation of Helm releases

use std::path::PathBuf;

use clap::Parser;
use helmsman_core::{RunFlags, Selection};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod display;
mod dotenv;
mod error;
mod exit_codes;
mod external;
mod pipeline;

#[derive(Parser, Debug)]
#[command(name = "helmsman")]
#[command(version)]
#[command(about = "Declarative reconciliation of Helm releases from desired state files", long_about = None)]
struct Cli {
    /// Desired state file (repeatable; later files override earlier ones)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Env file loaded after .env (repeatable; later files win)
    #[arg(short = 'e', long = "env-file", value_name = "FILE")]
    env_files: Vec<PathBuf>,

    /// Spec file listing state files under `stateFiles`
    #[arg(long, value_name = "FILE")]
    spec: Option<PathBuf>,

    /// Only consider these app labels
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Only consider apps in these groups
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Ignore these app labels
    #[arg(long = "exclude-target")]
    excluded_targets: Vec<String>,

    /// Ignore apps in these groups
    #[arg(long = "exclude-group")]
    excluded_groups: Vec<String>,

    /// Force every release into this namespace
    #[arg(long, value_name = "NAMESPACE")]
    ns_override: Option<String>,

    /// Override the managing context declared in the DSF
    #[arg(long, value_name = "NAME")]
    context_override: Option<String>,

    /// Execute the plan
    #[arg(long)]
    apply: bool,

    /// Execute helm commands with --dry-run --debug
    #[arg(long)]
    dry_run: bool,

    /// Uninstall every release declared in the DSF
    #[arg(long)]
    destroy: bool,

    /// Do not uninstall releases of this context that the DSF no longer declares
    #[arg(long)]
    keep_untracked_releases: bool,

    /// Print diffs of upgraded releases
    #[arg(long)]
    show_diff: bool,

    /// Lines of context around diff changes
    #[arg(long, value_name = "N")]
    diff_context: Option<u32>,

    /// Do not mask secrets in diffs
    #[arg(long)]
    show_secrets: bool,

    /// Compute diffs with helm template and kubectl diff
    #[arg(long)]
    kubectl_diff: bool,

    /// Do not substitute environment variables in DSFs
    #[arg(long)]
    no_env_subst: bool,

    /// Substitute environment variables in values files
    #[arg(long)]
    subst_env_values: bool,

    /// Do not substitute SSM parameters in DSFs
    #[arg(long)]
    no_ssm_subst: bool,

    /// Substitute SSM parameters in values files
    #[arg(long)]
    subst_ssm_values: bool,

    /// Substitute environment variables only once
    #[arg(long)]
    no_recursive_env_expand: bool,

    /// Run helm dependency update on local charts
    #[arg(long)]
    update_deps: bool,

    /// Pass --force to helm upgrade
    #[arg(long)]
    force_upgrades: bool,

    /// On chart renames, keep release history (uninstall --keep-history, install --replace)
    #[arg(long)]
    replace_on_rename: bool,

    /// Upgrade even when the diff is empty
    #[arg(long)]
    always_upgrade: bool,

    /// Skip helm repo update
    #[arg(long)]
    no_update: bool,

    /// Parallel decisions and commands
    #[arg(short = 'p', long, default_value_t = 1)]
    parallel: usize,

    /// Skip DSF validation
    #[arg(long)]
    skip_validation: bool,

    /// Hide decisions about ignored releases
    #[arg(long)]
    skip_ignored: bool,

    /// Skip releases in a pending state instead of waiting
    #[arg(long)]
    skip_pending: bool,

    /// Times to re-check a pending release before failing
    #[arg(long, default_value_t = 0, value_name = "N")]
    pending_max_retries: u32,

    /// Warn when a newer chart version is available
    #[arg(long)]
    check_for_chart_updates: bool,

    /// Pull remote charts locally before use
    #[arg(long)]
    download_charts: bool,

    /// Exit 2 when changes were planned
    #[arg(long)]
    detailed_exit_code: bool,

    /// Print planned commands and debug logs
    #[arg(short, long)]
    verbose: bool,

    /// Trace logging
    #[arg(long)]
    debug: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

impl Cli {
    fn run_flags(&self) -> RunFlags {
        RunFlags {
            ns_override: self.ns_override.clone(),
            context_override: self.context_override.clone(),
            apply: self.apply,
            dry_run: self.dry_run,
            destroy: self.destroy,
            keep_untracked_releases: self.keep_untracked_releases,
            show_diff: self.show_diff,
            diff_context: self.diff_context,
            show_secrets: self.show_secrets,
            kubectl_diff: self.kubectl_diff,
            env_subst: !self.no_env_subst,
            subst_env_values: self.subst_env_values,
            ssm_subst: !self.no_ssm_subst,
            subst_ssm_values: self.subst_ssm_values,
            recursive_env_expand: !self.no_recursive_env_expand,
            update_deps: self.update_deps,
            force_upgrades: self.force_upgrades,
            replace_on_rename: self.replace_on_rename,
            always_upgrade: self.always_upgrade,
            no_update: self.no_update,
            parallel: self.parallel,
            skip_validation: self.skip_validation,
            skip_ignored: self.skip_ignored,
            skip_pending: self.skip_pending,
            pending_max_retries: self.pending_max_retries,
            check_for_chart_updates: self.check_for_chart_updates,
            download_charts: self.download_charts,
            detailed_exit_code: self.detailed_exit_code,
        }
    }

    fn selection(&self) -> Selection {
        Selection {
            targets: self.targets.iter().cloned().collect(),
            groups: self.groups.iter().cloned().collect(),
            excluded_targets: self.excluded_targets.iter().cloned().collect(),
            excluded_groups: self.excluded_groups.iter().cloned().collect(),
        }
    }

    fn init_logging(&self) {
        let level = if self.debug {
            "trace"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(!self.no_color)
                    .with_writer(std::io::stderr),
            )
            .init();
        if self.no_color {
            console::set_colors_enabled(false);
        }
    }
}

/// Export `.env` variables; must run before any other thread exists
fn load_env_files(cli: &Cli) -> error::Result<()> {
    let cwd = std::env::current_dir()?;
    let vars = dotenv::read_all(&dotenv::env_files(&cwd, &cli.env_files))?;
    for (key, value) in vars {
        // SAFETY: called from main before the tokio runtime is built
        unsafe { std::env::set_var(&key, &value) };
    }
    Ok(())
}

fn report(err: error::CliError) -> i32 {
    let code = err.exit_code();
    eprintln!("{:?}", miette::Report::new(err));
    code
}

fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    if cli.debug {
        // SAFETY: We're the only thread at this point (start of main)
        unsafe { std::env::set_var("RUST_BACKTRACE", "1") };
    }

    let code = match load_env_files(&cli) {
        Err(err) => report(err),
        Ok(()) => {
            cli.init_logging();
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build();
            match runtime {
                Ok(runtime) => match runtime.block_on(pipeline::run(&cli)) {
                    Ok(code) => code,
                    Err(err) => report(err),
                },
                Err(err) => report(err.into()),
            }
        }
    };
    std::process::exit(code);
}
