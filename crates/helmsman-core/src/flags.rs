//! Run-time options shared by every stage of a run

/// Behaviour switches for a single run
///
/// Populated by the CLI and threaded explicitly through loading, validation,
/// decision making and execution.
#[derive(Debug, Clone)]
pub struct RunFlags {
    /// Force every release into this namespace
    pub ns_override: Option<String>,
    /// Replace the DSF's managing context
    pub context_override: Option<String>,

    pub apply: bool,
    pub dry_run: bool,
    pub destroy: bool,
    pub keep_untracked_releases: bool,

    pub show_diff: bool,
    pub diff_context: Option<u32>,
    pub show_secrets: bool,
    pub kubectl_diff: bool,

    pub env_subst: bool,
    pub subst_env_values: bool,
    pub ssm_subst: bool,
    pub subst_ssm_values: bool,
    pub recursive_env_expand: bool,

    pub update_deps: bool,
    pub force_upgrades: bool,
    /// Keep release history across chart renames
    pub replace_on_rename: bool,
    pub always_upgrade: bool,
    pub no_update: bool,

    /// Size of the decision and execution pools
    pub parallel: usize,

    pub skip_validation: bool,
    pub skip_ignored: bool,
    pub skip_pending: bool,
    pub pending_max_retries: u32,

    pub check_for_chart_updates: bool,
    pub download_charts: bool,

    pub detailed_exit_code: bool,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            ns_override: None,
            context_override: None,
            apply: false,
            dry_run: false,
            destroy: false,
            keep_untracked_releases: false,
            show_diff: false,
            diff_context: None,
            show_secrets: false,
            kubectl_diff: false,
            env_subst: true,
            subst_env_values: false,
            ssm_subst: true,
            subst_ssm_values: false,
            recursive_env_expand: true,
            update_deps: false,
            force_upgrades: false,
            replace_on_rename: false,
            always_upgrade: false,
            no_update: false,
            parallel: 1,
            skip_validation: false,
            skip_ignored: false,
            skip_pending: false,
            pending_max_retries: 0,
            check_for_chart_updates: false,
            download_charts: false,
            detailed_exit_code: false,
        }
    }
}

impl RunFlags {
    /// Worker count, never below one
    pub fn workers(&self) -> usize {
        self.parallel.max(1)
    }
}
