//! Helmsman Kube - cluster side of the Helm release reconciler
//!
//! This crate provides:
//! - **Commands**: helm/kubectl invocations behind a mockable runner
//! - **Cluster Preparation**: context, environment checks, repositories and namespaces
//! - **Observation**: Current releases and their managing contexts
//! - **Chart Resolution**: Version checks against local, OCI and repository charts
//! - **Decisions**: Desired vs current comparison producing a plan
//! - **Plan Execution**: Priority bands with per-release serialization
//! - **Notifications**: Slack reports of plans and outcomes

pub mod cluster;
pub mod command;
pub mod current;
pub mod decision;
pub mod error;
pub mod notify;
pub mod ops;
pub mod plan;
pub mod resolver;
pub mod secrets;

pub use cluster::{
    HelmEnvironment, RepoSpec, add_helm_repos, check_environment, prepare_namespaces,
    set_kube_context,
};
pub use command::{Command, CommandOutput, CommandRunner, MockEvent, MockRunner, ShellRunner};
pub use current::{CurrentState, HelmRelease, Observer, ReleaseStatus};
pub use decision::{DecisionMaker, DiffDriver, UNTRACKED_PRIORITY};
pub use error::{KubeError, Result};
pub use notify::{Notifier, SlackNotifier};
pub use ops::ReleaseOps;
pub use plan::{CommandResult, Decision, DecisionType, ExecReport, Plan, PlannedCommand};
pub use resolver::{ChartCache, ChartResolver};
pub use secrets::{CommandDecryptor, DecryptTool, SecretDecryptor};
