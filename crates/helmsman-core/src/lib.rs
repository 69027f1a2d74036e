//! Helmsman Core - desired state model for the Helm release reconciler
//!
//! This crate provides the foundational types used throughout Helmsman:
//! - `State`: The merged desired state (settings, namespaces, repos, apps)
//! - `Release`: A declared release and its identity key
//! - `Hooks`: Hook slots classified into manifest, URL or exec actions
//! - `Loader`: DSF reading, substitution, path expansion, merge and templates
//! - `validate`: Structural checks on the merged state
//! - `chart`: Observed chart labels, `Chart.yaml` and version constraints

pub mod chart;
pub mod error;
pub mod flags;
pub mod hooks;
pub mod loader;
pub mod merge;
pub mod release;
pub mod state;
pub mod subst;
pub mod validate;

pub use chart::{ChartInfo, ChartMetadata, parse_chart_label, version_matches};
pub use error::{CoreError, Result};
pub use flags::RunFlags;
pub use hooks::{HookAction, HookControl, HookKind, Hooks};
pub use loader::{BlobFetcher, Loader, StateFile, read_spec_file};
pub use merge::Merge;
pub use release::{Release, ReleaseKey};
pub use state::{Namespace, Quotas, Selection, Settings, State, StorageBackend};
pub use subst::ParameterStore;
pub use validate::validate;
