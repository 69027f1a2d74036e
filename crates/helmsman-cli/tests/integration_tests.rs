//! Integration tests for the helmsman binary
//!
//! Only failure paths that stop before any helm/kubectl call are exercised here;
//! cluster interaction is covered by the kube crate's scenario tests.

use std::process::Command;

/// Helper to run the helmsman binary
fn helmsman(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_helmsman"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute helmsman")
}

/// Get the fixtures path
fn fixture(name: &str) -> String {
    format!("{}/../../fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

mod usage {
    use super::*;

    #[test]
    fn test_help_lists_options() {
        let output = helmsman(&["--help"]);

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        for option in ["--apply", "--dry-run", "--destroy", "--spec", "--ns-override", "--detailed-exit-code"] {
            assert!(stdout.contains(option), "missing {option} in help:\n{stdout}");
        }
    }

    #[test]
    fn test_no_state_file_fails() {
        let output = helmsman(&["--no-color"]);

        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("no desired state file given"), "{stderr}");
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_undeclared_namespace_fails_validation() {
        let output = helmsman(&["--no-color", "-f", &fixture("invalid-namespace.yaml")]);

        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("namespace 'production' is not declared"),
            "{stderr}"
        );
    }

    #[test]
    fn test_unknown_key_fails_parsing() {
        let output = helmsman(&["--no-color", "-f", &fixture("unknown-key.yaml")]);

        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("chartt"), "{stderr}");
    }

    #[test]
    fn test_bad_env_file_fails() {
        let output = helmsman(&[
            "--no-color",
            "-e",
            &fixture("bad.env"),
            "-f",
            &fixture("invalid-namespace.yaml"),
        ]);

        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("expected KEY=VALUE"), "{stderr}");
    }
}
