//! Cloud CLI backed implementations of the loader's fetch and parameter traits

use std::path::{Path, PathBuf};
use std::process::Command;

use helmsman_core::{BlobFetcher, ParameterStore};
use tracing::debug;

/// Downloads `s3://`, `gs://` and `az://` objects with aws, gsutil and az
pub struct ShellBlobFetcher;

impl ShellBlobFetcher {
    fn command(uri: &str, target: &Path) -> Result<Command, String> {
        let target = target.display().to_string();
        if uri.starts_with("s3://") {
            let mut cmd = Command::new("aws");
            cmd.args(["s3", "cp", uri, &target]);
            Ok(cmd)
        } else if uri.starts_with("gs://") {
            let mut cmd = Command::new("gsutil");
            cmd.args(["cp", uri, &target]);
            Ok(cmd)
        } else if let Some(rest) = uri.strip_prefix("az://") {
            let (container, blob) = rest
                .split_once('/')
                .ok_or_else(|| format!("'{}' is not of the form az://container/blob", uri))?;
            let mut cmd = Command::new("az");
            cmd.args([
                "storage",
                "blob",
                "download",
                "--container-name",
                container,
                "--name",
                blob,
                "--file",
                &target,
            ]);
            Ok(cmd)
        } else {
            Err(format!("unsupported blob storage URI '{}'", uri))
        }
    }
}

impl BlobFetcher for ShellBlobFetcher {
    fn fetch(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf, String> {
        let file_name = uri
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| format!("'{}' does not name a file", uri))?;
        let target = dest_dir.join(file_name);
        debug!("Downloading {} to {}", uri, target.display());

        let output = Self::command(uri, &target)?
            .output()
            .map_err(|e| format!("failed to start download of {}: {}", uri, e))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(target)
    }
}

/// Reads AWS SSM parameters through `aws ssm get-parameter`
pub struct SsmParameterStore;

impl ParameterStore for SsmParameterStore {
    fn get_parameter(&self, name: &str, decrypt: bool) -> Result<String, String> {
        let mut cmd = Command::new("aws");
        cmd.args(["ssm", "get-parameter", "--name", name]);
        if decrypt {
            cmd.arg("--with-decryption");
        }
        cmd.args(["--query", "Parameter.Value", "--output", "text"]);

        let output = cmd
            .output()
            .map_err(|e| format!("failed to run aws ssm: {}", e))?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}
