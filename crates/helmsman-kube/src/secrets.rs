//! Secrets file decryption
//!
//! Decrypted copies are written into the run's work directory, which the
//! caller removes on exit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use helmsman_core::Settings;
use tracing::debug;

use crate::command::{Command, CommandRunner};
use crate::error::{KubeError, Result};

/// Turns an encrypted secrets file into a readable values file
#[async_trait]
pub trait SecretDecryptor: Send + Sync {
    /// Path of the decrypted copy
    async fn decrypt(&self, path: &str) -> Result<String>;
}

/// Which external tool performs decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptTool {
    /// `helm secrets decrypt <file>`
    HelmSecrets,
    /// `eyaml decrypt -f <file>` with optional PKCS7 keys
    Eyaml {
        private_key: Option<String>,
        public_key: Option<String>,
    },
}

impl DecryptTool {
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.eyaml() {
            let key = |p: &String| Some(p.clone()).filter(|p| !p.is_empty());
            Self::Eyaml {
                private_key: key(&settings.eyaml_private_key_path),
                public_key: key(&settings.eyaml_public_key_path),
            }
        } else {
            Self::HelmSecrets
        }
    }

    fn command(&self, path: &str) -> Command {
        match self {
            Self::HelmSecrets => Command::helm().args(["secrets", "decrypt", path]),
            Self::Eyaml {
                private_key,
                public_key,
            } => {
                let mut cmd = Command::new("eyaml").arg("decrypt");
                if let Some(key) = private_key {
                    cmd = cmd.arg(format!("--pkcs7-private-key={}", key));
                }
                if let Some(key) = public_key {
                    cmd = cmd.arg(format!("--pkcs7-public-key={}", key));
                }
                cmd.args(["-f", path])
            }
        }
    }
}

/// Decrypts by running an external tool and capturing stdout
pub struct CommandDecryptor<'a> {
    runner: &'a dyn CommandRunner,
    tool: DecryptTool,
    work_dir: PathBuf,
    counter: AtomicUsize,
    decrypted: Mutex<HashMap<String, String>>,
}

impl<'a> CommandDecryptor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, tool: DecryptTool, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            tool,
            work_dir: work_dir.into(),
            counter: AtomicUsize::new(0),
            decrypted: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, path: &str) -> Option<String> {
        self.decrypted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl SecretDecryptor for CommandDecryptor<'_> {
    async fn decrypt(&self, path: &str) -> Result<String> {
        if let Some(done) = self.cached(path) {
            return Ok(done);
        }

        let cmd = self
            .tool
            .command(path)
            .describe(format!("Decrypting secrets file [ {} ]", path));
        let out = self.runner.run(&cmd).await;
        if !out.success() {
            return Err(KubeError::Decryption {
                path: path.to_string(),
                message: out.stderr.trim().to_string(),
            });
        }

        let file_name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "secrets.yaml".to_string());
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        let target = self.work_dir.join(format!("{}-{}.dec", idx, file_name));
        tokio::fs::write(&target, out.stdout).await?;
        let target = target.display().to_string();
        debug!("Decrypted {} to {}", path, target);

        self.decrypted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), target.clone());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockRunner};

    #[tokio::test]
    async fn test_helm_secrets_decrypt_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRunner::new();
        mock.on("helm secrets decrypt", CommandOutput::ok("password: hunter2\n"));

        let decryptor = CommandDecryptor::new(&mock, DecryptTool::HelmSecrets, dir.path());
        let first = decryptor.decrypt("/dsf/secrets.yaml").await.unwrap();
        let second = decryptor.decrypt("/dsf/secrets.yaml").await.unwrap();

        assert_eq!(first, second);
        assert!(first.ends_with("0-secrets.yaml.dec"));
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "password: hunter2\n");
        assert_eq!(mock.history().len(), 1);
    }

    #[tokio::test]
    async fn test_eyaml_command_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRunner::new();
        mock.on("eyaml decrypt", CommandOutput::failed(1, "bad key"));
        let tool = DecryptTool::Eyaml {
            private_key: Some("/keys/private.pem".to_string()),
            public_key: Some("/keys/public.pem".to_string()),
        };
        let decryptor = CommandDecryptor::new(&mock, tool, dir.path());
        let err = decryptor.decrypt("/dsf/secrets.eyaml").await.unwrap_err();
        assert!(matches!(err, KubeError::Decryption { .. }));
        assert_eq!(
            mock.command_lines()[0],
            "eyaml decrypt --pkcs7-private-key=/keys/private.pem \
             --pkcs7-public-key=/keys/public.pem -f /dsf/secrets.eyaml"
        );
    }
}
