//! `.env` file reading
//!
//! Files are parsed here; the caller exports the variables before any thread
//! is started.

use std::path::{Path, PathBuf};

use crate::error::{CliError, Result};

/// Default env file, picked up from the working directory when present
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Parse `KEY=VALUE` lines
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is allowed
/// and matching single or double quotes around the value are removed.
pub fn parse(text: &str, path: &Path) -> Result<Vec<(String, String)>> {
    let mut vars = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(CliError::config(format!(
                "{}:{}: expected KEY=VALUE, found '{}'",
                path.display(),
                idx + 1,
                line
            )));
        };
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(CliError::config(format!(
                "{}:{}: invalid variable name '{}'",
                path.display(),
                idx + 1,
                key
            )));
        }
        vars.push((key.to_string(), unquote(value.trim()).to_string()));
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Env files to read, in order: `.env` in `dir` if it exists, then `extra`
pub fn env_files(dir: &Path, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let default = dir.join(DEFAULT_ENV_FILE);
    if default.is_file() {
        files.push(default);
    }
    files.extend(extra.iter().cloned());
    files
}

/// Read every file; later assignments of a key win
pub fn read_all(files: &[PathBuf]) -> Result<Vec<(String, String)>> {
    let mut vars: Vec<(String, String)> = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(file).map_err(|e| {
            CliError::config(format!("failed to read env file {}: {}", file.display(), e))
        })?;
        for (key, value) in parse(&text, file)? {
            vars.retain(|(k, _)| *k != key);
            vars.push((key, value));
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let text = "# comment\n\nPLAIN=value\nexport EXPORTED=1\nDOUBLE=\"a b\"\nSINGLE='c=d'\nEMPTY=\n";
        let vars = parse(text, Path::new(".env")).unwrap();
        assert_eq!(
            vars,
            vec![
                ("PLAIN".to_string(), "value".to_string()),
                ("EXPORTED".to_string(), "1".to_string()),
                ("DOUBLE".to_string(), "a b".to_string()),
                ("SINGLE".to_string(), "c=d".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse("NOT A VAR\n", Path::new("prod.env")).unwrap_err();
        assert!(err.to_string().contains("prod.env:1"));
    }

    #[test]
    fn test_later_files_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "ORG=base\nREGION=eu\n").unwrap();
        let extra = dir.path().join("prod.env");
        std::fs::write(&extra, "ORG=prod\n").unwrap();

        let files = env_files(dir.path(), &[extra]);
        assert_eq!(files.len(), 2);
        let vars = read_all(&files).unwrap();
        assert_eq!(
            vars,
            vec![
                ("REGION".to_string(), "eu".to_string()),
                ("ORG".to_string(), "prod".to_string()),
            ]
        );
    }
}
