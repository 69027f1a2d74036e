//! Environment and SSM parameter substitution over raw DSF text
//!
//! Environment references take the forms `${VAR}` and `$VAR`; `$$` yields a
//! literal `$`. Every referenced variable must be set. SSM references take the
//! form `{{ssm: /path/to/param}}`, optionally suffixed with `~true`/`~false`
//! to toggle decryption (on by default).

use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::{CoreError, Result};

/// Nesting limit when variable values themselves reference variables
const MAX_EXPANSION_DEPTH: usize = 10;

static ENV_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid env reference regex")
});

static SSM_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*ssm:\s*([^\s}~]+)\s*(?:~\s*(true|false)\s*)?\}\}")
        .expect("valid ssm reference regex")
});

/// Source of SSM parameter values
pub trait ParameterStore: Send + Sync {
    fn get_parameter(&self, name: &str, decrypt: bool) -> std::result::Result<String, String>;
}

/// Substitute environment variables in `text`
///
/// `lookup` resolves a variable name; `path` is only used for error reporting.
pub fn expand_env<F>(text: &str, path: &Path, recursive: bool, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    expand(text, recursive, &lookup, 0).map_err(|variable| CoreError::UnsetVariable {
        path: path.to_path_buf(),
        variable,
    })
}

/// Substitute using the process environment
pub fn expand_process_env(text: &str, path: &Path, recursive: bool) -> Result<String> {
    expand_env(text, path, recursive, |name| std::env::var(name).ok())
}

fn var_name<'t>(caps: &Captures<'t>) -> Option<&'t str> {
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str())
}

/// Expand every reference; `Err` carries the first unset variable, at any depth
fn expand<F>(text: &str, recursive: bool, lookup: &F, depth: usize) -> std::result::Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in ENV_REF.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let replacement = match var_name(&caps) {
            None => "$".to_string(),
            Some(name) => match lookup(name) {
                Some(value) if recursive && depth < MAX_EXPANSION_DEPTH => {
                    expand(&value, recursive, lookup, depth + 1)?
                }
                Some(value) => value,
                None => return Err(name.to_string()),
            },
        };
        out.push_str(&text[last..whole.start()]);
        out.push_str(&replacement);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Replace `{{ssm: ...}}` tokens with values from the parameter store
pub fn expand_ssm(text: &str, path: &Path, store: &dyn ParameterStore) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in SSM_REF.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let name = &caps[1];
        let decrypt = caps.get(2).map(|m| m.as_str() == "true").unwrap_or(true);
        let value = store
            .get_parameter(name, decrypt)
            .map_err(|message| CoreError::Parameter {
                path: path.to_path_buf(),
                parameter: name.to_string(),
                message,
            })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_expand_both_forms() {
        let out = expand_env(
            "context: ${CTX}\nrepo: $REPO_URL/charts",
            Path::new("dsf.yaml"),
            true,
            env(&[("CTX", "prod"), ("REPO_URL", "https://charts.example.com")]),
        )
        .unwrap();
        assert_eq!(out, "context: prod\nrepo: https://charts.example.com/charts");
    }

    #[test]
    fn test_dollar_escape() {
        let out = expand_env("price: $$5 and $$HOME", Path::new("dsf.yaml"), true, env(&[])).unwrap();
        assert_eq!(out, "price: $5 and $HOME");
    }

    #[test]
    fn test_unset_variable_fails_with_path() {
        let err = expand_env("x: ${MISSING}", Path::new("prod.yaml"), true, env(&[])).unwrap_err();
        match err {
            CoreError::UnsetVariable { path, variable } => {
                assert_eq!(path, Path::new("prod.yaml"));
                assert_eq!(variable, "MISSING");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_recursive_expansion() {
        let lookup = env(&[("OUTER", "${INNER}-x"), ("INNER", "value")]);
        let recursive = expand_env("$OUTER", Path::new("f"), true, &lookup).unwrap();
        assert_eq!(recursive, "value-x");

        let flat = expand_env("$OUTER", Path::new("f"), false, &lookup).unwrap();
        assert_eq!(flat, "${INNER}-x");
    }

    #[test]
    fn test_nested_unset_variable_fails() {
        let lookup = env(&[("OUTER", "prefix-$MISSING")]);
        let err = expand_env("$OUTER", Path::new("dsf.yaml"), true, &lookup).unwrap_err();
        assert!(matches!(err, CoreError::UnsetVariable { ref variable, .. } if variable == "MISSING"));

        // Only checked when nested values are expanded at all
        let flat = expand_env("$OUTER", Path::new("dsf.yaml"), false, &lookup).unwrap();
        assert_eq!(flat, "prefix-$MISSING");
    }

    struct FakeStore;

    impl ParameterStore for FakeStore {
        fn get_parameter(&self, name: &str, decrypt: bool) -> std::result::Result<String, String> {
            match name {
                "/db/password" if decrypt => Ok("s3cret".to_string()),
                "/db/password" => Ok("ciphertext".to_string()),
                _ => Err("ParameterNotFound".to_string()),
            }
        }
    }

    #[test]
    fn test_expand_ssm() {
        let out = expand_ssm(
            "a: {{ssm: /db/password}}\nb: {{ ssm: /db/password~false }}",
            Path::new("f"),
            &FakeStore,
        )
        .unwrap();
        assert_eq!(out, "a: s3cret\nb: ciphertext");

        let err = expand_ssm("{{ssm: /nope}}", Path::new("f"), &FakeStore).unwrap_err();
        assert!(matches!(err, CoreError::Parameter { .. }));
    }
}
