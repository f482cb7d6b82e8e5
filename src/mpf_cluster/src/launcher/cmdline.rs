//! Command path and argument vector construction

use eyre::{bail, WrapErr};
use itertools::Itertools;
use std::path::PathBuf;

/// Expand `${NAME}` and `$NAME` references through `lookup`.
///
/// Unknown variables are left as written.
pub fn substitute_variables<F>(text: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            let Some(end) = braced.find('}') else {
                // unterminated, keep the remainder verbatim
                result.push_str(&rest[pos..]);
                return result;
            };
            let name = &braced[..end];
            match lookup(name) {
                Some(value) => result.push_str(&value),
                None => {
                    result.push_str("${");
                    result.push_str(name);
                    result.push('}');
                }
            }
            rest = &braced[end + 1..];
            continue;
        }

        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len == 0 {
            result.push('$');
            rest = after;
            continue;
        }

        let name = &after[..len];
        match lookup(name) {
            Some(value) => result.push_str(&value),
            None => {
                result.push('$');
                result.push_str(name);
            }
        }
        rest = &after[len..];
    }

    result.push_str(rest);
    result
}

/// Split on whitespace, treating `\ ` as a literal space.
pub fn split_escaped(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(&next) if next.is_whitespace() => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push(c),
            }
        } else if c.is_whitespace() {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Substitute and split each configured argument. Empty entries vanish.
pub fn build_args<F>(args: &[String], lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    args.iter()
        .filter(|arg| !arg.trim().is_empty())
        .flat_map(|arg| split_escaped(&substitute_variables(arg, &lookup)))
        .collect_vec()
}

/// Resolve the command path to a canonical executable file.
pub fn resolve_command<F>(cmd: &str, lookup: F) -> eyre::Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let substituted = substitute_variables(cmd.trim(), lookup);
    if substituted.is_empty() {
        bail!("command path is empty");
    }

    let path = std::fs::canonicalize(&substituted)
        .wrap_err_with(|| format!("command '{}' does not exist", substituted))?;
    let metadata = std::fs::metadata(&path)
        .wrap_err_with(|| format!("unable to stat {}", path.display()))?;

    if !metadata.is_file() {
        bail!("{} is not a file", path.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            bail!("{} is not executable", path.display());
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("MPF_HOME".to_string(), "/opt/mpf".to_string()),
            ("N".to_string(), "3".to_string()),
        ])
    }

    fn lookup(name: &str) -> Option<String> {
        vars().get(name).cloned()
    }

    #[test]
    fn test_substitution_forms() {
        assert_eq!(
            substitute_variables("${MPF_HOME}/bin/run", lookup),
            "/opt/mpf/bin/run"
        );
        assert_eq!(substitute_variables("$MPF_HOME/bin", lookup), "/opt/mpf/bin");
        assert_eq!(substitute_variables("x$N-y", lookup), "x3-y");
        assert_eq!(substitute_variables("$MISSING/a", lookup), "$MISSING/a");
        assert_eq!(substitute_variables("${MISSING}", lookup), "${MISSING}");
        assert_eq!(substitute_variables("cost $ 5", lookup), "cost $ 5");
        assert_eq!(substitute_variables("${open", lookup), "${open");
    }

    #[test]
    fn test_escaped_space_is_literal() {
        assert_eq!(
            split_escaped(r"--name my\ service  -v"),
            vec!["--name", "my service", "-v"]
        );
        assert_eq!(split_escaped(r"C:\path"), vec![r"C:\path"]);
        assert!(split_escaped("   ").is_empty());
    }

    #[test]
    fn test_build_args_skips_empty_entries() {
        let args = vec![
            "".to_string(),
            "${MPF_HOME}/plugins".to_string(),
            "  ".to_string(),
            "-n $N".to_string(),
        ];
        assert_eq!(
            build_args(&args, lookup),
            vec!["/opt/mpf/plugins", "-n", "3"]
        );
    }

    #[test]
    fn test_resolve_command() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

        // not executable yet
        assert!(resolve_command(script.to_str().unwrap(), lookup).is_err());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let resolved = resolve_command(script.to_str().unwrap(), lookup).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&script).unwrap());

        assert!(resolve_command("/definitely/not/here", lookup).is_err());
        assert!(resolve_command("", lookup).is_err());
    }
}
