use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceValidation {
    pub valid: bool,
    pub resolved_path: String,
    pub reason: String,
}

impl WorkspaceValidation {
    fn ok(resolved: &Path) -> Self {
        Self {
            valid: true,
            resolved_path: resolved.to_string_lossy().into_owned(),
            reason: String::new(),
        }
    }

    fn invalid(reason: String) -> Self {
        Self {
            valid: false,
            resolved_path: String::new(),
            reason,
        }
    }
}

fn expand_home(candidate: &str, home: Option<&Path>) -> PathBuf {
    let home = || home.map(Path::to_path_buf);
    if candidate == "~" {
        if let Some(home) = home() {
            return home;
        }
    }
    if let Some(rest) = candidate
        .strip_prefix("~/")
        .or_else(|| candidate.strip_prefix("~\\"))
    {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }
    PathBuf::from(candidate)
}

fn absolutize(path: PathBuf) -> PathBuf {
    let joined = if path.is_absolute() {
        path
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    };
    // lexical normalisation: drop `.` and fold `..`
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Check that `candidate` names an existing directory. `~` and `~/...` are
/// expanded against the user's home. With `allow_empty`, a blank candidate
/// is valid and resolves to "".
pub fn validate_workspace_root(candidate: &str, allow_empty: bool) -> WorkspaceValidation {
    validate_with_home(candidate, allow_empty, dirs::home_dir().as_deref())
}

fn validate_with_home(
    candidate: &str,
    allow_empty: bool,
    home: Option<&Path>,
) -> WorkspaceValidation {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return if allow_empty {
            WorkspaceValidation {
                valid: true,
                resolved_path: String::new(),
                reason: String::new(),
            }
        } else {
            WorkspaceValidation::invalid("Workspace root is required.".to_string())
        };
    }

    let resolved = absolutize(expand_home(trimmed, home));
    let shown = resolved.display();
    if !resolved.exists() {
        return WorkspaceValidation::invalid(format!("Workspace root does not exist: {}", shown));
    }
    match std::fs::metadata(&resolved) {
        Ok(meta) if meta.is_dir() => WorkspaceValidation::ok(&resolved),
        Ok(_) => {
            WorkspaceValidation::invalid(format!("Workspace root is not a directory: {}", shown))
        }
        Err(e) => WorkspaceValidation::invalid(format!(
            "Unable to access workspace root: {} ({})",
            shown, e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_candidate_depends_on_allow_empty() {
        let allowed = validate_workspace_root("   ", true);
        assert!(allowed.valid);
        assert_eq!(allowed.resolved_path, "");

        let required = validate_workspace_root("", false);
        assert!(!required.valid);
        assert_eq!(required.reason, "Workspace root is required.");
    }

    #[test]
    fn existing_directory_is_valid_and_absolute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("project");
        std::fs::create_dir(&nested).expect("mkdir");
        let candidate = format!("  {}/./project/../project  ", dir.path().display());

        let result = validate_workspace_root(&candidate, false);
        assert!(result.valid, "{:?}", result);
        assert_eq!(PathBuf::from(&result.resolved_path), nested);
    }

    #[test]
    fn missing_path_and_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let result = validate_workspace_root(&missing.to_string_lossy(), false);
        assert!(!result.valid);
        assert!(result.reason.starts_with("Workspace root does not exist: "));

        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "x").expect("write");
        let result = validate_workspace_root(&file.to_string_lossy(), false);
        assert!(!result.valid);
        assert!(result.reason.starts_with("Workspace root is not a directory: "));
        assert_eq!(result.resolved_path, "");
    }

    #[test]
    fn tilde_expands_against_home() {
        let home = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(home.path().join("code")).expect("mkdir");

        let root = validate_with_home("~", false, Some(home.path()));
        assert!(root.valid);
        assert_eq!(PathBuf::from(root.resolved_path), home.path());

        let nested = validate_with_home("~/code", false, Some(home.path()));
        assert!(nested.valid);
        assert_eq!(PathBuf::from(nested.resolved_path), home.path().join("code"));
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(WorkspaceValidation::invalid("x".into())).expect("json");
        assert_eq!(value["resolvedPath"], "");
        assert_eq!(value["valid"], false);
    }
}
