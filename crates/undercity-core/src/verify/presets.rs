//! Verification preset library and project detection.
//!
//! Ships a built-in library of verification commands for common project
//! types (Rust, Node, Python, Go), defined in `verifiers.toml` and
//! embedded in the binary at compile time. No runtime code loading: the
//! registry is typed records parsed at startup.

use std::path::Path;

use serde::Deserialize;

use undercity_state::models::VerifyKind;

/// A single verification command from the embedded library.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyCommand {
    /// Project type this command belongs to (e.g. `rust`, `node`).
    pub project_type: String,
    /// Category of check.
    pub kind: VerifyKind,
    /// Program to execute.
    pub command: String,
    /// Arguments to pass.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PresetLibrary {
    verifiers: Vec<VerifyCommand>,
}

static VERIFIERS_TOML: &str = include_str!("verifiers.toml");

/// Load all verification presets from the embedded library.
///
/// # Panics
///
/// Panics if the embedded TOML is malformed. This is a compile-time
/// invariant -- if the binary was built, the TOML is valid.
pub fn load_presets() -> Vec<VerifyCommand> {
    let lib: PresetLibrary =
        toml::from_str(VERIFIERS_TOML).expect("embedded verifiers.toml is invalid");
    lib.verifiers
}

/// Return the commands for a given project type, in library order
/// (typecheck before test before lint before build).
pub fn commands_for_project_type(project_type: &str) -> Vec<VerifyCommand> {
    load_presets()
        .into_iter()
        .filter(|p| p.project_type == project_type)
        .collect()
}

/// Detect the project type by looking for marker files in `dir`.
pub fn detect_project_type(dir: &Path) -> Option<String> {
    if dir.join("Cargo.toml").exists() {
        Some("rust".to_string())
    } else if dir.join("package.json").exists() {
        Some("node".to_string())
    } else if dir.join("pyproject.toml").exists() || dir.join("setup.py").exists() {
        Some("python".to_string())
    } else if dir.join("go.mod").exists() {
        Some("go".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_library_parses() {
        let presets = load_presets();
        assert!(!presets.is_empty());
    }

    #[test]
    fn rust_presets_cover_all_kinds() {
        let rust = commands_for_project_type("rust");
        for kind in [
            VerifyKind::Typecheck,
            VerifyKind::Test,
            VerifyKind::Lint,
            VerifyKind::Build,
        ] {
            assert!(
                rust.iter().any(|c| c.kind == kind),
                "missing rust {kind} preset"
            );
        }
    }

    #[test]
    fn detect_by_marker_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(detect_project_type(dir.path()), None);

        std::fs::write(dir.path().join("go.mod"), "module x\n").unwrap();
        assert_eq!(detect_project_type(dir.path()).as_deref(), Some("go"));

        // Cargo.toml wins over go.mod.
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_project_type(dir.path()).as_deref(), Some("rust"));
    }
}
