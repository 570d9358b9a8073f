//! Context briefing assembly.
//!
//! Before the execute phase, the worker gets a compact briefing: the
//! files the task is predicted to touch, signature-level excerpts of
//! those files, and the boundaries of sibling subtasks it must not cross.
//! The briefing is size-budgeted per model tier; this is the only
//! pre-agent work allowed to burn noticeable CPU.

use std::path::Path;

use undercity_state::models::ModelTier;

/// How much briefing a tier gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BriefingDepth {
    /// Target file list only.
    Minimal,
    /// Target files plus truncated stubs.
    #[default]
    Compact,
    /// Full stub excerpts.
    Full,
}

impl BriefingDepth {
    /// Larger models can use more context productively.
    pub fn for_tier(tier: ModelTier) -> Self {
        match tier {
            ModelTier::Haiku => Self::Minimal,
            ModelTier::Sonnet => Self::Compact,
            ModelTier::Opus => Self::Full,
        }
    }

    fn stub_budget_bytes(self) -> usize {
        match self {
            Self::Minimal => 0,
            Self::Compact => 8 * 1024,
            Self::Full => 24 * 1024,
        }
    }
}

/// Another subtask's declared territory.
#[derive(Debug, Clone, Default)]
pub struct SiblingBoundary {
    pub objective: String,
    pub files: Vec<String>,
}

/// The assembled briefing handed to prompt builders.
#[derive(Debug, Clone, Default)]
pub struct Briefing {
    pub target_files: Vec<String>,
    /// (path, signature excerpt) pairs, budget permitting.
    pub stubs: Vec<(String, String)>,
    pub siblings: Vec<SiblingBoundary>,
    pub depth: BriefingDepth,
}

impl Briefing {
    /// Build a briefing for a task rooted at `root` (its worktree).
    ///
    /// `target_files` come from the conflict predictor or the task's own
    /// `estimated_files`; files that do not exist yet are still listed
    /// (the task may be creating them) but produce no stub.
    pub fn build(
        root: &Path,
        target_files: &[String],
        siblings: Vec<SiblingBoundary>,
        depth: BriefingDepth,
    ) -> Self {
        let mut stubs = Vec::new();
        let mut remaining = depth.stub_budget_bytes();

        for file in target_files {
            if remaining == 0 {
                break;
            }
            let path = root.join(file);
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            let excerpt = stub_excerpt(&content, remaining.min(4 * 1024));
            if excerpt.is_empty() {
                continue;
            }
            remaining = remaining.saturating_sub(excerpt.len());
            stubs.push((file.clone(), excerpt));
        }

        Self {
            target_files: target_files.to_vec(),
            stubs,
            siblings,
            depth,
        }
    }

    /// Render as a prompt block. Empty briefings render to nothing.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.target_files.is_empty() {
            out.push_str("\n## Files likely involved\n");
            for file in &self.target_files {
                out.push_str(&format!("- {file}\n"));
            }
        }

        for (path, excerpt) in &self.stubs {
            out.push_str(&format!("\n## Signatures in {path}\n{excerpt}\n"));
        }

        if !self.siblings.is_empty() {
            out.push_str(
                "\n## Sibling tasks own these files -- do NOT touch them\n",
            );
            for sibling in &self.siblings {
                out.push_str(&format!("- {}: ", sibling.objective));
                out.push_str(&sibling.files.join(", "));
                out.push('\n');
            }
        }

        out
    }

    /// Every file some sibling has claimed.
    pub fn sibling_files(&self) -> Vec<&str> {
        self.siblings
            .iter()
            .flat_map(|s| s.files.iter().map(String::as_str))
            .collect()
    }
}

/// Keep declaration-shaped lines (types, signatures, exports) up to
/// `max_bytes`. Language-agnostic by prefix matching; good enough for a
/// briefing, not a parser.
fn stub_excerpt(content: &str, max_bytes: usize) -> String {
    const PREFIXES: &[&str] = &[
        "pub ", "fn ", "struct ", "enum ", "trait ", "impl ", "type ", "const ", "mod ",
        "class ", "def ", "export ", "function ", "interface ", "func ",
    ];
    let mut out = String::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
            if out.len() + trimmed.len() + 1 > max_bytes {
                break;
            }
            out.push_str(trimmed.trim_end_matches('{').trim_end());
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_tier() {
        assert_eq!(BriefingDepth::for_tier(ModelTier::Haiku), BriefingDepth::Minimal);
        assert_eq!(BriefingDepth::for_tier(ModelTier::Sonnet), BriefingDepth::Compact);
        assert_eq!(BriefingDepth::for_tier(ModelTier::Opus), BriefingDepth::Full);
    }

    #[test]
    fn minimal_depth_lists_files_without_stubs() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "pub fn exists() {}\n").unwrap();

        let briefing = Briefing::build(
            dir.path(),
            &["a.rs".into()],
            vec![],
            BriefingDepth::Minimal,
        );
        assert_eq!(briefing.target_files, vec!["a.rs"]);
        assert!(briefing.stubs.is_empty());

        let rendered = briefing.render();
        assert!(rendered.contains("a.rs"));
        assert!(!rendered.contains("Signatures"));
    }

    #[test]
    fn stubs_extract_signatures() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "use std::fmt;\n\npub struct Widget {\n    size: u32,\n}\n\npub fn resize(w: &mut Widget) {\n    w.size += 1;\n}\n",
        )
        .unwrap();

        let briefing = Briefing::build(
            dir.path(),
            &["lib.rs".into()],
            vec![],
            BriefingDepth::Compact,
        );
        assert_eq!(briefing.stubs.len(), 1);
        let excerpt = &briefing.stubs[0].1;
        assert!(excerpt.contains("pub struct Widget"));
        assert!(excerpt.contains("pub fn resize"));
        assert!(!excerpt.contains("w.size += 1"));
    }

    #[test]
    fn missing_files_are_listed_but_unstubbed() {
        let dir = tempfile::TempDir::new().unwrap();
        let briefing = Briefing::build(
            dir.path(),
            &["does/not/exist.rs".into()],
            vec![],
            BriefingDepth::Full,
        );
        assert_eq!(briefing.target_files.len(), 1);
        assert!(briefing.stubs.is_empty());
    }

    #[test]
    fn sibling_boundaries_render_as_do_not_touch() {
        let briefing = Briefing {
            siblings: vec![SiblingBoundary {
                objective: "build the parser".into(),
                files: vec!["src/parser.rs".into(), "src/ast.rs".into()],
            }],
            ..Default::default()
        };
        let rendered = briefing.render();
        assert!(rendered.contains("do NOT touch"));
        assert!(rendered.contains("src/parser.rs"));
        assert_eq!(briefing.sibling_files(), vec!["src/parser.rs", "src/ast.rs"]);
    }
}
