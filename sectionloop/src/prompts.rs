//! Prompt rendering (ground truth: `taskdaemon`'s `prompts/loader.rs`):
//! loads a `.pmt` handlebars template, preferring a planspace override
//! (`<planspace>/prompts/<name>.pmt`) over the embedded default shipped
//! in this crate, and renders it against a serializable context.

use std::path::Path;

use eyre::{Context, Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;

macro_rules! embedded_prompts {
    ($($name:literal => $file:literal),* $(,)?) => {
        fn embedded(name: &str) -> Option<&'static str> {
            match name {
                $($name => Some(include_str!($file)),)*
                _ => None,
            }
        }
    };
}

embedded_prompts! {
    "setup" => "../prompts/setup.pmt",
    "proposal" => "../prompts/proposal.pmt",
    "proposal-align" => "../prompts/proposal-align.pmt",
    "microstrategy" => "../prompts/microstrategy.pmt",
    "impl" => "../prompts/impl.pmt",
    "impl-align" => "../prompts/impl-align.pmt",
    "reexplore" => "../prompts/reexplore.pmt",
    "impact" => "../prompts/impact.pmt",
    "monitor" => "../prompts/monitor.pmt",
}

pub struct PromptRenderer {
    hbs: Handlebars<'static>,
    override_dir: Option<std::path::PathBuf>,
}

impl PromptRenderer {
    /// `planspace/prompts/<name>.pmt` overrides the embedded default
    /// when present, mirroring the teacher's user-override-then-repo-
    /// default-then-embedded chain, minus the repo-default tier (this
    /// crate has no separate "repo" checkout to look in).
    pub fn new(planspace: &Path) -> Self {
        let mut hbs = Handlebars::new();
        hbs.set_strict_mode(false);
        let override_dir = planspace.join("prompts");
        Self {
            hbs,
            override_dir: override_dir.is_dir().then_some(override_dir),
        }
    }

    fn load(&self, name: &str) -> Result<String> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(format!("{name}.pmt"));
            if path.exists() {
                return std::fs::read_to_string(&path).with_context(|| format!("reading prompt override {}", path.display()));
            }
        }
        embedded(name).map(str::to_string).ok_or_else(|| eyre!("no prompt template named {name}"))
    }

    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        let template = self.load(name)?;
        self.hbs
            .render_template(&template, context)
            .with_context(|| format!("rendering prompt template {name}"))
    }

    pub fn render_to_file<T: Serialize>(&self, name: &str, context: &T, out: &Path) -> Result<()> {
        let rendered = self.render(name, context)?;
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(out, rendered).with_context(|| format!("writing rendered prompt to {}", out.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn renders_embedded_setup_template() {
        let dir = tempdir().unwrap();
        let renderer = PromptRenderer::new(dir.path());
        let rendered = renderer
            .render(
                "setup",
                &json!({"section": "01", "section_title": "Widgets", "global_proposal": "p.md", "global_alignment": "a.md"}),
            )
            .unwrap();
        assert!(rendered.contains("Section 01"));
        assert!(rendered.contains("Widgets"));
    }

    #[test]
    fn planspace_override_wins_over_embedded() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/setup.pmt"), "custom {{section}}").unwrap();
        let renderer = PromptRenderer::new(dir.path());
        let rendered = renderer.render("setup", &json!({"section": "01"})).unwrap();
        assert_eq!(rendered, "custom 01");
    }

    #[test]
    fn unknown_template_errors() {
        let dir = tempdir().unwrap();
        let renderer = PromptRenderer::new(dir.path());
        assert!(renderer.render("nonexistent", &json!({})).is_err());
    }
}
