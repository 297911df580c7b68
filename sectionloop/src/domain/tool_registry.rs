//! Tool-registry entries (spec §3, §9): tools implementation agents
//! register as they build them, surfaced to downstream sections and
//! periodically revalidated by a tool-registrar dispatch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolScope {
    SectionLocal,
    CrossSection,
    TestOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Experimental,
    Stable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRegistryEntry {
    pub id: String,
    pub path: String,
    pub created_by: String,
    pub scope: ToolScope,
    pub status: ToolStatus,
    pub description: String,
    pub registered_at: String,
}

impl ToolRegistryEntry {
    /// True if this entry should be surfaced to a section other than its
    /// creator: cross-section tools always are; section-local tools only
    /// to the creating section.
    pub fn visible_to(&self, section: &str) -> bool {
        match self.scope {
            ToolScope::CrossSection => true,
            ToolScope::SectionLocal | ToolScope::TestOnly => self.created_by == section,
        }
    }
}

/// The registry's on-disk open question (spec §9): accept either a bare
/// JSON array or `{"tools": [...]}` on read; always write the array
/// form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryShape {
    Array(Vec<ToolRegistryEntry>),
    Wrapped { tools: Vec<ToolRegistryEntry> },
}

pub fn parse_registry(raw: &str) -> Result<Vec<ToolRegistryEntry>, serde_json::Error> {
    let shape: RegistryShape = serde_json::from_str(raw)?;
    Ok(match shape {
        RegistryShape::Array(entries) => entries,
        RegistryShape::Wrapped { tools } => tools,
    })
}

pub fn render_registry(entries: &[ToolRegistryEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(scope: ToolScope, created_by: &str) -> ToolRegistryEntry {
        ToolRegistryEntry {
            id: "t1".into(),
            path: "tools/t1.sh".into(),
            created_by: created_by.into(),
            scope,
            status: ToolStatus::Experimental,
            description: "example".into(),
            registered_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn cross_section_tool_visible_everywhere() {
        let e = entry(ToolScope::CrossSection, "01");
        assert!(e.visible_to("01"));
        assert!(e.visible_to("02"));
    }

    #[test]
    fn section_local_tool_only_visible_to_creator() {
        let e = entry(ToolScope::SectionLocal, "01");
        assert!(e.visible_to("01"));
        assert!(!e.visible_to("02"));
    }

    #[test]
    fn parses_both_array_and_wrapped_shapes() {
        let array = r#"[{"id":"t1","path":"tools/t1.sh","created_by":"01","scope":"cross-section","status":"stable","description":"d","registered_at":"t"}]"#;
        let wrapped = r#"{"tools":[{"id":"t1","path":"tools/t1.sh","created_by":"01","scope":"cross-section","status":"stable","description":"d","registered_at":"t"}]}"#;
        assert_eq!(parse_registry(array).unwrap().len(), 1);
        assert_eq!(parse_registry(wrapped).unwrap().len(), 1);
    }

    #[test]
    fn renders_array_form() {
        let rendered = render_registry(&[entry(ToolScope::CrossSection, "01")]).unwrap();
        assert!(rendered.trim_start().starts_with('['));
    }
}
