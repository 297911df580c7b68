//! Section and SectionResult (spec §3).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A canonical zero-padded section number, parsed only from filenames
/// matching `^section-(\d+)\.md$`. Kept distinct from a bare `String` so
/// that the `^\d+$` invariant (spec §8) is enforced once, at
/// construction, rather than re-checked at every call site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionNumber(String);

impl SectionNumber {
    /// Parses `section-NN.md`, returning `None` for anything else
    /// (including `section-NN-foo.md` variants, which are excerpts and
    /// other derived artifacts, not section specs).
    pub fn parse_section_filename(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_prefix("section-")?.strip_suffix(".md")?;
        if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(stem.to_string()))
        } else {
            None
        }
    }

    /// Constructs from an already-canonical digit string, e.g. when
    /// reading a number back out of JSON produced by an LLM reply.
    /// Panics if `s` is not `^\d+$` — callers that need to tolerate
    /// non-canonical replies (impact analysis, coordination plans)
    /// normalize first via a section-number map, never by constructing
    /// this directly from untrusted input.
    pub fn from_canonical(s: impl Into<String>) -> Self {
        let s = s.into();
        assert!(
            !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
            "not a canonical section number: {s}"
        );
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_int(&self) -> u64 {
        self.0.parse().unwrap_or(0)
    }
}

impl fmt::Display for SectionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work identified by a zero-padded number and a spec file.
/// Loaded at startup by scanning `section-*.md` matching exactly
/// `^section-(\d+)\.md$`; mutated only by the section engine.
#[derive(Debug, Clone)]
pub struct Section {
    pub number: SectionNumber,
    pub spec_path: PathBuf,
    pub global_proposal_path: PathBuf,
    pub global_alignment_path: PathBuf,
    pub related_files: Vec<PathBuf>,
    pub attempt: u32,
}

impl Section {
    pub fn new(
        number: SectionNumber,
        spec_path: PathBuf,
        global_proposal_path: PathBuf,
        global_alignment_path: PathBuf,
    ) -> Self {
        Self {
            number,
            spec_path,
            global_proposal_path,
            global_alignment_path,
            related_files: Vec::new(),
            attempt: 0,
        }
    }

    /// Scans `sections_dir` for files matching `^section-(\d+)\.md$`,
    /// returning sections in ascending numeric order. Files that don't
    /// match the pattern exactly are ignored (not an error — a non-goal
    /// would be trying to coerce arbitrary filenames into sections).
    pub fn load_all(
        sections_dir: &Path,
        global_proposal_path: &Path,
        global_alignment_path: &Path,
    ) -> std::io::Result<Vec<Section>> {
        let mut sections = Vec::new();
        for entry in std::fs::read_dir(sections_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(number) = SectionNumber::parse_section_filename(name) else {
                continue;
            };
            sections.push(Section::new(
                number,
                entry.path(),
                global_proposal_path.to_path_buf(),
                global_alignment_path.to_path_buf(),
            ));
        }
        sections.sort_by(|a, b| a.number.as_int().cmp(&b.number.as_int()));
        Ok(sections)
    }

    pub fn enter(&mut self) {
        self.attempt += 1;
    }

    /// True on the first entry into this section's state machine (used by
    /// the recurrence signal, which only fires from the second entry on).
    pub fn is_recurring(&self) -> bool {
        self.attempt >= 2
    }
}

/// Outcome of running a section through the state machine to completion
/// (or to a pause). `aligned` and `problems` are mutually exclusive by
/// construction — `SectionResult::aligned` never sets `problems`, and
/// `SectionResult::misaligned` requires a non-empty explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionResult {
    pub section: String,
    pub aligned: bool,
    pub problems: Option<String>,
    pub modified_files: Vec<PathBuf>,
}

impl SectionResult {
    pub fn aligned(section: impl Into<String>, modified_files: Vec<PathBuf>) -> Self {
        Self {
            section: section.into(),
            aligned: true,
            problems: None,
            modified_files,
        }
    }

    pub fn misaligned(section: impl Into<String>, problems: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            aligned: false,
            problems: Some(problems.into()),
            modified_files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_section_filenames() {
        assert_eq!(SectionNumber::parse_section_filename("section-01.md").unwrap().as_str(), "01");
        assert_eq!(SectionNumber::parse_section_filename("section-123.md").unwrap().as_str(), "123");
    }

    #[test]
    fn rejects_non_section_and_derived_filenames() {
        assert!(SectionNumber::parse_section_filename("section-01-problem-frame.md").is_none());
        assert!(SectionNumber::parse_section_filename("section-01-alignment-excerpt.md").is_none());
        assert!(SectionNumber::parse_section_filename("sections.md").is_none());
        assert!(SectionNumber::parse_section_filename("section-.md").is_none());
        assert!(SectionNumber::parse_section_filename("section-0a.md").is_none());
    }

    #[test]
    fn aligned_result_has_no_problems() {
        let result = SectionResult::aligned("01", vec![PathBuf::from("core.go")]);
        assert!(result.aligned);
        assert!(result.problems.is_none());
    }
}
