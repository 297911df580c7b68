//! Consequence note (spec §3, §4.6): the durable cross-section artifact
//! at `artifacts/notes/from-SRC-to-DST.md`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A consequence note written by a section's post-completion step for
/// every `MATERIAL` impact its change has on another section. The note
/// id is a stable 12-hex hash of the filename and content so repeated
/// reads of the same file always agree, and so an acknowledgment can
/// reference it unambiguously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsequenceNote {
    pub source: String,
    pub target: String,
    pub note_id: String,
    pub contract_delta: String,
    pub what_target_must_accommodate: String,
    pub acknowledgment_instructions: String,
}

impl ConsequenceNote {
    pub fn new(source: impl Into<String>, target: impl Into<String>, contract_delta: impl Into<String>, what_target_must_accommodate: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        let contract_delta = contract_delta.into();
        let what_target_must_accommodate = what_target_must_accommodate.into();
        let acknowledgment_instructions = format!(
            "Acknowledge this note by writing artifacts/signals/note-ack-{target}.json with \
             {{\"acknowledged\": [{{\"note_id\": \"<fill in>\", \"action\": \"accepted|rejected|deferred\", \"reason\": \"...\"}}]}}."
        );
        let filename = format!("from-{source}-to-{target}.md");
        let note_id = compute_note_id(&filename, &contract_delta, &what_target_must_accommodate);
        Self {
            source,
            target,
            note_id,
            contract_delta,
            what_target_must_accommodate,
            acknowledgment_instructions,
        }
    }

    pub fn filename(&self) -> String {
        format!("from-{}-to-{}.md", self.source, self.target)
    }

    pub fn render_markdown(&self) -> String {
        format!(
            "# Consequence note: section {} -> section {}\n\n\
             Note ID: {}\n\n\
             ## Contract delta\n\n{}\n\n\
             ## What section {} must accommodate\n\n{}\n\n\
             ## Acknowledgment\n\n{}\n",
            self.source, self.target, self.note_id, self.contract_delta, self.target,
            self.what_target_must_accommodate, self.acknowledgment_instructions
        )
    }

    /// Parses the note id back out of a previously written note file, for
    /// the incoming-note reader. Returns `None` if the file doesn't carry
    /// the `Note ID: ...` line this crate always writes.
    pub fn parse_note_id(markdown: &str) -> Option<String> {
        markdown
            .lines()
            .find_map(|line| line.strip_prefix("Note ID: "))
            .map(|id| id.trim().to_string())
    }
}

fn compute_note_id(filename: &str, contract_delta: &str, accommodate: &str) -> String {
    let content_hash = Sha256::digest(format!("{contract_delta}\n{accommodate}").as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(filename.as_bytes());
    hasher.update(content_hash);
    let digest = hasher.finalize();
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_id_is_twelve_hex_chars() {
        let note = ConsequenceNote::new("01", "02", "changed event model", "consumer must handle new event shape");
        assert_eq!(note.note_id.len(), 12);
        assert!(note.note_id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn note_id_is_stable_across_reconstruction() {
        let a = ConsequenceNote::new("01", "02", "delta", "accommodate");
        let b = ConsequenceNote::new("01", "02", "delta", "accommodate");
        assert_eq!(a.note_id, b.note_id);
    }

    #[test]
    fn round_trips_note_id_through_rendered_markdown() {
        let note = ConsequenceNote::new("01", "02", "delta", "accommodate");
        let rendered = note.render_markdown();
        assert_eq!(ConsequenceNote::parse_note_id(&rendered).as_deref(), Some(note.note_id.as_str()));
    }

    proptest::proptest! {
        /// Every note, for any source/target/delta/accommodate text, gets
        /// a 12-hex-char id and round-trips it through its own markdown.
        #[test]
        fn note_id_is_always_twelve_hex_and_round_trips(
            source in "[a-zA-Z0-9]{1,4}",
            target in "[a-zA-Z0-9]{1,4}",
            delta in ".{0,40}",
            accommodate in ".{0,40}",
        ) {
            let note = ConsequenceNote::new(source, target, delta, accommodate);
            proptest::prop_assert_eq!(note.note_id.len(), 12);
            proptest::prop_assert!(note.note_id.bytes().all(|b| b.is_ascii_hexdigit()));
            let rendered = note.render_markdown();
            proptest::prop_assert_eq!(ConsequenceNote::parse_note_id(&rendered), Some(note.note_id.clone()));
        }

        /// Two notes built from identical inputs always agree on id.
        #[test]
        fn note_id_is_deterministic(
            source in "[a-zA-Z0-9]{1,4}",
            target in "[a-zA-Z0-9]{1,4}",
            delta in ".{0,40}",
            accommodate in ".{0,40}",
        ) {
            let a = ConsequenceNote::new(source.clone(), target.clone(), delta.clone(), accommodate.clone());
            let b = ConsequenceNote::new(source, target, delta, accommodate);
            proptest::prop_assert_eq!(a.note_id, b.note_id);
        }
    }
}
