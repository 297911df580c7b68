//! Core data model (spec §3): the entities the scheduler, section
//! engine, cross-section engine, and coordinator all share.

mod coordination;
mod note;
mod section;
mod tool_registry;

pub use coordination::{batch_groups, one_problem_per_group, validate_partition, CoordinationGroup, CoordinationProblem, ProblemKind, Strategy};
pub use note::ConsequenceNote;
pub use section::{Section, SectionResult};
pub use tool_registry::{ToolRegistryEntry, ToolScope, ToolStatus};
